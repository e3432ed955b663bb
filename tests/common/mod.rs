//! Shared fakes for the integration tests

#![allow(dead_code)]

use async_trait::async_trait;
use connector_pool::{
    BaseConnectionManager, ConnectionEventListener, ConnectionHandle, ConnectionListener,
    ConnectionListenerFactory, ConnectionRequestInfo, FactoryIdentity, InternalManagedConnectionPool,
    ManagedConnection, ManagedConnectionFactory, ManagedConnectionPool, ManagerConfig, PoolConfig,
    PoolId, PoolRef, PoolStatistics, ResourceError, Result, Subject, TransactionKey,
};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::Notify;

/// Counters and failure switches shared by a factory and its connections
#[derive(Default)]
pub struct MockState {
    pub created: AtomicUsize,
    pub destroyed: AtomicUsize,
    pub fail_next_creates: AtomicU32,
    pub fail_handles: AtomicBool,
    pub fail_cleanup: AtomicBool,
    pub fail_rollback: AtomicBool,
    pub invalid: AtomicBool,
    pub fail_commit: AtomicBool,
    pub begun: AtomicUsize,
    pub committed: AtomicUsize,
    pub rolled_back: AtomicUsize,
    pub last_subject: Mutex<Option<String>>,
}

impl MockState {
    /// Local transactions begun but neither committed nor rolled back
    pub fn open_local_transactions(&self) -> usize {
        let ended = self.committed.load(Ordering::SeqCst) + self.rolled_back.load(Ordering::SeqCst);
        self.begun.load(Ordering::SeqCst) - ended
    }
}

pub struct MockConnectionInner {
    pub id: usize,
    state: Arc<MockState>,
    events: Mutex<Option<Weak<dyn ConnectionEventListener>>>,
}

impl MockConnectionInner {
    fn events(&self) -> Option<Arc<dyn ConnectionEventListener>> {
        self.events.lock().as_ref().and_then(Weak::upgrade)
    }
}

/// Value behind every handle a mock connection hands out
pub struct MockHandle {
    conn: Mutex<Arc<MockConnectionInner>>,
}

impl MockHandle {
    /// Id of the mock connection the handle currently points at
    pub fn connection_id(&self) -> usize {
        self.conn.lock().id
    }

    /// Simulate the application closing `handle`
    pub fn close(&self, handle: &ConnectionHandle) {
        let events = self.conn.lock().events();
        if let Some(events) = events {
            events.connection_closed(handle);
        }
    }

    /// Simulate the physical connection failing
    pub fn fail(&self) {
        let events = self.conn.lock().events();
        if let Some(events) = events {
            events.connection_error_occurred(ResourceError::connection_error(
                "socket reset".to_string(),
                None,
                true,
            ));
        }
    }
}

pub fn mock_handle(handle: &ConnectionHandle) -> &MockHandle {
    handle.downcast_ref::<MockHandle>().expect("handle from a mock connection")
}

pub struct MockConnection {
    inner: Arc<MockConnectionInner>,
}

#[async_trait]
impl ManagedConnection for MockConnection {
    fn get_connection(
        &self,
        _subject: Option<&Subject>,
        _criteria: Option<&ConnectionRequestInfo>,
    ) -> Result<ConnectionHandle> {
        if self.inner.state.fail_handles.load(Ordering::SeqCst) {
            return Err(ResourceError::connection_error(
                "handle refused".to_string(),
                None,
                false,
            ));
        }
        Ok(ConnectionHandle::new(MockHandle {
            conn: Mutex::new(self.inner.clone()),
        }))
    }

    fn associate_connection(&self, handle: &ConnectionHandle) -> Result<()> {
        let mock = handle.downcast_ref::<MockHandle>().ok_or_else(|| {
            ResourceError::validation_error("foreign handle".to_string(), None)
        })?;
        *mock.conn.lock() = self.inner.clone();
        Ok(())
    }

    fn cleanup(&self) -> Result<()> {
        if self.inner.state.fail_cleanup.load(Ordering::SeqCst) {
            return Err(ResourceError::connection_error("cleanup failed".to_string(), None, false));
        }
        Ok(())
    }

    fn destroy(&self) -> Result<()> {
        self.inner.state.destroyed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn is_valid(&self) -> bool {
        !self.inner.state.invalid.load(Ordering::SeqCst)
    }

    fn add_connection_event_listener(&self, listener: Weak<dyn ConnectionEventListener>) {
        *self.inner.events.lock() = Some(listener);
    }

    fn begin_local_transaction(&self) -> Result<()> {
        self.inner.state.begun.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn commit_local_transaction(&self) -> Result<()> {
        if self.inner.state.fail_commit.load(Ordering::SeqCst) {
            return Err(ResourceError::connection_error("commit failed".to_string(), None, false));
        }
        self.inner.state.committed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn rollback_local_transaction(&self) -> Result<()> {
        if self.inner.state.fail_rollback.load(Ordering::SeqCst) {
            return Err(ResourceError::connection_error("rollback failed".to_string(), None, false));
        }
        self.inner.state.rolled_back.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// In-memory managed connection factory with failure injection
pub struct MockFactory {
    pub name: String,
    pub state: Arc<MockState>,
}

impl MockFactory {
    pub fn new(name: &str) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            state: Arc::new(MockState::default()),
        })
    }

    /// A connection built outside any pool
    pub fn connection(&self) -> Box<dyn ManagedConnection> {
        let id = self.state.created.fetch_add(1, Ordering::SeqCst) + 1;
        Box::new(MockConnection {
            inner: Arc::new(MockConnectionInner {
                id,
                state: self.state.clone(),
                events: Mutex::new(None),
            }),
        })
    }
}

#[async_trait]
impl ManagedConnectionFactory for MockFactory {
    fn identity(&self) -> FactoryIdentity {
        FactoryIdentity::new(self.name.clone()).with_property("url", "mem:test")
    }

    async fn create_managed_connection(
        &self,
        subject: Option<&Subject>,
        _criteria: Option<&ConnectionRequestInfo>,
    ) -> Result<Box<dyn ManagedConnection>> {
        *self.state.last_subject.lock() = subject.map(|s| s.principal.clone());
        let remaining = self.state.fail_next_creates.load(Ordering::SeqCst);
        if remaining > 0 {
            self.state.fail_next_creates.store(remaining - 1, Ordering::SeqCst);
            return Err(ResourceError::connection_error("connect refused".to_string(), None, true));
        }
        Ok(self.connection())
    }
}

/// Pool that fails its first `fail_first` requests, then serves from a real pool
pub struct ScriptedPool {
    pub inner: Arc<InternalManagedConnectionPool>,
    pub fail_first: u32,
    pub attempts: AtomicU32,
    on_attempt: Mutex<Option<Box<dyn Fn(u32) + Send + Sync>>>,
}

impl ScriptedPool {
    pub fn new(factory: Arc<MockFactory>, fail_first: u32) -> Arc<Self> {
        Arc::new(Self {
            inner: InternalManagedConnectionPool::new(factory, PoolConfig::default(), None),
            fail_first,
            attempts: AtomicU32::new(0),
            on_attempt: Mutex::new(None),
        })
    }

    /// Run `hook` with the attempt number at the start of every request
    pub fn on_attempt(&self, hook: impl Fn(u32) + Send + Sync + 'static) {
        *self.on_attempt.lock() = Some(Box::new(hook));
    }

    pub fn attempts(&self) -> u32 {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ManagedConnectionPool for ScriptedPool {
    fn pool_id(&self) -> PoolId {
        self.inner.pool_id()
    }

    async fn get_connection(
        &self,
        transaction: Option<TransactionKey>,
        subject: Option<&Subject>,
        criteria: Option<&ConnectionRequestInfo>,
    ) -> Result<Arc<ConnectionListener>> {
        let attempt = self.attempts.fetch_add(1, Ordering::SeqCst) + 1;
        if let Some(hook) = self.on_attempt.lock().as_ref() {
            hook(attempt);
        }
        if attempt <= self.fail_first {
            return Err(ResourceError::connection_error(
                format!("attempt {} failed", attempt),
                None,
                true,
            ));
        }
        self.inner.get_connection(transaction, subject, criteria).await
    }

    fn return_connection(&self, listener: &Arc<ConnectionListener>, kill: bool) -> Result<()> {
        self.inner.return_connection(listener, kill)
    }

    fn connection_count(&self) -> usize {
        self.inner.connection_count()
    }

    fn set_connection_listener_factory(&self, factory: Weak<dyn ConnectionListenerFactory>) {
        self.inner.set_connection_listener_factory(factory);
    }

    fn managed_connection_factory(&self) -> Arc<dyn ManagedConnectionFactory> {
        self.inner.managed_connection_factory()
    }

    async fn validate_connections(&self) -> Result<()> {
        self.inner.validate_connections().await
    }

    async fn remove_idle_connections(&self) -> Result<()> {
        self.inner.remove_idle_connections().await
    }

    fn flush(&self) {
        self.inner.flush();
    }

    async fn shutdown(&self) {
        self.inner.shutdown().await;
    }

    fn statistics(&self) -> PoolStatistics {
        self.inner.statistics()
    }
}

/// How a recording pool behaves when swept
#[derive(Clone, Copy, PartialEq, Eq)]
pub enum SweepOutcome {
    Succeed,
    Fail,
    Panic,
}

/// Pool that only records daemon sweeps
pub struct RecordingPool {
    id: PoolId,
    pub name: &'static str,
    outcome: SweepOutcome,
    log: Arc<Mutex<Vec<&'static str>>>,
    pub idle_sweeps: AtomicUsize,
    pub validations: AtomicUsize,
    gate: Mutex<Option<Arc<Notify>>>,
    factory: Arc<MockFactory>,
}

impl RecordingPool {
    pub fn new(name: &'static str, outcome: SweepOutcome, log: Arc<Mutex<Vec<&'static str>>>) -> Arc<Self> {
        Arc::new(Self {
            id: PoolId::next(),
            name,
            outcome,
            log,
            idle_sweeps: AtomicUsize::new(0),
            validations: AtomicUsize::new(0),
            gate: Mutex::new(None),
            factory: MockFactory::new(name),
        })
    }

    /// Make every idle sweep wait for a notification on `gate`
    pub fn hold_sweeps_on(&self, gate: Arc<Notify>) {
        *self.gate.lock() = Some(gate);
    }

    fn swept(&self) -> Result<()> {
        self.log.lock().push(self.name);
        match self.outcome {
            SweepOutcome::Succeed => Ok(()),
            SweepOutcome::Fail => Err(ResourceError::internal_error(
                format!("{} sweep failed", self.name),
                None,
            )),
            SweepOutcome::Panic => panic!("{} sweep panicked", self.name),
        }
    }
}

#[async_trait]
impl ManagedConnectionPool for RecordingPool {
    fn pool_id(&self) -> PoolId {
        self.id
    }

    async fn get_connection(
        &self,
        _transaction: Option<TransactionKey>,
        _subject: Option<&Subject>,
        _criteria: Option<&ConnectionRequestInfo>,
    ) -> Result<Arc<ConnectionListener>> {
        Err(ResourceError::pool_closed(self.name))
    }

    fn return_connection(&self, _listener: &Arc<ConnectionListener>, _kill: bool) -> Result<()> {
        Ok(())
    }

    fn connection_count(&self) -> usize {
        0
    }

    fn set_connection_listener_factory(&self, _factory: Weak<dyn ConnectionListenerFactory>) {}

    fn managed_connection_factory(&self) -> Arc<dyn ManagedConnectionFactory> {
        self.factory.clone()
    }

    async fn validate_connections(&self) -> Result<()> {
        self.validations.fetch_add(1, Ordering::SeqCst);
        self.swept()
    }

    async fn remove_idle_connections(&self) -> Result<()> {
        self.idle_sweeps.fetch_add(1, Ordering::SeqCst);
        let gate = self.gate.lock().clone();
        if let Some(gate) = gate {
            gate.notified().await;
        }
        self.swept()
    }

    fn flush(&self) {}

    async fn shutdown(&self) {}

    fn statistics(&self) -> PoolStatistics {
        PoolStatistics::aggregate(self.id, 0, std::iter::empty())
    }
}

pub fn manager_config(retry: u32, wait_millis: u64) -> ManagerConfig {
    ManagerConfig {
        allocation_retry: retry,
        allocation_retry_wait_millis: wait_millis,
        ..ManagerConfig::new("java:/TestDS")
    }
}

/// Manager over a plain pool with default settings
pub fn manager_with_pool(factory: Arc<MockFactory>, config: PoolConfig) -> (Arc<BaseConnectionManager>, Arc<InternalManagedConnectionPool>) {
    let manager = BaseConnectionManager::builder(manager_config(0, 0))
        .build()
        .expect("manager builds");
    let pool = InternalManagedConnectionPool::new(factory, config, None);
    manager.set_pool(pool.clone());
    (manager, pool)
}

/// A free-standing listener that belongs to no pool
pub fn detached_listener(factory: &MockFactory) -> Arc<ConnectionListener> {
    ConnectionListener::new(factory.connection(), PoolRef::detached(), Weak::new())
}

/// Advance paused time in small steps so spawned tasks observe each timer
pub async fn advance_stepwise(total: std::time::Duration, step: std::time::Duration) {
    let mut elapsed = std::time::Duration::ZERO;
    while elapsed < total {
        tokio::time::advance(step).await;
        tokio::task::yield_now().await;
        elapsed += step;
    }
    for _ in 0..4 {
        tokio::task::yield_now().await;
    }
}
