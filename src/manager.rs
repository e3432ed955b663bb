//! Connection manager
//!
//! `BaseConnectionManager` is the per-deployment facade a client-facing
//! connection factory calls to obtain connections. It:
//! - obtains listeners from the pool, retrying failed allocations
//! - binds caller-visible handles to listeners
//! - returns listeners to their pool on close or error
//! - moves connections between units of work for the cached connection manager

use crate::ccm::{CachedConnectionManager, ConnectionCacheListener, ConnectionRecord};
use crate::config::{ManagerConfig, TransactionSupport};
use crate::error::{ResourceError, Result};
use crate::listener::{ConnectionListener, ListenerState};
use crate::policy::{LocalTxPolicy, NoTxPolicy, TransactionPolicy, TransactionSource, XaTxPolicy};
use crate::pool::{ConnectionListenerFactory, ManagedConnectionPool, PoolRef};
use crate::spi::{
    ConnectionHandle, ConnectionRequestInfo, FactoryIdentity, ManagedConnection, Subject,
    SubjectFactory, TransactionKey, TransactionOutcome,
};
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::Notify;
use tracing::{debug, info, warn};

/// Builder for `BaseConnectionManager`
pub struct ConnectionManagerBuilder {
    config: ManagerConfig,
    subject_factory: Option<Arc<dyn SubjectFactory>>,
    ccm: Option<Arc<dyn CachedConnectionManager>>,
    transaction_source: Option<Arc<dyn TransactionSource>>,
    policy: Option<Arc<dyn TransactionPolicy>>,
}

impl ConnectionManagerBuilder {
    pub fn subject_factory(mut self, factory: Arc<dyn SubjectFactory>) -> Self {
        self.subject_factory = Some(factory);
        self
    }

    pub fn cached_connection_manager(mut self, ccm: Arc<dyn CachedConnectionManager>) -> Self {
        self.ccm = Some(ccm);
        self
    }

    /// Source of the caller's transaction for `local` and `xa` support
    pub fn transaction_source(mut self, source: Arc<dyn TransactionSource>) -> Self {
        self.transaction_source = Some(source);
        self
    }

    /// Use `policy` instead of the one implied by the configured transaction support
    pub fn transaction_policy(mut self, policy: Arc<dyn TransactionPolicy>) -> Self {
        self.policy = Some(policy);
        self
    }

    pub fn build(self) -> Result<Arc<BaseConnectionManager>> {
        let config = self.config;
        let track_by_tx = config.track_connection_by_tx;

        let policy: Arc<dyn TransactionPolicy> = match (self.policy, config.transaction_support) {
            (Some(policy), _) => policy,
            (None, TransactionSupport::None) => Arc::new(NoTxPolicy),
            (None, support) => {
                let source = self.transaction_source.ok_or_else(|| {
                    ResourceError::configuration_error(
                        "manager.transaction_support".to_string(),
                        format!("{:?} transaction support needs a transaction source", support),
                    )
                })?;
                match support {
                    TransactionSupport::Local => Arc::new(LocalTxPolicy::new(source, track_by_tx)),
                    _ => Arc::new(XaTxPolicy::new(source, track_by_tx)),
                }
            }
        };

        let manager = Arc::new_cyclic(|self_ref| BaseConnectionManager {
            jndi_name: config.jndi_name.clone(),
            self_ref: self_ref.clone(),
            allocation_retry: config.allocation_retry,
            allocation_retry_wait: config.allocation_retry_wait(),
            security_domain: config.security_domain.clone(),
            track_by_tx,
            pool: RwLock::new(None),
            subject_factory: self.subject_factory,
            ccm: self.ccm,
            policy,
            shutdown: AtomicBool::new(false),
            shutdown_signal: Notify::new(),
        });
        info!(
            "Created connection manager {} (retry={}, wait={:?}, tx={})",
            manager.jndi_name,
            manager.allocation_retry,
            manager.allocation_retry_wait,
            manager.policy.name()
        );
        Ok(manager)
    }
}

/// Per-deployment connection manager
pub struct BaseConnectionManager {
    jndi_name: String,
    self_ref: Weak<BaseConnectionManager>,
    allocation_retry: u32,
    allocation_retry_wait: Duration,
    security_domain: Option<String>,
    track_by_tx: bool,
    pool: RwLock<Option<Arc<dyn ManagedConnectionPool>>>,
    subject_factory: Option<Arc<dyn SubjectFactory>>,
    ccm: Option<Arc<dyn CachedConnectionManager>>,
    policy: Arc<dyn TransactionPolicy>,
    shutdown: AtomicBool,
    shutdown_signal: Notify,
}

impl BaseConnectionManager {
    pub fn builder(config: ManagerConfig) -> ConnectionManagerBuilder {
        ConnectionManagerBuilder {
            config,
            subject_factory: None,
            ccm: None,
            transaction_source: None,
            policy: None,
        }
    }

    pub fn jndi_name(&self) -> &str {
        &self.jndi_name
    }

    /// Install the pool this manager allocates from
    ///
    /// The pool only keeps a weak reference back to the manager.
    pub fn set_pool(&self, pool: Arc<dyn ManagedConnectionPool>) {
        let factory: Weak<dyn ConnectionListenerFactory> = self.self_ref.clone();
        pool.set_connection_listener_factory(factory);
        info!("{} now allocates from {}", self.jndi_name, pool.pool_id());
        *self.pool.write() = Some(pool);
    }

    pub fn pool(&self) -> Option<Arc<dyn ManagedConnectionPool>> {
        self.pool.read().clone()
    }

    pub fn start(&self) {
        self.shutdown.store(false, Ordering::SeqCst);
        info!("Started connection manager {}", self.jndi_name);
    }

    /// Refuse further allocations and wake any retry loop that is waiting
    pub fn stop(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
        self.shutdown_signal.notify_waiters();
        match self.pool().map(|pool| pool.statistics().to_json()) {
            Some(Ok(stats)) => info!("Stopped connection manager {}: {}", self.jndi_name, stats),
            Some(Err(e)) => warn!("Stopped connection manager {} ({})", self.jndi_name, e),
            None => info!("Stopped connection manager {}", self.jndi_name),
        }
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }

    pub fn connection_count(&self) -> usize {
        self.pool().map(|pool| pool.connection_count()).unwrap_or(0)
    }

    pub fn transaction_policy(&self) -> &Arc<dyn TransactionPolicy> {
        &self.policy
    }

    fn require_pool(&self) -> Result<Arc<dyn ManagedConnectionPool>> {
        self.pool().ok_or_else(|| {
            ResourceError::internal_error(
                format!("No pool is set for {}", self.jndi_name),
                None,
            )
        })
    }

    fn subject(&self) -> Option<Subject> {
        let domain = self.security_domain.as_deref()?;
        self.subject_factory.as_ref()?.create_subject(domain)
    }

    /// Sleep between retries; false when the manager was stopped meanwhile
    async fn retry_pause(&self) -> bool {
        if self.allocation_retry_wait.is_zero() {
            return true;
        }
        let stopped = self.shutdown_signal.notified();
        tokio::pin!(stopped);
        stopped.as_mut().enable();
        if self.is_shutdown() {
            return false;
        }
        tokio::select! {
            () = tokio::time::sleep(self.allocation_retry_wait) => true,
            () = stopped => false,
        }
    }

    /// Obtain a listener from the pool, retrying failed attempts
    ///
    /// Makes at most `allocation_retry + 1` attempts. When all of them fail
    /// the error wraps the failure of the final attempt.
    pub async fn get_managed_connection(
        &self,
        transaction: Option<TransactionKey>,
        subject: Option<&Subject>,
        criteria: Option<&ConnectionRequestInfo>,
    ) -> Result<Arc<ConnectionListener>> {
        if self.is_shutdown() {
            return Err(ResourceError::shutdown(&self.jndi_name));
        }
        let pool = self.require_pool()?;

        let mut last_error = match pool.get_connection(transaction, subject, criteria).await {
            Ok(listener) => return Ok(listener),
            Err(e) => e,
        };
        let mut attempts = 1;

        for _ in 0..self.allocation_retry {
            if self.is_shutdown() {
                return Err(ResourceError::shutdown(&self.jndi_name));
            }
            debug!(
                "Attempt {} to get a connection for {} failed, retrying: {}",
                attempts, self.jndi_name, last_error
            );
            if !self.retry_pause().await {
                return Err(ResourceError::shutdown(&self.jndi_name));
            }

            attempts += 1;
            match pool.get_connection(transaction, subject, criteria).await {
                Ok(listener) => return Ok(listener),
                Err(e) => last_error = e,
            }
        }

        Err(ResourceError::allocation(&self.jndi_name, attempts, last_error))
    }

    /// Allocate a caller-visible handle for a connection factory
    ///
    /// Either the caller gets a handle registered against exactly one
    /// listener, or an error comes back and no handle stays registered.
    pub async fn allocate_connection(
        &self,
        factory: &FactoryIdentity,
        criteria: Option<ConnectionRequestInfo>,
    ) -> Result<ConnectionHandle> {
        let pool = self.require_pool()?;
        let expected = pool.managed_connection_factory().identity();
        if *factory != expected {
            return Err(ResourceError::factory_mismatch(
                &self.jndi_name,
                expected.to_string(),
                factory.to_string(),
            ));
        }
        if self.is_shutdown() {
            return Err(ResourceError::shutdown(&self.jndi_name));
        }

        let subject = self.subject();
        let transaction = self.policy.current_transaction();
        let tracked = match transaction {
            Some(tx) if self.track_by_tx => self.policy.tracked_listener(tx),
            _ => None,
        };

        let listener = match tracked {
            Some(listener) => {
                debug!("Reusing {} tracked by transaction", listener);
                listener
            }
            None => {
                let listener = self
                    .get_managed_connection(transaction, subject.as_ref(), criteria.as_ref())
                    .await?;
                if let Err(e) = self.policy.managed_connection_reconnected(self, &listener) {
                    let error = ResourceError::listener_hook(
                        "managed_connection_reconnected",
                        listener.to_string(),
                        e,
                    );
                    self.disconnect_after_failure(&listener);
                    return Err(error);
                }
                listener
            }
        };

        let handle = match listener
            .managed_connection()
            .get_connection(subject.as_ref(), criteria.as_ref())
        {
            Ok(handle) => handle,
            Err(e) => {
                let error = ResourceError::handle_creation(listener.to_string(), e);
                self.disconnect_after_failure(&listener);
                return Err(error);
            }
        };

        if let Err(e) = self.register_association(&listener, &handle) {
            self.disconnect_after_failure(&listener);
            return Err(e);
        }
        if let (Some(ccm), Some(this)) = (&self.ccm, self.self_ref.upgrade()) {
            ccm.register_connection(this, &listener, &handle, criteria);
        }
        Ok(handle)
    }

    fn register_association(&self, listener: &Arc<ConnectionListener>, handle: &ConnectionHandle) -> Result<()> {
        listener.register_handle(handle.clone())
    }

    /// Best-effort release of a listener after a failed allocation step;
    /// a listener that cannot be disconnected is destroyed
    fn disconnect_after_failure(&self, listener: &Arc<ConnectionListener>) {
        if let Err(e) = self.policy.managed_connection_disconnected(self, listener) {
            warn!("Unable to disconnect {} after failure, destroying it: {}", listener, e);
            self.return_managed_connection(listener, true);
        }
    }

    /// Give a listener back to the pool it came from
    ///
    /// Never fails: problems are logged so they cannot mask an error the
    /// caller is already handling.
    pub fn return_managed_connection(&self, listener: &Arc<ConnectionListener>, kill: bool) {
        let mut kill = kill;
        match self.pool() {
            Some(pool) if pool.pool_id() == listener.pool().id() => {}
            Some(pool) => {
                debug!(
                    "{} belongs to {} but the current pool is {}; destroying it",
                    listener,
                    listener.pool().id(),
                    pool.pool_id()
                );
                kill = true;
            }
            None => kill = true,
        }

        if !kill && listener.state() == ListenerState::Normal {
            if let Err(e) = listener.tidyup() {
                warn!("Error during tidy-up of {}, destroying it: {}", listener, e);
                kill = true;
            }
        }

        match listener.pool().upgrade() {
            Some(pool) => {
                if let Err(e) = pool.return_connection(listener, kill) {
                    warn!("Error returning {} to {}: {}", listener, pool.pool_id(), e);
                }
            }
            None => {
                debug!("Pool of {} is gone; destroying it", listener);
                if let Err(e) = listener.destroy() {
                    warn!("Error destroying {}: {}", listener, e);
                }
            }
        }
    }

    /// Handle closed by the application
    pub(crate) fn connection_closed(&self, listener: &Arc<ConnectionListener>, handle: &ConnectionHandle) {
        if let Some(ccm) = &self.ccm {
            ccm.unregister_connection(self, handle);
        }
        listener.unregister_handle(handle);
        if let Err(e) = self.policy.managed_connection_disconnected(self, listener) {
            warn!("Error while closing a handle of {}: {}", listener, e);
            self.return_managed_connection(listener, true);
        }
    }

    /// Physical connection failure reported by the resource adapter
    pub(crate) fn connection_error_occurred(&self, listener: &Arc<ConnectionListener>, error: ResourceError) {
        warn!("Connection error occurred on {}: {}", listener, error);
        let handles = listener.unregister_all_handles();
        if let Some(ccm) = &self.ccm {
            for handle in &handles {
                ccm.unregister_connection(self, handle);
            }
        }
        listener.set_state(ListenerState::Destroy);
        self.return_managed_connection(listener, true);
    }

    /// Notify the transaction policy that `transaction` finished
    ///
    /// The host must report every transaction it saw connections allocated
    /// in, whatever its outcome.
    pub fn transaction_completed(&self, transaction: TransactionKey, outcome: TransactionOutcome) {
        self.policy.transaction_completed(self, transaction, outcome);
    }

    fn disconnect_listener(&self, listener: &Arc<ConnectionListener>) {
        if let Err(e) = self.policy.managed_connection_disconnected(self, listener) {
            warn!("Unable to disconnect {}: {}", listener, e);
        }
    }
}

#[async_trait]
impl ConnectionCacheListener for BaseConnectionManager {
    fn jndi_name(&self) -> &str {
        &self.jndi_name
    }

    async fn reconnect(
        &self,
        records: &mut [ConnectionRecord],
        unshareable: &HashSet<String>,
    ) -> Result<()> {
        if unshareable.contains(&self.jndi_name) {
            return Ok(());
        }

        let subject = self.subject();
        let transaction = self.policy.current_transaction();
        let mut by_criteria: HashMap<Option<ConnectionRequestInfo>, Arc<ConnectionListener>> = HashMap::new();

        for record in records.iter_mut() {
            if record.listener.is_some() {
                debug!("Handle {} still has a listener; leaving it", record.handle.id());
                continue;
            }

            let listener = match by_criteria.get(&record.criteria) {
                Some(listener) => listener.clone(),
                None => {
                    let listener = self
                        .get_managed_connection(transaction, subject.as_ref(), record.criteria.as_ref())
                        .await?;
                    if let Err(e) = self.policy.managed_connection_reconnected(self, &listener) {
                        let error = ResourceError::listener_hook(
                            "managed_connection_reconnected",
                            listener.to_string(),
                            e,
                        );
                        self.disconnect_after_failure(&listener);
                        return Err(error);
                    }
                    by_criteria.insert(record.criteria.clone(), listener.clone());
                    listener
                }
            };

            if let Err(e) = listener
                .managed_connection()
                .associate_connection(&record.handle)
                .and_then(|()| self.register_association(&listener, &record.handle))
            {
                if listener.is_managed_connection_free() {
                    self.disconnect_after_failure(&listener);
                }
                return Err(e);
            }
            record.listener = Some(listener);
        }
        Ok(())
    }

    fn disconnect(&self, records: &mut [ConnectionRecord], unshareable: &HashSet<String>) -> Result<()> {
        if unshareable.contains(&self.jndi_name) {
            return Ok(());
        }

        let mut listeners: Vec<Arc<ConnectionListener>> = Vec::new();
        for record in records.iter_mut() {
            if let Some(listener) = record.listener.take() {
                listener.unregister_handle(&record.handle);
                if !listeners.iter().any(|l| l.id() == listener.id()) {
                    listeners.push(listener);
                }
            }
        }

        for listener in &listeners {
            self.disconnect_listener(listener);
        }
        Ok(())
    }
}

impl ConnectionListenerFactory for BaseConnectionManager {
    fn create_connection_listener(
        &self,
        managed_connection: Box<dyn ManagedConnection>,
        pool: PoolRef,
    ) -> Result<Arc<ConnectionListener>> {
        Ok(ConnectionListener::new(managed_connection, pool, self.self_ref.clone()))
    }
}

impl fmt::Debug for BaseConnectionManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BaseConnectionManager")
            .field("jndi_name", &self.jndi_name)
            .field("allocation_retry", &self.allocation_retry)
            .field("allocation_retry_wait", &self.allocation_retry_wait)
            .field("transaction_support", &self.policy.name())
            .field("shutdown", &self.is_shutdown())
            .finish()
    }
}
