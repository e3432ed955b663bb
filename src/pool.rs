//! Managed connection pools
//!
//! This module provides the pool side of the connection manager:
//! - The `ManagedConnectionPool` contract the manager and the background
//!   daemons talk to
//! - `InternalManagedConnectionPool`, a bounded pool of connection listeners
//!   for one managed connection factory
//! - Pool statistics snapshots

use crate::config::PoolConfig;
use crate::error::{ResourceError, Result};
use crate::listener::{ConnectionListener, ListenerState};
use crate::spi::{
    ConnectionRequestInfo, ManagedConnection, ManagedConnectionFactory, PoolId, Subject,
    TransactionKey,
};
use crate::sweeper::BackgroundDaemons;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

/// Contract between the connection manager, the background daemons and a pool
#[async_trait]
pub trait ManagedConnectionPool: Send + Sync {
    fn pool_id(&self) -> PoolId;

    /// Check out a listener able to serve `subject`/`criteria`
    async fn get_connection(
        &self,
        transaction: Option<TransactionKey>,
        subject: Option<&Subject>,
        criteria: Option<&ConnectionRequestInfo>,
    ) -> Result<Arc<ConnectionListener>>;

    /// Give a checked-out listener back, destroying it when `kill` is set
    fn return_connection(&self, listener: &Arc<ConnectionListener>, kill: bool) -> Result<()>;

    /// Idle plus checked-out connections
    fn connection_count(&self) -> usize;

    /// Factory used to wrap newly created managed connections
    fn set_connection_listener_factory(&self, factory: Weak<dyn ConnectionListenerFactory>);

    fn managed_connection_factory(&self) -> Arc<dyn ManagedConnectionFactory>;

    /// Validate idle connections; called by the connection validator
    async fn validate_connections(&self) -> Result<()>;

    /// Evict timed-out idle connections; called by the idle remover
    async fn remove_idle_connections(&self) -> Result<()>;

    /// Destroy idle connections and mark checked-out ones for destruction
    fn flush(&self);

    async fn shutdown(&self);

    fn statistics(&self) -> PoolStatistics;
}

/// Wraps new managed connections in listeners
pub trait ConnectionListenerFactory: Send + Sync {
    fn create_connection_listener(
        &self,
        managed_connection: Box<dyn ManagedConnection>,
        pool: PoolRef,
    ) -> Result<Arc<ConnectionListener>>;
}

/// Non-owning back-reference from a listener to the pool that issued it
#[derive(Clone)]
pub struct PoolRef {
    id: PoolId,
    pool: Weak<dyn ManagedConnectionPool>,
}

impl PoolRef {
    pub fn new(pool: &Arc<dyn ManagedConnectionPool>) -> Self {
        Self {
            id: pool.pool_id(),
            pool: Arc::downgrade(pool),
        }
    }

    pub fn from_weak(id: PoolId, pool: Weak<dyn ManagedConnectionPool>) -> Self {
        Self { id, pool }
    }

    /// A reference to no pool at all
    pub fn detached() -> Self {
        let pool: Weak<dyn ManagedConnectionPool> = Weak::<InternalManagedConnectionPool>::new();
        Self {
            id: PoolId::next(),
            pool,
        }
    }

    pub fn id(&self) -> PoolId {
        self.id
    }

    pub fn upgrade(&self) -> Option<Arc<dyn ManagedConnectionPool>> {
        self.pool.upgrade()
    }
}

impl fmt::Debug for PoolRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PoolRef").field("id", &self.id).finish()
    }
}

/// Point-in-time pool statistics
#[derive(Debug, Clone, Serialize)]
pub struct PoolStatistics {
    pub pool_id: String,
    /// Connections currently checked out
    pub in_use: usize,
    /// Connections waiting in the free list
    pub idle: usize,
    pub max_size: usize,
    /// Free slots under `max_size`
    pub available: usize,
    pub total_created: u64,
    pub total_destroyed: u64,
    /// Requests that gave up waiting for a free slot
    pub blocking_timeouts: u64,
    pub captured_at: DateTime<Utc>,
}

impl PoolStatistics {
    /// Sum a set of sub-pool snapshots under a new pool id
    pub fn aggregate<'a>(
        pool_id: PoolId,
        max_size: usize,
        parts: impl IntoIterator<Item = &'a PoolStatistics>,
    ) -> Self {
        let mut total = Self {
            pool_id: pool_id.to_string(),
            in_use: 0,
            idle: 0,
            max_size,
            available: 0,
            total_created: 0,
            total_destroyed: 0,
            blocking_timeouts: 0,
            captured_at: Utc::now(),
        };
        for part in parts {
            total.in_use += part.in_use;
            total.idle += part.idle;
            total.available += part.available;
            total.total_created += part.total_created;
            total.total_destroyed += part.total_destroyed;
            total.blocking_timeouts += part.blocking_timeouts;
        }
        total
    }

    /// Render as a single-line JSON object
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(self).map_err(|e| {
            ResourceError::internal_error(
                format!("Failed to serialize statistics of {}", self.pool_id),
                Some(e.to_string()),
            )
        })
    }
}

#[derive(Default)]
struct PoolCounters {
    created: AtomicU64,
    destroyed: AtomicU64,
    blocking_timeouts: AtomicU64,
}

struct PoolState {
    /// Free listeners; the back is the most recently returned
    idle: VecDeque<Arc<ConnectionListener>>,
    checked_out: HashMap<u64, Arc<ConnectionListener>>,
    /// Idle listeners taken out for background validation
    in_validation: usize,
    shutdown: bool,
}

impl PoolState {
    fn total(&self) -> usize {
        self.idle.len() + self.checked_out.len() + self.in_validation
    }
}

/// Bounded pool of listeners for one managed connection factory
///
/// Capacity is a semaphore with `max_size` permits. A checked-out listener
/// holds one permit until it comes back, so a listener that is destroyed
/// instead of returned still releases its slot.
pub struct InternalManagedConnectionPool {
    id: PoolId,
    self_ref: Weak<InternalManagedConnectionPool>,
    owner: PoolRef,
    mcf: Arc<dyn ManagedConnectionFactory>,
    config: PoolConfig,
    permits: Arc<Semaphore>,
    state: Mutex<PoolState>,
    listener_factory: RwLock<Option<Weak<dyn ConnectionListenerFactory>>>,
    daemons: Option<BackgroundDaemons>,
    counters: PoolCounters,
}

impl InternalManagedConnectionPool {
    pub fn new(
        mcf: Arc<dyn ManagedConnectionFactory>,
        config: PoolConfig,
        daemons: Option<BackgroundDaemons>,
    ) -> Arc<Self> {
        Self::build(mcf, config, daemons, None)
    }

    /// Create a sub-pool whose listeners report `owner` as their pool
    pub fn with_owner(
        mcf: Arc<dyn ManagedConnectionFactory>,
        config: PoolConfig,
        daemons: Option<BackgroundDaemons>,
        owner: PoolRef,
    ) -> Arc<Self> {
        Self::build(mcf, config, daemons, Some(owner))
    }

    fn build(
        mcf: Arc<dyn ManagedConnectionFactory>,
        config: PoolConfig,
        daemons: Option<BackgroundDaemons>,
        owner: Option<PoolRef>,
    ) -> Arc<Self> {
        let id = PoolId::next();
        let max_size = config.max_size;
        Arc::new_cyclic(|self_ref: &Weak<InternalManagedConnectionPool>| {
            let owner = owner.unwrap_or_else(|| {
                let weak: Weak<dyn ManagedConnectionPool> = self_ref.clone();
                PoolRef::from_weak(id, weak)
            });
            Self {
                id,
                self_ref: self_ref.clone(),
                owner,
                mcf,
                config,
                permits: Arc::new(Semaphore::new(max_size)),
                state: Mutex::new(PoolState {
                    idle: VecDeque::new(),
                    checked_out: HashMap::new(),
                    in_validation: 0,
                    shutdown: false,
                }),
                listener_factory: RwLock::new(None),
                daemons,
                counters: PoolCounters::default(),
            }
        })
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    /// Register with the background daemons and prefill if configured
    pub async fn start(&self) -> Result<()> {
        if let (Some(daemons), Some(this)) = (&self.daemons, self.self_ref.upgrade()) {
            let pool: Arc<dyn ManagedConnectionPool> = this;
            if let Some(idle_timeout) = self.config.idle_timeout() {
                daemons.idle_remover.register_pool(pool.clone(), idle_timeout).await;
            }
            if let Some(interval) = self.config.validation_interval() {
                daemons.validator.register_pool(pool, interval).await;
            }
        }

        if self.config.prefill {
            self.fill_to_min().await;
        }

        info!(
            "Started {} (min={}, max={}, idle timeout={:?})",
            self.id,
            self.config.min_size,
            self.config.max_size,
            self.config.idle_timeout()
        );
        Ok(())
    }

    /// Whether `listener` is currently checked out from this pool
    pub fn owns(&self, listener: &ConnectionListener) -> bool {
        self.state.lock().checked_out.contains_key(&listener.id())
    }

    pub fn idle_count(&self) -> usize {
        self.state.lock().idle.len()
    }

    pub fn in_use_count(&self) -> usize {
        self.state.lock().checked_out.len()
    }

    pub fn is_shutdown(&self) -> bool {
        self.state.lock().shutdown
    }

    async fn create_listener(
        &self,
        subject: Option<&Subject>,
        criteria: Option<&ConnectionRequestInfo>,
    ) -> Result<Arc<ConnectionListener>> {
        let mc = self.mcf.create_managed_connection(subject, criteria).await?;
        let factory = self.listener_factory.read().as_ref().and_then(Weak::upgrade);
        let listener = match factory {
            Some(factory) => factory.create_connection_listener(mc, self.owner.clone())?,
            None => ConnectionListener::new(mc, self.owner.clone(), Weak::new()),
        };
        self.counters.created.fetch_add(1, Ordering::Relaxed);
        trace!("{} created {}", self.id, listener);
        Ok(listener)
    }

    fn destroy_listener(&self, listener: &ConnectionListener) {
        if let Err(e) = listener.destroy() {
            warn!("Error destroying {} in {}: {}", listener, self.id, e);
        }
        self.counters.destroyed.fetch_add(1, Ordering::Relaxed);
    }

    /// Put a listener back on the free list, or destroy it if the pool closed meanwhile
    fn push_idle(&self, listener: Arc<ConnectionListener>) {
        let rejected = {
            let mut state = self.state.lock();
            if state.shutdown {
                Some(listener)
            } else {
                state.idle.push_back(listener);
                None
            }
        };
        if let Some(listener) = rejected {
            self.destroy_listener(&listener);
        }
    }

    fn check_out(&self, listener: &Arc<ConnectionListener>, permit: OwnedSemaphorePermit) {
        listener.grant_permit(permit);
        self.state
            .lock()
            .checked_out
            .insert(listener.id(), listener.clone());
    }

    async fn fill_to_min(&self) {
        let min_size = self.config.min_size;
        loop {
            let Ok(permit) = self.permits.clone().try_acquire_owned() else {
                return;
            };
            {
                let state = self.state.lock();
                if state.shutdown || state.total() >= min_size {
                    return;
                }
            }

            match self.create_listener(None, None).await {
                Ok(listener) => {
                    listener.used();
                    self.push_idle(listener);
                    drop(permit);
                }
                Err(e) => {
                    warn!("Unable to fill {} to min size {}: {}", self.id, min_size, e);
                    return;
                }
            }
        }
    }

    fn close(&self) {
        let (idle, checked_out) = {
            let mut state = self.state.lock();
            state.shutdown = true;
            let idle: Vec<_> = state.idle.drain(..).collect();
            let checked_out: Vec<_> = state.checked_out.values().cloned().collect();
            (idle, checked_out)
        };
        for listener in checked_out {
            listener.set_state(ListenerState::Destroy);
        }
        for listener in idle {
            self.destroy_listener(&listener);
        }
        self.permits.close();
    }
}

#[async_trait]
impl ManagedConnectionPool for InternalManagedConnectionPool {
    fn pool_id(&self) -> PoolId {
        self.id
    }

    async fn get_connection(
        &self,
        _transaction: Option<TransactionKey>,
        subject: Option<&Subject>,
        criteria: Option<&ConnectionRequestInfo>,
    ) -> Result<Arc<ConnectionListener>> {
        if self.is_shutdown() {
            return Err(ResourceError::pool_closed(&self.id.to_string()));
        }

        let timeout = self.config.blocking_timeout();
        let permit = match tokio::time::timeout(timeout, self.permits.clone().acquire_owned()).await {
            Ok(Ok(permit)) => permit,
            Ok(Err(_)) => return Err(ResourceError::pool_closed(&self.id.to_string())),
            Err(_) => {
                self.counters.blocking_timeouts.fetch_add(1, Ordering::Relaxed);
                return Err(ResourceError::timeout_error(
                    format!("waiting for a free connection in {}", self.id),
                    timeout.as_millis() as u64,
                ));
            }
        };

        loop {
            let candidate = self.state.lock().idle.pop_back();
            let Some(listener) = candidate else { break };
            if listener.managed_connection().matches(subject, criteria) {
                self.check_out(&listener, permit);
                trace!("{} reused {}", self.id, listener);
                return Ok(listener);
            }
            warn!("Destroying connection that could not be matched: {}", listener);
            self.destroy_listener(&listener);
        }

        // A failed creation drops the permit on the way out
        let listener = self.create_listener(subject, criteria).await?;
        self.check_out(&listener, permit);
        Ok(listener)
    }

    fn return_connection(&self, listener: &Arc<ConnectionListener>, kill: bool) -> Result<()> {
        let (known, shutdown) = {
            let mut state = self.state.lock();
            (state.checked_out.remove(&listener.id()).is_some(), state.shutdown)
        };
        if !known {
            if listener.state() != ListenerState::Destroyed {
                warn!("Ignoring return of {} which is not checked out from {}", listener, self.id);
            }
            return Ok(());
        }

        let mut kill = kill || shutdown || listener.state() == ListenerState::Destroy;
        if !kill && !listener.is_managed_connection_free() {
            warn!("Destroying returned connection that still has handles: {}", listener);
            kill = true;
        }
        if !kill {
            if let Err(e) = listener.managed_connection().cleanup() {
                warn!("Error during cleanup of {}: {}", listener, e);
                kill = true;
            }
        }

        listener.revoke_permit();
        if kill {
            debug!("{} destroying returned {}", self.id, listener);
            self.destroy_listener(listener);
        } else {
            listener.used();
            self.push_idle(listener.clone());
        }
        Ok(())
    }

    fn connection_count(&self) -> usize {
        self.state.lock().total()
    }

    fn set_connection_listener_factory(&self, factory: Weak<dyn ConnectionListenerFactory>) {
        *self.listener_factory.write() = Some(factory);
    }

    fn managed_connection_factory(&self) -> Arc<dyn ManagedConnectionFactory> {
        self.mcf.clone()
    }

    async fn validate_connections(&self) -> Result<()> {
        let Some(interval) = self.config.validation_interval() else {
            return Ok(());
        };
        let now = Instant::now();

        let candidates = {
            let mut state = self.state.lock();
            let mut kept = VecDeque::with_capacity(state.idle.len());
            let mut candidates = Vec::new();
            while let Some(listener) = state.idle.pop_front() {
                if now.saturating_duration_since(listener.last_validated()) < interval {
                    kept.push_back(listener);
                    continue;
                }
                match self.permits.clone().try_acquire_owned() {
                    Ok(permit) => candidates.push((listener, permit)),
                    Err(_) => kept.push_back(listener),
                }
            }
            state.idle = kept;
            state.in_validation += candidates.len();
            candidates
        };

        if !candidates.is_empty() {
            debug!("{} validating {} idle connections", self.id, candidates.len());
        }

        for (listener, permit) in candidates {
            let valid = listener.managed_connection().is_valid().await;
            if valid {
                listener.validated();
            } else {
                warn!("Destroying connection that failed validation: {}", listener);
                self.destroy_listener(&listener);
            }
            self.state.lock().in_validation -= 1;
            if valid {
                self.push_idle(listener);
            }
            drop(permit);
        }
        Ok(())
    }

    async fn remove_idle_connections(&self) -> Result<()> {
        let Some(idle_timeout) = self.config.idle_timeout() else {
            return Ok(());
        };
        let now = Instant::now();

        let expired = {
            let mut state = self.state.lock();
            let mut total = state.total();
            let mut kept = VecDeque::with_capacity(state.idle.len());
            let mut expired = Vec::new();
            while let Some(listener) = state.idle.pop_front() {
                let idle_for = now.saturating_duration_since(listener.last_use());
                if total > self.config.min_size && idle_for >= idle_timeout {
                    total -= 1;
                    expired.push(listener);
                } else {
                    kept.push_back(listener);
                }
            }
            state.idle = kept;
            expired
        };

        if !expired.is_empty() {
            debug!("{} removing {} idle connections", self.id, expired.len());
        }
        for listener in expired {
            self.destroy_listener(&listener);
        }

        self.fill_to_min().await;
        Ok(())
    }

    fn flush(&self) {
        let (idle, checked_out) = {
            let mut state = self.state.lock();
            let idle: Vec<_> = state.idle.drain(..).collect();
            let checked_out: Vec<_> = state.checked_out.values().cloned().collect();
            (idle, checked_out)
        };
        info!(
            "Flushing {}: destroying {} idle, marking {} in use",
            self.id,
            idle.len(),
            checked_out.len()
        );
        for listener in checked_out {
            listener.set_state(ListenerState::Destroy);
        }
        for listener in idle {
            self.destroy_listener(&listener);
        }
    }

    async fn shutdown(&self) {
        info!("Shutting down {}", self.id);
        if let Some(daemons) = &self.daemons {
            daemons.idle_remover.unregister_pool(self.id).await;
            daemons.validator.unregister_pool(self.id).await;
        }
        self.close();
    }

    fn statistics(&self) -> PoolStatistics {
        let state = self.state.lock();
        PoolStatistics {
            pool_id: self.id.to_string(),
            in_use: state.checked_out.len(),
            idle: state.idle.len(),
            max_size: self.config.max_size,
            available: self.permits.available_permits(),
            total_created: self.counters.created.load(Ordering::Relaxed),
            total_destroyed: self.counters.destroyed.load(Ordering::Relaxed),
            blocking_timeouts: self.counters.blocking_timeouts.load(Ordering::Relaxed),
            captured_at: Utc::now(),
        }
    }
}
