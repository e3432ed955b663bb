//! Pooling strategies
//!
//! A deployment can keep one pool for all requests or split its
//! connections into sub-pools by subject and/or request criteria.
//! `KeyedConnectionPool` implements the split; each sub-pool is an
//! `InternalManagedConnectionPool` registered with the background daemons on
//! its own.

use crate::config::PoolConfig;
use crate::error::{ResourceError, Result};
use crate::listener::ConnectionListener;
use crate::pool::{
    ConnectionListenerFactory, InternalManagedConnectionPool, ManagedConnectionPool, PoolRef,
    PoolStatistics,
};
use crate::spi::{ConnectionRequestInfo, ManagedConnectionFactory, PoolId, Subject, TransactionKey};
use crate::sweeper::BackgroundDaemons;
use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tracing::{debug, info, warn};

/// How requests are split across sub-pools
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PoolingStrategy {
    /// Every request shares one sub-pool
    #[default]
    OnePool,
    ByCriteria,
    BySubject,
    BySubjectAndCriteria,
}

/// Sub-pool key derived from a request
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SubPoolKey {
    subject: Option<Subject>,
    criteria: Option<ConnectionRequestInfo>,
}

impl PoolingStrategy {
    pub fn key(&self, subject: Option<&Subject>, criteria: Option<&ConnectionRequestInfo>) -> SubPoolKey {
        let (subject, criteria) = match self {
            PoolingStrategy::OnePool => (None, None),
            PoolingStrategy::ByCriteria => (None, criteria.cloned()),
            PoolingStrategy::BySubject => (subject.cloned(), None),
            PoolingStrategy::BySubjectAndCriteria => (subject.cloned(), criteria.cloned()),
        };
        SubPoolKey { subject, criteria }
    }
}

/// Pool that routes requests to lazily created sub-pools
///
/// Listeners from every sub-pool report this pool as their owner.
pub struct KeyedConnectionPool {
    id: PoolId,
    self_ref: Weak<KeyedConnectionPool>,
    mcf: Arc<dyn ManagedConnectionFactory>,
    config: PoolConfig,
    daemons: Option<BackgroundDaemons>,
    sub_pools: RwLock<HashMap<SubPoolKey, Arc<InternalManagedConnectionPool>>>,
    listener_factory: RwLock<Option<Weak<dyn ConnectionListenerFactory>>>,
    shutdown: AtomicBool,
}

impl KeyedConnectionPool {
    pub fn new(
        mcf: Arc<dyn ManagedConnectionFactory>,
        config: PoolConfig,
        daemons: Option<BackgroundDaemons>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|self_ref| Self {
            id: PoolId::next(),
            self_ref: self_ref.clone(),
            mcf,
            config,
            daemons,
            sub_pools: RwLock::new(HashMap::new()),
            listener_factory: RwLock::new(None),
            shutdown: AtomicBool::new(false),
        })
    }

    pub fn strategy(&self) -> PoolingStrategy {
        self.config.strategy
    }

    pub fn sub_pool_count(&self) -> usize {
        self.sub_pools.read().len()
    }

    fn owner(&self) -> PoolRef {
        let weak: Weak<dyn ManagedConnectionPool> = self.self_ref.clone();
        PoolRef::from_weak(self.id, weak)
    }

    fn sub_pools(&self) -> Vec<Arc<InternalManagedConnectionPool>> {
        self.sub_pools.read().values().cloned().collect()
    }

    async fn sub_pool(&self, key: SubPoolKey) -> Result<Arc<InternalManagedConnectionPool>> {
        let existing = self.sub_pools.read().get(&key).cloned();
        if let Some(pool) = existing {
            return Ok(pool);
        }

        let candidate = InternalManagedConnectionPool::with_owner(
            self.mcf.clone(),
            self.config.clone(),
            self.daemons.clone(),
            self.owner(),
        );
        let factory = self.listener_factory.read().clone();
        if let Some(factory) = factory {
            candidate.set_connection_listener_factory(factory);
        }

        let (pool, created) = {
            let mut sub_pools = self.sub_pools.write();
            match sub_pools.entry(key) {
                Entry::Occupied(entry) => (entry.get().clone(), false),
                Entry::Vacant(entry) => {
                    entry.insert(candidate.clone());
                    (candidate, true)
                }
            }
        };

        if created {
            debug!("{} created sub-pool {}", self.id, pool.pool_id());
            pool.start().await?;
        }
        Ok(pool)
    }
}

#[async_trait]
impl ManagedConnectionPool for KeyedConnectionPool {
    fn pool_id(&self) -> PoolId {
        self.id
    }

    async fn get_connection(
        &self,
        transaction: Option<TransactionKey>,
        subject: Option<&Subject>,
        criteria: Option<&ConnectionRequestInfo>,
    ) -> Result<Arc<ConnectionListener>> {
        if self.shutdown.load(Ordering::SeqCst) {
            return Err(ResourceError::pool_closed(&self.id.to_string()));
        }
        let key = self.config.strategy.key(subject, criteria);
        let pool = self.sub_pool(key).await?;
        pool.get_connection(transaction, subject, criteria).await
    }

    fn return_connection(&self, listener: &Arc<ConnectionListener>, kill: bool) -> Result<()> {
        let owner = self.sub_pools().into_iter().find(|pool| pool.owns(listener));
        match owner {
            Some(pool) => pool.return_connection(listener, kill),
            None => {
                warn!("No sub-pool of {} has {} checked out", self.id, listener);
                Ok(())
            }
        }
    }

    fn connection_count(&self) -> usize {
        self.sub_pools().iter().map(|pool| pool.connection_count()).sum()
    }

    fn set_connection_listener_factory(&self, factory: Weak<dyn ConnectionListenerFactory>) {
        for pool in self.sub_pools() {
            pool.set_connection_listener_factory(factory.clone());
        }
        *self.listener_factory.write() = Some(factory);
    }

    fn managed_connection_factory(&self) -> Arc<dyn ManagedConnectionFactory> {
        self.mcf.clone()
    }

    async fn validate_connections(&self) -> Result<()> {
        for pool in self.sub_pools() {
            pool.validate_connections().await?;
        }
        Ok(())
    }

    async fn remove_idle_connections(&self) -> Result<()> {
        for pool in self.sub_pools() {
            pool.remove_idle_connections().await?;
        }
        Ok(())
    }

    fn flush(&self) {
        for pool in self.sub_pools() {
            pool.flush();
        }
    }

    async fn shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
        // Sub-pools stay in the map so listeners still checked out can be returned and destroyed
        let pools = self.sub_pools();
        info!("Shutting down {} with {} sub-pools", self.id, pools.len());
        for pool in pools {
            pool.shutdown().await;
        }
    }

    fn statistics(&self) -> PoolStatistics {
        let parts: Vec<_> = self.sub_pools().iter().map(|pool| pool.statistics()).collect();
        PoolStatistics::aggregate(self.id, self.config.max_size, &parts)
    }
}
