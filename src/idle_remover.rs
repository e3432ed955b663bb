//! Idle connection eviction daemon

use crate::error::Result;
use crate::pool::ManagedConnectionPool;
use crate::spi::PoolId;
use crate::sweeper::PoolSweeper;
use futures::future::BoxFuture;
use futures::FutureExt;
use std::sync::Arc;
use std::time::Duration;

fn remove_idle(pool: Arc<dyn ManagedConnectionPool>) -> BoxFuture<'static, Result<()>> {
    async move { pool.remove_idle_connections().await }.boxed()
}

/// Periodically asks every registered pool to evict idle connections
///
/// A pool registers with its idle timeout; the remover wakes at least twice
/// per the shortest registered timeout.
pub struct IdleRemover {
    sweeper: PoolSweeper,
}

impl IdleRemover {
    pub fn start() -> Self {
        Self {
            sweeper: PoolSweeper::start("IdleRemover", remove_idle),
        }
    }

    pub async fn register_pool(&self, pool: Arc<dyn ManagedConnectionPool>, idle_timeout: Duration) {
        self.sweeper.register(pool, idle_timeout).await;
    }

    pub async fn unregister_pool(&self, pool_id: PoolId) {
        self.sweeper.unregister(pool_id).await;
    }

    pub fn sweeper(&self) -> &PoolSweeper {
        &self.sweeper
    }
}
