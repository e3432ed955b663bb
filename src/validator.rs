//! Background connection validation daemon

use crate::error::Result;
use crate::pool::ManagedConnectionPool;
use crate::spi::PoolId;
use crate::sweeper::PoolSweeper;
use futures::future::BoxFuture;
use futures::FutureExt;
use std::sync::Arc;
use std::time::Duration;

fn validate(pool: Arc<dyn ManagedConnectionPool>) -> BoxFuture<'static, Result<()>> {
    async move { pool.validate_connections().await }.boxed()
}

/// Periodically asks every registered pool to validate its idle connections
pub struct ConnectionValidator {
    sweeper: PoolSweeper,
}

impl ConnectionValidator {
    pub fn start() -> Self {
        Self {
            sweeper: PoolSweeper::start("ConnectionValidator", validate),
        }
    }

    /// Register `pool` to be validated about every `interval / 2`
    pub async fn register_pool(&self, pool: Arc<dyn ManagedConnectionPool>, interval: Duration) {
        self.sweeper.register(pool, interval).await;
    }

    pub async fn unregister_pool(&self, pool_id: PoolId) {
        self.sweeper.unregister(pool_id).await;
    }

    pub fn sweeper(&self) -> &PoolSweeper {
        &self.sweeper
    }
}
