//! Connector Pool
//!
//! A pooled resource connection manager: hands out, tracks, validates,
//! recycles and evicts shared connections to concurrent callers, with
//! transaction-boundary awareness, background health checking and graceful
//! shutdown.

pub mod ccm;
pub mod config;
pub mod error;
pub mod idle_remover;
pub mod listener;
pub mod manager;
pub mod policy;
pub mod pool;
pub mod spi;
pub mod strategy;
pub mod sweeper;
pub mod telemetry;
pub mod validator;

pub use ccm::{CachedConnectionManager, ConnectionCache, ConnectionCacheListener, ConnectionRecord, MetaAwareKey};
pub use config::{Config, LoggingConfig, ManagerConfig, PoolConfig, TransactionSupport};
pub use error::{ResourceError, Result};
pub use idle_remover::IdleRemover;
pub use listener::{ConnectionListener, ListenerState};
pub use manager::{BaseConnectionManager, ConnectionManagerBuilder};
pub use policy::{LocalTxPolicy, ManualTransactionSource, NoTxPolicy, TransactionPolicy, TransactionSource, XaTxPolicy};
pub use pool::{ConnectionListenerFactory, InternalManagedConnectionPool, ManagedConnectionPool, PoolRef, PoolStatistics};
pub use spi::{
    ConnectionEventListener, ConnectionHandle, ConnectionRequestInfo, FactoryIdentity, ManagedConnection,
    ManagedConnectionFactory, PoolId, Subject, SubjectFactory, TransactionKey, TransactionOutcome,
};
pub use strategy::{KeyedConnectionPool, PoolingStrategy};
pub use sweeper::{BackgroundDaemons, PoolSweeper, SweepSchedule};
pub use validator::ConnectionValidator;
