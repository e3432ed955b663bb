//! Resource adapter contracts
//!
//! The connection manager and pools never talk to a physical resource
//! directly. Everything they need from a resource adapter goes through the
//! traits in this module:
//! - `ManagedConnectionFactory` creates physical connections
//! - `ManagedConnection` wraps one physical connection and hands out handles
//! - `ConnectionEventListener` receives close/error notifications for a handle
//! - `SubjectFactory` resolves the security subject for a security domain

use crate::error::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::collections::BTreeMap;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

static NEXT_HANDLE_ID: AtomicU64 = AtomicU64::new(1);
static NEXT_POOL_ID: AtomicU64 = AtomicU64::new(1);

/// Security subject a connection is requested for
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Subject {
    /// Principal name
    pub principal: String,
    /// Credential presented for the principal
    pub credential: Option<String>,
}

impl Subject {
    pub fn new(principal: impl Into<String>, credential: Option<String>) -> Self {
        Self {
            principal: principal.into(),
            credential,
        }
    }
}

impl fmt::Debug for Subject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subject")
            .field("principal", &self.principal)
            .field("credential", &self.credential.as_ref().map(|_| "****"))
            .finish()
    }
}

/// Connection request criteria, compared by value when matching pooled connections
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConnectionRequestInfo {
    properties: BTreeMap<String, String>,
}

impl ConnectionRequestInfo {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style property setter
    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.properties.get(key).map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.properties.is_empty()
    }
}

/// Value identity of a managed connection factory
///
/// Two factories are the same factory when their identities are equal,
/// regardless of which object instance the caller holds.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FactoryIdentity {
    /// Adapter-level factory name
    pub name: String,
    /// Properties that distinguish otherwise identical factories
    pub properties: BTreeMap<String, String>,
}

impl FactoryIdentity {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            properties: BTreeMap::new(),
        }
    }

    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }
}

impl fmt::Display for FactoryIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name)?;
        if !self.properties.is_empty() {
            let props = self
                .properties
                .iter()
                .map(|(k, v)| format!("{}={}", k, v))
                .collect::<Vec<_>>()
                .join(", ");
            write!(f, "[{}]", props)?;
        }
        Ok(())
    }
}

/// Key of an externally managed transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TransactionKey(pub u64);

impl fmt::Display for TransactionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "tx-{}", self.0)
    }
}

/// How an externally managed transaction ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TransactionOutcome {
    Committed,
    RolledBack,
}

impl fmt::Display for TransactionOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Committed => write!(f, "committed"),
            Self::RolledBack => write!(f, "rolled back"),
        }
    }
}

/// Identity of a pool instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct PoolId(u64);

impl PoolId {
    /// Allocate a fresh, process-unique pool id
    pub fn next() -> Self {
        Self(NEXT_POOL_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for PoolId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "pool-{}", self.0)
    }
}

/// Caller-visible connection handle
///
/// Handles are opaque to the pool; equality is handle identity, so two
/// handles wrapping equal values are still different handles.
#[derive(Clone)]
pub struct ConnectionHandle {
    id: u64,
    inner: Arc<dyn Any + Send + Sync>,
}

impl ConnectionHandle {
    pub fn new<T: Any + Send + Sync>(value: T) -> Self {
        Self {
            id: NEXT_HANDLE_ID.fetch_add(1, Ordering::Relaxed),
            inner: Arc::new(value),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Access the adapter-specific connection object behind this handle
    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        self.inner.downcast_ref::<T>()
    }
}

impl fmt::Debug for ConnectionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionHandle").field("id", &self.id).finish()
    }
}

impl PartialEq for ConnectionHandle {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for ConnectionHandle {}

impl Hash for ConnectionHandle {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

/// Receives lifecycle events raised by a managed connection
pub trait ConnectionEventListener: Send + Sync {
    /// The application closed `handle`
    fn connection_closed(&self, handle: &ConnectionHandle);

    /// The physical connection failed and must not be reused
    fn connection_error_occurred(&self, error: crate::error::ResourceError);
}

/// One physical connection to the underlying resource
#[async_trait]
pub trait ManagedConnection: Send + Sync {
    /// Create a new caller-visible handle for this connection
    fn get_connection(
        &self,
        subject: Option<&Subject>,
        criteria: Option<&ConnectionRequestInfo>,
    ) -> Result<ConnectionHandle>;

    /// Re-point an existing handle at this connection
    fn associate_connection(&self, handle: &ConnectionHandle) -> Result<()>;

    /// Reset connection state before it goes back to the free list
    fn cleanup(&self) -> Result<()>;

    /// Close the physical connection
    fn destroy(&self) -> Result<()>;

    /// Whether this connection can serve a request for `subject`/`criteria`
    fn matches(&self, _subject: Option<&Subject>, _criteria: Option<&ConnectionRequestInfo>) -> bool {
        true
    }

    /// Background validation check
    async fn is_valid(&self) -> bool {
        true
    }

    /// Register the listener that should receive close/error events
    fn add_connection_event_listener(&self, _listener: Weak<dyn ConnectionEventListener>) {}

    fn begin_local_transaction(&self) -> Result<()> {
        Ok(())
    }

    fn commit_local_transaction(&self) -> Result<()> {
        Ok(())
    }

    fn rollback_local_transaction(&self) -> Result<()> {
        Ok(())
    }
}

/// Factory for physical connections
#[async_trait]
pub trait ManagedConnectionFactory: Send + Sync {
    fn identity(&self) -> FactoryIdentity;

    async fn create_managed_connection(
        &self,
        subject: Option<&Subject>,
        criteria: Option<&ConnectionRequestInfo>,
    ) -> Result<Box<dyn ManagedConnection>>;
}

/// Resolves the subject used for container-managed sign-on
pub trait SubjectFactory: Send + Sync {
    fn create_subject(&self, security_domain: &str) -> Option<Subject>;
}
