//! Error types for the connector pool

use std::fmt;
use tracing::{error, warn};

/// Result type alias for the connector pool
pub type Result<T> = std::result::Result<T, ResourceError>;

/// Boxed error reported by a resource adapter
pub type AdapterError = Box<dyn std::error::Error + Send + Sync>;

/// Main error type for connection allocation and pooling
#[derive(Debug)]
pub enum ResourceError {
    /// The connection manager has been stopped
    Shutdown {
        /// JNDI name of the stopped manager
        jndi_name: String,
    },
    /// The pool could not supply a connection, even after the configured retries
    Allocation {
        /// JNDI name of the manager that gave up
        jndi_name: String,
        /// Total number of attempts made against the pool
        attempts: u32,
        /// The failure observed on the final attempt
        source: Box<ResourceError>,
    },
    /// The caller's connection factory is not the one backing the pool
    FactoryMismatch {
        /// JNDI name of the manager
        jndi_name: String,
        /// Identity of the factory the pool was built with
        expected: String,
        /// Identity presented by the caller
        actual: String,
    },
    /// The managed connection refused to hand out a connection handle
    HandleCreation {
        /// Description of the listener that was being used
        listener: String,
        /// The underlying failure
        source: Box<ResourceError>,
    },
    /// A listener lifecycle hook (reconnect, tidy-up) failed
    ListenerHook {
        /// Hook that failed
        hook: String,
        /// Description of the listener
        listener: String,
        /// The underlying failure
        source: Box<ResourceError>,
    },
    /// Timeout errors
    Timeout {
        /// Operation that timed out
        operation: String,
        /// Timeout duration in milliseconds
        timeout_ms: u64,
    },
    /// The pool has been shut down
    PoolClosed {
        /// Name of the pool
        pool: String,
    },
    /// Failure reported by the physical resource
    Connection {
        /// User-friendly error message
        message: String,
        /// The adapter error, if any
        source: Option<AdapterError>,
        /// Whether this is a recoverable error
        recoverable: bool,
    },
    /// Validation errors
    Validation {
        /// The validation error message
        message: String,
        /// The invalid value that caused the error
        invalid_value: Option<String>,
    },
    /// Configuration errors
    Configuration {
        /// Configuration parameter that is invalid
        parameter: String,
        /// Error message
        message: String,
    },
    /// General I/O errors
    Io {
        /// The underlying I/O error
        source: std::io::Error,
        /// Context about the I/O operation
        context: String,
    },
    /// Internal errors
    Internal {
        /// Error message
        message: String,
        /// Internal error details (for logging only)
        details: Option<String>,
    },
}

impl ResourceError {
    /// Create a new shutdown error
    pub fn shutdown(jndi_name: &str) -> Self {
        warn!("Connection manager '{}' is shut down", jndi_name);

        Self::Shutdown {
            jndi_name: jndi_name.to_string(),
        }
    }

    /// Create a new allocation error wrapping the last observed failure
    pub fn allocation(jndi_name: &str, attempts: u32, source: ResourceError) -> Self {
        error!(
            "Unable to get managed connection for {} after {} attempt(s): {}",
            jndi_name, attempts, source
        );

        Self::Allocation {
            jndi_name: jndi_name.to_string(),
            attempts,
            source: Box::new(source),
        }
    }

    /// Create a new factory mismatch error
    pub fn factory_mismatch(jndi_name: &str, expected: String, actual: String) -> Self {
        error!(
            "Wrong connection factory for {}: pool uses '{}', caller presented '{}'",
            jndi_name, expected, actual
        );

        Self::FactoryMismatch {
            jndi_name: jndi_name.to_string(),
            expected,
            actual,
        }
    }

    /// Create a new handle creation error
    pub fn handle_creation(listener: String, source: ResourceError) -> Self {
        error!("Failed to obtain connection handle from {}: {}", listener, source);

        Self::HandleCreation {
            listener,
            source: Box::new(source),
        }
    }

    /// Create a new listener hook error
    pub fn listener_hook(hook: &str, listener: String, source: ResourceError) -> Self {
        warn!("Listener hook '{}' failed for {}: {}", hook, listener, source);

        Self::ListenerHook {
            hook: hook.to_string(),
            listener,
            source: Box::new(source),
        }
    }

    /// Create a new timeout error
    pub fn timeout_error(operation: String, timeout_ms: u64) -> Self {
        warn!("Operation timed out: {} after {}ms", operation, timeout_ms);

        Self::Timeout {
            operation,
            timeout_ms,
        }
    }

    /// Create a new pool closed error
    pub fn pool_closed(pool: &str) -> Self {
        warn!("Pool '{}' is closed", pool);

        Self::PoolClosed {
            pool: pool.to_string(),
        }
    }

    /// Create a new connection error from an adapter failure
    pub fn connection_error(message: String, source: Option<AdapterError>, recoverable: bool) -> Self {
        error!(
            "Connection error: {} | Source: {:?} (recoverable: {})",
            message, source, recoverable
        );

        Self::Connection {
            message,
            source,
            recoverable,
        }
    }

    /// Create a new validation error
    pub fn validation_error(message: String, invalid_value: Option<String>) -> Self {
        warn!("Validation error: {} | Invalid value: {:?}", message, invalid_value);

        Self::Validation {
            message,
            invalid_value,
        }
    }

    /// Create a new configuration error
    pub fn configuration_error(parameter: String, message: String) -> Self {
        error!("Configuration error for '{}': {}", parameter, message);

        Self::Configuration { parameter, message }
    }

    /// Create a new I/O error
    pub fn io_error(source: std::io::Error, context: String) -> Self {
        error!("I/O error in {}: {}", context, source);

        Self::Io { source, context }
    }

    /// Create a new internal error
    pub fn internal_error(message: String, details: Option<String>) -> Self {
        error!("Internal error: {} | Details: {:?}", message, details);

        Self::Internal { message, details }
    }

    /// Check if this error is recoverable
    pub fn is_recoverable(&self) -> bool {
        match self {
            ResourceError::Shutdown { .. } => false,
            ResourceError::Allocation { source, .. } => source.is_recoverable(),
            ResourceError::FactoryMismatch { .. } => false, // Caller must use the right factory
            ResourceError::HandleCreation { source, .. } => source.is_recoverable(),
            ResourceError::ListenerHook { .. } => false,
            ResourceError::Timeout { .. } => true, // Capacity may be freed later
            ResourceError::PoolClosed { .. } => false,
            ResourceError::Connection { recoverable, .. } => *recoverable,
            ResourceError::Validation { .. } => false,
            ResourceError::Configuration { .. } => false,
            ResourceError::Io { .. } => true,
            ResourceError::Internal { .. } => false,
        }
    }

    /// Follow the chain of wrapped resource errors down to the deepest one
    pub fn root_cause(&self) -> &ResourceError {
        match self {
            ResourceError::Allocation { source, .. }
            | ResourceError::HandleCreation { source, .. }
            | ResourceError::ListenerHook { source, .. } => source.root_cause(),
            other => other,
        }
    }

    /// Get a user-friendly error message
    pub fn user_message(&self) -> String {
        match self {
            ResourceError::Shutdown { jndi_name } => {
                format!("The connection manager for {} is shut down", jndi_name)
            }
            ResourceError::Allocation { jndi_name, source, .. } => {
                format!("Unable to get managed connection for {}: {}", jndi_name, source.user_message())
            }
            ResourceError::FactoryMismatch { jndi_name, .. } => {
                format!("Wrong managed connection factory for {}", jndi_name)
            }
            ResourceError::HandleCreation { source, .. } => {
                format!("Unable to obtain a connection handle: {}", source.user_message())
            }
            ResourceError::ListenerHook { hook, source, .. } => {
                format!("Connection hook '{}' failed: {}", hook, source.user_message())
            }
            ResourceError::Timeout { operation, timeout_ms } => {
                format!("Operation '{}' timed out after {}ms", operation, timeout_ms)
            }
            ResourceError::PoolClosed { pool } => format!("Pool '{}' is closed", pool),
            ResourceError::Connection { message, .. } => message.clone(),
            ResourceError::Validation { message, .. } => message.clone(),
            ResourceError::Configuration { parameter, message } => {
                format!("Configuration error for '{}': {}", parameter, message)
            }
            ResourceError::Io { context, .. } => format!("I/O error during {}", context),
            ResourceError::Internal { message, .. } => message.clone(),
        }
    }

    /// Get detailed error information for logging
    pub fn detailed_message(&self) -> String {
        match self {
            ResourceError::Shutdown { jndi_name } => format!("Shutdown: {}", jndi_name),
            ResourceError::Allocation { jndi_name, attempts, source } => {
                format!(
                    "Allocation error: {} | Attempts: {} | Last failure: {}",
                    jndi_name,
                    attempts,
                    source.detailed_message()
                )
            }
            ResourceError::FactoryMismatch { jndi_name, expected, actual } => {
                format!(
                    "Factory mismatch for {} | Expected: {} | Actual: {}",
                    jndi_name, expected, actual
                )
            }
            ResourceError::HandleCreation { listener, source } => {
                format!("Handle creation error: {} | Source: {}", listener, source.detailed_message())
            }
            ResourceError::ListenerHook { hook, listener, source } => {
                format!(
                    "Listener hook '{}' error: {} | Source: {}",
                    hook,
                    listener,
                    source.detailed_message()
                )
            }
            ResourceError::Timeout { operation, timeout_ms } => {
                format!("Timeout: {} after {}ms", operation, timeout_ms)
            }
            ResourceError::PoolClosed { pool } => format!("Pool closed: {}", pool),
            ResourceError::Connection { message, source, recoverable } => {
                format!(
                    "Connection error: {} | Recoverable: {} | Source: {:?}",
                    message, recoverable, source
                )
            }
            ResourceError::Validation { message, invalid_value } => {
                format!("Validation error: {} | Invalid value: {:?}", message, invalid_value)
            }
            ResourceError::Configuration { parameter, message } => {
                format!("Configuration error for '{}': {}", parameter, message)
            }
            ResourceError::Io { source, context } => format!("I/O error in {}: {}", context, source),
            ResourceError::Internal { message, details } => {
                format!("Internal error: {} | Details: {:?}", message, details)
            }
        }
    }
}

impl fmt::Display for ResourceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.user_message())
    }
}

impl std::error::Error for ResourceError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ResourceError::Allocation { source, .. } => Some(source.as_ref()),
            ResourceError::HandleCreation { source, .. } => Some(source.as_ref()),
            ResourceError::ListenerHook { source, .. } => Some(source.as_ref()),
            ResourceError::Connection { source, .. } => source
                .as_ref()
                .map(|e| e.as_ref() as &(dyn std::error::Error + 'static)),
            ResourceError::Io { source, .. } => Some(source),
            _ => None,
        }
    }
}

impl From<std::io::Error> for ResourceError {
    fn from(err: std::io::Error) -> Self {
        ResourceError::io_error(err, "unknown context".to_string())
    }
}
