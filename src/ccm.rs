//! Cached connection manager
//!
//! Tracks which connection handles were obtained inside which unit of work,
//! so that connection managers can release physical connections when a unit
//! of work is left and reattach them when it is entered again.

use crate::error::{ResourceError, Result};
use crate::listener::ConnectionListener;
use crate::spi::{ConnectionHandle, ConnectionRequestInfo};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, trace, warn};

/// One handle a caller holds, with the listener currently backing it
#[derive(Clone)]
pub struct ConnectionRecord {
    pub listener: Option<Arc<ConnectionListener>>,
    pub handle: ConnectionHandle,
    pub criteria: Option<ConnectionRequestInfo>,
}

impl ConnectionRecord {
    pub fn new(
        listener: Option<Arc<ConnectionListener>>,
        handle: ConnectionHandle,
        criteria: Option<ConnectionRequestInfo>,
    ) -> Self {
        Self {
            listener,
            handle,
            criteria,
        }
    }
}

impl fmt::Debug for ConnectionRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionRecord")
            .field("listener", &self.listener.as_ref().map(|l| l.id()))
            .field("handle", &self.handle)
            .field("criteria", &self.criteria)
            .finish()
    }
}

/// Identity of the object owning a unit of work (e.g. a component instance)
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MetaAwareKey(pub String);

impl fmt::Display for MetaAwareKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Callbacks a connection manager receives at unit-of-work boundaries
#[async_trait]
pub trait ConnectionCacheListener: Send + Sync {
    fn jndi_name(&self) -> &str;

    /// Re-attach physical connections to records entering a unit of work
    async fn reconnect(
        &self,
        records: &mut [ConnectionRecord],
        unshareable: &HashSet<String>,
    ) -> Result<()>;

    /// Release physical connections of records leaving a unit of work
    fn disconnect(&self, records: &mut [ConnectionRecord], unshareable: &HashSet<String>) -> Result<()>;
}

/// Association tracking consumed by the connection manager
#[async_trait]
pub trait CachedConnectionManager: Send + Sync {
    fn register_connection(
        &self,
        manager: Arc<dyn ConnectionCacheListener>,
        listener: &Arc<ConnectionListener>,
        handle: &ConnectionHandle,
        criteria: Option<ConnectionRequestInfo>,
    );

    fn unregister_connection(&self, manager: &dyn ConnectionCacheListener, handle: &ConnectionHandle);

    /// Enter the unit of work owned by `key`
    async fn push_meta_aware_object(&self, key: MetaAwareKey, unshareable: HashSet<String>) -> Result<()>;

    /// Leave the innermost unit of work
    fn pop_meta_aware_object(&self, unshareable: &HashSet<String>) -> Result<()>;
}

struct ManagerRecords {
    manager: Arc<dyn ConnectionCacheListener>,
    records: Vec<ConnectionRecord>,
}

type RecordsByManager = HashMap<String, ManagerRecords>;

struct Frame {
    key: MetaAwareKey,
    managers: RecordsByManager,
}

/// In-memory cached connection manager
///
/// Keeps a stack of unit-of-work frames. Use one instance per logical
/// caller context; frames are not shared between concurrent callers.
#[derive(Default)]
pub struct ConnectionCache {
    frames: Mutex<Vec<Frame>>,
    parked: Mutex<HashMap<MetaAwareKey, RecordsByManager>>,
}

impl ConnectionCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of active unit-of-work frames
    pub fn depth(&self) -> usize {
        self.frames.lock().len()
    }

    /// Records registered in the innermost frame
    pub fn current_records(&self) -> Vec<ConnectionRecord> {
        self.frames
            .lock()
            .last()
            .map(|frame| {
                frame
                    .managers
                    .values()
                    .flat_map(|m| m.records.iter().cloned())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Records parked for `key` while its unit of work is inactive
    pub fn parked_records(&self, key: &MetaAwareKey) -> Vec<ConnectionRecord> {
        self.parked
            .lock()
            .get(key)
            .map(|managers| {
                managers
                    .values()
                    .flat_map(|m| m.records.iter().cloned())
                    .collect()
            })
            .unwrap_or_default()
    }
}

fn remove_record(managers: &mut RecordsByManager, jndi_name: &str, handle: &ConnectionHandle) -> bool {
    let Some(entry) = managers.get_mut(jndi_name) else {
        return false;
    };
    let Some(index) = entry.records.iter().position(|r| &r.handle == handle) else {
        return false;
    };
    entry.records.swap_remove(index);
    if entry.records.is_empty() {
        managers.remove(jndi_name);
    }
    true
}

#[async_trait]
impl CachedConnectionManager for ConnectionCache {
    fn register_connection(
        &self,
        manager: Arc<dyn ConnectionCacheListener>,
        listener: &Arc<ConnectionListener>,
        handle: &ConnectionHandle,
        criteria: Option<ConnectionRequestInfo>,
    ) {
        let mut frames = self.frames.lock();
        let Some(frame) = frames.last_mut() else {
            debug!("No active unit of work; not tracking handle {}", handle.id());
            return;
        };
        let name = manager.jndi_name().to_string();
        frame
            .managers
            .entry(name)
            .or_insert_with(|| ManagerRecords {
                manager,
                records: Vec::new(),
            })
            .records
            .push(ConnectionRecord::new(Some(listener.clone()), handle.clone(), criteria));
        trace!("Tracking handle {} under {}", handle.id(), frame.key);
    }

    fn unregister_connection(&self, manager: &dyn ConnectionCacheListener, handle: &ConnectionHandle) {
        let jndi_name = manager.jndi_name();
        {
            let mut frames = self.frames.lock();
            if frames
                .iter_mut()
                .rev()
                .any(|frame| remove_record(&mut frame.managers, jndi_name, handle))
            {
                return;
            }
        }
        let mut parked = self.parked.lock();
        if parked
            .values_mut()
            .any(|managers| remove_record(managers, jndi_name, handle))
        {
            return;
        }
        trace!("Handle {} was not tracked for {}", handle.id(), jndi_name);
    }

    async fn push_meta_aware_object(&self, key: MetaAwareKey, unshareable: HashSet<String>) -> Result<()> {
        let mut managers = self.parked.lock().remove(&key).unwrap_or_default();

        let mut first_error = None;
        for entry in managers.values_mut() {
            if let Err(e) = entry.manager.reconnect(&mut entry.records, &unshareable).await {
                warn!("Unable to reconnect {} for {}: {}", entry.manager.jndi_name(), key, e);
                first_error.get_or_insert(e);
            }
        }

        self.frames.lock().push(Frame { key, managers });
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    fn pop_meta_aware_object(&self, unshareable: &HashSet<String>) -> Result<()> {
        let frame = self.frames.lock().pop().ok_or_else(|| {
            ResourceError::internal_error(
                "Unit of work ended without a matching start".to_string(),
                None,
            )
        })?;
        let Frame { key, mut managers } = frame;

        for entry in managers.values_mut() {
            if let Err(e) = entry.manager.disconnect(&mut entry.records, unshareable) {
                warn!("Unable to disconnect {} for {}: {}", entry.manager.jndi_name(), key, e);
            }
        }

        managers.retain(|_, entry| !entry.records.is_empty());
        if !managers.is_empty() {
            self.parked.lock().insert(key, managers);
        }
        Ok(())
    }
}
