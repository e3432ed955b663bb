//! Connection listener
//!
//! A `ConnectionListener` wraps exactly one managed connection while it lives
//! in a pool. It tracks the caller-visible handles currently bound to the
//! connection, the listener state, the pool permit held while checked out and
//! the last-use / last-validated timestamps the background daemons look at.
//!
//! All mutable listener state sits behind one listener-local lock. The pool
//! back-reference and the manager back-reference are fixed at construction.

use crate::error::{ResourceError, Result};
use crate::manager::BaseConnectionManager;
use crate::pool::PoolRef;
use crate::spi::{ConnectionEventListener, ConnectionHandle, ManagedConnection, TransactionKey};
use parking_lot::Mutex;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::OwnedSemaphorePermit;
use tokio::time::Instant;
use tracing::{debug, warn};

static NEXT_LISTENER_ID: AtomicU64 = AtomicU64::new(1);

/// Lifecycle state of a listener
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenerState {
    /// In service
    Normal,
    /// Must be destroyed instead of recycled on its next return
    Destroy,
    /// Physical connection closed; never returned to service
    Destroyed,
}

/// Kind of transaction a listener is enlisted in
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnlistmentKind {
    Local,
    Xa,
}

/// Transaction enlistment of a listener
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Enlistment {
    pub transaction: TransactionKey,
    pub kind: EnlistmentKind,
}

struct ListenerInner {
    handles: Vec<ConnectionHandle>,
    state: ListenerState,
    permit: Option<OwnedSemaphorePermit>,
    track_by_tx: bool,
    last_use: Instant,
    last_validated: Instant,
    enlistment: Option<Enlistment>,
}

/// Per-connection wrapper tracking handles, state, permit and timestamps
pub struct ConnectionListener {
    id: u64,
    self_ref: Weak<ConnectionListener>,
    managed_connection: Box<dyn ManagedConnection>,
    pool: PoolRef,
    manager: Weak<BaseConnectionManager>,
    inner: Mutex<ListenerInner>,
}

impl ConnectionListener {
    /// Wrap a freshly created managed connection
    ///
    /// The listener registers itself with the managed connection so that
    /// close and error events flow back through it.
    pub fn new(
        managed_connection: Box<dyn ManagedConnection>,
        pool: PoolRef,
        manager: Weak<BaseConnectionManager>,
    ) -> Arc<Self> {
        let now = Instant::now();
        let listener = Arc::new_cyclic(|self_ref| Self {
            id: NEXT_LISTENER_ID.fetch_add(1, Ordering::Relaxed),
            self_ref: self_ref.clone(),
            managed_connection,
            pool,
            manager,
            inner: Mutex::new(ListenerInner {
                handles: Vec::new(),
                state: ListenerState::Normal,
                permit: None,
                track_by_tx: false,
                last_use: now,
                last_validated: now,
                enlistment: None,
            }),
        });

        let weak = Arc::downgrade(&listener);
        let events: Weak<dyn ConnectionEventListener> = weak;
        listener.managed_connection.add_connection_event_listener(events);
        debug!("Created {}", listener);
        listener
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn managed_connection(&self) -> &dyn ManagedConnection {
        self.managed_connection.as_ref()
    }

    /// The pool this listener was created for
    pub fn pool(&self) -> &PoolRef {
        &self.pool
    }

    pub fn state(&self) -> ListenerState {
        self.inner.lock().state
    }

    /// Change the listener state; a destroyed listener stays destroyed
    pub fn set_state(&self, state: ListenerState) {
        let mut inner = self.inner.lock();
        if inner.state == ListenerState::Destroyed && state != ListenerState::Destroyed {
            warn!("Ignoring state change to {:?} for destroyed listener {}", state, self.id);
            return;
        }
        inner.state = state;
    }

    /// Bind a caller-visible handle to this listener
    pub fn register_handle(&self, handle: ConnectionHandle) -> Result<()> {
        let mut inner = self.inner.lock();
        if inner.state == ListenerState::Destroyed {
            return Err(ResourceError::validation_error(
                format!("Cannot register a handle with destroyed listener {}", self.id),
                Some(handle.id().to_string()),
            ));
        }
        inner.handles.push(handle);
        Ok(())
    }

    /// Unbind a handle; returns false when the handle was not registered
    pub fn unregister_handle(&self, handle: &ConnectionHandle) -> bool {
        let mut inner = self.inner.lock();
        match inner.handles.iter().position(|h| h == handle) {
            Some(index) => {
                inner.handles.swap_remove(index);
                true
            }
            None => {
                debug!("Handle {} not registered with listener {}", handle.id(), self.id);
                false
            }
        }
    }

    /// Unbind every handle, returning the ones that were bound
    pub fn unregister_all_handles(&self) -> Vec<ConnectionHandle> {
        std::mem::take(&mut self.inner.lock().handles)
    }

    pub fn handle_count(&self) -> usize {
        self.inner.lock().handles.len()
    }

    /// True iff no caller-visible handle is bound to this listener
    pub fn is_managed_connection_free(&self) -> bool {
        self.inner.lock().handles.is_empty()
    }

    /// Attach the pool permit this listener counts against while checked out
    pub fn grant_permit(&self, permit: OwnedSemaphorePermit) {
        let previous = self.inner.lock().permit.replace(permit);
        if previous.is_some() {
            warn!("Listener {} was granted a second permit; releasing the first", self.id);
        }
    }

    /// Release the pool permit; returns whether one was held
    pub fn revoke_permit(&self) -> bool {
        self.inner.lock().permit.take().is_some()
    }

    pub fn has_permit(&self) -> bool {
        self.inner.lock().permit.is_some()
    }

    pub fn is_track_by_tx(&self) -> bool {
        self.inner.lock().track_by_tx
    }

    pub fn set_track_by_tx(&self, track_by_tx: bool) {
        self.inner.lock().track_by_tx = track_by_tx;
    }

    /// Record that the listener was just used
    pub fn used(&self) {
        self.inner.lock().last_use = Instant::now();
    }

    pub fn last_use(&self) -> Instant {
        self.inner.lock().last_use
    }

    /// Record a successful background validation
    pub fn validated(&self) {
        self.inner.lock().last_validated = Instant::now();
    }

    pub fn last_validated(&self) -> Instant {
        self.inner.lock().last_validated
    }

    pub fn enlistment(&self) -> Option<Enlistment> {
        self.inner.lock().enlistment
    }

    /// Enlist in `transaction`; returns false if already enlisted in it
    pub fn enlist(&self, transaction: TransactionKey, kind: EnlistmentKind) -> bool {
        let mut inner = self.inner.lock();
        match inner.enlistment {
            Some(current) if current.transaction == transaction => false,
            Some(current) => {
                warn!(
                    "Listener {} moved from {} to {} without delisting",
                    self.id, current.transaction, transaction
                );
                inner.enlistment = Some(Enlistment { transaction, kind });
                true
            }
            None => {
                inner.enlistment = Some(Enlistment { transaction, kind });
                true
            }
        }
    }

    pub fn delist(&self) -> Option<Enlistment> {
        let mut inner = self.inner.lock();
        inner.track_by_tx = false;
        inner.enlistment.take()
    }

    /// Delist only if still enlisted in `transaction`
    pub fn delist_from(&self, transaction: TransactionKey) -> Option<Enlistment> {
        let mut inner = self.inner.lock();
        match inner.enlistment {
            Some(current) if current.transaction == transaction => {
                inner.track_by_tx = false;
                inner.enlistment.take()
            }
            _ => None,
        }
    }

    /// Idle tidy-up run before the listener goes back to the pool
    ///
    /// A local transaction still attached at this point was never completed
    /// and is rolled back.
    pub fn tidyup(&self) -> Result<()> {
        let enlistment = self.delist();
        if let Some(Enlistment {
            transaction,
            kind: EnlistmentKind::Local,
        }) = enlistment
        {
            debug!("Rolling back unfinished local transaction {} on listener {}", transaction, self.id);
            self.managed_connection.rollback_local_transaction()?;
        }
        Ok(())
    }

    /// Close the physical connection and retire the listener
    pub fn destroy(&self) -> Result<()> {
        {
            let mut inner = self.inner.lock();
            if inner.state == ListenerState::Destroyed {
                return Ok(());
            }
            inner.state = ListenerState::Destroyed;
            inner.handles.clear();
            inner.permit = None;
            inner.enlistment = None;
        }
        debug!("Destroying listener {}", self.id);
        self.managed_connection.destroy()
    }

    fn arc(&self) -> Option<Arc<ConnectionListener>> {
        self.self_ref.upgrade()
    }
}

impl ConnectionEventListener for ConnectionListener {
    fn connection_closed(&self, handle: &ConnectionHandle) {
        let Some(this) = self.arc() else { return };
        match self.manager.upgrade() {
            Some(manager) => manager.connection_closed(&this, handle),
            None => {
                self.unregister_handle(handle);
                if self.is_managed_connection_free() {
                    if let Some(pool) = self.pool.upgrade() {
                        if let Err(e) = pool.return_connection(&this, false) {
                            warn!("Error returning {} after close: {}", self, e);
                        }
                    }
                }
            }
        }
    }

    fn connection_error_occurred(&self, error: ResourceError) {
        let Some(this) = self.arc() else { return };
        match self.manager.upgrade() {
            Some(manager) => manager.connection_error_occurred(&this, error),
            None => {
                warn!("Connection error on {}: {}", self, error);
                self.unregister_all_handles();
                self.set_state(ListenerState::Destroy);
                if let Some(pool) = self.pool.upgrade() {
                    if let Err(e) = pool.return_connection(&this, true) {
                        warn!("Error destroying {} after connection error: {}", self, e);
                    }
                }
            }
        }
    }
}

impl fmt::Display for ConnectionListener {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.lock();
        write!(
            f,
            "ConnectionListener[{}] pool={} state={:?} handles={} permit={} trackByTx={}",
            self.id,
            self.pool.id(),
            inner.state,
            inner.handles.len(),
            inner.permit.is_some(),
            inner.track_by_tx
        )
    }
}

impl fmt::Debug for ConnectionListener {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}
