//! Transaction support policies
//!
//! The connection manager delegates everything that depends on the
//! deployment's transaction support level to a `TransactionPolicy`:
//! - `NoTxPolicy` for resources used without transactions
//! - `LocalTxPolicy` for resource-local transactions
//! - `XaTxPolicy` for externally coordinated transactions
//!
//! The transactional policies learn about the caller's transaction from a
//! `TransactionSource` supplied by the host.

use crate::error::Result;
use crate::listener::{ConnectionListener, Enlistment, EnlistmentKind, ListenerState};
use crate::manager::BaseConnectionManager;
use crate::spi::{TransactionKey, TransactionOutcome};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, trace, warn};

/// Hooks the manager calls around a listener's association with callers
pub trait TransactionPolicy: Send + Sync {
    fn name(&self) -> &'static str;

    /// Transaction of the calling context, if any
    fn current_transaction(&self) -> Option<TransactionKey>;

    /// Listener already serving `transaction`, when connections are tracked by transaction
    fn tracked_listener(&self, transaction: TransactionKey) -> Option<Arc<ConnectionListener>>;

    /// Called once for each listener freshly obtained from the pool, before first use
    fn managed_connection_reconnected(
        &self,
        manager: &BaseConnectionManager,
        listener: &Arc<ConnectionListener>,
    ) -> Result<()>;

    /// Called when a listener lost its association with a caller
    fn managed_connection_disconnected(
        &self,
        manager: &BaseConnectionManager,
        listener: &Arc<ConnectionListener>,
    ) -> Result<()>;

    /// Called by the host when `transaction` committed or rolled back
    fn transaction_completed(
        &self,
        manager: &BaseConnectionManager,
        transaction: TransactionKey,
        outcome: TransactionOutcome,
    );
}

/// Reports the caller's transaction to the transactional policies
pub trait TransactionSource: Send + Sync {
    fn current_transaction(&self) -> Option<TransactionKey>;

    fn is_active(&self, transaction: TransactionKey) -> bool;
}

/// Policy for resources used without transactions
#[derive(Debug, Default)]
pub struct NoTxPolicy;

impl TransactionPolicy for NoTxPolicy {
    fn name(&self) -> &'static str {
        "none"
    }

    fn current_transaction(&self) -> Option<TransactionKey> {
        None
    }

    fn tracked_listener(&self, _transaction: TransactionKey) -> Option<Arc<ConnectionListener>> {
        None
    }

    fn managed_connection_reconnected(
        &self,
        _manager: &BaseConnectionManager,
        _listener: &Arc<ConnectionListener>,
    ) -> Result<()> {
        Ok(())
    }

    fn managed_connection_disconnected(
        &self,
        manager: &BaseConnectionManager,
        listener: &Arc<ConnectionListener>,
    ) -> Result<()> {
        if listener.is_managed_connection_free() {
            manager.return_managed_connection(listener, false);
        }
        Ok(())
    }

    fn transaction_completed(
        &self,
        _manager: &BaseConnectionManager,
        _transaction: TransactionKey,
        _outcome: TransactionOutcome,
    ) {
    }
}

/// Listeners enlisted per transaction
///
/// Entries are removed when the host reports completion. Entries for
/// transactions the host never reports are pruned once their listeners are
/// destroyed or have moved on.
struct Enlistments {
    kind: EnlistmentKind,
    source: Arc<dyn TransactionSource>,
    track_by_tx: bool,
    enlisted: Mutex<HashMap<TransactionKey, Vec<Arc<ConnectionListener>>>>,
}

impl Enlistments {
    fn new(kind: EnlistmentKind, source: Arc<dyn TransactionSource>, track_by_tx: bool) -> Self {
        Self {
            kind,
            source,
            track_by_tx,
            enlisted: Mutex::new(HashMap::new()),
        }
    }

    fn tracked_listener(&self, transaction: TransactionKey) -> Option<Arc<ConnectionListener>> {
        if !self.track_by_tx {
            return None;
        }
        let mut enlisted = self.enlisted.lock();
        prune(&mut enlisted);
        enlisted.get(&transaction).and_then(|listeners| {
            listeners
                .iter()
                .find(|l| l.is_track_by_tx() && l.state() == ListenerState::Normal)
                .cloned()
        })
    }

    /// Enlist `listener` in the current transaction, running `begin` first
    fn reconnected(
        &self,
        listener: &Arc<ConnectionListener>,
        begin: impl FnOnce(&ConnectionListener) -> Result<()>,
    ) -> Result<()> {
        let Some(transaction) = self.source.current_transaction() else {
            return Ok(());
        };
        if !self.source.is_active(transaction) {
            trace!("{} is no longer active; not enlisting {}", transaction, listener);
            return Ok(());
        }
        if listener.enlistment().map(|e| e.transaction) == Some(transaction) {
            return Ok(());
        }

        begin(listener)?;
        listener.enlist(transaction, self.kind);
        if self.track_by_tx {
            listener.set_track_by_tx(true);
        }
        let mut enlisted = self.enlisted.lock();
        prune(&mut enlisted);
        enlisted.entry(transaction).or_default().push(listener.clone());
        debug!("Enlisted {} in {}", listener, transaction);
        Ok(())
    }

    fn disconnected(&self, manager: &BaseConnectionManager, listener: &Arc<ConnectionListener>) {
        if let Some(enlistment) = listener.enlistment() {
            if self.source.is_active(enlistment.transaction) {
                trace!("Keeping {} until {} completes", listener, enlistment.transaction);
                return;
            }
        }
        if listener.is_managed_connection_free() {
            manager.return_managed_connection(listener, false);
        }
    }

    fn transaction_completed(
        &self,
        manager: &BaseConnectionManager,
        transaction: TransactionKey,
        outcome: TransactionOutcome,
    ) {
        let listeners = self.enlisted.lock().remove(&transaction).unwrap_or_default();
        let mut seen = HashSet::new();
        for listener in listeners {
            if !seen.insert(listener.id()) {
                continue;
            }
            // Tidy-up may already have ended the enlistment and recycled the listener
            let Some(enlistment) = listener.delist_from(transaction) else {
                continue;
            };
            let kill = match end_local_transaction(&listener, enlistment, outcome) {
                Ok(()) => false,
                Err(e) => {
                    warn!("Unable to end {} on {}, destroying it: {}", transaction, listener, e);
                    true
                }
            };
            if kill && !listener.is_managed_connection_free() {
                // Destroyed once the last handle closes
                listener.set_state(ListenerState::Destroy);
                continue;
            }
            // Only listeners still checked out hold a permit
            if listener.has_permit() && listener.is_managed_connection_free() {
                manager.return_managed_connection(&listener, kill);
            }
        }
        debug!("{} {}", transaction, outcome);
    }

    fn tracked_transactions(&self) -> usize {
        let mut enlisted = self.enlisted.lock();
        prune(&mut enlisted);
        enlisted.len()
    }
}

fn prune(enlisted: &mut HashMap<TransactionKey, Vec<Arc<ConnectionListener>>>) {
    enlisted.retain(|transaction, listeners| {
        listeners.retain(|l| {
            l.state() != ListenerState::Destroyed
                && l.enlistment().map(|e| e.transaction) == Some(*transaction)
        });
        !listeners.is_empty()
    });
}

/// Commit or roll back the local transaction `enlistment` stands for
fn end_local_transaction(
    listener: &ConnectionListener,
    enlistment: Enlistment,
    outcome: TransactionOutcome,
) -> Result<()> {
    if enlistment.kind != EnlistmentKind::Local {
        return Ok(());
    }
    let connection = listener.managed_connection();
    match outcome {
        TransactionOutcome::Committed => connection.commit_local_transaction(),
        TransactionOutcome::RolledBack => connection.rollback_local_transaction(),
    }
}

/// Policy for resource-local transactions
pub struct LocalTxPolicy {
    enlistments: Enlistments,
}

impl LocalTxPolicy {
    pub fn new(source: Arc<dyn TransactionSource>, track_by_tx: bool) -> Self {
        Self {
            enlistments: Enlistments::new(EnlistmentKind::Local, source, track_by_tx),
        }
    }

    /// Transactions with at least one live enlisted listener
    pub fn tracked_transactions(&self) -> usize {
        self.enlistments.tracked_transactions()
    }
}

impl TransactionPolicy for LocalTxPolicy {
    fn name(&self) -> &'static str {
        "local"
    }

    fn current_transaction(&self) -> Option<TransactionKey> {
        self.enlistments.source.current_transaction()
    }

    fn tracked_listener(&self, transaction: TransactionKey) -> Option<Arc<ConnectionListener>> {
        self.enlistments.tracked_listener(transaction)
    }

    fn managed_connection_reconnected(
        &self,
        _manager: &BaseConnectionManager,
        listener: &Arc<ConnectionListener>,
    ) -> Result<()> {
        self.enlistments
            .reconnected(listener, |l| l.managed_connection().begin_local_transaction())
    }

    fn managed_connection_disconnected(
        &self,
        manager: &BaseConnectionManager,
        listener: &Arc<ConnectionListener>,
    ) -> Result<()> {
        self.enlistments.disconnected(manager, listener);
        Ok(())
    }

    fn transaction_completed(
        &self,
        manager: &BaseConnectionManager,
        transaction: TransactionKey,
        outcome: TransactionOutcome,
    ) {
        self.enlistments.transaction_completed(manager, transaction, outcome);
    }
}

/// Policy for externally coordinated transactions
pub struct XaTxPolicy {
    enlistments: Enlistments,
}

impl XaTxPolicy {
    pub fn new(source: Arc<dyn TransactionSource>, track_by_tx: bool) -> Self {
        Self {
            enlistments: Enlistments::new(EnlistmentKind::Xa, source, track_by_tx),
        }
    }

    /// Transactions with at least one live enlisted listener
    pub fn tracked_transactions(&self) -> usize {
        self.enlistments.tracked_transactions()
    }
}

impl TransactionPolicy for XaTxPolicy {
    fn name(&self) -> &'static str {
        "xa"
    }

    fn current_transaction(&self) -> Option<TransactionKey> {
        self.enlistments.source.current_transaction()
    }

    fn tracked_listener(&self, transaction: TransactionKey) -> Option<Arc<ConnectionListener>> {
        self.enlistments.tracked_listener(transaction)
    }

    fn managed_connection_reconnected(
        &self,
        _manager: &BaseConnectionManager,
        listener: &Arc<ConnectionListener>,
    ) -> Result<()> {
        self.enlistments.reconnected(listener, |_| Ok(()))
    }

    fn managed_connection_disconnected(
        &self,
        manager: &BaseConnectionManager,
        listener: &Arc<ConnectionListener>,
    ) -> Result<()> {
        self.enlistments.disconnected(manager, listener);
        Ok(())
    }

    fn transaction_completed(
        &self,
        manager: &BaseConnectionManager,
        transaction: TransactionKey,
        outcome: TransactionOutcome,
    ) {
        self.enlistments.transaction_completed(manager, transaction, outcome);
    }
}

/// Transaction source driven explicitly by the host
///
/// One transaction at a time is current; `begin` makes a new one current
/// and `complete` ends it.
#[derive(Default)]
pub struct ManualTransactionSource {
    next: AtomicU64,
    current: Mutex<Option<TransactionKey>>,
    active: Mutex<HashSet<TransactionKey>>,
}

impl ManualTransactionSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn begin(&self) -> TransactionKey {
        let key = TransactionKey(self.next.fetch_add(1, Ordering::Relaxed) + 1);
        self.active.lock().insert(key);
        *self.current.lock() = Some(key);
        key
    }

    /// End `transaction`; it stops being current if it was
    pub fn complete(&self, transaction: TransactionKey) {
        self.active.lock().remove(&transaction);
        let mut current = self.current.lock();
        if *current == Some(transaction) {
            *current = None;
        }
    }

    /// Make `transaction` current without changing whether it is active
    pub fn resume(&self, transaction: Option<TransactionKey>) {
        *self.current.lock() = transaction;
    }
}

impl TransactionSource for ManualTransactionSource {
    fn current_transaction(&self) -> Option<TransactionKey> {
        *self.current.lock()
    }

    fn is_active(&self, transaction: TransactionKey) -> bool {
        self.active.lock().contains(&transaction)
    }
}
