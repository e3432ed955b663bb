//! Background pool sweeping
//!
//! The idle remover and the connection validator share one mechanism: a
//! registration list of pools, a shared wake interval derived from what
//! each pool asked for, and a single background task that periodically runs
//! a payload operation against every registered pool.
//!
//! `SweepSchedule` holds the bookkeeping and is plain synchronous data.
//! `PoolSweeper` owns a schedule behind an async mutex and drives the
//! background task; a sweep and a registration change never interleave.

use crate::error::Result;
use crate::idle_remover::IdleRemover;
use crate::pool::ManagedConnectionPool;
use crate::spi::PoolId;
use crate::validator::ConnectionValidator;
use futures::future::BoxFuture;
use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, Notify};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, trace, warn, Instrument, Span};

/// Smallest interval a sweeper will run at
pub const MIN_SWEEP_INTERVAL: Duration = Duration::from_millis(1);

/// Operation a sweeper runs against each registered pool
pub type SweepPayload = fn(Arc<dyn ManagedConnectionPool>) -> BoxFuture<'static, Result<()>>;

struct Registration {
    pool: Arc<dyn ManagedConnectionPool>,
    requested: Duration,
}

/// Registered pools plus the shared wake interval and next wake time
///
/// The interval is the minimum over registered pools of half the interval
/// each one requested. `None` means "never wake".
#[derive(Default)]
pub struct SweepSchedule {
    registrations: Vec<Registration>,
    interval: Option<Duration>,
    next: Option<Instant>,
}

fn half_interval(requested: Duration) -> Duration {
    (requested / 2).max(MIN_SWEEP_INTERVAL)
}

impl SweepSchedule {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `pool` unless already present
    ///
    /// Returns true when the next wake time moved earlier and a sleeping
    /// worker has to be woken to pick it up.
    pub fn register(
        &mut self,
        pool: Arc<dyn ManagedConnectionPool>,
        requested: Duration,
        now: Instant,
    ) -> bool {
        let id = pool.pool_id();
        if self.contains(id) {
            debug!("{} is already registered", id);
            return false;
        }
        self.registrations.push(Registration { pool, requested });

        let half = half_interval(requested);
        if self.interval.map_or(true, |current| half < current) {
            self.interval = Some(half);
            if let Some(candidate) = now.checked_add(half) {
                if self.next.map_or(true, |next| candidate < next) {
                    self.next = Some(candidate);
                    return true;
                }
            }
        }
        false
    }

    /// Remove the pool with `pool_id`; returns whether it was registered
    pub fn unregister(&mut self, pool_id: PoolId) -> bool {
        let before = self.registrations.len();
        self.registrations.retain(|r| r.pool.pool_id() != pool_id);
        if self.registrations.len() == before {
            return false;
        }

        self.interval = self
            .registrations
            .iter()
            .map(|r| half_interval(r.requested))
            .min();
        if self.interval.is_none() {
            self.next = None;
        }
        true
    }

    /// Schedule the next wake one interval after `now`
    pub fn reschedule(&mut self, now: Instant) {
        self.next = self.interval.and_then(|interval| now.checked_add(interval));
    }

    pub fn contains(&self, pool_id: PoolId) -> bool {
        self.registrations.iter().any(|r| r.pool.pool_id() == pool_id)
    }

    pub fn interval(&self) -> Option<Duration> {
        self.interval
    }

    pub fn next_wake(&self) -> Option<Instant> {
        self.next
    }

    pub fn len(&self) -> usize {
        self.registrations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.registrations.is_empty()
    }

    /// Snapshot of the registered pools in registration order
    pub fn pools(&self) -> Vec<Arc<dyn ManagedConnectionPool>> {
        self.registrations.iter().map(|r| r.pool.clone()).collect()
    }
}

/// Background task running a payload over a set of registered pools
pub struct PoolSweeper {
    name: &'static str,
    schedule: Arc<Mutex<SweepSchedule>>,
    wake: Arc<Notify>,
    cancel: CancellationToken,
    payload: SweepPayload,
    span: Span,
    worker: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

impl PoolSweeper {
    /// Spawn the worker; must be called from within a tokio runtime
    ///
    /// The worker runs inside a span derived from the one current here, not
    /// from whichever task later registers a pool.
    pub fn start(name: &'static str, payload: SweepPayload) -> Self {
        let span = info_span!(parent: &Span::current(), "pool_sweeper", daemon = name);
        let schedule = Arc::new(Mutex::new(SweepSchedule::new()));
        let wake = Arc::new(Notify::new());
        let cancel = CancellationToken::new();

        let worker = tokio::spawn(
            run_worker(name, schedule.clone(), wake.clone(), cancel.clone(), payload)
                .instrument(span.clone()),
        );
        info!("Started {} background task", name);

        Self {
            name,
            schedule,
            wake,
            cancel,
            payload,
            span,
            worker: parking_lot::Mutex::new(Some(worker)),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub async fn register(&self, pool: Arc<dyn ManagedConnectionPool>, requested: Duration) {
        let id = pool.pool_id();
        let wake = self.schedule.lock().await.register(pool, requested, Instant::now());
        debug!("{} registered {} (requested {:?})", self.name, id, requested);
        if wake {
            self.wake.notify_one();
        }
    }

    pub async fn unregister(&self, pool_id: PoolId) {
        if self.schedule.lock().await.unregister(pool_id) {
            debug!("{} unregistered {}", self.name, pool_id);
        }
    }

    /// Current shared interval; `None` when no pool is registered
    pub async fn interval(&self) -> Option<Duration> {
        self.schedule.lock().await.interval()
    }

    pub async fn next_wake(&self) -> Option<Instant> {
        self.schedule.lock().await.next_wake()
    }

    pub async fn registered_pools(&self) -> usize {
        self.schedule.lock().await.len()
    }

    /// Run one sweep immediately in the caller's task
    pub async fn sweep_now(&self) {
        let schedule = self.schedule.lock().await;
        sweep(self.name, &schedule, self.payload)
            .instrument(self.span.clone())
            .await;
    }

    /// Stop the worker; a stopped sweeper never restarts
    pub fn stop(&self) {
        if !self.cancel.is_cancelled() {
            info!("Stopping {} background task", self.name);
            self.cancel.cancel();
        }
    }

    pub fn is_stopped(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Stop the worker and wait for it to exit
    pub async fn shutdown(&self) {
        self.stop();
        let worker = self.worker.lock().take();
        if let Some(worker) = worker {
            if let Err(e) = worker.await {
                warn!("{} background task ended abnormally: {}", self.name, e);
            }
        }
    }
}

impl Drop for PoolSweeper {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn run_worker(
    name: &'static str,
    schedule: Arc<Mutex<SweepSchedule>>,
    wake: Arc<Notify>,
    cancel: CancellationToken,
    payload: SweepPayload,
) {
    loop {
        let next = schedule.lock().await.next_wake();
        let sleep = async {
            match next {
                Some(at) => tokio::time::sleep_until(at).await,
                None => std::future::pending::<()>().await,
            }
        };

        tokio::select! {
            () = cancel.cancelled() => break,
            () = wake.notified() => {
                trace!("{} woken by a registration change", name);
                continue;
            }
            () = sleep => {}
        }

        let mut guard = schedule.lock().await;
        match guard.next_wake() {
            Some(at) if Instant::now() >= at => {}
            _ => continue,
        }
        sweep(name, &guard, payload).await;
        guard.reschedule(Instant::now());
    }
    info!("{} background task stopped", name);
}

/// Run `payload` against every registered pool; one pool failing never
/// stops the others from being swept
async fn sweep(name: &'static str, schedule: &SweepSchedule, payload: SweepPayload) {
    let pools = schedule.pools();
    trace!("{} sweeping {} pools", name, pools.len());
    for pool in pools {
        let id = pool.pool_id();
        match AssertUnwindSafe(payload(pool)).catch_unwind().await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!("{} failed on {}: {}", name, id, e),
            Err(_) => error!("{} panicked while sweeping {}", name, id),
        }
    }
}

/// The two background daemons every pool registers with
///
/// Constructed once by the host and handed to each pool.
#[derive(Clone)]
pub struct BackgroundDaemons {
    pub idle_remover: Arc<IdleRemover>,
    pub validator: Arc<ConnectionValidator>,
}

impl BackgroundDaemons {
    pub fn start() -> Self {
        Self {
            idle_remover: Arc::new(IdleRemover::start()),
            validator: Arc::new(ConnectionValidator::start()),
        }
    }

    pub async fn shutdown(&self) {
        self.idle_remover.sweeper().shutdown().await;
        self.validator.sweeper().shutdown().await;
    }
}
