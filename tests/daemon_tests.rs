//! Background daemon tests
//!
//! Runs the idle remover and the connection validator on paused time and
//! checks the shared interval, wake-ups, failure isolation and shutdown.

mod common;

use common::*;
use connector_pool::{
    BackgroundDaemons, ConnectionValidator, IdleRemover, InternalManagedConnectionPool,
    ManagedConnectionPool, PoolConfig,
};
use parking_lot::Mutex;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;

const STEP: Duration = Duration::from_millis(10);

fn sweep_log() -> Arc<Mutex<Vec<&'static str>>> {
    Arc::new(Mutex::new(Vec::new()))
}

#[tokio::test(flavor = "current_thread", start_paused = true)]
async fn test_interval_is_half_the_shortest_request() {
    let _ = tracing_subscriber::fmt::try_init();

    let remover = IdleRemover::start();
    let log = sweep_log();
    let slow = RecordingPool::new("slow", SweepOutcome::Succeed, log.clone());
    let fast = RecordingPool::new("fast", SweepOutcome::Succeed, log.clone());

    remover.register_pool(slow.clone(), Duration::from_millis(8000)).await;
    assert_eq!(remover.sweeper().interval().await, Some(Duration::from_millis(4000)));
    remover.register_pool(fast.clone(), Duration::from_millis(4000)).await;
    assert_eq!(remover.sweeper().interval().await, Some(Duration::from_millis(2000)));

    advance_stepwise(Duration::from_millis(1900), STEP).await;
    assert_eq!(fast.idle_sweeps.load(Ordering::SeqCst), 0);

    advance_stepwise(Duration::from_millis(100), STEP).await;
    assert_eq!(fast.idle_sweeps.load(Ordering::SeqCst), 1);
    assert_eq!(slow.idle_sweeps.load(Ordering::SeqCst), 1, "every pool is swept on each wake");

    advance_stepwise(Duration::from_millis(2000), STEP).await;
    assert_eq!(fast.idle_sweeps.load(Ordering::SeqCst), 2);

    remover.unregister_pool(fast.pool_id()).await;
    assert_eq!(remover.sweeper().interval().await, Some(Duration::from_millis(4000)));
    remover.unregister_pool(slow.pool_id()).await;
    assert_eq!(remover.sweeper().interval().await, None);
    assert_eq!(remover.sweeper().next_wake().await, None);
}

#[tokio::test(flavor = "current_thread", start_paused = true)]
async fn test_failing_and_panicking_pools_do_not_stop_the_sweep() {
    let validator = ConnectionValidator::start();
    let log = sweep_log();
    let failing = RecordingPool::new("failing", SweepOutcome::Fail, log.clone());
    let panicking = RecordingPool::new("panicking", SweepOutcome::Panic, log.clone());
    let healthy = RecordingPool::new("healthy", SweepOutcome::Succeed, log.clone());

    for pool in [&failing, &panicking, &healthy] {
        validator.register_pool(pool.clone(), Duration::from_millis(100)).await;
    }

    advance_stepwise(Duration::from_millis(50), STEP).await;
    assert_eq!(*log.lock(), vec!["failing", "panicking", "healthy"]);

    advance_stepwise(Duration::from_millis(50), STEP).await;
    assert_eq!(healthy.validations.load(Ordering::SeqCst), 2, "worker survives a panicking pool");
    assert_eq!(panicking.validations.load(Ordering::SeqCst), 2);
    assert!(!validator.sweeper().is_stopped());
}

#[tokio::test(flavor = "current_thread", start_paused = true)]
async fn test_shorter_registration_wakes_sleeping_worker() {
    let remover = IdleRemover::start();
    let log = sweep_log();
    let lazy = RecordingPool::new("lazy", SweepOutcome::Succeed, log.clone());
    let eager = RecordingPool::new("eager", SweepOutcome::Succeed, log.clone());

    remover.register_pool(lazy.clone(), Duration::from_secs(10)).await;
    advance_stepwise(Duration::from_millis(100), STEP).await;
    assert!(log.lock().is_empty());

    // Without a wake-up the worker would sleep until the 5s mark
    remover.register_pool(eager.clone(), Duration::from_millis(200)).await;
    advance_stepwise(Duration::from_millis(150), STEP).await;
    assert_eq!(eager.idle_sweeps.load(Ordering::SeqCst), 1);
    assert_eq!(lazy.idle_sweeps.load(Ordering::SeqCst), 1);
}

#[tokio::test(flavor = "current_thread", start_paused = true)]
async fn test_duplicate_registration_is_ignored() {
    let remover = IdleRemover::start();
    let pool = RecordingPool::new("pool", SweepOutcome::Succeed, sweep_log());

    remover.register_pool(pool.clone(), Duration::from_millis(400)).await;
    remover.register_pool(pool.clone(), Duration::from_millis(10)).await;
    assert_eq!(remover.sweeper().registered_pools().await, 1);
    assert_eq!(remover.sweeper().interval().await, Some(Duration::from_millis(200)));

    advance_stepwise(Duration::from_millis(200), STEP).await;
    assert_eq!(pool.idle_sweeps.load(Ordering::SeqCst), 1);
}

#[tokio::test(flavor = "current_thread", start_paused = true)]
async fn test_stopped_daemon_never_sweeps_again() {
    let remover = IdleRemover::start();
    let pool = RecordingPool::new("pool", SweepOutcome::Succeed, sweep_log());
    remover.register_pool(pool.clone(), Duration::from_millis(100)).await;

    advance_stepwise(Duration::from_millis(60), STEP).await;
    assert_eq!(pool.idle_sweeps.load(Ordering::SeqCst), 1);

    remover.sweeper().shutdown().await;
    assert!(remover.sweeper().is_stopped());

    advance_stepwise(Duration::from_millis(500), STEP).await;
    assert_eq!(pool.idle_sweeps.load(Ordering::SeqCst), 1);

    // An explicit sweep still runs in the caller's task
    remover.sweeper().sweep_now().await;
    assert_eq!(pool.idle_sweeps.load(Ordering::SeqCst), 2);
}

#[tokio::test(flavor = "current_thread", start_paused = true)]
async fn test_idle_connections_are_evicted_in_background() {
    let daemons = BackgroundDaemons::start();
    let factory = MockFactory::new("h2");
    let pool = InternalManagedConnectionPool::new(
        factory.clone(),
        PoolConfig {
            idle_timeout_millis: 1000,
            ..PoolConfig::default()
        },
        Some(daemons.clone()),
    );
    pool.start().await.unwrap();
    assert_eq!(daemons.idle_remover.sweeper().registered_pools().await, 1);
    assert_eq!(daemons.validator.sweeper().registered_pools().await, 0);

    let a = pool.get_connection(None, None, None).await.unwrap();
    let b = pool.get_connection(None, None, None).await.unwrap();
    pool.return_connection(&a, false).unwrap();
    pool.return_connection(&b, false).unwrap();

    advance_stepwise(Duration::from_millis(600), STEP).await;
    assert_eq!(pool.idle_count(), 2, "not idle long enough yet");

    advance_stepwise(Duration::from_millis(1000), STEP).await;
    assert_eq!(pool.connection_count(), 0);
    assert_eq!(factory.state.destroyed.load(Ordering::SeqCst), 2);

    pool.shutdown().await;
    assert_eq!(daemons.idle_remover.sweeper().registered_pools().await, 0);
    daemons.shutdown().await;
}

#[tokio::test(flavor = "current_thread", start_paused = true)]
async fn test_eviction_refills_to_min_size() {
    let daemons = BackgroundDaemons::start();
    let factory = MockFactory::new("h2");
    let pool = InternalManagedConnectionPool::new(
        factory.clone(),
        PoolConfig {
            min_size: 1,
            idle_timeout_millis: 400,
            ..PoolConfig::default()
        },
        Some(daemons.clone()),
    );
    pool.start().await.unwrap();

    let listeners = [
        pool.get_connection(None, None, None).await.unwrap(),
        pool.get_connection(None, None, None).await.unwrap(),
        pool.get_connection(None, None, None).await.unwrap(),
    ];
    for listener in &listeners {
        pool.return_connection(listener, false).unwrap();
    }

    advance_stepwise(Duration::from_millis(800), STEP).await;
    assert_eq!(pool.connection_count(), 1, "eviction stops at min size");
    assert_eq!(factory.state.destroyed.load(Ordering::SeqCst), 2);
    daemons.shutdown().await;
}

#[tokio::test(flavor = "current_thread", start_paused = true)]
async fn test_invalid_connections_are_destroyed_in_background() {
    let daemons = BackgroundDaemons::start();
    let factory = MockFactory::new("h2");
    let pool = InternalManagedConnectionPool::new(
        factory.clone(),
        PoolConfig {
            idle_timeout_millis: 0,
            background_validation: true,
            background_validation_millis: 200,
            ..PoolConfig::default()
        },
        Some(daemons.clone()),
    );
    pool.start().await.unwrap();
    assert_eq!(daemons.idle_remover.sweeper().registered_pools().await, 0);
    assert_eq!(daemons.validator.sweeper().interval().await, Some(Duration::from_millis(100)));

    let listener = pool.get_connection(None, None, None).await.unwrap();
    pool.return_connection(&listener, false).unwrap();

    advance_stepwise(Duration::from_millis(300), STEP).await;
    assert_eq!(pool.idle_count(), 1);

    factory.state.invalid.store(true, Ordering::SeqCst);
    advance_stepwise(Duration::from_millis(400), STEP).await;
    assert_eq!(pool.idle_count(), 0);
    assert_eq!(factory.state.destroyed.load(Ordering::SeqCst), 1);

    daemons.shutdown().await;
    assert!(daemons.idle_remover.sweeper().is_stopped());
    assert!(daemons.validator.sweeper().is_stopped());
}

#[tokio::test(flavor = "current_thread", start_paused = true)]
async fn test_unregister_waits_for_running_sweep() {
    let remover = Arc::new(IdleRemover::start());
    let gate = Arc::new(Notify::new());
    let slow = RecordingPool::new("slow", SweepOutcome::Succeed, sweep_log());
    slow.hold_sweeps_on(gate.clone());
    remover.register_pool(slow.clone(), Duration::from_millis(100)).await;

    advance_stepwise(Duration::from_millis(50), STEP).await;
    assert_eq!(slow.idle_sweeps.load(Ordering::SeqCst), 1, "sweep is in progress");

    let unregister = {
        let remover = remover.clone();
        let id = slow.pool_id();
        tokio::spawn(async move { remover.unregister_pool(id).await })
    };
    for _ in 0..5 {
        tokio::task::yield_now().await;
    }
    assert!(!unregister.is_finished(), "registration changes wait for the sweep");

    gate.notify_one();
    unregister.await.unwrap();
    assert_eq!(remover.sweeper().registered_pools().await, 0);
    assert_eq!(remover.sweeper().interval().await, None);
    assert_eq!(slow.idle_sweeps.load(Ordering::SeqCst), 1);
}
