//! Connection listener lifecycle tests
//!
//! Exercises the listener state machine as driven by handle close and
//! connection error events, and the "free only when no handles" rule.

mod common;

use common::*;
use connector_pool::{
    BaseConnectionManager, ConnectionHandle, InternalManagedConnectionPool, ListenerState,
    ManagedConnectionFactory, ManagedConnectionPool, ManagerConfig, ManualTransactionSource,
    PoolConfig, TransactionSupport,
};
use proptest::prelude::*;
use std::sync::atomic::Ordering;
use std::sync::Arc;

#[derive(Debug, Clone)]
enum HandleOp {
    Register,
    Unregister(usize),
    UnregisterUnknown,
    UnregisterAll,
}

fn handle_op() -> impl Strategy<Value = HandleOp> {
    prop_oneof![
        3 => Just(HandleOp::Register),
        3 => (0usize..8).prop_map(HandleOp::Unregister),
        1 => Just(HandleOp::UnregisterUnknown),
        1 => Just(HandleOp::UnregisterAll),
    ]
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(100))]

    #[test]
    fn test_free_exactly_when_no_handles(ops in prop::collection::vec(handle_op(), 0..40)) {
        let factory = MockFactory::new("h2");
        let listener = detached_listener(&factory);
        let mut model: Vec<ConnectionHandle> = Vec::new();

        for op in ops {
            match op {
                HandleOp::Register => {
                    let handle = ConnectionHandle::new(());
                    listener.register_handle(handle.clone()).unwrap();
                    model.push(handle);
                }
                HandleOp::Unregister(index) => {
                    if !model.is_empty() {
                        let handle = model.remove(index % model.len());
                        prop_assert!(listener.unregister_handle(&handle));
                    }
                }
                HandleOp::UnregisterUnknown => {
                    prop_assert!(!listener.unregister_handle(&ConnectionHandle::new(())));
                }
                HandleOp::UnregisterAll => {
                    let removed = listener.unregister_all_handles();
                    prop_assert_eq!(removed.len(), model.len());
                    model.clear();
                }
            }

            prop_assert_eq!(listener.handle_count(), model.len());
            prop_assert_eq!(listener.is_managed_connection_free(), model.is_empty());
        }
    }
}

#[tokio::test]
async fn test_close_of_last_handle_returns_listener() {
    let factory = MockFactory::new("h2");
    let (manager, pool) = manager_with_pool(factory.clone(), PoolConfig::default());

    let handle = manager.allocate_connection(&factory.identity(), None).await.unwrap();
    assert_eq!(pool.in_use_count(), 1);

    mock_handle(&handle).close(&handle);
    assert_eq!(pool.in_use_count(), 0);
    assert_eq!(pool.idle_count(), 1);
    assert_eq!(factory.state.destroyed.load(Ordering::SeqCst), 0);

    // The recycled connection serves the next request
    let again = manager.allocate_connection(&factory.identity(), None).await.unwrap();
    assert_eq!(mock_handle(&again).connection_id(), mock_handle(&handle).connection_id());
    assert_eq!(pool.statistics().total_created, 1);
}

#[tokio::test]
async fn test_close_with_remaining_handles_keeps_listener_checked_out() {
    let factory = MockFactory::new("h2");
    let (manager, pool) = manager_with_pool(factory.clone(), PoolConfig::default());

    let listener = manager.get_managed_connection(None, None, None).await.unwrap();
    let first = listener.managed_connection().get_connection(None, None).unwrap();
    let second = listener.managed_connection().get_connection(None, None).unwrap();
    listener.register_handle(first.clone()).unwrap();
    listener.register_handle(second.clone()).unwrap();

    mock_handle(&first).close(&first);
    assert_eq!(listener.state(), ListenerState::Normal);
    assert_eq!(listener.handle_count(), 1);
    assert_eq!(pool.in_use_count(), 1, "a listener with handles never goes back");

    mock_handle(&second).close(&second);
    assert_eq!(pool.in_use_count(), 0);
    assert_eq!(pool.idle_count(), 1);
}

#[tokio::test]
async fn test_connection_error_destroys_listener() {
    let factory = MockFactory::new("h2");
    let (manager, pool) = manager_with_pool(factory.clone(), PoolConfig::default());

    let listener = manager.get_managed_connection(None, None, None).await.unwrap();
    let handle = listener.managed_connection().get_connection(None, None).unwrap();
    listener.register_handle(handle.clone()).unwrap();
    listener
        .register_handle(listener.managed_connection().get_connection(None, None).unwrap())
        .unwrap();

    mock_handle(&handle).fail();

    assert_eq!(listener.state(), ListenerState::Destroyed);
    assert_eq!(listener.handle_count(), 0);
    assert!(!listener.has_permit());
    assert_eq!(pool.connection_count(), 0);
    assert_eq!(factory.state.destroyed.load(Ordering::SeqCst), 1);
    assert_eq!(pool.statistics().available, PoolConfig::default().max_size);
}

#[tokio::test]
async fn test_cleanup_failure_on_return_kills_listener() {
    let factory = MockFactory::new("h2");
    let (manager, pool) = manager_with_pool(factory.clone(), PoolConfig::default());

    let handle = manager.allocate_connection(&factory.identity(), None).await.unwrap();
    factory.state.fail_cleanup.store(true, Ordering::SeqCst);
    mock_handle(&handle).close(&handle);

    assert_eq!(pool.connection_count(), 0);
    assert_eq!(factory.state.destroyed.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_tidyup_failure_forces_kill() {
    let factory = MockFactory::new("h2");
    let source = Arc::new(ManualTransactionSource::new());
    let config = ManagerConfig {
        transaction_support: TransactionSupport::Local,
        ..manager_config(0, 0)
    };
    let manager = BaseConnectionManager::builder(config)
        .transaction_source(source.clone())
        .build()
        .unwrap();
    let pool = InternalManagedConnectionPool::new(factory.clone(), PoolConfig::default(), None);
    manager.set_pool(pool.clone());

    let tx = source.begin();
    let handle = manager.allocate_connection(&factory.identity(), None).await.unwrap();
    assert_eq!(factory.state.begun.load(Ordering::SeqCst), 1);

    // The transaction ends without the manager hearing about it, so the
    // listener still carries a local transaction that tidy-up must roll back
    source.complete(tx);
    factory.state.fail_rollback.store(true, Ordering::SeqCst);
    mock_handle(&handle).close(&handle);

    assert_eq!(pool.connection_count(), 0);
    assert_eq!(factory.state.destroyed.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_listener_from_replaced_pool_is_destroyed() {
    let factory = MockFactory::new("h2");
    let (manager, old_pool) = manager_with_pool(factory.clone(), PoolConfig::default());

    let handle = manager.allocate_connection(&factory.identity(), None).await.unwrap();

    let new_pool = InternalManagedConnectionPool::new(factory.clone(), PoolConfig::default(), None);
    manager.set_pool(new_pool.clone());
    mock_handle(&handle).close(&handle);

    assert_eq!(old_pool.connection_count(), 0);
    assert_eq!(old_pool.idle_count(), 0);
    assert_eq!(new_pool.connection_count(), 0);
    assert_eq!(factory.state.destroyed.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_destroyed_listener_is_never_reused() {
    let factory = MockFactory::new("h2");
    let (manager, pool) = manager_with_pool(factory.clone(), PoolConfig::default());

    let listener = manager.get_managed_connection(None, None, None).await.unwrap();
    manager.return_managed_connection(&listener, true);
    assert_eq!(listener.state(), ListenerState::Destroyed);

    // A second return of the same listener is ignored
    manager.return_managed_connection(&listener, false);
    assert_eq!(pool.idle_count(), 0);

    let next = manager.get_managed_connection(None, None, None).await.unwrap();
    assert_ne!(next.id(), listener.id());
}
