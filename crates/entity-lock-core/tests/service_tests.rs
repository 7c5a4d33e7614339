//! Lock service integration tests
//!
//! Runs the full resolve -> session -> broker path against an in-memory
//! SQLite mapping store and the in-process broker.

use entity_lock_core::broker::LocalLockBroker;
use entity_lock_core::config::LockingConfig;
use entity_lock_core::event::LockEventType;
use entity_lock_core::resolver::LockIdResolver;
use entity_lock_core::store::{MappingStore, SqliteMappingStore};
use entity_lock_core::{DistributedLockService, LockError, LockId, LockMode, LockState};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{Instant, sleep, timeout};
use uuid::Uuid;

const CONTENTION_WAIT: Duration = Duration::from_millis(100);

struct Harness {
    service: Arc<DistributedLockService>,
    store: Arc<dyn MappingStore>,
    broker: LocalLockBroker,
}

async fn harness() -> Harness {
    let store: Arc<dyn MappingStore> = Arc::new(SqliteMappingStore::in_memory().await.unwrap());
    let broker = LocalLockBroker::new();
    let service = DistributedLockService::new(
        Arc::clone(&store),
        Arc::new(broker.clone()),
        LockingConfig::default(),
    );
    Harness {
        service: Arc::new(service),
        store,
        broker,
    }
}

#[tokio::test]
async fn test_first_resolutions_are_one_then_two() {
    let h = harness().await;
    let first = Uuid::parse_str("11111111-1111-1111-1111-111111111111").unwrap();
    let second = Uuid::parse_str("22222222-2222-2222-2222-222222222222").unwrap();

    assert_eq!(h.service.resolver().resolve(first).await.unwrap(), LockId::new(1));
    assert_eq!(h.service.resolver().resolve(second).await.unwrap(), LockId::new(2));
    assert_eq!(h.service.resolver().resolve(first).await.unwrap(), LockId::new(1));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_first_resolution_creates_one_row() {
    let h = harness().await;
    let entity = Uuid::new_v4();

    let mut tasks = Vec::new();
    for _ in 0..16 {
        // Separate resolvers so the cache cannot hide the race
        let resolver = LockIdResolver::new(Arc::clone(&h.store));
        tasks.push(tokio::spawn(async move { resolver.resolve(entity).await }));
    }

    let mut ids = Vec::new();
    for task in tasks {
        ids.push(task.await.unwrap().unwrap());
    }

    assert!(ids.iter().all(|id| *id == ids[0]));
    assert_eq!(h.store.count().await.unwrap(), 1);
}

#[tokio::test]
async fn test_write_lock_excludes_other_scopes() {
    let h = harness().await;
    let entity = Uuid::new_v4();

    let writer = h.service.acquire_write_lock(entity).await.unwrap();

    let err = h
        .service
        .acquire_read_lock_within(entity, CONTENTION_WAIT)
        .await
        .unwrap_err();
    assert!(matches!(err, LockError::Timeout { .. }));

    let err = h
        .service
        .acquire_write_lock_within(entity, CONTENTION_WAIT)
        .await
        .unwrap_err();
    assert!(matches!(err, LockError::Timeout { .. }));

    assert!(h.service.release_write_lock(writer).await.unwrap());

    let reader = h
        .service
        .acquire_read_lock_within(entity, CONTENTION_WAIT)
        .await
        .unwrap();
    h.service.release_read_lock(reader).await.unwrap();
}

#[tokio::test]
async fn test_read_locks_coexist() {
    let h = harness().await;
    let entity = Uuid::new_v4();

    let a = h.service.acquire_read_lock(entity).await.unwrap();
    let b = h
        .service
        .acquire_read_lock_within(entity, CONTENTION_WAIT)
        .await
        .expect("second reader must not block");

    assert_eq!(a.lock_id(), b.lock_id());
    assert_ne!(a.scope_id(), b.scope_id());
    assert_eq!(h.broker.holder_count(a.lock_id()), 2);

    h.service.release_read_lock(a).await.unwrap();
    h.service.release_read_lock(b).await.unwrap();
}

#[tokio::test]
async fn test_distinct_entities_do_not_block() {
    let h = harness().await;

    let first = h.service.acquire_write_lock(Uuid::new_v4()).await.unwrap();
    let second = h
        .service
        .acquire_write_lock_within(Uuid::new_v4(), CONTENTION_WAIT)
        .await
        .expect("different entities must not contend");

    assert_ne!(first.lock_id(), second.lock_id());
    h.service.release_write_lock(first).await.unwrap();
    h.service.release_write_lock(second).await.unwrap();
}

#[tokio::test]
async fn test_foreign_release_fails_and_keeps_holder() {
    let h = harness().await;
    let entity = Uuid::new_v4();

    let mut holder = h.service.begin();
    let lock_id = holder.acquire_write_lock(entity).await.unwrap();

    let mut intruder = h.service.begin();
    let err = intruder.release_write_lock(entity).await.unwrap_err();
    assert!(matches!(err, LockError::SessionMismatch(_)));

    assert_eq!(holder.state(entity, LockMode::Exclusive), LockState::Held);
    assert_eq!(h.broker.holder_count(lock_id), 1);

    assert!(holder.release_write_lock(entity).await.unwrap());
    holder.close().await.unwrap();
    intruder.close().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_reader_is_granted_after_writer_releases() {
    let h = harness().await;
    let entity = Uuid::new_v4();

    let writer = h.service.acquire_write_lock(entity).await.unwrap();

    let service = Arc::clone(&h.service);
    let reader = tokio::spawn(async move {
        let handle = service.acquire_read_lock(entity).await.unwrap();
        let granted_at = Instant::now();
        service.release_read_lock(handle).await.unwrap();
        granted_at
    });

    sleep(CONTENTION_WAIT).await;
    assert!(!reader.is_finished(), "reader must wait for the writer");

    let released_at = Instant::now();
    h.service.release_write_lock(writer).await.unwrap();

    let granted_at = timeout(Duration::from_secs(5), reader)
        .await
        .expect("reader should be granted once the writer releases")
        .unwrap();
    assert!(granted_at >= released_at);
}

#[tokio::test]
async fn test_deadline_expiry_releases_everything_the_scope_held() {
    let h = harness().await;
    let contended = Uuid::new_v4();
    let bystander = Uuid::new_v4();

    let writer = h.service.acquire_write_lock(contended).await.unwrap();

    let mut scope = h.service.begin();
    let bystander_lock = scope.acquire_write_lock(bystander).await.unwrap();
    assert_eq!(h.broker.holder_count(bystander_lock), 1);

    let err = scope
        .acquire_write_lock_within(contended, Duration::from_millis(50))
        .await
        .unwrap_err();
    assert_eq!(err.code(), "E300");
    assert!(scope.is_failed());
    assert_eq!(h.broker.holder_count(bystander_lock), 0);

    // Another scope can take what the failed scope held
    let taken = h
        .service
        .acquire_write_lock_within(bystander, CONTENTION_WAIT)
        .await
        .unwrap();
    h.service.release_write_lock(taken).await.unwrap();
    h.service.release_write_lock(writer).await.unwrap();
}

#[tokio::test]
async fn test_lifecycle_events_are_broadcast() {
    let h = harness().await;
    let mut events = h.service.subscribe();
    let entity = Uuid::new_v4();

    let writer = h.service.acquire_write_lock(entity).await.unwrap();
    let _ = h
        .service
        .acquire_read_lock_within(entity, Duration::from_millis(20))
        .await
        .unwrap_err();
    h.service.release_write_lock(writer).await.unwrap();

    let kinds: Vec<LockEventType> = [
        events.recv().await.unwrap(),
        events.recv().await.unwrap(),
        events.recv().await.unwrap(),
    ]
    .iter()
    .map(|event| event.event_type)
    .collect();

    assert_eq!(
        kinds,
        vec![
            LockEventType::Acquired,
            LockEventType::TimedOut,
            LockEventType::Released
        ]
    );
}

#[tokio::test]
async fn test_dropped_handle_frees_lock() {
    let h = harness().await;
    let entity = Uuid::new_v4();

    let handle = h.service.acquire_write_lock(entity).await.unwrap();
    let lock_id = handle.lock_id();
    drop(handle);

    assert_eq!(h.broker.holder_count(lock_id), 0);
    let again = h
        .service
        .acquire_write_lock_within(entity, CONTENTION_WAIT)
        .await
        .unwrap();
    h.service.release_write_lock(again).await.unwrap();
}
