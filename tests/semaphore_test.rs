//! Integration tests for the in-memory counting lock store.

use leasehold::Error;
use leasehold::semaphore::{
    CountingLockStore, LockToken, MAX_CONTEXT_CHARS, MAX_LEASE_SECONDS, MemoryLockStore,
};
use std::time::Duration;

#[tokio::test]
async fn grants_up_to_max_holders() {
    let store = MemoryLockStore::new();

    let a = store.attempt_to_acquire_lock("k", 30, 2, "a").await.unwrap();
    let b = store.attempt_to_acquire_lock("k", 30, 2, "b").await.unwrap();
    let c = store.attempt_to_acquire_lock("k", 30, 2, "c").await.unwrap();

    assert!(a.is_some());
    assert!(b.is_some());
    assert!(c.is_none());
    assert_eq!(store.holder_count("k"), 2);
}

#[tokio::test]
async fn keys_are_independent() {
    let store = MemoryLockStore::new();

    assert!(store.attempt_to_acquire_lock("x", 30, 1, "a").await.unwrap().is_some());
    assert!(store.attempt_to_acquire_lock("y", 30, 1, "b").await.unwrap().is_some());
}

#[tokio::test]
async fn release_frees_a_slot() {
    let store = MemoryLockStore::new();
    let token = store
        .attempt_to_acquire_lock("k", 30, 1, "a")
        .await
        .unwrap()
        .unwrap();

    store.release_lock("k", &token).await.unwrap();

    assert_eq!(store.holder_count("k"), 0);
    assert!(store.attempt_to_acquire_lock("k", 30, 1, "b").await.unwrap().is_some());
}

#[tokio::test]
async fn releasing_an_unknown_token_fails() {
    let store = MemoryLockStore::new();
    store.attempt_to_acquire_lock("k", 30, 1, "a").await.unwrap();

    let err = store
        .release_lock("k", &LockToken::new("not-a-holder"))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::LockReleaseFailed { ref key, .. } if key == "k"), "got {err:?}");
}

#[tokio::test]
async fn releasing_twice_fails() {
    let store = MemoryLockStore::new();
    let token = store
        .attempt_to_acquire_lock("k", 30, 1, "a")
        .await
        .unwrap()
        .unwrap();

    store.release_lock("k", &token).await.unwrap();
    assert!(matches!(
        store.release_lock("k", &token).await,
        Err(Error::LockReleaseFailed { .. })
    ));
}

#[tokio::test(start_paused = true)]
async fn expired_lease_frees_the_slot_and_voids_the_token() {
    let store = MemoryLockStore::new();
    let token = store
        .attempt_to_acquire_lock("k", 10, 1, "first")
        .await
        .unwrap()
        .unwrap();

    tokio::time::advance(Duration::from_secs(11)).await;

    assert_eq!(store.first_unexpired_lock_context("k").await.unwrap(), None);
    assert!(store.attempt_to_acquire_lock("k", 10, 1, "second").await.unwrap().is_some());
    assert!(matches!(
        store.refresh_lock_timeout("k", &token, 10).await,
        Err(Error::LockReleaseFailed { .. })
    ));
    assert!(matches!(
        store.release_lock("k", &token).await,
        Err(Error::LockReleaseFailed { .. })
    ));
}

#[tokio::test(start_paused = true)]
async fn refresh_extends_the_lease() {
    let store = MemoryLockStore::new();
    let token = store
        .attempt_to_acquire_lock("k", 10, 1, "holder")
        .await
        .unwrap()
        .unwrap();

    tokio::time::advance(Duration::from_secs(8)).await;
    store.refresh_lock_timeout("k", &token, 10).await.unwrap();
    tokio::time::advance(Duration::from_secs(8)).await;

    assert_eq!(
        store.first_unexpired_lock_context("k").await.unwrap().as_deref(),
        Some("holder")
    );
    assert!(store.attempt_to_acquire_lock("k", 10, 1, "other").await.unwrap().is_none());
}

#[tokio::test]
async fn reports_holder_context() {
    let store = MemoryLockStore::new();
    assert_eq!(store.first_unexpired_lock_context("k").await.unwrap(), None);

    store.attempt_to_acquire_lock("k", 30, 3, "job 42").await.unwrap();

    assert_eq!(
        store.first_unexpired_lock_context("k").await.unwrap().as_deref(),
        Some("job 42")
    );
}

#[tokio::test]
async fn release_all_locks_clears_every_key() {
    let store = MemoryLockStore::new();
    store.attempt_to_acquire_lock("a", 30, 1, "x").await.unwrap();
    store.attempt_to_acquire_lock("b", 30, 1, "y").await.unwrap();

    store.release_all_locks().await.unwrap();

    assert_eq!(store.holder_count("a"), 0);
    assert_eq!(store.holder_count("b"), 0);
}

#[tokio::test]
async fn rejects_invalid_arguments() {
    let store = MemoryLockStore::new();

    for (key, max, context) in [("", 1, "ctx"), ("k", 0, "ctx"), ("k", 1, "   ")] {
        let err = store
            .attempt_to_acquire_lock(key, 30, max, context)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)), "got {err:?}");
    }

    let long = "x".repeat(MAX_CONTEXT_CHARS + 1);
    let err = store.attempt_to_acquire_lock("k", 30, 1, &long).await.unwrap_err();
    assert_eq!(
        err.to_string(),
        format!("context length cannot be more than {MAX_CONTEXT_CHARS} characters")
    );

    let exact = "x".repeat(MAX_CONTEXT_CHARS);
    assert!(store.attempt_to_acquire_lock("k", 30, 1, &exact).await.unwrap().is_some());
}

#[tokio::test]
async fn rejects_leases_beyond_the_maximum() {
    let store = MemoryLockStore::new();

    let err = store
        .attempt_to_acquire_lock("k", u64::MAX, 1, "a")
        .await
        .unwrap_err();
    assert!(matches!(err, Error::InvalidArgument(_)), "got {err:?}");
    assert_eq!(store.holder_count("k"), 0);

    let token = store
        .attempt_to_acquire_lock("k", MAX_LEASE_SECONDS, 1, "a")
        .await
        .unwrap()
        .unwrap();
    assert!(matches!(
        store.refresh_lock_timeout("k", &token, MAX_LEASE_SECONDS + 1).await,
        Err(Error::InvalidArgument(_))
    ));
    store.refresh_lock_timeout("k", &token, MAX_LEASE_SECONDS).await.unwrap();
}
