//! Registry lifecycle tests against scripted fakes.
//!
//! Covers:
//! - refcount bookkeeping across interleaved acquire/release
//! - single container per user under concurrent first contact
//! - idle reaping rules, including a zero idle timeout
//! - rollback on creation failures (no zombie entries)
//! - shutdown sweeping by ownership label

mod common;

use std::sync::Arc;
use std::time::{Duration, Instant};

use common::{make_registry, test_config};
use sshcontainer::registry::Registry;

fn far_future() -> Instant {
    Instant::now() + Duration::from_secs(3600)
}

// ============================================================================
// Refcounting
// ============================================================================

#[tokio::test]
async fn acquire_creates_once_then_increments() {
    let (registry, runtime, volumes) = make_registry(test_config(), vec!["net".to_string()]);

    let first = registry.acquire("alice").await.unwrap();
    let second = registry.acquire("alice").await.unwrap();

    assert_eq!(first, second);
    assert_eq!(runtime.created.lock().unwrap().len(), 1);
    assert_eq!(runtime.started.lock().unwrap().len(), 1);
    assert_eq!(registry.active_streams("alice").await, Some(2));

    // Storage is provisioned once, on first contact.
    assert_eq!(*volumes.ensured_subvolumes.lock().unwrap(), vec!["alice".to_string()]);
    assert_eq!(*volumes.ensured_volumes.lock().unwrap(), vec!["alice".to_string()]);
}

#[tokio::test]
async fn refcount_tracks_acquires_minus_releases() {
    let (registry, _runtime, _volumes) = make_registry(test_config(), vec!["net".to_string()]);

    for _ in 0..5 {
        registry.acquire("alice").await.unwrap();
    }
    for _ in 0..3 {
        registry.release("alice").await;
    }
    assert_eq!(registry.active_streams("alice").await, Some(2));
}

#[tokio::test]
async fn release_floors_at_zero() {
    let (registry, _runtime, _volumes) = make_registry(test_config(), vec!["net".to_string()]);

    registry.acquire("alice").await.unwrap();
    registry.release("alice").await;
    registry.release("alice").await;
    registry.release("alice").await;

    assert_eq!(registry.active_streams("alice").await, Some(0));
}

#[tokio::test]
async fn release_of_unknown_user_is_a_noop() {
    let (registry, runtime, _volumes) = make_registry(test_config(), vec!["net".to_string()]);
    registry.release("nobody").await;
    assert_eq!(runtime.created.lock().unwrap().len(), 0);
}

#[tokio::test]
async fn concurrent_first_contact_creates_one_container() {
    let (registry, runtime, _volumes) = make_registry(test_config(), vec!["net".to_string()]);

    let mut tasks = Vec::new();
    for _ in 0..8 {
        let registry = Arc::clone(&registry);
        tasks.push(tokio::spawn(async move {
            registry.acquire("alice").await.unwrap()
        }));
    }
    let mut ids = Vec::new();
    for task in tasks {
        ids.push(task.await.unwrap());
    }

    ids.dedup();
    assert_eq!(ids.len(), 1);
    assert_eq!(runtime.created.lock().unwrap().len(), 1);
    assert_eq!(registry.active_streams("alice").await, Some(8));
}

#[tokio::test]
async fn distinct_users_get_distinct_containers() {
    let (registry, runtime, _volumes) = make_registry(test_config(), vec!["net".to_string()]);

    let alice = registry.acquire("alice").await.unwrap();
    let bob = registry.acquire("bob").await.unwrap();

    assert_ne!(alice, bob);
    assert_eq!(runtime.created.lock().unwrap().len(), 2);
}

// ============================================================================
// Reaping
// ============================================================================

#[tokio::test]
async fn reaper_skips_containers_with_active_streams() {
    let (registry, runtime, _volumes) = make_registry(test_config(), vec!["net".to_string()]);

    registry.acquire("alice").await.unwrap();
    assert_eq!(registry.reap_once(far_future()).await, 0);
    assert_eq!(runtime.live_count(), 1);

    registry.release("alice").await;
    assert_eq!(registry.reap_once(far_future()).await, 1);
    assert_eq!(runtime.live_count(), 0);
}

#[tokio::test]
async fn reap_releases_volume_but_not_subvolume() {
    let (registry, runtime, volumes) = make_registry(test_config(), vec!["net".to_string()]);

    let id = registry.acquire("alice").await.unwrap();
    registry.release("alice").await;
    registry.reap_once(far_future()).await;

    assert!(runtime.removed.lock().unwrap().contains(&id));
    assert_eq!(*volumes.released.lock().unwrap(), vec!["alice".to_string()]);
    // The fake has no way to delete subvolumes at all, which is the point:
    // nothing in the reap path asks for it.
    assert_eq!(registry.active_streams("alice").await, None);
}

#[tokio::test]
async fn zero_idle_timeout_reaps_on_first_tick() {
    let mut config = test_config();
    config.idle_timeout = Duration::from_secs(0);
    let (registry, runtime, _volumes) = make_registry(config, vec!["net".to_string()]);

    registry.acquire("alice").await.unwrap();
    registry.release("alice").await;
    tokio::time::sleep(Duration::from_millis(5)).await;

    assert_eq!(registry.reap_once(Instant::now()).await, 1);
    assert_eq!(runtime.live_count(), 0);
}

#[tokio::test]
async fn fresh_release_is_not_reaped_before_timeout() {
    let (registry, runtime, _volumes) = make_registry(test_config(), vec!["net".to_string()]);

    registry.acquire("alice").await.unwrap();
    registry.release("alice").await;

    // Idle timeout is 60s; "now" is now.
    assert_eq!(registry.reap_once(Instant::now()).await, 0);
    assert_eq!(runtime.live_count(), 1);
}

#[tokio::test]
async fn user_reacquires_after_reap() {
    let (registry, runtime, _volumes) = make_registry(test_config(), vec!["net".to_string()]);

    let first = registry.acquire("alice").await.unwrap();
    registry.release("alice").await;
    registry.reap_once(far_future()).await;

    let second = registry.acquire("alice").await.unwrap();
    assert_ne!(first, second);
    assert_eq!(runtime.created.lock().unwrap().len(), 2);
    assert_eq!(registry.active_streams("alice").await, Some(1));
}

// ============================================================================
// Creation failures
// ============================================================================

#[tokio::test]
async fn start_failure_rolls_back_and_leaves_no_entry() {
    let (registry, runtime, volumes) = make_registry(test_config(), vec!["net".to_string()]);

    runtime.fail_start.store(true, std::sync::atomic::Ordering::SeqCst);
    assert!(registry.acquire("alice").await.is_err());

    // The created container was force-removed and no entry is visible.
    assert_eq!(runtime.live_count(), 0);
    assert_eq!(runtime.removed.lock().unwrap().len(), 1);
    assert_eq!(registry.active_streams("alice").await, None);
    assert_eq!(*volumes.released.lock().unwrap(), vec!["alice".to_string()]);

    // The next attempt starts from scratch and succeeds.
    runtime.fail_start.store(false, std::sync::atomic::Ordering::SeqCst);
    registry.acquire("alice").await.unwrap();
    assert_eq!(registry.active_streams("alice").await, Some(1));
}

#[tokio::test]
async fn network_attach_failure_propagates_without_entry() {
    let (registry, runtime, _volumes) = make_registry(
        test_config(),
        vec!["net".to_string(), "extra".to_string()],
    );

    runtime.fail_connect.store(true, std::sync::atomic::Ordering::SeqCst);
    assert!(registry.acquire("alice").await.is_err());
    assert_eq!(runtime.live_count(), 0);
    assert_eq!(registry.active_streams("alice").await, None);
}

#[tokio::test]
async fn subvolume_conflict_creates_nothing() {
    let (registry, runtime, volumes) = make_registry(test_config(), vec!["net".to_string()]);

    volumes
        .fail_subvolume
        .store(true, std::sync::atomic::Ordering::SeqCst);
    assert!(registry.acquire("alice").await.is_err());
    assert_eq!(runtime.created.lock().unwrap().len(), 0);
}

#[tokio::test]
async fn extra_networks_are_attached_after_create() {
    let (registry, runtime, _volumes) = make_registry(
        test_config(),
        vec!["net".to_string(), "shared".to_string(), "metrics".to_string()],
    );

    let id = registry.acquire("alice").await.unwrap();
    assert_eq!(
        *runtime.connected.lock().unwrap(),
        vec![(id, vec!["shared".to_string(), "metrics".to_string()])]
    );
}

// ============================================================================
// Shutdown
// ============================================================================

#[tokio::test]
async fn shutdown_removes_all_owned_containers() {
    let (registry, runtime, _volumes) = make_registry(test_config(), vec!["net".to_string()]);

    registry.acquire("alice").await.unwrap();
    registry.acquire("bob").await.unwrap();

    // A container from a previous daemon run, unknown to the registry.
    runtime
        .live
        .lock()
        .unwrap()
        .insert("stale-0".to_string(), Some("carol".to_string()));

    registry.shutdown().await;

    assert_eq!(runtime.live_count(), 0);
    assert_eq!(registry.active_streams("alice").await, None);
    assert_eq!(registry.active_streams("bob").await, None);
}
