//! Manager loop behavior: accept policy at capacity, unsubscribe
//! pressure, exclusion-driven eviction and re-subscription.

mod support;

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use agent_pod::mode::manager;
use support::{build_services, camera, test_config, MockRegistry, ScriptedOrphanSource, UnusedVideo};

#[tokio::test(start_paused = true)]
async fn batch_beyond_capacity_claims_one_and_unsubscribes_once() {
    let tmp = tempfile::tempdir().unwrap();
    let cam_a = camera("cam-a", "random");
    let cam_b = camera("cam-b", "random");
    let registry = MockRegistry::with_cameras(vec![cam_a.clone(), cam_b.clone()]);
    let (services, collaborators) =
        build_services(test_config(tmp.path()), registry, Arc::new(UnusedVideo));

    let orphan = ScriptedOrphanSource::new(vec![vec![cam_a, cam_b]]);
    let cancel = CancellationToken::new();
    let handle = tokio::spawn(manager::run(
        cancel.clone(),
        services,
        orphan.clone(),
        Vec::new(),
    ));

    // Let the batch land and a couple of loop turns pass.
    tokio::time::sleep(Duration::from_secs(2)).await;

    let claims = collaborators.registry.claims.lock().unwrap().clone();
    assert_eq!(claims.len(), 1, "only one agent fits the pod");
    assert_eq!(claims[0].0, "cam-a");
    assert_eq!(orphan.unsubscribes.load(Ordering::SeqCst), 1);

    cancel.cancel();
    handle.await.unwrap().unwrap();

    // The unaccommodated camera never got claimed.
    let claims = collaborators.registry.claims.lock().unwrap();
    assert!(claims.iter().all(|(id, _)| id != "cam-b"));
}

#[tokio::test(start_paused = true)]
async fn excluded_camera_is_evicted_and_subscription_returns() {
    let tmp = tempfile::tempdir().unwrap();
    let cam = camera("cam-a", "random");
    let registry = MockRegistry::with_cameras(vec![cam.clone()]);
    let (services, collaborators) = build_services(
        test_config(tmp.path()),
        registry.clone(),
        Arc::new(UnusedVideo),
    );

    let orphan = ScriptedOrphanSource::new(vec![vec![cam]]);
    let cancel = CancellationToken::new();
    let handle = tokio::spawn(manager::run(
        cancel.clone(),
        services,
        orphan.clone(),
        Vec::new(),
    ));

    tokio::time::sleep(Duration::from_secs(2)).await;
    assert_eq!(collaborators.registry.claims.lock().unwrap().len(), 1);
    assert_eq!(orphan.unsubscribes.load(Ordering::SeqCst), 1);

    // Flip the exclusion flag; the next reconcile tick evicts the agent
    // and, with capacity back, subscribes again.
    registry.set_excluded("cam-a");
    tokio::time::sleep(Duration::from_secs(35)).await;

    assert_eq!(orphan.subscribes.load(Ordering::SeqCst), 2);

    cancel.cancel();
    handle.await.unwrap().unwrap();
}

#[tokio::test(start_paused = true)]
async fn no_eviction_without_exclusion() {
    let tmp = tempfile::tempdir().unwrap();
    let cam = camera("cam-a", "random");
    let registry = MockRegistry::with_cameras(vec![cam.clone()]);
    let (services, _collaborators) = build_services(
        test_config(tmp.path()),
        registry,
        Arc::new(UnusedVideo),
    );

    let orphan = ScriptedOrphanSource::new(vec![vec![cam]]);
    let cancel = CancellationToken::new();
    let handle = tokio::spawn(manager::run(
        cancel.clone(),
        services,
        orphan.clone(),
        Vec::new(),
    ));

    // Two reconcile ticks with nothing excluded: still at capacity, so no
    // re-subscription ever happens.
    tokio::time::sleep(Duration::from_secs(65)).await;
    assert_eq!(orphan.subscribes.load(Ordering::SeqCst), 1);
    assert_eq!(orphan.unsubscribes.load(Ordering::SeqCst), 1);

    cancel.cancel();
    handle.await.unwrap().unwrap();
}
