//! Timing behaviour when many instances boot and tear down concurrently.

#[path = "common/session.rs"]
mod session;

use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;
use std::time::Duration;

use cloudlift::test_support::{FakeProvider, SimulatedHostRunner};
use cloudlift::{InstanceState, LifecycleError};
use rstest::rstest;
use tokio::time::Instant;

use session::{KeyDir, request};

const BOOT_TIMEOUT: Duration = Duration::from_secs(60);

/// Address the fake provider assigns to its `index`-th instance.
const fn fake_address(index: u8) -> IpAddr {
    IpAddr::V4(Ipv4Addr::new(10, 0, 0, index))
}

#[rstest]
#[tokio::test(start_paused = true)]
async fn concurrent_waits_take_about_as_long_as_the_slowest_boot() {
    let keys = KeyDir::new();
    let provider = Arc::new(FakeProvider::new());
    let runner = SimulatedHostRunner::new();
    runner.add_host(fake_address(1), Duration::from_secs(5));
    runner.add_host(fake_address(2), Duration::from_secs(10));
    runner.add_host(fake_address(3), Duration::from_secs(20));
    let cloud = session::session(&provider, &keys, runner);

    let first = cloud.launch(request(), false).await.expect("launch");
    let second = cloud.launch(request(), false).await.expect("launch");
    let third = cloud.launch(request(), false).await.expect("launch");
    assert_eq!(first.state(), InstanceState::Pending);

    let started = Instant::now();
    let (a, b, c) = tokio::join!(
        first.wait(BOOT_TIMEOUT),
        second.wait(BOOT_TIMEOUT),
        third.wait(BOOT_TIMEOUT),
    );
    let elapsed = started.elapsed();

    for report in [a, b, c] {
        assert!(report.expect("boot").is_ready());
    }
    assert!(elapsed >= Duration::from_secs(20), "finished early: {elapsed:?}");
    assert!(elapsed < Duration::from_secs(25), "waits ran serially: {elapsed:?}");
    for instance in [&first, &second, &third] {
        assert_eq!(instance.state(), InstanceState::Running);
    }
    assert!(cloud.clean().await.is_clean());
}

#[rstest]
#[tokio::test(start_paused = true)]
async fn deletes_can_be_requested_first_and_awaited_later() {
    let keys = KeyDir::new();
    let provider = Arc::new(FakeProvider::new().with_deletion_latency(Duration::from_secs(8)));
    let cloud = session::session(&provider, &keys, SimulatedHostRunner::new());
    let first = cloud.launch(request(), false).await.expect("launch");
    let second = cloud.launch(request(), false).await.expect("launch");

    let requested = Instant::now();
    first.delete(false).await.expect("delete");
    second.delete(false).await.expect("delete");
    assert!(requested.elapsed() < Duration::from_secs(1));
    assert_eq!(first.state(), InstanceState::Terminating);

    let (a, b) = tokio::join!(
        first.wait_for_delete(Duration::from_secs(30)),
        second.wait_for_delete(Duration::from_secs(30)),
    );
    a.expect("first gone");
    b.expect("second gone");
    let elapsed = requested.elapsed();

    assert!(elapsed >= Duration::from_secs(8), "finished early: {elapsed:?}");
    assert!(elapsed < Duration::from_secs(10), "waits ran serially: {elapsed:?}");
    assert_eq!(second.state(), InstanceState::Terminated);

    first.delete(true).await.expect("repeat delete");
    assert_eq!(provider.terminate_calls(first.id()), 1);
    assert!(cloud.clean().await.is_clean());
    assert_eq!(provider.total_terminate_calls(), 2);
}

#[rstest]
#[tokio::test(start_paused = true)]
async fn delete_wait_gives_up_at_the_deadline() {
    let keys = KeyDir::new();
    let provider = Arc::new(FakeProvider::new().with_deletion_latency(Duration::from_secs(600)));
    let cloud = session::session(&provider, &keys, SimulatedHostRunner::new());
    let instance = cloud.launch(request(), false).await.expect("launch");
    instance.delete(false).await.expect("delete");

    let started = Instant::now();
    let err = instance
        .wait_for_delete(Duration::from_secs(3))
        .await
        .expect_err("deletion is slower than the timeout");

    assert!(matches!(err, LifecycleError::ConnectivityTimeout { .. }));
    let elapsed = started.elapsed();
    assert!(elapsed >= Duration::from_secs(3), "gave up early: {elapsed:?}");
    assert!(elapsed < Duration::from_millis(3500), "overran the deadline: {elapsed:?}");
    assert_eq!(instance.state(), InstanceState::Terminating);

    let report = cloud.clean().await;
    assert_eq!(report.len(), 1);
    assert_eq!(provider.terminate_calls(instance.id()), 1);
}
