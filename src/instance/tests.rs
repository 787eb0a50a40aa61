//! Unit tests for the instance façade.

use std::time::Duration;

use rstest::{fixture, rstest};

use super::*;
use crate::provider::{Capabilities, LaunchRequest};
use crate::retry::Backoff;
use crate::test_support::{
    CommandInvocation, FakeProvider, ScriptedRunner, SimulatedHostRunner, channel_config,
};

fn timings() -> LifecycleTimings {
    LifecycleTimings {
        boot_timeout: Duration::from_secs(30),
        boot_backoff: Backoff::fixed(Duration::from_secs(1)),
        boot_marker: String::from("/run/booted"),
        delete_timeout: Duration::from_secs(20),
        delete_poll_interval: Duration::from_secs(2),
        stop_timeout: Duration::from_secs(20),
    }
}

#[fixture]
fn provider() -> Arc<FakeProvider> {
    Arc::new(FakeProvider::new().with_deletion_latency(Duration::from_secs(5)))
}

async fn launch<R: CommandRunner>(provider: &Arc<FakeProvider>, runner: R) -> Instance<R> {
    let request = LaunchRequest::builder()
        .image_id("img-1")
        .build()
        .expect("request builds");
    let handle = provider.create(&request).await.expect("create succeeds");
    let channel = RemoteChannel::new(
        handle.endpoint,
        Utf8Path::new("/keys/ci"),
        channel_config(),
        Arc::new(runner),
    );
    let adapter: Arc<dyn ProviderAdapter> = provider.clone();
    Instance::new(handle, adapter, channel, timings())
}

#[rstest]
#[tokio::test(start_paused = true)]
async fn wait_marks_instance_running(provider: Arc<FakeProvider>) {
    let runner = SimulatedHostRunner::new();
    let instance = launch(&provider, runner.clone()).await;
    runner.add_host(instance.endpoint().address, Duration::from_secs(3));
    assert_eq!(instance.state(), InstanceState::Pending);

    let report = instance
        .wait(Duration::from_secs(30))
        .await
        .expect("instance should boot");

    assert_eq!(report.attempts, 4);
    assert_eq!(instance.state(), InstanceState::Running);
    let probe = runner.invocations().pop().expect("probe invocation");
    assert_eq!(probe.last_arg().as_deref(), Some("test -f /run/booted"));
}

#[rstest]
#[tokio::test(start_paused = true)]
async fn boot_timeout_leaves_state_unchanged(provider: Arc<FakeProvider>) {
    let runner = SimulatedHostRunner::new();
    let instance = launch(&provider, runner.clone()).await;
    runner.add_host(instance.endpoint().address, Duration::from_secs(3600));

    let err = instance
        .wait(Duration::from_secs(5))
        .await
        .expect_err("boot must time out");

    assert_eq!(err, LifecycleError::timeout("boot", "fake-1"));
    assert_eq!(instance.state(), InstanceState::Pending);
}

#[rstest]
#[tokio::test]
async fn execute_accepts_strings_and_argv(provider: Arc<FakeProvider>) {
    let runner = ScriptedRunner::new();
    runner.push_success();
    runner.push_output(Some(0), "Linux\n", "");
    runner.push_output(Some(0), "root\n", "");
    let instance = launch(&provider, runner.clone()).await;

    let uname = instance.execute("uname -s").await.expect("uname runs");
    let whoami = instance
        .execute(RemoteCommand::argv(["whoami"]).as_root())
        .await
        .expect("whoami runs");

    assert_eq!(uname.stdout, "Linux");
    assert_eq!(whoami.stdout, "root");
    let last = runner.invocations().pop().expect("whoami invocation");
    assert_eq!(last.last_arg().as_deref(), Some("sudo -- whoami"));
}

#[rstest]
#[tokio::test]
async fn console_log_needs_no_connection(provider: Arc<FakeProvider>) {
    let runner = ScriptedRunner::new();
    let instance = launch(&provider, runner.clone()).await;

    let log = instance.console_log().await.expect("console log");

    assert_eq!(log, "console output for fake-1");
    assert!(runner.invocations().is_empty());
}

#[rstest]
#[tokio::test]
async fn console_log_reports_missing_capability() {
    let provider = Arc::new(FakeProvider::new().with_capabilities(Capabilities {
        console_log: false,
        ..Capabilities::default()
    }));
    let instance = launch(&provider, ScriptedRunner::new()).await;

    let err = instance.console_log().await.expect_err("unsupported");

    assert_eq!(err, LifecycleError::not_supported("console_log", "fake"));
}

#[rstest]
#[tokio::test(start_paused = true)]
async fn delete_with_wait_polls_until_gone(provider: Arc<FakeProvider>) {
    let instance = launch(&provider, ScriptedRunner::new()).await;
    let started = Instant::now();

    instance.delete(true).await.expect("delete succeeds");

    assert_eq!(instance.state(), InstanceState::Terminated);
    assert_eq!(started.elapsed(), Duration::from_secs(6));
    assert_eq!(provider.terminate_calls("fake-1"), 1);
}

#[rstest]
#[tokio::test(start_paused = true)]
async fn repeated_delete_is_a_no_op(provider: Arc<FakeProvider>) {
    let instance = launch(&provider, ScriptedRunner::new()).await;

    instance.delete(false).await.expect("first delete");
    assert_eq!(instance.state(), InstanceState::Terminating);
    instance.delete(false).await.expect("second delete");
    instance
        .wait_for_delete(Duration::from_secs(10))
        .await
        .expect("deletion completes");
    instance.delete(true).await.expect("delete after termination");

    assert_eq!(provider.terminate_calls("fake-1"), 1);
    assert_eq!(instance.state(), InstanceState::Terminated);
}

#[rstest]
#[tokio::test(start_paused = true)]
async fn wait_for_delete_times_out(provider: Arc<FakeProvider>) {
    let instance = launch(&provider, ScriptedRunner::new()).await;
    instance.delete(false).await.expect("delete requested");

    let err = instance
        .wait_for_delete(Duration::from_secs(3))
        .await
        .expect_err("deletion takes longer than the timeout");

    assert_eq!(err, LifecycleError::timeout("delete", "fake-1"));
    assert_eq!(instance.state(), InstanceState::Terminating);
}

#[rstest]
#[tokio::test]
async fn failed_terminate_keeps_state(provider: Arc<FakeProvider>) {
    let instance = launch(&provider, ScriptedRunner::new()).await;
    provider.fail_terminate("fake-1");

    let err = instance.delete(false).await.expect_err("terminate fails");

    assert!(matches!(err, LifecycleError::Provider(_)));
    assert_eq!(instance.state(), InstanceState::Pending);

    provider.heal_terminate("fake-1");
    instance.delete(false).await.expect("retried delete");
    assert_eq!(provider.terminate_calls("fake-1"), 2);
    assert_eq!(instance.state(), InstanceState::Terminating);
}

#[rstest]
#[tokio::test(start_paused = true)]
async fn scope_deletes_after_a_failing_body(provider: Arc<FakeProvider>) {
    let instance = launch(&provider, ScriptedRunner::new()).await;

    let outcome: Result<(), ScopeError<&str>> =
        instance.scope(|_| async { Err("body failed") }).await;

    assert!(matches!(outcome, Err(ScopeError::Body("body failed"))));
    assert_eq!(instance.state(), InstanceState::Terminated);
}

#[rstest]
#[tokio::test(start_paused = true)]
async fn boot_wait_surfaces_an_unstartable_ssh_client(provider: Arc<FakeProvider>) {
    let runner = ScriptedRunner::new();
    let instance = launch(&provider, runner.clone()).await;
    let started = Instant::now();

    let err = instance
        .wait(Duration::from_secs(30))
        .await
        .expect_err("spawn failure ends the wait");

    assert!(matches!(err, LifecycleError::Spawn { .. }), "unexpected: {err:?}");
    assert_eq!(started.elapsed(), Duration::ZERO);
    assert_eq!(instance.state(), InstanceState::Pending);
}

#[rstest]
#[tokio::test(start_paused = true)]
async fn delete_does_not_wait_for_a_running_boot_wait(provider: Arc<FakeProvider>) {
    let runner = SimulatedHostRunner::new();
    let instance = launch(&provider, runner.clone()).await;
    runner.add_host(instance.endpoint().address, Duration::from_secs(3600));

    let (boot, delete_took) = tokio::join!(instance.wait(Duration::from_secs(30)), async {
        sleep(Duration::from_millis(10)).await;
        let requested = Instant::now();
        instance.delete(false).await.expect("delete is accepted");
        requested.elapsed()
    });

    assert!(delete_took < Duration::from_secs(1), "delete blocked for {delete_took:?}");
    assert_eq!(provider.terminate_calls("fake-1"), 1);
    assert!(boot.is_err());
    assert_eq!(instance.state(), InstanceState::Terminating);
}

#[rstest]
#[tokio::test(start_paused = true)]
async fn concurrent_deletes_terminate_once() {
    let provider = Arc::new(FakeProvider::new().with_terminate_latency(Duration::from_secs(2)));
    let instance = launch(&provider, ScriptedRunner::new()).await;

    let (first, second) = tokio::join!(instance.delete(false), instance.delete(false));

    first.expect("first delete");
    second.expect("second delete");
    assert_eq!(provider.terminate_calls("fake-1"), 1);
    assert_eq!(instance.state(), InstanceState::Terminating);
}

#[rstest]
#[tokio::test]
async fn run_script_streams_the_script_over_stdin(provider: Arc<FakeProvider>) {
    let runner = ScriptedRunner::new();
    runner.push_success();
    runner.push_output(Some(0), "hello\n", "");
    let instance = launch(&provider, runner.clone()).await;

    let result = instance
        .run_script("#!/bin/sh\necho hello\n", Some("greet"))
        .await
        .expect("script runs");

    assert_eq!(result.stdout, "hello");
    let call = runner.invocations().pop().expect("script invocation");
    assert_eq!(call.stdin.as_deref(), Some("#!/bin/sh\necho hello\n"));
    let line = call.last_arg().expect("remote command");
    assert!(line.starts_with("sh -c "), "unexpected command: {line}");
    assert!(line.contains("run-script /tmp/cloudlift-script-"), "unexpected command: {line}");
    assert!(line.contains("EXIT"), "script must remove itself: {line}");
}

#[rstest]
#[tokio::test]
async fn clean_resets_cloud_init_as_root(provider: Arc<FakeProvider>) {
    let runner = ScriptedRunner::new();
    runner.push_success();
    runner.push_success();
    runner.push_success();
    let instance = launch(&provider, runner.clone()).await;

    instance.clean().await.expect("clean succeeds");

    let commands: Vec<_> = runner
        .invocations()
        .iter()
        .skip(1)
        .filter_map(CommandInvocation::last_arg)
        .collect();
    assert_eq!(
        commands,
        vec!["sudo -- cloud-init clean --logs", "sudo -- rm -rf /var/log/syslog"]
    );
}

#[rstest]
#[tokio::test]
async fn failing_clean_reports_the_command(provider: Arc<FakeProvider>) {
    let runner = ScriptedRunner::new();
    runner.push_success();
    runner.push_output(Some(127), "", "sudo: cloud-init: command not found\n");
    let instance = launch(&provider, runner.clone()).await;

    let err = instance.clean().await.expect_err("cloud-init is missing");

    assert_eq!(
        err,
        LifecycleError::CommandFailed {
            command: String::from("sudo -- cloud-init clean --logs"),
            return_code: 127,
            stderr: String::from("sudo: cloud-init: command not found"),
        }
    );
    assert_eq!(runner.invocations().len(), 2);
}

#[rstest]
#[tokio::test]
async fn install_refreshes_the_index_first(provider: Arc<FakeProvider>) {
    let runner = ScriptedRunner::new();
    runner.push_success();
    runner.push_success();
    runner.push_output(Some(0), "Setting up jq\n", "");
    let instance = launch(&provider, runner.clone()).await;

    let result = instance.install(&["curl", "jq"]).await.expect("install");

    assert_eq!(result.stdout, "Setting up jq");
    let commands: Vec<_> = runner
        .invocations()
        .iter()
        .skip(1)
        .filter_map(CommandInvocation::last_arg)
        .collect();
    assert_eq!(
        commands,
        vec![
            "sudo -- apt-get update",
            "sudo -- env DEBIAN_FRONTEND=noninteractive apt-get install --yes curl jq",
        ]
    );
}

#[rstest]
#[case::empty(&[])]
#[case::blank(&["curl", " "])]
#[tokio::test]
async fn install_rejects_missing_package_names(
    provider: Arc<FakeProvider>,
    #[case] packages: &[&str],
) {
    let runner = ScriptedRunner::new();
    let instance = launch(&provider, runner.clone()).await;

    let err = instance.install(packages).await.expect_err("nothing to install");

    assert_eq!(
        err,
        LifecycleError::InvalidRequest {
            field: String::from("packages")
        }
    );
    assert!(runner.invocations().is_empty());
}

#[rstest]
#[tokio::test]
async fn update_upgrades_without_prompts(provider: Arc<FakeProvider>) {
    let runner = ScriptedRunner::new();
    runner.push_success();
    runner.push_success();
    runner.push_success();
    let instance = launch(&provider, runner.clone()).await;

    instance.update().await.expect("update");

    let last = runner.invocations().pop().expect("upgrade invocation");
    assert_eq!(
        last.last_arg().as_deref(),
        Some("sudo -- env DEBIAN_FRONTEND=noninteractive apt-get --yes upgrade")
    );
}

#[rstest]
#[tokio::test(start_paused = true)]
async fn shutdown_and_start_cycle_the_power_state(provider: Arc<FakeProvider>) {
    let runner = SimulatedHostRunner::new();
    let instance = launch(&provider, runner.clone()).await;
    runner.add_host(instance.endpoint().address, Duration::ZERO);

    instance.shutdown(true).await.expect("shutdown");
    assert_eq!(instance.state(), InstanceState::Stopped);

    instance.start(true).await.expect("start");
    assert_eq!(instance.state(), InstanceState::Running);
    assert_eq!(provider.power_actions(), vec!["stop fake-1", "start fake-1"]);
}

#[rstest]
#[tokio::test(start_paused = true)]
async fn restart_without_wait_leaves_the_instance_pending(provider: Arc<FakeProvider>) {
    let instance = launch(&provider, ScriptedRunner::new()).await;

    instance.restart(false).await.expect("restart");

    assert_eq!(instance.state(), InstanceState::Pending);
    assert_eq!(provider.power_actions(), vec!["restart fake-1"]);
}

#[rstest]
#[tokio::test]
async fn power_operations_need_the_capability() {
    let provider = Arc::new(FakeProvider::new().with_capabilities(Capabilities {
        power_control: false,
        ..Capabilities::default()
    }));
    let instance = launch(&provider, ScriptedRunner::new()).await;

    assert_eq!(
        instance.shutdown(false).await,
        Err(LifecycleError::not_supported("shutdown", "fake"))
    );
    assert_eq!(
        instance.start(false).await,
        Err(LifecycleError::not_supported("start", "fake"))
    );
    assert_eq!(
        instance.restart(false).await,
        Err(LifecycleError::not_supported("restart", "fake"))
    );
    assert!(provider.power_actions().is_empty());
}

#[rstest]
#[tokio::test(start_paused = true)]
async fn deleted_instances_cannot_be_powered_back_on(provider: Arc<FakeProvider>) {
    let instance = launch(&provider, ScriptedRunner::new()).await;
    instance.delete(false).await.expect("delete");

    let err = instance.start(false).await.expect_err("instance is going away");

    assert!(matches!(err, LifecycleError::Provider(_)));
    assert_eq!(instance.state(), InstanceState::Terminating);
}
