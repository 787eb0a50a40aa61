//! Per-instance façade.
//!
//! An [`Instance`] pairs the provider handle with the SSH channel to the
//! host. It is shared through `Arc` so a session can track it while the
//! caller keeps using it; commands on one instance are serialised through
//! its channel lock, while different instances proceed independently.
//! Provider calls such as `terminate` never wait for that lock.

use std::fmt;
use std::future::Future;
use std::sync::{Arc, Weak};
use std::time::Duration;

use camino::Utf8Path;
use parking_lot::Mutex;
use tokio::time::{Instant, sleep};
use tracing::{debug, info};
use uuid::Uuid;

use crate::boot::{BootReport, BootWaiter, ReadinessProbe};
use crate::channel::{
    CommandRunner, ExecutionResult, ProcessCommandRunner, RemoteChannel, RemoteCommand,
};
use crate::cloud::ScopeError;
use crate::config::LifecycleTimings;
use crate::error::LifecycleError;
use crate::provider::{InstanceEndpoint, InstanceState, ProviderAdapter, ProviderHandle};
use crate::tracker::{
    CleanupFailure, CleanupReport, ResourceId, ResourceTracker, TeardownFuture, TrackedResource,
};

/// Writes standard input to the path in `$1`, runs it with the remaining
/// arguments, and removes it on exit.
const RUN_SCRIPT: &str = concat!(
    "set -e; s=\"$1\"; shift; cat > \"$s\"; ",
    "trap 'rm -f \"$s\"' EXIT; chmod +x \"$s\"; \"$s\" \"$@\""
);

/// Entry in the session tracker that a completed delete removes.
struct Registration {
    tracker: Weak<ResourceTracker>,
    id: ResourceId,
}

/// One provisioned remote machine.
pub struct Instance<R: CommandRunner = ProcessCommandRunner> {
    handle: ProviderHandle,
    provider: Arc<dyn ProviderAdapter>,
    channel: tokio::sync::Mutex<RemoteChannel<R>>,
    state: Mutex<InstanceState>,
    registration: Mutex<Option<Registration>>,
    timings: LifecycleTimings,
}

impl<R: CommandRunner> Instance<R> {
    /// Wraps a provider handle. The channel connects lazily on first use.
    #[must_use]
    pub fn new(
        handle: ProviderHandle,
        provider: Arc<dyn ProviderAdapter>,
        channel: RemoteChannel<R>,
        timings: LifecycleTimings,
    ) -> Self {
        Self {
            state: Mutex::new(handle.state),
            handle,
            provider,
            channel: tokio::sync::Mutex::new(channel),
            registration: Mutex::new(None),
            timings,
        }
    }

    /// Remembers the tracker entry so a completed delete can drop it.
    pub(crate) fn attach(&self, tracker: &Arc<ResourceTracker>, id: ResourceId) {
        *self.registration.lock() = Some(Registration {
            tracker: Arc::downgrade(tracker),
            id,
        });
    }

    fn release(&self) {
        let Some(Registration { tracker, id }) = self.registration.lock().take() else {
            return;
        };
        if let Some(tracker) = tracker.upgrade() {
            tracker.forget(id);
        }
    }

    #[must_use]
    pub(crate) const fn handle(&self) -> &ProviderHandle {
        &self.handle
    }

    /// Provider-assigned identifier.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.handle.id
    }

    /// Network endpoint used for SSH.
    #[must_use]
    pub const fn endpoint(&self) -> InstanceEndpoint {
        self.handle.endpoint
    }

    /// Last known state. Updated by the waiting, power and delete
    /// operations; never polled in the background.
    #[must_use]
    pub fn state(&self) -> InstanceState {
        *self.state.lock()
    }

    fn set_state(&self, state: InstanceState) {
        *self.state.lock() = state;
    }

    /// Sets `state` unless teardown has started.
    fn set_live_state(&self, state: InstanceState) {
        let mut current = self.state.lock();
        if !matches!(*current, InstanceState::Terminating | InstanceState::Terminated) {
            *current = state;
        }
    }

    /// Moves to `Terminating` unless teardown has already started, and
    /// returns the state seen beforehand.
    fn begin_termination(&self) -> InstanceState {
        let mut state = self.state.lock();
        let previous = *state;
        if !matches!(previous, InstanceState::Terminating | InstanceState::Terminated) {
            *state = InstanceState::Terminating;
        }
        previous
    }

    /// Stops the control master unless a command or boot wait holds the
    /// channel. A skipped master exits on its own after `ControlPersist`.
    async fn close_idle_channel(&self) {
        match self.channel.try_lock() {
            Ok(mut channel) => channel.close().await,
            Err(_) => {
                debug!(instance_id = %self.id(), "channel busy; leaving control master to expire");
            }
        }
    }

    /// Executes a command on the instance.
    ///
    /// Accepts shell strings, argument arrays, or a prepared
    /// [`RemoteCommand`].
    ///
    /// # Errors
    ///
    /// Returns connection errors from the channel. A non-zero exit status is
    /// reported through [`ExecutionResult::failed`], not as an error.
    pub async fn execute(
        &self,
        command: impl Into<RemoteCommand>,
    ) -> Result<ExecutionResult, LifecycleError> {
        let command = command.into();
        debug!(instance_id = %self.id(), command = %command.description(), "executing command");
        self.channel.lock().await.execute(&command).await
    }

    /// Runs `script` on the instance and returns its output.
    ///
    /// The script travels over standard input into a temporary file, is
    /// made executable, run, and removed again whether or not it succeeds.
    /// A shebang line picks the interpreter.
    ///
    /// # Errors
    ///
    /// Returns connection errors from the channel. A failing script is
    /// reported through [`ExecutionResult::failed`].
    pub async fn run_script(
        &self,
        script: &str,
        description: Option<&str>,
    ) -> Result<ExecutionResult, LifecycleError> {
        let path = format!("/tmp/cloudlift-script-{}", Uuid::new_v4().simple());
        let mut command =
            RemoteCommand::argv(["sh", "-c", RUN_SCRIPT, "run-script", path.as_str()])
                .with_stdin(script);
        if let Some(description) = description {
            command = command.described(description);
        }
        self.execute(command).await
    }

    async fn run_checked(&self, command: RemoteCommand) -> Result<ExecutionResult, LifecycleError> {
        let description = command.description().into_owned();
        let result = self.execute(command).await?;
        if result.failed() {
            return Err(LifecycleError::CommandFailed {
                command: description,
                return_code: result.return_code,
                stderr: result.stderr,
            });
        }
        Ok(result)
    }

    /// Resets cloud-init state and removes system logs so the instance can
    /// be captured as a pristine image.
    ///
    /// # Errors
    ///
    /// Returns [`LifecycleError::CommandFailed`] when either step exits
    /// non-zero, or a connection error from the channel.
    pub async fn clean(&self) -> Result<(), LifecycleError> {
        self.run_checked(RemoteCommand::argv(["cloud-init", "clean", "--logs"]).as_root())
            .await?;
        self.run_checked(RemoteCommand::argv(["rm", "-rf", "/var/log/syslog"]).as_root())
            .await?;
        info!(instance_id = %self.id(), "instance cleaned");
        Ok(())
    }

    /// Refreshes the package index and installs `packages` with `apt-get`.
    ///
    /// # Errors
    ///
    /// Returns [`LifecycleError::InvalidRequest`] for an empty package list,
    /// [`LifecycleError::CommandFailed`] when `apt-get` fails, or a
    /// connection error from the channel.
    pub async fn install(&self, packages: &[&str]) -> Result<ExecutionResult, LifecycleError> {
        if packages.is_empty() || packages.iter().any(|name| name.trim().is_empty()) {
            return Err(LifecycleError::InvalidRequest {
                field: String::from("packages"),
            });
        }
        self.refresh_packages().await?;
        let mut args = vec![
            "env",
            "DEBIAN_FRONTEND=noninteractive",
            "apt-get",
            "install",
            "--yes",
        ];
        args.extend_from_slice(packages);
        self.run_checked(RemoteCommand::argv(args).as_root()).await
    }

    /// Refreshes the package index and upgrades installed packages.
    ///
    /// # Errors
    ///
    /// Returns [`LifecycleError::CommandFailed`] when `apt-get` fails, or a
    /// connection error from the channel.
    pub async fn update(&self) -> Result<ExecutionResult, LifecycleError> {
        self.refresh_packages().await?;
        self.run_checked(
            RemoteCommand::argv([
                "env",
                "DEBIAN_FRONTEND=noninteractive",
                "apt-get",
                "--yes",
                "upgrade",
            ])
            .as_root(),
        )
        .await
    }

    async fn refresh_packages(&self) -> Result<(), LifecycleError> {
        self.run_checked(RemoteCommand::argv(["apt-get", "update"]).as_root())
            .await?;
        Ok(())
    }

    /// Copies a local file onto the instance.
    ///
    /// # Errors
    ///
    /// Returns [`LifecycleError::TransferFailure`] when the copy fails.
    pub async fn push_file(
        &self,
        local_path: &Utf8Path,
        remote_path: &str,
    ) -> Result<(), LifecycleError> {
        self.channel
            .lock()
            .await
            .push_file(local_path, remote_path)
            .await
    }

    /// Copies a file from the instance.
    ///
    /// # Errors
    ///
    /// Returns [`LifecycleError::TransferFailure`] when the copy fails.
    pub async fn pull_file(
        &self,
        remote_path: &str,
        local_path: &Utf8Path,
    ) -> Result<(), LifecycleError> {
        self.channel
            .lock()
            .await
            .pull_file(remote_path, local_path)
            .await
    }

    /// Retrieves serial console output through the provider API. Works
    /// without SSH connectivity.
    ///
    /// # Errors
    ///
    /// Returns [`LifecycleError::NotSupported`] when the provider cannot
    /// supply console output, or the provider's failure.
    pub async fn console_log(&self) -> Result<String, LifecycleError> {
        if !self.provider.capabilities().console_log {
            return Err(LifecycleError::not_supported(
                "console_log",
                self.provider.name(),
            ));
        }
        Ok(self.provider.console_log(&self.handle).await?)
    }

    /// Waits for the default boot marker.
    ///
    /// # Errors
    ///
    /// Returns [`LifecycleError::ConnectivityTimeout`] when the instance is
    /// not ready within `timeout`. The known state is left unchanged.
    pub async fn wait(&self, timeout: Duration) -> Result<BootReport, LifecycleError> {
        let probe = ReadinessProbe::marker_file(&self.timings.boot_marker);
        self.wait_for(probe, timeout).await
    }

    /// Waits until `probe` succeeds.
    ///
    /// # Errors
    ///
    /// Returns [`LifecycleError::ConnectivityTimeout`] when the probe does
    /// not succeed within `timeout`, or the local failure that stopped the
    /// probe from running (for example [`LifecycleError::Spawn`]). The
    /// known state is left unchanged.
    pub async fn wait_for(
        &self,
        probe: ReadinessProbe,
        timeout: Duration,
    ) -> Result<BootReport, LifecycleError> {
        let waiter = BootWaiter::new(probe, self.timings.boot_backoff);
        let report = {
            let mut channel = self.channel.lock().await;
            waiter.wait(&mut channel, timeout).await?
        };
        if !report.is_ready() {
            return Err(LifecycleError::timeout("boot", self.id()));
        }
        self.set_live_state(InstanceState::Running);
        Ok(report)
    }

    fn require_power_control(&self, operation: &str) -> Result<(), LifecycleError> {
        if self.provider.capabilities().power_control {
            return Ok(());
        }
        Err(LifecycleError::not_supported(operation, self.provider.name()))
    }

    /// Powers the instance off without deleting it. With `wait` set, polls
    /// until the provider reports it stopped.
    ///
    /// # Errors
    ///
    /// Returns [`LifecycleError::NotSupported`] without power control, the
    /// provider's failure, or [`LifecycleError::ConnectivityTimeout`] when
    /// the stop outlasts the configured stop timeout.
    pub async fn shutdown(&self, wait: bool) -> Result<(), LifecycleError> {
        self.require_power_control("shutdown")?;
        self.close_idle_channel().await;
        self.provider.stop(&self.handle).await?;
        self.set_live_state(InstanceState::Stopping);
        info!(instance_id = %self.id(), "shutdown requested");
        if wait {
            self.wait_for_stop(self.timings.stop_timeout).await?;
        }
        Ok(())
    }

    /// Powers a stopped instance back on. With `wait` set, waits for the
    /// boot marker.
    ///
    /// # Errors
    ///
    /// Returns [`LifecycleError::NotSupported`] without power control, the
    /// provider's failure, or the boot wait failure.
    pub async fn start(&self, wait: bool) -> Result<(), LifecycleError> {
        self.require_power_control("start")?;
        self.provider.start(&self.handle).await?;
        self.set_live_state(InstanceState::Pending);
        info!(instance_id = %self.id(), "start requested");
        if wait {
            self.wait(self.timings.boot_timeout).await?;
        }
        Ok(())
    }

    /// Reboots the instance. With `wait` set, waits for the boot marker.
    ///
    /// # Errors
    ///
    /// Returns [`LifecycleError::NotSupported`] without power control, the
    /// provider's failure, or the boot wait failure.
    pub async fn restart(&self, wait: bool) -> Result<(), LifecycleError> {
        self.require_power_control("restart")?;
        self.close_idle_channel().await;
        self.provider.restart(&self.handle).await?;
        self.set_live_state(InstanceState::Pending);
        info!(instance_id = %self.id(), "restart requested");
        if wait {
            self.wait(self.timings.boot_timeout).await?;
        }
        Ok(())
    }

    /// Polls the provider until the instance is stopped.
    ///
    /// # Errors
    ///
    /// Returns the provider's polling failure, or
    /// [`LifecycleError::ConnectivityTimeout`] when `timeout` elapses first.
    pub async fn wait_for_stop(&self, timeout: Duration) -> Result<(), LifecycleError> {
        if self.state() == InstanceState::Stopped {
            return Ok(());
        }
        self.poll_until("stop", |state| state == InstanceState::Stopped, timeout)
            .await?;
        self.set_live_state(InstanceState::Stopped);
        info!(instance_id = %self.id(), "instance stopped");
        Ok(())
    }

    /// Requests teardown. When `wait` is set, also waits up to the
    /// configured delete timeout for the provider to report it gone.
    ///
    /// Deleting a terminated instance is a no-op. Deleting one that is
    /// already terminating, including from a concurrent call, does not
    /// call the provider again. A running boot wait does not delay the
    /// request.
    ///
    /// # Errors
    ///
    /// Returns the provider's failure, which restores the earlier state, or
    /// [`LifecycleError::ConnectivityTimeout`] when waiting times out.
    pub async fn delete(&self, wait: bool) -> Result<(), LifecycleError> {
        let previous = self.begin_termination();
        match previous {
            InstanceState::Terminated => {
                debug!(instance_id = %self.id(), "instance already terminated");
                self.release();
                return Ok(());
            }
            InstanceState::Terminating => {
                debug!(instance_id = %self.id(), "termination already requested");
            }
            _ => {
                if let Err(err) = self.provider.terminate(&self.handle).await {
                    self.set_state(previous);
                    return Err(err.into());
                }
                info!(instance_id = %self.id(), "termination requested");
                self.close_idle_channel().await;
            }
        }
        if wait {
            self.wait_for_delete(self.timings.delete_timeout).await?;
        }
        Ok(())
    }

    /// Polls the provider until the instance is gone.
    ///
    /// # Errors
    ///
    /// Returns the provider's polling failure, or
    /// [`LifecycleError::ConnectivityTimeout`] when `timeout` elapses first.
    pub async fn wait_for_delete(&self, timeout: Duration) -> Result<(), LifecycleError> {
        if !self.state().is_gone() {
            self.poll_until("delete", InstanceState::is_gone, timeout)
                .await?;
            self.set_state(InstanceState::Terminated);
            info!(instance_id = %self.id(), "instance terminated");
        }
        self.release();
        Ok(())
    }

    async fn poll_until(
        &self,
        action: &str,
        reached: fn(InstanceState) -> bool,
        timeout: Duration,
    ) -> Result<(), LifecycleError> {
        let deadline = Instant::now() + timeout;
        loop {
            let state = self.provider.poll_state(&self.handle).await?;
            if reached(state) {
                return Ok(());
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(LifecycleError::timeout(action, self.id()));
            }
            debug!(instance_id = %self.id(), %state, action, "waiting for provider state");
            sleep(self.timings.delete_poll_interval.min(deadline - now)).await;
        }
    }

    /// Runs `body`, then deletes the instance and waits for it to go,
    /// whether or not the body succeeded.
    ///
    /// # Errors
    ///
    /// Returns [`ScopeError`] carrying the body failure, the teardown
    /// failure, or both.
    pub async fn scope<'a, F, Fut, T, E>(&'a self, body: F) -> Result<T, ScopeError<E>>
    where
        F: FnOnce(&'a Self) -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let outcome = body(self).await;
        let cleanup = match self.delete(true).await {
            Ok(()) => CleanupReport::default(),
            Err(source) => CleanupReport::from_failures(vec![CleanupFailure {
                resource: self.describe(),
                source,
            }]),
        };
        ScopeError::settle(outcome, cleanup)
    }
}

impl<R: CommandRunner> TrackedResource for Instance<R> {
    fn describe(&self) -> String {
        format!("instance {}", self.handle.id)
    }

    fn teardown(&self, wait: bool) -> TeardownFuture<'_> {
        Box::pin(self.delete(wait))
    }
}

impl<R: CommandRunner> fmt::Debug for Instance<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Instance")
            .field("id", &self.handle.id)
            .field("endpoint", &self.handle.endpoint)
            .field("provider", &self.provider.name())
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests;
