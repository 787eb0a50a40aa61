//! Boot readiness polling.
//!
//! An instance counts as booted once its readiness probe exits with status
//! zero over SSH. Until then refused connections, rejected keys that
//! cloud-init has not installed yet, and failing probes mean "not ready"
//! and are retried until the deadline. Local failures, such as an `ssh`
//! binary that cannot be started, end the wait at once.

use std::fmt;
use std::time::Duration;

use tokio::time::{Instant, sleep};
use tracing::{debug, info};

use crate::channel::{CommandRunner, RemoteChannel, RemoteCommand};
use crate::config::DEFAULT_BOOT_MARKER;
use crate::error::LifecycleError;
use crate::retry::Backoff;

const MIN_DELAY: Duration = Duration::from_millis(1);

/// Probe errors that mean the host is not reachable or not provisioned yet.
const fn means_not_ready(err: &LifecycleError) -> bool {
    matches!(
        err,
        LifecycleError::ConnectivityTimeout { .. } | LifecycleError::AuthenticationRejected { .. }
    )
}

/// Phase of a boot wait.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum BootState {
    /// No probe has run yet.
    Pending,
    /// At least one probe ran and failed; the deadline has not passed.
    Polling,
    /// A probe succeeded.
    Ready,
    /// The deadline passed without a successful probe.
    TimedOut,
}

impl fmt::Display for BootState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Pending => "pending",
            Self::Polling => "polling",
            Self::Ready => "ready",
            Self::TimedOut => "timed out",
        };
        f.write_str(label)
    }
}

/// Outcome of [`BootWaiter::wait`].
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct BootReport {
    /// Final state; either [`BootState::Ready`] or [`BootState::TimedOut`].
    pub state: BootState,
    /// Number of probes that ran.
    pub attempts: u32,
    /// Time spent waiting.
    pub elapsed: Duration,
}

impl BootReport {
    /// Returns `true` when the instance became ready.
    #[must_use]
    pub fn is_ready(&self) -> bool {
        self.state == BootState::Ready
    }
}

/// Command whose success means the instance finished booting.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ReadinessProbe {
    command: RemoteCommand,
}

impl ReadinessProbe {
    /// Probe that checks for the presence of `marker`.
    #[must_use]
    pub fn marker_file(marker: &str) -> Self {
        Self {
            command: RemoteCommand::argv(["test", "-f", marker])
                .described(format!("check for boot marker {marker}")),
        }
    }

    /// Probe that runs an arbitrary command.
    #[must_use]
    pub const fn custom(command: RemoteCommand) -> Self {
        Self { command }
    }

    /// Command executed by the probe.
    #[must_use]
    pub const fn command(&self) -> &RemoteCommand {
        &self.command
    }
}

impl Default for ReadinessProbe {
    fn default() -> Self {
        Self::marker_file(DEFAULT_BOOT_MARKER)
    }
}

/// Polls a readiness probe until it succeeds or a deadline passes.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct BootWaiter {
    probe: ReadinessProbe,
    backoff: Backoff,
}

impl BootWaiter {
    /// Creates a waiter.
    #[must_use]
    pub const fn new(probe: ReadinessProbe, backoff: Backoff) -> Self {
        Self { probe, backoff }
    }

    /// Probe in use.
    #[must_use]
    pub const fn probe(&self) -> &ReadinessProbe {
        &self.probe
    }

    /// Polls until the probe succeeds or `timeout` elapses.
    ///
    /// The first probe runs immediately. Later probes follow the backoff
    /// schedule with every delay capped at the time remaining, and one
    /// final probe runs at the deadline. Running out of time is reported
    /// through [`BootState::TimedOut`], not as an error.
    ///
    /// # Errors
    ///
    /// Returns the probe's error when it is neither a connectivity timeout
    /// nor rejected credentials, for example [`LifecycleError::Spawn`] when
    /// the configured `ssh` binary cannot be started.
    pub async fn wait<R: CommandRunner>(
        &self,
        channel: &mut RemoteChannel<R>,
        timeout: Duration,
    ) -> Result<BootReport, LifecycleError> {
        let started = Instant::now();
        let deadline = started + timeout;
        let endpoint = channel.endpoint();
        let mut attempts: u32 = 0;

        loop {
            attempts += 1;
            match channel.probe(self.probe.command()).await {
                Ok(result) if result.ok() => {
                    let elapsed = started.elapsed();
                    info!(%endpoint, attempts, ?elapsed, "instance ready");
                    return Ok(BootReport {
                        state: BootState::Ready,
                        attempts,
                        elapsed,
                    });
                }
                Ok(result) => {
                    debug!(%endpoint, attempts, return_code = result.return_code, "readiness probe failed");
                }
                Err(err) if means_not_ready(&err) => {
                    debug!(%endpoint, attempts, error = %err, "host not reachable yet");
                }
                Err(err) => return Err(err),
            }

            let now = Instant::now();
            if now >= deadline {
                return Ok(BootReport {
                    state: BootState::TimedOut,
                    attempts,
                    elapsed: started.elapsed(),
                });
            }
            let remaining = deadline - now;
            let delay = self
                .backoff
                .delay(attempts - 1)
                .max(MIN_DELAY)
                .min(remaining);
            debug!(%endpoint, ?delay, ?remaining, "waiting for boot");
            sleep(delay).await;
        }
    }
}
