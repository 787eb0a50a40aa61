//! Command execution and file transfer over the system OpenSSH client.
//!
//! A [`RemoteChannel`] owns one OpenSSH control master per instance.
//! Commands and `scp` transfers multiplex over its control socket, so the
//! handshake cost is paid once. Connection failures are classified from the
//! client's exit status and diagnostics: rejected credentials end the
//! operation immediately, everything else is retried with backoff.

use std::ffi::OsString;
use std::sync::Arc;

use camino::{Utf8Path, Utf8PathBuf};
use tokio::time::sleep;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::LifecycleError;
use crate::provider::InstanceEndpoint;
use crate::retry::Backoff;

mod command;
mod config;
mod types;

pub use command::{CommandBody, RemoteCommand};
pub use config::{ChannelConfig, DEFAULT_SSH_USER};
pub use types::{CommandOutput, CommandRunner, ExecutionResult, ProcessCommandRunner, RunnerFuture};

/// Exit status OpenSSH reports for its own failures.
const SSH_ERROR_STATUS: i32 = 255;

const AUTH_FAILURES: [&str; 3] = [
    "Permission denied",
    "Too many authentication failures",
    "Host key verification failed",
];

const TRANSPORT_FAILURES: [&str; 9] = [
    "Connection refused",
    "Connection timed out",
    "Operation timed out",
    "No route to host",
    "Network is unreachable",
    "Connection reset",
    "Connection closed",
    "Could not resolve hostname",
    "kex_exchange_identification",
];

/// How a failed SSH invocation should be treated.
#[derive(Clone, Debug, Eq, PartialEq)]
enum Failure {
    /// The host rejected the credentials; retrying cannot help.
    Rejected(String),
    /// The connection could not be used; a retry may succeed.
    Transport(String),
}

fn diagnostics(output: &CommandOutput) -> String {
    output.stderr.trim().to_owned()
}

/// Classifies a failed control master start.
fn classify_connect(output: &CommandOutput) -> Failure {
    let message = diagnostics(output);
    if AUTH_FAILURES
        .iter()
        .any(|pattern| output.stderr.contains(pattern))
    {
        return Failure::Rejected(message);
    }
    Failure::Transport(message)
}

/// Classifies the output of a multiplexed command. Returns `None` when the
/// exit status belongs to the remote command.
fn classify_command(output: &CommandOutput) -> Option<Failure> {
    if output.code.is_some_and(|code| code != SSH_ERROR_STATUS) {
        return None;
    }
    if AUTH_FAILURES
        .iter()
        .any(|pattern| output.stderr.contains(pattern))
    {
        return Some(Failure::Rejected(diagnostics(output)));
    }
    if output.code.is_none()
        || TRANSPORT_FAILURES
            .iter()
            .any(|pattern| output.stderr.contains(pattern))
    {
        return Some(Failure::Transport(diagnostics(output)));
    }
    None
}

/// Persistent SSH session to one instance.
#[derive(Debug)]
pub struct RemoteChannel<R: CommandRunner = ProcessCommandRunner> {
    endpoint: InstanceEndpoint,
    config: ChannelConfig,
    identity: Utf8PathBuf,
    backoff: Backoff,
    runner: Arc<R>,
    control_path: Utf8PathBuf,
    connected: bool,
}

impl<R: CommandRunner> RemoteChannel<R> {
    /// Creates a disconnected channel. No process is started until the
    /// first operation.
    #[must_use]
    pub fn new(
        endpoint: InstanceEndpoint,
        identity: &Utf8Path,
        config: ChannelConfig,
        runner: Arc<R>,
    ) -> Self {
        let control_path = config
            .control_dir()
            .join(format!("cloudlift-{}", Uuid::new_v4().simple()));
        Self {
            endpoint,
            backoff: config.connect_backoff(),
            config,
            identity: identity.to_path_buf(),
            runner,
            control_path,
            connected: false,
        }
    }

    /// Overrides the retry schedule used by [`RemoteChannel::connect`].
    #[must_use]
    pub const fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    /// Endpoint this channel talks to.
    #[must_use]
    pub const fn endpoint(&self) -> InstanceEndpoint {
        self.endpoint
    }

    /// Whether a control master is believed to be running.
    #[must_use]
    pub const fn is_connected(&self) -> bool {
        self.connected
    }

    /// Path of the control socket.
    #[must_use]
    pub fn control_path(&self) -> &Utf8Path {
        &self.control_path
    }

    fn target(&self) -> String {
        format!("{}@{}", self.config.ssh_user, self.endpoint)
    }

    fn destination(&self) -> String {
        format!("{}@{}", self.config.ssh_user, self.endpoint.address)
    }

    fn scp_location(&self, path: &str) -> String {
        format!(
            "{}@{}:{path}",
            self.config.ssh_user,
            self.endpoint.scp_host()
        )
    }

    fn common_options(&self, port_flag: &str) -> Vec<OsString> {
        let mut args = vec![
            OsString::from(port_flag),
            OsString::from(self.endpoint.port.to_string()),
            OsString::from("-i"),
            OsString::from(self.identity.as_str()),
        ];

        if self.config.batch_mode() {
            args.push(OsString::from("-o"));
            args.push(OsString::from("BatchMode=yes"));
        }

        if !self.config.strict_host_key_checking() {
            args.push(OsString::from("-o"));
            args.push(OsString::from("StrictHostKeyChecking=no"));
        }

        if !self.config.ssh_known_hosts_file.trim().is_empty() {
            args.push(OsString::from("-o"));
            args.push(OsString::from(format!(
                "UserKnownHostsFile={}",
                self.config.ssh_known_hosts_file
            )));
        }

        args.push(OsString::from("-o"));
        args.push(OsString::from(format!(
            "ConnectTimeout={}",
            self.config.connect_timeout_secs
        )));
        args.push(OsString::from("-o"));
        args.push(OsString::from(format!("ControlPath={}", self.control_path)));
        args
    }

    fn master_args(&self) -> Vec<OsString> {
        let mut args = self.common_options("-p");
        args.extend([
            OsString::from("-M"),
            OsString::from("-N"),
            OsString::from("-f"),
            OsString::from("-o"),
            OsString::from(format!(
                "ControlPersist={}s",
                self.config.control_persist_secs
            )),
        ]);
        args.push(OsString::from(self.destination()));
        args
    }

    fn command_args(&self, command: &RemoteCommand) -> Vec<OsString> {
        let mut args = self.common_options("-p");
        args.push(OsString::from("-o"));
        args.push(OsString::from("ControlMaster=no"));
        args.push(OsString::from(self.destination()));
        args.push(OsString::from(command.render()));
        args
    }

    fn scp_args(&self, from: &str, to: &str) -> Vec<OsString> {
        let mut args = self.common_options("-P");
        args.push(OsString::from("-q"));
        args.push(OsString::from(from));
        args.push(OsString::from(to));
        args
    }

    async fn start_master(&mut self) -> Result<Result<(), Failure>, LifecycleError> {
        let args = self.master_args();
        let output = self.runner.run(&self.config.ssh_bin, &args, None).await?;
        if output.is_success() {
            self.connected = true;
            return Ok(Ok(()));
        }
        Ok(Err(classify_connect(&output)))
    }

    /// Makes a single connection attempt without retrying.
    ///
    /// # Errors
    ///
    /// Returns [`LifecycleError::AuthenticationRejected`] when the host
    /// rejects the credentials, or [`LifecycleError::ConnectivityTimeout`]
    /// when the host cannot be reached.
    pub async fn try_connect(&mut self) -> Result<(), LifecycleError> {
        if self.connected {
            return Ok(());
        }
        match self.start_master().await? {
            Ok(()) => Ok(()),
            Err(Failure::Rejected(message)) => Err(LifecycleError::AuthenticationRejected {
                target: self.target(),
                message,
            }),
            Err(Failure::Transport(message)) => {
                debug!(host = %self.target(), %message, "ssh connection attempt failed");
                Err(LifecycleError::timeout("ssh connect", self.target()))
            }
        }
    }

    /// Establishes the control master, retrying transient failures with
    /// backoff up to the configured number of attempts.
    ///
    /// # Errors
    ///
    /// Returns [`LifecycleError::AuthenticationRejected`] immediately when
    /// the host rejects the credentials, or
    /// [`LifecycleError::ConnectivityTimeout`] once attempts are exhausted.
    pub async fn connect(&mut self) -> Result<(), LifecycleError> {
        if self.connected {
            return Ok(());
        }
        let attempts = self.config.connect_attempts.max(1);
        for attempt in 0..attempts {
            match self.start_master().await? {
                Ok(()) => {
                    info!(host = %self.target(), attempt, "ssh connection established");
                    return Ok(());
                }
                Err(Failure::Rejected(message)) => {
                    return Err(LifecycleError::AuthenticationRejected {
                        target: self.target(),
                        message,
                    });
                }
                Err(Failure::Transport(message)) => {
                    warn!(host = %self.target(), attempt, %message, "ssh connection failed");
                    if attempt + 1 < attempts {
                        sleep(self.backoff.delay(attempt)).await;
                    }
                }
            }
        }
        Err(LifecycleError::timeout("ssh connect", self.target()))
    }

    async fn run_command(
        &self,
        command: &RemoteCommand,
    ) -> Result<Result<CommandOutput, Failure>, LifecycleError> {
        let args = self.command_args(command);
        let output = self
            .runner
            .run(&self.config.ssh_bin, &args, command.stdin())
            .await?;
        Ok(classify_command(&output).map_or(Ok(output), Err))
    }

    /// Runs `command` once over an existing connection, making a single
    /// connection attempt first when needed. Used for readiness polling.
    ///
    /// # Errors
    ///
    /// Returns the error from [`RemoteChannel::try_connect`], or
    /// [`LifecycleError::ConnectivityTimeout`] when the connection drops.
    pub async fn probe(&mut self, command: &RemoteCommand) -> Result<ExecutionResult, LifecycleError> {
        self.try_connect().await?;
        match self.run_command(command).await? {
            Ok(output) => Ok(ExecutionResult::from_output(output)),
            Err(failure) => Err(self.lost_connection(failure)),
        }
    }

    fn lost_connection(&mut self, failure: Failure) -> LifecycleError {
        self.connected = false;
        match failure {
            Failure::Rejected(message) => LifecycleError::AuthenticationRejected {
                target: self.target(),
                message,
            },
            Failure::Transport(message) => {
                debug!(host = %self.target(), %message, "ssh transport failure");
                LifecycleError::timeout("ssh command", self.target())
            }
        }
    }

    /// Executes `command`, connecting first when needed.
    ///
    /// When the connection turns out to be stale the channel reconnects and
    /// re-runs the command once.
    ///
    /// # Errors
    ///
    /// Returns connection errors from [`RemoteChannel::connect`], or
    /// [`LifecycleError::ConnectivityTimeout`] when the command cannot be
    /// delivered after reconnecting. A non-zero remote exit status is not an
    /// error.
    pub async fn execute(
        &mut self,
        command: &RemoteCommand,
    ) -> Result<ExecutionResult, LifecycleError> {
        self.connect().await?;
        debug!(host = %self.target(), command = %command.description(), "executing");
        match self.run_command(command).await? {
            Ok(output) => return Ok(ExecutionResult::from_output(output)),
            Err(failure @ Failure::Rejected(_)) => return Err(self.lost_connection(failure)),
            Err(Failure::Transport(message)) => {
                warn!(host = %self.target(), %message, "connection lost; reconnecting");
                self.connected = false;
            }
        }
        self.connect().await?;
        match self.run_command(command).await? {
            Ok(output) => Ok(ExecutionResult::from_output(output)),
            Err(failure) => Err(self.lost_connection(failure)),
        }
    }

    /// Copies a local file to `remote_path` on the instance.
    ///
    /// # Errors
    ///
    /// Returns [`LifecycleError::TransferFailure`] when the local file is
    /// missing or `scp` fails, or a connection error from
    /// [`RemoteChannel::connect`].
    pub async fn push_file(
        &mut self,
        local_path: &Utf8Path,
        remote_path: &str,
    ) -> Result<(), LifecycleError> {
        let destination = self.scp_location(remote_path);
        let is_file = tokio::fs::metadata(local_path)
            .await
            .is_ok_and(|metadata| metadata.is_file());
        if !is_file {
            return Err(LifecycleError::TransferFailure {
                origin: local_path.to_string(),
                destination,
                message: String::from("local file does not exist"),
            });
        }
        self.transfer(local_path.as_str(), &destination).await
    }

    /// Copies `remote_path` from the instance to a local file.
    ///
    /// # Errors
    ///
    /// Returns [`LifecycleError::TransferFailure`] when `scp` fails, or a
    /// connection error from [`RemoteChannel::connect`].
    pub async fn pull_file(
        &mut self,
        remote_path: &str,
        local_path: &Utf8Path,
    ) -> Result<(), LifecycleError> {
        let origin = self.scp_location(remote_path);
        self.transfer(&origin, local_path.as_str()).await
    }

    async fn transfer(&mut self, from: &str, to: &str) -> Result<(), LifecycleError> {
        self.connect().await?;
        debug!(host = %self.target(), from, to, "transferring file");
        let args = self.scp_args(from, to);
        let output = self.runner.run(&self.config.scp_bin, &args, None).await?;
        if output.is_success() {
            return Ok(());
        }
        if classify_command(&output).is_some() {
            self.connected = false;
        }
        Err(LifecycleError::TransferFailure {
            origin: from.to_owned(),
            destination: to.to_owned(),
            message: diagnostics(&output),
        })
    }

    /// Stops the control master. Failures are logged and otherwise ignored.
    pub async fn close(&mut self) {
        if !self.connected {
            return;
        }
        let mut args = self.common_options("-p");
        args.push(OsString::from("-O"));
        args.push(OsString::from("exit"));
        args.push(OsString::from(self.destination()));
        match self.runner.run(&self.config.ssh_bin, &args, None).await {
            Ok(output) if output.is_success() => {
                debug!(host = %self.target(), "closed ssh connection");
            }
            Ok(output) => {
                debug!(host = %self.target(), stderr = %diagnostics(&output), "ssh close reported failure");
            }
            Err(err) => debug!(host = %self.target(), error = %err, "ssh close failed"),
        }
        self.connected = false;
    }
}
