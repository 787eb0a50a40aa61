//! Test support utilities shared across unit and integration tests.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet, VecDeque};
use std::env;
use std::ffi::OsString;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex as SyncMutex;
use tokio::sync::{Mutex, MutexGuard};
use tokio::time::Instant;

use crate::channel::{ChannelConfig, CommandOutput, CommandRunner, RunnerFuture};
use crate::config::LifecycleConfig;
use crate::error::{LifecycleError, ProviderError};
use crate::provider::{
    Capabilities, InstanceEndpoint, InstanceState, LaunchRequest, ProviderAdapter,
    ProviderFuture, ProviderHandle,
};

const FIRST_FAKE_ADDRESS: u32 = 0x0A00_0000;

/// Records a single invocation made through a test runner.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct CommandInvocation {
    /// Program name as passed to the runner.
    pub program: String,
    /// Arguments passed to the program.
    pub args: Vec<OsString>,
    /// Standard input handed to the program, decoded lossily.
    pub stdin: Option<String>,
}

impl CommandInvocation {
    fn new(program: &str, args: &[OsString], stdin: Option<&[u8]>) -> Self {
        Self {
            program: program.to_owned(),
            args: args.to_vec(),
            stdin: stdin.map(|bytes| String::from_utf8_lossy(bytes).into_owned()),
        }
    }

    /// Returns a shell-like command string for assertions.
    #[must_use]
    pub fn command_string(&self) -> String {
        let mut parts = Vec::with_capacity(self.args.len() + 1);
        parts.push(self.program.clone());
        parts.extend(
            self.args
                .iter()
                .map(|arg| arg.to_string_lossy().into_owned()),
        );
        parts.join(" ")
    }

    /// Returns `true` when `flag` appears as a standalone argument.
    #[must_use]
    pub fn has_arg(&self, flag: &str) -> bool {
        self.args.iter().any(|arg| arg == flag)
    }

    /// Returns the last argument, which carries the remote command for SSH
    /// invocations.
    #[must_use]
    pub fn last_arg(&self) -> Option<String> {
        self.args
            .last()
            .map(|arg| arg.to_string_lossy().into_owned())
    }

    fn host(&self) -> Option<String> {
        self.args.iter().find_map(|arg| {
            let text = arg.to_string_lossy();
            let (_, rest) = text.split_once('@')?;
            let host = rest.split_once(':').map_or(rest, |(host, _)| host);
            Some(host.trim_matches(['[', ']']).to_owned())
        })
    }
}

/// Scripted command runner that returns pre-seeded outputs in FIFO order.
///
/// Used to drive deterministic command outcomes without spawning processes.
#[derive(Clone, Debug, Default)]
pub struct ScriptedRunner {
    responses: Arc<SyncMutex<VecDeque<CommandOutput>>>,
    invocations: Arc<SyncMutex<Vec<CommandInvocation>>>,
}

impl ScriptedRunner {
    /// Creates a new runner with no queued responses.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a snapshot of all invocations recorded so far.
    #[must_use]
    pub fn invocations(&self) -> Vec<CommandInvocation> {
        self.invocations.lock().clone()
    }

    /// Pushes a successful exit status.
    pub fn push_success(&self) {
        self.push_output(Some(0), "", "");
    }

    /// Pushes a specific exit code.
    pub fn push_exit_code(&self, code: i32) {
        self.push_output(Some(code), "", "");
    }

    /// Pushes an SSH client failure (exit status 255) with `stderr`.
    pub fn push_ssh_error(&self, stderr: impl Into<String>) {
        self.push_output(Some(255), "", stderr);
    }

    /// Pushes a response with no exit code to simulate abnormal termination.
    pub fn push_missing_exit_code(&self) {
        self.push_output(None, "", "");
    }

    /// Pushes an explicit command output response.
    pub fn push_output(
        &self,
        code: Option<i32>,
        stdout: impl Into<String>,
        stderr: impl Into<String>,
    ) {
        self.responses.lock().push_back(CommandOutput {
            code,
            stdout: stdout.into(),
            stderr: stderr.into(),
        });
    }
}

impl CommandRunner for ScriptedRunner {
    fn run<'a>(
        &'a self,
        program: &'a str,
        args: &'a [OsString],
        stdin: Option<&'a [u8]>,
    ) -> RunnerFuture<'a> {
        self.invocations
            .lock()
            .push(CommandInvocation::new(program, args, stdin));
        let response = self.responses.lock().pop_front();
        Box::pin(async move {
            response.ok_or_else(|| LifecycleError::Spawn {
                program: program.to_owned(),
                message: String::from("no scripted response available"),
            })
        })
    }
}

#[derive(Clone, Copy, Debug)]
struct SimulatedHost {
    ready_at: Instant,
    reject_auth: bool,
}

/// Runner that behaves like a fleet of hosts which start accepting SSH
/// connections at scripted points in (tokio) time.
///
/// Control master starts and commands fail with `Connection refused` until
/// the host is ready; afterwards every command exits with status zero.
#[derive(Clone, Debug, Default)]
pub struct SimulatedHostRunner {
    hosts: Arc<SyncMutex<HashMap<String, SimulatedHost>>>,
    invocations: Arc<SyncMutex<Vec<CommandInvocation>>>,
}

impl SimulatedHostRunner {
    /// Creates a runner with no known hosts.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes `address` accept connections `ready_after` from now.
    pub fn add_host(&self, address: IpAddr, ready_after: Duration) {
        self.hosts.lock().insert(
            address.to_string(),
            SimulatedHost {
                ready_at: Instant::now() + ready_after,
                reject_auth: false,
            },
        );
    }

    /// Makes `address` reject every authentication attempt.
    pub fn reject_auth(&self, address: IpAddr) {
        self.hosts.lock().insert(
            address.to_string(),
            SimulatedHost {
                ready_at: Instant::now(),
                reject_auth: true,
            },
        );
    }

    /// Returns a snapshot of all invocations recorded so far.
    #[must_use]
    pub fn invocations(&self) -> Vec<CommandInvocation> {
        self.invocations.lock().clone()
    }

    fn respond(&self, invocation: &CommandInvocation) -> CommandOutput {
        let Some(host) = invocation.host() else {
            return ssh_failure("ssh: missing destination");
        };
        let script = self.hosts.lock().get(&host).copied();
        let Some(script) = script else {
            return ssh_failure(&format!(
                "ssh: Could not resolve hostname {host}: Name or service not known"
            ));
        };
        if invocation.has_arg("-O") {
            return success();
        }
        if script.reject_auth {
            return ssh_failure(&format!("ubuntu@{host}: Permission denied (publickey)."));
        }
        if Instant::now() < script.ready_at {
            return ssh_failure(&format!(
                "ssh: connect to host {host} port 22: Connection refused"
            ));
        }
        success()
    }
}

fn success() -> CommandOutput {
    CommandOutput {
        code: Some(0),
        stdout: String::new(),
        stderr: String::new(),
    }
}

fn ssh_failure(stderr: &str) -> CommandOutput {
    CommandOutput {
        code: Some(255),
        stdout: String::new(),
        stderr: stderr.to_owned(),
    }
}

impl CommandRunner for SimulatedHostRunner {
    fn run<'a>(
        &'a self,
        program: &'a str,
        args: &'a [OsString],
        stdin: Option<&'a [u8]>,
    ) -> RunnerFuture<'a> {
        let invocation = CommandInvocation::new(program, args, stdin);
        let output = self.respond(&invocation);
        self.invocations.lock().push(invocation);
        Box::pin(async move { Ok(output) })
    }
}

#[derive(Clone, Debug)]
struct FakeInstance {
    handle: ProviderHandle,
    terminate_requested_at: Option<Instant>,
    stopped: bool,
}

#[derive(Debug, Default)]
struct FakeState {
    instances: BTreeMap<String, FakeInstance>,
    keys: BTreeSet<String>,
    created: u32,
    failing_terminations: HashSet<String>,
    create_failure: Option<ProviderError>,
    terminate_calls: HashMap<String, usize>,
    key_deletions: Vec<String>,
    requests: Vec<LaunchRequest>,
    power_actions: Vec<String>,
    images: BTreeSet<String>,
    snapshots_taken: u32,
    image_deletions: Vec<String>,
}

/// In-memory provider adapter.
///
/// Instances get sequential identifiers (`fake-1`, `fake-2`, ...) and
/// addresses (`10.0.0.1`, `10.0.0.2`, ...). A terminated instance reports
/// [`InstanceState::Terminating`] until the configured deletion latency has
/// elapsed, then [`InstanceState::Terminated`]. Stopped instances report
/// [`InstanceState::Stopped`] until started again.
#[derive(Debug)]
pub struct FakeProvider {
    name: String,
    capabilities: Capabilities,
    deletion_latency: Duration,
    terminate_latency: Duration,
    state: SyncMutex<FakeState>,
}

impl Default for FakeProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeProvider {
    /// Creates a provider with every capability and instant deletion.
    #[must_use]
    pub fn new() -> Self {
        Self {
            name: String::from("fake"),
            capabilities: Capabilities::default(),
            deletion_latency: Duration::ZERO,
            terminate_latency: Duration::ZERO,
            state: SyncMutex::new(FakeState::default()),
        }
    }

    /// Overrides the advertised capabilities.
    #[must_use]
    pub const fn with_capabilities(mut self, capabilities: Capabilities) -> Self {
        self.capabilities = capabilities;
        self
    }

    /// Sets how long teardown takes after `terminate` is called.
    #[must_use]
    pub const fn with_deletion_latency(mut self, latency: Duration) -> Self {
        self.deletion_latency = latency;
        self
    }

    /// Sets how long each `terminate` call takes to return. The request is
    /// recorded before the delay.
    #[must_use]
    pub const fn with_terminate_latency(mut self, latency: Duration) -> Self {
        self.terminate_latency = latency;
        self
    }

    /// Seeds a key that already exists remotely.
    #[must_use]
    pub fn with_existing_key(self, name: &str) -> Self {
        self.state.lock().keys.insert(name.to_owned());
        self
    }

    /// Makes every `terminate` call for `instance_id` fail.
    pub fn fail_terminate(&self, instance_id: &str) {
        self.state
            .lock()
            .failing_terminations
            .insert(instance_id.to_owned());
    }

    /// Lets `terminate` calls for `instance_id` succeed again.
    pub fn heal_terminate(&self, instance_id: &str) {
        self.state.lock().failing_terminations.remove(instance_id);
    }

    /// Makes the next `create` call fail with `error`.
    pub fn fail_next_create(&self, error: ProviderError) {
        self.state.lock().create_failure = Some(error);
    }

    /// Number of `terminate` calls received for `instance_id`.
    #[must_use]
    pub fn terminate_calls(&self, instance_id: &str) -> usize {
        self.state
            .lock()
            .terminate_calls
            .get(instance_id)
            .copied()
            .unwrap_or(0)
    }

    /// Total number of `terminate` calls received.
    #[must_use]
    pub fn total_terminate_calls(&self) -> usize {
        self.state.lock().terminate_calls.values().sum()
    }

    /// Number of instances created so far.
    #[must_use]
    pub fn created(&self) -> u32 {
        self.state.lock().created
    }

    /// Identifiers of instances for which no termination was requested.
    #[must_use]
    pub fn live_instances(&self) -> Vec<String> {
        self.state
            .lock()
            .instances
            .values()
            .filter(|instance| instance.terminate_requested_at.is_none())
            .map(|instance| instance.handle.id.clone())
            .collect()
    }

    /// Names of keys currently present.
    #[must_use]
    pub fn keys(&self) -> Vec<String> {
        self.state.lock().keys.iter().cloned().collect()
    }

    /// Names passed to `delete_key`, in call order.
    #[must_use]
    pub fn key_deletions(&self) -> Vec<String> {
        self.state.lock().key_deletions.clone()
    }

    /// Launch requests received, in call order.
    #[must_use]
    pub fn requests(&self) -> Vec<LaunchRequest> {
        self.state.lock().requests.clone()
    }

    /// Power operations received, as `"<action> <instance id>"`.
    #[must_use]
    pub fn power_actions(&self) -> Vec<String> {
        self.state.lock().power_actions.clone()
    }

    /// Identifiers of images currently present.
    #[must_use]
    pub fn images(&self) -> Vec<String> {
        self.state.lock().images.iter().cloned().collect()
    }

    /// Identifiers passed to `delete_image`, in call order.
    #[must_use]
    pub fn image_deletions(&self) -> Vec<String> {
        self.state.lock().image_deletions.clone()
    }

    fn power(
        &self,
        action: &str,
        handle: &ProviderHandle,
        stopped: bool,
    ) -> Result<(), ProviderError> {
        let mut state = self.state.lock();
        state.power_actions.push(format!("{action} {}", handle.id));
        let instance = state
            .instances
            .get_mut(&handle.id)
            .filter(|instance| instance.terminate_requested_at.is_none())
            .ok_or_else(|| not_found(&handle.id))?;
        instance.stopped = stopped;
        Ok(())
    }

    fn instance_state(&self, instance: &FakeInstance) -> InstanceState {
        match instance.terminate_requested_at {
            None if instance.stopped => InstanceState::Stopped,
            None => InstanceState::Running,
            Some(at) if Instant::now() >= at + self.deletion_latency => InstanceState::Terminated,
            Some(_) => InstanceState::Terminating,
        }
    }
}

fn not_found(instance_id: &str) -> ProviderError {
    ProviderError::new(format!("instance {instance_id} not found")).with_code("NotFound")
}

impl ProviderAdapter for FakeProvider {
    fn name(&self) -> &str {
        &self.name
    }

    fn capabilities(&self) -> Capabilities {
        self.capabilities
    }

    fn create<'a>(&'a self, request: &'a LaunchRequest) -> ProviderFuture<'a, ProviderHandle> {
        let result = {
            let mut state = self.state.lock();
            state.requests.push(request.clone());
            if let Some(error) = state.create_failure.take() {
                Err(error)
            } else {
                state.created += 1;
                let handle = ProviderHandle {
                    id: format!("fake-{}", state.created),
                    endpoint: InstanceEndpoint::new(IpAddr::V4(Ipv4Addr::from(
                        FIRST_FAKE_ADDRESS + state.created,
                    ))),
                    state: InstanceState::Pending,
                };
                state.instances.insert(
                    handle.id.clone(),
                    FakeInstance {
                        handle: handle.clone(),
                        terminate_requested_at: None,
                        stopped: false,
                    },
                );
                Ok(handle)
            }
        };
        Box::pin(async move { result })
    }

    fn describe<'a>(&'a self, instance_id: &'a str) -> ProviderFuture<'a, ProviderHandle> {
        let result = {
            let state = self.state.lock();
            state.instances.get(instance_id).map_or_else(
                || Err(not_found(instance_id)),
                |instance| {
                    let mut handle = instance.handle.clone();
                    handle.state = self.instance_state(instance);
                    Ok(handle)
                },
            )
        };
        Box::pin(async move { result })
    }

    fn terminate<'a>(&'a self, handle: &'a ProviderHandle) -> ProviderFuture<'a, ()> {
        let result = {
            let mut state = self.state.lock();
            *state.terminate_calls.entry(handle.id.clone()).or_default() += 1;
            if state.failing_terminations.contains(&handle.id) {
                Err(ProviderError::new(format!(
                    "simulated termination failure for {}",
                    handle.id
                )))
            } else if let Some(instance) = state.instances.get_mut(&handle.id) {
                instance
                    .terminate_requested_at
                    .get_or_insert_with(Instant::now);
                Ok(())
            } else {
                Err(not_found(&handle.id))
            }
        };
        let latency = self.terminate_latency;
        Box::pin(async move {
            if !latency.is_zero() {
                tokio::time::sleep(latency).await;
            }
            result
        })
    }

    fn poll_state<'a>(&'a self, handle: &'a ProviderHandle) -> ProviderFuture<'a, InstanceState> {
        let result = self
            .state
            .lock()
            .instances
            .get(&handle.id)
            .map_or(InstanceState::Terminated, |instance| {
                self.instance_state(instance)
            });
        Box::pin(async move { Ok(result) })
    }

    fn upload_key<'a>(&'a self, _public_key: &'a str, name: &'a str) -> ProviderFuture<'a, ()> {
        self.state.lock().keys.insert(name.to_owned());
        Box::pin(async move { Ok(()) })
    }

    fn delete_key<'a>(&'a self, name: &'a str) -> ProviderFuture<'a, ()> {
        let result = {
            let mut state = self.state.lock();
            state.key_deletions.push(name.to_owned());
            if state.keys.remove(name) {
                Ok(())
            } else {
                Err(ProviderError::new(format!("key {name} not found")).with_code("NotFound"))
            }
        };
        Box::pin(async move { result })
    }

    fn key_exists<'a>(&'a self, name: &'a str) -> ProviderFuture<'a, bool> {
        let exists = self.state.lock().keys.contains(name);
        Box::pin(async move { Ok(exists) })
    }

    fn console_log<'a>(&'a self, handle: &'a ProviderHandle) -> ProviderFuture<'a, String> {
        Box::pin(async move { Ok(format!("console output for {}", handle.id)) })
    }

    fn stop<'a>(&'a self, handle: &'a ProviderHandle) -> ProviderFuture<'a, ()> {
        let result = self.power("stop", handle, true);
        Box::pin(async move { result })
    }

    fn start<'a>(&'a self, handle: &'a ProviderHandle) -> ProviderFuture<'a, ()> {
        let result = self.power("start", handle, false);
        Box::pin(async move { result })
    }

    fn restart<'a>(&'a self, handle: &'a ProviderHandle) -> ProviderFuture<'a, ()> {
        let result = self.power("restart", handle, false);
        Box::pin(async move { result })
    }

    fn snapshot<'a>(&'a self, handle: &'a ProviderHandle) -> ProviderFuture<'a, String> {
        let result = {
            let mut state = self.state.lock();
            if state.instances.contains_key(&handle.id) {
                state.snapshots_taken += 1;
                let image_id = format!("image-{}", state.snapshots_taken);
                state.images.insert(image_id.clone());
                Ok(image_id)
            } else {
                Err(not_found(&handle.id))
            }
        };
        Box::pin(async move { result })
    }

    fn delete_image<'a>(&'a self, image_id: &'a str) -> ProviderFuture<'a, ()> {
        let result = {
            let mut state = self.state.lock();
            state.image_deletions.push(image_id.to_owned());
            if state.images.remove(image_id) {
                Ok(())
            } else {
                Err(ProviderError::new(format!("image {image_id} not found")).with_code("NotFound"))
            }
        };
        Box::pin(async move { result })
    }
}

/// Lifecycle settings with fixed tags and short timings for tests.
#[must_use]
pub fn lifecycle_config(public_key_path: &str) -> LifecycleConfig {
    LifecycleConfig {
        tag: String::from("cloudlift-test"),
        timestamp_suffix: Some(false),
        public_key_path: Some(public_key_path.to_owned()),
        private_key_path: None,
        key_name: Some(String::from("cloudlift-test")),
        boot_timeout_secs: 60,
        boot_poll_interval_ms: 500,
        boot_poll_max_interval_ms: 2000,
        boot_marker: String::from(crate::config::DEFAULT_BOOT_MARKER),
        delete_timeout_secs: 60,
        delete_poll_interval_ms: 500,
        stop_timeout_secs: 60,
    }
}

/// Channel settings matching the documented defaults, without jitter.
#[must_use]
pub fn channel_config() -> ChannelConfig {
    ChannelConfig {
        ssh_bin: String::from("ssh"),
        scp_bin: String::from("scp"),
        ssh_user: String::from("ubuntu"),
        ssh_batch_mode: Some(true),
        ssh_strict_host_key_checking: None,
        ssh_known_hosts_file: String::from("/dev/null"),
        connect_timeout_secs: 10,
        control_dir: Some(String::from("/tmp")),
        control_persist_secs: 600,
        connect_attempts: 5,
        connect_base_delay_ms: 100,
        connect_max_delay_ms: 1000,
        connect_jitter: Some(false),
    }
}

/// Global mutex used to serialise environment mutation in tests.
pub static ENV_LOCK: Mutex<()> = Mutex::const_new(());

/// Guard that holds the env mutex and restores variables on drop.
pub struct EnvGuard {
    previous: Vec<(String, Option<OsString>)>,
    _guard: MutexGuard<'static, ()>,
}

impl EnvGuard {
    /// Sets multiple environment variables while holding a global mutex.
    pub async fn set_vars(pairs: &[(&str, &str)]) -> Self {
        debug_assert!(
            {
                let mut seen = BTreeSet::new();
                pairs.iter().all(|(key, _)| seen.insert(*key))
            },
            "duplicate environment variable keys passed to EnvGuard::set_vars"
        );

        let guard = ENV_LOCK.lock().await;
        let mut previous = Vec::with_capacity(pairs.len());
        for (key, value) in pairs {
            let old = env::var_os(key);
            // SAFETY: Environment mutation is serialised by `ENV_LOCK`, preventing races.
            unsafe { env::set_var(key, value) };
            previous.push(((*key).to_owned(), old));
        }

        Self {
            previous,
            _guard: guard,
        }
    }
}

impl Drop for EnvGuard {
    fn drop(&mut self) {
        for (key, old) in &self.previous {
            // SAFETY: Environment mutation is serialised by holding `_guard`.
            unsafe {
                match old {
                    Some(val) => env::set_var(key, val),
                    None => env::remove_var(key),
                }
            }
        }
    }
}
