//! Provider-agnostic lifecycle core for short-lived cloud instances.
//!
//! A [`Cloud`] session launches instances through a [`ProviderAdapter`],
//! waits for them to boot, runs commands and copies files over SSH, and
//! records every resource it creates so a failed run never leaves
//! infrastructure behind (launch → wait for boot → execute → clean).

pub mod boot;
pub mod channel;
pub mod cloud;
pub mod config;
pub mod error;
pub mod instance;
pub mod key;
pub mod provider;
pub mod retry;
pub mod test_support;
pub mod tracker;
pub mod util;

pub use boot::{BootReport, BootState, BootWaiter, ReadinessProbe};
pub use channel::{
    ChannelConfig, CommandBody, CommandOutput, CommandRunner, ExecutionResult,
    ProcessCommandRunner, RemoteChannel, RemoteCommand,
};
pub use cloud::{Cloud, ScopeError};
pub use config::{ConfigError, LifecycleConfig, LifecycleTimings};
pub use error::{LifecycleError, ProviderError};
pub use instance::Instance;
pub use key::KeyPair;
pub use provider::{
    Capabilities, InstanceEndpoint, InstanceState, LaunchRequest, LaunchRequestBuilder,
    ProviderAdapter, ProviderFuture, ProviderHandle,
};
pub use retry::Backoff;
pub use tracker::{
    CleanupFailure, CleanupReport, ResourceId, ResourceTracker, TeardownFuture, TrackedResource,
};
