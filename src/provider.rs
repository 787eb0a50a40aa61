//! Capability interface implemented by every provider adapter.
//!
//! The core only ever holds `Arc<dyn ProviderAdapter>`; it never knows how a
//! vendor creates an instance, only how to track it, wait for it, talk to it,
//! and tear it down.

use std::fmt;
use std::future::Future;
use std::net::IpAddr;
use std::pin::Pin;

use serde_json::{Map, Value};

use crate::error::{LifecycleError, ProviderError};

/// Future returned by provider adapter operations.
pub type ProviderFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, ProviderError>> + Send + 'a>>;

/// Parameters passed to [`ProviderAdapter::create`].
///
/// Only `image_id` is interpreted by the core. Vendor-specific settings
/// travel in `parameters` untouched.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct LaunchRequest {
    /// Provider image identifier to boot.
    pub image_id: String,
    /// Instance type or flavour, when the provider needs one.
    pub instance_type: Option<String>,
    /// Cloud-init user data or boot script.
    pub user_data: Option<String>,
    /// Name of the uploaded SSH key to authorise. Filled from the session
    /// identity when left empty.
    pub key_name: Option<String>,
    /// Tag used to name and label created resources. Filled from the session
    /// tag when left empty.
    pub tag: Option<String>,
    /// Provider-specific launch parameters.
    pub parameters: Map<String, Value>,
}

impl LaunchRequest {
    /// Starts a builder for a [`LaunchRequest`].
    #[must_use]
    pub fn builder() -> LaunchRequestBuilder {
        LaunchRequestBuilder::default()
    }

    /// Validates the request.
    ///
    /// # Errors
    ///
    /// Returns [`LifecycleError::InvalidRequest`] when `image_id` is empty.
    pub fn validate(&self) -> Result<(), LifecycleError> {
        if self.image_id.trim().is_empty() {
            return Err(LifecycleError::InvalidRequest {
                field: String::from("image_id"),
            });
        }
        Ok(())
    }
}

/// Builder for [`LaunchRequest`] that trims string inputs.
#[derive(Clone, Debug, Default)]
pub struct LaunchRequestBuilder {
    request: LaunchRequest,
}

impl LaunchRequestBuilder {
    /// Sets the image identifier.
    #[must_use]
    pub fn image_id(mut self, value: impl Into<String>) -> Self {
        self.request.image_id = value.into().trim().to_owned();
        self
    }

    /// Sets the instance type.
    #[must_use]
    pub fn instance_type(mut self, value: impl Into<String>) -> Self {
        self.request.instance_type = Some(value.into().trim().to_owned());
        self
    }

    /// Sets the user data passed to the first boot.
    #[must_use]
    pub fn user_data(mut self, value: impl Into<String>) -> Self {
        self.request.user_data = Some(value.into());
        self
    }

    /// Sets the SSH key name.
    #[must_use]
    pub fn key_name(mut self, value: impl Into<String>) -> Self {
        self.request.key_name = Some(value.into().trim().to_owned());
        self
    }

    /// Sets the resource tag.
    #[must_use]
    pub fn tag(mut self, value: impl Into<String>) -> Self {
        self.request.tag = Some(value.into().trim().to_owned());
        self
    }

    /// Adds a provider-specific parameter.
    #[must_use]
    pub fn parameter(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.request.parameters.insert(key.into(), value.into());
        self
    }

    /// Builds and validates the [`LaunchRequest`].
    ///
    /// # Errors
    ///
    /// Returns [`LifecycleError::InvalidRequest`] when `image_id` is empty.
    pub fn build(self) -> Result<LaunchRequest, LifecycleError> {
        self.request.validate()?;
        Ok(self.request)
    }
}

/// Network endpoint used to reach an instance over SSH.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct InstanceEndpoint {
    /// Address assigned by the provider.
    pub address: IpAddr,
    /// TCP port for SSH.
    pub port: u16,
}

impl InstanceEndpoint {
    /// Default SSH port.
    pub const DEFAULT_PORT: u16 = 22;

    /// Creates an endpoint on the default SSH port.
    #[must_use]
    pub const fn new(address: IpAddr) -> Self {
        Self {
            address,
            port: Self::DEFAULT_PORT,
        }
    }

    /// Host form accepted by `scp`, bracketing IPv6 addresses.
    #[must_use]
    pub fn scp_host(&self) -> String {
        match self.address {
            IpAddr::V4(addr) => addr.to_string(),
            IpAddr::V6(addr) => format!("[{addr}]"),
        }
    }
}

impl fmt::Display for InstanceEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.address {
            IpAddr::V4(addr) => write!(f, "{addr}:{}", self.port),
            IpAddr::V6(addr) => write!(f, "[{addr}]:{}", self.port),
        }
    }
}

/// Provider-reported lifecycle state of an instance.
#[derive(Clone, Copy, Debug, Default, Eq, Hash, PartialEq)]
pub enum InstanceState {
    /// No state has been reported yet.
    #[default]
    Unknown,
    /// Creation accepted; the instance has not started.
    Pending,
    /// The instance is running.
    Running,
    /// The instance is shutting down.
    Stopping,
    /// The instance is stopped but still exists.
    Stopped,
    /// Teardown was requested and is in progress.
    Terminating,
    /// The instance no longer exists.
    Terminated,
}

impl InstanceState {
    /// Returns `true` once the provider reports the resource gone.
    #[must_use]
    pub const fn is_gone(self) -> bool {
        matches!(self, Self::Terminated)
    }
}

impl fmt::Display for InstanceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Unknown => "unknown",
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Stopping => "stopping",
            Self::Stopped => "stopped",
            Self::Terminating => "terminating",
            Self::Terminated => "terminated",
        };
        f.write_str(label)
    }
}

/// Handle returned by a provider once an instance exists.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ProviderHandle {
    /// Provider-assigned identifier.
    pub id: String,
    /// How to reach the instance.
    pub endpoint: InstanceEndpoint,
    /// State reported alongside the handle.
    pub state: InstanceState,
}

/// Optional operations a provider may offer.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Capabilities {
    /// Whether uploaded keys can be deleted through the provider API.
    pub key_deletion: bool,
    /// Whether serial console output can be retrieved.
    pub console_log: bool,
    /// Whether instances can be stopped, started and restarted in place.
    pub power_control: bool,
    /// Whether an instance can be captured as a reusable image.
    pub snapshots: bool,
}

impl Default for Capabilities {
    fn default() -> Self {
        Self {
            key_deletion: true,
            console_log: true,
            power_control: true,
            snapshots: true,
        }
    }
}

/// Interface implemented by every provider backend.
///
/// Adapters translate these calls into vendor SDK requests. They must report
/// an instance that can no longer be found as [`InstanceState::Terminated`]
/// from [`ProviderAdapter::poll_state`].
pub trait ProviderAdapter: Send + Sync {
    /// Short provider name used in diagnostics (for example `ec2`).
    fn name(&self) -> &str;

    /// Optional operations supported by this provider.
    fn capabilities(&self) -> Capabilities {
        Capabilities::default()
    }

    /// Creates an instance and returns once the provider accepted the request.
    fn create<'a>(&'a self, request: &'a LaunchRequest) -> ProviderFuture<'a, ProviderHandle>;

    /// Looks up an existing instance by identifier.
    fn describe<'a>(&'a self, instance_id: &'a str) -> ProviderFuture<'a, ProviderHandle>;

    /// Requests teardown of the instance without waiting for completion.
    fn terminate<'a>(&'a self, handle: &'a ProviderHandle) -> ProviderFuture<'a, ()>;

    /// Reports the current provider-side state of the instance.
    fn poll_state<'a>(&'a self, handle: &'a ProviderHandle) -> ProviderFuture<'a, InstanceState>;

    /// Uploads public key material under `name`.
    fn upload_key<'a>(&'a self, public_key: &'a str, name: &'a str) -> ProviderFuture<'a, ()>;

    /// Removes an uploaded key. Only called when
    /// [`Capabilities::key_deletion`] is set.
    fn delete_key<'a>(&'a self, name: &'a str) -> ProviderFuture<'a, ()>;

    /// Reports whether a key named `name` already exists remotely.
    fn key_exists<'a>(&'a self, name: &'a str) -> ProviderFuture<'a, bool>;

    /// Retrieves serial console output. Only called when
    /// [`Capabilities::console_log`] is set.
    fn console_log<'a>(&'a self, handle: &'a ProviderHandle) -> ProviderFuture<'a, String>;

    /// Requests a power-off that keeps the instance. Only called when
    /// [`Capabilities::power_control`] is set; [`ProviderAdapter::poll_state`]
    /// reports [`InstanceState::Stopped`] once it completes.
    fn stop<'a>(&'a self, handle: &'a ProviderHandle) -> ProviderFuture<'a, ()>;

    /// Powers a stopped instance back on. Only called when
    /// [`Capabilities::power_control`] is set.
    fn start<'a>(&'a self, handle: &'a ProviderHandle) -> ProviderFuture<'a, ()>;

    /// Reboots the instance. Only called when
    /// [`Capabilities::power_control`] is set.
    fn restart<'a>(&'a self, handle: &'a ProviderHandle) -> ProviderFuture<'a, ()>;

    /// Captures the instance as an image and returns the image identifier.
    /// Only called when [`Capabilities::snapshots`] is set.
    fn snapshot<'a>(&'a self, handle: &'a ProviderHandle) -> ProviderFuture<'a, String>;

    /// Removes an image. Only called when [`Capabilities::snapshots`] is set.
    fn delete_image<'a>(&'a self, image_id: &'a str) -> ProviderFuture<'a, ()>;
}
