//! Session configuration loading via `ortho-config`.

use std::time::Duration;

use ortho_config::OrthoConfig;
use serde::Deserialize;
use thiserror::Error;

use crate::error::LifecycleError;
use crate::key::KeyPair;
use crate::retry::Backoff;
use crate::util::{timestamped_tag, validate_tag};

/// Marker file written by cloud-init once the first boot completes.
pub const DEFAULT_BOOT_MARKER: &str = "/var/lib/cloud/instance/boot-finished";

/// Lifecycle settings for a cloud session, merged from defaults,
/// configuration files, environment variables, and CLI flags.
#[derive(Clone, Debug, Deserialize, OrthoConfig, PartialEq, Eq)]
#[ortho_config(
    prefix = "CLOUDLIFT",
    discovery(
        app_name = "cloudlift",
        env_var = "CLOUDLIFT_CONFIG_PATH",
        config_file_name = "cloudlift.toml",
        dotfile_name = ".cloudlift.toml",
        project_file_name = "cloudlift.toml"
    )
)]
pub struct LifecycleConfig {
    /// Base tag used to name and label every resource the session creates.
    #[ortho_config(default = "cloudlift".to_owned())]
    pub tag: String,
    /// Whether to append a `-MMDD-HHMMSS` suffix to the tag. Unset means
    /// yes; see [`LifecycleConfig::appends_timestamp`].
    pub timestamp_suffix: Option<bool>,
    /// Public key to authorise on launched instances. Supports `~/`.
    /// Discovered under `~/.ssh` when unset.
    pub public_key_path: Option<String>,
    /// Private key matching `public_key_path`. Derived by stripping `.pub`
    /// when unset.
    pub private_key_path: Option<String>,
    /// Name the key is uploaded under. Defaults to the local user name.
    pub key_name: Option<String>,
    /// Upper bound on boot readiness polling, in seconds.
    #[ortho_config(default = 300)]
    pub boot_timeout_secs: u64,
    /// Delay before the second readiness probe, in milliseconds.
    #[ortho_config(default = 1000)]
    pub boot_poll_interval_ms: u64,
    /// Cap on the delay between readiness probes, in milliseconds.
    #[ortho_config(default = 10_000)]
    pub boot_poll_max_interval_ms: u64,
    /// Remote path whose presence signals a completed boot.
    #[ortho_config(default = DEFAULT_BOOT_MARKER.to_owned())]
    pub boot_marker: String,
    /// Upper bound on waiting for teardown, in seconds.
    #[ortho_config(default = 300)]
    pub delete_timeout_secs: u64,
    /// Interval between teardown and shutdown state polls, in milliseconds.
    #[ortho_config(default = 5000)]
    pub delete_poll_interval_ms: u64,
    /// Upper bound on waiting for a shutdown, in seconds.
    #[ortho_config(default = 300)]
    pub stop_timeout_secs: u64,
}

/// Metadata for a configuration field, used to generate actionable error messages.
struct FieldMetadata {
    description: &'static str,
    env_var: &'static str,
    toml_key: &'static str,
}

impl FieldMetadata {
    const fn new(description: &'static str, env_var: &'static str, toml_key: &'static str) -> Self {
        Self {
            description,
            env_var,
            toml_key,
        }
    }

    fn hint(&self) -> String {
        format!(
            "set {} or add {} to cloudlift.toml",
            self.env_var, self.toml_key
        )
    }
}

const TAG: FieldMetadata = FieldMetadata::new("resource tag", "CLOUDLIFT_TAG", "tag");
const PUBLIC_KEY: FieldMetadata = FieldMetadata::new(
    "public key path",
    "CLOUDLIFT_PUBLIC_KEY_PATH",
    "public_key_path",
);
const PRIVATE_KEY: FieldMetadata = FieldMetadata::new(
    "private key path",
    "CLOUDLIFT_PRIVATE_KEY_PATH",
    "private_key_path",
);
const KEY_NAME: FieldMetadata =
    FieldMetadata::new("key name", "CLOUDLIFT_KEY_NAME", "key_name");
const BOOT_TIMEOUT: FieldMetadata = FieldMetadata::new(
    "boot timeout",
    "CLOUDLIFT_BOOT_TIMEOUT_SECS",
    "boot_timeout_secs",
);
const BOOT_INTERVAL: FieldMetadata = FieldMetadata::new(
    "boot poll interval",
    "CLOUDLIFT_BOOT_POLL_INTERVAL_MS",
    "boot_poll_interval_ms",
);
const BOOT_MAX_INTERVAL: FieldMetadata = FieldMetadata::new(
    "boot poll max interval",
    "CLOUDLIFT_BOOT_POLL_MAX_INTERVAL_MS",
    "boot_poll_max_interval_ms",
);
const BOOT_MARKER: FieldMetadata = FieldMetadata::new(
    "boot marker path",
    "CLOUDLIFT_BOOT_MARKER",
    "boot_marker",
);
const DELETE_TIMEOUT: FieldMetadata = FieldMetadata::new(
    "delete timeout",
    "CLOUDLIFT_DELETE_TIMEOUT_SECS",
    "delete_timeout_secs",
);
const STOP_TIMEOUT: FieldMetadata = FieldMetadata::new(
    "stop timeout",
    "CLOUDLIFT_STOP_TIMEOUT_SECS",
    "stop_timeout_secs",
);
const DELETE_INTERVAL: FieldMetadata = FieldMetadata::new(
    "delete poll interval",
    "CLOUDLIFT_DELETE_POLL_INTERVAL_MS",
    "delete_poll_interval_ms",
);

impl LifecycleConfig {
    fn require_field(value: &str, metadata: &FieldMetadata) -> Result<(), ConfigError> {
        if value.trim().is_empty() {
            return Err(ConfigError::MissingField(format!(
                "missing {}: {}",
                metadata.description,
                metadata.hint()
            )));
        }
        Ok(())
    }

    fn require_optional_field(
        value: Option<&str>,
        metadata: &FieldMetadata,
    ) -> Result<(), ConfigError> {
        value.map_or(Ok(()), |v| Self::require_field(v, metadata))
    }

    fn require_positive(value: u64, metadata: &FieldMetadata) -> Result<(), ConfigError> {
        if value == 0 {
            return Err(ConfigError::InvalidValue(format!(
                "{} must be greater than zero: {}",
                metadata.description,
                metadata.hint()
            )));
        }
        Ok(())
    }

    /// Loads configuration using the `ortho-config` derive. Values merge
    /// defaults, configuration files, environment variables, and CLI flags in
    /// that order of precedence.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Parse`] when the loader fails to merge sources.
    pub fn load_from_sources() -> Result<Self, ConfigError> {
        Self::load().map_err(|err| ConfigError::Parse(err.to_string()))
    }

    /// Loads configuration without attempting to parse CLI arguments. Values
    /// still merge defaults, configuration files, and environment variables.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Parse`] when the merge fails.
    pub fn load_without_cli_args() -> Result<Self, ConfigError> {
        Self::load_from_iter([std::ffi::OsString::from("cloudlift")])
            .map_err(|err| ConfigError::Parse(err.to_string()))
    }

    /// Performs semantic validation. Error messages name the environment
    /// variable and TOML key that supply each value.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::MissingField`] when a required or configured
    /// value is blank, or [`ConfigError::InvalidValue`] when a duration is
    /// zero or the poll interval bounds are inverted.
    pub fn validate(&self) -> Result<(), ConfigError> {
        Self::require_field(&self.tag, &TAG)?;
        Self::require_optional_field(self.public_key_path.as_deref(), &PUBLIC_KEY)?;
        Self::require_optional_field(self.private_key_path.as_deref(), &PRIVATE_KEY)?;
        Self::require_optional_field(self.key_name.as_deref(), &KEY_NAME)?;
        Self::require_field(&self.boot_marker, &BOOT_MARKER)?;
        Self::require_positive(self.boot_timeout_secs, &BOOT_TIMEOUT)?;
        Self::require_positive(self.boot_poll_interval_ms, &BOOT_INTERVAL)?;
        Self::require_positive(self.boot_poll_max_interval_ms, &BOOT_MAX_INTERVAL)?;
        Self::require_positive(self.delete_timeout_secs, &DELETE_TIMEOUT)?;
        Self::require_positive(self.delete_poll_interval_ms, &DELETE_INTERVAL)?;
        Self::require_positive(self.stop_timeout_secs, &STOP_TIMEOUT)?;
        if self.boot_poll_max_interval_ms < self.boot_poll_interval_ms {
            return Err(ConfigError::InvalidValue(format!(
                "{} must not be smaller than the {}: {}",
                BOOT_MAX_INTERVAL.description,
                BOOT_INTERVAL.description,
                BOOT_MAX_INTERVAL.hint()
            )));
        }
        Ok(())
    }

    /// Whether session tags get a timestamp suffix. Defaults to `true`.
    ///
    /// The flag is optional so an absent CLI switch leaves lower layers and
    /// the default in charge.
    #[must_use]
    pub const fn appends_timestamp(&self) -> bool {
        !matches!(self.timestamp_suffix, Some(false))
    }

    /// Resolves the tag applied to resources created by the session.
    ///
    /// # Errors
    ///
    /// Returns [`LifecycleError::InvalidTag`] when the final tag breaks
    /// provider naming rules.
    pub fn session_tag(&self) -> Result<String, LifecycleError> {
        let base = self.tag.trim();
        let tag = if self.appends_timestamp() {
            timestamped_tag(base)
        } else {
            base.to_owned()
        };
        validate_tag(&tag)?;
        Ok(tag)
    }

    /// Builds the session identity from the configured key paths, falling
    /// back to the conventional keys under `~/.ssh`.
    #[must_use]
    pub fn key_pair(&self) -> KeyPair {
        let discovered = match self.public_key_path.as_deref() {
            Some(public) => {
                let name = crate::util::local_user_name();
                KeyPair::new(public, self.private_key_path.as_deref(), name)
            }
            None => KeyPair::discover(),
        };
        match self.key_name.as_deref() {
            Some(name) => discovered.renamed(name.trim()),
            None => discovered,
        }
    }

    /// Converts raw settings into the durations used by waiting operations.
    #[must_use]
    pub fn timings(&self) -> LifecycleTimings {
        LifecycleTimings {
            boot_timeout: Duration::from_secs(self.boot_timeout_secs),
            boot_backoff: Backoff::new(
                Duration::from_millis(self.boot_poll_interval_ms),
                Duration::from_millis(self.boot_poll_max_interval_ms),
            ),
            boot_marker: self.boot_marker.clone(),
            delete_timeout: Duration::from_secs(self.delete_timeout_secs),
            delete_poll_interval: Duration::from_millis(self.delete_poll_interval_ms),
            stop_timeout: Duration::from_secs(self.stop_timeout_secs),
        }
    }
}

/// Waiting parameters shared by a session and its instances.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct LifecycleTimings {
    /// Default timeout for boot readiness.
    pub boot_timeout: Duration,
    /// Delay schedule between readiness probes.
    pub boot_backoff: Backoff,
    /// Path probed to detect boot completion.
    pub boot_marker: String,
    /// Default timeout for teardown.
    pub delete_timeout: Duration,
    /// Interval between teardown and shutdown polls.
    pub delete_poll_interval: Duration,
    /// Default timeout for a shutdown.
    pub stop_timeout: Duration,
}

impl Default for LifecycleTimings {
    fn default() -> Self {
        Self {
            boot_timeout: Duration::from_secs(300),
            boot_backoff: Backoff::new(Duration::from_secs(1), Duration::from_secs(10)),
            boot_marker: DEFAULT_BOOT_MARKER.to_owned(),
            delete_timeout: Duration::from_secs(300),
            delete_poll_interval: Duration::from_secs(5),
            stop_timeout: Duration::from_secs(300),
        }
    }
}

/// Errors raised during configuration loading and validation.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum ConfigError {
    /// Indicates a required configuration field is empty or missing.
    #[error("missing configuration field: {0}")]
    MissingField(String),
    /// Indicates a configuration value is present but unusable.
    #[error("invalid configuration value: {0}")]
    InvalidValue(String),
    /// Surfaces errors from the `ortho-config` loader.
    #[error("configuration parsing failed: {0}")]
    Parse(String),
}

impl From<ortho_config::OrthoError> for ConfigError {
    fn from(value: ortho_config::OrthoError) -> Self {
        Self::Parse(value.to_string())
    }
}
