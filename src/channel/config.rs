//! SSH client settings and validation.
//!
//! [`ChannelConfig`] is loaded via `ortho-config`, which merges defaults,
//! configuration files, and environment variables. Toggles are optional so
//! the generated CLI layer never reports an absent flag as `false`.

use std::time::Duration;

use camino::Utf8PathBuf;
use ortho_config::OrthoConfig;
use serde::Deserialize;

use crate::config::ConfigError;
use crate::retry::Backoff;

/// Default remote login user.
pub const DEFAULT_SSH_USER: &str = "ubuntu";

/// SSH and transfer settings loaded via `ortho-config`.
#[derive(Clone, Debug, Deserialize, OrthoConfig, PartialEq, Eq)]
#[ortho_config(
    prefix = "CLOUDLIFT_SSH",
    discovery(
        app_name = "cloudlift",
        env_var = "CLOUDLIFT_CONFIG_PATH",
        config_file_name = "cloudlift.toml",
        dotfile_name = ".cloudlift.toml",
        project_file_name = "cloudlift.toml"
    )
)]
pub struct ChannelConfig {
    /// Path to the `ssh` executable.
    #[ortho_config(default = "ssh".to_owned())]
    pub ssh_bin: String,
    /// Path to the `scp` executable.
    #[ortho_config(default = "scp".to_owned())]
    pub scp_bin: String,
    /// Remote user to connect as.
    #[ortho_config(default = DEFAULT_SSH_USER.to_owned())]
    pub ssh_user: String,
    /// Whether to force batch mode for SSH to avoid password prompts. Unset
    /// means yes.
    pub ssh_batch_mode: Option<bool>,
    /// Whether to enforce host key checking. Unset means no, which suits
    /// ephemeral hosts.
    pub ssh_strict_host_key_checking: Option<bool>,
    /// Known hosts file override; defaults to `/dev/null` for ephemeral hosts.
    #[ortho_config(default = "/dev/null".to_owned())]
    pub ssh_known_hosts_file: String,
    /// TCP connect timeout for each SSH attempt, in seconds.
    #[ortho_config(default = 10)]
    pub connect_timeout_secs: u64,
    /// Directory holding control master sockets. Defaults to the OS
    /// temporary directory.
    pub control_dir: Option<String>,
    /// How long an idle control master stays alive, in seconds.
    #[ortho_config(default = 600)]
    pub control_persist_secs: u64,
    /// Connection attempts before giving up.
    #[ortho_config(default = 30)]
    pub connect_attempts: u32,
    /// Delay after the first failed connection attempt, in milliseconds.
    #[ortho_config(default = 1000)]
    pub connect_base_delay_ms: u64,
    /// Cap on the delay between connection attempts, in milliseconds.
    #[ortho_config(default = 10_000)]
    pub connect_max_delay_ms: u64,
    /// Whether to randomise retry delays. Unset means yes.
    pub connect_jitter: Option<bool>,
}

impl ChannelConfig {
    /// Ensures configuration values are present and usable.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::MissingField`] when a required field is blank
    /// or [`ConfigError::InvalidValue`] when a count or delay is zero.
    pub fn validate(&self) -> Result<(), ConfigError> {
        Self::require_value(&self.ssh_bin, "ssh_bin")?;
        Self::require_value(&self.scp_bin, "scp_bin")?;
        Self::require_value(&self.ssh_user, "ssh_user")?;
        Self::require_optional_value(self.control_dir.as_deref(), "control_dir")?;
        Self::require_positive(self.connect_timeout_secs, "connect_timeout_secs")?;
        Self::require_positive(u64::from(self.connect_attempts), "connect_attempts")?;
        Self::require_positive(self.connect_base_delay_ms, "connect_base_delay_ms")?;
        if self.connect_max_delay_ms < self.connect_base_delay_ms {
            return Err(ConfigError::InvalidValue(format!(
                "connect_max_delay_ms must not be smaller than connect_base_delay_ms: {}",
                Self::hint("connect_max_delay_ms")
            )));
        }
        Ok(())
    }

    fn hint(field: &str) -> String {
        format!(
            "set CLOUDLIFT_SSH_{} or add {field} to cloudlift.toml",
            field.to_uppercase()
        )
    }

    fn require_optional_value(value: Option<&str>, field: &str) -> Result<(), ConfigError> {
        match value {
            None => Ok(()),
            Some(v) if !v.trim().is_empty() => Ok(()),
            Some(_) => Err(ConfigError::MissingField(format!(
                "missing {field}: {}",
                Self::hint(field)
            ))),
        }
    }

    fn require_value(value: &str, field: &str) -> Result<(), ConfigError> {
        Self::require_optional_value(Some(value), field)
    }

    fn require_positive(value: u64, field: &str) -> Result<(), ConfigError> {
        if value == 0 {
            return Err(ConfigError::InvalidValue(format!(
                "{field} must be greater than zero: {}",
                Self::hint(field)
            )));
        }
        Ok(())
    }

    /// Loads configuration using defaults, configuration files, and
    /// environment variables, ignoring CLI arguments.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Parse`] when merging sources fails.
    pub fn load_without_cli_args() -> Result<Self, ConfigError> {
        Self::load_from_iter([std::ffi::OsString::from("cloudlift")])
            .map_err(|err| ConfigError::Parse(err.to_string()))
    }

    /// Loads configuration using the default argument iterator.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Parse`] when merging sources fails.
    pub fn load_from_sources() -> Result<Self, ConfigError> {
        Self::load().map_err(|err| ConfigError::Parse(err.to_string()))
    }

    /// Whether SSH runs with `BatchMode=yes`. Defaults to `true`.
    #[must_use]
    pub const fn batch_mode(&self) -> bool {
        !matches!(self.ssh_batch_mode, Some(false))
    }

    /// Whether host keys are verified. Defaults to `false`.
    #[must_use]
    pub const fn strict_host_key_checking(&self) -> bool {
        matches!(self.ssh_strict_host_key_checking, Some(true))
    }

    /// Whether connection retry delays are randomised. Defaults to `true`.
    #[must_use]
    pub const fn jitter(&self) -> bool {
        !matches!(self.connect_jitter, Some(false))
    }

    /// Retry schedule for connection attempts.
    #[must_use]
    pub const fn connect_backoff(&self) -> Backoff {
        Backoff::new(
            Duration::from_millis(self.connect_base_delay_ms),
            Duration::from_millis(self.connect_max_delay_ms),
        )
        .with_jitter(self.jitter())
    }

    /// Directory in which control sockets are created.
    #[must_use]
    pub fn control_dir(&self) -> Utf8PathBuf {
        self.control_dir.as_deref().map_or_else(
            || Utf8PathBuf::from(std::env::temp_dir().to_string_lossy().into_owned()),
            |dir| Utf8PathBuf::from(crate::util::expand_tilde(dir)),
        )
    }
}
