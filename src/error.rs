//! Error taxonomy shared by every lifecycle operation.
//!
//! Variants describe the kind of failure rather than its origin so callers
//! can branch on capability, timeout, or credential problems without parsing
//! messages. Provider failures pass through untouched as [`ProviderError`].

use thiserror::Error;

use crate::config::ConfigError;

/// Opaque failure reported by a provider adapter.
///
/// The core never interprets `code`; it is carried so callers can inspect
/// provider-specific fault codes when they need to.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
#[error("{message}")]
pub struct ProviderError {
    /// Message returned by the provider SDK or API.
    pub message: String,
    /// Provider-specific fault code, when one was reported.
    pub code: Option<String>,
}

impl ProviderError {
    /// Creates a provider error without a fault code.
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            code: None,
        }
    }

    /// Attaches a provider-specific fault code.
    #[must_use]
    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }
}

/// Errors raised by the lifecycle core.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum LifecycleError {
    /// Raised when a boot probe, teardown poll, or connection retry loop
    /// exceeds its deadline. Callers may relaunch or wait again.
    #[error("timed out waiting for {action} on {target}")]
    ConnectivityTimeout {
        /// Operation being waited on (for example `boot`).
        action: String,
        /// Instance identifier or endpoint being waited on.
        target: String,
    },
    /// Raised when the remote host rejects the configured credentials.
    #[error("authentication rejected by {target}: {message}")]
    AuthenticationRejected {
        /// Endpoint that rejected the credentials.
        target: String,
        /// Diagnostic output captured from the SSH client.
        message: String,
    },
    /// Raised when creating a resource whose name is already taken.
    #[error("{kind} '{name}' already exists")]
    DuplicateResource {
        /// Resource kind (for example `key`).
        kind: String,
        /// Conflicting name.
        name: String,
    },
    /// Raised when the provider does not offer the requested operation.
    #[error("{operation} is not supported by provider {provider}")]
    NotSupported {
        /// Operation that was requested.
        operation: String,
        /// Provider name reported by the adapter.
        provider: String,
    },
    /// Raised when a file push or pull fails. Transfers are never resumed.
    #[error("failed to transfer {origin} to {destination}: {message}")]
    TransferFailure {
        /// Source location of the transfer.
        origin: String,
        /// Destination location of the transfer.
        destination: String,
        /// Diagnostic output captured from the transfer client.
        message: String,
    },
    /// Raised when a maintenance command the core issues itself, such as a
    /// package install, exits with a non-zero status. Commands run through
    /// `execute` report their status as data instead.
    #[error("{command} exited with status {return_code}: {stderr}")]
    CommandFailed {
        /// Description of the command.
        command: String,
        /// Remote exit status.
        return_code: i32,
        /// Captured standard error.
        stderr: String,
    },
    /// Passthrough of a provider adapter failure.
    #[error("provider error: {0}")]
    Provider(#[from] ProviderError),
    /// Raised when session or channel configuration fails validation.
    #[error(transparent)]
    Config(#[from] ConfigError),
    /// Raised when a launch request or package list is missing a required
    /// value.
    #[error("invalid request: missing or empty field {field}")]
    InvalidRequest {
        /// Name of the offending field.
        field: String,
    },
    /// Raised when a resource tag does not satisfy provider naming rules.
    #[error("invalid tag '{tag}': {reason}")]
    InvalidTag {
        /// Tag after any timestamp suffix was applied.
        tag: String,
        /// Rule that the tag violated.
        reason: String,
    },
    /// Raised when local SSH key material cannot be read.
    #[error("failed to read key material at {path}: {message}")]
    KeyMaterial {
        /// Path that was read.
        path: String,
        /// Operating system error string.
        message: String,
    },
    /// Raised when a local helper program cannot be started.
    #[error("failed to spawn {program}: {message}")]
    Spawn {
        /// Program that failed to start.
        program: String,
        /// Operating system error string.
        message: String,
    },
}

impl LifecycleError {
    /// Returns `true` for failures a caller may reasonably retry by
    /// re-issuing the whole operation.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::ConnectivityTimeout { .. } | Self::TransferFailure { .. }
        )
    }

    pub(crate) fn timeout(action: &str, target: impl Into<String>) -> Self {
        Self::ConnectivityTimeout {
            action: action.to_owned(),
            target: target.into(),
        }
    }

    pub(crate) fn not_supported(operation: &str, provider: &str) -> Self {
        Self::NotSupported {
            operation: operation.to_owned(),
            provider: provider.to_owned(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    fn provider_error_keeps_code() {
        let err = ProviderError::new("quota exceeded").with_code("QuotaExceeded");
        assert_eq!(err.code.as_deref(), Some("QuotaExceeded"));
        assert_eq!(
            LifecycleError::from(err).to_string(),
            "provider error: quota exceeded"
        );
    }

    #[rstest]
    #[case(LifecycleError::timeout("boot", "i-1"), true)]
    #[case(
        LifecycleError::TransferFailure {
            origin: String::from("a"),
            destination: String::from("b"),
            message: String::from("lost connection"),
        },
        true
    )]
    #[case(
        LifecycleError::AuthenticationRejected {
            target: String::from("ubuntu@10.0.0.1:22"),
            message: String::from("Permission denied (publickey)"),
        },
        false
    )]
    #[case(LifecycleError::not_supported("delete_key", "fake"), false)]
    #[case(
        LifecycleError::CommandFailed {
            command: String::from("install packages"),
            return_code: 100,
            stderr: String::from("E: Unable to locate package nope"),
        },
        false
    )]
    fn retryable_kinds(#[case] error: LifecycleError, #[case] expected: bool) {
        assert_eq!(error.is_retryable(), expected);
    }

    #[rstest]
    fn duplicate_resource_message_names_the_resource() {
        let err = LifecycleError::DuplicateResource {
            kind: String::from("key"),
            name: String::from("ci"),
        };
        assert_eq!(err.to_string(), "key 'ci' already exists");
    }
}
