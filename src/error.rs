//! Error types for the provisioner

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result type for provisioner operations
pub type Result<T> = std::result::Result<T, ProvisionError>;

/// Provisioner error types
#[derive(Error, Debug)]
pub enum ProvisionError {
    #[error("Invalid configuration: {}", .0.join("; "))]
    Config(Vec<String>),

    #[error("Unsupported platform: {0}")]
    UnsupportedPlatform(String),

    #[error("Install failed: {0}")]
    InstallFailure(String),

    #[error("Preflight checks failed: {0}")]
    PreflightFailure(String),

    #[error("Join did not succeed after {attempts} attempts: {last_error}")]
    JoinTimeout { attempts: u32, last_error: String },

    #[error("Insufficient privilege running `{command}`: {message}")]
    InsufficientPrivilege { command: String, message: String },

    #[error("Manifest #{index} ({manifest}) failed to apply: {message}")]
    ManifestApplyFailure {
        index: usize,
        manifest: String,
        message: String,
    },

    #[error("Unreachable: {0}")]
    Unreachable(String),

    #[error("Timeout after {seconds}s running `{command}`")]
    Timeout { command: String, seconds: u64 },

    #[error("Cancelled before running `{0}`")]
    Cancelled(String),

    #[error("Command `{command}` exited with code {exit_code}: {output}")]
    CommandFailed {
        command: String,
        exit_code: i32,
        output: String,
    },

    #[error("Node state conflict: {0}")]
    Conflict(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

/// Serializable discriminant of [`ProvisionError`], recorded on step results
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Config,
    UnsupportedPlatform,
    InstallFailure,
    PreflightFailure,
    JoinTimeout,
    InsufficientPrivilege,
    ManifestApplyFailure,
    Unreachable,
    Timeout,
    Cancelled,
    CommandFailed,
    Conflict,
    Io,
}

impl ProvisionError {
    /// Kind of this error
    pub fn kind(&self) -> ErrorKind {
        match self {
            ProvisionError::Config(_) => ErrorKind::Config,
            ProvisionError::UnsupportedPlatform(_) => ErrorKind::UnsupportedPlatform,
            ProvisionError::InstallFailure(_) => ErrorKind::InstallFailure,
            ProvisionError::PreflightFailure(_) => ErrorKind::PreflightFailure,
            ProvisionError::JoinTimeout { .. } => ErrorKind::JoinTimeout,
            ProvisionError::InsufficientPrivilege { .. } => ErrorKind::InsufficientPrivilege,
            ProvisionError::ManifestApplyFailure { .. } => ErrorKind::ManifestApplyFailure,
            ProvisionError::Unreachable(_) => ErrorKind::Unreachable,
            ProvisionError::Timeout { .. } => ErrorKind::Timeout,
            ProvisionError::Cancelled(_) => ErrorKind::Cancelled,
            ProvisionError::CommandFailed { .. } => ErrorKind::CommandFailed,
            ProvisionError::Conflict(_) => ErrorKind::Conflict,
            ProvisionError::Io(_) | ProvisionError::Json(_) | ProvisionError::Yaml(_) => {
                ErrorKind::Io
            }
        }
    }

    /// Whether the error is a connectivity problem that may clear on its own
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ProvisionError::Unreachable(_) | ProvisionError::Timeout { .. }
        )
    }

    /// Remote command line involved in the failure, if any
    pub fn command(&self) -> Option<&str> {
        match self {
            ProvisionError::InsufficientPrivilege { command, .. }
            | ProvisionError::Timeout { command, .. }
            | ProvisionError::CommandFailed { command, .. } => Some(command),
            ProvisionError::Cancelled(command) => Some(command),
            _ => None,
        }
    }

    /// Exit code of the failing remote command, if any
    pub fn exit_code(&self) -> Option<i32> {
        match self {
            ProvisionError::CommandFailed { exit_code, .. } => Some(*exit_code),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_error_lists_every_violation() {
        let err = ProvisionError::Config(vec!["first".to_string(), "second".to_string()]);
        assert_eq!(err.to_string(), "Invalid configuration: first; second");
        assert_eq!(err.kind(), ErrorKind::Config);
    }

    #[test]
    fn test_transient_classification() {
        assert!(ProvisionError::Unreachable("down".to_string()).is_transient());
        assert!(ProvisionError::Timeout {
            command: "kubeadm join".to_string(),
            seconds: 5
        }
        .is_transient());
        assert!(!ProvisionError::Conflict("x".to_string()).is_transient());
    }

    #[test]
    fn test_command_failed_exposes_diagnostics() {
        let err = ProvisionError::CommandFailed {
            command: "kubeadm reset --force".to_string(),
            exit_code: 3,
            output: "boom".to_string(),
        };
        assert_eq!(err.command(), Some("kubeadm reset --force"));
        assert_eq!(err.exit_code(), Some(3));
    }
}
