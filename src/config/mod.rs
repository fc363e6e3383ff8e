//! Provisioner configuration
//!
//! Raw options come from the caller as a flat option set. The resolver
//! validates them and produces the immutable [`Plan`] a single apply runs on.

pub mod options;
pub mod plan;
pub mod resolver;

pub use options::{OptionsParser, RawBootstrap, RawInstall, RawOptions};
pub use plan::{BootstrapCredentials, HostPort, InstallMode, InstallSpec, Plan, Role};
pub use resolver::resolve;

use crate::retry::RetryPolicy;
use std::time::Duration;

/// Runtime knobs that are not part of the node's plan
#[derive(Debug, Clone)]
pub struct ExecutionSettings {
    /// Upper bound for any single remote command
    pub command_timeout: Duration,
    /// Retries of `kubeadm join` against a seeder that is not reachable yet
    pub join_retry: RetryPolicy,
    /// Polling of the API server until it reports ready
    pub ready_retry: RetryPolicy,
}

impl Default for ExecutionSettings {
    fn default() -> Self {
        Self {
            command_timeout: Duration::from_secs(600),
            join_retry: RetryPolicy::new(5, Duration::from_secs(10)),
            ready_retry: RetryPolicy::new(10, Duration::from_secs(3)),
        }
    }
}
