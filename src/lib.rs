//! kubeadm-provisioner - converge a machine into a kubeadm cluster
//!
//! Given a flat option set and a way to run shell commands on the target
//! node, the provisioner:
//!
//! - Installs kubeadm and the kubelet unit files
//! - Runs kubeadm preflight with configurable ignored checks
//! - Initializes a new cluster, joins an existing one, or drains the node
//! - Applies manifests from control-plane nodes
//! - Reports every step and one overall outcome

pub mod cluster;
pub mod config;
pub mod error;
pub mod install;
pub mod manifest;
pub mod pipeline;
pub mod preflight;
pub mod remote;
pub mod report;
pub mod retry;

pub use config::{resolve, ExecutionSettings, OptionsParser, Plan, RawOptions};
pub use error::{ProvisionError, Result};
pub use pipeline::Provisioner;
pub use report::ApplyOutcome;
