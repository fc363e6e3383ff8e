//! Raw provisioner options, exactly as supplied by the caller

use crate::error::Result;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Flat option set for one node
///
/// Field names follow the provisioner schema. Unknown fields are rejected.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RawOptions {
    /// Seeder to join (`host:port`); empty starts a new seeder
    #[serde(default)]
    pub join: String,
    /// Role of this machine: `master` or `worker`
    #[serde(default)]
    pub role: String,
    /// Preflight checks to ignore
    #[serde(default)]
    pub ignore_checks: Vec<String>,
    /// Remove the node from the cluster instead of adding it
    #[serde(default)]
    pub drain: bool,
    /// Name used to register the node (defaults to the remote hostname)
    #[serde(default)]
    pub nodename: String,
    /// For masters, `host:port` to listen at
    #[serde(default)]
    pub listen: Option<String>,
    /// Never elevate with sudo
    #[serde(default)]
    pub prevent_sudo: bool,
    /// Manifests to load once the master is set up
    #[serde(default)]
    pub manifests: Vec<String>,
    /// Installation block; absent means "do not install"
    #[serde(default)]
    pub install: Option<RawInstall>,
    /// Bootstrap credentials shared by the cluster
    #[serde(default)]
    pub config: RawBootstrap,
}

/// Raw `install` block
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RawInstall {
    #[serde(default)]
    pub auto: bool,
    #[serde(default)]
    pub script: Option<String>,
    #[serde(default)]
    pub inline: Option<String>,
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub sysconfig_path: Option<String>,
    #[serde(default)]
    pub service_path: Option<String>,
    #[serde(default)]
    pub dropin_path: Option<String>,
    #[serde(default)]
    pub kubeadm_path: Option<String>,
}

/// Raw `config` block with the cluster bootstrap credentials
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RawBootstrap {
    /// Bootstrap token (`abcdef.0123456789abcdef`)
    #[serde(default)]
    pub token: Option<String>,
    /// CA public key pin (`sha256:<hex>`)
    #[serde(default)]
    pub discovery_hash: Option<String>,
    /// Key decrypting the shared control-plane certificates
    #[serde(default)]
    pub certificate_key: Option<String>,
}

/// Option file parser
pub struct OptionsParser;

impl OptionsParser {
    /// Parse an option file; `.json` files are read as JSON, anything else as YAML
    pub fn parse_file(path: &Path) -> Result<RawOptions> {
        let content = std::fs::read_to_string(path)?;

        match path.extension().and_then(|e| e.to_str()) {
            Some("json") => Self::parse_json(&content),
            _ => Self::parse_str(&content),
        }
    }

    /// Parse options from a YAML string
    pub fn parse_str(content: &str) -> Result<RawOptions> {
        Ok(serde_yaml::from_str(content)?)
    }

    /// Parse options from a JSON string
    pub fn parse_json(content: &str) -> Result<RawOptions> {
        Ok(serde_json::from_str(content)?)
    }
}
