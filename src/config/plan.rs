//! Normalized execution plan

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::path::PathBuf;

/// Default port of the Kubernetes API server
pub const DEFAULT_API_PORT: u16 = 6443;

/// Default kubelet sysconfig file
pub const DEFAULT_SYSCONFIG_PATH: &str = "/etc/sysconfig/kubelet";

/// Default kubelet systemd unit
pub const DEFAULT_SERVICE_PATH: &str = "/etc/systemd/system/kubelet.service";

/// Default kubeadm drop-in for the kubelet unit
pub const DEFAULT_DROPIN_PATH: &str = "/etc/systemd/system/kubelet.service.d/10-kubeadm.conf";

/// Default location of the kubeadm binary
pub const DEFAULT_KUBEADM_PATH: &str = "/usr/bin/kubeadm";

/// Role of the node in the cluster
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// First node, initializes the control plane
    Seeder,
    /// Additional control-plane node
    Master,
    /// Worker node
    Worker,
}

impl Role {
    /// Whether the node runs a control plane
    pub fn is_control_plane(&self) -> bool {
        matches!(self, Role::Seeder | Role::Master)
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Seeder => write!(f, "seeder"),
            Role::Master => write!(f, "master"),
            Role::Worker => write!(f, "worker"),
        }
    }
}

/// A `host:port` pair
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostPort {
    pub host: String,
    pub port: u16,
}

impl HostPort {
    /// Parse `host:port`, `[v6]:port` or a bare host (API port assumed)
    pub fn parse(s: &str) -> std::result::Result<Self, String> {
        let s = s.trim();
        if s.is_empty() {
            return Err("empty address".to_string());
        }

        let (host, port) = if let Some(rest) = s.strip_prefix('[') {
            let (host, after) = rest
                .split_once(']')
                .ok_or_else(|| format!("unterminated IPv6 address in '{}'", s))?;
            match after {
                "" => (host, None),
                _ => match after.strip_prefix(':') {
                    Some(port) => (host, Some(port)),
                    None => return Err(format!("unexpected text after IPv6 address in '{}'", s)),
                },
            }
        } else {
            match s.rsplit_once(':') {
                Some((host, _)) if host.contains(':') => {
                    return Err(format!("IPv6 address must be bracketed in '{}'", s))
                }
                Some((host, port)) => (host, Some(port)),
                None => (s, None),
            }
        };

        if host.is_empty() {
            return Err(format!("missing host in '{}'", s));
        }
        if host.chars().any(|c| c.is_whitespace() || c == '/') {
            return Err(format!("invalid host '{}'", host));
        }

        let port = match port {
            None => DEFAULT_API_PORT,
            Some(p) => match p.parse::<u16>() {
                Ok(0) | Err(_) => return Err(format!("invalid port '{}' in '{}'", p, s)),
                Ok(port) => port,
            },
        };

        Ok(Self {
            host: host.to_string(),
            port,
        })
    }
}

impl fmt::Display for HostPort {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

/// How kubeadm gets installed
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InstallMode {
    /// Built-in script for the detected package manager
    Auto,
    /// Local script uploaded to the node
    Script(PathBuf),
    /// Inline shell code
    Inline(String),
}

/// Fully defaulted installation settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstallSpec {
    pub mode: InstallMode,
    pub version: Option<String>,
    pub sysconfig_path: String,
    pub service_path: String,
    pub dropin_path: String,
    pub kubeadm_path: String,
}

/// Credentials used to bootstrap nodes into the cluster
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BootstrapCredentials {
    pub token: Option<String>,
    pub discovery_hash: Option<String>,
    pub certificate_key: Option<String>,
}

/// Validated, immutable execution intent for one apply
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Plan {
    pub role: Role,
    pub join_target: Option<HostPort>,
    pub drain: bool,
    pub ignored_checks: BTreeSet<String>,
    /// `None` means "use the remote hostname"
    pub node_name: Option<String>,
    pub listen: Option<HostPort>,
    pub prevent_sudo: bool,
    pub manifests: Vec<String>,
    /// `None` when no install block was given
    pub install: Option<InstallSpec>,
    pub bootstrap: BootstrapCredentials,
}

impl Plan {
    /// kubeadm binary used for every kubeadm invocation
    pub fn kubeadm_path(&self) -> &str {
        self.install
            .as_ref()
            .map(|i| i.kubeadm_path.as_str())
            .unwrap_or(DEFAULT_KUBEADM_PATH)
    }

    /// Whether this node creates a new cluster
    pub fn is_seeder(&self) -> bool {
        self.role == Role::Seeder
    }
}
