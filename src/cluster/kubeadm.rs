//! kubeadm and kubectl command lines, and parsing of their output

use crate::config::{HostPort, Plan};
use crate::remote::{shell_quote, CommandOutput, RemoteCommand};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::net::IpAddr;
use std::sync::OnceLock;

/// Admin credentials written by `kubeadm init` and control-plane joins
pub const ADMIN_KUBECONFIG: &str = "/etc/kubernetes/admin.conf";

/// Kubelet credentials written by every init or join
pub const KUBELET_KUBECONFIG: &str = "/etc/kubernetes/kubelet.conf";

/// Static pod manifest of the API server
pub const APISERVER_MANIFEST: &str = "/etc/kubernetes/manifests/kube-apiserver.yaml";

/// kubectl is expected on the node's PATH, next to kubeadm
pub const KUBECTL: &str = "kubectl";

/// Local files kubeadm and the kubelet leave behind, removed when leaving the cluster
pub const LOCAL_STATE_PATHS: &[&str] = &[
    "/etc/kubernetes/kubelet.conf",
    "/etc/kubernetes/bootstrap-kubelet.conf",
    "/etc/kubernetes/admin.conf",
    "/etc/kubernetes/super-admin.conf",
    "/etc/kubernetes/controller-manager.conf",
    "/etc/kubernetes/scheduler.conf",
    "/etc/kubernetes/manifests",
    "/etc/kubernetes/pki",
    "/var/lib/kubelet/config.yaml",
    "/var/lib/kubelet/kubeadm-flags.env",
    "/etc/cni/net.d",
];

/// Output fragments of a control plane that is not reachable (yet)
const TRANSIENT_MARKERS: &[&str] = &[
    "connection refused",
    "was refused",
    "connection reset",
    "i/o timeout",
    "no route to host",
    "network is unreachable",
    "context deadline exceeded",
    "tls handshake timeout",
    "unable to connect to the server",
    "could not find a jws signature",
    "client rate limiter wait returned an error",
];

/// What new nodes need to join the cluster this node created
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JoinMaterial {
    pub endpoint: String,
    pub token: String,
    pub ca_cert_hash: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub certificate_key: Option<String>,
}

impl JoinMaterial {
    /// Worker join command line
    pub fn join_command(&self) -> String {
        format!(
            "kubeadm join {} --token {} --discovery-token-ca-cert-hash {}",
            self.endpoint, self.token, self.ca_cert_hash
        )
    }
}

/// Whether command output shows the control plane could not be reached
pub fn is_transient_output(output: &CommandOutput) -> bool {
    let text = output.combined().to_lowercase();
    TRANSIENT_MARKERS.iter().any(|m| text.contains(m))
}

/// `--ignore-preflight-errors` flag, if anything is ignored
fn ignore_flag(ignored: &BTreeSet<String>) -> Option<String> {
    if ignored.is_empty() {
        return None;
    }
    let list = ignored.iter().cloned().collect::<Vec<_>>().join(",");
    Some(format!("--ignore-preflight-errors={}", shell_quote(&list)))
}

fn advertise_flags(listen: &HostPort) -> Vec<String> {
    let mut flags = Vec::new();
    if listen.host.parse::<IpAddr>().is_ok() {
        flags.push(format!("--apiserver-advertise-address={}", shell_quote(&listen.host)));
    }
    flags.push(format!("--apiserver-bind-port={}", listen.port));
    flags
}

/// `kubeadm init` for a seeder
pub fn init_command(plan: &Plan, node_name: &str) -> RemoteCommand {
    let mut args = vec![
        shell_quote(plan.kubeadm_path()),
        "init".to_string(),
        format!("--node-name={}", shell_quote(node_name)),
    ];

    if let Some(listen) = &plan.listen {
        args.push(format!(
            "--control-plane-endpoint={}",
            shell_quote(&listen.to_string())
        ));
        args.extend(advertise_flags(listen));
        args.push("--upload-certs".to_string());
        if let Some(key) = &plan.bootstrap.certificate_key {
            args.push(format!("--certificate-key={}", shell_quote(key)));
        }
    }
    if let Some(token) = &plan.bootstrap.token {
        args.push(format!("--token={}", shell_quote(token)));
    }
    args.extend(ignore_flag(&plan.ignored_checks));

    RemoteCommand::elevated(args.join(" "))
}

/// Discovery and role flags shared by `kubeadm join` and its preflight phase
fn join_args(plan: &Plan, target: &HostPort, node_name: &str, control_plane: bool) -> Vec<String> {
    let mut args = vec![shell_quote(&target.to_string())];

    if let Some(token) = &plan.bootstrap.token {
        args.push(format!("--token={}", shell_quote(token)));
    }
    match &plan.bootstrap.discovery_hash {
        Some(hash) => args.push(format!("--discovery-token-ca-cert-hash={}", shell_quote(hash))),
        None => args.push("--discovery-token-unsafe-skip-ca-verification".to_string()),
    }
    args.push(format!("--node-name={}", shell_quote(node_name)));

    if control_plane {
        args.push("--control-plane".to_string());
        if let Some(key) = &plan.bootstrap.certificate_key {
            args.push(format!("--certificate-key={}", shell_quote(key)));
        }
        if let Some(listen) = &plan.listen {
            args.extend(advertise_flags(listen));
        }
    }
    args
}

/// `kubeadm join` against `target`
pub fn join_command(
    plan: &Plan,
    target: &HostPort,
    node_name: &str,
    control_plane: bool,
) -> RemoteCommand {
    let mut args = vec![shell_quote(plan.kubeadm_path()), "join".to_string()];
    args.extend(join_args(plan, target, node_name, control_plane));
    args.extend(ignore_flag(&plan.ignored_checks));

    RemoteCommand::elevated(args.join(" "))
}

/// Issue a fresh bootstrap token and print the worker join command
pub fn token_join_command(plan: &Plan) -> RemoteCommand {
    RemoteCommand::elevated(format!(
        "{} token create --print-join-command",
        shell_quote(plan.kubeadm_path())
    ))
}

/// `kubeadm init phase preflight`
pub fn init_preflight_command(plan: &Plan) -> RemoteCommand {
    RemoteCommand::elevated(format!(
        "{} init phase preflight",
        shell_quote(plan.kubeadm_path())
    ))
}

/// `kubeadm join phase preflight` against `target`
pub fn join_preflight_command(
    plan: &Plan,
    target: &HostPort,
    node_name: &str,
    control_plane: bool,
) -> RemoteCommand {
    let mut args = vec![
        shell_quote(plan.kubeadm_path()),
        "join".to_string(),
        "phase".to_string(),
        "preflight".to_string(),
    ];
    args.extend(join_args(plan, target, node_name, control_plane));
    RemoteCommand::elevated(args.join(" "))
}

/// `kubeadm reset phase preflight`
pub fn reset_preflight_command(plan: &Plan) -> RemoteCommand {
    RemoteCommand::elevated(format!(
        "{} reset phase preflight --force",
        shell_quote(plan.kubeadm_path())
    ))
}

/// `kubeadm reset`, a no-op on a node that was never set up
pub fn reset_command(plan: &Plan) -> RemoteCommand {
    RemoteCommand::elevated(format!("{} reset --force", shell_quote(plan.kubeadm_path())))
}

/// Stop the kubelet and remove what kubeadm leaves behind
pub fn cleanup_command() -> RemoteCommand {
    let paths = LOCAL_STATE_PATHS
        .iter()
        .map(|p| shell_quote(p))
        .collect::<Vec<_>>()
        .join(" ");
    RemoteCommand::elevated(format!(
        "(systemctl stop kubelet 2>/dev/null || true) && rm -rf {}",
        paths
    ))
}

/// `kubectl` with an explicit kubeconfig
pub fn kubectl(kubeconfig: &str, args: &str) -> RemoteCommand {
    RemoteCommand::elevated(format!(
        "{} --kubeconfig={} {}",
        KUBECTL,
        shell_quote(kubeconfig),
        args
    ))
}

fn join_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"kubeadm join (\S+) --token (\S+) --discovery-token-ca-cert-hash (\S+)")
            .expect("join command pattern")
    })
}

fn certificate_key_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"--certificate-key (\S+)").expect("certificate key pattern"))
}

/// Extract the join instructions `kubeadm init` prints on success
pub fn parse_join_material(output: &str) -> Option<JoinMaterial> {
    // kubeadm wraps the command over several lines ending in a backslash
    let flattened = output
        .lines()
        .map(|l| l.trim().trim_end_matches('\\').trim())
        .collect::<Vec<_>>()
        .join(" ");

    let caps = join_regex().captures(&flattened)?;
    let certificate_key = certificate_key_regex()
        .captures(&flattened)
        .map(|c| c[1].to_string());

    Some(JoinMaterial {
        endpoint: caps[1].to_string(),
        token: caps[2].to_string(),
        ca_cert_hash: caps[3].to_string(),
        certificate_key,
    })
}
