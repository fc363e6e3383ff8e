//! Probe of the kubeadm state present on the node

use super::kubeadm::{ADMIN_KUBECONFIG, APISERVER_MANIFEST, KUBELET_KUBECONFIG};
use super::state::NodeState;
use crate::error::{ProvisionError, Result};
use crate::remote::{RemoteCommand, RemoteExecutor, NodeSession};

/// One line per probe, `key=yes|no`
fn probe_command() -> RemoteCommand {
    let script = format!(
        "for f in {kubelet} {admin} {apiserver}; do if test -e \"$f\"; then echo \"$f=yes\"; else echo \"$f=no\"; fi; done; \
         if systemctl is-active --quiet kubelet 2>/dev/null; then echo kubelet=yes; else echo kubelet=no; fi",
        kubelet = KUBELET_KUBECONFIG,
        admin = ADMIN_KUBECONFIG,
        apiserver = APISERVER_MANIFEST,
    );
    RemoteCommand::elevated(script)
}

/// Parse the probe output into a [`NodeState`]
pub fn parse_probe(output: &str) -> NodeState {
    let mut state = NodeState::default();

    for line in output.lines() {
        let Some((key, value)) = line.trim().split_once('=') else {
            continue;
        };
        let present = value == "yes";
        match key {
            KUBELET_KUBECONFIG => state.kubelet_configured = present,
            ADMIN_KUBECONFIG => state.admin_kubeconfig = present,
            APISERVER_MANIFEST => state.control_plane = present,
            "kubelet" => state.kubelet_active = present,
            _ => {}
        }
    }
    state
}

/// Read the node's current kubeadm state
pub async fn observe_node<E: RemoteExecutor>(session: &NodeSession<'_, E>) -> Result<NodeState> {
    let command = probe_command();
    let script = command.script.clone();
    let output = session.run(command).await?;

    if !output.success() {
        return Err(ProvisionError::CommandFailed {
            command: script,
            exit_code: output.exit_code,
            output: output.tail(5),
        });
    }
    Ok(parse_probe(&output.stdout))
}
