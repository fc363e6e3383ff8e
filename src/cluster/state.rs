//! Membership states, observed node state and transition selection

use crate::config::{HostPort, Plan, Role};
use crate::error::{ProvisionError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Where the node stands in the membership state machine
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MembershipState {
    /// Not part of any cluster yet
    #[default]
    Unconfigured,
    /// Running `kubeadm init`
    Initializing,
    /// Running `kubeadm join`
    Joining,
    /// Member of the cluster, serving
    Ready,
    /// Being cordoned and reset
    Draining,
    /// Left the cluster
    Removed,
    /// A transition failed
    Failed,
}

impl MembershipState {
    /// Whether `next` is a legal successor of this state
    pub fn can_transition_to(self, next: MembershipState) -> bool {
        use MembershipState::*;

        match (self, next) {
            (_, Failed) | (_, Draining) => true,
            (Unconfigured, Initializing) | (Unconfigured, Joining) => true,
            (Initializing, Ready) | (Joining, Ready) => true,
            // already converged
            (Unconfigured, Ready) => true,
            (Draining, Removed) => true,
            _ => false,
        }
    }
}

impl fmt::Display for MembershipState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            MembershipState::Unconfigured => "unconfigured",
            MembershipState::Initializing => "initializing",
            MembershipState::Joining => "joining",
            MembershipState::Ready => "ready",
            MembershipState::Draining => "draining",
            MembershipState::Removed => "removed",
            MembershipState::Failed => "failed",
        };
        write!(f, "{}", s)
    }
}

/// kubeadm state found on the node, re-read on every apply
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeState {
    /// `/etc/kubernetes/kubelet.conf` exists
    pub kubelet_configured: bool,
    /// `/etc/kubernetes/admin.conf` exists
    pub admin_kubeconfig: bool,
    /// the API server static pod manifest exists
    pub control_plane: bool,
    /// the kubelet unit is running
    pub kubelet_active: bool,
}

impl NodeState {
    /// Any trace of a previous init or join
    pub fn has_kubeadm_state(&self) -> bool {
        self.kubelet_configured || self.admin_kubeconfig || self.control_plane
    }

    /// Carries every file of a control-plane node
    pub fn looks_like_control_plane(&self) -> bool {
        self.kubelet_configured && self.control_plane && self.admin_kubeconfig
    }

    /// Carries the kubelet credentials of a worker and nothing more
    pub fn looks_like_worker(&self) -> bool {
        self.kubelet_configured && !self.control_plane && !self.admin_kubeconfig
    }

    /// Set up as a control-plane node with a running kubelet.
    ///
    /// `kubeadm init` writes every file before the kubelet starts, so the
    /// files alone do not prove the init finished.
    pub fn is_control_plane_member(&self) -> bool {
        self.looks_like_control_plane() && self.kubelet_active
    }

    /// Set up as a worker with a running kubelet
    pub fn is_worker_member(&self) -> bool {
        self.looks_like_worker() && self.kubelet_active
    }

    /// Leftovers of an init or join that did not finish
    pub fn is_partial(&self) -> bool {
        self.has_kubeadm_state() && !self.is_control_plane_member() && !self.is_worker_member()
    }
}

/// What the orchestrator is going to do with the node
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transition {
    /// Create a new cluster with this node as seeder
    Init { reset_first: bool },
    /// Join an existing cluster
    Join {
        target: HostPort,
        control_plane: bool,
        reset_first: bool,
    },
    /// Leave the cluster
    Drain,
    /// The node already matches the plan
    Converged,
}

impl Transition {
    pub fn describe(&self) -> String {
        match self {
            Transition::Init { .. } => "initialize a new cluster".to_string(),
            Transition::Join {
                target,
                control_plane: true,
                ..
            } => format!("join {} as control-plane node", target),
            Transition::Join { target, .. } => format!("join {} as worker", target),
            Transition::Drain => "drain and reset the node".to_string(),
            Transition::Converged => "nothing to do, node already provisioned".to_string(),
        }
    }
}

/// Choose the transition for `plan` given what the node looks like now
pub fn select_transition(plan: &Plan, node: &NodeState) -> Result<Transition> {
    if plan.drain {
        return Ok(Transition::Drain);
    }

    match (&plan.join_target, plan.role) {
        (None, _) | (_, Role::Seeder) => {
            if node.is_control_plane_member() {
                return Ok(Transition::Converged);
            }
            if node.looks_like_worker() {
                return Err(ProvisionError::Conflict(
                    "node is already a worker of a cluster; drain it before initializing a new one"
                        .to_string(),
                ));
            }
            Ok(Transition::Init {
                reset_first: node.is_partial(),
            })
        }
        (Some(target), role) => {
            let control_plane = role == Role::Master;

            if control_plane && node.is_control_plane_member() {
                return Ok(Transition::Converged);
            }
            if !control_plane && node.is_worker_member() {
                return Ok(Transition::Converged);
            }
            if (control_plane && node.looks_like_worker())
                || (!control_plane && node.looks_like_control_plane())
            {
                return Err(ProvisionError::Conflict(format!(
                    "node is already a {} of a cluster; drain it before joining as {}",
                    if node.control_plane {
                        "control-plane node"
                    } else {
                        "worker"
                    },
                    role
                )));
            }

            Ok(Transition::Join {
                target: target.clone(),
                control_plane,
                reset_first: node.is_partial(),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{resolve, OptionsParser};

    fn plan(yaml: &str) -> Plan {
        resolve(&OptionsParser::parse_str(yaml).unwrap()).unwrap()
    }

    const WORKER_JOIN: &str =
        "join: seeder:6443\nrole: worker\nconfig:\n  token: abcdef.0123456789abcdef\n";
    const MASTER_JOIN: &str =
        "join: seeder:6443\nrole: master\nconfig:\n  token: abcdef.0123456789abcdef\n";

    fn control_plane() -> NodeState {
        NodeState {
            kubelet_configured: true,
            admin_kubeconfig: true,
            control_plane: true,
            kubelet_active: true,
        }
    }

    fn worker() -> NodeState {
        NodeState {
            kubelet_configured: true,
            kubelet_active: true,
            ..Default::default()
        }
    }

    #[test]
    fn test_fresh_node_transitions() {
        let fresh = NodeState::default();
        assert_eq!(
            select_transition(&plan("{}"), &fresh).unwrap(),
            Transition::Init { reset_first: false }
        );
        assert!(matches!(
            select_transition(&plan(MASTER_JOIN), &fresh).unwrap(),
            Transition::Join {
                control_plane: true,
                reset_first: false,
                ..
            }
        ));
        assert!(matches!(
            select_transition(&plan(WORKER_JOIN), &fresh).unwrap(),
            Transition::Join {
                control_plane: false,
                ..
            }
        ));
    }

    #[test]
    fn test_converged_nodes() {
        assert_eq!(
            select_transition(&plan("{}"), &control_plane()).unwrap(),
            Transition::Converged
        );
        assert_eq!(
            select_transition(&plan(MASTER_JOIN), &control_plane()).unwrap(),
            Transition::Converged
        );
        assert_eq!(
            select_transition(&plan(WORKER_JOIN), &worker()).unwrap(),
            Transition::Converged
        );
    }

    #[test]
    fn test_role_conflicts() {
        assert!(matches!(
            select_transition(&plan("{}"), &worker()),
            Err(ProvisionError::Conflict(_))
        ));
        assert!(matches!(
            select_transition(&plan(MASTER_JOIN), &worker()),
            Err(ProvisionError::Conflict(_))
        ));
        assert!(matches!(
            select_transition(&plan(WORKER_JOIN), &control_plane()),
            Err(ProvisionError::Conflict(_))
        ));
    }

    #[test]
    fn test_partial_state_resets_first() {
        let crashed_init = NodeState {
            control_plane: true,
            ..Default::default()
        };
        assert!(crashed_init.is_partial());
        assert_eq!(
            select_transition(&plan("{}"), &crashed_init).unwrap(),
            Transition::Init { reset_first: true }
        );
    }

    #[test]
    fn test_files_without_running_kubelet_are_partial() {
        let crashed_init = NodeState {
            kubelet_active: false,
            ..control_plane()
        };
        assert!(!crashed_init.is_control_plane_member());
        assert!(crashed_init.is_partial());
        assert_eq!(
            select_transition(&plan("{}"), &crashed_init).unwrap(),
            Transition::Init { reset_first: true }
        );
        assert!(matches!(
            select_transition(&plan(MASTER_JOIN), &crashed_init).unwrap(),
            Transition::Join {
                control_plane: true,
                reset_first: true,
                ..
            }
        ));

        let stopped_worker = NodeState {
            kubelet_active: false,
            ..worker()
        };
        assert!(stopped_worker.is_partial());
        assert!(matches!(
            select_transition(&plan(WORKER_JOIN), &stopped_worker).unwrap(),
            Transition::Join {
                control_plane: false,
                reset_first: true,
                ..
            }
        ));
        // still a worker's files, never turned into a seeder silently
        assert!(matches!(
            select_transition(&plan("{}"), &stopped_worker),
            Err(ProvisionError::Conflict(_))
        ));
    }

    #[test]
    fn test_drain_wins_regardless_of_state() {
        let drain = plan("drain: true\n");
        assert_eq!(
            select_transition(&drain, &NodeState::default()).unwrap(),
            Transition::Drain
        );
        assert_eq!(select_transition(&drain, &worker()).unwrap(), Transition::Drain);
    }

    #[test]
    fn test_state_machine_edges() {
        use MembershipState::*;
        assert!(Unconfigured.can_transition_to(Joining));
        assert!(Joining.can_transition_to(Ready));
        assert!(Ready.can_transition_to(Draining));
        assert!(Draining.can_transition_to(Removed));
        assert!(Initializing.can_transition_to(Failed));
        assert!(!Removed.can_transition_to(Ready));
        assert!(!Unconfigured.can_transition_to(Removed));
    }
}
