//! Cluster membership
//!
//! The orchestrator drives a node through init, join or drain with kubeadm.
//! The node's current state is always probed first, so a second apply with
//! the same plan finds nothing to do. A control-plane node that looks
//! provisioned is still checked against its API server before the step is
//! skipped.

pub mod kubeadm;
pub mod observe;
pub mod state;

pub use kubeadm::{parse_join_material, JoinMaterial};
pub use observe::observe_node;
pub use state::{select_transition, MembershipState, NodeState, Transition};

use crate::config::{ExecutionSettings, HostPort, Plan};
use crate::error::{ProvisionError, Result};
use crate::remote::{NodeSession, RemoteCommand, RemoteExecutor};
use crate::report::{StepResult, STEP_CORDON, STEP_MEMBERSHIP};
use crate::retry::{retry_linear, RetryError};
use chrono::Utc;
use kubeadm::{
    cleanup_command, init_command, is_transient_output, join_command, kubectl, reset_command,
    token_join_command, ADMIN_KUBECONFIG, KUBELET_KUBECONFIG,
};
use tracing::{info, warn};

/// Label carried by control-plane nodes
pub const MASTER_LABEL: &str = "node-role.kubernetes.io/master=";

/// What the node looked like before anything changed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Observation {
    /// Name the node registers under
    pub node_name: String,
    pub node: NodeState,
}

/// Steps recorded by one membership transition
#[derive(Debug, Default)]
pub struct MembershipReport {
    pub steps: Vec<StepResult>,
    pub join_material: Option<JoinMaterial>,
}

/// Drives one node through the membership state machine
pub struct MembershipOrchestrator<'a, 'e, E: RemoteExecutor> {
    session: &'a NodeSession<'e, E>,
    plan: &'a Plan,
    settings: &'a ExecutionSettings,
    state: MembershipState,
}

impl<'a, 'e, E: RemoteExecutor> MembershipOrchestrator<'a, 'e, E> {
    pub fn new(
        session: &'a NodeSession<'e, E>,
        plan: &'a Plan,
        settings: &'a ExecutionSettings,
    ) -> Self {
        Self {
            session,
            plan,
            settings,
            state: MembershipState::Unconfigured,
        }
    }

    /// Current membership state
    pub fn state(&self) -> MembershipState {
        self.state
    }

    fn enter(&mut self, next: MembershipState) -> Result<()> {
        if !self.state.can_transition_to(next) {
            return Err(ProvisionError::Conflict(format!(
                "illegal membership transition {} -> {}",
                self.state, next
            )));
        }
        info!(from = %self.state, to = %next, "Membership state change");
        self.state = next;
        Ok(())
    }

    /// Probe the node and resolve the name it registers under
    pub async fn observe(&mut self) -> Result<Observation> {
        let node = observe_node(self.session).await?;
        let node_name = match &self.plan.node_name {
            Some(name) => name.clone(),
            None => self.session.hostname().await?,
        };

        if node.is_control_plane_member() || node.is_worker_member() {
            self.state = MembershipState::Ready;
        }
        info!(node = %node_name, state = %self.state, "Observed node");

        Ok(Observation { node_name, node })
    }

    /// Carry out `transition`; failures are reported as steps
    pub async fn execute(
        &mut self,
        transition: &Transition,
        observation: &Observation,
    ) -> MembershipReport {
        let mut report = MembershipReport::default();
        let started = Utc::now();
        let node_name = observation.node_name.as_str();

        let result = match transition {
            Transition::Converged => {
                if self.state != MembershipState::Ready {
                    if let Err(e) = self.enter(MembershipState::Ready) {
                        report.steps.push(self.fail(&e, started));
                        return report;
                    }
                }
                let mut detail = transition.describe();
                if observation.node.is_control_plane_member() {
                    match self.verify_control_plane(node_name).await {
                        Ok(material) => report.join_material = material,
                        Err(e) => {
                            report.steps.push(self.fail(&e, started));
                            return report;
                        }
                    }
                    detail.push_str("; API server ready");
                }
                report
                    .steps
                    .push(StepResult::skipped(STEP_MEMBERSHIP, detail).timed(started));
                return report;
            }
            Transition::Init { reset_first } => {
                self.init(node_name, *reset_first).await.map(|material| {
                    report.join_material = material;
                    format!("initialized new cluster as {}", node_name)
                })
            }
            Transition::Join {
                target,
                control_plane,
                reset_first,
            } => {
                self.join(node_name, target, *control_plane, *reset_first)
                    .await
            }
            Transition::Drain => {
                if let Err(e) = self.enter(MembershipState::Draining) {
                    report.steps.push(self.fail(&e, started));
                    return report;
                }
                report.steps.push(self.cordon(observation).await);

                let started = Utc::now();
                let result = self.reset().await;
                return self.finish(report, result, started);
            }
        };

        self.finish(report, result, started)
    }

    fn finish(
        &mut self,
        mut report: MembershipReport,
        result: Result<String>,
        started: chrono::DateTime<Utc>,
    ) -> MembershipReport {
        let step = match result {
            Ok(detail) => StepResult::success(STEP_MEMBERSHIP, detail).timed(started),
            Err(e) => self.fail(&e, started),
        };
        report.steps.push(step);
        report
    }

    fn fail(&mut self, error: &ProvisionError, started: chrono::DateTime<Utc>) -> StepResult {
        warn!(state = %self.state, error = %error, "Membership transition failed");
        self.state = MembershipState::Failed;
        StepResult::failed(STEP_MEMBERSHIP, error, true).timed(started)
    }

    async fn init(&mut self, node_name: &str, reset_first: bool) -> Result<Option<JoinMaterial>> {
        self.enter(MembershipState::Initializing)?;
        if reset_first {
            info!(node = %node_name, "Resetting leftovers of an earlier attempt");
            self.session.check(reset_command(self.plan)).await?;
        }

        let output = self.session.check(init_command(self.plan, node_name)).await?;
        let material = parse_join_material(&output.stdout);
        if material.is_none() {
            warn!(node = %node_name, "kubeadm init succeeded but printed no join command");
        }

        self.wait_for_api_server().await?;
        self.label_master(node_name).await?;
        self.enter(MembershipState::Ready)?;
        Ok(material)
    }

    async fn join(
        &mut self,
        node_name: &str,
        target: &HostPort,
        control_plane: bool,
        reset_first: bool,
    ) -> Result<String> {
        self.enter(MembershipState::Joining)?;
        if reset_first {
            info!(node = %node_name, "Resetting leftovers of an earlier attempt");
            self.session.check(reset_command(self.plan)).await?;
        }

        let session = self.session;
        let plan = self.plan;
        let result = retry_linear(
            &self.settings.join_retry,
            "kubeadm join",
            session.cancel_token(),
            ProvisionError::is_transient,
            |attempt| {
                let join = join_command(plan, target, node_name, control_plane);
                let reset = reset_command(plan);
                async move {
                    if attempt > 1 {
                        // a failed join can leave files behind that fail the next one
                        session.check(reset).await?;
                    }
                    info!(node = %node_name, target = %target, attempt, "Joining cluster");

                    let script = join.script.clone();
                    let output = session.run(join).await?;
                    if output.success() {
                        return Ok(attempt);
                    }
                    if is_transient_output(&output) {
                        return Err(ProvisionError::Unreachable(format!(
                            "{}: {}",
                            target,
                            output.tail(3)
                        )));
                    }
                    Err(ProvisionError::CommandFailed {
                        command: script,
                        exit_code: output.exit_code,
                        output: output.tail(10),
                    })
                }
            },
        )
        .await;

        let attempts = match result {
            Ok(attempts) => attempts,
            Err(RetryError::Exhausted {
                attempts,
                last_error,
            }) => {
                return Err(ProvisionError::JoinTimeout {
                    attempts,
                    last_error: last_error.to_string(),
                })
            }
            Err(RetryError::Permanent(e)) => return Err(e),
            Err(RetryError::Cancelled(_)) => {
                return Err(ProvisionError::Cancelled("kubeadm join".to_string()))
            }
        };

        if control_plane {
            self.wait_for_api_server().await?;
            self.label_master(node_name).await?;
        } else {
            self.wait_for_kubelet().await?;
        }
        self.enter(MembershipState::Ready)?;

        let role = if control_plane {
            "control-plane node"
        } else {
            "worker"
        };
        Ok(format!(
            "joined {} as {} after {} attempt(s)",
            target, role, attempts
        ))
    }

    /// Check a control-plane node found already provisioned and hand out
    /// fresh join material for it
    async fn verify_control_plane(&self, node_name: &str) -> Result<Option<JoinMaterial>> {
        self.wait_for_api_server().await?;
        self.label_master(node_name).await?;

        match self.session.check(token_join_command(self.plan)).await {
            Ok(output) => {
                let material = parse_join_material(&output.stdout).map(|mut material| {
                    if material.certificate_key.is_none() {
                        material.certificate_key = self.plan.bootstrap.certificate_key.clone();
                    }
                    material
                });
                if material.is_none() {
                    warn!(node = %node_name, "kubeadm token create printed no join command");
                }
                Ok(material)
            }
            Err(e @ ProvisionError::Cancelled(_)) => Err(e),
            Err(e) => {
                warn!(node = %node_name, error = %e, "Could not issue a join token");
                Ok(None)
            }
        }
    }

    /// Re-run `command` under the ready policy until it exits zero
    async fn wait_until(&self, what: &str, command: RemoteCommand) -> Result<()> {
        let session = self.session;
        let result = retry_linear(
            &self.settings.ready_retry,
            what,
            session.cancel_token(),
            |e: &ProvisionError| e.is_transient() || matches!(e, ProvisionError::CommandFailed { .. }),
            |_| {
                let command = command.clone();
                async move { session.check(command).await }
            },
        )
        .await;

        match result {
            Ok(_) => Ok(()),
            Err(RetryError::Exhausted { last_error, .. }) | Err(RetryError::Permanent(last_error)) => {
                Err(last_error)
            }
            Err(RetryError::Cancelled(_)) => Err(ProvisionError::Cancelled(what.to_string())),
        }
    }

    async fn wait_for_api_server(&self) -> Result<()> {
        self.wait_until(
            "API server readiness",
            kubectl(ADMIN_KUBECONFIG, "get --raw=/readyz"),
        )
        .await
    }

    async fn wait_for_kubelet(&self) -> Result<()> {
        self.wait_until(
            "kubelet activation",
            RemoteCommand::new("systemctl is-active --quiet kubelet"),
        )
        .await
    }

    async fn label_master(&self, node_name: &str) -> Result<()> {
        let args = format!(
            "label node {} {} --overwrite",
            crate::remote::shell_quote(node_name),
            MASTER_LABEL
        );
        self.session.check(kubectl(ADMIN_KUBECONFIG, &args)).await?;
        Ok(())
    }

    /// Cordon, drain and delete the node through the control plane.
    ///
    /// Never fatal on its own: a node being removed may have lost its
    /// control plane. A node that never joined one is skipped.
    async fn cordon(&self, observation: &Observation) -> StepResult {
        let started = Utc::now();
        let node = &observation.node;
        let name = crate::remote::shell_quote(&observation.node_name);

        let kubeconfig = if node.admin_kubeconfig {
            ADMIN_KUBECONFIG
        } else if node.kubelet_configured {
            KUBELET_KUBECONFIG
        } else {
            return StepResult::skipped(
                STEP_CORDON,
                "no kubeconfig on the node, it never joined a cluster",
            )
            .timed(started);
        };

        let drain = kubectl(
            kubeconfig,
            &format!(
                "drain {} --ignore-daemonsets --delete-emptydir-data --force --timeout=120s",
                name
            ),
        );
        let result = match self.session.run(drain.clone()).await {
            Ok(output) if output.success() => Ok(()),
            Ok(output) => {
                let text = output.combined().to_lowercase();
                if text.contains("notfound") || text.contains("not found") {
                    return StepResult::skipped(
                        STEP_CORDON,
                        format!("node {} is not registered", observation.node_name),
                    )
                    .timed(started);
                }
                if text.contains("forbidden") || text.contains("unauthorized") {
                    Err(ProvisionError::Unreachable(format!(
                        "not authorised to drain with {}: {}",
                        kubeconfig,
                        output.tail(2)
                    )))
                } else if is_transient_output(&output) {
                    Err(ProvisionError::Unreachable(output.tail(3)))
                } else {
                    Err(ProvisionError::CommandFailed {
                        command: drain.script,
                        exit_code: output.exit_code,
                        output: output.tail(10),
                    })
                }
            }
            Err(e) => Err(e),
        };
        if let Err(e) = result {
            return StepResult::failed(STEP_CORDON, &e, false).timed(started);
        }

        if kubeconfig != ADMIN_KUBECONFIG {
            return StepResult::success(
                STEP_CORDON,
                format!(
                    "drained {}; node object left for the control plane to delete",
                    observation.node_name
                ),
            )
            .timed(started);
        }

        let delete = kubectl(ADMIN_KUBECONFIG, &format!("delete node {} --ignore-not-found", name));
        match self.session.check(delete).await {
            Ok(_) => StepResult::success(
                STEP_CORDON,
                format!("drained and deleted node {}", observation.node_name),
            )
            .timed(started),
            Err(e) => StepResult::failed(STEP_CORDON, &e, false).timed(started),
        }
    }

    async fn reset(&mut self) -> Result<String> {
        self.session.check(reset_command(self.plan)).await?;
        self.session.check(cleanup_command()).await?;
        self.enter(MembershipState::Removed)?;
        Ok("node reset and local kubeadm configuration removed".to_string())
    }
}
