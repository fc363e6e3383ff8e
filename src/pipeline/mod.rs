//! One apply against one node
//!
//! Install, observe, preflight, membership and manifests run in this order.
//! The first fatal step ends the apply; everything recorded so far is
//! returned in the [`ApplyOutcome`].

use crate::cluster::{select_transition, MembershipOrchestrator, Transition};
use crate::config::{resolve, ExecutionSettings, Plan, RawOptions, Role};
use crate::error::Result;
use crate::install::Installer;
use crate::manifest::ManifestApplier;
use crate::preflight::{PreflightGate, PreflightPhase};
use crate::remote::{NodeSession, RemoteExecutor};
use crate::report::{
    ApplyOutcome, ResultAggregator, StepResult, STEP_MANIFESTS, STEP_MEMBERSHIP, STEP_OBSERVE,
};
use crate::retry::RetryPolicy;
use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Provisions nodes through one executor
pub struct Provisioner<'e, E: RemoteExecutor> {
    executor: &'e E,
    settings: ExecutionSettings,
}

impl<'e, E: RemoteExecutor> Provisioner<'e, E> {
    pub fn new(executor: &'e E, settings: ExecutionSettings) -> Self {
        Self { executor, settings }
    }

    /// Resolve `raw` and apply it. Invalid options fail before the node is contacted.
    pub async fn apply_options(
        &self,
        raw: &RawOptions,
        cancel: CancellationToken,
    ) -> Result<ApplyOutcome> {
        let plan = resolve(raw)?;
        Ok(self.apply(&plan, cancel).await)
    }

    /// Converge the node towards `plan`
    pub async fn apply(&self, plan: &Plan, cancel: CancellationToken) -> ApplyOutcome {
        let session = NodeSession::new(
            self.executor,
            plan.prevent_sudo,
            self.settings.command_timeout,
            cancel,
        );
        let mut orchestrator = MembershipOrchestrator::new(&session, plan, &self.settings);
        let mut aggregator = ResultAggregator::new();

        info!(role = %plan.role, drain = plan.drain, "Starting apply");

        aggregator.record(Installer::new(&session).run(plan.install.as_ref()).await);
        if aggregator.has_fatal() {
            return aggregator.finish(orchestrator.state(), None);
        }

        let started = Utc::now();
        let observation = match orchestrator.observe().await {
            Ok(observation) => observation,
            Err(e) => {
                aggregator.record(StepResult::failed(STEP_OBSERVE, &e, true).timed(started));
                return aggregator.finish(orchestrator.state(), None);
            }
        };
        let transition = match select_transition(plan, &observation.node) {
            Ok(transition) => transition,
            Err(e) => {
                aggregator.record(StepResult::failed(STEP_MEMBERSHIP, &e, true).timed(started));
                return aggregator.finish(orchestrator.state(), None);
            }
        };
        aggregator.record(
            StepResult::success(
                STEP_OBSERVE,
                format!("node {}: {}", observation.node_name, transition.describe()),
            )
            .timed(started),
        );

        let phase = PreflightPhase::for_transition(plan, &transition);
        let retry = match phase {
            PreflightPhase::Join { .. } => self.settings.join_retry.clone(),
            _ => RetryPolicy::immediate(1),
        };
        let preflight = PreflightGate::new(&session, plan)
            .run(
                &phase,
                &observation.node_name,
                observation.node.has_kubeadm_state(),
                &retry,
            )
            .await;
        aggregator.record(preflight);
        if aggregator.has_fatal() {
            return aggregator.finish(orchestrator.state(), None);
        }

        let membership = orchestrator.execute(&transition, &observation).await;
        for step in membership.steps {
            aggregator.record(step);
        }
        if aggregator.has_fatal() {
            return aggregator.finish(orchestrator.state(), membership.join_material);
        }

        let manifests = match skip_manifests_reason(plan, &transition) {
            Some(reason) => StepResult::skipped(STEP_MANIFESTS, reason),
            None => ManifestApplier::new(&session).apply(&plan.manifests).await,
        };
        aggregator.record(manifests);

        aggregator.finish(orchestrator.state(), membership.join_material)
    }
}

fn skip_manifests_reason(plan: &Plan, transition: &Transition) -> Option<&'static str> {
    if matches!(transition, Transition::Drain) {
        Some("node is leaving the cluster")
    } else if plan.role == Role::Worker {
        Some("manifests are only applied from control-plane nodes")
    } else if plan.manifests.is_empty() {
        Some("no manifests to apply")
    } else {
        None
    }
}
