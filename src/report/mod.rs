//! Step results and the aggregated outcome of one apply
//!
//! Every pipeline step reports a [`StepResult`] instead of aborting. The
//! [`ResultAggregator`] collects them in execution order and is the only
//! place that decides which failures make the whole apply fail.

use crate::cluster::{JoinMaterial, MembershipState};
use crate::error::{ErrorKind, ProvisionError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt::Write;

/// Installer step
pub const STEP_INSTALL: &str = "install";
/// Observation of the node's kubeadm state
pub const STEP_OBSERVE: &str = "observe";
/// Preflight check gate
pub const STEP_PREFLIGHT: &str = "preflight";
/// Cordon and drain through the control plane
pub const STEP_CORDON: &str = "cordon";
/// Init, join or reset
pub const STEP_MEMBERSHIP: &str = "membership";
/// Manifest application
pub const STEP_MANIFESTS: &str = "manifests";

/// How a step ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepOutcome {
    Success,
    Skipped,
    Failed,
}

/// Overall result of an apply
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Overall {
    Success,
    Failure,
}

/// Result of one pipeline step
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepResult {
    pub step: String,
    pub outcome: StepOutcome,
    pub detail: String,
    pub fatal: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<ErrorKind>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    pub started_at: DateTime<Utc>,
    pub duration_ms: u64,
}

impl StepResult {
    fn new(step: &str, outcome: StepOutcome, detail: String) -> Self {
        Self {
            step: step.to_string(),
            outcome,
            detail,
            fatal: false,
            error_kind: None,
            command: None,
            exit_code: None,
            started_at: Utc::now(),
            duration_ms: 0,
        }
    }

    pub fn success(step: &str, detail: impl Into<String>) -> Self {
        Self::new(step, StepOutcome::Success, detail.into())
    }

    pub fn skipped(step: &str, detail: impl Into<String>) -> Self {
        Self::new(step, StepOutcome::Skipped, detail.into())
    }

    /// Failed step carrying the diagnostics of `error`
    pub fn failed(step: &str, error: &ProvisionError, fatal: bool) -> Self {
        let mut result = Self::new(step, StepOutcome::Failed, error.to_string());
        result.fatal = fatal;
        result.error_kind = Some(error.kind());
        result.command = error.command().map(str::to_string);
        result.exit_code = error.exit_code();
        result
    }

    /// Stamp the start time and elapsed duration
    pub fn timed(mut self, started_at: DateTime<Utc>) -> Self {
        self.started_at = started_at;
        self.duration_ms = (Utc::now() - started_at).num_milliseconds().max(0) as u64;
        self
    }

    pub fn is_skipped(&self) -> bool {
        self.outcome == StepOutcome::Skipped
    }
}

/// Everything one apply did, reported back to the caller
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApplyOutcome {
    pub steps: Vec<StepResult>,
    pub overall: Overall,
    pub final_state: MembershipState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub join_material: Option<JoinMaterial>,
}

impl ApplyOutcome {
    pub fn is_success(&self) -> bool {
        self.overall == Overall::Success
    }

    /// Result of the named step, if it ran
    pub fn step(&self, name: &str) -> Option<&StepResult> {
        self.steps.iter().find(|s| s.step == name)
    }

    /// First step that failed the apply
    pub fn failed_step(&self) -> Option<&StepResult> {
        self.steps.iter().find(|s| s.fatal)
    }

    /// Human readable step log
    pub fn render(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "{:<12} {:<8} {}", "STEP", "OUTCOME", "DETAIL");

        for step in &self.steps {
            let outcome = match (step.outcome, step.fatal) {
                (StepOutcome::Success, _) => "ok",
                (StepOutcome::Skipped, _) => "skipped",
                (StepOutcome::Failed, true) => "FAILED",
                (StepOutcome::Failed, false) => "warning",
            };

            let mut lines = step.detail.lines();
            let _ = writeln!(
                out,
                "{:<12} {:<8} {}",
                step.step,
                outcome,
                lines.next().unwrap_or("")
            );
            for line in lines {
                let _ = writeln!(out, "{:<21} {}", "", line);
            }
            if let Some(command) = &step.command {
                let _ = writeln!(out, "{:<21} command: {}", "", command);
            }
            if let Some(code) = step.exit_code {
                let _ = writeln!(out, "{:<21} exit code: {}", "", code);
            }
        }

        if let Some(material) = &self.join_material {
            let _ = writeln!(out);
            let _ = writeln!(out, "Join other nodes with:");
            let _ = writeln!(out, "    {}", material.join_command());
        }

        let overall = match self.overall {
            Overall::Success => "success",
            Overall::Failure => "failure",
        };
        let _ = writeln!(out);
        let _ = write!(out, "overall: {} (node state: {})", overall, self.final_state);
        out
    }
}

/// Collects step results in order and applies the fatality rules
#[derive(Debug, Default)]
pub struct ResultAggregator {
    steps: Vec<StepResult>,
}

impl ResultAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a step, enforcing the fatality rules
    pub fn record(&mut self, mut step: StepResult) {
        if step.outcome == StepOutcome::Failed {
            match step.step.as_str() {
                // nothing can proceed without a usable kubeadm
                STEP_INSTALL => step.fatal = true,
                // a node being removed may legitimately have lost the control plane
                STEP_CORDON if step.error_kind == Some(ErrorKind::Unreachable) => {
                    step.fatal = false
                }
                _ => {}
            }
            if matches!(
                step.error_kind,
                Some(ErrorKind::InsufficientPrivilege) | Some(ErrorKind::Cancelled)
            ) {
                step.fatal = true;
            }
        } else {
            step.fatal = false;
        }

        tracing::info!(
            step = %step.step,
            outcome = ?step.outcome,
            fatal = step.fatal,
            "{}",
            step.detail.lines().next().unwrap_or("")
        );
        self.steps.push(step);
    }

    /// Whether a recorded step already failed the apply
    pub fn has_fatal(&self) -> bool {
        self.steps.iter().any(|s| s.fatal)
    }

    pub fn steps(&self) -> &[StepResult] {
        &self.steps
    }

    /// Combine the recorded steps into the final outcome
    pub fn finish(
        self,
        final_state: MembershipState,
        join_material: Option<JoinMaterial>,
    ) -> ApplyOutcome {
        let overall = if self.has_fatal() {
            Overall::Failure
        } else {
            Overall::Success
        };

        ApplyOutcome {
            steps: self.steps,
            overall,
            final_state,
            join_material,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_skipped_steps_keep_success() {
        let mut aggregator = ResultAggregator::new();
        aggregator.record(StepResult::skipped(STEP_INSTALL, "already installed"));
        aggregator.record(StepResult::skipped(STEP_MEMBERSHIP, "already joined"));

        let outcome = aggregator.finish(MembershipState::Ready, None);
        assert_eq!(outcome.overall, Overall::Success);
        assert!(outcome.failed_step().is_none());
    }

    #[test]
    fn test_install_failure_is_always_fatal() {
        let mut aggregator = ResultAggregator::new();
        let err = ProvisionError::InstallFailure("no kubeadm".to_string());
        aggregator.record(StepResult::failed(STEP_INSTALL, &err, false));

        assert!(aggregator.has_fatal());
        let outcome = aggregator.finish(MembershipState::Unconfigured, None);
        assert_eq!(outcome.overall, Overall::Failure);
        assert_eq!(outcome.failed_step().unwrap().step, STEP_INSTALL);
    }

    #[test]
    fn test_unreachable_cordon_is_not_fatal() {
        let mut aggregator = ResultAggregator::new();
        let err = ProvisionError::Unreachable("api server down".to_string());
        aggregator.record(StepResult::failed(STEP_CORDON, &err, true));
        aggregator.record(StepResult::success(STEP_MEMBERSHIP, "reset"));

        let outcome = aggregator.finish(MembershipState::Removed, None);
        assert!(outcome.is_success());
        assert_eq!(outcome.step(STEP_CORDON).unwrap().outcome, StepOutcome::Failed);
    }

    #[test]
    fn test_non_fatal_failure_does_not_flip_outcome() {
        let mut aggregator = ResultAggregator::new();
        let err = ProvisionError::PreflightFailure("Swap (ignored)".to_string());
        aggregator.record(StepResult::failed(STEP_PREFLIGHT, &err, false));

        assert!(aggregator.finish(MembershipState::Ready, None).is_success());
    }

    #[test]
    fn test_render_lists_command_and_exit_code() {
        let mut aggregator = ResultAggregator::new();
        let err = ProvisionError::CommandFailed {
            command: "kubeadm reset --force".to_string(),
            exit_code: 2,
            output: "boom".to_string(),
        };
        aggregator.record(StepResult::failed(STEP_MEMBERSHIP, &err, true));

        let text = aggregator.finish(MembershipState::Failed, None).render();
        assert!(text.contains("FAILED"));
        assert!(text.contains("command: kubeadm reset --force"));
        assert!(text.contains("exit code: 2"));
        assert!(text.contains("overall: failure"));
    }

    #[test]
    fn test_outcome_serializes_to_json() {
        let mut aggregator = ResultAggregator::new();
        aggregator.record(StepResult::success(STEP_MANIFESTS, "applied 1 manifest"));

        let json = serde_json::to_value(aggregator.finish(MembershipState::Ready, None)).unwrap();
        assert_eq!(json["overall"], "success");
        assert_eq!(json["final_state"], "ready");
        assert_eq!(json["steps"][0]["outcome"], "success");
        assert!(json["steps"][0].get("exit_code").is_none());
    }
}
