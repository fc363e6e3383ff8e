//! Preflight check gate
//!
//! Runs the kubeadm preflight phase matching the planned transition and
//! decides whether the node may proceed. Checks named in `ignore_checks`
//! never block, but stay visible in the step detail.

use crate::cluster::kubeadm::{
    init_preflight_command, is_transient_output, join_preflight_command, reset_preflight_command,
};
use crate::cluster::Transition;
use crate::config::{HostPort, Plan};
use crate::error::{ProvisionError, Result};
use crate::remote::{CommandOutput, NodeSession, RemoteCommand, RemoteExecutor};
use crate::report::{StepResult, STEP_PREFLIGHT};
use crate::retry::{retry_linear, RetryError, RetryPolicy};
use chrono::Utc;
use regex::Regex;
use std::collections::BTreeSet;
use std::sync::OnceLock;
use tracing::{debug, info};

/// Checks that only detect this node's own kubeadm state
const STATE_CHECK_PREFIXES: &[&str] = &[
    "FileAvailable--etc-kubernetes-",
    "DirAvailable--etc-kubernetes-manifests",
    "DirAvailable--var-lib-etcd",
    "Port-",
];

/// Which preflight phase to run
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PreflightPhase {
    Init,
    Join {
        target: HostPort,
        control_plane: bool,
    },
    Reset,
}

impl PreflightPhase {
    /// Phase matching the transition the node is about to go through
    pub fn for_transition(plan: &Plan, transition: &Transition) -> Self {
        match transition {
            Transition::Init { .. } => PreflightPhase::Init,
            Transition::Join {
                target,
                control_plane,
                ..
            } => PreflightPhase::Join {
                target: target.clone(),
                control_plane: *control_plane,
            },
            Transition::Drain => PreflightPhase::Reset,
            Transition::Converged => match &plan.join_target {
                Some(target) if !plan.is_seeder() => PreflightPhase::Join {
                    target: target.clone(),
                    control_plane: plan.role.is_control_plane(),
                },
                _ => PreflightPhase::Init,
            },
        }
    }

    fn command(&self, plan: &Plan, node_name: &str) -> RemoteCommand {
        match self {
            PreflightPhase::Init => init_preflight_command(plan),
            PreflightPhase::Join {
                target,
                control_plane,
            } => join_preflight_command(plan, target, node_name, *control_plane),
            PreflightPhase::Reset => reset_preflight_command(plan),
        }
    }
}

/// One reported check
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Check {
    pub name: String,
    pub message: String,
}

impl Check {
    fn describe(&self) -> String {
        if self.message.is_empty() {
            self.name.clone()
        } else {
            format!("{} ({})", self.name, self.message)
        }
    }
}

/// Checks parsed from preflight output
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PreflightReport {
    pub failures: Vec<Check>,
    pub warnings: Vec<Check>,
}

fn check_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"\[(ERROR|WARNING) ([^\]]+)\]:?\s*(.*)").expect("preflight check pattern")
    })
}

impl PreflightReport {
    /// Parse `[ERROR Name]: message` and `[WARNING Name]: message` lines
    pub fn parse(output: &str) -> Self {
        let mut report = Self::default();
        for line in output.lines() {
            let Some(caps) = check_regex().captures(line) else {
                continue;
            };
            let check = Check {
                name: caps[2].trim().to_string(),
                message: caps[3].trim().to_string(),
            };
            if &caps[1] == "ERROR" {
                report.failures.push(check);
            } else {
                report.warnings.push(check);
            }
        }
        report
    }

    pub fn is_empty(&self) -> bool {
        self.failures.is_empty() && self.warnings.is_empty()
    }
}

/// Failures split by how they are treated
#[derive(Debug, Default, PartialEq, Eq)]
pub struct Verdict {
    pub blocking: Vec<Check>,
    pub ignored: Vec<Check>,
    pub tolerated: Vec<Check>,
    pub warnings: Vec<Check>,
}

impl Verdict {
    /// Filter `report` against the ignore list, and against the state checks
    /// when the node already carries kubeadm state
    pub fn judge(report: PreflightReport, ignored: &BTreeSet<String>, tolerate_state: bool) -> Self {
        let mut verdict = Verdict {
            warnings: report.warnings,
            ..Default::default()
        };

        for check in report.failures {
            if ignored.contains(&check.name) {
                verdict.ignored.push(check);
            } else if tolerate_state && is_state_check(&check.name) {
                verdict.tolerated.push(check);
            } else {
                verdict.blocking.push(check);
            }
        }
        verdict
    }

    pub fn passed(&self) -> bool {
        self.blocking.is_empty()
    }

    /// One line per non-empty category
    pub fn detail(&self) -> String {
        let mut lines = Vec::new();
        let mut push = |label: &str, checks: &[Check]| {
            if !checks.is_empty() {
                let list = checks.iter().map(Check::describe).collect::<Vec<_>>();
                lines.push(format!("{}: {}", label, list.join("; ")));
            }
        };
        push("failed checks", &self.blocking);
        push("ignored failures", &self.ignored);
        push("tolerated", &self.tolerated);
        push("warnings", &self.warnings);

        if lines.is_empty() {
            "all checks passed".to_string()
        } else {
            lines.join("\n")
        }
    }
}

/// Whether a check only detects kubeadm state left by a previous run
pub fn is_state_check(name: &str) -> bool {
    STATE_CHECK_PREFIXES.iter().any(|p| name.starts_with(p))
}

/// Runs preflight for one node
pub struct PreflightGate<'a, 'e, E: RemoteExecutor> {
    session: &'a NodeSession<'e, E>,
    plan: &'a Plan,
}

impl<'a, 'e, E: RemoteExecutor> PreflightGate<'a, 'e, E> {
    pub fn new(session: &'a NodeSession<'e, E>, plan: &'a Plan) -> Self {
        Self { session, plan }
    }

    /// Run the preflight `phase` and judge its output.
    ///
    /// Preflight that cannot reach the control plane is retried under `retry`.
    pub async fn run(
        &self,
        phase: &PreflightPhase,
        node_name: &str,
        tolerate_state: bool,
        retry: &RetryPolicy,
    ) -> StepResult {
        let started = Utc::now();
        match self.evaluate(phase, node_name, tolerate_state, retry).await {
            Ok(verdict) => {
                info!(
                    blocking = verdict.blocking.len(),
                    ignored = verdict.ignored.len(),
                    tolerated = verdict.tolerated.len(),
                    warnings = verdict.warnings.len(),
                    "Preflight finished"
                );
                StepResult::success(STEP_PREFLIGHT, verdict.detail()).timed(started)
            }
            Err(e) => StepResult::failed(STEP_PREFLIGHT, &e, true).timed(started),
        }
    }

    async fn evaluate(
        &self,
        phase: &PreflightPhase,
        node_name: &str,
        tolerate_state: bool,
        retry: &RetryPolicy,
    ) -> Result<Verdict> {
        let command = phase.command(self.plan, node_name);
        let script = command.script.clone();
        let output = self.run_with_retry(command, retry).await?;

        let report = PreflightReport::parse(&output.combined());
        debug!(
            failures = report.failures.len(),
            warnings = report.warnings.len(),
            exit_code = output.exit_code,
            "Parsed preflight output"
        );

        if !output.success() && report.failures.is_empty() {
            return Err(ProvisionError::CommandFailed {
                command: script,
                exit_code: output.exit_code,
                output: output.tail(10),
            });
        }

        let verdict = Verdict::judge(report, &self.plan.ignored_checks, tolerate_state);
        if !verdict.passed() {
            return Err(ProvisionError::PreflightFailure(verdict.detail()));
        }
        Ok(verdict)
    }

    async fn run_with_retry(&self, command: RemoteCommand, retry: &RetryPolicy) -> Result<CommandOutput> {
        let session = self.session;
        let result = retry_linear(
            retry,
            "kubeadm preflight",
            session.cancel_token(),
            ProvisionError::is_transient,
            |_| {
                let command = command.clone();
                async move {
                    let output = session.run(command).await?;
                    if !output.success()
                        && is_transient_output(&output)
                        && PreflightReport::parse(&output.combined()).failures.is_empty()
                    {
                        return Err(ProvisionError::Unreachable(output.tail(3)));
                    }
                    Ok(output)
                }
            },
        )
        .await;

        match result {
            Ok(output) => Ok(output),
            Err(RetryError::Exhausted { last_error, .. }) | Err(RetryError::Permanent(last_error)) => {
                Err(last_error)
            }
            Err(RetryError::Cancelled(_)) => {
                Err(ProvisionError::Cancelled("kubeadm preflight".to_string()))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{resolve, OptionsParser};
    use crate::error::ErrorKind;
    use crate::remote::scripted::{Reply, ScriptedExecutor};
    use crate::report::StepOutcome;
    use std::time::Duration;
    use tokio_util::sync::CancellationToken;

    const TWO_FAILURES: &str = "[preflight] Running pre-flight checks\n\
        [preflight] Some fatal errors occurred:\n\
        \t[ERROR A]: check A failed\n\
        \t[ERROR C]: check C failed\n\
        [preflight] If you know what you are doing, you can make a check non-fatal with `--ignore-preflight-errors=...`\n";

    fn plan(yaml: &str) -> Plan {
        resolve(&OptionsParser::parse_str(yaml).unwrap()).unwrap()
    }

    async fn run(
        executor: &ScriptedExecutor,
        plan: &Plan,
        phase: &PreflightPhase,
        tolerate_state: bool,
        retry: &RetryPolicy,
    ) -> StepResult {
        let session = NodeSession::new(executor, plan.prevent_sudo, Duration::from_secs(30), CancellationToken::new());
        PreflightGate::new(&session, plan)
            .run(phase, "node-1", tolerate_state, retry)
            .await
    }

    #[test]
    fn test_parse_checks() {
        let output = "[preflight] Running pre-flight checks\n\
            \t[WARNING Swap]: swap is supported for cgroup v2 only\n\
            \t[WARNING Service-Kubelet]: kubelet service is not enabled\n\
            error execution phase preflight: [preflight] Some fatal errors occurred:\n\
            \t[ERROR FileContent--proc-sys-net-ipv4-ip_forward]: /proc/sys/net/ipv4/ip_forward contents are not set to 1\n";

        let report = PreflightReport::parse(output);
        assert_eq!(report.warnings.len(), 2);
        assert_eq!(report.warnings[0].name, "Swap");
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].name, "FileContent--proc-sys-net-ipv4-ip_forward");
        assert!(report.failures[0].message.contains("ip_forward"));
    }

    #[test]
    fn test_ignored_check_filtering() {
        // B passed, so kubeadm does not print it
        let report = PreflightReport::parse(TWO_FAILURES);
        let ignored: BTreeSet<String> = ["C".to_string()].into_iter().collect();

        let verdict = Verdict::judge(report, &ignored, false);
        assert!(!verdict.passed());
        assert_eq!(verdict.blocking[0].name, "A");
        assert_eq!(verdict.ignored[0].name, "C");
        assert!(verdict.detail().contains("failed checks: A (check A failed)"));
        assert!(verdict.detail().contains("ignored failures: C (check C failed)"));
    }

    #[test]
    fn test_ignore_is_case_sensitive() {
        let report = PreflightReport::parse("[ERROR Swap]: swap on");
        let ignored: BTreeSet<String> = ["swap".to_string()].into_iter().collect();
        assert!(!Verdict::judge(report, &ignored, false).passed());
    }

    #[test]
    fn test_state_checks() {
        assert!(is_state_check("FileAvailable--etc-kubernetes-manifests-kube-apiserver.yaml"));
        assert!(is_state_check("DirAvailable--var-lib-etcd"));
        assert!(is_state_check("Port-6443"));
        assert!(!is_state_check("NumCPU"));
        assert!(!is_state_check("FileContent--proc-sys-net-ipv4-ip_forward"));
    }

    #[tokio::test]
    async fn test_gate_fails_on_unignored_check() {
        let executor = ScriptedExecutor::new();
        executor.on("init phase preflight", Reply::exit(1, "", TWO_FAILURES));

        let step = run(
            &executor,
            &plan("ignore_checks: [C]\n"),
            &PreflightPhase::Init,
            false,
            &RetryPolicy::immediate(1),
        )
        .await;

        assert_eq!(step.outcome, StepOutcome::Failed);
        assert!(step.fatal);
        assert_eq!(step.error_kind, Some(ErrorKind::PreflightFailure));
        assert!(step.detail.contains("ignored failures: C"));
    }

    #[tokio::test]
    async fn test_gate_passes_when_all_failures_ignored() {
        let executor = ScriptedExecutor::new();
        executor.on("init phase preflight", Reply::exit(1, "", TWO_FAILURES));

        let step = run(
            &executor,
            &plan("ignore_checks: [A, C]\n"),
            &PreflightPhase::Init,
            false,
            &RetryPolicy::immediate(1),
        )
        .await;

        assert_eq!(step.outcome, StepOutcome::Success);
        assert!(step.detail.contains("ignored failures: A (check A failed); C (check C failed)"));
    }

    #[tokio::test]
    async fn test_gate_tolerates_own_state_on_provisioned_node() {
        let executor = ScriptedExecutor::new();
        executor.on(
            "init phase preflight",
            Reply::exit(
                1,
                "",
                "[ERROR Port-6443]: Port 6443 is in use\n[ERROR DirAvailable--var-lib-etcd]: /var/lib/etcd is not empty\n",
            ),
        );

        let step = run(&executor, &plan("{}"), &PreflightPhase::Init, true, &RetryPolicy::immediate(1)).await;
        assert_eq!(step.outcome, StepOutcome::Success);
        assert!(step.detail.starts_with("tolerated: Port-6443"));

        let step = run(&executor, &plan("{}"), &PreflightPhase::Init, false, &RetryPolicy::immediate(1)).await;
        assert_eq!(step.outcome, StepOutcome::Failed);
    }

    #[tokio::test]
    async fn test_unparseable_failure_is_command_failure() {
        let executor = ScriptedExecutor::new();
        executor.on("reset phase preflight", Reply::exit(127, "", "kubeadm: command not found"));

        let step = run(&executor, &plan("drain: true\n"), &PreflightPhase::Reset, false, &RetryPolicy::immediate(1)).await;

        assert_eq!(step.error_kind, Some(ErrorKind::CommandFailed));
        assert_eq!(step.exit_code, Some(127));
    }

    #[tokio::test]
    async fn test_join_preflight_waits_for_seeder() {
        let executor = ScriptedExecutor::new();
        executor.on_sequence(
            "join phase preflight",
            vec![
                Reply::exit(1, "", "couldn't validate: dial tcp 10.0.0.10:6443: connect: connection refused"),
                Reply::ok(),
            ],
        );
        let plan = plan("join: 10.0.0.10\nrole: worker\nconfig:\n  token: abcdef.0123456789abcdef\n");
        let phase = PreflightPhase::Join {
            target: plan.join_target.clone().unwrap(),
            control_plane: false,
        };

        let step = run(&executor, &plan, &phase, false, &RetryPolicy::immediate(3)).await;

        assert_eq!(step.outcome, StepOutcome::Success);
        assert_eq!(executor.count("join phase preflight"), 2);
    }

    #[test]
    fn test_phase_for_converged_worker() {
        let plan = plan("join: 10.0.0.10\nrole: worker\nconfig:\n  token: abcdef.0123456789abcdef\n");
        assert!(matches!(
            PreflightPhase::for_transition(&plan, &Transition::Converged),
            PreflightPhase::Join {
                control_plane: false,
                ..
            }
        ));
        assert_eq!(
            PreflightPhase::for_transition(&plan, &Transition::Drain),
            PreflightPhase::Reset
        );
    }
}
