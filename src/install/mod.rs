//! kubeadm installation
//!
//! Skips everything when the requested kubeadm is already present.
//! Otherwise runs the chosen strategy, lays down the kubelet unit files
//! and verifies the result.

pub mod scripts;

use crate::config::{InstallMode, InstallSpec};
use crate::error::{ProvisionError, Result};
use crate::remote::{shell_quote, NodeSession, RemoteCommand, RemoteExecutor};
use crate::report::{StepResult, STEP_INSTALL};
use chrono::Utc;
use scripts::OsRelease;
use sha2::{Digest, Sha256};
use tracing::{debug, info};

/// Whether `installed` (as printed by `kubeadm version -o short`) satisfies `wanted`.
///
/// `1.30` accepts any 1.30 patch release; no wanted version accepts anything.
pub fn version_matches(installed: &str, wanted: Option<&str>) -> bool {
    let installed = installed.trim().trim_start_matches('v');
    let Some(wanted) = wanted else {
        return !installed.is_empty();
    };
    let wanted = wanted.trim().trim_start_matches('v');

    installed == wanted
        || installed
            .strip_prefix(wanted)
            .is_some_and(|rest| rest.starts_with('.') || rest.starts_with('-') || rest.starts_with('+'))
}

enum InstallOutcome {
    AlreadyInstalled(String),
    Installed { version: String, units_changed: usize },
}

/// Installs kubeadm on one node
pub struct Installer<'a, 'e, E: RemoteExecutor> {
    session: &'a NodeSession<'e, E>,
}

impl<'a, 'e, E: RemoteExecutor> Installer<'a, 'e, E> {
    pub fn new(session: &'a NodeSession<'e, E>) -> Self {
        Self { session }
    }

    /// Install according to `spec`; `None` skips the step
    pub async fn run(&self, spec: Option<&InstallSpec>) -> StepResult {
        let started = Utc::now();
        let Some(spec) = spec else {
            return StepResult::skipped(STEP_INSTALL, "installation not requested").timed(started);
        };

        match self.install(spec).await {
            Ok(InstallOutcome::AlreadyInstalled(version)) => {
                StepResult::skipped(STEP_INSTALL, format!("kubeadm {} already installed", version))
                    .timed(started)
            }
            Ok(InstallOutcome::Installed {
                version,
                units_changed,
            }) => StepResult::success(
                STEP_INSTALL,
                format!(
                    "installed kubeadm {} ({} unit file(s) updated)",
                    version, units_changed
                ),
            )
            .timed(started),
            Err(e) => Self::failure(e).timed(started),
        }
    }

    fn failure(error: ProvisionError) -> StepResult {
        let wrapped = match &error {
            ProvisionError::InstallFailure(_)
            | ProvisionError::UnsupportedPlatform(_)
            | ProvisionError::InsufficientPrivilege { .. }
            | ProvisionError::Cancelled(_) => return StepResult::failed(STEP_INSTALL, &error, true),
            other => ProvisionError::InstallFailure(other.to_string()),
        };

        let mut step = StepResult::failed(STEP_INSTALL, &wrapped, true);
        step.command = error.command().map(str::to_string);
        step.exit_code = error.exit_code();
        step
    }

    async fn install(&self, spec: &InstallSpec) -> Result<InstallOutcome> {
        if let Some(version) = self.installed_version(spec).await? {
            if version_matches(&version, spec.version.as_deref()) {
                info!(version = %version, "kubeadm already installed");
                return Ok(InstallOutcome::AlreadyInstalled(version));
            }
            info!(installed = %version, wanted = ?spec.version, "kubeadm version differs, reinstalling");
        }

        let script = self.strategy_script(spec).await?;
        let env = [
            ("KUBEADM_VERSION", spec.version.clone().unwrap_or_default()),
            ("KUBEADM_PATH", spec.kubeadm_path.clone()),
            ("KUBELET_SYSCONFIG_PATH", spec.sysconfig_path.clone()),
            ("KUBELET_SERVICE_PATH", spec.service_path.clone()),
            ("KUBEADM_DROPIN_PATH", spec.dropin_path.clone()),
        ];

        let session = self.session;
        session
            .with_temp_file("install", script.as_bytes(), 0o755, |path| async move {
                let mut command = RemoteCommand::elevated(shell_quote(&path));
                for (key, value) in &env {
                    command = command.env(key, value);
                }
                session.check(command).await.map(|_| ())
            })
            .await?;

        let units_changed = self.install_unit_files(spec).await?;
        session
            .check(RemoteCommand::elevated("systemctl daemon-reload"))
            .await?;
        session
            .check(RemoteCommand::elevated("systemctl enable kubelet"))
            .await?;

        let version = match self.installed_version(spec).await? {
            Some(version) if version_matches(&version, spec.version.as_deref()) => version,
            Some(version) => {
                return Err(ProvisionError::InstallFailure(format!(
                    "kubeadm reports {} after install, wanted {}",
                    version,
                    spec.version.as_deref().unwrap_or("any")
                )))
            }
            None => {
                return Err(ProvisionError::InstallFailure(format!(
                    "{} not usable after install",
                    spec.kubeadm_path
                )))
            }
        };

        Ok(InstallOutcome::Installed {
            version,
            units_changed,
        })
    }

    /// Version of the kubeadm at `spec.kubeadm_path`, `None` if it does not run
    async fn installed_version(&self, spec: &InstallSpec) -> Result<Option<String>> {
        let command = RemoteCommand::new(format!("{} version -o short", shell_quote(&spec.kubeadm_path)));
        let output = self.session.run(command).await?;
        let version = output.stdout.trim();

        if !output.success() || version.is_empty() {
            debug!(exit_code = output.exit_code, "kubeadm not found");
            return Ok(None);
        }
        Ok(Some(version.to_string()))
    }

    async fn strategy_script(&self, spec: &InstallSpec) -> Result<String> {
        match &spec.mode {
            InstallMode::Auto => {
                let output = self.session.check(RemoteCommand::new("cat /etc/os-release")).await?;
                let release = OsRelease::parse(&output.stdout);
                let pm = release
                    .package_manager()
                    .ok_or_else(|| ProvisionError::UnsupportedPlatform(release.describe()))?;
                info!(os = %release.describe(), package_manager = %pm, "Installing with built-in script");
                Ok(scripts::install_script(pm))
            }
            InstallMode::Script(path) => {
                let script = tokio::fs::read_to_string(path).await.map_err(|e| {
                    ProvisionError::InstallFailure(format!(
                        "cannot read install script {}: {}",
                        path.display(),
                        e
                    ))
                })?;
                info!(script = %path.display(), "Installing with custom script");
                Ok(script)
            }
            InstallMode::Inline(body) => {
                info!("Installing with inline script");
                Ok(body.clone())
            }
        }
    }

    /// Upload the kubelet unit files that differ from what is on the node
    async fn install_unit_files(&self, spec: &InstallSpec) -> Result<usize> {
        let files = [
            (spec.sysconfig_path.as_str(), scripts::kubelet_sysconfig()),
            (spec.service_path.as_str(), scripts::kubelet_service()),
            (spec.dropin_path.as_str(), scripts::kubeadm_dropin(&spec.sysconfig_path)),
        ];

        let mut changed = 0;
        for (path, contents) in &files {
            let wanted = format!("{:x}", Sha256::digest(contents.as_bytes()));
            let output = self
                .session
                .run(RemoteCommand::new(format!("sha256sum {} 2>/dev/null", shell_quote(path))))
                .await?;
            let current = output.stdout.split_whitespace().next().unwrap_or("");

            if output.success() && current == wanted {
                debug!(path = %path, "Unit file up to date");
                continue;
            }
            self.session.upload(path, contents.as_bytes(), 0o644, true).await?;
            info!(path = %path, "Wrote unit file");
            changed += 1;
        }
        Ok(changed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{resolve, OptionsParser, Plan};
    use crate::error::ErrorKind;
    use crate::remote::scripted::{Reply, ScriptedExecutor};
    use crate::report::StepOutcome;
    use std::io::Write;
    use std::time::Duration;
    use tokio_util::sync::CancellationToken;

    fn plan(yaml: &str) -> Plan {
        resolve(&OptionsParser::parse_str(yaml).unwrap()).unwrap()
    }

    async fn run(executor: &ScriptedExecutor, plan: &Plan) -> StepResult {
        let session = NodeSession::new(executor, false, Duration::from_secs(30), CancellationToken::new());
        Installer::new(&session).run(plan.install.as_ref()).await
    }

    #[test]
    fn test_version_matching() {
        assert!(version_matches("v1.30.2", Some("1.30")));
        assert!(version_matches("v1.30.2", Some("v1.30.2")));
        assert!(version_matches("v1.30.2", None));
        assert!(!version_matches("v1.30.2", Some("1.3")));
        assert!(!version_matches("v1.29.6", Some("1.30")));
        assert!(!version_matches("", None));
    }

    #[tokio::test]
    async fn test_no_install_block_is_skipped() {
        let executor = ScriptedExecutor::new();
        let step = run(&executor, &plan("{}")).await;

        assert!(step.is_skipped());
        assert_eq!(step.detail, "installation not requested");
        assert!(executor.invocations().is_empty());
    }

    #[tokio::test]
    async fn test_matching_version_has_no_side_effects() {
        let executor = ScriptedExecutor::new();
        executor.on("version -o short", Reply::stdout("v1.30.2\n"));

        let step = run(&executor, &plan("install:\n  auto: true\n  version: \"1.30\"\n")).await;

        assert!(step.is_skipped());
        assert_eq!(executor.invocations().len(), 1);
        assert!(executor.uploaded_paths().is_empty());
    }

    #[tokio::test]
    async fn test_auto_install_on_ubuntu() {
        let executor = ScriptedExecutor::new();
        executor.on_sequence(
            "version -o short",
            vec![Reply::exit(127, "", "kubeadm: not found"), Reply::stdout("v1.30.2\n")],
        );
        executor.on("cat /etc/os-release", Reply::stdout("ID=ubuntu\nVERSION_ID=\"22.04\"\n"));

        let step = run(&executor, &plan("install:\n  auto: true\n  version: 1.30.2\n")).await;

        assert_eq!(step.outcome, StepOutcome::Success, "{}", step.detail);
        assert!(step.detail.contains("3 unit file(s) updated"));

        let script_path = executor
            .uploaded_paths()
            .into_iter()
            .find(|p| p.starts_with("/tmp/kubeadm-provisioner-install-"))
            .unwrap();
        let script = String::from_utf8(executor.uploaded(&script_path).unwrap()).unwrap();
        assert!(script.contains("apt-get install"));

        let run_script = executor
            .invocations()
            .into_iter()
            .find(|i| i.command.script == script_path)
            .unwrap();
        assert!(run_script.sudo);
        assert!(run_script
            .command
            .env
            .contains(&("KUBEADM_VERSION".to_string(), "1.30.2".to_string())));
        assert!(run_script
            .command
            .env
            .contains(&("KUBELET_SYSCONFIG_PATH".to_string(), "/etc/sysconfig/kubelet".to_string())));

        assert!(executor.uploaded("/etc/systemd/system/kubelet.service").is_some());
        assert_eq!(executor.count(&format!("rm -f {}", script_path)), 1);
        assert!(executor.position("daemon-reload").unwrap() < executor.position("enable kubelet").unwrap());
    }

    #[tokio::test]
    async fn test_unsupported_platform() {
        let executor = ScriptedExecutor::new();
        executor.on("version -o short", Reply::exit(127, "", "not found"));
        executor.on("cat /etc/os-release", Reply::stdout("ID=arch\n"));

        let step = run(&executor, &plan("install:\n  auto: true\n")).await;

        assert_eq!(step.error_kind, Some(ErrorKind::UnsupportedPlatform));
        assert!(step.fatal);
        assert!(executor.uploaded_paths().is_empty());
    }

    #[tokio::test]
    async fn test_inline_script_removed_on_failure() {
        let executor = ScriptedExecutor::new();
        executor.on("version -o short", Reply::exit(127, "", "not found"));
        executor.on("kubeadm-provisioner-install-", Reply::exit(3, "", "no network"));
        executor.on("rm -f", Reply::ok());

        let step = run(&executor, &plan("install:\n  inline: \"exit 3\"\n")).await;

        assert_eq!(step.error_kind, Some(ErrorKind::InstallFailure));
        assert_eq!(step.exit_code, Some(3));
        assert!(step.fatal);

        let path = executor.uploaded_paths().pop().unwrap();
        assert_eq!(executor.uploaded(&path).unwrap(), b"exit 3");
        assert_eq!(executor.count(&format!("rm -f {}", path)), 1);
        assert_eq!(executor.count("daemon-reload"), 0);
    }

    #[tokio::test]
    async fn test_custom_script_and_unchanged_units() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "#!/bin/sh\necho installing").unwrap();

        let executor = ScriptedExecutor::new();
        executor.on_sequence(
            "version -o short",
            vec![Reply::stdout("v1.29.0\n"), Reply::stdout("v1.30.1\n")],
        );
        let service_digest = format!("{:x}", Sha256::digest(scripts::kubelet_service().as_bytes()));
        executor.on(
            "sha256sum /etc/systemd/system/kubelet.service",
            Reply::stdout(&format!("{}  /etc/systemd/system/kubelet.service\n", service_digest)),
        );

        let yaml = format!(
            "install:\n  script: {}\n  version: \"1.30\"\n",
            file.path().display()
        );
        let step = run(&executor, &plan(&yaml)).await;

        assert_eq!(step.outcome, StepOutcome::Success, "{}", step.detail);
        assert!(step.detail.contains("2 unit file(s) updated"));
        assert!(executor.uploaded("/etc/systemd/system/kubelet.service").is_none());
        assert!(executor
            .uploaded_paths()
            .iter()
            .any(|p| executor.uploaded(p).unwrap() == b"#!/bin/sh\necho installing\n"));
    }

    #[tokio::test]
    async fn test_wrong_version_after_install_fails() {
        let executor = ScriptedExecutor::new();
        executor.on("version -o short", Reply::stdout("v1.29.0\n"));

        let step = run(&executor, &plan("install:\n  inline: \"true\"\n  version: \"1.30\"\n")).await;

        assert_eq!(step.error_kind, Some(ErrorKind::InstallFailure));
        assert!(step.detail.contains("v1.29.0"));
    }
}
