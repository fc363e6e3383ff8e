//! Per-apply view of the node
//!
//! A session applies the plan's sudo policy and the default timeout to every
//! command, refuses to start new commands once cancelled, and reports
//! permission failures as [`ProvisionError::InsufficientPrivilege`].

use super::{shell_quote, CommandOutput, Invocation, RemoteCommand, RemoteExecutor};
use crate::error::{ProvisionError, Result};
use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

/// Output fragments that mean "you are not allowed to do this"
const PERMISSION_MARKERS: &[&str] = &[
    "permission denied",
    "operation not permitted",
    "must be run as root",
    "user is not running as root",
    "are you root",
];

/// sudo asking for a password in non-interactive mode
const SUDO_PASSWORD_MARKER: &str = "a password is required";

/// Remote commands for one apply against one node
pub struct NodeSession<'a, E: RemoteExecutor> {
    executor: &'a E,
    prevent_sudo: bool,
    default_timeout: Duration,
    cancel: CancellationToken,
}

impl<'a, E: RemoteExecutor> NodeSession<'a, E> {
    pub fn new(
        executor: &'a E,
        prevent_sudo: bool,
        default_timeout: Duration,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            executor,
            prevent_sudo,
            default_timeout,
            cancel,
        }
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    fn ensure_not_cancelled(&self, script: &str) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(ProvisionError::Cancelled(script.to_string()));
        }
        Ok(())
    }

    fn invocation(&self, command: RemoteCommand, stdin: Option<Vec<u8>>) -> Invocation {
        let timeout = command.timeout.unwrap_or(self.default_timeout);
        Invocation {
            sudo: command.elevated && !self.prevent_sudo,
            command,
            stdin,
            timeout,
        }
    }

    fn classify_privilege(&self, script: &str, output: &CommandOutput) -> Result<()> {
        if output.success() {
            return Ok(());
        }

        let text = output.combined().to_lowercase();
        let sudo_refused = text.contains(SUDO_PASSWORD_MARKER);
        let denied = PERMISSION_MARKERS.iter().any(|m| text.contains(m));

        if sudo_refused || (self.prevent_sudo && denied) {
            return Err(ProvisionError::InsufficientPrivilege {
                command: script.to_string(),
                message: output.tail(3),
            });
        }
        Ok(())
    }

    /// Run a command; a non-zero exit is returned as output, not as an error
    pub async fn run(&self, command: RemoteCommand) -> Result<CommandOutput> {
        self.ensure_not_cancelled(&command.script)?;

        let script = command.script.clone();
        debug!(command = %script, elevated = command.elevated, "Running remote command");

        let output = self.executor.execute(self.invocation(command, None)).await?;
        self.classify_privilege(&script, &output)?;

        debug!(command = %script, exit_code = output.exit_code, "Remote command finished");
        Ok(output)
    }

    /// Run a command that must exit zero
    pub async fn check(&self, command: RemoteCommand) -> Result<CommandOutput> {
        let script = command.script.clone();
        let output = self.run(command).await?;

        if !output.success() {
            return Err(ProvisionError::CommandFailed {
                command: script,
                exit_code: output.exit_code,
                output: output.tail(10),
            });
        }
        Ok(output)
    }

    /// Write a file on the node
    pub async fn upload(&self, path: &str, contents: &[u8], mode: u32, elevated: bool) -> Result<()> {
        let label = format!("upload {}", path);
        self.ensure_not_cancelled(&label)?;

        let sudo = elevated && !self.prevent_sudo;
        let output = self
            .executor
            .upload(path, contents, mode, sudo, self.default_timeout)
            .await?;
        self.classify_privilege(&label, &output)?;

        if !output.success() {
            return Err(ProvisionError::CommandFailed {
                command: label,
                exit_code: output.exit_code,
                output: output.tail(5),
            });
        }
        Ok(())
    }

    /// Hostname as reported by the node itself
    pub async fn hostname(&self) -> Result<String> {
        let output = self.check(RemoteCommand::new("hostname")).await?;
        let name = output.stdout.trim().to_lowercase();
        if name.is_empty() {
            return Err(ProvisionError::CommandFailed {
                command: "hostname".to_string(),
                exit_code: 0,
                output: "empty hostname".to_string(),
            });
        }
        Ok(name)
    }

    /// Upload `contents` to a fresh temporary file, run `body` with its path,
    /// then remove the file whatever `body` returned.
    ///
    /// Removal is skipped once the session is cancelled.
    pub async fn with_temp_file<F, Fut, T>(
        &self,
        purpose: &str,
        contents: &[u8],
        mode: u32,
        body: F,
    ) -> Result<T>
    where
        F: FnOnce(String) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let path = format!("/tmp/kubeadm-provisioner-{}-{}", purpose, Uuid::new_v4().simple());

        let result = match self.upload(&path, contents, mode, false).await {
            Ok(()) => body(path.clone()).await,
            Err(e) => Err(e),
        };

        if self.is_cancelled() {
            warn!(path = %path, "Cancelled, leaving temporary file behind");
            return result;
        }

        let cleanup = RemoteCommand::new(format!("rm -f {}", shell_quote(&path)));
        match self.run(cleanup).await {
            Ok(output) if output.success() => {}
            Ok(output) => warn!(path = %path, "Failed to remove temporary file: {}", output.tail(2)),
            Err(e) => warn!(path = %path, "Failed to remove temporary file: {}", e),
        }

        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::scripted::{Reply, ScriptedExecutor};

    fn session(executor: &ScriptedExecutor, prevent_sudo: bool) -> NodeSession<'_, ScriptedExecutor> {
        NodeSession::new(
            executor,
            prevent_sudo,
            Duration::from_secs(30),
            CancellationToken::new(),
        )
    }

    #[tokio::test]
    async fn test_sudo_follows_prevent_sudo() {
        let executor = ScriptedExecutor::new();

        session(&executor, false)
            .run(RemoteCommand::elevated("kubeadm reset --force"))
            .await
            .unwrap();
        session(&executor, true)
            .run(RemoteCommand::elevated("kubeadm reset --force"))
            .await
            .unwrap();

        let invocations = executor.invocations();
        assert!(invocations[0].sudo);
        assert!(!invocations[1].sudo);
    }

    #[tokio::test]
    async fn test_permission_failure_with_prevent_sudo() {
        let executor = ScriptedExecutor::new();
        executor.on(
            "kubeadm reset",
            Reply::exit(1, "", "[ERROR IsPrivilegedUser]: user is not running as root"),
        );

        let err = session(&executor, true)
            .run(RemoteCommand::elevated("kubeadm reset --force"))
            .await
            .unwrap_err();

        assert!(matches!(err, ProvisionError::InsufficientPrivilege { .. }));
        assert_eq!(executor.count("kubeadm reset"), 1);
    }

    #[tokio::test]
    async fn test_permission_text_without_prevent_sudo_is_plain_output() {
        let executor = ScriptedExecutor::new();
        executor.on("cat /etc/shadow", Reply::exit(1, "", "Permission denied"));

        let output = session(&executor, false)
            .run(RemoteCommand::new("cat /etc/shadow"))
            .await
            .unwrap();
        assert_eq!(output.exit_code, 1);
    }

    #[tokio::test]
    async fn test_check_reports_command_and_exit_code() {
        let executor = ScriptedExecutor::new();
        executor.on("false", Reply::exit(4, "", "nope"));

        let err = session(&executor, false)
            .check(RemoteCommand::new("false"))
            .await
            .unwrap_err();

        assert_eq!(err.command(), Some("false"));
        assert_eq!(err.exit_code(), Some(4));
    }

    #[tokio::test]
    async fn test_cancelled_session_issues_nothing() {
        let executor = ScriptedExecutor::new();
        let session = session(&executor, false);
        session.cancel_token().cancel();

        let err = session.run(RemoteCommand::new("hostname")).await.unwrap_err();
        assert!(matches!(err, ProvisionError::Cancelled(_)));
        assert!(executor.invocations().is_empty());
    }

    #[tokio::test]
    async fn test_temp_file_removed_after_failure() {
        let executor = ScriptedExecutor::new();
        let session = session(&executor, false);

        let result: Result<()> = session
            .with_temp_file("script", b"exit 1", 0o755, |path| async move {
                Err(ProvisionError::InstallFailure(path))
            })
            .await;

        let path = match result {
            Err(ProvisionError::InstallFailure(path)) => path,
            other => panic!("unexpected result {:?}", other),
        };
        assert!(executor.uploaded(&path).is_some());
        assert_eq!(executor.count(&format!("rm -f {}", path)), 1);
    }

    #[tokio::test]
    async fn test_hostname_is_lowercased() {
        let executor = ScriptedExecutor::new();
        executor.on("hostname", Reply::stdout("Node-1\n"));

        assert_eq!(session(&executor, false).hostname().await.unwrap(), "node-1");
    }
}
