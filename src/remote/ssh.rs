//! Remote execution through the system `ssh` client

use super::process::run_captured;
use super::{CommandOutput, Invocation, RemoteExecutor};
use crate::error::{ProvisionError, Result};
use std::path::PathBuf;
use std::time::Duration;
use tokio::process::Command;
use tracing::debug;

/// Exit status `ssh` uses for its own failures
const SSH_CONNECTION_FAILURE: i32 = 255;

/// Exit status of `timeout` on the node when the command ran out of time
const REMOTE_DEADLINE_EXPIRED: i32 = 124;

/// Between TERM and KILL on the node
const REMOTE_KILL_AFTER: Duration = Duration::from_secs(5);

/// Where and how to connect
#[derive(Debug, Clone)]
pub struct SshTarget {
    pub host: String,
    pub user: Option<String>,
    pub port: u16,
    /// Private key file
    pub identity: Option<PathBuf>,
    pub connect_timeout: Duration,
}

impl SshTarget {
    pub fn new(host: &str) -> Self {
        Self {
            host: host.to_string(),
            user: None,
            port: 22,
            identity: None,
            connect_timeout: Duration::from_secs(15),
        }
    }

    /// `user@host` or just `host`
    pub fn destination(&self) -> String {
        match &self.user {
            Some(user) => format!("{}@{}", user, self.host),
            None => self.host.clone(),
        }
    }
}

/// Executor running every command over a fresh, non-interactive ssh connection
#[derive(Debug, Clone)]
pub struct SshExecutor {
    target: SshTarget,
}

impl SshExecutor {
    pub fn new(target: SshTarget) -> Self {
        Self { target }
    }

    pub fn target(&self) -> &SshTarget {
        &self.target
    }

    fn ssh_args(&self) -> Vec<String> {
        let mut args = vec![
            "-o".to_string(),
            "BatchMode=yes".to_string(),
            "-o".to_string(),
            "StrictHostKeyChecking=accept-new".to_string(),
            "-o".to_string(),
            format!("ConnectTimeout={}", self.target.connect_timeout.as_secs().max(1)),
            "-p".to_string(),
            self.target.port.to_string(),
        ];

        if let Some(identity) = &self.target.identity {
            args.push("-i".to_string());
            args.push(identity.display().to_string());
        }

        args.push(self.target.destination());
        args.push("--".to_string());
        args
    }

    /// Local deadline for the ssh client.
    ///
    /// Longer than the node's own deadline, so a timed-out command is gone
    /// from the node before the next one starts. Only a hung connection
    /// hits it.
    fn local_deadline(&self, timeout: Duration) -> Duration {
        timeout + self.target.connect_timeout + REMOTE_KILL_AFTER + Duration::from_secs(5)
    }
}

impl RemoteExecutor for SshExecutor {
    async fn execute(&self, invocation: Invocation) -> Result<CommandOutput> {
        let line = invocation.deadline_line(REMOTE_KILL_AFTER);
        debug!(host = %self.target.host, command = %invocation.command.script, "ssh exec");

        let mut cmd = Command::new("ssh");
        cmd.args(self.ssh_args()).arg(&line);

        let output = run_captured(
            cmd,
            invocation.stdin,
            self.local_deadline(invocation.timeout),
            &invocation.command.script,
        )
        .await?;

        match output.exit_code {
            SSH_CONNECTION_FAILURE => Err(ProvisionError::Unreachable(format!(
                "{}: {}",
                self.target.destination(),
                output.stderr.trim()
            ))),
            REMOTE_DEADLINE_EXPIRED => Err(ProvisionError::Timeout {
                command: invocation.command.script,
                seconds: invocation.timeout.as_secs(),
            }),
            _ => Ok(output),
        }
    }
}
