//! Execution on the machine the provisioner runs on

use super::process::run_captured;
use super::{CommandOutput, Invocation, RemoteExecutor};
use crate::error::Result;
use tokio::process::Command;
use tracing::debug;

/// Executor for provisioning the local machine
#[derive(Debug, Clone, Default)]
pub struct LocalExecutor;

impl LocalExecutor {
    pub fn new() -> Self {
        Self
    }
}

impl RemoteExecutor for LocalExecutor {
    async fn execute(&self, invocation: Invocation) -> Result<CommandOutput> {
        debug!(command = %invocation.command.script, "local exec");

        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg(invocation.shell_line());

        run_captured(
            cmd,
            invocation.stdin,
            invocation.timeout,
            &invocation.command.script,
        )
        .await
    }
}
