//! Remote command execution on the target node
//!
//! The orchestrator only talks to the node through [`RemoteExecutor`]:
//! a shell command goes in, an exit status with captured output comes out.
//! Connection failures surface as [`ProvisionError::Unreachable`] and
//! expired deadlines as [`ProvisionError::Timeout`], never as exit codes.

pub mod local;
pub mod process;
#[cfg(test)]
pub mod scripted;
pub mod session;
pub mod ssh;

pub use local::LocalExecutor;
pub use session::NodeSession;
pub use ssh::{SshExecutor, SshTarget};

use crate::error::Result;
use std::future::Future;
use std::time::Duration;

/// A shell command to run on the node
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteCommand {
    /// Shell command line, interpreted by `sh -c`
    pub script: String,
    /// Needs root
    pub elevated: bool,
    /// Extra environment variables
    pub env: Vec<(String, String)>,
    /// Overrides the session's default timeout
    pub timeout: Option<Duration>,
}

impl RemoteCommand {
    /// Command run as the connecting user
    pub fn new(script: impl Into<String>) -> Self {
        Self {
            script: script.into(),
            elevated: false,
            env: Vec::new(),
            timeout: None,
        }
    }

    /// Command that needs root
    pub fn elevated(script: impl Into<String>) -> Self {
        Self {
            elevated: true,
            ..Self::new(script)
        }
    }

    /// Add an environment variable
    pub fn env(mut self, key: &str, value: &str) -> Self {
        self.env.push((key.to_string(), value.to_string()));
        self
    }

    /// Set a command-specific timeout
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// A command ready to be handed to an executor
#[derive(Debug, Clone)]
pub struct Invocation {
    pub command: RemoteCommand,
    /// Wrap in `sudo -n`
    pub sudo: bool,
    /// Bytes fed to the command's stdin
    pub stdin: Option<Vec<u8>>,
    pub timeout: Duration,
}

impl Invocation {
    fn body(&self) -> String {
        let mut body = String::new();
        for (key, value) in &self.command.env {
            body.push_str(&format!("{}={} ", key, shell_quote(value)));
        }
        body.push_str(&self.command.script);
        body
    }

    /// Full command line as run by the node's shell
    pub fn shell_line(&self) -> String {
        let shell = format!("sh -c {}", shell_quote(&self.body()));
        if self.sudo {
            format!("sudo -n {}", shell)
        } else {
            shell
        }
    }

    /// Like [`shell_line`](Self::shell_line), but the node itself kills the
    /// command and everything it started once `timeout` passes.
    ///
    /// `timeout` runs inside `sudo` so it can signal the elevated process group.
    pub fn deadline_line(&self, kill_after: Duration) -> String {
        let shell = format!(
            "timeout -k {}s {}s sh -c {}",
            kill_after.as_secs().max(1),
            self.timeout.as_secs().max(1),
            shell_quote(&self.body())
        );
        if self.sudo {
            format!("sudo -n {}", shell)
        } else {
            shell
        }
    }
}

/// Captured result of a finished command
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    /// stdout and stderr joined, for classification and diagnostics
    pub fn combined(&self) -> String {
        match (self.stdout.trim().is_empty(), self.stderr.trim().is_empty()) {
            (_, true) => self.stdout.trim().to_string(),
            (true, false) => self.stderr.trim().to_string(),
            (false, false) => format!("{}\n{}", self.stdout.trim(), self.stderr.trim()),
        }
    }

    /// Last lines of the combined output, for step details
    pub fn tail(&self, lines: usize) -> String {
        let combined = self.combined();
        let all: Vec<&str> = combined.lines().collect();
        let start = all.len().saturating_sub(lines);
        all[start..].join("\n")
    }
}

/// Runs commands on one node
pub trait RemoteExecutor: Send + Sync {
    /// Run a command and capture its output.
    ///
    /// A non-zero exit is `Ok`; only transport problems are errors.
    fn execute(&self, invocation: Invocation)
        -> impl Future<Output = Result<CommandOutput>> + Send;

    /// Atomically write `contents` to `path` with the given mode
    fn upload(
        &self,
        path: &str,
        contents: &[u8],
        mode: u32,
        sudo: bool,
        timeout: Duration,
    ) -> impl Future<Output = Result<CommandOutput>> + Send {
        let staging = format!("{}.upload", path);
        let script = format!(
            "mkdir -p \"$(dirname {path})\" && cat > {staging} && chmod {mode:o} {staging} && mv -f {staging} {path}",
            path = shell_quote(path),
            staging = shell_quote(&staging),
            mode = mode,
        );
        let invocation = Invocation {
            command: RemoteCommand::new(script),
            sudo,
            stdin: Some(contents.to_vec()),
            timeout,
        };
        self.execute(invocation)
    }
}

/// Quote a string for a POSIX shell
pub fn shell_quote(s: &str) -> String {
    if !s.is_empty()
        && s.chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_./:=,@%+".contains(c))
    {
        return s.to_string();
    }
    format!("'{}'", s.replace('\'', r"'\''"))
}
