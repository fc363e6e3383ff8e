//! Local child processes with captured output and a deadline

use super::CommandOutput;
use crate::error::{ProvisionError, Result};
use std::process::Stdio;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::debug;

/// Spawn `cmd`, feed it `stdin`, and wait for it to finish within `timeout`.
///
/// `display` names the command in errors. The child is killed when the
/// deadline passes.
pub async fn run_captured(
    mut cmd: Command,
    stdin: Option<Vec<u8>>,
    timeout: Duration,
    display: &str,
) -> Result<CommandOutput> {
    cmd.stdin(if stdin.is_some() {
        Stdio::piped()
    } else {
        Stdio::null()
    })
    .stdout(Stdio::piped())
    .stderr(Stdio::piped())
    .kill_on_drop(true);

    let mut child = cmd.spawn()?;

    if let (Some(data), Some(mut pipe)) = (stdin, child.stdin.take()) {
        tokio::spawn(async move {
            if let Err(e) = pipe.write_all(&data).await {
                debug!("Failed to write command stdin: {}", e);
            }
            // dropping the pipe closes stdin
        });
    }

    let output = match tokio::time::timeout(timeout, child.wait_with_output()).await {
        Ok(output) => output?,
        Err(_) => {
            return Err(ProvisionError::Timeout {
                command: display.to_string(),
                seconds: timeout.as_secs(),
            })
        }
    };

    Ok(CommandOutput {
        // killed by a signal
        exit_code: output.status.code().unwrap_or(-1),
        stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
        stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sh(script: &str) -> Command {
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg(script);
        cmd
    }

    #[tokio::test]
    async fn test_captures_output_and_exit_code() {
        let output = run_captured(
            sh("echo out; echo err >&2; exit 3"),
            None,
            Duration::from_secs(10),
            "test",
        )
        .await
        .unwrap();

        assert_eq!(output.exit_code, 3);
        assert_eq!(output.stdout, "out\n");
        assert_eq!(output.stderr, "err\n");
    }

    #[tokio::test]
    async fn test_feeds_stdin() {
        let output = run_captured(
            sh("cat"),
            Some(b"hello".to_vec()),
            Duration::from_secs(10),
            "cat",
        )
        .await
        .unwrap();

        assert_eq!(output.stdout, "hello");
    }

    #[tokio::test]
    async fn test_timeout() {
        let err = run_captured(sh("sleep 5"), None, Duration::from_millis(100), "sleep 5")
            .await
            .unwrap_err();

        assert!(matches!(err, ProvisionError::Timeout { ref command, .. } if command == "sleep 5"));
    }
}
