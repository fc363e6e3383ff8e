//! In-memory executor with canned replies, for tests

use super::{CommandOutput, Invocation, RemoteExecutor};
use crate::error::{ProvisionError, Result};
use std::collections::{BTreeMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

/// Canned reply to a command
#[derive(Debug, Clone)]
pub enum Reply {
    Exit(CommandOutput),
    Unreachable,
    Timeout,
}

impl Reply {
    pub fn ok() -> Self {
        Self::stdout("")
    }

    pub fn stdout(stdout: &str) -> Self {
        Self::exit(0, stdout, "")
    }

    pub fn exit(exit_code: i32, stdout: &str, stderr: &str) -> Self {
        Reply::Exit(CommandOutput {
            exit_code,
            stdout: stdout.to_string(),
            stderr: stderr.to_string(),
        })
    }
}

struct Rule {
    needle: String,
    replies: VecDeque<Reply>,
}

/// Executor answering commands from rules matched by substring.
///
/// The most recently added matching rule wins. A rule holding several replies
/// hands them out in order and keeps repeating the last one. Unmatched
/// commands succeed with empty output.
#[derive(Default)]
pub struct ScriptedExecutor {
    rules: Mutex<Vec<Rule>>,
    invocations: Mutex<Vec<Invocation>>,
    files: Mutex<BTreeMap<String, Vec<u8>>>,
}

impl ScriptedExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on(&self, needle: &str, reply: Reply) {
        self.on_sequence(needle, vec![reply]);
    }

    pub fn on_sequence(&self, needle: &str, replies: Vec<Reply>) {
        self.rules.lock().unwrap().push(Rule {
            needle: needle.to_string(),
            replies: replies.into(),
        });
    }

    /// Every invocation seen so far, uploads excluded
    pub fn invocations(&self) -> Vec<Invocation> {
        self.invocations.lock().unwrap().clone()
    }

    /// Scripts of every invocation, in order
    pub fn commands(&self) -> Vec<String> {
        self.invocations()
            .into_iter()
            .map(|i| i.command.script)
            .collect()
    }

    /// Number of commands containing `needle`
    pub fn count(&self, needle: &str) -> usize {
        self.commands().iter().filter(|c| c.contains(needle)).count()
    }

    /// Position of the first command containing `needle`
    pub fn position(&self, needle: &str) -> Option<usize> {
        self.commands().iter().position(|c| c.contains(needle))
    }

    /// Contents uploaded to `path`
    pub fn uploaded(&self, path: &str) -> Option<Vec<u8>> {
        self.files.lock().unwrap().get(path).cloned()
    }

    /// Paths of every upload
    pub fn uploaded_paths(&self) -> Vec<String> {
        self.files.lock().unwrap().keys().cloned().collect()
    }

    fn reply_for(&self, script: &str) -> Reply {
        let mut rules = self.rules.lock().unwrap();
        let rule = rules
            .iter_mut()
            .rev()
            .find(|rule| script.contains(&rule.needle));

        match rule {
            Some(rule) if rule.replies.len() > 1 => rule.replies.pop_front().unwrap_or_else(Reply::ok),
            Some(rule) => rule.replies.front().cloned().unwrap_or_else(Reply::ok),
            None => Reply::ok(),
        }
    }
}

impl RemoteExecutor for ScriptedExecutor {
    async fn execute(&self, invocation: Invocation) -> Result<CommandOutput> {
        let script = invocation.command.script.clone();
        let timeout = invocation.timeout;
        self.invocations.lock().unwrap().push(invocation);

        match self.reply_for(&script) {
            Reply::Exit(output) => Ok(output),
            Reply::Unreachable => Err(ProvisionError::Unreachable(format!(
                "connection refused running {}",
                script
            ))),
            Reply::Timeout => Err(ProvisionError::Timeout {
                command: script,
                seconds: timeout.as_secs(),
            }),
        }
    }

    async fn upload(
        &self,
        path: &str,
        contents: &[u8],
        _mode: u32,
        _sudo: bool,
        _timeout: Duration,
    ) -> Result<CommandOutput> {
        self.files
            .lock()
            .unwrap()
            .insert(path.to_string(), contents.to_vec());
        Ok(CommandOutput::default())
    }
}
