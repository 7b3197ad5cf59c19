//! Remote execution contract

use async_trait::async_trait;
use secrecy::SecretString;

use crate::errors::DeployError;

/// A shell command to run on a remote host
#[derive(Debug)]
pub struct RemoteCommand {
    /// Script passed to the remote shell
    pub script: String,

    /// What gets logged instead of the script
    pub display: String,

    /// Fed to the command's stdin; never logged
    pub stdin: Option<SecretString>,
}

impl RemoteCommand {
    pub fn new(script: impl Into<String>) -> Self {
        let script = script.into();
        Self {
            display: script.clone(),
            script,
            stdin: None,
        }
    }

    /// Replace the logged form of the command
    pub fn with_display(mut self, display: impl Into<String>) -> Self {
        self.display = display.into();
        self
    }

    pub fn with_stdin(mut self, stdin: SecretString) -> Self {
        self.stdin = Some(stdin);
        self
    }
}

/// Result of a remote command that ran to completion
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
}

impl ExecOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    /// Last non-empty stderr line, or stdout when stderr is empty
    pub fn summary(&self) -> String {
        let text = if self.stderr.trim().is_empty() {
            &self.stdout
        } else {
            &self.stderr
        };
        text.lines()
            .rev()
            .find(|l| !l.trim().is_empty())
            .unwrap_or("")
            .trim()
            .to_string()
    }
}

/// Runs commands on a remote host over an authenticated transport.
///
/// Transport failures surface as `RemoteConnectivity` (retryable) or
/// `RemoteAuth` (fatal). A command that ran and exited non-zero is not an
/// error at this level.
#[async_trait]
pub trait RemoteExec: Send + Sync {
    async fn exec(&self, address: &str, command: &RemoteCommand)
        -> Result<ExecOutput, DeployError>;
}

/// Single-quote an argument for a POSIX shell
pub fn shell_quote(arg: &str) -> String {
    let safe = !arg.is_empty()
        && arg
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_./:=@,+".contains(c));
    if safe {
        return arg.to_string();
    }
    format!("'{}'", arg.replace('\'', "'\\''"))
}
