//! SSH transport over the system `ssh` client

use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use secrecy::ExposeSecret;
use tokio::io::AsyncWriteExt;
use tokio::process::{ChildStdin, Command};
use tracing::debug;

use crate::errors::DeployError;
use crate::remote::exec::{ExecOutput, RemoteCommand, RemoteExec};
use crate::storage::settings::SshSettings;

/// Env var naming the private key file; wins over the settings file
pub const PRIVATE_KEY_ENV: &str = "SSH_PRIVATE_KEY";

/// ssh reserves this exit code for its own failures
const SSH_TRANSPORT_EXIT: i32 = 255;

/// SSH connection options
#[derive(Debug, Clone)]
pub struct SshOptions {
    pub username: String,
    pub private_key: Option<PathBuf>,
    pub connect_timeout: Duration,
    pub command_timeout: Duration,
}

impl Default for SshOptions {
    fn default() -> Self {
        Self::from_settings(&SshSettings::default())
    }
}

impl SshOptions {
    pub fn from_settings(settings: &SshSettings) -> Self {
        let private_key = std::env::var_os(PRIVATE_KEY_ENV)
            .filter(|v| !v.is_empty())
            .map(PathBuf::from)
            .or_else(|| settings.private_key_path.clone());

        Self {
            username: settings.username.clone(),
            private_key,
            connect_timeout: Duration::from_secs(settings.connect_timeout_secs),
            command_timeout: Duration::from_secs(settings.command_timeout_secs),
        }
    }
}

/// `RemoteExec` backed by the `ssh` binary
#[derive(Debug, Clone)]
pub struct SshExecutor {
    options: SshOptions,
}

impl SshExecutor {
    pub fn new(options: SshOptions) -> Self {
        Self { options }
    }

    fn args(&self, address: &str) -> Vec<String> {
        let mut args = vec![
            "-o".to_string(),
            "StrictHostKeyChecking=no".to_string(),
            "-o".to_string(),
            "UserKnownHostsFile=/dev/null".to_string(),
            "-o".to_string(),
            format!("ConnectTimeout={}", self.options.connect_timeout.as_secs().max(1)),
            "-o".to_string(),
            "BatchMode=yes".to_string(),
            "-o".to_string(),
            "LogLevel=ERROR".to_string(),
        ];
        if let Some(key) = &self.options.private_key {
            args.push("-i".to_string());
            args.push(key.display().to_string());
        }
        args.push(format!("{}@{}", self.options.username, address));
        args
    }

    async fn run(&self, address: &str, command: &RemoteCommand) -> Result<ExecOutput, DeployError> {
        let mut child = Command::new("ssh")
            .args(self.args(address))
            .arg(&command.script)
            .stdin(if command.stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| DeployError::Internal(format!("Failed to spawn ssh: {}", e)))?;

        if let (Some(input), Some(stdin)) = (&command.stdin, child.stdin.take()) {
            feed_stdin(stdin, input.expose_secret().as_bytes(), address).await?;
        }

        let output = child.wait_with_output().await?;
        Ok(ExecOutput {
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            exit_code: output.status.code().unwrap_or(-1),
        })
    }
}

#[async_trait]
impl RemoteExec for SshExecutor {
    async fn exec(
        &self,
        address: &str,
        command: &RemoteCommand,
    ) -> Result<ExecOutput, DeployError> {
        debug!("ssh {}@{}: {}", self.options.username, address, command.display);

        let output = tokio::time::timeout(self.options.command_timeout, self.run(address, command))
            .await
            .map_err(|_| {
                DeployError::RemoteConnectivity(format!(
                    "{} timed out after {:?}",
                    command.display, self.options.command_timeout
                ))
            })??;

        classify(address, output)
    }
}

/// Write the whole input and close the pipe. ssh exiting early means the
/// connection dropped.
async fn feed_stdin(mut stdin: ChildStdin, input: &[u8], address: &str) -> Result<(), DeployError> {
    let written = async {
        stdin.write_all(input).await?;
        stdin.shutdown().await
    };
    written.await.map_err(|e| {
        DeployError::RemoteConnectivity(format!("{}: ssh closed stdin early: {}", address, e))
    })
}

/// Separate ssh's own failures from the remote command's exit status
fn classify(address: &str, output: ExecOutput) -> Result<ExecOutput, DeployError> {
    if output.exit_code != SSH_TRANSPORT_EXIT {
        return Ok(output);
    }
    if output.stderr.contains("Permission denied") {
        return Err(DeployError::RemoteAuth(format!(
            "{}: {}",
            address,
            output.summary()
        )));
    }
    Err(DeployError::RemoteConnectivity(format!(
        "{}: {}",
        address,
        output.summary()
    )))
}
