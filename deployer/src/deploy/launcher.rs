//! Container launch on the remote host
//!
//! Every docker call runs as root on the instance, so registry login goes to
//! root's credential store there, never to the operator's machine.

use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::authn::credentials::{CredentialSet, ExecutionContext};
use crate::authn::secrets::clone_secret;
use crate::errors::DeployError;
use crate::models::preset::Preset;
use crate::remote::exec::{shell_quote, ExecOutput, RemoteCommand, RemoteExec};
use crate::utils::{calc_exp_backoff, CooldownOptions};

/// stderr fragments docker prints when the GPU runtime is missing
const GPU_RUNTIME_ERRORS: &[&str] = &[
    "could not select device driver",
    "nvidia-container-cli",
    "no CUDA-capable device",
    "NVIDIA driver",
    "unknown or invalid runtime name: nvidia",
];

/// Installs docker engine, containerd and the buildx/compose plugins from
/// the upstream Ubuntu repository, then starts the daemon
const DOCKER_BOOTSTRAP: &[&str] = &[
    "sudo apt-get remove -y docker docker-engine docker.io containerd runc || true",
    "sudo apt-get update -y && sudo apt-get install -y ca-certificates curl gnupg lsb-release",
    "sudo mkdir -m 0755 -p /etc/apt/keyrings && curl -fsSL https://download.docker.com/linux/ubuntu/gpg | sudo gpg --batch --yes --dearmor -o /etc/apt/keyrings/docker.gpg",
    "echo \"deb [arch=$(dpkg --print-architecture) signed-by=/etc/apt/keyrings/docker.gpg] https://download.docker.com/linux/ubuntu $(lsb_release -cs) stable\" | sudo tee /etc/apt/sources.list.d/docker.list > /dev/null",
    "sudo apt-get update -y && sudo apt-get install -y docker-ce docker-ce-cli containerd.io docker-buildx-plugin docker-compose-plugin",
    "sudo systemctl enable --now docker",
];

const DOCKER_INFO: &str = "sudo docker info --format '{{.ServerVersion}}'";

/// Launch step policy
#[derive(Debug, Clone)]
pub struct LaunchPolicy {
    /// Attempts per step on transient remote errors
    pub step_attempts: u32,

    /// Check GPU visibility inside the started container
    pub verify_gpu: bool,

    /// Install docker when preflight finds none
    pub bootstrap_docker: bool,

    pub backoff: CooldownOptions,
}

impl Default for LaunchPolicy {
    fn default() -> Self {
        Self {
            step_attempts: 3,
            verify_gpu: true,
            bootstrap_docker: false,
            backoff: CooldownOptions::default(),
        }
    }
}

/// A started container
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerHandle {
    pub container_name: String,
    pub image: String,
    pub address: String,
    pub port: u16,
}

/// Runtime view of a container
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerState {
    /// docker status: created, running, restarting, exited, dead, ...
    pub status: String,
    pub running: bool,
    pub restart_count: u32,
    pub image: String,
}

impl ContainerState {
    /// The service process is gone or crash-looping
    pub fn is_dead(&self) -> bool {
        match self.status.as_str() {
            "exited" | "dead" => true,
            "restarting" => self.restart_count > 0,
            _ => false,
        }
    }

    fn parse(line: &str) -> Option<Self> {
        let mut fields = line.trim().splitn(4, '|');
        let status = fields.next()?.to_string();
        let running = fields.next()? == "true";
        let restart_count = fields.next()?.parse().ok()?;
        let image = fields.next()?.to_string();
        Some(Self {
            status,
            running,
            restart_count,
            image,
        })
    }
}

/// Look up a container on `address`; `None` when it does not exist
pub async fn inspect_container(
    remote: &dyn RemoteExec,
    address: &str,
    name: &str,
) -> Result<Option<ContainerState>, DeployError> {
    let command = RemoteCommand::new(format!(
        "sudo docker inspect --format '{{{{.State.Status}}}}|{{{{.State.Running}}}}|{{{{.RestartCount}}}}|{{{{.Config.Image}}}}' {}",
        shell_quote(name)
    ));
    let output = remote.exec(address, &command).await?;

    if !output.success() {
        if output.stderr.contains("No such") {
            return Ok(None);
        }
        return Err(DeployError::RuntimeCapabilityUnavailable(format!(
            "docker inspect {}: {}",
            name,
            output.summary()
        )));
    }

    ContainerState::parse(&output.stdout).map(Some).ok_or_else(|| {
        DeployError::Internal(format!("Unexpected docker inspect output: {}", output.stdout.trim()))
    })
}

pub struct ContainerLauncher {
    remote: Arc<dyn RemoteExec>,
    policy: LaunchPolicy,
}

impl ContainerLauncher {
    pub fn new(remote: Arc<dyn RemoteExec>, policy: LaunchPolicy) -> Self {
        Self { remote, policy }
    }

    /// The container runtime answers on the host, installing it first when
    /// bootstrap is enabled
    pub async fn preflight(&self, address: &str) -> Result<(), DeployError> {
        let info = RemoteCommand::new(DOCKER_INFO);
        let output = self.with_retry(address, &info).await?;
        if output.success() {
            debug!("docker {} on {}", output.stdout.trim(), address);
            return Ok(());
        }
        if !self.policy.bootstrap_docker {
            return Err(docker_unusable(address, &output));
        }

        warn!("docker is not usable on {} ({}), installing it", address, output.summary());
        for script in DOCKER_BOOTSTRAP {
            let command = RemoteCommand::new(*script);
            self.step(address, &command, |out| {
                DeployError::RuntimeCapabilityUnavailable(format!(
                    "docker install on {} failed at `{}`: {}",
                    address,
                    script,
                    out.summary()
                ))
            })
            .await?;
        }

        let output = self
            .step(address, &info, |out| docker_unusable(address, out))
            .await?;
        info!("Installed docker {} on {}", output.stdout.trim(), address);
        Ok(())
    }

    /// Log root on the host into the preset's registry. Returns false when
    /// there is nothing to log into.
    pub async fn authenticate(
        &self,
        address: &str,
        credentials: &CredentialSet,
    ) -> Result<bool, DeployError> {
        let Some(registry) = credentials.registry_for(ExecutionContext::RemoteRoot) else {
            debug!("No registry credential, pulling anonymously");
            return Ok(false);
        };

        let script = format!(
            "sudo docker login {} -u {} --password-stdin",
            shell_quote(&registry.server),
            shell_quote(&registry.username)
        );
        let command = RemoteCommand::new(script).with_stdin(clone_secret(registry.password()));
        self.step(address, &command, |out| {
            DeployError::AuthRejected(format!(
                "registry {} refused {}: {}",
                registry.server,
                registry.username,
                out.summary()
            ))
        })
        .await?;

        info!("Remote root logged into {}", registry.server);
        Ok(true)
    }

    /// Fetch the image and (re)start the container
    pub async fn launch(
        &self,
        address: &str,
        preset: &Preset,
        credentials: &CredentialSet,
    ) -> Result<ContainerHandle, DeployError> {
        self.fetch_image(address, preset).await?;

        let name = preset.container_name().to_string();
        let remove = RemoteCommand::new(format!(
            "sudo docker rm -f {} >/dev/null 2>&1 || true",
            shell_quote(&name)
        ));
        self.step(address, &remove, |out| DeployError::Internal(out.summary()))
            .await?;

        let script = format!(
            "sudo docker run -d --name {name} --gpus all --restart {restart} -p {port}:{port} --env-file /dev/stdin {image}",
            name = shell_quote(&name),
            restart = shell_quote(&preset.restart_policy.to_string()),
            port = preset.port,
            image = shell_quote(&preset.image),
        );
        let env_file = credentials.env_file()?;
        let command = RemoteCommand::new(script.clone())
            .with_display(format!("{} (env: {})", script, credentials.env_keys().join(",")))
            .with_stdin(env_file);

        let output = self
            .step(address, &command, |out| {
                if is_gpu_runtime_error(&out.stderr) {
                    DeployError::RuntimeCapabilityUnavailable(format!(
                        "GPU runtime unavailable on {}: {}",
                        address,
                        out.summary()
                    ))
                } else if is_image_error(&out.stderr) {
                    DeployError::ImagePullFailed(format!("{}: {}", preset.image, out.summary()))
                } else {
                    DeployError::RuntimeCapabilityUnavailable(format!(
                        "docker run {} on {}: {}",
                        name,
                        address,
                        out.summary()
                    ))
                }
            })
            .await?;
        info!(
            "Started container {} ({}) on {}",
            name,
            output.stdout.trim().chars().take(12).collect::<String>(),
            address
        );

        if self.policy.verify_gpu {
            self.verify_gpu(address, &name).await?;
        }

        Ok(ContainerHandle {
            container_name: name,
            image: preset.image.clone(),
            address: address.to_string(),
            port: preset.port,
        })
    }

    pub async fn inspect(&self, address: &str, name: &str) -> Result<Option<ContainerState>, DeployError> {
        inspect_container(self.remote.as_ref(), address, name).await
    }

    /// Stop and remove a container; a missing container is fine
    pub async fn stop(&self, address: &str, name: &str) -> Result<(), DeployError> {
        let command = RemoteCommand::new(format!("sudo docker rm -f {}", shell_quote(name)));
        let output = self.with_retry(address, &command).await?;
        if !output.success() && !output.stderr.contains("No such container") {
            return Err(DeployError::Internal(format!(
                "docker rm {}: {}",
                name,
                output.summary()
            )));
        }
        info!("Removed container {} on {}", name, address);
        Ok(())
    }

    async fn fetch_image(&self, address: &str, preset: &Preset) -> Result<(), DeployError> {
        let command = match &preset.build_context {
            Some(context) => RemoteCommand::new(format!(
                "sudo docker build -t {} {}",
                shell_quote(&preset.image),
                shell_quote(context)
            )),
            None => RemoteCommand::new(format!("sudo docker pull {}", shell_quote(&preset.image))),
        };

        info!("Fetching image {} on {}", preset.image, address);
        self.step(address, &command, |out| {
            DeployError::ImagePullFailed(format!("{}: {}", preset.image, out.summary()))
        })
        .await?;
        Ok(())
    }

    async fn verify_gpu(&self, address: &str, name: &str) -> Result<(), DeployError> {
        let command = RemoteCommand::new(format!("sudo docker exec {} nvidia-smi -L", shell_quote(name)));
        let output = self
            .step(address, &command, |out| {
                DeployError::RuntimeCapabilityUnavailable(format!(
                    "no GPU visible in {}: {}",
                    name,
                    out.summary()
                ))
            })
            .await?;

        if output.stdout.trim().is_empty() {
            return Err(DeployError::RuntimeCapabilityUnavailable(format!(
                "nvidia-smi lists no GPU in {}",
                name
            )));
        }
        debug!("GPUs in {}: {}", name, output.stdout.trim());
        Ok(())
    }

    /// Run one step; a non-zero exit becomes `on_failure`
    async fn step<F>(&self, address: &str, command: &RemoteCommand, on_failure: F) -> Result<ExecOutput, DeployError>
    where
        F: Fn(&ExecOutput) -> DeployError,
    {
        let output = self.with_retry(address, command).await?;
        if output.success() {
            Ok(output)
        } else {
            Err(on_failure(&output))
        }
    }

    /// Retry transport failures with backoff, up to the step ceiling
    async fn with_retry(&self, address: &str, command: &RemoteCommand) -> Result<ExecOutput, DeployError> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.remote.exec(address, command).await {
                Ok(output) => return Ok(output),
                Err(e) if e.is_transient() && attempt < self.policy.step_attempts => {
                    let delay = calc_exp_backoff(&self.policy.backoff, attempt - 1);
                    warn!(
                        "{} failed ({}), retrying in {:?} [{}/{}]",
                        command.display, e, delay, attempt, self.policy.step_attempts
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

fn docker_unusable(address: &str, output: &ExecOutput) -> DeployError {
    DeployError::RuntimeCapabilityUnavailable(format!(
        "docker is not usable on {}: {}",
        address,
        output.summary()
    ))
}

fn is_gpu_runtime_error(stderr: &str) -> bool {
    GPU_RUNTIME_ERRORS.iter().any(|needle| stderr.contains(needle))
}

fn is_image_error(stderr: &str) -> bool {
    ["Unable to find image", "pull access denied", "manifest unknown", "not found: manifest"]
        .iter()
        .any(|needle| stderr.contains(needle))
}
