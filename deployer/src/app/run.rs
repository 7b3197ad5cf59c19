//! Command execution

use std::future::Future;
use std::sync::Arc;

use anyhow::{Context, Result};
use colored::Colorize;
use futures::future::join_all;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::app::options::{AppOptions, Command};
use crate::authn::resolver::CredentialResolver;
use crate::authn::secrets::{DotenvSecretSource, EnvSecretSource, LayeredSecretSource};
use crate::deploy::fsm::DeploymentStatus;
use crate::deploy::reconciler::{
    DeployMode, DeploymentReport, Reconciler, ReconcilerOptions, StatusReport,
};
use crate::errors::DeploymentFailure;
use crate::http::health::HttpHealthProbe;
use crate::infra::lambda::LambdaConnector;
use crate::models::preset::Preset;
use crate::remote::ssh::{SshExecutor, SshOptions};
use crate::storage::identity::IdentityStore;
use crate::storage::presets::{list_presets, load_preset};
use crate::storage::settings::Settings;

/// Run one command. Returns false when any deployment failed.
pub async fn run(
    options: AppOptions,
    settings: Settings,
    shutdown_signal: impl Future<Output = ()> + Send + 'static,
) -> Result<bool> {
    let layout = &options.layout;
    layout
        .setup()
        .await
        .with_context(|| format!("Cannot create storage under {:?}", layout.base_dir))?;

    if options.command == Command::ListPresets {
        for name in list_presets(&layout.presets_dir()).await? {
            println!("{}", name);
        }
        return Ok(true);
    }

    let reconciler = Arc::new(build_reconciler(&options, &settings)?);

    // stage-boundary cancellation on SIGINT/SIGTERM
    let cancel = CancellationToken::new();
    let signal_token = cancel.clone();
    tokio::spawn(async move {
        shutdown_signal.await;
        warn!("Cancelling running deployments at the next stage boundary");
        signal_token.cancel();
    });

    match &options.command {
        Command::Deploy { presets, force } => {
            let mode = if *force {
                DeployMode::Force
            } else {
                DeployMode::Normal
            };
            let mut loaded = Vec::with_capacity(presets.len());
            for name in presets {
                let preset = load_preset(&layout.presets_dir(), name)
                    .await
                    .with_context(|| format!("Cannot load preset '{}'", name))?;
                loaded.push(preset);
            }
            Ok(deploy_all(reconciler, loaded, mode, cancel).await)
        }
        Command::Resume { preset } => {
            let preset = load(&options, preset).await?;
            let outcome = reconciler.resume(&preset, &cancel).await;
            Ok(print_outcome(&outcome))
        }
        Command::Status { preset: Some(name) } => {
            let preset = load(&options, name).await?;
            let report = reconciler
                .status(&preset)
                .await
                .with_context(|| format!("Cannot read status of '{}'", name))?;
            print_status(&report);
            Ok(true)
        }
        Command::Status { preset: None } => {
            let records = reconciler.store().list().await?;
            if records.is_empty() {
                println!("No deployments");
            }
            for record in records {
                print_status(&StatusReport {
                    record,
                    signal: None,
                    latency: None,
                });
            }
            Ok(true)
        }
        Command::Shutdown {
            preset,
            release: and_release,
        } => {
            let preset = load(&options, preset).await?;
            let record = reconciler
                .teardown(&preset)
                .await
                .with_context(|| format!("Cannot shut down '{}'", preset.name))?;
            println!("{} {}", record.name.bold(), "TERMINATED".yellow());
            if *and_release {
                release(reconciler.store(), &preset.name).await?;
            }
            Ok(true)
        }
        Command::Release { preset } => {
            release(reconciler.store(), preset).await?;
            Ok(true)
        }
        Command::ListPresets | Command::Version => Ok(true),
    }
}

fn build_reconciler(options: &AppOptions, settings: &Settings) -> Result<Reconciler> {
    let mut secrets = LayeredSecretSource::new();
    if let Some(path) = options.secrets_file.as_ref().or(settings.secrets_file.as_ref()) {
        let dotenv = DotenvSecretSource::load(path)
            .with_context(|| format!("Cannot read secrets file {:?}", path))?;
        info!("Using secrets file {:?}", dotenv.path());
        secrets = secrets.push(dotenv);
    }
    secrets = secrets.push(EnvSecretSource);

    let store = Arc::new(IdentityStore::new(options.layout.records_dir()));
    let probe = HttpHealthProbe::new(std::time::Duration::from_secs(
        settings.readiness.request_timeout_secs,
    ))?;

    Ok(Reconciler::new(
        store,
        CredentialResolver::new(Arc::new(secrets)),
        Arc::new(LambdaConnector::new(settings.provider.clone())),
        Arc::new(SshExecutor::new(SshOptions::from_settings(&settings.ssh))),
        Arc::new(probe),
        ReconcilerOptions::from_settings(settings),
    ))
}

async fn load(options: &AppOptions, name: &str) -> Result<Preset> {
    load_preset(&options.layout.presets_dir(), name)
        .await
        .with_context(|| format!("Cannot load preset '{}'", name))
}

async fn release(store: &IdentityStore, name: &str) -> Result<()> {
    store
        .release(name)
        .await
        .with_context(|| format!("Cannot release '{}'", name))?;
    println!("{} released", name.bold());
    Ok(())
}

/// Run every preset as its own task; names never share state beyond the store
async fn deploy_all(
    reconciler: Arc<Reconciler>,
    presets: Vec<Preset>,
    mode: DeployMode,
    cancel: CancellationToken,
) -> bool {
    let handles = presets.into_iter().map(|preset| {
        let reconciler = reconciler.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move { reconciler.deploy(&preset, mode, &cancel).await })
    });

    let mut all_ok = true;
    for joined in join_all(handles).await {
        match joined {
            Ok(outcome) => all_ok &= print_outcome(&outcome),
            Err(e) => {
                error!("Deployment task panicked: {}", e);
                all_ok = false;
            }
        }
    }
    all_ok
}

fn print_outcome(outcome: &Result<DeploymentReport, DeploymentFailure>) -> bool {
    match outcome {
        Ok(report) => {
            let address = report.address.as_deref().unwrap_or("?");
            let mut line = format!(
                "{} {} at {}",
                report.name.bold(),
                report.status.to_string().green(),
                address
            );
            if let Some(ready) = &report.readiness {
                line.push_str(&format!(" ({} polls, {:?})", ready.polls, ready.elapsed));
            }
            if let Some(action) = report.reconciled {
                line.push_str(&format!(" [reconcile: {:?}]", action));
            }
            println!("{}", line);
            true
        }
        Err(failure) => {
            let mut line = format!(
                "{} {} in {} [{}]: {}",
                failure.name.bold(),
                "FAILED".red(),
                failure.stage,
                failure.kind(),
                failure.error
            );
            if failure.poisoned {
                line.push_str(&format!(" {}", "(poisoned: redeploy under a new name)".red().bold()));
            }
            println!("{}", line);
            false
        }
    }
}

fn print_status(report: &StatusReport) {
    let record = &report.record;
    let status = match record.status {
        DeploymentStatus::Ready => record.status.to_string().green(),
        DeploymentStatus::Failed => record.status.to_string().red(),
        DeploymentStatus::Terminated => record.status.to_string().dimmed(),
        _ => record.status.to_string().yellow(),
    };

    let mut line = format!(
        "{} {} attempt {} instance {} address {}",
        record.name.bold(),
        status,
        record.attempt_count,
        record.instance_id.as_deref().unwrap_or("-"),
        record.public_address.as_deref().unwrap_or("-"),
    );
    if record.poisoned() {
        line.push_str(&format!(" {}", "POISONED".red().bold()));
    }
    if let Some(signal) = &report.signal {
        line.push_str(&format!(" health {:?}", signal.phase()));
    }
    if let Some(latency) = report.latency {
        line.push_str(&format!(" in {:?}", latency));
    }
    println!("{}", line);

    if let Some(error) = &record.last_error {
        println!("  last error: {}", error);
    }
    if let Some(reason) = &record.poison_reason {
        println!("  poisoned: {}", reason);
    }
}
