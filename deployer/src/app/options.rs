//! Command line options
//!
//! `gpudeploy <command> [--key=value] [--flag]`

use std::collections::HashMap;
use std::path::PathBuf;

use crate::errors::DeployError;
use crate::logs::LogLevel;
use crate::storage::layout::StorageLayout;

/// What to do
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Deploy one or more presets concurrently
    Deploy { presets: Vec<String>, force: bool },

    /// Continue an interrupted deployment
    Resume { preset: String },

    /// Show records, optionally with a live health sample for one preset
    Status { preset: Option<String> },

    /// Tear a deployment down
    Shutdown { preset: String, release: bool },

    /// Forget a terminated deployment
    Release { preset: String },

    ListPresets,

    Version,
}

/// Main application options
#[derive(Debug, Clone)]
pub struct AppOptions {
    pub command: Command,

    /// Storage layout paths
    pub layout: StorageLayout,

    /// Overrides the settings file
    pub log_level: Option<LogLevel>,

    /// Overrides the settings file
    pub secrets_file: Option<PathBuf>,
}

impl Default for AppOptions {
    fn default() -> Self {
        Self {
            command: Command::ListPresets,
            layout: StorageLayout::default(),
            log_level: None,
            secrets_file: None,
        }
    }
}

/// Split arguments into the command word and `--key=value` pairs; bare
/// `--flag`s map to "true"
pub fn split_args(args: &[String]) -> (Option<String>, HashMap<String, String>) {
    let mut command = None;
    let mut cli_args = HashMap::new();

    for arg in args {
        if let Some((key, value)) = arg.split_once('=') {
            let clean_key = key.trim_start_matches('-');
            cli_args.insert(clean_key.to_string(), value.to_string());
        } else if arg.starts_with("--") {
            let clean_key = arg.trim_start_matches('-');
            cli_args.insert(clean_key.to_string(), "true".to_string());
        } else if command.is_none() {
            command = Some(arg.clone());
        }
    }

    (command, cli_args)
}

/// Parse the arguments after the program name
pub fn parse_args(args: &[String]) -> Result<AppOptions, DeployError> {
    let (command, cli_args) = split_args(args);
    let flag = |key: &str| cli_args.get(key).map(|v| v == "true").unwrap_or(false);
    let preset = || {
        cli_args
            .get("preset")
            .filter(|p| !p.is_empty())
            .cloned()
            .ok_or_else(|| DeployError::ConfigError("--preset=<name> is required".to_string()))
    };

    let command = if flag("version") {
        Command::Version
    } else {
        match command.as_deref() {
            Some("deploy") => {
                let presets: Vec<String> = preset()?
                    .split(',')
                    .map(str::trim)
                    .filter(|p| !p.is_empty())
                    .map(str::to_string)
                    .collect();
                Command::Deploy {
                    presets,
                    force: flag("force"),
                }
            }
            Some("resume") => Command::Resume { preset: preset()? },
            Some("status") => Command::Status {
                preset: cli_args.get("preset").cloned(),
            },
            Some("shutdown") => Command::Shutdown {
                preset: preset()?,
                release: flag("release"),
            },
            Some("release") => Command::Release { preset: preset()? },
            Some("list-presets") => Command::ListPresets,
            Some(other) => {
                return Err(DeployError::ConfigError(format!("Unknown command: {}", other)));
            }
            None => {
                return Err(DeployError::ConfigError(
                    "Usage: gpudeploy <deploy|resume|status|shutdown|release|list-presets> [--preset=<name>]"
                        .to_string(),
                ));
            }
        }
    };

    let layout = match cli_args.get("home") {
        Some(home) => StorageLayout::new(home),
        None => StorageLayout::default(),
    };
    let log_level = cli_args
        .get("log-level")
        .map(|l| l.parse::<LogLevel>())
        .transpose()
        .map_err(DeployError::ConfigError)?;

    Ok(AppOptions {
        command,
        layout,
        log_level,
        secrets_file: cli_args.get("secrets-file").map(PathBuf::from),
    })
}
