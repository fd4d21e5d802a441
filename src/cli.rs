//! Command line interface for the control plane.
//!
//! Parses the command line arguments and decides how the application runs
//! as defined in [CliCommand].

use crate::config::{ConfigError, ControlPlaneConfig};
use crate::logging::{FileLoggerGuard, LoggingError};
use clap::Parser;
use std::path::PathBuf;
use thiserror::Error;
use tracing::info;

const DEFAULT_CONFIG_PATH: &str = "/etc/supervisor-control/config.yml";

/// All possible errors that can happen while running the CLI.
#[derive(Debug, Error)]
pub enum CliError {
    #[error("could not read control plane config: `{0}`")]
    Config(#[from] ConfigError),

    #[error("could not initialize logging: `{0}`")]
    Logging(#[from] LoggingError),
}

/// What action was requested from the CLI?
pub enum CliCommand {
    /// Normal operation requested. Carries the loaded config, its source
    /// path (re-read on reload) and the file logger guard, which must be
    /// held for the process lifetime.
    Run(Box<ControlPlaneConfig>, PathBuf, FileLoggerGuard),
    /// A "one-shot" operation that exits after performing.
    PrintVersion,
    PrintConfig(Box<ControlPlaneConfig>),
}

/// Command line arguments, as parsed by [`clap`].
#[derive(Parser, Debug)]
#[command(author, about, long_about = None)]
pub struct Cli {
    /// Path of the control plane configuration file.
    #[arg(short, long, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    #[arg(long)]
    version: bool,

    /// Loads and validates the configuration, prints a summary and exits.
    #[arg(long)]
    print_config: bool,
}

impl Cli {
    /// Parses command line arguments and decides how the application runs.
    pub fn init() -> Result<CliCommand, CliError> {
        let cli = Self::parse();

        if cli.version {
            return Ok(CliCommand::PrintVersion);
        }

        let config = ControlPlaneConfig::load(&cli.config)?;

        if cli.print_config {
            return Ok(CliCommand::PrintConfig(Box::new(config)));
        }

        let logger_guard = config.log.try_init()?;
        info!(
            config_path = %cli.config.display(),
            projects = config.projects.len(),
            "starting supervisor control plane"
        );

        Ok(CliCommand::Run(Box::new(config), cli.config, logger_guard))
    }
}

pub fn version_string() -> String {
    format!("{} {}", env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION"))
}
