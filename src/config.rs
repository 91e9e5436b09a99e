use std::time::Duration;

use clap::Parser;

pub const PORT_ENV: &str = "PORT";
pub const EMULATOR_HOST_ENV: &str = "CLOUD_RUN_EMULATOR_HOST";

/// Command-line flags.
#[derive(Parser, Debug)]
#[command(version, about = "Envoy control plane for routing between Cloud Run services")]
pub struct Args {
    /// Port to listen on; the PORT environment variable takes effect in practice
    #[arg(long, default_value_t = 5000)]
    pub port: u16,

    /// Google Cloud project to watch
    #[arg(long)]
    pub project: String,

    /// Cloud Run location to watch
    #[arg(long)]
    pub location: String,

    /// How often to refresh services from Cloud Run, e.g. 30s
    #[arg(long)]
    pub sync_period: String,
}

#[derive(thiserror::Error, Debug)]
pub enum FlagError {
    #[error("invalid --sync-period {value:?}: {reason}")]
    SyncPeriod { value: String, reason: String },
}

#[derive(thiserror::Error, Debug)]
pub enum EnvError {
    #[error("the {PORT_ENV} environment variable is required")]
    MissingPort,
    #[error("the {PORT_ENV} environment variable must be a port number, got {0:?}")]
    InvalidPort(String),
}

/// Process environment. `PORT` is required and wins over `--port`;
/// `CLOUD_RUN_EMULATOR_HOST` switches the upstream client to a local
/// emulator without TLS or auth.
#[derive(Clone, Debug)]
pub struct Environment {
    pub port: u16,
    pub emulator_host: Option<String>,
}

impl Environment {
    pub fn from_env() -> Result<Self, EnvError> {
        let port = std::env::var(PORT_ENV).map_err(|_| EnvError::MissingPort)?;
        let port = port.parse().map_err(|_| EnvError::InvalidPort(port))?;
        let emulator_host = std::env::var(EMULATOR_HOST_ENV)
            .ok()
            .filter(|host| !host.is_empty());
        Ok(Environment {
            port,
            emulator_host,
        })
    }
}

/// Everything the control plane needs to run, merged from flags and
/// environment.
#[derive(Clone, Debug)]
pub struct Config {
    pub port: u16,
    pub project: String,
    pub location: String,
    pub sync_period: Duration,
    pub emulator_host: Option<String>,
}

impl Config {
    pub fn new(args: &Args, env: &Environment) -> Result<Self, FlagError> {
        let sync_period =
            duration_str::parse(args.sync_period.as_str()).map_err(|e| FlagError::SyncPeriod {
                value: args.sync_period.clone(),
                reason: e.to_string(),
            })?;
        Ok(Config {
            port: env.port,
            project: args.project.clone(),
            location: args.location.clone(),
            sync_period,
            emulator_host: env.emulator_host.clone(),
        })
    }
}
