//! Command handlers.

use anyhow::Context;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use tether_agent::{AgentConfig, DelegateAgent};
use tether_core::Error;
use tracing::{error, info, warn};

const DEFAULT_CONFIG_FILE: &str = "tether.yaml";

/// Load the file (explicit path, else `tether.yaml` when present), then
/// apply environment overrides.
pub fn load_config(path: Option<&Path>) -> anyhow::Result<AgentConfig> {
    let path: Option<PathBuf> = match path {
        Some(path) => Some(path.to_path_buf()),
        None => Some(PathBuf::from(DEFAULT_CONFIG_FILE)).filter(|p| p.exists()),
    };

    let mut config = match &path {
        Some(path) => AgentConfig::from_file(path)
            .with_context(|| format!("failed to load {}", path.display()))?,
        None => AgentConfig::default(),
    };
    config
        .apply_env()
        .context("invalid environment override")?;
    Ok(config)
}

pub async fn run(path: Option<&Path>) -> anyhow::Result<ExitCode> {
    let config = load_config(path)?;
    config.validate().context("invalid configuration")?;

    let mut agent = DelegateAgent::from_config(config)?;
    let state = agent.state().clone();

    let started = tokio::select! {
        result = agent.start() => result,
        _ = tokio::signal::ctrl_c() => {
            state.set_acquiring(false);
            warn!("Interrupted before registration completed");
            Err(Error::RegistrationAbandoned)
        }
    };

    match started {
        Ok(identity) => info!(agent_id = %identity.agent_id, "Delegate agent running"),
        Err(Error::SelfDestruct) => {
            warn!("Control plane requested self destruct during registration");
            return Ok(ExitCode::SUCCESS);
        }
        Err(Error::RegistrationAbandoned) => {
            error!("Registration abandoned");
            return Ok(ExitCode::FAILURE);
        }
        Err(e) => return Err(e.into()),
    }

    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("Received interrupt"),
        _ = agent.wait_for_shutdown() => info!("Shutdown requested"),
    }

    agent.shutdown().await?;
    Ok(ExitCode::SUCCESS)
}

pub fn show_config(path: Option<&Path>) -> anyhow::Result<ExitCode> {
    let config = load_config(path)?;
    let yaml = serde_yaml::to_string(&config.redacted())?;
    println!("{yaml}");
    Ok(ExitCode::SUCCESS)
}

pub fn validate_config(path: Option<&Path>) -> anyhow::Result<ExitCode> {
    let config = load_config(path)?;
    match config.validate() {
        Ok(()) => {
            println!("Configuration is valid");
            Ok(ExitCode::SUCCESS)
        }
        Err(e) => {
            println!("Configuration is invalid: {e}");
            Ok(ExitCode::FAILURE)
        }
    }
}
