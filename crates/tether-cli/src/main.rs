//! Tether CLI entrypoint.

use clap::Parser;
use std::process::ExitCode;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, fmt};

mod commands;
mod handlers;

use commands::{Commands, ConfigCommands, LogFormat};

#[derive(Parser)]
#[command(name = "tether")]
#[command(author, version, about = "Tether delegate agent", long_about = None)]
struct Cli {
    /// Log output format
    #[arg(long, value_enum, global = true, default_value_t = LogFormat::Text)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Commands,
}

fn init_tracing(format: LogFormat) {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let registry = tracing_subscriber::registry().with(env_filter);

    match format {
        LogFormat::Text => registry
            .with(fmt::layer().with_target(true).with_thread_ids(true))
            .init(),
        LogFormat::Json => registry
            .with(fmt::layer().json().with_target(true).with_thread_ids(true))
            .init(),
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let _ = dotenvy::dotenv();
    let cli = Cli::parse();
    init_tracing(cli.log_format);

    let result = match cli.command {
        Commands::Run { config } => handlers::run(config.as_deref()).await,
        Commands::Config { command, config } => match command {
            ConfigCommands::Show => handlers::show_config(config.as_deref()),
            ConfigCommands::Validate => handlers::validate_config(config.as_deref()),
        },
    };

    match result {
        Ok(code) => code,
        Err(e) => {
            tracing::error!("tether failed: {e:#}");
            ExitCode::FAILURE
        }
    }
}
