//! Skein visor daemon entry point.

mod config;
mod visor;

use clap::{Parser, Subcommand};
use config::Config;
use std::path::PathBuf;
use std::process::ExitCode;
use tracing_subscriber::EnvFilter;
use visor::Visor;

#[derive(Parser)]
#[command(name = "skein-visor", about = "Skein overlay network visor", version)]
struct Cli {
    /// Path to the visor config file
    #[arg(short, long, default_value = "skein.json")]
    config: PathBuf,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Write a fresh config with a generated identity and exit
    GenConfig,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    if let Some(Command::GenConfig) = cli.command {
        let config = Config::generate();
        if let Err(err) = config.save(&cli.config) {
            eprintln!("failed to write config: {err}");
            return ExitCode::FAILURE;
        }
        println!("wrote {} with pub_key {}", cli.config.display(), config.pub_key);
        return ExitCode::SUCCESS;
    }

    let config = match Config::load(&cli.config) {
        Ok(config) => config,
        Err(err) => {
            eprintln!("failed to load {}: {err}", cli.config.display());
            return ExitCode::FAILURE;
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(config.logging.level.clone())),
        )
        .init();

    let visor = match Visor::start(config).await {
        Ok(visor) => visor,
        Err(err) => {
            tracing::error!(%err, "visor failed to start");
            return ExitCode::FAILURE;
        }
    };

    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::error!(%err, "failed to wait for shutdown signal");
    }
    visor.close().await;
    ExitCode::SUCCESS
}
