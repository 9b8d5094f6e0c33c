use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use liveness_core::freshness::build_schedule;
use liveness_core::ColorSpec;
use tracing_subscriber::EnvFilter;

mod config;
mod coordinator;
mod replay;
mod transport;

use config::LivenessConfig;
use transport::RecordingTransport;

#[derive(Parser)]
#[command(name = "liveness", about = "Face liveness challenge tools")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Replay a recorded session script and print what was uploaded
    Replay {
        /// Session script (JSON)
        script: PathBuf,
        /// TOML configuration file
        #[arg(long)]
        config: Option<PathBuf>,
        /// Write every transport event to this file as JSON lines
        #[arg(long)]
        events: Option<PathBuf>,
    },
    /// Print the freshness schedule for a color list (JSON array)
    Schedule {
        colors: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    match cli.command {
        Command::Replay {
            script,
            config,
            events,
        } => {
            let config = LivenessConfig::load(config.as_deref())?;
            let script = replay::load_script(&script)?;
            let transport = Arc::new(match events {
                Some(path) => RecordingTransport::with_event_log(&path)?,
                None => RecordingTransport::new(),
            });
            let summary = replay::run(script, &config, transport).await?;
            println!("{}", serde_json::to_string_pretty(&summary)?);
        }
        Command::Schedule { colors } => {
            let text = std::fs::read_to_string(&colors)
                .with_context(|| format!("failed to read {}", colors.display()))?;
            let colors: Vec<ColorSpec> =
                serde_json::from_str(&text).context("expected a JSON array of colors")?;
            let schedule = build_schedule(&colors);
            println!("{}", serde_json::to_string_pretty(&schedule)?);
        }
    }
    Ok(())
}
