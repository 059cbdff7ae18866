//! Ripple demo
//!
//! Runs the signal scenarios against an in-memory store and logs what each
//! receiver observes.

mod config;
mod scenarios;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use config::Config;

#[derive(Parser)]
#[command(name = "ripple-demo")]
#[command(about = "Lifecycle signal scenarios")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Clone, Copy)]
enum Commands {
    /// A synchronous receiver that sleeps before returning
    SlowReceiver,
    /// Which thread synchronous and detached receivers run on
    Worker,
    /// A receiver's writes undone by a failing unit of work
    Rollback,
    /// Every scenario in turn
    All,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,ripple=debug,ripple_demo=debug".into()),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(true)
                .with_thread_names(true),
        )
        .init();

    let cli = Cli::parse();
    let config = Config::from_env().context("Failed to load configuration")?;
    tracing::debug!(?config, "configuration loaded");

    let command = cli.command.unwrap_or(Commands::All);

    if matches!(command, Commands::SlowReceiver | Commands::All) {
        tracing::info!("scenario: slow receiver");
        scenarios::slow_receiver(&config).await?;
    }
    if matches!(command, Commands::Worker | Commands::All) {
        tracing::info!("scenario: worker");
        scenarios::worker(&config).await?;
    }
    if matches!(command, Commands::Rollback | Commands::All) {
        tracing::info!("scenario: rollback");
        let exists = scenarios::rollback(&config).await?;
        println!("Profile exists after rollback: {exists}");
    }

    Ok(())
}
