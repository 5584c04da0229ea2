#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::missing_errors_doc, clippy::uninlined_format_args)]

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use omnihub::channels::discord_manager::DiscordBotManager;
use omnihub::config::ChannelKind;
use omnihub::gateway::{self, AppState};
use omnihub::router::{MessageRouter, UserStore};
use omnihub::trace::TraceService;
use omnihub::Config;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::{fmt, EnvFilter};

#[derive(Parser, Debug)]
#[command(
    name = "omnihub",
    version,
    about = "Multi-tenant omnichannel message gateway"
)]
struct Cli {
    /// Path to the TOML configuration file.
    #[arg(long, default_value = "omnihub.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the webhook gateway and all configured Discord bots.
    Serve,
    /// Delete traces older than the retention window, then exit.
    CleanupTraces {
        /// Override the configured retention window in days.
        #[arg(long)]
        days: Option<u32>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Respects RUST_LOG, defaults to INFO.
    let subscriber = fmt::Subscriber::builder()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .finish();
    tracing::subscriber::set_global_default(subscriber)
        .context("setting default subscriber failed")?;

    let config = Config::load(&cli.config)?;

    match cli.command {
        Commands::Serve => serve(config).await,
        Commands::CleanupTraces { days } => {
            let traces = TraceService::new(&config.tracing)?;
            let days = days.unwrap_or(config.tracing.retention_days);
            let removed = traces.cleanup_older_than(days);
            println!("removed {removed} traces older than {days} days");
            Ok(())
        }
    }
}

async fn serve(config: Config) -> Result<()> {
    let traces = Arc::new(TraceService::new(&config.tracing)?);
    let users = Arc::new(UserStore::open(&config.tracing.db_path)?);
    let router = Arc::new(MessageRouter::new(users));
    let manager = Arc::new(DiscordBotManager::new(
        router.clone(),
        traces.clone(),
        config.gateway.ipc_dir(),
    ));

    for instance in &config.instances {
        if instance.channel_type == ChannelKind::Discord {
            manager.start_bot(instance.clone()).await;
        }
    }

    // Daily retention sweep, independent of message traffic.
    {
        let traces = traces.clone();
        let retention_days = config.tracing.retention_days;
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(Duration::from_secs(24 * 60 * 60));
            tick.tick().await; // skip the immediate first tick
            loop {
                tick.tick().await;
                traces.cleanup_older_than(retention_days);
            }
        });
    }

    let state = AppState {
        config: Arc::new(config.clone()),
        traces,
        router,
    };

    tokio::select! {
        result = gateway::run_gateway(&config.gateway.host, config.gateway.port, state) => {
            result?;
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("shutdown requested");
        }
    }

    manager.shutdown().await;
    Ok(())
}
