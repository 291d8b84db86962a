//! Connectivity Watch Agent entry point

use clap::{Parser, Subcommand, ValueEnum};
use colored::Colorize;
use connectivity_watch::config::{AgentConfig, DEFAULT_CONFIG_FILE};
use connectivity_watch::engine::ProbeEngine;
use connectivity_watch::runtime::{AgentLoop, ConnectivityAgent, TriggerReader};
use connectivity_watch::telemetry::{build_sinks, AgentMetrics, QueueStorage, TelemetryManager};
use connectivity_watch::{HealthPayload, TargetStatus};
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "connectivity-watch")]
#[command(about = "Connectivity Watch Agent - store network reachability monitoring")]
#[command(version)]
struct Cli {
    /// Configuration file (JSON or YAML)
    #[arg(short, long, global = true, default_value = DEFAULT_CONFIG_FILE, env = "CONNWATCH_CONFIG")]
    config: PathBuf,

    /// Log output format
    #[arg(long, global = true, value_enum, default_value_t = LogFormat::Json)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, ValueEnum)]
enum LogFormat {
    Json,
    Pretty,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the agent loop until interrupted
    Run,

    /// Probe the configured targets once
    Probe {
        /// Print the health payload as JSON
        #[arg(long)]
        json: bool,

        /// Print probe counters in Prometheus text format afterwards
        #[arg(long)]
        metrics: bool,
    },

    /// Replay the durable queue once
    Flush,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_format);

    let config = AgentConfig::load(&cli.config);

    match cli.command {
        Commands::Run => {
            config.ensure_dirs()?;
            let metrics = AgentMetrics::new()?;
            let triggers = TriggerReader::new(config.paths.trigger_dir.clone());
            let agent = ConnectivityAgent::from_config(config, metrics);
            let mut agent_loop = AgentLoop::new(agent, triggers);

            tokio::select! {
                _ = agent_loop.run_forever() => {}
                _ = shutdown_signal() => {
                    tracing::info!("Shutdown signal received, stopping agent");
                }
            }
        }

        Commands::Probe { json, metrics } => {
            let registry = AgentMetrics::new()?;
            let engine = ProbeEngine::new(config.probe_concurrency).with_metrics(registry.clone());
            let statuses = engine.probe_all(&config.targets).await;
            let payload = HealthPayload::new(chrono::Utc::now(), config.store_id.clone(), statuses);

            if json {
                println!("{}", serde_json::to_string_pretty(&payload)?);
            } else {
                for status in &payload.targets {
                    println!("{}", format_status(status));
                }
            }
            if metrics {
                print!("{}", registry.render()?);
            }

            if !payload.all_up() {
                std::process::exit(1);
            }
        }

        Commands::Flush => {
            config.ensure_dirs()?;
            let queue_dir = config.paths.queue_dir();
            let manager = TelemetryManager::new(
                build_sinks(&config.telemetry, &queue_dir),
                QueueStorage::new(queue_dir),
            );
            let delivered = manager.flush().await;
            let remaining = manager.queue().pending_count().await?;
            println!(
                "{}",
                serde_json::json!({ "delivered": delivered, "remaining": remaining })
            );
        }
    }

    Ok(())
}

fn init_tracing(format: LogFormat) {
    let filter = tracing_subscriber::EnvFilter::new(
        std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
    );
    let registry = tracing_subscriber::registry().with(filter);
    match format {
        LogFormat::Json => registry.with(tracing_subscriber::fmt::layer().json()).init(),
        LogFormat::Pretty => registry.with(tracing_subscriber::fmt::layer().pretty()).init(),
    }
}

fn format_status(status: &TargetStatus) -> String {
    let verdict = if status.up {
        "UP".green().bold()
    } else {
        "DOWN".red().bold()
    };
    let latency = status
        .tcp_ms
        .map(|ms| format!(" tcp={:.2}ms", ms))
        .unwrap_or_default();
    let http = status
        .http_ms
        .map(|ms| format!(" http={:.2}ms", ms))
        .unwrap_or_default();
    let note = status
        .note
        .as_deref()
        .map(|n| format!(" ({})", n).dimmed().to_string())
        .unwrap_or_default();
    format!(
        "{} {:<12} {}{}{}{}",
        verdict, status.name, status.code, latency, http, note
    )
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::warn!(error = %e, "Could not listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::warn!(error = %e, "Could not listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
