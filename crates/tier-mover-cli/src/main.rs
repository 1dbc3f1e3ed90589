//! tier-mover CLI - Tier1 to Tier2 change capture and retention.

use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;
use tier_mover::{Config, Orchestrator, RunSummary, TaskSet, TierError, MOVER_TASK, RECEIVER_TASK};
use tokio_util::sync::CancellationToken;
use tracing::{info, Level};
use tracing_subscriber::fmt::format::FmtSpan;

#[cfg(unix)]
use tokio::signal::unix::{signal, SignalKind};

#[derive(Parser)]
#[command(name = "tier-mover")]
#[command(about = "Resumable Tier1 to Tier2 data mover with retention purging")]
#[command(version)]
struct Cli {
    /// Path to YAML configuration file
    #[arg(short, long, default_value = "config.yaml")]
    config: PathBuf,

    /// Output JSON result to stdout
    #[arg(long)]
    output_json: bool,

    /// Log format: text or json
    #[arg(long, default_value = "text")]
    log_format: String,

    /// Log verbosity: debug, info, warn, error
    #[arg(long, default_value = "info")]
    verbosity: String,

    /// Seconds to wait for a graceful shutdown before exiting anyway
    #[arg(long, default_value = "60")]
    shutdown_timeout: u64,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Harvest Tier1 changes and publish them (also runs the purge scheduler)
    Mover,

    /// Consume published changes into Tier2
    Receiver,

    /// Run mover and receiver in one process
    Run,

    /// Run one purge cycle now
    Purge,

    /// Print a task's restart marker
    ShowMarker {
        /// Which task's marker to read
        #[arg(long, value_enum, default_value = "mover")]
        task: Task,
    },

    /// Test database connections
    HealthCheck,
}

#[derive(Clone, Copy, ValueEnum)]
enum Task {
    Mover,
    Receiver,
}

impl Task {
    fn key(self) -> &'static str {
        match self {
            Task::Mover => MOVER_TASK,
            Task::Receiver => RECEIVER_TASK,
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    match run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("{}", e.format_detailed());
            ExitCode::from(e.exit_code())
        }
    }
}

async fn run() -> Result<(), TierError> {
    let cli = Cli::parse();

    setup_logging(&cli.verbosity, &cli.log_format).map_err(TierError::Config)?;

    let config = Config::load(&cli.config)?;
    info!("Loaded configuration from {:?}", cli.config);

    match cli.command {
        Commands::Mover => run_tasks(config, TaskSet::Mover, &cli).await?,
        Commands::Receiver => run_tasks(config, TaskSet::Receiver, &cli).await?,
        Commands::Run => run_tasks(config, TaskSet::Both, &cli).await?,

        Commands::Purge => {
            let orchestrator = Orchestrator::new(config).await?;
            let report = orchestrator.purge_once().await?;

            if cli.output_json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else if report.skipped {
                println!("Purge skipped: watermark {} did not advance", report.watermark);
            } else {
                println!("Purge through {}:", report.watermark);
                for (table, rows) in &report.purged {
                    println!("  {}: {} rows", table, rows);
                }
                for table in &report.failed {
                    println!("  {}: FAILED", table);
                }
                println!("  Total: {} rows", report.total_rows());
            }
        }

        Commands::ShowMarker { task } => {
            let marker = Orchestrator::show_marker(&config, task.key()).await?;

            if cli.output_json {
                let value = serde_json::json!({
                    "task": task.key(),
                    "cold_start": marker.is_cold(),
                    "last_window_end": marker.last_window_end.to_rfc3339(),
                    "last_interval_id": marker.last_interval_id,
                    "last_message_id": marker.last_message_id,
                    "last_table_name": marker.last_table_name,
                    "marker": marker.to_string(),
                });
                println!("{}", serde_json::to_string_pretty(&value)?);
            } else {
                println!("{}: {}", task.key(), marker);
                if marker.is_cold() {
                    println!("  (no progress recorded; next start is a cold start)");
                }
            }
        }

        Commands::HealthCheck => {
            let result = Orchestrator::health_check(&config).await;

            if cli.output_json {
                println!("{}", serde_json::to_string_pretty(&result)?);
            } else {
                println!("Health Check Results:");
                println!(
                    "  Tier1 ({}): {} ({}ms)",
                    config.tier1.location(),
                    if result.tier1_connected { "OK" } else { "FAILED" },
                    result.tier1_latency_ms
                );
                if let Some(ref err) = result.tier1_error {
                    println!("    Error: {}", err);
                }
                println!(
                    "  Tier2 ({}): {} ({}ms)",
                    config.tier2.location(),
                    if result.tier2_connected { "OK" } else { "FAILED" },
                    result.tier2_latency_ms
                );
                if let Some(ref err) = result.tier2_error {
                    println!("    Error: {}", err);
                }
                println!(
                    "\n  Overall: {}",
                    if result.healthy { "HEALTHY" } else { "UNHEALTHY" }
                );
            }

            if !result.healthy {
                return Err(TierError::pool("Health check failed", "connecting tiers"));
            }
        }
    }

    Ok(())
}

async fn run_tasks(config: Config, tasks: TaskSet, cli: &Cli) -> Result<(), TierError> {
    let cancel_token = setup_signal_handler(cli.shutdown_timeout).await?;
    let orchestrator = Orchestrator::new(config).await?;
    let summary = orchestrator.run(tasks, cancel_token).await?;
    print_summary(&summary, cli.output_json)
}

fn print_summary(summary: &RunSummary, json: bool) -> Result<(), TierError> {
    if json {
        println!("{}", serde_json::to_string_pretty(summary)?);
        return Ok(());
    }

    println!("\nRun stopped.");
    println!("  Run ID: {}", summary.run_id);
    println!("  Duration: {:.2}s", summary.duration_seconds);
    if let Some(ref marker) = summary.mover_marker {
        println!("  Mover: {}", marker);
    }
    if let Some(stats) = summary.receiver {
        println!(
            "  Receiver: {} messages ({} rows) committed, {} skipped, {} requeued, {} gaps, {} duplicates",
            stats.committed, stats.rows, stats.skipped, stats.requeued, stats.gaps, stats.duplicates
        );
    }
    Ok(())
}

fn setup_logging(verbosity: &str, format: &str) -> Result<(), String> {
    let level = match verbosity.to_lowercase().as_str() {
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        other => return Err(format!("unknown verbosity '{}'", other)),
    };

    let subscriber = tracing_subscriber::fmt()
        .with_max_level(level)
        .with_span_events(FmtSpan::CLOSE)
        .with_target(false)
        .with_writer(std::io::stderr);

    match format {
        "json" => subscriber.json().init(),
        "text" => subscriber.init(),
        other => return Err(format!("unknown log format '{}'", other)),
    }

    Ok(())
}

/// Exit if a graceful shutdown takes longer than `timeout_secs`.
fn arm_shutdown_deadline(timeout_secs: u64) {
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_secs(timeout_secs)).await;
        eprintln!("Shutdown did not finish within {}s, exiting", timeout_secs);
        std::process::exit(130);
    });
}

/// Setup signal handlers for graceful shutdown.
/// Handles both SIGINT (Ctrl-C) and SIGTERM.
/// Returns a CancellationToken that will be cancelled when a signal is received.
#[cfg(unix)]
async fn setup_signal_handler(shutdown_timeout: u64) -> Result<CancellationToken, TierError> {
    let cancel_token = CancellationToken::new();
    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sigterm = signal(SignalKind::terminate())?;

    let token = cancel_token.clone();
    tokio::spawn(async move {
        let name = tokio::select! {
            _ = sigint.recv() => "SIGINT",
            _ = sigterm.recv() => "SIGTERM",
        };
        eprintln!(
            "\nReceived {}. Draining and shutting down (timeout: {}s)...",
            name, shutdown_timeout
        );
        token.cancel();
        arm_shutdown_deadline(shutdown_timeout);
    });

    Ok(cancel_token)
}

/// Setup signal handler for Windows (only Ctrl-C)
#[cfg(not(unix))]
async fn setup_signal_handler(shutdown_timeout: u64) -> Result<CancellationToken, TierError> {
    let cancel_token = CancellationToken::new();
    let token = cancel_token.clone();

    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("\nReceived Ctrl-C. Draining and shutting down...");
            token.cancel();
            arm_shutdown_deadline(shutdown_timeout);
        }
    });

    Ok(cancel_token)
}
