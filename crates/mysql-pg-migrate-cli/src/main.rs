//! mysql-pg-migrate CLI - resumable MySQL to PostgreSQL migration.

use clap::{Parser, Subcommand};
use mysql_pg_migrate::{Config, MigrateError, MigrationReport, Orchestrator};
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[cfg(unix)]
use tokio::signal::unix::{signal, SignalKind};

#[derive(Parser)]
#[command(name = "mysql-pg-migrate")]
#[command(about = "Resumable, chunked MySQL to PostgreSQL migration")]
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

    /// Timeout in seconds for graceful shutdown (default: 60)
    #[arg(long, default_value = "60")]
    shutdown_timeout: u64,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the migration, resuming from persisted state when present
    Run {
        /// Override target schema
        #[arg(long)]
        target_schema: Option<String>,

        /// Override number of workers
        #[arg(long)]
        workers: Option<usize>,
    },

    /// Show phase flags and chunk pool progress
    Status,

    /// Clear phase flags and the chunk pool so the next run starts over
    Reset,

    /// Validate row counts between source and target
    Validate,

    /// Test database connections
    HealthCheck,
}

#[tokio::main]
async fn main() -> ExitCode {
    match run().await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("{}", e.format_detailed());
            ExitCode::from(e.exit_code())
        }
    }
}

async fn run() -> Result<ExitCode, MigrateError> {
    let cli = Cli::parse();

    setup_logging(&cli.verbosity, &cli.log_format).map_err(MigrateError::Config)?;

    let mut config = Config::load(&cli.config)?;
    info!("Loaded configuration from {:?}", cli.config);

    match cli.command {
        Commands::Run {
            target_schema,
            workers,
        } => {
            // Overrides first, so auto-tuned connection counts follow them
            if let Some(schema) = target_schema {
                config.target.schema = schema;
            }
            if let Some(w) = workers {
                config.migration.workers = Some(w);
            }
            config.validate()?;
            let config = config.with_auto_tuning();

            // Setup signal handling for graceful shutdown (SIGINT and SIGTERM)
            let cancel_token = setup_signal_handler(cli.shutdown_timeout).await?;

            let orchestrator = Orchestrator::new(config).await?;
            let migration = orchestrator.run(&cancel_token);
            tokio::pin!(migration);

            let report = tokio::select! {
                result = &mut migration => result?,
                _ = shutdown_deadline(&cancel_token, cli.shutdown_timeout) => {
                    eprintln!("Shutdown timeout reached, abandoning in-flight work");
                    return Err(MigrateError::Cancelled);
                }
            };
            orchestrator.close().await;

            if cli.output_json {
                println!("{}", report.to_json()?);
            } else {
                print_report(&report);
            }
            Ok(ExitCode::from(report.status.exit_code()))
        }

        Commands::Status => {
            let orchestrator = Orchestrator::new(config.with_auto_tuning()).await?;
            let status = orchestrator.status().await?;

            if cli.output_json {
                println!("{}", serde_json_pretty(&status)?);
            } else {
                println!("Phases:");
                println!("  structure loaded:    {}", status.phases.structure_loaded);
                println!("  data loaded:         {}", status.phases.data_loaded);
                println!("  binary decoded:      {}", status.phases.binary_decoded);
                println!("  constraints applied: {}", status.phases.constraints_applied);
                println!("Chunks:");
                println!("  total:       {}", status.pool.total());
                println!("  pending:     {}", status.pool.pending);
                println!("  in progress: {}", status.pool.in_progress);
                println!("  done:        {}", status.pool.done);
                println!("  failed:      {}", status.pool.failed);
                for chunk in &status.failed_chunks {
                    println!(
                        "    {} chunk {} (id {}, {} attempts): {}",
                        chunk.table,
                        chunk.index,
                        chunk.id,
                        chunk.attempts,
                        chunk.last_error.as_deref().unwrap_or("")
                    );
                }
            }
            orchestrator.close().await;
            Ok(ExitCode::SUCCESS)
        }

        Commands::Reset => {
            let orchestrator = Orchestrator::new(config.with_auto_tuning()).await?;
            orchestrator.reset().await?;
            orchestrator.close().await;
            println!("Migration state reset");
            Ok(ExitCode::SUCCESS)
        }

        Commands::Validate => {
            let orchestrator = Orchestrator::new(config.with_auto_tuning()).await?;
            let results = orchestrator.validate().await?;
            orchestrator.close().await;

            let mismatches = results.iter().filter(|r| !r.matches).count();
            if cli.output_json {
                println!("{}", serde_json_pretty(&results)?);
            } else {
                for r in &results {
                    println!(
                        "  {} {}: source={} target={}",
                        if r.matches { "OK  " } else { "DIFF" },
                        r.table,
                        r.source_rows,
                        r.target_rows
                    );
                }
                println!(
                    "\nValidated {} tables, {} mismatched",
                    results.len(),
                    mismatches
                );
            }

            if mismatches > 0 {
                return Ok(ExitCode::from(5));
            }
            Ok(ExitCode::SUCCESS)
        }

        Commands::HealthCheck => {
            let orchestrator = Orchestrator::new(config.with_auto_tuning()).await?;
            let result = orchestrator.health_check().await;
            orchestrator.close().await;

            if cli.output_json {
                println!("{}", serde_json_pretty(&result)?);
            } else {
                println!("Health Check Results:");
                println!(
                    "  Source (MySQL): {} ({}ms)",
                    if result.source_connected { "OK" } else { "FAILED" },
                    result.source_latency_ms
                );
                if let Some(ref err) = result.source_error {
                    println!("    Error: {}", err);
                }
                println!(
                    "  Target (PostgreSQL): {} ({}ms)",
                    if result.target_connected { "OK" } else { "FAILED" },
                    result.target_latency_ms
                );
                if let Some(ref err) = result.target_error {
                    println!("    Error: {}", err);
                }
                println!(
                    "\n  Overall: {}",
                    if result.healthy { "HEALTHY" } else { "UNHEALTHY" }
                );
            }

            if !result.healthy {
                return Err(MigrateError::Config("Health check failed".to_string()));
            }
            Ok(ExitCode::SUCCESS)
        }
    }
}

fn print_report(report: &MigrationReport) {
    println!("\nMigration {}", report.status);
    println!("  Run ID: {}", report.run_id);
    if let Some(ref previous) = report.resumed_from {
        println!("  Resumed from: {}", previous);
    }
    println!("  Duration: {:.2}s", report.duration_seconds);
    println!(
        "  Tables: {} ({} created this run)",
        report.tables_total, report.tables_created
    );
    println!(
        "  Chunks: {}/{} done, {} failed, {} retried",
        report.chunks_done, report.chunks_total, report.chunks_failed, report.chunks_retried
    );
    println!("  Rows: {}", report.rows_transferred);
    println!("  Throughput: {} rows/sec", report.rows_per_second);
    println!(
        "  Constraints: {} applied, {} failed",
        report.constraints_applied, report.constraints_failed
    );

    for f in &report.chunk_failures {
        println!("  Failed chunk: {} #{} (id {}): {}", f.table, f.index, f.chunk_id, f.error);
    }
    for f in &report.constraint_failures {
        println!("  Failed constraint: {} on {}: {}", f.constraint, f.table, f.error);
    }
    for f in &report.failed_views {
        println!("  Failed view: {}: {}", f.view, f.error);
    }
    if !report.deferred_fk_tables.is_empty() {
        println!(
            "  Foreign keys created in the cycle pass: {}",
            report.deferred_fk_tables.join(", ")
        );
    }
}

fn serde_json_pretty<T: serde::Serialize>(value: &T) -> Result<String, MigrateError> {
    Ok(serde_json::to_string_pretty(value)?)
}

fn setup_logging(verbosity: &str, format: &str) -> Result<(), String> {
    let level = match verbosity.to_lowercase().as_str() {
        "debug" => "debug",
        "info" => "info",
        "warn" => "warn",
        "error" => "error",
        other => return Err(format!("unknown verbosity '{}'", other)),
    };

    // RUST_LOG wins over --verbosity when set
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false);

    match format {
        "json" => subscriber.json().init(),
        "text" => subscriber.init(),
        other => return Err(format!("unknown log format '{}'", other)),
    }

    Ok(())
}

/// Resolves once a shutdown was requested and the grace period has passed.
async fn shutdown_deadline(token: &CancellationToken, shutdown_timeout: u64) {
    token.cancelled().await;
    tokio::time::sleep(Duration::from_secs(shutdown_timeout)).await;
}

/// Setup signal handlers for graceful shutdown.
/// Handles both SIGINT (Ctrl-C) and SIGTERM (Kubernetes/Airflow shutdown).
/// Returns a CancellationToken that will be cancelled when a signal is received.
#[cfg(unix)]
async fn setup_signal_handler(shutdown_timeout: u64) -> Result<CancellationToken, MigrateError> {
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
            "\nReceived {}. Finishing in-flight chunks (timeout: {}s)...",
            name, shutdown_timeout
        );
        token.cancel();
    });

    Ok(cancel_token)
}

/// Setup signal handler for Windows (only SIGINT/Ctrl-C)
#[cfg(not(unix))]
async fn setup_signal_handler(shutdown_timeout: u64) -> Result<CancellationToken, MigrateError> {
    let cancel_token = CancellationToken::new();
    let token = cancel_token.clone();

    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!(
                "\nReceived Ctrl-C. Finishing in-flight chunks (timeout: {}s)...",
                shutdown_timeout
            );
            token.cancel();
        }
    });

    Ok(cancel_token)
}
