//! xdb-transfer CLI - export tables to portable batch files and import them anywhere.

use clap::{Parser, Subcommand};
use serde_json::json;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn, Level};
use tracing_subscriber::fmt::format::FmtSpan;
use xdb_transfer::error::exit_codes;
use xdb_transfer::manifest::{ExportLayout, ExportManifest};
use xdb_transfer::{
    resolve, tracing_sink, validate_export, validate_file, Config, EndpointConfig, Exporter,
    Importer, MigrateError, Provider, RunStatus,
};

#[cfg(unix)]
use tokio::signal::unix::{signal, SignalKind};

#[derive(Parser)]
#[command(name = "xdb-transfer")]
#[command(about = "Cross-database export and import through portable batch files")]
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

    /// Seconds to wait for a graceful stop after a signal before exiting
    #[arg(long, default_value = "60")]
    shutdown_timeout: u64,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Export tables from the source database into an export directory
    Export {
        /// Override output directory
        #[arg(long)]
        output_dir: Option<PathBuf>,

        /// Comma-separated tables to export (schema.table or table)
        #[arg(long, value_delimiter = ',')]
        tables: Option<Vec<String>>,

        /// Override rows per batch file
        #[arg(long)]
        batch_size: Option<usize>,
    },

    /// Import an export directory into the target database
    Import {
        /// Override input directory
        #[arg(long)]
        input_dir: Option<PathBuf>,

        /// Comma-separated subset of exported tables to import
        #[arg(long, value_delimiter = ',')]
        tables: Option<Vec<String>>,

        /// Override rows per insert transaction
        #[arg(long)]
        batch_size: Option<usize>,

        /// Load every table into this schema
        #[arg(long)]
        target_schema: Option<String>,

        /// Keep going after a table fails
        #[arg(long)]
        continue_on_error: bool,

        /// Do not create tables and indexes
        #[arg(long)]
        no_create_schema: bool,
    },

    /// Inspect one batch file and explain any decode failure
    Diagnose {
        /// Path to a .bin file
        file: PathBuf,
    },

    /// Check an export directory against its manifest
    ValidateExport {
        /// Export directory
        dir: PathBuf,
    },

    /// Print the import order of an export directory
    Order {
        /// Export directory
        dir: PathBuf,
    },

    /// Test database connections
    HealthCheck,
}

#[tokio::main]
async fn main() -> ExitCode {
    match run().await {
        Ok(code) => ExitCode::from(code),
        Err(e) => {
            eprintln!("{}", e.format_detailed());
            ExitCode::from(e.exit_code())
        }
    }
}

async fn run() -> Result<u8, MigrateError> {
    let cli = Cli::parse();

    setup_logging(&cli.verbosity, &cli.log_format);

    // Offline commands never read the configuration file
    match &cli.command {
        Commands::Diagnose { file } => return diagnose(file, cli.output_json),
        Commands::ValidateExport { dir } => return check_export(dir, cli.output_json),
        Commands::Order { dir } => return print_order(dir, cli.output_json),
        _ => {}
    }

    let mut config = Config::load(&cli.config)?;
    info!("Loaded configuration from {:?} ({})", cli.config, &config.hash()[..12]);

    let cancel_token = setup_signal_handler(cli.shutdown_timeout);

    match cli.command {
        Commands::Export {
            output_dir,
            tables,
            batch_size,
        } => {
            if let Some(dir) = output_dir {
                config.export.output_dir = dir;
            }
            if let Some(t) = tables {
                config.export.tables = t;
            }
            if batch_size.is_some() {
                config.export.batch_size = batch_size;
            }
            config.validate()?;

            let provider = connect(config.require_source()?).await?;
            let result = Exporter::new(provider.clone(), config.export_options())
                .with_cancellation(cancel_token)
                .run()
                .await;
            provider.close().await;
            let result = result?;

            if cli.output_json {
                println!("{}", result.to_json()?);
            } else {
                println!("\nExport {}", result.status.label());
                println!("  Duration: {:.2}s", result.duration_seconds);
                println!("  Tables: {}", result.tables.len());
                println!("  Rows: {}", result.total_rows);
                if let Some(path) = &result.manifest_path {
                    println!("  Manifest: {}", path.display());
                }
                print_failures(&result.tables);
            }
            Ok(status_exit_code(&result.status))
        }

        Commands::Import {
            input_dir,
            tables,
            batch_size,
            target_schema,
            continue_on_error,
            no_create_schema,
        } => {
            if let Some(dir) = input_dir {
                config.import.input_dir = dir;
            }
            if let Some(t) = tables {
                config.import.tables = t;
            }
            if batch_size.is_some() {
                config.import.batch_size = batch_size;
            }
            if target_schema.is_some() {
                config.import.target_schema = target_schema;
            }
            if continue_on_error {
                config.import.continue_on_error = true;
            }
            if no_create_schema {
                config.import.create_schema = false;
            }
            config.validate()?;

            let provider = connect(config.require_target()?).await?;
            let result = Importer::new(provider.clone(), config.import_options())
                .with_cancellation(cancel_token)
                .run()
                .await;
            provider.close().await;
            let result = result?;

            if cli.output_json {
                println!("{}", result.to_json()?);
            } else {
                println!("\nImport {}", result.status.label());
                println!("  Duration: {:.2}s", result.duration_seconds);
                println!("  Tables: {}", result.tables.len());
                println!("  Rows: {}", result.total_rows);
                print_failures(&result.tables);
                for u in &result.unapplied_constraints {
                    println!("  Unapplied: {} on {} -> {} ({})", u.constraint, u.table, u.references, u.reason);
                }
            }
            Ok(status_exit_code(&result.status))
        }

        Commands::HealthCheck => health_check(&config, cli.output_json).await,

        Commands::Diagnose { .. } | Commands::ValidateExport { .. } | Commands::Order { .. } => {
            Ok(0)
        }
    }
}

async fn connect(endpoint: &EndpointConfig) -> Result<Arc<dyn Provider>, MigrateError> {
    let settings = endpoint.settings(tracing_sink());
    let provider = endpoint
        .kind()?
        .connect(&endpoint.connection_string, &settings)
        .await?;
    info!("Connected to {}", provider.name());
    Ok(provider)
}

fn status_exit_code(status: &RunStatus) -> u8 {
    match status {
        RunStatus::Succeeded | RunStatus::SucceededWithDeferredConstraints => 0,
        RunStatus::PartiallyFailed { .. } | RunStatus::Aborted { .. } => exit_codes::TRANSFER,
        RunStatus::Cancelled => exit_codes::CANCELLED,
    }
}

fn print_failures(tables: &[xdb_transfer::TableOutcome]) {
    for t in tables.iter().filter(|t| t.error.is_some()) {
        println!("  Failed: {}: {}", t.table, t.error.as_deref().unwrap_or_default());
    }
}

fn diagnose(file: &Path, output_json: bool) -> Result<u8, MigrateError> {
    let result = validate_file(file)?;
    if output_json {
        println!("{}", serde_json::to_string_pretty(&result)?);
    } else {
        print!("{}", result.render());
    }
    Ok(if result.deserialized { 0 } else { exit_codes::DATA })
}

fn check_export(dir: &Path, output_json: bool) -> Result<u8, MigrateError> {
    let report = validate_export(dir)?;
    if output_json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        println!("Export directory: {}", dir.display());
        println!("  Tables: {}", report.tables);
        println!("  Files checked: {}", report.files_checked);
        println!("  Rows: {}", report.rows);
        if report.is_valid() {
            println!("  Status: OK");
        } else {
            println!("  Status: {} issue(s)", report.issues.len());
            for issue in &report.issues {
                println!("    {}", issue);
            }
        }
    }
    Ok(if report.is_valid() { 0 } else { exit_codes::VALIDATION })
}

fn print_order(dir: &Path, output_json: bool) -> Result<u8, MigrateError> {
    let manifest = ExportManifest::load(&ExportLayout::new(dir).manifest_path())?;
    let resolved = resolve(&manifest.table_definitions());
    if output_json {
        println!("{}", serde_json::to_string_pretty(&resolved)?);
        return Ok(0);
    }
    for (i, table) in resolved.order.iter().enumerate() {
        println!("{:>4}. {}", i + 1, table);
    }
    for d in &resolved.deferred {
        println!(
            "  deferred: {} on {} -> {} ({:?})",
            d.foreign_key.name,
            d.table,
            d.foreign_key.ref_full_name(),
            d.reason
        );
    }
    Ok(0)
}

async fn health_check(config: &Config, output_json: bool) -> Result<u8, MigrateError> {
    let mut checks = Vec::new();
    for (role, endpoint) in [("source", &config.source), ("target", &config.target)] {
        let Some(endpoint) = endpoint else {
            continue;
        };
        let start = Instant::now();
        let outcome = match connect(endpoint).await {
            Ok(provider) => {
                let pinged = provider.ping().await;
                provider.close().await;
                pinged
            }
            Err(e) => Err(e),
        };
        checks.push(json!({
            "role": role,
            "provider": endpoint.provider,
            "connected": outcome.is_ok(),
            "latency_ms": start.elapsed().as_millis() as u64,
            "error": outcome.err().map(|e| e.to_string()),
        }));
    }
    let healthy = checks.iter().all(|c| c["connected"] == json!(true));

    if output_json {
        println!(
            "{}",
            serde_json::to_string_pretty(&json!({ "healthy": healthy, "checks": checks }))?
        );
    } else {
        println!("Health Check Results:");
        for c in &checks {
            println!(
                "  {} ({}): {} ({}ms)",
                c["role"].as_str().unwrap_or_default(),
                c["provider"].as_str().unwrap_or_default(),
                if c["connected"] == json!(true) { "OK" } else { "FAILED" },
                c["latency_ms"]
            );
            if let Some(err) = c["error"].as_str() {
                println!("    Error: {}", err);
            }
        }
        println!("\n  Overall: {}", if healthy { "HEALTHY" } else { "UNHEALTHY" });
    }

    if !healthy {
        return Err(MigrateError::connection("health-check", "one or more endpoints are unreachable"));
    }
    Ok(0)
}

fn setup_logging(verbosity: &str, format: &str) {
    let level = match verbosity.to_lowercase().as_str() {
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    // Logs go to stderr so --output-json stays parseable
    let subscriber = tracing_subscriber::fmt()
        .with_max_level(level)
        .with_span_events(FmtSpan::CLOSE)
        .with_target(false)
        .with_writer(std::io::stderr);

    if format == "json" {
        subscriber.json().init();
    } else {
        subscriber.init();
    }
}

/// Cancel the returned token on SIGINT or SIGTERM.
///
/// If the run has not stopped `shutdown_timeout` seconds later the process
/// exits with the cancellation code.
#[cfg(unix)]
fn setup_signal_handler(shutdown_timeout: u64) -> CancellationToken {
    let cancel_token = CancellationToken::new();

    for (kind, label) in [
        (SignalKind::interrupt(), "SIGINT"),
        (SignalKind::terminate(), "SIGTERM"),
    ] {
        let token = cancel_token.clone();
        tokio::spawn(async move {
            let mut stream = match signal(kind) {
                Ok(s) => s,
                Err(e) => {
                    warn!("Cannot install {} handler: {}", label, e);
                    return;
                }
            };
            stream.recv().await;
            eprintln!(
                "\nReceived {}. Shutting down gracefully (timeout: {}s)...",
                label, shutdown_timeout
            );
            token.cancel();
            force_exit_after(shutdown_timeout).await;
        });
    }

    cancel_token
}

/// Windows only gets Ctrl-C.
#[cfg(not(unix))]
fn setup_signal_handler(shutdown_timeout: u64) -> CancellationToken {
    let cancel_token = CancellationToken::new();
    let token = cancel_token.clone();

    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Cannot install Ctrl-C handler: {}", e);
            return;
        }
        eprintln!("\nReceived Ctrl-C. Shutting down gracefully...");
        token.cancel();
        force_exit_after(shutdown_timeout).await;
    });

    cancel_token
}

async fn force_exit_after(seconds: u64) {
    tokio::time::sleep(Duration::from_secs(seconds)).await;
    eprintln!("Shutdown timeout of {}s exceeded, exiting", seconds);
    std::process::exit(i32::from(exit_codes::CANCELLED));
}
