//! Command-line entry point for romvault.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use figment::Figment;
use figment::providers::{Env, Format, Toml};
use romvault_core::config::{AppConfig, RoutingConfig};
use romvault_core::{Fingerprint, ObjectPath, display_size};
use romvault_ingest::{EntryState, Ingestor, RunReport, UploadEvent, VerifyOutcome};
use serde::Deserialize;
use std::io::Read;
use std::path::{Path, PathBuf};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const ENV_PREFIX: &str = "ROMVAULT_";

#[derive(Parser)]
#[command(name = "romvault")]
#[command(about = "Content-addressed ingestion of uploaded ROM archives")]
#[command(version)]
struct Cli {
    /// Configuration file (TOML). Environment variables prefixed with
    /// ROMVAULT_ override it, using `__` between sections.
    #[arg(long, global = true, env = "ROMVAULT_CONFIG", default_value = "romvault.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Fetch an archive from the source store and ingest it
    Ingest {
        /// Object key in the source store
        key: String,
    },
    /// Ingest a local archive
    IngestFile {
        path: PathBuf,

        /// Hand the file itself to the pipeline, which deletes it afterwards
        #[arg(long)]
        consume: bool,
    },
    /// Print the fingerprint and object path of local files
    Fingerprint {
        #[arg(required = true)]
        files: Vec<PathBuf>,
    },
    /// Check that the target store holds intact copies of local files
    Verify {
        #[arg(required = true)]
        files: Vec<PathBuf>,
    },
    /// Show the size class and queue an upload would be routed to
    Route {
        /// Object name
        name: String,
        /// Object size in bytes
        size: u64,
    },
    /// Check connectivity to the source and target stores
    Health,
}

#[tokio::main]
async fn main() -> Result<()> {
    let Cli { config, command } = Cli::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    match command {
        Commands::Ingest { key } => handle_ingest_command(&config, &key).await,
        Commands::IngestFile { path, consume } => {
            handle_ingest_file_command(&config, &path, consume).await
        }
        Commands::Fingerprint { files } => handle_fingerprint_command(&files),
        Commands::Verify { files } => handle_verify_command(&config, &files).await,
        Commands::Route { name, size } => handle_route_command(&config, name, size),
        Commands::Health => handle_health_command(&config).await,
    }
}

fn figment(config_path: &Path) -> Figment {
    let mut figment = Figment::new();

    if config_path.exists() {
        tracing::debug!(config_path = %config_path.display(), "Loading configuration from file");
        figment = figment.merge(Toml::file(config_path));
    } else {
        tracing::debug!("No config file found at {}", config_path.display());
    }

    figment.merge(Env::prefixed(ENV_PREFIX).split("__"))
}

fn load_config(config_path: &Path) -> Result<AppConfig> {
    let config: AppConfig = figment(config_path).extract().with_context(|| {
        format!(
            "failed to load configuration from {} and {ENV_PREFIX}* environment variables",
            config_path.display()
        )
    })?;
    config
        .validate()
        .map_err(|e| anyhow::anyhow!(e))
        .context("invalid configuration")?;
    Ok(config)
}

/// Routing needs no stores, so it loads on its own with defaults.
fn load_routing(config_path: &Path) -> Result<RoutingConfig> {
    #[derive(Deserialize)]
    struct RoutingOnly {
        #[serde(default)]
        routing: RoutingConfig,
    }

    let RoutingOnly { routing } = figment(config_path)
        .extract()
        .context("failed to load routing configuration")?;
    routing
        .validate()
        .map_err(|e| anyhow::anyhow!(e))
        .context("invalid routing configuration")?;
    Ok(routing)
}

async fn build_ingestor(config_path: &Path) -> Result<Ingestor> {
    let config = load_config(config_path)?;
    tracing::info!(
        source = %config.source.describe(),
        target = %config.target.describe(),
        "Stores configured"
    );
    Ingestor::from_config(&config)
        .await
        .context("failed to initialize ingestion")
}

async fn handle_ingest_command(config_path: &Path, key: &str) -> Result<()> {
    let ingestor = build_ingestor(config_path).await?;
    let report = ingestor
        .ingest(key)
        .await
        .with_context(|| format!("failed to ingest {key}"))?;
    print_report(&report)
}

async fn handle_ingest_file_command(config_path: &Path, path: &Path, consume: bool) -> Result<()> {
    let config = load_config(config_path)?;
    let ingestor = Ingestor::from_config(&config)
        .await
        .context("failed to initialize ingestion")?;

    let report = if consume {
        ingestor.pipeline().run(path).await
    } else {
        // The pipeline deletes what it is given; hand it a copy.
        let temp_dir = config.transfer.temp_dir();
        std::fs::create_dir_all(&temp_dir)
            .with_context(|| format!("failed to create {}", temp_dir.display()))?;
        let copy = tempfile::Builder::new()
            .prefix(".ingest-")
            .suffix(".zip")
            .tempfile_in(&temp_dir)
            .context("failed to create temp file")?
            .into_temp_path();
        std::fs::copy(path, &copy)
            .with_context(|| format!("failed to copy {}", path.display()))?;
        ingestor.pipeline().run(&copy).await
    };

    let report = report.with_context(|| format!("failed to ingest {}", path.display()))?;
    print_report(&report)
}

fn print_report(report: &RunReport) -> Result<()> {
    for entry in &report.entries {
        let label = match entry.state {
            EntryState::Uploaded => "uploaded",
            _ => "skipped",
        };
        println!("{label:<8} {}", entry.object_path);
    }
    for failure in &report.failures {
        eprintln!("failed   {failure}");
    }

    println!(
        "{}: {} uploaded, {} skipped, {} failed, {} directories",
        report.archive,
        report.uploaded(),
        report.skipped(),
        report.failures.len(),
        report.directories
    );

    if !report.is_success() {
        anyhow::bail!("{} entries failed", report.failures.len());
    }
    Ok(())
}

fn handle_fingerprint_command(files: &[PathBuf]) -> Result<()> {
    for path in files {
        let fingerprint = fingerprint_file(path)?;
        let object_path = ObjectPath::new(file_name(path)?, &fingerprint)?;

        println!("{fingerprint}  {object_path}");
    }
    Ok(())
}

async fn handle_verify_command(config_path: &Path, files: &[PathBuf]) -> Result<()> {
    let ingestor = build_ingestor(config_path).await?;
    let mut bad = 0;

    for path in files {
        let expected = fingerprint_file(path)?;
        let (object_path, outcome) = ingestor
            .verify(file_name(path)?, &expected)
            .await
            .with_context(|| format!("failed to verify {}", path.display()))?;

        match outcome {
            VerifyOutcome::Verified => println!("verified {object_path}"),
            VerifyOutcome::Missing => {
                bad += 1;
                println!("missing  {object_path}");
            }
            VerifyOutcome::Mismatch { found } => {
                bad += 1;
                println!(
                    "mismatch {object_path}: size {}, crc32 {}, sha1 {} (stored {found})",
                    field_status(found.size() == expected.size()),
                    field_status(found.crc32() == expected.crc32()),
                    field_status(found.sha1() == expected.sha1()),
                );
            }
        }
    }

    if bad > 0 {
        anyhow::bail!("{bad} of {} files not verified", files.len());
    }
    Ok(())
}

fn field_status(matches: bool) -> &'static str {
    if matches { "ok" } else { "differs" }
}

fn file_name(path: &Path) -> Result<&str> {
    path.file_name()
        .and_then(|n| n.to_str())
        .with_context(|| format!("{} has no usable file name", path.display()))
}

fn fingerprint_file(path: &Path) -> Result<Fingerprint> {
    let mut file = std::fs::File::open(path)
        .with_context(|| format!("failed to open {}", path.display()))?;
    let mut hasher = Fingerprint::hasher();
    let mut buf = vec![0u8; 64 * 1024];

    loop {
        let n = file
            .read(&mut buf)
            .with_context(|| format!("failed to read {}", path.display()))?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }

    Ok(hasher.finalize())
}

fn handle_route_command(config_path: &Path, name: String, size: u64) -> Result<()> {
    let routing = load_routing(config_path)?;
    let event = UploadEvent {
        bucket: String::new(),
        name,
        size,
    };

    if !event.is_archive() {
        println!("{}: not routed (not a zip archive)", event.name);
        return Ok(());
    }

    let class = routing.classify(event.size);
    println!(
        "{} ({}): {class} -> {}",
        event.name,
        display_size(event.size),
        routing.queue(class)
    );
    Ok(())
}

async fn handle_health_command(config_path: &Path) -> Result<()> {
    let config = load_config(config_path)?;
    let mut healthy = true;

    for (role, storage) in [("source", &config.source), ("target", &config.target)] {
        let result = match romvault_storage::from_config(storage).await {
            Ok(store) => store.health_check().await,
            Err(err) => Err(err),
        };
        match result {
            Ok(()) => println!("{role}: ok ({})", storage.describe()),
            Err(err) => {
                healthy = false;
                println!("{role}: error ({}): {err}", storage.describe());
            }
        }
    }

    if !healthy {
        anyhow::bail!("storage health check failed");
    }
    Ok(())
}
