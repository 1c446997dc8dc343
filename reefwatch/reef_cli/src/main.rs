use std::{path::PathBuf, sync::Arc, time::Duration};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use reef_generator::{
    FileEventPublisher, FileNames, Generator, GeneratorTelemetry, HttpNames, MemoryStore,
    NameProvider, ReefConfig, StaticNames,
};
use tokio::runtime::Runtime;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "reefgen", version, about = "Underwater sensor data generator")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Bootstraps the sensor population and regenerates readings until interrupted.
    Run(RunArgs),
    /// Prints the default configuration as TOML.
    Config,
}

#[derive(Parser, Debug)]
struct RunArgs {
    /// TOML configuration file.
    #[arg(long)]
    config: Option<PathBuf>,
    /// Read species names from a file, one per line.
    #[arg(long, conflicts_with_all = ["catalogue_url", "offline"])]
    names_file: Option<PathBuf>,
    /// Scrape species names from this catalogue page.
    #[arg(long)]
    catalogue_url: Option<String>,
    /// Use the built-in species list instead of the online catalogue.
    #[arg(long, conflicts_with = "catalogue_url")]
    offline: bool,
    /// Load the store from and save it back to this file.
    #[arg(long)]
    snapshot: Option<PathBuf>,
    /// Stop after this many seconds instead of waiting for Ctrl-C.
    #[arg(long)]
    duration_secs: Option<u64>,
    /// Append lifecycle events as JSON lines to this file.
    #[arg(long)]
    event_log: Option<PathBuf>,
    /// Override the worker count.
    #[arg(long)]
    workers: Option<usize>,
    /// Override the random seed.
    #[arg(long)]
    seed: Option<u64>,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("reef_generator=info,reefgen=info")),
        )
        .init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Run(args) => {
            let runtime = Runtime::new().context("starting tokio runtime")?;
            runtime.block_on(run(args))
        }
        Commands::Config => {
            print!("{}", toml::to_string_pretty(&ReefConfig::default())?);
            Ok(())
        }
    }
}

async fn run(args: RunArgs) -> Result<()> {
    let mut config = match &args.config {
        Some(path) => ReefConfig::load(path)?,
        None => ReefConfig::default(),
    };
    if args.workers.is_some() {
        config.runtime.pool_size = args.workers;
    }
    if args.seed.is_some() {
        config.runtime.seed = args.seed;
    }

    let store = Arc::new(match &args.snapshot {
        Some(path) if path.exists() => MemoryStore::load_snapshot(path)
            .with_context(|| format!("loading snapshot {}", path.display()))?,
        _ => MemoryStore::new(),
    });
    let names: Arc<dyn NameProvider> = if let Some(path) = &args.names_file {
        Arc::new(FileNames::new(path))
    } else if args.offline {
        Arc::new(StaticNames::reef_species())
    } else if let Some(url) = &args.catalogue_url {
        Arc::new(HttpNames::new(url.clone()))
    } else {
        Arc::new(HttpNames::default())
    };

    let mut telemetry = GeneratorTelemetry::builder("reef-generator");
    if let Some(path) = &config.runtime.log_path {
        telemetry = telemetry.log_path(path);
    }
    if let Some(path) = &args.event_log {
        telemetry = telemetry.event_publisher(Arc::new(FileEventPublisher::new(path)?));
    }

    let generator = Generator::builder(store.clone(), names)
        .config(config)
        .telemetry(telemetry.build()?)
        .build()?;

    let shutdown = CancellationToken::new();
    let report = generator.start(&shutdown).await?;
    tracing::info!(
        seed = report.seed,
        tracked = report.tracked,
        created = report.groups_created,
        skipped = report.groups_skipped,
        reloaded = report.reloaded,
        workers = report.pool_size,
        "generator running"
    );

    match args.duration_secs {
        Some(secs) => {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                () = tokio::time::sleep(Duration::from_secs(secs)) => {}
            }
        }
        None => {
            tokio::signal::ctrl_c()
                .await
                .context("waiting for ctrl-c")?;
        }
    }

    let summary = generator.shutdown().await;
    if let Some(summary) = &summary {
        println!("{}", serde_json::to_string_pretty(summary)?);
    }
    if let Some(path) = &args.snapshot {
        store
            .save_snapshot(path)
            .with_context(|| format!("saving snapshot {}", path.display()))?;
        tracing::info!(path = %path.display(), "snapshot saved");
    }
    Ok(())
}
