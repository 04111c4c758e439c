use anyhow::Context;
use catalog_metrics::catalog::HttpCatalogSource;
use catalog_metrics::config::StorageConfig;
use catalog_metrics::matomo::MatomoClient;
use catalog_metrics::notify::WebhookNotifier;
use catalog_metrics::queue::{ArchiveStatus, LogQueue};
use catalog_metrics::store::MetricsStore;
use catalog_metrics::{logging, observability, Config, Pipeline};
use chrono::NaiveDate;
use clap::{Parser, Subcommand};
use object_store::aws::AmazonS3Builder;
use object_store::local::LocalFileSystem;
use object_store::ObjectStore;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "catalog-metrics")]
#[command(about = "Visit metrics for catalog objects, computed from access log archives")]
#[command(version)]
struct Cli {
    /// Configuration file
    #[arg(long, env = "CATALOG_METRICS_CONFIG", default_value = "config.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Process every archive waiting in the queue
    Run,
    /// Collect Matomo outlinks for reuses
    Matomo {
        /// Day to collect (YYYY-MM-DD); defaults to yesterday
        #[arg(long)]
        date: Option<NaiveDate>,
    },
    /// Inspect the archive queue
    Queue {
        #[command(subcommand)]
        command: QueueCommands,
    },
    /// Create the metrics tables
    InitDb,
}

#[derive(Subcommand)]
enum QueueCommands {
    /// Count archives per state and list stuck ones
    Status,
}

fn build_object_store(config: &StorageConfig) -> anyhow::Result<Arc<dyn ObjectStore>> {
    match config {
        StorageConfig::Local { root } => {
            std::fs::create_dir_all(root)
                .with_context(|| format!("creating storage root {}", root.display()))?;
            Ok(Arc::new(LocalFileSystem::new_with_prefix(root)?))
        }
        StorageConfig::S3 {
            bucket,
            endpoint,
            region,
        } => {
            let mut builder = AmazonS3Builder::from_env().with_bucket_name(bucket);
            if let Some(endpoint) = endpoint {
                builder = builder.with_endpoint(endpoint).with_allow_http(true);
            }
            if let Some(region) = region {
                builder = builder.with_region(region);
            }
            Ok(Arc::new(builder.build()?))
        }
    }
}

fn build_pipeline(config: Config) -> anyhow::Result<Pipeline> {
    let object_store = build_object_store(&config.storage)?;
    let store = Arc::new(MetricsStore::open(&config.database)?);
    let client = reqwest::Client::new();
    let webhook = config.notify.webhook_url.clone();
    let mut pipeline = Pipeline::new(
        config,
        object_store,
        Arc::new(HttpCatalogSource::new(client.clone())),
        store,
    );
    if let Some(url) = webhook {
        pipeline = pipeline.with_notifier(Arc::new(WebhookNotifier::new(client, url)));
    }
    Ok(pipeline)
}

async fn queue_status(config: &Config) -> anyhow::Result<bool> {
    let queue = LogQueue::new(build_object_store(&config.storage)?);
    let index = queue.snapshot().await?;
    if index.is_empty() {
        println!("Queue is empty");
        return Ok(true);
    }
    for status in ArchiveStatus::ALL {
        println!("{:<10} {}", status.to_string(), index.keys_in(status).len());
    }
    println!("{:<10} {}", "total", index.len());
    let stuck = queue.list_stuck().await?;
    for key in &stuck {
        println!("stuck in ongoing: {}", key);
    }
    for (key, states) in index.conflicts() {
        let states: Vec<String> = states.iter().map(|s| s.to_string()).collect();
        println!("present in several states ({}): {}", states.join(", "), key);
    }
    Ok(index.conflicts().is_empty())
}

async fn execute(cli: Cli) -> anyhow::Result<bool> {
    let config = Config::load(&cli.config)?;
    let _guard = logging::init_logging(&config.log_dir);
    observability::init_metrics();
    info!("Loaded configuration from {}", cli.config.display());

    match cli.command {
        Commands::Run => {
            let pipeline = build_pipeline(config)?;
            let result = pipeline.run().await;
            observability::push_to_pushgateway("catalog-metrics", "run").await;
            let summary = result?;
            println!("{}", serde_json::to_string_pretty(&summary)?);
            if !summary.is_success() {
                warn!("Run finished with failed object types; archives left in ongoing");
            }
            Ok(summary.is_success())
        }
        Commands::Matomo { date } => {
            let matomo = config
                .matomo
                .clone()
                .context("no [matomo] section in the configuration")?;
            let pipeline = build_pipeline(config)?;
            let source = Arc::new(MatomoClient::new(reqwest::Client::new(), &matomo));

            let cancel = CancellationToken::new();
            let on_signal = cancel.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    warn!("Interrupted, cancelling outlink collection");
                    on_signal.cancel();
                }
            });

            let result = pipeline.collect_outlinks(source, date, &cancel).await;
            observability::push_to_pushgateway("catalog-metrics", "matomo").await;
            let report = result?;
            println!("{}", serde_json::to_string_pretty(&report)?);
            Ok(true)
        }
        Commands::Queue {
            command: QueueCommands::Status,
        } => queue_status(&config).await,
        Commands::InitDb => {
            build_pipeline(config)?.init_db().await?;
            println!("Metrics tables ready");
            Ok(true)
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    dotenv::dotenv().ok();
    let cli = Cli::parse();

    match execute(cli).await {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            ExitCode::FAILURE
        }
    }
}
