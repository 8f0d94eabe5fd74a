//! Data ingestion orchestrator - fetches Tesouro Transparente datasets into the data lake bucket

use anyhow::{anyhow, bail, Context, Result};
use std::env;
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tesouro_ingest::ingestion::extract::MemberSelector;
use tesouro_ingest::ingestion::fetch::{FetchOptions, Fetcher};
use tesouro_ingest::ingestion::manifest;
use tesouro_ingest::ingestion::pipeline::{FailurePolicy, Pipeline, PipelineOptions};
use tesouro_ingest::ingestion::publish::{MemoryStore, ObjectStore, S3Config, S3Store};
use tesouro_ingest::ingestion::retry::WaitOptions;
use tesouro_ingest::ingestion::{RunSummary, SourceDescriptor, SourceKind};
use tracing::{info, warn};
use tracing_subscriber::prelude::*;
use tracing_subscriber::{fmt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration from environment (.env is optional)
    dotenvy::dotenv().ok();
    let config = Config::from_env()?;

    init_tracing(&config.log_file)?;
    info!("Starting data ingestion pipeline");
    info!("Configuration loaded");

    // Determine which sources to run (from command line args or run all)
    let selected: Vec<String> = env::args().skip(1).collect();
    let sources = manifest::filter_sources(load_sources(&config)?, &selected);
    if sources.is_empty() {
        bail!("No sources match {:?}", selected);
    }

    let fetcher = Fetcher::new(FetchOptions {
        timeout: config.http_timeout,
        retry: WaitOptions::default()
            .retry_interval(config.retry_interval)
            .allowed_errors(config.fetch_retries),
    })?;

    let store: Arc<dyn ObjectStore> = if config.dry_run {
        warn!("DRY_RUN set, objects are kept in memory and never uploaded");
        Arc::new(MemoryStore::new())
    } else {
        Arc::new(
            S3Store::new(S3Config {
                endpoint_url: config.s3_endpoint_url.clone(),
                force_path_style: config.s3_force_path_style,
            })
            .await,
        )
    };

    let pipeline = Pipeline::new(fetcher, store, config.pipeline_options());
    let summary = pipeline.run(&sources).await;

    if let Some(path) = &config.summary_file {
        write_summary(path, &summary)?;
    }

    exit_status(&summary)?;
    info!("Data ingestion pipeline complete: {}", summary);

    Ok(())
}

/// Fail the process when the run aborted or any source failed; skipped uploads alone do not
fn exit_status(summary: &RunSummary) -> Result<()> {
    if let Some(reason) = &summary.aborted {
        bail!("Ingestion aborted: {}", reason);
    }

    if !summary.is_success() {
        bail!("Ingestion finished with failed sources ({})", summary);
    }

    Ok(())
}

/// Log to stdout and append to the log file
fn init_tracing(log_file: &Path) -> Result<()> {
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(log_file)
        .with_context(|| format!("Failed to open log file {:?}", log_file))?;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(
            fmt::layer()
                .with_target(false)
                .with_thread_ids(false)
                .with_level(true),
        )
        .with(fmt::layer().with_ansi(false).with_writer(Arc::new(file)))
        .try_init()
        .context("Failed to initialize logging")?;

    Ok(())
}

/// Manifest sources, or the built-in list when no manifest is configured
fn load_sources(config: &Config) -> Result<Vec<SourceDescriptor>> {
    let mut sources = match &config.manifest {
        Some(path) => manifest::load_manifest(path)?,
        None => manifest::default_sources(),
    };

    // S3_OBJECT_NAME names the single CSV source
    if let Some(object_name) = &config.object_name {
        let mut csv_sources = sources
            .iter_mut()
            .filter(|s| s.kind == SourceKind::Csv && s.key.is_none());

        match (csv_sources.next(), csv_sources.next()) {
            (Some(source), None) => {
                info!("Publishing {} as {}", source.url, object_name);
                source.key = Some(object_name.clone());
            }
            _ => warn!("S3_OBJECT_NAME ignored: it applies only when exactly one CSV source has no key"),
        }
    }

    Ok(sources)
}

fn write_summary(path: &Path, summary: &RunSummary) -> Result<()> {
    let json = serde_json::to_string_pretty(summary).context("Failed to serialize run summary")?;
    std::fs::write(path, json).with_context(|| format!("Failed to write summary to {:?}", path))?;
    info!("Run summary written to {:?}", path);
    Ok(())
}

/// Configuration loaded from environment variables
#[derive(Debug, Clone)]
struct Config {
    bucket: String,
    object_name: Option<String>,
    manifest: Option<PathBuf>,
    extraction_dir: PathBuf,
    log_file: PathBuf,
    http_timeout: Duration,
    fetch_retries: usize,
    retry_interval: Duration,
    selector: MemberSelector,
    on_source_error: FailurePolicy,
    on_publish_error: FailurePolicy,
    max_concurrency: usize,
    s3_endpoint_url: Option<String>,
    s3_force_path_style: bool,
    dry_run: bool,
    summary_file: Option<PathBuf>,
}

impl Config {
    fn from_env() -> Result<Self> {
        Ok(Config {
            bucket: optional_var("S3_BUCKET_NAME").context("S3_BUCKET_NAME must be set")?,

            object_name: optional_var("S3_OBJECT_NAME"),

            manifest: optional_var("SOURCES_MANIFEST").map(PathBuf::from),

            extraction_dir: optional_var("EXTRACTION_DIR")
                .unwrap_or_else(|| "./extracted_files".to_string())
                .into(),

            log_file: optional_var("LOG_FILE")
                .unwrap_or_else(|| "ingest.log".to_string())
                .into(),

            http_timeout: Duration::from_secs(parse_var("HTTP_TIMEOUT_SECS", 300)?),

            fetch_retries: parse_var("FETCH_RETRIES", 3)?,

            retry_interval: Duration::from_millis(parse_var("RETRY_INTERVAL_MS", 1000)?),

            selector: parse_var("MEMBER_SELECTOR", MemberSelector::First)?,

            on_source_error: parse_var("ON_SOURCE_ERROR", FailurePolicy::Abort)?,

            on_publish_error: parse_var("ON_PUBLISH_ERROR", FailurePolicy::Continue)?,

            max_concurrency: parse_var::<usize>("MAX_CONCURRENCY", 1)?.max(1),

            s3_endpoint_url: optional_var("S3_ENDPOINT_URL"),

            s3_force_path_style: parse_flag("S3_FORCE_PATH_STYLE"),

            dry_run: parse_flag("DRY_RUN"),

            summary_file: optional_var("SUMMARY_FILE").map(PathBuf::from),
        })
    }

    fn pipeline_options(&self) -> PipelineOptions {
        PipelineOptions {
            bucket: self.bucket.clone(),
            extraction_dir: self.extraction_dir.clone(),
            selector: self.selector.clone(),
            on_source_error: self.on_source_error,
            on_publish_error: self.on_publish_error,
            max_concurrency: self.max_concurrency,
        }
    }
}

fn optional_var(name: &str) -> Option<String> {
    env::var(name).ok().filter(|v| !v.trim().is_empty())
}

fn parse_var<T>(name: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match optional_var(name) {
        Some(value) => value
            .trim()
            .parse()
            .map_err(|e| anyhow!("{} must be valid: {}", name, e)),
        None => Ok(default),
    }
}

fn parse_flag(name: &str) -> bool {
    matches!(
        optional_var(name).map(|v| v.trim().to_lowercase()).as_deref(),
        Some("1" | "true" | "yes")
    )
}
