//! Ingestion orchestrator - runs fetch, extract, publish for every source

use crate::ingestion::extract::{
    extract_zip_blocking, select_member, ExtractError, ExtractionRoot, MemberSelector,
};
use crate::ingestion::fetch::{FetchError, Fetcher};
use crate::ingestion::publish::{publish, ObjectStore};
use crate::ingestion::types::{
    RawData, RunSummary, SourceDescriptor, SourceKind, SourceReport, SourceStatus,
};
use chrono::Utc;
use futures::stream::{self, StreamExt};
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{error, info, warn};

/// What a failed source does to the rest of the run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailurePolicy {
    /// Stop processing further sources
    Abort,
    /// Record the failure and move on
    Continue,
}

impl FromStr for FailurePolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "abort" => Ok(FailurePolicy::Abort),
            "continue" => Ok(FailurePolicy::Continue),
            other => Err(format!(
                "unknown failure policy {:?} (expected abort or continue)",
                other
            )),
        }
    }
}

/// Pipeline settings
#[derive(Debug, Clone)]
pub struct PipelineOptions {
    pub bucket: String,
    pub extraction_dir: PathBuf,
    pub selector: MemberSelector,
    /// Fetch and extraction failures
    pub on_source_error: FailurePolicy,
    /// Upload failures, credential problems included
    pub on_publish_error: FailurePolicy,
    /// Sources in flight at once; 1 runs strictly in order
    pub max_concurrency: usize,
}

impl PipelineOptions {
    pub fn new(bucket: impl Into<String>) -> Self {
        PipelineOptions {
            bucket: bucket.into(),
            extraction_dir: PathBuf::from("./extracted_files"),
            selector: MemberSelector::First,
            on_source_error: FailurePolicy::Abort,
            on_publish_error: FailurePolicy::Continue,
            max_concurrency: 1,
        }
    }
}

/// Errors that stop a source before anything is uploaded
#[derive(Debug, Error)]
pub enum IngestError {
    #[error(transparent)]
    Fetch(#[from] FetchError),

    #[error(transparent)]
    Extract(#[from] ExtractError),
}

pub struct Pipeline {
    fetcher: Fetcher,
    store: Arc<dyn ObjectStore>,
    options: PipelineOptions,
}

impl Pipeline {
    pub fn new(fetcher: Fetcher, store: Arc<dyn ObjectStore>, options: PipelineOptions) -> Self {
        Pipeline {
            fetcher,
            store,
            options,
        }
    }

    pub fn options(&self) -> &PipelineOptions {
        &self.options
    }

    /// Ingest every source and collect a per-source report
    /// The extraction directory is removed before returning, aborted runs included
    pub async fn run(&self, sources: &[SourceDescriptor]) -> RunSummary {
        let started_at = Utc::now();
        let mut root = ExtractionRoot::new(&self.options.extraction_dir);
        let mut reports = Vec::with_capacity(sources.len());
        let mut aborted = None;

        info!(
            "Ingesting {} sources into bucket '{}' via {}",
            sources.len(),
            self.options.bucket,
            self.store.name()
        );

        {
            let root = &root;
            let mut outcomes = stream::iter(sources.iter().enumerate())
                .map(|(index, source)| self.process(index, source, root))
                .buffered(self.options.max_concurrency.max(1));

            while let Some(report) = outcomes.next().await {
                match &report.status {
                    SourceStatus::Published { bytes } => {
                        info!("✓ {} published ({} bytes)", report.url, bytes)
                    }
                    SourceStatus::Skipped { reason } => {
                        warn!("✗ {} skipped: {}", report.url, reason)
                    }
                    SourceStatus::Failed { reason } => {
                        error!("✗ {} failed: {}", report.url, reason)
                    }
                }

                let stop = self.abort_reason(&report);
                reports.push(report);

                if let Some(reason) = stop {
                    error!("Aborting run: {}", reason);
                    aborted = Some(reason);
                    break;
                }
            }
        }

        if let Err(e) = root.cleanup() {
            warn!(
                "Failed to remove extraction directory {:?}: {}",
                root.path(),
                e
            );
        }

        let summary = RunSummary {
            bucket: self.options.bucket.clone(),
            started_at,
            finished_at: Utc::now(),
            reports,
            aborted,
        };

        info!("Ingestion run complete: {}", summary);
        summary
    }

    fn abort_reason(&self, report: &SourceReport) -> Option<String> {
        match &report.status {
            SourceStatus::Failed { reason } if self.options.on_source_error == FailurePolicy::Abort => {
                Some(format!("{}: {}", report.url, reason))
            }
            SourceStatus::Skipped { reason }
                if self.options.on_publish_error == FailurePolicy::Abort =>
            {
                Some(format!("{}: {}", report.url, reason))
            }
            _ => None,
        }
    }

    async fn process(
        &self,
        index: usize,
        source: &SourceDescriptor,
        root: &ExtractionRoot,
    ) -> SourceReport {
        let started = Instant::now();

        let (key, status) = match source.object_key() {
            Ok(key) => {
                info!("=== {} ({}) ===", key, source.kind);
                let status = self.ingest(index, source, &key, root).await;
                (Some(key), status)
            }
            Err(e) => (
                None,
                SourceStatus::Failed {
                    reason: e.to_string(),
                },
            ),
        };

        SourceReport {
            url: source.url.clone(),
            kind: source.kind,
            key,
            status,
            duration_ms: elapsed_ms(started.elapsed()),
        }
    }

    async fn ingest(
        &self,
        index: usize,
        source: &SourceDescriptor,
        key: &str,
        root: &ExtractionRoot,
    ) -> SourceStatus {
        let payload = match self.prepare(index, source, key, root).await {
            Ok(payload) => payload,
            Err(e) => {
                return SourceStatus::Failed {
                    reason: e.to_string(),
                }
            }
        };

        info!("[{}] Uploading...", key);
        match publish(self.store.as_ref(), payload, &self.options.bucket, key).await {
            Ok(receipt) => SourceStatus::Published {
                bytes: receipt.bytes,
            },
            Err(e) => SourceStatus::Skipped {
                reason: e.to_string(),
            },
        }
    }

    /// Fetch the source and, for archives, extract and select the member to publish
    async fn prepare(
        &self,
        index: usize,
        source: &SourceDescriptor,
        key: &str,
        root: &ExtractionRoot,
    ) -> Result<RawData, IngestError> {
        info!("[{}] Fetching data...", key);
        let bytes = self.fetcher.fetch(&source.url).await?;

        match source.kind {
            SourceKind::Csv => Ok(RawData::Bytes(bytes)),
            SourceKind::Zip => {
                let target = root.source_dir(index, key);
                info!("[{}] Extracting archive to {:?}", key, target);

                let paths = extract_zip_blocking(bytes, target).await?;
                let member = select_member(&paths, &self.options.selector)?;
                info!("[{}] Selected archive member {:?}", key, member);

                Ok(RawData::File(member))
            }
        }
    }
}

/// Whole milliseconds, saturating at `u64::MAX`
fn elapsed_ms(elapsed: Duration) -> u64 {
    u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX)
}
