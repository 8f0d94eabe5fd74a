//! Core data types for the ingestion pipeline
//! Pure data structures with no behavior

use crate::{object_key_for_url, KeyError};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Content type of a source, known statically from the manifest
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    Csv,
    Zip,
}

impl std::fmt::Display for SourceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SourceKind::Csv => write!(f, "csv"),
            SourceKind::Zip => write!(f, "zip"),
        }
    }
}

/// A URL plus its expected content type
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct SourceDescriptor {
    pub kind: SourceKind,
    pub url: String,
    /// Explicit object key; derived from the URL when absent
    #[serde(default)]
    pub key: Option<String>,
}

impl SourceDescriptor {
    pub fn new(kind: SourceKind, url: impl Into<String>) -> Self {
        SourceDescriptor {
            kind,
            url: url.into(),
            key: None,
        }
    }

    pub fn with_key(mut self, key: impl Into<String>) -> Self {
        self.key = Some(key.into());
        self
    }

    /// Destination object key for this source
    pub fn object_key(&self) -> Result<String, KeyError> {
        match &self.key {
            Some(key) if !key.trim().is_empty() => Ok(key.trim().to_string()),
            _ => object_key_for_url(&self.url),
        }
    }
}

/// Payload handed to the publisher - tagged union
#[derive(Debug, Clone)]
pub enum RawData {
    File(PathBuf),
    Bytes(Bytes),
}

impl RawData {
    /// Payload size in bytes
    pub fn len(&self) -> std::io::Result<u64> {
        match self {
            RawData::File(path) => Ok(std::fs::metadata(path)?.len()),
            RawData::Bytes(bytes) => Ok(bytes.len() as u64),
        }
    }

    pub fn is_empty(&self) -> std::io::Result<bool> {
        Ok(self.len()? == 0)
    }
}

/// Outcome of a single source
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum SourceStatus {
    /// Object written to the bucket
    Published { bytes: u64 },
    /// Upload failed; the object was not written
    Skipped { reason: String },
    /// Fetch or extraction failed
    Failed { reason: String },
}

impl SourceStatus {
    pub fn is_published(&self) -> bool {
        matches!(self, SourceStatus::Published { .. })
    }
}

/// Per-source record collected into the run summary
#[derive(Debug, Clone, Serialize)]
pub struct SourceReport {
    pub url: String,
    pub kind: SourceKind,
    pub key: Option<String>,
    #[serde(flatten)]
    pub status: SourceStatus,
    pub duration_ms: u64,
}

/// Run-level summary of every processed source
#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub bucket: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub reports: Vec<SourceReport>,
    /// Set when a failure stopped the run before every source was processed
    pub aborted: Option<String>,
}

impl RunSummary {
    pub fn published(&self) -> usize {
        self.count(SourceStatus::is_published)
    }

    pub fn skipped(&self) -> usize {
        self.count(|s| matches!(s, SourceStatus::Skipped { .. }))
    }

    pub fn failed(&self) -> usize {
        self.count(|s| matches!(s, SourceStatus::Failed { .. }))
    }

    /// True when the run completed and no source failed
    pub fn is_success(&self) -> bool {
        self.aborted.is_none() && self.failed() == 0
    }

    fn count(&self, pred: impl Fn(&SourceStatus) -> bool) -> usize {
        self.reports.iter().filter(|r| pred(&r.status)).count()
    }
}

impl std::fmt::Display for RunSummary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "published: {}, skipped: {}, failed: {}",
            self.published(),
            self.skipped(),
            self.failed()
        )
    }
}
