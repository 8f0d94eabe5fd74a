//! Extraction functions - unpack ZIP payloads into a per-run working directory

use crate::ingestion::utils::{file_name_of, sanitize_stem};
use std::fs;
use std::io::{self, Cursor};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum ExtractError {
    #[error("malformed ZIP archive: {0}")]
    Archive(#[from] zip::result::ZipError),

    #[error("I/O error while extracting to {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("archive member {0:?} would be written outside the extraction directory")]
    UnsafePath(String),

    #[error("archive contains no files")]
    EmptyArchive,

    #[error("expected exactly one file in archive, found {count}: {names:?}")]
    AmbiguousArchive { count: usize, names: Vec<String> },

    #[error("no archive member ends with {suffix:?} (members: {names:?})")]
    NoMatchingMember { suffix: String, names: Vec<String> },

    #[error("extraction task failed: {0}")]
    Task(String),
}

fn io_error(path: &Path) -> impl FnOnce(io::Error) -> ExtractError + '_ {
    move |source| ExtractError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// Rule for picking the member to publish from an extracted archive
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum MemberSelector {
    /// First file in archive order
    #[default]
    First,
    /// The archive must hold exactly one file
    ExactlyOne,
    /// First file whose name ends with the given suffix (case-insensitive)
    Named(String),
}

impl FromStr for MemberSelector {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        match s.to_lowercase().as_str() {
            "first" => return Ok(MemberSelector::First),
            "exactly-one" | "exactly_one" | "one" => return Ok(MemberSelector::ExactlyOne),
            _ => {}
        }

        match s.split_once(':') {
            Some((prefix, suffix)) if prefix.eq_ignore_ascii_case("name") && !suffix.is_empty() => {
                Ok(MemberSelector::Named(suffix.to_string()))
            }
            _ => Err(format!(
                "unknown member selector {:?} (expected first, exactly-one or name:<suffix>)",
                s
            )),
        }
    }
}

/// Unpack every member of a ZIP payload into `target_dir`
/// Returns extracted file paths in archive order
pub fn extract_zip(bytes: &[u8], target_dir: &Path) -> Result<Vec<PathBuf>, ExtractError> {
    info!("Extracting {} bytes to {:?}", bytes.len(), target_dir);

    let mut archive = zip::ZipArchive::new(Cursor::new(bytes))?;
    fs::create_dir_all(target_dir).map_err(io_error(target_dir))?;

    let mut extracted = Vec::with_capacity(archive.len());

    for i in 0..archive.len() {
        let mut member = archive.by_index(i)?;
        let name = member.name().to_string();

        let relative = member
            .enclosed_name()
            .map(|p| p.to_path_buf())
            .ok_or_else(|| ExtractError::UnsafePath(name.clone()))?;
        let output_path = target_dir.join(relative);

        if member.is_dir() {
            fs::create_dir_all(&output_path).map_err(io_error(&output_path))?;
            continue;
        }

        if let Some(parent) = output_path.parent() {
            fs::create_dir_all(parent).map_err(io_error(parent))?;
        }

        // Same-name files from an earlier run are overwritten
        let mut output_file = fs::File::create(&output_path).map_err(io_error(&output_path))?;
        io::copy(&mut member, &mut output_file).map_err(io_error(&output_path))?;

        debug!("Extracted {} to {:?}", name, output_path);
        extracted.push(output_path);
    }

    info!("Extracted {} file(s) to {:?}", extracted.len(), target_dir);
    Ok(extracted)
}

/// Async wrapper running the extraction on the blocking pool
pub async fn extract_zip_blocking(
    bytes: bytes::Bytes,
    target_dir: PathBuf,
) -> Result<Vec<PathBuf>, ExtractError> {
    tokio::task::spawn_blocking(move || extract_zip(&bytes, &target_dir))
        .await
        .map_err(|e| ExtractError::Task(e.to_string()))?
}

/// Pick the member to publish according to `selector`
pub fn select_member(
    paths: &[PathBuf],
    selector: &MemberSelector,
) -> Result<PathBuf, ExtractError> {
    let names = || paths.iter().map(|p| file_name_of(p)).collect::<Vec<_>>();

    let first = paths.first().ok_or(ExtractError::EmptyArchive)?;

    match selector {
        MemberSelector::First => {
            if paths.len() > 1 {
                warn!(
                    "Archive has {} files, publishing the first: {:?}",
                    paths.len(),
                    first
                );
            }
            Ok(first.clone())
        }
        MemberSelector::ExactlyOne => {
            if paths.len() == 1 {
                Ok(first.clone())
            } else {
                Err(ExtractError::AmbiguousArchive {
                    count: paths.len(),
                    names: names(),
                })
            }
        }
        MemberSelector::Named(suffix) => {
            let wanted = suffix.to_lowercase();
            paths
                .iter()
                .find(|p| file_name_of(p).to_lowercase().ends_with(&wanted))
                .cloned()
                .ok_or_else(|| ExtractError::NoMatchingMember {
                    suffix: suffix.clone(),
                    names: names(),
                })
        }
    }
}

/// Working directory shared by one run
/// Each source gets its own subdirectory; the whole root is removed on cleanup or drop
#[derive(Debug)]
pub struct ExtractionRoot {
    path: PathBuf,
    removed: bool,
}

impl ExtractionRoot {
    /// Claim `path` as the extraction root; nothing is created until a source needs it
    pub fn new(path: impl Into<PathBuf>) -> Self {
        ExtractionRoot {
            path: path.into(),
            removed: false,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Isolated directory for the source at `index` publishing under `key`
    pub fn source_dir(&self, index: usize, key: &str) -> PathBuf {
        self.path.join(format!("{:02}-{}", index, sanitize_stem(key)))
    }

    /// Remove the root and everything under it
    pub fn cleanup(&mut self) -> io::Result<()> {
        self.removed = true;
        match fs::remove_dir_all(&self.path) {
            Ok(()) => {
                info!("Removed extraction directory {:?}", self.path);
                Ok(())
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e),
        }
    }
}

impl Drop for ExtractionRoot {
    fn drop(&mut self) {
        if !self.removed {
            if let Err(e) = self.cleanup() {
                warn!("Failed to remove extraction directory {:?}: {}", self.path, e);
            }
        }
    }
}
