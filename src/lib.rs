// Library module for testable functions

pub mod ingestion;

use reqwest::Url;
use thiserror::Error;

/// Errors deriving an object key from a source URL
#[derive(Debug, Error, PartialEq, Eq)]
pub enum KeyError {
    #[error("invalid source URL {0}")]
    InvalidUrl(String),

    #[error("source URL {0} has no file name")]
    NoFileName(String),
}

/// Derive the destination object key for a source URL
/// Formula: last path segment, extension stripped, plus `.csv`
pub fn object_key_for_url(url: &str) -> Result<String, KeyError> {
    let parsed = Url::parse(url).map_err(|_| KeyError::InvalidUrl(url.to_string()))?;

    let file_name = parsed
        .path_segments()
        .and_then(|segments| segments.filter(|s| !s.is_empty()).last())
        .ok_or_else(|| KeyError::NoFileName(url.to_string()))?;

    let stem = match file_name.rfind('.') {
        Some(idx) if idx > 0 => &file_name[..idx],
        _ => file_name,
    };

    if stem.is_empty() {
        return Err(KeyError::NoFileName(url.to_string()));
    }

    Ok(format!("{}.csv", stem))
}
