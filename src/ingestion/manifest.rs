//! Source manifest - the list of datasets a run ingests

use crate::ingestion::types::{SourceDescriptor, SourceKind};
use reqwest::Url;
use std::io::Read;
use std::path::Path;
use thiserror::Error;
use tracing::{info, warn};

/// Tesouro Direto prices and rates, published as a single CSV
pub const PRECO_TAXA_CSV_URL: &str = "https://www.tesourotransparente.gov.br/ckan/dataset/df56aa42-484a-4a59-8184-7676580c81e3/resource/796d2059-14e9-44e3-80c9-2d9e30b405c1/download/PrecoTaxaTesouroDireto.csv";

/// Download area for the yearly Tesouro Direto archives
pub const YEARLY_ARCHIVE_BASE_URL: &str =
    "https://www.tesourotransparente.gov.br/ckan/dataset/investidores-do-tesouro-direto/download";

/// Years covered by the yearly archives
pub const ARCHIVE_YEARS: std::ops::RangeInclusive<u16> = 2017..=2024;

#[derive(Debug, Error)]
pub enum ManifestError {
    #[error("could not read manifest {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid manifest row {row}: {source}")]
    Csv {
        row: u64,
        #[source]
        source: csv::Error,
    },

    #[error("invalid source URL {url:?} on manifest row {row}")]
    InvalidUrl { row: u64, url: String },

    #[error("manifest lists no sources")]
    Empty,
}

/// Built-in source list: the price/rate CSV followed by the yearly archives
pub fn default_sources() -> Vec<SourceDescriptor> {
    let mut sources = vec![SourceDescriptor::new(SourceKind::Csv, PRECO_TAXA_CSV_URL)];

    sources.extend(ARCHIVE_YEARS.map(|year| {
        SourceDescriptor::new(
            SourceKind::Zip,
            format!("{}/InvestidoresTesouroDireto{}.zip", YEARLY_ARCHIVE_BASE_URL, year),
        )
    }));

    sources
}

/// Load a manifest file (CSV with header `kind,url,key`, `#` comments allowed)
pub fn load_manifest(path: &Path) -> Result<Vec<SourceDescriptor>, ManifestError> {
    info!("Loading source manifest from {:?}", path);

    let file = std::fs::File::open(path).map_err(|source| ManifestError::Io {
        path: path.display().to_string(),
        source,
    })?;

    let sources = parse_manifest(file)?;
    info!("Manifest lists {} sources", sources.len());
    Ok(sources)
}

/// Parse manifest rows from any reader
pub fn parse_manifest<R: Read>(reader: R) -> Result<Vec<SourceDescriptor>, ManifestError> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .comment(Some(b'#'))
        .flexible(true)
        .trim(csv::Trim::All)
        .from_reader(reader);

    let csv_error = |source: csv::Error| ManifestError::Csv {
        row: source.position().map(|p| p.line()).unwrap_or(0),
        source,
    };

    let headers = reader.headers().map_err(csv_error)?.clone();
    let mut record = csv::StringRecord::new();
    let mut sources = Vec::new();

    while reader.read_record(&mut record).map_err(csv_error)? {
        let row = record.position().map(|p| p.line()).unwrap_or(0);
        let source: SourceDescriptor = record
            .deserialize(Some(&headers))
            .map_err(|source| ManifestError::Csv { row, source })?;

        match Url::parse(&source.url) {
            Ok(url) if url.scheme() == "http" || url.scheme() == "https" => {}
            _ => {
                return Err(ManifestError::InvalidUrl {
                    row,
                    url: source.url,
                })
            }
        }

        sources.push(source);
    }

    if sources.is_empty() {
        return Err(ManifestError::Empty);
    }

    Ok(sources)
}

/// Keep only sources named on the command line (by object key or key stem)
/// An empty selection keeps everything
pub fn filter_sources(sources: Vec<SourceDescriptor>, selected: &[String]) -> Vec<SourceDescriptor> {
    if selected.is_empty() {
        return sources;
    }

    for name in unknown_selections(&sources, selected) {
        warn!("Unknown source: {}", name);
    }

    sources
        .into_iter()
        .filter(|source| selected.iter().any(|s| selects(source, s)))
        .collect()
}

/// Selected names that match no source
pub fn unknown_selections<'a>(sources: &[SourceDescriptor], selected: &'a [String]) -> Vec<&'a str> {
    selected
        .iter()
        .filter(|s| !sources.iter().any(|source| selects(source, s)))
        .map(String::as_str)
        .collect()
}

fn selects(source: &SourceDescriptor, name: &str) -> bool {
    match source.object_key() {
        Ok(key) => name == key || Some(name) == key.strip_suffix(".csv"),
        Err(_) => false,
    }
}
