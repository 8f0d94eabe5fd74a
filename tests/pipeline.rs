//! End-to-end pipeline runs against a local fixture server

use async_trait::async_trait;
use axum::http::StatusCode;
use axum::routing::get;
use axum::Router;
use bytes::Bytes;
use std::io::{Cursor, Write};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tempfile::{tempdir, TempDir};
use tesouro_ingest::ingestion::extract::MemberSelector;
use tesouro_ingest::ingestion::fetch::{FetchOptions, Fetcher};
use tesouro_ingest::ingestion::pipeline::{FailurePolicy, Pipeline, PipelineOptions};
use tesouro_ingest::ingestion::publish::{MemoryStore, ObjectStore, PublishError, PublishReceipt};
use tesouro_ingest::ingestion::retry::WaitOptions;
use tesouro_ingest::ingestion::{RawData, SourceDescriptor, SourceKind, SourceStatus};
use zip::write::FileOptions;

const BUCKET: &str = "data-lake";

fn zip_with(members: &[(&str, &[u8])]) -> Vec<u8> {
    let mut zip = zip::ZipWriter::new(Cursor::new(Vec::new()));
    for (name, content) in members {
        zip.start_file(*name, FileOptions::default()).unwrap();
        zip.write_all(content).unwrap();
    }
    zip.finish().unwrap().into_inner()
}

fn serve(body: Vec<u8>) -> axum::routing::MethodRouter {
    get(move || {
        let body = body.clone();
        async move { body }
    })
}

/// Start the fixture server and return its base URL
async fn spawn_fixture(app: Router) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{}", addr)
}

fn fast_fetcher() -> Fetcher {
    Fetcher::new(FetchOptions {
        timeout: Duration::from_secs(5),
        retry: WaitOptions::default()
            .retry_interval(Duration::from_millis(5))
            .allowed_errors(2),
    })
    .unwrap()
}

fn options(temp: &TempDir) -> PipelineOptions {
    let mut options = PipelineOptions::new(BUCKET);
    options.extraction_dir = temp.path().join("extracted_files");
    options
}

/// Store that rejects chosen keys as if no credentials were configured
struct MissingCredentialsFor {
    keys: Vec<&'static str>,
    inner: MemoryStore,
}

#[async_trait]
impl ObjectStore for MissingCredentialsFor {
    fn name(&self) -> &str {
        "flaky-credentials"
    }

    async fn put_object(
        &self,
        bucket: &str,
        key: &str,
        body: RawData,
    ) -> Result<PublishReceipt, PublishError> {
        if self.keys.iter().any(|k| *k == key) {
            return Err(PublishError::CredentialsMissing);
        }
        self.inner.put_object(bucket, key, body).await
    }
}

#[tokio::test]
async fn test_two_member_archive_publishes_first_member() {
    let archive = zip_with(&[("a.csv", b"ano;valor\n2024;1\n"), ("b.csv", b"other")]);
    let base = spawn_fixture(Router::new().route("/data/Foo2024.zip", serve(archive))).await;

    let temp = tempdir().unwrap();
    let store = Arc::new(MemoryStore::new());
    let pipeline = Pipeline::new(fast_fetcher(), store.clone(), options(&temp));

    let sources = vec![SourceDescriptor::new(
        SourceKind::Zip,
        format!("{}/data/Foo2024.zip", base),
    )];
    let summary = pipeline.run(&sources).await;

    assert!(summary.is_success(), "{:?}", summary);
    assert_eq!(store.keys(BUCKET), vec!["Foo2024.csv"]);
    assert_eq!(
        store.get(BUCKET, "Foo2024.csv").unwrap(),
        Bytes::from_static(b"ano;valor\n2024;1\n")
    );
    assert!(!temp.path().join("extracted_files").exists());
}

#[tokio::test]
async fn test_csv_and_archive_sources_use_derived_keys() {
    let csv = b"Tipo Titulo;Data Vencimento;Data Base;Taxa Compra Manha\nTesouro Selic;01/03/2029;02/01/2024;0,1\n".to_vec();
    let archive = zip_with(&[("InvestidoresTesouroDireto2017.csv", b"Codigo do Investidor;UF\n1;SP\n")]);

    let app = Router::new()
        .route("/download/PrecoTaxaTesouroDireto.csv", serve(csv.clone()))
        .route("/download/InvestidoresTesouroDireto2017.zip", serve(archive));
    let base = spawn_fixture(app).await;

    let temp = tempdir().unwrap();
    let store = Arc::new(MemoryStore::new());
    let pipeline = Pipeline::new(fast_fetcher(), store.clone(), options(&temp));

    let sources = vec![
        SourceDescriptor::new(
            SourceKind::Csv,
            format!("{}/download/PrecoTaxaTesouroDireto.csv", base),
        ),
        SourceDescriptor::new(
            SourceKind::Zip,
            format!("{}/download/InvestidoresTesouroDireto2017.zip", base),
        ),
    ];
    let summary = pipeline.run(&sources).await;

    assert_eq!(summary.published(), 2);
    assert_eq!(
        store.keys(BUCKET),
        vec![
            "InvestidoresTesouroDireto2017.csv",
            "PrecoTaxaTesouroDireto.csv"
        ]
    );
    assert_eq!(
        store.get(BUCKET, "PrecoTaxaTesouroDireto.csv").unwrap(),
        Bytes::from(csv)
    );
    assert_eq!(
        store.get(BUCKET, "InvestidoresTesouroDireto2017.csv").unwrap(),
        Bytes::from_static(b"Codigo do Investidor;UF\n1;SP\n")
    );
    assert_eq!(
        summary.reports[1].status,
        SourceStatus::Published { bytes: 29 }
    );
}

#[tokio::test]
async fn test_http_error_aborts_before_upload() {
    let app = Router::new()
        .route("/data/Vendas2017.zip", get(|| async { StatusCode::NOT_FOUND }))
        .route("/data/Preco.csv", serve(b"x;y\n".to_vec()));
    let base = spawn_fixture(app).await;

    let temp = tempdir().unwrap();
    let store = Arc::new(MemoryStore::new());
    let pipeline = Pipeline::new(fast_fetcher(), store.clone(), options(&temp));

    let sources = vec![
        SourceDescriptor::new(SourceKind::Zip, format!("{}/data/Vendas2017.zip", base)),
        SourceDescriptor::new(SourceKind::Csv, format!("{}/data/Preco.csv", base)),
    ];
    let summary = pipeline.run(&sources).await;

    let reason = summary.aborted.clone().expect("run should abort");
    assert!(reason.contains("404"), "{}", reason);
    assert_eq!(summary.reports.len(), 1);
    assert!(matches!(summary.reports[0].status, SourceStatus::Failed { .. }));
    assert!(store.keys(BUCKET).is_empty());
    assert!(!temp.path().join("extracted_files").exists());
}

#[tokio::test]
async fn test_empty_archive_fails_source_and_run_continues() {
    let app = Router::new()
        .route("/data/Vazio2020.zip", serve(zip_with(&[])))
        .route("/data/Cheio2021.zip", serve(zip_with(&[("x.csv", b"1")])));
    let base = spawn_fixture(app).await;

    let temp = tempdir().unwrap();
    let mut options = options(&temp);
    options.on_source_error = FailurePolicy::Continue;

    let store = Arc::new(MemoryStore::new());
    let pipeline = Pipeline::new(fast_fetcher(), store.clone(), options);

    let sources = vec![
        SourceDescriptor::new(SourceKind::Zip, format!("{}/data/Vazio2020.zip", base)),
        SourceDescriptor::new(SourceKind::Zip, format!("{}/data/Cheio2021.zip", base)),
    ];
    let summary = pipeline.run(&sources).await;

    assert_eq!(
        summary.reports[0].status,
        SourceStatus::Failed {
            reason: "archive contains no files".to_string()
        }
    );
    assert_eq!(summary.published(), 1);
    assert!(summary.aborted.is_none());
    assert_eq!(store.keys(BUCKET), vec!["Cheio2021.csv"]);
}

#[tokio::test]
async fn test_missing_credentials_skip_source_and_run_continues() {
    let app = Router::new()
        .route("/data/Preco.csv", serve(b"preco".to_vec()))
        .route("/data/Taxa2019.zip", serve(zip_with(&[("t.csv", b"taxa")])));
    let base = spawn_fixture(app).await;

    let temp = tempdir().unwrap();
    let store = Arc::new(MissingCredentialsFor {
        keys: vec!["Preco.csv"],
        inner: MemoryStore::new(),
    });
    let pipeline = Pipeline::new(fast_fetcher(), store.clone(), options(&temp));

    let sources = vec![
        SourceDescriptor::new(SourceKind::Csv, format!("{}/data/Preco.csv", base)),
        SourceDescriptor::new(SourceKind::Zip, format!("{}/data/Taxa2019.zip", base)),
    ];
    let summary = pipeline.run(&sources).await;

    assert_eq!(
        summary.reports[0].status,
        SourceStatus::Skipped {
            reason: "credentials not available".to_string()
        }
    );
    assert_eq!(summary.skipped(), 1);
    assert_eq!(summary.published(), 1);
    assert!(summary.is_success());
    assert!(store.inner.get(BUCKET, "Preco.csv").is_none());
    assert_eq!(
        store.inner.get(BUCKET, "Taxa2019.csv").unwrap(),
        Bytes::from_static(b"taxa")
    );
}

#[tokio::test]
async fn test_publish_abort_policy_stops_run() {
    let app = Router::new()
        .route("/data/Preco.csv", serve(b"preco".to_vec()))
        .route("/data/Taxa.csv", serve(b"taxa".to_vec()));
    let base = spawn_fixture(app).await;

    let temp = tempdir().unwrap();
    let mut options = options(&temp);
    options.on_publish_error = FailurePolicy::Abort;

    let store = Arc::new(MissingCredentialsFor {
        keys: vec!["Preco.csv"],
        inner: MemoryStore::new(),
    });
    let pipeline = Pipeline::new(fast_fetcher(), store.clone(), options);

    let sources = vec![
        SourceDescriptor::new(SourceKind::Csv, format!("{}/data/Preco.csv", base)),
        SourceDescriptor::new(SourceKind::Csv, format!("{}/data/Taxa.csv", base)),
    ];
    let summary = pipeline.run(&sources).await;

    assert!(summary.aborted.is_some());
    assert_eq!(summary.reports.len(), 1);
    assert!(store.inner.keys(BUCKET).is_empty());
}

#[tokio::test]
async fn test_transient_status_is_retried() {
    let hits = Arc::new(AtomicUsize::new(0));
    let counter = hits.clone();
    let flaky = get(move || {
        let counter = counter.clone();
        async move {
            if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                (StatusCode::SERVICE_UNAVAILABLE, Vec::new())
            } else {
                (StatusCode::OK, b"recovered".to_vec())
            }
        }
    });
    let base = spawn_fixture(Router::new().route("/data/Preco.csv", flaky)).await;

    let temp = tempdir().unwrap();
    let store = Arc::new(MemoryStore::new());
    let pipeline = Pipeline::new(fast_fetcher(), store.clone(), options(&temp));

    let sources = vec![SourceDescriptor::new(
        SourceKind::Csv,
        format!("{}/data/Preco.csv", base),
    )];
    let summary = pipeline.run(&sources).await;

    assert!(summary.is_success(), "{:?}", summary);
    assert_eq!(hits.load(Ordering::SeqCst), 2);
    assert_eq!(
        store.get(BUCKET, "Preco.csv").unwrap(),
        Bytes::from_static(b"recovered")
    );
}

#[tokio::test]
async fn test_concurrent_archives_extract_in_isolation() {
    // Every archive holds a member with the same name
    let mut app = Router::new();
    for year in 2017..=2024 {
        let content = format!("ano;{}\n", year).into_bytes();
        app = app.route(
            &format!("/data/Investidores{}.zip", year),
            serve(zip_with(&[("dados.csv", &content)])),
        );
    }
    let base = spawn_fixture(app).await;

    let temp = tempdir().unwrap();
    let mut options = options(&temp);
    options.max_concurrency = 4;

    let store = Arc::new(MemoryStore::new());
    let pipeline = Pipeline::new(fast_fetcher(), store.clone(), options);

    let sources: Vec<_> = (2017..=2024)
        .map(|year| {
            SourceDescriptor::new(
                SourceKind::Zip,
                format!("{}/data/Investidores{}.zip", base, year),
            )
        })
        .collect();
    let summary = pipeline.run(&sources).await;

    assert_eq!(summary.published(), 8);
    for (report, year) in summary.reports.iter().zip(2017..=2024) {
        let key = format!("Investidores{}.csv", year);
        assert_eq!(report.key.as_deref(), Some(key.as_str()));
        assert_eq!(
            store.get(BUCKET, &key).unwrap(),
            Bytes::from(format!("ano;{}\n", year))
        );
    }
    assert!(!temp.path().join("extracted_files").exists());
}

#[tokio::test]
async fn test_exactly_one_selector_rejects_multi_member_archive() {
    let archive = zip_with(&[("a.csv", b"a"), ("b.csv", b"b")]);
    let base = spawn_fixture(Router::new().route("/data/Foo2024.zip", serve(archive))).await;

    let temp = tempdir().unwrap();
    let mut options = options(&temp);
    options.selector = MemberSelector::ExactlyOne;

    let store = Arc::new(MemoryStore::new());
    let pipeline = Pipeline::new(fast_fetcher(), store.clone(), options);

    let sources = vec![SourceDescriptor::new(
        SourceKind::Zip,
        format!("{}/data/Foo2024.zip", base),
    )];
    let summary = pipeline.run(&sources).await;

    match &summary.reports[0].status {
        SourceStatus::Failed { reason } => assert!(reason.contains("exactly one"), "{}", reason),
        other => panic!("Expected Failed, got {:?}", other),
    }
    assert!(store.keys(BUCKET).is_empty());
}
