//! Publish functions - write payloads to the destination object store

use crate::ingestion::types::RawData;
use async_trait::async_trait;
use aws_credential_types::provider::error::CredentialsError;
use aws_credential_types::provider::{ProvideCredentials, SharedCredentialsProvider};
use aws_sdk_s3::error::DisplayErrorContext;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::Client;
use bytes::Bytes;
use std::collections::BTreeMap;
use std::sync::Mutex;
use thiserror::Error;
use tracing::{debug, error, info};

/// Upload failures, split so each credential condition is reported distinctly
#[derive(Debug, Error)]
pub enum PublishError {
    #[error("credentials not available")]
    CredentialsMissing,

    #[error("incomplete credentials provided")]
    CredentialsIncomplete,

    #[error("could not read payload: {0}")]
    Io(#[from] std::io::Error),

    #[error("object store error: {0}")]
    Store(String),
}

/// Confirmation of a completed write
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishReceipt {
    pub bucket: String,
    pub key: String,
    pub bytes: u64,
    pub etag: Option<String>,
}

/// Destination for published objects
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Store name for log messages
    fn name(&self) -> &str;

    /// Write `body` to `key` in `bucket`, replacing any existing object
    async fn put_object(
        &self,
        bucket: &str,
        key: &str,
        body: RawData,
    ) -> Result<PublishReceipt, PublishError>;
}

/// Connection settings for S3 and S3-compatible stores
#[derive(Debug, Clone, Default)]
pub struct S3Config {
    /// Optional custom endpoint URL
    pub endpoint_url: Option<String>,
    /// Path-style addressing (required for some S3-compatible services)
    pub force_path_style: bool,
}

/// Amazon S3 backed store using the default AWS credential chain
pub struct S3Store {
    client: Client,
    credentials: Option<SharedCredentialsProvider>,
}

impl S3Store {
    pub async fn new(config: S3Config) -> Self {
        let base_config = aws_config::defaults(aws_config::BehaviorVersion::latest())
            .load()
            .await;

        let mut s3_config_builder = aws_sdk_s3::config::Builder::from(&base_config);

        if let Some(endpoint) = config.endpoint_url {
            s3_config_builder = s3_config_builder.endpoint_url(endpoint);
        }

        if config.force_path_style {
            s3_config_builder = s3_config_builder.force_path_style(true);
        }

        S3Store {
            client: Client::from_conf(s3_config_builder.build()),
            credentials: base_config.credentials_provider(),
        }
    }

    /// Resolve credentials before writing so a credential problem is not reported as a store error
    async fn check_credentials(&self) -> Result<(), PublishError> {
        let access_key = std::env::var("AWS_ACCESS_KEY_ID").ok();
        let secret_key = std::env::var("AWS_SECRET_ACCESS_KEY").ok();
        if let Some(err) = classify_env_credentials(access_key.as_deref(), secret_key.as_deref()) {
            return Err(err);
        }

        let provider = self
            .credentials
            .as_ref()
            .ok_or(PublishError::CredentialsMissing)?;

        provider
            .provide_credentials()
            .await
            .map(|_| ())
            .map_err(classify_credentials_error)
    }
}

#[async_trait]
impl ObjectStore for S3Store {
    fn name(&self) -> &str {
        "s3"
    }

    async fn put_object(
        &self,
        bucket: &str,
        key: &str,
        body: RawData,
    ) -> Result<PublishReceipt, PublishError> {
        self.check_credentials().await?;

        let bytes = body.len()?;
        let stream = match &body {
            RawData::Bytes(data) => ByteStream::from(data.clone()),
            RawData::File(path) => ByteStream::from_path(path).await.map_err(|e| {
                PublishError::Store(format!("could not stream {:?}: {}", path, e))
            })?,
        };

        let output = self
            .client
            .put_object()
            .bucket(bucket)
            .key(key)
            .content_type("text/csv")
            .body(stream)
            .send()
            .await
            .map_err(|e| PublishError::Store(DisplayErrorContext(&e).to_string()))?;

        Ok(PublishReceipt {
            bucket: bucket.to_string(),
            key: key.to_string(),
            bytes,
            etag: output.e_tag().map(String::from),
        })
    }
}

/// Static keys present in the environment but only half set
pub fn classify_env_credentials(
    access_key: Option<&str>,
    secret_key: Option<&str>,
) -> Option<PublishError> {
    let set = |v: Option<&str>| v.map(|s| !s.trim().is_empty()).unwrap_or(false);

    match (set(access_key), set(secret_key)) {
        (true, false) | (false, true) => Some(PublishError::CredentialsIncomplete),
        _ => None,
    }
}

/// Map a credential provider failure onto the publish taxonomy
pub fn classify_credentials_error(err: CredentialsError) -> PublishError {
    match err {
        CredentialsError::CredentialsNotLoaded(_) => PublishError::CredentialsMissing,
        CredentialsError::InvalidConfiguration(_) => PublishError::CredentialsIncomplete,
        other => PublishError::Store(DisplayErrorContext(&other).to_string()),
    }
}

/// In-process store used for dry runs and tests
#[derive(Debug, Default)]
pub struct MemoryStore {
    objects: Mutex<BTreeMap<(String, String), Bytes>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, bucket: &str, key: &str) -> Option<Bytes> {
        self.objects
            .lock()
            .ok()?
            .get(&(bucket.to_string(), key.to_string()))
            .cloned()
    }

    /// Keys stored in `bucket`, sorted
    pub fn keys(&self, bucket: &str) -> Vec<String> {
        match self.objects.lock() {
            Ok(objects) => objects
                .keys()
                .filter(|(b, _)| b == bucket)
                .map(|(_, k)| k.clone())
                .collect(),
            Err(_) => Vec::new(),
        }
    }
}

#[async_trait]
impl ObjectStore for MemoryStore {
    fn name(&self) -> &str {
        "memory"
    }

    async fn put_object(
        &self,
        bucket: &str,
        key: &str,
        body: RawData,
    ) -> Result<PublishReceipt, PublishError> {
        let data = match body {
            RawData::Bytes(data) => data,
            RawData::File(path) => Bytes::from(tokio::fs::read(&path).await?),
        };
        let bytes = data.len() as u64;

        self.objects
            .lock()
            .map_err(|e| PublishError::Store(e.to_string()))?
            .insert((bucket.to_string(), key.to_string()), data);

        Ok(PublishReceipt {
            bucket: bucket.to_string(),
            key: key.to_string(),
            bytes,
            etag: None,
        })
    }
}

/// Write a payload to `bucket`/`key`, logging the outcome
/// The error is returned so the caller decides whether the run continues
pub async fn publish(
    store: &dyn ObjectStore,
    payload: RawData,
    bucket: &str,
    key: &str,
) -> Result<PublishReceipt, PublishError> {
    match &payload {
        RawData::File(path) => info!("Uploading {:?} to {}://{}/{}", path, store.name(), bucket, key),
        RawData::Bytes(data) => info!(
            "Uploading {} bytes to {}://{}/{}",
            data.len(),
            store.name(),
            bucket,
            key
        ),
    }

    match store.put_object(bucket, key, payload).await {
        Ok(receipt) => {
            info!(
                "File uploaded successfully to bucket '{}' with object name '{}'",
                bucket, key
            );
            debug!("Upload receipt: {:?}", receipt);
            Ok(receipt)
        }
        Err(e) => {
            match &e {
                PublishError::CredentialsMissing => {
                    error!("Credentials not available, {} was not uploaded", key)
                }
                PublishError::CredentialsIncomplete => {
                    error!("Incomplete credentials provided, {} was not uploaded", key)
                }
                other => error!("An error occurred uploading {}: {}", key, other),
            }
            Err(e)
        }
    }
}
