use crate::modules::config::{env_string, env_timeout};
use crate::modules::protocol::PresetDocument;
use async_trait::async_trait;
use reqwest::StatusCode;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

const PRESET_EXTENSION: &str = "vital";
const DEFAULT_BUCKET: &str = "presets";

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("invalid object key {0:?}")]
    InvalidKey(String),
    #[error("preset not found: {0}")]
    NotFound(String),
    #[error("storage request failed: status={status} body={body}")]
    BadStatus { status: u16, body: String },
    #[error("storage request timed out")]
    Timeout,
    #[error("storage unreachable: {0}")]
    Unreachable(String),
    #[error("storage io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("stored preset is not a JSON object: {0}")]
    Decode(String),
}

impl StorageError {
    /// HTTP-ish status the storage backend answered with, when there was one.
    pub fn status(&self) -> Option<u16> {
        match self {
            StorageError::NotFound(_) => Some(404),
            StorageError::BadStatus { status, .. } => Some(*status),
            StorageError::Timeout => Some(504),
            _ => None,
        }
    }
}

#[async_trait]
pub trait PresetStore: Send + Sync {
    async fn fetch(&self, key: &str) -> Result<Vec<u8>, StorageError>;
    async fn store(&self, key: &str, bytes: Vec<u8>) -> Result<(), StorageError>;
}

/// Maps a preset id to its object key: `abc` becomes `abc.vital`, keys that already
/// carry an extension are kept. Rejects anything that could escape the bucket.
pub fn object_key_for(id: &str) -> Result<String, StorageError> {
    let id = id.trim();
    let bad = id.is_empty()
        || id.starts_with('/')
        || id.contains('\\')
        || id.chars().any(char::is_control)
        || id.split('/').any(|seg| seg.is_empty() || seg == "." || seg == "..");
    if bad {
        return Err(StorageError::InvalidKey(id.to_string()));
    }

    let last = id.rsplit('/').next().unwrap_or(id);
    if last.contains('.') {
        Ok(id.to_string())
    } else {
        Ok(format!("{id}.{PRESET_EXTENSION}"))
    }
}

pub fn decode_preset(bytes: &[u8]) -> Result<PresetDocument, StorageError> {
    let value: serde_json::Value =
        serde_json::from_slice(bytes).map_err(|e| StorageError::Decode(e.to_string()))?;
    if !value.is_object() {
        return Err(StorageError::Decode(format!(
            "top-level {}",
            crate::modules::protocol::json_type_name(&value)
        )));
    }
    PresetDocument::from_value(value).map_err(|e| StorageError::Decode(e.to_string()))
}

pub async fn fetch_preset(store: &dyn PresetStore, id: &str) -> Result<PresetDocument, StorageError> {
    let key = object_key_for(id)?;
    let bytes = store.fetch(&key).await?;
    decode_preset(&bytes)
}

/// Object storage speaking the Supabase storage REST dialect.
#[derive(Debug, Clone)]
pub struct HttpPresetStore {
    client: reqwest::Client,
    base_url: String,
    service_key: String,
    bucket: String,
}

impl HttpPresetStore {
    pub fn new(
        base_url: impl Into<String>,
        service_key: impl Into<String>,
        bucket: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self, StorageError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| StorageError::Unreachable(e.to_string()))?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            service_key: service_key.into(),
            bucket: bucket.into(),
        })
    }

    /// `STORAGE_URL` + `STORAGE_SERVICE_KEY` (+ `STORAGE_BUCKET`). `None` when no URL is set.
    pub fn from_env() -> Result<Option<Self>, StorageError> {
        let Some(url) = env_string("STORAGE_URL") else {
            return Ok(None);
        };
        let key = env_string("STORAGE_SERVICE_KEY").unwrap_or_default();
        if key.is_empty() {
            tracing::warn!("STORAGE_URL is set but STORAGE_SERVICE_KEY is empty");
        }
        let bucket = env_string("STORAGE_BUCKET").unwrap_or_else(|| DEFAULT_BUCKET.to_string());
        let timeout = env_timeout("STORAGE_HTTP_TIMEOUT_SECS", 20, 1, 120);
        Self::new(url, key, bucket, timeout).map(Some)
    }

    fn object_url(&self, key: &str) -> String {
        format!("{}/storage/v1/object/{}/{}", self.base_url, self.bucket, key)
    }

    fn authed(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        req.bearer_auth(&self.service_key)
            .header("apikey", &self.service_key)
    }
}

fn transport_error(e: reqwest::Error) -> StorageError {
    if e.is_timeout() {
        StorageError::Timeout
    } else {
        StorageError::Unreachable(e.to_string())
    }
}

#[async_trait]
impl PresetStore for HttpPresetStore {
    async fn fetch(&self, key: &str) -> Result<Vec<u8>, StorageError> {
        let resp = self
            .authed(self.client.get(self.object_url(key)))
            .send()
            .await
            .map_err(transport_error)?;

        let status = resp.status();
        if status == StatusCode::NOT_FOUND {
            return Err(StorageError::NotFound(key.to_string()));
        }
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(StorageError::BadStatus {
                status: status.as_u16(),
                body,
            });
        }
        let bytes = resp.bytes().await.map_err(transport_error)?;
        Ok(bytes.to_vec())
    }

    async fn store(&self, key: &str, bytes: Vec<u8>) -> Result<(), StorageError> {
        let resp = self
            .authed(self.client.post(self.object_url(key)))
            .header("x-upsert", "true")
            .header(reqwest::header::CONTENT_TYPE, "application/octet-stream")
            .body(bytes)
            .send()
            .await
            .map_err(transport_error)?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(StorageError::BadStatus {
                status: status.as_u16(),
                body,
            });
        }
        Ok(())
    }
}

/// Presets as files under a local directory.
#[derive(Debug, Clone)]
pub struct FsPresetStore {
    root: PathBuf,
}

impl FsPresetStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

#[async_trait]
impl PresetStore for FsPresetStore {
    async fn fetch(&self, key: &str) -> Result<Vec<u8>, StorageError> {
        let path = self.root.join(key);
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(StorageError::NotFound(key.to_string()))
            }
            Err(e) => Err(StorageError::Io(e)),
        }
    }

    async fn store(&self, key: &str, bytes: Vec<u8>) -> Result<(), StorageError> {
        let path = self.root.join(key);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&path, bytes).await?;
        Ok(())
    }
}
