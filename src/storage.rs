//! Storage publisher and object store backends
//!
//! A publish either returns a dereferenceable public reference or fails as a
//! whole; neither backend leaves a partially written object behind.

use crate::{
    redact_secrets, sanitize_key_component, truncate_diagnostic, Config, OutputFormat,
    PipelineError, StorageSettings,
};
use async_trait::async_trait;
use serde::Deserialize;
use sha2::{Digest, Sha256};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Location of one stored object: `{scope}/{name}.{extension}`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectKey {
    pub scope: String,
    pub name: String,
    pub extension: &'static str,
}

impl ObjectKey {
    pub fn path(&self) -> String {
        format!("{}/{}.{}", self.scope, self.name, self.extension)
    }
}

/// Durable blob storage returning public references
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn put(
        &self,
        key: &ObjectKey,
        bytes: Vec<u8>,
        content_type: &str,
    ) -> Result<String, PipelineError>;
}

/// Files on the local filesystem
pub struct LocalObjectStore {
    root: PathBuf,
    public_base_url: String,
}

impl LocalObjectStore {
    pub fn new(root: impl Into<PathBuf>, public_base_url: impl Into<String>) -> Self {
        Self {
            root: root.into(),
            public_base_url: public_base_url.into(),
        }
    }
}

#[async_trait]
impl ObjectStore for LocalObjectStore {
    async fn put(
        &self,
        key: &ObjectKey,
        bytes: Vec<u8>,
        _content_type: &str,
    ) -> Result<String, PipelineError> {
        let dir = self.root.join(&key.scope);
        let target = dir.join(format!("{}.{}", key.name, key.extension));
        let staging = dir.join(format!(".{}.{}.tmp", key.name, uuid::Uuid::new_v4()));

        let upload_failed =
            |e: std::io::Error| PipelineError::UploadFailed(format!("{}: {e}", target.display()));

        tokio::fs::create_dir_all(&dir).await.map_err(upload_failed)?;

        // Readers only ever see the final name once the bytes are complete.
        if let Err(e) = tokio::fs::write(&staging, &bytes).await {
            let _ = tokio::fs::remove_file(&staging).await;
            return Err(upload_failed(e));
        }
        if let Err(e) = tokio::fs::rename(&staging, &target).await {
            let _ = tokio::fs::remove_file(&staging).await;
            return Err(upload_failed(e));
        }

        debug!("Wrote {} bytes to {}", bytes.len(), target.display());

        Ok(format!(
            "{}/{}",
            self.public_base_url.trim_end_matches('/'),
            key.path()
        ))
    }
}

/// Remote object store taking signed multipart uploads at
/// `POST {endpoint}/{account}/image/upload`
pub struct HttpObjectStore {
    client: reqwest::Client,
    endpoint: String,
    account: String,
    api_key: String,
    api_secret: String,
}

#[derive(Deserialize)]
struct UploadResponse {
    secure_url: Option<String>,
    error: Option<UploadErrorBody>,
}

#[derive(Deserialize)]
struct UploadErrorBody {
    message: String,
}

impl HttpObjectStore {
    pub fn new(
        endpoint: impl Into<String>,
        account: impl Into<String>,
        api_key: impl Into<String>,
        api_secret: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self, PipelineError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| PipelineError::ConfigurationError(e.to_string()))?;

        Ok(Self {
            client,
            endpoint: endpoint.into(),
            account: account.into(),
            api_key: api_key.into(),
            api_secret: api_secret.into(),
        })
    }

    /// Hex SHA-256 over the sorted signed parameters followed by the secret.
    pub fn sign(&self, folder: &str, public_id: &str, timestamp: i64) -> String {
        let to_sign = format!("folder={folder}&public_id={public_id}&timestamp={timestamp}");
        let digest = Sha256::digest(format!("{to_sign}{}", self.api_secret).as_bytes());
        hex::encode(digest)
    }

    fn upload_url(&self) -> String {
        format!(
            "{}/{}/image/upload",
            self.endpoint.trim_end_matches('/'),
            self.account
        )
    }

    fn transport_error(&self, err: reqwest::Error) -> PipelineError {
        let prefix = if err.is_timeout() { "timed out: " } else { "" };
        PipelineError::UploadFailed(format!(
            "{prefix}{}",
            self.scrub(&err.without_url().to_string())
        ))
    }

    fn scrub(&self, text: &str) -> String {
        redact_secrets(
            &truncate_diagnostic(text),
            &[self.api_key.clone(), self.api_secret.clone()],
        )
    }
}

#[async_trait]
impl ObjectStore for HttpObjectStore {
    async fn put(
        &self,
        key: &ObjectKey,
        bytes: Vec<u8>,
        content_type: &str,
    ) -> Result<String, PipelineError> {
        let timestamp = chrono::Utc::now().timestamp();
        let signature = self.sign(&key.scope, &key.name, timestamp);

        let file = reqwest::multipart::Part::bytes(bytes)
            .file_name(format!("{}.{}", key.name, key.extension))
            .mime_str(content_type)
            .map_err(|e| PipelineError::UploadFailed(e.to_string()))?;

        let form = reqwest::multipart::Form::new()
            .part("file", file)
            .text("folder", key.scope.clone())
            .text("public_id", key.name.clone())
            .text("api_key", self.api_key.clone())
            .text("timestamp", timestamp.to_string())
            .text("signature", signature)
            .text("signature_algorithm", "sha256");

        let response = self
            .client
            .post(self.upload_url())
            .multipart(form)
            .send()
            .await
            .map_err(|e| self.transport_error(e))?;

        let status = response.status();
        let raw = response
            .bytes()
            .await
            .map_err(|e| self.transport_error(e))?;
        let parsed: Option<UploadResponse> = serde_json::from_slice(&raw).ok();

        if !status.is_success() {
            let detail = parsed
                .and_then(|r| r.error)
                .map(|e| e.message)
                .unwrap_or_else(|| String::from_utf8_lossy(&raw).into_owned());
            return Err(PipelineError::UploadFailed(format!(
                "store returned HTTP {}: {}",
                status.as_u16(),
                self.scrub(&detail)
            )));
        }

        parsed
            .and_then(|r| r.secure_url)
            .filter(|u| !u.is_empty())
            .ok_or_else(|| {
                PipelineError::UploadFailed("store response has no secure_url".to_string())
            })
    }
}

/// A successfully stored image
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredObject {
    pub key: String,
    pub reference: String,
}

/// Pushes encoded images to the configured object store
pub struct StoragePublisher {
    store: Arc<dyn ObjectStore>,
    format: OutputFormat,
}

impl StoragePublisher {
    pub fn new(store: Arc<dyn ObjectStore>, format: OutputFormat) -> Self {
        Self { store, format }
    }

    pub fn from_config(config: &Config) -> Result<Self, PipelineError> {
        let store: Arc<dyn ObjectStore> = match &config.storage {
            StorageSettings::Local {
                root,
                public_base_url,
            } => Arc::new(LocalObjectStore::new(root.clone(), public_base_url.clone())),
            StorageSettings::Remote {
                endpoint,
                account,
                key,
                secret,
                timeout,
            } => Arc::new(HttpObjectStore::new(
                endpoint.clone(),
                account.clone(),
                key.clone(),
                secret.clone(),
                *timeout,
            )?),
        };
        Ok(Self::new(store, config.output_format))
    }

    /// Store `bytes` as `name` within `scope`.
    pub async fn publish(
        &self,
        bytes: Vec<u8>,
        scope: &str,
        name: &str,
    ) -> Result<StoredObject, PipelineError> {
        let key = ObjectKey {
            scope: sanitize_key_component(scope),
            name: sanitize_key_component(name),
            extension: self.format.extension(),
        };

        let reference = self
            .store
            .put(&key, bytes, self.format.content_type())
            .await?;

        Ok(StoredObject {
            key: key.path(),
            reference,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_object_key_path() {
        let key = ObjectKey {
            scope: "example.com".to_string(),
            name: "part-3".to_string(),
            extension: "png",
        };
        assert_eq!(key.path(), "example.com/part-3.png");
    }

    #[test]
    fn test_signature_is_stable_hex() {
        let store = HttpObjectStore::new(
            "https://store.test",
            "acme",
            "key",
            "secret",
            Duration::from_secs(5),
        )
        .unwrap();
        let a = store.sign("example.com", "part-0", 1_700_000_000);
        let b = store.sign("example.com", "part-0", 1_700_000_000);
        let c = store.sign("example.com", "part-1", 1_700_000_000);
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.len(), 64);
        assert!(a.chars().all(|ch| ch.is_ascii_hexdigit()));
    }

    #[tokio::test]
    async fn test_local_store_writes_final_object_only() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalObjectStore::new(dir.path(), "https://cdn.test/shots/");
        let publisher = StoragePublisher::new(Arc::new(store), OutputFormat::Png);

        let stored = publisher
            .publish(vec![1, 2, 3], "www/example.com", "part-0")
            .await
            .unwrap();

        assert_eq!(stored.key, "www_example.com/part-0.png");
        assert_eq!(
            stored.reference,
            "https://cdn.test/shots/www_example.com/part-0.png"
        );

        let written = std::fs::read(dir.path().join("www_example.com/part-0.png")).unwrap();
        assert_eq!(written, vec![1, 2, 3]);

        let leftovers: Vec<_> = std::fs::read_dir(dir.path().join("www_example.com"))
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[tokio::test]
    async fn test_local_store_failure_is_upload_failed() {
        let dir = tempfile::tempdir().unwrap();
        // A plain file where the scope directory should go.
        std::fs::write(dir.path().join("example.com"), b"occupied").unwrap();
        let store = LocalObjectStore::new(dir.path(), "file:///shots");
        let publisher = StoragePublisher::new(Arc::new(store), OutputFormat::Png);

        let err = publisher
            .publish(vec![1], "example.com", "part-0")
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::UploadFailed(_)));
    }

    #[tokio::test]
    async fn test_publisher_passes_content_type_and_sanitized_key() {
        let mut store = MockObjectStore::new();
        store
            .expect_put()
            .withf(|key, bytes, content_type| {
                key.path() == "example.com/part-1.png"
                    && bytes == &vec![9u8]
                    && content_type == "image/png"
            })
            .times(1)
            .returning(|key, _, _| Ok(format!("https://cdn.test/{}", key.path())));

        let publisher = StoragePublisher::new(Arc::new(store), OutputFormat::Png);
        let stored = publisher
            .publish(vec![9], "example.com", "part-1")
            .await
            .unwrap();
        assert_eq!(stored.reference, "https://cdn.test/example.com/part-1.png");
    }
}
