pub mod local;
pub mod s3;

use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::io;
use std::sync::Arc;
use std::time::Duration;

use anyhow::anyhow;
use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::{self, BoxStream, StreamExt};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{MediaError, MediaResult, StorageFailure, StorageOp};

pub use local::{LocalDisk, LocalOptions};
pub use s3::{S3Options, S3Storage};

/// Chunk size used when streaming objects in and out of backends.
pub const CHUNK_SIZE: usize = 64 * 1024;

pub type ByteStream = BoxStream<'static, io::Result<Bytes>>;

/// Object body: a complete buffer or a lazy producer.
pub enum Content {
    Bytes(Bytes),
    Stream(ByteStream),
}

impl Content {
    pub fn into_stream(self) -> ByteStream {
        match self {
            Self::Bytes(bytes) => stream::once(async move { Ok(bytes) }).boxed(),
            Self::Stream(stream) => stream,
        }
    }
}

impl From<Bytes> for Content {
    fn from(bytes: Bytes) -> Self {
        Self::Bytes(bytes)
    }
}

impl From<Vec<u8>> for Content {
    fn from(bytes: Vec<u8>) -> Self {
        Self::Bytes(Bytes::from(bytes))
    }
}

#[derive(Debug, Clone, Default)]
pub struct PutOptions {
    pub content_type: Option<String>,
}

impl PutOptions {
    pub fn content_type(content_type: impl Into<String>) -> Self {
        Self {
            content_type: Some(content_type.into()),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct UrlOptions {
    /// Lifetime of a signed URL; backends serving public URLs ignore it.
    pub expires_in: Option<Duration>,
}

#[derive(Debug, Clone)]
pub struct PresignOptions {
    pub expires_in: Duration,
    pub content_type: Option<String>,
    pub content_length: Option<i64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PresignedUpload {
    pub url: String,
    pub headers: Vec<UploadHeader>,
    pub expires_in_seconds: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct UploadHeader {
    pub name: String,
    pub value: String,
}

#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    #[error("operation not supported")]
    NotSupported,
    #[error("object not found: {0}")]
    NotFound(String),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl From<io::Error> for BackendError {
    fn from(err: io::Error) -> Self {
        Self::Other(err.into())
    }
}

#[async_trait]
pub trait StorageBackend: Send + Sync {
    fn adapter(&self) -> &'static str;

    /// Write an object, returning the number of bytes stored.
    async fn put(&self, path: &str, content: Content, options: &PutOptions) -> Result<u64, BackendError>;

    async fn get(&self, path: &str) -> Result<Bytes, BackendError>;

    /// Read an object as a stream of bounded chunks.
    async fn open(&self, path: &str) -> Result<ByteStream, BackendError>;

    async fn delete(&self, path: &str) -> Result<(), BackendError>;

    async fn exists(&self, path: &str) -> Result<bool, BackendError>;

    async fn url(&self, path: &str, options: &UrlOptions) -> Result<String, BackendError>;

    async fn presigned_upload_url(
        &self,
        _path: &str,
        _options: &PresignOptions,
    ) -> Result<PresignedUpload, BackendError> {
        Err(BackendError::NotSupported)
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "adapter", rename_all = "lowercase")]
pub enum BackendConfig {
    Local(LocalOptions),
    S3(S3Options),
}

/// Named-backend dispatch with tagged errors and an optional per-operation timeout.
#[derive(Clone)]
pub struct StorageGateway {
    backends: Arc<HashMap<String, Arc<dyn StorageBackend>>>,
    default_backend: String,
    timeout: Option<Duration>,
}

impl StorageGateway {
    pub fn new(default_backend: impl Into<String>) -> Self {
        Self {
            backends: Arc::new(HashMap::new()),
            default_backend: default_backend.into(),
            timeout: None,
        }
    }

    pub async fn from_config(
        default_backend: &str,
        configs: &BTreeMap<String, BackendConfig>,
        timeout: Option<Duration>,
    ) -> anyhow::Result<Self> {
        if !configs.contains_key(default_backend) {
            return Err(anyhow!("default backend {} is not configured", default_backend));
        }

        let mut gateway = Self::new(default_backend).with_timeout(timeout);
        for (name, config) in configs {
            let backend: Arc<dyn StorageBackend> = match config {
                BackendConfig::Local(options) => Arc::new(LocalDisk::new(options.clone())),
                BackendConfig::S3(options) => Arc::new(S3Storage::new(options).await?),
            };
            debug!(backend = %name, adapter = backend.adapter(), "storage backend configured");
            gateway = gateway.with_backend(name.clone(), backend);
        }
        Ok(gateway)
    }

    pub fn with_backend(mut self, name: impl Into<String>, backend: Arc<dyn StorageBackend>) -> Self {
        Arc::make_mut(&mut self.backends).insert(name.into(), backend);
        self
    }

    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn default_backend(&self) -> &str {
        &self.default_backend
    }

    pub fn has_backend(&self, name: &str) -> bool {
        self.backends.contains_key(name)
    }

    pub async fn put(
        &self,
        backend: &str,
        path: &str,
        content: Content,
        options: &PutOptions,
    ) -> MediaResult<u64> {
        let target = self.backend(backend, StorageOp::Put)?;
        self.dispatch(StorageOp::Put, backend, target.put(path, content, options))
            .await
    }

    pub async fn get(&self, backend: &str, path: &str) -> MediaResult<Bytes> {
        let target = self.backend(backend, StorageOp::Get)?;
        self.dispatch(StorageOp::Get, backend, target.get(path)).await
    }

    pub async fn open(&self, backend: &str, path: &str) -> MediaResult<ByteStream> {
        let target = self.backend(backend, StorageOp::Get)?;
        self.dispatch(StorageOp::Get, backend, target.open(path)).await
    }

    pub async fn delete(&self, backend: &str, path: &str) -> MediaResult<()> {
        let target = self.backend(backend, StorageOp::Delete)?;
        self.dispatch(StorageOp::Delete, backend, target.delete(path))
            .await
    }

    pub async fn exists(&self, backend: &str, path: &str) -> MediaResult<bool> {
        let target = self.backend(backend, StorageOp::Exists)?;
        self.dispatch(StorageOp::Exists, backend, target.exists(path))
            .await
    }

    pub async fn url(&self, backend: &str, path: &str, options: &UrlOptions) -> MediaResult<String> {
        let target = self.backend(backend, StorageOp::Url)?;
        self.dispatch(StorageOp::Url, backend, target.url(path, options))
            .await
    }

    /// Direct-upload URL; `NotSupported` for backends that cannot sign one.
    pub async fn presigned_upload_url(
        &self,
        backend: &str,
        path: &str,
        options: &PresignOptions,
    ) -> MediaResult<PresignedUpload> {
        let target = self.backend(backend, StorageOp::PresignUpload)?;
        self.dispatch(
            StorageOp::PresignUpload,
            backend,
            target.presigned_upload_url(path, options),
        )
        .await
    }

    fn backend(&self, name: &str, operation: StorageOp) -> MediaResult<&Arc<dyn StorageBackend>> {
        self.backends.get(name).ok_or_else(|| {
            MediaError::Storage(StorageFailure {
                operation,
                backend: name.to_string(),
                cause: anyhow!("unknown storage backend"),
            })
        })
    }

    async fn dispatch<T, F>(&self, operation: StorageOp, backend: &str, fut: F) -> MediaResult<T>
    where
        F: Future<Output = Result<T, BackendError>>,
    {
        let result = match self.timeout {
            Some(limit) => match tokio::time::timeout(limit, fut).await {
                Ok(result) => result,
                Err(_) => {
                    return Err(MediaError::TimedOut {
                        operation: format!("storage {} on {}", operation, backend),
                    })
                }
            },
            None => fut.await,
        };

        result.map_err(|err| match err {
            BackendError::NotSupported => MediaError::NotSupported {
                operation: operation.to_string(),
                backend: backend.to_string(),
            },
            BackendError::NotFound(path) => MediaError::NotFound(format!("{} on {}", path, backend)),
            BackendError::Other(cause) => MediaError::Storage(StorageFailure {
                operation,
                backend: backend.to_string(),
                cause,
            }),
        })
    }
}

/// Re-split a stream so no chunk exceeds `max`.
pub fn bounded_chunks(stream: ByteStream, max: usize) -> ByteStream {
    stream
        .flat_map(move |chunk| {
            let pieces: Vec<io::Result<Bytes>> = match chunk {
                Ok(mut bytes) => {
                    let mut pieces = Vec::with_capacity(bytes.len() / max.max(1) + 1);
                    while bytes.len() > max {
                        pieces.push(Ok(bytes.split_to(max)));
                    }
                    if !bytes.is_empty() {
                        pieces.push(Ok(bytes));
                    }
                    pieces
                }
                Err(err) => vec![Err(err)],
            };
            stream::iter(pieces)
        })
        .boxed()
}
