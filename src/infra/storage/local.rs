use std::io;
use std::path::{Component, Path, PathBuf};

use anyhow::anyhow;
use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use serde::Deserialize;
use tokio::io::AsyncWriteExt;
use tokio_util::io::ReaderStream;
use url::Url;
use uuid::Uuid;

use super::{BackendError, ByteStream, Content, PutOptions, StorageBackend, UrlOptions, CHUNK_SIZE};

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct LocalOptions {
    pub root: PathBuf,
    /// Public prefix for generated URLs; `file://` URLs are produced without one.
    #[serde(default)]
    pub base_url: Option<String>,
}

/// Objects stored as files under a root directory.
///
/// Writes land in a sibling temp file and are renamed into place once the
/// whole body has been flushed, so readers never see a partial object.
pub struct LocalDisk {
    options: LocalOptions,
}

impl LocalDisk {
    pub fn new(options: LocalOptions) -> Self {
        Self { options }
    }

    pub fn root(&self) -> &Path {
        &self.options.root
    }

    fn resolve(&self, path: &str) -> Result<PathBuf, BackendError> {
        let relative = Path::new(path);
        let safe = relative
            .components()
            .all(|component| matches!(component, Component::Normal(_)));
        if !safe || path.is_empty() {
            return Err(anyhow!("invalid object path: {}", path).into());
        }
        Ok(self.options.root.join(relative))
    }
}

#[async_trait]
impl StorageBackend for LocalDisk {
    fn adapter(&self) -> &'static str {
        "local"
    }

    async fn put(&self, path: &str, content: Content, _options: &PutOptions) -> Result<u64, BackendError> {
        let target = self.resolve(path)?;
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let temp = target.with_file_name(format!(
            ".{}.{}.part",
            target
                .file_name()
                .map(|name| name.to_string_lossy().into_owned())
                .unwrap_or_default(),
            Uuid::new_v4().simple()
        ));

        let written = match write_body(&temp, content).await {
            Ok(written) => written,
            Err(err) => {
                let _ = tokio::fs::remove_file(&temp).await;
                return Err(err.into());
            }
        };

        if let Err(err) = tokio::fs::rename(&temp, &target).await {
            let _ = tokio::fs::remove_file(&temp).await;
            return Err(err.into());
        }
        Ok(written)
    }

    async fn get(&self, path: &str) -> Result<Bytes, BackendError> {
        let target = self.resolve(path)?;
        match tokio::fs::read(&target).await {
            Ok(data) => Ok(Bytes::from(data)),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Err(BackendError::NotFound(path.to_string())),
            Err(err) => Err(err.into()),
        }
    }

    async fn open(&self, path: &str) -> Result<ByteStream, BackendError> {
        let target = self.resolve(path)?;
        match tokio::fs::File::open(&target).await {
            Ok(file) => Ok(ReaderStream::with_capacity(file, CHUNK_SIZE).boxed()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Err(BackendError::NotFound(path.to_string())),
            Err(err) => Err(err.into()),
        }
    }

    async fn delete(&self, path: &str) -> Result<(), BackendError> {
        let target = self.resolve(path)?;
        match tokio::fs::remove_file(&target).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    async fn exists(&self, path: &str) -> Result<bool, BackendError> {
        let target = self.resolve(path)?;
        Ok(tokio::fs::try_exists(&target).await?)
    }

    async fn url(&self, path: &str, _options: &UrlOptions) -> Result<String, BackendError> {
        if let Some(base) = &self.options.base_url {
            return Ok(format!("{}/{}", base.trim_end_matches('/'), path));
        }
        let target = self.resolve(path)?;
        let absolute = if target.is_absolute() {
            target
        } else {
            std::env::current_dir()?.join(target)
        };
        Url::from_file_path(&absolute)
            .map(|url| url.to_string())
            .map_err(|_| anyhow!("cannot build file url for {}", absolute.display()).into())
    }
}

async fn write_body(temp: &Path, content: Content) -> io::Result<u64> {
    let mut file = tokio::fs::File::create(temp).await?;
    let mut written = 0u64;
    let mut body = content.into_stream();
    while let Some(chunk) = body.next().await {
        let chunk = chunk?;
        file.write_all(&chunk).await?;
        written += chunk.len() as u64;
    }
    file.flush().await?;
    file.sync_all().await?;
    Ok(written)
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::stream;
    use futures::TryStreamExt;

    fn disk(dir: &tempfile::TempDir) -> LocalDisk {
        LocalDisk::new(LocalOptions {
            root: dir.path().to_path_buf(),
            base_url: Some("https://cdn.example.test/media/".into()),
        })
    }

    #[tokio::test]
    async fn put_get_round_trip_binary() {
        let dir = tempfile::tempdir().unwrap();
        let disk = disk(&dir);
        let payload: Vec<u8> = (0..=255u8).cycle().take(200_000).collect();

        let written = disk
            .put("gallery/1/a.bin", Content::from(payload.clone()), &PutOptions::default())
            .await
            .unwrap();
        assert_eq!(written, payload.len() as u64);
        assert_eq!(disk.get("gallery/1/a.bin").await.unwrap().as_ref(), payload.as_slice());

        let streamed: Vec<Bytes> = disk.open("gallery/1/a.bin").await.unwrap().try_collect().await.unwrap();
        assert!(streamed.iter().all(|chunk| chunk.len() <= CHUNK_SIZE));
        assert_eq!(streamed.concat(), payload);
    }

    #[tokio::test]
    async fn failed_stream_leaves_nothing_behind() {
        let dir = tempfile::tempdir().unwrap();
        let disk = disk(&dir);
        let body = stream::iter(vec![
            Ok(Bytes::from_static(b"partial")),
            Err(io::Error::new(io::ErrorKind::Other, "boom")),
        ])
        .boxed();

        assert!(disk
            .put("docs/1/x.txt", Content::Stream(body), &PutOptions::default())
            .await
            .is_err());
        assert!(!disk.exists("docs/1/x.txt").await.unwrap());
        let leftovers = std::fs::read_dir(dir.path().join("docs/1")).unwrap().count();
        assert_eq!(leftovers, 0);
    }

    #[tokio::test]
    async fn rejects_escaping_paths() {
        let dir = tempfile::tempdir().unwrap();
        let disk = disk(&dir);
        assert!(disk.get("../etc/passwd").await.is_err());
        assert!(disk.get("/etc/passwd").await.is_err());
    }

    #[tokio::test]
    async fn delete_is_idempotent_and_url_uses_base() {
        let dir = tempfile::tempdir().unwrap();
        let disk = disk(&dir);
        disk.put("a/b.txt", Content::from(b"hi".to_vec()), &PutOptions::default())
            .await
            .unwrap();
        disk.delete("a/b.txt").await.unwrap();
        disk.delete("a/b.txt").await.unwrap();
        assert!(matches!(disk.get("a/b.txt").await, Err(BackendError::NotFound(_))));
        assert_eq!(
            disk.url("a/b.txt", &UrlOptions::default()).await.unwrap(),
            "https://cdn.example.test/media/a/b.txt"
        );
    }

    #[tokio::test]
    async fn presigned_upload_not_supported() {
        let dir = tempfile::tempdir().unwrap();
        let disk = disk(&dir);
        let options = crate::infra::storage::PresignOptions {
            expires_in: std::time::Duration::from_secs(60),
            content_type: None,
            content_length: None,
        };
        assert!(matches!(
            disk.presigned_upload_url("a/b.txt", &options).await,
            Err(BackendError::NotSupported)
        ));
    }
}
