use std::sync::Arc;
use std::time::Duration;

use futures::TryStreamExt;
use serde_json::{Map, Value};
use tracing::info;
use uuid::Uuid;

use crate::app::checksum::ChecksumStream;
use crate::app::derivation::DerivationEngine;
use crate::app::ingest::{sanitize_file_name, IngestBuilder, IngestionPipeline};
use crate::app::policy::purge_objects;
use crate::app::registry::CatalogueCache;
use crate::app::source::Source;
use crate::domain::media::{self, MediaRecord, OwnerRef, RecordChanges};
use crate::error::{IntegrityError, MediaError, MediaResult, StorageFailure, StorageOp};
use crate::infra::repository::MediaRepository;
use crate::infra::storage::{PresignOptions, PresignedUpload, StorageGateway, UrlOptions};

const DEFAULT_UPLOAD_TTL: Duration = Duration::from_secs(900);

/// Everything a host application does with stored media.
#[derive(Clone)]
pub struct MediaService {
    repo: Arc<dyn MediaRepository>,
    storage: StorageGateway,
    catalogues: Arc<CatalogueCache>,
    pipeline: IngestionPipeline,
    derivations: Arc<DerivationEngine>,
}

/// Target of a direct-to-storage upload, along with the path the object must
/// be written to.
#[derive(Debug, Clone)]
pub struct UploadTarget {
    pub backend: String,
    pub path: String,
    pub storage_name: String,
    pub upload: PresignedUpload,
}

impl MediaService {
    pub fn new(
        repo: Arc<dyn MediaRepository>,
        storage: StorageGateway,
        catalogues: Arc<CatalogueCache>,
        pipeline: IngestionPipeline,
        derivations: Arc<DerivationEngine>,
    ) -> Self {
        Self {
            repo,
            storage,
            catalogues,
            pipeline,
            derivations,
        }
    }

    pub fn ingest(&self, owner: OwnerRef, source: Source) -> IngestBuilder<'_> {
        self.pipeline.ingest(owner, source)
    }

    pub async fn get(&self, id: Uuid) -> MediaResult<MediaRecord> {
        self.repo
            .get(id)
            .await?
            .ok_or_else(|| MediaError::not_found(format!("media {}", id)))
    }

    /// Active records in display order.
    pub async fn list(&self, owner: &OwnerRef, collection: &str) -> MediaResult<Vec<MediaRecord>> {
        self.repo.list_active(owner, collection).await
    }

    pub async fn list_trashed(&self, owner: &OwnerRef, collection: &str) -> MediaResult<Vec<MediaRecord>> {
        self.repo.list_trashed(owner, collection).await
    }

    /// Hide a record from listings. Objects stay in storage until the record
    /// is deleted permanently.
    pub async fn soft_delete(&self, id: Uuid) -> MediaResult<()> {
        if self.repo.soft_delete(id).await? {
            info!(media_id = %id, "media moved to trash");
            Ok(())
        } else {
            Err(MediaError::not_found(format!("active media {}", id)))
        }
    }

    /// Bring a trashed record back. The collection's retention rules are
    /// re-applied with the restored record kept, so restoring into a full
    /// collection evicts the oldest of the others.
    pub async fn restore(&self, id: Uuid) -> MediaResult<MediaRecord> {
        if !self.repo.restore(id).await? {
            return Err(MediaError::not_found(format!("trashed media {}", id)));
        }
        let record = self.get(id).await?;
        let collection = self
            .catalogues
            .collection(&record.owner.owner_type, &record.collection)?;
        self.pipeline.policy().enforce_keeping(&record, &collection).await?;
        info!(media_id = %id, "media restored");
        Ok(record)
    }

    /// Remove the record and every object it references.
    pub async fn delete_permanently(&self, id: Uuid) -> MediaResult<()> {
        let record = self.get(id).await?;
        self.repo.delete(id).await?;
        purge_objects(&self.storage, &record).await;
        info!(media_id = %id, "media deleted");
        Ok(())
    }

    /// Apply a caller-chosen order. Listed ids come first in the given order;
    /// unlisted active records follow in their previous order.
    pub async fn reorder(&self, owner: &OwnerRef, collection: &str, ids: &[Uuid]) -> MediaResult<Vec<MediaRecord>> {
        self.repo.reorder(owner, collection, ids).await
    }

    pub async fn update_custom_properties(
        &self,
        id: Uuid,
        properties: Map<String, Value>,
    ) -> MediaResult<MediaRecord> {
        let changes = RecordChanges {
            custom_properties: Some(properties),
            ..RecordChanges::default()
        };
        self.repo.update(id, &changes).await
    }

    /// URL of the original, or of a completed derivation when `derivation`
    /// is given.
    pub async fn url(
        &self,
        record: &MediaRecord,
        derivation: Option<&str>,
        options: &UrlOptions,
    ) -> MediaResult<String> {
        let path = match derivation {
            None => record.original_path(),
            Some(name) => record
                .derived
                .get(name)
                .map(|artifact| artifact.path.clone())
                .ok_or_else(|| MediaError::not_found(format!("derivation {} of media {}", name, record.id)))?,
        };
        self.storage.url(&record.backend, &path, options).await
    }

    /// URL of the first active record, falling back to the collection's
    /// configured fallback URL.
    pub async fn first_url(
        &self,
        owner: &OwnerRef,
        collection: &str,
        derivation: Option<&str>,
    ) -> MediaResult<Option<String>> {
        let first = self.repo.list_active(owner, collection).await?.into_iter().next();
        match first {
            Some(record) => {
                let url = self.url(&record, derivation, &UrlOptions::default()).await;
                match url {
                    Ok(url) => Ok(Some(url)),
                    Err(MediaError::NotFound(_)) => Ok(self.fallback_url(owner, collection)?),
                    Err(err) => Err(err),
                }
            }
            None => Ok(self.fallback_url(owner, collection)?),
        }
    }

    fn fallback_url(&self, owner: &OwnerRef, collection: &str) -> MediaResult<Option<String>> {
        Ok(self
            .catalogues
            .collection(&owner.owner_type, collection)?
            .fallback_url)
    }

    /// Signed URL a client can upload an original to directly. The caller
    /// records the object once the upload has completed.
    pub async fn presigned_upload_url(
        &self,
        owner: &OwnerRef,
        collection: &str,
        file_name: &str,
        content_type: Option<String>,
        expires_in: Option<Duration>,
    ) -> MediaResult<UploadTarget> {
        let definition = self.catalogues.collection(&owner.owner_type, collection)?;
        let backend = definition
            .backend
            .clone()
            .unwrap_or_else(|| self.storage.default_backend().to_string());
        let storage_name = format!("{}-{}", Uuid::new_v4().simple(), sanitize_file_name(file_name));
        let path = media::original_path(&definition.name, &owner.owner_id, &storage_name);

        let options = PresignOptions {
            expires_in: expires_in.unwrap_or(DEFAULT_UPLOAD_TTL),
            content_type,
            content_length: None,
        };
        let upload = self.storage.presigned_upload_url(&backend, &path, &options).await?;
        Ok(UploadTarget {
            backend,
            path,
            storage_name,
            upload,
        })
    }

    /// Re-read the original and compare it with the recorded checksum.
    pub async fn verify_integrity(&self, record: &MediaRecord) -> MediaResult<()> {
        let (expected, algorithm) = match (&record.checksum, record.checksum_algorithm) {
            (Some(expected), Some(algorithm)) => (expected, algorithm),
            _ => return Err(MediaError::Integrity(IntegrityError::MissingChecksum)),
        };

        let mut checksum = ChecksumStream::new(algorithm);
        let mut body = self.storage.open(&record.backend, &record.original_path()).await?;
        while let Some(chunk) = body.try_next().await.map_err(|err| {
            MediaError::Storage(StorageFailure {
                operation: StorageOp::Get,
                backend: record.backend.clone(),
                cause: err.into(),
            })
        })? {
            checksum.update(&chunk);
        }

        let actual = checksum.finalize().hex;
        if actual.eq_ignore_ascii_case(expected) {
            Ok(())
        } else {
            Err(MediaError::Integrity(IntegrityError::Mismatch {
                expected: expected.clone(),
                actual,
            }))
        }
    }

    /// Re-run derivations for a record, all of them or only `names`.
    pub async fn regenerate(&self, record: &MediaRecord, names: Option<&[String]>) -> MediaResult<()> {
        self.derivations
            .schedule(record, names, !record.responsive.is_empty())
            .await
    }
}
