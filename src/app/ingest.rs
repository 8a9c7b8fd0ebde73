use std::io;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use futures::StreamExt;
use serde_json::{Map, Value};
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::app::checksum::ChecksumStream;
use crate::app::derivation::DerivationEngine;
use crate::app::metadata::MetadataExtractor;
use crate::app::policy::CollectionPolicy;
use crate::app::registry::CatalogueCache;
use crate::app::sniffer::{self, Classification, Verification, SAMPLE_LEN};
use crate::app::source::{self, Source};
use crate::domain::collection::CollectionDefinition;
use crate::domain::media::{self, ChecksumAlgorithm, MediaRecord, OwnerRef};
use crate::error::{MediaError, MediaResult, Rejection};
use crate::infra::repository::MediaRepository;
use crate::infra::storage::{bounded_chunks, ByteStream, Content, PutOptions, StorageGateway, CHUNK_SIZE};

const OCTET_STREAM: &str = "application/octet-stream";

/// Custom property recording where a remote source was fetched from.
pub const SOURCE_URL_PROPERTY: &str = "source_url";

/// Per-call overrides for [`IngestBuilder::finalize`].
#[derive(Debug, Clone, Default)]
pub struct FinalizeOptions {
    /// Storage backend; defaults to the collection's, then the gateway's.
    pub backend: Option<String>,
    /// Restrict scheduled derivations to these names.
    pub derivations: Option<Vec<String>>,
    /// Applies to the remote fetch and every storage call of this ingestion.
    pub timeout: Option<Duration>,
}

/// Source → stored object → persisted record → policy → derivations.
#[derive(Clone)]
pub struct IngestionPipeline {
    repo: Arc<dyn MediaRepository>,
    storage: StorageGateway,
    catalogues: Arc<CatalogueCache>,
    policy: CollectionPolicy,
    derivations: Arc<DerivationEngine>,
    metadata: Arc<dyn MetadataExtractor>,
    http: reqwest::Client,
    checksum: Option<ChecksumAlgorithm>,
}

struct IngestRequest {
    owner: OwnerRef,
    source: Source,
    file_name: Option<String>,
    custom_properties: Map<String, Value>,
    extract_metadata: bool,
    responsive: bool,
}

/// Accumulates ingestion options; nothing happens until `finalize`.
pub struct IngestBuilder<'a> {
    pipeline: &'a IngestionPipeline,
    request: IngestRequest,
}

impl<'a> IngestBuilder<'a> {
    /// Override the client-facing file name.
    pub fn file_name(mut self, name: impl Into<String>) -> Self {
        self.request.file_name = Some(name.into());
        self
    }

    pub fn custom_property(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.request.custom_properties.insert(key.into(), value.into());
        self
    }

    pub fn custom_properties(mut self, properties: Map<String, Value>) -> Self {
        self.request.custom_properties.extend(properties);
        self
    }

    pub fn without_metadata(mut self) -> Self {
        self.request.extract_metadata = false;
        self
    }

    /// Also generate width variants of the original.
    pub fn with_responsive_images(mut self) -> Self {
        self.request.responsive = true;
        self
    }

    pub async fn finalize(self, collection: &str, options: FinalizeOptions) -> MediaResult<MediaRecord> {
        self.pipeline.finalize(self.request, collection, options).await
    }
}

#[derive(Default)]
struct Tally {
    bytes: u64,
    checksum: Option<ChecksumStream>,
    exceeded: Option<u64>,
}

impl IngestionPipeline {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        repo: Arc<dyn MediaRepository>,
        storage: StorageGateway,
        catalogues: Arc<CatalogueCache>,
        derivations: Arc<DerivationEngine>,
        metadata: Arc<dyn MetadataExtractor>,
        http: reqwest::Client,
        checksum: Option<ChecksumAlgorithm>,
    ) -> Self {
        Self {
            policy: CollectionPolicy::new(repo.clone(), storage.clone()),
            repo,
            storage,
            catalogues,
            derivations,
            metadata,
            http,
            checksum,
        }
    }

    pub fn policy(&self) -> &CollectionPolicy {
        &self.policy
    }

    pub fn ingest(&self, owner: OwnerRef, source: Source) -> IngestBuilder<'_> {
        IngestBuilder {
            pipeline: self,
            request: IngestRequest {
                owner,
                source,
                file_name: None,
                custom_properties: Map::new(),
                extract_metadata: true,
                responsive: false,
            },
        }
    }

    async fn finalize(
        &self,
        request: IngestRequest,
        collection_name: &str,
        options: FinalizeOptions,
    ) -> MediaResult<MediaRecord> {
        let IngestRequest {
            owner,
            source,
            file_name,
            mut custom_properties,
            extract_metadata,
            responsive,
        } = request;

        let collection = self.catalogues.collection(&owner.owner_type, collection_name)?;
        let storage = match options.timeout {
            Some(limit) => self.storage.clone().with_timeout(Some(limit)),
            None => self.storage.clone(),
        };

        let resolved = source::resolve(source, &self.http, options.timeout).await?;
        if let Some(url) = &resolved.origin_url {
            custom_properties.insert(SOURCE_URL_PROPERTY.to_string(), Value::String(url.clone()));
        }
        let file_name = sanitize_file_name(file_name.as_deref().unwrap_or(&resolved.file_name));

        let (header, body) = source::sample_header(resolved.body, SAMPLE_LEN)
            .await
            .map_err(read_error)?;

        let detected = sniffer::detect(&header);
        let mime = classify(&collection, resolved.declared_mime.as_deref(), detected)?;

        if let (Some(limit), Some(size)) = (collection.max_size, resolved.size_hint) {
            if size > limit {
                return Err(MediaError::TooLarge { actual: size, limit });
            }
        }

        let mut metadata = Map::new();
        if extract_metadata {
            let sample = resolved.buffered.as_deref().unwrap_or(&header);
            match self.metadata.extract(&mime, sample) {
                Ok(extracted) => {
                    metadata.extend(extracted);
                    if let Ok(now) = OffsetDateTime::now_utc().format(&Rfc3339) {
                        metadata.insert("extracted_at".to_string(), Value::String(now));
                    }
                }
                Err(err) => warn!(owner = %owner, mime = %mime, error = %err, "metadata extraction failed"),
            }
        }

        let id = Uuid::new_v4();
        let storage_name = storage_name(id, &file_name, detected);
        let backend = options
            .backend
            .or_else(|| collection.backend.clone())
            .unwrap_or_else(|| storage.default_backend().to_string());
        let path = media::original_path(&collection.name, &owner.owner_id, &storage_name);

        let tally = Arc::new(Mutex::new(Tally {
            checksum: self.checksum.map(ChecksumStream::new),
            ..Tally::default()
        }));
        let metered = meter(bounded_chunks(body, CHUNK_SIZE), tally.clone(), collection.max_size);

        let written = match storage
            .put(&backend, &path, Content::Stream(metered), &PutOptions::content_type(&mime))
            .await
        {
            Ok(written) => written,
            Err(err) => {
                discard(&storage, &backend, &path).await;
                let tally = tally.lock().unwrap_or_else(PoisonError::into_inner);
                if let Some(limit) = tally.exceeded {
                    return Err(MediaError::TooLarge {
                        actual: tally.bytes,
                        limit,
                    });
                }
                return Err(surface_timeout(err));
            }
        };

        let checksum = tally
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .checksum
            .take()
            .map(ChecksumStream::finalize);
        debug!(path = %path, backend = %backend, bytes = written, "original stored");

        let now = OffsetDateTime::now_utc();
        let record = MediaRecord {
            id,
            owner,
            collection: collection.name.clone(),
            file_name,
            storage_name,
            mime_type: mime,
            backend: backend.clone(),
            size: written as i64,
            checksum: checksum.as_ref().map(|checksum| checksum.hex.clone()),
            checksum_algorithm: checksum.as_ref().map(|checksum| checksum.algorithm),
            custom_properties,
            metadata,
            derived: Default::default(),
            responsive: Default::default(),
            order_index: 0,
            deleted_at: None,
            created_at: now,
            updated_at: now,
        };

        let record = match self.repo.insert(record).await {
            Ok(record) => record,
            Err(err) => {
                discard(&storage, &backend, &path).await;
                return Err(err);
            }
        };
        info!(
            media_id = %record.id,
            owner = %record.owner,
            collection = %record.collection,
            size = record.size,
            mime = %record.mime_type,
            "media ingested"
        );

        self.policy.enforce(&record, &collection).await?;

        if let Err(err) = self
            .derivations
            .schedule(&record, options.derivations.as_deref(), responsive)
            .await
        {
            warn!(media_id = %record.id, error = %err, "failed to schedule derivations");
        }

        Ok(record)
    }
}

/// Resolve the effective type and apply the collection's verification and
/// accept rules to it.
fn classify(
    collection: &CollectionDefinition,
    declared: Option<&str>,
    detected: Option<Classification>,
) -> MediaResult<String> {
    let declared = declared
        .map(sniffer::normalize_mime)
        .filter(|mime| mime != OCTET_STREAM);

    if collection.verify_content {
        if let (Some(declared), Some(detected)) = (declared.as_deref(), detected) {
            if let Verification::Mismatch { detected, declared } = sniffer::verify(declared, detected.mime) {
                return Err(MediaError::ContentRejected(Rejection::Mismatch { detected, declared }));
            }
        }
    }

    let mime = detected
        .map(|classification| classification.mime.to_string())
        .or(declared)
        .unwrap_or_else(|| OCTET_STREAM.to_string());

    if !collection.accepts_mime(&mime) {
        return Err(MediaError::ContentRejected(Rejection::NotAccepted {
            mime,
            collection: collection.name.clone(),
        }));
    }
    Ok(mime)
}

/// Counts bytes, enforces the size ceiling and feeds the checksum in the
/// same pass as the upload.
fn meter(body: ByteStream, tally: Arc<Mutex<Tally>>, limit: Option<u64>) -> ByteStream {
    body.map(move |chunk| {
        let chunk = chunk?;
        let mut tally = tally.lock().unwrap_or_else(PoisonError::into_inner);
        tally.bytes += chunk.len() as u64;
        if let Some(limit) = limit {
            if tally.bytes > limit {
                tally.exceeded = Some(limit);
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("content exceeds {} bytes", limit),
                ));
            }
        }
        if let Some(checksum) = tally.checksum.as_mut() {
            checksum.update(&chunk);
        }
        Ok(chunk)
    })
    .boxed()
}

async fn discard(storage: &StorageGateway, backend: &str, path: &str) {
    if let Err(err) = storage.delete(backend, path).await {
        warn!(backend, path, error = %err, "failed to remove partial object");
    }
}

fn read_error(err: io::Error) -> MediaError {
    if err.kind() == io::ErrorKind::TimedOut {
        MediaError::TimedOut {
            operation: "source read".to_string(),
        }
    } else {
        MediaError::InvalidSource(format!("failed to read source: {}", err))
    }
}

/// A source stream that timed out mid-upload surfaces as a storage failure;
/// report it as the timeout it is.
fn surface_timeout(err: MediaError) -> MediaError {
    if let MediaError::Storage(failure) = &err {
        let timed_out = failure.cause.chain().any(|cause| {
            cause
                .downcast_ref::<io::Error>()
                .map_or(false, |io| io.kind() == io::ErrorKind::TimedOut)
        });
        if timed_out {
            return MediaError::TimedOut {
                operation: "source read".to_string(),
            };
        }
    }
    err
}

/// Keep the final path component, restricted to a portable character set.
pub fn sanitize_file_name(raw: &str) -> String {
    let last = raw.rsplit(|c| c == '/' || c == '\\').next().unwrap_or(raw);
    let cleaned: String = last
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_') {
                c
            } else {
                '-'
            }
        })
        .collect();
    let cleaned = cleaned.trim_start_matches('.').to_string();
    if cleaned.is_empty() {
        "file".to_string()
    } else {
        cleaned
    }
}

/// Unique per-record name. The sniffed extension is appended when the
/// client's name has none.
fn storage_name(id: Uuid, file_name: &str, detected: Option<Classification>) -> String {
    let has_extension = file_name
        .rsplit_once('.')
        .map_or(false, |(stem, ext)| !stem.is_empty() && !ext.is_empty());
    match detected {
        Some(classification) if !has_extension => {
            format!("{}-{}.{}", id.simple(), file_name, classification.extension)
        }
        _ => format!("{}-{}", id.simple(), file_name),
    }
}
