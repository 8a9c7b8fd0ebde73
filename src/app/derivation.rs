use std::sync::Arc;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::app::processor::{ImageProcessor, Rendered};
use crate::app::registry::CatalogueCache;
use crate::app::responsive::{self, ResponsivePolicy};
use crate::domain::collection::{DerivationSpec, OutputFormat};
use crate::domain::media::{DerivedArtifact, MediaRecord, ResponsiveVariant};
use crate::error::{MediaError, MediaResult};
use crate::infra::repository::MediaRepository;
use crate::infra::storage::{Content, PutOptions, StorageGateway};
use crate::jobs::JobSubmitter;

/// Key under which responsive variants of the original are recorded.
pub const ORIGINAL: &str = "original";

const ORIGINAL_QUALITY: u8 = 90;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DerivationJob {
    pub media_id: Uuid,
    pub owner_type: String,
    /// `None` runs every derivation that applies to the record's collection.
    #[serde(default)]
    pub names: Option<Vec<String>>,
    #[serde(default)]
    pub responsive: bool,
}

impl DerivationJob {
    /// Follow-up job covering only what failed in `report`.
    pub fn retry_for(&self, report: &DerivationReport) -> Self {
        let failed = report.failed_names();
        Self {
            media_id: self.media_id,
            owner_type: self.owner_type.clone(),
            responsive: self.responsive && failed.iter().any(|name| name == ORIGINAL),
            names: Some(failed),
        }
    }

    fn wants(&self, name: &str) -> bool {
        self.names
            .as_ref()
            .map_or(true, |names| names.iter().any(|candidate| candidate == name))
    }
}

#[derive(Debug, Default)]
pub struct DerivationReport {
    pub completed: Vec<String>,
    pub failed: Vec<(String, MediaError)>,
    /// The record was gone when the job ran.
    pub discarded: bool,
}

impl DerivationReport {
    pub fn is_success(&self) -> bool {
        self.failed.is_empty()
    }

    pub fn failed_names(&self) -> Vec<String> {
        self.failed.iter().map(|(name, _)| name.clone()).collect()
    }
}

/// How scheduled derivations are run.
#[derive(Clone)]
pub enum Dispatch {
    /// On the caller's task, before `schedule` returns.
    Inline,
    /// Handed to a job submitter and processed by workers.
    Queued(Arc<dyn JobSubmitter>),
}

/// Generates derived artifacts for stored originals.
pub struct DerivationEngine {
    repo: Arc<dyn MediaRepository>,
    storage: StorageGateway,
    catalogues: Arc<CatalogueCache>,
    processor: Arc<dyn ImageProcessor>,
    responsive: ResponsivePolicy,
    dispatch: Dispatch,
}

impl DerivationEngine {
    pub fn new(
        repo: Arc<dyn MediaRepository>,
        storage: StorageGateway,
        catalogues: Arc<CatalogueCache>,
        processor: Arc<dyn ImageProcessor>,
    ) -> Self {
        Self {
            repo,
            storage,
            catalogues,
            processor,
            responsive: ResponsivePolicy::default(),
            dispatch: Dispatch::Inline,
        }
    }

    pub fn with_dispatch(mut self, dispatch: Dispatch) -> Self {
        self.dispatch = dispatch;
        self
    }

    pub fn with_responsive_policy(mut self, policy: ResponsivePolicy) -> Self {
        self.responsive = policy;
        self
    }

    /// Derivations declared for the record's owner type and collection,
    /// narrowed to `names` when given.
    pub fn specs_for(&self, record: &MediaRecord, names: Option<&[String]>) -> MediaResult<Vec<DerivationSpec>> {
        let catalogue = self.catalogues.resolve(&record.owner.owner_type)?;
        Ok(catalogue.derivations_for(&record.collection, names))
    }

    /// Run inline or submit a job, depending on the dispatch mode.
    pub async fn schedule(&self, record: &MediaRecord, names: Option<&[String]>, responsive: bool) -> MediaResult<()> {
        let specs = self.specs_for(record, names)?;
        let responsive = responsive && self.processor_handles(&record.mime_type);
        if specs.is_empty() && !responsive {
            return Ok(());
        }

        let job = DerivationJob {
            media_id: record.id,
            owner_type: record.owner.owner_type.clone(),
            names: names.map(<[String]>::to_vec),
            responsive,
        };

        match &self.dispatch {
            Dispatch::Inline => {
                let report = self.execute(&job).await?;
                for (name, err) in &report.failed {
                    warn!(media_id = %record.id, derivation = %name, error = %err, "inline derivation failed");
                }
                Ok(())
            }
            Dispatch::Queued(submitter) => {
                submitter.submit(job).await?;
                debug!(media_id = %record.id, "derivation job submitted");
                Ok(())
            }
        }
    }

    /// Worker entry point. Failures of individual derivations are collected in
    /// the report; only a failure to load the record, catalogue or original
    /// fails the whole job.
    pub async fn execute(&self, job: &DerivationJob) -> MediaResult<DerivationReport> {
        let mut report = DerivationReport::default();

        let record = match self.repo.get(job.media_id).await? {
            Some(record) => record,
            None => {
                debug!(media_id = %job.media_id, "media gone, discarding derivation job");
                report.discarded = true;
                return Ok(report);
            }
        };

        let catalogue = self.catalogues.resolve(&job.owner_type)?;
        let specs = catalogue.derivations_for(&record.collection, job.names.as_deref());
        let responsive = job.responsive && job.wants(ORIGINAL);
        if specs.is_empty() && !responsive {
            return Ok(report);
        }

        let original = self.storage.get(&record.backend, &record.original_path()).await?;

        for spec in &specs {
            match self.derive(&record, &original, spec).await {
                Ok(()) => report.completed.push(spec.name.clone()),
                Err(err) => {
                    warn!(media_id = %record.id, derivation = %spec.name, error = %err, "derivation failed");
                    report.failed.push((spec.name.clone(), err));
                }
            }
        }

        if responsive {
            match self
                .render_responsive(&record, ORIGINAL, original.clone(), OutputFormat::Original, ORIGINAL_QUALITY)
                .await
            {
                Ok(_) => report.completed.push(ORIGINAL.to_string()),
                Err(err) => {
                    warn!(media_id = %record.id, error = %err, "responsive variants failed");
                    report.failed.push((ORIGINAL.to_string(), err));
                }
            }
        }

        info!(
            media_id = %record.id,
            completed = report.completed.len(),
            failed = report.failed.len(),
            "derivations processed"
        );
        Ok(report)
    }

    async fn derive(&self, record: &MediaRecord, original: &Bytes, spec: &DerivationSpec) -> MediaResult<()> {
        let processor = self.processor.clone();
        let source = original.clone();
        let plan = spec.clone();
        let rendered = run_blocking(&spec.name, move || processor.derive(&source, &plan)).await?;

        let path = record.derived_path(&spec.name, rendered.extension);
        let bytes = Bytes::from(rendered.bytes);
        self.storage
            .put(
                &record.backend,
                &path,
                Content::Bytes(bytes.clone()),
                &PutOptions::content_type(rendered.mime),
            )
            .await
            .map_err(|err| MediaError::derivation(&spec.name, err))?;

        let mut written = vec![path.clone()];
        if spec.responsive {
            match self
                .render_responsive(record, &spec.name, bytes, spec.format, spec.quality)
                .await?
            {
                Some(variants) => written.extend(variants.into_iter().map(|variant| variant.path)),
                None => {
                    self.discard(record, &written).await;
                    return Ok(());
                }
            }
        }

        let artifact = DerivedArtifact {
            path,
            completed_at: OffsetDateTime::now_utc(),
        };
        if !self.repo.mark_derived(record.id, &spec.name, &artifact).await? {
            self.discard(record, &written).await;
        }
        Ok(())
    }

    /// Remove objects written for a record that was deleted mid-run.
    async fn discard(&self, record: &MediaRecord, paths: &[String]) {
        debug!(media_id = %record.id, objects = paths.len(), "media gone, removing derived objects");
        for path in paths {
            if let Err(err) = self.storage.delete(&record.backend, path).await {
                warn!(error = ?err, media_id = %record.id, path = %path, "failed to delete derived object");
            }
        }
    }

    /// Render and record width variants of `source`. `None` means the record
    /// was gone by the time they were written; the variants are removed.
    async fn render_responsive(
        &self,
        record: &MediaRecord,
        name: &str,
        source: Bytes,
        format: OutputFormat,
        quality: u8,
    ) -> MediaResult<Option<Vec<ResponsiveVariant>>> {
        let processor = self.processor.clone();
        let sample = source.clone();
        let (width, _) = run_blocking(name, move || processor.dimensions(&sample)).await?;

        let mut variants = Vec::new();
        for target in responsive::widths(width, &self.responsive) {
            let processor = self.processor.clone();
            let input = source.clone();
            let rendered: Rendered =
                run_blocking(name, move || processor.resize_to_width(&input, target, format, quality)).await?;

            let file_name = format!("{}.{}", record.stem(), rendered.extension);
            let path = record.responsive_path(name, target, &file_name);
            self.storage
                .put(
                    &record.backend,
                    &path,
                    Content::from(rendered.bytes),
                    &PutOptions::content_type(rendered.mime),
                )
                .await
                .map_err(|err| MediaError::derivation(name, err))?;
            variants.push(ResponsiveVariant { width: target, path });
        }

        if !self.repo.set_responsive(record.id, name, &variants).await? {
            let paths: Vec<String> = variants.into_iter().map(|variant| variant.path).collect();
            self.discard(record, &paths).await;
            return Ok(None);
        }
        Ok(Some(variants))
    }

    fn processor_handles(&self, mime: &str) -> bool {
        mime.starts_with("image/") && mime != "image/svg+xml"
    }
}

async fn run_blocking<T, F>(name: &str, work: F) -> MediaResult<T>
where
    T: Send + 'static,
    F: FnOnce() -> anyhow::Result<T> + Send + 'static,
{
    match tokio::task::spawn_blocking(work).await {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(err)) => Err(MediaError::derivation(name, err)),
        Err(err) => Err(MediaError::derivation(name, err)),
    }
}
