pub mod app;
pub mod config;
pub mod domain;
pub mod error;
pub mod infra;
pub mod jobs;

use std::sync::Arc;

use crate::app::derivation::{DerivationEngine, Dispatch};
use crate::app::ingest::IngestionPipeline;
use crate::app::media::MediaService;
use crate::app::metadata::{ImageMetadata, MetadataExtractor};
use crate::app::processor::{default_processor, ImageProcessor};
use crate::app::registry::{CatalogueCache, Registry};
use crate::app::responsive::ResponsivePolicy;
use crate::domain::media::ChecksumAlgorithm;
use crate::infra::repository::MediaRepository;
use crate::infra::storage::StorageGateway;
use crate::jobs::pool::{InProcessQueue, WorkerPool};
use crate::jobs::{JobSubmitter, RetryPolicy};

/// A fully wired media library.
#[derive(Clone)]
pub struct MediaLibrary {
    pub media: MediaService,
    pub derivations: Arc<DerivationEngine>,
    pub catalogues: Arc<CatalogueCache>,
    pub storage: StorageGateway,
    pub repo: Arc<dyn MediaRepository>,
}

impl MediaLibrary {
    pub fn builder(
        repo: Arc<dyn MediaRepository>,
        storage: StorageGateway,
        registry: Arc<dyn Registry>,
    ) -> MediaLibraryBuilder {
        MediaLibraryBuilder {
            repo,
            storage,
            registry,
            processor: None,
            metadata: None,
            checksum: Some(ChecksumAlgorithm::default()),
            responsive: ResponsivePolicy::default(),
            submitter: None,
            http: None,
        }
    }
}

pub struct MediaLibraryBuilder {
    repo: Arc<dyn MediaRepository>,
    storage: StorageGateway,
    registry: Arc<dyn Registry>,
    processor: Option<Arc<dyn ImageProcessor>>,
    metadata: Option<Arc<dyn MetadataExtractor>>,
    checksum: Option<ChecksumAlgorithm>,
    responsive: ResponsivePolicy,
    submitter: Option<Arc<dyn JobSubmitter>>,
    http: Option<reqwest::Client>,
}

impl MediaLibraryBuilder {
    pub fn processor(mut self, processor: Arc<dyn ImageProcessor>) -> Self {
        self.processor = Some(processor);
        self
    }

    pub fn metadata(mut self, metadata: Arc<dyn MetadataExtractor>) -> Self {
        self.metadata = Some(metadata);
        self
    }

    /// `None` stores originals without a checksum.
    pub fn checksum(mut self, algorithm: Option<ChecksumAlgorithm>) -> Self {
        self.checksum = algorithm;
        self
    }

    pub fn responsive_policy(mut self, policy: ResponsivePolicy) -> Self {
        self.responsive = policy;
        self
    }

    /// Send derivations to `submitter` instead of running them inline.
    pub fn submitter(mut self, submitter: Arc<dyn JobSubmitter>) -> Self {
        self.submitter = Some(submitter);
        self
    }

    pub fn http_client(mut self, client: reqwest::Client) -> Self {
        self.http = Some(client);
        self
    }

    /// Derivations run inline unless a submitter was configured.
    pub fn build(self) -> MediaLibrary {
        let dispatch = match self.submitter.clone() {
            Some(submitter) => Dispatch::Queued(submitter),
            None => Dispatch::Inline,
        };
        self.assemble(dispatch)
    }

    /// Derivations run on an in-process pool of `concurrency` workers.
    pub fn build_with_workers(self, concurrency: usize, retry: RetryPolicy) -> (MediaLibrary, WorkerPool) {
        let (queue, receiver) = InProcessQueue::channel();
        let library = self.assemble(Dispatch::Queued(Arc::new(queue)));
        let pool = WorkerPool::spawn(library.derivations.clone(), receiver, concurrency, retry);
        (library, pool)
    }

    fn assemble(self, dispatch: Dispatch) -> MediaLibrary {
        let processor = self.processor.unwrap_or_else(default_processor);
        let metadata = self
            .metadata
            .unwrap_or_else(|| Arc::new(ImageMetadata::new(processor.clone())));
        let catalogues = Arc::new(CatalogueCache::new(self.registry));

        let derivations = Arc::new(
            DerivationEngine::new(self.repo.clone(), self.storage.clone(), catalogues.clone(), processor)
                .with_responsive_policy(self.responsive)
                .with_dispatch(dispatch),
        );
        let pipeline = IngestionPipeline::new(
            self.repo.clone(),
            self.storage.clone(),
            catalogues.clone(),
            derivations.clone(),
            metadata,
            self.http.unwrap_or_default(),
            self.checksum,
        );
        let media = MediaService::new(
            self.repo.clone(),
            self.storage.clone(),
            catalogues.clone(),
            pipeline,
            derivations.clone(),
        );

        MediaLibrary {
            media,
            derivations,
            catalogues,
            storage: self.storage,
            repo: self.repo,
        }
    }
}
