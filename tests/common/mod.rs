#![allow(dead_code)]

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use axum::Router;
use tempfile::TempDir;
use tokio::sync::Barrier;
use uuid::Uuid;

use vellum::app::processor::ImageProcessor;
use vellum::app::registry::StaticRegistry;
use vellum::app::responsive::ResponsivePolicy;
use vellum::domain::collection::{Catalogue, CollectionDefinition, DerivationSpec, FitMode, OutputFormat};
use vellum::app::policy::{Retention, Spare};
use vellum::domain::media::{
    ChecksumAlgorithm, DerivedArtifact, MediaRecord, OwnerRef, RecordChanges, ResponsiveVariant,
};
use vellum::error::MediaResult;
use vellum::infra::memory::InMemoryRepository;
use vellum::infra::repository::MediaRepository;
use vellum::infra::storage::{LocalDisk, LocalOptions, StorageGateway};
use vellum::jobs::pool::WorkerPool;
use vellum::jobs::RetryPolicy;
use vellum::{MediaLibrary, MediaLibraryBuilder};

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

pub const OWNER_TYPE: &str = "post";
pub const BACKEND: &str = "local";
pub const BASE_URL: &str = "https://cdn.vellum.test/media";
pub const AVATAR_FALLBACK: &str = "https://cdn.vellum.test/static/default-avatar.png";

// ---------------------------------------------------------------------------
// TestLibrary: a library over an in-memory repository and a temp directory
// ---------------------------------------------------------------------------

pub struct TestLibrary {
    pub library: MediaLibrary,
    pub repo: Arc<InMemoryRepository>,
    pub root: TempDir,
}

pub struct Options {
    pub processor: Option<Arc<dyn ImageProcessor>>,
    pub checksum: Option<ChecksumAlgorithm>,
    pub responsive: ResponsivePolicy,
    pub derivations: Vec<DerivationSpec>,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            processor: None,
            checksum: Some(ChecksumAlgorithm::Sha256),
            responsive: ResponsivePolicy::Breakpoints { widths: vec![32, 64] },
            derivations: vec![thumb()],
        }
    }
}

impl TestLibrary {
    pub fn new() -> Self {
        Self::with(Options::default())
    }

    pub fn with(options: Options) -> Self {
        let (builder, repo, root) = builder(options, |repo| repo as Arc<dyn MediaRepository>);
        Self {
            library: builder.build(),
            repo,
            root,
        }
    }

    /// Every insert waits until `parties` inserts have happened, so that
    /// concurrent ingests all commit before any of them enforces policy.
    pub fn gated(options: Options, parties: usize) -> Self {
        let gate = Arc::new(Barrier::new(parties));
        let (builder, repo, root) = builder(options, move |inner| {
            Arc::new(GatedRepository { inner, gate }) as Arc<dyn MediaRepository>
        });
        Self {
            library: builder.build(),
            repo,
            root,
        }
    }

    pub fn with_workers(options: Options, concurrency: usize, retry: RetryPolicy) -> (Self, WorkerPool) {
        let (builder, repo, root) = builder(options, |repo| repo as Arc<dyn MediaRepository>);
        let (library, pool) = builder.build_with_workers(concurrency, retry);
        (Self { library, repo, root }, pool)
    }

    pub fn object(&self, path: &str) -> PathBuf {
        self.root.path().join(path)
    }

    pub fn object_exists(&self, path: &str) -> bool {
        self.object(path).is_file()
    }

    /// Every regular file under the storage root, as relative paths.
    pub fn stored_files(&self) -> Vec<String> {
        let mut files = Vec::new();
        collect_files(self.root.path(), self.root.path(), &mut files);
        files.sort();
        files
    }
}

fn builder(
    options: Options,
    wrap: impl FnOnce(Arc<InMemoryRepository>) -> Arc<dyn MediaRepository>,
) -> (MediaLibraryBuilder, Arc<InMemoryRepository>, TempDir) {
    let root = tempfile::tempdir().expect("failed to create storage root");
    let storage = StorageGateway::new(BACKEND).with_backend(
        BACKEND,
        Arc::new(LocalDisk::new(LocalOptions {
            root: root.path().to_path_buf(),
            base_url: Some(BASE_URL.to_string()),
        })),
    );
    let repo = Arc::new(InMemoryRepository::new());

    let mut builder = MediaLibrary::builder(wrap(repo.clone()), storage, Arc::new(registry(options.derivations)))
        .checksum(options.checksum)
        .responsive_policy(options.responsive);
    if let Some(processor) = options.processor {
        builder = builder.processor(processor);
    }
    (builder, repo, root)
}

/// In-memory repository whose inserts rendezvous on a barrier.
struct GatedRepository {
    inner: Arc<InMemoryRepository>,
    gate: Arc<Barrier>,
}

#[async_trait]
impl MediaRepository for GatedRepository {
    async fn insert(&self, record: MediaRecord) -> MediaResult<MediaRecord> {
        let inserted = self.inner.insert(record).await?;
        self.gate.wait().await;
        Ok(inserted)
    }

    async fn get(&self, id: Uuid) -> MediaResult<Option<MediaRecord>> {
        self.inner.get(id).await
    }

    async fn update(&self, id: Uuid, changes: &RecordChanges) -> MediaResult<MediaRecord> {
        self.inner.update(id, changes).await
    }

    async fn delete(&self, id: Uuid) -> MediaResult<bool> {
        self.inner.delete(id).await
    }

    async fn soft_delete(&self, id: Uuid) -> MediaResult<bool> {
        self.inner.soft_delete(id).await
    }

    async fn restore(&self, id: Uuid) -> MediaResult<bool> {
        self.inner.restore(id).await
    }

    async fn list_active(&self, owner: &OwnerRef, collection: &str) -> MediaResult<Vec<MediaRecord>> {
        self.inner.list_active(owner, collection).await
    }

    async fn list_trashed(&self, owner: &OwnerRef, collection: &str) -> MediaResult<Vec<MediaRecord>> {
        self.inner.list_trashed(owner, collection).await
    }

    async fn evict(
        &self,
        owner: &OwnerRef,
        collection: &str,
        spare: Spare,
        retention: Retention,
    ) -> MediaResult<Vec<MediaRecord>> {
        self.inner.evict(owner, collection, spare, retention).await
    }

    async fn reorder(&self, owner: &OwnerRef, collection: &str, ids: &[Uuid]) -> MediaResult<Vec<MediaRecord>> {
        self.inner.reorder(owner, collection, ids).await
    }

    async fn mark_derived(&self, id: Uuid, name: &str, artifact: &DerivedArtifact) -> MediaResult<bool> {
        self.inner.mark_derived(id, name, artifact).await
    }

    async fn set_responsive(&self, id: Uuid, name: &str, variants: &[ResponsiveVariant]) -> MediaResult<bool> {
        self.inner.set_responsive(id, name, variants).await
    }
}

fn collect_files(root: &std::path::Path, dir: &std::path::Path, out: &mut Vec<String>) {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(_) => return,
    };
    for entry in entries.filter_map(Result::ok) {
        let path = entry.path();
        if path.is_dir() {
            collect_files(root, &path, out);
        } else if let Ok(relative) = path.strip_prefix(root) {
            out.push(relative.to_string_lossy().into_owned());
        }
    }
}

// ---------------------------------------------------------------------------
// Catalogue
// ---------------------------------------------------------------------------

pub fn registry(derivations: Vec<DerivationSpec>) -> StaticRegistry {
    StaticRegistry::new().register(
        OWNER_TYPE,
        Catalogue {
            collections: vec![
                CollectionDefinition {
                    single_slot: true,
                    accepts: Some(vec!["image/*".into()]),
                    fallback_url: Some(AVATAR_FALLBACK.into()),
                    ..CollectionDefinition::unrestricted("avatar")
                },
                CollectionDefinition {
                    max_files: Some(3),
                    accepts: Some(vec!["image/png".into(), "image/jpeg".into()]),
                    ..CollectionDefinition::unrestricted("gallery")
                },
                CollectionDefinition {
                    accepts: Some(vec!["application/pdf".into()]),
                    max_size: Some(1024),
                    ..CollectionDefinition::unrestricted("documents")
                },
                CollectionDefinition {
                    verify_content: false,
                    ..CollectionDefinition::unrestricted("imports")
                },
            ],
            derivations,
        },
    )
}

pub fn thumb() -> DerivationSpec {
    spec("thumb", 16, 16, &["gallery", "avatar"])
}

pub fn spec(name: &str, width: u32, height: u32, collections: &[&str]) -> DerivationSpec {
    DerivationSpec {
        name: name.to_string(),
        width: Some(width),
        height: Some(height),
        fit: FitMode::Cover,
        quality: 80,
        format: OutputFormat::Png,
        collections: collections.iter().map(|name| name.to_string()).collect(),
        responsive: false,
    }
}

pub fn owner(id: &str) -> OwnerRef {
    OwnerRef::new(OWNER_TYPE, id)
}

// ---------------------------------------------------------------------------
// Fixtures
// ---------------------------------------------------------------------------

/// A solid-colour PNG of the given size.
#[cfg(feature = "raster")]
pub fn png(width: u32, height: u32) -> Vec<u8> {
    use image::{DynamicImage, ImageFormat, Rgb, RgbImage};

    let image = RgbImage::from_pixel(width, height, Rgb([30, 120, 200]));
    let mut bytes = std::io::Cursor::new(Vec::new());
    DynamicImage::ImageRgb8(image)
        .write_to(&mut bytes, ImageFormat::Png)
        .expect("failed to encode png");
    bytes.into_inner()
}

/// Minimal bytes the sniffer recognises as PDF.
pub fn pdf(len: usize) -> Vec<u8> {
    let mut bytes = b"%PDF-1.7\n".to_vec();
    bytes.resize(len.max(bytes.len()), b' ');
    bytes
}

// ---------------------------------------------------------------------------
// HTTP fixture server
// ---------------------------------------------------------------------------

/// Serve `router` on an ephemeral port for the rest of the test.
pub async fn serve(router: Router) -> SocketAddr {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("failed to bind fixture server");
    let addr = listener.local_addr().expect("fixture server has no address");
    tokio::spawn(async move {
        axum::serve(listener, router).await.ok();
    });
    addr
}
