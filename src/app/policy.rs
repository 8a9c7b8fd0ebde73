use std::collections::HashSet;
use std::sync::Arc;

use tracing::{info, warn};
use uuid::Uuid;

use crate::domain::collection::CollectionDefinition;
use crate::domain::media::MediaRecord;
use crate::error::MediaResult;
use crate::infra::repository::MediaRepository;
use crate::infra::storage::StorageGateway;

/// Lifecycle rule applied to the active records of one (owner, collection).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Retention {
    Unbounded,
    SingleSlot,
    MaxCount(usize),
}

impl Retention {
    pub fn for_collection(collection: &CollectionDefinition) -> Self {
        if collection.single_slot {
            Self::SingleSlot
        } else if let Some(max) = collection.max_files {
            Self::MaxCount(max)
        } else {
            Self::Unbounded
        }
    }
}

/// Which active record survives eviction regardless of its age.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Spare {
    /// The most recently inserted record. Used after ingest, so overlapping
    /// ingests into one group agree on the survivor.
    Newest,
    /// A specific record, e.g. one just restored from the trash.
    Record(Uuid),
}

/// Ids to evict from `active`, which must be in insertion order.
///
/// Victims are taken oldest first, so for a max-count rule the newest `max`
/// survive. A spared record is never selected; when it is no longer active
/// nothing is evicted.
pub fn select_victims(active: &[MediaRecord], spare: Spare, retention: Retention) -> Vec<Uuid> {
    let spared = match spare {
        Spare::Newest => match active.last() {
            Some(record) => record.id,
            None => return Vec::new(),
        },
        Spare::Record(id) if active.iter().any(|record| record.id == id) => id,
        Spare::Record(_) => return Vec::new(),
    };

    match retention {
        Retention::Unbounded => Vec::new(),
        Retention::SingleSlot => active
            .iter()
            .filter(|record| record.id != spared)
            .map(|record| record.id)
            .collect(),
        Retention::MaxCount(max) => {
            let excess = active.len().saturating_sub(max);
            active
                .iter()
                .filter(|record| record.id != spared)
                .take(excess)
                .map(|record| record.id)
                .collect()
        }
    }
}

/// New ordering for `current`: requested ids that exist, in the requested
/// order, followed by the rest in their existing relative order.
pub fn reorder_sequence(current: &[Uuid], requested: &[Uuid]) -> Vec<Uuid> {
    let present: HashSet<Uuid> = current.iter().copied().collect();
    let mut seen = HashSet::with_capacity(current.len());
    let mut sequence = Vec::with_capacity(current.len());

    for id in requested {
        if present.contains(id) && seen.insert(*id) {
            sequence.push(*id);
        }
    }
    for id in current {
        if seen.insert(*id) {
            sequence.push(*id);
        }
    }
    sequence
}

/// Post-commit enforcement of single-slot and max-count rules.
#[derive(Clone)]
pub struct CollectionPolicy {
    repo: Arc<dyn MediaRepository>,
    storage: StorageGateway,
}

impl CollectionPolicy {
    pub fn new(repo: Arc<dyn MediaRepository>, storage: StorageGateway) -> Self {
        Self { repo, storage }
    }

    /// Evict whatever `collection` no longer has room for after `record`
    /// was ingested. The newest active record of the group survives, which
    /// is `record` unless another ingest landed after it.
    pub async fn enforce(
        &self,
        record: &MediaRecord,
        collection: &CollectionDefinition,
    ) -> MediaResult<Vec<MediaRecord>> {
        self.apply(record, collection, Spare::Newest).await
    }

    /// Like [`enforce`](Self::enforce), but `record` itself survives even
    /// though it is older than the rest of the group.
    pub async fn enforce_keeping(
        &self,
        record: &MediaRecord,
        collection: &CollectionDefinition,
    ) -> MediaResult<Vec<MediaRecord>> {
        self.apply(record, collection, Spare::Record(record.id)).await
    }

    async fn apply(
        &self,
        record: &MediaRecord,
        collection: &CollectionDefinition,
        spare: Spare,
    ) -> MediaResult<Vec<MediaRecord>> {
        let retention = Retention::for_collection(collection);
        if retention == Retention::Unbounded {
            return Ok(Vec::new());
        }

        let evicted = self
            .repo
            .evict(&record.owner, &record.collection, spare, retention)
            .await?;

        for victim in &evicted {
            purge_objects(&self.storage, victim).await;
        }

        if !evicted.is_empty() {
            info!(
                media_id = %record.id,
                owner = %record.owner,
                collection = %record.collection,
                evicted = evicted.len(),
                "collection policy evicted media"
            );
        }
        Ok(evicted)
    }
}

/// Best-effort removal of every object a record references.
pub async fn purge_objects(storage: &StorageGateway, record: &MediaRecord) {
    for path in record.all_paths() {
        if let Err(err) = storage.delete(&record.backend, &path).await {
            warn!(error = ?err, media_id = %record.id, path = %path, "failed to delete media object");
        }
    }
}
