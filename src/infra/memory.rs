use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::app::policy::{reorder_sequence, select_victims, Retention, Spare};
use crate::domain::media::{DerivedArtifact, MediaRecord, OwnerRef, RecordChanges, ResponsiveVariant};
use crate::error::{MediaError, MediaResult};
use crate::infra::repository::MediaRepository;

/// Process-local repository. Records are kept in insertion order and every
/// operation runs under one lock, which makes eviction and reordering atomic.
#[derive(Default)]
pub struct InMemoryRepository {
    records: Mutex<Vec<MediaRecord>>,
}

impl InMemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }

    fn records(&self) -> MutexGuard<'_, Vec<MediaRecord>> {
        self.records.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn len(&self) -> usize {
        self.records().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records().is_empty()
    }
}

fn in_group(record: &MediaRecord, owner: &OwnerRef, collection: &str) -> bool {
    record.owner == *owner && record.collection == collection
}

fn sorted_by_order(mut records: Vec<MediaRecord>) -> Vec<MediaRecord> {
    // Stable sort keeps insertion order between equal indexes.
    records.sort_by_key(|record| record.order_index);
    records
}

#[async_trait]
impl MediaRepository for InMemoryRepository {
    async fn insert(&self, mut record: MediaRecord) -> MediaResult<MediaRecord> {
        let mut records = self.records();
        if records.iter().any(|existing| existing.id == record.id) {
            return Err(MediaError::repository(anyhow::anyhow!("duplicate media id {}", record.id)));
        }
        let next = records
            .iter()
            .filter(|existing| in_group(existing, &record.owner, &record.collection))
            .map(|existing| existing.order_index)
            .max()
            .unwrap_or(0)
            + 1;
        record.order_index = next;
        records.push(record.clone());
        Ok(record)
    }

    async fn get(&self, id: Uuid) -> MediaResult<Option<MediaRecord>> {
        Ok(self.records().iter().find(|record| record.id == id).cloned())
    }

    async fn update(&self, id: Uuid, changes: &RecordChanges) -> MediaResult<MediaRecord> {
        let mut records = self.records();
        let record = records
            .iter_mut()
            .find(|record| record.id == id)
            .ok_or_else(|| MediaError::not_found(format!("media {}", id)))?;
        changes.apply(record);
        record.updated_at = OffsetDateTime::now_utc();
        Ok(record.clone())
    }

    async fn delete(&self, id: Uuid) -> MediaResult<bool> {
        let mut records = self.records();
        let before = records.len();
        records.retain(|record| record.id != id);
        Ok(records.len() != before)
    }

    async fn soft_delete(&self, id: Uuid) -> MediaResult<bool> {
        let mut records = self.records();
        match records.iter_mut().find(|record| record.id == id && record.is_active()) {
            Some(record) => {
                let now = OffsetDateTime::now_utc();
                record.deleted_at = Some(now);
                record.updated_at = now;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn restore(&self, id: Uuid) -> MediaResult<bool> {
        let mut records = self.records();
        match records.iter_mut().find(|record| record.id == id && !record.is_active()) {
            Some(record) => {
                record.deleted_at = None;
                record.updated_at = OffsetDateTime::now_utc();
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn list_active(&self, owner: &OwnerRef, collection: &str) -> MediaResult<Vec<MediaRecord>> {
        let active = self
            .records()
            .iter()
            .filter(|record| in_group(record, owner, collection) && record.is_active())
            .cloned()
            .collect();
        Ok(sorted_by_order(active))
    }

    async fn list_trashed(&self, owner: &OwnerRef, collection: &str) -> MediaResult<Vec<MediaRecord>> {
        let mut trashed: Vec<MediaRecord> = self
            .records()
            .iter()
            .filter(|record| in_group(record, owner, collection) && !record.is_active())
            .cloned()
            .collect();
        trashed.sort_by(|a, b| b.deleted_at.cmp(&a.deleted_at));
        Ok(trashed)
    }

    async fn evict(
        &self,
        owner: &OwnerRef,
        collection: &str,
        spare: Spare,
        retention: Retention,
    ) -> MediaResult<Vec<MediaRecord>> {
        let mut records = self.records();
        let active: Vec<MediaRecord> = records
            .iter()
            .filter(|record| in_group(record, owner, collection) && record.is_active())
            .cloned()
            .collect();

        let victims = select_victims(&active, spare, retention);
        records.retain(|record| !victims.contains(&record.id));

        Ok(active
            .into_iter()
            .filter(|record| victims.contains(&record.id))
            .collect())
    }

    async fn reorder(&self, owner: &OwnerRef, collection: &str, ids: &[Uuid]) -> MediaResult<Vec<MediaRecord>> {
        let mut records = self.records();
        let current: Vec<Uuid> = sorted_by_order(
            records
                .iter()
                .filter(|record| in_group(record, owner, collection) && record.is_active())
                .cloned()
                .collect(),
        )
        .into_iter()
        .map(|record| record.id)
        .collect();

        let sequence = reorder_sequence(&current, ids);
        let now = OffsetDateTime::now_utc();
        for record in records.iter_mut() {
            if let Some(position) = sequence.iter().position(|id| *id == record.id) {
                record.order_index = position as i32 + 1;
                record.updated_at = now;
            }
        }

        let reordered = records
            .iter()
            .filter(|record| in_group(record, owner, collection) && record.is_active())
            .cloned()
            .collect();
        Ok(sorted_by_order(reordered))
    }

    async fn mark_derived(&self, id: Uuid, name: &str, artifact: &DerivedArtifact) -> MediaResult<bool> {
        let mut records = self.records();
        match records.iter_mut().find(|record| record.id == id) {
            Some(record) => {
                record.derived.insert(name.to_string(), artifact.clone());
                record.updated_at = OffsetDateTime::now_utc();
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn set_responsive(&self, id: Uuid, name: &str, variants: &[ResponsiveVariant]) -> MediaResult<bool> {
        let mut records = self.records();
        match records.iter_mut().find(|record| record.id == id) {
            Some(record) => {
                record.responsive.insert(name.to_string(), variants.to_vec());
                record.updated_at = OffsetDateTime::now_utc();
                Ok(true)
            }
            None => Ok(false),
        }
    }
}
