use std::collections::BTreeMap;

use async_trait::async_trait;
use serde_json::{Map, Value};
use sqlx::postgres::PgRow;
use sqlx::types::Json;
use sqlx::{PgConnection, Row};
use uuid::Uuid;

use crate::app::policy::{reorder_sequence, select_victims, Retention, Spare};
use crate::domain::media::{
    ChecksumAlgorithm, DerivedArtifact, MediaRecord, OwnerRef, RecordChanges, ResponsiveVariant,
};
use crate::error::{MediaError, MediaResult};
use crate::infra::db::Db;

/// Persistence for media records.
///
/// `evict` and `reorder` must run atomically per (owner, collection);
/// `mark_derived` and `set_responsive` must merge a single key without
/// clobbering concurrent writes to sibling keys.
#[async_trait]
pub trait MediaRepository: Send + Sync {
    /// Store a new record, assigning the next ordering index in its group.
    async fn insert(&self, record: MediaRecord) -> MediaResult<MediaRecord>;

    async fn get(&self, id: Uuid) -> MediaResult<Option<MediaRecord>>;

    async fn update(&self, id: Uuid, changes: &RecordChanges) -> MediaResult<MediaRecord>;

    /// Hard delete. Returns whether a row was removed.
    async fn delete(&self, id: Uuid) -> MediaResult<bool>;

    async fn soft_delete(&self, id: Uuid) -> MediaResult<bool>;

    async fn restore(&self, id: Uuid) -> MediaResult<bool>;

    /// Active records ordered by ordering index.
    async fn list_active(&self, owner: &OwnerRef, collection: &str) -> MediaResult<Vec<MediaRecord>>;

    async fn list_trashed(&self, owner: &OwnerRef, collection: &str) -> MediaResult<Vec<MediaRecord>>;

    /// Delete the active records `retention` no longer allows, oldest first by
    /// insertion, never the `spare` record. Runs atomically per group.
    async fn evict(
        &self,
        owner: &OwnerRef,
        collection: &str,
        spare: Spare,
        retention: Retention,
    ) -> MediaResult<Vec<MediaRecord>>;

    async fn reorder(&self, owner: &OwnerRef, collection: &str, ids: &[Uuid]) -> MediaResult<Vec<MediaRecord>>;

    /// Returns false when the record no longer exists.
    async fn mark_derived(&self, id: Uuid, name: &str, artifact: &DerivedArtifact) -> MediaResult<bool>;

    async fn set_responsive(&self, id: Uuid, name: &str, variants: &[ResponsiveVariant]) -> MediaResult<bool>;
}

const COLUMNS: &str = "id, owner_type, owner_id, collection, file_name, storage_name, mime_type, \
                       backend, size, checksum, checksum_algorithm, custom_properties, metadata, \
                       derived, responsive, order_index, deleted_at, created_at, updated_at";

#[derive(Clone)]
pub struct PgMediaRepository {
    db: Db,
}

impl PgMediaRepository {
    pub fn new(db: Db) -> Self {
        Self { db }
    }
}

#[async_trait]
impl MediaRepository for PgMediaRepository {
    async fn insert(&self, record: MediaRecord) -> MediaResult<MediaRecord> {
        let mut tx = self.db.pool().begin().await?;
        lock_group(&mut tx, &record.owner, &record.collection).await?;

        let row = sqlx::query(&format!(
            "INSERT INTO media (id, owner_type, owner_id, collection, file_name, storage_name, \
                                mime_type, backend, size, checksum, checksum_algorithm, \
                                custom_properties, metadata, derived, responsive, order_index, \
                                created_at, updated_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, \
                     (SELECT COALESCE(MAX(order_index), 0) + 1 FROM media \
                      WHERE owner_type = $2 AND owner_id = $3 AND collection = $4), \
                     $16, $17) \
             RETURNING {}",
            COLUMNS
        ))
        .bind(record.id)
        .bind(&record.owner.owner_type)
        .bind(&record.owner.owner_id)
        .bind(&record.collection)
        .bind(&record.file_name)
        .bind(&record.storage_name)
        .bind(&record.mime_type)
        .bind(&record.backend)
        .bind(record.size)
        .bind(&record.checksum)
        .bind(record.checksum_algorithm.map(|algorithm| algorithm.as_db()))
        .bind(Json(&record.custom_properties))
        .bind(Json(&record.metadata))
        .bind(Json(&record.derived))
        .bind(Json(&record.responsive))
        .bind(record.created_at)
        .bind(record.updated_at)
        .fetch_one(&mut *tx)
        .await?;

        let inserted = record_from_row(&row)?;
        tx.commit().await?;
        Ok(inserted)
    }

    async fn get(&self, id: Uuid) -> MediaResult<Option<MediaRecord>> {
        let row = sqlx::query(&format!("SELECT {} FROM media WHERE id = $1", COLUMNS))
            .bind(id)
            .fetch_optional(self.db.pool())
            .await?;
        row.as_ref().map(record_from_row).transpose()
    }

    async fn update(&self, id: Uuid, changes: &RecordChanges) -> MediaResult<MediaRecord> {
        let row = sqlx::query(&format!(
            "UPDATE media \
             SET file_name = COALESCE($2, file_name), \
                 custom_properties = COALESCE($3, custom_properties), \
                 metadata = COALESCE($4, metadata), \
                 updated_at = now() \
             WHERE id = $1 \
             RETURNING {}",
            COLUMNS
        ))
        .bind(id)
        .bind(&changes.file_name)
        .bind(changes.custom_properties.as_ref().map(Json))
        .bind(changes.metadata.as_ref().map(Json))
        .fetch_optional(self.db.pool())
        .await?;

        match row {
            Some(row) => record_from_row(&row),
            None => Err(MediaError::not_found(format!("media {}", id))),
        }
    }

    async fn delete(&self, id: Uuid) -> MediaResult<bool> {
        let result = sqlx::query("DELETE FROM media WHERE id = $1")
            .bind(id)
            .execute(self.db.pool())
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn soft_delete(&self, id: Uuid) -> MediaResult<bool> {
        let result = sqlx::query(
            "UPDATE media SET deleted_at = now(), updated_at = now() \
             WHERE id = $1 AND deleted_at IS NULL",
        )
        .bind(id)
        .execute(self.db.pool())
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn restore(&self, id: Uuid) -> MediaResult<bool> {
        let result = sqlx::query(
            "UPDATE media SET deleted_at = NULL, updated_at = now() \
             WHERE id = $1 AND deleted_at IS NOT NULL",
        )
        .bind(id)
        .execute(self.db.pool())
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn list_active(&self, owner: &OwnerRef, collection: &str) -> MediaResult<Vec<MediaRecord>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM media \
             WHERE owner_type = $1 AND owner_id = $2 AND collection = $3 AND deleted_at IS NULL \
             ORDER BY order_index, seq",
            COLUMNS
        ))
        .bind(&owner.owner_type)
        .bind(&owner.owner_id)
        .bind(collection)
        .fetch_all(self.db.pool())
        .await?;
        rows.iter().map(record_from_row).collect()
    }

    async fn list_trashed(&self, owner: &OwnerRef, collection: &str) -> MediaResult<Vec<MediaRecord>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM media \
             WHERE owner_type = $1 AND owner_id = $2 AND collection = $3 AND deleted_at IS NOT NULL \
             ORDER BY deleted_at DESC, seq",
            COLUMNS
        ))
        .bind(&owner.owner_type)
        .bind(&owner.owner_id)
        .bind(collection)
        .fetch_all(self.db.pool())
        .await?;
        rows.iter().map(record_from_row).collect()
    }

    async fn evict(
        &self,
        owner: &OwnerRef,
        collection: &str,
        spare: Spare,
        retention: Retention,
    ) -> MediaResult<Vec<MediaRecord>> {
        let mut tx = self.db.pool().begin().await?;
        lock_group(&mut tx, owner, collection).await?;

        let rows = sqlx::query(&format!(
            "SELECT {} FROM media \
             WHERE owner_type = $1 AND owner_id = $2 AND collection = $3 AND deleted_at IS NULL \
             ORDER BY seq \
             FOR UPDATE",
            COLUMNS
        ))
        .bind(&owner.owner_type)
        .bind(&owner.owner_id)
        .bind(collection)
        .fetch_all(&mut *tx)
        .await?;
        let active = rows.iter().map(record_from_row).collect::<MediaResult<Vec<_>>>()?;

        let victims = select_victims(&active, spare, retention);
        if victims.is_empty() {
            tx.commit().await?;
            return Ok(Vec::new());
        }

        sqlx::query("DELETE FROM media WHERE id = ANY($1)")
            .bind(&victims)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;

        Ok(active
            .into_iter()
            .filter(|record| victims.contains(&record.id))
            .collect())
    }

    async fn reorder(&self, owner: &OwnerRef, collection: &str, ids: &[Uuid]) -> MediaResult<Vec<MediaRecord>> {
        let mut tx = self.db.pool().begin().await?;
        lock_group(&mut tx, owner, collection).await?;

        let current: Vec<Uuid> = sqlx::query_scalar(
            "SELECT id FROM media \
             WHERE owner_type = $1 AND owner_id = $2 AND collection = $3 AND deleted_at IS NULL \
             ORDER BY order_index, seq \
             FOR UPDATE",
        )
        .bind(&owner.owner_type)
        .bind(&owner.owner_id)
        .bind(collection)
        .fetch_all(&mut *tx)
        .await?;

        let sequence = reorder_sequence(&current, ids);
        let positions: Vec<i32> = (1..=sequence.len() as i32).collect();

        sqlx::query(
            "UPDATE media AS m \
             SET order_index = v.position, updated_at = now() \
             FROM UNNEST($1::uuid[], $2::int4[]) AS v(id, position) \
             WHERE m.id = v.id",
        )
        .bind(&sequence)
        .bind(&positions)
        .execute(&mut *tx)
        .await?;

        let rows = sqlx::query(&format!(
            "SELECT {} FROM media \
             WHERE owner_type = $1 AND owner_id = $2 AND collection = $3 AND deleted_at IS NULL \
             ORDER BY order_index, seq",
            COLUMNS
        ))
        .bind(&owner.owner_type)
        .bind(&owner.owner_id)
        .bind(collection)
        .fetch_all(&mut *tx)
        .await?;
        let reordered = rows.iter().map(record_from_row).collect::<MediaResult<Vec<_>>>()?;

        tx.commit().await?;
        Ok(reordered)
    }

    async fn mark_derived(&self, id: Uuid, name: &str, artifact: &DerivedArtifact) -> MediaResult<bool> {
        let result = sqlx::query(
            "UPDATE media \
             SET derived = derived || jsonb_build_object($2::text, $3::jsonb), updated_at = now() \
             WHERE id = $1",
        )
        .bind(id)
        .bind(name)
        .bind(Json(artifact))
        .execute(self.db.pool())
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn set_responsive(&self, id: Uuid, name: &str, variants: &[ResponsiveVariant]) -> MediaResult<bool> {
        let result = sqlx::query(
            "UPDATE media \
             SET responsive = responsive || jsonb_build_object($2::text, $3::jsonb), updated_at = now() \
             WHERE id = $1",
        )
        .bind(id)
        .bind(name)
        .bind(Json(variants))
        .execute(self.db.pool())
        .await?;
        Ok(result.rows_affected() > 0)
    }
}

/// Serialize writers of one (owner, collection) for the rest of the transaction.
async fn lock_group(conn: &mut PgConnection, owner: &OwnerRef, collection: &str) -> MediaResult<()> {
    sqlx::query("SELECT pg_advisory_xact_lock(hashtext($1))")
        .bind(format!("{}/{}", owner, collection))
        .execute(conn)
        .await?;
    Ok(())
}

fn record_from_row(row: &PgRow) -> MediaResult<MediaRecord> {
    let algorithm: Option<String> = row.try_get("checksum_algorithm")?;
    let custom_properties: Json<Map<String, Value>> = row.try_get("custom_properties")?;
    let metadata: Json<Map<String, Value>> = row.try_get("metadata")?;
    let derived: Json<BTreeMap<String, DerivedArtifact>> = row.try_get("derived")?;
    let responsive: Json<BTreeMap<String, Vec<ResponsiveVariant>>> = row.try_get("responsive")?;

    Ok(MediaRecord {
        id: row.try_get("id")?,
        owner: OwnerRef {
            owner_type: row.try_get("owner_type")?,
            owner_id: row.try_get("owner_id")?,
        },
        collection: row.try_get("collection")?,
        file_name: row.try_get("file_name")?,
        storage_name: row.try_get("storage_name")?,
        mime_type: row.try_get("mime_type")?,
        backend: row.try_get("backend")?,
        size: row.try_get("size")?,
        checksum: row.try_get("checksum")?,
        checksum_algorithm: algorithm.as_deref().and_then(ChecksumAlgorithm::from_db),
        custom_properties: custom_properties.0,
        metadata: metadata.0,
        derived: derived.0,
        responsive: responsive.0,
        order_index: row.try_get("order_index")?,
        deleted_at: row.try_get("deleted_at")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}
