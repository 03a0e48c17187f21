use async_trait::async_trait;
use sqlx::{postgres::PgRow, PgPool, Row};
use uuid::Uuid;

use super::store::RelayStore;
use super::types::{
    AuditEvent, ChunkStats, ChunkWrite, Conflict, Direction, EntryStatus, NewAuditEvent, Pairing, QueueEntry,
    SealOutcome,
};
use crate::database::DatabaseError;

/// Queue columns without the payload; inline data is only read by fetch_inline
const ENTRY_COLUMNS: &str = "id, owner_id, pairing_id, direction, manifest, status, \
     octet_length(inline_data)::BIGINT AS inline_size, chunk_count, expected_chunks, total_size, \
     created_at, updated_at, completed_at";

const CONFLICT_COLUMNS: &str = "id, owner_id, pairing_id, queue_id, item_key, local_version, \
     remote_version, detail, resolution, detected_at, resolved_at";

#[derive(Clone)]
pub struct PgRelayStore {
    pool: PgPool,
}

impl PgRelayStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    fn map_entry(row: &PgRow) -> Result<QueueEntry, DatabaseError> {
        let direction: String = row.try_get("direction")?;
        let status: String = row.try_get("status")?;

        Ok(QueueEntry {
            id: row.try_get("id")?,
            owner_id: row.try_get("owner_id")?,
            pairing_id: row.try_get("pairing_id")?,
            direction: Direction::parse(&direction).ok_or_else(|| decode_error("direction", &direction))?,
            manifest: row.try_get("manifest")?,
            status: EntryStatus::parse(&status).ok_or_else(|| decode_error("status", &status))?,
            inline_size: row.try_get("inline_size")?,
            chunk_count: row.try_get("chunk_count")?,
            expected_chunks: row.try_get("expected_chunks")?,
            total_size: row.try_get("total_size")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
            completed_at: row.try_get("completed_at")?,
        })
    }
}

fn decode_error(column: &str, value: &str) -> DatabaseError {
    DatabaseError::Sqlx(sqlx::Error::Decode(
        format!("unexpected {} value '{}'", column, value).into(),
    ))
}

#[async_trait]
impl RelayStore for PgRelayStore {
    async fn insert_pairing(&self, pairing: &Pairing) -> Result<(), DatabaseError> {
        let result = sqlx::query(
            "INSERT INTO sync_pairings (id, owner_id, name, source_label, target_label, created_at)
             VALUES ($1, $2, $3, $4, $5, $6)",
        )
        .bind(pairing.id)
        .bind(pairing.owner_id)
        .bind(&pairing.name)
        .bind(&pairing.source_label)
        .bind(&pairing.target_label)
        .bind(pairing.created_at)
        .execute(&self.pool)
        .await
        .map_err(DatabaseError::from);

        match result {
            Err(e) if e.is_unique_violation() => {
                Err(DatabaseError::Conflict(format!("pairing '{}' already exists", pairing.name)))
            }
            other => other.map(|_| ()),
        }
    }

    async fn find_pairing(&self, owner_id: Uuid, pairing_id: Uuid) -> Result<Option<Pairing>, DatabaseError> {
        let pairing = sqlx::query_as::<_, Pairing>(
            "SELECT id, owner_id, name, source_label, target_label, created_at
             FROM sync_pairings WHERE id = $1 AND owner_id = $2",
        )
        .bind(pairing_id)
        .bind(owner_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(pairing)
    }

    async fn list_pairings(&self, owner_id: Uuid) -> Result<Vec<Pairing>, DatabaseError> {
        let pairings = sqlx::query_as::<_, Pairing>(
            "SELECT id, owner_id, name, source_label, target_label, created_at
             FROM sync_pairings WHERE owner_id = $1 ORDER BY created_at",
        )
        .bind(owner_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(pairings)
    }

    async fn insert_entry(&self, entry: &QueueEntry, inline_data: Option<&[u8]>) -> Result<(), DatabaseError> {
        sqlx::query(
            "INSERT INTO sync_queue (id, owner_id, pairing_id, direction, manifest, status, inline_data,
                                     chunk_count, expected_chunks, total_size, created_at, updated_at, completed_at)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)",
        )
        .bind(entry.id)
        .bind(entry.owner_id)
        .bind(entry.pairing_id)
        .bind(entry.direction.as_str())
        .bind(&entry.manifest)
        .bind(entry.status.as_str())
        .bind(inline_data)
        .bind(entry.chunk_count)
        .bind(entry.expected_chunks)
        .bind(entry.total_size)
        .bind(entry.created_at)
        .bind(entry.updated_at)
        .bind(entry.completed_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn find_entry(&self, owner_id: Uuid, entry_id: Uuid) -> Result<Option<QueueEntry>, DatabaseError> {
        let sql = format!("SELECT {} FROM sync_queue WHERE id = $1 AND owner_id = $2", ENTRY_COLUMNS);
        let row = sqlx::query(&sql)
            .bind(entry_id)
            .bind(owner_id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(Self::map_entry).transpose()
    }

    async fn mark_completed(&self, entry_id: Uuid, chunk_count: u32, total_size: u64) -> Result<SealOutcome, DatabaseError> {
        // The row lock orders this against in-flight chunk writes
        let mut tx = self.pool.begin().await?;
        let (sealed,): (bool,) = sqlx::query_as("SELECT status = 'completed' FROM sync_queue WHERE id = $1 FOR UPDATE")
            .bind(entry_id)
            .fetch_optional(&mut *tx)
            .await?
            .ok_or_else(|| DatabaseError::NotFound(format!("queue entry {}", entry_id)))?;

        if sealed {
            let sql = format!("SELECT {} FROM sync_queue WHERE id = $1", ENTRY_COLUMNS);
            let row = sqlx::query(&sql).bind(entry_id).fetch_one(&mut *tx).await?;
            tx.commit().await?;
            return Ok(SealOutcome::AlreadySealed(Self::map_entry(&row)?));
        }

        let (stored, bytes): (i64, i64) = sqlx::query_as(
            "SELECT count(*), COALESCE(sum(octet_length(data)), 0)::BIGINT FROM sync_chunks WHERE queue_id = $1",
        )
        .bind(entry_id)
        .fetch_one(&mut *tx)
        .await?;
        if stored != chunk_count as i64 || bytes != total_size as i64 {
            return Ok(SealOutcome::ChunksChanged);
        }

        let sql = format!(
            "UPDATE sync_queue
             SET status = 'completed', chunk_count = $2, total_size = $3, updated_at = now(), completed_at = now()
             WHERE id = $1
             RETURNING {}",
            ENTRY_COLUMNS
        );
        let row = sqlx::query(&sql)
            .bind(entry_id)
            .bind(chunk_count as i32)
            .bind(total_size as i64)
            .fetch_one(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(SealOutcome::Sealed(Self::map_entry(&row)?))
    }

    async fn latest_completed(
        &self,
        owner_id: Uuid,
        pairing_id: Uuid,
        direction: Direction,
    ) -> Result<Option<QueueEntry>, DatabaseError> {
        let sql = format!(
            "SELECT {} FROM sync_queue
             WHERE owner_id = $1 AND pairing_id = $2 AND direction = $3 AND status = 'completed'
             ORDER BY completed_at DESC, created_at DESC
             LIMIT 1",
            ENTRY_COLUMNS
        );
        let row = sqlx::query(&sql)
            .bind(owner_id)
            .bind(pairing_id)
            .bind(direction.as_str())
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(Self::map_entry).transpose()
    }

    async fn list_entries(&self, owner_id: Uuid, pairing_id: Uuid, limit: i64) -> Result<Vec<QueueEntry>, DatabaseError> {
        let sql = format!(
            "SELECT {} FROM sync_queue
             WHERE owner_id = $1 AND pairing_id = $2
             ORDER BY created_at DESC
             LIMIT $3",
            ENTRY_COLUMNS
        );
        let rows = sqlx::query(&sql)
            .bind(owner_id)
            .bind(pairing_id)
            .bind(limit)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(Self::map_entry).collect()
    }

    async fn fetch_inline(&self, entry_id: Uuid) -> Result<Option<Vec<u8>>, DatabaseError> {
        let data: Option<(Option<Vec<u8>>,)> = sqlx::query_as("SELECT inline_data FROM sync_queue WHERE id = $1")
            .bind(entry_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(data.and_then(|(bytes,)| bytes))
    }

    async fn upsert_chunk(&self, entry_id: Uuid, index: u32, data: &[u8]) -> Result<ChunkWrite, DatabaseError> {
        let mut tx = self.pool.begin().await?;
        let (status,): (String,) = sqlx::query_as("SELECT status FROM sync_queue WHERE id = $1 FOR UPDATE")
            .bind(entry_id)
            .fetch_optional(&mut *tx)
            .await?
            .ok_or_else(|| DatabaseError::NotFound(format!("queue entry {}", entry_id)))?;
        let status = EntryStatus::parse(&status).ok_or_else(|| decode_error("status", &status))?;
        if status == EntryStatus::Completed {
            return Ok(ChunkWrite::EntrySealed);
        }

        sqlx::query(
            "INSERT INTO sync_chunks (queue_id, chunk_index, data)
             VALUES ($1, $2, $3)
             ON CONFLICT (queue_id, chunk_index) DO UPDATE SET data = EXCLUDED.data, updated_at = now()",
        )
        .bind(entry_id)
        .bind(index as i32)
        .bind(data)
        .execute(&mut *tx)
        .await?;

        if status == EntryStatus::Pending {
            sqlx::query("UPDATE sync_queue SET status = 'processing', updated_at = now() WHERE id = $1 AND status = 'pending'")
                .bind(entry_id)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        Ok(ChunkWrite::Stored(EntryStatus::Processing))
    }

    async fn chunk_stats(&self, entry_id: Uuid) -> Result<ChunkStats, DatabaseError> {
        let rows: Vec<(i32, i64)> = sqlx::query_as(
            "SELECT chunk_index, octet_length(data)::BIGINT FROM sync_chunks
             WHERE queue_id = $1 ORDER BY chunk_index",
        )
        .bind(entry_id)
        .fetch_all(&self.pool)
        .await?;

        let mut stats = ChunkStats::default();
        for (index, size) in rows {
            stats.indices.push(index as u32);
            stats.total_bytes += size as u64;
        }
        Ok(stats)
    }

    async fn fetch_chunk(&self, entry_id: Uuid, index: u32) -> Result<Option<Vec<u8>>, DatabaseError> {
        let data: Option<(Vec<u8>,)> =
            sqlx::query_as("SELECT data FROM sync_chunks WHERE queue_id = $1 AND chunk_index = $2")
                .bind(entry_id)
                .bind(index as i32)
                .fetch_optional(&self.pool)
                .await?;
        Ok(data.map(|(bytes,)| bytes))
    }

    async fn insert_conflict(&self, conflict: &Conflict) -> Result<(), DatabaseError> {
        sqlx::query(
            "INSERT INTO sync_conflicts (id, owner_id, pairing_id, queue_id, item_key, local_version,
                                         remote_version, detail, detected_at)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)",
        )
        .bind(conflict.id)
        .bind(conflict.owner_id)
        .bind(conflict.pairing_id)
        .bind(conflict.queue_id)
        .bind(&conflict.item_key)
        .bind(&conflict.local_version)
        .bind(&conflict.remote_version)
        .bind(&conflict.detail)
        .bind(conflict.detected_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn resolve_conflict(
        &self,
        owner_id: Uuid,
        conflict_id: Uuid,
        resolution: &str,
    ) -> Result<Option<Conflict>, DatabaseError> {
        let sql = format!(
            "UPDATE sync_conflicts SET resolution = $3, resolved_at = now()
             WHERE id = $1 AND owner_id = $2
             RETURNING {}",
            CONFLICT_COLUMNS
        );
        let conflict = sqlx::query_as::<_, Conflict>(&sql)
            .bind(conflict_id)
            .bind(owner_id)
            .bind(resolution)
            .fetch_optional(&self.pool)
            .await?;
        Ok(conflict)
    }

    async fn list_conflicts(
        &self,
        owner_id: Uuid,
        pairing_id: Uuid,
        unresolved_only: bool,
    ) -> Result<Vec<Conflict>, DatabaseError> {
        let sql = format!(
            "SELECT {} FROM sync_conflicts
             WHERE owner_id = $1 AND pairing_id = $2 AND (NOT $3 OR resolved_at IS NULL)
             ORDER BY detected_at DESC",
            CONFLICT_COLUMNS
        );
        let conflicts = sqlx::query_as::<_, Conflict>(&sql)
            .bind(owner_id)
            .bind(pairing_id)
            .bind(unresolved_only)
            .fetch_all(&self.pool)
            .await?;
        Ok(conflicts)
    }

    async fn append_audit(&self, event: NewAuditEvent) -> Result<(), DatabaseError> {
        sqlx::query(
            "INSERT INTO sync_audit (owner_id, pairing_id, queue_id, action, detail)
             VALUES ($1, $2, $3, $4, $5)",
        )
        .bind(event.owner_id)
        .bind(event.pairing_id)
        .bind(event.queue_id)
        .bind(event.action)
        .bind(&event.detail)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn list_audit(
        &self,
        owner_id: Uuid,
        pairing_id: Option<Uuid>,
        limit: i64,
    ) -> Result<Vec<AuditEvent>, DatabaseError> {
        let events = sqlx::query_as::<_, AuditEvent>(
            "SELECT id, owner_id, pairing_id, queue_id, action, detail, created_at
             FROM sync_audit
             WHERE owner_id = $1 AND ($2::UUID IS NULL OR pairing_id = $2)
             ORDER BY id DESC
             LIMIT $3",
        )
        .bind(owner_id)
        .bind(pairing_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(events)
    }
}
