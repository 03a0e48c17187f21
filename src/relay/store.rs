use async_trait::async_trait;
use uuid::Uuid;

use super::types::{
    AuditEvent, ChunkStats, ChunkWrite, Conflict, Direction, NewAuditEvent, Pairing, QueueEntry, SealOutcome,
};
use crate::database::DatabaseError;

/// Persistence seam for the relay. Every owner-scoped lookup must treat rows
/// belonging to another owner as absent.
#[async_trait]
pub trait RelayStore: Send + Sync {
    /// Fails with `DatabaseError::Conflict` when the owner already has a pairing with this name
    async fn insert_pairing(&self, pairing: &Pairing) -> Result<(), DatabaseError>;
    async fn find_pairing(&self, owner_id: Uuid, pairing_id: Uuid) -> Result<Option<Pairing>, DatabaseError>;
    async fn list_pairings(&self, owner_id: Uuid) -> Result<Vec<Pairing>, DatabaseError>;

    async fn insert_entry(&self, entry: &QueueEntry, inline_data: Option<&[u8]>) -> Result<(), DatabaseError>;
    async fn find_entry(&self, owner_id: Uuid, entry_id: Uuid) -> Result<Option<QueueEntry>, DatabaseError>;
    /// Seal the entry, but only if it is not sealed yet and its stored chunks
    /// still add up to `chunk_count` and `total_size`
    async fn mark_completed(&self, entry_id: Uuid, chunk_count: u32, total_size: u64) -> Result<SealOutcome, DatabaseError>;
    async fn latest_completed(
        &self,
        owner_id: Uuid,
        pairing_id: Uuid,
        direction: Direction,
    ) -> Result<Option<QueueEntry>, DatabaseError>;
    async fn list_entries(&self, owner_id: Uuid, pairing_id: Uuid, limit: i64) -> Result<Vec<QueueEntry>, DatabaseError>;
    async fn fetch_inline(&self, entry_id: Uuid) -> Result<Option<Vec<u8>>, DatabaseError>;

    /// Insert or overwrite the chunk stored at `(entry_id, index)` and move a
    /// pending entry to processing. Refuses once the entry is sealed.
    async fn upsert_chunk(&self, entry_id: Uuid, index: u32, data: &[u8]) -> Result<ChunkWrite, DatabaseError>;
    async fn chunk_stats(&self, entry_id: Uuid) -> Result<ChunkStats, DatabaseError>;
    async fn fetch_chunk(&self, entry_id: Uuid, index: u32) -> Result<Option<Vec<u8>>, DatabaseError>;

    async fn insert_conflict(&self, conflict: &Conflict) -> Result<(), DatabaseError>;
    async fn resolve_conflict(
        &self,
        owner_id: Uuid,
        conflict_id: Uuid,
        resolution: &str,
    ) -> Result<Option<Conflict>, DatabaseError>;
    async fn list_conflicts(
        &self,
        owner_id: Uuid,
        pairing_id: Uuid,
        unresolved_only: bool,
    ) -> Result<Vec<Conflict>, DatabaseError>;

    async fn append_audit(&self, event: NewAuditEvent) -> Result<(), DatabaseError>;
    async fn list_audit(
        &self,
        owner_id: Uuid,
        pairing_id: Option<Uuid>,
        limit: i64,
    ) -> Result<Vec<AuditEvent>, DatabaseError>;
}
