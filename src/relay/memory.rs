use std::collections::BTreeMap;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::Utc;
use uuid::Uuid;

use super::store::RelayStore;
use super::types::{
    AuditEvent, ChunkStats, ChunkWrite, Conflict, Direction, EntryStatus, NewAuditEvent, Pairing, QueueEntry,
    SealOutcome,
};
use crate::database::DatabaseError;

#[derive(Default)]
struct Tables {
    pairings: Vec<Pairing>,
    entries: Vec<QueueEntry>,
    inline: BTreeMap<Uuid, Vec<u8>>,
    chunks: BTreeMap<(Uuid, u32), Vec<u8>>,
    conflicts: Vec<Conflict>,
    audit: Vec<AuditEvent>,
}

/// Process-local RelayStore used by unit tests
#[derive(Default)]
pub struct MemoryRelayStore {
    tables: Mutex<Tables>,
}

impl MemoryRelayStore {
    fn tables(&self) -> std::sync::MutexGuard<'_, Tables> {
        self.tables.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Tables {
    fn entry_mut(&mut self, entry_id: Uuid) -> Result<&mut QueueEntry, DatabaseError> {
        self.entries
            .iter_mut()
            .find(|e| e.id == entry_id)
            .ok_or_else(|| DatabaseError::NotFound(entry_id.to_string()))
    }

    fn chunk_stats(&self, entry_id: Uuid) -> ChunkStats {
        let mut stats = ChunkStats::default();
        for ((_, index), data) in self.chunks.range((entry_id, 0)..=(entry_id, u32::MAX)) {
            stats.indices.push(*index);
            stats.total_bytes += data.len() as u64;
        }
        stats
    }
}

#[async_trait]
impl RelayStore for MemoryRelayStore {
    async fn insert_pairing(&self, pairing: &Pairing) -> Result<(), DatabaseError> {
        let mut t = self.tables();
        if t.pairings.iter().any(|p| p.owner_id == pairing.owner_id && p.name == pairing.name) {
            return Err(DatabaseError::Conflict(format!("pairing '{}' already exists", pairing.name)));
        }
        t.pairings.push(pairing.clone());
        Ok(())
    }

    async fn find_pairing(&self, owner_id: Uuid, pairing_id: Uuid) -> Result<Option<Pairing>, DatabaseError> {
        Ok(self
            .tables()
            .pairings
            .iter()
            .find(|p| p.owner_id == owner_id && p.id == pairing_id)
            .cloned())
    }

    async fn list_pairings(&self, owner_id: Uuid) -> Result<Vec<Pairing>, DatabaseError> {
        Ok(self.tables().pairings.iter().filter(|p| p.owner_id == owner_id).cloned().collect())
    }

    async fn insert_entry(&self, entry: &QueueEntry, inline_data: Option<&[u8]>) -> Result<(), DatabaseError> {
        let mut t = self.tables();
        t.entries.push(entry.clone());
        if let Some(data) = inline_data {
            t.inline.insert(entry.id, data.to_vec());
        }
        Ok(())
    }

    async fn find_entry(&self, owner_id: Uuid, entry_id: Uuid) -> Result<Option<QueueEntry>, DatabaseError> {
        Ok(self
            .tables()
            .entries
            .iter()
            .find(|e| e.owner_id == owner_id && e.id == entry_id)
            .cloned())
    }

    async fn mark_completed(&self, entry_id: Uuid, chunk_count: u32, total_size: u64) -> Result<SealOutcome, DatabaseError> {
        let mut t = self.tables();
        if t.entry_mut(entry_id)?.is_completed() {
            return Ok(SealOutcome::AlreadySealed(t.entry_mut(entry_id)?.clone()));
        }
        let stats = t.chunk_stats(entry_id);
        if stats.count() != chunk_count || stats.total_bytes != total_size {
            return Ok(SealOutcome::ChunksChanged);
        }

        let entry = t.entry_mut(entry_id)?;
        let now = Utc::now();
        entry.status = EntryStatus::Completed;
        entry.chunk_count = Some(chunk_count as i32);
        entry.total_size = Some(total_size as i64);
        entry.updated_at = now;
        entry.completed_at = Some(now);
        Ok(SealOutcome::Sealed(entry.clone()))
    }

    async fn latest_completed(
        &self,
        owner_id: Uuid,
        pairing_id: Uuid,
        direction: Direction,
    ) -> Result<Option<QueueEntry>, DatabaseError> {
        // max_by_key keeps the last of equal keys, so ties go to the newest insert
        Ok(self
            .tables()
            .entries
            .iter()
            .filter(|e| {
                e.owner_id == owner_id && e.pairing_id == pairing_id && e.direction == direction && e.is_completed()
            })
            .max_by_key(|e| e.completed_at)
            .cloned())
    }

    async fn list_entries(&self, owner_id: Uuid, pairing_id: Uuid, limit: i64) -> Result<Vec<QueueEntry>, DatabaseError> {
        Ok(self
            .tables()
            .entries
            .iter()
            .rev()
            .filter(|e| e.owner_id == owner_id && e.pairing_id == pairing_id)
            .take(limit.max(0) as usize)
            .cloned()
            .collect())
    }

    async fn fetch_inline(&self, entry_id: Uuid) -> Result<Option<Vec<u8>>, DatabaseError> {
        Ok(self.tables().inline.get(&entry_id).cloned())
    }

    async fn upsert_chunk(&self, entry_id: Uuid, index: u32, data: &[u8]) -> Result<ChunkWrite, DatabaseError> {
        let mut t = self.tables();
        let entry = t.entry_mut(entry_id)?;
        if entry.is_completed() {
            return Ok(ChunkWrite::EntrySealed);
        }
        if entry.status == EntryStatus::Pending {
            entry.status = EntryStatus::Processing;
            entry.updated_at = Utc::now();
        }
        let status = entry.status;
        t.chunks.insert((entry_id, index), data.to_vec());
        Ok(ChunkWrite::Stored(status))
    }

    async fn chunk_stats(&self, entry_id: Uuid) -> Result<ChunkStats, DatabaseError> {
        Ok(self.tables().chunk_stats(entry_id))
    }

    async fn fetch_chunk(&self, entry_id: Uuid, index: u32) -> Result<Option<Vec<u8>>, DatabaseError> {
        Ok(self.tables().chunks.get(&(entry_id, index)).cloned())
    }

    async fn insert_conflict(&self, conflict: &Conflict) -> Result<(), DatabaseError> {
        self.tables().conflicts.push(conflict.clone());
        Ok(())
    }

    async fn resolve_conflict(
        &self,
        owner_id: Uuid,
        conflict_id: Uuid,
        resolution: &str,
    ) -> Result<Option<Conflict>, DatabaseError> {
        let mut t = self.tables();
        Ok(t
            .conflicts
            .iter_mut()
            .find(|c| c.owner_id == owner_id && c.id == conflict_id)
            .map(|c| {
                c.resolution = Some(resolution.to_string());
                c.resolved_at = Some(Utc::now());
                c.clone()
            }))
    }

    async fn list_conflicts(
        &self,
        owner_id: Uuid,
        pairing_id: Uuid,
        unresolved_only: bool,
    ) -> Result<Vec<Conflict>, DatabaseError> {
        Ok(self
            .tables()
            .conflicts
            .iter()
            .rev()
            .filter(|c| c.owner_id == owner_id && c.pairing_id == pairing_id)
            .filter(|c| !unresolved_only || c.resolved_at.is_none())
            .cloned()
            .collect())
    }

    async fn append_audit(&self, event: NewAuditEvent) -> Result<(), DatabaseError> {
        let mut t = self.tables();
        let id = t.audit.len() as i64 + 1;
        t.audit.push(AuditEvent {
            id,
            owner_id: event.owner_id,
            pairing_id: event.pairing_id,
            queue_id: event.queue_id,
            action: event.action.to_string(),
            detail: event.detail,
            created_at: Utc::now(),
        });
        Ok(())
    }

    async fn list_audit(
        &self,
        owner_id: Uuid,
        pairing_id: Option<Uuid>,
        limit: i64,
    ) -> Result<Vec<AuditEvent>, DatabaseError> {
        Ok(self
            .tables()
            .audit
            .iter()
            .rev()
            .filter(|e| e.owner_id == owner_id)
            .filter(|e| pairing_id.is_none() || e.pairing_id == pairing_id)
            .take(limit.max(0) as usize)
            .cloned()
            .collect())
    }
}
