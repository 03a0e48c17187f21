use chrono::Utc;
use serde_json::{json, Value};
use tracing::{debug, error, info};
use uuid::Uuid;

use super::store::RelayStore;
use super::types::{
    AuditEvent, BeginUpload, ChunkReceipt, ChunkUpload, ChunkWrite, CompletedUpload, Conflict, CreatePairing, Direction,
    EntryStatus, InlineUpload, NewAuditEvent, PackageDescriptor, Pairing, QueueEntry, ReportConflict, SealOutcome,
};
use super::RelayError;
use crate::config::SyncConfig;
use crate::database::DatabaseError;

const MAX_LABEL_LENGTH: usize = 100;
const MAX_ITEM_KEY_LENGTH: usize = 512;
const MAX_LIST_LIMIT: i64 = 200;

/// Protocol rules for the package relay, independent of where rows live
pub struct RelayService<S> {
    store: S,
    limits: SyncConfig,
}

impl<S: RelayStore> RelayService<S> {
    pub fn new(store: S, limits: SyncConfig) -> Self {
        Self { store, limits }
    }

    pub fn limits(&self) -> &SyncConfig {
        &self.limits
    }

    pub async fn create_pairing(&self, owner_id: Uuid, request: CreatePairing) -> Result<Pairing, RelayError> {
        let pairing = Pairing {
            id: Uuid::new_v4(),
            owner_id,
            name: required_text("name", &request.name, MAX_LABEL_LENGTH)?,
            source_label: required_text("source_label", &request.source_label, MAX_LABEL_LENGTH)?,
            target_label: required_text("target_label", &request.target_label, MAX_LABEL_LENGTH)?,
            created_at: Utc::now(),
        };

        match self.store.insert_pairing(&pairing).await {
            Err(DatabaseError::Conflict(_)) => return Err(RelayError::DuplicatePairing(pairing.name)),
            other => other?,
        }

        self.audit(owner_id, Some(pairing.id), None, "pairing.created", json!({ "name": pairing.name }))
            .await;
        info!("Created pairing {} ({}) for owner {}", pairing.name, pairing.id, owner_id);
        Ok(pairing)
    }

    pub async fn list_pairings(&self, owner_id: Uuid) -> Result<Vec<Pairing>, RelayError> {
        Ok(self.store.list_pairings(owner_id).await?)
    }

    /// Store a small package (or a bare manifest) in one call. The entry is
    /// completed immediately.
    pub async fn upload_inline(&self, owner_id: Uuid, request: InlineUpload) -> Result<QueueEntry, RelayError> {
        self.owned_pairing(owner_id, request.pairing_id).await?;
        validate_manifest(&request.manifest)?;

        let data = request.data.filter(|d| !d.is_empty());
        if let Some(data) = &data {
            if data.len() > self.limits.inline_threshold_bytes {
                return Err(RelayError::PayloadTooLarge {
                    size: data.len(),
                    limit: self.limits.inline_threshold_bytes,
                });
            }
        }

        let now = Utc::now();
        let inline_size = data.as_ref().map(|d| d.len() as i64);
        let entry = QueueEntry {
            id: Uuid::new_v4(),
            owner_id,
            pairing_id: request.pairing_id,
            direction: request.direction,
            manifest: request.manifest,
            status: EntryStatus::Completed,
            inline_size,
            chunk_count: None,
            expected_chunks: None,
            total_size: Some(inline_size.unwrap_or(0)),
            created_at: now,
            updated_at: now,
            completed_at: Some(now),
        };

        self.store.insert_entry(&entry, data.as_deref()).await?;

        let transfer_mode = entry.transfer_mode();
        self.audit(
            owner_id,
            Some(entry.pairing_id),
            Some(entry.id),
            "upload.inline",
            json!({
                "direction": entry.direction,
                "size": entry.total_size,
                "transfer_mode": transfer_mode,
            }),
        )
        .await;
        info!("Stored {:?} package {} ({} bytes)", transfer_mode, entry.id, inline_size.unwrap_or(0));
        Ok(entry)
    }

    /// Open a chunked upload. The entry stays pending until its first chunk arrives.
    pub async fn begin_upload(&self, owner_id: Uuid, request: BeginUpload) -> Result<QueueEntry, RelayError> {
        self.owned_pairing(owner_id, request.pairing_id).await?;
        validate_manifest(&request.manifest)?;

        if let Some(expected) = request.expected_chunks {
            if expected == 0 || expected > self.limits.max_chunks {
                return Err(RelayError::InvalidChunk(format!(
                    "expected_chunks must be between 1 and {}",
                    self.limits.max_chunks
                )));
            }
        }

        let now = Utc::now();
        let entry = QueueEntry {
            id: Uuid::new_v4(),
            owner_id,
            pairing_id: request.pairing_id,
            direction: request.direction,
            manifest: request.manifest,
            status: EntryStatus::Pending,
            inline_size: None,
            chunk_count: None,
            expected_chunks: request.expected_chunks.map(|n| n as i32),
            total_size: None,
            created_at: now,
            updated_at: now,
            completed_at: None,
        };

        self.store.insert_entry(&entry, None).await?;
        self.audit(
            owner_id,
            Some(entry.pairing_id),
            Some(entry.id),
            "upload.begin",
            json!({ "direction": entry.direction, "expected_chunks": entry.expected_chunks }),
        )
        .await;
        Ok(entry)
    }

    /// Upsert one part. Re-sending an index overwrites the earlier data.
    pub async fn upload_chunk(&self, owner_id: Uuid, request: ChunkUpload) -> Result<ChunkReceipt, RelayError> {
        let entry = self.owned_entry(owner_id, request.entry_id).await?;

        if entry.has_inline_data() {
            return Err(RelayError::InlineEntry(entry.id));
        }
        if entry.is_completed() {
            return Err(RelayError::AlreadyCompleted(entry.id));
        }

        let upper = entry
            .expected_chunks
            .map(|n| n as u32)
            .unwrap_or(self.limits.max_chunks)
            .min(self.limits.max_chunks);
        if request.index >= upper {
            return Err(RelayError::InvalidChunk(format!(
                "index {} is outside 0..{}",
                request.index, upper
            )));
        }
        if request.data.is_empty() {
            return Err(RelayError::InvalidChunk("chunk data is empty".to_string()));
        }
        if request.data.len() > self.limits.chunk_size_limit_bytes {
            return Err(RelayError::ChunkTooLarge {
                size: request.data.len(),
                limit: self.limits.chunk_size_limit_bytes,
            });
        }

        // A completion may have landed since the entry was read
        let status = match self.store.upsert_chunk(entry.id, request.index, &request.data).await? {
            ChunkWrite::Stored(status) => status,
            ChunkWrite::EntrySealed => return Err(RelayError::AlreadyCompleted(entry.id)),
        };

        self.audit(
            owner_id,
            Some(entry.pairing_id),
            Some(entry.id),
            "upload.chunk",
            json!({ "index": request.index, "size": request.data.len() }),
        )
        .await;
        debug!("Stored chunk {} for entry {} ({} bytes)", request.index, entry.id, request.data.len());

        Ok(ChunkReceipt {
            entry_id: entry.id,
            index: request.index,
            size: request.data.len(),
            status,
        })
    }

    /// Seal a chunked upload: count stored chunks, sum their sizes, mark completed.
    pub async fn complete_upload(
        &self,
        owner_id: Uuid,
        entry_id: Uuid,
        total_chunks: Option<u32>,
    ) -> Result<CompletedUpload, RelayError> {
        let entry = self.owned_entry(owner_id, entry_id).await?;

        if entry.has_inline_data() {
            return Err(RelayError::InlineEntry(entry.id));
        }
        if entry.is_completed() {
            // Retried completion signal
            return Ok(CompletedUpload {
                entry,
                newly_completed: false,
            });
        }

        let stats = self.store.chunk_stats(entry.id).await?;
        let count = stats.count();
        if count == 0 {
            return Err(RelayError::NoChunks(entry.id));
        }

        let announced = entry.expected_chunks.map(|n| n as u32);
        if let (Some(announced), Some(given)) = (announced, total_chunks) {
            if announced != given {
                return Err(RelayError::CountMismatch(format!(
                    "total_chunks {} does not match the {} announced at begin",
                    given, announced
                )));
            }
        }

        match total_chunks.or(announced) {
            Some(expected) => {
                if count > expected {
                    return Err(RelayError::CountMismatch(format!(
                        "{} chunks are stored but total_chunks is {}",
                        count, expected
                    )));
                }
                let missing = stats.missing_below(expected);
                if !missing.is_empty() {
                    return Err(RelayError::Incomplete { expected, missing });
                }
            }
            None => {
                // Without a declared total the stored indices must still be 0..count
                let highest = stats.indices.last().copied().unwrap_or(0);
                let missing = stats.missing_below(highest + 1);
                if !missing.is_empty() {
                    return Err(RelayError::Incomplete {
                        expected: highest + 1,
                        missing,
                    });
                }
            }
        }

        let completed = match self.store.mark_completed(entry.id, count, stats.total_bytes).await? {
            SealOutcome::Sealed(entry) => entry,
            SealOutcome::AlreadySealed(entry) => {
                return Ok(CompletedUpload {
                    entry,
                    newly_completed: false,
                })
            }
            SealOutcome::ChunksChanged => {
                return Err(RelayError::CountMismatch(
                    "chunks changed while completing; retry the completion".to_string(),
                ))
            }
        };
        self.audit(
            owner_id,
            Some(completed.pairing_id),
            Some(completed.id),
            "upload.completed",
            json!({ "chunk_count": count, "total_size": stats.total_bytes }),
        )
        .await;
        info!(
            "Completed chunked package {} ({} chunks, {} bytes)",
            completed.id, count, stats.total_bytes
        );
        Ok(CompletedUpload {
            entry: completed,
            newly_completed: true,
        })
    }

    /// Latest completed package for a pairing, with its transfer mode
    pub async fn latest(
        &self,
        owner_id: Uuid,
        pairing_id: Uuid,
        direction: Direction,
    ) -> Result<PackageDescriptor, RelayError> {
        self.owned_pairing(owner_id, pairing_id).await?;
        self.store
            .latest_completed(owner_id, pairing_id, direction)
            .await?
            .map(PackageDescriptor::from)
            .ok_or_else(|| RelayError::NotFound(format!("completed {} package", direction.as_str())))
    }

    pub async fn list_entries(
        &self,
        owner_id: Uuid,
        pairing_id: Uuid,
        limit: Option<i64>,
    ) -> Result<Vec<PackageDescriptor>, RelayError> {
        self.owned_pairing(owner_id, pairing_id).await?;
        let entries = self
            .store
            .list_entries(owner_id, pairing_id, self.clamp_limit(limit))
            .await?;
        Ok(entries.into_iter().map(PackageDescriptor::from).collect())
    }

    pub async fn fetch_blob(&self, owner_id: Uuid, entry_id: Uuid) -> Result<Vec<u8>, RelayError> {
        let entry = self.owned_entry(owner_id, entry_id).await?;
        if !entry.is_completed() {
            return Err(RelayError::NotCompleted(entry.id));
        }
        if !entry.has_inline_data() {
            return Err(RelayError::Validation(format!(
                "queue entry {} has no inline data (transfer mode {:?})",
                entry.id,
                entry.transfer_mode()
            )));
        }

        self.store
            .fetch_inline(entry.id)
            .await?
            .ok_or_else(|| RelayError::NotFound("inline data".to_string()))
    }

    pub async fn fetch_chunk(&self, owner_id: Uuid, entry_id: Uuid, index: u32) -> Result<Vec<u8>, RelayError> {
        let entry = self.owned_entry(owner_id, entry_id).await?;
        if !entry.is_completed() {
            return Err(RelayError::NotCompleted(entry.id));
        }

        let count = entry.chunk_count.unwrap_or(0).max(0) as u32;
        if count == 0 {
            return Err(RelayError::Validation(format!(
                "queue entry {} has no chunks (transfer mode {:?})",
                entry.id,
                entry.transfer_mode()
            )));
        }
        if index >= count {
            return Err(RelayError::InvalidChunk(format!("index {} is outside 0..{}", index, count)));
        }

        self.store
            .fetch_chunk(entry.id, index)
            .await?
            .ok_or_else(|| RelayError::NotFound(format!("chunk {}", index)))
    }

    pub async fn report_conflict(&self, owner_id: Uuid, request: ReportConflict) -> Result<Conflict, RelayError> {
        self.owned_pairing(owner_id, request.pairing_id).await?;

        if let Some(entry_id) = request.entry_id {
            let entry = self.owned_entry(owner_id, entry_id).await?;
            if entry.pairing_id != request.pairing_id {
                return Err(RelayError::Validation(format!(
                    "queue entry {} does not belong to pairing {}",
                    entry_id, request.pairing_id
                )));
            }
        }

        let conflict = Conflict {
            id: Uuid::new_v4(),
            owner_id,
            pairing_id: request.pairing_id,
            queue_id: request.entry_id,
            item_key: required_text("item_key", &request.item_key, MAX_ITEM_KEY_LENGTH)?,
            local_version: request.local_version,
            remote_version: request.remote_version,
            detail: request.detail.unwrap_or_else(|| json!({})),
            resolution: None,
            detected_at: Utc::now(),
            resolved_at: None,
        };

        self.store.insert_conflict(&conflict).await?;
        self.audit(
            owner_id,
            Some(conflict.pairing_id),
            conflict.queue_id,
            "conflict.reported",
            json!({ "conflict_id": conflict.id, "item_key": conflict.item_key }),
        )
        .await;
        Ok(conflict)
    }

    pub async fn resolve_conflict(
        &self,
        owner_id: Uuid,
        conflict_id: Uuid,
        resolution: &str,
    ) -> Result<Conflict, RelayError> {
        let resolution = required_text("resolution", resolution, MAX_LABEL_LENGTH)?;
        let conflict = self
            .store
            .resolve_conflict(owner_id, conflict_id, &resolution)
            .await?
            .ok_or_else(|| RelayError::NotFound("conflict".to_string()))?;

        self.audit(
            owner_id,
            Some(conflict.pairing_id),
            conflict.queue_id,
            "conflict.resolved",
            json!({ "conflict_id": conflict.id, "resolution": resolution }),
        )
        .await;
        Ok(conflict)
    }

    pub async fn list_conflicts(
        &self,
        owner_id: Uuid,
        pairing_id: Uuid,
        unresolved_only: bool,
    ) -> Result<Vec<Conflict>, RelayError> {
        self.owned_pairing(owner_id, pairing_id).await?;
        Ok(self.store.list_conflicts(owner_id, pairing_id, unresolved_only).await?)
    }

    pub async fn audit_log(
        &self,
        owner_id: Uuid,
        pairing_id: Option<Uuid>,
        limit: Option<i64>,
    ) -> Result<Vec<AuditEvent>, RelayError> {
        if let Some(pairing_id) = pairing_id {
            self.owned_pairing(owner_id, pairing_id).await?;
        }
        Ok(self.store.list_audit(owner_id, pairing_id, self.clamp_limit(limit)).await?)
    }

    async fn owned_pairing(&self, owner_id: Uuid, pairing_id: Uuid) -> Result<Pairing, RelayError> {
        self.store
            .find_pairing(owner_id, pairing_id)
            .await?
            .ok_or_else(|| RelayError::NotFound("pairing".to_string()))
    }

    async fn owned_entry(&self, owner_id: Uuid, entry_id: Uuid) -> Result<QueueEntry, RelayError> {
        self.store
            .find_entry(owner_id, entry_id)
            .await?
            .ok_or_else(|| RelayError::NotFound("queue entry".to_string()))
    }

    /// Append to the audit trail. A failed audit write never fails the operation.
    async fn audit(
        &self,
        owner_id: Uuid,
        pairing_id: Option<Uuid>,
        queue_id: Option<Uuid>,
        action: &'static str,
        detail: Value,
    ) {
        let event = NewAuditEvent {
            owner_id,
            pairing_id,
            queue_id,
            action,
            detail,
        };
        if let Err(e) = self.store.append_audit(event).await {
            error!("Failed to append audit event '{}': {}", action, e);
        }
    }

    fn clamp_limit(&self, limit: Option<i64>) -> i64 {
        limit.unwrap_or(self.limits.default_list_limit).clamp(1, MAX_LIST_LIMIT)
    }
}

fn required_text(field: &str, value: &str, max_length: usize) -> Result<String, RelayError> {
    let value = value.trim();
    if value.is_empty() {
        return Err(RelayError::Validation(format!("{} is required", field)));
    }
    if value.chars().count() > max_length {
        return Err(RelayError::Validation(format!(
            "{} must be at most {} characters",
            field, max_length
        )));
    }
    Ok(value.to_string())
}

fn validate_manifest(manifest: &Value) -> Result<(), RelayError> {
    if manifest.is_object() {
        Ok(())
    } else {
        Err(RelayError::Validation("manifest must be a JSON object".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::relay::memory::MemoryRelayStore;
    use crate::relay::types::TransferMode;

    fn limits() -> SyncConfig {
        SyncConfig {
            inline_threshold_bytes: 16,
            chunk_size_limit_bytes: 8,
            max_chunks: 10,
            default_list_limit: 50,
        }
    }

    async fn setup() -> (RelayService<MemoryRelayStore>, Uuid, Pairing) {
        let service = RelayService::new(MemoryRelayStore::default(), limits());
        let owner = Uuid::new_v4();
        let pairing = service
            .create_pairing(
                owner,
                CreatePairing {
                    name: "studio".to_string(),
                    source_label: "laptop".to_string(),
                    target_label: "cloud".to_string(),
                },
            )
            .await
            .unwrap();
        (service, owner, pairing)
    }

    fn manifest() -> Value {
        json!({ "files": ["workflow.json"], "version": 3 })
    }

    async fn begin(service: &RelayService<MemoryRelayStore>, owner: Uuid, pairing: &Pairing, expected: Option<u32>) -> QueueEntry {
        service
            .begin_upload(
                owner,
                BeginUpload {
                    pairing_id: pairing.id,
                    direction: Direction::Inbound,
                    manifest: manifest(),
                    expected_chunks: expected,
                },
            )
            .await
            .unwrap()
    }

    async fn chunk(
        service: &RelayService<MemoryRelayStore>,
        owner: Uuid,
        entry_id: Uuid,
        index: u32,
        data: &[u8],
    ) -> Result<ChunkReceipt, RelayError> {
        service
            .upload_chunk(owner, ChunkUpload { entry_id, index, data: data.to_vec() })
            .await
    }

    #[tokio::test]
    async fn duplicate_pairing_name_conflicts() {
        let (service, owner, _) = setup().await;
        let again = service
            .create_pairing(
                owner,
                CreatePairing {
                    name: "studio".to_string(),
                    source_label: "a".to_string(),
                    target_label: "b".to_string(),
                },
            )
            .await;
        assert!(matches!(again, Err(RelayError::DuplicatePairing(_))));
    }

    #[tokio::test]
    async fn small_package_is_stored_inline_and_completed() {
        let (service, owner, pairing) = setup().await;
        let entry = service
            .upload_inline(
                owner,
                InlineUpload {
                    pairing_id: pairing.id,
                    direction: Direction::Inbound,
                    manifest: manifest(),
                    data: Some(b"zip-bytes".to_vec()),
                },
            )
            .await
            .unwrap();

        assert_eq!(entry.status, EntryStatus::Completed);
        assert_eq!(entry.transfer_mode(), TransferMode::Inline);
        assert_eq!(entry.total_size, Some(9));

        let latest = service.latest(owner, pairing.id, Direction::Inbound).await.unwrap();
        assert_eq!(latest.entry.id, entry.id);
        assert_eq!(latest.transfer_mode, TransferMode::Inline);
        assert_eq!(service.fetch_blob(owner, entry.id).await.unwrap(), b"zip-bytes".to_vec());
    }

    #[tokio::test]
    async fn oversized_inline_upload_is_rejected() {
        let (service, owner, pairing) = setup().await;
        let result = service
            .upload_inline(
                owner,
                InlineUpload {
                    pairing_id: pairing.id,
                    direction: Direction::Inbound,
                    manifest: manifest(),
                    data: Some(vec![0u8; 17]),
                },
            )
            .await;
        assert!(matches!(result, Err(RelayError::PayloadTooLarge { size: 17, limit: 16 })));
    }

    #[tokio::test]
    async fn upload_without_data_is_manifest_only() {
        let (service, owner, pairing) = setup().await;
        let entry = service
            .upload_inline(
                owner,
                InlineUpload {
                    pairing_id: pairing.id,
                    direction: Direction::Inbound,
                    manifest: manifest(),
                    data: Some(Vec::new()),
                },
            )
            .await
            .unwrap();
        assert_eq!(entry.transfer_mode(), TransferMode::ManifestOnly);
        assert!(matches!(service.fetch_blob(owner, entry.id).await, Err(RelayError::Validation(_))));
    }

    #[tokio::test]
    async fn manifest_must_be_an_object() {
        let (service, owner, pairing) = setup().await;
        let result = service
            .upload_inline(
                owner,
                InlineUpload {
                    pairing_id: pairing.id,
                    direction: Direction::Inbound,
                    manifest: json!(["not", "an", "object"]),
                    data: None,
                },
            )
            .await;
        assert!(matches!(result, Err(RelayError::Validation(_))));
    }

    #[tokio::test]
    async fn chunks_arrive_out_of_order_and_complete() {
        let (service, owner, pairing) = setup().await;
        let entry = begin(&service, owner, &pairing, None).await;
        assert_eq!(entry.status, EntryStatus::Pending);

        let receipt = chunk(&service, owner, entry.id, 2, b"ghi").await.unwrap();
        assert_eq!(receipt.status, EntryStatus::Processing);
        chunk(&service, owner, entry.id, 0, b"abc").await.unwrap();
        chunk(&service, owner, entry.id, 1, b"def").await.unwrap();

        let completed = service.complete_upload(owner, entry.id, Some(3)).await.unwrap().entry;
        assert_eq!(completed.status, EntryStatus::Completed);
        assert_eq!(completed.chunk_count, Some(3));
        assert_eq!(completed.total_size, Some(9));
        assert_eq!(completed.transfer_mode(), TransferMode::Chunked);

        let latest = service.latest(owner, pairing.id, Direction::Inbound).await.unwrap();
        assert_eq!(latest.transfer_mode, TransferMode::Chunked);
        assert_eq!(service.fetch_chunk(owner, entry.id, 1).await.unwrap(), b"def".to_vec());
        assert!(matches!(
            service.fetch_chunk(owner, entry.id, 3).await,
            Err(RelayError::InvalidChunk(_))
        ));
    }

    #[tokio::test]
    async fn resending_a_chunk_overwrites_it() {
        let (service, owner, pairing) = setup().await;
        let entry = begin(&service, owner, &pairing, Some(2)).await;

        chunk(&service, owner, entry.id, 0, b"stale").await.unwrap();
        chunk(&service, owner, entry.id, 0, b"fresh!").await.unwrap();
        chunk(&service, owner, entry.id, 1, b"xy").await.unwrap();

        let completed = service.complete_upload(owner, entry.id, None).await.unwrap().entry;
        assert_eq!(completed.chunk_count, Some(2));
        assert_eq!(completed.total_size, Some(8));
        assert_eq!(service.fetch_chunk(owner, entry.id, 0).await.unwrap(), b"fresh!".to_vec());
    }

    #[tokio::test]
    async fn completion_reports_missing_indices() {
        let (service, owner, pairing) = setup().await;
        let entry = begin(&service, owner, &pairing, None).await;
        chunk(&service, owner, entry.id, 0, b"a").await.unwrap();
        chunk(&service, owner, entry.id, 3, b"d").await.unwrap();

        match service.complete_upload(owner, entry.id, Some(5)).await {
            Err(RelayError::Incomplete { expected, missing }) => {
                assert_eq!(expected, 5);
                assert_eq!(missing, vec![1, 2, 4]);
            }
            other => panic!("unexpected: {:?}", other),
        }

        // Without a declared total, gaps below the highest index still block completion
        match service.complete_upload(owner, entry.id, None).await {
            Err(RelayError::Incomplete { expected, missing }) => {
                assert_eq!(expected, 4);
                assert_eq!(missing, vec![1, 2]);
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[tokio::test]
    async fn late_chunk_cannot_land_in_a_sealed_entry() {
        let (service, owner, pairing) = setup().await;
        let entry = begin(&service, owner, &pairing, None).await;
        chunk(&service, owner, entry.id, 0, b"abc").await.unwrap();
        service.complete_upload(owner, entry.id, None).await.unwrap();

        // A writer that read the entry before it was sealed reaches the store afterwards
        let write = service.store.upsert_chunk(entry.id, 1, b"late").await.unwrap();
        assert_eq!(write, ChunkWrite::EntrySealed);
        assert_eq!(service.store.fetch_chunk(entry.id, 1).await.unwrap(), None);
        assert!(matches!(
            chunk(&service, owner, entry.id, 1, b"late").await,
            Err(RelayError::AlreadyCompleted(_))
        ));

        let latest = service.latest(owner, pairing.id, Direction::Inbound).await.unwrap();
        assert_eq!(latest.entry.status, EntryStatus::Completed);
        assert_eq!(latest.entry.chunk_count, Some(1));
        assert_eq!(latest.entry.total_size, Some(3));
    }

    #[tokio::test]
    async fn seal_refuses_stale_chunk_totals() {
        let (service, owner, pairing) = setup().await;
        let entry = begin(&service, owner, &pairing, None).await;
        chunk(&service, owner, entry.id, 0, b"abc").await.unwrap();

        // Totals counted before chunk 1 arrived no longer hold
        chunk(&service, owner, entry.id, 1, b"def").await.unwrap();
        assert!(matches!(
            service.store.mark_completed(entry.id, 1, 3).await.unwrap(),
            SealOutcome::ChunksChanged
        ));

        let completed = service.complete_upload(owner, entry.id, None).await.unwrap();
        assert!(completed.newly_completed);
        assert_eq!(completed.entry.chunk_count, Some(2));

        // A second sealer loses to the first
        assert!(matches!(
            service.store.mark_completed(entry.id, 2, 6).await.unwrap(),
            SealOutcome::AlreadySealed(_)
        ));
    }

    #[tokio::test]
    async fn completion_requires_chunks() {
        let (service, owner, pairing) = setup().await;
        let entry = begin(&service, owner, &pairing, None).await;
        assert!(matches!(
            service.complete_upload(owner, entry.id, None).await,
            Err(RelayError::NoChunks(_))
        ));
    }

    #[tokio::test]
    async fn total_must_match_announcement() {
        let (service, owner, pairing) = setup().await;
        let entry = begin(&service, owner, &pairing, Some(2)).await;
        chunk(&service, owner, entry.id, 0, b"a").await.unwrap();
        chunk(&service, owner, entry.id, 1, b"b").await.unwrap();
        assert!(matches!(
            service.complete_upload(owner, entry.id, Some(3)).await,
            Err(RelayError::CountMismatch(_))
        ));
    }

    #[tokio::test]
    async fn completed_entries_reject_chunks_and_tolerate_retried_completion() {
        let (service, owner, pairing) = setup().await;
        let entry = begin(&service, owner, &pairing, None).await;
        chunk(&service, owner, entry.id, 0, b"only").await.unwrap();
        let first = service.complete_upload(owner, entry.id, None).await.unwrap();
        assert!(first.newly_completed);

        assert!(matches!(
            chunk(&service, owner, entry.id, 1, b"late").await,
            Err(RelayError::AlreadyCompleted(_))
        ));

        let again = service.complete_upload(owner, entry.id, None).await.unwrap();
        assert!(!again.newly_completed);
        assert_eq!(again.entry.completed_at, first.entry.completed_at);
        assert_eq!(again.entry.chunk_count, Some(1));
    }

    #[tokio::test]
    async fn inline_entries_never_take_chunks() {
        let (service, owner, pairing) = setup().await;
        let entry = service
            .upload_inline(
                owner,
                InlineUpload {
                    pairing_id: pairing.id,
                    direction: Direction::Inbound,
                    manifest: manifest(),
                    data: Some(b"tiny".to_vec()),
                },
            )
            .await
            .unwrap();

        assert!(matches!(
            chunk(&service, owner, entry.id, 0, b"x").await,
            Err(RelayError::InlineEntry(_))
        ));
        assert!(matches!(
            service.complete_upload(owner, entry.id, None).await,
            Err(RelayError::InlineEntry(_))
        ));
    }

    #[tokio::test]
    async fn chunk_bounds_are_enforced() {
        let (service, owner, pairing) = setup().await;
        let entry = begin(&service, owner, &pairing, Some(3)).await;

        assert!(matches!(chunk(&service, owner, entry.id, 3, b"x").await, Err(RelayError::InvalidChunk(_))));
        assert!(matches!(chunk(&service, owner, entry.id, 0, b"").await, Err(RelayError::InvalidChunk(_))));
        assert!(matches!(
            chunk(&service, owner, entry.id, 0, b"123456789").await,
            Err(RelayError::ChunkTooLarge { size: 9, limit: 8 })
        ));

        let open = begin(&service, owner, &pairing, None).await;
        assert!(matches!(chunk(&service, owner, open.id, 10, b"x").await, Err(RelayError::InvalidChunk(_))));
        assert!(chunk(&service, owner, open.id, 9, b"x").await.is_ok());
    }

    #[tokio::test]
    async fn unfinished_entries_are_not_served() {
        let (service, owner, pairing) = setup().await;
        let entry = begin(&service, owner, &pairing, None).await;
        chunk(&service, owner, entry.id, 0, b"a").await.unwrap();

        assert!(matches!(
            service.fetch_chunk(owner, entry.id, 0).await,
            Err(RelayError::NotCompleted(_))
        ));
        assert!(matches!(
            service.latest(owner, pairing.id, Direction::Inbound).await,
            Err(RelayError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn latest_respects_direction_and_recency() {
        let (service, owner, pairing) = setup().await;
        let upload = |direction: Direction, body: &'static [u8]| InlineUpload {
            pairing_id: pairing.id,
            direction,
            manifest: manifest(),
            data: Some(body.to_vec()),
        };

        service.upload_inline(owner, upload(Direction::Inbound, b"one")).await.unwrap();
        let second = service.upload_inline(owner, upload(Direction::Inbound, b"two")).await.unwrap();
        let outbound = service.upload_inline(owner, upload(Direction::Outbound, b"out")).await.unwrap();

        assert_eq!(service.latest(owner, pairing.id, Direction::Inbound).await.unwrap().entry.id, second.id);
        assert_eq!(service.latest(owner, pairing.id, Direction::Outbound).await.unwrap().entry.id, outbound.id);
        assert_eq!(service.list_entries(owner, pairing.id, None).await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn other_owners_see_nothing() {
        let (service, owner, pairing) = setup().await;
        let entry = begin(&service, owner, &pairing, None).await;
        let intruder = Uuid::new_v4();

        assert!(matches!(
            chunk(&service, intruder, entry.id, 0, b"x").await,
            Err(RelayError::NotFound(_))
        ));
        assert!(matches!(
            service.latest(intruder, pairing.id, Direction::Inbound).await,
            Err(RelayError::NotFound(_))
        ));
        assert!(service.list_pairings(intruder).await.unwrap().is_empty());
        assert!(service.audit_log(intruder, None, None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn conflicts_are_recorded_and_resolved() {
        let (service, owner, pairing) = setup().await;
        let conflict = service
            .report_conflict(
                owner,
                ReportConflict {
                    pairing_id: pairing.id,
                    entry_id: None,
                    item_key: "workflows/onboarding".to_string(),
                    local_version: Some("v3".to_string()),
                    remote_version: Some("v4".to_string()),
                    detail: None,
                },
            )
            .await
            .unwrap();

        assert_eq!(service.list_conflicts(owner, pairing.id, true).await.unwrap().len(), 1);

        let resolved = service.resolve_conflict(owner, conflict.id, "keep_remote").await.unwrap();
        assert_eq!(resolved.resolution.as_deref(), Some("keep_remote"));
        assert!(resolved.resolved_at.is_some());

        assert!(service.list_conflicts(owner, pairing.id, true).await.unwrap().is_empty());
        assert_eq!(service.list_conflicts(owner, pairing.id, false).await.unwrap().len(), 1);
        assert!(matches!(
            service.resolve_conflict(Uuid::new_v4(), conflict.id, "keep_local").await,
            Err(RelayError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn mutations_leave_an_audit_trail() {
        let (service, owner, pairing) = setup().await;
        let entry = begin(&service, owner, &pairing, None).await;
        chunk(&service, owner, entry.id, 0, b"a").await.unwrap();
        service.complete_upload(owner, entry.id, None).await.unwrap();

        let actions: Vec<String> = service
            .audit_log(owner, Some(pairing.id), None)
            .await
            .unwrap()
            .into_iter()
            .map(|e| e.action)
            .collect();

        // Newest first
        assert_eq!(
            actions,
            vec!["upload.completed", "upload.chunk", "upload.begin", "pairing.created"]
        );
    }
}
