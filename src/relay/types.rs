use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::FromRow;
use uuid::Uuid;

/// Which way a package travels through a pairing
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    #[default]
    Inbound,
    Outbound,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Inbound => "inbound",
            Direction::Outbound => "outbound",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "inbound" => Some(Direction::Inbound),
            "outbound" => Some(Direction::Outbound),
            _ => None,
        }
    }
}

/// Queue entry lifecycle: pending -> processing -> completed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryStatus {
    Pending,
    Processing,
    Completed,
}

impl EntryStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntryStatus::Pending => "pending",
            EntryStatus::Processing => "processing",
            EntryStatus::Completed => "completed",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(EntryStatus::Pending),
            "processing" => Some(EntryStatus::Processing),
            "completed" => Some(EntryStatus::Completed),
            _ => None,
        }
    }
}

/// How a completed package is retrieved
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransferMode {
    /// Fetch the blob directly
    Inline,
    /// Fetch chunks one by one by index
    Chunked,
    /// No payload; the manifest is self-contained
    ManifestOnly,
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Pairing {
    pub id: Uuid,
    pub owner_id: Uuid,
    pub name: String,
    pub source_label: String,
    pub target_label: String,
    pub created_at: DateTime<Utc>,
}

/// One transfer unit. Payload bytes are never held here: inline entries
/// record their size, chunked entries their count.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueEntry {
    pub id: Uuid,
    pub owner_id: Uuid,
    pub pairing_id: Uuid,
    pub direction: Direction,
    pub manifest: Value,
    pub status: EntryStatus,
    pub inline_size: Option<i64>,
    pub chunk_count: Option<i32>,
    pub expected_chunks: Option<i32>,
    pub total_size: Option<i64>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl QueueEntry {
    pub fn is_completed(&self) -> bool {
        self.status == EntryStatus::Completed
    }

    pub fn has_inline_data(&self) -> bool {
        self.inline_size.is_some()
    }

    pub fn transfer_mode(&self) -> TransferMode {
        if self.has_inline_data() {
            TransferMode::Inline
        } else if self.chunk_count.unwrap_or(0) > 0 {
            TransferMode::Chunked
        } else {
            TransferMode::ManifestOnly
        }
    }
}

/// A queue entry annotated with how to fetch its payload
#[derive(Debug, Clone, Serialize)]
pub struct PackageDescriptor {
    #[serde(flatten)]
    pub entry: QueueEntry,
    pub transfer_mode: TransferMode,
}

impl From<QueueEntry> for PackageDescriptor {
    fn from(entry: QueueEntry) -> Self {
        let transfer_mode = entry.transfer_mode();
        Self { entry, transfer_mode }
    }
}

/// Aggregate view of the chunks stored for one entry
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChunkStats {
    /// Stored indices in ascending order
    pub indices: Vec<u32>,
    pub total_bytes: u64,
}

impl ChunkStats {
    pub fn count(&self) -> u32 {
        self.indices.len() as u32
    }

    /// Indices below `total` that have no stored chunk
    pub fn missing_below(&self, total: u32) -> Vec<u32> {
        (0..total).filter(|i| self.indices.binary_search(i).is_err()).collect()
    }
}

/// Outcome of writing one chunk
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkWrite {
    /// Stored; carries the entry status after the write
    Stored(EntryStatus),
    /// The entry was sealed before the write landed; nothing was stored
    EntrySealed,
}

/// Outcome of sealing a chunked entry
#[derive(Debug, Clone)]
pub enum SealOutcome {
    Sealed(QueueEntry),
    /// An earlier completion signal won
    AlreadySealed(QueueEntry),
    /// Stored chunks no longer match the counted totals
    ChunksChanged,
}

/// Result of a completion signal. `newly_completed` is false when the
/// entry was already sealed by an earlier signal.
#[derive(Debug, Clone)]
pub struct CompletedUpload {
    pub entry: QueueEntry,
    pub newly_completed: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct ChunkReceipt {
    pub entry_id: Uuid,
    pub index: u32,
    pub size: usize,
    pub status: EntryStatus,
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Conflict {
    pub id: Uuid,
    pub owner_id: Uuid,
    pub pairing_id: Uuid,
    pub queue_id: Option<Uuid>,
    pub item_key: String,
    pub local_version: Option<String>,
    pub remote_version: Option<String>,
    pub detail: Value,
    pub resolution: Option<String>,
    pub detected_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct AuditEvent {
    pub id: i64,
    pub owner_id: Uuid,
    pub pairing_id: Option<Uuid>,
    pub queue_id: Option<Uuid>,
    pub action: String,
    pub detail: Value,
    pub created_at: DateTime<Utc>,
}

/// Audit row before the store assigns its id
#[derive(Debug, Clone)]
pub struct NewAuditEvent {
    pub owner_id: Uuid,
    pub pairing_id: Option<Uuid>,
    pub queue_id: Option<Uuid>,
    pub action: &'static str,
    pub detail: Value,
}

// Requests accepted by RelayService. Payloads are already decoded.

#[derive(Debug, Clone, Deserialize)]
pub struct CreatePairing {
    pub name: String,
    pub source_label: String,
    pub target_label: String,
}

#[derive(Debug, Clone)]
pub struct InlineUpload {
    pub pairing_id: Uuid,
    pub direction: Direction,
    pub manifest: Value,
    pub data: Option<Vec<u8>>,
}

#[derive(Debug, Clone)]
pub struct BeginUpload {
    pub pairing_id: Uuid,
    pub direction: Direction,
    pub manifest: Value,
    pub expected_chunks: Option<u32>,
}

#[derive(Debug, Clone)]
pub struct ChunkUpload {
    pub entry_id: Uuid,
    pub index: u32,
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ReportConflict {
    pub pairing_id: Uuid,
    pub entry_id: Option<Uuid>,
    pub item_key: String,
    pub local_version: Option<String>,
    pub remote_version: Option<String>,
    #[serde(default)]
    pub detail: Option<Value>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn entry() -> QueueEntry {
        let now = Utc::now();
        QueueEntry {
            id: Uuid::new_v4(),
            owner_id: Uuid::new_v4(),
            pairing_id: Uuid::new_v4(),
            direction: Direction::Inbound,
            manifest: json!({}),
            status: EntryStatus::Completed,
            inline_size: None,
            chunk_count: None,
            expected_chunks: None,
            total_size: None,
            created_at: now,
            updated_at: now,
            completed_at: Some(now),
        }
    }

    #[test]
    fn transfer_mode_follows_payload_shape() {
        let mut e = entry();
        assert_eq!(e.transfer_mode(), TransferMode::ManifestOnly);

        e.chunk_count = Some(0);
        assert_eq!(e.transfer_mode(), TransferMode::ManifestOnly);

        e.chunk_count = Some(3);
        assert_eq!(e.transfer_mode(), TransferMode::Chunked);

        e.chunk_count = None;
        e.inline_size = Some(0);
        assert_eq!(e.transfer_mode(), TransferMode::Inline);
    }

    #[test]
    fn descriptor_serializes_flat() {
        let mut e = entry();
        e.chunk_count = Some(2);
        let value = serde_json::to_value(PackageDescriptor::from(e)).unwrap();
        assert_eq!(value["transfer_mode"], "chunked");
        assert_eq!(value["direction"], "inbound");
        assert_eq!(value["status"], "completed");
    }

    #[test]
    fn missing_indices_are_reported() {
        let stats = ChunkStats { indices: vec![0, 2, 3], total_bytes: 30 };
        assert_eq!(stats.missing_below(5), vec![1, 4]);
        assert!(stats.missing_below(2).contains(&1));
    }
}
