// relay - multi-tenant package relay between the two endpoints of a pairing
//
// Small packages are stored inline on their queue entry. Large packages are
// uploaded as indexed chunks (each an idempotent upsert) and sealed by an
// explicit completion signal. Readers ask for the latest completed entry and
// are told whether to fetch a blob, fetch chunks, or use the manifest alone.

use thiserror::Error;
use uuid::Uuid;

use crate::database::DatabaseError;

pub mod chunking;
pub mod codec;
pub mod postgres;
pub mod service;
pub mod store;
pub mod types;

#[cfg(test)]
pub mod memory;

pub use postgres::PgRelayStore;
pub use service::RelayService;
pub use store::RelayStore;
pub use types::*;

#[derive(Debug, Error)]
pub enum RelayError {
    #[error("{0} not found")]
    NotFound(String),

    #[error("a pairing named '{0}' already exists")]
    DuplicatePairing(String),

    #[error("payload of {size} bytes exceeds the inline limit of {limit} bytes, use chunked upload")]
    PayloadTooLarge { size: usize, limit: usize },

    #[error("chunk of {size} bytes exceeds the chunk limit of {limit} bytes")]
    ChunkTooLarge { size: usize, limit: usize },

    #[error("invalid chunk: {0}")]
    InvalidChunk(String),

    #[error("queue entry {0} is already completed")]
    AlreadyCompleted(Uuid),

    #[error("queue entry {0} holds inline data and cannot take chunks")]
    InlineEntry(Uuid),

    #[error("queue entry {0} is not completed yet")]
    NotCompleted(Uuid),

    #[error("queue entry {0} has no uploaded chunks")]
    NoChunks(Uuid),

    #[error("chunk count mismatch: {0}")]
    CountMismatch(String),

    #[error("upload incomplete: expected {expected} chunks, missing indices {missing:?}")]
    Incomplete { expected: u32, missing: Vec<u32> },

    #[error("{0}")]
    InvalidEncoding(String),

    #[error("{0}")]
    Validation(String),

    #[error(transparent)]
    Database(#[from] DatabaseError),
}
