//! Record store trait: backend-specific persistence of turn-tagged records.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::RewindResult;
use crate::query::CompiledQuery;
use crate::types::{Payload, SchemaDescriptor, TurnId, VersionedRecord, VisibleTurns};

/// What a backend can evaluate natively.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct StoreCapabilities {
    /// Nearest-neighbour search over vector fields.
    pub similarity: bool,
}

impl StoreCapabilities {
    pub const RELATIONAL: Self = Self { similarity: false };
    pub const VECTOR: Self = Self { similarity: true };
}

/// Core RecordStore trait - every backend implements this.
///
/// A store is bound to one namespace (one entity type). Rows carry
/// `(logical_key, turn_id, payload)`; a row with no payload is a tombstone.
/// Reads receive the already-resolved [`VisibleTurns`] and must apply the
/// shadowing rule: per logical key only the row of the best-ranked visible
/// turn counts, and a winning tombstone hides the key entirely.
#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Physical namespace name.
    fn namespace(&self) -> &str;

    /// Schema the namespace was created with.
    fn schema(&self) -> &SchemaDescriptor;

    fn capabilities(&self) -> StoreCapabilities;

    /// Create the namespace. Idempotent.
    async fn create_namespace(&self) -> RewindResult<()>;

    /// Drop the namespace and every record in it.
    async fn drop_namespace(&self) -> RewindResult<()>;

    /// Store a version of `logical_key` written by `turn_id`.
    ///
    /// Fails with `DuplicateLogicalKeyInTurn` if the turn already wrote the key.
    async fn put(&self, logical_key: &str, turn_id: TurnId, payload: &Payload)
        -> RewindResult<()>;

    /// Record the deletion of `logical_key` in `turn_id`.
    async fn put_tombstone(&self, logical_key: &str, turn_id: TurnId) -> RewindResult<()>;

    /// Current version of `logical_key` as seen through `visible`.
    async fn get_latest(
        &self,
        logical_key: &str,
        visible: &VisibleTurns,
    ) -> RewindResult<Option<VersionedRecord>>;

    /// Filtered, ordered and paged read of the current versions.
    async fn scan(
        &self,
        visible: &VisibleTurns,
        query: &CompiledQuery,
    ) -> RewindResult<Vec<VersionedRecord>>;

    /// Number of physical rows, every version and tombstone included.
    async fn count(&self) -> RewindResult<u64>;
}
