//! Versioned records as read back from a record store.

use serde::{Deserialize, Serialize};

use super::{BranchId, TurnId};

/// Opaque record body: a JSON object.
pub type Payload = serde_json::Map<String, serde_json::Value>;

/// A record version that won the visibility contest for its logical key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VersionedRecord {
    /// Identity of the entity across versions.
    pub logical_key: String,
    /// Turn that wrote this version.
    pub turn_id: TurnId,
    pub payload: Payload,
    /// Similarity score, set only by similarity scans.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub score: Option<f32>,
}

impl VersionedRecord {
    pub fn new(logical_key: impl Into<String>, turn_id: TurnId, payload: Payload) -> Self {
        Self {
            logical_key: logical_key.into(),
            turn_id,
            payload,
            score: None,
        }
    }
}

/// Result of a save: the payload plus where it was written.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SavedRecord {
    pub logical_key: String,
    pub branch_id: BranchId,
    pub turn_id: TurnId,
    pub payload: Payload,
}
