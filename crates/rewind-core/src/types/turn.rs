//! Turn: one causal unit of work within a branch.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString, IntoStaticStr};

use super::{BranchId, TurnId};

/// Lifecycle state of a turn.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    Display,
    EnumString,
    IntoStaticStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum TurnStatus {
    /// Open for writes, invisible to reads.
    Staged,
    /// Durable and visible.
    Committed,
    /// Abandoned; its index stays consumed.
    Reverted,
}

impl TurnStatus {
    /// Storage representation.
    pub fn as_str(&self) -> &'static str {
        self.into()
    }

    /// COMMITTED and REVERTED never change again.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Staged)
    }
}

/// One unit of causal history within a branch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Turn {
    pub id: TurnId,
    pub branch_id: BranchId,
    /// Position within the branch, contiguous from 0.
    pub index: i64,
    pub status: TurnStatus,
    pub created_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub message: Option<String>,
    /// Free-form attributes supplied when the turn was opened.
    #[serde(default)]
    pub metadata: serde_json::Map<String, serde_json::Value>,
}

impl Turn {
    pub fn is_staged(&self) -> bool {
        self.status == TurnStatus::Staged
    }

    pub fn is_committed(&self) -> bool {
        self.status == TurnStatus::Committed
    }
}
