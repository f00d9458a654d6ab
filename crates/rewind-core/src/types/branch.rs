//! Branch: a named lineage of turns.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::BranchId;

/// A named lineage of turns, optionally forked from another branch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Branch {
    /// Branch identifier.
    pub id: BranchId,
    /// Human readable name (`main`, `branch_from_12`, ...).
    pub name: String,
    /// Next turn index to assign.
    pub turn_counter: i64,
    /// Parent branch, `None` for a root.
    pub forked_from_branch_id: Option<BranchId>,
    /// Highest parent turn index visible from this branch.
    pub forked_from_turn_index: Option<i64>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Branch {
    /// Whether this branch has no parent.
    pub fn is_root(&self) -> bool {
        self.forked_from_branch_id.is_none()
    }

    /// Parent branch and fork index, if forked.
    pub fn fork_point(&self) -> Option<(BranchId, i64)> {
        match (self.forked_from_branch_id, self.forked_from_turn_index) {
            (Some(parent), Some(index)) => Some((parent, index)),
            _ => None,
        }
    }

    /// Index of the last assigned turn, `-1` when none was ever opened.
    pub fn last_index(&self) -> i64 {
        self.turn_counter - 1
    }
}

/// Parameters for inserting a branch into the ledger.
#[derive(Debug, Clone, PartialEq)]
pub struct NewBranch {
    pub name: String,
    /// `(parent, fork_turn_index)`, already validated.
    pub fork_point: Option<(BranchId, i64)>,
}

impl NewBranch {
    /// A root branch.
    pub fn root(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            fork_point: None,
        }
    }

    /// A branch forked from `parent` at `fork_turn_index`.
    pub fn fork(name: impl Into<String>, parent: BranchId, fork_turn_index: i64) -> Self {
        Self {
            name: name.into(),
            fork_point: Some((parent, fork_turn_index)),
        }
    }
}
