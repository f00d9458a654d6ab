//! Ancestry resolution: which committed turns a read may see.
//!
//! A read from branch `B` at an optional turn index walks the fork chain
//! from `B` to its root, producing one [`VisibilitySegment`] per branch.
//! The first segment is bounded by the cursor (or the branch's last
//! assigned index); every further segment is bounded by the fork index
//! recorded on the child, so parent turns made after a fork stay invisible
//! to the fork.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error};

use crate::error::{RewindError, RewindResult};
use crate::runtime::with_timeout;
use crate::traits::LedgerStore;
use crate::types::{BranchId, VisibilitySegment, VisibleTurns};

/// Resolves branch lineage into visibility segments and visible turns.
#[derive(Clone)]
pub struct AncestryResolver {
    store: Arc<dyn LedgerStore>,
    timeout: Duration,
}

impl AncestryResolver {
    pub fn new(store: Arc<dyn LedgerStore>, timeout: Duration) -> Self {
        Self { store, timeout }
    }

    /// Segments from `branch_id` out to its root.
    ///
    /// `as_of_turn_index` bounds the first segment; `None` means the
    /// branch's last assigned index.
    pub async fn segments(
        &self,
        branch_id: BranchId,
        as_of_turn_index: Option<i64>,
    ) -> RewindResult<Vec<VisibilitySegment>> {
        if let Some(index) = as_of_turn_index {
            if index < -1 {
                return Err(RewindError::validation(format!(
                    "Turn index {} out of range for branch {}",
                    index, branch_id
                )));
            }
        }

        let branch = self
            .fetch_branch(branch_id)
            .await?
            .ok_or(RewindError::BranchNotFound { branch_id })?;

        let mut segments = vec![VisibilitySegment::new(
            branch.id,
            as_of_turn_index.unwrap_or_else(|| branch.last_index()),
        )];
        let mut visited = HashSet::from([branch.id]);
        let mut current = branch;

        while let Some((parent_id, fork_index)) = current.fork_point() {
            if !visited.insert(parent_id) {
                return Err(corrupt(
                    branch_id,
                    format!("cycle through branch {} in fork chain", parent_id),
                ));
            }
            let parent = self.fetch_branch(parent_id).await?.ok_or_else(|| {
                corrupt(
                    branch_id,
                    format!(
                        "branch {} forks from missing branch {}",
                        current.id, parent_id
                    ),
                )
            })?;
            segments.push(VisibilitySegment::new(parent.id, fork_index));
            current = parent;
        }

        debug!(
            branch_id = %branch_id,
            depth = segments.len(),
            "Resolved ancestry"
        );
        Ok(segments)
    }

    /// Committed turns visible from `branch_id`, ranked for shadowing.
    pub async fn resolve(
        &self,
        branch_id: BranchId,
        as_of_turn_index: Option<i64>,
    ) -> RewindResult<VisibleTurns> {
        let segments = self.segments(branch_id, as_of_turn_index).await?;
        let committed = with_timeout(
            "committed_turns",
            self.timeout,
            self.store.committed_turns(&segments),
        )
        .await?;

        if let Some(stray) = committed
            .iter()
            .find(|t| !segments.iter().any(|s| s.covers(t.branch_id, t.index)))
        {
            error!(
                turn_id = %stray.id,
                branch_id = %stray.branch_id,
                "Ledger returned a turn outside the resolved lineage"
            );
            return Err(RewindError::OrphanedTurn {
                turn_id: stray.id,
                branch_id: stray.branch_id,
            });
        }

        Ok(VisibleTurns::new(segments, &committed))
    }

    async fn fetch_branch(
        &self,
        branch_id: BranchId,
    ) -> RewindResult<Option<crate::types::Branch>> {
        with_timeout("get_branch", self.timeout, self.store.get_branch(branch_id)).await
    }
}

fn corrupt(branch_id: BranchId, message: String) -> RewindError {
    error!(branch_id = %branch_id, %message, "Ancestry invariant violated");
    RewindError::CorruptAncestry { branch_id, message }
}
