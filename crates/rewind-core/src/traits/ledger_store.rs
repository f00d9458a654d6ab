//! Ledger store trait: durable branches and turns.

use async_trait::async_trait;

use crate::error::RewindResult;
use crate::types::{
    Branch, BranchId, NewBranch, Payload, Turn, TurnId, TurnStatus, VisibilitySegment,
};

/// Persistence for the `branches` and `turns` collections.
///
/// Implementations make every mutation conditional on the branch's
/// `turn_counter` so that concurrent writers detect each other: a stale
/// `expected_counter` fails with `Conflict` and changes nothing.
#[async_trait]
pub trait LedgerStore: Send + Sync {
    /// Insert a branch with `turn_counter = 0`.
    async fn insert_branch(&self, branch: NewBranch) -> RewindResult<Branch>;

    async fn get_branch(&self, branch_id: BranchId) -> RewindResult<Option<Branch>>;

    /// Branches in creation order.
    async fn list_branches(&self, limit: usize, offset: usize) -> RewindResult<Vec<Branch>>;

    /// Insert a STAGED turn at index `expected_counter`.
    ///
    /// Fails with `TurnAlreadyStaged` when the branch has a staged turn and
    /// with `Conflict` when the counter moved.
    async fn insert_staged_turn(
        &self,
        branch_id: BranchId,
        expected_counter: i64,
        message: Option<String>,
        metadata: Payload,
    ) -> RewindResult<Turn>;

    /// Move a STAGED turn to `status` and advance its branch counter from
    /// `expected_counter`, atomically.
    async fn finalize_turn(
        &self,
        turn_id: TurnId,
        status: TurnStatus,
        expected_counter: i64,
        message: Option<String>,
    ) -> RewindResult<Turn>;

    async fn get_turn(&self, turn_id: TurnId) -> RewindResult<Option<Turn>>;

    /// The branch's STAGED turn, if any.
    async fn staged_turn(&self, branch_id: BranchId) -> RewindResult<Option<Turn>>;

    /// Turn at `index` on `branch_id`.
    async fn turn_at(&self, branch_id: BranchId, index: i64) -> RewindResult<Option<Turn>>;

    /// Turns of a branch, newest first.
    async fn list_turns(
        &self,
        branch_id: BranchId,
        limit: usize,
        offset: usize,
    ) -> RewindResult<Vec<Turn>>;

    /// COMMITTED turns inside any of `segments`.
    async fn committed_turns(&self, segments: &[VisibilitySegment]) -> RewindResult<Vec<Turn>>;

    /// Set or clear the quarantine flag of a branch.
    async fn set_quarantined(&self, branch_id: BranchId, quarantined: bool) -> RewindResult<()>;

    /// Branches whose quarantine flag is set, in id order.
    async fn quarantined_branches(&self) -> RewindResult<Vec<BranchId>>;
}
