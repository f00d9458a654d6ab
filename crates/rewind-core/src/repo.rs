//! Repo cursor: the default scope for reads and writes.
//!
//! A [`Repo`] points at `(main_branch_id, branch_id, turn_id)`. Attached, it
//! follows the tip of its branch: reads see every committed turn and writes
//! go to the branch. Checking out a closed turn detaches it: reads are pinned
//! to that turn's index and writes fail with `DetachedRepo` until the cursor
//! moves to a branch tip or forks.

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{RewindError, RewindResult};
use crate::ledger::Ledger;
use crate::types::{Branch, BranchId, Turn, TurnId, TurnStatus};

/// Branch and turn pinning of a read.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReadScope {
    pub branch_id: BranchId,
    /// `None` reads up to the branch tip.
    pub as_of_turn_index: Option<i64>,
}

/// Mutable cursor over the branch/turn graph. Not versioned itself.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Repo {
    main_branch_id: BranchId,
    branch_id: BranchId,
    turn_id: Option<TurnId>,
    /// Index of the checked-out turn while detached.
    detached_at: Option<i64>,
}

impl Repo {
    /// Cursor at the tip of the main branch.
    pub fn new(main_branch_id: BranchId) -> Self {
        Self {
            main_branch_id,
            branch_id: main_branch_id,
            turn_id: None,
            detached_at: None,
        }
    }

    pub fn main_branch_id(&self) -> BranchId {
        self.main_branch_id
    }

    pub fn branch_id(&self) -> BranchId {
        self.branch_id
    }

    pub fn turn_id(&self) -> Option<TurnId> {
        self.turn_id
    }

    pub fn is_detached(&self) -> bool {
        self.detached_at.is_some()
    }

    /// Scope used by reads that name no branch.
    pub fn read_scope(&self) -> ReadScope {
        ReadScope {
            branch_id: self.branch_id,
            as_of_turn_index: self.detached_at,
        }
    }

    /// Branch used by writes that name no branch.
    pub fn write_branch(&self) -> RewindResult<BranchId> {
        match (self.detached_at, self.turn_id) {
            (Some(_), Some(turn_id)) => Err(RewindError::DetachedRepo {
                branch_id: self.branch_id,
                turn_id,
            }),
            _ => Ok(self.branch_id),
        }
    }

    /// Move the cursor to `branch_id`, optionally at one of its turns.
    ///
    /// Checking out a STAGED turn (or no turn) attaches the cursor to the
    /// branch; checking out a committed or reverted turn detaches it.
    pub async fn checkout(
        &mut self,
        ledger: &Ledger,
        branch_id: BranchId,
        turn_id: Option<TurnId>,
    ) -> RewindResult<()> {
        let branch = ledger.require_branch(branch_id).await?;
        let turn = match turn_id {
            Some(turn_id) => {
                let turn = ledger.require_turn(turn_id).await?;
                if turn.branch_id != branch.id {
                    return Err(RewindError::validation(format!(
                        "Turn {} belongs to branch {}, not {}",
                        turn_id, turn.branch_id, branch.id
                    )));
                }
                Some(turn)
            }
            None => ledger.staged_turn(branch.id).await?,
        };

        self.branch_id = branch.id;
        self.turn_id = turn.as_ref().map(|t| t.id);
        self.detached_at = turn.filter(|t| !t.is_staged()).map(|t| t.index);
        info!(
            branch_id = %self.branch_id,
            turn_id = ?self.turn_id,
            detached = self.is_detached(),
            "Checked out"
        );
        Ok(())
    }

    /// Fork from the cursor position and check out the new branch.
    ///
    /// Detached, the fork point is the checked-out turn; attached, it is the
    /// last assigned index of the current branch.
    pub async fn fork(&mut self, ledger: &Ledger, name: Option<String>) -> RewindResult<Branch> {
        let branch = ledger
            .create_named_branch(name, Some(self.branch_id), self.detached_at)
            .await?;
        self.branch_id = branch.id;
        self.turn_id = None;
        self.detached_at = None;
        Ok(branch)
    }

    /// Stage a new turn on the current branch and point the cursor at it.
    pub async fn begin(&mut self, ledger: &Ledger, message: Option<String>) -> RewindResult<Turn> {
        let branch_id = self.write_branch()?;
        let turn = ledger.open_turn(branch_id, message).await?;
        self.turn_id = Some(turn.id);
        Ok(turn)
    }

    /// Commit the cursor's staged turn and open the next one.
    ///
    /// Returns the committed turn and the newly staged one.
    pub async fn commit(
        &mut self,
        ledger: &Ledger,
        message: Option<String>,
    ) -> RewindResult<(Turn, Turn)> {
        let turn_id = self.staged_turn_id()?;
        let committed = ledger
            .finish_turn(turn_id, TurnStatus::Committed, message)
            .await?;
        let next = ledger.open_turn(self.branch_id, None).await?;
        self.turn_id = Some(next.id);
        Ok((committed, next))
    }

    /// Revert the cursor's staged turn.
    pub async fn revert(&mut self, ledger: &Ledger, message: Option<String>) -> RewindResult<Turn> {
        let turn_id = self.staged_turn_id()?;
        let reverted = ledger
            .finish_turn(turn_id, TurnStatus::Reverted, message)
            .await?;
        self.turn_id = None;
        Ok(reverted)
    }

    fn staged_turn_id(&self) -> RewindResult<TurnId> {
        self.write_branch()?;
        self.turn_id.ok_or_else(|| {
            RewindError::validation_with_suggestion(
                format!("Repo on branch {} has no open turn", self.branch_id),
                "Call begin() first",
            )
        })
    }
}
