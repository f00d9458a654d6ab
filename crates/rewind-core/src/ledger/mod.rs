//! Turn/branch ledger.
//!
//! The [`Ledger`] owns every state transition of branches and turns:
//!
//! - `create_branch` / `fork_from_turn` add a branch (O(1), nothing copied)
//! - `open_turn` stages the next index of a branch
//! - `commit_turn` / `revert_turn` close the staged turn and advance the counter
//!
//! Mutations on one branch are serialized twice over: an in-process lock per
//! branch, and a compare-and-swap on the branch counter in the store. A lost
//! swap is retried with exponential backoff and surfaces as `TurnContention`
//! once the retry budget is spent.
//!
//! Corruption (ancestry cycles, turns that do not fit their branch) puts the
//! branch in quarantine: writes fail with `BranchQuarantined` until
//! [`Ledger::release_quarantine`] is called. The flag is persisted with the
//! branch and reloaded by [`Ledger::restore_quarantine`].

mod locks;
mod sqlite;

pub use sqlite::SqliteLedgerStore;

use std::collections::HashSet;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use backon::Retryable;
use tracing::{debug, error, info, instrument, warn};

use crate::ancestry::AncestryResolver;
use crate::config::RetryPolicy;
use crate::error::{RewindError, RewindResult};
use crate::runtime::with_timeout;
use crate::traits::LedgerStore;
use crate::types::{
    Branch, BranchId, NewBranch, Payload, Turn, TurnId, TurnStatus, VisibilitySegment,
    VisibleTurns,
};
pub(crate) use locks::BranchGuard;
use locks::BranchLocks;

/// Default name of a root branch.
pub const MAIN_BRANCH: &str = "main";

/// Branch and turn lifecycle manager.
pub struct Ledger {
    store: Arc<dyn LedgerStore>,
    resolver: AncestryResolver,
    locks: BranchLocks,
    quarantined: RwLock<HashSet<BranchId>>,
    retry: RetryPolicy,
    timeout: Duration,
}

impl Ledger {
    pub fn new(store: Arc<dyn LedgerStore>, retry: RetryPolicy, timeout: Duration) -> Self {
        Self {
            resolver: AncestryResolver::new(store.clone(), timeout),
            store,
            locks: BranchLocks::default(),
            quarantined: RwLock::new(HashSet::new()),
            retry,
            timeout,
        }
    }

    /// Ledger over an in-memory SQLite store with default policies.
    pub fn in_memory() -> RewindResult<Self> {
        Ok(Self::new(
            Arc::new(SqliteLedgerStore::in_memory()?),
            RetryPolicy::default(),
            Duration::from_secs(30),
        ))
    }

    pub fn resolver(&self) -> &AncestryResolver {
        &self.resolver
    }

    // ---- Branches ----

    /// Create a root branch (no parent) or fork `parent_branch_id`.
    ///
    /// The fork point defaults to the parent's last assigned index. Roots are
    /// named `main`, forks `<parent>_fork_<index>`.
    pub async fn create_branch(
        &self,
        parent_branch_id: Option<BranchId>,
        fork_turn_index: Option<i64>,
    ) -> RewindResult<Branch> {
        self.create_named_branch(None, parent_branch_id, fork_turn_index)
            .await
    }

    /// [`Ledger::create_branch`] with an explicit name.
    #[instrument(skip(self, name))]
    pub async fn create_named_branch(
        &self,
        name: Option<String>,
        parent_branch_id: Option<BranchId>,
        fork_turn_index: Option<i64>,
    ) -> RewindResult<Branch> {
        let new_branch = match parent_branch_id {
            None => {
                if fork_turn_index.is_some() {
                    return Err(RewindError::validation(
                        "A fork turn index requires a parent branch",
                    ));
                }
                NewBranch::root(name.unwrap_or_else(|| MAIN_BRANCH.to_string()))
            }
            Some(parent_id) => {
                self.ensure_writable(parent_id)?;
                let parent = self.require_branch(parent_id).await?;
                let fork_index = fork_turn_index.unwrap_or_else(|| parent.last_index());
                if fork_index < -1 || fork_index > parent.turn_counter {
                    return Err(RewindError::InvalidForkPoint {
                        parent_branch_id: parent_id,
                        fork_turn_index: fork_index,
                        turn_counter: parent.turn_counter,
                    });
                }
                let name =
                    name.unwrap_or_else(|| format!("{}_fork_{}", parent.name, fork_index));
                NewBranch::fork(name, parent_id, fork_index)
            }
        };

        let branch = self
            .call("insert_branch", self.store.insert_branch(new_branch))
            .await?;
        info!(
            branch_id = %branch.id,
            name = %branch.name,
            parent = ?branch.forked_from_branch_id,
            fork_index = ?branch.forked_from_turn_index,
            "Created branch"
        );
        Ok(branch)
    }

    /// Fork the branch owning `turn_id` at that turn's index.
    ///
    /// The new branch is named `branch_from_<turn_id>` unless `name` is given.
    pub async fn fork_from_turn(
        &self,
        turn_id: TurnId,
        name: Option<String>,
    ) -> RewindResult<Branch> {
        let turn = self.require_turn(turn_id).await?;
        let name = name.unwrap_or_else(|| format!("branch_from_{}", turn_id));
        self.create_named_branch(Some(name), Some(turn.branch_id), Some(turn.index))
            .await
    }

    pub async fn get_branch(&self, branch_id: BranchId) -> RewindResult<Option<Branch>> {
        self.call("get_branch", self.store.get_branch(branch_id)).await
    }

    /// Like [`Ledger::get_branch`], failing with `BranchNotFound`.
    pub async fn require_branch(&self, branch_id: BranchId) -> RewindResult<Branch> {
        self.get_branch(branch_id)
            .await?
            .ok_or(RewindError::BranchNotFound { branch_id })
    }

    /// Branches in creation order.
    pub async fn list_branches(&self, limit: usize, offset: usize) -> RewindResult<Vec<Branch>> {
        self.call("list_branches", self.store.list_branches(limit, offset))
            .await
    }

    // ---- Turns ----

    /// Stage the next turn of `branch_id`.
    pub async fn open_turn(
        &self,
        branch_id: BranchId,
        message: Option<String>,
    ) -> RewindResult<Turn> {
        self.open_turn_with_metadata(branch_id, message, Payload::new())
            .await
    }

    /// [`Ledger::open_turn`] attaching free-form metadata to the turn.
    #[instrument(skip(self, message, metadata))]
    pub async fn open_turn_with_metadata(
        &self,
        branch_id: BranchId,
        message: Option<String>,
        metadata: Payload,
    ) -> RewindResult<Turn> {
        self.ensure_writable(branch_id)?;
        let guard = self.lock_branch(branch_id).await?;
        self.open_turn_held(&guard, message, metadata).await
    }

    /// [`Ledger::open_turn_with_metadata`] for a caller already holding the branch.
    pub(crate) async fn open_turn_held(
        &self,
        guard: &BranchGuard,
        message: Option<String>,
        metadata: Payload,
    ) -> RewindResult<Turn> {
        let branch_id = guard.branch_id();
        self.ensure_writable(branch_id)?;

        let attempt = || async {
            let branch = self.require_branch(branch_id).await?;
            self.call(
                "insert_staged_turn",
                self.store.insert_staged_turn(
                    branch_id,
                    branch.turn_counter,
                    message.clone(),
                    metadata.clone(),
                ),
            )
            .await
        };

        let turn = self.with_contention_retry(branch_id, attempt).await?;
        info!(branch_id = %branch_id, turn_id = %turn.id, index = turn.index, "Opened turn");
        Ok(turn)
    }

    /// Commit a STAGED turn, making its records visible.
    pub async fn commit_turn(&self, turn_id: TurnId) -> RewindResult<Turn> {
        self.finish_turn(turn_id, TurnStatus::Committed, None).await
    }

    /// Revert a STAGED turn. Its index stays consumed.
    ///
    /// Reverting a turn that is no longer STAGED fails with `InvalidTurnState`.
    pub async fn revert_turn(&self, turn_id: TurnId) -> RewindResult<Turn> {
        self.finish_turn(turn_id, TurnStatus::Reverted, None).await
    }

    /// Commit or revert a STAGED turn, replacing its message when given.
    #[instrument(skip(self, message))]
    pub async fn finish_turn(
        &self,
        turn_id: TurnId,
        status: TurnStatus,
        message: Option<String>,
    ) -> RewindResult<Turn> {
        let turn = self.require_turn(turn_id).await?;
        self.ensure_writable(turn.branch_id)?;
        let guard = self.lock_branch(turn.branch_id).await?;
        self.finish_turn_held(&guard, turn_id, status, message).await
    }

    /// [`Ledger::finish_turn`] for a caller already holding the turn's branch.
    ///
    /// The turn is re-read under the lock, so a turn closed by a concurrent
    /// commit or revert fails with `InvalidTurnState`. Only a STAGED turn
    /// whose index disagrees with the branch counter is corruption.
    pub(crate) async fn finish_turn_held(
        &self,
        guard: &BranchGuard,
        turn_id: TurnId,
        status: TurnStatus,
        message: Option<String>,
    ) -> RewindResult<Turn> {
        let branch_id = guard.branch_id();
        self.ensure_writable(branch_id)?;

        let attempt = || async {
            let turn = self.require_turn(turn_id).await?;
            if turn.branch_id != branch_id {
                return Err(RewindError::Internal(format!(
                    "Turn {} belongs to branch {}, not {}",
                    turn_id, turn.branch_id, branch_id
                )));
            }
            if !turn.is_staged() {
                return Err(RewindError::InvalidTurnState {
                    turn_id,
                    status: turn.status,
                    expected: TurnStatus::Staged,
                });
            }
            let branch = self
                .get_branch(branch_id)
                .await?
                .ok_or(RewindError::OrphanedTurn {
                    turn_id,
                    branch_id,
                })?;
            if branch.turn_counter != turn.index {
                return Err(RewindError::OrphanedTurn {
                    turn_id,
                    branch_id,
                });
            }
            self.call(
                "finalize_turn",
                self.store
                    .finalize_turn(turn_id, status, branch.turn_counter, message.clone()),
            )
            .await
        };

        let turn = match self.with_contention_retry(branch_id, attempt).await {
            Ok(turn) => turn,
            Err(err) => return Err(self.on_error(branch_id, err).await),
        };
        info!(
            branch_id = %branch_id,
            turn_id = %turn.id,
            index = turn.index,
            status = %turn.status,
            "Closed turn"
        );
        Ok(turn)
    }

    pub async fn get_turn(&self, turn_id: TurnId) -> RewindResult<Option<Turn>> {
        self.call("get_turn", self.store.get_turn(turn_id)).await
    }

    /// Like [`Ledger::get_turn`], failing with `TurnNotFound`.
    pub async fn require_turn(&self, turn_id: TurnId) -> RewindResult<Turn> {
        self.get_turn(turn_id)
            .await?
            .ok_or(RewindError::TurnNotFound { turn_id })
    }

    /// The STAGED turn of a branch, if any.
    pub async fn staged_turn(&self, branch_id: BranchId) -> RewindResult<Option<Turn>> {
        self.call("staged_turn", self.store.staged_turn(branch_id))
            .await
    }

    /// Turn at a given index of a branch.
    pub async fn turn_at(&self, branch_id: BranchId, index: i64) -> RewindResult<Option<Turn>> {
        self.call("turn_at", self.store.turn_at(branch_id, index))
            .await
    }

    /// Turns of a branch, newest first.
    pub async fn list_turns(
        &self,
        branch_id: BranchId,
        limit: usize,
        offset: usize,
    ) -> RewindResult<Vec<Turn>> {
        self.call("list_turns", self.store.list_turns(branch_id, limit, offset))
            .await
    }

    /// Most recently opened turn of a branch, whatever its status.
    pub async fn last_turn(&self, branch_id: BranchId) -> RewindResult<Option<Turn>> {
        Ok(self.list_turns(branch_id, 1, 0).await?.into_iter().next())
    }

    // ---- Visibility ----

    /// Visibility segments of `branch_id` at an optional turn index.
    pub async fn segments(
        &self,
        branch_id: BranchId,
        as_of_turn_index: Option<i64>,
    ) -> RewindResult<Vec<VisibilitySegment>> {
        match self.resolver.segments(branch_id, as_of_turn_index).await {
            Ok(segments) => Ok(segments),
            Err(err) => Err(self.on_error(branch_id, err).await),
        }
    }

    /// Committed turns visible from `branch_id`, ranked for shadowing.
    pub async fn visible_turns(
        &self,
        branch_id: BranchId,
        as_of_turn_index: Option<i64>,
    ) -> RewindResult<VisibleTurns> {
        let visible = match self.resolver.resolve(branch_id, as_of_turn_index).await {
            Ok(visible) => visible,
            Err(err) => return Err(self.on_error(branch_id, err).await),
        };
        debug!(branch_id = %branch_id, turns = visible.len(), "Resolved visible turns");
        Ok(visible)
    }

    // ---- Quarantine ----

    pub fn is_quarantined(&self, branch_id: BranchId) -> bool {
        self.quarantined
            .read()
            .map(|set| set.contains(&branch_id))
            .unwrap_or(true)
    }

    /// Branches currently refusing writes.
    pub fn quarantined(&self) -> Vec<BranchId> {
        let mut ids: Vec<BranchId> = self
            .quarantined
            .read()
            .map(|set| set.iter().copied().collect())
            .unwrap_or_default();
        ids.sort();
        ids
    }

    /// Accept writes on a repaired branch again. Returns whether it was quarantined.
    pub async fn release_quarantine(&self, branch_id: BranchId) -> RewindResult<bool> {
        self.call(
            "set_quarantined",
            self.store.set_quarantined(branch_id, false),
        )
        .await?;
        let released = self
            .quarantined
            .write()
            .map(|mut set| set.remove(&branch_id))
            .unwrap_or(false);
        if released {
            warn!(branch_id = %branch_id, "Released branch from quarantine");
        }
        Ok(released)
    }

    /// Reload the quarantine flags persisted by earlier sessions.
    pub async fn restore_quarantine(&self) -> RewindResult<Vec<BranchId>> {
        let ids = self
            .call("quarantined_branches", self.store.quarantined_branches())
            .await?;
        for &branch_id in &ids {
            self.mark_quarantined(branch_id);
        }
        if !ids.is_empty() {
            warn!(branches = ?ids, "Branches still quarantined");
        }
        Ok(ids)
    }

    /// Fail with `BranchQuarantined` if writes on `branch_id` are refused.
    pub fn ensure_writable(&self, branch_id: BranchId) -> RewindResult<()> {
        if self.is_quarantined(branch_id) {
            return Err(RewindError::BranchQuarantined { branch_id });
        }
        Ok(())
    }

    fn mark_quarantined(&self, branch_id: BranchId) {
        if let Ok(mut set) = self.quarantined.write() {
            set.insert(branch_id);
        }
    }

    async fn quarantine(&self, branch_id: BranchId, err: RewindError) -> RewindError {
        let branch_id = err.branch_id().unwrap_or(branch_id);
        error!(
            branch_id = %branch_id,
            code = err.code().as_str(),
            error = %err,
            "Invariant violation, quarantining branch"
        );
        self.mark_quarantined(branch_id);
        if let Err(persist_err) = self
            .call("set_quarantined", self.store.set_quarantined(branch_id, true))
            .await
        {
            error!(
                branch_id = %branch_id,
                error = %persist_err,
                "Failed to persist quarantine flag"
            );
        }
        err
    }

    async fn on_error(&self, branch_id: BranchId, err: RewindError) -> RewindError {
        if err.is_fatal() {
            self.quarantine(branch_id, err).await
        } else {
            err
        }
    }

    // ---- Plumbing ----

    async fn call<T>(
        &self,
        operation: &'static str,
        fut: impl std::future::Future<Output = RewindResult<T>>,
    ) -> RewindResult<T> {
        with_timeout(operation, self.timeout, fut).await
    }

    /// Take the per-branch lock that serializes every turn mutation.
    ///
    /// Record writes into a STAGED turn hold it too, so a turn cannot be
    /// closed between the staged check and the write.
    pub(crate) async fn lock_branch(&self, branch_id: BranchId) -> RewindResult<BranchGuard> {
        with_timeout("branch_lock", self.timeout, async {
            Ok(self.locks.acquire(branch_id).await)
        })
        .await
    }

    async fn with_contention_retry<T, F, Fut>(
        &self,
        branch_id: BranchId,
        attempt: F,
    ) -> RewindResult<T>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = RewindResult<T>>,
    {
        attempt
            .retry(self.retry.backoff())
            .when(|e| matches!(e, RewindError::Conflict { .. }))
            .notify(|err, dur| {
                warn!(
                    branch_id = %branch_id,
                    "Turn counter moved underneath us, retrying in {:?}: {}",
                    dur,
                    err
                );
            })
            .await
            .map_err(|e| match e {
                RewindError::Conflict { branch_id } => {
                    warn!(
                        branch_id = %branch_id,
                        attempts = self.retry.attempts(),
                        "Giving up on contended branch"
                    );
                    RewindError::TurnContention {
                        branch_id,
                        attempts: self.retry.attempts(),
                    }
                }
                other => other,
            })
    }
}
