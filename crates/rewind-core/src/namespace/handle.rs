//! Model handles: save/get/delete/query for one registered entity type.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::RwLock;
use tracing::{debug, warn};

use crate::error::{RewindError, RewindResult};
use crate::ledger::{BranchGuard, Ledger};
use crate::query::{QueryCompiler, QuerySpec};
use crate::repo::{ReadScope, Repo};
use crate::runtime::with_timeout;
use crate::traits::{Embedder, RecordStore};
use crate::types::{
    BranchId, Expr, Payload, SavedRecord, SchemaDescriptor, TurnId, TurnStatus, VersionedRecord,
};

/// Accessor bound to one namespace, returned by [`crate::Rewind::register`].
///
/// Reads and writes that name no branch use the shared [`Repo`] cursor.
#[derive(Clone)]
pub struct ModelHandle {
    store: Arc<dyn RecordStore>,
    ledger: Arc<Ledger>,
    repo: Arc<RwLock<Repo>>,
    embedder: Option<Arc<dyn Embedder>>,
    timeout: Duration,
}

impl ModelHandle {
    pub(crate) fn new(
        store: Arc<dyn RecordStore>,
        ledger: Arc<Ledger>,
        repo: Arc<RwLock<Repo>>,
        embedder: Option<Arc<dyn Embedder>>,
        timeout: Duration,
    ) -> Self {
        Self {
            store,
            ledger,
            repo,
            embedder,
            timeout,
        }
    }

    pub fn namespace(&self) -> &str {
        self.store.namespace()
    }

    pub fn schema(&self) -> &SchemaDescriptor {
        self.store.schema()
    }

    pub fn store(&self) -> &Arc<dyn RecordStore> {
        &self.store
    }

    // ---- Writes ----

    /// Save a new version of the payload's entity.
    ///
    /// If the branch has a STAGED turn the version joins it and becomes
    /// visible when that turn commits. Otherwise a turn is opened, written
    /// and committed on the spot, so the save is immediately readable; if
    /// the write or the commit fails that turn is reverted.
    pub async fn save(
        &self,
        payload: Payload,
        branch_id: Option<BranchId>,
    ) -> RewindResult<SavedRecord> {
        self.schema().validate_payload(&payload)?;
        let logical_key = self.schema().logical_key(&payload)?;
        let branch_id = self.write_branch(branch_id).await?;
        let turn_id = self
            .write(branch_id, &logical_key, Some(&payload))
            .await?;

        Ok(SavedRecord {
            logical_key,
            branch_id,
            turn_id,
            payload,
        })
    }

    /// Save into a specific STAGED turn.
    pub async fn save_in_turn(
        &self,
        turn_id: TurnId,
        payload: Payload,
    ) -> RewindResult<SavedRecord> {
        self.schema().validate_payload(&payload)?;
        let logical_key = self.schema().logical_key(&payload)?;
        let guard = self.lock_staged(turn_id).await?;
        self.put(&logical_key, turn_id, Some(&payload)).await?;

        Ok(SavedRecord {
            logical_key,
            branch_id: guard.branch_id(),
            turn_id,
            payload,
        })
    }

    /// Delete `logical_key` from the branch, from the writing turn on.
    ///
    /// Returns the turn that recorded the deletion.
    pub async fn delete(
        &self,
        logical_key: &str,
        branch_id: Option<BranchId>,
    ) -> RewindResult<TurnId> {
        let branch_id = self.write_branch(branch_id).await?;
        self.write(branch_id, logical_key, None).await
    }

    /// Record the deletion of `logical_key` in a specific STAGED turn.
    pub async fn delete_in_turn(&self, turn_id: TurnId, logical_key: &str) -> RewindResult<()> {
        let _guard = self.lock_staged(turn_id).await?;
        self.put(logical_key, turn_id, None).await
    }

    async fn write_branch(&self, branch_id: Option<BranchId>) -> RewindResult<BranchId> {
        match branch_id {
            Some(branch_id) => Ok(branch_id),
            None => self.repo.read().await.write_branch(),
        }
    }

    /// Lock the branch owning `turn_id` and check, under the lock, that the
    /// turn is still STAGED. Writes made while the guard lives cannot race
    /// the turn's commit or revert.
    async fn lock_staged(&self, turn_id: TurnId) -> RewindResult<BranchGuard> {
        let turn = self.ledger.require_turn(turn_id).await?;
        self.ledger.ensure_writable(turn.branch_id)?;
        let guard = self.ledger.lock_branch(turn.branch_id).await?;

        let turn = self.ledger.require_turn(turn_id).await?;
        if !turn.is_staged() {
            return Err(RewindError::InvalidTurnState {
                turn_id,
                status: turn.status,
                expected: TurnStatus::Staged,
            });
        }
        Ok(guard)
    }

    /// Write into the branch's staged turn, or into a turn of its own.
    ///
    /// Runs on a spawned task: a caller dropping the future cannot stop it
    /// between opening its turn and closing it.
    async fn write(
        &self,
        branch_id: BranchId,
        logical_key: &str,
        payload: Option<&Payload>,
    ) -> RewindResult<TurnId> {
        self.ledger.ensure_writable(branch_id)?;

        let handle = self.clone();
        let logical_key = logical_key.to_string();
        let payload = payload.cloned();
        tokio::spawn(async move {
            handle
                .write_locked(branch_id, &logical_key, payload.as_ref())
                .await
        })
        .await
        .map_err(|e| RewindError::Internal(format!("Write task failed: {}", e)))?
    }

    async fn write_locked(
        &self,
        branch_id: BranchId,
        logical_key: &str,
        payload: Option<&Payload>,
    ) -> RewindResult<TurnId> {
        let guard = self.ledger.lock_branch(branch_id).await?;

        if let Some(staged) = self.ledger.staged_turn(branch_id).await? {
            self.put(logical_key, staged.id, payload).await?;
            return Ok(staged.id);
        }

        let turn = self
            .ledger
            .open_turn_held(&guard, None, Payload::new())
            .await?;
        if let Err(err) = self.put(logical_key, turn.id, payload).await {
            self.abandon(&guard, turn.id).await;
            return Err(err);
        }
        if let Err(err) = self
            .ledger
            .finish_turn_held(&guard, turn.id, TurnStatus::Committed, None)
            .await
        {
            self.abandon(&guard, turn.id).await;
            return Err(err);
        }
        Ok(turn.id)
    }

    /// Revert an implicit turn whose write or commit failed.
    async fn abandon(&self, guard: &BranchGuard, turn_id: TurnId) {
        match self
            .ledger
            .finish_turn_held(guard, turn_id, TurnStatus::Reverted, None)
            .await
        {
            Ok(_) => debug!(turn_id = %turn_id, "Reverted implicit turn"),
            Err(err) => warn!(
                turn_id = %turn_id,
                error = %err,
                "Failed to revert implicit turn"
            ),
        }
    }

    async fn put(
        &self,
        logical_key: &str,
        turn_id: TurnId,
        payload: Option<&Payload>,
    ) -> RewindResult<()> {
        debug!(
            namespace = self.namespace(),
            logical_key,
            turn_id = %turn_id,
            tombstone = payload.is_none(),
            "Writing record"
        );
        match payload {
            Some(payload) => {
                with_timeout(
                    "record_store.put",
                    self.timeout,
                    self.store.put(logical_key, turn_id, payload),
                )
                .await
            }
            None => {
                with_timeout(
                    "record_store.put_tombstone",
                    self.timeout,
                    self.store.put_tombstone(logical_key, turn_id),
                )
                .await
            }
        }
    }

    // ---- Reads ----

    /// Payload of the winning visible version of `logical_key`.
    pub async fn get(
        &self,
        logical_key: &str,
        branch_id: Option<BranchId>,
        as_of_turn_index: Option<i64>,
    ) -> RewindResult<Option<Payload>> {
        Ok(self
            .get_record(logical_key, branch_id, as_of_turn_index)
            .await?
            .map(|record| record.payload))
    }

    /// [`ModelHandle::get`] keeping the writing turn.
    pub async fn get_record(
        &self,
        logical_key: &str,
        branch_id: Option<BranchId>,
        as_of_turn_index: Option<i64>,
    ) -> RewindResult<Option<VersionedRecord>> {
        let scope = self.read_scope(branch_id, as_of_turn_index).await;
        let visible = self
            .ledger
            .visible_turns(scope.branch_id, scope.as_of_turn_index)
            .await?;
        if visible.is_empty() {
            return Ok(None);
        }
        with_timeout(
            "record_store.get_latest",
            self.timeout,
            self.store.get_latest(logical_key, &visible),
        )
        .await
    }

    /// Start a query over the current versions seen from `branch_id`.
    pub fn query(&self, branch_id: Option<BranchId>) -> Query {
        Query {
            handle: self.clone(),
            branch_id,
            as_of_turn_index: None,
            spec: QuerySpec::new(),
        }
    }

    /// Physical rows in the namespace, every version and tombstone included.
    pub async fn record_count(&self) -> RewindResult<u64> {
        with_timeout("record_store.count", self.timeout, self.store.count()).await
    }

    async fn read_scope(
        &self,
        branch_id: Option<BranchId>,
        as_of_turn_index: Option<i64>,
    ) -> ReadScope {
        match branch_id {
            Some(branch_id) => ReadScope {
                branch_id,
                as_of_turn_index,
            },
            None => {
                let mut scope = self.repo.read().await.read_scope();
                if as_of_turn_index.is_some() {
                    scope.as_of_turn_index = as_of_turn_index;
                }
                scope
            }
        }
    }
}

/// Query builder returned by [`ModelHandle::query`].
pub struct Query {
    handle: ModelHandle,
    branch_id: Option<BranchId>,
    as_of_turn_index: Option<i64>,
    spec: QuerySpec,
}

impl Query {
    /// Add a filter, ANDed with earlier ones.
    pub fn filter(mut self, expr: Expr) -> Self {
        self.spec = self.spec.filter(expr);
        self
    }

    pub fn order_by(mut self, field: impl Into<String>, ascending: bool) -> Self {
        self.spec = self.spec.order_by(field, ascending);
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.spec = self.spec.limit(limit);
        self
    }

    pub fn offset(mut self, offset: usize) -> Self {
        self.spec = self.spec.offset(offset);
        self
    }

    /// Read as of a turn index of the target branch.
    pub fn as_of(mut self, turn_index: i64) -> Self {
        self.as_of_turn_index = Some(turn_index);
        self
    }

    /// Payloads of the matching current versions.
    pub async fn fetch(self) -> RewindResult<Vec<Payload>> {
        Ok(self
            .fetch_records()
            .await?
            .into_iter()
            .map(|record| record.payload)
            .collect())
    }

    /// Matching current versions with their turn and similarity score.
    pub async fn fetch_records(self) -> RewindResult<Vec<VersionedRecord>> {
        let handle = &self.handle;
        let compiled = QueryCompiler::new(handle.schema(), handle.store.capabilities())
            .with_embedder(handle.embedder.as_deref())
            .compile(&self.spec)
            .await?;

        let scope = handle
            .read_scope(self.branch_id, self.as_of_turn_index)
            .await;
        let visible = handle
            .ledger
            .visible_turns(scope.branch_id, scope.as_of_turn_index)
            .await?;
        if visible.is_empty() {
            return Ok(Vec::new());
        }

        let records = with_timeout(
            "record_store.scan",
            handle.timeout,
            handle.store.scan(&visible, &compiled),
        )
        .await?;
        debug!(
            namespace = handle.namespace(),
            branch_id = %scope.branch_id,
            rows = records.len(),
            "Query fetched"
        );
        Ok(records)
    }

    /// First matching payload.
    pub async fn first(self) -> RewindResult<Option<Payload>> {
        Ok(self.limit(1).fetch().await?.into_iter().next())
    }
}
