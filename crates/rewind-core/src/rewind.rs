//! The composition root.

use std::sync::Arc;

use tokio::sync::RwLock;
use tracing::info;

use crate::config::RewindConfig;
use crate::error::RewindResult;
use crate::ledger::{Ledger, SqliteLedgerStore};
use crate::namespace::{ModelHandle, NamespaceManager};
use crate::repo::Repo;
use crate::traits::{Embedder, LedgerStore, RecordStore};
use crate::types::{Branch, BranchId, Turn, TurnId};

const BRANCH_PAGE: usize = 100;

/// Main Rewind struct: ledger, namespaces and the shared repo cursor.
///
/// Record stores are built by the caller (see `rewind-stores`) and handed
/// to [`Rewind::register`], which returns the [`ModelHandle`] for them.
pub struct Rewind {
    config: RewindConfig,
    ledger: Arc<Ledger>,
    namespaces: NamespaceManager,
    repo: Arc<RwLock<Repo>>,
    embedder: Option<Arc<dyn Embedder>>,
}

impl Rewind {
    /// Open the ledger described by `config` and attach to its main branch,
    /// creating the branch on first use.
    pub async fn open(config: RewindConfig) -> RewindResult<Self> {
        let store = match &config.ledger_db_path {
            Some(path) => {
                if let Some(parent) = path.parent() {
                    std::fs::create_dir_all(parent)?;
                }
                SqliteLedgerStore::open(path)?
            }
            None => SqliteLedgerStore::in_memory()?,
        };
        Self::with_ledger_store(Arc::new(store), config).await
    }

    /// Like [`Rewind::open`] over an already constructed ledger store.
    pub async fn with_ledger_store(
        store: Arc<dyn LedgerStore>,
        config: RewindConfig,
    ) -> RewindResult<Self> {
        let ledger = Arc::new(Ledger::new(
            store,
            config.retry.clone(),
            config.operation_timeout(),
        ));

        ledger.restore_quarantine().await?;

        let main = match find_root(&ledger, &config.main_branch_name).await? {
            Some(branch) => branch,
            None => {
                ledger
                    .create_named_branch(Some(config.main_branch_name.clone()), None, None)
                    .await?
            }
        };

        let mut repo = Repo::new(main.id);
        repo.checkout(&ledger, main.id, None).await?;
        info!(
            main_branch_id = %main.id,
            turn_counter = main.turn_counter,
            "Opened rewind"
        );

        Ok(Self {
            config,
            ledger,
            namespaces: NamespaceManager::new(),
            repo: Arc::new(RwLock::new(repo)),
            embedder: None,
        })
    }

    /// Set the embedder used to resolve text similarity queries.
    ///
    /// Only handles registered afterwards pick it up.
    pub fn with_embedder(mut self, embedder: Arc<dyn Embedder>) -> Self {
        self.embedder = Some(embedder);
        self
    }

    pub fn config(&self) -> &RewindConfig {
        &self.config
    }

    pub fn ledger(&self) -> &Arc<Ledger> {
        &self.ledger
    }

    pub fn namespaces(&self) -> &NamespaceManager {
        &self.namespaces
    }

    // ---- Namespaces ----

    /// Create the store's namespace and return its handle.
    pub async fn register(&self, store: Arc<dyn RecordStore>) -> RewindResult<ModelHandle> {
        let store = self.namespaces.register(store).await?;
        Ok(self.handle(store))
    }

    /// Handle of an already registered namespace.
    pub fn model(&self, namespace: &str) -> RewindResult<ModelHandle> {
        Ok(self.handle(self.namespaces.get(namespace)?))
    }

    fn handle(&self, store: Arc<dyn RecordStore>) -> ModelHandle {
        ModelHandle::new(
            store,
            self.ledger.clone(),
            self.repo.clone(),
            self.embedder.clone(),
            self.config.operation_timeout(),
        )
    }

    // ---- Repo cursor ----

    /// Snapshot of the cursor.
    pub async fn repo(&self) -> Repo {
        self.repo.read().await.clone()
    }

    pub async fn main_branch_id(&self) -> BranchId {
        self.repo.read().await.main_branch_id()
    }

    /// Move the cursor; see [`Repo::checkout`].
    pub async fn checkout(
        &self,
        branch_id: BranchId,
        turn_id: Option<TurnId>,
    ) -> RewindResult<Repo> {
        let mut repo = self.repo.write().await;
        repo.checkout(&self.ledger, branch_id, turn_id).await?;
        Ok(repo.clone())
    }

    /// Fork at the cursor and check out the new branch.
    pub async fn fork(&self, name: Option<String>) -> RewindResult<Branch> {
        self.repo.write().await.fork(&self.ledger, name).await
    }

    /// Stage a turn on the cursor's branch.
    pub async fn begin(&self, message: Option<String>) -> RewindResult<Turn> {
        self.repo.write().await.begin(&self.ledger, message).await
    }

    /// Commit the cursor's turn and stage the next one.
    pub async fn commit(&self, message: Option<String>) -> RewindResult<(Turn, Turn)> {
        self.repo.write().await.commit(&self.ledger, message).await
    }

    /// Revert the cursor's turn.
    pub async fn revert(&self, message: Option<String>) -> RewindResult<Turn> {
        self.repo.write().await.revert(&self.ledger, message).await
    }
}

async fn find_root(ledger: &Ledger, name: &str) -> RewindResult<Option<Branch>> {
    let mut offset = 0;
    loop {
        let page = ledger.list_branches(BRANCH_PAGE, offset).await?;
        if let Some(branch) = page.iter().find(|b| b.is_root() && b.name == name) {
            return Ok(Some(branch.clone()));
        }
        if page.len() < BRANCH_PAGE {
            return Ok(None);
        }
        offset += page.len();
    }
}
