//! Per-branch write locks.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

use crate::types::BranchId;

/// One async mutex per branch. Turn mutations on a branch take its lock;
/// different branches never contend.
#[derive(Default)]
pub(crate) struct BranchLocks {
    locks: Mutex<HashMap<BranchId, Arc<AsyncMutex<()>>>>,
}

impl BranchLocks {
    /// Wait for exclusive access to `branch_id`.
    pub(crate) async fn acquire(&self, branch_id: BranchId) -> BranchGuard {
        let lock = {
            let mut locks = self
                .locks
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            locks.entry(branch_id).or_default().clone()
        };
        BranchGuard {
            branch_id,
            _guard: lock.lock_owned().await,
        }
    }
}

/// Exclusive hold on one branch. Released on drop.
pub(crate) struct BranchGuard {
    branch_id: BranchId,
    _guard: OwnedMutexGuard<()>,
}

impl BranchGuard {
    pub(crate) fn branch_id(&self) -> BranchId {
        self.branch_id
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_same_branch_is_exclusive() {
        let locks = Arc::new(BranchLocks::default());
        let guard = locks.acquire(BranchId(1)).await;

        let contender = {
            let locks = locks.clone();
            tokio::spawn(async move { locks.acquire(BranchId(1)).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!contender.is_finished());

        drop(guard);
        let acquired = tokio::time::timeout(Duration::from_secs(1), contender).await;
        assert!(acquired.is_ok());
    }

    #[tokio::test]
    async fn test_other_branches_do_not_block() {
        let locks = BranchLocks::default();
        let _main = locks.acquire(BranchId(1)).await;
        let other =
            tokio::time::timeout(Duration::from_secs(1), locks.acquire(BranchId(2))).await;
        assert_eq!(other.map(|guard| guard.branch_id()).ok(), Some(BranchId(2)));
    }
}
