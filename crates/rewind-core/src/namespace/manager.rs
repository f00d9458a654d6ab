//! Registry of record stores, owned by the composition root.

use std::collections::HashMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use tracing::info;

use crate::error::{ErrorCode, RewindError, RewindResult};
use crate::traits::RecordStore;

type Registry = HashMap<String, Arc<dyn RecordStore>>;

/// Maps entity type names to their record stores.
///
/// One instance lives in [`crate::Rewind`]; nothing is registered globally.
#[derive(Default)]
pub struct NamespaceManager {
    stores: RwLock<Registry>,
}

impl NamespaceManager {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RewindResult<RwLockReadGuard<'_, Registry>> {
        self.stores
            .read()
            .map_err(|e| RewindError::Internal(format!("Namespace registry poisoned: {}", e)))
    }

    fn write(&self) -> RewindResult<RwLockWriteGuard<'_, Registry>> {
        self.stores
            .write()
            .map_err(|e| RewindError::Internal(format!("Namespace registry poisoned: {}", e)))
    }

    /// Create the store's namespace and register it under its name.
    ///
    /// Registering the same schema twice returns the store already registered;
    /// a different schema under an existing name is rejected.
    pub async fn register(
        &self,
        store: Arc<dyn RecordStore>,
    ) -> RewindResult<Arc<dyn RecordStore>> {
        let name = store.namespace().to_string();
        if let Some(existing) = self.read()?.get(&name) {
            if existing.schema() == store.schema() {
                return Ok(existing.clone());
            }
            return Err(RewindError::validation_code(
                ErrorCode::ValInvalidSchema,
                format!("Namespace '{}' is already registered with a different schema", name),
            ));
        }

        store.create_namespace().await?;
        let registered = self
            .write()?
            .entry(name.clone())
            .or_insert(store)
            .clone();
        info!(
            namespace = %name,
            similarity = registered.capabilities().similarity,
            "Registered namespace"
        );
        Ok(registered)
    }

    /// Store registered under `name`.
    pub fn get(&self, name: &str) -> RewindResult<Arc<dyn RecordStore>> {
        self.read()?
            .get(name)
            .cloned()
            .ok_or_else(|| RewindError::NamespaceNotFound {
                namespace: name.to_string(),
            })
    }

    pub fn contains(&self, name: &str) -> bool {
        self.read().map(|m| m.contains_key(name)).unwrap_or(false)
    }

    /// Registered names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .read()
            .map(|m| m.keys().cloned().collect())
            .unwrap_or_default();
        names.sort();
        names
    }

    /// Physical row count of every namespace, sorted by name.
    pub async fn record_counts(&self) -> RewindResult<Vec<(String, u64)>> {
        let stores: Vec<(String, Arc<dyn RecordStore>)> = self
            .read()?
            .iter()
            .map(|(name, store)| (name.clone(), store.clone()))
            .collect();

        let mut counts = Vec::with_capacity(stores.len());
        for (name, store) in stores {
            counts.push((name, store.count().await?));
        }
        counts.sort();
        Ok(counts)
    }

    /// Unregister `name` and drop its namespace with every record in it.
    pub async fn drop_namespace(&self, name: &str) -> RewindResult<()> {
        let store = self
            .write()?
            .remove(name)
            .ok_or_else(|| RewindError::NamespaceNotFound {
                namespace: name.to_string(),
            })?;
        store.drop_namespace().await?;
        info!(namespace = %name, "Dropped namespace");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    use async_trait::async_trait;

    use crate::query::CompiledQuery;
    use crate::traits::StoreCapabilities;
    use crate::types::{FieldType, Payload, SchemaDescriptor, TurnId, VersionedRecord, VisibleTurns};

    /// Store that only tracks whether its namespace exists.
    struct NamespaceOnly {
        schema: SchemaDescriptor,
        created: AtomicBool,
    }

    impl NamespaceOnly {
        fn new(name: &str, key: &str) -> Arc<Self> {
            Arc::new(Self {
                schema: SchemaDescriptor::builder(name)
                    .key(key, FieldType::Text)
                    .build()
                    .unwrap(),
                created: AtomicBool::new(false),
            })
        }
    }

    #[async_trait]
    impl RecordStore for NamespaceOnly {
        fn namespace(&self) -> &str {
            self.schema.name()
        }
        fn schema(&self) -> &SchemaDescriptor {
            &self.schema
        }
        fn capabilities(&self) -> StoreCapabilities {
            StoreCapabilities::RELATIONAL
        }
        async fn create_namespace(&self) -> RewindResult<()> {
            self.created.store(true, Ordering::SeqCst);
            Ok(())
        }
        async fn drop_namespace(&self) -> RewindResult<()> {
            self.created.store(false, Ordering::SeqCst);
            Ok(())
        }
        async fn put(&self, _: &str, _: TurnId, _: &Payload) -> RewindResult<()> {
            Ok(())
        }
        async fn put_tombstone(&self, _: &str, _: TurnId) -> RewindResult<()> {
            Ok(())
        }
        async fn get_latest(
            &self,
            _: &str,
            _: &VisibleTurns,
        ) -> RewindResult<Option<VersionedRecord>> {
            Ok(None)
        }
        async fn scan(
            &self,
            _: &VisibleTurns,
            _: &CompiledQuery,
        ) -> RewindResult<Vec<VersionedRecord>> {
            Ok(Vec::new())
        }
        async fn count(&self) -> RewindResult<u64> {
            Ok(if self.created.load(Ordering::SeqCst) { 1 } else { 0 })
        }
    }

    #[tokio::test]
    async fn test_register_creates_namespace() {
        let manager = NamespaceManager::new();
        let users = NamespaceOnly::new("users", "id");
        manager.register(users.clone()).await.unwrap();

        assert!(users.created.load(Ordering::SeqCst));
        assert!(manager.contains("users"));
        assert_eq!(manager.get("users").unwrap().namespace(), "users");
        assert_eq!(manager.record_counts().await.unwrap(), vec![("users".to_string(), 1)]);
    }

    #[tokio::test]
    async fn test_unknown_namespace() {
        let manager = NamespaceManager::new();
        let err = manager.get("ghosts").err().unwrap();
        assert!(matches!(
            err,
            RewindError::NamespaceNotFound { ref namespace } if namespace == "ghosts"
        ));
        assert!(manager.drop_namespace("ghosts").await.is_err());
    }

    #[tokio::test]
    async fn test_conflicting_schema_rejected() {
        let manager = NamespaceManager::new();
        manager.register(NamespaceOnly::new("users", "id")).await.unwrap();
        manager.register(NamespaceOnly::new("users", "id")).await.unwrap();

        let err = manager
            .register(NamespaceOnly::new("users", "email"))
            .await
            .err()
            .unwrap();
        assert_eq!(err.code(), ErrorCode::ValInvalidSchema);
    }

    #[tokio::test]
    async fn test_names_and_drop() {
        let manager = NamespaceManager::new();
        let posts = NamespaceOnly::new("posts", "id");
        manager.register(posts.clone()).await.unwrap();
        manager.register(NamespaceOnly::new("authors", "id")).await.unwrap();
        assert_eq!(manager.names(), vec!["authors", "posts"]);

        manager.drop_namespace("posts").await.unwrap();
        assert!(!posts.created.load(Ordering::SeqCst));
        assert_eq!(manager.names(), vec!["authors"]);
    }
}
