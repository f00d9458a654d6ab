//! Factory for creating record store backends.

use std::sync::Arc;

use rewind_core::config::{RecordStoreConfig, RecordStoreProvider};
use rewind_core::error::{RewindError, RewindResult};
use rewind_core::traits::RecordStore;
use rewind_core::types::SchemaDescriptor;
use rewind_core::{ModelHandle, Rewind};

/// Factory for creating record store backends.
pub struct RecordStoreFactory;

impl RecordStoreFactory {
    /// Create the store for one namespace from the given configuration.
    ///
    /// The namespace is not created yet; `Rewind::register` does that.
    pub fn create(
        config: &RecordStoreConfig,
        schema: SchemaDescriptor,
    ) -> RewindResult<Arc<dyn RecordStore>> {
        if let Some(parent) = config.path.as_ref().and_then(|p| p.parent()) {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        match config.provider {
            #[cfg(feature = "sqlite")]
            RecordStoreProvider::Sqlite => {
                let store = match &config.path {
                    Some(path) => crate::sqlite::SqliteRecordStore::new(path, schema)?,
                    None => crate::sqlite::SqliteRecordStore::in_memory(schema)?,
                };
                Ok(Arc::new(store))
            }

            #[cfg(feature = "sqlite-vec")]
            RecordStoreProvider::SqliteVec => {
                let store = match &config.path {
                    Some(path) => crate::sqlite_vec::SqliteVecRecordStore::new(path, schema)?,
                    None => crate::sqlite_vec::SqliteVecRecordStore::in_memory(schema)?,
                };
                Ok(Arc::new(store))
            }

            #[allow(unreachable_patterns)]
            provider => Err(RewindError::Configuration(format!(
                "Record store provider {:?} is not enabled. Enable the corresponding feature flag.",
                provider
            ))),
        }
    }

    /// Build the store `rewind` is configured for and register it.
    pub async fn register(rewind: &Rewind, schema: SchemaDescriptor) -> RewindResult<ModelHandle> {
        let store = Self::create(&rewind.config().record_store, schema)?;
        rewind.register(store).await
    }

    /// In-memory relational store.
    #[cfg(feature = "sqlite")]
    pub fn sqlite_memory(schema: SchemaDescriptor) -> RewindResult<Arc<dyn RecordStore>> {
        Self::create(&RecordStoreConfig::in_memory(RecordStoreProvider::Sqlite), schema)
    }

    /// In-memory vector store.
    #[cfg(feature = "sqlite-vec")]
    pub fn sqlite_vec_memory(schema: SchemaDescriptor) -> RewindResult<Arc<dyn RecordStore>> {
        Self::create(&RecordStoreConfig::in_memory(RecordStoreProvider::SqliteVec), schema)
    }
}
