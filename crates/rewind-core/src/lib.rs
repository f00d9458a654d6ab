//! rewind-core - Core library for rewind.
//!
//! This crate provides the branch/turn ledger, ancestry resolution, query
//! compilation and the [`Rewind`] composition root. Record store backends
//! live in `rewind-stores`.
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use rewind_core::{field, FieldType, Rewind, RewindConfig, SchemaDescriptor};
//! use rewind_stores::SqliteRecordStore;
//!
//! let rewind = Rewind::open(RewindConfig::default()).await?;
//! let schema = SchemaDescriptor::builder("users")
//!     .key("name", FieldType::Text)
//!     .indexed("age", FieldType::Integer)
//!     .build()?;
//! let users = rewind
//!     .register(Arc::new(SqliteRecordStore::in_memory(schema)?))
//!     .await?;
//!
//! users.save(payload, None).await?;
//! let adults = users
//!     .query(None)
//!     .filter(field("age").gt(25))
//!     .limit(2)
//!     .fetch()
//!     .await?;
//! ```

pub mod ancestry;
pub mod config;
pub mod error;
pub mod ledger;
pub mod namespace;
pub mod query;
pub mod repo;
pub mod rewind;
pub mod runtime;
pub mod traits;
pub mod types;

// Re-export commonly used types
pub use ancestry::AncestryResolver;
pub use config::{RecordStoreConfig, RecordStoreProvider, RetryPolicy, RewindConfig};
pub use error::{ErrorClass, ErrorCode, RewindError, RewindResult};
pub use ledger::{Ledger, SqliteLedgerStore, MAIN_BRANCH};
pub use namespace::{ModelHandle, NamespaceManager, Query};
pub use query::{CompiledQuery, QueryCompiler, QuerySpec, SimilaritySearch};
pub use repo::{ReadScope, Repo};
pub use rewind::Rewind;
pub use traits::{Embedder, LedgerStore, RecordStore, StoreCapabilities};
pub use types::{
    field, Branch, BranchId, CompareOp, Expr, FieldSpec, FieldType, FilterTranslator, IndexKind,
    OrderBy, Payload, SavedRecord, SchemaDescriptor, SortDirection, SortKey, Turn, TurnId,
    TurnStatus, VersionedRecord, VisibilitySegment, VisibleTurns,
};
