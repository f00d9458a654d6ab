//! rewind-stores - Record store implementations for rewind.
//!
//! # Supported Backends
//!
//! - **SQLite** (feature: `sqlite`) - relational store; filtering, shadowing
//!   and paging run in SQL
//! - **sqlite-vec** (feature: `sqlite-vec`) - SQLite with the sqlite-vec
//!   extension; adds similarity search over vector fields
//!
//! Both are enabled by default. Build a store with [`RecordStoreFactory`]
//! or directly, then hand it to `Rewind::register`.

mod factory;

#[cfg(feature = "sqlite")]
mod sql;

#[cfg(feature = "sqlite")]
mod table;

#[cfg(feature = "sqlite")]
mod sqlite;

#[cfg(feature = "sqlite-vec")]
mod sqlite_vec;

// Public exports
pub use factory::RecordStoreFactory;

#[cfg(feature = "sqlite")]
pub use sql::{SqlFilter, SqlTranslator};

#[cfg(feature = "sqlite")]
pub use sqlite::SqliteRecordStore;

#[cfg(feature = "sqlite-vec")]
pub use sqlite_vec::SqliteVecRecordStore;

// Re-export core types for convenience
pub use rewind_core::config::{RecordStoreConfig, RecordStoreProvider};
pub use rewind_core::traits::{RecordStore, StoreCapabilities};
