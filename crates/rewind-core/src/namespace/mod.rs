//! Namespaces: one record store per registered entity type.

mod handle;
mod manager;

pub use handle::{ModelHandle, Query};
pub use manager::NamespaceManager;
