//! Core traits for rewind backends and collaborators.

mod embedder;
mod ledger_store;
mod record_store;

pub use embedder::*;
pub use ledger_store::*;
pub use record_store::*;
