//! Core types for rewind.

mod branch;
mod filter;
mod ids;
mod record;
mod schema;
mod segment;
mod turn;

pub use branch::{Branch, NewBranch};
pub use filter::*;
pub use ids::{BranchId, TurnId};
pub use record::{Payload, SavedRecord, VersionedRecord};
pub use schema::{is_identifier, FieldSpec, FieldType, IndexKind, SchemaBuilder, SchemaDescriptor};
pub use segment::{VisibilitySegment, VisibleTurn, VisibleTurns};
pub use turn::{Turn, TurnStatus};
