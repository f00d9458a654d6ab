//! Query compilation.
//!
//! A [`QuerySpec`] is what the caller asks for: a filter expression,
//! ordering and paging. [`QueryCompiler`] checks it against the namespace
//! schema and the backend's capabilities and produces a [`CompiledQuery`],
//! which each record store then translates to its native form.

mod compiler;
mod matcher;

pub use compiler::QueryCompiler;
pub use matcher::{compare_values, PayloadMatcher, PayloadTranslator};

use serde::{Deserialize, Serialize};

use crate::types::{Expr, OrderBy};

/// Backend-agnostic read request.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QuerySpec {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub filter: Option<Expr>,
    #[serde(default)]
    pub order: Vec<OrderBy>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub limit: Option<usize>,
    #[serde(default)]
    pub offset: usize,
}

impl QuerySpec {
    pub fn new() -> Self {
        Self::default()
    }

    /// AND `expr` onto the current filter.
    pub fn filter(mut self, expr: Expr) -> Self {
        self.filter = Some(match self.filter.take() {
            Some(existing) => existing.and(expr),
            None => expr,
        });
        self
    }

    pub fn order_by(mut self, field: impl Into<String>, ascending: bool) -> Self {
        self.order.push(if ascending {
            OrderBy::asc(field)
        } else {
            OrderBy::desc(field)
        });
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn offset(mut self, offset: usize) -> Self {
        self.offset = offset;
        self
    }
}

/// Nearest-neighbour part of a compiled query, with the query text already embedded.
#[derive(Debug, Clone, PartialEq)]
pub struct SimilaritySearch {
    pub field: String,
    pub vector: Vec<f32>,
}

/// A validated query ready for a record store.
#[derive(Debug, Clone, PartialEq)]
pub struct CompiledQuery {
    /// Filter with the similarity node removed; `None` matches everything.
    pub predicate: Option<Expr>,
    /// Present only on backends that support similarity.
    pub similarity: Option<SimilaritySearch>,
    /// Explicit ordering followed by the logical key tiebreaker.
    pub order: Vec<OrderBy>,
    pub limit: Option<usize>,
    pub offset: usize,
}

impl CompiledQuery {
    /// Match-all query ordered by logical key.
    pub fn all() -> Self {
        Self {
            predicate: None,
            similarity: None,
            order: vec![OrderBy::tiebreaker()],
            limit: None,
            offset: 0,
        }
    }
}
