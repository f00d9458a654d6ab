//! Validation and normalization of queries against a namespace.

use serde_json::Value;
use tracing::debug;

use super::{CompiledQuery, QuerySpec, SimilaritySearch};
use crate::error::{RewindError, RewindResult};
use crate::traits::{Embedder, StoreCapabilities};
use crate::types::{
    Expr, FieldType, IndexKind, OrderBy, SchemaDescriptor, Similarity, SimilarityQuery, SortKey,
};

/// Compiles [`QuerySpec`]s for one namespace.
pub struct QueryCompiler<'a> {
    schema: &'a SchemaDescriptor,
    capabilities: StoreCapabilities,
    embedder: Option<&'a dyn Embedder>,
}

impl<'a> QueryCompiler<'a> {
    pub fn new(schema: &'a SchemaDescriptor, capabilities: StoreCapabilities) -> Self {
        Self {
            schema,
            capabilities,
            embedder: None,
        }
    }

    /// Embedder used for text similarity requests.
    pub fn with_embedder(mut self, embedder: Option<&'a dyn Embedder>) -> Self {
        self.embedder = embedder;
        self
    }

    /// Validate `spec` and lower it into a [`CompiledQuery`].
    ///
    /// - unknown fields fail with `UnknownField`
    /// - similarity fails with `UnsupportedPredicate` on relational backends,
    ///   under `or`/`not`, or when requested twice
    /// - the logical key tiebreaker is appended to the ordering
    pub async fn compile(&self, spec: &QuerySpec) -> RewindResult<CompiledQuery> {
        let (predicate, similarity) = match &spec.filter {
            Some(filter) => self.split_similarity(filter)?,
            None => (None, None),
        };

        if let Some(predicate) = &predicate {
            self.check_expr(predicate)?;
        }

        let similarity = match similarity {
            Some(sim) => Some(self.resolve_similarity(sim).await?),
            None => None,
        };

        let mut order = Vec::with_capacity(spec.order.len() + 1);
        for term in &spec.order {
            if let SortKey::Field(name) = &term.key {
                let field = self.schema.require_field(name)?;
                if matches!(field.field_type, FieldType::Vector { .. }) {
                    return Err(RewindError::validation(format!(
                        "Cannot order '{}' by vector field '{}'",
                        self.schema.name(),
                        name
                    )));
                }
            }
            order.push(term.clone());
        }
        if !order.iter().any(|o| o.key == SortKey::LogicalKey) {
            order.push(OrderBy::tiebreaker());
        }

        debug!(
            namespace = self.schema.name(),
            has_predicate = predicate.is_some(),
            has_similarity = similarity.is_some(),
            order_terms = order.len(),
            "Compiled query"
        );

        Ok(CompiledQuery {
            predicate,
            similarity,
            order,
            limit: spec.limit,
            offset: spec.offset,
        })
    }

    fn unsupported(&self, message: impl Into<String>) -> RewindError {
        RewindError::unsupported(self.schema.name(), message)
    }

    /// Pull the single similarity node out of the filter.
    fn split_similarity<'e>(
        &self,
        filter: &'e Expr,
    ) -> RewindResult<(Option<Expr>, Option<&'e Similarity>)> {
        if contains_similarity(filter) && !self.capabilities.similarity {
            return Err(self.unsupported("similarity search requires a vector backend"));
        }

        match filter {
            Expr::Similarity(sim) => Ok((None, Some(sim))),
            Expr::And(items) => {
                let mut found = None;
                let mut rest = Vec::with_capacity(items.len());
                for item in items {
                    match item {
                        Expr::Similarity(sim) => {
                            if found.replace(sim).is_some() {
                                return Err(
                                    self.unsupported("at most one similarity request per query")
                                );
                            }
                        }
                        other => rest.push(other.clone()),
                    }
                }
                let predicate = match (found, rest.len()) {
                    (None, _) => Some(filter.clone()),
                    (Some(_), 0) => None,
                    (Some(_), 1) => rest.pop(),
                    (Some(_), _) => Some(Expr::And(rest)),
                };
                Ok((predicate, found))
            }
            other => Ok((Some(other.clone()), None)),
        }
    }

    /// Validate every node of a similarity-free predicate.
    fn check_expr(&self, expr: &Expr) -> RewindResult<()> {
        match expr {
            Expr::Comparison(cond) => {
                let field = self.schema.require_field(&cond.field)?;
                match field.field_type {
                    FieldType::Vector { .. } => Err(self.unsupported(format!(
                        "comparison on vector field '{}'",
                        cond.field
                    ))),
                    field_type if !literal_fits(field_type, &cond.value) => {
                        Err(RewindError::validation(format!(
                            "Field '{}' of '{}' is {:?}, cannot compare with {}",
                            cond.field,
                            self.schema.name(),
                            field_type,
                            cond.value
                        )))
                    }
                    _ => Ok(()),
                }
            }
            Expr::And(items) | Expr::Or(items) => {
                items.iter().try_for_each(|item| self.check_expr(item))
            }
            Expr::Not(inner) => self.check_expr(inner),
            Expr::Similarity(_) => Err(self.unsupported(
                "similarity may only appear at the top level or directly under 'and'",
            )),
        }
    }

    async fn resolve_similarity(&self, sim: &Similarity) -> RewindResult<SimilaritySearch> {
        let field = self.schema.require_field(&sim.field)?;
        let dimension = match (field.field_type, field.index) {
            (FieldType::Vector { dimension }, IndexKind::Vector) => dimension,
            _ => {
                return Err(self.unsupported(format!(
                    "'{}' is not a vector field",
                    sim.field
                )))
            }
        };

        let vector = match &sim.query {
            SimilarityQuery::Vector(vector) => vector.clone(),
            SimilarityQuery::Text(text) => {
                let embedder = self.embedder.ok_or_else(|| {
                    self.unsupported("text similarity requires an embedder")
                })?;
                embedder.embed(text).await?
            }
        };

        if vector.len() != dimension {
            return Err(RewindError::validation(format!(
                "Query vector for '{}' has {} dimensions, expected {}",
                sim.field,
                vector.len(),
                dimension
            )));
        }

        Ok(SimilaritySearch {
            field: sim.field.clone(),
            vector,
        })
    }
}

fn contains_similarity(expr: &Expr) -> bool {
    match expr {
        Expr::Similarity(_) => true,
        Expr::And(items) | Expr::Or(items) => items.iter().any(contains_similarity),
        Expr::Not(inner) => contains_similarity(inner),
        Expr::Comparison(_) => false,
    }
}

/// Whether a comparison literal makes sense for the field type.
fn literal_fits(field_type: FieldType, value: &Value) -> bool {
    match field_type {
        FieldType::Integer | FieldType::Float => value.is_number() || value.is_null(),
        other => other.accepts(value),
    }
}
