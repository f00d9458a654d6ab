//! Backend-agnostic filter expressions.
//!
//! Filters are plain values built through constructor functions or the
//! fluent [`field`] builder:
//!
//! ```
//! use rewind_core::types::{field, Expr};
//!
//! let adults = field("age").gt(25).and(field("name").ne("root"));
//! let either = Expr::or(vec![Expr::eq("team", "red"), Expr::eq("team", "blue")]);
//! ```

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Comparison operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CompareOp {
    Eq,
    Ne,
    Lt,
    Lte,
    Gt,
    Gte,
}

impl CompareOp {
    /// SQL spelling of the operator.
    pub fn as_sql(&self) -> &'static str {
        match self {
            CompareOp::Eq => "=",
            CompareOp::Ne => "<>",
            CompareOp::Lt => "<",
            CompareOp::Lte => "<=",
            CompareOp::Gt => ">",
            CompareOp::Gte => ">=",
        }
    }
}

/// `field op literal`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Comparison {
    /// Field name to compare.
    pub field: String,
    /// Operator to apply.
    pub op: CompareOp,
    /// Literal operand.
    pub value: Value,
}

/// What a similarity request compares against.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SimilarityQuery {
    /// A ready embedding.
    Vector(Vec<f32>),
    /// Text to embed through the store's embedder.
    Text(String),
}

/// Nearest-neighbour request against a vector field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Similarity {
    /// Target vector field.
    pub field: String,
    pub query: SimilarityQuery,
}

/// Filter expression tree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Expr {
    /// Single comparison.
    Comparison(Comparison),
    /// AND of multiple expressions.
    And(Vec<Expr>),
    /// OR of multiple expressions.
    Or(Vec<Expr>),
    /// NOT of an expression.
    Not(Box<Expr>),
    /// Similarity request, only valid on vector backends.
    Similarity(Similarity),
}

impl Expr {
    fn compare(field: impl Into<String>, op: CompareOp, value: impl Into<Value>) -> Self {
        Expr::Comparison(Comparison {
            field: field.into(),
            op,
            value: value.into(),
        })
    }

    /// Create an equality filter.
    pub fn eq(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::compare(field, CompareOp::Eq, value)
    }

    /// Create an inequality filter.
    pub fn ne(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::compare(field, CompareOp::Ne, value)
    }

    /// Create a less than filter.
    pub fn lt(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::compare(field, CompareOp::Lt, value)
    }

    /// Create a less than or equal filter.
    pub fn lte(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::compare(field, CompareOp::Lte, value)
    }

    /// Create a greater than filter.
    pub fn gt(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::compare(field, CompareOp::Gt, value)
    }

    /// Create a greater than or equal filter.
    pub fn gte(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::compare(field, CompareOp::Gte, value)
    }

    /// Create an AND filter.
    pub fn all(filters: Vec<Expr>) -> Self {
        Expr::And(filters)
    }

    /// Create an OR filter.
    pub fn or(filters: Vec<Expr>) -> Self {
        Expr::Or(filters)
    }

    /// Create a NOT filter.
    pub fn not(filter: Expr) -> Self {
        Expr::Not(Box::new(filter))
    }

    /// Nearest neighbours of `vector` in `field`.
    pub fn similar_to(field: impl Into<String>, vector: Vec<f32>) -> Self {
        Expr::Similarity(Similarity {
            field: field.into(),
            query: SimilarityQuery::Vector(vector),
        })
    }

    /// Nearest neighbours of the embedding of `text` in `field`.
    pub fn similar_to_text(field: impl Into<String>, text: impl Into<String>) -> Self {
        Expr::Similarity(Similarity {
            field: field.into(),
            query: SimilarityQuery::Text(text.into()),
        })
    }

    /// Conjunction with another expression, flattening nested ANDs.
    pub fn and(self, other: Expr) -> Self {
        match self {
            Expr::And(mut items) => {
                items.push(other);
                Expr::And(items)
            }
            first => Expr::And(vec![first, other]),
        }
    }

    /// Visit every comparison in the tree.
    pub fn comparisons(&self) -> Vec<&Comparison> {
        let mut out = Vec::new();
        self.collect_comparisons(&mut out);
        out
    }

    fn collect_comparisons<'a>(&'a self, out: &mut Vec<&'a Comparison>) {
        match self {
            Expr::Comparison(c) => out.push(c),
            Expr::And(items) | Expr::Or(items) => {
                items.iter().for_each(|e| e.collect_comparisons(out))
            }
            Expr::Not(inner) => inner.collect_comparisons(out),
            Expr::Similarity(_) => {}
        }
    }
}

/// Fluent entry point: `field("age").gt(25)`.
pub fn field(name: impl Into<String>) -> FieldRef {
    FieldRef { name: name.into() }
}

/// A field name waiting for its comparison.
#[derive(Debug, Clone)]
pub struct FieldRef {
    name: String,
}

impl FieldRef {
    pub fn eq(self, value: impl Into<Value>) -> Expr {
        Expr::eq(self.name, value)
    }

    pub fn ne(self, value: impl Into<Value>) -> Expr {
        Expr::ne(self.name, value)
    }

    pub fn lt(self, value: impl Into<Value>) -> Expr {
        Expr::lt(self.name, value)
    }

    pub fn lte(self, value: impl Into<Value>) -> Expr {
        Expr::lte(self.name, value)
    }

    pub fn gt(self, value: impl Into<Value>) -> Expr {
        Expr::gt(self.name, value)
    }

    pub fn gte(self, value: impl Into<Value>) -> Expr {
        Expr::gte(self.name, value)
    }

    pub fn similar_to(self, vector: Vec<f32>) -> Expr {
        Expr::similar_to(self.name, vector)
    }

    pub fn similar_to_text(self, text: impl Into<String>) -> Expr {
        Expr::similar_to_text(self.name, text)
    }
}

/// Sort direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortDirection {
    #[default]
    Asc,
    Desc,
}

impl SortDirection {
    pub fn as_sql(&self) -> &'static str {
        match self {
            SortDirection::Asc => "ASC",
            SortDirection::Desc => "DESC",
        }
    }
}

/// What an ordering term sorts on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SortKey {
    /// A payload field.
    Field(String),
    /// The logical key, used as the deterministic tiebreaker.
    LogicalKey,
}

/// One ordering term.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderBy {
    pub key: SortKey,
    pub direction: SortDirection,
}

impl OrderBy {
    pub fn asc(field: impl Into<String>) -> Self {
        Self {
            key: SortKey::Field(field.into()),
            direction: SortDirection::Asc,
        }
    }

    pub fn desc(field: impl Into<String>) -> Self {
        Self {
            key: SortKey::Field(field.into()),
            direction: SortDirection::Desc,
        }
    }

    /// Logical key ascending.
    pub fn tiebreaker() -> Self {
        Self {
            key: SortKey::LogicalKey,
            direction: SortDirection::Asc,
        }
    }
}

/// Trait for translating filters to backend-specific formats.
pub trait FilterTranslator {
    type Output;
    type Error;

    /// Translate a filter to the backend-specific format.
    fn translate(&self, filter: &Expr) -> Result<Self::Output, Self::Error>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_fluent_builder_matches_constructors() {
        assert_eq!(field("age").gt(25), Expr::gt("age", 25));
        assert_eq!(
            field("age").gt(25).and(field("name").eq("John")),
            Expr::all(vec![Expr::gt("age", 25), Expr::eq("name", "John")])
        );
    }

    #[test]
    fn test_and_flattens() {
        let expr = Expr::eq("a", 1).and(Expr::eq("b", 2)).and(Expr::eq("c", 3));
        match expr {
            Expr::And(items) => assert_eq!(items.len(), 3),
            other => panic!("expected And, got {:?}", other),
        }
    }

    #[test]
    fn test_comparisons_walks_whole_tree() {
        let expr = Expr::not(Expr::or(vec![
            Expr::eq("a", 1),
            Expr::all(vec![Expr::lt("b", 2), Expr::similar_to("v", vec![1.0])]),
        ]));
        let fields: Vec<&str> = expr.comparisons().iter().map(|c| c.field.as_str()).collect();
        assert_eq!(fields, vec!["a", "b"]);
    }

    #[test]
    fn test_serde_shape() {
        let expr = Expr::gte("age", 30);
        let value = serde_json::to_value(&expr).unwrap();
        assert_eq!(
            value,
            json!({"Comparison": {"field": "age", "op": "gte", "value": 30}})
        );
    }
}
