//! In-memory evaluation of filter expressions against payloads.
//!
//! Evaluation follows SQL three-valued logic so that a backend filtering
//! after fetch agrees with one filtering in SQL: a comparison against a
//! missing or null field is unknown, `NOT unknown` is unknown, and only rows
//! whose predicate is definitely true match. Values compare the way SQLite
//! compares `json_extract` results: null < numbers (booleans as 0/1) < text,
//! with arrays and objects compared as their JSON text.

use std::borrow::Cow;
use std::cmp::Ordering;

use serde_json::Value;

use crate::error::{RewindError, RewindResult};
use crate::types::{CompareOp, Comparison, Expr, FilterTranslator, Payload};

#[derive(Debug, PartialEq)]
enum Scalar<'a> {
    Null,
    Number(f64),
    Text(Cow<'a, str>),
}

impl Scalar<'_> {
    fn class(&self) -> u8 {
        match self {
            Scalar::Null => 0,
            Scalar::Number(_) => 1,
            Scalar::Text(_) => 2,
        }
    }
}

fn scalar(value: Option<&Value>) -> Scalar<'_> {
    match value {
        None | Some(Value::Null) => Scalar::Null,
        Some(Value::Bool(b)) => Scalar::Number(if *b { 1.0 } else { 0.0 }),
        Some(Value::Number(n)) => n.as_f64().map(Scalar::Number).unwrap_or(Scalar::Null),
        Some(Value::String(s)) => Scalar::Text(Cow::Borrowed(s)),
        Some(other) => Scalar::Text(Cow::Owned(other.to_string())),
    }
}

fn cmp_scalars(a: &Scalar<'_>, b: &Scalar<'_>) -> Ordering {
    match (a, b) {
        (Scalar::Number(x), Scalar::Number(y)) => x.partial_cmp(y).unwrap_or(Ordering::Equal),
        (Scalar::Text(x), Scalar::Text(y)) => x.cmp(y),
        _ => a.class().cmp(&b.class()),
    }
}

/// Total order used for sorting payload values; nulls sort first.
pub fn compare_values(a: Option<&Value>, b: Option<&Value>) -> Ordering {
    cmp_scalars(&scalar(a), &scalar(b))
}

fn compare(cond: &Comparison, payload: &Payload) -> Option<bool> {
    let field = scalar(payload.get(&cond.field));
    let literal = scalar(Some(&cond.value));

    if literal == Scalar::Null {
        return match cond.op {
            CompareOp::Eq => Some(field == Scalar::Null),
            CompareOp::Ne => Some(field != Scalar::Null),
            _ => None,
        };
    }
    if field == Scalar::Null {
        return None;
    }

    let ord = cmp_scalars(&field, &literal);
    Some(match cond.op {
        CompareOp::Eq => ord == Ordering::Equal,
        CompareOp::Ne => ord != Ordering::Equal,
        CompareOp::Lt => ord == Ordering::Less,
        CompareOp::Lte => ord != Ordering::Greater,
        CompareOp::Gt => ord == Ordering::Greater,
        CompareOp::Gte => ord != Ordering::Less,
    })
}

fn eval(expr: &Expr, payload: &Payload) -> Option<bool> {
    match expr {
        Expr::Comparison(cond) => compare(cond, payload),
        Expr::And(items) => {
            let mut unknown = false;
            for item in items {
                match eval(item, payload) {
                    Some(false) => return Some(false),
                    None => unknown = true,
                    Some(true) => {}
                }
            }
            if unknown {
                None
            } else {
                Some(true)
            }
        }
        Expr::Or(items) => {
            let mut unknown = false;
            for item in items {
                match eval(item, payload) {
                    Some(true) => return Some(true),
                    None => unknown = true,
                    Some(false) => {}
                }
            }
            if unknown {
                None
            } else {
                Some(false)
            }
        }
        Expr::Not(inner) => eval(inner, payload).map(|b| !b),
        // Similarity ranks rows, it never excludes them.
        Expr::Similarity(_) => Some(true),
    }
}

/// A filter compiled for evaluation against in-memory payloads.
#[derive(Debug, Clone, PartialEq)]
pub struct PayloadMatcher {
    expr: Option<Expr>,
}

impl PayloadMatcher {
    /// Matcher accepting every payload.
    pub fn any() -> Self {
        Self { expr: None }
    }

    pub fn matches(&self, payload: &Payload) -> bool {
        match &self.expr {
            Some(expr) => eval(expr, payload) == Some(true),
            None => true,
        }
    }
}

/// Translates filters into [`PayloadMatcher`]s for backends that filter after fetch.
#[derive(Debug, Clone, Copy, Default)]
pub struct PayloadTranslator;

impl FilterTranslator for PayloadTranslator {
    type Output = PayloadMatcher;
    type Error = RewindError;

    fn translate(&self, filter: &Expr) -> RewindResult<PayloadMatcher> {
        Ok(PayloadMatcher {
            expr: Some(filter.clone()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::field;
    use serde_json::json;

    fn payload(value: Value) -> Payload {
        value.as_object().cloned().unwrap()
    }

    fn matches(expr: Expr, value: Value) -> bool {
        PayloadTranslator
            .translate(&expr)
            .unwrap()
            .matches(&payload(value))
    }

    #[test]
    fn test_comparisons() {
        let row = json!({"name": "John", "age": 30, "score": 1.5, "active": true});
        assert!(matches(field("age").gt(25), row.clone()));
        assert!(matches(field("age").lte(30), row.clone()));
        assert!(!matches(field("age").lt(30), row.clone()));
        assert!(matches(field("name").eq("John"), row.clone()));
        assert!(matches(field("name").ne("Jane"), row.clone()));
        assert!(matches(field("score").gte(1.5), row.clone()));
        assert!(matches(field("active").eq(true), row));
    }

    #[test]
    fn test_missing_field_is_unknown() {
        let row = json!({"name": "John"});
        assert!(!matches(field("age").gt(25), row.clone()));
        assert!(!matches(field("age").ne(25), row.clone()));
        // NOT unknown stays unknown.
        assert!(!matches(Expr::not(field("age").gt(25)), row.clone()));
        // Unknown OR true is true.
        assert!(matches(
            Expr::or(vec![field("age").gt(25), field("name").eq("John")]),
            row.clone()
        ));
        assert!(matches(field("age").eq(Value::Null), row.clone()));
        assert!(!matches(field("name").eq(Value::Null), row));
    }

    #[test]
    fn test_logical_combinations() {
        let row = json!({"a": 1, "b": 2});
        assert!(matches(field("a").eq(1).and(field("b").eq(2)), row.clone()));
        assert!(!matches(field("a").eq(1).and(field("b").eq(3)), row.clone()));
        assert!(matches(Expr::not(field("a").eq(2)), row.clone()));
        assert!(matches(Expr::all(vec![]), row.clone()));
        assert!(!matches(Expr::or(vec![]), row));
    }

    #[test]
    fn test_cross_type_ordering_matches_sqlite() {
        // Text sorts after numbers.
        assert!(matches(field("v").gt(100), json!({"v": "1"})));
        assert_eq!(
            compare_values(Some(&json!(null)), Some(&json!(0))),
            Ordering::Less
        );
        assert_eq!(
            compare_values(Some(&json!(2)), Some(&json!("a"))),
            Ordering::Less
        );
        assert_eq!(compare_values(None, Some(&json!("b"))), Ordering::Less);
        assert_eq!(
            compare_values(Some(&json!(2.5)), Some(&json!(2))),
            Ordering::Greater
        );
    }

    #[test]
    fn test_any_matches_everything() {
        assert!(PayloadMatcher::any().matches(&Payload::new()));
    }
}
