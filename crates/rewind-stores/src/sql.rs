//! SQL generation shared by the SQLite backends.
//!
//! Payloads are stored as JSON text and fields are read with
//! `json_extract(payload, '$.field')`. Field names reaching this module have
//! been checked against the schema, whose builder only admits identifiers.

use rusqlite::types::Value as SqlValue;
use serde_json::Value;

use rewind_core::error::{RewindError, RewindResult};
use rewind_core::types::{
    CompareOp, Comparison, Expr, FilterTranslator, OrderBy, SortKey, VisibleTurns,
};

/// A WHERE fragment with its positional parameters, in textual order.
#[derive(Debug, Clone, PartialEq)]
pub struct SqlFilter {
    pub clause: String,
    pub params: Vec<SqlValue>,
}

/// Translates filter expressions into SQLite WHERE fragments.
///
/// Similarity nodes are rejected: they rank rows and cannot be expressed
/// as a boolean condition.
#[derive(Debug, Clone, Copy)]
pub struct SqlTranslator<'a> {
    namespace: &'a str,
}

impl<'a> SqlTranslator<'a> {
    pub fn new(namespace: &'a str) -> Self {
        Self { namespace }
    }

    fn build(&self, expr: &Expr, params: &mut Vec<SqlValue>) -> RewindResult<String> {
        match expr {
            Expr::Comparison(cond) => Ok(condition(cond, params)),
            Expr::And(items) => self.join(items, " AND ", "1", params),
            Expr::Or(items) => self.join(items, " OR ", "0", params),
            Expr::Not(inner) => Ok(format!("NOT ({})", self.build(inner, params)?)),
            Expr::Similarity(sim) => Err(RewindError::unsupported(
                self.namespace,
                format!(
                    "similarity on '{}' cannot be evaluated as a SQL condition",
                    sim.field
                ),
            )),
        }
    }

    fn join(
        &self,
        items: &[Expr],
        separator: &str,
        empty: &str,
        params: &mut Vec<SqlValue>,
    ) -> RewindResult<String> {
        if items.is_empty() {
            return Ok(empty.to_string());
        }
        let parts = items
            .iter()
            .map(|item| self.build(item, params))
            .collect::<RewindResult<Vec<_>>>()?;
        Ok(format!("({})", parts.join(separator)))
    }
}

impl FilterTranslator for SqlTranslator<'_> {
    type Output = SqlFilter;
    type Error = RewindError;

    fn translate(&self, filter: &Expr) -> RewindResult<SqlFilter> {
        let mut params = Vec::new();
        let clause = self.build(filter, &mut params)?;
        Ok(SqlFilter { clause, params })
    }
}

fn condition(cond: &Comparison, params: &mut Vec<SqlValue>) -> String {
    let column = json_column(&cond.field);
    match (&cond.value, cond.op) {
        (Value::Null, CompareOp::Eq) => format!("{} IS NULL", column),
        (Value::Null, CompareOp::Ne) => format!("{} IS NOT NULL", column),
        // Ordering against null is unknown.
        (Value::Null, _) => "NULL".to_string(),
        (value, op) => {
            params.push(sql_value(value));
            format!("{} {} ?", column, op.as_sql())
        }
    }
}

/// Bind a JSON literal the way `json_extract` would return it.
pub fn sql_value(value: &Value) -> SqlValue {
    match value {
        Value::Null => SqlValue::Null,
        Value::Bool(b) => SqlValue::Integer(i64::from(*b)),
        Value::Number(n) => match n.as_i64() {
            Some(i) => SqlValue::Integer(i),
            None => SqlValue::Real(n.as_f64().unwrap_or(f64::NAN)),
        },
        Value::String(s) => SqlValue::Text(s.clone()),
        other => SqlValue::Text(other.to_string()),
    }
}

/// Expression reading a payload field.
pub fn json_column(field: &str) -> String {
    format!("json_extract(payload, '$.{}')", field.replace('\'', "''"))
}

/// Quote a table or index name.
pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// ORDER BY terms, without the keyword.
pub fn order_terms(order: &[OrderBy]) -> String {
    let mut terms: Vec<String> = order
        .iter()
        .map(|o| {
            let key = match &o.key {
                SortKey::Field(field) => json_column(field),
                SortKey::LogicalKey => "logical_key".to_string(),
            };
            format!("{} {}", key, o.direction.as_sql())
        })
        .collect();
    if !order.iter().any(|o| o.key == SortKey::LogicalKey) {
        terms.push("logical_key ASC".to_string());
    }
    terms.join(", ")
}

/// LIMIT/OFFSET clause; appends its parameters.
pub fn limit_clause(limit: Option<usize>, offset: usize, params: &mut Vec<SqlValue>) -> String {
    params.push(SqlValue::Integer(limit.map(|l| l as i64).unwrap_or(-1)));
    params.push(SqlValue::Integer(offset as i64));
    "LIMIT ? OFFSET ?".to_string()
}

/// CTE `visible(turn_id, rank)` over the resolved turns, bound as one JSON parameter.
pub const VISIBLE_CTE: &str = "visible(turn_id, rank) AS (
        SELECT json_extract(value, '$[0]'), json_extract(value, '$[1]')
        FROM json_each(?)
    )";

/// Parameter for [`VISIBLE_CTE`]: `[[turn_id, rank], ...]`.
pub fn visible_param(visible: &VisibleTurns) -> RewindResult<SqlValue> {
    let pairs: Vec<[i64; 2]> = visible
        .turns()
        .iter()
        .map(|t| [t.turn_id.get(), i64::from(t.rank)])
        .collect();
    Ok(SqlValue::Text(serde_json::to_string(&pairs)?))
}

/// Map a SQLite error, recognising a missing namespace table.
pub fn store_error(namespace: &str, err: rusqlite::Error) -> RewindError {
    if let rusqlite::Error::SqliteFailure(_, Some(message)) = &err {
        if message.starts_with("no such table") {
            return RewindError::NamespaceNotFound {
                namespace: namespace.to_string(),
            };
        }
    }
    err.into()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rewind_core::types::field;
    use serde_json::json;

    fn translate(expr: Expr) -> SqlFilter {
        SqlTranslator::new("users").translate(&expr).unwrap()
    }

    #[test]
    fn test_comparison() {
        let filter = translate(field("age").gt(25));
        assert_eq!(filter.clause, "json_extract(payload, '$.age') > ?");
        assert_eq!(filter.params, vec![SqlValue::Integer(25)]);
    }

    #[test]
    fn test_nested_logic_keeps_param_order() {
        let filter = translate(Expr::or(vec![
            field("age").gte(18).and(field("name").ne("Jane")),
            Expr::not(field("active").eq(true)),
        ]));
        assert_eq!(
            filter.clause,
            "((json_extract(payload, '$.age') >= ? AND json_extract(payload, '$.name') <> ?) \
             OR NOT (json_extract(payload, '$.active') = ?))"
        );
        assert_eq!(
            filter.params,
            vec![
                SqlValue::Integer(18),
                SqlValue::Text("Jane".into()),
                SqlValue::Integer(1),
            ]
        );
    }

    #[test]
    fn test_null_literals() {
        assert_eq!(
            translate(field("email").eq(Value::Null)).clause,
            "json_extract(payload, '$.email') IS NULL"
        );
        assert_eq!(
            translate(field("email").ne(Value::Null)).clause,
            "json_extract(payload, '$.email') IS NOT NULL"
        );
        let unknown = translate(field("age").lt(Value::Null));
        assert_eq!(unknown.clause, "NULL");
        assert!(unknown.params.is_empty());
    }

    #[test]
    fn test_literal_binding() {
        assert_eq!(sql_value(&json!(1.5)), SqlValue::Real(1.5));
        assert_eq!(sql_value(&json!(false)), SqlValue::Integer(0));
        assert_eq!(sql_value(&json!(["a"])), SqlValue::Text("[\"a\"]".into()));
    }

    #[test]
    fn test_similarity_rejected() {
        let err = SqlTranslator::new("docs")
            .translate(&field("embedding").similar_to(vec![0.1, 0.2]))
            .unwrap_err();
        assert!(matches!(err, RewindError::UnsupportedPredicate { .. }));
    }

    #[test]
    fn test_order_terms_append_tiebreaker() {
        assert_eq!(
            order_terms(&[OrderBy::desc("age")]),
            "json_extract(payload, '$.age') DESC, logical_key ASC"
        );
        assert_eq!(order_terms(&[OrderBy::tiebreaker()]), "logical_key ASC");
    }
}
