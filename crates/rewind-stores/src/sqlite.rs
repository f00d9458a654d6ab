//! Relational record store on SQLite.
//!
//! Reads are answered entirely in SQL: the visible turns are joined in as a
//! ranked CTE, `ROW_NUMBER()` keeps the best-ranked version per logical key,
//! and the compiled filter, ordering and paging run on the survivors.

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use rusqlite::{params_from_iter, Connection};
use tracing::debug;

use rewind_core::error::{RewindError, RewindResult};
use rewind_core::query::CompiledQuery;
use rewind_core::traits::{RecordStore, StoreCapabilities};
use rewind_core::types::{
    FilterTranslator, Payload, SchemaDescriptor, TurnId, VersionedRecord, VisibleTurns,
};

use crate::sql::{limit_clause, order_terms, visible_param, SqlTranslator, VISIBLE_CTE};
use crate::table::{parse_payload, RecordTable};

/// Relational record store: one SQLite table per namespace.
pub struct SqliteRecordStore {
    table: RecordTable,
}

impl SqliteRecordStore {
    /// Open (or create) the database file at `path`.
    pub fn new(path: impl AsRef<Path>, schema: SchemaDescriptor) -> RewindResult<Self> {
        let conn = Connection::open(path)?;
        conn.busy_timeout(Duration::from_secs(5))?;
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;
        Ok(Self::with_connection(conn, schema))
    }

    /// Private in-memory database.
    pub fn in_memory(schema: SchemaDescriptor) -> RewindResult<Self> {
        Ok(Self::with_connection(Connection::open_in_memory()?, schema))
    }

    pub fn with_connection(conn: Connection, schema: SchemaDescriptor) -> Self {
        Self {
            table: RecordTable::new(conn, schema, false),
        }
    }
}

#[async_trait]
impl RecordStore for SqliteRecordStore {
    fn namespace(&self) -> &str {
        self.table.namespace()
    }

    fn schema(&self) -> &SchemaDescriptor {
        self.table.schema()
    }

    fn capabilities(&self) -> StoreCapabilities {
        StoreCapabilities::RELATIONAL
    }

    async fn create_namespace(&self) -> RewindResult<()> {
        self.table.create()
    }

    async fn drop_namespace(&self) -> RewindResult<()> {
        self.table.drop_table()
    }

    async fn put(&self, logical_key: &str, turn_id: TurnId, payload: &Payload) -> RewindResult<()> {
        self.table.insert(logical_key, turn_id, Some(payload), Vec::new())
    }

    async fn put_tombstone(&self, logical_key: &str, turn_id: TurnId) -> RewindResult<()> {
        self.table.insert(logical_key, turn_id, None, Vec::new())
    }

    async fn get_latest(
        &self,
        logical_key: &str,
        visible: &VisibleTurns,
    ) -> RewindResult<Option<VersionedRecord>> {
        self.table.latest(logical_key, visible)
    }

    async fn scan(
        &self,
        visible: &VisibleTurns,
        query: &CompiledQuery,
    ) -> RewindResult<Vec<VersionedRecord>> {
        if let Some(similarity) = &query.similarity {
            return Err(RewindError::unsupported(
                self.namespace(),
                format!(
                    "relational store cannot rank by similarity on '{}'",
                    similarity.field
                ),
            ));
        }
        if visible.is_empty() {
            return Ok(Vec::new());
        }

        let mut params = vec![visible_param(visible)?];
        let filter = match &query.predicate {
            Some(expr) => {
                let filter = SqlTranslator::new(self.namespace()).translate(expr)?;
                params.extend(filter.params);
                filter.clause
            }
            None => "1".to_string(),
        };
        let limit = limit_clause(query.limit, query.offset, &mut params);

        let sql = format!(
            r#"WITH {cte},
               latest AS (
                   SELECT r.logical_key, r.turn_id, r.payload, r.deleted,
                          ROW_NUMBER() OVER (PARTITION BY r.logical_key ORDER BY v.rank) AS rn
                   FROM {table} r
                   JOIN visible v ON v.turn_id = r.turn_id
               )
               SELECT logical_key, turn_id, payload
               FROM latest
               WHERE rn = 1 AND deleted = 0 AND ({filter})
               ORDER BY {order}
               {limit}"#,
            cte = VISIBLE_CTE,
            table = self.table.table(),
            filter = filter,
            order = order_terms(&query.order),
            limit = limit,
        );
        debug!(namespace = self.namespace(), sql = %sql, "Scanning");

        let conn = self.table.lock()?;
        let mut stmt = conn.prepare(&sql).map_err(|e| self.table.map_err(e))?;
        let rows = stmt
            .query_map(params_from_iter(params.iter()), |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, TurnId>(1)?,
                    row.get::<_, String>(2)?,
                ))
            })
            .map_err(|e| self.table.map_err(e))?;

        let mut records = Vec::new();
        for row in rows {
            let (logical_key, turn_id, payload) = row.map_err(|e| self.table.map_err(e))?;
            records.push(VersionedRecord::new(logical_key, turn_id, parse_payload(&payload)?));
        }
        Ok(records)
    }

    async fn count(&self) -> RewindResult<u64> {
        self.table.count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rewind_core::query::{QueryCompiler, QuerySpec};
    use rewind_core::types::{field, BranchId, FieldType};
    use rewind_core::Ledger;
    use serde_json::{json, Value};

    fn users() -> SchemaDescriptor {
        SchemaDescriptor::builder("users")
            .key("name", FieldType::Text)
            .indexed("age", FieldType::Integer)
            .field("email", FieldType::Text)
            .build()
            .unwrap()
    }

    fn payload(value: Value) -> Payload {
        value.as_object().cloned().unwrap()
    }

    async fn setup() -> (Ledger, BranchId, SqliteRecordStore) {
        let ledger = Ledger::in_memory().unwrap();
        let main = ledger.create_branch(None, None).await.unwrap();
        let store = SqliteRecordStore::in_memory(users()).unwrap();
        store.create_namespace().await.unwrap();
        (ledger, main.id, store)
    }

    /// Write `rows` in one committed turn.
    async fn commit(
        ledger: &Ledger,
        branch: BranchId,
        store: &SqliteRecordStore,
        rows: Vec<Value>,
    ) -> TurnId {
        let turn = ledger.open_turn(branch, None).await.unwrap();
        for row in rows {
            let row = payload(row);
            let key = store.schema().logical_key(&row).unwrap();
            store.put(&key, turn.id, &row).await.unwrap();
        }
        ledger.commit_turn(turn.id).await.unwrap();
        turn.id
    }

    async fn scan(
        ledger: &Ledger,
        branch: BranchId,
        store: &SqliteRecordStore,
        spec: QuerySpec,
    ) -> Vec<VersionedRecord> {
        let compiled = QueryCompiler::new(store.schema(), store.capabilities())
            .compile(&spec)
            .await
            .unwrap();
        let visible = ledger.visible_turns(branch, None).await.unwrap();
        store.scan(&visible, &compiled).await.unwrap()
    }

    fn names(records: &[VersionedRecord]) -> Vec<&str> {
        records.iter().map(|r| r.logical_key.as_str()).collect()
    }

    #[tokio::test]
    async fn test_latest_version_wins() {
        let (ledger, main, store) = setup().await;
        commit(&ledger, main, &store, vec![json!({"name": "John", "age": 30})]).await;
        let second = commit(&ledger, main, &store, vec![json!({"name": "John", "age": 31})]).await;

        let visible = ledger.visible_turns(main, None).await.unwrap();
        let record = store.get_latest("John", &visible).await.unwrap().unwrap();
        assert_eq!(record.turn_id, second);
        assert_eq!(record.payload["age"], json!(31));

        let old = ledger.visible_turns(main, Some(0)).await.unwrap();
        let record = store.get_latest("John", &old).await.unwrap().unwrap();
        assert_eq!(record.payload["age"], json!(30));

        assert!(store.get_latest("Jane", &visible).await.unwrap().is_none());
        assert_eq!(store.count().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_staged_rows_are_invisible() {
        let (ledger, main, store) = setup().await;
        let turn = ledger.open_turn(main, None).await.unwrap();
        store
            .put("John", turn.id, &payload(json!({"name": "John", "age": 30})))
            .await
            .unwrap();

        let visible = ledger.visible_turns(main, None).await.unwrap();
        assert!(store.get_latest("John", &visible).await.unwrap().is_none());
        assert!(scan(&ledger, main, &store, QuerySpec::new()).await.is_empty());
    }

    #[tokio::test]
    async fn test_duplicate_key_in_turn() {
        let (ledger, main, store) = setup().await;
        let turn = ledger.open_turn(main, None).await.unwrap();
        let row = payload(json!({"name": "John"}));
        store.put("John", turn.id, &row).await.unwrap();

        let err = store.put("John", turn.id, &row).await.unwrap_err();
        assert!(matches!(
            err,
            RewindError::DuplicateLogicalKeyInTurn { ref logical_key, .. } if logical_key == "John"
        ));
    }

    #[tokio::test]
    async fn test_missing_namespace() {
        let store = SqliteRecordStore::in_memory(users()).unwrap();
        let err = store.count().await.unwrap_err();
        assert!(matches!(
            err,
            RewindError::NamespaceNotFound { ref namespace } if namespace == "users"
        ));

        store.create_namespace().await.unwrap();
        store.drop_namespace().await.unwrap();
        assert!(store.count().await.is_err());
    }

    #[tokio::test]
    async fn test_filter_after_shadowing() {
        let (ledger, main, store) = setup().await;
        commit(
            &ledger,
            main,
            &store,
            vec![
                json!({"name": "Alice", "age": 40}),
                json!({"name": "Bob", "age": 20}),
            ],
        )
        .await;
        // Alice gets younger: her old version must not match any more.
        commit(&ledger, main, &store, vec![json!({"name": "Alice", "age": 22})]).await;

        let rows = scan(
            &ledger,
            main,
            &store,
            QuerySpec::new().filter(field("age").gt(25)),
        )
        .await;
        assert!(rows.is_empty());

        let rows = scan(
            &ledger,
            main,
            &store,
            QuerySpec::new().filter(field("age").lt(25)),
        )
        .await;
        assert_eq!(names(&rows), vec!["Alice", "Bob"]);
    }

    #[tokio::test]
    async fn test_tombstone_hides_key() {
        let (ledger, main, store) = setup().await;
        commit(&ledger, main, &store, vec![json!({"name": "John", "age": 30})]).await;

        let turn = ledger.open_turn(main, None).await.unwrap();
        store.put_tombstone("John", turn.id).await.unwrap();
        ledger.commit_turn(turn.id).await.unwrap();

        let visible = ledger.visible_turns(main, None).await.unwrap();
        assert!(store.get_latest("John", &visible).await.unwrap().is_none());
        assert!(scan(&ledger, main, &store, QuerySpec::new()).await.is_empty());

        let before = ledger.visible_turns(main, Some(0)).await.unwrap();
        assert!(store.get_latest("John", &before).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_order_limit_offset() {
        let (ledger, main, store) = setup().await;
        commit(
            &ledger,
            main,
            &store,
            vec![
                json!({"name": "d", "age": 30}),
                json!({"name": "a", "age": 40}),
                json!({"name": "c", "age": 30}),
                json!({"name": "b"}),
            ],
        )
        .await;

        let rows = scan(&ledger, main, &store, QuerySpec::new()).await;
        assert_eq!(names(&rows), vec!["a", "b", "c", "d"]);

        let rows = scan(
            &ledger,
            main,
            &store,
            QuerySpec::new().order_by("age", false),
        )
        .await;
        // Ties on age fall back to the logical key; missing ages sort last descending.
        assert_eq!(names(&rows), vec!["a", "c", "d", "b"]);

        let rows = scan(
            &ledger,
            main,
            &store,
            QuerySpec::new().order_by("age", true).limit(2).offset(1),
        )
        .await;
        assert_eq!(names(&rows), vec!["c", "d"]);
    }

    #[tokio::test]
    async fn test_null_comparisons() {
        let (ledger, main, store) = setup().await;
        commit(
            &ledger,
            main,
            &store,
            vec![
                json!({"name": "with", "email": "w@example.com"}),
                json!({"name": "without"}),
            ],
        )
        .await;

        let rows = scan(
            &ledger,
            main,
            &store,
            QuerySpec::new().filter(field("email").eq(Value::Null)),
        )
        .await;
        assert_eq!(names(&rows), vec!["without"]);

        let rows = scan(
            &ledger,
            main,
            &store,
            QuerySpec::new().filter(field("email").ne("w@example.com")),
        )
        .await;
        assert!(rows.is_empty());
    }
}
