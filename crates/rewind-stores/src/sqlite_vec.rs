//! Vector record store on SQLite with the sqlite-vec extension.
//!
//! Records live in the same table layout as the relational store, with one
//! little-endian `f32` blob column per vector field. Visibility is applied
//! in SQL by joining the visible turns; similarity is computed with
//! `vec_distance_cosine`. Shadowing, tombstones, filtering and paging are
//! then reduced in memory over the visible rows.
//!
//! # Example
//!
//! ```ignore
//! use rewind_stores::SqliteVecRecordStore;
//!
//! let schema = SchemaDescriptor::builder("documents")
//!     .key("id", FieldType::Text)
//!     .vector("embedding", 384)
//!     .build()?;
//! let store = SqliteVecRecordStore::in_memory(schema)?;
//! ```

use std::cmp::Ordering;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Once;
use std::time::Duration;

use async_trait::async_trait;
use rusqlite::types::Value as SqlValue;
use rusqlite::{params_from_iter, Connection};
use tracing::debug;
use zerocopy::IntoBytes;

use rewind_core::error::{RewindError, RewindResult};
use rewind_core::query::{compare_values, CompiledQuery, PayloadMatcher, PayloadTranslator};
use rewind_core::traits::{RecordStore, StoreCapabilities};
use rewind_core::types::{
    FilterTranslator, Payload, SchemaDescriptor, SortDirection, SortKey, TurnId, VersionedRecord,
    VisibleTurns,
};

use crate::sql::{quote_ident, visible_param, VISIBLE_CTE};
use crate::table::{parse_payload, vector_column, RecordTable};

static REGISTER_EXTENSION: Once = Once::new();

/// Register sqlite-vec with every connection opened from now on.
fn register_extension() {
    REGISTER_EXTENSION.call_once(|| {
        // SAFETY: sqlite3_auto_extension requires a function pointer cast.
        // This is the documented way to register sqlite-vec with rusqlite.
        unsafe {
            rusqlite::ffi::sqlite3_auto_extension(Some(std::mem::transmute(
                sqlite_vec::sqlite3_vec_init as *const (),
            )));
        }
    });
}

/// Vector-capable record store.
pub struct SqliteVecRecordStore {
    table: RecordTable,
}

impl SqliteVecRecordStore {
    /// Open (or create) the database file at `path`.
    pub fn new(path: impl AsRef<Path>, schema: SchemaDescriptor) -> RewindResult<Self> {
        register_extension();
        let conn = Connection::open(path)?;
        conn.busy_timeout(Duration::from_secs(5))?;
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;
        Self::with_connection(conn, schema)
    }

    /// Private in-memory database.
    pub fn in_memory(schema: SchemaDescriptor) -> RewindResult<Self> {
        register_extension();
        Self::with_connection(Connection::open_in_memory()?, schema)
    }

    /// Wrap a connection opened after the extension was registered.
    fn with_connection(conn: Connection, schema: SchemaDescriptor) -> RewindResult<Self> {
        let version: String = conn
            .query_row("SELECT vec_version()", [], |row| row.get(0))
            .map_err(|e| RewindError::Database {
                message: format!("sqlite-vec extension not loaded: {}", e),
                code: rewind_core::error::ErrorCode::DbConnectionFailed,
                source: Some(Box::new(e)),
            })?;
        debug!(namespace = schema.name(), "sqlite-vec version: {}", version);

        Ok(Self {
            table: RecordTable::new(conn, schema, true),
        })
    }

    /// Convert Vec<f32> to bytes for sqlite-vec.
    fn vector_to_bytes(vector: &[f32]) -> Vec<u8> {
        vector.as_bytes().to_vec()
    }

    fn embeddings(&self, payload: Option<&Payload>) -> Vec<Option<Vec<u8>>> {
        self.table
            .vector_fields()
            .iter()
            .map(|field| {
                payload
                    .and_then(|p| self.schema().vector_of(p, field))
                    .map(|v| Self::vector_to_bytes(&v))
            })
            .collect()
    }
}

/// A visible row before shadowing.
struct Candidate {
    logical_key: String,
    turn_id: TurnId,
    rank: u32,
    payload: Option<Payload>,
    distance: Option<f32>,
}

/// Keep the best-ranked row per logical key.
fn shadow(rows: Vec<Candidate>) -> Vec<Candidate> {
    let mut winners: HashMap<String, Candidate> = HashMap::new();
    for row in rows {
        match winners.get(&row.logical_key) {
            Some(current) if current.rank <= row.rank => {}
            _ => {
                winners.insert(row.logical_key.clone(), row);
            }
        }
    }
    winners.into_values().collect()
}

fn compare_candidates(a: &Candidate, b: &Candidate, query: &CompiledQuery) -> Ordering {
    let by_distance = match (a.distance, b.distance) {
        (Some(x), Some(y)) => x.partial_cmp(&y).unwrap_or(Ordering::Equal),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    };

    query.order.iter().fold(by_distance, |ord, term| {
        ord.then_with(|| {
            let ord = match &term.key {
                SortKey::LogicalKey => a.logical_key.cmp(&b.logical_key),
                SortKey::Field(field) => compare_values(
                    a.payload.as_ref().and_then(|p| p.get(field)),
                    b.payload.as_ref().and_then(|p| p.get(field)),
                ),
            };
            match term.direction {
                SortDirection::Asc => ord,
                SortDirection::Desc => ord.reverse(),
            }
        })
    })
    .then_with(|| a.logical_key.cmp(&b.logical_key))
}

#[async_trait]
impl RecordStore for SqliteVecRecordStore {
    fn namespace(&self) -> &str {
        self.table.namespace()
    }

    fn schema(&self) -> &SchemaDescriptor {
        self.table.schema()
    }

    fn capabilities(&self) -> StoreCapabilities {
        StoreCapabilities::VECTOR
    }

    async fn create_namespace(&self) -> RewindResult<()> {
        self.table.create()
    }

    async fn drop_namespace(&self) -> RewindResult<()> {
        self.table.drop_table()
    }

    async fn put(&self, logical_key: &str, turn_id: TurnId, payload: &Payload) -> RewindResult<()> {
        let embeddings = self.embeddings(Some(payload));
        self.table.insert(logical_key, turn_id, Some(payload), embeddings)
    }

    async fn put_tombstone(&self, logical_key: &str, turn_id: TurnId) -> RewindResult<()> {
        let embeddings = self.embeddings(None);
        self.table.insert(logical_key, turn_id, None, embeddings)
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
        if visible.is_empty() {
            return Ok(Vec::new());
        }

        let matcher = match &query.predicate {
            Some(expr) => PayloadTranslator.translate(expr)?,
            None => PayloadMatcher::any(),
        };

        let mut params = vec![visible_param(visible)?];
        let distance = match &query.similarity {
            Some(similarity) => {
                if !self.table.vector_fields().contains(&similarity.field) {
                    return Err(RewindError::unsupported(
                        self.namespace(),
                        format!("'{}' is not a vector field", similarity.field),
                    ));
                }
                params.push(SqlValue::Blob(Self::vector_to_bytes(&similarity.vector)));
                let column = vector_column(&similarity.field);
                format!(
                    "CASE WHEN r.{column} IS NOT NULL THEN vec_distance_cosine(r.{column}, ?) END",
                    column = column
                )
            }
            None => "NULL".to_string(),
        };

        let sql = format!(
            r#"WITH {cte}
               SELECT r.logical_key, r.turn_id, v.rank, r.payload, r.deleted,
                      CASE WHEN r.deleted = 0 THEN {distance} END AS distance
               FROM {table} r
               JOIN visible v ON v.turn_id = r.turn_id"#,
            cte = VISIBLE_CTE,
            distance = distance,
            table = quote_ident(self.namespace()),
        );

        let candidates = {
            let conn = self.table.lock()?;
            let mut stmt = conn.prepare(&sql).map_err(|e| self.table.map_err(e))?;
            let rows = stmt
                .query_map(params_from_iter(params.iter()), |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, TurnId>(1)?,
                        row.get::<_, i64>(2)?,
                        row.get::<_, Option<String>>(3)?,
                        row.get::<_, bool>(4)?,
                        row.get::<_, Option<f64>>(5)?,
                    ))
                })
                .map_err(|e| self.table.map_err(e))?;

            let mut candidates = Vec::new();
            for row in rows {
                let (logical_key, turn_id, rank, payload, deleted, distance) =
                    row.map_err(|e| self.table.map_err(e))?;
                let payload = match (deleted, payload) {
                    (false, Some(json)) => Some(parse_payload(&json)?),
                    _ => None,
                };
                candidates.push(Candidate {
                    logical_key,
                    turn_id,
                    rank: rank as u32,
                    payload,
                    distance: distance.map(|d| d as f32),
                });
            }
            candidates
        };
        let fetched = candidates.len();

        let mut winners: Vec<Candidate> = shadow(candidates)
            .into_iter()
            .filter(|c| c.payload.as_ref().is_some_and(|p| matcher.matches(p)))
            .collect();
        winners.sort_by(|a, b| compare_candidates(a, b, query));

        let records: Vec<VersionedRecord> = winners
            .into_iter()
            .skip(query.offset)
            .take(query.limit.unwrap_or(usize::MAX))
            .filter_map(|c| {
                let score = c.distance.map(|d| 1.0 - d);
                c.payload.map(|payload| VersionedRecord {
                    logical_key: c.logical_key,
                    turn_id: c.turn_id,
                    payload,
                    score,
                })
            })
            .collect();

        debug!(
            namespace = self.namespace(),
            fetched,
            returned = records.len(),
            similarity = query.similarity.is_some(),
            "Scanned"
        );
        Ok(records)
    }

    async fn count(&self) -> RewindResult<u64> {
        self.table.count()
    }
}
