//! Physical record table shared by the SQLite backends.
//!
//! One table per namespace:
//!
//! | column        | meaning                                   |
//! |---------------|-------------------------------------------|
//! | `logical_key` | identity of the entity                    |
//! | `turn_id`     | turn that wrote the version               |
//! | `payload`     | JSON object, `NULL` for a tombstone       |
//! | `deleted`     | 1 for a tombstone                         |
//! | `created_at`  | RFC 3339 write time                       |
//! | `vec_<field>` | embedding blob per vector field (vec only)|
//!
//! `(logical_key, turn_id)` is the primary key, which both enforces one
//! version per key per turn and serves `get_latest`.

use std::sync::{Mutex, MutexGuard};

use chrono::Utc;
use rusqlite::types::Value as SqlValue;
use rusqlite::{params_from_iter, Connection, OptionalExtension};
use tracing::{debug, info};

use rewind_core::error::{RewindError, RewindResult};
use rewind_core::types::{
    IndexKind, Payload, SchemaDescriptor, TurnId, VersionedRecord, VisibleTurns,
};

use crate::sql::{json_column, quote_ident, store_error, visible_param, VISIBLE_CTE};

/// Column holding the embedding of a vector field.
pub(crate) fn vector_column(field: &str) -> String {
    quote_ident(&format!("vec_{}", field))
}

/// A namespace table behind one SQLite connection.
pub(crate) struct RecordTable {
    conn: Mutex<Connection>,
    schema: SchemaDescriptor,
    /// Vector fields with an embedding column.
    vector_fields: Vec<String>,
}

impl RecordTable {
    pub(crate) fn new(conn: Connection, schema: SchemaDescriptor, with_vectors: bool) -> Self {
        let vector_fields = if with_vectors {
            schema.vector_fields().map(|f| f.name.clone()).collect()
        } else {
            Vec::new()
        };
        Self {
            conn: Mutex::new(conn),
            schema,
            vector_fields,
        }
    }

    pub(crate) fn schema(&self) -> &SchemaDescriptor {
        &self.schema
    }

    pub(crate) fn namespace(&self) -> &str {
        self.schema.name()
    }

    pub(crate) fn table(&self) -> String {
        quote_ident(self.schema.name())
    }

    pub(crate) fn vector_fields(&self) -> &[String] {
        &self.vector_fields
    }

    pub(crate) fn lock(&self) -> RewindResult<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|e| RewindError::Internal(format!("Failed to acquire lock: {}", e)))
    }

    pub(crate) fn map_err(&self, err: rusqlite::Error) -> RewindError {
        store_error(self.namespace(), err)
    }

    /// Create the table and its indexes. Idempotent.
    pub(crate) fn create(&self) -> RewindResult<()> {
        let conn = self.lock()?;
        let name = self.namespace();
        let table = self.table();

        let vector_columns: String = self
            .vector_fields
            .iter()
            .map(|f| format!(",\n                {} BLOB", vector_column(f)))
            .collect();

        let mut ddl = format!(
            r#"CREATE TABLE IF NOT EXISTS {table} (
                logical_key TEXT NOT NULL,
                turn_id INTEGER NOT NULL,
                payload TEXT,
                deleted INTEGER NOT NULL DEFAULT 0 CHECK (deleted IN (0, 1)),
                created_at TEXT NOT NULL{vector_columns},
                PRIMARY KEY (logical_key, turn_id)
            );
            CREATE INDEX IF NOT EXISTS {turn_index} ON {table}(turn_id);"#,
            table = table,
            vector_columns = vector_columns,
            turn_index = quote_ident(&format!("idx_{}_turn", name)),
        );

        for field in self.schema.fields() {
            if field.index == IndexKind::Indexed {
                ddl.push_str(&format!(
                    "\nCREATE INDEX IF NOT EXISTS {} ON {}({});",
                    quote_ident(&format!("idx_{}_{}", name, field.name)),
                    table,
                    json_column(&field.name),
                ));
            }
        }

        conn.execute_batch(&ddl).map_err(|e| self.map_err(e))?;
        info!(namespace = name, "Created record table");
        Ok(())
    }

    pub(crate) fn drop_table(&self) -> RewindResult<()> {
        let conn = self.lock()?;
        conn.execute(&format!("DROP TABLE IF EXISTS {}", self.table()), [])
            .map_err(|e| self.map_err(e))?;
        info!(namespace = self.namespace(), "Dropped record table");
        Ok(())
    }

    /// Insert one version; `payload = None` writes a tombstone.
    ///
    /// `embeddings` is aligned with [`RecordTable::vector_fields`].
    pub(crate) fn insert(
        &self,
        logical_key: &str,
        turn_id: TurnId,
        payload: Option<&Payload>,
        embeddings: Vec<Option<Vec<u8>>>,
    ) -> RewindResult<()> {
        let payload_json = payload.map(serde_json::to_string).transpose()?;

        let mut columns = vec!["logical_key", "turn_id", "payload", "deleted", "created_at"]
            .into_iter()
            .map(String::from)
            .collect::<Vec<_>>();
        let mut params: Vec<SqlValue> = vec![
            SqlValue::Text(logical_key.to_string()),
            SqlValue::Integer(turn_id.get()),
            payload_json.map(SqlValue::Text).unwrap_or(SqlValue::Null),
            SqlValue::Integer(i64::from(payload.is_none())),
            SqlValue::Text(Utc::now().to_rfc3339()),
        ];
        for (field, embedding) in self.vector_fields.iter().zip(embeddings) {
            columns.push(vector_column(field));
            params.push(embedding.map(SqlValue::Blob).unwrap_or(SqlValue::Null));
        }

        let placeholders = vec!["?"; columns.len()].join(", ");
        let sql = format!(
            "INSERT INTO {} ({}) VALUES ({})",
            self.table(),
            columns.join(", "),
            placeholders
        );

        let conn = self.lock()?;
        conn.execute(&sql, params_from_iter(params.iter()))
            .map_err(|e| match e {
                rusqlite::Error::SqliteFailure(ref f, _)
                    if f.code == rusqlite::ErrorCode::ConstraintViolation =>
                {
                    RewindError::DuplicateLogicalKeyInTurn {
                        namespace: self.namespace().to_string(),
                        logical_key: logical_key.to_string(),
                        turn_id,
                    }
                }
                other => self.map_err(other),
            })?;

        debug!(
            namespace = self.namespace(),
            logical_key,
            turn_id = %turn_id,
            "Inserted record version"
        );
        Ok(())
    }

    /// Winning visible version of `logical_key`; a winning tombstone yields `None`.
    pub(crate) fn latest(
        &self,
        logical_key: &str,
        visible: &VisibleTurns,
    ) -> RewindResult<Option<VersionedRecord>> {
        if visible.is_empty() {
            return Ok(None);
        }

        let sql = format!(
            r#"WITH {cte}
               SELECT r.turn_id, r.payload, r.deleted
               FROM {table} r
               JOIN visible v ON v.turn_id = r.turn_id
               WHERE r.logical_key = ?
               ORDER BY v.rank
               LIMIT 1"#,
            cte = VISIBLE_CTE,
            table = self.table(),
        );
        let params = [visible_param(visible)?, SqlValue::Text(logical_key.to_string())];

        let conn = self.lock()?;
        let row = conn
            .query_row(&sql, params_from_iter(params.iter()), |row| {
                Ok((
                    row.get::<_, TurnId>(0)?,
                    row.get::<_, Option<String>>(1)?,
                    row.get::<_, bool>(2)?,
                ))
            })
            .optional()
            .map_err(|e| self.map_err(e))?;

        match row {
            Some((turn_id, Some(payload), false)) => Ok(Some(VersionedRecord::new(
                logical_key,
                turn_id,
                parse_payload(&payload)?,
            ))),
            _ => Ok(None),
        }
    }

    pub(crate) fn count(&self) -> RewindResult<u64> {
        let conn = self.lock()?;
        let count: i64 = conn
            .query_row(&format!("SELECT COUNT(*) FROM {}", self.table()), [], |row| {
                row.get(0)
            })
            .map_err(|e| self.map_err(e))?;
        Ok(count as u64)
    }
}

pub(crate) fn parse_payload(json: &str) -> RewindResult<Payload> {
    Ok(serde_json::from_str(json)?)
}
