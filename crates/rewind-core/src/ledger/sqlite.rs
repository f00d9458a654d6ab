//! SQLite-backed ledger store.
//!
//! Holds the `branches` and `turns` tables. Every mutation runs in an
//! immediate transaction and is conditional on the branch's turn counter, so
//! two processes sharing the file detect each other instead of interleaving.

use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, TransactionBehavior};

use crate::error::{RewindError, RewindResult};
use crate::traits::LedgerStore;
use crate::types::{
    Branch, BranchId, NewBranch, Payload, Turn, TurnId, TurnStatus, VisibilitySegment,
};

const BRANCH_COLUMNS: &str = "id, name, turn_counter, forked_from_branch_id, \
     forked_from_turn_index, created_at, updated_at";

const TURN_COLUMNS: &str =
    "id, branch_id, turn_index, status, created_at, ended_at, message, metadata";

/// SQLite-backed ledger store.
pub struct SqliteLedgerStore {
    conn: Mutex<Connection>,
}

impl SqliteLedgerStore {
    /// Open (or create) the ledger at `path`.
    pub fn open(path: impl AsRef<Path>) -> RewindResult<Self> {
        let conn = Connection::open(path)?;
        conn.busy_timeout(Duration::from_secs(5))?;
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;
        Self::with_connection(conn)
    }

    /// Create an in-memory ledger (for testing).
    pub fn in_memory() -> RewindResult<Self> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> RewindResult<Self> {
        init_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> RewindResult<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|e| RewindError::Internal(format!("Ledger connection poisoned: {}", e)))
    }
}

fn init_schema(conn: &Connection) -> RewindResult<()> {
    conn.execute_batch(
        r#"
        PRAGMA foreign_keys = ON;

        CREATE TABLE IF NOT EXISTS branches (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            name TEXT NOT NULL,
            turn_counter INTEGER NOT NULL DEFAULT 0,
            forked_from_branch_id INTEGER REFERENCES branches(id),
            forked_from_turn_index INTEGER,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            quarantined INTEGER NOT NULL DEFAULT 0,
            CHECK ((forked_from_branch_id IS NULL) = (forked_from_turn_index IS NULL))
        );

        CREATE TABLE IF NOT EXISTS turns (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            branch_id INTEGER NOT NULL REFERENCES branches(id),
            turn_index INTEGER NOT NULL,
            status TEXT NOT NULL CHECK (status IN ('staged', 'committed', 'reverted')),
            created_at TEXT NOT NULL,
            ended_at TEXT,
            message TEXT,
            metadata TEXT NOT NULL DEFAULT '{}',
            UNIQUE(branch_id, turn_index)
        );

        -- At most one staged turn per branch
        CREATE UNIQUE INDEX IF NOT EXISTS idx_turns_single_staged
            ON turns(branch_id) WHERE status = 'staged';

        -- Visibility lookups
        CREATE INDEX IF NOT EXISTS idx_turns_branch_status_index
            ON turns(branch_id, status, turn_index);
    "#,
    )?;

    // Ledgers created before quarantine was persisted lack the column.
    let has_quarantined: bool = conn.query_row(
        "SELECT COUNT(*) > 0 FROM pragma_table_info('branches') WHERE name = 'quarantined'",
        [],
        |row| row.get(0),
    )?;
    if !has_quarantined {
        conn.execute_batch(
            "ALTER TABLE branches ADD COLUMN quarantined INTEGER NOT NULL DEFAULT 0;",
        )?;
    }
    Ok(())
}

fn conversion_error(
    idx: usize,
    err: impl std::error::Error + Send + Sync + 'static,
) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(err))
}

fn parse_timestamp(idx: usize, raw: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| conversion_error(idx, e))
}

fn row_to_branch(row: &rusqlite::Row<'_>) -> rusqlite::Result<Branch> {
    let created_at: String = row.get(5)?;
    let updated_at: String = row.get(6)?;
    Ok(Branch {
        id: row.get(0)?,
        name: row.get(1)?,
        turn_counter: row.get(2)?,
        forked_from_branch_id: row.get(3)?,
        forked_from_turn_index: row.get(4)?,
        created_at: parse_timestamp(5, &created_at)?,
        updated_at: parse_timestamp(6, &updated_at)?,
    })
}

fn row_to_turn(row: &rusqlite::Row<'_>) -> rusqlite::Result<Turn> {
    let status: String = row.get(3)?;
    let created_at: String = row.get(4)?;
    let ended_at: Option<String> = row.get(5)?;
    let metadata: String = row.get(7)?;
    Ok(Turn {
        id: row.get(0)?,
        branch_id: row.get(1)?,
        index: row.get(2)?,
        status: status.parse::<TurnStatus>().map_err(|e| conversion_error(3, e))?,
        created_at: parse_timestamp(4, &created_at)?,
        ended_at: ended_at
            .as_deref()
            .map(|raw| parse_timestamp(5, raw))
            .transpose()?,
        message: row.get(6)?,
        metadata: serde_json::from_str(&metadata).map_err(|e| conversion_error(7, e))?,
    })
}

fn query_branch(conn: &Connection, branch_id: BranchId) -> RewindResult<Option<Branch>> {
    let sql = format!("SELECT {} FROM branches WHERE id = ?1", BRANCH_COLUMNS);
    Ok(conn
        .query_row(&sql, [branch_id], row_to_branch)
        .optional()?)
}

fn query_turn(conn: &Connection, turn_id: TurnId) -> RewindResult<Option<Turn>> {
    let sql = format!("SELECT {} FROM turns WHERE id = ?1", TURN_COLUMNS);
    Ok(conn.query_row(&sql, [turn_id], row_to_turn).optional()?)
}

fn query_staged(conn: &Connection, branch_id: BranchId) -> RewindResult<Option<Turn>> {
    let sql = format!(
        "SELECT {} FROM turns WHERE branch_id = ?1 AND status = 'staged'",
        TURN_COLUMNS
    );
    Ok(conn.query_row(&sql, [branch_id], row_to_turn).optional()?)
}

fn is_constraint_violation(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(e, _) if e.code == rusqlite::ErrorCode::ConstraintViolation
    )
}

#[async_trait]
impl LedgerStore for SqliteLedgerStore {
    async fn insert_branch(&self, branch: NewBranch) -> RewindResult<Branch> {
        let conn = self.conn()?;
        let now = Utc::now().to_rfc3339();
        let (parent, fork_index) = branch.fork_point.unzip();

        conn.execute(
            r#"INSERT INTO branches
               (name, turn_counter, forked_from_branch_id, forked_from_turn_index,
                created_at, updated_at)
               VALUES (?1, 0, ?2, ?3, ?4, ?4)"#,
            params![branch.name, parent, fork_index, now],
        )
        .map_err(|e| match (is_constraint_violation(&e), parent) {
            (true, Some(parent)) => RewindError::BranchNotFound { branch_id: parent },
            _ => e.into(),
        })?;

        let id = BranchId(conn.last_insert_rowid());
        query_branch(&conn, id)?.ok_or(RewindError::BranchNotFound { branch_id: id })
    }

    async fn get_branch(&self, branch_id: BranchId) -> RewindResult<Option<Branch>> {
        let conn = self.conn()?;
        query_branch(&conn, branch_id)
    }

    async fn list_branches(&self, limit: usize, offset: usize) -> RewindResult<Vec<Branch>> {
        let conn = self.conn()?;
        let sql = format!(
            "SELECT {} FROM branches ORDER BY id LIMIT ?1 OFFSET ?2",
            BRANCH_COLUMNS
        );
        let mut stmt = conn.prepare(&sql)?;
        let branches = stmt
            .query_map(params![limit as i64, offset as i64], row_to_branch)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(branches)
    }

    async fn insert_staged_turn(
        &self,
        branch_id: BranchId,
        expected_counter: i64,
        message: Option<String>,
        metadata: Payload,
    ) -> RewindResult<Turn> {
        let mut conn = self.conn()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let branch =
            query_branch(&tx, branch_id)?.ok_or(RewindError::BranchNotFound { branch_id })?;
        if let Some(staged) = query_staged(&tx, branch_id)? {
            return Err(RewindError::TurnAlreadyStaged {
                branch_id,
                staged_turn_id: staged.id,
            });
        }
        if branch.turn_counter != expected_counter {
            return Err(RewindError::Conflict { branch_id });
        }

        let metadata = serde_json::to_string(&metadata)?;
        tx.execute(
            r#"INSERT INTO turns (branch_id, turn_index, status, created_at, message, metadata)
               VALUES (?1, ?2, 'staged', ?3, ?4, ?5)"#,
            params![branch_id, expected_counter, Utc::now().to_rfc3339(), message, metadata],
        )
        .map_err(|e| {
            if is_constraint_violation(&e) {
                RewindError::Conflict { branch_id }
            } else {
                e.into()
            }
        })?;

        let turn_id = TurnId(tx.last_insert_rowid());
        let turn = query_turn(&tx, turn_id)?.ok_or(RewindError::TurnNotFound { turn_id })?;
        tx.commit()?;
        Ok(turn)
    }

    async fn finalize_turn(
        &self,
        turn_id: TurnId,
        status: TurnStatus,
        expected_counter: i64,
        message: Option<String>,
    ) -> RewindResult<Turn> {
        if !status.is_terminal() {
            return Err(RewindError::validation(format!(
                "Cannot finalize turn {} as {}",
                turn_id, status
            )));
        }

        let mut conn = self.conn()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let turn = query_turn(&tx, turn_id)?.ok_or(RewindError::TurnNotFound { turn_id })?;
        if !turn.is_staged() {
            return Err(RewindError::InvalidTurnState {
                turn_id,
                status: turn.status,
                expected: TurnStatus::Staged,
            });
        }

        let now = Utc::now().to_rfc3339();
        let advanced = tx.execute(
            r#"UPDATE branches SET turn_counter = turn_counter + 1, updated_at = ?1
               WHERE id = ?2 AND turn_counter = ?3"#,
            params![now, turn.branch_id, expected_counter],
        )?;
        if advanced == 0 {
            // Dropping the transaction rolls it back.
            return Err(RewindError::Conflict {
                branch_id: turn.branch_id,
            });
        }

        tx.execute(
            r#"UPDATE turns SET status = ?1, ended_at = ?2, message = COALESCE(?3, message)
               WHERE id = ?4 AND status = 'staged'"#,
            params![status.as_str(), now, message, turn_id],
        )?;

        let turn = query_turn(&tx, turn_id)?.ok_or(RewindError::TurnNotFound { turn_id })?;
        tx.commit()?;
        Ok(turn)
    }

    async fn get_turn(&self, turn_id: TurnId) -> RewindResult<Option<Turn>> {
        let conn = self.conn()?;
        query_turn(&conn, turn_id)
    }

    async fn staged_turn(&self, branch_id: BranchId) -> RewindResult<Option<Turn>> {
        let conn = self.conn()?;
        query_staged(&conn, branch_id)
    }

    async fn turn_at(&self, branch_id: BranchId, index: i64) -> RewindResult<Option<Turn>> {
        let conn = self.conn()?;
        let sql = format!(
            "SELECT {} FROM turns WHERE branch_id = ?1 AND turn_index = ?2",
            TURN_COLUMNS
        );
        Ok(conn
            .query_row(&sql, params![branch_id, index], row_to_turn)
            .optional()?)
    }

    async fn list_turns(
        &self,
        branch_id: BranchId,
        limit: usize,
        offset: usize,
    ) -> RewindResult<Vec<Turn>> {
        let conn = self.conn()?;
        let sql = format!(
            "SELECT {} FROM turns WHERE branch_id = ?1 ORDER BY turn_index DESC LIMIT ?2 OFFSET ?3",
            TURN_COLUMNS
        );
        let mut stmt = conn.prepare(&sql)?;
        let turns = stmt
            .query_map(params![branch_id, limit as i64, offset as i64], row_to_turn)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(turns)
    }

    async fn committed_turns(&self, segments: &[VisibilitySegment]) -> RewindResult<Vec<Turn>> {
        let bounded: Vec<&VisibilitySegment> =
            segments.iter().filter(|s| s.max_turn_index >= 0).collect();
        if bounded.is_empty() {
            return Ok(Vec::new());
        }

        let clauses = (0..bounded.len())
            .map(|i| format!("(branch_id = ?{} AND turn_index <= ?{})", 2 * i + 1, 2 * i + 2))
            .collect::<Vec<_>>()
            .join(" OR ");
        let sql = format!(
            "SELECT {} FROM turns WHERE status = 'committed' AND ({})",
            TURN_COLUMNS, clauses
        );
        let values = bounded
            .iter()
            .flat_map(|s| [s.branch_id.get(), s.max_turn_index]);

        let conn = self.conn()?;
        let mut stmt = conn.prepare(&sql)?;
        let turns = stmt
            .query_map(params_from_iter(values), row_to_turn)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(turns)
    }

    async fn set_quarantined(&self, branch_id: BranchId, quarantined: bool) -> RewindResult<()> {
        let conn = self.conn()?;
        conn.execute(
            "UPDATE branches SET quarantined = ?1, updated_at = ?2 WHERE id = ?3",
            params![quarantined, Utc::now().to_rfc3339(), branch_id],
        )?;
        Ok(())
    }

    async fn quarantined_branches(&self) -> RewindResult<Vec<BranchId>> {
        let conn = self.conn()?;
        let mut stmt =
            conn.prepare("SELECT id FROM branches WHERE quarantined = 1 ORDER BY id")?;
        let ids = stmt
            .query_map([], |row| row.get::<_, BranchId>(0))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(ids)
    }
}
