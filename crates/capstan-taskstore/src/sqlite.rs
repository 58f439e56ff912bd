//! SQLite-backed state store.
//!
//! Task states live in a `tasks` table keyed by id, with the status
//! mirrored into its own column so operators can query it without
//! decoding the JSON payload. Checkpoints live in a `checkpoints` table
//! with a unique `(task_id, sequence_no)` pair, and retention pruning
//! runs in the same transaction as the insert.

use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use rusqlite::{params, Connection, OptionalExtension};

use crate::store::{
    rank_related, rank_search, validate_query, validate_task_id, StateStore, StateStoreError,
    StateStoreResult, DEFAULT_MAX_CHECKPOINTS,
};
use crate::types::{
    current_timestamp, state_content_hash, Checkpoint, RelatedTask, SearchHit, TaskState,
};

const SCHEMA: &str = r#"
PRAGMA journal_mode=WAL;
PRAGMA synchronous=NORMAL;

CREATE TABLE IF NOT EXISTS tasks (
    task_id    TEXT PRIMARY KEY,
    status     TEXT NOT NULL,
    state      TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS checkpoints (
    checkpoint_id TEXT PRIMARY KEY,
    task_id       TEXT NOT NULL,
    sequence_no   INTEGER NOT NULL,
    created_at    TEXT NOT NULL,
    description   TEXT NOT NULL,
    parent_id     TEXT,
    state         TEXT NOT NULL,
    state_hash    TEXT NOT NULL,
    UNIQUE (task_id, sequence_no)
);

CREATE INDEX IF NOT EXISTS idx_checkpoints_task_seq
    ON checkpoints (task_id, sequence_no DESC);
"#;

fn db_err(context: &str, err: rusqlite::Error) -> StateStoreError {
    StateStoreError::Backend(format!("{context} failed: {err}"))
}

fn decode_state(encoded: &str) -> StateStoreResult<TaskState> {
    serde_json::from_str(encoded)
        .map_err(|err| StateStoreError::Serialization(format!("decode task state failed: {err}")))
}

fn encode_state(state: &TaskState) -> StateStoreResult<String> {
    serde_json::to_string(state)
        .map_err(|err| StateStoreError::Serialization(format!("encode task state failed: {err}")))
}

/// Raw checkpoint columns, decoded into a `Checkpoint` outside the
/// statement closure so serde failures map to our own error type.
type CheckpointRow = (String, i64, String, String, Option<String>, String, String);

fn read_checkpoint_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<CheckpointRow> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
        row.get(6)?,
    ))
}

fn checkpoint_from_row(task_id: &str, row: CheckpointRow) -> StateStoreResult<Checkpoint> {
    let (checkpoint_id, sequence_no, created_at, description, parent_id, encoded, state_hash) = row;
    Ok(Checkpoint {
        checkpoint_id,
        task_id: task_id.to_string(),
        sequence_no: sequence_no as u64,
        timestamp: created_at,
        description,
        parent_id,
        state: decode_state(&encoded)?,
        state_hash,
    })
}

/// State store persisted in a single SQLite database file.
pub struct SqliteStateStore {
    conn: Mutex<Connection>,
    max_checkpoints: usize,
}

impl SqliteStateStore {
    /// Opens (or creates) the database at `db_path` and runs migrations.
    pub fn open(db_path: impl AsRef<Path>) -> StateStoreResult<Self> {
        Self::open_with_max_checkpoints(db_path, DEFAULT_MAX_CHECKPOINTS)
    }

    /// Opens a store with an explicit checkpoint retention limit. The
    /// limit must be at least 1.
    pub fn open_with_max_checkpoints(
        db_path: impl AsRef<Path>,
        max_checkpoints: usize,
    ) -> StateStoreResult<Self> {
        if max_checkpoints == 0 {
            return Err(StateStoreError::InvalidInput(
                "max_checkpoints must be at least 1".to_string(),
            ));
        }
        let db_path = db_path.as_ref();
        if let Some(parent) = db_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|err| {
                    StateStoreError::Backend(format!("create database dir failed: {err}"))
                })?;
            }
        }
        let conn = Connection::open(db_path).map_err(|err| db_err("open database", err))?;
        conn.execute_batch(SCHEMA)
            .map_err(|err| db_err("run migrations", err))?;
        Ok(SqliteStateStore {
            conn: Mutex::new(conn),
            max_checkpoints,
        })
    }

    fn lock(&self) -> StateStoreResult<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| StateStoreError::Backend("sqlite state store mutex poisoned".to_string()))
    }

    /// Decodes every task state row. Ranking happens in Rust so all
    /// backends score identically.
    fn all_states(conn: &Connection) -> StateStoreResult<Vec<TaskState>> {
        let mut stmt = conn
            .prepare("SELECT state FROM tasks ORDER BY task_id")
            .map_err(|err| db_err("prepare task scan", err))?;
        let rows = stmt
            .query_map([], |row| row.get::<_, String>(0))
            .map_err(|err| db_err("scan task states", err))?;
        let mut states = Vec::new();
        for row in rows {
            let encoded = row.map_err(|err| db_err("read task state row", err))?;
            states.push(decode_state(&encoded)?);
        }
        Ok(states)
    }
}

const UPSERT_TASK: &str = "INSERT INTO tasks (task_id, status, state, updated_at) \
     VALUES (?1, ?2, ?3, ?4) \
     ON CONFLICT (task_id) DO UPDATE SET \
         status = excluded.status, \
         state = excluded.state, \
         updated_at = excluded.updated_at";

#[async_trait::async_trait]
impl StateStore for SqliteStateStore {
    async fn load(&self, task_id: &str) -> StateStoreResult<Option<TaskState>> {
        validate_task_id(task_id)?;
        let conn = self.lock()?;
        let row = conn
            .query_row(
                "SELECT state FROM tasks WHERE task_id = ?1",
                params![task_id],
                |row| row.get::<_, String>(0),
            )
            .optional()
            .map_err(|err| db_err("load task state", err))?;
        let Some(encoded) = row else {
            return Ok(None);
        };
        Ok(Some(decode_state(&encoded)?))
    }

    async fn save(&self, state: &TaskState) -> StateStoreResult<()> {
        validate_task_id(&state.task_id)?;
        let encoded = encode_state(state)?;
        let conn = self.lock()?;
        conn.execute(
            UPSERT_TASK,
            params![
                state.task_id,
                state.status.as_str(),
                encoded,
                current_timestamp()
            ],
        )
        .map_err(|err| db_err("save task state", err))?;
        Ok(())
    }

    async fn create_checkpoint(
        &self,
        state: &TaskState,
        description: &str,
    ) -> StateStoreResult<Checkpoint> {
        validate_task_id(&state.task_id)?;
        let state_hash = state_content_hash(state)
            .map_err(|err| StateStoreError::Serialization(format!("hash task state failed: {err}")))?;
        let encoded = encode_state(state)?;

        let mut conn = self.lock()?;
        let tx = conn
            .transaction()
            .map_err(|err| db_err("begin transaction", err))?;

        tx.execute(
            UPSERT_TASK,
            params![
                state.task_id,
                state.status.as_str(),
                encoded,
                current_timestamp()
            ],
        )
        .map_err(|err| db_err("save task state", err))?;

        let newest = tx
            .query_row(
                "SELECT checkpoint_id, sequence_no FROM checkpoints \
                 WHERE task_id = ?1 ORDER BY sequence_no DESC LIMIT 1",
                params![state.task_id],
                |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)),
            )
            .optional()
            .map_err(|err| db_err("read newest checkpoint", err))?;
        let (parent_id, sequence_no) = match newest {
            Some((id, seq)) => (Some(id), seq as u64 + 1),
            None => (None, 1),
        };

        let checkpoint = Checkpoint {
            checkpoint_id: Checkpoint::id_for(&state.task_id, sequence_no),
            task_id: state.task_id.clone(),
            sequence_no,
            timestamp: current_timestamp(),
            description: description.to_string(),
            parent_id,
            state: state.clone(),
            state_hash,
        };
        tx.execute(
            "INSERT INTO checkpoints \
             (checkpoint_id, task_id, sequence_no, created_at, description, parent_id, state, state_hash) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                checkpoint.checkpoint_id,
                checkpoint.task_id,
                checkpoint.sequence_no as i64,
                checkpoint.timestamp,
                checkpoint.description,
                checkpoint.parent_id,
                encoded,
                checkpoint.state_hash
            ],
        )
        .map_err(|err| db_err("insert checkpoint", err))?;

        tx.execute(
            "DELETE FROM checkpoints WHERE task_id = ?1 AND sequence_no NOT IN ( \
                 SELECT sequence_no FROM checkpoints WHERE task_id = ?1 \
                 ORDER BY sequence_no DESC LIMIT ?2)",
            params![state.task_id, self.max_checkpoints as i64],
        )
        .map_err(|err| db_err("prune checkpoints", err))?;

        tx.commit().map_err(|err| db_err("commit transaction", err))?;
        Ok(checkpoint)
    }

    async fn restore_checkpoint(
        &self,
        task_id: &str,
        checkpoint_id: &str,
    ) -> StateStoreResult<TaskState> {
        validate_task_id(task_id)?;
        let conn = self.lock()?;
        let row = conn
            .query_row(
                "SELECT checkpoint_id, sequence_no, created_at, description, parent_id, state, state_hash \
                 FROM checkpoints WHERE task_id = ?1 AND checkpoint_id = ?2",
                params![task_id, checkpoint_id],
                read_checkpoint_row,
            )
            .optional()
            .map_err(|err| db_err("load checkpoint", err))?;
        let Some(row) = row else {
            return Err(StateStoreError::NotFound {
                resource: "checkpoint",
                id: checkpoint_id.to_string(),
            });
        };
        let checkpoint = checkpoint_from_row(task_id, row)?;
        if !checkpoint.verify_integrity() {
            return Err(StateStoreError::Backend(format!(
                "checkpoint {checkpoint_id} failed integrity check"
            )));
        }

        let encoded = encode_state(&checkpoint.state)?;
        conn.execute(
            UPSERT_TASK,
            params![
                task_id,
                checkpoint.state.status.as_str(),
                encoded,
                current_timestamp()
            ],
        )
        .map_err(|err| db_err("save restored state", err))?;
        Ok(checkpoint.state)
    }

    async fn list_checkpoints(
        &self,
        task_id: &str,
        limit: usize,
    ) -> StateStoreResult<Vec<Checkpoint>> {
        validate_task_id(task_id)?;
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare(
                "SELECT checkpoint_id, sequence_no, created_at, description, parent_id, state, state_hash \
                 FROM checkpoints WHERE task_id = ?1 ORDER BY sequence_no DESC LIMIT ?2",
            )
            .map_err(|err| db_err("prepare checkpoint query", err))?;
        let rows = stmt
            .query_map(params![task_id, limit as i64], read_checkpoint_row)
            .map_err(|err| db_err("list checkpoints", err))?;

        let mut checkpoints = Vec::new();
        for row in rows {
            let row = row.map_err(|err| db_err("read checkpoint row", err))?;
            checkpoints.push(checkpoint_from_row(task_id, row)?);
        }
        Ok(checkpoints)
    }

    async fn related_tasks(
        &self,
        task_id: &str,
        limit: usize,
    ) -> StateStoreResult<Vec<RelatedTask>> {
        validate_task_id(task_id)?;
        let conn = self.lock()?;
        let row = conn
            .query_row(
                "SELECT state FROM tasks WHERE task_id = ?1",
                params![task_id],
                |row| row.get::<_, String>(0),
            )
            .optional()
            .map_err(|err| db_err("load task state", err))?;
        let Some(encoded) = row else {
            return Ok(Vec::new());
        };
        let current = decode_state(&encoded)?;
        Ok(rank_related(&current, Self::all_states(&conn)?, limit))
    }

    async fn search_history(&self, query: &str, limit: usize) -> StateStoreResult<Vec<SearchHit>> {
        validate_query(query)?;
        let conn = self.lock()?;
        Ok(rank_search(Self::all_states(&conn)?, query, limit))
    }
}
