//! Persistence: task registry plus the per-task append-only event log.
//!
//! Backed by sqlite behind a mutex, cloned cheaply across the server. Event
//! sequence numbers are assigned inside `append_event`'s transaction
//! (`MAX(seq) + 1`), so within a task they are gapless and strictly
//! increasing as long as a single controller owns the appends.

mod schema;

pub use schema::{
    parse_status, InterruptKind, PendingInterrupt, RoleTotals, StoreError, StoreResult,
    TaskRecord, TaskSnapshot, TaskStatus, TokenTotals, SCHEMA,
};

use crate::events::{EventPayload, TaskEvent};
use crate::llm::{Role, Usage};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};
use serde_json::Value;
use std::path::Path;
use std::sync::{Arc, Mutex};

/// Thread-safe store handle.
#[derive(Clone)]
pub struct Store {
    conn: Arc<Mutex<Connection>>,
}

impl Store {
    /// Open or create the database at the given path.
    pub fn open<P: AsRef<Path>>(path: P) -> StoreResult<Self> {
        let conn = Connection::open(path)?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        store.run_migrations()?;
        Ok(store)
    }

    /// Open an in-memory database (for testing).
    pub fn open_in_memory() -> StoreResult<Self> {
        let conn = Connection::open_in_memory()?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        store.run_migrations()?;
        Ok(store)
    }

    fn run_migrations(&self) -> StoreResult<()> {
        let conn = self.lock();
        conn.execute_batch(SCHEMA)?;
        Ok(())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Connection> {
        // Poisoning only happens if another thread panicked while holding
        // the lock; propagating the panic is the right move.
        self.conn.lock().expect("store mutex poisoned")
    }

    // ==================== Task Operations ====================

    /// Create a task. Creating an id that already exists returns the
    /// existing record (client retries are idempotent).
    pub fn create_task(
        &self,
        id: &str,
        name: &str,
        workspace_root: &str,
    ) -> StoreResult<TaskRecord> {
        {
            let conn = self.lock();
            let now = Utc::now();
            conn.execute(
                "INSERT OR IGNORE INTO tasks (id, name, workspace_root, status, token_totals, created_at, updated_at)
                 VALUES (?1, ?2, ?3, 'idle', '{}', ?4, ?4)",
                params![id, name, workspace_root, now.to_rfc3339()],
            )?;
        }
        self.get_task(id)
    }

    pub fn get_task(&self, id: &str) -> StoreResult<TaskRecord> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT id, name, workspace_root, status, run_state, pending_interrupt, token_totals, created_at, updated_at
             FROM tasks WHERE id = ?1",
        )?;
        stmt.query_row(params![id], parse_task_row).map_err(|e| match e {
            rusqlite::Error::QueryReturnedNoRows => StoreError::TaskNotFound(id.to_string()),
            other => StoreError::Sqlite(other),
        })
    }

    pub fn list_tasks(&self) -> StoreResult<Vec<TaskRecord>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT id, name, workspace_root, status, run_state, pending_interrupt, token_totals, created_at, updated_at
             FROM tasks ORDER BY updated_at DESC",
        )?;
        let rows = stmt.query_map([], parse_task_row)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(StoreError::from)
    }

    pub fn rename_task(&self, id: &str, name: &str) -> StoreResult<()> {
        let conn = self.lock();
        let updated = conn.execute(
            "UPDATE tasks SET name = ?1, updated_at = ?2 WHERE id = ?3",
            params![name, Utc::now().to_rfc3339(), id],
        )?;
        if updated == 0 {
            return Err(StoreError::TaskNotFound(id.to_string()));
        }
        Ok(())
    }

    /// Delete a task and its event log (cascade).
    pub fn delete_task(&self, id: &str) -> StoreResult<()> {
        let conn = self.lock();
        let deleted = conn.execute("DELETE FROM tasks WHERE id = ?1", params![id])?;
        if deleted == 0 {
            return Err(StoreError::TaskNotFound(id.to_string()));
        }
        Ok(())
    }

    pub fn update_status(&self, id: &str, status: TaskStatus) -> StoreResult<()> {
        let conn = self.lock();
        let updated = conn.execute(
            "UPDATE tasks SET status = ?1, updated_at = ?2 WHERE id = ?3",
            params![status.to_string(), Utc::now().to_rfc3339(), id],
        )?;
        if updated == 0 {
            return Err(StoreError::TaskNotFound(id.to_string()));
        }
        Ok(())
    }

    /// Persist the serialized run state and the pending interrupt together;
    /// they change at the same suspension points.
    pub fn update_run_state(
        &self,
        id: &str,
        run_state: Option<&Value>,
        pending_interrupt: Option<&PendingInterrupt>,
    ) -> StoreResult<()> {
        let conn = self.lock();
        let state_json = run_state.map(Value::to_string);
        let interrupt_json = pending_interrupt
            .map(|i| serde_json::to_string(i).unwrap_or_default());
        let updated = conn.execute(
            "UPDATE tasks SET run_state = ?1, pending_interrupt = ?2, updated_at = ?3 WHERE id = ?4",
            params![state_json, interrupt_json, Utc::now().to_rfc3339(), id],
        )?;
        if updated == 0 {
            return Err(StoreError::TaskNotFound(id.to_string()));
        }
        Ok(())
    }

    /// Fold one call's usage into the task's per-role totals.
    pub fn add_token_usage(&self, id: &str, role: Role, usage: Usage) -> StoreResult<TokenTotals> {
        let mut record = self.get_task(id)?;
        record.token_totals.add(role, usage);
        let conn = self.lock();
        let totals_json = serde_json::to_string(&record.token_totals).unwrap_or_default();
        conn.execute(
            "UPDATE tasks SET token_totals = ?1, updated_at = ?2 WHERE id = ?3",
            params![totals_json, Utc::now().to_rfc3339(), id],
        )?;
        Ok(record.token_totals)
    }

    /// Startup recovery: tasks interrupted mid-run go back to idle with
    /// their run state cleared; suspended (awaiting_input) tasks keep the
    /// interrupt so the HITL gate survives the restart.
    pub fn recover_interrupted(&self) -> StoreResult<usize> {
        let conn = self.lock();
        let reset = conn.execute(
            "UPDATE tasks SET status = 'idle', run_state = NULL, updated_at = ?1
             WHERE status IN ('running', 'cancelling')",
            params![Utc::now().to_rfc3339()],
        )?;
        Ok(reset)
    }

    // ==================== Event Operations ====================

    /// Append one event, assigning the next sequence number atomically.
    pub fn append_event(&self, task_id: &str, payload: &EventPayload) -> StoreResult<TaskEvent> {
        let mut guard = self.lock();
        let tx = guard.transaction()?;
        let now = Utc::now();

        let seq: i64 = tx.query_row(
            "SELECT COALESCE(MAX(seq), 0) + 1 FROM events WHERE task_id = ?1",
            params![task_id],
            |row| row.get(0),
        )?;

        let payload_json = serde_json::to_string(payload).map_err(|e| StoreError::Corrupt {
            task_id: task_id.to_string(),
            detail: e.to_string(),
        })?;

        let inserted = tx.execute(
            "INSERT INTO events (task_id, seq, event_type, payload, created_at)
             SELECT ?1, ?2, ?3, ?4, ?5 WHERE EXISTS (SELECT 1 FROM tasks WHERE id = ?1)",
            params![task_id, seq, payload.type_tag(), payload_json, now.to_rfc3339()],
        )?;
        if inserted == 0 {
            return Err(StoreError::TaskNotFound(task_id.to_string()));
        }

        tx.execute(
            "UPDATE tasks SET updated_at = ?1 WHERE id = ?2",
            params![now.to_rfc3339(), task_id],
        )?;
        tx.commit()?;

        Ok(TaskEvent {
            task_id: task_id.to_string(),
            seq,
            timestamp: now,
            payload: payload.clone(),
        })
    }

    /// Events with `seq >= from_seq`, in order.
    pub fn events_from(&self, task_id: &str, from_seq: i64) -> StoreResult<Vec<TaskEvent>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT task_id, seq, payload, created_at FROM events
             WHERE task_id = ?1 AND seq >= ?2 ORDER BY seq ASC",
        )?;
        let rows = stmt.query_map(params![task_id, from_seq], parse_event_row)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(StoreError::from)
    }

    pub fn last_seq(&self, task_id: &str) -> StoreResult<i64> {
        let conn = self.lock();
        conn.query_row(
            "SELECT COALESCE(MAX(seq), 0) FROM events WHERE task_id = ?1",
            params![task_id],
            |row| row.get(0),
        )
        .map_err(StoreError::from)
    }

    /// Point-in-time view for reconnecting clients.
    pub fn snapshot(&self, task_id: &str) -> StoreResult<TaskSnapshot> {
        let record = self.get_task(task_id)?;
        let history = self.events_from(task_id, 1)?;
        Ok(TaskSnapshot {
            status: record.status,
            history,
            pending_interrupt: record.pending_interrupt,
        })
    }
}

fn parse_task_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<TaskRecord> {
    let status: String = row.get(3)?;
    let run_state: Option<String> = row.get(4)?;
    let interrupt: Option<String> = row.get(5)?;
    let totals: String = row.get(6)?;

    Ok(TaskRecord {
        id: row.get(0)?,
        name: row.get(1)?,
        workspace_root: row.get(2)?,
        status: parse_status(&status),
        run_state: run_state.and_then(|s| serde_json::from_str(&s).ok()),
        pending_interrupt: interrupt.and_then(|s| serde_json::from_str(&s).ok()),
        token_totals: serde_json::from_str(&totals).unwrap_or_default(),
        created_at: parse_datetime(&row.get::<_, String>(7)?),
        updated_at: parse_datetime(&row.get::<_, String>(8)?),
    })
}

fn parse_event_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<TaskEvent> {
    let task_id: String = row.get(0)?;
    let seq: i64 = row.get(1)?;
    let payload_json: String = row.get(2)?;
    let created_at: String = row.get(3)?;

    let payload = serde_json::from_str(&payload_json).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(
            2,
            rusqlite::types::Type::Text,
            Box::new(e),
        )
    })?;

    Ok(TaskEvent {
        task_id,
        seq,
        timestamp: parse_datetime(&created_at),
        payload,
    })
}

fn parse_datetime(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s).map_or_else(|_| Utc::now(), |dt| dt.with_timezone(&Utc))
}
