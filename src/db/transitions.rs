//! Append-only transition log.
//!
//! Rows are written only inside `apply_transition` and never read back to
//! drive state; the queries here serve audit and broadcast consumers.

use super::Database;
use crate::types::TransitionRecord;
use anyhow::Result;
use rusqlite::{Connection, OptionalExtension, Row, params};

const TRANSITION_COLUMNS: &str = "id, agent_id, task_id, turn_id, from_state, to_state, actor, intent, abandoned_task_id, timestamp";

fn parse_transition_row(row: &Row) -> rusqlite::Result<TransitionRecord> {
    Ok(TransitionRecord {
        id: row.get(0)?,
        agent_id: row.get(1)?,
        task_id: row.get(2)?,
        turn_id: row.get(3)?,
        from_state: row.get(4)?,
        to_state: row.get(5)?,
        actor: row.get(6)?,
        intent: row.get(7)?,
        abandoned_task_id: row.get(8)?,
        timestamp: row.get(9)?,
    })
}

/// Insert a record (its `id` is ignored) and return the new row id.
pub(crate) fn insert_transition_internal(conn: &Connection, record: &TransitionRecord) -> Result<i64> {
    conn.execute(
        "INSERT INTO transitions
            (agent_id, task_id, turn_id, from_state, to_state, actor, intent, abandoned_task_id, timestamp)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
        params![
            record.agent_id,
            record.task_id,
            record.turn_id,
            record.from_state,
            record.to_state,
            record.actor,
            record.intent,
            record.abandoned_task_id,
            record.timestamp
        ],
    )?;
    Ok(conn.last_insert_rowid())
}

pub(crate) fn get_transition_internal(conn: &Connection, id: i64) -> Result<Option<TransitionRecord>> {
    let record = conn
        .query_row(
            &format!("SELECT {} FROM transitions WHERE id = ?1", TRANSITION_COLUMNS),
            params![id],
            parse_transition_row,
        )
        .optional()?;
    Ok(record)
}

impl Database {
    /// Transition history for an agent in the order the lock granted them.
    pub fn get_agent_transitions(&self, agent_id: i64) -> Result<Vec<TransitionRecord>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {} FROM transitions WHERE agent_id = ?1 ORDER BY id",
                TRANSITION_COLUMNS
            ))?;
            let records = stmt
                .query_map(params![agent_id], parse_transition_row)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(records)
        })
    }

    /// Transitions with id greater than `after_id`, oldest first. Lets a
    /// broadcaster in another process tail the log.
    pub fn get_transitions_since(&self, after_id: i64, limit: i64) -> Result<Vec<TransitionRecord>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {} FROM transitions WHERE id > ?1 ORDER BY id LIMIT ?2",
                TRANSITION_COLUMNS
            ))?;
            let records = stmt
                .query_map(params![after_id, limit], parse_transition_row)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(records)
        })
    }

    /// Total number of recorded transitions.
    pub fn count_transitions(&self) -> Result<i64> {
        self.with_conn(|conn| {
            let count = conn.query_row("SELECT COUNT(*) FROM transitions", [], |row| row.get(0))?;
            Ok(count)
        })
    }
}
