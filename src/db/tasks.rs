//! Task and turn storage, including the atomic transition write.

use super::transitions::{get_transition_internal, insert_transition_internal};
use super::{Database, now_ms};
use crate::types::{Actor, Intent, Task, TaskState, TransitionRecord, Turn};
use anyhow::{Result, anyhow};
use rusqlite::{Connection, OptionalExtension, Row, TransactionBehavior, params};

const TASK_COLUMNS: &str = "id, agent_id, state, abandoned, created_at, updated_at, completed_at";

pub fn parse_task_row(row: &Row) -> rusqlite::Result<Task> {
    Ok(Task {
        id: row.get(0)?,
        agent_id: row.get(1)?,
        state: row.get(2)?,
        abandoned: row.get(3)?,
        created_at: row.get(4)?,
        updated_at: row.get(5)?,
        completed_at: row.get(6)?,
    })
}

fn parse_turn_row(row: &Row) -> rusqlite::Result<Turn> {
    Ok(Turn {
        id: row.get(0)?,
        task_id: row.get(1)?,
        actor: row.get(2)?,
        intent: row.get(3)?,
        text: row.get(4)?,
        timestamp: row.get(5)?,
        occurred_at: row.get(6)?,
    })
}

fn get_active_task_internal(conn: &Connection, agent_id: i64) -> Result<Option<Task>> {
    let task = conn
        .query_row(
            &format!(
                "SELECT {} FROM tasks WHERE agent_id = ?1 AND state != 'complete'",
                TASK_COLUMNS
            ),
            params![agent_id],
            parse_task_row,
        )
        .optional()?;
    Ok(task)
}

/// Next ordering timestamp for an agent's turns: never earlier than `now`
/// and always after the agent's latest turn.
fn next_turn_timestamp(conn: &Connection, agent_id: i64, now: i64) -> Result<i64> {
    let last: Option<i64> = conn.query_row(
        "SELECT MAX(t.timestamp) FROM turns t JOIN tasks k ON t.task_id = k.id
         WHERE k.agent_id = ?1",
        params![agent_id],
        |row| row.get(0),
    )?;
    Ok(match last {
        Some(last) if last >= now => last + 1,
        _ => now,
    })
}

/// A validated transition ready to be written.
#[derive(Debug, Clone)]
pub struct TransitionWrite<'a> {
    pub agent_id: i64,
    /// The active task read under the agent lock, if any.
    pub expected_task_id: Option<i64>,
    pub from: TaskState,
    pub to: TaskState,
    /// Start a new task instead of advancing the active one. An active task,
    /// if present, is abandoned.
    pub creates_task: bool,
    pub actor: Actor,
    pub intent: Intent,
    pub text: Option<&'a str>,
    pub occurred_at: Option<i64>,
    /// Also stamp the agent's end time in the same transaction.
    pub end_agent: bool,
}

impl Database {
    /// Get a task by ID.
    pub fn get_task(&self, task_id: i64) -> Result<Option<Task>> {
        self.with_conn(|conn| {
            let task = conn
                .query_row(
                    &format!("SELECT {} FROM tasks WHERE id = ?1", TASK_COLUMNS),
                    params![task_id],
                    parse_task_row,
                )
                .optional()?;
            Ok(task)
        })
    }

    /// The agent's non-complete task, if any.
    pub fn get_active_task(&self, agent_id: i64) -> Result<Option<Task>> {
        self.with_conn(|conn| get_active_task_internal(conn, agent_id))
    }

    /// All tasks of an agent in creation order.
    pub fn list_tasks(&self, agent_id: i64) -> Result<Vec<Task>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {} FROM tasks WHERE agent_id = ?1 ORDER BY id",
                TASK_COLUMNS
            ))?;
            let tasks = stmt
                .query_map(params![agent_id], parse_task_row)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(tasks)
        })
    }

    /// Turns of a task in order.
    pub fn get_turns(&self, task_id: i64) -> Result<Vec<Turn>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, task_id, actor, intent, text, timestamp, occurred_at
                 FROM turns WHERE task_id = ?1 ORDER BY timestamp, id",
            )?;
            let turns = stmt
                .query_map(params![task_id], parse_turn_row)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(turns)
        })
    }

    /// Turns across all tasks of an agent in order.
    pub fn get_agent_turns(&self, agent_id: i64) -> Result<Vec<Turn>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT t.id, t.task_id, t.actor, t.intent, t.text, t.timestamp, t.occurred_at
                 FROM turns t JOIN tasks k ON t.task_id = k.id
                 WHERE k.agent_id = ?1
                 ORDER BY t.timestamp, t.id",
            )?;
            let turns = stmt
                .query_map(params![agent_id], parse_turn_row)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(turns)
        })
    }

    /// Apply a validated transition atomically: create or advance the task,
    /// append the turn, stamp completion, append the transition record and
    /// optionally end the agent. Either every write lands or none does.
    ///
    /// Fails without writing if the agent's active task is no longer the one
    /// the caller validated against.
    pub fn apply_transition(&self, write: &TransitionWrite<'_>) -> Result<TransitionRecord> {
        let now = now_ms();

        self.with_conn_mut(|conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

            let active = get_active_task_internal(&tx, write.agent_id)?;
            let active_id = active.as_ref().map(|t| t.id);
            if active_id != write.expected_task_id {
                return Err(anyhow!(
                    "Active task for agent {} changed (expected {:?}, found {:?})",
                    write.agent_id,
                    write.expected_task_id,
                    active_id
                ));
            }

            let mut abandoned_task_id = None;
            let task_id = if write.creates_task {
                if let Some(prior) = &active {
                    tx.execute(
                        "UPDATE tasks SET state = ?1, abandoned = 1, completed_at = ?2, updated_at = ?2
                         WHERE id = ?3",
                        params![TaskState::Complete, now, prior.id],
                    )?;
                    abandoned_task_id = Some(prior.id);
                }
                tx.execute(
                    "INSERT INTO tasks (agent_id, state, created_at, updated_at, completed_at)
                     VALUES (?1, ?2, ?3, ?3, ?4)",
                    params![
                        write.agent_id,
                        write.to,
                        now,
                        (write.to == TaskState::Complete).then_some(now)
                    ],
                )?;
                tx.last_insert_rowid()
            } else {
                let task = active.as_ref().ok_or_else(|| {
                    anyhow!("Agent {} has no active task to advance", write.agent_id)
                })?;
                let updated = tx.execute(
                    "UPDATE tasks SET state = ?1, updated_at = ?2,
                         completed_at = CASE WHEN ?1 = 'complete' THEN ?2 ELSE completed_at END
                     WHERE id = ?3 AND state = ?4",
                    params![write.to, now, task.id, write.from],
                )?;
                if updated == 0 {
                    return Err(anyhow!(
                        "Task {} is no longer in state {}",
                        task.id,
                        write.from
                    ));
                }
                task.id
            };

            let timestamp = next_turn_timestamp(&tx, write.agent_id, now)?;
            tx.execute(
                "INSERT INTO turns (task_id, actor, intent, text, timestamp, occurred_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    task_id,
                    write.actor,
                    write.intent,
                    write.text,
                    timestamp,
                    write.occurred_at
                ],
            )?;
            let turn_id = tx.last_insert_rowid();

            let record_id = insert_transition_internal(
                &tx,
                &TransitionRecord {
                    id: 0,
                    agent_id: write.agent_id,
                    task_id,
                    turn_id,
                    from_state: write.from,
                    to_state: write.to,
                    actor: write.actor,
                    intent: write.intent,
                    abandoned_task_id,
                    timestamp,
                },
            )?;

            if write.end_agent {
                tx.execute(
                    "UPDATE agents SET ended_at = ?1 WHERE id = ?2 AND ended_at IS NULL",
                    params![now, write.agent_id],
                )?;
            }

            let record = get_transition_internal(&tx, record_id)?
                .ok_or_else(|| anyhow!("Transition {} vanished after insert", record_id))?;

            tx.commit()?;
            Ok(record)
        })
    }
}
