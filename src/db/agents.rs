//! Agent CRUD operations.

use super::projects::{ensure_project_internal, find_project_for_path_internal};
use super::{Database, normalize_path, now_ms};
use crate::types::Agent;
use anyhow::{Result, anyhow};
use rusqlite::{Connection, OptionalExtension, Row, TransactionBehavior, params};
use uuid::Uuid;

const AGENT_COLUMNS: &str =
    "id, session_id, project_id, working_directory, handoff_token, created_at, last_seen_at, ended_at";

fn parse_agent_row(row: &Row) -> rusqlite::Result<Agent> {
    Ok(Agent {
        id: row.get(0)?,
        session_id: row.get(1)?,
        project_id: row.get(2)?,
        working_directory: row.get(3)?,
        handoff_token: row.get(4)?,
        created_at: row.get(5)?,
        last_seen_at: row.get(6)?,
        ended_at: row.get(7)?,
    })
}

/// Internal helper to get an agent using an existing connection (avoids deadlock).
pub(crate) fn get_agent_internal(conn: &Connection, agent_id: i64) -> Result<Option<Agent>> {
    let agent = conn
        .query_row(
            &format!("SELECT {} FROM agents WHERE id = ?1", AGENT_COLUMNS),
            params![agent_id],
            parse_agent_row,
        )
        .optional()?;
    Ok(agent)
}

fn find_alive_by_session_internal(conn: &Connection, session_id: &str) -> Result<Option<Agent>> {
    let agent = conn
        .query_row(
            &format!(
                "SELECT {} FROM agents WHERE session_id = ?1 AND ended_at IS NULL",
                AGENT_COLUMNS
            ),
            params![session_id],
            parse_agent_row,
        )
        .optional()?;
    Ok(agent)
}

/// Outcome of creating an agent for a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AgentCreation {
    /// A new agent row was inserted.
    Created(Agent),
    /// Another writer created an alive agent for the session first.
    Existing(Agent),
    /// No project contains the working directory and auto-registration is off.
    UnregisteredProject { path: String },
}

impl Database {
    /// Get an agent by ID.
    pub fn get_agent(&self, agent_id: i64) -> Result<Option<Agent>> {
        self.with_conn(|conn| get_agent_internal(conn, agent_id))
    }

    /// Check if an agent exists. Returns error if not found.
    pub fn require_agent(&self, agent_id: i64) -> Result<Agent> {
        self.get_agent(agent_id)?
            .ok_or_else(|| anyhow!("Agent {} not found", agent_id))
    }

    /// Find the alive agent bound to an upstream session id.
    pub fn find_alive_agent_by_session(&self, session_id: &str) -> Result<Option<Agent>> {
        self.with_conn(|conn| find_alive_by_session_internal(conn, session_id))
    }

    /// Find the alive agent that was issued `token` at pre-registration.
    pub fn find_alive_agent_by_handoff(&self, token: &str) -> Result<Option<Agent>> {
        self.with_conn(|conn| {
            let agent = conn
                .query_row(
                    &format!(
                        "SELECT {} FROM agents WHERE handoff_token = ?1 AND ended_at IS NULL",
                        AGENT_COLUMNS
                    ),
                    params![token],
                    parse_agent_row,
                )
                .optional()?;
            Ok(agent)
        })
    }

    /// Find the most recently seen alive agent of the project registered at
    /// exactly `working_directory` that no session has claimed yet.
    pub fn find_unbound_agent_for_project_path(&self, working_directory: &str) -> Result<Option<Agent>> {
        let path = normalize_path(working_directory);
        self.with_conn(|conn| {
            let agent = conn
                .query_row(
                    "SELECT a.id, a.session_id, a.project_id, a.working_directory, a.handoff_token,
                            a.created_at, a.last_seen_at, a.ended_at
                     FROM agents a JOIN projects p ON a.project_id = p.id
                     WHERE p.path = ?1 AND a.ended_at IS NULL AND a.session_id IS NULL
                     ORDER BY a.last_seen_at DESC, a.id DESC
                     LIMIT 1",
                    params![path],
                    parse_agent_row,
                )
                .optional()?;
            Ok(agent)
        })
    }

    /// Create an alive agent for `session_id` under the project containing
    /// `working_directory`.
    ///
    /// Runs in one immediate transaction, so concurrent creators for the same
    /// session (in this or another process) end up with a single agent. When
    /// no project contains the directory, a project is created at the
    /// directory only if `auto_register_projects` is set.
    pub fn create_agent_for_session(
        &self,
        session_id: &str,
        working_directory: &str,
        auto_register_projects: bool,
    ) -> Result<AgentCreation> {
        let path = normalize_path(working_directory);
        if path.is_empty() {
            return Ok(AgentCreation::UnregisteredProject { path });
        }
        let now = now_ms();

        self.with_conn_mut(|conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

            if let Some(existing) = find_alive_by_session_internal(&tx, session_id)? {
                tx.commit()?;
                return Ok(AgentCreation::Existing(existing));
            }

            let project = match find_project_for_path_internal(&tx, &path)? {
                Some(project) => project,
                None if auto_register_projects => ensure_project_internal(&tx, &path, None)?,
                None => return Ok(AgentCreation::UnregisteredProject { path }),
            };

            tx.execute(
                "INSERT INTO agents (session_id, project_id, working_directory, created_at, last_seen_at)
                 VALUES (?1, ?2, ?3, ?4, ?4)",
                params![session_id, project.id, &path, now],
            )?;
            let id = tx.last_insert_rowid();
            let agent = get_agent_internal(&tx, id)?
                .ok_or_else(|| anyhow!("Agent {} vanished after insert", id))?;

            tx.commit()?;
            Ok(AgentCreation::Created(agent))
        })
    }

    /// Pre-register an agent under the project containing `working_directory`,
    /// before any session exists. The returned agent carries a handoff token
    /// that a launcher passes to its hooks.
    pub fn preregister_agent(&self, working_directory: &str) -> Result<Agent> {
        let path = normalize_path(working_directory);
        let token = Uuid::now_v7().to_string();
        let now = now_ms();

        self.with_conn(|conn| {
            let project = find_project_for_path_internal(conn, &path)?
                .ok_or_else(|| anyhow!("No registered project contains {}", path))?;

            conn.execute(
                "INSERT INTO agents (project_id, working_directory, handoff_token, created_at, last_seen_at)
                 VALUES (?1, ?2, ?3, ?4, ?4)",
                params![project.id, &path, &token, now],
            )?;
            let id = conn.last_insert_rowid();
            get_agent_internal(conn, id)?.ok_or_else(|| anyhow!("Agent {} vanished after insert", id))
        })
    }

    /// Record that the agent was seen, binding `session_id` if the agent has
    /// none yet and no other alive agent owns it.
    pub fn touch_agent(&self, agent_id: i64, session_id: Option<&str>) -> Result<Agent> {
        let now = now_ms();

        self.with_conn(|conn| {
            let updated = conn.execute(
                "UPDATE agents SET last_seen_at = MAX(last_seen_at, ?1) WHERE id = ?2",
                params![now, agent_id],
            )?;
            if updated == 0 {
                return Err(anyhow!("Agent {} not found", agent_id));
            }

            if let Some(session_id) = session_id {
                conn.execute(
                    "UPDATE agents SET session_id = ?1
                     WHERE id = ?2 AND session_id IS NULL AND ended_at IS NULL
                       AND NOT EXISTS (
                           SELECT 1 FROM agents WHERE session_id = ?1 AND ended_at IS NULL
                       )",
                    params![session_id, agent_id],
                )?;
            }

            get_agent_internal(conn, agent_id)?.ok_or_else(|| anyhow!("Agent {} not found", agent_id))
        })
    }

    /// Stamp the agent's end time. Returns false if it had already ended.
    pub fn end_agent(&self, agent_id: i64) -> Result<bool> {
        let now = now_ms();
        self.with_conn(|conn| {
            let updated = conn.execute(
                "UPDATE agents SET ended_at = ?1 WHERE id = ?2 AND ended_at IS NULL",
                params![now, agent_id],
            )?;
            Ok(updated > 0)
        })
    }

    /// List agents, most recently seen first.
    pub fn list_agents(&self, include_ended: bool) -> Result<Vec<Agent>> {
        let sql = if include_ended {
            format!("SELECT {} FROM agents ORDER BY last_seen_at DESC, id DESC", AGENT_COLUMNS)
        } else {
            format!(
                "SELECT {} FROM agents WHERE ended_at IS NULL ORDER BY last_seen_at DESC, id DESC",
                AGENT_COLUMNS
            )
        };

        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&sql)?;
            let agents = stmt
                .query_map([], parse_agent_row)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(agents)
        })
    }

    /// Alive agents not seen since `cutoff_ms`.
    pub fn get_stale_agents(&self, cutoff_ms: i64) -> Result<Vec<Agent>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {} FROM agents WHERE ended_at IS NULL AND last_seen_at < ?1 ORDER BY last_seen_at",
                AGENT_COLUMNS
            ))?;
            let agents = stmt
                .query_map(params![cutoff_ms], parse_agent_row)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(agents)
        })
    }
}
