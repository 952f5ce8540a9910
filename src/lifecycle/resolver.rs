//! Session resolution.
//!
//! Maps a notification's session id, working directory and hints to exactly
//! one agent. Strategies are tried in order and the first hit wins. Only the
//! last strategy writes to the store.

use crate::db::Database;
use crate::db::agents::AgentCreation;
use crate::error::ResolveError;
use crate::types::{Agent, Hints};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, info};

/// Inputs to one resolution.
#[derive(Debug, Clone, Copy)]
pub struct ResolveRequest<'a> {
    pub session_id: &'a str,
    pub working_directory: &'a str,
    pub hints: &'a Hints,
    /// Allow binding the session to an unclaimed or newly created agent.
    /// Session-end notifications only look up existing agents.
    pub allow_new: bool,
}

/// Which strategy produced the agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolvedVia {
    Cache,
    SessionId,
    HandoffToken,
    WorkingDirectory,
    Created,
}

#[derive(Debug, Clone)]
pub struct Resolution {
    pub agent: Agent,
    pub via: ResolvedVia,
}

/// Outcome of a single strategy.
enum Lookup {
    Found(Agent),
    NotFound,
}

type Strategy = fn(&SessionResolver, &ResolveRequest<'_>) -> Result<Lookup, ResolveError>;

const STRATEGIES: &[(ResolvedVia, Strategy)] = &[
    (ResolvedVia::Cache, SessionResolver::from_cache),
    (ResolvedVia::SessionId, SessionResolver::by_session_id),
    (ResolvedVia::HandoffToken, SessionResolver::by_handoff_token),
    (ResolvedVia::WorkingDirectory, SessionResolver::by_working_directory),
    (ResolvedVia::Created, SessionResolver::create),
];

pub struct SessionResolver {
    db: Database,
    auto_register_projects: AtomicBool,
    cache: Mutex<HashMap<String, i64>>,
}

impl SessionResolver {
    pub fn new(db: Database, auto_register_projects: bool) -> Self {
        Self {
            db,
            auto_register_projects: AtomicBool::new(auto_register_projects),
            cache: Mutex::new(HashMap::new()),
        }
    }

    pub fn auto_register_projects(&self) -> bool {
        self.auto_register_projects.load(Ordering::Relaxed)
    }

    pub fn set_auto_register_projects(&self, enabled: bool) {
        self.auto_register_projects.store(enabled, Ordering::Relaxed);
    }

    /// Resolve a request to one agent.
    pub fn resolve(&self, request: &ResolveRequest<'_>) -> Result<Resolution, ResolveError> {
        if request.session_id.trim().is_empty() {
            return Err(ResolveError::MissingSessionId);
        }

        for (via, strategy) in STRATEGIES {
            if let Lookup::Found(agent) = strategy(self, request)? {
                debug!(
                    session_id = request.session_id,
                    agent_id = agent.id,
                    via = ?via,
                    "Session resolved"
                );
                if *via != ResolvedVia::Cache {
                    self.remember(request.session_id, agent.id);
                }
                return Ok(Resolution { agent, via: *via });
            }
        }

        // `create` never returns NotFound
        Err(ResolveError::UnregisteredProject {
            path: request.working_directory.to_string(),
        })
    }

    /// Drop any cache entry for `session_id`.
    pub fn forget(&self, session_id: &str) {
        self.cache.lock().unwrap().remove(session_id);
    }

    /// Drop every cache entry pointing at `agent_id`.
    pub fn forget_agent(&self, agent_id: i64) {
        self.cache.lock().unwrap().retain(|_, id| *id != agent_id);
    }

    pub fn cached_agent_id(&self, session_id: &str) -> Option<i64> {
        self.cache.lock().unwrap().get(session_id).copied()
    }

    fn remember(&self, session_id: &str, agent_id: i64) {
        self.cache
            .lock()
            .unwrap()
            .insert(session_id.to_string(), agent_id);
    }

    fn from_cache(&self, request: &ResolveRequest<'_>) -> Result<Lookup, ResolveError> {
        let Some(agent_id) = self.cached_agent_id(request.session_id) else {
            return Ok(Lookup::NotFound);
        };
        match self.db.get_agent(agent_id).map_err(ResolveError::store)? {
            Some(agent) if agent.is_alive() && agent.bindable_to(request.session_id) => {
                Ok(Lookup::Found(agent))
            }
            _ => {
                debug!(session_id = request.session_id, agent_id, "Evicting stale cache entry");
                self.forget(request.session_id);
                Ok(Lookup::NotFound)
            }
        }
    }

    fn by_session_id(&self, request: &ResolveRequest<'_>) -> Result<Lookup, ResolveError> {
        let agent = self
            .db
            .find_alive_agent_by_session(request.session_id)
            .map_err(ResolveError::store)?;
        Ok(agent.map_or(Lookup::NotFound, Lookup::Found))
    }

    fn by_handoff_token(&self, request: &ResolveRequest<'_>) -> Result<Lookup, ResolveError> {
        let Some(token) = request.hints.handoff_token.as_deref() else {
            return Ok(Lookup::NotFound);
        };
        let agent = self
            .db
            .find_alive_agent_by_handoff(token)
            .map_err(ResolveError::store)?;
        match agent {
            Some(agent) if agent.bindable_to(request.session_id) => Ok(Lookup::Found(agent)),
            Some(agent) => {
                debug!(
                    session_id = request.session_id,
                    agent_id = agent.id,
                    "Handoff token belongs to another session"
                );
                Ok(Lookup::NotFound)
            }
            None => Ok(Lookup::NotFound),
        }
    }

    fn by_working_directory(&self, request: &ResolveRequest<'_>) -> Result<Lookup, ResolveError> {
        if !request.allow_new {
            return Ok(Lookup::NotFound);
        }
        let agent = self
            .db
            .find_unbound_agent_for_project_path(request.working_directory)
            .map_err(ResolveError::store)?;
        Ok(agent.map_or(Lookup::NotFound, Lookup::Found))
    }

    fn create(&self, request: &ResolveRequest<'_>) -> Result<Lookup, ResolveError> {
        if !request.allow_new {
            return Err(ResolveError::NoAliveAgent);
        }
        let creation = self
            .db
            .create_agent_for_session(
                request.session_id,
                request.working_directory,
                self.auto_register_projects(),
            )
            .map_err(ResolveError::store)?;

        match creation {
            AgentCreation::Created(agent) => {
                info!(
                    agent_id = agent.id,
                    session_id = request.session_id,
                    project_id = agent.project_id,
                    working_directory = %agent.working_directory,
                    "Agent created"
                );
                Ok(Lookup::Found(agent))
            }
            AgentCreation::Existing(agent) => Ok(Lookup::Found(agent)),
            AgentCreation::UnregisteredProject { path } => {
                Err(ResolveError::UnregisteredProject { path })
            }
        }
    }
}
