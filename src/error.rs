//! Structured error types for notification processing.

use crate::types::{Actor, Intent, TaskState};
use serde::Serialize;
use std::time::Duration;
use thiserror::Error;

/// Error codes for programmatic error handling.
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum ErrorCode {
    UnresolvedSession,
    InvalidTransition,
    LockTimeout,
    StoreError,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::UnresolvedSession => "unresolvedSession",
            ErrorCode::InvalidTransition => "invalidTransition",
            ErrorCode::LockTimeout => "lockTimeout",
            ErrorCode::StoreError => "storeError",
        }
    }
}

/// Why a notification could not be mapped to an agent.
#[derive(Debug, Error)]
pub enum ResolveError {
    #[error("missing session id")]
    MissingSessionId,

    #[error("no registered project contains {path}")]
    UnregisteredProject { path: String },

    #[error("no alive agent for this session")]
    NoAliveAgent,

    #[error("store error during resolution: {0}")]
    Store(String),
}

impl ResolveError {
    pub fn store(err: anyhow::Error) -> Self {
        ResolveError::Store(format!("{:#}", err))
    }
}

/// Failures of the per-agent exclusion lock.
#[derive(Debug, Error)]
pub enum LockError {
    #[error("timed out after {}ms waiting for lock on agent {agent_id}", .waited.as_millis())]
    Timeout { agent_id: i64, waited: Duration },

    #[error("lock on agent {agent_id} is held by {}", .holder.as_deref().unwrap_or("another holder"))]
    Contended {
        agent_id: i64,
        holder: Option<String>,
    },

    #[error("lock on agent {requested} requested while holding lock on agent {held}")]
    Nested { held: i64, requested: i64 },

    #[error("lock store error for agent {agent_id}: {message}")]
    Store { agent_id: i64, message: String },
}

impl LockError {
    pub fn store(agent_id: i64, err: anyhow::Error) -> Self {
        LockError::Store {
            agent_id,
            message: format!("{:#}", err),
        }
    }

    pub fn agent_id(&self) -> i64 {
        match self {
            LockError::Timeout { agent_id, .. }
            | LockError::Contended { agent_id, .. }
            | LockError::Store { agent_id, .. } => *agent_id,
            LockError::Nested { requested, .. } => *requested,
        }
    }
}

/// Tagged failure returned from `Lifecycle::process`.
#[derive(Debug, Error)]
pub enum ProcessError {
    #[error("unresolved session '{session_id}': {reason}")]
    UnresolvedSession {
        session_id: String,
        path: Option<String>,
        reason: String,
    },

    #[error("invalid transition for agent {agent_id}: {reason}")]
    InvalidTransition {
        agent_id: i64,
        task_id: Option<i64>,
        from: TaskState,
        actor: Actor,
        intent: Intent,
        reason: String,
    },

    #[error("timed out after {waited_ms}ms waiting for lock on agent {agent_id}")]
    LockTimeout { agent_id: i64, waited_ms: u64 },

    #[error("store error{}: {message}", .agent_id.map(|id| format!(" for agent {}", id)).unwrap_or_default())]
    Store {
        agent_id: Option<i64>,
        message: String,
    },
}

impl ProcessError {
    pub fn store(agent_id: Option<i64>, err: anyhow::Error) -> Self {
        ProcessError::Store {
            agent_id,
            message: format!("{:#}", err),
        }
    }

    pub fn code(&self) -> ErrorCode {
        match self {
            ProcessError::UnresolvedSession { .. } => ErrorCode::UnresolvedSession,
            ProcessError::InvalidTransition { .. } => ErrorCode::InvalidTransition,
            ProcessError::LockTimeout { .. } => ErrorCode::LockTimeout,
            ProcessError::Store { .. } => ErrorCode::StoreError,
        }
    }

    /// Lock timeouts and store failures may succeed on redelivery. Resolution
    /// and validation failures will not.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ProcessError::LockTimeout { .. } | ProcessError::Store { .. }
        )
    }

    pub fn agent_id(&self) -> Option<i64> {
        match self {
            ProcessError::UnresolvedSession { .. } => None,
            ProcessError::InvalidTransition { agent_id, .. }
            | ProcessError::LockTimeout { agent_id, .. } => Some(*agent_id),
            ProcessError::Store { agent_id, .. } => *agent_id,
        }
    }

    pub fn diagnostic(&self) -> Diagnostic {
        let path = match self {
            ProcessError::UnresolvedSession { path, .. } => path.clone(),
            _ => None,
        };
        Diagnostic {
            code: self.code(),
            message: self.to_string(),
            agent_id: self.agent_id(),
            path,
            retryable: self.is_retryable(),
        }
    }

    pub(crate) fn unresolved(session_id: &str, err: ResolveError) -> Self {
        match err {
            ResolveError::Store(message) => ProcessError::Store {
                agent_id: None,
                message,
            },
            ResolveError::UnregisteredProject { ref path } => ProcessError::UnresolvedSession {
                session_id: session_id.to_string(),
                path: Some(path.clone()),
                reason: err.to_string(),
            },
            ResolveError::MissingSessionId | ResolveError::NoAliveAgent => ProcessError::UnresolvedSession {
                session_id: session_id.to_string(),
                path: None,
                reason: err.to_string(),
            },
        }
    }
}

impl From<LockError> for ProcessError {
    fn from(err: LockError) -> Self {
        match err {
            LockError::Timeout { agent_id, waited } => ProcessError::LockTimeout {
                agent_id,
                waited_ms: waited.as_millis() as u64,
            },
            LockError::Contended { agent_id, .. } => ProcessError::LockTimeout {
                agent_id,
                waited_ms: 0,
            },
            other => ProcessError::Store {
                agent_id: Some(other.agent_id()),
                message: other.to_string(),
            },
        }
    }
}

/// Operator-facing explanation of why a notification was dropped.
#[derive(Debug, Clone, Serialize)]
pub struct Diagnostic {
    pub code: ErrorCode,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    pub retryable: bool,
}

/// Result of processing one notification.
pub type ProcessingResult = std::result::Result<crate::types::Processed, ProcessError>;
