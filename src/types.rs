//! Core types for agent lifecycle tracking.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Who produced a turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Actor {
    User,
    Agent,
}

impl Actor {
    pub fn as_str(&self) -> &'static str {
        match self {
            Actor::User => "user",
            Actor::Agent => "agent",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "user" => Some(Actor::User),
            "agent" => Some(Actor::Agent),
            _ => None,
        }
    }
}

impl fmt::Display for Actor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Classified purpose of a turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Intent {
    Command,
    Answer,
    Question,
    Progress,
    Completion,
    EndOfTask,
}

impl Intent {
    pub const ALL: [Intent; 6] = [
        Intent::Command,
        Intent::Answer,
        Intent::Question,
        Intent::Progress,
        Intent::Completion,
        Intent::EndOfTask,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Intent::Command => "command",
            Intent::Answer => "answer",
            Intent::Question => "question",
            Intent::Progress => "progress",
            Intent::Completion => "completion",
            Intent::EndOfTask => "end_of_task",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "command" => Some(Intent::Command),
            "answer" => Some(Intent::Answer),
            "question" => Some(Intent::Question),
            "progress" => Some(Intent::Progress),
            "completion" => Some(Intent::Completion),
            "end_of_task" => Some(Intent::EndOfTask),
            _ => None,
        }
    }

    /// True for the intents that finish a task.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Intent::Completion | Intent::EndOfTask)
    }
}

impl fmt::Display for Intent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Task state machine states.
///
/// `Idle` stands for "no active task". It appears as a from-state in
/// validation and in transition records but is never stored on a task row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    Idle,
    Commanded,
    Processing,
    AwaitingInput,
    Complete,
}

impl TaskState {
    pub const ALL: [TaskState; 5] = [
        TaskState::Idle,
        TaskState::Commanded,
        TaskState::Processing,
        TaskState::AwaitingInput,
        TaskState::Complete,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskState::Idle => "idle",
            TaskState::Commanded => "commanded",
            TaskState::Processing => "processing",
            TaskState::AwaitingInput => "awaiting_input",
            TaskState::Complete => "complete",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "idle" => Some(TaskState::Idle),
            "commanded" => Some(TaskState::Commanded),
            "processing" => Some(TaskState::Processing),
            "awaiting_input" => Some(TaskState::AwaitingInput),
            "complete" => Some(TaskState::Complete),
            _ => None,
        }
    }

    /// A task in this state counts as the agent's active task.
    pub fn is_active(&self) -> bool {
        !matches!(self, TaskState::Idle | TaskState::Complete)
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A registered working-directory root.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Project {
    pub id: i64,
    pub path: String,
    pub name: String,
    pub created_at: i64,
}

/// One tracked coding-agent session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Agent {
    pub id: i64,
    /// Upstream session identifier. `None` for pre-registered agents that no
    /// notification has claimed yet.
    pub session_id: Option<String>,
    pub project_id: i64,
    pub working_directory: String,
    pub handoff_token: Option<String>,
    pub created_at: i64,
    pub last_seen_at: i64,
    pub ended_at: Option<i64>,
}

impl Agent {
    pub fn is_alive(&self) -> bool {
        self.ended_at.is_none()
    }

    /// True if the agent is unbound or already bound to `session_id`.
    pub fn bindable_to(&self, session_id: &str) -> bool {
        self.session_id.as_deref().is_none_or(|s| s == session_id)
    }
}

/// One unit of work, from a user command through to completion.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Task {
    pub id: i64,
    pub agent_id: i64,
    pub state: TaskState,
    /// Set when a new command replaced this task while it awaited input.
    pub abandoned: bool,
    pub created_at: i64,
    pub updated_at: i64,
    pub completed_at: Option<i64>,
}

/// One utterance within a task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Turn {
    pub id: i64,
    pub task_id: i64,
    pub actor: Actor,
    pub intent: Intent,
    pub text: Option<String>,
    /// Ordering timestamp, strictly increasing per agent.
    pub timestamp: i64,
    /// Upstream timestamp as reported by the notification, if any.
    pub occurred_at: Option<i64>,
}

/// Immutable audit entry for one applied transition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransitionRecord {
    pub id: i64,
    pub agent_id: i64,
    pub task_id: i64,
    pub turn_id: i64,
    pub from_state: TaskState,
    pub to_state: TaskState,
    pub actor: Actor,
    pub intent: Intent,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub abandoned_task_id: Option<i64>,
    pub timestamp: i64,
}

/// Correlation hints supplied alongside a notification.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Hints {
    /// Token issued when an agent was pre-registered.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub handoff_token: Option<String>,
}

impl Hints {
    pub fn is_empty(&self) -> bool {
        self.handoff_token.is_none()
    }
}

/// What a notification reports.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum NotificationKind {
    SessionStart,
    SessionEnd,
    Turn {
        actor: Actor,
        #[serde(default)]
        text: Option<String>,
    },
}

/// Inbound lifecycle notification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notification {
    pub session_id: String,
    pub working_directory: String,
    #[serde(flatten)]
    pub kind: NotificationKind,
    #[serde(default, skip_serializing_if = "Hints::is_empty")]
    pub hints: Hints,
    #[serde(default)]
    pub occurred_at: Option<i64>,
}

impl Notification {
    pub fn turn(
        session_id: impl Into<String>,
        working_directory: impl Into<String>,
        actor: Actor,
        text: Option<&str>,
    ) -> Self {
        Self {
            session_id: session_id.into(),
            working_directory: working_directory.into(),
            kind: NotificationKind::Turn {
                actor,
                text: text.map(str::to_string),
            },
            hints: Hints::default(),
            occurred_at: None,
        }
    }

    pub fn session_start(session_id: impl Into<String>, working_directory: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            working_directory: working_directory.into(),
            kind: NotificationKind::SessionStart,
            hints: Hints::default(),
            occurred_at: None,
        }
    }

    pub fn session_end(session_id: impl Into<String>, working_directory: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            working_directory: working_directory.into(),
            kind: NotificationKind::SessionEnd,
            hints: Hints::default(),
            occurred_at: None,
        }
    }

    pub fn with_hints(mut self, hints: Hints) -> Self {
        self.hints = hints;
        self
    }
}

/// Successful outcome of processing a notification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum Processed {
    /// A turn was classified, validated and applied.
    Applied { transition: TransitionRecord },
    /// The session was registered or refreshed; no task changed.
    SessionStarted { agent_id: i64 },
    /// The agent was ended, completing its active task if it had one.
    SessionEnded {
        agent_id: i64,
        #[serde(skip_serializing_if = "Option::is_none")]
        transition: Option<TransitionRecord>,
    },
}

impl Processed {
    pub fn agent_id(&self) -> i64 {
        match self {
            Processed::Applied { transition } => transition.agent_id,
            Processed::SessionStarted { agent_id } => *agent_id,
            Processed::SessionEnded { agent_id, .. } => *agent_id,
        }
    }

    pub fn transition(&self) -> Option<&TransitionRecord> {
        match self {
            Processed::Applied { transition } => Some(transition),
            Processed::SessionEnded { transition, .. } => transition.as_ref(),
            Processed::SessionStarted { .. } => None,
        }
    }
}
