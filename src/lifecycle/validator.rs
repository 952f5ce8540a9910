//! Task state machine.
//!
//! `validate` is a pure function over the transition table below. It does no
//! I/O, so every (state, actor, intent) combination can be tested without a
//! store.
//!
//! | From           | Actor | Intent                  | To                                 |
//! |----------------|-------|-------------------------|------------------------------------|
//! | Idle           | User  | Command                 | Commanded (new task)               |
//! | Commanded      | Agent | Progress                | Processing                         |
//! | Commanded      | Agent | Question                | AwaitingInput                      |
//! | Commanded      | Agent | Completion / EndOfTask  | Complete                           |
//! | Processing     | Agent | Progress                | Processing                         |
//! | Processing     | Agent | Question                | AwaitingInput                      |
//! | Processing     | Agent | Completion / EndOfTask  | Complete                           |
//! | Processing     | User  | Answer                  | Processing                         |
//! | AwaitingInput  | User  | Answer                  | Processing                         |
//! | AwaitingInput  | User  | Command                 | Commanded (new task, abandons old) |
//! | AwaitingInput  | Agent | Completion / EndOfTask  | Complete                           |

use crate::types::{Actor, Intent, TaskState};
use serde::Serialize;

/// An accepted transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Transition {
    pub from: TaskState,
    pub to: TaskState,
    /// A new task is created for `to`.
    pub creates_task: bool,
    /// The active task is replaced by the new one and marked abandoned.
    pub abandons_current: bool,
}

/// Result of validating a (state, actor, intent) combination.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum Validation {
    Valid(Transition),
    Invalid { reason: String },
}

impl Validation {
    pub fn is_valid(&self) -> bool {
        matches!(self, Validation::Valid(_))
    }
}

fn advance(from: TaskState, to: TaskState) -> Validation {
    Validation::Valid(Transition {
        from,
        to,
        creates_task: false,
        abandons_current: false,
    })
}

fn start(from: TaskState, abandons_current: bool) -> Validation {
    Validation::Valid(Transition {
        from,
        to: TaskState::Commanded,
        creates_task: true,
        abandons_current,
    })
}

/// Validate a transition from `from` triggered by `actor` with `intent`.
pub fn validate(from: TaskState, actor: Actor, intent: Intent) -> Validation {
    use Actor::{Agent, User};
    use Intent::*;
    use TaskState::*;

    match (from, actor, intent) {
        (Idle, User, Command) => start(from, false),
        (AwaitingInput, User, Command) => start(from, true),

        (Commanded | Processing, Agent, Progress) => advance(from, Processing),
        (Commanded | Processing, Agent, Question) => advance(from, AwaitingInput),
        (Commanded | Processing | AwaitingInput, Agent, Completion | EndOfTask) => {
            advance(from, Complete)
        }
        (Processing | AwaitingInput, User, Answer) => advance(from, Processing),

        (Idle, Agent, _) => Validation::Invalid {
            reason: "agent cannot act when idle".to_string(),
        },
        (Idle, User, _) => Validation::Invalid {
            reason: format!("user input while idle must be a command, got {}", intent),
        },
        (Complete, _, _) => Validation::Invalid {
            reason: "task is already complete".to_string(),
        },
        _ => Validation::Invalid {
            reason: format!("{} {} is not allowed in state {}", actor, intent, from),
        },
    }
}
