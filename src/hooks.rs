//! Mapping from coding-agent hook events to lifecycle notifications.
//!
//! `Stop` payloads usually carry no message. The agent's closing text is then
//! read from the last assistant entry of the session transcript, so a
//! completion phrase there still finishes the task.

use crate::cli::project::{absolute_path, path_or_cwd};
use crate::types::{Actor, Hints, Notification, NotificationKind};
use anyhow::{Result, anyhow};
use serde::Deserialize;
use std::fmt;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// Transcript lines scanned backwards for the last assistant text.
const TRANSCRIPT_TAIL: usize = 50;

/// Environment variable carrying a pre-registration handoff token.
pub const HANDOFF_TOKEN_ENV: &str = "AGENT_LIFECYCLE_HANDOFF_TOKEN";

/// Hook events emitted by the upstream agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HookEvent {
    SessionStart,
    SessionEnd,
    UserPromptSubmit,
    Stop,
    SubagentStop,
    Notification,
    PreToolUse,
    PostToolUse,
}

impl HookEvent {
    pub const ALL: [HookEvent; 8] = [
        HookEvent::SessionStart,
        HookEvent::SessionEnd,
        HookEvent::UserPromptSubmit,
        HookEvent::Stop,
        HookEvent::SubagentStop,
        HookEvent::Notification,
        HookEvent::PreToolUse,
        HookEvent::PostToolUse,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            HookEvent::SessionStart => "SessionStart",
            HookEvent::SessionEnd => "SessionEnd",
            HookEvent::UserPromptSubmit => "UserPromptSubmit",
            HookEvent::Stop => "Stop",
            HookEvent::SubagentStop => "SubagentStop",
            HookEvent::Notification => "Notification",
            HookEvent::PreToolUse => "PreToolUse",
            HookEvent::PostToolUse => "PostToolUse",
        }
    }
}

impl fmt::Display for HookEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Accepts `PreToolUse`, `pre-tool-use` and `pre_tool_use`, in any case.
impl FromStr for HookEvent {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        let wanted: String = s
            .chars()
            .filter(|c| *c != '-' && *c != '_')
            .collect::<String>()
            .to_ascii_lowercase();
        HookEvent::ALL
            .into_iter()
            .find(|e| e.as_str().to_ascii_lowercase() == wanted)
            .ok_or_else(|| anyhow!("unknown hook event '{}'", s))
    }
}

/// JSON payload the upstream agent writes to a hook's stdin. Unknown fields
/// are ignored.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct HookPayload {
    #[serde(default)]
    pub session_id: String,
    #[serde(default)]
    pub cwd: String,
    /// User prompt text (`UserPromptSubmit`).
    #[serde(default)]
    pub prompt: Option<String>,
    /// Agent message text (`Stop`, `Notification`).
    #[serde(default)]
    pub message: Option<String>,
    /// Upstream event time in milliseconds, when provided.
    #[serde(default)]
    pub timestamp: Option<i64>,
    /// Session transcript (JSONL), used when `message` is absent.
    #[serde(default)]
    pub transcript_path: Option<PathBuf>,
}

impl HookPayload {
    /// Parse a payload. Blank input yields an empty payload.
    pub fn parse(input: &str) -> Result<Self> {
        if input.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_json::from_str(input).map_err(|e| anyhow!("Invalid hook payload: {}", e))
    }

    /// Make `cwd` absolute with symlinks resolved, matching how project
    /// paths are registered. A blank `cwd` becomes the current directory.
    pub fn normalize_cwd(&mut self) -> Result<()> {
        self.cwd = if self.cwd.trim().is_empty() {
            path_or_cwd(None)?
        } else {
            absolute_path(Path::new(&self.cwd))?
        };
        Ok(())
    }

    /// The agent's message, falling back to the transcript's last assistant text.
    fn agent_text(&self) -> Option<String> {
        self.message.clone().or_else(|| {
            self.transcript_path
                .as_deref()
                .and_then(last_assistant_text)
        })
    }
}

/// Text of the newest assistant entry in a JSONL transcript. Unreadable
/// files and malformed lines yield nothing.
fn last_assistant_text(path: &Path) -> Option<String> {
    let file = std::fs::File::open(path).ok()?;
    let lines: Vec<String> = BufReader::new(file)
        .lines()
        .map_while(|line| line.ok())
        .collect();

    for line in lines.iter().rev().take(TRANSCRIPT_TAIL) {
        let Ok(entry) = serde_json::from_str::<serde_json::Value>(line.trim()) else {
            continue;
        };
        if entry.get("type").and_then(|v| v.as_str()) != Some("assistant") {
            continue;
        }
        let Some(content) = entry
            .get("message")
            .and_then(|m| m.get("content"))
            .and_then(|c| c.as_array())
        else {
            continue;
        };

        let text = content
            .iter()
            .filter(|item| item.get("type").and_then(|v| v.as_str()) == Some("text"))
            .filter_map(|item| item.get("text").and_then(|v| v.as_str()))
            .collect::<Vec<_>>()
            .join("\n");
        if !text.is_empty() {
            return Some(text);
        }
    }
    None
}

/// Build the notification for `event`.
pub fn to_notification(
    event: HookEvent,
    payload: HookPayload,
    handoff_token: Option<String>,
) -> Notification {
    let kind = match event {
        HookEvent::SessionStart => NotificationKind::SessionStart,
        HookEvent::SessionEnd => NotificationKind::SessionEnd,
        HookEvent::UserPromptSubmit => NotificationKind::Turn {
            actor: Actor::User,
            text: payload.prompt,
        },
        HookEvent::Stop | HookEvent::SubagentStop => NotificationKind::Turn {
            actor: Actor::Agent,
            text: payload.agent_text(),
        },
        HookEvent::Notification => NotificationKind::Turn {
            actor: Actor::Agent,
            text: payload.message.clone(),
        },
        HookEvent::PreToolUse | HookEvent::PostToolUse => NotificationKind::Turn {
            actor: Actor::Agent,
            text: None,
        },
    };

    Notification {
        session_id: payload.session_id,
        working_directory: payload.cwd,
        kind,
        hints: Hints {
            handoff_token: handoff_token.filter(|t| !t.trim().is_empty()),
        },
        occurred_at: payload.timestamp,
    }
}
