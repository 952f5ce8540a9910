//! CLI command definitions for agent-lifecycle
//!
//! This module defines the CLI structure using clap's derive macros.
//! The main entry point is the `Cli` struct which contains subcommands.

pub mod agent;
pub mod project;

use crate::error::ProcessingResult;
use crate::hooks::HookEvent;
use agent::AgentCommand;
use clap::{Args, Parser, Subcommand};
use project::ProjectCommand;
use serde_json::{Value, json};

/// Agent session lifecycle tracker
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file
    #[arg(short, long, global = true)]
    pub config: Option<String>,

    /// Path to database file (overrides config)
    #[arg(short, long, global = true)]
    pub database: Option<String>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Logging output: 0/off, 1/stdout, 2/stderr (default), or filename
    #[arg(short, long, default_value = "2", global = true)]
    pub log: String,

    #[command(subcommand)]
    pub command: Command,
}

/// Available subcommands
#[derive(Subcommand, Debug)]
pub enum Command {
    /// Handle one hook event; the hook payload is read from stdin
    Hook(HookArgs),

    /// Process one notification (JSON) read from stdin
    Process,

    /// Process newline-delimited notifications from stdin until EOF
    Serve(ServeArgs),

    /// Manage registered projects
    #[command(subcommand)]
    Project(ProjectCommand),

    /// Manage agents
    #[command(subcommand)]
    Agent(AgentCommand),

    /// Show tasks, turns and transitions of an agent
    History(HistoryArgs),

    /// Run one stale-agent reaping pass
    Reap(ReapArgs),
}

/// Arguments for the hook subcommand
#[derive(Args, Debug)]
pub struct HookArgs {
    /// Hook event name, e.g. UserPromptSubmit or pre-tool-use
    #[arg(value_name = "EVENT")]
    pub event: HookEvent,
}

/// Arguments for the serve subcommand
#[derive(Args, Debug)]
pub struct ServeArgs {
    /// Also write every applied transition as an event line
    #[arg(long)]
    pub transitions: bool,

    /// Maximum notifications processed at once
    #[arg(long, default_value_t = 16, value_parser = clap::value_parser!(u16).range(1..))]
    pub concurrency: u16,

    /// Do not run the periodic reaper
    #[arg(long)]
    pub no_reaper: bool,
}

/// Arguments for the history subcommand
#[derive(Args, Debug)]
pub struct HistoryArgs {
    /// Agent id
    #[arg(value_name = "AGENT_ID")]
    pub agent_id: i64,
}

/// Arguments for the reap subcommand
#[derive(Args, Debug)]
pub struct ReapArgs {
    /// End agents inactive for this many seconds (default: from config)
    #[arg(long, value_name = "SECS")]
    pub inactive_secs: Option<u64>,
}

/// Render a processing result as one JSON object.
///
/// Success: `{"ok": true, "outcome": ..., ...}`.
/// Failure: `{"ok": false, "error": {"code", "message", "retryable", ...}}`.
pub fn result_json(result: &ProcessingResult) -> Value {
    match result {
        Ok(processed) => {
            let mut value = serde_json::to_value(processed).unwrap_or(Value::Null);
            if let Value::Object(map) = &mut value {
                map.insert("ok".to_string(), Value::Bool(true));
            }
            value
        }
        Err(err) => json!({
            "ok": false,
            "error": err.diagnostic(),
        }),
    }
}

/// Exit status for a processed notification: 1 when redelivery may help.
pub fn exit_status(result: &ProcessingResult) -> u8 {
    match result {
        Err(err) if err.is_retryable() => 1,
        _ => 0,
    }
}
