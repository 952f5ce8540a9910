//! Agent subcommands

use clap::Subcommand;
use std::path::PathBuf;

#[derive(Subcommand, Debug)]
pub enum AgentCommand {
    /// Pre-register an agent before its session starts and print its
    /// handoff token
    Register {
        /// Working directory the agent will run in (default: current directory)
        #[arg(value_name = "PATH")]
        path: Option<PathBuf>,
    },

    /// List agents
    List {
        /// Include ended agents
        #[arg(long)]
        all: bool,
    },
}
