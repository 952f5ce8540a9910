//! Agent Lifecycle CLI
//!
//! Entry point for hook handlers, the long-running notification intake, and
//! project/agent administration.

use agent_lifecycle::cli::agent::AgentCommand;
use agent_lifecycle::cli::project::{ProjectCommand, path_or_cwd};
use agent_lifecycle::cli::{
    Cli, Command, HistoryArgs, HookArgs, ReapArgs, ServeArgs, exit_status, result_json,
};
use agent_lifecycle::config::watcher::{WatchPaths, start_config_watcher};
use agent_lifecycle::config::{Config, ConfigLoader, ConfigPaths};
use agent_lifecycle::db::Database;
use agent_lifecycle::error::ProcessingResult;
use agent_lifecycle::hooks::{self, HANDOFF_TOKEN_ENV, HookPayload};
use agent_lifecycle::lifecycle::{Lifecycle, run_reaper};
use agent_lifecycle::serve::{ServeOptions, serve_lines};
use agent_lifecycle::types::Notification;
use anyhow::{Context, Result};
use clap::Parser;
use serde::Serialize;
use serde_json::json;
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

fn main() -> Result<ExitCode> {
    let cli = Cli::parse();
    init_logging(&cli)?;

    // An explicit --config replaces the project and user tiers
    let mut paths = ConfigPaths::discover();
    if let Some(config_path) = &cli.config {
        paths.explicit_file = Some(PathBuf::from(config_path));
    }
    let mut loader = ConfigLoader::load_with_paths(paths.clone())?;
    for source in loader.sources() {
        debug!("Loaded config from {}", source.display());
    }

    // Override paths from CLI arguments
    if let Some(db_path) = &cli.database {
        loader.config_mut().database.path = db_path.into();
    }
    let config = loader.into_config();

    match cli.command {
        Command::Hook(args) => run_hook(&config, args),
        Command::Process => run_process(&config),
        Command::Serve(args) => {
            let runtime = tokio::runtime::Runtime::new()?;
            let result = runtime.block_on(run_serve(config, paths, args));
            // The config watcher parks a blocking thread; don't wait on it
            runtime.shutdown_timeout(Duration::from_secs(1));
            result.map(|_| ExitCode::SUCCESS)
        }
        Command::Project(command) => run_project(&config, command).map(|_| ExitCode::SUCCESS),
        Command::Agent(command) => run_agent(&config, command).map(|_| ExitCode::SUCCESS),
        Command::History(args) => run_history(&config, args).map(|_| ExitCode::SUCCESS),
        Command::Reap(args) => run_reap(&config, args).map(|_| ExitCode::SUCCESS),
    }
}

/// Initialize logging based on --log. `RUST_LOG` takes precedence over
/// the --verbose level.
fn init_logging(cli: &Cli) -> Result<()> {
    let level = if cli.verbose { "debug" } else { "info" };
    let filter =
        || EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    match cli.log.as_str() {
        "0" | "off" => {
            // No logging
        }
        "1" | "stdout" => {
            let subscriber = FmtSubscriber::builder()
                .with_env_filter(filter())
                .with_writer(std::io::stdout)
                .finish();
            tracing::subscriber::set_global_default(subscriber)?;
        }
        "2" | "stderr" => {
            let subscriber = FmtSubscriber::builder()
                .with_env_filter(filter())
                .with_writer(std::io::stderr)
                .finish();
            tracing::subscriber::set_global_default(subscriber)?;
        }
        filename => {
            // Log to file (append mode)
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(filename)
                .with_context(|| format!("Failed to open log file {}", filename))?;
            let subscriber = FmtSubscriber::builder()
                .with_env_filter(filter())
                .with_writer(file)
                .with_ansi(false)
                .finish();
            tracing::subscriber::set_global_default(subscriber)?;
        }
    }
    Ok(())
}

/// Open the configured database, creating its directory if needed.
fn open_database(config: &Config) -> Result<Database> {
    let path = &config.database.path;
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create database directory {}", parent.display()))?;
    }
    Database::open_with_timeout(path, config.database.query_timeout())
        .with_context(|| format!("Failed to open database {}", path.display()))
}

fn open_lifecycle(config: &Config) -> Result<Lifecycle> {
    Lifecycle::from_config(open_database(config)?, config)
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// Print one processing result and map it to the process exit status.
fn finish(result: &ProcessingResult) -> Result<ExitCode> {
    println!("{}", result_json(result));
    Ok(ExitCode::from(exit_status(result)))
}

/// Run the hook command: one hook payload on stdin
fn run_hook(config: &Config, args: HookArgs) -> Result<ExitCode> {
    let input = std::io::read_to_string(std::io::stdin()).context("Failed to read hook payload")?;
    let mut payload = HookPayload::parse(&input)?;
    payload.normalize_cwd()?;
    let handoff_token = std::env::var(HANDOFF_TOKEN_ENV).ok();
    let notification = hooks::to_notification(args.event, payload, handoff_token);
    debug!(event = %args.event, session_id = %notification.session_id, "Hook received");

    let lifecycle = open_lifecycle(config)?;
    finish(&lifecycle.process(&notification))
}

/// Run the process command: one notification on stdin
fn run_process(config: &Config) -> Result<ExitCode> {
    let input = std::io::read_to_string(std::io::stdin()).context("Failed to read notification")?;
    let notification: Notification =
        serde_json::from_str(&input).context("Invalid notification JSON")?;

    let lifecycle = open_lifecycle(config)?;
    finish(&lifecycle.process(&notification))
}

/// Run the serve command: NDJSON notifications on stdin until EOF
async fn run_serve(config: Config, paths: ConfigPaths, args: ServeArgs) -> Result<()> {
    let lifecycle = Arc::new(open_lifecycle(&config)?);

    let reaper = if args.no_reaper {
        None
    } else {
        info!(
            interval_secs = config.reaper.interval_secs,
            inactivity_timeout_secs = config.reaper.inactivity_timeout_secs,
            "Starting stale-agent reaper"
        );
        Some(tokio::spawn(run_reaper(
            Arc::clone(&lifecycle),
            config.reaper.interval(),
            config.reaper.inactivity_timeout(),
        )))
    };
    let watcher = start_config_reload(Arc::clone(&lifecycle), paths);

    let input = tokio::io::BufReader::new(tokio::io::stdin());
    let mut output = tokio::io::stdout();
    let options = ServeOptions {
        lanes: usize::from(args.concurrency),
        emit_transitions: args.transitions,
    };
    let stats = serve_lines(Arc::clone(&lifecycle), input, &mut output, options).await?;

    info!(
        received = stats.received,
        succeeded = stats.succeeded,
        failed = stats.failed,
        transitions = stats.transitions,
        "Input closed; shutting down"
    );

    for handle in [reaper, watcher].into_iter().flatten() {
        handle.abort();
    }
    Ok(())
}

/// Watch the config directories and apply reloadable settings on change.
///
/// If the watcher fails to start (e.g., because no config directory exists),
/// serving continues without hot-reload.
fn start_config_reload(lifecycle: Arc<Lifecycle>, paths: ConfigPaths) -> Option<JoinHandle<()>> {
    let dirs: Vec<PathBuf> = paths.config_dirs().into_iter().map(Path::to_path_buf).collect();

    match start_config_watcher(WatchPaths::new(dirs)) {
        Ok(mut handle) => {
            info!("Config file watcher started for hot-reload");
            Some(tokio::spawn(async move {
                loop {
                    match handle.wait_for_change().await {
                        Some(event) => {
                            if !event.requires_reload() {
                                continue;
                            }
                            info!("Config change detected: {:?}", event);
                            match ConfigLoader::load_with_paths(paths.clone()) {
                                Ok(loader) => {
                                    if let Err(e) = lifecycle.apply_config(loader.config()) {
                                        warn!("Rejected reloaded config: {:#}", e);
                                    }
                                }
                                Err(e) => {
                                    warn!("Failed to reload config, keeping previous: {:#}", e)
                                }
                            }
                        }
                        None => {
                            info!("Config file watcher stopped");
                            break;
                        }
                    }
                }
            }))
        }
        Err(e) => {
            info!("Config hot-reload disabled: {}", e);
            None
        }
    }
}

fn run_project(config: &Config, command: ProjectCommand) -> Result<()> {
    let db = open_database(config)?;
    match command {
        ProjectCommand::Add { path, name } => {
            let path = path_or_cwd(path.as_deref())?;
            let project = db.register_project(&path, name.as_deref())?;
            print_json(&project)
        }
        ProjectCommand::List => print_json(&db.list_projects()?),
    }
}

fn run_agent(config: &Config, command: AgentCommand) -> Result<()> {
    let db = open_database(config)?;
    match command {
        AgentCommand::Register { path } => {
            let path = path_or_cwd(path.as_deref())?;
            let agent = db.preregister_agent(&path)?;
            let export = agent
                .handoff_token
                .as_deref()
                .map(|token| format!("{}={}", HANDOFF_TOKEN_ENV, token));
            print_json(&json!({
                "agent": agent,
                "export": export,
            }))
        }
        AgentCommand::List { all } => print_json(&db.list_agents(all)?),
    }
}

fn run_history(config: &Config, args: HistoryArgs) -> Result<()> {
    let db = open_database(config)?;
    let agent = db.require_agent(args.agent_id)?;

    let tasks = db
        .list_tasks(agent.id)?
        .into_iter()
        .map(|task| {
            let turns = db.get_turns(task.id)?;
            Ok(json!({
                "task": task,
                "turns": turns,
            }))
        })
        .collect::<Result<Vec<_>>>()?;
    let transitions = db.get_agent_transitions(agent.id)?;

    print_json(&json!({
        "agent": agent,
        "tasks": tasks,
        "transitions": transitions,
    }))
}

fn run_reap(config: &Config, args: ReapArgs) -> Result<()> {
    let lifecycle = open_lifecycle(config)?;
    let inactivity = args
        .inactive_secs
        .map(Duration::from_secs)
        .unwrap_or_else(|| config.reaper.inactivity_timeout());
    let report = lifecycle.reap_stale_agents(inactivity)?;
    print_json(&report)
}
