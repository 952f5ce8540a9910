//! Configuration loader with tier-based merging.
//!
//! Loads configuration from multiple tiers and merges them field-by-field.

use super::merge::deep_merge_all;
use super::types::Config;
use anyhow::{Context, Result, anyhow};
use serde_json::Value;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Name of the per-directory configuration file.
pub const CONFIG_FILE: &str = "config.yaml";

/// Configuration tier priority (lowest to highest).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ConfigTier {
    /// Embedded defaults (lowest priority)
    Defaults = 0,
    /// Project-level config (./.agent-lifecycle/)
    Project = 1,
    /// User-level config (~/.agent-lifecycle/)
    User = 2,
    /// Environment variables (highest priority)
    Environment = 3,
}

impl std::fmt::Display for ConfigTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigTier::Defaults => write!(f, "defaults"),
            ConfigTier::Project => write!(f, "project"),
            ConfigTier::User => write!(f, "user"),
            ConfigTier::Environment => write!(f, "environment"),
        }
    }
}

/// Paths for each configuration tier.
#[derive(Debug, Clone, Default)]
pub struct ConfigPaths {
    /// Project-level config directory
    pub project_dir: Option<PathBuf>,
    /// User-level config directory
    pub user_dir: Option<PathBuf>,
    /// Explicit config file replacing the project and user tiers
    pub explicit_file: Option<PathBuf>,
}

impl ConfigPaths {
    /// Discover configuration paths from the process environment.
    pub fn discover() -> Self {
        Self::discover_with(|key| std::env::var(key).ok())
    }

    /// Discover configuration paths using `env` to read variables.
    pub fn discover_with(env: impl Fn(&str) -> Option<String>) -> Self {
        // User dir: AGENT_LIFECYCLE_USER_DIR or ~/.agent-lifecycle
        let user_dir = env("AGENT_LIFECYCLE_USER_DIR")
            .map(PathBuf::from)
            .or_else(|| dirs::home_dir().map(|h| h.join(".agent-lifecycle")));

        // Project dir: AGENT_LIFECYCLE_PROJECT_DIR or $CWD/.agent-lifecycle
        let project_dir = env("AGENT_LIFECYCLE_PROJECT_DIR")
            .map(PathBuf::from)
            .or_else(|| Some(PathBuf::from(".agent-lifecycle")));

        Self {
            project_dir,
            user_dir,
            explicit_file: env("AGENT_LIFECYCLE_CONFIG_PATH").map(PathBuf::from),
        }
    }

    /// Create paths with explicit directories.
    pub fn with_dirs(project_dir: Option<PathBuf>, user_dir: Option<PathBuf>) -> Self {
        Self {
            project_dir,
            user_dir,
            explicit_file: None,
        }
    }

    /// Directories that may hold a config file, in tier order.
    pub fn config_dirs(&self) -> Vec<&Path> {
        match &self.explicit_file {
            Some(file) => file.parent().into_iter().collect(),
            None => self
                .project_dir
                .iter()
                .chain(self.user_dir.iter())
                .map(PathBuf::as_path)
                .collect(),
        }
    }
}

/// Read one YAML tier. Missing files are skipped; unreadable or malformed
/// files are skipped with a warning.
fn read_tier(tier: ConfigTier, file: &Path) -> Option<Value> {
    if !file.exists() {
        return None;
    }
    let content = match std::fs::read_to_string(file) {
        Ok(content) => content,
        Err(e) => {
            warn!(tier = %tier, path = %file.display(), error = %e, "Failed to read config file");
            return None;
        }
    };
    match serde_yaml::from_str::<Value>(&content) {
        Ok(value) => {
            debug!(tier = %tier, path = %file.display(), "Loaded config tier");
            Some(value)
        }
        Err(e) => {
            warn!(tier = %tier, path = %file.display(), error = %e, "Ignoring malformed config file");
            None
        }
    }
}

fn parse_bool(key: &str, raw: &str) -> Result<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        other => Err(anyhow!("{} must be a boolean, got '{}'", key, other)),
    }
}

/// Configuration loader that handles tier-based merging.
#[derive(Debug, Clone)]
pub struct ConfigLoader {
    /// Paths for each tier
    pub paths: ConfigPaths,
    /// Loaded configuration
    config: Config,
    /// Config files that contributed, lowest tier first
    sources: Vec<PathBuf>,
}

impl ConfigLoader {
    /// Load configuration from all tiers with proper merging.
    pub fn load() -> Result<Self> {
        Self::load_with(ConfigPaths::discover(), |key| std::env::var(key).ok())
    }

    /// Load configuration with explicit paths and the process environment.
    pub fn load_with_paths(paths: ConfigPaths) -> Result<Self> {
        Self::load_with(paths, |key| std::env::var(key).ok())
    }

    /// Load configuration with explicit paths and environment lookup.
    pub fn load_with(paths: ConfigPaths, env: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut configs: Vec<Value> = Vec::new();
        let mut sources = Vec::new();

        // Tier 1: Defaults (embedded)
        configs.push(serde_json::to_value(Config::default())?);

        if let Some(explicit) = &paths.explicit_file {
            // An explicit file must exist and parse
            let content = std::fs::read_to_string(explicit)
                .with_context(|| format!("Failed to read config file {}", explicit.display()))?;
            let value: Value = serde_yaml::from_str(&content)
                .with_context(|| format!("Failed to parse config file {}", explicit.display()))?;
            configs.push(value);
            sources.push(explicit.clone());
        } else {
            // Tier 2: Project config, Tier 3: User config
            for (tier, dir) in [
                (ConfigTier::Project, &paths.project_dir),
                (ConfigTier::User, &paths.user_dir),
            ] {
                if let Some(dir) = dir {
                    let file = dir.join(CONFIG_FILE);
                    if let Some(value) = read_tier(tier, &file) {
                        configs.push(value);
                        sources.push(file);
                    }
                }
            }
        }

        // Merge all configs
        let merged = deep_merge_all(configs);
        let mut config: Config = serde_json::from_value(merged)?;

        // Tier 4: Environment variable overrides
        Self::apply_env_overrides(&mut config, &env)?;

        config.validate()?;

        Ok(Self {
            paths,
            config,
            sources,
        })
    }

    /// Apply environment variable overrides to config.
    fn apply_env_overrides(config: &mut Config, env: &impl Fn(&str) -> Option<String>) -> Result<()> {
        if let Some(db_path) = env("AGENT_LIFECYCLE_DB_PATH") {
            config.database.path = PathBuf::from(db_path);
        }

        if let Some(raw) = env("AGENT_LIFECYCLE_AUTO_REGISTER") {
            config.resolver.auto_register_projects =
                parse_bool("AGENT_LIFECYCLE_AUTO_REGISTER", &raw)?;
        }

        if let Some(raw) = env("AGENT_LIFECYCLE_LOCK_TIMEOUT_MS") {
            config.locks.timeout_ms = raw.trim().parse().map_err(|_| {
                anyhow!("AGENT_LIFECYCLE_LOCK_TIMEOUT_MS must be an integer, got '{}'", raw)
            })?;
        }

        Ok(())
    }

    /// Get the loaded configuration.
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Get mutable access to the configuration.
    pub fn config_mut(&mut self) -> &mut Config {
        &mut self.config
    }

    /// Consume the loader and return the configuration.
    pub fn into_config(self) -> Config {
        self.config
    }

    /// Config files that were merged, lowest tier first.
    pub fn sources(&self) -> &[PathBuf] {
        &self.sources
    }
}
