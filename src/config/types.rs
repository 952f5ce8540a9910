//! Configuration types and structures.

use anyhow::{Result, anyhow};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Database settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// Path to the SQLite database file.
    #[serde(default = "default_db_path")]
    pub path: PathBuf,

    /// How long a statement waits for SQLite's write lock (default: 5000).
    #[serde(default = "default_query_timeout_ms")]
    pub query_timeout_ms: u64,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
            query_timeout_ms: default_query_timeout_ms(),
        }
    }
}

impl DatabaseConfig {
    pub fn query_timeout(&self) -> Duration {
        Duration::from_millis(self.query_timeout_ms)
    }
}

fn default_db_path() -> PathBuf {
    PathBuf::from(".agent-lifecycle/lifecycle.db")
}

fn default_query_timeout_ms() -> u64 {
    5_000
}

/// Per-agent lock settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LocksConfig {
    /// Maximum wait for a blocking acquisition (default: 5000).
    #[serde(default = "default_lock_timeout_ms")]
    pub timeout_ms: u64,

    /// Lease length; a crashed holder blocks the agent at most this long (default: 60000).
    #[serde(default = "default_lease_ms")]
    pub lease_ms: u64,

    /// Delay between acquisition attempts while blocking (default: 25).
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
}

impl Default for LocksConfig {
    fn default() -> Self {
        Self {
            timeout_ms: default_lock_timeout_ms(),
            lease_ms: default_lease_ms(),
            poll_interval_ms: default_poll_interval_ms(),
        }
    }
}

fn default_lock_timeout_ms() -> u64 {
    5_000
}

fn default_lease_ms() -> u64 {
    60_000
}

fn default_poll_interval_ms() -> u64 {
    25
}

/// Session resolver policy.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ResolverConfig {
    /// Create a project at the working directory when no registered project
    /// contains it. When false such sessions are rejected.
    #[serde(default)]
    pub auto_register_projects: bool,
}

/// Intent classifier pattern lists. Patterns are regular expressions matched
/// case-insensitively against trimmed agent text.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClassifierConfig {
    #[serde(default = "default_question_patterns")]
    pub question_patterns: Vec<String>,

    #[serde(default = "default_completion_patterns")]
    pub completion_patterns: Vec<String>,
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        Self {
            question_patterns: default_question_patterns(),
            completion_patterns: default_completion_patterns(),
        }
    }
}

fn default_question_patterns() -> Vec<String> {
    [
        r"\bshould i\b",
        r"\bwould you like\b",
        r"\bdo you want\b",
        r"^which\b",
        r"\blet me know\b",
        r"\bwaiting for your input\b",
        r"\bneeds your permission\b",
    ]
    .into_iter()
    .map(String::from)
    .collect()
}

fn default_completion_patterns() -> Vec<String> {
    [r"\b(done|complete|completed|finished)\b", r"\bready for\b"]
        .into_iter()
        .map(String::from)
        .collect()
}

/// Stale-agent reaping.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReaperConfig {
    /// Agents not seen for this long are ended (default: 3600).
    #[serde(default = "default_inactivity_timeout_secs")]
    pub inactivity_timeout_secs: u64,

    /// How often `serve` runs a reaping pass (default: 60).
    #[serde(default = "default_reaper_interval_secs")]
    pub interval_secs: u64,
}

impl Default for ReaperConfig {
    fn default() -> Self {
        Self {
            inactivity_timeout_secs: default_inactivity_timeout_secs(),
            interval_secs: default_reaper_interval_secs(),
        }
    }
}

impl ReaperConfig {
    pub fn inactivity_timeout(&self) -> Duration {
        Duration::from_secs(self.inactivity_timeout_secs)
    }

    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }
}

fn default_inactivity_timeout_secs() -> u64 {
    3_600
}

fn default_reaper_interval_secs() -> u64 {
    60
}

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub locks: LocksConfig,
    #[serde(default)]
    pub resolver: ResolverConfig,
    #[serde(default)]
    pub classifier: ClassifierConfig,
    #[serde(default)]
    pub reaper: ReaperConfig,
}

impl Config {
    /// Load configuration from a single file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        // Empty or comment-only files parse as null
        let config: Option<Config> = serde_yaml::from_str(&content)?;
        Ok(config.unwrap_or_default())
    }

    /// Check values that deserialize fine but cannot work.
    pub fn validate(&self) -> Result<()> {
        if self.locks.timeout_ms == 0 {
            return Err(anyhow!("locks.timeout_ms must be greater than zero"));
        }
        if self.locks.lease_ms <= self.locks.timeout_ms {
            return Err(anyhow!(
                "locks.lease_ms ({}) must exceed locks.timeout_ms ({})",
                self.locks.lease_ms,
                self.locks.timeout_ms
            ));
        }
        if self.locks.poll_interval_ms == 0 {
            return Err(anyhow!("locks.poll_interval_ms must be greater than zero"));
        }
        if self.reaper.interval_secs == 0 {
            return Err(anyhow!("reaper.interval_secs must be greater than zero"));
        }
        for (kind, patterns) in [
            ("question", &self.classifier.question_patterns),
            ("completion", &self.classifier.completion_patterns),
        ] {
            for pattern in patterns {
                regex_lite::Regex::new(pattern).map_err(|e| {
                    anyhow!("Invalid classifier {} pattern '{}': {}", kind, pattern, e)
                })?;
            }
        }
        Ok(())
    }
}
