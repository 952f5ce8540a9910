//! Unified configuration system.
//!
//! Consolidates configuration from four tiers with field-by-field YAML merging:
//! 1. **Defaults** - compiled in
//! 2. **Project** - `$CWD/.agent-lifecycle/config.yaml`
//! 3. **User** - `~/.agent-lifecycle/config.yaml`
//! 4. **Environment** - variables listed below
//!
//! ## Environment Variables
//! - `AGENT_LIFECYCLE_CONFIG_PATH` - Explicit config file (replaces project and user tiers)
//! - `AGENT_LIFECYCLE_DB_PATH` - Database path
//! - `AGENT_LIFECYCLE_AUTO_REGISTER` - Auto-register unknown project directories
//! - `AGENT_LIFECYCLE_LOCK_TIMEOUT_MS` - Blocking lock timeout
//! - `AGENT_LIFECYCLE_USER_DIR` - User config dir (default: `~/.agent-lifecycle`)
//! - `AGENT_LIFECYCLE_PROJECT_DIR` - Project config dir (default: `./.agent-lifecycle`)

mod loader;
mod merge;
mod types;
pub mod watcher;

pub use loader::{CONFIG_FILE, ConfigLoader, ConfigPaths, ConfigTier};
pub use merge::{deep_merge, deep_merge_all};
pub use types::*;
