//! Project subcommands
//!
//! Projects are the working-directory roots agents are correlated under.

use anyhow::{Context, Result};
use clap::Subcommand;
use std::path::{Path, PathBuf};

#[derive(Subcommand, Debug)]
pub enum ProjectCommand {
    /// Register a project root
    Add {
        /// Project root directory (default: current directory)
        #[arg(value_name = "PATH")]
        path: Option<PathBuf>,

        /// Display name (default: last path component)
        #[arg(long)]
        name: Option<String>,
    },

    /// List registered projects
    List,
}

/// Absolute form of `path`, resolving symlinks when the path exists.
pub fn absolute_path(path: &Path) -> Result<String> {
    let absolute = match std::fs::canonicalize(path) {
        Ok(canonical) => canonical,
        Err(_) => std::path::absolute(path)
            .with_context(|| format!("Cannot make {} absolute", path.display()))?,
    };
    Ok(absolute.to_string_lossy().into_owned())
}

/// Path argument or the current directory.
pub fn path_or_cwd(path: Option<&Path>) -> Result<String> {
    match path {
        Some(path) => absolute_path(path),
        None => {
            let cwd = std::env::current_dir().context("Cannot read current directory")?;
            absolute_path(&cwd)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn existing_paths_are_canonicalized() {
        let dir = tempfile::tempdir().unwrap();
        let nested = dir.path().join("app");
        std::fs::create_dir(&nested).unwrap();
        let through_dots = dir.path().join("app").join("..").join("app");

        let resolved = absolute_path(&through_dots).unwrap();
        assert_eq!(resolved, absolute_path(&nested).unwrap());
        assert!(!resolved.contains(".."));
    }

    #[test]
    fn missing_paths_are_still_absolute() {
        let resolved = absolute_path(Path::new("not-a-real-dir-xyz")).unwrap();
        assert!(Path::new(&resolved).is_absolute());
        assert!(resolved.ends_with("not-a-real-dir-xyz"));
    }
}
