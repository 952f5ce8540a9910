//! Project registration and lookup.

use super::{Database, normalize_path, now_ms, path_is_within};
use crate::types::Project;
use anyhow::{Result, anyhow};
use rusqlite::{Connection, OptionalExtension, Row, params};

fn parse_project_row(row: &Row) -> rusqlite::Result<Project> {
    Ok(Project {
        id: row.get(0)?,
        path: row.get(1)?,
        name: row.get(2)?,
        created_at: row.get(3)?,
    })
}

/// Default display name: the last path component, or the path itself.
fn default_name(path: &str) -> String {
    path.rsplit('/')
        .find(|part| !part.is_empty())
        .unwrap_or(path)
        .to_string()
}

pub(crate) fn get_project_by_path_internal(conn: &Connection, path: &str) -> Result<Option<Project>> {
    let project = conn
        .query_row(
            "SELECT id, path, name, created_at FROM projects WHERE path = ?1",
            params![path],
            parse_project_row,
        )
        .optional()?;
    Ok(project)
}

/// Find the registered project with the longest path containing `path`.
pub(crate) fn find_project_for_path_internal(conn: &Connection, path: &str) -> Result<Option<Project>> {
    let mut stmt = conn.prepare("SELECT id, path, name, created_at FROM projects")?;
    let best = stmt
        .query_map([], parse_project_row)?
        .collect::<rusqlite::Result<Vec<_>>>()?
        .into_iter()
        .filter(|p| path_is_within(path, &p.path))
        .max_by_key(|p| p.path.len());
    Ok(best)
}

/// Insert a project unless one already exists at `path`; return the stored row.
pub(crate) fn ensure_project_internal(
    conn: &Connection,
    path: &str,
    name: Option<&str>,
) -> Result<Project> {
    let name = name.map(str::to_string).unwrap_or_else(|| default_name(path));
    conn.execute(
        "INSERT INTO projects (path, name, created_at) VALUES (?1, ?2, ?3)
         ON CONFLICT(path) DO NOTHING",
        params![path, name, now_ms()],
    )?;
    get_project_by_path_internal(conn, path)?
        .ok_or_else(|| anyhow!("Project {} vanished after insert", path))
}

impl Database {
    /// Register a project root. Registering an existing path returns the
    /// existing project unchanged.
    pub fn register_project(&self, path: &str, name: Option<&str>) -> Result<Project> {
        let path = normalize_path(path);
        if path.is_empty() {
            return Err(anyhow!("Project path cannot be empty"));
        }
        self.with_conn(|conn| ensure_project_internal(conn, &path, name))
    }

    /// Get a project by ID.
    pub fn get_project(&self, project_id: i64) -> Result<Option<Project>> {
        self.with_conn(|conn| {
            let project = conn
                .query_row(
                    "SELECT id, path, name, created_at FROM projects WHERE id = ?1",
                    params![project_id],
                    parse_project_row,
                )
                .optional()?;
            Ok(project)
        })
    }

    /// Get a project by exact (normalized) path.
    pub fn get_project_by_path(&self, path: &str) -> Result<Option<Project>> {
        let path = normalize_path(path);
        self.with_conn(|conn| get_project_by_path_internal(conn, &path))
    }

    /// Resolve a working directory to the project with the longest matching
    /// path prefix.
    pub fn find_project_for_path(&self, working_directory: &str) -> Result<Option<Project>> {
        let path = normalize_path(working_directory);
        self.with_conn(|conn| find_project_for_path_internal(conn, &path))
    }

    /// List all projects ordered by path.
    pub fn list_projects(&self) -> Result<Vec<Project>> {
        self.with_conn(|conn| {
            let mut stmt =
                conn.prepare("SELECT id, path, name, created_at FROM projects ORDER BY path")?;
            let projects = stmt
                .query_map([], parse_project_row)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(projects)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_name_is_last_component() {
        assert_eq!(default_name("/work/app"), "app");
        assert_eq!(default_name("/"), "/");
        assert_eq!(default_name("relative"), "relative");
    }

    #[test]
    fn longest_prefix_wins() {
        let db = Database::open_in_memory().unwrap();
        db.register_project("/work", None).unwrap();
        let inner = db.register_project("/work/app/", Some("App")).unwrap();
        assert_eq!(inner.path, "/work/app");
        assert_eq!(inner.name, "App");

        let found = db.find_project_for_path("/work/app/src/ui").unwrap().unwrap();
        assert_eq!(found.id, inner.id);

        let outer = db.find_project_for_path("/work/other").unwrap().unwrap();
        assert_eq!(outer.path, "/work");

        assert!(db.find_project_for_path("/elsewhere").unwrap().is_none());
    }

    #[test]
    fn registering_twice_returns_existing() {
        let db = Database::open_in_memory().unwrap();
        let first = db.register_project("/work/app", Some("First")).unwrap();
        let second = db.register_project("/work/app", Some("Second")).unwrap();
        assert_eq!(first.id, second.id);
        assert_eq!(second.name, "First");
        assert_eq!(db.list_projects().unwrap().len(), 1);
    }
}
