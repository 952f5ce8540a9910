//! SQLite store for projects, agents, tasks, turns and the transition log.

pub mod agents;
pub mod locks;
pub mod projects;
pub mod tasks;
pub mod transitions;

use crate::types::{Actor, Intent, TaskState};
use anyhow::Result;
use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSql, ToSqlOutput, ValueRef};
use rusqlite::Connection;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

mod embedded {
    use refinery::embed_migrations;
    embed_migrations!("migrations");
}

/// Default bound on how long a statement waits for SQLite's write lock.
pub const DEFAULT_QUERY_TIMEOUT: Duration = Duration::from_millis(5000);

/// Database handle.
///
/// Holds a work connection for reads and atomic writes, and a dedicated lock
/// connection that only touches the `agent_locks` table. A lock taken on the
/// lock connection stays held across any number of commits on the work
/// connection.
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
    lock_conn: Arc<Mutex<Connection>>,
}

impl Database {
    /// Open or create the database at the given path.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        Self::open_with_timeout(path, DEFAULT_QUERY_TIMEOUT)
    }

    /// Open or create the database with an explicit query timeout.
    pub fn open_with_timeout<P: AsRef<Path>>(path: P, query_timeout: Duration) -> Result<Self> {
        let path = path.as_ref();
        let conn = open_file_connection(path, query_timeout)?;
        let lock_conn = open_file_connection(path, query_timeout)?;

        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
            lock_conn: Arc::new(Mutex::new(lock_conn)),
        };

        db.run_migrations()?;

        Ok(db)
    }

    /// Open an in-memory database (for testing).
    ///
    /// Both handles share one connection, since a second connection would see
    /// a different in-memory database.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;

        conn.execute_batch("PRAGMA foreign_keys=ON;")?;

        let conn = Arc::new(Mutex::new(conn));
        let db = Self {
            conn: Arc::clone(&conn),
            lock_conn: conn,
        };

        db.run_migrations()?;

        Ok(db)
    }

    /// Run database migrations.
    fn run_migrations(&self) -> Result<()> {
        let mut conn = self.conn.lock().unwrap();
        embedded::migrations::runner().run(&mut *conn)?;
        Ok(())
    }

    /// Execute a function with exclusive access to the connection.
    pub fn with_conn<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Connection) -> Result<T>,
    {
        let conn = self.conn.lock().unwrap();
        f(&conn)
    }

    /// Execute a function with mutable access to the connection (for transactions).
    pub fn with_conn_mut<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut Connection) -> Result<T>,
    {
        let mut conn = self.conn.lock().unwrap();
        f(&mut conn)
    }

    /// Execute a function on the dedicated lock connection.
    pub(crate) fn with_lock_conn<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Connection) -> Result<T>,
    {
        let conn = self.lock_conn.lock().unwrap();
        f(&conn)
    }
}

fn open_file_connection(path: &Path, query_timeout: Duration) -> Result<Connection> {
    let conn = Connection::open(path)?;

    // WAL lets readers proceed while another process holds the write lock
    conn.execute_batch(
        "PRAGMA journal_mode=WAL;
         PRAGMA foreign_keys=ON;",
    )?;
    conn.busy_timeout(query_timeout)?;

    Ok(conn)
}

/// Get the current timestamp in milliseconds.
pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Normalize a working-directory path: trailing slashes are dropped, and a
/// path made only of slashes becomes `/`.
pub fn normalize_path(path: &str) -> String {
    let trimmed = path.trim_end_matches('/');
    if trimmed.is_empty() && path.starts_with('/') {
        "/".to_string()
    } else {
        trimmed.to_string()
    }
}

/// True if `path` is `root` itself or lies underneath it. Both arguments
/// must already be normalized.
pub fn path_is_within(path: &str, root: &str) -> bool {
    if root == "/" {
        return path.starts_with('/');
    }
    path == root
        || path
            .strip_prefix(root)
            .is_some_and(|rest| rest.starts_with('/'))
}

macro_rules! sql_text_enum {
    ($ty:ty, $name:literal) => {
        impl ToSql for $ty {
            fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
                Ok(ToSqlOutput::from(self.as_str()))
            }
        }

        impl FromSql for $ty {
            fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
                let s = value.as_str()?;
                <$ty>::from_str(s).ok_or_else(|| {
                    FromSqlError::Other(format!("unknown {} '{}'", $name, s).into())
                })
            }
        }
    };
}

sql_text_enum!(Actor, "actor");
sql_text_enum!(Intent, "intent");
sql_text_enum!(TaskState, "task state");
