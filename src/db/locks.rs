//! Per-agent lease rows backing the exclusion lock.
//!
//! Every statement here runs on the dedicated lock connection in autocommit
//! mode, so a lease never belongs to a transaction on the work connection.

use super::{Database, now_ms};
use anyhow::Result;
use rusqlite::{OptionalExtension, params};
use serde::{Deserialize, Serialize};

/// A held (or expired but not yet purged) agent lease.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentLease {
    pub agent_id: i64,
    pub holder: String,
    pub acquired_at: i64,
    pub expires_at: i64,
}

impl AgentLease {
    pub fn is_expired_at(&self, now: i64) -> bool {
        self.expires_at <= now
    }
}

impl Database {
    /// Try to take the lease for `agent_id`. Succeeds if no lease exists or
    /// the existing one has expired. Returns whether `holder` now owns it.
    pub fn try_acquire_agent_lease(&self, agent_id: i64, holder: &str, lease_ms: i64) -> Result<bool> {
        let now = now_ms();
        self.with_lock_conn(|conn| {
            let changed = conn.execute(
                "INSERT INTO agent_locks (agent_id, holder, acquired_at, expires_at)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(agent_id) DO UPDATE SET
                     holder = excluded.holder,
                     acquired_at = excluded.acquired_at,
                     expires_at = excluded.expires_at
                 WHERE agent_locks.expires_at <= ?3",
                params![agent_id, holder, now, now + lease_ms],
            )?;
            Ok(changed == 1)
        })
    }

    /// Release the lease if `holder` still owns it.
    pub fn release_agent_lease(&self, agent_id: i64, holder: &str) -> Result<bool> {
        self.with_lock_conn(|conn| {
            let deleted = conn.execute(
                "DELETE FROM agent_locks WHERE agent_id = ?1 AND holder = ?2",
                params![agent_id, holder],
            )?;
            Ok(deleted > 0)
        })
    }

    /// Current lease row for an agent, expired or not.
    pub fn get_agent_lease(&self, agent_id: i64) -> Result<Option<AgentLease>> {
        self.with_lock_conn(|conn| {
            let lease = conn
                .query_row(
                    "SELECT agent_id, holder, acquired_at, expires_at FROM agent_locks WHERE agent_id = ?1",
                    params![agent_id],
                    |row| {
                        Ok(AgentLease {
                            agent_id: row.get(0)?,
                            holder: row.get(1)?,
                            acquired_at: row.get(2)?,
                            expires_at: row.get(3)?,
                        })
                    },
                )
                .optional()?;
            Ok(lease)
        })
    }

    /// Delete expired leases. Returns the number removed.
    pub fn purge_expired_agent_leases(&self) -> Result<usize> {
        let now = now_ms();
        self.with_lock_conn(|conn| {
            let deleted = conn.execute(
                "DELETE FROM agent_locks WHERE expires_at <= ?1",
                params![now],
            )?;
            Ok(deleted)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lease_is_exclusive_until_released() {
        let db = Database::open_in_memory().unwrap();

        assert!(db.try_acquire_agent_lease(1, "a", 60_000).unwrap());
        assert!(!db.try_acquire_agent_lease(1, "b", 60_000).unwrap());
        // A different agent is independent
        assert!(db.try_acquire_agent_lease(2, "b", 60_000).unwrap());

        assert!(!db.release_agent_lease(1, "b").unwrap());
        assert!(db.release_agent_lease(1, "a").unwrap());
        assert!(db.try_acquire_agent_lease(1, "b", 60_000).unwrap());
        assert_eq!(db.get_agent_lease(1).unwrap().unwrap().holder, "b");
    }

    #[test]
    fn expired_lease_can_be_taken_over() {
        let db = Database::open_in_memory().unwrap();

        assert!(db.try_acquire_agent_lease(1, "crashed", -1).unwrap());
        assert!(db.get_agent_lease(1).unwrap().unwrap().is_expired_at(now_ms()));
        assert!(db.try_acquire_agent_lease(1, "next", 60_000).unwrap());
        assert_eq!(db.get_agent_lease(1).unwrap().unwrap().holder, "next");
    }

    #[test]
    fn purge_removes_only_expired() {
        let db = Database::open_in_memory().unwrap();

        db.try_acquire_agent_lease(1, "old", -1).unwrap();
        db.try_acquire_agent_lease(2, "live", 60_000).unwrap();

        assert_eq!(db.purge_expired_agent_leases().unwrap(), 1);
        assert!(db.get_agent_lease(1).unwrap().is_none());
        assert!(db.get_agent_lease(2).unwrap().is_some());
    }
}
