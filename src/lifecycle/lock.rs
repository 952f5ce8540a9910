//! Per-agent exclusion lock.
//!
//! One lock namespace keyed by agent id. The lock is a lease row written on
//! the store's dedicated lock connection, so it is visible to every process
//! sharing the database file and stays held across commits on the work
//! connection.
//!
//! A thread may hold at most one agent lock at a time. Asking for a second
//! one fails with [`LockError::Nested`] instead of risking a deadlock.

use crate::config::LocksConfig;
use crate::db::Database;
use crate::error::LockError;
use std::cell::Cell;
use std::marker::PhantomData;
use std::time::{Duration, Instant};
use tracing::{debug, warn};
use uuid::Uuid;

/// How to wait for a lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockMode {
    /// Poll until acquired or the timeout elapses.
    Blocking(Duration),
    /// Fail immediately if another holder has it.
    NonBlocking,
}

/// Lock timing parameters.
#[derive(Debug, Clone, Copy)]
pub struct LockSettings {
    /// Default wait for blocking acquisition.
    pub timeout: Duration,
    /// Lease length. A holder that crashes blocks others for at most this long.
    pub lease: Duration,
    pub poll_interval: Duration,
}

impl Default for LockSettings {
    fn default() -> Self {
        Self {
            timeout: Duration::from_millis(5000),
            lease: Duration::from_millis(60_000),
            poll_interval: Duration::from_millis(25),
        }
    }
}

impl From<&LocksConfig> for LockSettings {
    fn from(config: &LocksConfig) -> Self {
        Self {
            timeout: Duration::from_millis(config.timeout_ms),
            lease: Duration::from_millis(config.lease_ms),
            poll_interval: Duration::from_millis(config.poll_interval_ms),
        }
    }
}

thread_local! {
    static HELD: Cell<Option<i64>> = const { Cell::new(None) };
}

/// Lock manager for agent ids.
#[derive(Clone)]
pub struct AgentLocks {
    db: Database,
    settings: LockSettings,
    pid: u32,
}

impl AgentLocks {
    pub fn new(db: Database, settings: LockSettings) -> Self {
        Self {
            db,
            settings,
            pid: std::process::id(),
        }
    }

    pub fn settings(&self) -> &LockSettings {
        &self.settings
    }

    /// Blocking mode with the configured timeout.
    pub fn blocking(&self) -> LockMode {
        LockMode::Blocking(self.settings.timeout)
    }

    /// Acquire the lock for `agent_id`, returning a guard that releases it on drop.
    pub fn acquire(&self, agent_id: i64, mode: LockMode) -> Result<AgentLockGuard<'_>, LockError> {
        if let Some(held) = HELD.with(Cell::get) {
            return Err(LockError::Nested {
                held,
                requested: agent_id,
            });
        }

        let holder = format!("{}:{}", self.pid, Uuid::now_v7());
        let lease_ms = self.settings.lease.as_millis() as i64;
        let started = Instant::now();

        loop {
            let acquired = self
                .db
                .try_acquire_agent_lease(agent_id, &holder, lease_ms)
                .map_err(|e| LockError::store(agent_id, e))?;

            if acquired {
                HELD.with(|h| h.set(Some(agent_id)));
                debug!(agent_id, holder = %holder, waited_ms = started.elapsed().as_millis() as u64, "Agent lock acquired");
                return Ok(AgentLockGuard {
                    locks: self,
                    agent_id,
                    holder,
                    _thread_bound: PhantomData,
                });
            }

            match mode {
                LockMode::NonBlocking => {
                    let current = self
                        .db
                        .get_agent_lease(agent_id)
                        .ok()
                        .flatten()
                        .map(|lease| lease.holder);
                    debug!(agent_id, holder = ?current, "Agent lock contended");
                    return Err(LockError::Contended {
                        agent_id,
                        holder: current,
                    });
                }
                LockMode::Blocking(timeout) => {
                    let waited = started.elapsed();
                    if waited >= timeout {
                        debug!(agent_id, waited_ms = waited.as_millis() as u64, "Agent lock timed out");
                        return Err(LockError::Timeout { agent_id, waited });
                    }
                    std::thread::sleep(self.settings.poll_interval.min(timeout - waited));
                }
            }
        }
    }

    /// Run `f` while holding the lock for `agent_id`. The lock is released when
    /// `f` returns or panics.
    pub fn with_agent_lock<T>(
        &self,
        agent_id: i64,
        mode: LockMode,
        f: impl FnOnce() -> T,
    ) -> Result<T, LockError> {
        let _guard = self.acquire(agent_id, mode)?;
        Ok(f())
    }

    /// Agent id locked by the current thread, if any.
    pub fn held_by_current_thread() -> Option<i64> {
        HELD.with(Cell::get)
    }
}

/// Releases the agent lock when dropped. Not `Send`: the held-lock marker
/// is per thread.
pub struct AgentLockGuard<'a> {
    locks: &'a AgentLocks,
    agent_id: i64,
    holder: String,
    _thread_bound: PhantomData<*const ()>,
}

impl AgentLockGuard<'_> {
    pub fn agent_id(&self) -> i64 {
        self.agent_id
    }

    pub fn holder(&self) -> &str {
        &self.holder
    }
}

impl Drop for AgentLockGuard<'_> {
    fn drop(&mut self) {
        HELD.with(|h| h.set(None));
        match self.locks.db.release_agent_lease(self.agent_id, &self.holder) {
            Ok(true) => debug!(agent_id = self.agent_id, "Agent lock released"),
            Ok(false) => warn!(
                agent_id = self.agent_id,
                holder = %self.holder,
                "Agent lock lease was lost before release"
            ),
            Err(e) => warn!(
                agent_id = self.agent_id,
                error = %e,
                "Failed to release agent lock; it will expire with its lease"
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn locks(timeout_ms: u64) -> AgentLocks {
        let db = Database::open_in_memory().unwrap();
        AgentLocks::new(
            db,
            LockSettings {
                timeout: Duration::from_millis(timeout_ms),
                lease: Duration::from_secs(60),
                poll_interval: Duration::from_millis(5),
            },
        )
    }

    #[test]
    fn guard_releases_on_drop() {
        let locks = locks(50);
        {
            let guard = locks.acquire(1, LockMode::NonBlocking).unwrap();
            assert_eq!(guard.agent_id(), 1);
            assert_eq!(AgentLocks::held_by_current_thread(), Some(1));
        }
        assert_eq!(AgentLocks::held_by_current_thread(), None);
        assert!(locks.db.get_agent_lease(1).unwrap().is_none());
    }

    #[test]
    fn nested_acquire_is_refused() {
        let locks = locks(50);
        let result = locks.with_agent_lock(1, LockMode::NonBlocking, || {
            locks.acquire(2, LockMode::NonBlocking).map(|_| ())
        });
        match result.unwrap() {
            Err(LockError::Nested { held, requested }) => {
                assert_eq!(held, 1);
                assert_eq!(requested, 2);
            }
            other => panic!("expected nested error, got {:?}", other.map(|_| ())),
        }
        // Outer lock was still released
        assert!(locks.db.get_agent_lease(1).unwrap().is_none());
    }

    #[test]
    fn contended_and_timeout() {
        let locks = locks(30);
        // A foreign holder, as if from another process
        assert!(locks.db.try_acquire_agent_lease(5, "999:other", 60_000).unwrap());

        match locks.acquire(5, LockMode::NonBlocking) {
            Err(LockError::Contended { agent_id, holder }) => {
                assert_eq!(agent_id, 5);
                assert_eq!(holder.as_deref(), Some("999:other"));
            }
            Err(e) => panic!("unexpected error: {e}"),
            Ok(_) => panic!("lock should be contended"),
        }

        let started = Instant::now();
        match locks.acquire(5, locks.blocking()) {
            Err(LockError::Timeout { agent_id, waited }) => {
                assert_eq!(agent_id, 5);
                assert!(waited >= Duration::from_millis(30));
            }
            Err(e) => panic!("unexpected error: {e}"),
            Ok(_) => panic!("lock should time out"),
        }
        assert!(started.elapsed() >= Duration::from_millis(30));
        assert_eq!(AgentLocks::held_by_current_thread(), None);
    }

    #[test]
    fn released_on_panic() {
        let locks = locks(50);
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            locks.with_agent_lock::<()>(3, LockMode::NonBlocking, || panic!("boom"))
        }));
        assert!(result.is_err());
        assert!(locks.db.get_agent_lease(3).unwrap().is_none());
        assert_eq!(AgentLocks::held_by_current_thread(), None);
    }
}
