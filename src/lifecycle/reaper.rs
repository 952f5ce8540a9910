//! Stale-agent reaping.
//!
//! Maintenance never waits on live traffic: each agent is locked in
//! non-blocking mode and a contended agent is left for the next pass.

use super::orchestrator::Lifecycle;
use crate::db::now_ms;
use crate::error::LockError;
use anyhow::Result;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Outcome of one reaping pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReapReport {
    /// Agents ended by this pass.
    pub reaped: Vec<i64>,
    /// Agents whose lock was held elsewhere; retried next pass.
    pub deferred: Vec<i64>,
    /// Agents that were seen again or ended before their lock was taken.
    pub skipped: Vec<i64>,
    /// Agents that could not be ended because of a store error.
    pub failed: Vec<i64>,
    /// Expired lock leases removed.
    pub purged_leases: usize,
}

impl ReapReport {
    pub fn is_empty(&self) -> bool {
        self.reaped.is_empty()
            && self.deferred.is_empty()
            && self.skipped.is_empty()
            && self.failed.is_empty()
            && self.purged_leases == 0
    }
}

enum Outcome {
    Reaped,
    Skipped,
}

impl Lifecycle {
    /// End alive agents not seen for `inactivity`, finishing any active task
    /// with an end-of-task transition.
    pub fn reap_stale_agents(&self, inactivity: Duration) -> Result<ReapReport> {
        let window = i64::try_from(inactivity.as_millis()).unwrap_or(i64::MAX);
        let cutoff = now_ms().saturating_sub(window);
        let stale = self.db().get_stale_agents(cutoff)?;
        let mut report = ReapReport::default();

        for candidate in stale {
            let agent_id = candidate.id;
            let outcome = self.try_with_agent_lock(agent_id, || -> Result<Outcome> {
                // Re-read inside the lock: the agent may have been seen or
                // ended since the candidate list was built.
                let agent = match self.db().get_agent(agent_id)? {
                    Some(agent) if agent.is_alive() && agent.last_seen_at < cutoff => agent,
                    _ => return Ok(Outcome::Skipped),
                };
                self.end_agent_locked(&agent, None)?;
                Ok(Outcome::Reaped)
            });

            match outcome {
                Ok(Ok(Outcome::Reaped)) => {
                    info!(agent_id, last_seen_at = candidate.last_seen_at, "Reaped stale agent");
                    report.reaped.push(agent_id);
                }
                Ok(Ok(Outcome::Skipped)) => report.skipped.push(agent_id),
                Ok(Err(e)) => {
                    error!(agent_id, error = %format!("{:#}", e), "Failed to reap agent");
                    report.failed.push(agent_id);
                }
                Err(LockError::Contended { holder, .. }) => {
                    debug!(agent_id, holder = ?holder, "Agent busy; deferring reap");
                    report.deferred.push(agent_id);
                }
                Err(e) => {
                    warn!(agent_id, error = %e, "Could not lock agent for reaping");
                    report.failed.push(agent_id);
                }
            }
        }

        report.purged_leases = self.db().purge_expired_agent_leases()?;

        if !report.is_empty() {
            info!(
                reaped = report.reaped.len(),
                deferred = report.deferred.len(),
                skipped = report.skipped.len(),
                failed = report.failed.len(),
                purged_leases = report.purged_leases,
                "Reap pass finished"
            );
        }
        Ok(report)
    }
}

/// Run reaping passes every `interval` until the task is dropped.
pub async fn run_reaper(lifecycle: Arc<Lifecycle>, interval: Duration, inactivity: Duration) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    // The first tick completes immediately
    ticker.tick().await;

    loop {
        ticker.tick().await;
        let lc = Arc::clone(&lifecycle);
        match tokio::task::spawn_blocking(move || lc.reap_stale_agents(inactivity)).await {
            Ok(Ok(_)) => {}
            Ok(Err(e)) => error!(error = %format!("{:#}", e), "Reap pass failed"),
            Err(e) => error!(error = %e, "Reap task panicked"),
        }
    }
}
