//! Notification processing.
//!
//! `Lifecycle::process` is the only path that mutates task and turn state:
//! resolve the agent, take its lock, re-read the active task, classify,
//! validate, apply in one transaction, publish, release.

use super::classifier::IntentClassifier;
use super::lock::{AgentLocks, LockMode, LockSettings};
use super::resolver::{ResolveRequest, Resolution, SessionResolver};
use super::validator::{Validation, validate};
use crate::config::Config;
use crate::db::Database;
use crate::db::tasks::TransitionWrite;
use crate::error::{ProcessError, ProcessingResult};
use crate::types::{
    Actor, Agent, Intent, Notification, NotificationKind, Processed, TaskState, TransitionRecord,
};
use anyhow::Result;
use arc_swap::ArcSwap;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, error, info, info_span, warn};

/// Buffered transitions per subscriber before the slowest one lags.
pub const BROADCAST_CAPACITY: usize = 1024;

/// An agent can end between resolution and lock acquisition. Resolution is
/// retried this many times before giving up.
const RESOLVE_ATTEMPTS: usize = 3;

/// Construction parameters for [`Lifecycle`].
#[derive(Debug, Clone, Default)]
pub struct LifecycleOptions {
    pub locks: LockSettings,
    pub auto_register_projects: bool,
    pub classifier: IntentClassifier,
}

impl LifecycleOptions {
    pub fn from_config(config: &Config) -> Result<Self> {
        Ok(Self {
            locks: LockSettings::from(&config.locks),
            auto_register_projects: config.resolver.auto_register_projects,
            classifier: IntentClassifier::from_config(&config.classifier)?,
        })
    }
}

/// A turn to apply under the agent lock.
struct TurnInput<'a> {
    actor: Actor,
    text: Option<&'a str>,
    /// Skip classification and use this intent.
    intent: Option<Intent>,
    occurred_at: Option<i64>,
    end_agent: bool,
}

/// Lifecycle orchestrator.
pub struct Lifecycle {
    db: Database,
    resolver: SessionResolver,
    locks: AgentLocks,
    classifier: ArcSwap<IntentClassifier>,
    transitions: broadcast::Sender<TransitionRecord>,
}

impl Lifecycle {
    pub fn new(db: Database, options: LifecycleOptions) -> Self {
        let (transitions, _) = broadcast::channel(BROADCAST_CAPACITY);
        Self {
            resolver: SessionResolver::new(db.clone(), options.auto_register_projects),
            locks: AgentLocks::new(db.clone(), options.locks),
            classifier: ArcSwap::from_pointee(options.classifier),
            db,
            transitions,
        }
    }

    pub fn from_config(db: Database, config: &Config) -> Result<Self> {
        Ok(Self::new(db, LifecycleOptions::from_config(config)?))
    }

    pub fn db(&self) -> &Database {
        &self.db
    }

    pub fn resolver(&self) -> &SessionResolver {
        &self.resolver
    }

    pub fn locks(&self) -> &AgentLocks {
        &self.locks
    }

    /// Receive every applied transition, per agent in lock-grant order.
    pub fn subscribe(&self) -> broadcast::Receiver<TransitionRecord> {
        self.transitions.subscribe()
    }

    /// Swap in a new classifier. In-flight notifications finish with the old one.
    pub fn set_classifier(&self, classifier: IntentClassifier) {
        self.classifier.store(Arc::new(classifier));
    }

    /// Apply the reloadable parts of `config`: classifier patterns and the
    /// project auto-registration policy. Lock timings need a restart.
    pub fn apply_config(&self, config: &Config) -> Result<()> {
        let classifier = IntentClassifier::from_config(&config.classifier)?;
        self.set_classifier(classifier);
        self.resolver
            .set_auto_register_projects(config.resolver.auto_register_projects);
        info!(
            auto_register_projects = config.resolver.auto_register_projects,
            "Lifecycle configuration reloaded"
        );
        Ok(())
    }

    /// Process one notification.
    pub fn process(&self, notification: &Notification) -> ProcessingResult {
        let span = info_span!("process", session_id = %notification.session_id);
        let _enter = span.enter();

        for attempt in 1..=RESOLVE_ATTEMPTS {
            let resolution = self.resolve(notification)?;
            match self.process_locked(notification, &resolution)? {
                Some(processed) => return Ok(processed),
                None => {
                    debug!(
                        agent_id = resolution.agent.id,
                        attempt, "Agent ended or was claimed before lock was acquired; resolving again"
                    );
                    self.resolver.forget(&notification.session_id);
                }
            }
        }

        let err = ProcessError::Store {
            agent_id: None,
            message: format!(
                "session kept resolving to ended or foreign agents after {} attempts",
                RESOLVE_ATTEMPTS
            ),
        };
        error!(error = %err, "Giving up on notification");
        Err(err)
    }

    fn resolve(&self, notification: &Notification) -> Result<Resolution, ProcessError> {
        let request = ResolveRequest {
            session_id: &notification.session_id,
            working_directory: &notification.working_directory,
            hints: &notification.hints,
            allow_new: !matches!(notification.kind, NotificationKind::SessionEnd),
        };
        self.resolver.resolve(&request).map_err(|e| {
            let err = ProcessError::unresolved(&notification.session_id, e);
            if err.is_retryable() {
                error!(error = %err, "Session resolution failed");
            } else {
                warn!(
                    working_directory = %notification.working_directory,
                    reason = %err,
                    "Unresolved session"
                );
            }
            err
        })
    }

    /// Handle a resolved notification under the agent lock. Returns `None`
    /// if, once the lock was held, the agent had ended or was bound to
    /// another session.
    fn process_locked(
        &self,
        notification: &Notification,
        resolution: &Resolution,
    ) -> Result<Option<Processed>, ProcessError> {
        let agent_id = resolution.agent.id;
        let _guard = self
            .locks
            .acquire(agent_id, self.locks.blocking())
            .map_err(|e| {
                let err = ProcessError::from(e);
                warn!(agent_id, error = %err, "Could not acquire agent lock");
                err
            })?;

        let agent = match self.db.get_agent(agent_id) {
            Ok(Some(agent)) if agent.is_alive() => agent,
            Ok(_) if matches!(notification.kind, NotificationKind::SessionEnd) => {
                // Duplicate session end
                return Ok(Some(Processed::SessionEnded {
                    agent_id,
                    transition: None,
                }));
            }
            Ok(_) => return Ok(None),
            Err(e) => return Err(self.store_error(agent_id, e)),
        };

        let agent = self
            .db
            .touch_agent(agent.id, Some(&notification.session_id))
            .map_err(|e| self.store_error(agent_id, e))?;
        if agent.session_id.as_deref() != Some(notification.session_id.as_str()) {
            // Another session bound it while we waited
            debug!(agent_id, owner = ?agent.session_id, "Agent belongs to another session");
            return Ok(None);
        }

        match &notification.kind {
            NotificationKind::SessionStart => {
                info!(agent_id, via = ?resolution.via, "Session started");
                Ok(Some(Processed::SessionStarted { agent_id }))
            }
            NotificationKind::Turn { actor, text } => {
                let transition = self.apply_turn(
                    &agent,
                    TurnInput {
                        actor: *actor,
                        text: text.as_deref(),
                        intent: None,
                        occurred_at: notification.occurred_at,
                        end_agent: false,
                    },
                )?;
                Ok(Some(Processed::Applied { transition }))
            }
            NotificationKind::SessionEnd => {
                let transition = self.end_agent_locked(&agent, notification.occurred_at)?;
                self.resolver.forget(&notification.session_id);
                info!(agent_id, "Session ended");
                Ok(Some(Processed::SessionEnded {
                    agent_id,
                    transition,
                }))
            }
        }
    }

    /// End an agent whose lock the caller holds. An active task is finished
    /// with an agent end-of-task transition in the same write.
    pub(crate) fn end_agent_locked(
        &self,
        agent: &Agent,
        occurred_at: Option<i64>,
    ) -> Result<Option<TransitionRecord>, ProcessError> {
        let active = self
            .db
            .get_active_task(agent.id)
            .map_err(|e| self.store_error(agent.id, e))?;

        let transition = if active.is_some() {
            Some(self.apply_turn(
                agent,
                TurnInput {
                    actor: Actor::Agent,
                    text: None,
                    intent: Some(Intent::EndOfTask),
                    occurred_at,
                    end_agent: true,
                },
            )?)
        } else {
            self.db
                .end_agent(agent.id)
                .map_err(|e| self.store_error(agent.id, e))?;
            None
        };

        self.resolver.forget_agent(agent.id);
        Ok(transition)
    }

    fn apply_turn(&self, agent: &Agent, input: TurnInput<'_>) -> Result<TransitionRecord, ProcessError> {
        let agent_id = agent.id;
        let active = self
            .db
            .get_active_task(agent_id)
            .map_err(|e| self.store_error(agent_id, e))?;
        let task_id = active.as_ref().map(|t| t.id);
        let from = active.as_ref().map_or(TaskState::Idle, |t| t.state);

        let intent = input
            .intent
            .unwrap_or_else(|| self.classifier.load().classify(input.actor, input.text, from));

        let transition = match validate(from, input.actor, intent) {
            Validation::Valid(transition) => transition,
            Validation::Invalid { reason } => {
                warn!(
                    agent_id,
                    task_id = ?task_id,
                    from = %from,
                    actor = %input.actor,
                    intent = %intent,
                    reason = %reason,
                    "Transition rejected"
                );
                return Err(ProcessError::InvalidTransition {
                    agent_id,
                    task_id,
                    from,
                    actor: input.actor,
                    intent,
                    reason,
                });
            }
        };

        let record = self
            .db
            .apply_transition(&TransitionWrite {
                agent_id,
                expected_task_id: task_id,
                from,
                to: transition.to,
                creates_task: transition.creates_task,
                actor: input.actor,
                intent,
                text: input.text,
                occurred_at: input.occurred_at,
                end_agent: input.end_agent,
            })
            .map_err(|e| self.store_error(agent_id, e))?;

        info!(
            agent_id,
            task_id = record.task_id,
            from = %record.from_state,
            to = %record.to_state,
            actor = %record.actor,
            intent = %record.intent,
            abandoned_task_id = ?record.abandoned_task_id,
            "Transition applied"
        );

        // Published before the lock is released so per-agent order holds.
        // No subscribers is fine.
        let _ = self.transitions.send(record.clone());

        Ok(record)
    }

    fn store_error(&self, agent_id: i64, err: anyhow::Error) -> ProcessError {
        let err = ProcessError::store(Some(agent_id), err);
        error!(agent_id, error = %err, "Store operation failed");
        err
    }

    /// Run `f` under the lock for `agent_id` in non-blocking mode. Used by
    /// maintenance passes that should never wait on live traffic.
    pub(crate) fn try_with_agent_lock<T>(
        &self,
        agent_id: i64,
        f: impl FnOnce() -> T,
    ) -> Result<T, crate::error::LockError> {
        self.locks.with_agent_lock(agent_id, LockMode::NonBlocking, f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCode;

    fn lifecycle() -> Lifecycle {
        let db = Database::open_in_memory().unwrap();
        db.register_project("/work/app", None).unwrap();
        Lifecycle::new(db, LifecycleOptions::default())
    }

    fn turn(actor: Actor, text: &str) -> Notification {
        Notification::turn("s1", "/work/app", actor, Some(text))
    }

    #[test]
    fn full_task_round_trip() {
        let lc = lifecycle();

        let t = lc.process(&turn(Actor::User, "build the login page")).unwrap();
        let record = t.transition().unwrap().clone();
        assert_eq!(record.from_state, TaskState::Idle);
        assert_eq!(record.to_state, TaskState::Commanded);
        assert_eq!(record.intent, Intent::Command);

        let t = lc.process(&turn(Actor::Agent, "Should I use OAuth or email/password?")).unwrap();
        assert_eq!(t.transition().unwrap().to_state, TaskState::AwaitingInput);

        let t = lc.process(&turn(Actor::User, "email/password")).unwrap();
        assert_eq!(t.transition().unwrap().intent, Intent::Answer);
        assert_eq!(t.transition().unwrap().to_state, TaskState::Processing);

        let t = lc.process(&turn(Actor::Agent, "Done, login page implemented.")).unwrap();
        assert_eq!(t.transition().unwrap().to_state, TaskState::Complete);

        let agent_id = t.agent_id();
        assert!(lc.db().get_active_task(agent_id).unwrap().is_none());
        let task = lc.db().get_task(record.task_id).unwrap().unwrap();
        assert_eq!(task.state, TaskState::Complete);
        assert!(task.completed_at.is_some());
        assert_eq!(lc.db().get_turns(task.id).unwrap().len(), 4);
        assert_eq!(lc.db().get_agent_transitions(agent_id).unwrap().len(), 4);
    }

    #[test]
    fn agent_turn_while_idle_is_rejected() {
        let lc = lifecycle();
        let err = lc.process(&turn(Actor::Agent, "Working on it")).unwrap_err();
        assert_eq!(err.code(), ErrorCode::InvalidTransition);
        assert!(err.to_string().contains("agent cannot act when idle"));
        assert_eq!(lc.db().count_transitions().unwrap(), 0);
    }

    #[test]
    fn lock_is_free_after_every_outcome() {
        let lc = lifecycle();
        let _ = lc.process(&turn(Actor::Agent, "too early")).unwrap_err();
        let ok = lc.process(&turn(Actor::User, "go")).unwrap();
        assert!(lc.db().get_agent_lease(ok.agent_id()).unwrap().is_none());
        assert_eq!(AgentLocks::held_by_current_thread(), None);
    }

    #[test]
    fn subscribers_see_applied_transitions() {
        let lc = lifecycle();
        let mut rx = lc.subscribe();
        lc.process(&turn(Actor::User, "go")).unwrap();
        lc.process(&turn(Actor::Agent, "reading files")).unwrap();

        let first = rx.try_recv().unwrap();
        let second = rx.try_recv().unwrap();
        assert_eq!(first.to_state, TaskState::Commanded);
        assert_eq!(second.to_state, TaskState::Processing);
        assert!(first.id < second.id);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn session_end_completes_active_task() {
        let lc = lifecycle();
        lc.process(&turn(Actor::User, "go")).unwrap();
        let ended = lc.process(&Notification::session_end("s1", "/work/app")).unwrap();

        let record = ended.transition().unwrap();
        assert_eq!(record.intent, Intent::EndOfTask);
        assert_eq!(record.to_state, TaskState::Complete);
        let agent = lc.db().get_agent(ended.agent_id()).unwrap().unwrap();
        assert!(!agent.is_alive());
        assert_eq!(lc.resolver().cached_agent_id("s1"), None);

        // A repeated end finds no alive agent and creates nothing
        let err = lc.process(&Notification::session_end("s1", "/work/app")).unwrap_err();
        assert_eq!(err.code(), ErrorCode::UnresolvedSession);
        assert_eq!(lc.db().list_agents(true).unwrap().len(), 1);
    }

    #[test]
    fn reloaded_classifier_takes_effect() {
        let lc = lifecycle();
        lc.process(&turn(Actor::User, "go")).unwrap();

        let mut config = Config::default();
        config.classifier.completion_patterns = vec![r"\bshipped\b".to_string()];
        lc.apply_config(&config).unwrap();

        let t = lc.process(&turn(Actor::Agent, "Shipped to staging")).unwrap();
        assert_eq!(t.transition().unwrap().intent, Intent::Completion);
    }
}
