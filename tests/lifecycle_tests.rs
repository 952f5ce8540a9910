//! End-to-end tests for notification processing.
//!
//! File-backed tests open the same database through several `Lifecycle`
//! instances, each with its own connections and lock holder identity, the
//! way separate hook processes share one store.

use agent_lifecycle::db::Database;
use agent_lifecycle::error::ErrorCode;
use agent_lifecycle::lifecycle::{AgentLocks, Lifecycle, LifecycleOptions, LockSettings, ResolvedVia};
use agent_lifecycle::types::{Actor, Hints, Intent, Notification, TaskState};
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::Duration;
use tempfile::TempDir;

const PROJECT: &str = "/work/app";

fn options(timeout_ms: u64) -> LifecycleOptions {
    LifecycleOptions {
        locks: LockSettings {
            timeout: Duration::from_millis(timeout_ms),
            lease: Duration::from_secs(60),
            poll_interval: Duration::from_millis(5),
        },
        ..Default::default()
    }
}

/// A temp directory holding a database with `PROJECT` registered.
fn setup_file_db() -> (TempDir, std::path::PathBuf) {
    let dir = tempfile::tempdir().expect("Failed to create temp dir");
    let path = dir.path().join("lifecycle.db");
    let db = Database::open(&path).expect("Failed to open database");
    db.register_project(PROJECT, None).unwrap();
    (dir, path)
}

fn open_lifecycle(path: &std::path::Path, timeout_ms: u64) -> Lifecycle {
    let db = Database::open(path).expect("Failed to open database");
    Lifecycle::new(db, options(timeout_ms))
}

fn setup_memory() -> Lifecycle {
    let db = Database::open_in_memory().expect("Failed to create in-memory database");
    db.register_project(PROJECT, None).unwrap();
    Lifecycle::new(db, options(5000))
}

fn user(session: &str, text: &str) -> Notification {
    Notification::turn(session, PROJECT, Actor::User, Some(text))
}

fn agent(session: &str, text: &str) -> Notification {
    Notification::turn(session, PROJECT, Actor::Agent, Some(text))
}

mod scenarios {
    use super::*;

    #[test]
    fn login_page_conversation() {
        let lc = setup_memory();

        // A: command on a fresh agent
        let a = lc.process(&user("s1", "build the login page")).unwrap();
        let record = a.transition().unwrap();
        assert_eq!(record.to_state, TaskState::Commanded);
        let task_id = record.task_id;
        let agent_id = a.agent_id();
        let turns = lc.db().get_turns(task_id).unwrap();
        assert_eq!(turns.len(), 1);
        assert_eq!((turns[0].actor, turns[0].intent), (Actor::User, Intent::Command));
        assert_eq!(turns[0].text.as_deref(), Some("build the login page"));

        // B: clarifying question
        let b = lc
            .process(&agent("s1", "Should I use OAuth or email/password?"))
            .unwrap();
        assert_eq!(b.transition().unwrap().to_state, TaskState::AwaitingInput);
        let turns = lc.db().get_turns(task_id).unwrap();
        assert_eq!((turns[1].actor, turns[1].intent), (Actor::Agent, Intent::Question));

        // C: answer
        let c = lc.process(&user("s1", "email/password")).unwrap();
        assert_eq!(c.transition().unwrap().to_state, TaskState::Processing);
        let turns = lc.db().get_turns(task_id).unwrap();
        assert_eq!((turns[2].actor, turns[2].intent), (Actor::User, Intent::Answer));

        // D: completion
        let d = lc.process(&agent("s1", "Done, login page implemented.")).unwrap();
        assert_eq!(d.transition().unwrap().to_state, TaskState::Complete);
        let task = lc.db().get_task(task_id).unwrap().unwrap();
        assert_eq!(task.state, TaskState::Complete);
        assert!(task.completed_at.is_some());
        assert!(lc.db().get_active_task(agent_id).unwrap().is_none());

        // Every turn of the task shares one agent, in arrival order
        let turns = lc.db().get_turns(task_id).unwrap();
        assert_eq!(turns.len(), 4);
        assert!(turns.windows(2).all(|w| w[0].timestamp < w[1].timestamp));
    }

    #[test]
    fn agent_speaking_while_idle_is_rejected() {
        let lc = setup_memory();
        // Session start creates the agent but no task
        let started = lc.process(&Notification::session_start("s1", PROJECT)).unwrap();
        let agent_id = started.agent_id();

        let err = lc.process(&agent("s1", "I have finished the refactor")).unwrap_err();
        assert_eq!(err.code(), ErrorCode::InvalidTransition);
        assert!(!err.is_retryable());
        assert_eq!(err.agent_id(), Some(agent_id));
        assert!(err.diagnostic().message.contains("agent cannot act when idle"));

        assert!(lc.db().list_tasks(agent_id).unwrap().is_empty());
        assert!(lc.db().get_agent_turns(agent_id).unwrap().is_empty());
        assert_eq!(lc.db().count_transitions().unwrap(), 0);
    }

    #[test]
    fn duplicate_progress_is_recorded_twice() {
        let lc = setup_memory();
        lc.process(&user("s1", "refactor the parser")).unwrap();
        let first = lc.process(&agent("s1", "Reading the parser module")).unwrap();
        let dup = lc.process(&agent("s1", "Reading the parser module")).unwrap();

        let first = first.transition().unwrap();
        let dup = dup.transition().unwrap();
        assert_eq!(first.to_state, TaskState::Processing);
        assert_eq!(dup.from_state, TaskState::Processing);
        assert_eq!(dup.to_state, TaskState::Processing);
        assert_eq!(dup.intent, Intent::Progress);
        assert_eq!(lc.db().get_turns(first.task_id).unwrap().len(), 3);
    }

    #[test]
    fn user_text_while_awaiting_input_answers_the_same_task() {
        let lc = setup_memory();
        let first = lc.process(&user("s1", "add caching")).unwrap();
        lc.process(&agent("s1", "Which cache backend do you want?")).unwrap();
        let task_id = first.transition().unwrap().task_id;

        let reply = lc.process(&user("s1", "never mind, fix the login bug")).unwrap();
        let record = reply.transition().unwrap();
        assert_eq!(record.intent, Intent::Answer);
        assert_eq!(record.task_id, task_id);
        assert_eq!(record.to_state, TaskState::Processing);
    }

    #[test]
    fn user_text_while_commanded_is_rejected() {
        let lc = setup_memory();
        lc.process(&user("s1", "add caching")).unwrap();

        // Nothing has been asked yet, so this is a second command
        let err = lc.process(&user("s1", "also update the docs")).unwrap_err();
        assert_eq!(err.code(), ErrorCode::InvalidTransition);
        assert!(err.to_string().contains("user command is not allowed in state commanded"));
    }

    #[test]
    fn session_end_finishes_active_task_and_agent() {
        let lc = setup_memory();
        let started = lc.process(&user("s1", "write docs")).unwrap();
        lc.process(&agent("s1", "Drafting the README")).unwrap();

        let ended = lc.process(&Notification::session_end("s1", PROJECT)).unwrap();
        let record = ended.transition().unwrap();
        assert_eq!(record.from_state, TaskState::Processing);
        assert_eq!(record.to_state, TaskState::Complete);
        assert_eq!(record.intent, Intent::EndOfTask);
        assert!(!lc.db().get_agent(started.agent_id()).unwrap().unwrap().is_alive());

        // A new notification for the same session starts a fresh agent
        let again = lc.process(&user("s1", "one more thing")).unwrap();
        assert_ne!(again.agent_id(), started.agent_id());
    }
}

mod concurrency {
    use super::*;

    #[test]
    fn concurrent_progress_from_two_processes() {
        let (_dir, path) = setup_file_db();
        let a = Arc::new(open_lifecycle(&path, 10_000));
        let b = Arc::new(open_lifecycle(&path, 10_000));

        let commanded = a.process(&user("s1", "optimize the build")).unwrap();
        let task_id = commanded.transition().unwrap().task_id;

        let barrier = Arc::new(Barrier::new(2));
        let handles: Vec<_> = [Arc::clone(&a), Arc::clone(&b)]
            .into_iter()
            .map(|lc| {
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || {
                    barrier.wait();
                    lc.process(&agent("s1", "Running cargo build"))
                })
            })
            .collect();

        for handle in handles {
            let processed = handle.join().unwrap().expect("concurrent progress should succeed");
            assert_eq!(processed.transition().unwrap().to_state, TaskState::Processing);
        }

        let task = a.db().get_task(task_id).unwrap().unwrap();
        assert_eq!(task.state, TaskState::Processing);
        assert_eq!(a.db().get_turns(task_id).unwrap().len(), 3);
        assert_eq!(a.db().list_agents(true).unwrap().len(), 1);
    }

    #[test]
    fn stress_many_concurrent_turns_for_one_agent() {
        const WORKERS: usize = 16;

        let (_dir, path) = setup_file_db();
        let instances: Vec<Arc<Lifecycle>> = (0..4)
            .map(|_| Arc::new(open_lifecycle(&path, 20_000)))
            .collect();

        let commanded = instances[0].process(&user("s1", "migrate the schema")).unwrap();
        let agent_id = commanded.agent_id();
        let task_id = commanded.transition().unwrap().task_id;

        let barrier = Arc::new(Barrier::new(WORKERS));
        let handles: Vec<_> = (0..WORKERS)
            .map(|i| {
                let lc = Arc::clone(&instances[i % instances.len()]);
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || {
                    barrier.wait();
                    lc.process(&agent("s1", &format!("step {}", i)))
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap().expect("every turn should apply");
        }

        let db = instances[0].db();
        let turns = db.get_turns(task_id).unwrap();
        assert_eq!(turns.len(), WORKERS + 1);
        assert!(turns.windows(2).all(|w| w[0].timestamp < w[1].timestamp));

        // The log chains: each transition starts where the previous ended
        let log = db.get_agent_transitions(agent_id).unwrap();
        assert_eq!(log.len(), WORKERS + 1);
        assert!(log.windows(2).all(|w| w[0].to_state == w[1].from_state));
        assert!(log.windows(2).all(|w| w[0].timestamp < w[1].timestamp));

        assert_eq!(db.get_task(task_id).unwrap().unwrap().state, TaskState::Processing);
        assert!(db.get_agent_lease(agent_id).unwrap().is_none());
    }

    #[test]
    fn first_notification_races_create_one_agent() {
        let (_dir, path) = setup_file_db();
        let instances: Vec<Arc<Lifecycle>> = (0..4)
            .map(|_| Arc::new(open_lifecycle(&path, 10_000)))
            .collect();

        let barrier = Arc::new(Barrier::new(instances.len()));
        let handles: Vec<_> = instances
            .iter()
            .map(|lc| {
                let lc = Arc::clone(lc);
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || {
                    barrier.wait();
                    lc.process(&Notification::session_start("fresh", PROJECT))
                })
            })
            .collect();

        let ids: Vec<i64> = handles
            .into_iter()
            .map(|h| h.join().unwrap().unwrap().agent_id())
            .collect();
        assert!(ids.windows(2).all(|w| w[0] == w[1]));
        assert_eq!(instances[0].db().list_agents(false).unwrap().len(), 1);
    }

    #[test]
    fn blocked_caller_proceeds_after_release() {
        let (_dir, path) = setup_file_db();
        let holder = Arc::new(open_lifecycle(&path, 5000));
        let waiter = Arc::new(open_lifecycle(&path, 5000));
        let agent_id = holder.process(&user("s1", "start")).unwrap().agent_id();

        let (locked_tx, locked_rx) = std::sync::mpsc::channel();
        let hold = {
            let holder = Arc::clone(&holder);
            thread::spawn(move || {
                let _guard = holder
                    .locks()
                    .acquire(agent_id, holder.locks().blocking())
                    .unwrap();
                locked_tx.send(()).unwrap();
                thread::sleep(Duration::from_millis(150));
            })
        };

        locked_rx.recv().unwrap();
        let processed = waiter.process(&agent("s1", "working")).unwrap();
        assert_eq!(processed.transition().unwrap().to_state, TaskState::Processing);
        hold.join().unwrap();
    }

    #[test]
    fn lock_timeout_is_retryable_and_writes_nothing() {
        let (_dir, path) = setup_file_db();
        let lc = open_lifecycle(&path, 100);
        let agent_id = lc.process(&user("s1", "start")).unwrap().agent_id();
        let before = lc.db().count_transitions().unwrap();

        // Another process holds the agent's lease
        let other = Database::open(&path).unwrap();
        assert!(other.try_acquire_agent_lease(agent_id, "4242:other", 60_000).unwrap());

        let err = lc.process(&agent("s1", "working")).unwrap_err();
        assert_eq!(err.code(), ErrorCode::LockTimeout);
        assert!(err.is_retryable());
        assert_eq!(err.agent_id(), Some(agent_id));
        assert_eq!(lc.db().count_transitions().unwrap(), before);
        assert_eq!(AgentLocks::held_by_current_thread(), None);

        assert!(other.release_agent_lease(agent_id, "4242:other").unwrap());
        lc.process(&agent("s1", "working")).unwrap();
    }

    #[test]
    fn abandoned_lease_is_taken_over_after_expiry() {
        let (_dir, path) = setup_file_db();
        let lc = open_lifecycle(&path, 2000);
        let agent_id = lc.process(&user("s1", "start")).unwrap().agent_id();

        // A holder that crashed with a short lease
        let other = Database::open(&path).unwrap();
        assert!(other.try_acquire_agent_lease(agent_id, "4242:crashed", 50).unwrap());

        lc.process(&agent("s1", "working")).unwrap();
        assert!(lc.db().get_agent_lease(agent_id).unwrap().is_none());
    }
}

mod resolution {
    use super::*;

    #[test]
    fn unregistered_directory_is_rejected_without_locking() {
        let lc = setup_memory();
        let n = Notification::turn("s1", "/elsewhere/tool/", Actor::User, Some("hi"));
        let err = lc.process(&n).unwrap_err();
        assert_eq!(err.code(), ErrorCode::UnresolvedSession);
        assert!(!err.is_retryable());
        assert_eq!(err.diagnostic().path.as_deref(), Some("/elsewhere/tool"));
        assert!(lc.db().list_agents(true).unwrap().is_empty());
    }

    #[test]
    fn subdirectory_resolves_to_longest_project() {
        let lc = setup_memory();
        let nested = lc.db().register_project("/work/app/services/api", None).unwrap();
        let n = Notification::turn("s1", "/work/app/services/api/src", Actor::User, Some("go"));
        let processed = lc.process(&n).unwrap();
        let agent = lc.db().get_agent(processed.agent_id()).unwrap().unwrap();
        assert_eq!(agent.project_id, nested.id);
    }

    #[test]
    fn auto_registration_creates_project() {
        let db = Database::open_in_memory().unwrap();
        let lc = Lifecycle::new(
            db,
            LifecycleOptions {
                auto_register_projects: true,
                ..options(1000)
            },
        );
        lc.process(&Notification::session_start("s1", "/new/project")).unwrap();
        let project = lc.db().get_project_by_path("/new/project").unwrap().unwrap();
        assert_eq!(project.name, "project");
    }

    #[test]
    fn handoff_token_binds_preregistered_agent() {
        let lc = setup_memory();
        let pre = lc.db().preregister_agent(PROJECT).unwrap();
        let token = pre.handoff_token.clone().unwrap();

        let n = Notification::session_start("s-upstream", "/work/app/sub").with_hints(Hints {
            handoff_token: Some(token),
        });
        let processed = lc.process(&n).unwrap();
        assert_eq!(processed.agent_id(), pre.id);

        let bound = lc.db().get_agent(pre.id).unwrap().unwrap();
        assert_eq!(bound.session_id.as_deref(), Some("s-upstream"));

        // Later notifications find it by session id alone
        lc.resolver().forget("s-upstream");
        let later = lc.process(&user("s-upstream", "go")).unwrap();
        assert_eq!(later.agent_id(), pre.id);
    }

    #[test]
    fn agent_claimed_while_waiting_for_lock_is_not_shared() {
        let (_dir, path) = setup_file_db();
        let first = Arc::new(open_lifecycle(&path, 5000));
        let second = Arc::new(open_lifecycle(&path, 5000));
        let pre = first.db().preregister_agent(PROJECT).unwrap();

        let (locked_tx, locked_rx) = std::sync::mpsc::channel();
        let (bind_tx, bind_rx) = std::sync::mpsc::channel::<()>();
        let hold = {
            let first = Arc::clone(&first);
            thread::spawn(move || {
                let _guard = first
                    .locks()
                    .acquire(pre.id, first.locks().blocking())
                    .unwrap();
                locked_tx.send(()).unwrap();
                bind_rx.recv().unwrap();
                first.db().touch_agent(pre.id, Some("sA")).unwrap();
            })
        };

        locked_rx.recv().unwrap();
        let waiting = {
            let second = Arc::clone(&second);
            thread::spawn(move || second.process(&user("sB", "fix the tests")))
        };
        // Let sB resolve to the unbound agent and block on its lock
        thread::sleep(Duration::from_millis(100));
        bind_tx.send(()).unwrap();
        hold.join().unwrap();

        let processed = waiting.join().unwrap().unwrap();
        assert_ne!(processed.agent_id(), pre.id);
        let owner = second.db().get_agent(pre.id).unwrap().unwrap();
        assert_eq!(owner.session_id.as_deref(), Some("sA"));
        assert!(second.db().list_tasks(pre.id).unwrap().is_empty());
        let own = second.db().get_agent(processed.agent_id()).unwrap().unwrap();
        assert_eq!(own.session_id.as_deref(), Some("sB"));

        // A later hook process continues sB's own task
        let fresh = open_lifecycle(&path, 5000);
        let next = fresh.process(&agent("sB", "working on it")).unwrap();
        assert_eq!(next.agent_id(), processed.agent_id());
        assert_eq!(next.transition().unwrap().to_state, TaskState::Processing);
    }

    #[test]
    fn handoff_token_is_not_shared_across_sessions() {
        let lc = setup_memory();
        let pre = lc.db().preregister_agent(PROJECT).unwrap();
        let hints = Hints {
            handoff_token: pre.handoff_token.clone(),
        };

        let first = lc
            .process(&Notification::session_start("s1", PROJECT).with_hints(hints.clone()))
            .unwrap();
        assert_eq!(first.agent_id(), pre.id);

        let second = lc
            .process(&user("s2", "another job").with_hints(hints))
            .unwrap();
        assert_ne!(second.agent_id(), pre.id);
        assert!(lc.db().get_active_task(pre.id).unwrap().is_none());
    }

    #[test]
    fn cache_fast_path_on_repeat_notifications() {
        let lc = setup_memory();
        let first = lc.process(&Notification::session_start("s1", PROJECT)).unwrap();
        assert_eq!(lc.resolver().cached_agent_id("s1"), Some(first.agent_id()));

        let request = agent_lifecycle::lifecycle::ResolveRequest {
            session_id: "s1",
            working_directory: PROJECT,
            hints: &Hints::default(),
            allow_new: true,
        };
        let resolution = lc.resolver().resolve(&request).unwrap();
        assert_eq!(resolution.via, ResolvedVia::Cache);
    }

    #[test]
    fn missing_session_id_is_unresolved() {
        let lc = setup_memory();
        let err = lc.process(&user("  ", "hello")).unwrap_err();
        assert_eq!(err.code(), ErrorCode::UnresolvedSession);
    }
}

mod reaping {
    use super::*;

    #[test]
    fn stale_agents_are_ended_and_tasks_completed() {
        let lc = setup_memory();
        let busy = lc.process(&user("s1", "long job")).unwrap();
        let idle = lc.process(&Notification::session_start("s2", PROJECT)).unwrap();
        thread::sleep(Duration::from_millis(5));

        let report = lc.reap_stale_agents(Duration::ZERO).unwrap();
        let mut reaped = report.reaped.clone();
        reaped.sort();
        let mut expected = vec![busy.agent_id(), idle.agent_id()];
        expected.sort();
        assert_eq!(reaped, expected);
        assert!(report.deferred.is_empty());

        let task = lc
            .db()
            .get_task(busy.transition().unwrap().task_id)
            .unwrap()
            .unwrap();
        assert_eq!(task.state, TaskState::Complete);
        assert!(lc.db().list_agents(false).unwrap().is_empty());

        let log = lc.db().get_agent_transitions(busy.agent_id()).unwrap();
        assert_eq!(log.last().unwrap().intent, Intent::EndOfTask);
    }

    #[test]
    fn recently_seen_agents_survive() {
        let lc = setup_memory();
        lc.process(&Notification::session_start("s1", PROJECT)).unwrap();
        let report = lc.reap_stale_agents(Duration::from_secs(3600)).unwrap();
        assert!(report.is_empty());
        assert_eq!(lc.db().list_agents(false).unwrap().len(), 1);
    }

    #[test]
    fn huge_inactivity_window_reaps_nothing() {
        let lc = setup_memory();
        lc.process(&Notification::session_start("s1", PROJECT)).unwrap();
        thread::sleep(Duration::from_millis(5));
        let report = lc.reap_stale_agents(Duration::from_secs(u64::MAX)).unwrap();
        assert!(report.reaped.is_empty());
        assert_eq!(lc.db().list_agents(false).unwrap().len(), 1);
    }

    #[test]
    fn contended_agents_are_deferred() {
        let (_dir, path) = setup_file_db();
        let lc = open_lifecycle(&path, 1000);
        let agent_id = lc
            .process(&Notification::session_start("s1", PROJECT))
            .unwrap()
            .agent_id();
        thread::sleep(Duration::from_millis(5));

        let other = Database::open(&path).unwrap();
        assert!(other.try_acquire_agent_lease(agent_id, "4242:hook", 60_000).unwrap());

        let report = lc.reap_stale_agents(Duration::ZERO).unwrap();
        assert_eq!(report.deferred, vec![agent_id]);
        assert!(report.reaped.is_empty());
        assert!(lc.db().get_agent(agent_id).unwrap().unwrap().is_alive());

        // Next pass, once the holder is gone, ends it
        other.release_agent_lease(agent_id, "4242:hook").unwrap();
        let report = lc.reap_stale_agents(Duration::ZERO).unwrap();
        assert_eq!(report.reaped, vec![agent_id]);
    }

    #[test]
    fn expired_leases_are_purged() {
        let lc = setup_memory();
        lc.db().try_acquire_agent_lease(99, "1:gone", -1).unwrap();
        let report = lc.reap_stale_agents(Duration::from_secs(3600)).unwrap();
        assert_eq!(report.purged_leases, 1);
        assert!(lc.db().get_agent_lease(99).unwrap().is_none());
    }
}
