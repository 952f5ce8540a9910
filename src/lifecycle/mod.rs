//! Session correlation, the task state machine and per-agent serialization.

pub mod classifier;
pub mod lock;
pub mod orchestrator;
pub mod reaper;
pub mod resolver;
pub mod validator;

pub use classifier::IntentClassifier;
pub use lock::{AgentLockGuard, AgentLocks, LockMode, LockSettings};
pub use orchestrator::{BROADCAST_CAPACITY, Lifecycle, LifecycleOptions};
pub use reaper::{ReapReport, run_reaper};
pub use resolver::{Resolution, ResolveRequest, ResolvedVia, SessionResolver};
pub use validator::{Transition, Validation, validate};
