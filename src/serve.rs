//! Long-running notification intake over newline-delimited JSON.
//!
//! Each input line is one [`Notification`]. Lines are routed to a fixed set
//! of lanes by session id: a lane processes its notifications one at a time,
//! so a session's notifications are applied in arrival order while different
//! sessions proceed in parallel. Every input line produces exactly one output
//! line carrying its input sequence number; output order follows completion.

use crate::cli::result_json;
use crate::lifecycle::Lifecycle;
use crate::types::{Notification, TransitionRecord};
use anyhow::Result;
use serde::Serialize;
use serde_json::{Value, json};
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::broadcast::error::{RecvError, TryRecvError};
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

/// Options for [`serve_lines`].
#[derive(Debug, Clone, Copy)]
pub struct ServeOptions {
    /// Number of lanes, i.e. sessions processed at once.
    pub lanes: usize,
    /// Also emit `{"event": "transition", ...}` lines for applied transitions.
    pub emit_transitions: bool,
}

impl Default for ServeOptions {
    fn default() -> Self {
        Self {
            lanes: 16,
            emit_transitions: false,
        }
    }
}

/// Counters for one serve run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ServeStats {
    pub received: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub transitions: u64,
}

struct Job {
    seq: u64,
    notification: Notification,
}

/// Lane for a session id. Stable for the lifetime of the process.
pub fn lane_for(session_id: &str, lanes: usize) -> usize {
    let mut hasher = DefaultHasher::new();
    session_id.hash(&mut hasher);
    (hasher.finish() % lanes.max(1) as u64) as usize
}

/// Read notifications from `input` until EOF and write one result line per
/// notification to `output`. Returns once every accepted line is answered.
pub async fn serve_lines<R, W>(
    lifecycle: Arc<Lifecycle>,
    input: R,
    output: &mut W,
    options: ServeOptions,
) -> Result<ServeStats>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let lane_count = options.lanes.max(1);
    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Value>();

    let mut forwarder = if options.emit_transitions {
        let (stop_tx, stop_rx) = oneshot::channel();
        let handle = tokio::spawn(forward_transitions(
            lifecycle.subscribe(),
            out_tx.clone(),
            stop_rx,
        ));
        Some((stop_tx, handle))
    } else {
        None
    };

    let (lane_txs, lane_handles): (Vec<_>, Vec<_>) = (0..lane_count)
        .map(|_| {
            let (tx, rx) = mpsc::unbounded_channel::<Job>();
            let handle = tokio::spawn(run_lane(Arc::clone(&lifecycle), rx, out_tx.clone()));
            (tx, handle)
        })
        .unzip();

    let mut lane_txs = Some(lane_txs);
    let mut lane_handles = Some(lane_handles);
    let mut out_tx = Some(out_tx);
    let mut closer: Option<JoinHandle<()>> = None;
    let mut lines = input.lines();
    let mut seq = 0u64;
    let mut stats = ServeStats::default();

    loop {
        tokio::select! {
            line = lines.next_line(), if lane_txs.is_some() => match line? {
                Some(line) => {
                    if line.trim().is_empty() {
                        continue;
                    }
                    seq += 1;
                    stats.received += 1;
                    match serde_json::from_str::<Notification>(&line) {
                        Ok(notification) => {
                            let lane = lane_for(&notification.session_id, lane_count);
                            if let Some(txs) = &lane_txs {
                                let _ = txs[lane].send(Job { seq, notification });
                            }
                        }
                        Err(e) => {
                            warn!(seq, error = %e, "Ignoring malformed notification");
                            if let Some(tx) = &out_tx {
                                let _ = tx.send(invalid_input(seq, &e.to_string()));
                            }
                        }
                    }
                }
                None => {
                    debug!(received = stats.received, "Input closed; draining lanes");
                    // Dropping the senders lets each lane finish its queue.
                    lane_txs = None;
                    out_tx = None;
                    let handles = lane_handles.take().unwrap_or_default();
                    let forwarder = forwarder.take();
                    closer = Some(tokio::spawn(async move {
                        for handle in handles {
                            let _ = handle.await;
                        }
                        if let Some((stop, handle)) = forwarder {
                            let _ = stop.send(());
                            let _ = handle.await;
                        }
                    }));
                }
            },
            value = out_rx.recv() => match value {
                Some(value) => {
                    tally(&mut stats, &value);
                    write_line(output, &value).await?;
                }
                None => break,
            },
        }
    }

    if let Some(closer) = closer {
        let _ = closer.await;
    }
    Ok(stats)
}

async fn run_lane(
    lifecycle: Arc<Lifecycle>,
    mut jobs: mpsc::UnboundedReceiver<Job>,
    out: mpsc::UnboundedSender<Value>,
) {
    while let Some(Job { seq, notification }) = jobs.recv().await {
        let lc = Arc::clone(&lifecycle);
        let value = match tokio::task::spawn_blocking(move || lc.process(&notification)).await {
            Ok(result) => with_seq(result_json(&result), seq),
            Err(e) => {
                error!(seq, error = %e, "Notification processing task failed");
                json!({
                    "seq": seq,
                    "ok": false,
                    "error": {
                        "code": "storeError",
                        "message": format!("processing task failed: {}", e),
                        "retryable": true,
                    },
                })
            }
        };
        if out.send(value).is_err() {
            break;
        }
    }
}

async fn forward_transitions(
    mut rx: broadcast::Receiver<TransitionRecord>,
    out: mpsc::UnboundedSender<Value>,
    mut stop: oneshot::Receiver<()>,
) {
    loop {
        tokio::select! {
            biased;
            received = rx.recv() => match received {
                Ok(record) => {
                    let _ = out.send(transition_event(&record));
                }
                Err(RecvError::Lagged(skipped)) => {
                    warn!(skipped, "Transition stream lagged; events dropped");
                }
                Err(RecvError::Closed) => return,
            },
            _ = &mut stop => break,
        }
    }

    // Everything published before the stop signal is already buffered.
    loop {
        match rx.try_recv() {
            Ok(record) => {
                let _ = out.send(transition_event(&record));
            }
            Err(TryRecvError::Lagged(skipped)) => {
                warn!(skipped, "Transition stream lagged; events dropped");
            }
            Err(_) => break,
        }
    }
}

fn transition_event(record: &TransitionRecord) -> Value {
    json!({
        "event": "transition",
        "transition": record,
    })
}

fn invalid_input(seq: u64, message: &str) -> Value {
    json!({
        "seq": seq,
        "ok": false,
        "error": {
            "code": "invalidInput",
            "message": format!("invalid notification: {}", message),
            "retryable": false,
        },
    })
}

fn with_seq(mut value: Value, seq: u64) -> Value {
    if let Value::Object(map) = &mut value {
        map.insert("seq".to_string(), json!(seq));
    }
    value
}

fn tally(stats: &mut ServeStats, value: &Value) {
    if value.get("event").is_some() {
        stats.transitions += 1;
    } else if value["ok"] == true {
        stats.succeeded += 1;
    } else {
        stats.failed += 1;
    }
}

async fn write_line<W: AsyncWrite + Unpin>(output: &mut W, value: &Value) -> Result<()> {
    let mut line = serde_json::to_vec(value)?;
    line.push(b'\n');
    output.write_all(&line).await?;
    output.flush().await?;
    Ok(())
}
