use crate::queue::WorkQueue;
use crate::timing::Stopwatch;
use crate::work::{CallTag, Detection, WorkError, WorkItem};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

/// Terminal outcome of one detection call.
#[derive(Debug)]
pub enum CallOutcome {
    Completed {
        detections: Vec<Detection>,
        classes: u32,
        context: u32,
    },
    /// Partial results already produced travel alongside the error so
    /// callers can distinguish "partial data, then failure" from "no data".
    Failed {
        error: WorkError,
        partial: Vec<Detection>,
    },
    Canceled,
}

/// Pluggable consumer of a call's terminal outcome. The gRPC layer plugs in
/// a oneshot-backed sink; tests use channel-backed sinks.
pub trait DeliverySink: Send {
    fn deliver(self: Box<Self>, outcome: CallOutcome);
}

/// Oneshot adapter used by the gRPC handlers: the handler awaits the
/// receiver while the correlator thread resolves the sender.
pub struct ReplySink {
    tx: tokio::sync::oneshot::Sender<CallOutcome>,
}

impl ReplySink {
    pub fn new(tx: tokio::sync::oneshot::Sender<CallOutcome>) -> Self {
        Self { tx }
    }
}

impl DeliverySink for ReplySink {
    fn deliver(self: Box<Self>, outcome: CallOutcome) {
        if self.tx.send(outcome).is_err() {
            // The caller went away (deadline, disconnect); nothing to do.
            tracing::debug!("delivery receiver dropped before resolution");
        }
    }
}

struct PendingCall {
    sink: Box<dyn DeliverySink>,
    registered: Stopwatch,
    stream_id: u32,
    sequence: u64,
}

/// Tag-keyed table of outstanding calls. Tags come from a monotonic counter
/// so an in-flight tag is never reused; entries are inserted when a request
/// is dispatched and removed exactly once at its terminal event.
pub struct CallTable {
    next_tag: AtomicU64,
    calls: Mutex<HashMap<CallTag, PendingCall>>,
}

impl CallTable {
    pub fn new() -> Self {
        Self {
            next_tag: AtomicU64::new(1),
            calls: Mutex::new(HashMap::new()),
        }
    }

    pub fn register(&self, stream_id: u32, sequence: u64, sink: Box<dyn DeliverySink>) -> CallTag {
        let tag = CallTag::new(self.next_tag.fetch_add(1, Ordering::Relaxed));
        let previous = self.calls.lock().insert(
            tag,
            PendingCall {
                sink,
                registered: Stopwatch::start(),
                stream_id,
                sequence,
            },
        );
        debug_assert!(previous.is_none(), "tag reused while outstanding");
        tag
    }

    fn take(&self, tag: CallTag) -> Option<PendingCall> {
        self.calls.lock().remove(&tag)
    }

    /// Removes a registration whose item never entered the work queue; the
    /// sink is dropped undelivered since the producer sees the submit error
    /// synchronously.
    pub fn unregister(&self, tag: CallTag) {
        self.calls.lock().remove(&tag);
    }

    pub fn outstanding(&self) -> usize {
        self.calls.lock().len()
    }

    /// Resolves every still-outstanding call as canceled. Shutdown calls
    /// this after the completion queue has drained.
    pub fn cancel_all(&self) {
        let drained: Vec<PendingCall> = {
            let mut calls = self.calls.lock();
            calls.drain().map(|(_, call)| call).collect()
        };
        for call in drained {
            tracing::info!(
                stream_id = call.stream_id,
                sequence = call.sequence,
                "canceling outstanding call"
            );
            call.sink.deliver(CallOutcome::Canceled);
        }
    }
}

impl Default for CallTable {
    fn default() -> Self {
        Self::new()
    }
}

/// Dedicated thread draining the completion queue and resolving each
/// completed item against the call table.
pub struct Correlator {
    handle: JoinHandle<()>,
}

impl Correlator {
    pub fn spawn(
        table: Arc<CallTable>,
        completed: Arc<WorkQueue<WorkItem>>,
    ) -> std::io::Result<Self> {
        let handle = std::thread::Builder::new()
            .name("detect-correlator".into())
            .spawn(move || {
                while let Some(item) = completed.pop_one() {
                    resolve(&table, item);
                }
                tracing::info!("completion queue closed, correlator exiting");
            })?;
        Ok(Self { handle })
    }

    pub fn join(self) {
        if self.handle.join().is_err() {
            tracing::error!("correlator thread panicked");
        }
    }
}

fn resolve(table: &CallTable, item: WorkItem) {
    let Some(call) = table.take(item.tag) else {
        // Cancellation race: the call was already resolved. Non-fatal.
        tracing::warn!(
            tag = %item.tag,
            stream_id = item.frame.stream_id,
            sequence = item.frame.sequence,
            "completion for unknown tag, discarding"
        );
        return;
    };

    let latency_ms = call.registered.elapsed_ms();
    let ok = item.done && item.error.is_none();
    tracing::debug!(
        tag = %item.tag,
        stream_id = call.stream_id,
        sequence = call.sequence,
        ok,
        latency_ms,
        "resolving call"
    );

    let outcome = if !item.done {
        // Protocol error: an item must never reach the correlator before
        // its completion flag is set. Surface it rather than dropping.
        tracing::error!(tag = %item.tag, "item retired without completion flag");
        CallOutcome::Failed {
            error: WorkError::NotCompleted,
            partial: item.detections,
        }
    } else if let Some(error) = item.error {
        CallOutcome::Failed {
            error,
            partial: item.detections,
        }
    } else {
        CallOutcome::Completed {
            detections: item.detections,
            classes: item.classes,
            context: item.context,
        }
    };

    call.sink.deliver(outcome);
}
