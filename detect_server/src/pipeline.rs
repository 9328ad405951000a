use crate::config::PipelineSettings;
use crate::correlator::{CallTable, Correlator, DeliverySink};
use crate::dispatcher::{BackoffPolicy, PoolError, WorkerPool};
use crate::engine::EngineFactory;
use crate::frame::Frame;
use crate::queue::{PushError, WorkQueue};
use crate::work::{CallTag, WorkItem};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("failed to spawn pipeline thread: {0}")]
    Spawn(#[from] std::io::Error),
    #[error(transparent)]
    Workers(#[from] PoolError),
}

#[derive(Debug, Error)]
pub enum SubmitError {
    /// Work queue at capacity under the `reject` policy.
    #[error("work queue is saturated")]
    Saturated,
    #[error("pipeline is shutting down")]
    ShuttingDown,
}

/// The assembled detection pipeline: work queue, worker pool, completion
/// queue, correlator thread, and the tag-keyed call table.
///
/// `submit` registers a delivery sink, tags the frame, and enqueues it;
/// the sink resolves once the item's terminal outcome is known. `shutdown`
/// drains in-flight work before canceling whatever never completed.
pub struct DetectionPipeline {
    work: Arc<WorkQueue<WorkItem>>,
    completed: Arc<WorkQueue<WorkItem>>,
    calls: Arc<CallTable>,
    workers: Mutex<Option<WorkerPool>>,
    correlator: Mutex<Option<Correlator>>,
}

impl DetectionPipeline {
    pub fn start(
        settings: &PipelineSettings,
        factory: Arc<dyn EngineFactory>,
    ) -> Result<Self, PipelineError> {
        let work = Arc::new(WorkQueue::with_capacity(
            settings.queue_capacity,
            settings.backpressure,
        ));
        // Completions must never be rejected, so this side stays unbounded.
        let completed = Arc::new(WorkQueue::unbounded());
        let calls = Arc::new(CallTable::new());

        let workers = WorkerPool::spawn(
            factory,
            &settings.contexts,
            settings.batch_limit,
            Arc::clone(&work),
            Arc::clone(&completed),
            BackoffPolicy {
                threshold: settings.backoff_threshold,
                pause: Duration::from_millis(settings.backoff_ms),
            },
        )?;
        let correlator = Correlator::spawn(Arc::clone(&calls), Arc::clone(&completed))?;

        tracing::info!(
            contexts = ?settings.contexts,
            batch_limit = settings.batch_limit,
            queue_capacity = ?settings.queue_capacity,
            backpressure = ?settings.backpressure,
            "detection pipeline started"
        );

        Ok(Self {
            work,
            completed,
            calls,
            workers: Mutex::new(Some(workers)),
            correlator: Mutex::new(Some(correlator)),
        })
    }

    /// Tags the frame and enqueues it; the sink resolves with the call's
    /// terminal outcome. With the `block` policy this may wait for queue
    /// space, so async callers should invoke it off the runtime threads.
    pub fn submit(&self, frame: Frame, sink: Box<dyn DeliverySink>) -> Result<CallTag, SubmitError> {
        let tag = self
            .calls
            .register(frame.stream_id, frame.sequence, sink);
        match self.work.push(WorkItem::new(frame, tag)) {
            Ok(()) => Ok(tag),
            Err(e) => {
                // Unwind the registration; the sink is dropped with it and
                // the caller sees the submit error instead.
                self.calls.unregister(tag);
                match e {
                    PushError::Full(_) => Err(SubmitError::Saturated),
                    PushError::Closed(_) => Err(SubmitError::ShuttingDown),
                }
            }
        }
    }

    pub fn queued(&self) -> usize {
        self.work.len()
    }

    pub fn outstanding_calls(&self) -> usize {
        self.calls.outstanding()
    }

    /// Orderly shutdown: close the work queue, let the workers drain what
    /// was already claimed or queued, close the completion queue once the
    /// workers are done, then cancel any call that never resolved.
    /// Idempotent.
    pub fn shutdown(&self) {
        let workers = self.workers.lock().take();
        let correlator = self.correlator.lock().take();
        if workers.is_none() && correlator.is_none() {
            return;
        }

        tracing::info!("shutting down detection pipeline");
        self.work.close();
        if let Some(workers) = workers {
            workers.join();
        }
        self.completed.close();
        if let Some(correlator) = correlator {
            correlator.join();
        }
        self.calls.cancel_all();
    }
}

impl Drop for DetectionPipeline {
    fn drop(&mut self) {
        self.shutdown();
    }
}
