use crate::engine::{BoundContext, EngineError, EngineFactory, ImageView};
use crate::frame::ResourceError;
use crate::queue::WorkQueue;
use crate::timing::Stopwatch;
use crate::work::{WorkError, WorkItem};
use std::sync::{mpsc, Arc};
use std::thread::JoinHandle;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PoolError {
    #[error("failed to spawn worker thread: {0}")]
    Spawn(#[from] std::io::Error),
    #[error("failed to bind execution context {context}: {source}")]
    Bind {
        context: u32,
        #[source]
        source: EngineError,
    },
    #[error("worker thread exited before binding its context")]
    WorkerExited,
}

pub struct BackoffPolicy {
    /// Consecutive resource failures on one context before the worker
    /// pauses.
    pub threshold: u32,
    pub pause: Duration,
}

/// Fixed pool of worker threads, one per configured execution context.
///
/// Each worker binds its engine on its own thread, then loops: drain a
/// best-effort batch from the work queue, run the engine once per item, and
/// push every item (succeeded or failed) onto the completion queue. Workers
/// exit when the work queue is closed and drained, or when their context
/// becomes unusable.
pub struct WorkerPool {
    handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    pub fn spawn(
        factory: Arc<dyn EngineFactory>,
        contexts: &[u32],
        batch_limit: usize,
        work: Arc<WorkQueue<WorkItem>>,
        completed: Arc<WorkQueue<WorkItem>>,
        backoff: BackoffPolicy,
    ) -> Result<Self, PoolError> {
        let backoff = Arc::new(backoff);
        let (ready_tx, ready_rx) = mpsc::channel();
        let mut handles = Vec::with_capacity(contexts.len());
        for &context in contexts {
            let factory = Arc::clone(&factory);
            let work = Arc::clone(&work);
            let completed = Arc::clone(&completed);
            let backoff = Arc::clone(&backoff);
            let ready_tx = ready_tx.clone();
            let handle = std::thread::Builder::new()
                .name(format!("detect-worker-{}", context))
                .spawn(move || {
                    // The engine is bound on the worker's own thread so the
                    // execution context is owned where the work runs.
                    let bound = match factory.bind(context) {
                        Ok(bound) => {
                            let _ = ready_tx.send(Ok(()));
                            bound
                        }
                        Err(e) => {
                            tracing::error!(context, error = %e, "failed to bind execution context");
                            let _ = ready_tx.send(Err(PoolError::Bind { context, source: e }));
                            return;
                        }
                    };
                    run_worker(context, bound, batch_limit, &work, &completed, &backoff);
                })?;
            handles.push(handle);
        }
        drop(ready_tx);

        // Every context must bind before the pool reports success: items
        // accepted for a context that never came up would leave their
        // callers waiting for a response that cannot arrive.
        let pool = Self { handles };
        for _ in contexts {
            let outcome = ready_rx.recv().unwrap_or(Err(PoolError::WorkerExited));
            if let Err(e) = outcome {
                work.close();
                pool.join();
                return Err(e);
            }
        }
        Ok(pool)
    }

    pub fn join(self) {
        for handle in self.handles {
            if handle.join().is_err() {
                tracing::error!("worker thread panicked");
            }
        }
    }
}

fn run_worker(
    context: u32,
    mut bound: BoundContext,
    batch_limit: usize,
    work: &WorkQueue<WorkItem>,
    completed: &WorkQueue<WorkItem>,
    backoff: &BackoffPolicy,
) {
    tracing::info!(context, batch_limit, "worker started");
    let mut consecutive_resource_failures = 0u32;

    loop {
        let batch = work.pop_up_to(batch_limit);
        if batch.is_empty() {
            tracing::info!(context, "work queue closed, worker exiting");
            return;
        }

        let mut items = batch.into_iter();
        while let Some(mut item) = items.next() {
            match process_item(context, &mut bound, &mut item) {
                Ok(()) => {
                    consecutive_resource_failures = 0;
                }
                Err(ItemFailure::Resource(e)) => {
                    item.fail(context, WorkError::Resource(e.to_string()));
                    consecutive_resource_failures += 1;
                    if consecutive_resource_failures >= backoff.threshold {
                        tracing::warn!(
                            context,
                            failures = consecutive_resource_failures,
                            pause_ms = backoff.pause.as_millis() as u64,
                            "repeated resource exhaustion, backing off"
                        );
                        std::thread::sleep(backoff.pause);
                    }
                }
                Err(ItemFailure::Engine(e)) => {
                    item.fail(context, WorkError::Engine(e.to_string()));
                }
                Err(ItemFailure::ContextLost(e)) => {
                    tracing::error!(context, error = %e, "execution context lost, retiring worker");
                    item.fail(context, WorkError::Engine(e.to_string()));
                    publish(completed, item);
                    // Remaining claimed items are failed rather than
                    // abandoned; the caller still gets a terminal response.
                    for mut leftover in items.by_ref() {
                        leftover.fail(context, WorkError::ContextRetired);
                        publish(completed, leftover);
                    }
                    return;
                }
            }
            publish(completed, item);
        }
    }
}

enum ItemFailure {
    Resource(ResourceError),
    Engine(EngineError),
    ContextLost(EngineError),
}

fn process_item(
    context: u32,
    bound: &mut BoundContext,
    item: &mut WorkItem,
) -> Result<(), ItemFailure> {
    let queue_wait_ms = item.enqueued_at.elapsed().as_secs_f64() * 1000.0;
    // Cloning keeps the borrow of the frame out of the guard's lifetime;
    // spans are cheap handles.
    let span = item.frame.span.clone();
    let _guard = span.enter();

    // Stage host pixels onto the device before the engine call.
    if let Some(memory) = bound.memory.as_mut() {
        match memory.stage(&item.frame.data, context) {
            Ok(allocation) => item.frame.device = Some(allocation),
            Err(e @ ResourceError::Exhausted { .. }) => return Err(ItemFailure::Resource(e)),
            Err(ResourceError::ContextLost { device }) => {
                return Err(ItemFailure::ContextLost(EngineError::ContextLost(device)))
            }
        }
    }

    let engine_clock = Stopwatch::start();
    let result = bound.engine.detect(ImageView {
        width: item.frame.width,
        height: item.frame.height,
        channels: item.frame.channels,
        data: &item.frame.data,
        device: item.frame.device.as_ref(),
    });
    let engine_ms = engine_clock.elapsed_ms();

    // Release the staged allocation on the same context, exactly once,
    // gated on the owning-flag check-and-clear.
    if let Some(allocation) = item.frame.device.as_mut() {
        if allocation.take_ownership() {
            if let Some(memory) = bound.memory.as_mut() {
                if let Err(e) = memory.release(allocation) {
                    tracing::error!(context, error = %e, "device release failed");
                }
            }
        }
    }

    match result {
        Ok(output) => {
            item.complete(output.detections, output.classes, context);
            tracing::debug!(
                tag = %item.tag,
                context,
                stream_id = item.frame.stream_id,
                sequence = item.frame.sequence,
                queue_wait_ms,
                engine_ms,
                nboxes = item.detections.len(),
                "detection complete"
            );
            Ok(())
        }
        Err(e @ EngineError::ContextLost(_)) => Err(ItemFailure::ContextLost(e)),
        Err(e) => Err(ItemFailure::Engine(e)),
    }
}

fn publish(completed: &WorkQueue<WorkItem>, item: WorkItem) {
    if let Err(e) = completed.push(item) {
        // Only possible when the completion queue is closed during
        // shutdown; the pending call resolves as canceled instead.
        tracing::warn!(tag = %e.into_inner().tag, "completion queue closed, dropping item");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{EngineOutput, InferenceEngine};
    use crate::frame::{DeviceLedger, Frame, SyntheticMemory};
    use crate::work::CallTag;

    fn test_frame(sequence: u64) -> Frame {
        Frame::new(8, 8, 1, vec![0.0; 64], 0, sequence, 0).unwrap()
    }

    fn default_backoff() -> BackoffPolicy {
        BackoffPolicy {
            threshold: 3,
            pause: Duration::from_millis(1),
        }
    }

    struct StubEngine {
        classes: u32,
        nboxes: usize,
        fail_sequences: Vec<u64>,
    }

    impl InferenceEngine for StubEngine {
        fn detect(&mut self, image: ImageView<'_>) -> Result<EngineOutput, EngineError> {
            // Sequence is smuggled through the first pixel by the tests.
            let sequence = image.data[0] as u64;
            if self.fail_sequences.contains(&sequence) {
                return Err(EngineError::Inference("injected failure".into()));
            }
            let detections = (0..self.nboxes)
                .map(|_| crate::work::Detection {
                    bbox: crate::work::BBox {
                        x: 1.0,
                        y: 1.0,
                        w: 1.0,
                        h: 1.0,
                    },
                    classes: self.classes,
                    prob: vec![0.5; self.classes as usize],
                })
                .collect();
            Ok(EngineOutput {
                detections,
                classes: self.classes,
            })
        }
    }

    struct StubFactory {
        classes: u32,
        nboxes: usize,
        fail_sequences: Vec<u64>,
        ledger: Arc<DeviceLedger>,
        fail_every: u64,
    }

    impl EngineFactory for StubFactory {
        fn bind(&self, _context: u32) -> Result<BoundContext, EngineError> {
            Ok(BoundContext {
                engine: Box::new(StubEngine {
                    classes: self.classes,
                    nboxes: self.nboxes,
                    fail_sequences: self.fail_sequences.clone(),
                }),
                memory: Some(Box::new(SyntheticMemory::failing_every(
                    Arc::clone(&self.ledger),
                    self.fail_every,
                ))),
            })
        }
    }

    fn submit(work: &WorkQueue<WorkItem>, sequence: u64, tag: u64) {
        let mut frame = test_frame(sequence);
        frame.data[0] = sequence as f32;
        work.push(WorkItem::new(frame, CallTag::new(tag))).unwrap();
    }

    #[test]
    fn test_end_to_end_synthetic_detection() {
        let work = Arc::new(WorkQueue::unbounded());
        let completed = Arc::new(WorkQueue::unbounded());
        let factory = Arc::new(StubFactory {
            classes: 80,
            nboxes: 2,
            fail_sequences: vec![],
            ledger: DeviceLedger::new(),
            fail_every: 0,
        });

        let pool = WorkerPool::spawn(
            factory,
            &[0],
            10,
            Arc::clone(&work),
            Arc::clone(&completed),
            default_backoff(),
        )
        .unwrap();

        submit(&work, 1, 77);
        let item = completed.pop_one().unwrap();
        assert!(item.done);
        assert_eq!(item.detections.len(), 2);
        assert_eq!(item.classes, 80);
        assert_eq!(item.context, 0);
        assert_eq!(item.tag, CallTag::new(77));
        assert!(item.error.is_none());

        work.close();
        pool.join();
    }

    #[test]
    fn test_frame_with_attached_span_completes() {
        let work = Arc::new(WorkQueue::unbounded());
        let completed = Arc::new(WorkQueue::unbounded());
        let factory = Arc::new(StubFactory {
            classes: 80,
            nboxes: 1,
            fail_sequences: vec![],
            ledger: DeviceLedger::new(),
            fail_every: 0,
        });

        let pool = WorkerPool::spawn(
            factory,
            &[0],
            10,
            Arc::clone(&work),
            Arc::clone(&completed),
            default_backoff(),
        )
        .unwrap();

        // Completion fields are written while the frame's own span is
        // entered; the guard must not pin a borrow of the item.
        let mut frame = test_frame(1);
        frame.data[0] = 1.0;
        let frame = frame.with_span(tracing::debug_span!("detect_call", stream_id = 0u32));
        work.push(WorkItem::new(frame, CallTag::new(5))).unwrap();

        let item = completed.pop_one().unwrap();
        assert!(item.done);
        assert_eq!(item.detections.len(), 1);
        assert_eq!(item.tag, CallTag::new(5));

        work.close();
        pool.join();
    }

    #[test]
    fn test_engine_failure_still_delivers_item() {
        let work = Arc::new(WorkQueue::unbounded());
        let completed = Arc::new(WorkQueue::unbounded());
        let factory = Arc::new(StubFactory {
            classes: 80,
            nboxes: 2,
            fail_sequences: vec![2],
            ledger: DeviceLedger::new(),
            fail_every: 0,
        });

        let pool = WorkerPool::spawn(
            factory,
            &[0],
            10,
            Arc::clone(&work),
            Arc::clone(&completed),
            default_backoff(),
        )
        .unwrap();

        submit(&work, 1, 1);
        submit(&work, 2, 2);

        let mut by_tag = std::collections::HashMap::new();
        for _ in 0..2 {
            let item = completed.pop_one().unwrap();
            assert!(item.done);
            by_tag.insert(item.tag, item);
        }
        assert!(by_tag[&CallTag::new(1)].error.is_none());
        assert!(matches!(
            by_tag[&CallTag::new(2)].error,
            Some(WorkError::Engine(_))
        ));

        work.close();
        pool.join();
    }

    #[test]
    fn test_device_buffers_single_release_under_fault_injection() {
        let iterations = 10_000u64;
        let ledger = DeviceLedger::new();
        let work = Arc::new(WorkQueue::unbounded());
        let completed = Arc::new(WorkQueue::unbounded());
        let factory = Arc::new(StubFactory {
            classes: 4,
            nboxes: 1,
            fail_sequences: vec![],
            ledger: Arc::clone(&ledger),
            // 1% of staging attempts fail with resource exhaustion.
            fail_every: 100,
        });

        let pool = WorkerPool::spawn(
            factory,
            &[0],
            10,
            Arc::clone(&work),
            Arc::clone(&completed),
            BackoffPolicy {
                threshold: 1000,
                pause: Duration::ZERO,
            },
        )
        .unwrap();

        let producer = {
            let work = Arc::clone(&work);
            std::thread::spawn(move || {
                for i in 0..iterations {
                    submit(&work, i % 7 + 1, i);
                }
            })
        };

        let mut failed = 0u64;
        for _ in 0..iterations {
            let item = completed.pop_one().unwrap();
            assert!(item.done);
            if item.error.is_some() {
                assert!(matches!(item.error, Some(WorkError::Resource(_))));
                failed += 1;
            }
        }
        producer.join().unwrap();
        work.close();
        pool.join();

        // 1-in-100 staging attempts were rejected; everything that was
        // staged got released exactly once.
        assert_eq!(failed, iterations / 100);
        assert_eq!(ledger.live_count(), 0);
    }

    #[test]
    fn test_batch_order_is_total_per_context() {
        let work = Arc::new(WorkQueue::unbounded());
        let completed = Arc::new(WorkQueue::unbounded());
        let factory = Arc::new(StubFactory {
            classes: 1,
            nboxes: 0,
            fail_sequences: vec![],
            ledger: DeviceLedger::new(),
            fail_every: 0,
        });

        for tag in 0..20u64 {
            submit(&work, 1, tag);
        }
        let pool = WorkerPool::spawn(
            factory,
            &[0],
            10,
            Arc::clone(&work),
            Arc::clone(&completed),
            default_backoff(),
        )
        .unwrap();

        // A single worker must preserve submission order end to end.
        for tag in 0..20u64 {
            assert_eq!(completed.pop_one().unwrap().tag, CallTag::new(tag));
        }
        work.close();
        pool.join();
    }

    struct UnbindableFactory;

    impl EngineFactory for UnbindableFactory {
        fn bind(&self, context: u32) -> Result<BoundContext, EngineError> {
            Err(EngineError::ContextLost(context))
        }
    }

    #[test]
    fn test_bind_failure_fails_pool_startup() {
        let work = Arc::new(WorkQueue::unbounded());
        let completed = Arc::new(WorkQueue::<WorkItem>::unbounded());

        let result = WorkerPool::spawn(
            Arc::new(UnbindableFactory),
            &[0],
            10,
            Arc::clone(&work),
            completed,
            default_backoff(),
        );

        match result {
            Err(PoolError::Bind { context, .. }) => assert_eq!(context, 0),
            other => panic!("expected Bind error, got {:?}", other.map(|_| "pool")),
        }
        // The work queue is closed; nothing can be queued for a pool that
        // never started, so no submission can hang on it.
        assert!(work.is_closed());
    }

    #[test]
    fn test_one_dead_context_fails_the_whole_pool() {
        struct HalfDeadFactory {
            ledger: Arc<DeviceLedger>,
        }

        impl EngineFactory for HalfDeadFactory {
            fn bind(&self, context: u32) -> Result<BoundContext, EngineError> {
                if context == 1 {
                    return Err(EngineError::ContextLost(context));
                }
                Ok(BoundContext {
                    engine: Box::new(StubEngine {
                        classes: 1,
                        nboxes: 1,
                        fail_sequences: vec![],
                    }),
                    memory: Some(Box::new(SyntheticMemory::new(Arc::clone(&self.ledger)))),
                })
            }
        }

        let work = Arc::new(WorkQueue::unbounded());
        let completed = Arc::new(WorkQueue::<WorkItem>::unbounded());
        let result = WorkerPool::spawn(
            Arc::new(HalfDeadFactory {
                ledger: DeviceLedger::new(),
            }),
            &[0, 1],
            10,
            Arc::clone(&work),
            completed,
            default_backoff(),
        );

        // The healthy worker is joined as part of the failure path.
        assert!(matches!(result, Err(PoolError::Bind { context: 1, .. })));
        assert!(work.is_closed());
    }

    #[test]
    fn test_multiple_contexts_share_the_queue() {
        let work = Arc::new(WorkQueue::unbounded());
        let completed = Arc::new(WorkQueue::unbounded());
        let factory = Arc::new(StubFactory {
            classes: 1,
            nboxes: 1,
            fail_sequences: vec![],
            ledger: DeviceLedger::new(),
            fail_every: 0,
        });

        let pool = WorkerPool::spawn(
            factory,
            &[0, 1],
            4,
            Arc::clone(&work),
            Arc::clone(&completed),
            default_backoff(),
        )
        .unwrap();

        let total = 200u64;
        for tag in 0..total {
            submit(&work, 1, tag);
        }

        let mut seen = std::collections::HashSet::new();
        for _ in 0..total {
            let item = completed.pop_one().unwrap();
            assert!(item.done);
            assert!(item.context == 0 || item.context == 1);
            assert!(seen.insert(item.tag), "tag delivered twice");
        }
        assert_eq!(seen.len(), total as usize);

        work.close();
        pool.join();
    }
}
