use crate::config::EngineSettings;
use crate::frame::{DeviceAllocation, DeviceLedger, DeviceMemory, SyntheticMemory};
use crate::work::{BBox, Detection};
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    /// The engine failed on this item; the item resolves as done-with-error
    /// and the worker keeps running.
    #[error("inference failed: {0}")]
    Inference(String),
    /// The execution context is no longer usable; the worker retires.
    #[error("execution context {0} is unusable")]
    ContextLost(u32),
}

/// Borrowed view of one frame handed to the engine: geometry, host pixels,
/// and the staged device allocation when the context has a memory binding.
pub struct ImageView<'a> {
    pub width: u32,
    pub height: u32,
    pub channels: u32,
    pub data: &'a [f32],
    pub device: Option<&'a DeviceAllocation>,
}

pub struct EngineOutput {
    pub detections: Vec<Detection>,
    pub classes: u32,
}

/// The inference capability a worker drives. Implementations may block the
/// calling thread for a GPU-bound duration; each instance is owned by a
/// single worker thread and never shared.
pub trait InferenceEngine: Send {
    fn detect(&mut self, image: ImageView<'_>) -> Result<EngineOutput, EngineError>;
}

/// A worker's engine plus its optional device-memory binding, created on the
/// worker's own thread so context affinity is established where the work
/// will run.
pub struct BoundContext {
    pub engine: Box<dyn InferenceEngine>,
    pub memory: Option<Box<dyn DeviceMemory>>,
}

pub trait EngineFactory: Send + Sync + 'static {
    fn bind(&self, context: u32) -> Result<BoundContext, EngineError>;
}

/// Deterministic stand-in engine: emits a configured number of detections
/// whose boxes are derived from the frame geometry, with an optional
/// simulated GPU latency. Lets the full pipeline run and be load-tested
/// without hardware.
pub struct SyntheticEngine {
    classes: u32,
    detections_per_frame: usize,
    latency: Duration,
}

impl SyntheticEngine {
    pub fn new(classes: u32, detections_per_frame: usize, latency: Duration) -> Self {
        Self {
            classes,
            detections_per_frame,
            latency,
        }
    }
}

impl InferenceEngine for SyntheticEngine {
    fn detect(&mut self, image: ImageView<'_>) -> Result<EngineOutput, EngineError> {
        if !self.latency.is_zero() {
            std::thread::sleep(self.latency);
        }

        let detections = (0..self.detections_per_frame)
            .map(|i| {
                let offset = (i + 1) as f32 / (self.detections_per_frame + 1) as f32;
                Detection {
                    bbox: BBox {
                        x: offset * image.width as f32,
                        y: offset * image.height as f32,
                        w: image.width as f32 * 0.1,
                        h: image.height as f32 * 0.1,
                    },
                    classes: self.classes,
                    prob: vec![1.0 / self.classes as f32; self.classes as usize],
                }
            })
            .collect();

        Ok(EngineOutput {
            detections,
            classes: self.classes,
        })
    }
}

pub struct SyntheticEngineFactory {
    settings: EngineSettings,
}

impl SyntheticEngineFactory {
    pub fn new(settings: EngineSettings) -> Self {
        Self { settings }
    }
}

impl EngineFactory for SyntheticEngineFactory {
    fn bind(&self, context: u32) -> Result<BoundContext, EngineError> {
        tracing::info!(context, "binding synthetic engine");
        let engine = SyntheticEngine::new(
            self.settings.classes,
            self.settings.detections_per_frame,
            Duration::from_millis(self.settings.latency_ms),
        );
        // One ledger per context; handles never cross contexts.
        let memory = SyntheticMemory::new(DeviceLedger::new());
        Ok(BoundContext {
            engine: Box::new(engine),
            memory: Some(Box::new(memory)),
        })
    }
}
