use crate::frame::Frame;
use std::fmt;
use std::time::Instant;
use thiserror::Error;

/// Correlation tag issued by the call table from a monotonic counter. Tags
/// are never reused, so an in-flight tag is always unique among outstanding
/// calls and safe to use as a map key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CallTag(u64);

impl CallTag {
    pub(crate) fn new(value: u64) -> Self {
        Self(value)
    }
}

impl fmt::Display for CallTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BBox {
    pub x: f32,
    pub y: f32,
    pub w: f32,
    pub h: f32,
}

/// One detected object: bounding box plus per-class probabilities.
#[derive(Debug, Clone, PartialEq)]
pub struct Detection {
    pub bbox: BBox,
    pub classes: u32,
    pub prob: Vec<f32>,
}

/// Terminal per-item error carried inside a completed WorkItem. Cloneable so
/// it can travel alongside any partial results already produced.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum WorkError {
    #[error("inference failed: {0}")]
    Engine(String),
    #[error("device resources exhausted: {0}")]
    Resource(String),
    #[error("execution context retired before the item was processed")]
    ContextRetired,
    #[error("item reached the correlator without a completion flag")]
    NotCompleted,
}

/// Unit of work moving through the pipeline: one frame plus its in-flight
/// detection state and the tag that matches it back to the waiting call.
///
/// Lifecycle: pending (work queue) -> in-flight (claimed by exactly one
/// worker) -> done (completion fields populated) -> retired (consumed once
/// by the correlator). Every submitted item reaches the completion queue
/// with `done = true`, carrying either detections or an error.
#[derive(Debug)]
pub struct WorkItem {
    pub frame: Frame,
    pub done: bool,
    pub detections: Vec<Detection>,
    pub classes: u32,
    pub context: u32,
    pub tag: CallTag,
    pub error: Option<WorkError>,
    pub enqueued_at: Instant,
}

impl WorkItem {
    pub fn new(frame: Frame, tag: CallTag) -> Self {
        Self {
            frame,
            done: false,
            detections: Vec::new(),
            classes: 0,
            context: 0,
            tag,
            error: None,
            enqueued_at: Instant::now(),
        }
    }

    pub fn complete(&mut self, detections: Vec<Detection>, classes: u32, context: u32) {
        self.detections = detections;
        self.classes = classes;
        self.context = context;
        self.error = None;
        self.done = true;
    }

    /// Terminal failure: the item still reaches the completion queue so the
    /// caller always receives a response. Any detections already populated
    /// are kept as partial results.
    pub fn fail(&mut self, context: u32, error: WorkError) {
        self.context = context;
        self.error = Some(error);
        self.done = true;
    }
}
