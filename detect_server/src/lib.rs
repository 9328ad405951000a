mod correlator;
mod detection_service;
mod dispatcher;
mod engine;
mod frame;
mod pipeline;
mod queue;
mod server;
mod timing;
mod work;

pub mod config;

pub use correlator::{CallOutcome, DeliverySink, ReplySink};
pub use engine::{
    BoundContext, EngineError, EngineFactory, EngineOutput, ImageView, InferenceEngine,
};
pub use frame::{DeviceAllocation, DeviceMemory, Frame, FrameError, ResourceError};
pub use pipeline::{DetectionPipeline, PipelineError, SubmitError};
pub use server::start_server;
pub use work::{BBox, CallTag, Detection, WorkError};
