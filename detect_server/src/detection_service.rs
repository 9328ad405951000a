use crate::correlator::{CallOutcome, ReplySink};
use crate::frame::Frame;
use crate::pipeline::{DetectionPipeline, SubmitError};
use crate::work::Detection;
use async_stream::try_stream;
use futures::Stream;
use std::pin::Pin;
use std::sync::Arc;
use tonic::{async_trait, Request, Response, Status};
use detect_proto::image_detection_server::ImageDetection;
use detect_proto::{BoundingBox, DetectedObject, DetectedObjects, KeyFrame};

/// gRPC surface of the detection pipeline. Each handler validates the frame
/// at ingestion, submits it with a oneshot delivery sink, and awaits the
/// call's terminal outcome.
pub struct DetectionService {
    pipeline: Arc<DetectionPipeline>,
}

impl DetectionService {
    pub fn new(pipeline: Arc<DetectionPipeline>) -> Self {
        Self { pipeline }
    }

    async fn submit_frame(
        &self,
        key_frame: KeyFrame,
    ) -> Result<(u32, u64, CallOutcome), Status> {
        let frame = Frame::new(
            key_frame.width,
            key_frame.height,
            key_frame.channels,
            key_frame.data,
            key_frame.stream_id,
            key_frame.sequence,
            key_frame.captured_at_ms,
        )
        .map_err(|e| Status::invalid_argument(e.to_string()))?;
        let stream_id = frame.stream_id;
        let sequence = frame.sequence;
        let frame = frame.with_span(tracing::debug_span!("detect_call", stream_id, sequence));

        let (tx, rx) = tokio::sync::oneshot::channel();
        let pipeline = Arc::clone(&self.pipeline);
        // The block backpressure policy may park the producer; keep that
        // wait off the async runtime threads.
        tokio::task::spawn_blocking(move || {
            pipeline.submit(frame, Box::new(ReplySink::new(tx)))
        })
        .await
        .map_err(|_| Status::internal("submission task failed"))?
        .map_err(|e| match e {
            SubmitError::Saturated => Status::resource_exhausted(e.to_string()),
            SubmitError::ShuttingDown => Status::unavailable(e.to_string()),
        })?;

        let outcome = rx
            .await
            .map_err(|_| Status::unavailable("pipeline stopped before delivery"))?;
        Ok((stream_id, sequence, outcome))
    }
}

#[async_trait]
impl ImageDetection for DetectionService {
    async fn detect(
        &self,
        request: Request<KeyFrame>,
    ) -> Result<Response<DetectedObjects>, Status> {
        let (stream_id, sequence, outcome) = self.submit_frame(request.into_inner()).await?;

        match outcome {
            CallOutcome::Completed {
                detections,
                classes,
                context,
            } => {
                tracing::debug!(
                    stream_id,
                    sequence,
                    nboxes = detections.len(),
                    "returning detections"
                );
                Ok(Response::new(DetectedObjects {
                    objects: detections.iter().map(to_proto).collect(),
                    classes,
                    context,
                    stream_id,
                    sequence,
                }))
            }
            CallOutcome::Failed { error, partial } => {
                // A unary response cannot carry payloads on an error
                // status, so the partial count rides in the message.
                Err(Status::internal(format!(
                    "{} ({} partial detections discarded)",
                    error,
                    partial.len()
                )))
            }
            CallOutcome::Canceled => Err(Status::cancelled("call canceled during shutdown")),
        }
    }

    type DetectStreamedStream =
        Pin<Box<dyn Stream<Item = Result<DetectedObject, Status>> + Send>>;

    async fn detect_streamed(
        &self,
        request: Request<KeyFrame>,
    ) -> Result<Response<Self::DetectStreamedStream>, Status> {
        let (stream_id, sequence, outcome) = self.submit_frame(request.into_inner()).await?;

        let output_stream = try_stream! {
            match outcome {
                CallOutcome::Completed { detections, .. } => {
                    tracing::debug!(
                        stream_id,
                        sequence,
                        nboxes = detections.len(),
                        "streaming detections"
                    );
                    for detection in &detections {
                        yield to_proto(detection);
                    }
                }
                CallOutcome::Failed { error, partial } => {
                    // Partials are surfaced before the terminal error so the
                    // caller can tell "partial data, then failure" apart
                    // from "no data at all".
                    for detection in &partial {
                        yield to_proto(detection);
                    }
                    Err(Status::internal(error.to_string()))?;
                }
                CallOutcome::Canceled => {
                    Err(Status::cancelled("call canceled during shutdown"))?;
                }
            }
        };

        Ok(Response::new(Box::pin(output_stream)))
    }
}

fn to_proto(detection: &Detection) -> DetectedObject {
    DetectedObject {
        bbox: Some(BoundingBox {
            x: detection.bbox.x,
            y: detection.bbox.y,
            w: detection.bbox.w,
            h: detection.bbox.h,
        }),
        classes: detection.classes,
        prob: detection.prob.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Backpressure, EngineKind, EngineSettings, PipelineSettings};
    use crate::engine::{
        BoundContext, EngineError, EngineFactory, EngineOutput, ImageView, InferenceEngine,
        SyntheticEngineFactory,
    };
    use futures::StreamExt;

    fn start_pipeline(factory: Arc<dyn EngineFactory>) -> Arc<DetectionPipeline> {
        let settings = PipelineSettings {
            contexts: vec![0],
            batch_limit: 10,
            queue_capacity: None,
            backpressure: Backpressure::Block,
            backoff_threshold: 3,
            backoff_ms: 1,
        };
        Arc::new(DetectionPipeline::start(&settings, factory).unwrap())
    }

    fn synthetic_service() -> DetectionService {
        let factory = Arc::new(SyntheticEngineFactory::new(EngineSettings {
            kind: EngineKind::Synthetic,
            classes: 80,
            detections_per_frame: 2,
            latency_ms: 0,
        }));
        DetectionService::new(start_pipeline(factory))
    }

    fn key_frame() -> KeyFrame {
        KeyFrame {
            width: 32,
            height: 32,
            channels: 3,
            data: vec![0.0; 32 * 32 * 3],
            stream_id: 1,
            sequence: 42,
            captured_at_ms: 12345,
        }
    }

    #[tokio::test]
    async fn test_detect_returns_synthetic_detections() -> Result<(), Box<dyn std::error::Error>> {
        let service = synthetic_service();

        let response = service.detect(Request::new(key_frame())).await?;
        let objects = response.into_inner();

        assert_eq!(objects.objects.len(), 2);
        assert_eq!(objects.classes, 80);
        assert_eq!(objects.stream_id, 1);
        assert_eq!(objects.sequence, 42);
        assert_eq!(objects.objects[0].prob.len(), 80);
        Ok(())
    }

    #[tokio::test]
    async fn test_detect_rejects_bad_geometry() {
        let service = synthetic_service();

        let mut bad = key_frame();
        bad.data.truncate(100);
        let status = service.detect(Request::new(bad)).await.unwrap_err();
        assert_eq!(status.code(), tonic::Code::InvalidArgument);
    }

    #[tokio::test]
    async fn test_detect_streamed_yields_one_message_per_detection(
    ) -> Result<(), Box<dyn std::error::Error>> {
        let service = synthetic_service();

        let response = service.detect_streamed(Request::new(key_frame())).await?;
        let mut stream = response.into_inner();

        let mut received = 0;
        while let Some(message) = stream.next().await {
            let object = message?;
            assert_eq!(object.classes, 80);
            assert!(object.bbox.is_some());
            received += 1;
        }
        assert_eq!(received, 2);
        Ok(())
    }

    struct FailingEngine;

    impl InferenceEngine for FailingEngine {
        fn detect(&mut self, _image: ImageView<'_>) -> Result<EngineOutput, EngineError> {
            Err(EngineError::Inference("stub failure".into()))
        }
    }

    struct FailingFactory;

    impl EngineFactory for FailingFactory {
        fn bind(&self, _context: u32) -> Result<BoundContext, EngineError> {
            Ok(BoundContext {
                engine: Box::new(FailingEngine),
                memory: None,
            })
        }
    }

    #[tokio::test]
    async fn test_engine_failure_maps_to_terminal_status() {
        let service = DetectionService::new(start_pipeline(Arc::new(FailingFactory)));

        let status = service
            .detect(Request::new(key_frame()))
            .await
            .unwrap_err();
        assert_eq!(status.code(), tonic::Code::Internal);
        assert!(status.message().contains("stub failure"));
    }

    #[tokio::test]
    async fn test_streamed_failure_terminates_with_error() {
        let service = DetectionService::new(start_pipeline(Arc::new(FailingFactory)));

        let response = service
            .detect_streamed(Request::new(key_frame()))
            .await
            .unwrap();
        let mut stream = response.into_inner();

        let last = loop {
            match stream.next().await {
                Some(Ok(_)) => continue,
                Some(Err(status)) => break status,
                None => panic!("stream ended without a terminal error"),
            }
        };
        assert_eq!(last.code(), tonic::Code::Internal);
    }
}
