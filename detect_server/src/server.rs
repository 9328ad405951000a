use crate::config::{EngineKind, Settings};
use crate::detection_service::DetectionService;
use crate::engine::{EngineFactory, SyntheticEngineFactory};
use crate::pipeline::DetectionPipeline;
use detect_proto::image_detection_server::ImageDetectionServer;
use std::sync::Arc;
use tokio::signal;
use tonic::transport::server::Router;
use tonic::transport::Server;
use tonic_health::server::HealthReporter;

pub struct GrpcServer {
    router: Router,
    addr: String,
    pipeline: Arc<DetectionPipeline>,
    health_reporter: HealthReporter,
}

impl GrpcServer {
    pub fn new(pipeline: Arc<DetectionPipeline>, addr: &str) -> Self {
        let detection_service = DetectionService::new(Arc::clone(&pipeline));
        let reflection_service = tonic_reflection::server::Builder::configure()
            .register_encoded_file_descriptor_set(detect_proto::FILE_DESCRIPTOR_SET)
            .build_v1alpha()
            .unwrap();
        let (health_reporter, health_service) = tonic_health::server::health_reporter();
        let router = Server::builder()
            .add_service(ImageDetectionServer::new(detection_service))
            .add_service(reflection_service)
            .add_service(health_service);

        Self {
            router,
            addr: addr.to_string(),
            pipeline,
            health_reporter,
        }
    }

    pub async fn run(self) -> Result<(), Box<dyn std::error::Error>> {
        let Self {
            router,
            addr,
            pipeline,
            mut health_reporter,
        } = self;
        let socket_addr = addr.parse().expect("failed to parse address");

        health_reporter
            .set_serving::<ImageDetectionServer<DetectionService>>()
            .await;
        tracing::info!("Detection service listening on {}", addr);

        let shutdown = async move {
            shutdown_signal().await;
            health_reporter
                .set_not_serving::<ImageDetectionServer<DetectionService>>()
                .await;
            tracing::info!("Shutdown signal received, starting graceful shutdown")
        };

        router.serve_with_shutdown(socket_addr, shutdown).await?;

        // The listener has drained; let in-flight detections finish and
        // cancel whatever never resolved.
        pipeline.shutdown();
        Ok(())
    }
}

pub async fn start_server(settings: Settings) -> Result<(), Box<dyn std::error::Error>> {
    let factory: Arc<dyn EngineFactory> = match settings.engine.kind {
        EngineKind::Synthetic => Arc::new(SyntheticEngineFactory::new(settings.engine.clone())),
    };
    let pipeline = Arc::new(
        DetectionPipeline::start(&settings.pipeline, factory)
            .expect("failed to start detection pipeline"),
    );

    let addr = settings.service.get_address();
    let grpc_server = GrpcServer::new(pipeline, &addr);
    tracing::info!("Listening on {}", &addr);

    grpc_server.run().await?;

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
