use anyhow::{anyhow, Result};
use clap::Parser;
use detect_proto::image_detection_client::ImageDetectionClient;
use detect_proto::KeyFrame;
use futures::StreamExt;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tokio::time::{sleep, timeout};
use tonic::transport::Channel;
use tonic::Request;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Synthetic multi-stream load client: one task per logical stream, each
/// issuing sequenced detection calls against the server and reporting
/// per-stream latency at the end.
#[derive(Parser, Debug, Clone)]
#[command(name = "detect_client")]
struct Args {
    /// Server endpoint.
    #[arg(long, default_value = "http://127.0.0.1:50051")]
    addr: String,

    /// Number of concurrent logical streams.
    #[arg(long, default_value_t = 4)]
    streams: u32,

    /// Frames submitted per stream.
    #[arg(long, default_value_t = 100)]
    frames: u64,

    #[arg(long, default_value_t = 416)]
    width: u32,

    #[arg(long, default_value_t = 416)]
    height: u32,

    #[arg(long, default_value_t = 3)]
    channels: u32,

    /// Pause between frames of one stream; 0 submits back to back.
    #[arg(long, default_value_t = 0)]
    interval_ms: u64,

    /// Use the server-streaming RPC (one message per detection).
    #[arg(long)]
    streamed: bool,
}

#[derive(Debug, Default)]
struct StreamSummary {
    sent: u64,
    ok: u64,
    failed: u64,
    detections: u64,
    total_latency_ms: f64,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();
    tracing::info!(
        streams = args.streams,
        frames = args.frames,
        addr = %args.addr,
        streamed = args.streamed,
        "starting load run"
    );

    let started = Instant::now();
    let mut tasks = Vec::new();
    for stream_id in 0..args.streams {
        let args = args.clone();
        tasks.push(tokio::spawn(run_stream(stream_id, args)));
    }

    let mut total = StreamSummary::default();
    for (stream_id, task) in tasks.into_iter().enumerate() {
        match task.await? {
            Ok(summary) => {
                let mean_ms = if summary.ok > 0 {
                    summary.total_latency_ms / summary.ok as f64
                } else {
                    0.0
                };
                tracing::info!(
                    stream_id,
                    sent = summary.sent,
                    ok = summary.ok,
                    failed = summary.failed,
                    detections = summary.detections,
                    mean_latency_ms = format!("{:.2}", mean_ms),
                    "stream finished"
                );
                total.sent += summary.sent;
                total.ok += summary.ok;
                total.failed += summary.failed;
                total.detections += summary.detections;
                total.total_latency_ms += summary.total_latency_ms;
            }
            Err(e) => {
                tracing::error!(stream_id, error = %e, "stream aborted");
            }
        }
    }

    let elapsed = started.elapsed().as_secs_f64();
    tracing::info!(
        sent = total.sent,
        ok = total.ok,
        failed = total.failed,
        detections = total.detections,
        throughput_fps = format!("{:.1}", total.ok as f64 / elapsed.max(f64::EPSILON)),
        "load run complete"
    );

    if total.failed > 0 {
        return Err(anyhow!("{} of {} calls failed", total.failed, total.sent));
    }
    Ok(())
}

async fn run_stream(stream_id: u32, args: Args) -> Result<StreamSummary> {
    let mut client = get_client(args.addr.clone()).await?;
    let mut summary = StreamSummary::default();

    for sequence in 0..args.frames {
        let frame = synthetic_frame(&args, stream_id, sequence);
        let call_start = Instant::now();
        summary.sent += 1;

        let result = if args.streamed {
            detect_streamed(&mut client, frame).await
        } else {
            detect_unary(&mut client, frame).await
        };

        match result {
            Ok(nboxes) => {
                summary.ok += 1;
                summary.detections += nboxes;
                summary.total_latency_ms += call_start.elapsed().as_secs_f64() * 1000.0;
            }
            Err(status) => {
                summary.failed += 1;
                tracing::warn!(stream_id, sequence, error = %status, "call failed");
            }
        }

        if args.interval_ms > 0 {
            sleep(Duration::from_millis(args.interval_ms)).await;
        }
    }

    Ok(summary)
}

async fn detect_unary(
    client: &mut ImageDetectionClient<Channel>,
    frame: KeyFrame,
) -> Result<u64, tonic::Status> {
    let response = client.detect(Request::new(frame)).await?;
    Ok(response.into_inner().objects.len() as u64)
}

async fn detect_streamed(
    client: &mut ImageDetectionClient<Channel>,
    frame: KeyFrame,
) -> Result<u64, tonic::Status> {
    let response = client.detect_streamed(Request::new(frame)).await?;
    let mut stream = response.into_inner();
    let mut nboxes = 0;
    while let Some(message) = stream.next().await {
        message?;
        nboxes += 1;
    }
    Ok(nboxes)
}

async fn get_client(address: String) -> Result<ImageDetectionClient<Channel>> {
    let mut retry_delay = Duration::from_millis(50);
    let max_retry_delay = Duration::from_secs(1);
    let max_retries = 10;
    let mut retry_count = 0;

    while retry_count < max_retries {
        match timeout(
            Duration::from_secs(1),
            ImageDetectionClient::connect(address.clone()),
        )
        .await
        {
            Ok(Ok(client)) => return Ok(client),
            Ok(Err(e)) => {
                tracing::error!("Failed to connect to gRPC server: {:?}", e);
            }
            Err(_) => {
                tracing::error!("Connection timeout");
            }
        }

        retry_count += 1;
        let jitter = rand::random::<f32>() * 0.2 + 0.9;
        sleep(retry_delay.mul_f32(jitter)).await;
        retry_delay = (retry_delay * 2).min(max_retry_delay);
    }

    Err(anyhow!("maximum connection retries exceeded"))
}

fn synthetic_frame(args: &Args, stream_id: u32, sequence: u64) -> KeyFrame {
    let len = args.width as usize * args.height as usize * args.channels as usize;
    // A per-frame gradient keeps payloads distinct without an image decoder.
    let seed = (sequence % 255) as f32 / 255.0;
    let data = (0..len).map(|i| (seed + i as f32) % 1.0).collect();

    let captured_at_ms = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64;

    KeyFrame {
        width: args.width,
        height: args.height,
        channels: args.channels,
        data,
        stream_id,
        sequence,
        captured_at_ms,
    }
}
