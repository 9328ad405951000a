use std::time::Instant;

/// Wall-clock stopwatch bracketing one span of pipeline work (queue wait,
/// engine invocation, end-to-end call latency). Measurements are reported
/// as structured tracing fields by the caller.
#[derive(Debug, Clone, Copy)]
pub struct Stopwatch {
    started: Instant,
}

impl Stopwatch {
    pub fn start() -> Self {
        Self {
            started: Instant::now(),
        }
    }

    pub fn elapsed_ms(&self) -> f64 {
        self.started.elapsed().as_secs_f64() * 1000.0
    }
}
