use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tracing::Span;

#[derive(Debug, Error, PartialEq)]
pub enum FrameError {
    #[error(
        "frame geometry {width}x{height}x{channels} does not match buffer length {buffer_len}"
    )]
    GeometryMismatch {
        width: u32,
        height: u32,
        channels: u32,
        buffer_len: usize,
    },
    #[error("frame geometry {width}x{height}x{channels} has a zero dimension")]
    ZeroDimension {
        width: u32,
        height: u32,
        channels: u32,
    },
}

#[derive(Debug, Error)]
pub enum ResourceError {
    /// Device allocation or transfer failed; recoverable per item, escalated
    /// to a backoff for the owning context when it recurs.
    #[error("device {device} allocation failed")]
    Exhausted { device: u32 },
    /// The execution context itself is no longer usable.
    #[error("execution context {device} lost")]
    ContextLost { device: u32 },
}

/// Handle to a device-resident copy of a frame's pixels. The `owned` flag is
/// the single source of truth for release responsibility: `take_ownership`
/// clears it so a second release attempt becomes a no-op detectable by the
/// caller.
#[derive(Debug)]
pub struct DeviceAllocation {
    pub handle: u64,
    pub device: u32,
    pub len: usize,
    owned: bool,
}

impl DeviceAllocation {
    pub fn new(handle: u64, device: u32, len: usize) -> Self {
        Self {
            handle,
            device,
            len,
            owned: true,
        }
    }

    pub fn is_owned(&self) -> bool {
        self.owned
    }

    /// Check-and-clear: returns true exactly once per allocation.
    pub fn take_ownership(&mut self) -> bool {
        std::mem::replace(&mut self.owned, false)
    }
}

/// Device-memory capability bound to one execution context. Staging and
/// release are only ever invoked from that context's worker thread.
pub trait DeviceMemory: Send {
    fn stage(&mut self, pixels: &[f32], device: u32) -> Result<DeviceAllocation, ResourceError>;
    fn release(&mut self, allocation: &DeviceAllocation) -> Result<(), ResourceError>;
}

/// Shared bookkeeping behind [`SyntheticMemory`]: which handles are live,
/// exposed so tests can assert the net allocation count returns to zero.
#[derive(Debug, Default)]
pub struct DeviceLedger {
    next_handle: AtomicU64,
    live: parking_lot::Mutex<HashSet<u64>>,
}

impl DeviceLedger {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn live_count(&self) -> usize {
        self.live.lock().len()
    }

    fn allocate(&self) -> u64 {
        let handle = self.next_handle.fetch_add(1, Ordering::Relaxed);
        self.live.lock().insert(handle);
        handle
    }

    fn free(&self, handle: u64) -> bool {
        self.live.lock().remove(&handle)
    }
}

/// Stand-in device-memory implementation backing the synthetic engine:
/// allocations are ledger entries rather than GPU buffers. `fail_every = n`
/// makes every n-th staging attempt report exhaustion, which is the fault
/// injection vehicle for the single-release invariant tests.
pub struct SyntheticMemory {
    ledger: Arc<DeviceLedger>,
    fail_every: u64,
    attempts: u64,
}

impl SyntheticMemory {
    pub fn new(ledger: Arc<DeviceLedger>) -> Self {
        Self {
            ledger,
            fail_every: 0,
            attempts: 0,
        }
    }

    pub fn failing_every(ledger: Arc<DeviceLedger>, fail_every: u64) -> Self {
        Self {
            ledger,
            fail_every,
            attempts: 0,
        }
    }
}

impl DeviceMemory for SyntheticMemory {
    fn stage(&mut self, pixels: &[f32], device: u32) -> Result<DeviceAllocation, ResourceError> {
        self.attempts += 1;
        if self.fail_every > 0 && self.attempts % self.fail_every == 0 {
            return Err(ResourceError::Exhausted { device });
        }
        let handle = self.ledger.allocate();
        Ok(DeviceAllocation::new(handle, device, pixels.len()))
    }

    fn release(&mut self, allocation: &DeviceAllocation) -> Result<(), ResourceError> {
        if self.ledger.free(allocation.handle) {
            Ok(())
        } else {
            // A handle missing from the ledger means a double release.
            Err(ResourceError::ContextLost {
                device: allocation.device,
            })
        }
    }
}

/// One decoded video frame moving through the pipeline.
///
/// Host pixels are owned and freed on drop. The optional device allocation
/// is attached by the dispatcher while staging and must be released on the
/// same execution context, exactly once, after the engine has finished
/// reading it. The span brackets timing only; no core logic depends on it.
#[derive(Debug)]
pub struct Frame {
    pub width: u32,
    pub height: u32,
    pub channels: u32,
    pub data: Vec<f32>,
    pub stream_id: u32,
    pub sequence: u64,
    pub captured_at_ms: i64,
    pub device: Option<DeviceAllocation>,
    pub span: Span,
}

impl Frame {
    /// Validates declared geometry against the actual buffer length before
    /// the frame can reach any queue.
    pub fn new(
        width: u32,
        height: u32,
        channels: u32,
        data: Vec<f32>,
        stream_id: u32,
        sequence: u64,
        captured_at_ms: i64,
    ) -> Result<Self, FrameError> {
        if width == 0 || height == 0 || channels == 0 {
            return Err(FrameError::ZeroDimension {
                width,
                height,
                channels,
            });
        }
        let expected = width as usize * height as usize * channels as usize;
        if data.len() != expected {
            return Err(FrameError::GeometryMismatch {
                width,
                height,
                channels,
                buffer_len: data.len(),
            });
        }
        Ok(Self {
            width,
            height,
            channels,
            data,
            stream_id,
            sequence,
            captured_at_ms,
            device: None,
            span: Span::none(),
        })
    }

    pub fn with_span(mut self, span: Span) -> Self {
        self.span = span;
        self
    }
}
