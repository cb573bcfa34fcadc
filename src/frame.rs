//! Frame buffers and the producer/consumer hand-off.
//!
//! - `Frame`: Immutable packed BGR image. Pixel bytes are private and never mutated after creation.
//! - `FrameQueue`: Bounded drop-oldest queue shared between the capture thread and the pipeline.
//!
//! The queue always holds the most recent N frames. When full, the oldest buffered
//! frame is evicted to admit the new one, so latency stays bounded under load.

use anyhow::{anyhow, Result};
use chrono::{DateTime, Utc};
use std::collections::VecDeque;
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

/// Default queue capacity. Small on purpose: the pipeline wants fresh frames, not all frames.
pub const DEFAULT_QUEUE_CAPACITY: usize = 2;

/// Bytes per pixel for the only supported pixel format (packed 8-bit BGR).
pub const CHANNELS: usize = 3;

// ----------------------------------------------------------------------------
// Frame
// ----------------------------------------------------------------------------

/// A captured video frame in packed BGR order.
///
/// There is no mutable access to the pixel buffer. Stages that need a modified
/// image (annotation) build a new `Frame` instead of touching this one.
#[derive(Debug)]
pub struct Frame {
    data: Vec<u8>,
    pub width: u32,
    pub height: u32,
    /// Capture order assigned by the producing source (1-based).
    pub sequence: u64,
    /// Wall-clock capture time.
    pub captured_at: DateTime<Utc>,
}

impl Frame {
    /// Wrap a packed BGR buffer. The buffer length must match `width * height * 3`.
    pub fn new(data: Vec<u8>, width: u32, height: u32, sequence: u64) -> Result<Self> {
        Self::with_timestamp(data, width, height, sequence, Utc::now())
    }

    pub fn with_timestamp(
        data: Vec<u8>,
        width: u32,
        height: u32,
        sequence: u64,
        captured_at: DateTime<Utc>,
    ) -> Result<Self> {
        let expected = expected_len(width, height)?;
        if data.len() != expected {
            return Err(anyhow!(
                "frame {}x{} expects {} BGR bytes, received {}",
                width,
                height,
                expected,
                data.len()
            ));
        }
        Ok(Self {
            data,
            width,
            height,
            sequence,
            captured_at,
        })
    }

    /// Uniformly filled frame, mostly useful for tests and placeholders.
    pub fn filled(width: u32, height: u32, bgr: [u8; 3], sequence: u64) -> Result<Self> {
        let expected = expected_len(width, height)?;
        let mut data = Vec::with_capacity(expected);
        for _ in 0..expected / CHANNELS {
            data.extend_from_slice(&bgr);
        }
        Self::new(data, width, height, sequence)
    }

    /// Read-only pixel access.
    pub fn pixels(&self) -> &[u8] {
        &self.data
    }

    /// BGR value at (x, y), or `None` outside the frame.
    pub fn pixel(&self, x: u32, y: u32) -> Option<[u8; 3]> {
        if x >= self.width || y >= self.height {
            return None;
        }
        let idx = (y as usize * self.width as usize + x as usize) * CHANNELS;
        Some([self.data[idx], self.data[idx + 1], self.data[idx + 2]])
    }

    pub fn resolution(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    pub fn byte_len(&self) -> usize {
        self.data.len()
    }
}

fn expected_len(width: u32, height: u32) -> Result<usize> {
    if width == 0 || height == 0 {
        return Err(anyhow!("frame dimensions must be non-zero"));
    }
    (width as usize)
        .checked_mul(height as usize)
        .and_then(|v| v.checked_mul(CHANNELS))
        .ok_or_else(|| anyhow!("frame dimensions overflow"))
}

// ----------------------------------------------------------------------------
// FrameQueue: bounded drop-oldest hand-off
// ----------------------------------------------------------------------------

/// Bounded queue between one producer and one consumer.
///
/// - `push` never blocks; when the queue is full the oldest frame is evicted.
/// - `pop_timeout` blocks up to the timeout for the next frame.
/// - After `close`, pops return `None` immediately and pushes are discarded.
pub struct FrameQueue {
    state: Mutex<QueueState>,
    available: Condvar,
    capacity: usize,
}

struct QueueState {
    frames: VecDeque<Frame>,
    dropped: u64,
    closed: bool,
}

impl FrameQueue {
    pub fn new(capacity: usize) -> Result<Self> {
        if capacity == 0 {
            return Err(anyhow!("frame queue capacity must be at least 1"));
        }
        Ok(Self {
            state: Mutex::new(QueueState {
                frames: VecDeque::with_capacity(capacity),
                dropped: 0,
                closed: false,
            }),
            available: Condvar::new(),
            capacity,
        })
    }

    /// Enqueue a frame, evicting the oldest one if the queue is full.
    ///
    /// Returns true when a frame was evicted to make room.
    pub fn push(&self, frame: Frame) -> bool {
        let mut state = self.lock();
        if state.closed {
            return false;
        }
        let mut evicted = false;
        while state.frames.len() >= self.capacity {
            state.frames.pop_front();
            state.dropped += 1;
            evicted = true;
        }
        state.frames.push_back(frame);
        drop(state);
        self.available.notify_one();
        evicted
    }

    /// Dequeue the oldest buffered frame, waiting up to `timeout`.
    pub fn pop_timeout(&self, timeout: Duration) -> Option<Frame> {
        let deadline = Instant::now() + timeout;
        let mut state = self.lock();
        loop {
            if state.closed {
                return None;
            }
            if let Some(frame) = state.frames.pop_front() {
                return Some(frame);
            }
            let now = Instant::now();
            if now >= deadline {
                return None;
            }
            let (guard, _) = self
                .available
                .wait_timeout(state, deadline - now)
                .unwrap_or_else(PoisonError::into_inner);
            state = guard;
        }
    }

    /// Discard all buffered frames. Returns how many were dropped.
    pub fn drain(&self) -> usize {
        let mut state = self.lock();
        let count = state.frames.len();
        state.frames.clear();
        count
    }

    /// Drain and reject further pushes; wakes any waiting consumer.
    pub fn close(&self) {
        let mut state = self.lock();
        state.closed = true;
        state.frames.clear();
        drop(state);
        self.available.notify_all();
    }

    pub fn reopen(&self) {
        self.lock().closed = false;
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    pub fn len(&self) -> usize {
        self.lock().frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().frames.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Frames evicted by the drop-oldest policy since creation.
    pub fn dropped(&self) -> u64 {
        self.lock().dropped
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
