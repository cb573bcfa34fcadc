//! Live frame source.
//!
//! This module provides `LiveSource`, which reads a network stream on a dedicated
//! capture thread and hands frames to the pipeline through a bounded drop-oldest queue.
//!
//! The live source is responsible for:
//! - Opening the stream through a `CaptureOpener`
//! - Reading frames on its own thread so the pipeline never blocks on the network
//! - Keeping only the freshest `queue_capacity` frames
//! - Reconnecting after any read failure, forever, with a fixed delay
//!
//! Connection states:
//!
//! ```text
//! Disconnected -> Connecting -> Streaming -(read failure)-> Disconnected -(delay)-> Connecting ...
//! ```
//!
//! `Stopped` is terminal and reachable from every state via `stop()`.

use anyhow::{anyhow, Result};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use super::{FrameSource, SourceStats};
use crate::frame::{Frame, FrameQueue};

/// Longest single sleep while waiting to reconnect. Bounds how long `stop()` can wait.
const STOP_POLL_INTERVAL: Duration = Duration::from_millis(100);

// ----------------------------------------------------------------------------
// Capture seam
// ----------------------------------------------------------------------------

/// An open stream handle. Only ever touched while holding the source's handle lock.
pub trait Capture: Send {
    /// Blocking read of the next decoded frame. Any error ends this handle.
    fn read(&mut self) -> Result<Frame>;

    /// Negotiated stream resolution.
    fn resolution(&self) -> (u32, u32);

    fn is_open(&self) -> bool;

    /// Release decoder resources. Called exactly once before the handle is dropped.
    fn release(&mut self);
}

/// Opens stream handles for a URL.
pub trait CaptureOpener: Send + Sync {
    fn open(&self, url: &str) -> Result<Box<dyn Capture>>;
}

/// Connection state of a live source.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Streaming,
    Stopped,
}

/// Tuning for a live source.
#[derive(Clone, Debug)]
pub struct LiveSettings {
    pub queue_capacity: usize,
    /// Fixed wait between a failure and the next connection attempt.
    pub reconnect_delay: Duration,
    /// Upper bound on how long `stop()` waits for the capture thread.
    pub stop_timeout: Duration,
}

impl Default for LiveSettings {
    fn default() -> Self {
        Self {
            queue_capacity: crate::frame::DEFAULT_QUEUE_CAPACITY,
            reconnect_delay: Duration::from_secs(5),
            stop_timeout: Duration::from_secs(5),
        }
    }
}

// ----------------------------------------------------------------------------
// LiveSource
// ----------------------------------------------------------------------------

/// Live frame source with a background capture thread.
pub struct LiveSource {
    shared: Arc<Shared>,
    worker: Option<JoinHandle<()>>,
    stop_timeout: Duration,
}

struct Shared {
    url: String,
    opener: Box<dyn CaptureOpener>,
    /// The one lock guarding handle open/release/replace and every resolution/connectivity read.
    capture: Mutex<Option<Box<dyn Capture>>>,
    queue: FrameQueue,
    running: AtomicBool,
    stopped: AtomicBool,
    reconnect_delay: Duration,
    status: Mutex<CaptureStatus>,
}

#[derive(Default)]
struct CaptureStatus {
    state: ConnectionState,
    frames_captured: u64,
    connection_errors: u64,
    reconnect_attempts: u64,
    fps: f64,
    window_frames: u64,
    window_start: Option<Instant>,
}

enum ReadOutcome {
    Frame(Frame),
    Failed(anyhow::Error),
    NoHandle,
}

impl LiveSource {
    pub fn new(url: &str, opener: Box<dyn CaptureOpener>, settings: LiveSettings) -> Result<Self> {
        if url.trim().is_empty() {
            return Err(anyhow!("live source url must not be empty"));
        }
        let queue = FrameQueue::new(settings.queue_capacity)?;
        Ok(Self {
            shared: Arc::new(Shared {
                url: url.to_string(),
                opener,
                capture: Mutex::new(None),
                queue,
                running: AtomicBool::new(false),
                stopped: AtomicBool::new(false),
                reconnect_delay: settings.reconnect_delay,
                status: Mutex::new(CaptureStatus::default()),
            }),
            worker: None,
            stop_timeout: settings.stop_timeout,
        })
    }

    pub fn url(&self) -> &str {
        &self.shared.url
    }

    pub fn state(&self) -> ConnectionState {
        self.shared.status().state
    }

    /// Frames currently buffered (never more than the queue capacity).
    pub fn buffered(&self) -> usize {
        self.shared.queue.len()
    }

    fn join_worker(&mut self) {
        let Some(handle) = self.worker.take() else {
            return;
        };
        let deadline = Instant::now() + self.stop_timeout;
        while !handle.is_finished() && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(10));
        }
        if handle.is_finished() {
            if handle.join().is_err() {
                log::error!("capture thread for {} panicked", self.shared.url);
            }
        } else {
            log::warn!(
                "capture thread for {} did not exit within {:?}; detaching",
                self.shared.url,
                self.stop_timeout
            );
        }
    }
}

impl FrameSource for LiveSource {
    fn name(&self) -> &'static str {
        "live"
    }

    fn start(&mut self) -> Result<()> {
        if self.shared.stopped.load(Ordering::SeqCst) {
            return Err(anyhow!("live source {} was stopped", self.shared.url));
        }
        if self.shared.running.load(Ordering::SeqCst) {
            return Ok(());
        }

        self.shared.set_state(ConnectionState::Connecting);
        if let Err(e) = self.shared.connect() {
            self.shared.set_state(ConnectionState::Disconnected);
            return Err(e);
        }
        self.shared.set_state(ConnectionState::Streaming);

        self.shared.running.store(true, Ordering::SeqCst);
        let shared = self.shared.clone();
        let handle = std::thread::Builder::new()
            .name("ppe-capture".to_string())
            .spawn(move || shared.read_loop())
            .map_err(|e| {
                self.shared.running.store(false, Ordering::SeqCst);
                anyhow!("spawn capture thread: {}", e)
            })?;
        self.worker = Some(handle);

        log::info!("LiveSource: started reading from {}", self.shared.url);
        Ok(())
    }

    fn stop(&mut self) {
        if self.shared.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        self.shared.running.store(false, Ordering::SeqCst);
        self.join_worker();

        if let Some(mut capture) = self.shared.lock_capture().take() {
            capture.release();
        }
        self.shared.queue.close();
        self.shared.set_state(ConnectionState::Stopped);
        log::info!("LiveSource: stopped {}", self.shared.url);
    }

    fn get_frame(&mut self, timeout: Duration) -> Option<Frame> {
        self.shared.queue.pop_timeout(timeout)
    }

    fn resolution(&self) -> (u32, u32) {
        match self.shared.lock_capture().as_ref() {
            Some(capture) if capture.is_open() => capture.resolution(),
            _ => (0, 0),
        }
    }

    fn is_connected(&self) -> bool {
        self.shared
            .lock_capture()
            .as_ref()
            .is_some_and(|capture| capture.is_open())
    }

    fn stats(&self) -> SourceStats {
        let status = self.shared.status();
        SourceStats {
            frames_captured: status.frames_captured,
            fps: status.fps,
            frames_dropped: self.shared.queue.dropped(),
            connection_errors: status.connection_errors,
            reconnect_attempts: status.reconnect_attempts,
            state: status.state,
        }
    }
}

impl Drop for LiveSource {
    fn drop(&mut self) {
        self.stop();
    }
}

// ----------------------------------------------------------------------------
// Capture thread
// ----------------------------------------------------------------------------

impl Shared {
    fn read_loop(&self) {
        let mut sequence = 0u64;
        while self.running.load(Ordering::SeqCst) {
            match self.read_once() {
                ReadOutcome::Frame(mut frame) => {
                    sequence += 1;
                    frame.sequence = sequence;
                    self.queue.push(frame);
                    self.record_frame();
                    continue;
                }
                ReadOutcome::Failed(e) => {
                    log::warn!("LiveSource: frame read failed on {}: {:#}", self.url, e);
                }
                ReadOutcome::NoHandle => {}
            }

            self.set_state(ConnectionState::Disconnected);
            log::info!(
                "LiveSource: reconnecting to {} in {:?}",
                self.url,
                self.reconnect_delay
            );
            if !self.sleep_while_running(self.reconnect_delay) {
                break;
            }

            self.set_state(ConnectionState::Connecting);
            self.status_mut().reconnect_attempts += 1;
            match self.connect() {
                Ok(()) => self.set_state(ConnectionState::Streaming),
                Err(e) => {
                    log::warn!("LiveSource: reconnect to {} failed: {:#}", self.url, e);
                    self.set_state(ConnectionState::Disconnected);
                }
            }
        }
    }

    /// Read one frame under the handle lock. A failed handle is released and cleared here.
    fn read_once(&self) -> ReadOutcome {
        let mut guard = self.lock_capture();
        let Some(capture) = guard.as_mut() else {
            return ReadOutcome::NoHandle;
        };
        if !capture.is_open() {
            capture.release();
            *guard = None;
            return ReadOutcome::NoHandle;
        }
        match capture.read() {
            Ok(frame) => ReadOutcome::Frame(frame),
            Err(e) => {
                capture.release();
                *guard = None;
                ReadOutcome::Failed(e)
            }
        }
    }

    /// Replace the handle with a freshly opened one.
    fn connect(&self) -> Result<()> {
        let mut guard = self.lock_capture();
        if let Some(mut old) = guard.take() {
            old.release();
        }
        match self.opener.open(&self.url) {
            Ok(capture) => {
                let (w, h) = capture.resolution();
                *guard = Some(capture);
                drop(guard);
                log::info!("LiveSource: connected to {} ({}x{})", self.url, w, h);
                Ok(())
            }
            Err(e) => {
                drop(guard);
                self.status_mut().connection_errors += 1;
                Err(e.context(format!("connect to {}", self.url)))
            }
        }
    }

    /// Sleep in short slices, returning false as soon as a stop is requested.
    fn sleep_while_running(&self, total: Duration) -> bool {
        let deadline = Instant::now() + total;
        loop {
            if !self.running.load(Ordering::SeqCst) {
                return false;
            }
            let now = Instant::now();
            if now >= deadline {
                return true;
            }
            std::thread::sleep((deadline - now).min(STOP_POLL_INTERVAL));
        }
    }

    fn record_frame(&self) {
        let mut status = self.status_mut();
        status.frames_captured += 1;
        status.window_frames += 1;
        let now = Instant::now();
        let start = *status.window_start.get_or_insert(now);
        let elapsed = now.duration_since(start);
        if elapsed >= Duration::from_secs(1) {
            status.fps = status.window_frames as f64 / elapsed.as_secs_f64();
            status.window_frames = 0;
            status.window_start = Some(now);
        }
    }

    fn set_state(&self, state: ConnectionState) {
        let mut status = self.status_mut();
        if status.state != ConnectionState::Stopped {
            status.state = state;
        }
    }

    fn lock_capture(&self) -> MutexGuard<'_, Option<Box<dyn Capture>>> {
        self.capture.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn status_mut(&self) -> MutexGuard<'_, CaptureStatus> {
        self.status.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn status(&self) -> MutexGuard<'_, CaptureStatus> {
        self.status_mut()
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
