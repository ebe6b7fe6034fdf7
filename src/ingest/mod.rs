//! Frame ingestion.
//!
//! A `FrameSource` is either an external raw-video producer (a camera tool
//! writing frames to stdout) or a synthetic `stub://` scene for tests and
//! bench runs. Both hand out `FramePoll` values: a complete `Frame`, or
//! `Blocked` when nothing arrived within the poll window.
//!
//! The ingestion thread (`run_ingest`) is the only writer of the frame ring.
//! It never waits on the consumers; a full ring drops its oldest frame.

mod accumulator;
mod process;
mod synthetic;

use anyhow::Result;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::frame::{Frame, FrameRingBuffer, PixelLayout};
use crate::retry::RetryPolicy;

pub use accumulator::FrameAccumulator;
use process::ProcessSource;
use synthetic::SyntheticSource;

/// Producer settings shared by both backends.
#[derive(Clone, Debug)]
pub struct SourceConfig {
    /// Program and arguments, or a single `stub://<scene>` uri.
    pub command: Vec<String>,
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    pub layout: PixelLayout,
    /// Consecutive empty polls before the producer is restarted.
    pub miss_limit: u32,
    pub miss_poll: Duration,
    pub restart: RetryPolicy,
}

impl SourceConfig {
    pub fn is_synthetic(&self) -> bool {
        self.command
            .first()
            .is_some_and(|program| program.starts_with("stub://"))
    }
}

/// Result of one poll of a source.
#[derive(Debug)]
pub enum FramePoll {
    Frame(Frame),
    Blocked,
}

#[derive(Clone, Debug)]
pub struct SourceStats {
    pub frames_captured: u64,
    pub restarts: u64,
    pub producer: String,
}

pub struct FrameSource {
    backend: SourceBackend,
}

enum SourceBackend {
    Synthetic(SyntheticSource),
    Process(ProcessSource),
}

impl FrameSource {
    pub fn new(config: SourceConfig, shutdown: Arc<AtomicBool>) -> Result<Self> {
        let backend = if config.is_synthetic() {
            SourceBackend::Synthetic(SyntheticSource::new(config)?)
        } else {
            SourceBackend::Process(ProcessSource::new(config, shutdown)?)
        };
        Ok(Self { backend })
    }

    /// Start the producer.
    pub fn connect(&mut self) -> Result<()> {
        match &mut self.backend {
            SourceBackend::Synthetic(source) => source.connect(),
            SourceBackend::Process(source) => source.connect(),
        }
    }

    /// Poll for the next complete frame.
    pub fn next_frame(&mut self) -> Result<FramePoll> {
        match &mut self.backend {
            SourceBackend::Synthetic(source) => source.next_frame(),
            SourceBackend::Process(source) => source.next_frame(),
        }
    }

    /// Stop the producer. A later `connect` or `next_frame` starts it again.
    pub fn stop(&mut self) {
        if let SourceBackend::Process(source) = &mut self.backend {
            source.stop();
        }
    }

    pub fn is_healthy(&self) -> bool {
        match &self.backend {
            SourceBackend::Synthetic(source) => source.is_healthy(),
            SourceBackend::Process(source) => source.is_healthy(),
        }
    }

    pub fn stats(&self) -> SourceStats {
        match &self.backend {
            SourceBackend::Synthetic(source) => source.stats(),
            SourceBackend::Process(source) => source.stats(),
        }
    }
}

/// Pump `source` into `ring` until `shutdown` is raised.
///
/// Errors here are fatal for the agent: they only surface once the restart
/// policy has been exhausted.
pub fn run_ingest(
    mut source: FrameSource,
    ring: Arc<FrameRingBuffer>,
    shutdown: Arc<AtomicBool>,
) -> Result<SourceStats> {
    source.connect()?;
    while !shutdown.load(Ordering::SeqCst) {
        match source.next_frame()? {
            FramePoll::Frame(frame) => {
                ring.push(frame);
            }
            FramePoll::Blocked => {}
        }
    }
    source.stop();
    let stats = source.stats();
    log::info!(
        "ingest stopped: {} frames captured, {} producer restarts, {} dropped by ring",
        stats.frames_captured,
        stats.restarts,
        ring.stats().dropped
    );
    Ok(stats)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stub_config() -> SourceConfig {
        SourceConfig {
            command: vec!["stub://still".to_string()],
            width: 16,
            height: 8,
            fps: 200,
            layout: PixelLayout::I420,
            miss_limit: 20,
            miss_poll: Duration::from_millis(15),
            restart: RetryPolicy::default(),
        }
    }

    #[test]
    fn stub_uri_selects_synthetic_backend() {
        assert!(stub_config().is_synthetic());
        let mut cfg = stub_config();
        cfg.command = vec!["rpicam-vid".to_string()];
        assert!(!cfg.is_synthetic());
    }

    #[test]
    fn ingest_fills_ring_without_exceeding_capacity() -> Result<()> {
        let shutdown = Arc::new(AtomicBool::new(false));
        let ring = Arc::new(FrameRingBuffer::new(3));
        let source = FrameSource::new(stub_config(), shutdown.clone())?;

        let handle = {
            let ring = ring.clone();
            let shutdown = shutdown.clone();
            std::thread::spawn(move || run_ingest(source, ring, shutdown))
        };
        std::thread::sleep(Duration::from_millis(100));
        shutdown.store(true, Ordering::SeqCst);
        let stats = handle.join().expect("ingest thread panicked")?;

        assert!(stats.frames_captured >= 3);
        assert_eq!(ring.len(), 3);
        let newest = ring.latest().expect("ring has frames");
        assert_eq!(newest.seq, stats.frames_captured);
        Ok(())
    }
}
