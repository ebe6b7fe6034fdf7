//! External raw-video producer.
//!
//! Spawns the configured capture command (e.g. a camera tool writing raw I420
//! frames to stdout), pumps its stdout through a reader thread, and re-frames
//! the byte stream with `FrameAccumulator`.
//!
//! A stall (no complete frame for `miss_limit` consecutive polls) or end of
//! stream tears the producer down and relaunches it after the next restart
//! policy delay. Consumers only see a run of `FramePoll::Blocked` while that
//! happens. The policy is only reset once the producer delivers a frame, so a
//! tool that keeps exiting straight away exhausts it and the error surfaces.

use anyhow::{anyhow, Context, Result};
use std::io::{BufRead, BufReader, Read};
use std::process::{Child, ChildStdout, Command, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, SyncSender};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use super::accumulator::FrameAccumulator;
use super::{FramePoll, SourceConfig, SourceStats};
use crate::frame::Frame;
use crate::retry::{retry_with, sleep_unless_shutdown, Backoff};

const READ_CHUNK: usize = 4096;
const CHUNK_QUEUE: usize = 256;
const TERMINATE_GRACE: Duration = Duration::from_secs(1);

pub(crate) struct ProcessSource {
    config: SourceConfig,
    child: Option<Child>,
    chunks: Option<Receiver<Vec<u8>>>,
    reader: Option<JoinHandle<()>>,
    accumulator: FrameAccumulator,
    misses: u32,
    backoff: Backoff,
    restarts: u64,
    frame_count: u64,
    last_frame_at: Option<Instant>,
    shutdown: Arc<AtomicBool>,
}

impl ProcessSource {
    pub(crate) fn new(config: SourceConfig, shutdown: Arc<AtomicBool>) -> Result<Self> {
        if config.command.is_empty() {
            return Err(anyhow!("frame producer command is empty"));
        }
        let frame_bytes = config.layout.frame_bytes(config.width, config.height)?;
        let backoff = config.restart.backoff();
        Ok(Self {
            config,
            child: None,
            chunks: None,
            reader: None,
            accumulator: FrameAccumulator::new(frame_bytes),
            misses: 0,
            backoff,
            restarts: 0,
            frame_count: 0,
            last_frame_at: None,
            shutdown,
        })
    }

    pub(crate) fn connect(&mut self) -> Result<()> {
        if self.child.is_some() {
            return Ok(());
        }
        let policy = self.config.restart.clone();
        let shutdown = self.shutdown.clone();
        let (child, stdout) = retry_with(&policy, &shutdown, "spawn frame producer", || {
            spawn_producer(&self.config.command)
        })?;
        let (tx, rx) = mpsc::sync_channel(CHUNK_QUEUE);
        self.reader = Some(spawn_reader(stdout, tx));
        self.chunks = Some(rx);
        log::info!(
            "frame producer started pid={} ({}x{} {:?}, {} bytes/frame)",
            child.id(),
            self.config.width,
            self.config.height,
            self.config.layout,
            self.accumulator.frame_bytes()
        );
        self.child = Some(child);
        self.misses = 0;
        Ok(())
    }

    pub(crate) fn next_frame(&mut self) -> Result<FramePoll> {
        if self.child.is_none() {
            self.connect()?;
        }

        loop {
            if let Some(bytes) = self.accumulator.take_frame() {
                self.misses = 0;
                self.backoff.reset();
                self.frame_count += 1;
                let now = Instant::now();
                self.last_frame_at = Some(now);
                let frame = Frame::new(
                    bytes,
                    self.config.layout,
                    self.config.width,
                    self.config.height,
                    self.frame_count,
                    now,
                )?;
                return Ok(FramePoll::Frame(frame));
            }

            let Some(chunks) = self.chunks.as_ref() else {
                return Err(anyhow!("frame producer has no output stream"));
            };
            match chunks.recv_timeout(self.config.miss_poll) {
                Ok(chunk) => self.accumulator.extend(&chunk),
                Err(RecvTimeoutError::Timeout) => {
                    self.misses += 1;
                    if self.misses >= self.config.miss_limit {
                        log::warn!(
                            "frame producer stalled for {} polls, restarting",
                            self.misses
                        );
                        self.restart()?;
                    }
                    return Ok(FramePoll::Blocked);
                }
                Err(RecvTimeoutError::Disconnected) => {
                    log::warn!("frame producer stream ended, restarting");
                    self.restart()?;
                    return Ok(FramePoll::Blocked);
                }
            }
        }
    }

    fn restart(&mut self) -> Result<()> {
        self.stop();
        let Some(delay) = self.backoff.next_delay() else {
            return Err(anyhow!(
                "frame producer '{}' failed after {} restarts without delivering a frame",
                self.config.command.join(" "),
                self.backoff.attempts()
            ));
        };
        log::info!(
            "restarting frame producer in {}ms (attempt {})",
            delay.as_millis(),
            self.backoff.attempts()
        );
        sleep_unless_shutdown(delay, &self.shutdown);
        if self.shutdown.load(Ordering::SeqCst) {
            return Ok(());
        }
        self.restarts += 1;
        self.connect()
    }

    /// Terminate the producer and release its pipe.
    pub(crate) fn stop(&mut self) {
        self.chunks = None;
        if let Some(mut child) = self.child.take() {
            terminate(&mut child);
        }
        if let Some(reader) = self.reader.take() {
            let _ = reader.join();
        }
        self.accumulator.clear();
        self.misses = 0;
    }

    pub(crate) fn is_healthy(&self) -> bool {
        match (self.child.as_ref(), self.last_frame_at) {
            (None, _) => false,
            (Some(_), None) => true,
            (Some(_), Some(at)) => {
                at.elapsed() <= self.config.miss_poll * self.config.miss_limit.max(1)
            }
        }
    }

    pub(crate) fn stats(&self) -> SourceStats {
        SourceStats {
            frames_captured: self.frame_count,
            restarts: self.restarts,
            producer: self.config.command.join(" "),
        }
    }
}

impl Drop for ProcessSource {
    fn drop(&mut self) {
        self.stop();
    }
}

fn spawn_producer(command: &[String]) -> Result<(Child, ChildStdout)> {
    let (program, args) = command
        .split_first()
        .ok_or_else(|| anyhow!("frame producer command is empty"))?;
    let mut child = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .with_context(|| format!("failed to spawn frame producer '{}'", program))?;
    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| anyhow!("frame producer stdout not captured"))?;
    if let Some(stderr) = child.stderr.take() {
        let name = program.clone();
        std::thread::spawn(move || {
            for line in BufReader::new(stderr).lines().map_while(Result::ok) {
                let line = line.trim();
                if !line.is_empty() {
                    log::debug!("{}: {}", name, line);
                }
            }
        });
    }
    Ok((child, stdout))
}

fn spawn_reader(mut stdout: ChildStdout, tx: SyncSender<Vec<u8>>) -> JoinHandle<()> {
    std::thread::spawn(move || {
        let mut buf = [0u8; READ_CHUNK];
        loop {
            match stdout.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => {
                    if tx.send(buf[..n].to_vec()).is_err() {
                        break;
                    }
                }
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    log::warn!("frame producer read error: {}", e);
                    break;
                }
            }
        }
    })
}

/// SIGTERM, wait up to a second, then kill.
fn terminate(child: &mut Child) {
    let pid = child.id();
    #[cfg(target_os = "linux")]
    {
        // SAFETY: plain signal delivery to a child we spawned and have not reaped.
        unsafe {
            libc::kill(pid as libc::pid_t, libc::SIGTERM);
        }
    }
    #[cfg(not(target_os = "linux"))]
    {
        let _ = child.kill();
    }

    let deadline = Instant::now() + TERMINATE_GRACE;
    while Instant::now() < deadline {
        match child.try_wait() {
            Ok(Some(status)) => {
                log::info!("frame producer pid={} exited ({})", pid, status);
                return;
            }
            Ok(None) => std::thread::sleep(Duration::from_millis(50)),
            Err(_) => break,
        }
    }
    let _ = child.kill();
    let _ = child.wait();
    log::info!("frame producer pid={} killed", pid);
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::frame::PixelLayout;
    use crate::retry::RetryPolicy;

    fn config(command: &[&str], width: u32, height: u32) -> SourceConfig {
        SourceConfig {
            command: command.iter().map(|s| s.to_string()).collect(),
            width,
            height,
            fps: 10,
            layout: PixelLayout::Gray8,
            miss_limit: 3,
            miss_poll: Duration::from_millis(20),
            restart: RetryPolicy::fixed(Duration::from_millis(10)).with_max_attempts(3),
        }
    }

    #[test]
    fn reframes_producer_output() -> Result<()> {
        // 2x2 gray frames: 12 bytes of output = three frames.
        let cfg = config(&["printf", "AAAABBBBCCCC"], 2, 2);
        let mut source = ProcessSource::new(cfg, Arc::new(AtomicBool::new(false)))?;
        source.connect()?;

        let mut frames = Vec::new();
        for _ in 0..50 {
            if let FramePoll::Frame(frame) = source.next_frame()? {
                frames.push(frame);
                if frames.len() == 3 {
                    break;
                }
            }
        }
        assert_eq!(frames.len(), 3);
        assert_eq!(frames[0].luma(), b"AAAA");
        assert_eq!(frames[2].luma(), b"CCCC");
        assert!(frames[0].seq < frames[1].seq);
        Ok(())
    }

    #[test]
    fn end_of_stream_restarts_producer() -> Result<()> {
        let cfg = config(&["true"], 2, 2);
        let mut source = ProcessSource::new(cfg, Arc::new(AtomicBool::new(false)))?;
        source.connect()?;
        let mut blocked = 0;
        while blocked < 10 {
            match source.next_frame() {
                Ok(FramePoll::Blocked) => blocked += 1,
                Ok(FramePoll::Frame(_)) => panic!("`true` produced a frame"),
                Err(_) => break,
            }
        }
        assert!(source.stats().restarts >= 1);
        Ok(())
    }

    #[test]
    fn producer_that_keeps_exiting_exhausts_policy() -> Result<()> {
        let mut cfg = config(&["true"], 2, 2);
        cfg.restart = RetryPolicy::exponential(Duration::from_millis(20), Duration::from_millis(80))
            .with_max_attempts(3);
        let mut source = ProcessSource::new(cfg, Arc::new(AtomicBool::new(false)))?;
        source.connect()?;

        let started = Instant::now();
        let mut polls = 0;
        let err = loop {
            polls += 1;
            assert!(polls < 500, "restart policy never gave up");
            match source.next_frame() {
                Ok(FramePoll::Blocked) => {}
                Ok(FramePoll::Frame(_)) => panic!("`true` produced a frame"),
                Err(e) => break e,
            }
        };
        assert_eq!(source.stats().restarts, 3);
        // 20 + 40 + 80 ms of backoff before giving up.
        assert!(started.elapsed() >= Duration::from_millis(140));
        assert!(format!("{:#}", err).contains("failed after 3 restarts"));
        Ok(())
    }

    #[test]
    fn delivered_frame_resets_restart_policy() -> Result<()> {
        // One frame per run, then the producer exits.
        let mut cfg = config(&["printf", "AAAA"], 2, 2);
        cfg.restart = RetryPolicy::fixed(Duration::from_millis(5)).with_max_attempts(1);
        let mut source = ProcessSource::new(cfg, Arc::new(AtomicBool::new(false)))?;
        source.connect()?;

        let mut frames = 0;
        for _ in 0..200 {
            if let FramePoll::Frame(_) = source.next_frame()? {
                frames += 1;
                if frames == 3 {
                    break;
                }
            }
        }
        assert_eq!(frames, 3);
        assert!(source.stats().restarts >= 2);
        Ok(())
    }

    #[test]
    fn missing_binary_exhausts_restart_policy() {
        let cfg = config(&["/nonexistent/kiosk-camera"], 2, 2);
        let mut source = ProcessSource::new(cfg, Arc::new(AtomicBool::new(false))).unwrap();
        assert!(source.connect().is_err());
    }
}
