//! Raw frame container and the bounded hand-off buffer.
//!
//! - `Frame`: immutable raw picture (luma, optionally I420 chroma) plus capture instant.
//! - `FrameRingBuffer`: fixed-capacity, drop-oldest buffer between the producer
//!   thread and the slower analysis loops.
//!
//! Frames are copied out of the buffer by reference-counted handle, so a copy-out
//! never duplicates pixel bytes and the lock is held only for the deque operation.

use anyhow::{anyhow, Result};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

/// Default ring depth (the analysis loops only ever want the newest frame).
pub const DEFAULT_RING_DEPTH: usize = 3;

/// Pixel layout of a frame's byte buffer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PixelLayout {
    /// Luma plane only (`width * height` bytes).
    Gray8,
    /// Planar 4:2:0 (`Y`, then `U`, then `V`; `width * height * 3 / 2` bytes).
    I420,
}

impl PixelLayout {
    pub fn frame_bytes(self, width: u32, height: u32) -> Result<usize> {
        let luma = (width as usize)
            .checked_mul(height as usize)
            .ok_or_else(|| anyhow!("frame dimensions overflow"))?;
        Ok(match self {
            PixelLayout::Gray8 => luma,
            PixelLayout::I420 => luma + 2 * chroma_plane_len(width, height),
        })
    }
}

fn chroma_plane_len(width: u32, height: u32) -> usize {
    (width as usize).div_ceil(2) * (height as usize).div_ceil(2)
}

/// Immutable raw frame.
///
/// Bytes are shared behind an `Arc`; there is no mutable accessor, so whoever
/// holds a `Frame` sees exactly what the producer captured.
#[derive(Clone, Debug)]
pub struct Frame {
    data: Arc<[u8]>,
    layout: PixelLayout,
    pub width: u32,
    pub height: u32,
    /// Producer sequence number (monotonic per source, restarts included).
    pub seq: u64,
    /// When the last byte of the frame was received.
    pub captured_at: Instant,
}

impl Frame {
    pub fn new(
        data: Vec<u8>,
        layout: PixelLayout,
        width: u32,
        height: u32,
        seq: u64,
        captured_at: Instant,
    ) -> Result<Self> {
        let expected = layout.frame_bytes(width, height)?;
        if data.len() != expected {
            return Err(anyhow!(
                "{:?} frame length mismatch: expected {}, got {}",
                layout,
                expected,
                data.len()
            ));
        }
        Ok(Self {
            data: data.into(),
            layout,
            width,
            height,
            seq,
            captured_at,
        })
    }

    /// Build a luma-only frame.
    pub fn from_luma(
        luma: Vec<u8>,
        width: u32,
        height: u32,
        seq: u64,
        captured_at: Instant,
    ) -> Result<Self> {
        Self::new(luma, PixelLayout::Gray8, width, height, seq, captured_at)
    }

    pub fn layout(&self) -> PixelLayout {
        self.layout
    }

    /// The luma (Y) plane, row-major, `width * height` bytes.
    pub fn luma(&self) -> &[u8] {
        let len = self.width as usize * self.height as usize;
        &self.data[..len]
    }

    /// Chroma planes (`U`, `V`) when the frame carries them.
    pub fn chroma(&self) -> Option<(&[u8], &[u8])> {
        match self.layout {
            PixelLayout::Gray8 => None,
            PixelLayout::I420 => {
                let luma = self.width as usize * self.height as usize;
                let plane = chroma_plane_len(self.width, self.height);
                Some((
                    &self.data[luma..luma + plane],
                    &self.data[luma + plane..luma + 2 * plane],
                ))
            }
        }
    }

    pub fn byte_len(&self) -> usize {
        self.data.len()
    }

    /// Interleaved RGB24 rendition (BT.601 full range for I420, replicated gray otherwise).
    pub fn to_rgb(&self) -> Vec<u8> {
        let w = self.width as usize;
        let h = self.height as usize;
        let luma = self.luma();
        let mut rgb = vec![0u8; w * h * 3];
        match self.chroma() {
            None => {
                for (px, &y) in rgb.chunks_exact_mut(3).zip(luma) {
                    px.fill(y);
                }
            }
            Some((u_plane, v_plane)) => {
                let cw = w.div_ceil(2);
                for j in 0..h {
                    for i in 0..w {
                        let y = luma[j * w + i] as f32;
                        let c = (j / 2) * cw + i / 2;
                        let u = u_plane[c] as f32 - 128.0;
                        let v = v_plane[c] as f32 - 128.0;
                        let offset = (j * w + i) * 3;
                        rgb[offset] = clamp_to_u8(y + 1.402 * v);
                        rgb[offset + 1] = clamp_to_u8(y - 0.344_136 * u - 0.714_136 * v);
                        rgb[offset + 2] = clamp_to_u8(y + 1.772 * u);
                    }
                }
            }
        }
        rgb
    }
}

fn clamp_to_u8(value: f32) -> u8 {
    value.round().clamp(0.0, 255.0) as u8
}

// ----------------------------------------------------------------------------
// FrameRingBuffer: drop-oldest hand-off between producer and consumers
// ----------------------------------------------------------------------------

/// Bounded ring buffer of frames.
///
/// - The producer never blocks: a push onto a full buffer evicts the oldest frame.
/// - Consumers copy frames out; they never hold the lock while processing.
pub struct FrameRingBuffer {
    frames: Mutex<VecDeque<Frame>>,
    capacity: usize,
    pushed: AtomicU64,
    dropped: AtomicU64,
}

impl FrameRingBuffer {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            frames: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
            pushed: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Push a frame, evicting the oldest when full. Returns the number evicted.
    pub fn push(&self, frame: Frame) -> usize {
        let mut evicted = 0;
        {
            let mut frames = self.lock();
            while frames.len() >= self.capacity {
                frames.pop_front();
                evicted += 1;
            }
            frames.push_back(frame);
        }
        self.pushed.fetch_add(1, Ordering::Relaxed);
        if evicted > 0 {
            self.dropped.fetch_add(evicted as u64, Ordering::Relaxed);
        }
        evicted
    }

    /// Copy out the newest frame, if any.
    pub fn latest(&self) -> Option<Frame> {
        self.lock().back().cloned()
    }

    /// Copy out the newest frame only when it is newer than `seen_seq`.
    pub fn latest_after(&self, seen_seq: Option<u64>) -> Option<Frame> {
        let frames = self.lock();
        let newest = frames.back()?;
        match seen_seq {
            Some(seq) if newest.seq <= seq => None,
            _ => Some(newest.clone()),
        }
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn stats(&self) -> RingStats {
        RingStats {
            pushed: self.pushed.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            len: self.len(),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, VecDeque<Frame>> {
        // A panicking holder can only have left a valid deque behind.
        self.frames
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Default for FrameRingBuffer {
    fn default() -> Self {
        Self::new(DEFAULT_RING_DEPTH)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RingStats {
    pub pushed: u64,
    pub dropped: u64,
    pub len: usize,
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn gray_frame(seq: u64, value: u8) -> Frame {
        Frame::from_luma(vec![value; 4 * 2], 4, 2, seq, Instant::now()).unwrap()
    }

    #[test]
    fn frame_rejects_wrong_length() {
        let err = Frame::new(vec![0u8; 10], PixelLayout::I420, 4, 2, 0, Instant::now());
        assert!(err.is_err());
        assert!(Frame::new(vec![0u8; 12], PixelLayout::I420, 4, 2, 0, Instant::now()).is_ok());
    }

    #[test]
    fn i420_planes_split_correctly() {
        let mut data = vec![10u8; 8];
        data.extend_from_slice(&[20, 21]);
        data.extend_from_slice(&[30, 31]);
        let frame = Frame::new(data, PixelLayout::I420, 4, 2, 0, Instant::now()).unwrap();
        assert_eq!(frame.luma(), &[10u8; 8]);
        let (u, v) = frame.chroma().unwrap();
        assert_eq!(u, &[20, 21]);
        assert_eq!(v, &[30, 31]);
    }

    #[test]
    fn neutral_chroma_converts_to_gray() {
        let mut data = vec![128u8; 4];
        data.extend_from_slice(&[128, 128]);
        let frame = Frame::new(data, PixelLayout::I420, 2, 2, 0, Instant::now()).unwrap();
        assert_eq!(frame.to_rgb(), vec![128u8; 12]);
    }

    #[test]
    fn ring_buffer_drops_oldest_when_full() {
        let ring = FrameRingBuffer::new(3);
        for seq in 0..5 {
            ring.push(gray_frame(seq, seq as u8));
        }
        assert_eq!(ring.len(), 3);
        assert!(ring.latest_after(Some(4)).is_none());
        assert_eq!(ring.latest().unwrap().seq, 4);
        let stats = ring.stats();
        assert_eq!(stats.pushed, 5);
        assert_eq!(stats.dropped, 2);
    }

    #[test]
    fn latest_after_skips_already_seen_frames() {
        let ring = FrameRingBuffer::new(3);
        assert!(ring.latest_after(None).is_none());
        ring.push(gray_frame(7, 0));
        assert_eq!(ring.latest_after(None).unwrap().seq, 7);
        assert!(ring.latest_after(Some(7)).is_none());
        ring.push(gray_frame(8, 0));
        assert_eq!(ring.latest_after(Some(7)).unwrap().seq, 8);
    }

    #[test]
    fn copies_share_pixel_bytes() {
        let ring = FrameRingBuffer::new(2);
        ring.push(gray_frame(1, 42));
        let a = ring.latest().unwrap();
        let b = ring.latest().unwrap();
        assert_eq!(a.luma().as_ptr(), b.luma().as_ptr());
    }
}
