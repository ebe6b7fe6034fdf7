/// Re-frames an arbitrary byte stream into fixed-size raw frames.
///
/// Pipe reads arrive in whatever sizes the OS hands out: partial frames,
/// exactly one frame, or several frames at once. Bytes are appended in order
/// and exactly one frame's worth is sliced off per `take_frame`.
#[derive(Debug)]
pub struct FrameAccumulator {
    buf: Vec<u8>,
    frame_bytes: usize,
}

impl FrameAccumulator {
    pub fn new(frame_bytes: usize) -> Self {
        Self {
            buf: Vec::with_capacity(frame_bytes * 2),
            frame_bytes,
        }
    }

    pub fn frame_bytes(&self) -> usize {
        self.frame_bytes
    }

    pub fn extend(&mut self, chunk: &[u8]) {
        self.buf.extend_from_slice(chunk);
    }

    /// Slice off the oldest complete frame, if one is buffered.
    pub fn take_frame(&mut self) -> Option<Vec<u8>> {
        if self.frame_bytes == 0 || self.buf.len() < self.frame_bytes {
            return None;
        }
        let rest = self.buf.split_off(self.frame_bytes);
        Some(std::mem::replace(&mut self.buf, rest))
    }

    /// Bytes buffered towards the next frame.
    pub fn pending(&self) -> usize {
        self.buf.len()
    }

    /// Discard any partial frame (used when the producer restarts).
    pub fn clear(&mut self) {
        self.buf.clear();
    }
}
