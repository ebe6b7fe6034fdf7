//! Annotated detection captures.
//!
//! When a detection becomes stable the vision agent asks the store to save
//! the frame with its boxes drawn in. Encoding and disk I/O happen on a
//! single background worker fed through a bounded queue; when the queue is
//! full the request is dropped and the detection event goes out without an
//! image path.

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, TimeZone};
use image::codecs::jpeg::JpegEncoder;
use image::{Rgb, RgbImage};
use std::fs::File;
use std::io::BufWriter;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{sync_channel, SyncSender, TrySendError};
use std::sync::Arc;
use std::thread::JoinHandle;

use crate::config::CaptureSettings;
use crate::detect::{BoundingBox, Detection};
use crate::frame::Frame;

const BOX_THICKNESS: u32 = 2;
const PALETTE: [[u8; 3]; 6] = [
    [255, 64, 64],
    [64, 200, 64],
    [64, 128, 255],
    [255, 200, 0],
    [200, 64, 255],
    [0, 220, 220],
];

struct CaptureRequest {
    frame: Frame,
    detections: Vec<Detection>,
    path: PathBuf,
}

#[derive(Debug, Default)]
struct Counters {
    saved: AtomicU64,
    failed: AtomicU64,
    dropped: AtomicU64,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CaptureStats {
    pub saved: u64,
    pub failed: u64,
    pub dropped: u64,
}

pub struct CaptureStore {
    dir: PathBuf,
    tx: Option<SyncSender<CaptureRequest>>,
    worker: Option<JoinHandle<()>>,
    counters: Arc<Counters>,
}

impl CaptureStore {
    pub fn new(settings: &CaptureSettings) -> Result<Self> {
        let (tx, rx) = sync_channel::<CaptureRequest>(settings.queue.max(1));
        let counters = Arc::new(Counters::default());
        let worker_counters = Arc::clone(&counters);
        let quality = settings.jpeg_quality;
        let worker = std::thread::Builder::new()
            .name("capture-writer".to_string())
            .spawn(move || {
                for request in rx {
                    match save_annotated(&request.path, &request.frame, &request.detections, quality)
                    {
                        Ok(()) => {
                            worker_counters.saved.fetch_add(1, Ordering::Relaxed);
                            log::debug!("capture: wrote {}", request.path.display());
                        }
                        Err(e) => {
                            worker_counters.failed.fetch_add(1, Ordering::Relaxed);
                            log::warn!("capture: save failed: {:#}", e);
                        }
                    }
                }
            })
            .context("failed to spawn capture writer")?;
        log::info!("capture: saving annotated frames under {}", settings.dir.display());
        Ok(Self {
            dir: settings.dir.clone(),
            tx: Some(tx),
            worker: Some(worker),
            counters,
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Queue a save without blocking. Returns the path the image will be
    /// written to, or `None` when the request was dropped.
    pub fn request<Tz: TimeZone>(
        &self,
        frame: Frame,
        detections: Vec<Detection>,
        at: &DateTime<Tz>,
        label: &str,
        count: u32,
        confidence: f32,
    ) -> Option<PathBuf>
    where
        Tz::Offset: std::fmt::Display,
    {
        let tx = self.tx.as_ref()?;
        let path = capture_path(&self.dir, at, label, count, confidence);
        let request = CaptureRequest {
            frame,
            detections,
            path: path.clone(),
        };
        match tx.try_send(request) {
            Ok(()) => Some(path),
            Err(TrySendError::Full(_)) => {
                self.counters.dropped.fetch_add(1, Ordering::Relaxed);
                log::warn!("capture: writer busy, skipping image");
                None
            }
            Err(TrySendError::Disconnected(_)) => {
                self.counters.dropped.fetch_add(1, Ordering::Relaxed);
                log::warn!("capture: writer stopped, skipping image");
                None
            }
        }
    }

    pub fn stats(&self) -> CaptureStats {
        CaptureStats {
            saved: self.counters.saved.load(Ordering::Relaxed),
            failed: self.counters.failed.load(Ordering::Relaxed),
            dropped: self.counters.dropped.load(Ordering::Relaxed),
        }
    }

    /// Finish queued saves and stop the worker.
    pub fn close(&mut self) {
        self.tx.take();
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                log::warn!("capture: writer thread panicked");
            }
        }
    }
}

impl Drop for CaptureStore {
    fn drop(&mut self) {
        self.close();
    }
}

/// `{dir}/{YYYYMMDD}/{HHMMSS_mmm}_{label}_cnt{n}_conf{c:.2}.jpg`
pub fn capture_path<Tz: TimeZone>(
    dir: &Path,
    at: &DateTime<Tz>,
    label: &str,
    count: u32,
    confidence: f32,
) -> PathBuf
where
    Tz::Offset: std::fmt::Display,
{
    let day = at.format("%Y%m%d").to_string();
    let name = format!(
        "{}_{}_cnt{}_conf{:.2}.jpg",
        at.format("%H%M%S_%3f"),
        sanitize_label(label),
        count,
        confidence
    );
    dir.join(day).join(name)
}

fn sanitize_label(label: &str) -> String {
    let cleaned: String = label
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '_' })
        .collect();
    if cleaned.is_empty() {
        "unknown".to_string()
    } else {
        cleaned
    }
}

pub fn save_annotated(path: &Path, frame: &Frame, detections: &[Detection], quality: u8) -> Result<()> {
    let image = annotate(frame, detections)?;
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    let file = File::create(path).with_context(|| format!("failed to create {}", path.display()))?;
    let mut writer = BufWriter::new(file);
    JpegEncoder::new_with_quality(&mut writer, quality.clamp(1, 100))
        .encode_image(&image)
        .with_context(|| format!("failed to encode {}", path.display()))?;
    Ok(())
}

/// Convert the frame to RGB and outline every boxed detection.
pub fn annotate(frame: &Frame, detections: &[Detection]) -> Result<RgbImage> {
    let mut image = RgbImage::from_raw(frame.width, frame.height, frame.to_rgb())
        .ok_or_else(|| anyhow!("frame {}x{} has a short RGB buffer", frame.width, frame.height))?;
    let mut labels: Vec<&str> = detections.iter().map(|d| d.label.as_str()).collect();
    labels.sort_unstable();
    labels.dedup();
    for detection in detections {
        let Some(bbox) = detection.bbox else {
            continue;
        };
        let slot = labels
            .iter()
            .position(|l| *l == detection.label)
            .unwrap_or_default();
        draw_box(&mut image, &bbox, Rgb(PALETTE[slot % PALETTE.len()]));
    }
    Ok(image)
}

fn draw_box(image: &mut RgbImage, bbox: &BoundingBox, color: Rgb<u8>) {
    let (width, height) = image.dimensions();
    if width == 0 || height == 0 {
        return;
    }
    let b = bbox.clamped();
    let to_px = |v: f32, extent: u32| ((v * extent as f32).round() as u32).min(extent - 1);
    let x0 = to_px(b.x, width);
    let y0 = to_px(b.y, height);
    let x1 = to_px(b.x + b.w, width);
    let y1 = to_px(b.y + b.h, height);

    for t in 0..BOX_THICKNESS {
        for x in x0..=x1 {
            image.put_pixel(x, (y0 + t).min(y1), color);
            image.put_pixel(x, y1.saturating_sub(t).max(y0), color);
        }
        for y in y0..=y1 {
            image.put_pixel((x0 + t).min(x1), y, color);
            image.put_pixel(x1.saturating_sub(t).max(x0), y, color);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::PixelLayout;
    use chrono::Utc;
    use std::time::Instant;

    fn gray_frame(width: u32, height: u32) -> Frame {
        Frame::from_luma(vec![100; (width * height) as usize], width, height, 1, Instant::now())
            .unwrap()
    }

    fn boxed(label: &str) -> Detection {
        Detection::new(label, 0.9).with_box(BoundingBox {
            x: 0.25,
            y: 0.25,
            w: 0.5,
            h: 0.5,
        })
    }

    #[test]
    fn path_layout_uses_day_folder_and_metadata() {
        let at = Utc.with_ymd_and_hms(2026, 3, 4, 5, 6, 7).unwrap()
            + chrono::Duration::milliseconds(89);
        let path = capture_path(Path::new("caps"), &at, "teddy bear", 2, 0.876);
        assert_eq!(
            path,
            Path::new("caps/20260304/050607_089_teddy_bear_cnt2_conf0.88.jpg")
        );
    }

    #[test]
    fn boxes_are_drawn_on_the_frame() {
        let frame = gray_frame(40, 40);
        assert_eq!(frame.layout(), PixelLayout::Gray8);
        let image = annotate(&frame, &[boxed("cat"), Detection::new("dog", 0.5)]).unwrap();
        assert_eq!(image.get_pixel(10, 10), &Rgb(PALETTE[0]));
        assert_eq!(image.get_pixel(20, 10), &Rgb(PALETTE[0]));
        // Interior untouched.
        assert_eq!(image.get_pixel(20, 20), &Rgb([100, 100, 100]));
        assert_eq!(image.get_pixel(2, 2), &Rgb([100, 100, 100]));
    }

    #[test]
    fn worker_writes_jpeg() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = CaptureStore::new(&CaptureSettings {
            enabled: true,
            dir: dir.path().to_path_buf(),
            jpeg_quality: 90,
            queue: 4,
        })
        .unwrap();
        let path = store
            .request(gray_frame(32, 24), vec![boxed("cup")], &Utc::now(), "cup", 1, 0.9)
            .unwrap();
        store.close();
        assert_eq!(store.stats().saved, 1);
        let bytes = std::fs::read(&path).unwrap();
        assert_eq!(&bytes[..2], &[0xFF, 0xD8]);
    }
}
