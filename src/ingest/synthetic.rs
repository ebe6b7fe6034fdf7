// Synthetic frame source for `stub://` producers.
//
//   stub://still   static scene with sensor noise (default)
//   stub://motion  scene jumps every 50 frames
//   stub://dark    all-black frames

use anyhow::{anyhow, Result};
use rand::Rng;
use std::time::{Duration, Instant};

use super::{FramePoll, SourceConfig, SourceStats};
use crate::frame::{Frame, PixelLayout};

const SCENE_PERIOD: u64 = 50;
const NOISE: i16 = 2;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Scene {
    Still,
    Motion,
    Dark,
}

impl Scene {
    fn parse(uri: &str) -> Result<Self> {
        match uri.trim_start_matches("stub://") {
            "" | "still" => Ok(Scene::Still),
            "motion" => Ok(Scene::Motion),
            "dark" => Ok(Scene::Dark),
            other => Err(anyhow!("unknown synthetic scene '{}'", other)),
        }
    }
}

pub(crate) struct SyntheticSource {
    config: SourceConfig,
    scene: Scene,
    frame_count: u64,
    scene_state: u8,
    next_due: Option<Instant>,
}

impl SyntheticSource {
    pub(crate) fn new(config: SourceConfig) -> Result<Self> {
        let uri = config
            .command
            .first()
            .ok_or_else(|| anyhow!("synthetic source needs a stub:// uri"))?;
        let scene = Scene::parse(uri)?;
        Ok(Self {
            config,
            scene,
            frame_count: 0,
            scene_state: 0,
            next_due: None,
        })
    }

    pub(crate) fn connect(&mut self) -> Result<()> {
        log::info!(
            "frame source: {:?} synthetic scene at {}x{}@{}",
            self.scene,
            self.config.width,
            self.config.height,
            self.config.fps
        );
        Ok(())
    }

    /// Paces output at the configured fps; between frames it reports `Blocked`.
    pub(crate) fn next_frame(&mut self) -> Result<FramePoll> {
        let now = Instant::now();
        if let Some(due) = self.next_due {
            if now < due {
                std::thread::sleep((due - now).min(self.config.miss_poll));
                if Instant::now() < due {
                    return Ok(FramePoll::Blocked);
                }
            }
        }
        let interval = Duration::from_secs(1) / self.config.fps.max(1);
        self.next_due = Some(self.next_due.map_or(now, |due| due.max(now)) + interval);

        self.frame_count += 1;
        if self.scene == Scene::Motion && self.frame_count % SCENE_PERIOD == 0 {
            self.scene_state = self.scene_state.wrapping_add(1);
        }
        let data = self.generate();
        let frame = Frame::new(
            data,
            self.config.layout,
            self.config.width,
            self.config.height,
            self.frame_count,
            Instant::now(),
        )?;
        Ok(FramePoll::Frame(frame))
    }

    fn generate(&self) -> Vec<u8> {
        let w = self.config.width as usize;
        let h = self.config.height as usize;
        let mut rng = rand::thread_rng();
        let mut data = Vec::with_capacity(w * h * 3 / 2);

        for y in 0..h {
            for x in 0..w {
                let value = match self.scene {
                    Scene::Dark => 0,
                    Scene::Still | Scene::Motion => {
                        let base = ((x + y) % 200) as i16 + self.scene_state as i16 * 37;
                        let noisy = (base % 220) + 16 + rng.gen_range(-NOISE..=NOISE);
                        noisy.clamp(0, 255) as u8
                    }
                };
                data.push(value);
            }
        }
        if self.config.layout == PixelLayout::I420 {
            let chroma = w.div_ceil(2) * h.div_ceil(2);
            data.resize(w * h + 2 * chroma, 128);
        }
        data
    }

    pub(crate) fn is_healthy(&self) -> bool {
        true
    }

    pub(crate) fn stats(&self) -> SourceStats {
        SourceStats {
            frames_captured: self.frame_count,
            restarts: 0,
            producer: self.config.command.join(" "),
        }
    }
}
