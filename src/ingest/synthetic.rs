//! Synthetic frame source (`stub://`).
//!
//! Produces a dark, slightly noisy scene with a fixed number of bright square
//! "faces". Each face carries its own ring pattern, so a feature extractor sees
//! the same face in the same slot on every frame and different faces in
//! different slots.
//!
//! URI form: `stub://<name>?faces=N&fps=F&width=W&height=H&fail_after=K&offline=1`
//!
//! - `fail_after=K`: the first K reads succeed, every later read fails.
//! - `offline=1`: opening the source fails.

use anyhow::{anyhow, Result};
use rand::Rng;
use std::time::Duration;

use super::FrameSource;
use crate::frame::{FaceRegion, Frame};

const BACKGROUND_LEVEL: u8 = 20;
const BACKGROUND_NOISE: u8 = 8;
const FACE_MARGIN: u32 = 16;

/// Configuration for a synthetic source.
#[derive(Clone, Debug)]
pub struct SyntheticConfig {
    pub name: String,
    pub width: u32,
    pub height: u32,
    /// Number of face patches in the scene.
    pub faces: u32,
    /// Frame pacing. 0 disables pacing.
    pub fps: u32,
    /// Reads after this many frames fail.
    pub fail_after: Option<u64>,
    /// Refuse to open.
    pub offline: bool,
}

impl Default for SyntheticConfig {
    fn default() -> Self {
        Self {
            name: "synthetic".to_string(),
            width: 320,
            height: 240,
            faces: 1,
            fps: 30,
            fail_after: None,
            offline: false,
        }
    }
}

impl SyntheticConfig {
    pub fn from_uri(uri: &str) -> Result<Self> {
        let rest = uri
            .strip_prefix("stub://")
            .ok_or_else(|| anyhow!("synthetic source URI must start with stub://"))?;
        let (name, query) = rest.split_once('?').unwrap_or((rest, ""));
        let mut config = Self {
            name: if name.is_empty() {
                "synthetic".to_string()
            } else {
                name.to_string()
            },
            ..Self::default()
        };
        for pair in query.split('&').filter(|pair| !pair.is_empty()) {
            let (key, value) = pair
                .split_once('=')
                .ok_or_else(|| anyhow!("malformed stub:// parameter '{}'", pair))?;
            match key {
                "faces" => config.faces = parse_param(key, value)?,
                "fps" => config.fps = parse_param(key, value)?,
                "width" => config.width = parse_param(key, value)?,
                "height" => config.height = parse_param(key, value)?,
                "fail_after" => config.fail_after = Some(parse_param(key, value)?),
                "offline" => config.offline = value == "1" || value == "true",
                other => return Err(anyhow!("unknown stub:// parameter '{}'", other)),
            }
        }
        if config.width < 32 || config.height < 32 {
            return Err(anyhow!("synthetic frames must be at least 32x32"));
        }
        Ok(config)
    }

    /// Where face `index` is painted.
    pub fn face_region(&self, index: u32) -> Option<FaceRegion> {
        if index >= self.faces {
            return None;
        }
        let side = self.face_side();
        if side == 0 {
            return None;
        }
        let x = FACE_MARGIN + index * (side + FACE_MARGIN);
        let y = (self.height - side) / 2;
        Some(FaceRegion::new(x, y, side, side))
    }

    fn face_side(&self) -> u32 {
        if self.faces == 0 {
            return 0;
        }
        let usable = self
            .width
            .saturating_sub(FACE_MARGIN * (self.faces + 1))
            / self.faces;
        usable.min(self.height / 2)
    }
}

fn parse_param<T: std::str::FromStr>(key: &str, value: &str) -> Result<T> {
    value
        .parse()
        .map_err(|_| anyhow!("invalid value '{}' for stub:// parameter '{}'", value, key))
}

/// Synthetic frame source.
pub struct SyntheticSource {
    config: SyntheticConfig,
    frame_count: u64,
    released: bool,
}

impl SyntheticSource {
    pub fn open(config: SyntheticConfig) -> Result<Self> {
        if config.offline {
            return Err(anyhow!("synthetic camera '{}' is offline", config.name));
        }
        log::info!("SyntheticSource: connected to stub://{}", config.name);
        Ok(Self {
            config,
            frame_count: 0,
            released: false,
        })
    }

    pub fn frames_captured(&self) -> u64 {
        self.frame_count
    }

    fn generate_pixels(&self) -> Vec<u8> {
        let width = self.config.width;
        let height = self.config.height;
        let mut rng = rand::thread_rng();
        let mut pixels = vec![0u8; width as usize * height as usize * 3];
        for px in pixels.chunks_exact_mut(3) {
            let level = BACKGROUND_LEVEL + rng.gen_range(0..BACKGROUND_NOISE);
            px.fill(level);
        }

        for index in 0..self.config.faces {
            let Some(region) = self.config.face_region(index) else {
                continue;
            };
            paint_face(&mut pixels, width, &region, index);
        }
        pixels
    }
}

/// Concentric rings whose levels depend on the face index. Every level stays
/// well above the background so the patch reads as one bright region.
fn paint_face(pixels: &mut [u8], width: u32, region: &FaceRegion, index: u32) {
    let half = region.width as f32 / 2.0;
    let cx = region.x as f32 + half;
    let cy = region.y as f32 + half;
    for row in region.y..region.bottom() {
        for col in region.x..region.right() {
            let dx = col as f32 + 0.5 - cx;
            let dy = row as f32 + 0.5 - cy;
            let ring = ((dx * dx + dy * dy).sqrt() / half * 6.0) as u32;
            let level = 140 + ((ring + 1) * (index + 1) * 23 % 110) as u8;
            let offset = (row as usize * width as usize + col as usize) * 3;
            pixels[offset..offset + 3].fill(level);
        }
    }
}

impl FrameSource for SyntheticSource {
    fn read_frame(&mut self) -> Result<Frame> {
        if self.released {
            return Err(anyhow!("synthetic camera '{}' released", self.config.name));
        }
        if self.config.fps > 0 {
            std::thread::sleep(Duration::from_millis(1000 / self.config.fps as u64));
        }
        if let Some(limit) = self.config.fail_after {
            if self.frame_count >= limit {
                return Err(anyhow!(
                    "synthetic camera '{}' stream dropped",
                    self.config.name
                ));
            }
        }
        self.frame_count += 1;
        Frame::from_rgb(
            self.generate_pixels(),
            self.config.width,
            self.config.height,
            self.frame_count,
        )
    }

    fn release(&mut self) {
        self.released = true;
        log::info!(
            "SyntheticSource: released stub://{} after {} frames",
            self.config.name,
            self.frame_count
        );
    }

    fn describe(&self) -> String {
        format!("stub://{}", self.config.name)
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
