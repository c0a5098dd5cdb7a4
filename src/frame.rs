//! Frames and face regions.
//!
//! - `Frame`: an owned RGB24 image captured from a camera. Frames are handed
//!   around as `Arc<Frame>` so a reader keeps a stable copy for as long as it
//!   needs it, independent of later writes to the session slot.
//! - `FaceRegion`: a bounding box in frame pixel coordinates.

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use std::time::SystemTime;

/// Owned RGB24 frame. There is no `Clone`: frames are shared through `Arc`.
pub struct Frame {
    pixels: Vec<u8>,

    pub width: u32,
    pub height: u32,

    /// Per-source sequence number (restarts at 1 when a source is reopened).
    pub sequence: u64,

    /// Wall-clock capture time.
    pub captured_at: SystemTime,
}

impl Frame {
    /// Build a frame from packed RGB24 pixels.
    pub fn from_rgb(pixels: Vec<u8>, width: u32, height: u32, sequence: u64) -> Result<Self> {
        let expected = (width as usize)
            .checked_mul(height as usize)
            .and_then(|v| v.checked_mul(3))
            .ok_or_else(|| anyhow!("frame dimensions overflow"))?;
        if pixels.len() != expected {
            return Err(anyhow!(
                "RGB frame length mismatch: expected {}, got {}",
                expected,
                pixels.len()
            ));
        }
        Ok(Self {
            pixels,
            width,
            height,
            sequence,
            captured_at: SystemTime::now(),
        })
    }

    /// Uniform frame, mostly useful for tests and placeholders.
    pub fn filled(width: u32, height: u32, value: u8, sequence: u64) -> Self {
        Self {
            pixels: vec![value; width as usize * height as usize * 3],
            width,
            height,
            sequence,
            captured_at: SystemTime::now(),
        }
    }

    pub fn pixels(&self) -> &[u8] {
        &self.pixels
    }

    pub fn byte_len(&self) -> usize {
        self.pixels.len()
    }

    /// BT.601 luma plane, one byte per pixel, row-major.
    pub fn luma(&self) -> Vec<u8> {
        self.pixels
            .chunks_exact(3)
            .map(|px| {
                let y = 299 * px[0] as u32 + 587 * px[1] as u32 + 114 * px[2] as u32;
                (y / 1000) as u8
            })
            .collect()
    }

    /// Luma of a region, clamped to the frame bounds. Returns the crop and its
    /// actual dimensions.
    pub fn luma_crop(&self, region: &FaceRegion) -> Option<(Vec<u8>, u32, u32)> {
        let region = region.clamp_to(self.width, self.height)?;
        let mut out = Vec::with_capacity(region.area() as usize);
        for row in region.y..region.bottom() {
            let start = (row as usize * self.width as usize + region.x as usize) * 3;
            let end = start + region.width as usize * 3;
            out.extend(self.pixels[start..end].chunks_exact(3).map(|px| {
                let y = 299 * px[0] as u32 + 587 * px[1] as u32 + 114 * px[2] as u32;
                (y / 1000) as u8
            }));
        }
        Some((out, region.width, region.height))
    }
}

impl std::fmt::Debug for Frame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Frame")
            .field("width", &self.width)
            .field("height", &self.height)
            .field("sequence", &self.sequence)
            .finish_non_exhaustive()
    }
}

/// Bounding box of a detected face, in frame pixel coordinates.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FaceRegion {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl FaceRegion {
    pub fn new(x: u32, y: u32, width: u32, height: u32) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    pub fn right(&self) -> u32 {
        self.x.saturating_add(self.width)
    }

    pub fn bottom(&self) -> u32 {
        self.y.saturating_add(self.height)
    }

    pub fn area(&self) -> u64 {
        self.width as u64 * self.height as u64
    }

    /// Intersect with a `width` x `height` frame. `None` when nothing is left.
    pub fn clamp_to(&self, width: u32, height: u32) -> Option<Self> {
        if self.x >= width || self.y >= height {
            return None;
        }
        let w = self.right().min(width) - self.x;
        let h = self.bottom().min(height) - self.y;
        if w == 0 || h == 0 {
            return None;
        }
        Some(Self::new(self.x, self.y, w, h))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn from_rgb_rejects_length_mismatch() {
        assert!(Frame::from_rgb(vec![0; 10], 2, 2, 1).is_err());
        assert!(Frame::from_rgb(vec![0; 12], 2, 2, 1).is_ok());
    }

    #[test]
    fn luma_weights_channels() -> Result<()> {
        let frame = Frame::from_rgb(vec![255, 0, 0, 0, 255, 0, 0, 0, 255, 255, 255, 255], 2, 2, 1)?;
        assert_eq!(frame.luma(), vec![76, 149, 29, 255]);
        Ok(())
    }

    #[test]
    fn luma_crop_is_clamped_to_frame() {
        let frame = Frame::filled(10, 8, 200, 1);
        let (crop, w, h) = frame
            .luma_crop(&FaceRegion::new(6, 4, 10, 10))
            .expect("crop inside frame");
        assert_eq!((w, h), (4, 4));
        assert_eq!(crop.len(), 16);
        assert!(frame.luma_crop(&FaceRegion::new(10, 0, 2, 2)).is_none());
    }
}
