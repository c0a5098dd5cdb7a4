//! Zernike moment face descriptor (CPU).
//!
//! Regions are bright blobs on the luma plane: pixels at or above
//! `luma_threshold` are flood-filled with 8-connectivity and each component's
//! bounding box becomes a candidate when both sides reach `min_region_side`.
//!
//! The descriptor is the magnitude of every Zernike moment A(n, l) with
//! `n <= degree` and `n - l` even, computed on the crop resized to
//! `crop_side` x `crop_side`. Pixel coordinates are taken relative to the
//! intensity centre of mass and scaled by `radius`; only pixels inside the unit
//! disk contribute, weighted by their share of the disk's total intensity.
//! Degree 8 yields 25 values.

use std::f64::consts::PI;

use anyhow::{anyhow, Result};
use image::{imageops, GrayImage};

use crate::extract::backend::FeatureExtractor;
use crate::extract::FeatureVector;
use crate::frame::{FaceRegion, Frame};

#[derive(Clone, Debug)]
pub struct ZernikeSettings {
    pub luma_threshold: u8,
    pub min_region_side: u32,
    pub radius: f64,
    pub degree: u32,
    pub crop_side: u32,
}

impl Default for ZernikeSettings {
    fn default() -> Self {
        Self {
            luma_threshold: 128,
            min_region_side: 24,
            radius: 100.0,
            degree: 8,
            crop_side: 200,
        }
    }
}

/// One radial polynomial term: `coefficient * rho^power`.
#[derive(Clone, Copy, Debug)]
struct RadialTerm {
    coefficient: f64,
    power: usize,
}

#[derive(Clone, Debug)]
struct ZernikeMoment {
    n: u32,
    l: u32,
    terms: Vec<RadialTerm>,
}

pub struct ZernikeExtractor {
    settings: ZernikeSettings,
    moments: Vec<ZernikeMoment>,
}

impl ZernikeExtractor {
    pub fn new(settings: ZernikeSettings) -> Result<Self> {
        if settings.crop_side == 0 {
            return Err(anyhow!("zernike crop side must be greater than zero"));
        }
        if !(settings.radius.is_finite() && settings.radius > 0.0) {
            return Err(anyhow!("zernike radius must be positive"));
        }
        if settings.degree > 20 {
            return Err(anyhow!("zernike degree {} is too large", settings.degree));
        }
        let moments = zernike_moments(settings.degree);
        Ok(Self { settings, moments })
    }

    pub fn settings(&self) -> &ZernikeSettings {
        &self.settings
    }

    /// Number of values in every descriptor this extractor produces.
    pub fn feature_len(&self) -> usize {
        self.moments.len()
    }

    fn moments_of(&self, plane: &[f64], side: usize) -> Option<Vec<f32>> {
        let total: f64 = plane.iter().sum();
        if total <= 0.0 {
            return None;
        }
        let mut cy = 0.0;
        let mut cx = 0.0;
        for (idx, value) in plane.iter().enumerate() {
            cy += (idx / side) as f64 * value;
            cx += (idx % side) as f64 * value;
        }
        cy /= total;
        cx /= total;

        // (weight, rho, theta) for every pixel inside the unit disk.
        let radius = self.settings.radius;
        let mut disk = Vec::with_capacity(plane.len());
        for (idx, value) in plane.iter().enumerate() {
            let yn = ((idx / side) as f64 - cy) / radius;
            let xn = ((idx % side) as f64 - cx) / radius;
            let d2 = xn * xn + yn * yn;
            if d2 <= 1.0 {
                disk.push((*value, d2.sqrt(), yn.atan2(xn)));
            }
        }
        let disk_total: f64 = disk.iter().map(|(w, _, _)| w).sum();
        if disk_total <= 0.0 {
            return None;
        }

        let degree = self.settings.degree as usize;
        let mut acc = vec![(0.0f64, 0.0f64); self.moments.len()];
        let mut rho_pow = vec![1.0f64; degree + 1];
        for (weight, rho, theta) in disk {
            if weight == 0.0 {
                continue;
            }
            let p = weight / disk_total;
            for k in 1..=degree {
                rho_pow[k] = rho_pow[k - 1] * rho;
            }
            for (moment, (re, im)) in self.moments.iter().zip(acc.iter_mut()) {
                let radial: f64 = moment
                    .terms
                    .iter()
                    .map(|t| t.coefficient * rho_pow[t.power])
                    .sum();
                let angle = moment.l as f64 * theta;
                *re += p * radial * angle.cos();
                *im -= p * radial * angle.sin();
            }
        }

        Some(
            self.moments
                .iter()
                .zip(acc)
                .map(|(moment, (re, im))| {
                    ((re * re + im * im).sqrt() * (moment.n as f64 + 1.0) / PI) as f32
                })
                .collect(),
        )
    }
}

impl FeatureExtractor for ZernikeExtractor {
    fn name(&self) -> &'static str {
        "zernike"
    }

    fn detect_regions(&self, frame: &Frame) -> Result<Vec<FaceRegion>> {
        let luma = frame.luma();
        Ok(bright_regions(
            &luma,
            frame.width as usize,
            frame.height as usize,
            self.settings.luma_threshold,
            self.settings.min_region_side,
        ))
    }

    fn extract(&self, frame: &Frame, region: &FaceRegion) -> Result<Option<FeatureVector>> {
        let Some((crop, width, height)) = frame.luma_crop(region) else {
            return Ok(None);
        };
        let crop = GrayImage::from_raw(width, height, crop)
            .ok_or_else(|| anyhow!("luma crop does not match {}x{}", width, height))?;
        let side = self.settings.crop_side;
        let resized = imageops::resize(&crop, side, side, imageops::FilterType::Triangle);
        let plane: Vec<f64> = resized.as_raw().iter().map(|v| *v as f64).collect();

        match self.moments_of(&plane, side as usize) {
            Some(values) => Ok(Some(FeatureVector::new(values)?)),
            None => Ok(None),
        }
    }
}

fn zernike_moments(degree: u32) -> Vec<ZernikeMoment> {
    let mut moments = Vec::new();
    for n in 0..=degree {
        for l in 0..=n {
            if (n - l) % 2 != 0 {
                continue;
            }
            let terms = (0..=(n - l) / 2)
                .map(|m| {
                    let sign = if m % 2 == 0 { 1.0 } else { -1.0 };
                    RadialTerm {
                        coefficient: sign * factorial(n - m)
                            / (factorial(m)
                                * factorial((n - 2 * m + l) / 2)
                                * factorial((n - 2 * m - l) / 2)),
                        power: (n - 2 * m) as usize,
                    }
                })
                .collect();
            moments.push(ZernikeMoment { n, l, terms });
        }
    }
    moments
}

fn factorial(n: u32) -> f64 {
    (1..=n).fold(1.0, |acc, k| acc * k as f64)
}

/// Bounding boxes of 8-connected components at or above `threshold`, in raster
/// order of each component's first pixel.
fn bright_regions(
    luma: &[u8],
    width: usize,
    height: usize,
    threshold: u8,
    min_side: u32,
) -> Vec<FaceRegion> {
    let mut visited = vec![false; luma.len()];
    let mut regions = Vec::new();
    let mut stack = Vec::new();

    for start in 0..luma.len() {
        if visited[start] || luma[start] < threshold {
            continue;
        }
        visited[start] = true;
        stack.push(start);
        let (mut x_min, mut y_min) = (start % width, start / width);
        let (mut x_max, mut y_max) = (x_min, y_min);

        while let Some(idx) = stack.pop() {
            let (x, y) = (idx % width, idx / width);
            x_min = x_min.min(x);
            x_max = x_max.max(x);
            y_min = y_min.min(y);
            y_max = y_max.max(y);

            for dy in -1i64..=1 {
                for dx in -1i64..=1 {
                    if dx == 0 && dy == 0 {
                        continue;
                    }
                    let nx = x as i64 + dx;
                    let ny = y as i64 + dy;
                    if nx < 0 || ny < 0 || nx >= width as i64 || ny >= height as i64 {
                        continue;
                    }
                    let nidx = ny as usize * width + nx as usize;
                    if !visited[nidx] && luma[nidx] >= threshold {
                        visited[nidx] = true;
                        stack.push(nidx);
                    }
                }
            }
        }

        let region = FaceRegion::new(
            x_min as u32,
            y_min as u32,
            (x_max - x_min + 1) as u32,
            (y_max - y_min + 1) as u32,
        );
        if region.width >= min_side && region.height >= min_side {
            regions.push(region);
        }
    }
    regions
}
