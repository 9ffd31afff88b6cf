//! Chessboard inner-corner detection.
//!
//! Candidates come from the ChESS response of the `chess-corners` crate and
//! must show four alternating dark/bright sectors on a ring around them.
//! Survivors are refined to sub-pixel accuracy and assembled into a
//! `cols x rows` lattice by [`crate::grid`].

use std::str::FromStr;

use chess_corners::{find_chess_corners_image, ChessConfig, ThresholdMode};
use image::GrayImage;
use nalgebra::{Point2, Point3};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::grid::assemble_grid;
use crate::{Error, Result};

/// Inner-corner counts: `cols` corners per row, `rows` corners per column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChessboardPattern {
    pub cols: usize,
    pub rows: usize,
}

impl ChessboardPattern {
    pub fn new(cols: usize, rows: usize) -> Result<Self> {
        // A 2-corner side has no interior corner to anchor the lattice.
        if cols < 3 || rows < 3 {
            return Err(Error::InvalidAttribute {
                name: "pattern_size",
                reason: format!("need at least 3x3 inner corners, got {cols}x{rows}"),
            });
        }
        Ok(Self { cols, rows })
    }

    pub fn corner_count(&self) -> usize {
        self.cols * self.rows
    }
}

/// Parses `"9x6"` as 9 columns by 6 rows of inner corners.
impl FromStr for ChessboardPattern {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let invalid = || Error::InvalidAttribute {
            name: "pattern_size",
            reason: format!("expected COLSxROWS like 9x6, got {s:?}"),
        };
        let (cols, rows) = s.trim().split_once(['x', 'X']).ok_or_else(invalid)?;
        let cols = cols.trim().parse().map_err(|_| invalid())?;
        let rows = rows.trim().parse().map_err(|_| invalid())?;
        Self::new(cols, rows)
    }
}

/// 3D board points on the Z=0 plane, row-major, scaled by `square_size`.
pub fn generate_object_points(pattern: ChessboardPattern, square_size: f64) -> Vec<Point3<f64>> {
    (0..pattern.rows)
        .flat_map(|r| {
            (0..pattern.cols)
                .map(move |c| Point3::new(c as f64 * square_size, r as f64 * square_size, 0.0))
        })
        .collect()
}

#[derive(Debug, Clone)]
pub struct DetectorParams {
    pub blur_sigma: f32,
    pub nms_radius: u32,
    /// ChESS response threshold relative to the strongest response.
    pub relative_threshold: f32,
    pub ring_radius: f32,
    pub ring_samples: usize,
    pub min_contrast: f32,
    pub max_candidates: usize,
    pub subpix_half_window: usize,
    pub subpix_max_iterations: usize,
    pub subpix_epsilon: f64,
    pub max_seeds: usize,
}

impl Default for DetectorParams {
    fn default() -> Self {
        Self {
            blur_sigma: 1.5,
            nms_radius: 2,
            relative_threshold: 0.2,
            ring_radius: 5.0,
            ring_samples: 24,
            min_contrast: 25.0,
            max_candidates: 2000,
            // Matches a `cornerSubPix` winSize of (11, 11), i.e. a 23x23 window.
            subpix_half_window: 11,
            subpix_max_iterations: 30,
            subpix_epsilon: 0.001,
            max_seeds: 12,
        }
    }
}

pub(crate) struct Plane {
    pub width: usize,
    pub height: usize,
    pub data: Vec<f32>,
}

impl Plane {
    fn from_gray(img: &GrayImage) -> Self {
        Self {
            width: img.width() as usize,
            height: img.height() as usize,
            data: img.as_raw().iter().map(|v| *v as f32).collect(),
        }
    }

    fn zeros(width: usize, height: usize) -> Self {
        Self {
            width,
            height,
            data: vec![0.0; width * height],
        }
    }

    #[inline]
    fn at(&self, x: usize, y: usize) -> f32 {
        self.data[y * self.width + x]
    }

    /// Bilinear sample with edge clamping.
    pub fn sample(&self, x: f64, y: f64) -> f32 {
        let max_x = (self.width - 1) as f64;
        let max_y = (self.height - 1) as f64;
        let x = x.clamp(0.0, max_x);
        let y = y.clamp(0.0, max_y);
        let x0 = x.floor() as usize;
        let y0 = y.floor() as usize;
        let x1 = (x0 + 1).min(self.width - 1);
        let y1 = (y0 + 1).min(self.height - 1);
        let fx = (x - x0 as f64) as f32;
        let fy = (y - y0 as f64) as f32;
        let top = self.at(x0, y0) * (1.0 - fx) + self.at(x1, y0) * fx;
        let bottom = self.at(x0, y1) * (1.0 - fx) + self.at(x1, y1) * fx;
        top * (1.0 - fy) + bottom * fy
    }

    fn gaussian_blur(&self, sigma: f32) -> Self {
        if sigma <= 0.0 {
            return Self {
                width: self.width,
                height: self.height,
                data: self.data.clone(),
            };
        }
        let radius = (3.0 * sigma).ceil() as isize;
        let mut kernel: Vec<f32> = (-radius..=radius)
            .map(|i| (-((i * i) as f32) / (2.0 * sigma * sigma)).exp())
            .collect();
        let sum: f32 = kernel.iter().sum();
        kernel.iter_mut().for_each(|k| *k /= sum);

        let (w, h) = (self.width as isize, self.height as isize);
        let mut tmp = Self::zeros(self.width, self.height);
        for y in 0..h {
            for x in 0..w {
                let mut acc = 0.0;
                for (k, weight) in kernel.iter().enumerate() {
                    let sx = (x + k as isize - radius).clamp(0, w - 1);
                    acc += weight * self.data[(y * w + sx) as usize];
                }
                tmp.data[(y * w + x) as usize] = acc;
            }
        }
        let mut out = Self::zeros(self.width, self.height);
        for y in 0..h {
            for x in 0..w {
                let mut acc = 0.0;
                for (k, weight) in kernel.iter().enumerate() {
                    let sy = (y + k as isize - radius).clamp(0, h - 1);
                    acc += weight * tmp.data[(sy * w + x) as usize];
                }
                out.data[(y * w + x) as usize] = acc;
            }
        }
        out
    }

    /// Central-difference gradients `(gx, gy)`.
    fn gradients(&self) -> (Self, Self) {
        let mut gx = Self::zeros(self.width, self.height);
        let mut gy = Self::zeros(self.width, self.height);
        for y in 1..self.height.saturating_sub(1) {
            for x in 1..self.width.saturating_sub(1) {
                let i = y * self.width + x;
                gx.data[i] = 0.5 * (self.at(x + 1, y) - self.at(x - 1, y));
                gy.data[i] = 0.5 * (self.at(x, y + 1) - self.at(x, y - 1));
            }
        }
        (gx, gy)
    }
}

pub struct ChessboardDetector {
    pub params: DetectorParams,
}

impl Default for ChessboardDetector {
    fn default() -> Self {
        Self::new(DetectorParams::default())
    }
}

impl ChessboardDetector {
    pub fn new(params: DetectorParams) -> Self {
        Self { params }
    }

    /// Find the `pattern` inner corners, row-major, or `None` when the board
    /// is not fully visible.
    pub fn detect(&self, gray: &GrayImage, pattern: ChessboardPattern) -> Option<Vec<Point2<f64>>> {
        let corners = self.find_corners(gray);
        debug!(count = corners.len(), "x-junction corners after refinement");
        if corners.len() < pattern.corner_count() {
            return None;
        }
        assemble_grid(&corners, pattern, self.params.max_seeds)
    }

    /// All refined X-junction corners in the image, strongest first.
    pub fn find_corners(&self, gray: &GrayImage) -> Vec<Point2<f64>> {
        let p = &self.params;
        let raw = Plane::from_gray(gray);
        let border = (p.ring_radius.ceil() as usize + 2).max(p.subpix_half_window + 2);
        if raw.width <= 2 * border || raw.height <= 2 * border {
            return Vec::new();
        }
        let candidates = self.chess_candidates(gray, border);
        let smooth = raw.gaussian_blur(p.blur_sigma);
        let junctions: Vec<Point2<f64>> = candidates
            .into_iter()
            .filter(|c| self.is_x_junction(&smooth, c.x, c.y))
            .collect();

        let (gx, gy) = raw.gradients();
        let mut refined: Vec<Point2<f64>> = Vec::with_capacity(junctions.len());
        for c in junctions {
            let q = self.refine_subpixel(&gx, &gy, c);
            if refined.iter().all(|r| (*r - q).norm() > 2.0) {
                refined.push(q);
            }
        }
        refined
    }

    /// ChESS corner candidates away from the image border, strongest first.
    fn chess_candidates(&self, gray: &GrayImage, border: usize) -> Vec<Point2<f64>> {
        let p = &self.params;
        let mut cfg = ChessConfig::single_scale();
        cfg.threshold_mode = ThresholdMode::Relative;
        cfg.threshold_value = p.relative_threshold;
        cfg.nms_radius = p.nms_radius;
        let mut corners = match find_chess_corners_image(gray, &cfg) {
            Ok(corners) => corners,
            Err(err) => {
                debug!(%err, "chess corner detection failed");
                return Vec::new();
            }
        };
        corners.sort_by(|a, b| b.response.total_cmp(&a.response));
        let (max_x, max_y) = ((gray.width() as usize - border) as f64, (gray.height() as usize - border) as f64);
        corners
            .iter()
            .map(|c| Point2::new(c.x as f64, c.y as f64))
            .filter(|c| c.x >= border as f64 && c.y >= border as f64 && c.x < max_x && c.y < max_y)
            .take(p.max_candidates)
            .collect()
    }

    /// Four alternating sectors on a ring around (x, y).
    fn is_x_junction(&self, img: &Plane, x: f64, y: f64) -> bool {
        let n = self.params.ring_samples;
        let r = self.params.ring_radius as f64;
        let samples: Vec<f32> = (0..n)
            .map(|k| {
                let a = 2.0 * std::f64::consts::PI * k as f64 / n as f64;
                img.sample(x + r * a.cos(), y + r * a.sin())
            })
            .collect();
        let lo = samples.iter().copied().fold(f32::INFINITY, f32::min);
        let hi = samples.iter().copied().fold(f32::NEG_INFINITY, f32::max);
        if hi - lo < self.params.min_contrast {
            return false;
        }
        let mid = 0.5 * (lo + hi);
        let bits: Vec<bool> = samples.iter().map(|s| *s > mid).collect();

        // Run lengths of the circular sequence, starting at a transition.
        let Some(start) = (0..n).find(|&i| bits[i] != bits[(i + n - 1) % n]) else {
            return false;
        };
        let mut runs = Vec::new();
        let mut len = 0;
        for k in 0..n {
            let i = (start + k) % n;
            if k > 0 && bits[i] != bits[(i + n - 1) % n] {
                runs.push(len);
                len = 0;
            }
            len += 1;
        }
        runs.push(len);
        runs.len() == 4 && runs.iter().all(|l| *l >= 2)
    }

    /// Iterative refinement in the manner of OpenCV `cornerSubPix`.
    fn refine_subpixel(&self, gx: &Plane, gy: &Plane, start: Point2<f64>) -> Point2<f64> {
        let hw = self.params.subpix_half_window as isize;
        let hwf = hw as f64;
        let eps2 = self.params.subpix_epsilon * self.params.subpix_epsilon;
        let mut cur = start;
        for _ in 0..self.params.subpix_max_iterations {
            let (mut a, mut b, mut c, mut bb1, mut bb2) = (0.0, 0.0, 0.0, 0.0, 0.0);
            for dy in -hw..=hw {
                for dx in -hw..=hw {
                    let (fx, fy) = (dx as f64, dy as f64);
                    let m = (-(fx / hwf).powi(2) - (fy / hwf).powi(2)).exp();
                    let px = cur.x + fx;
                    let py = cur.y + fy;
                    let tgx = gx.sample(px, py) as f64;
                    let tgy = gy.sample(px, py) as f64;
                    let gxx = tgx * tgx * m;
                    let gxy = tgx * tgy * m;
                    let gyy = tgy * tgy * m;
                    a += gxx;
                    b += gxy;
                    c += gyy;
                    bb1 += gxx * px + gxy * py;
                    bb2 += gxy * px + gyy * py;
                }
            }
            let det = a * c - b * b;
            if det.abs() <= f64::EPSILON * (a * c).abs().max(1.0) {
                break;
            }
            let next = Point2::new((c * bb1 - b * bb2) / det, (a * bb2 - b * bb1) / det);
            let moved = (next - cur).norm_squared();
            cur = next;
            if moved < eps2 {
                break;
            }
        }
        if (cur.x - start.x).abs() > hwf || (cur.y - start.y).abs() > hwf || !cur.x.is_finite() {
            start
        } else {
            cur
        }
    }
}

/// Detect with default parameters.
pub fn detect_chessboard_corners(
    gray: &GrayImage,
    pattern: ChessboardPattern,
) -> Option<Vec<Point2<f64>>> {
    ChessboardDetector::default().detect(gray, pattern)
}
