//! Planar projective geometry: Rodrigues vectors, pinhole projection with
//! OpenCV-style distortion, point undistortion and homography estimation.

use nalgebra::{Matrix3, Point2, Point3, Rotation3, SMatrix, SymmetricEigen, Vector3};
use serde::{Deserialize, Serialize};

use crate::{CameraIntrinsics, Error, Result};

/// Rotation vector (axis * angle) to rotation matrix.
pub fn rodrigues(rvec: &Vector3<f64>) -> Matrix3<f64> {
    Rotation3::from_scaled_axis(*rvec).into_inner()
}

/// Rotation matrix to rotation vector. The input is re-orthonormalized first.
pub fn rotation_to_rodrigues(r: &Matrix3<f64>) -> Vector3<f64> {
    Rotation3::from_matrix_unchecked(orthonormalize(r)).scaled_axis()
}

/// Closest rotation matrix in the Frobenius sense.
pub fn orthonormalize(m: &Matrix3<f64>) -> Matrix3<f64> {
    let svd = m.svd(true, true);
    match (svd.u, svd.v_t) {
        (Some(u), Some(v_t)) => {
            let mut r = u * v_t;
            if r.determinant() < 0.0 {
                let mut u = u;
                let flipped = -u.column(2);
                u.set_column(2, &flipped);
                r = u * v_t;
            }
            r
        }
        _ => *m,
    }
}

/// Distortion coefficients in OpenCV order `k1 k2 p1 p2 k3 k4 k5 k6`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Distortion {
    pub coeffs: [f64; 8],
}

impl Distortion {
    pub fn zero() -> Self {
        Self::default()
    }

    /// Missing trailing coefficients are zero; extra ones are rejected.
    pub fn from_slice(values: &[f64]) -> Result<Self> {
        if values.len() > 8 {
            return Err(Error::InvalidAttribute {
                name: "distortion",
                reason: format!("expected at most 8 coefficients, got {}", values.len()),
            });
        }
        let mut coeffs = [0.0; 8];
        coeffs[..values.len()].copy_from_slice(values);
        Ok(Self { coeffs })
    }

    pub fn k1(&self) -> f64 {
        self.coeffs[0]
    }
    pub fn k2(&self) -> f64 {
        self.coeffs[1]
    }
    pub fn p1(&self) -> f64 {
        self.coeffs[2]
    }
    pub fn p2(&self) -> f64 {
        self.coeffs[3]
    }
    pub fn k3(&self) -> f64 {
        self.coeffs[4]
    }

    pub fn is_zero(&self) -> bool {
        self.coeffs.iter().all(|c| *c == 0.0)
    }

    /// Apply distortion to a normalized image point.
    pub fn distort(&self, x: f64, y: f64) -> (f64, f64) {
        let [k1, k2, p1, p2, k3, k4, k5, k6] = self.coeffs;
        let r2 = x * x + y * y;
        let r4 = r2 * r2;
        let r6 = r4 * r2;
        let radial = (1.0 + k1 * r2 + k2 * r4 + k3 * r6) / (1.0 + k4 * r2 + k5 * r4 + k6 * r6);
        let xd = x * radial + 2.0 * p1 * x * y + p2 * (r2 + 2.0 * x * x);
        let yd = y * radial + p1 * (r2 + 2.0 * y * y) + 2.0 * p2 * x * y;
        (xd, yd)
    }

    /// Invert [`Distortion::distort`] by fixed-point iteration.
    pub fn undistort(&self, xd: f64, yd: f64) -> (f64, f64) {
        if self.is_zero() {
            return (xd, yd);
        }
        let [k1, k2, p1, p2, k3, k4, k5, k6] = self.coeffs;
        let (mut x, mut y) = (xd, yd);
        for _ in 0..20 {
            let r2 = x * x + y * y;
            let r4 = r2 * r2;
            let r6 = r4 * r2;
            let icdist = (1.0 + k4 * r2 + k5 * r4 + k6 * r6) / (1.0 + k1 * r2 + k2 * r4 + k3 * r6);
            if !icdist.is_finite() || icdist <= 0.0 {
                return (xd, yd);
            }
            let dx = 2.0 * p1 * x * y + p2 * (r2 + 2.0 * x * x);
            let dy = p1 * (r2 + 2.0 * y * y) + 2.0 * p2 * x * y;
            x = (xd - dx) * icdist;
            y = (yd - dy) * icdist;
        }
        (x, y)
    }
}

/// Pinhole camera with lens distortion.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Pinhole {
    pub fx: f64,
    pub fy: f64,
    pub cx: f64,
    pub cy: f64,
    pub distortion: Distortion,
}

impl Pinhole {
    pub fn new(intrinsics: &CameraIntrinsics, distortion: Distortion) -> Self {
        Self {
            fx: intrinsics.fx,
            fy: intrinsics.fy,
            cx: intrinsics.cx,
            cy: intrinsics.cy,
            distortion,
        }
    }

    pub fn matrix(&self) -> Matrix3<f64> {
        Matrix3::new(self.fx, 0.0, self.cx, 0.0, self.fy, self.cy, 0.0, 0.0, 1.0)
    }

    /// Project a point given in camera coordinates.
    pub fn project(&self, p: &Vector3<f64>) -> Point2<f64> {
        let (xd, yd) = self.distortion.distort(p.x / p.z, p.y / p.z);
        Point2::new(self.fx * xd + self.cx, self.fy * yd + self.cy)
    }

    /// Project object points through the pose `(rvec, tvec)`.
    pub fn project_points(
        &self,
        object: &[Point3<f64>],
        rvec: &Vector3<f64>,
        tvec: &Vector3<f64>,
    ) -> Vec<Point2<f64>> {
        let r = rodrigues(rvec);
        object
            .iter()
            .map(|p| self.project(&(r * p.coords + tvec)))
            .collect()
    }

    /// Pixel to normalized, undistorted image coordinates.
    pub fn undistort_point(&self, px: &Point2<f64>) -> Point2<f64> {
        let xd = (px.x - self.cx) / self.fx;
        let yd = (px.y - self.cy) / self.fy;
        let (x, y) = self.distortion.undistort(xd, yd);
        Point2::new(x, y)
    }
}

fn normalizing_transform(points: &[Point2<f64>]) -> Matrix3<f64> {
    let n = points.len() as f64;
    let cx = points.iter().map(|p| p.x).sum::<f64>() / n;
    let cy = points.iter().map(|p| p.y).sum::<f64>() / n;
    let mean_dist = points
        .iter()
        .map(|p| ((p.x - cx).powi(2) + (p.y - cy).powi(2)).sqrt())
        .sum::<f64>()
        / n;
    let s = if mean_dist > f64::EPSILON {
        std::f64::consts::SQRT_2 / mean_dist
    } else {
        1.0
    };
    Matrix3::new(s, 0.0, -s * cx, 0.0, s, -s * cy, 0.0, 0.0, 1.0)
}

fn apply(h: &Matrix3<f64>, p: &Point2<f64>) -> Point2<f64> {
    let v = h * Vector3::new(p.x, p.y, 1.0);
    Point2::new(v.x / v.z, v.y / v.z)
}

/// Homography `dst ~ H * src` by normalized DLT.
pub fn find_homography(src: &[Point2<f64>], dst: &[Point2<f64>]) -> Result<Matrix3<f64>> {
    if src.len() != dst.len() {
        return Err(Error::Numerical(format!(
            "homography needs matching point sets, got {} and {}",
            src.len(),
            dst.len()
        )));
    }
    if src.len() < 4 {
        return Err(Error::Numerical(format!(
            "homography needs at least 4 points, got {}",
            src.len()
        )));
    }
    let t_src = normalizing_transform(src);
    let t_dst = normalizing_transform(dst);

    let mut ata = SMatrix::<f64, 9, 9>::zeros();
    for (s, d) in src.iter().zip(dst) {
        let s = apply(&t_src, s);
        let d = apply(&t_dst, d);
        let rows = [
            [-s.x, -s.y, -1.0, 0.0, 0.0, 0.0, d.x * s.x, d.x * s.y, d.x],
            [0.0, 0.0, 0.0, -s.x, -s.y, -1.0, d.y * s.x, d.y * s.y, d.y],
        ];
        for row in rows {
            for i in 0..9 {
                for j in 0..9 {
                    ata[(i, j)] += row[i] * row[j];
                }
            }
        }
    }
    let eig = SymmetricEigen::new(ata);
    let h = eig.eigenvectors.column(eig.eigenvalues.imin());
    let hn = Matrix3::new(h[0], h[1], h[2], h[3], h[4], h[5], h[6], h[7], h[8]);

    let t_dst_inv = t_dst
        .try_inverse()
        .ok_or_else(|| Error::Numerical("degenerate point normalization".to_string()))?;
    let mut hm = t_dst_inv * hn * t_src;
    let scale = hm[(2, 2)];
    if scale.abs() > f64::EPSILON {
        hm /= scale;
    }
    if !hm.iter().all(|v| v.is_finite()) {
        return Err(Error::Numerical("homography is not finite".to_string()));
    }
    Ok(hm)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn rodrigues_round_trip() {
        let rvec = Vector3::new(0.3, -0.2, 1.1);
        let back = rotation_to_rodrigues(&rodrigues(&rvec));
        assert_relative_eq!(back, rvec, epsilon = 1e-12);
    }

    #[test]
    fn undistort_inverts_distort() {
        let d = Distortion::from_slice(&[0.11, -0.31, 0.0002, -0.0003, 0.24]).unwrap();
        let (xd, yd) = d.distort(0.21, -0.15);
        let (x, y) = d.undistort(xd, yd);
        assert_relative_eq!(x, 0.21, epsilon = 1e-9);
        assert_relative_eq!(y, -0.15, epsilon = 1e-9);
    }

    #[test]
    fn too_many_distortion_coefficients() {
        assert!(Distortion::from_slice(&[0.0; 9]).is_err());
    }

    #[test]
    fn homography_recovers_projective_map() {
        let truth = Matrix3::new(1.2, 0.1, 30.0, -0.05, 0.9, 12.0, 0.0004, -0.0002, 1.0);
        let src: Vec<_> = (0..5)
            .flat_map(|r| (0..4).map(move |c| Point2::new(c as f64 * 25.0, r as f64 * 25.0)))
            .collect();
        let dst: Vec<_> = src.iter().map(|p| apply(&truth, p)).collect();
        let h = find_homography(&src, &dst).unwrap();
        assert_relative_eq!(h, truth, epsilon = 1e-6);
    }

    #[test]
    fn homography_rejects_too_few_points() {
        let pts = vec![Point2::new(0.0, 0.0); 3];
        assert!(matches!(
            find_homography(&pts, &pts),
            Err(Error::Numerical(_))
        ));
    }
}
