//! Reprojection residuals for `tiny-solver` and the Levenberg-Marquardt
//! driver shared by calibration and pose refinement.
//!
//! Residuals are generic over [`RealField`] so the solver can evaluate them
//! on dual numbers for exact Jacobians.

use std::collections::HashMap;

use nalgebra::{self as na, DVector, Point2, Point3, RealField, Rotation3, Vector3};
use tiny_solver::factors::Factor;
use tiny_solver::{LevenbergMarquardtOptimizer, Optimizer, OptimizerOptions, Problem};
use tracing::debug;

use crate::geometry::Pinhole;
use crate::{Error, Result};

/// Named parameter blocks as exchanged with the solver.
pub(crate) type Params = HashMap<String, DVector<f64>>;

fn constant<T: RealField>(v: f64) -> T {
    na::convert(v)
}

/// `fx fy cx cy` followed by the first `dist_len` distortion coefficients.
pub(crate) fn camera_params(camera: &Pinhole, dist_len: usize) -> DVector<f64> {
    let mut values = vec![camera.fx, camera.fy, camera.cx, camera.cy];
    values.extend_from_slice(&camera.distortion.coeffs[..dist_len.min(8)]);
    DVector::from_vec(values)
}

pub(crate) fn vector3(v: &DVector<f64>) -> Vector3<f64> {
    Vector3::new(v[0], v[1], v[2])
}

/// Distorted pixel position of `p` under the given camera parameters
/// (see [`camera_params`]) and pose.
fn project<T: RealField>(
    camera: &DVector<T>,
    rvec: &DVector<T>,
    tvec: &DVector<T>,
    p: &Point3<f64>,
) -> (T, T) {
    let rotation = Rotation3::new(Vector3::new(rvec[0].clone(), rvec[1].clone(), rvec[2].clone()));
    let translation = Vector3::new(tvec[0].clone(), tvec[1].clone(), tvec[2].clone());
    let q = rotation * Vector3::new(constant::<T>(p.x), constant(p.y), constant(p.z)) + translation;
    let x = q.x.clone() / q.z.clone();
    let y = q.y.clone() / q.z.clone();

    let k = |i: usize| camera.get(4 + i).cloned().unwrap_or_else(T::zero);
    let (k1, k2, p1, p2, k3, k4, k5, k6) = (k(0), k(1), k(2), k(3), k(4), k(5), k(6), k(7));
    let one = T::one();
    let two = constant::<T>(2.0);
    let r2 = x.clone() * x.clone() + y.clone() * y.clone();
    let r4 = r2.clone() * r2.clone();
    let r6 = r4.clone() * r2.clone();
    let radial = (one.clone() + k1 * r2.clone() + k2 * r4.clone() + k3 * r6.clone())
        / (one + k4 * r2.clone() + k5 * r4 + k6 * r6);
    let xy = x.clone() * y.clone();
    let xd = x.clone() * radial.clone()
        + two.clone() * p1.clone() * xy.clone()
        + p2.clone() * (r2.clone() + two.clone() * x.clone() * x);
    let yd = y.clone() * radial
        + p1 * (r2 + two.clone() * y.clone() * y)
        + two * p2 * xy;

    (
        camera[0].clone() * xd + camera[2].clone(),
        camera[1].clone() * yd + camera[3].clone(),
    )
}

/// Pixel residuals of one view of the target.
///
/// With a free camera the parameter blocks are `[camera, rvec, tvec]`;
/// with a fixed camera they are `[rvec, tvec]`.
pub(crate) struct ReprojectionFactor {
    object: Vec<Point3<f64>>,
    image: Vec<Point2<f64>>,
    fixed_camera: Option<DVector<f64>>,
}

impl ReprojectionFactor {
    pub fn new(object: &[Point3<f64>], image: &[Point2<f64>]) -> Self {
        Self {
            object: object.to_vec(),
            image: image.to_vec(),
            fixed_camera: None,
        }
    }

    pub fn with_fixed_camera(camera: &Pinhole, object: &[Point3<f64>], image: &[Point2<f64>]) -> Self {
        Self {
            fixed_camera: Some(camera_params(camera, 8)),
            ..Self::new(object, image)
        }
    }

    pub fn residual_dim(&self) -> usize {
        2 * self.image.len()
    }
}

impl<T: RealField> Factor<T> for ReprojectionFactor {
    fn residual_func(&self, params: &[DVector<T>]) -> DVector<T> {
        let (camera, pose) = match &self.fixed_camera {
            Some(camera) => (camera.clone().cast::<T>(), params),
            None => (params[0].clone(), &params[1..]),
        };
        let mut out = DVector::zeros(self.residual_dim());
        for (i, (p, obs)) in self.object.iter().zip(&self.image).enumerate() {
            let (u, v) = project(&camera, &pose[0], &pose[1], p);
            out[2 * i] = u - constant::<T>(obs.x);
            out[2 * i + 1] = v - constant::<T>(obs.y);
        }
        out
    }
}

/// Run Levenberg-Marquardt for at most `max_iteration` iterations.
pub(crate) fn solve(problem: &Problem, initial: &Params, max_iteration: usize) -> Result<Params> {
    // A rejected step leaves the error unchanged, so any decrease threshold
    // would stop the solver there.
    let options = OptimizerOptions {
        max_iteration,
        min_abs_error_decrease_threshold: 0.0,
        min_rel_error_decrease_threshold: 0.0,
        min_error_threshold: 1e-20,
        ..OptimizerOptions::default()
    };
    let result = LevenbergMarquardtOptimizer::default()
        .optimize(problem, initial, Some(options))
        .ok_or_else(|| Error::Numerical("levenberg-marquardt failed to converge".to_string()))?;
    if result.values().any(|v| v.iter().any(|x| !x.is_finite())) {
        return Err(Error::Numerical("levenberg-marquardt diverged".to_string()));
    }
    debug!(blocks = result.len(), max_iteration, "levenberg-marquardt finished");
    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chessboard::{generate_object_points, ChessboardPattern};
    use crate::geometry::Distortion;

    fn camera() -> Pinhole {
        Pinhole {
            fx: 600.0,
            fy: 590.0,
            cx: 321.0,
            cy: 238.0,
            distortion: Distortion::from_slice(&[0.1, -0.2, 0.001, -0.002, 0.05, 0.01, -0.02, 0.005])
                .unwrap(),
        }
    }

    #[test]
    fn residuals_agree_with_pinhole_projection() {
        let cam = camera();
        let object = generate_object_points(ChessboardPattern::new(4, 3).unwrap(), 25.0);
        let rvec = Vector3::new(0.2, -0.3, 0.1);
        let tvec = Vector3::new(-40.0, -20.0, 400.0);
        let image = cam.project_points(&object, &rvec, &tvec);

        let factor = ReprojectionFactor::new(&object, &image);
        let params = [
            camera_params(&cam, 8),
            DVector::from_column_slice(rvec.as_slice()),
            DVector::from_column_slice(tvec.as_slice()),
        ];
        let r = Factor::<f64>::residual_func(&factor, &params[..]);
        assert_eq!(r.len(), factor.residual_dim());
        assert!(r.amax() < 1e-9, "{r}");

        let shifted = [params[0].clone(), params[1].clone(), DVector::from_vec(vec![-39.0, -20.0, 400.0])];
        let r = Factor::<f64>::residual_func(&factor, &shifted[..]);
        assert!((r[0] - 600.0 / 400.0).abs() < 0.2, "{}", r[0]);
    }

    #[test]
    fn refines_perturbed_pose() {
        let cam = camera();
        let object = generate_object_points(ChessboardPattern::new(5, 4).unwrap(), 30.0);
        let rvec = Vector3::new(-0.25, 0.15, 0.05);
        let tvec = Vector3::new(-60.0, -45.0, 500.0);
        let image = cam.project_points(&object, &rvec, &tvec);

        let factor = ReprojectionFactor::with_fixed_camera(&cam, &object, &image);
        let mut problem = Problem::new();
        problem.add_residual_block(factor.residual_dim(), &["rvec", "tvec"], Box::new(factor), None);
        let initial = Params::from([
            ("rvec".to_string(), DVector::from_vec(vec![-0.2, 0.1, 0.0])),
            ("tvec".to_string(), DVector::from_vec(vec![-50.0, -40.0, 450.0])),
        ]);
        let result = solve(&problem, &initial, 100).unwrap();
        assert!((vector3(&result["rvec"]) - rvec).norm() < 1e-6);
        assert!((vector3(&result["tvec"]) - tvec).norm() < 1e-4);
    }
}
