//! Pose of a planar target from 2D-3D correspondences.
//!
//! The initial pose comes from SQPnP on undistorted normalized points, with
//! the plane homography as a fallback, and is refined by Levenberg-Marquardt
//! on the pixel reprojection error.

use nalgebra::{DVector, Matrix3, Point2, Point3, Vector3};
use sqpnp_simple::sqpnp_solve;
use tiny_solver::Problem;
use tracing::debug;

use crate::geometry::{find_homography, orthonormalize, rotation_to_rodrigues, Pinhole};
use crate::optim::{self, vector3, Params, ReprojectionFactor};
use crate::{Error, Result};

const PLANAR_TOLERANCE: f64 = 1e-9;

pub(crate) fn check_planar(object: &[Point3<f64>]) -> Result<()> {
    if object.iter().any(|p| p.z.abs() > PLANAR_TOLERANCE) {
        return Err(Error::Unsupported(
            "only planar targets with z = 0 are supported".to_string(),
        ));
    }
    Ok(())
}

/// Pose `(rvec, tvec)` from a homography mapping board `(X, Y)` to
/// normalized image coordinates. The target is placed in front of the
/// camera.
pub(crate) fn pose_from_homography(h: &Matrix3<f64>) -> Result<(Vector3<f64>, Vector3<f64>)> {
    let h1: Vector3<f64> = h.column(0).into_owned();
    let h2: Vector3<f64> = h.column(1).into_owned();
    let h3: Vector3<f64> = h.column(2).into_owned();
    let (n1, n2) = (h1.norm(), h2.norm());
    if n1 < f64::EPSILON || n2 < f64::EPSILON {
        return Err(Error::Numerical("degenerate homography".to_string()));
    }
    let mut lambda = 1.0 / (n1 * n2).sqrt();
    if h3.z < 0.0 {
        lambda = -lambda;
    }
    let r1 = h1 * lambda;
    let r2 = h2 * lambda;
    let r = orthonormalize(&Matrix3::from_columns(&[r1, r2, r1.cross(&r2)]));
    Ok((rotation_to_rodrigues(&r), h3 * lambda))
}

/// Global SQPnP solution for normalized image points, if it places the
/// target in front of the camera.
pub(crate) fn sqpnp_pose(
    object: &[Point3<f64>],
    normalized: &[Point2<f64>],
) -> Option<(Vector3<f64>, Vector3<f64>)> {
    let p3ds: Vec<(f64, f64, f64)> = object.iter().map(|p| (p.x, p.y, p.z)).collect();
    let p2ds: Vec<(f64, f64)> = normalized.iter().map(|p| (p.x, p.y)).collect();
    let (r, t) = sqpnp_solve(&p3ds, &p2ds)?;
    let (rvec, tvec) = (Vector3::new(r.0, r.1, r.2), Vector3::new(t.0, t.1, t.2));
    (rvec.iter().chain(tvec.iter()).all(|v| v.is_finite()) && tvec.z > 0.0).then_some((rvec, tvec))
}

/// Initial pose from normalized points: SQPnP, else the plane homography.
pub(crate) fn initial_pose(
    object: &[Point3<f64>],
    normalized: &[Point2<f64>],
) -> Result<(Vector3<f64>, Vector3<f64>)> {
    if let Some(pose) = sqpnp_pose(object, normalized) {
        return Ok(pose);
    }
    debug!("sqpnp found no pose in front of the camera, using the homography");
    let board: Vec<Point2<f64>> = object.iter().map(|p| Point2::new(p.x, p.y)).collect();
    pose_from_homography(&find_homography(&board, normalized)?)
}

/// Rotation vector and translation taking board coordinates into the
/// camera frame, in the units of `object`.
pub fn solve_pnp(
    object: &[Point3<f64>],
    image: &[Point2<f64>],
    camera: &Pinhole,
) -> Result<(Vector3<f64>, Vector3<f64>)> {
    if object.len() != image.len() {
        return Err(Error::Numerical(format!(
            "got {} object points but {} image points",
            object.len(),
            image.len()
        )));
    }
    if object.len() < 4 {
        return Err(Error::Numerical(format!(
            "pose estimation needs at least 4 points, got {}",
            object.len()
        )));
    }
    check_planar(object)?;

    let normalized: Vec<Point2<f64>> = image.iter().map(|p| camera.undistort_point(p)).collect();
    let (rvec, tvec) = initial_pose(object, &normalized)?;

    let factor = ReprojectionFactor::with_fixed_camera(camera, object, image);
    let mut problem = Problem::new();
    problem.add_residual_block(factor.residual_dim(), &["rvec", "tvec"], Box::new(factor), None);
    let initial = Params::from([
        ("rvec".to_string(), DVector::from_column_slice(rvec.as_slice())),
        ("tvec".to_string(), DVector::from_column_slice(tvec.as_slice())),
    ]);
    let result = optim::solve(&problem, &initial, 50)?;
    let (Some(r), Some(t)) = (result.get("rvec"), result.get("tvec")) else {
        return Err(Error::Numerical("pose refinement lost its parameters".to_string()));
    };
    let (rvec, tvec) = (vector3(r), vector3(t));
    let projected = camera.project_points(object, &rvec, &tvec);
    let sum_sq: f64 = projected.iter().zip(image).map(|(q, o)| (q - o).norm_squared()).sum();
    debug!(rms = (sum_sq / object.len() as f64).sqrt(), "solved pnp");
    Ok((rvec, tvec))
}
