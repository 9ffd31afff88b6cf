//! Intrinsic calibration from several views of a planar target.
//!
//! Focal lengths are initialised from the homography orthogonality
//! constraints with the principal point at the image centre and view poses
//! by SQPnP. Everything is then refined jointly by Levenberg-Marquardt on
//! the reprojection error, with one shared camera block and one pose per
//! view.

use nalgebra::{DVector, Matrix2, Matrix3, Point2, Point3, Vector2, Vector3};
use serde::{Deserialize, Serialize};
use tiny_solver::Problem;
use tracing::{debug, info};

use crate::geometry::{find_homography, Distortion, Pinhole};
use crate::optim::{self, camera_params, vector3, Params, ReprojectionFactor};
use crate::pnp::{check_planar, initial_pose};
use crate::{CameraIntrinsics, Error, Result};

pub const MIN_VIEWS: usize = 3;

const CAMERA: &str = "camera";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DistortionModel {
    /// `k1 k2 p1 p2 k3`
    Standard5,
    /// `k1 k2 p1 p2 k3 k4 k5 k6`
    #[default]
    Rational8,
}

impl DistortionModel {
    pub fn coefficient_count(self) -> usize {
        match self {
            DistortionModel::Standard5 => 5,
            DistortionModel::Rational8 => 8,
        }
    }
}

#[derive(Debug, Clone)]
pub struct CalibrationResult {
    /// `sqrt(sum |e|^2 / N)` over all points of all views.
    pub rms_error: f64,
    pub camera_matrix: Matrix3<f64>,
    pub distortion: Distortion,
    pub rvecs: Vec<Vector3<f64>>,
    pub tvecs: Vec<Vector3<f64>>,
}

impl CalibrationResult {
    pub fn camera(&self) -> Pinhole {
        Pinhole {
            fx: self.camera_matrix[(0, 0)],
            fy: self.camera_matrix[(1, 1)],
            cx: self.camera_matrix[(0, 2)],
            cy: self.camera_matrix[(1, 2)],
            distortion: self.distortion,
        }
    }

    pub fn intrinsics(&self, width_px: u32, height_px: u32) -> CameraIntrinsics {
        let cam = self.camera();
        CameraIntrinsics {
            width_px,
            height_px,
            fx: cam.fx,
            fy: cam.fy,
            cx: cam.cx,
            cy: cam.cy,
        }
    }
}

/// Camera from the solver's `fx fy cx cy k...` block.
fn pinhole_from_params(p: &DVector<f64>) -> Pinhole {
    let mut coeffs = [0.0; 8];
    for (c, v) in coeffs.iter_mut().zip(p.iter().skip(4)) {
        *c = *v;
    }
    Pinhole {
        fx: p[0],
        fy: p[1],
        cx: p[2],
        cy: p[3],
        distortion: Distortion { coeffs },
    }
}

fn param<'a>(result: &'a Params, key: &str) -> Result<&'a DVector<f64>> {
    result
        .get(key)
        .ok_or_else(|| Error::Numerical(format!("calibration lost parameter block {key}")))
}

/// Focal lengths from the orthogonality of the homography columns, with
/// the principal point fixed at `(cx, cy)`.
fn init_focal_lengths(homographies: &[Matrix3<f64>], cx: f64, cy: f64) -> Option<(f64, f64)> {
    let shift = Matrix3::new(1.0, 0.0, -cx, 0.0, 1.0, -cy, 0.0, 0.0, 1.0);
    let mut ata = Matrix2::zeros();
    let mut atb = Vector2::zeros();
    for h in homographies {
        let h = shift * h;
        let c0: Vector3<f64> = h.column(0).into_owned();
        let c1: Vector3<f64> = h.column(1).into_owned();
        let pairs = [(c0, c1), ((c0 + c1) * 0.5, (c0 - c1) * 0.5)];
        for (a, b) in pairs {
            let (a, b) = (a.try_normalize(f64::EPSILON)?, b.try_normalize(f64::EPSILON)?);
            let row = Vector2::new(a.x * b.x, a.y * b.y);
            ata += row * row.transpose();
            atb += row * (-a.z * b.z);
        }
    }
    let f = ata.try_inverse()? * atb;
    let fx = (1.0 / f.x).abs().sqrt();
    let fy = (1.0 / f.y).abs().sqrt();
    (fx.is_finite() && fy.is_finite() && fx > 0.0 && fy > 0.0).then_some((fx, fy))
}

fn validate_views(object: &[Vec<Point3<f64>>], image: &[Vec<Point2<f64>>]) -> Result<()> {
    if object.len() != image.len() {
        return Err(Error::Numerical(format!(
            "got {} object point sets but {} image point sets",
            object.len(),
            image.len()
        )));
    }
    if image.len() < MIN_VIEWS {
        return Err(Error::InsufficientViews(format!(
            "calibration needs at least {MIN_VIEWS} views, got {}",
            image.len()
        )));
    }
    for (i, (obj, img)) in object.iter().zip(image).enumerate() {
        if obj.len() != img.len() || obj.len() < 4 {
            return Err(Error::Numerical(format!(
                "view {i} has {} object points and {} image points, need at least 4 of each",
                obj.len(),
                img.len()
            )));
        }
        check_planar(obj)?;
    }
    Ok(())
}

pub fn calibrate_camera(
    object: &[Vec<Point3<f64>>],
    image: &[Vec<Point2<f64>>],
    image_size: (u32, u32),
    model: DistortionModel,
) -> Result<CalibrationResult> {
    validate_views(object, image)?;
    let (width, height) = image_size;

    let homographies = object
        .iter()
        .zip(image)
        .map(|(obj, img)| {
            let board: Vec<Point2<f64>> = obj.iter().map(|p| Point2::new(p.x, p.y)).collect();
            find_homography(&board, img)
        })
        .collect::<Result<Vec<_>>>()?;

    let cx = (width as f64 - 1.0) * 0.5;
    let cy = (height as f64 - 1.0) * 0.5;
    let (fx, fy) = init_focal_lengths(&homographies, cx, cy).unwrap_or_else(|| {
        let f = width.max(height) as f64;
        debug!(f, "focal length initialisation degenerate, using image size");
        (f, f)
    });
    debug!(fx, fy, cx, cy, "initial intrinsics");

    let dist_len = model.coefficient_count();
    let start = Pinhole {
        fx,
        fy,
        cx,
        cy,
        distortion: Distortion::zero(),
    };
    let mut problem = Problem::new();
    let mut initial = Params::from([(CAMERA.to_string(), camera_params(&start, dist_len))]);
    for (view, (obj, img)) in object.iter().zip(image).enumerate() {
        let normalized: Vec<Point2<f64>> = img.iter().map(|p| start.undistort_point(p)).collect();
        let (rvec, tvec) = initial_pose(obj, &normalized)?;
        let (rkey, tkey) = (format!("rvec{view}"), format!("tvec{view}"));
        let factor = ReprojectionFactor::new(obj, img);
        problem.add_residual_block(
            factor.residual_dim(),
            &[CAMERA, rkey.as_str(), tkey.as_str()],
            Box::new(factor),
            None,
        );
        initial.insert(rkey, DVector::from_column_slice(rvec.as_slice()));
        initial.insert(tkey, DVector::from_column_slice(tvec.as_slice()));
    }

    let result = optim::solve(&problem, &initial, 200)?;
    let camera = pinhole_from_params(param(&result, CAMERA)?);
    let mut rvecs = Vec::with_capacity(image.len());
    let mut tvecs = Vec::with_capacity(image.len());
    for view in 0..image.len() {
        rvecs.push(vector3(param(&result, &format!("rvec{view}"))?));
        tvecs.push(vector3(param(&result, &format!("tvec{view}"))?));
    }

    let mut sum_sq = 0.0;
    for (view, (obj, img)) in object.iter().zip(image).enumerate() {
        let projected = camera.project_points(obj, &rvecs[view], &tvecs[view]);
        sum_sq += projected.iter().zip(img).map(|(q, o)| (q - o).norm_squared()).sum::<f64>();
    }
    let total_points: usize = image.iter().map(Vec::len).sum();
    let rms_error = (sum_sq / total_points as f64).sqrt();

    info!(rms_error, views = image.len(), ?model, "camera calibrated");
    Ok(CalibrationResult {
        rms_error,
        camera_matrix: camera.matrix(),
        distortion: camera.distortion,
        rvecs,
        tvecs,
    })
}

/// Mean over views of `sqrt(sum |e|^2) / N_view`.
pub fn mean_reprojection_error(
    object: &[Vec<Point3<f64>>],
    image: &[Vec<Point2<f64>>],
    result: &CalibrationResult,
) -> f64 {
    let camera = result.camera();
    let errors: Vec<f64> = object
        .iter()
        .zip(image)
        .zip(result.rvecs.iter().zip(&result.tvecs))
        .filter(|((_, img), _)| !img.is_empty())
        .map(|((obj, img), (rvec, tvec))| {
            let projected = camera.project_points(obj, rvec, tvec);
            let sum_sq: f64 = projected
                .iter()
                .zip(img)
                .map(|(q, o)| (q - o).norm_squared())
                .sum();
            sum_sq.sqrt() / img.len() as f64
        })
        .collect();
    if errors.is_empty() {
        return 0.0;
    }
    errors.iter().sum::<f64>() / errors.len() as f64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chessboard::{generate_object_points, ChessboardPattern};

    fn synthetic_views(camera: &Pinhole) -> (Vec<Vec<Point3<f64>>>, Vec<Vec<Point2<f64>>>) {
        let board = generate_object_points(ChessboardPattern::new(9, 6).unwrap(), 30.0);
        let poses = [
            (Vector3::new(0.35, 0.0, 0.0), Vector3::new(-120.0, -75.0, 550.0)),
            (Vector3::new(-0.3, 0.1, 0.05), Vector3::new(-110.0, -70.0, 500.0)),
            (Vector3::new(0.0, 0.4, -0.1), Vector3::new(-130.0, -80.0, 600.0)),
            (Vector3::new(0.1, -0.35, 0.2), Vector3::new(-100.0, -60.0, 520.0)),
            (Vector3::new(0.25, 0.25, 0.0), Vector3::new(-140.0, -90.0, 650.0)),
        ];
        let object = vec![board.clone(); poses.len()];
        let image = poses
            .iter()
            .map(|(r, t)| camera.project_points(&board, r, t))
            .collect();
        (object, image)
    }

    fn truth() -> Pinhole {
        Pinhole {
            fx: 610.0,
            fy: 600.0,
            cx: 322.0,
            cy: 236.0,
            distortion: Distortion::from_slice(&[0.08, -0.15, 0.0005, -0.0004, 0.05]).unwrap(),
        }
    }

    #[test]
    fn recovers_intrinsics_from_exact_projections() {
        let truth = truth();
        let (object, image) = synthetic_views(&truth);
        let result = calibrate_camera(&object, &image, (640, 480), DistortionModel::Standard5).unwrap();
        let cam = result.camera();
        assert!(result.rms_error < 1e-4, "rms {}", result.rms_error);
        assert!((cam.fx - truth.fx).abs() < 0.05, "fx {}", cam.fx);
        assert!((cam.fy - truth.fy).abs() < 0.05, "fy {}", cam.fy);
        assert!((cam.cx - truth.cx).abs() < 0.05, "cx {}", cam.cx);
        assert!((cam.cy - truth.cy).abs() < 0.05, "cy {}", cam.cy);
        assert!((cam.distortion.k1() - truth.distortion.k1()).abs() < 1e-3);
        assert!(mean_reprojection_error(&object, &image, &result) < 1e-4);
        assert_eq!(result.rvecs.len(), 5);
    }

    #[test]
    fn rational_model_fits_exact_projections() {
        let (object, image) = synthetic_views(&truth());
        let result = calibrate_camera(&object, &image, (640, 480), DistortionModel::Rational8).unwrap();
        assert!(result.rms_error < 1e-3, "rms {}", result.rms_error);
    }

    #[test]
    fn needs_three_views() {
        let (object, image) = synthetic_views(&truth());
        let err = calibrate_camera(&object[..2], &image[..2], (640, 480), DistortionModel::Standard5);
        assert!(matches!(err, Err(Error::InsufficientViews(_))));
    }

    #[test]
    fn focal_init_is_close() {
        let camera = Pinhole {
            distortion: Distortion::zero(),
            ..truth()
        };
        let (object, image) = synthetic_views(&camera);
        let hs: Vec<_> = object
            .iter()
            .zip(&image)
            .map(|(o, i)| {
                let board: Vec<_> = o.iter().map(|p| Point2::new(p.x, p.y)).collect();
                find_homography(&board, i).unwrap()
            })
            .collect();
        let (fx, fy) = init_focal_lengths(&hs, 319.5, 239.5).unwrap();
        assert!((fx - 610.0).abs() < 15.0, "fx {fx}");
        assert!((fy - 600.0).abs() < 15.0, "fy {fy}");
    }
}
