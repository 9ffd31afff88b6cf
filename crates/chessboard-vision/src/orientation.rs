//! Orientation vectors: a unit axis `(o_x, o_y, o_z)` the frame's z axis
//! points along, plus a rotation `theta` (degrees) about that axis.
//!
//! `R = Rz(lon) * Ry(lat) * Rz(theta)` with `lat = acos(o_z)` and
//! `lon = atan2(o_y, o_x)`. Only an axis with no x/y component at all fixes
//! `lon` to zero.

use nalgebra::{Matrix3, Rotation3, Vector3};
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Below this `sin(lat)` the angles read back from a matrix are dominated by
/// rounding, and the matrix is treated as a pure z rotation.
const POLE_EPSILON: f64 = 1e-8;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct OrientationVector {
    pub o_x: f64,
    pub o_y: f64,
    pub o_z: f64,
    /// Degrees.
    pub theta: f64,
}

impl Default for OrientationVector {
    fn default() -> Self {
        Self {
            o_x: 0.0,
            o_y: 0.0,
            o_z: 1.0,
            theta: 0.0,
        }
    }
}

impl OrientationVector {
    pub fn new(o_x: f64, o_y: f64, o_z: f64, theta: f64) -> Self {
        Self { o_x, o_y, o_z, theta }
    }

    pub fn to_rotation_matrix(&self) -> Result<Matrix3<f64>> {
        let axis = Vector3::new(self.o_x, self.o_y, self.o_z);
        let norm = axis.norm();
        if norm < f64::EPSILON || !norm.is_finite() {
            return Err(Error::Numerical(format!(
                "orientation vector axis ({}, {}, {}) has no direction",
                self.o_x, self.o_y, self.o_z
            )));
        }
        let axis = axis / norm;
        let lat = axis.z.clamp(-1.0, 1.0).acos();
        let lon = if axis.x.hypot(axis.y) > 0.0 {
            axis.y.atan2(axis.x)
        } else {
            0.0
        };
        let rz = |a: f64| Rotation3::from_axis_angle(&Vector3::z_axis(), a);
        let ry = Rotation3::from_axis_angle(&Vector3::y_axis(), lat);
        Ok((rz(lon) * ry * rz(self.theta.to_radians())).into_inner())
    }

    pub fn from_rotation_matrix(r: &Matrix3<f64>) -> Self {
        let (o_x, o_y, o_z) = (r[(0, 2)], r[(1, 2)], r[(2, 2)]);
        if r[(2, 0)].hypot(r[(2, 1)]) > POLE_EPSILON {
            return Self {
                o_x,
                o_y,
                o_z,
                theta: r[(2, 1)].atan2(-r[(2, 0)]).to_degrees(),
            };
        }
        // At a pole R = Rz(theta) or Rz(-theta) * Ry(pi) with lon = 0.
        let (o_z, theta) = if o_z > 0.0 {
            (1.0, r[(1, 0)].atan2(r[(0, 0)]))
        } else {
            (-1.0, r[(1, 0)].atan2(r[(1, 1)]))
        };
        Self {
            o_x: 0.0,
            o_y: 0.0,
            o_z,
            theta: theta.to_degrees(),
        }
    }
}

pub fn ov_to_matrix(ov: &OrientationVector) -> Result<Matrix3<f64>> {
    ov.to_rotation_matrix()
}

pub fn matrix_to_ov(r: &Matrix3<f64>) -> OrientationVector {
    OrientationVector::from_rotation_matrix(r)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn identity_is_z_up() {
        let ov = matrix_to_ov(&Matrix3::identity());
        assert_relative_eq!(ov.o_z, 1.0);
        assert_relative_eq!(ov.theta, 0.0);
        assert_relative_eq!(ov_to_matrix(&ov).unwrap(), Matrix3::identity(), epsilon = 1e-12);
    }

    #[test]
    fn theta_about_z_axis() {
        let r = ov_to_matrix(&OrientationVector::new(0.0, 0.0, 1.0, 90.0)).unwrap();
        let expected = Rotation3::from_axis_angle(&Vector3::z_axis(), std::f64::consts::FRAC_PI_2);
        assert_relative_eq!(r, expected.into_inner(), epsilon = 1e-12);
    }

    #[test]
    fn x_axis_orientation() {
        // Pointing the z axis along +x is a +90 degree rotation about y.
        let r = ov_to_matrix(&OrientationVector::new(1.0, 0.0, 0.0, 0.0)).unwrap();
        assert_relative_eq!(r * Vector3::z(), Vector3::x(), epsilon = 1e-12);
        let back = matrix_to_ov(&r);
        assert_relative_eq!(back.o_x, 1.0, epsilon = 1e-12);
        assert_relative_eq!(back.theta, 0.0, epsilon = 1e-9);
    }

    #[test]
    fn unnormalized_axis_is_accepted() {
        let a = ov_to_matrix(&OrientationVector::new(0.0, 2.0, 2.0, 30.0)).unwrap();
        let b = ov_to_matrix(&OrientationVector::new(0.0, 0.5, 0.5, 30.0)).unwrap();
        assert_relative_eq!(a, b, epsilon = 1e-12);
    }

    #[test]
    fn zero_axis_is_rejected() {
        assert!(ov_to_matrix(&OrientationVector::new(0.0, 0.0, 0.0, 10.0)).is_err());
    }

    #[test]
    fn round_trips_generic_rotations() {
        for (axis, angle) in [
            (Vector3::new(0.3, -0.5, 0.8), 0.7),
            (Vector3::new(-1.0, 0.2, 0.1), 2.4),
            (Vector3::new(0.0, 1.0, 0.0), -1.2),
            (Vector3::new(0.5, 0.5, -0.2), 3.0),
        ] {
            let r = Rotation3::from_axis_angle(&nalgebra::Unit::new_normalize(axis), angle).into_inner();
            let back = ov_to_matrix(&matrix_to_ov(&r)).unwrap();
            assert_relative_eq!(back, r, epsilon = 1e-9);
        }
    }

    #[test]
    fn round_trips_at_both_poles() {
        for ov in [
            OrientationVector::new(0.0, 0.0, 1.0, 45.0),
            OrientationVector::new(0.0, 0.0, -1.0, -120.0),
        ] {
            let r = ov_to_matrix(&ov).unwrap();
            let back = matrix_to_ov(&r);
            assert_relative_eq!(back.o_z, ov.o_z, epsilon = 1e-12);
            assert_relative_eq!(back.theta, ov.theta, epsilon = 1e-9);
        }
    }

    #[test]
    fn round_trips_next_to_the_pole() {
        let ov = OrientationVector::new(0.0, 0.01, 0.99995, 30.0);
        let r = ov_to_matrix(&ov).unwrap();
        let back = matrix_to_ov(&r);
        let axis = Vector3::new(ov.o_x, ov.o_y, ov.o_z).normalize();
        assert_relative_eq!(Vector3::new(back.o_x, back.o_y, back.o_z), axis, epsilon = 1e-12);
        assert_relative_eq!(back.theta, 30.0, epsilon = 1e-9);
        assert_relative_eq!(ov_to_matrix(&back).unwrap(), r, epsilon = 1e-12);
    }

    #[test]
    fn tiny_tilts_round_trip_the_matrix() {
        for tilt in [1e-3, 1e-5, 1e-7, 1e-9, 1e-12] {
            for (lon, theta) in [(0.3_f64, 30.0), (-2.0, -150.0), (1.5, 90.0)] {
                let ov = OrientationVector::new(tilt * lon.cos(), tilt * lon.sin(), 1.0, theta);
                let r = ov_to_matrix(&ov).unwrap();
                let back = ov_to_matrix(&matrix_to_ov(&r)).unwrap();
                assert_relative_eq!(back, r, epsilon = 1e-7);

                let flipped = OrientationVector::new(tilt * lon.cos(), tilt * lon.sin(), -1.0, theta);
                let r = ov_to_matrix(&flipped).unwrap();
                let back = ov_to_matrix(&matrix_to_ov(&r)).unwrap();
                assert_relative_eq!(back, r, epsilon = 1e-7);
            }
        }
    }
}
