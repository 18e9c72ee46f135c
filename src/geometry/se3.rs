//! SE3: 6-DOF rigid transformation (rotation + translation).
//!
//! Poses are stored as camera-to-world transforms (`T_wc`): a point in the
//! camera frame maps to the world frame with `pose.transform_point(p_cam)`.

use nalgebra::{Unit, UnitQuaternion, Vector3};

/// Rigid transformation: p' = R * p + t.
#[derive(Debug, Clone, PartialEq)]
pub struct SE3 {
    pub rotation: UnitQuaternion<f64>,
    pub translation: Vector3<f64>,
}

impl SE3 {
    pub fn identity() -> Self {
        Self {
            rotation: UnitQuaternion::identity(),
            translation: Vector3::zeros(),
        }
    }

    pub fn new(rotation: UnitQuaternion<f64>, translation: Vector3<f64>) -> Self {
        Self {
            rotation,
            translation,
        }
    }

    /// Pure translation.
    pub fn from_translation(translation: Vector3<f64>) -> Self {
        Self {
            rotation: UnitQuaternion::identity(),
            translation,
        }
    }

    /// Rotation of `angle` radians about the world Z axis followed by a translation.
    pub fn from_yaw(yaw: f64, translation: Vector3<f64>) -> Self {
        Self {
            rotation: UnitQuaternion::from_axis_angle(&Unit::new_normalize(Vector3::z()), yaw),
            translation,
        }
    }

    /// Inverse: [R^T | -R^T t].
    pub fn inverse(&self) -> Self {
        let rot_inv = self.rotation.inverse();
        Self {
            rotation: rot_inv,
            translation: -(rot_inv * self.translation),
        }
    }

    /// Compose two transforms: self ∘ other.
    pub fn compose(&self, other: &SE3) -> Self {
        Self {
            rotation: self.rotation * other.rotation,
            translation: self.rotation * other.translation + self.translation,
        }
    }

    /// Relative transform from `self` to `other`: self^{-1} ∘ other.
    pub fn between(&self, other: &SE3) -> Self {
        self.inverse().compose(other)
    }

    pub fn transform_point(&self, p: &Vector3<f64>) -> Vector3<f64> {
        self.rotation * p + self.translation
    }

    /// Log map: [rotation_vec (3), translation (3)].
    pub fn log(&self) -> [f64; 6] {
        let rot_vec = self.rotation.scaled_axis();
        [
            rot_vec.x,
            rot_vec.y,
            rot_vec.z,
            self.translation.x,
            self.translation.y,
            self.translation.z,
        ]
    }

    /// Exponential map, inverse of [`SE3::log`].
    pub fn exp(tangent: &[f64; 6]) -> Self {
        let rot_vec = Vector3::new(tangent[0], tangent[1], tangent[2]);
        Self {
            rotation: UnitQuaternion::from_scaled_axis(rot_vec),
            translation: Vector3::new(tangent[3], tangent[4], tangent[5]),
        }
    }

    /// Euclidean distance between the two translations.
    pub fn translation_distance(&self, other: &SE3) -> f64 {
        (self.translation - other.translation).norm()
    }

    /// Angle (radians) of the rotation taking `self` to `other`.
    pub fn rotation_angle(&self, other: &SE3) -> f64 {
        self.rotation.angle_to(&other.rotation)
    }
}

impl Default for SE3 {
    fn default() -> Self {
        Self::identity()
    }
}
