//! Pinhole stereo camera model.

use nalgebra::{Point2, Vector3};
use serde::Deserialize;

/// Rectified stereo pinhole camera.
///
/// Intrinsics come from the (external) calibration; the model is only used
/// to project 3D points for reprojection residuals.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
#[serde(default)]
pub struct CameraModel {
    pub fx: f64,
    pub fy: f64,
    pub cx: f64,
    pub cy: f64,
}

impl CameraModel {
    pub fn new(fx: f64, fy: f64, cx: f64, cy: f64) -> Self {
        Self { fx, fy, cx, cy }
    }

    /// Project a camera-frame point to pixel coordinates.
    ///
    /// Returns `None` for points at or behind the image plane.
    pub fn project(&self, p_cam: &Vector3<f64>) -> Option<Point2<f64>> {
        if p_cam.z <= 1e-6 {
            return None;
        }
        Some(Point2::new(
            self.fx * p_cam.x / p_cam.z + self.cx,
            self.fy * p_cam.y / p_cam.z + self.cy,
        ))
    }
}

impl Default for CameraModel {
    /// EuRoC-like intrinsics.
    fn default() -> Self {
        Self::new(458.0, 457.0, 367.0, 248.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_project_principal_point() {
        let cam = CameraModel::default();
        let px = cam.project(&Vector3::new(0.0, 0.0, 5.0)).unwrap();
        assert_relative_eq!(px.x, cam.cx);
        assert_relative_eq!(px.y, cam.cy);
    }

    #[test]
    fn test_project_behind_camera() {
        let cam = CameraModel::default();
        assert!(cam.project(&Vector3::new(1.0, 0.0, -1.0)).is_none());
    }
}
