//! Frame-level inputs: features, stereo reconstruction and sensor samples.
//!
//! Feature extraction and stereo matching happen upstream; Tracking only
//! sees the already-extracted keypoints, binary descriptors, per-feature
//! stereo depth and the reconstructed point cloud.

use nalgebra::{Point2, Vector3};

use crate::geometry::SE3;

/// 256-bit binary descriptor (ORB layout).
pub type Descriptor = [u8; 32];

/// Reconstructed point cloud in the camera frame.
pub type PointCloud = Vec<Vector3<f64>>;

/// A single detected feature in the left image.
#[derive(Debug, Clone, PartialEq)]
pub struct Feature {
    /// Pixel coordinates.
    pub keypoint: Point2<f64>,
    pub descriptor: Descriptor,
    /// Stereo-triangulated point in the camera frame, if depth was valid.
    pub point: Option<Vector3<f64>>,
}

/// The features of one frame.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FeatureSet {
    pub features: Vec<Feature>,
}

impl FeatureSet {
    pub fn new(features: Vec<Feature>) -> Self {
        Self { features }
    }

    pub fn len(&self) -> usize {
        self.features.len()
    }

    pub fn is_empty(&self) -> bool {
        self.features.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Feature> {
        self.features.iter()
    }

    pub fn get(&self, idx: usize) -> Option<&Feature> {
        self.features.get(idx)
    }

    pub fn descriptors(&self) -> impl Iterator<Item = &Descriptor> {
        self.features.iter().map(|f| &f.descriptor)
    }

    /// Number of features with valid stereo depth.
    pub fn num_with_depth(&self) -> usize {
        self.features.iter().filter(|f| f.point.is_some()).count()
    }
}

/// Output of the stereo front-end for one image pair.
#[derive(Debug, Clone, Default)]
pub struct StereoFrame {
    pub features: FeatureSet,
    pub cloud: PointCloud,
}

/// One synchronized sample pushed to Tracking.
///
/// Either part may be missing when the transport drops a message; Tracking
/// treats that as a transient gap.
#[derive(Debug, Clone)]
pub struct SensorSample {
    pub timestamp_ns: u64,
    /// Odometry motion since the previous sample (T_prev_curr).
    pub odometry: Option<SE3>,
    pub stereo: Option<StereoFrame>,
}

impl SensorSample {
    pub fn new(timestamp_ns: u64, odometry: SE3, stereo: StereoFrame) -> Self {
        Self {
            timestamp_ns,
            odometry: Some(odometry),
            stereo: Some(stereo),
        }
    }
}
