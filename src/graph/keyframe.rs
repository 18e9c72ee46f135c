//! KeyFrame: a retained pose + features + cloud snapshot.
//!
//! After insertion the Graph owns the keyframe; only its pose changes, when
//! the optimizer relaxes the graph. Features and cloud are shared behind
//! `Arc` so readers can take them out of the store without holding the lock.

use std::sync::Arc;

use crate::geometry::SE3;
use crate::tracking::frame::{FeatureSet, PointCloud};

use super::bow::{compute_bow, BowVector};
use super::types::KeyFrameId;

/// A node of the pose graph.
#[derive(Debug, Clone)]
pub struct KeyFrame {
    pub id: KeyFrameId,

    /// Timestamp in nanoseconds.
    pub timestamp_ns: u64,

    /// Camera-to-world pose (T_wc).
    pub pose: SE3,

    pub features: Arc<FeatureSet>,

    /// Reconstructed point cloud in the camera frame.
    pub cloud: Arc<PointCloud>,

    /// Bag-of-words vector of the descriptors, for candidate ranking.
    pub bow: Arc<BowVector>,
}

impl KeyFrame {
    pub fn new(
        id: KeyFrameId,
        timestamp_ns: u64,
        pose: SE3,
        features: Arc<FeatureSet>,
        cloud: Arc<PointCloud>,
    ) -> Self {
        let bow = Arc::new(compute_bow(&features));
        Self {
            id,
            timestamp_ns,
            pose,
            features,
            cloud,
            bow,
        }
    }

    pub fn cloud_size(&self) -> usize {
        self.cloud.len()
    }

    /// Whether the cloud is large enough for cloud-based verification.
    pub fn has_verifiable_cloud(&self, min_cloud_size: usize) -> bool {
        self.cloud.len() >= min_cloud_size
    }
}
