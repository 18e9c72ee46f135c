//! Tracking results for a single sample.
//!
//! These types describe what happened during processing of one sample:
//! - tracking state and world pose
//! - overlap with the last keyframe and the refinement outcome
//! - whether a keyframe was created

use crate::geometry::SE3;
use crate::graph::KeyFrameId;
use crate::tracking::TrackingState;

/// Summary of tracking for a single sample.
#[derive(Debug, Clone)]
pub struct TrackingResult {
    pub state: TrackingState,
    /// Current camera pose in the world (T_wc).
    pub pose: SE3,
    /// Pose relative to the last keyframe (T_kf_c) before any reset.
    pub relative_pose: SE3,
    pub metrics: TrackingMetrics,
    /// Set when this sample produced a keyframe.
    pub new_keyframe: Option<KeyFrameId>,
}

/// Scalar metrics useful for debugging tracking quality.
#[derive(Debug, Clone, Default)]
pub struct TrackingMetrics {
    pub n_features: usize,
    /// Mutual nearest-neighbour matches against the last keyframe.
    pub n_matches: usize,
    /// Overlap with the last keyframe in percent.
    pub overlap: f64,
    /// Verifier inliers when refinement ran.
    pub refine_inliers: Option<usize>,
    /// Whether the refined estimate replaced the odometry prediction.
    pub refined: bool,
}
