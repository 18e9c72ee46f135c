//! Tuning constants and configuration structs.
//!
//! The constants carry the default values used throughout the pipeline.
//! Every component also has its own `*Config` struct with a `Default`
//! built from these constants; `SlamConfig` aggregates them and can be
//! loaded from YAML.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::error::{Result, SlamError};
use crate::geometry::CameraModel;

/// Minimum inliers for a loop closure candidate to be accepted.
pub const LC_MIN_INLIERS: usize = 20;

/// Maximum inliers for a loop closure candidate. Above this the two
/// keyframes are near-duplicates and do not constrain the geometry.
pub const LC_MAX_INLIERS: usize = 100;

/// Number of preceding temporal neighbours excluded from loop search.
pub const LC_NEIGHBORS: usize = 4;

/// Number of most recent keyframes excluded from loop search.
pub const LC_DISCARD_WINDOW: usize = 10;

/// Maximum translation (metres) between a proposed loop edge and the
/// currently optimized relative pose of its endpoints.
pub const LC_MAX_EDGE_DIFF: f64 = 2.0;

/// Overlap (percent) below which tracking creates a new keyframe.
pub const TRACKING_MIN_OVERLAP: f64 = 80.0;

/// Minimum reconstructed cloud size for cloud-based verification.
pub const MIN_CLOUD_SIZE: usize = 100;

/// Reprojection threshold (pixels) for loop closure verification.
pub const LC_EPIPOLAR_THRESH: f64 = 4.0;

/// Reprojection threshold (pixels) for tracking refinement.
pub const STEREO_EPIPOLAR_THRESH: f64 = 1.5;

/// Number of ranked candidates verified per keyframe.
pub const LC_TOP_CANDIDATES: usize = 3;

/// Minimum inliers for a refined visual correction to be fused.
pub const TRACKING_MIN_REFINE_INLIERS: usize = 15;

/// Maximum translation (metres) between the refined correction and the
/// odometry prediction.
pub const TRACKING_MAX_REFINE_DIFF: f64 = 0.5;

/// Tracking parameters.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TrackingConfig {
    /// Opaque odometry source address, forwarded to the sensor collaborator.
    pub odom_source: String,
    /// Opaque stereo camera source address.
    pub camera_source: String,
    /// Re-estimate the visual correction with the geometric verifier.
    pub refine: bool,
    /// Overlap percentage below which a keyframe is created.
    pub min_overlap: f64,
    /// Reprojection threshold used in refinement mode.
    pub refine_threshold: f64,
    pub min_refine_inliers: usize,
    pub max_refine_diff: f64,
}

impl Default for TrackingConfig {
    fn default() -> Self {
        Self {
            odom_source: String::new(),
            camera_source: String::new(),
            refine: false,
            min_overlap: TRACKING_MIN_OVERLAP,
            refine_threshold: STEREO_EPIPOLAR_THRESH,
            min_refine_inliers: TRACKING_MIN_REFINE_INLIERS,
            max_refine_diff: TRACKING_MAX_REFINE_DIFF,
        }
    }
}

/// Pose graph parameters.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct GraphConfig {
    /// Preceding neighbours excluded from `neighbor_candidates`.
    pub lc_neighbors: usize,
    /// Most recent keyframes excluded from `neighbor_candidates`.
    pub lc_discard_window: usize,
    /// Loop edge sanity bound (metres).
    pub max_edge_diff: f64,
    /// Information weight of odometry edges.
    pub odometry_information: f64,
    /// Information weight of loop edges.
    pub loop_information: f64,
    /// Periodic optimization interval in milliseconds; 0 disables it.
    pub optimize_period_ms: u64,
    /// Push a snapshot to the sinks every N keyframes; 0 disables it.
    pub save_every: usize,
    pub optimizer: OptimizerConfig,
}

impl GraphConfig {
    pub fn optimize_period(&self) -> Option<Duration> {
        (self.optimize_period_ms > 0).then(|| Duration::from_millis(self.optimize_period_ms))
    }
}

impl Default for GraphConfig {
    fn default() -> Self {
        Self {
            lc_neighbors: LC_NEIGHBORS,
            lc_discard_window: LC_DISCARD_WINDOW,
            max_edge_diff: LC_MAX_EDGE_DIFF,
            odometry_information: 1.0,
            loop_information: 1.0,
            optimize_period_ms: 0,
            save_every: 0,
            optimizer: OptimizerConfig::default(),
        }
    }
}

/// Levenberg-Marquardt parameters for pose graph relaxation.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct OptimizerConfig {
    pub max_iterations: usize,
    /// Convergence threshold on relative parameter change.
    pub param_tolerance: f64,
    /// Convergence threshold on gradient norm.
    pub gradient_tolerance: f64,
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self {
            max_iterations: 50,
            param_tolerance: 1e-9,
            gradient_tolerance: 1e-9,
        }
    }
}

/// RANSAC parameters for the geometric verifier.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct VerifierConfig {
    pub max_iterations: usize,
    /// Probability of drawing at least one all-inlier sample.
    pub probability: f64,
    /// Fixed RNG seed; `None` seeds from entropy.
    pub seed: Option<u64>,
}

impl Default for VerifierConfig {
    fn default() -> Self {
        Self {
            max_iterations: 300,
            probability: 0.99,
            seed: None,
        }
    }
}

/// Loop closing parameters.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoopClosingConfig {
    pub min_inliers: usize,
    pub max_inliers: usize,
    pub min_cloud_size: usize,
    /// Reprojection threshold for loop verification.
    pub epipolar_threshold: f64,
    /// Ranked candidates verified per keyframe.
    pub top_candidates: usize,
    /// Sleep after an empty candidate set, in milliseconds.
    pub empty_backoff_ms: u64,
}

impl LoopClosingConfig {
    pub fn empty_backoff(&self) -> Duration {
        Duration::from_millis(self.empty_backoff_ms)
    }
}

impl Default for LoopClosingConfig {
    fn default() -> Self {
        Self {
            min_inliers: LC_MIN_INLIERS,
            max_inliers: LC_MAX_INLIERS,
            min_cloud_size: MIN_CLOUD_SIZE,
            epipolar_threshold: LC_EPIPOLAR_THRESH,
            top_candidates: LC_TOP_CANDIDATES,
            empty_backoff_ms: 20,
        }
    }
}

/// Persistence collaborator parameters.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct OutputConfig {
    /// Working directory handed to the snapshot sink.
    pub directory: PathBuf,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            directory: PathBuf::from("output"),
        }
    }
}

/// Top-level configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct SlamConfig {
    pub camera: CameraModel,
    pub tracking: TrackingConfig,
    pub graph: GraphConfig,
    pub loop_closing: LoopClosingConfig,
    pub verifier: VerifierConfig,
    pub output: OutputConfig,
}

impl SlamConfig {
    /// Parse a YAML document. Missing keys fall back to defaults.
    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml).map_err(|e| SlamError::Config(e.to_string()))
    }

    pub fn from_yaml_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_yaml_str(&text)
    }
}
