//! Tracking thread: consumes sensor samples and outputs KeyFrames.
//!
//! - Sample validation (transient gaps)
//! - Odometry accumulation relative to the last keyframe
//! - Optional visual refinement with the geometric verifier
//! - Overlap-based KeyFrame decision

pub mod frame;
pub mod keyframe_decision;
pub mod matching;
pub mod result;
pub mod state;
pub mod tracker;

pub use frame::{Feature, FeatureSet, PointCloud, SensorSample, StereoFrame};
pub use result::{TrackingMetrics, TrackingResult};
pub use state::TrackingState;
pub use tracker::Tracker;
