//! Inter-thread message types.
//!
//! These types are sent between threads via channels to coordinate
//! SLAM processing.

use std::sync::Arc;

use crossbeam_channel::Sender;

use crate::error::Result;
use crate::geometry::SE3;
use crate::graph::{Edge, KeyFrameId};
use crate::tracking::frame::{FeatureSet, PointCloud};

/// Keyframe handed from Tracking to the Graph thread.
#[derive(Debug, Clone)]
pub struct NewKeyFrameMsg {
    /// Id reserved for this keyframe by the Graph handle.
    pub keyframe_id: KeyFrameId,

    /// Timestamp in nanoseconds.
    pub timestamp_ns: u64,

    /// Pose estimate from Tracking (T_wc). Only stored as-is for the first
    /// keyframe; later poses are chained from the stored predecessor.
    pub pose: SE3,

    /// Relative transform from the previous keyframe (T_prev_new).
    /// None for the first keyframe.
    pub odometry: Option<SE3>,

    pub features: Arc<FeatureSet>,

    pub cloud: Arc<PointCloud>,
}

/// Commands processed, in order, by the Graph thread.
pub enum GraphCommand {
    /// Append a keyframe and its odometry edge.
    InsertKeyFrame(NewKeyFrameMsg),

    /// Validate and append a loop edge; the decision is sent back before
    /// the follow-up optimization runs.
    InsertLoopEdge {
        edge: Edge,
        reply: Sender<Result<()>>,
    },

    /// Run a global optimization.
    Optimize(Sender<()>),

    /// Barrier: replied to once every earlier command has been applied.
    Sync(Sender<()>),

    /// Drain queued appends and exit.
    Shutdown,
}
