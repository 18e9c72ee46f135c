//! Graph snapshots handed to the persistence collaborator.

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::geometry::SE3;

use super::types::KeyFrameId;

/// Flat pose record, one per keyframe.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PoseRecord {
    pub id: u64,
    pub timestamp_ns: u64,
    pub x: f64,
    pub y: f64,
    pub z: f64,
    pub qx: f64,
    pub qy: f64,
    pub qz: f64,
    pub qw: f64,
}

impl PoseRecord {
    pub fn new(id: KeyFrameId, timestamp_ns: u64, pose: &SE3) -> Self {
        let q = pose.rotation.quaternion();
        Self {
            id: id.0,
            timestamp_ns,
            x: pose.translation.x,
            y: pose.translation.y,
            z: pose.translation.z,
            qx: q.i,
            qy: q.j,
            qz: q.k,
            qw: q.w,
        }
    }
}

/// Optimized poses plus accepted loop edges at one point in time.
#[derive(Debug, Clone, Default)]
pub struct GraphSnapshot {
    pub poses: Vec<PoseRecord>,
    pub loop_edges: Vec<(KeyFrameId, KeyFrameId)>,
}

/// Consumer of graph snapshots (persistence, visualization).
///
/// Called from the Graph thread; errors are logged there and never stop it.
pub trait SnapshotSink: Send {
    fn consume(&mut self, snapshot: &GraphSnapshot) -> Result<()>;
}
