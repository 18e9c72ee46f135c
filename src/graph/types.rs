//! Core ID and edge types of the pose graph.

use serde::Serialize;

use crate::geometry::SE3;

/// Unique identifier of a keyframe.
///
/// Ids are assigned sequentially by the Graph and double as the index of
/// the keyframe in the append-only store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct KeyFrameId(pub u64);

impl KeyFrameId {
    pub fn new(id: u64) -> Self {
        Self(id)
    }

    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl std::fmt::Display for KeyFrameId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "KF{}", self.0)
    }
}

/// Kind of pose graph edge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum EdgeKind {
    /// Sequential edge created when a keyframe is inserted.
    Odometry,
    /// Accepted loop closure.
    Loop,
}

/// A relative pose constraint between two keyframes.
#[derive(Debug, Clone)]
pub struct Edge {
    pub source: KeyFrameId,
    pub target: KeyFrameId,
    /// Measured T_source_target.
    pub relative: SE3,
    /// Information weight (inverse variance).
    pub information: f64,
    pub kind: EdgeKind,
}

impl Edge {
    pub fn odometry(source: KeyFrameId, target: KeyFrameId, relative: SE3, information: f64) -> Self {
        Self {
            source,
            target,
            relative,
            information,
            kind: EdgeKind::Odometry,
        }
    }

    pub fn loop_closure(source: KeyFrameId, target: KeyFrameId, relative: SE3, information: f64) -> Self {
        Self {
            source,
            target,
            relative,
            information,
            kind: EdgeKind::Loop,
        }
    }
}
