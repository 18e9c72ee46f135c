//! Pose graph: keyframe store, relaxation and the Graph thread.
//!
//! - `types`: ids and edges
//! - `keyframe`: the node payload
//! - `bow`: bag-of-words vectors used to rank loop candidates
//! - `pose_graph`: the append-only store and its invariants
//! - `optimizer`: Levenberg-Marquardt relaxation of all poses
//! - `snapshot`: pose/edge snapshots for persistence
//! - `worker`: the Graph thread and its cloneable handle

pub mod bow;
pub mod keyframe;
pub mod optimizer;
pub mod pose_graph;
pub mod snapshot;
pub mod types;
pub mod worker;

pub use bow::{bow_score, compute_bow, BowVector};
pub use keyframe::KeyFrame;
pub use optimizer::PoseGraphResult;
pub use pose_graph::PoseGraph;
pub use snapshot::{GraphSnapshot, PoseRecord, SnapshotSink};
pub use types::{Edge, EdgeKind, KeyFrameId};
pub use worker::Graph;
