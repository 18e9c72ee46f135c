//! Debug publishing of the live trajectory.

use tracing::{debug, info};

use crate::geometry::SE3;
use crate::graph::KeyFrameId;

/// Live state handed to the publisher after every tracked sample.
#[derive(Debug, Clone)]
pub struct TrajectorySnapshot {
    pub timestamp_ns: u64,
    /// Current camera pose (T_wc).
    pub pose: SE3,
    pub new_keyframe: Option<KeyFrameId>,
}

/// Consumer of live tracking output (visualization, topics).
pub trait Publisher: Send {
    fn publish(&mut self, snapshot: &TrajectorySnapshot);
}

/// Discards everything.
#[derive(Debug, Default)]
pub struct NullPublisher;

impl Publisher for NullPublisher {
    fn publish(&mut self, _snapshot: &TrajectorySnapshot) {}
}

/// Logs the pose through `tracing`; keyframes at info level, every
/// `every`-th sample at debug level.
#[derive(Debug)]
pub struct TracingPublisher {
    every: usize,
    count: usize,
}

impl TracingPublisher {
    pub fn new(every: usize) -> Self {
        Self {
            every: every.max(1),
            count: 0,
        }
    }
}

impl Default for TracingPublisher {
    fn default() -> Self {
        Self::new(10)
    }
}

impl Publisher for TracingPublisher {
    fn publish(&mut self, snapshot: &TrajectorySnapshot) {
        self.count += 1;
        let t = &snapshot.pose.translation;
        if let Some(id) = snapshot.new_keyframe {
            info!(
                "[Publisher] {} at t={} pos=[{:.2}, {:.2}, {:.2}]",
                id, snapshot.timestamp_ns, t.x, t.y, t.z
            );
        } else if self.count % self.every == 0 {
            debug!(
                "[Publisher] t={} pos=[{:.2}, {:.2}, {:.2}]",
                snapshot.timestamp_ns, t.x, t.y, t.z
            );
        }
    }
}
