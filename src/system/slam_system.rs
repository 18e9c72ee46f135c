//! SLAM System - Main entry point and thread orchestration.
//!
//! The `SlamSystem` owns the three threads of the backend: the Graph thread
//! holding the pose graph, the LoopClosing thread fed by the Graph's
//! keyframe notifications, and the Tracking thread consuming sensor samples.
//! Shutdown runs in dependency order: Tracking stops first, LoopClosing is
//! finalized so no verification is lost, and the Graph drains last.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{unbounded, Sender};
use tracing::{info, warn};

use crate::config::SlamConfig;
use crate::error::{Result, SlamError};
use crate::geometry::GeometricVerifier;
use crate::graph::{Graph, KeyFrameId, SnapshotSink};
use crate::loop_closing::{LoopCloserStats, LoopClosing};
use crate::tracking::{SensorSample, Tracker};

use super::publisher::Publisher;

/// Poll interval while waiting for loop closing to catch up.
const WAIT_POLL: Duration = Duration::from_millis(10);

/// Final counters returned by [`SlamSystem::shutdown`].
#[derive(Debug, Clone, Default)]
pub struct SlamSummary {
    pub keyframes: usize,
    pub loop_edges: usize,
    pub loop_closing: LoopCloserStats,
}

/// Main SLAM system orchestrating Tracking, Graph and LoopClosing.
pub struct SlamSystem {
    graph: Graph,
    loop_closing: LoopClosing,

    /// Sample channel into the Tracking thread.
    sample_sender: Sender<SensorSample>,

    tracking_stop: Arc<AtomicBool>,
    tracking_handle: Option<JoinHandle<()>>,

    summary: Option<SlamSummary>,
}

impl SlamSystem {
    /// Spawn the Graph, LoopClosing and Tracking threads.
    pub fn new(config: SlamConfig, sinks: Vec<Box<dyn SnapshotSink>>, mut publisher: Box<dyn Publisher>) -> Result<Self> {
        let (graph, kf_receiver) = Graph::spawn(config.graph.clone(), sinks)?;

        let verifier = GeometricVerifier::new(config.camera, config.verifier.clone());
        let loop_closing = LoopClosing::spawn(
            graph.clone(),
            kf_receiver,
            Box::new(verifier.clone()),
            config.loop_closing.clone(),
        )?;

        let (sample_sender, sample_receiver) = unbounded::<SensorSample>();
        let tracking_stop = Arc::new(AtomicBool::new(false));
        let mut tracker = Tracker::new(config.tracking.clone(), verifier, graph.clone());

        let stop = Arc::clone(&tracking_stop);
        let tracking_handle = thread::Builder::new().name("tracking".into()).spawn(move || {
            tracker.run(sample_receiver, stop, publisher.as_mut());
        })?;

        info!(
            "[System] started (refine={}, optimize_period_ms={})",
            config.tracking.refine, config.graph.optimize_period_ms
        );

        Ok(Self {
            graph,
            loop_closing,
            sample_sender,
            tracking_stop,
            tracking_handle: Some(tracking_handle),
            summary: None,
        })
    }

    /// Queue a sample for the Tracking thread.
    pub fn feed(&self, sample: SensorSample) -> Result<()> {
        self.sample_sender.send(sample).map_err(|_| SlamError::Disconnected)
    }

    /// A sender for sensor collaborators running on their own threads.
    pub fn sample_sender(&self) -> Sender<SensorSample> {
        self.sample_sender.clone()
    }

    pub fn graph(&self) -> &Graph {
        &self.graph
    }

    /// Last keyframe LoopClosing has finished with.
    pub fn last_loop_processed(&self) -> Option<KeyFrameId> {
        self.loop_closing.last_processed()
    }

    /// Stop the Tracking thread once every sample already queued has been
    /// tracked, and wait until the Graph has appended the keyframes it
    /// produced. Idempotent.
    pub fn stop_tracking(&mut self) {
        self.tracking_stop.store(true, Ordering::SeqCst);
        if let Some(handle) = self.tracking_handle.take() {
            if handle.join().is_err() {
                warn!("[System] tracking thread panicked");
            }
        }
        if let Err(e) = self.graph.sync() {
            warn!("[System] graph sync failed: {}", e);
        }
    }

    /// Wait until LoopClosing has processed every keyframe in the Graph.
    ///
    /// Returns false on timeout.
    pub fn wait_for_loop_closing(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            let Some(last) = self.graph.num_keyframes().checked_sub(1) else {
                return true;
            };
            if self.last_loop_processed() >= Some(KeyFrameId::new(last as u64)) {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            thread::sleep(WAIT_POLL);
        }
    }

    /// Stop all threads in order: Tracking, LoopClosing, Graph.
    ///
    /// LoopClosing is finalized, so a verification already in flight still
    /// reaches the Graph before it drains. Idempotent.
    pub fn shutdown(&mut self) -> SlamSummary {
        if let Some(summary) = &self.summary {
            return summary.clone();
        }

        self.stop_tracking();
        let loop_closing = self.loop_closing.finalize();
        self.graph.shutdown();

        let summary = SlamSummary {
            keyframes: self.graph.num_keyframes(),
            loop_edges: self.graph.num_loop_edges(),
            loop_closing,
        };
        info!(
            "[System] shut down: {} keyframes, {} loop edges",
            summary.keyframes, summary.loop_edges
        );
        self.summary = Some(summary.clone());
        summary
    }
}

impl Drop for SlamSystem {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::VerifierConfig;
    use crate::geometry::SE3;
    use crate::io::synthetic::{SyntheticConfig, SyntheticSequence};
    use crate::system::publisher::{NullPublisher, TrajectorySnapshot};
    use parking_lot::Mutex;

    struct RecordingPublisher(Arc<Mutex<Vec<TrajectorySnapshot>>>);

    impl Publisher for RecordingPublisher {
        fn publish(&mut self, snapshot: &TrajectorySnapshot) {
            self.0.lock().push(snapshot.clone());
        }
    }

    fn seeded_config() -> SlamConfig {
        SlamConfig {
            verifier: VerifierConfig {
                seed: Some(7),
                ..VerifierConfig::default()
            },
            ..SlamConfig::default()
        }
    }

    /// Frame index of a synthetic timestamp.
    fn frame_index(sequence: &SyntheticSequence, timestamp_ns: u64) -> usize {
        (timestamp_ns / sequence.config().frame_period_ns) as usize - 1
    }

    #[test]
    fn test_every_queued_sample_is_tracked() {
        let sequence = SyntheticSequence::new(SyntheticConfig {
            num_poses: 30,
            ..SyntheticConfig::default()
        });
        let published = Arc::new(Mutex::new(Vec::new()));
        let mut system = SlamSystem::new(
            seeded_config(),
            Vec::new(),
            Box::new(RecordingPublisher(Arc::clone(&published))),
        )
        .unwrap();

        for sample in sequence.samples() {
            system.feed(sample).unwrap();
        }
        let summary = system.shutdown();

        let published = published.lock();
        assert_eq!(published.len(), sequence.len());
        assert_eq!(published[0].new_keyframe, Some(KeyFrameId::new(0)));
        let created = published.iter().filter(|s| s.new_keyframe.is_some()).count();
        assert_eq!(summary.keyframes, created);
        assert!(system.graph().read().is_odometry_connected());
    }

    #[test]
    fn test_feed_after_shutdown_is_ignored() {
        let sequence = SyntheticSequence::new(SyntheticConfig {
            num_poses: 3,
            ..SyntheticConfig::default()
        });
        let mut system = SlamSystem::new(seeded_config(), Vec::new(), Box::new(NullPublisher)).unwrap();
        let first = system.shutdown();
        assert_eq!(first.keyframes, 0);

        // The receiver is gone with the tracking thread
        assert!(system.feed(sequence.sample_at(0)).is_err());
        assert_eq!(system.shutdown().keyframes, 0);
    }

    #[test]
    fn test_loop_closure_reduces_drift() {
        let sequence = SyntheticSequence::new(SyntheticConfig::default());
        let mut system = SlamSystem::new(seeded_config(), Vec::new(), Box::new(NullPublisher)).unwrap();

        for sample in sequence.samples() {
            system.feed(sample).unwrap();
        }
        system.stop_tracking();
        assert!(system.wait_for_loop_closing(Duration::from_secs(60)));
        let summary = system.shutdown();

        assert!(summary.keyframes > 10);
        assert!(summary.loop_closing.loops_closed >= 1);
        assert_eq!(summary.loop_edges, summary.loop_closing.loops_closed);

        let graph = system.graph().read();
        assert!(graph.is_odometry_connected());

        let last = &graph.keyframes()[graph.len() - 1];
        let index = frame_index(&sequence, last.timestamp_ns);
        let truth = sequence.ground_truth(0).between(sequence.ground_truth(index));

        let mut dead_reckoning = SE3::identity();
        for i in 1..=index {
            dead_reckoning = dead_reckoning.compose(&sequence.odometry_at(i));
        }

        let optimized_error = last.pose.translation_distance(&truth);
        let drift = dead_reckoning.translation_distance(&truth);
        assert!(
            optimized_error < drift,
            "optimized error {:.3} m, dead reckoning {:.3} m",
            optimized_error,
            drift
        );
    }
}
