//! Main tracker: fuses odometry with visual matching against the last
//! keyframe and decides keyframe creation.
//!
//! The tracker keeps an accumulator, the pose of the current frame relative
//! to the last keyframe (T_kf_c). Each sample composes the accumulator with
//! the odometry delta; in refinement mode the geometric verifier may replace
//! that prediction with a visual estimate. The world pose is the last
//! keyframe's pose, read back from the Graph so loop corrections propagate,
//! composed with the accumulator.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError};
use tracing::{debug, info, warn};

use crate::config::TrackingConfig;
use crate::error::{Result, SlamError};
use crate::geometry::{GeometricVerifier, SE3};
use crate::graph::{Graph, KeyFrameId};
use crate::system::publisher::{Publisher, TrajectorySnapshot};
use crate::tracking::frame::{FeatureSet, PointCloud, SensorSample, StereoFrame};
use crate::tracking::keyframe_decision::KeyFrameDecision;
use crate::tracking::matching::match_features;
use crate::tracking::result::{TrackingMetrics, TrackingResult};
use crate::tracking::TrackingState;

/// Timeout for receiving samples. Allows periodic stop checks.
const RECV_TIMEOUT: Duration = Duration::from_millis(50);

/// The keyframe tracking is currently anchored to.
struct ReferenceKeyFrame {
    id: KeyFrameId,
    /// Pose estimated by Tracking at creation, used until the Graph has
    /// applied the keyframe.
    pose: SE3,
    features: Arc<FeatureSet>,
}

/// Main tracking structure.
pub struct Tracker {
    config: TrackingConfig,
    verifier: GeometricVerifier,
    graph: Graph,

    /// Current pose (T_wc).
    pub pose: SE3,

    /// Tracking state machine (NotInitialized, Ok).
    pub state: TrackingState,

    /// Pose of the current frame relative to the reference keyframe.
    accumulator: SE3,

    reference_kf: Option<ReferenceKeyFrame>,

    last_timestamp_ns: Option<u64>,

    /// Keyframe creation decision logic.
    kf_decision: KeyFrameDecision,

    frame_count: usize,
}

impl Tracker {
    pub fn new(config: TrackingConfig, verifier: GeometricVerifier, graph: Graph) -> Self {
        let kf_decision = KeyFrameDecision::new(config.min_overlap);
        Self {
            config,
            verifier,
            graph,
            pose: SE3::identity(),
            state: TrackingState::NotInitialized,
            accumulator: SE3::identity(),
            reference_kf: None,
            last_timestamp_ns: None,
            kf_decision,
            frame_count: 0,
        }
    }

    /// Id of the keyframe tracking is anchored to.
    pub fn reference_keyframe(&self) -> Option<KeyFrameId> {
        self.reference_kf.as_ref().map(|kf| kf.id)
    }

    /// Process one sample.
    ///
    /// A sample without odometry, without a stereo frame, or with a
    /// timestamp not after the previous one is a transient gap: the pose is
    /// held and `TransientSensorGap` is returned.
    pub fn process_sample(&mut self, sample: SensorSample) -> Result<TrackingResult> {
        let (odometry, stereo) = self.validate(sample.timestamp_ns, sample.odometry, sample.stereo)?;
        self.last_timestamp_ns = Some(sample.timestamp_ns);
        self.frame_count += 1;

        let n_features = stereo.features.len();

        let Some(reference) = self.reference_kf.as_ref() else {
            return self.initialize(sample.timestamp_ns, stereo);
        };

        // Overlap with the last keyframe
        let matches = match_features(&stereo.features, &reference.features);
        let overlap = KeyFrameDecision::overlap(matches.len(), reference.features.len());

        // Motion since the last keyframe: odometry prediction, optionally
        // replaced by the visual estimate
        let prediction = self.accumulator.compose(&odometry);
        let mut metrics = TrackingMetrics {
            n_features,
            n_matches: matches.len(),
            overlap,
            ..TrackingMetrics::default()
        };

        self.accumulator = if self.config.refine {
            match self.refine(&reference.features, &stereo.features, &prediction) {
                Ok((estimate, inliers)) => {
                    metrics.refine_inliers = Some(inliers);
                    if let Some(estimate) = estimate {
                        metrics.refined = true;
                        estimate
                    } else {
                        prediction
                    }
                }
                Err(e) => {
                    debug!("[Tracking] refinement skipped: {}", e);
                    prediction
                }
            }
        } else {
            prediction
        };

        let reference_pose = self.reference_world_pose();
        self.pose = reference_pose.compose(&self.accumulator);
        let relative_pose = self.accumulator.clone();

        let new_keyframe = if self.kf_decision.should_create_keyframe(overlap) {
            Some(self.create_keyframe(sample.timestamp_ns, stereo, overlap)?)
        } else {
            None
        };

        Ok(TrackingResult {
            state: self.state,
            pose: self.pose.clone(),
            relative_pose,
            metrics,
            new_keyframe,
        })
    }

    fn validate(
        &self,
        timestamp_ns: u64,
        odometry: Option<SE3>,
        stereo: Option<StereoFrame>,
    ) -> Result<(SE3, StereoFrame)> {
        let reason = match (&odometry, &stereo, self.last_timestamp_ns) {
            (None, _, _) => Some(format!("no odometry at t={}", timestamp_ns)),
            (_, None, _) => Some(format!("no stereo frame at t={}", timestamp_ns)),
            (_, _, Some(last)) if timestamp_ns <= last => {
                Some(format!("stale sample t={} (last t={})", timestamp_ns, last))
            }
            _ => None,
        };

        if let Some(reason) = reason {
            warn!("[Tracking] {}, holding pose", reason);
            return Err(SlamError::TransientSensorGap(reason));
        }

        match (odometry, stereo) {
            (Some(odometry), Some(stereo)) => Ok((odometry, stereo)),
            _ => Err(SlamError::TransientSensorGap(format!("incomplete sample at t={}", timestamp_ns))),
        }
    }

    /// First valid sample: keyframe 0 at the identity.
    fn initialize(&mut self, timestamp_ns: u64, stereo: StereoFrame) -> Result<TrackingResult> {
        self.pose = SE3::identity();
        self.accumulator = SE3::identity();
        let n_features = stereo.features.len();

        let id = self.create_keyframe(timestamp_ns, stereo, 100.0)?;
        self.state = TrackingState::Ok;
        info!("[Tracking] initialized with {} ({} features)", id, n_features);

        Ok(TrackingResult {
            state: self.state,
            pose: self.pose.clone(),
            relative_pose: SE3::identity(),
            metrics: TrackingMetrics {
                n_features,
                overlap: 100.0,
                ..TrackingMetrics::default()
            },
            new_keyframe: Some(id),
        })
    }

    /// Visual estimate of T_kf_c.
    ///
    /// Returns the estimate only when it has enough inliers and stays close
    /// to the odometry prediction; the inlier count is returned either way.
    fn refine(
        &self,
        reference: &FeatureSet,
        current: &FeatureSet,
        prediction: &SE3,
    ) -> Result<(Option<SE3>, usize)> {
        let estimate = self.verifier.estimate(reference, current, self.config.refine_threshold)?;

        if estimate.inliers < self.config.min_refine_inliers {
            return Ok((None, estimate.inliers));
        }

        let diff = estimate.transform.translation_distance(prediction);
        if diff > self.config.max_refine_diff {
            debug!(
                "[Tracking] refined estimate {:.3} m from odometry, keeping prediction",
                diff
            );
            return Ok((None, estimate.inliers));
        }

        Ok((Some(estimate.transform), estimate.inliers))
    }

    /// World pose of the reference keyframe, optimized if the Graph already
    /// holds it.
    fn reference_world_pose(&self) -> SE3 {
        match self.reference_kf.as_ref() {
            Some(kf) => self.graph.keyframe_pose(kf.id).unwrap_or_else(|| kf.pose.clone()),
            None => SE3::identity(),
        }
    }

    /// Submit the current frame to the Graph and re-anchor on it.
    fn create_keyframe(&mut self, timestamp_ns: u64, stereo: StereoFrame, overlap: f64) -> Result<KeyFrameId> {
        let features = Arc::new(stereo.features);
        let cloud: Arc<PointCloud> = Arc::new(stereo.cloud);
        let odometry = self.reference_kf.as_ref().map(|_| self.accumulator.clone());

        let id = self.graph.insert_keyframe(
            timestamp_ns,
            self.pose.clone(),
            odometry,
            Arc::clone(&features),
            cloud,
        )?;

        debug!("[Tracking] new keyframe {} (overlap {:.1}%)", id, overlap);

        self.reference_kf = Some(ReferenceKeyFrame {
            id,
            pose: self.pose.clone(),
            features,
        });
        self.accumulator = SE3::identity();
        self.kf_decision.reset();
        Ok(id)
    }

    /// Tracking thread loop: consume samples until the channel closes or
    /// `stop` is set. Samples queued when `stop` is seen are still processed.
    pub fn run(&mut self, samples: Receiver<SensorSample>, stop: Arc<AtomicBool>, publisher: &mut dyn Publisher) {
        info!("[Tracking] thread started");

        loop {
            if stop.load(Ordering::SeqCst) {
                // Samples already delivered are still tracked
                for sample in samples.try_iter() {
                    if !self.handle_sample(sample, publisher) {
                        break;
                    }
                }
                break;
            }

            let sample = match samples.recv_timeout(RECV_TIMEOUT) {
                Ok(sample) => sample,
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => break,
            };

            if !self.handle_sample(sample, publisher) {
                break;
            }
        }

        info!("[Tracking] thread exiting after {} samples", self.frame_count);
    }

    /// Track one sample and publish the result. Returns false once the
    /// Graph is gone.
    fn handle_sample(&mut self, sample: SensorSample, publisher: &mut dyn Publisher) -> bool {
        let timestamp_ns = sample.timestamp_ns;
        match self.process_sample(sample) {
            Ok(result) => publisher.publish(&TrajectorySnapshot {
                timestamp_ns,
                pose: result.pose,
                new_keyframe: result.new_keyframe,
            }),
            Err(SlamError::TransientSensorGap(_)) => {}
            Err(SlamError::Disconnected) => {
                warn!("[Tracking] graph disconnected, stopping");
                return false;
            }
            Err(e) => warn!("[Tracking] sample dropped: {}", e),
        }
        true
    }
}
