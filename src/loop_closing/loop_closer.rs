//! LoopCloser - Main loop closing thread.
//!
//! This module implements the loop closing thread that:
//! 1. Receives keyframe ids from the Graph thread
//! 2. Ranks loop candidates using BoW
//! 3. Verifies the best candidates geometrically
//! 4. Hands accepted loop edges to the Graph, which optimizes
//!
//! The thread may lag behind Tracking. [`LoopClosing::finalize`]
//! stops it after the keyframe currently being verified is fully decided;
//! notifications still queued at that point are discarded.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError};

use crate::config::LoopClosingConfig;
use crate::error::{Result, SlamError};
use crate::geometry::{Estimate, GeometricVerifier};
use crate::graph::{Edge, Graph, KeyFrame, KeyFrameId};

use super::detector::{clouds_verifiable, detect_loop_candidates, evaluate_loop, LoopCandidate, VerifiedLoop};

/// Timeout for receiving keyframes from the channel.
const RECV_TIMEOUT: Duration = Duration::from_millis(50);

/// Geometric verification of a loop candidate.
pub trait LoopVerifier: Send {
    /// Estimate T_query_candidate with inlier support.
    fn verify(&self, query: &KeyFrame, candidate: &KeyFrame, threshold: f64) -> Result<Estimate>;
}

impl LoopVerifier for GeometricVerifier {
    fn verify(&self, query: &KeyFrame, candidate: &KeyFrame, threshold: f64) -> Result<Estimate> {
        self.estimate(&query.features, &candidate.features, threshold)
    }
}

/// Statistics for the loop closer.
#[derive(Debug, Default, Clone)]
pub struct LoopCloserStats {
    /// Number of keyframes processed.
    pub keyframes_processed: usize,

    /// Number of ranked candidates considered.
    pub candidates_detected: usize,

    /// Number of candidates that passed the acceptance test.
    pub loops_verified: usize,

    /// Number of loop edges the Graph accepted.
    pub loops_closed: usize,

    /// Number of verified loops the Graph rejected as inconsistent.
    pub loops_inconsistent: usize,
}

/// The LoopCloser thread state.
pub struct LoopCloser {
    graph: Graph,
    verifier: Box<dyn LoopVerifier>,
    config: LoopClosingConfig,
    stop: Arc<AtomicBool>,
    /// One past the id of the last fully processed keyframe; 0 before any.
    processed: Arc<AtomicU64>,
    stats: LoopCloserStats,
}

impl LoopCloser {
    pub fn new(
        graph: Graph,
        verifier: Box<dyn LoopVerifier>,
        config: LoopClosingConfig,
        stop: Arc<AtomicBool>,
        processed: Arc<AtomicU64>,
    ) -> Self {
        Self {
            graph,
            verifier,
            config,
            stop,
            processed,
            stats: LoopCloserStats::default(),
        }
    }

    /// Run the main loop closing thread.
    ///
    /// Processes keyframes until the channel is closed or stop is
    /// requested. The stop flag is only checked between keyframes.
    pub fn run(&mut self, kf_receiver: Receiver<KeyFrameId>) {
        tracing::info!("LoopCloser thread started");

        loop {
            if self.stop.load(Ordering::SeqCst) {
                let discarded = kf_receiver.len();
                if discarded > 0 {
                    tracing::debug!("LoopCloser discarding {} queued keyframes", discarded);
                }
                break;
            }

            match kf_receiver.recv_timeout(RECV_TIMEOUT) {
                Ok(kf_id) => {
                    let had_candidates = self.process_keyframe(kf_id);
                    self.processed.store(kf_id.0 + 1, Ordering::SeqCst);
                    // Back off only when idle
                    if !had_candidates && kf_receiver.is_empty() {
                        thread::sleep(self.config.empty_backoff());
                    }
                }
                Err(RecvTimeoutError::Timeout) => {
                    continue;
                }
                Err(RecvTimeoutError::Disconnected) => {
                    tracing::info!("LoopCloser channel disconnected");
                    break;
                }
            }
        }

        tracing::info!(
            "LoopCloser thread exiting. Stats: processed={}, detected={}, verified={}, closed={}",
            self.stats.keyframes_processed,
            self.stats.candidates_detected,
            self.stats.loops_verified,
            self.stats.loops_closed
        );
    }

    /// Process a single keyframe for loop detection.
    ///
    /// Returns false when the keyframe had no candidates.
    fn process_keyframe(&mut self, kf_id: KeyFrameId) -> bool {
        self.stats.keyframes_processed += 1;

        // Step 1: Rank candidates
        let (query, candidates, loop_information) = {
            let graph = self.graph.read();
            let Some(query) = graph.keyframe(kf_id).cloned() else {
                tracing::warn!("LoopCloser notified of unknown keyframe {}", kf_id);
                return false;
            };
            let candidates = detect_loop_candidates(&graph, kf_id, self.config.top_candidates);
            (query, candidates, graph.config().loop_information)
        };

        if candidates.is_empty() {
            return false;
        }

        self.stats.candidates_detected += candidates.len();

        // Step 2: Verify each candidate, insert accepted ones
        for candidate in candidates {
            let Some(verified) = self.verify_candidate(&query, &candidate) else {
                continue;
            };
            self.stats.loops_verified += 1;

            tracing::info!(
                "Loop verified: {} -> {} ({} inliers, score {:.3})",
                verified.query_id,
                verified.target_id,
                verified.inliers,
                verified.bow_score
            );

            // Step 3: Hand the edge to the Graph, which optimizes on acceptance
            let edge = Edge::loop_closure(
                verified.query_id,
                verified.target_id,
                verified.transform,
                loop_information,
            );
            match self.graph.insert_loop_edge(edge) {
                Ok(()) => {
                    self.stats.loops_closed += 1;
                    tracing::info!("Loop closed: {} -> {}", verified.query_id, verified.target_id);
                }
                Err(e @ SlamError::GraphInconsistency { .. }) => {
                    self.stats.loops_inconsistent += 1;
                    tracing::warn!("Loop rejected by graph: {}", e);
                }
                Err(e) => {
                    tracing::warn!("Loop edge {} -> {} not inserted: {}", verified.query_id, verified.target_id, e);
                }
            }
        }
        true
    }

    /// Verify one candidate. Any failure is a rejection.
    fn verify_candidate(&self, query: &KeyFrame, candidate: &LoopCandidate) -> Option<VerifiedLoop> {
        let target = self.graph.keyframe(candidate.target_id)?;

        if !clouds_verifiable(query, &target, &self.config) {
            tracing::debug!(
                "Loop candidate {} -> {} skipped: clouds {} / {}",
                query.id,
                target.id,
                query.cloud_size(),
                target.cloud_size()
            );
            return None;
        }

        let estimate = match self.verifier.verify(query, &target, self.config.epipolar_threshold) {
            Ok(estimate) => estimate,
            Err(e) => {
                tracing::debug!("Loop candidate {} -> {} failed verification: {}", query.id, target.id, e);
                return None;
            }
        };

        let decision = evaluate_loop(estimate.inliers, query.cloud_size(), target.cloud_size(), &self.config);
        if !decision.is_accepted() {
            tracing::debug!(
                "Loop candidate {} -> {} rejected: {:?} ({} inliers)",
                query.id,
                target.id,
                decision,
                estimate.inliers
            );
            return None;
        }

        Some(VerifiedLoop {
            query_id: query.id,
            target_id: target.id,
            inliers: estimate.inliers,
            transform: estimate.transform,
            bow_score: candidate.bow_score,
        })
    }
}

/// Handle to the running loop closing thread.
pub struct LoopClosing {
    stop: Arc<AtomicBool>,
    processed: Arc<AtomicU64>,
    handle: Option<JoinHandle<LoopCloserStats>>,
    stats: LoopCloserStats,
}

impl LoopClosing {
    /// Spawn the loop closer thread on the Graph's notification channel.
    pub fn spawn(
        graph: Graph,
        kf_receiver: Receiver<KeyFrameId>,
        verifier: Box<dyn LoopVerifier>,
        config: LoopClosingConfig,
    ) -> Result<Self> {
        let stop = Arc::new(AtomicBool::new(false));
        let processed = Arc::new(AtomicU64::new(0));
        let mut loop_closer = LoopCloser::new(graph, verifier, config, Arc::clone(&stop), Arc::clone(&processed));

        let handle = thread::Builder::new().name("loop-closing".into()).spawn(move || {
            loop_closer.run(kf_receiver);
            loop_closer.stats
        })?;

        Ok(Self {
            stop,
            processed,
            handle: Some(handle),
            stats: LoopCloserStats::default(),
        })
    }

    /// Last keyframe whose candidates have all been decided.
    pub fn last_processed(&self) -> Option<KeyFrameId> {
        match self.processed.load(Ordering::SeqCst) {
            0 => None,
            n => Some(KeyFrameId::new(n - 1)),
        }
    }

    /// Stop accepting new keyframes and wait for the in-flight one.
    ///
    /// Returns once every verification already started has been decided
    /// and accepted edges are in the Graph. Idempotent.
    pub fn finalize(&mut self) -> LoopCloserStats {
        self.stop.store(true, Ordering::SeqCst);
        self.join()
    }

    /// Wait for the thread to exit on its own, once its notification
    /// channel has disconnected and every queued keyframe is processed.
    pub fn wait(&mut self) -> LoopCloserStats {
        self.join()
    }

    fn join(&mut self) -> LoopCloserStats {
        if let Some(handle) = self.handle.take() {
            match handle.join() {
                Ok(stats) => self.stats = stats,
                Err(_) => tracing::warn!("LoopCloser thread panicked"),
            }
        }
        self.stats.clone()
    }
}

impl Drop for LoopClosing {
    fn drop(&mut self) {
        self.finalize();
    }
}
