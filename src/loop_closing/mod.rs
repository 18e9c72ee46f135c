//! Loop Closing: revisit detection feeding loop edges to the pose graph.
//!
//! # Architecture
//!
//! 1. **Detection** (`detector.rs`): BoW ranking of the Graph's neighbour
//!    candidates and the inlier/cloud acceptance test
//! 2. **Thread** (`loop_closer.rs`): receives keyframe ids from the Graph,
//!    verifies candidates through a [`LoopVerifier`] and submits accepted
//!    loop edges
//!
//! Correction is not done here: the Graph validates each edge against its
//! current poses and relaxes the whole graph after accepting it.

pub mod detector;
pub mod loop_closer;

pub use detector::{detect_loop_candidates, evaluate_loop, LoopCandidate, LoopDecision, VerifiedLoop};
pub use loop_closer::{LoopCloser, LoopCloserStats, LoopClosing, LoopVerifier};
