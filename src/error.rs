//! Error types for the SLAM backend.

use thiserror::Error;

use crate::graph::KeyFrameId;

/// Error kinds raised by the core components.
///
/// Per-sample and per-candidate errors are recovered inside the component
/// that raised them; only `StorageFault` at bootstrap is fatal.
#[derive(Error, Debug)]
pub enum SlamError {
    /// Missing or stale sensor sample. Tracking holds the previous pose.
    #[error("transient sensor gap: {0}")]
    TransientSensorGap(String),

    /// Too few correspondences to estimate overlap or a transform.
    #[error("insufficient matches: {found} found, {required} required")]
    InsufficientMatches { found: usize, required: usize },

    /// A verified loop edge disagrees with the optimized relative pose.
    #[error("loop edge {source_id} -> {target_id} disagrees with graph by {diff:.3} m (max {max:.3} m)")]
    GraphInconsistency {
        source_id: KeyFrameId,
        target_id: KeyFrameId,
        diff: f64,
        max: f64,
    },

    /// Output location unavailable at bootstrap.
    #[error("storage fault: {0}")]
    StorageFault(String),

    #[error("unknown keyframe {0}")]
    UnknownKeyFrame(KeyFrameId),

    #[error("keyframe {got} inserted out of order, expected {expected}")]
    OutOfOrderKeyFrame {
        expected: KeyFrameId,
        got: KeyFrameId,
    },

    /// The Graph thread is no longer running.
    #[error("graph thread disconnected")]
    Disconnected,

    #[error("configuration error: {0}")]
    Config(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("csv error: {0}")]
    Csv(#[from] csv::Error),
}

pub type Result<T> = std::result::Result<T, SlamError>;
