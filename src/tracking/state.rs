//! Tracking state machine.

/// State of the tracking thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TrackingState {
    /// No valid sample seen yet; keyframe 0 not created.
    #[default]
    NotInitialized,
    /// Tracking relative to the last keyframe.
    Ok,
}
