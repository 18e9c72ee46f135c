//! KeyFrame decision based on feature overlap with the last keyframe.

/// Criteria for deciding whether to create a new KeyFrame.
///
/// Overlap is the share of the last keyframe's features that were matched
/// in the current frame, in percent. A new keyframe is created as soon as
/// it drops below `min_overlap`.
pub struct KeyFrameDecision {
    /// Overlap (percent) below which a keyframe is created.
    min_overlap: f64,
    /// Frame counter since last KeyFrame.
    frames_since_kf: usize,
}

impl KeyFrameDecision {
    pub fn new(min_overlap: f64) -> Self {
        Self {
            min_overlap,
            frames_since_kf: 0,
        }
    }

    /// Overlap in percent. A keyframe without features overlaps nothing.
    pub fn overlap(matches: usize, reference_features: usize) -> f64 {
        if reference_features == 0 {
            return 0.0;
        }
        100.0 * matches as f64 / reference_features as f64
    }

    /// Decide whether to create a new KeyFrame.
    pub fn should_create_keyframe(&mut self, overlap: f64) -> bool {
        self.frames_since_kf += 1;

        if overlap < self.min_overlap {
            self.frames_since_kf = 0;
            return true;
        }

        false
    }

    pub fn frames_since_keyframe(&self) -> usize {
        self.frames_since_kf
    }

    /// Reset after KeyFrame creation.
    pub fn reset(&mut self) {
        self.frames_since_kf = 0;
    }
}

impl Default for KeyFrameDecision {
    fn default() -> Self {
        Self::new(crate::config::TRACKING_MIN_OVERLAP)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_overlap_percent() {
        assert_relative_eq!(KeyFrameDecision::overlap(45, 60), 75.0);
        assert_relative_eq!(KeyFrameDecision::overlap(0, 60), 0.0);
        assert_relative_eq!(KeyFrameDecision::overlap(10, 0), 0.0);
    }

    #[test]
    fn test_threshold() {
        let mut decision = KeyFrameDecision::default();
        assert!(!decision.should_create_keyframe(80.0));
        assert!(!decision.should_create_keyframe(95.0));
        assert_eq!(decision.frames_since_keyframe(), 2);

        assert!(decision.should_create_keyframe(79.9));
        assert_eq!(decision.frames_since_keyframe(), 0);
    }

    #[test]
    fn test_zero_overlap_always_triggers() {
        let mut decision = KeyFrameDecision::new(0.5);
        assert!(decision.should_create_keyframe(KeyFrameDecision::overlap(0, 100)));
    }
}
