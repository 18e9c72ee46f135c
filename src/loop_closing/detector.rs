//! Loop candidate ranking and acceptance.
//!
//! Candidates come from [`PoseGraph::neighbor_candidates`], which already
//! drops the query's temporal neighbours and the most recent keyframes.
//! They are ranked by bag-of-words similarity to the query and only the
//! best few are handed to geometric verification.

use crate::config::LoopClosingConfig;
use crate::geometry::SE3;
use crate::graph::{bow_score, KeyFrame, KeyFrameId, PoseGraph};

/// A potential loop closure candidate.
#[derive(Debug, Clone)]
pub struct LoopCandidate {
    /// Keyframe that triggered the search.
    pub query_id: KeyFrameId,

    /// Older keyframe we may be closing back to.
    pub target_id: KeyFrameId,

    /// BoW similarity score between query and target.
    pub bow_score: f64,
}

/// A candidate after geometric verification.
#[derive(Debug, Clone)]
pub struct VerifiedLoop {
    pub query_id: KeyFrameId,
    pub target_id: KeyFrameId,
    pub inliers: usize,
    /// Estimated T_query_target.
    pub transform: SE3,
    pub bow_score: f64,
}

/// Outcome of the acceptance test.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopDecision {
    Accepted,
    TooFewInliers,
    /// Near-duplicate views; they add no geometric constraint.
    TooManyInliers,
    /// One of the clouds is too sparse for cloud-based verification.
    SparseCloud,
}

impl LoopDecision {
    pub fn is_accepted(self) -> bool {
        self == LoopDecision::Accepted
    }
}

/// Rank the loop candidates of `query_id` by BoW similarity.
///
/// Returns at most `top` candidates with a non-zero score, best first.
pub fn detect_loop_candidates(graph: &PoseGraph, query_id: KeyFrameId, top: usize) -> Vec<LoopCandidate> {
    let Some(query) = graph.keyframe(query_id) else {
        return vec![];
    };

    let mut candidates: Vec<LoopCandidate> = graph
        .neighbor_candidates(query_id)
        .into_iter()
        .filter_map(|id| graph.keyframe(id))
        .map(|kf| LoopCandidate {
            query_id,
            target_id: kf.id,
            bow_score: bow_score(&query.bow, &kf.bow),
        })
        .filter(|c| c.bow_score > 0.0)
        .collect();

    // Sort by score descending
    candidates.sort_by(|a, b| {
        b.bow_score
            .partial_cmp(&a.bow_score)
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    candidates.truncate(top);

    candidates
}

/// Whether both keyframes carry clouds dense enough to verify against.
pub fn clouds_verifiable(query: &KeyFrame, target: &KeyFrame, config: &LoopClosingConfig) -> bool {
    query.has_verifiable_cloud(config.min_cloud_size) && target.has_verifiable_cloud(config.min_cloud_size)
}

/// Accept iff the inlier count lies in `[min_inliers, max_inliers]` and both
/// clouds reach `min_cloud_size`.
pub fn evaluate_loop(
    inliers: usize,
    query_cloud: usize,
    target_cloud: usize,
    config: &LoopClosingConfig,
) -> LoopDecision {
    if query_cloud < config.min_cloud_size || target_cloud < config.min_cloud_size {
        LoopDecision::SparseCloud
    } else if inliers < config.min_inliers {
        LoopDecision::TooFewInliers
    } else if inliers > config.max_inliers {
        LoopDecision::TooManyInliers
    } else {
        LoopDecision::Accepted
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{GraphConfig, LC_MAX_INLIERS, LC_MIN_INLIERS, MIN_CLOUD_SIZE};
    use crate::tracking::frame::{Feature, FeatureSet, PointCloud};
    use nalgebra::Point2;
    use std::sync::Arc;

    /// Features whose descriptors fall into the given BoW words.
    fn features_with_words(words: &[u16]) -> FeatureSet {
        FeatureSet::new(
            words
                .iter()
                .map(|&w| {
                    let mut descriptor = [0u8; 32];
                    descriptor[0] = (w >> 4) as u8;
                    descriptor[1] = ((w & 0xF) << 4) as u8;
                    Feature {
                        keypoint: Point2::new(0.0, 0.0),
                        descriptor,
                        point: None,
                    }
                })
                .collect(),
        )
    }

    fn graph_with_words(words: &[Vec<u16>]) -> PoseGraph {
        let mut graph = PoseGraph::new(GraphConfig::default());
        for (i, w) in words.iter().enumerate() {
            graph.insert_keyframe(
                i as u64,
                SE3::identity(),
                Arc::new(features_with_words(w)),
                Arc::new(PointCloud::new()),
                None,
            );
        }
        graph
    }

    #[test]
    fn test_ranking_by_similarity() {
        let mut words: Vec<Vec<u16>> = (0..20).map(|i| vec![1000 + i, 2000 + i]).collect();
        words[2] = vec![7, 8, 9, 10];
        words[4] = vec![7, 8, 500, 501];
        words[6] = vec![7, 600, 601, 602];
        words.push(vec![7, 8, 9, 10]);
        let graph = graph_with_words(&words);

        let query = KeyFrameId::new(20);
        let candidates = detect_loop_candidates(&graph, query, 3);

        let ids: Vec<u64> = candidates.iter().map(|c| c.target_id.0).collect();
        assert_eq!(ids, vec![2, 4, 6]);
        assert!(candidates[0].bow_score > candidates[1].bow_score);
        assert!(candidates.iter().all(|c| c.query_id == query));
    }

    #[test]
    fn test_zero_score_candidates_dropped() {
        let mut words: Vec<Vec<u16>> = (0..20).map(|i| vec![100 + i]).collect();
        words[3] = vec![42];
        words.push(vec![42]);
        let graph = graph_with_words(&words);

        let candidates = detect_loop_candidates(&graph, KeyFrameId::new(20), 3);
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].target_id, KeyFrameId::new(3));
    }

    #[test]
    fn test_recent_keyframes_never_ranked() {
        let words: Vec<Vec<u16>> = (0..15).map(|_| vec![1, 2, 3]).collect();
        let graph = graph_with_words(&words);

        let candidates = detect_loop_candidates(&graph, KeyFrameId::new(14), 10);
        assert!(candidates.iter().all(|c| c.target_id.0 < 5));
    }

    #[test]
    fn test_inlier_bounds() {
        let config = LoopClosingConfig::default();
        let cloud = MIN_CLOUD_SIZE;

        assert_eq!(
            evaluate_loop(LC_MIN_INLIERS - 1, cloud, cloud, &config),
            LoopDecision::TooFewInliers
        );
        assert!(evaluate_loop(LC_MIN_INLIERS, cloud, cloud, &config).is_accepted());
        assert!(evaluate_loop(LC_MAX_INLIERS, cloud, cloud, &config).is_accepted());
        assert_eq!(
            evaluate_loop(LC_MAX_INLIERS + 1, cloud, cloud, &config),
            LoopDecision::TooManyInliers
        );
    }

    #[test]
    fn test_sparse_cloud_rejected() {
        let config = LoopClosingConfig::default();
        assert_eq!(
            evaluate_loop(LC_MIN_INLIERS, MIN_CLOUD_SIZE - 1, MIN_CLOUD_SIZE, &config),
            LoopDecision::SparseCloud
        );
        assert_eq!(
            evaluate_loop(LC_MIN_INLIERS, MIN_CLOUD_SIZE, 0, &config),
            LoopDecision::SparseCloud
        );
    }
}
