//! Descriptor matching between two feature sets.

use crate::tracking::frame::{Descriptor, FeatureSet};

/// Max descriptor distance for acceptance.
pub const TH_HIGH: u32 = 100;

/// A correspondence between feature `query_idx` of the query set and
/// feature `train_idx` of the train set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FeatureMatch {
    pub query_idx: usize,
    pub train_idx: usize,
    pub distance: u32,
}

/// Hamming distance between two binary descriptors.
#[inline]
pub fn descriptor_distance(a: &Descriptor, b: &Descriptor) -> u32 {
    a.iter().zip(b.iter()).map(|(x, y)| (x ^ y).count_ones()).sum()
}

/// Brute-force Hamming matching with cross-check.
///
/// A pair is kept only if each feature is the other's nearest neighbour and
/// the distance is at most `TH_HIGH`.
pub fn match_features(query: &FeatureSet, train: &FeatureSet) -> Vec<FeatureMatch> {
    if query.is_empty() || train.is_empty() {
        return Vec::new();
    }

    let best_in_train: Vec<(usize, u32)> = query
        .descriptors()
        .map(|q| nearest(q, train))
        .collect();

    let best_in_query: Vec<usize> = train.descriptors().map(|t| nearest(t, query).0).collect();

    best_in_train
        .into_iter()
        .enumerate()
        .filter(|&(query_idx, (train_idx, distance))| {
            distance <= TH_HIGH && best_in_query[train_idx] == query_idx
        })
        .map(|(query_idx, (train_idx, distance))| FeatureMatch {
            query_idx,
            train_idx,
            distance,
        })
        .collect()
}

fn nearest(desc: &Descriptor, set: &FeatureSet) -> (usize, u32) {
    let mut best = (0, u32::MAX);
    for (idx, other) in set.descriptors().enumerate() {
        let dist = descriptor_distance(desc, other);
        if dist < best.1 {
            best = (idx, dist);
        }
    }
    best
}
