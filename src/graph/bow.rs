//! Lightweight bag-of-words vectors for candidate ranking.
//!
//! Descriptors are quantized into a fixed vocabulary by their leading bits
//! and accumulated into an L2-normalized sparse histogram. Two keyframes
//! that look at the same landmarks share words; the score is the cosine
//! similarity of the histograms.

use std::collections::HashMap;

use crate::tracking::frame::{Descriptor, FeatureSet};

/// Bag-of-words vector: word_id -> weight.
pub type BowVector = HashMap<u32, f64>;

/// Number of leading descriptor bits forming a word.
const WORD_BITS: u32 = 12;

fn word_of(descriptor: &Descriptor) -> u32 {
    let head = u32::from(descriptor[0]) << 8 | u32::from(descriptor[1]);
    head >> (16 - WORD_BITS)
}

/// Quantize all descriptors of a feature set.
pub fn compute_bow(features: &FeatureSet) -> BowVector {
    let mut bow = BowVector::new();
    for descriptor in features.descriptors() {
        *bow.entry(word_of(descriptor)).or_insert(0.0) += 1.0;
    }

    let norm = bow.values().map(|w| w * w).sum::<f64>().sqrt();
    if norm > 0.0 {
        for w in bow.values_mut() {
            *w /= norm;
        }
    }
    bow
}

/// Cosine similarity in [0, 1].
pub fn bow_score(a: &BowVector, b: &BowVector) -> f64 {
    let (small, large) = if a.len() <= b.len() { (a, b) } else { (b, a) };
    small
        .iter()
        .filter_map(|(word, w)| large.get(word).map(|other| w * other))
        .sum()
}
