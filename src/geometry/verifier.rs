//! Geometric verification: robust rigid pose estimation with RANSAC.
//!
//! Correspondences come from cross-checked descriptor matches whose
//! features have stereo depth in both frames. Hypotheses are rigid fits
//! (Horn's method, scale fixed to 1) over minimal 3-point samples; a
//! correspondence is an inlier when the reprojection error of the
//! transformed point falls below the caller's pixel threshold.

use nalgebra::{Matrix3, Point2, Rotation3, UnitQuaternion, Vector3};
use rand::prelude::*;

use crate::config::VerifierConfig;
use crate::error::{Result, SlamError};
use crate::geometry::{CameraModel, SE3};
use crate::tracking::frame::FeatureSet;
use crate::tracking::matching::match_features;

/// Minimal sample size for a rigid fit.
const SAMPLE_SIZE: usize = 3;

/// A 3D-3D correspondence with the pixel observation in frame A.
#[derive(Debug, Clone)]
pub struct Correspondence {
    /// Point in A's camera frame.
    pub point_a: Vector3<f64>,
    /// Observed keypoint in A's image.
    pub pixel_a: Point2<f64>,
    /// Point in B's camera frame.
    pub point_b: Vector3<f64>,
}

/// Result of a verification.
#[derive(Debug, Clone)]
pub struct Estimate {
    /// Relative transform T_ab: maps points from B's frame into A's frame.
    pub transform: SE3,
    pub inliers: usize,
    /// Indices into the correspondence list.
    pub inlier_indices: Vec<usize>,
    /// Number of correspondences the estimate was drawn from.
    pub correspondences: usize,
}

/// Stateless robust estimator.
#[derive(Debug, Clone)]
pub struct GeometricVerifier {
    camera: CameraModel,
    config: VerifierConfig,
}

impl GeometricVerifier {
    pub fn new(camera: CameraModel, config: VerifierConfig) -> Self {
        Self { camera, config }
    }

    pub fn camera(&self) -> &CameraModel {
        &self.camera
    }

    /// Estimate T_ab between two feature sets.
    ///
    /// Results vary run to run unless `VerifierConfig::seed` is set; callers
    /// should compare the inlier count against thresholds, not exact values.
    pub fn estimate(&self, a: &FeatureSet, b: &FeatureSet, threshold: f64) -> Result<Estimate> {
        let correspondences = build_correspondences(a, b);
        self.estimate_from_correspondences(&correspondences, threshold)
    }

    /// RANSAC over precomputed correspondences.
    pub fn estimate_from_correspondences(
        &self,
        correspondences: &[Correspondence],
        threshold: f64,
    ) -> Result<Estimate> {
        let n = correspondences.len();
        if n < SAMPLE_SIZE {
            return Err(SlamError::InsufficientMatches {
                found: n,
                required: SAMPLE_SIZE,
            });
        }

        let mut rng = match self.config.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };

        let points_a: Vec<_> = correspondences.iter().map(|c| c.point_a).collect();
        let points_b: Vec<_> = correspondences.iter().map(|c| c.point_b).collect();

        let mut best: Option<(SE3, Vec<usize>)> = None;
        let mut max_iter = self.config.max_iterations;
        let mut iteration = 0;

        while iteration < max_iter {
            iteration += 1;

            let indices = sample_three_indices(&mut rng, n);
            let sample_b: Vec<_> = indices.iter().map(|&i| points_b[i]).collect();
            let sample_a: Vec<_> = indices.iter().map(|&i| points_a[i]).collect();

            let hypothesis = match compute_rigid_horn(&sample_b, &sample_a) {
                Some(t) => t,
                None => continue,
            };

            let inliers = self.find_inliers(correspondences, &hypothesis, threshold);
            let best_count = best.as_ref().map_or(0, |(_, idx)| idx.len());

            if inliers.len() > best_count {
                let inlier_ratio = inliers.len() as f64 / n as f64;
                let needed =
                    compute_adaptive_iterations(inlier_ratio, self.config.probability, SAMPLE_SIZE);
                max_iter = max_iter.min(iteration.saturating_add(needed));
                best = Some((hypothesis, inliers));
            }
        }

        let (mut transform, mut inlier_indices) = match best {
            Some(b) => b,
            None => (SE3::identity(), Vec::new()),
        };

        // Refit on the consensus set
        if inlier_indices.len() >= SAMPLE_SIZE {
            let inlier_b: Vec<_> = inlier_indices.iter().map(|&i| points_b[i]).collect();
            let inlier_a: Vec<_> = inlier_indices.iter().map(|&i| points_a[i]).collect();

            if let Some(refined) = compute_rigid_horn(&inlier_b, &inlier_a) {
                let refined_inliers = self.find_inliers(correspondences, &refined, threshold);
                if refined_inliers.len() >= inlier_indices.len() {
                    transform = refined;
                    inlier_indices = refined_inliers;
                }
            }
        }

        Ok(Estimate {
            transform,
            inliers: inlier_indices.len(),
            inlier_indices,
            correspondences: n,
        })
    }

    /// Reprojection error (pixels) of `T_ab * p_b` against A's keypoint.
    fn residual(&self, correspondence: &Correspondence, t_ab: &SE3) -> f64 {
        let p_a = t_ab.transform_point(&correspondence.point_b);
        match self.camera.project(&p_a) {
            Some(px) => (px - correspondence.pixel_a).norm(),
            None => f64::INFINITY,
        }
    }

    fn find_inliers(&self, correspondences: &[Correspondence], t_ab: &SE3, threshold: f64) -> Vec<usize> {
        correspondences
            .iter()
            .enumerate()
            .filter(|(_, c)| self.residual(c, t_ab) <= threshold)
            .map(|(i, _)| i)
            .collect()
    }
}

/// Cross-checked matches between `a` and `b` where both features have depth.
pub fn build_correspondences(a: &FeatureSet, b: &FeatureSet) -> Vec<Correspondence> {
    match_features(a, b)
        .into_iter()
        .filter_map(|m| {
            let fa = a.get(m.query_idx)?;
            let fb = b.get(m.train_idx)?;
            Some(Correspondence {
                point_a: fa.point?,
                pixel_a: fa.keypoint,
                point_b: fb.point?,
            })
        })
        .collect()
}

/// Rigid transform T with `dst ≈ T * src` (Horn's closed form, scale 1).
fn compute_rigid_horn(src: &[Vector3<f64>], dst: &[Vector3<f64>]) -> Option<SE3> {
    let n = src.len();
    if n < SAMPLE_SIZE || n != dst.len() {
        return None;
    }

    let centroid_src = compute_centroid(src);
    let centroid_dst = compute_centroid(dst);

    // Cross-covariance H = sum(src_i * dst_i^T)
    let mut h = Matrix3::zeros();
    for (s, d) in src.iter().zip(dst.iter()) {
        h += (s - centroid_src) * (d - centroid_dst).transpose();
    }

    let svd = h.svd(true, true);
    let u = svd.u?;
    let v_t = svd.v_t?;

    let mut rotation_mat = v_t.transpose() * u.transpose();

    // Reflection
    if rotation_mat.determinant() < 0.0 {
        let mut v = v_t.transpose();
        for i in 0..3 {
            v[(i, 2)] = -v[(i, 2)];
        }
        rotation_mat = v * u.transpose();
    }

    let rotation = UnitQuaternion::from_rotation_matrix(&Rotation3::from_matrix_unchecked(rotation_mat));
    let translation = centroid_dst - rotation * centroid_src;

    Some(SE3 {
        rotation,
        translation,
    })
}

fn compute_centroid(points: &[Vector3<f64>]) -> Vector3<f64> {
    if points.is_empty() {
        return Vector3::zeros();
    }
    let sum: Vector3<f64> = points.iter().sum();
    sum / points.len() as f64
}

fn sample_three_indices(rng: &mut impl Rng, n: usize) -> [usize; 3] {
    let mut indices = [0usize; 3];
    indices[0] = rng.gen_range(0..n);

    loop {
        indices[1] = rng.gen_range(0..n);
        if indices[1] != indices[0] {
            break;
        }
    }

    loop {
        indices[2] = rng.gen_range(0..n);
        if indices[2] != indices[0] && indices[2] != indices[1] {
            break;
        }
    }

    indices
}

/// k = log(1 - p) / log(1 - w^n)
fn compute_adaptive_iterations(inlier_ratio: f64, probability: f64, sample_size: usize) -> usize {
    if inlier_ratio <= 0.0 {
        return usize::MAX;
    }
    if inlier_ratio >= 1.0 {
        return 1;
    }

    let w_n = inlier_ratio.powi(sample_size as i32);
    let log_denom = (1.0 - w_n).ln();

    if log_denom.abs() < 1e-10 {
        return 1;
    }

    let k = (1.0 - probability).ln() / log_denom;
    (k.ceil() as usize).max(1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use nalgebra::Unit;

    fn seeded_verifier() -> GeometricVerifier {
        GeometricVerifier::new(
            CameraModel::default(),
            VerifierConfig {
                seed: Some(7),
                ..Default::default()
            },
        )
    }

    fn grid_points(n: usize) -> Vec<Vector3<f64>> {
        (0..n)
            .map(|i| {
                let x = (i % 10) as f64 * 0.4 - 2.0;
                let y = (i / 10) as f64 * 0.3 - 1.0;
                Vector3::new(x, y, 4.0 + ((i * 7) % 5) as f64 * 0.5)
            })
            .collect()
    }

    fn correspondences_for(t_ab: &SE3, points_b: &[Vector3<f64>], camera: &CameraModel) -> Vec<Correspondence> {
        points_b
            .iter()
            .map(|p_b| {
                let p_a = t_ab.transform_point(p_b);
                Correspondence {
                    point_a: p_a,
                    pixel_a: camera.project(&p_a).unwrap(),
                    point_b: *p_b,
                }
            })
            .collect()
    }

    #[test]
    fn test_horn_recovers_rigid_motion() {
        let src = grid_points(20);
        let truth = SE3::new(
            UnitQuaternion::from_axis_angle(&Unit::new_normalize(Vector3::new(0.2, 1.0, 0.1)), 0.3),
            Vector3::new(0.5, -0.2, 0.1),
        );
        let dst: Vec<_> = src.iter().map(|p| truth.transform_point(p)).collect();

        let est = compute_rigid_horn(&src, &dst).unwrap();
        assert_relative_eq!(est.translation, truth.translation, epsilon = 1e-9);
        assert_relative_eq!(est.rotation_angle(&truth), 0.0, epsilon = 1e-9);
    }

    #[test]
    fn test_estimate_with_outliers() {
        let verifier = seeded_verifier();
        let truth = SE3::from_yaw(0.05, Vector3::new(0.3, 0.0, 0.1));
        let mut corrs = correspondences_for(&truth, &grid_points(40), verifier.camera());

        // Corrupt ten correspondences with a large displacement
        for c in corrs.iter_mut().take(10) {
            c.point_b += Vector3::new(1.5, -1.0, 0.5);
        }

        let est = verifier.estimate_from_correspondences(&corrs, 1.5).unwrap();
        assert_eq!(est.correspondences, 40);
        assert!(est.inliers >= 28, "inliers = {}", est.inliers);
        assert!(est.inliers <= 32, "inliers = {}", est.inliers);
        assert_relative_eq!(est.transform.translation, truth.translation, epsilon = 1e-3);
    }

    #[test]
    fn test_threshold_controls_inliers() {
        let verifier = seeded_verifier();
        let truth = SE3::identity();
        let mut corrs = correspondences_for(&truth, &grid_points(30), verifier.camera());

        // Shift every pixel observation by about 3 px
        for c in corrs.iter_mut() {
            c.pixel_a.x += 3.0;
        }

        let strict = verifier.estimate_from_correspondences(&corrs, 1.5).unwrap();
        let loose = verifier.estimate_from_correspondences(&corrs, 4.0).unwrap();
        assert!(loose.inliers > strict.inliers);
        assert_eq!(loose.inliers, 30);
    }

    #[test]
    fn test_insufficient_correspondences() {
        let verifier = seeded_verifier();
        let corrs = correspondences_for(&SE3::identity(), &grid_points(2), verifier.camera());

        let err = verifier.estimate_from_correspondences(&corrs, 4.0).unwrap_err();
        assert!(matches!(err, SlamError::InsufficientMatches { found: 2, required: 3 }));
    }

    #[test]
    fn test_adaptive_iterations() {
        assert_eq!(compute_adaptive_iterations(1.0, 0.99, 3), 1);
        assert_eq!(compute_adaptive_iterations(0.0, 0.99, 3), usize::MAX);
        assert!(compute_adaptive_iterations(0.5, 0.99, 3) > compute_adaptive_iterations(0.9, 0.99, 3));
    }
}
