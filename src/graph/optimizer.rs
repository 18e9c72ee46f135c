//! Pose graph relaxation.
//!
//! Minimizes the weighted sum of edge residuals
//! `r_ij = log(Z_ij^{-1} * T_i^{-1} * T_j)` over all keyframe poses with
//! Levenberg-Marquardt. Keyframe 0 is held fixed as the gauge anchor; every
//! other pose is parameterized as a local increment on its initial value,
//! `T_k = T_k0 * exp(delta_k)`. Topology is never touched.
//!
//! The three-phase pattern keeps lock time short:
//! 1. COLLECT: copy poses and edges out of the graph (read lock)
//! 2. SOLVE: run LM without any lock
//! 3. APPLY: write the optimized poses back (write lock)

use nalgebra::{DMatrix, DVector, Matrix6, SMatrix, Vector6};

use crate::config::OptimizerConfig;
use crate::geometry::SE3;

use super::pose_graph::PoseGraph;
use super::types::KeyFrameId;

/// Parameters per pose.
const DOF: usize = 6;

/// Step for the central-difference Jacobian.
const JACOBIAN_EPS: f64 = 1e-6;

type Matrix6x6 = Matrix6<f64>;

/// An edge in index space.
#[derive(Debug, Clone)]
pub struct PoseGraphEdge {
    pub i: usize,
    pub j: usize,
    /// Measured T_ij.
    pub measurement: SE3,
    pub information: f64,
}

/// Data extracted for pose graph optimization.
#[derive(Debug, Clone)]
pub struct PoseGraphProblemData {
    /// Initial poses, indexed by keyframe id. Index 0 is fixed.
    pub initial_poses: Vec<SE3>,
    pub edges: Vec<PoseGraphEdge>,
}

/// Result of pose graph optimization.
#[derive(Debug, Clone)]
pub struct PoseGraphResult {
    /// Optimized poses, indexed by keyframe id.
    pub optimized_poses: Vec<SE3>,
    pub iterations: usize,
    /// Root of the initial weighted squared error.
    pub initial_error: f64,
    /// Root of the final weighted squared error.
    pub final_error: f64,
}

/// PHASE 1: Collect pose graph data.
///
/// Returns `None` when there is nothing to optimize (fewer than two
/// keyframes).
pub fn collect_pose_graph_data(graph: &PoseGraph) -> Option<PoseGraphProblemData> {
    if graph.len() < 2 {
        return None;
    }

    let initial_poses = graph.keyframes().iter().map(|kf| kf.pose.clone()).collect();
    let edges = graph
        .edges()
        .iter()
        .map(|e| PoseGraphEdge {
            i: e.source.index(),
            j: e.target.index(),
            measurement: e.relative.clone(),
            information: e.information,
        })
        .collect();

    Some(PoseGraphProblemData {
        initial_poses,
        edges,
    })
}

/// PHASE 2: Solve pose graph optimization.
pub fn solve_pose_graph(problem: &PoseGraphProblemData, config: &OptimizerConfig) -> Option<PoseGraphResult> {
    let n_poses = problem.initial_poses.len();
    if n_poses < 2 || problem.edges.is_empty() {
        return None;
    }

    let n_params = (n_poses - 1) * DOF;
    let mut params = DVector::zeros(n_params);

    let initial_error = compute_pose_graph_error(problem, &params);
    let mut current_error = initial_error;

    let mut lambda = 1e-3;
    let lambda_up = 10.0;
    let lambda_down = 0.1;
    let min_lambda = 1e-10;
    let max_lambda = 1e10;
    let mut iterations = 0;

    for iter in 0..config.max_iterations {
        iterations = iter + 1;

        let (hessian, gradient) = build_normal_equations(problem, &params);

        if gradient.norm() < config.gradient_tolerance {
            break;
        }

        let mut damped = hessian;
        for i in 0..n_params {
            damped[(i, i)] += lambda * damped[(i, i)].max(1e-6);
        }

        let delta = match damped.lu().solve(&(-&gradient)) {
            Some(d) => d,
            None => break,
        };

        if delta.norm() < config.param_tolerance * (params.norm() + config.param_tolerance) {
            break;
        }

        let trial_params = &params + &delta;
        let trial_error = compute_pose_graph_error(problem, &trial_params);

        if trial_error < current_error {
            params = trial_params;
            current_error = trial_error;
            lambda = (lambda * lambda_down).max(min_lambda);
        } else {
            lambda = (lambda * lambda_up).min(max_lambda);
            if lambda >= max_lambda {
                break;
            }
        }
    }

    let optimized_poses = (0..n_poses).map(|k| pose_from_params(problem, &params, k)).collect();

    Some(PoseGraphResult {
        optimized_poses,
        iterations,
        initial_error: initial_error.sqrt(),
        final_error: current_error.sqrt(),
    })
}

/// PHASE 3: Apply optimized poses to the graph.
///
/// Keyframes appended after the collect phase keep their pose.
pub fn apply_pose_graph_results(graph: &mut PoseGraph, results: &PoseGraphResult) -> usize {
    let mut updated = 0;
    for (k, pose) in results.optimized_poses.iter().enumerate() {
        if graph.set_pose(KeyFrameId::new(k as u64), pose.clone()) {
            updated += 1;
        }
    }
    updated
}

fn pose_from_params(problem: &PoseGraphProblemData, params: &DVector<f64>, k: usize) -> SE3 {
    let base = &problem.initial_poses[k];
    if k == 0 {
        return base.clone();
    }
    base.compose(&SE3::exp(&local_delta(params, k, None)))
}

/// Increment of pose `k`, optionally with component `p` perturbed by `h`.
fn local_delta(params: &DVector<f64>, k: usize, perturb: Option<(usize, f64)>) -> [f64; 6] {
    let offset = (k - 1) * DOF;
    let mut tangent = [0.0; DOF];
    for (i, t) in tangent.iter_mut().enumerate() {
        *t = params[offset + i];
    }
    if let Some((p, h)) = perturb {
        tangent[p] += h;
    }
    tangent
}

fn edge_error(measurement: &SE3, pose_i: &SE3, pose_j: &SE3) -> Vector6<f64> {
    let predicted = pose_i.between(pose_j);
    Vector6::from(measurement.inverse().compose(&predicted).log())
}

fn compute_pose_graph_error(problem: &PoseGraphProblemData, params: &DVector<f64>) -> f64 {
    problem
        .edges
        .iter()
        .map(|edge| {
            let pose_i = pose_from_params(problem, params, edge.i);
            let pose_j = pose_from_params(problem, params, edge.j);
            edge_error(&edge.measurement, &pose_i, &pose_j).norm_squared() * edge.information
        })
        .sum()
}

/// Numerical Jacobian of an edge residual with respect to the increment of
/// pose `k` (which is `i` when `is_source`, otherwise `j`).
fn edge_jacobian(
    problem: &PoseGraphProblemData,
    params: &DVector<f64>,
    edge: &PoseGraphEdge,
    k: usize,
    is_source: bool,
) -> Matrix6x6 {
    let base = &problem.initial_poses[k];
    let other = pose_from_params(problem, params, if is_source { edge.j } else { edge.i });
    let mut jacobian = Matrix6x6::zeros();

    for p in 0..DOF {
        let plus = base.compose(&SE3::exp(&local_delta(params, k, Some((p, JACOBIAN_EPS)))));
        let minus = base.compose(&SE3::exp(&local_delta(params, k, Some((p, -JACOBIAN_EPS)))));

        let (err_plus, err_minus) = if is_source {
            (
                edge_error(&edge.measurement, &plus, &other),
                edge_error(&edge.measurement, &minus, &other),
            )
        } else {
            (
                edge_error(&edge.measurement, &other, &plus),
                edge_error(&edge.measurement, &other, &minus),
            )
        };

        jacobian.set_column(p, &((err_plus - err_minus) / (2.0 * JACOBIAN_EPS)));
    }
    jacobian
}

/// Accumulate H = J^T W J and g = J^T W r block by block.
fn build_normal_equations(problem: &PoseGraphProblemData, params: &DVector<f64>) -> (DMatrix<f64>, DVector<f64>) {
    let n_params = params.len();
    let mut hessian = DMatrix::zeros(n_params, n_params);
    let mut gradient = DVector::zeros(n_params);

    for edge in &problem.edges {
        let pose_i = pose_from_params(problem, params, edge.i);
        let pose_j = pose_from_params(problem, params, edge.j);
        let error = edge_error(&edge.measurement, &pose_i, &pose_j);

        let blocks: Vec<(usize, Matrix6x6)> = [(edge.i, true), (edge.j, false)]
            .into_iter()
            .filter(|(k, _)| *k != 0)
            .map(|(k, is_source)| ((k - 1) * DOF, edge_jacobian(problem, params, edge, k, is_source)))
            .collect();

        for (offset_a, jac_a) in &blocks {
            let g_block: Vector6<f64> = jac_a.transpose() * error * edge.information;
            let mut g_view = gradient.fixed_rows_mut::<DOF>(*offset_a);
            g_view += g_block;

            for (offset_b, jac_b) in &blocks {
                let h_block: SMatrix<f64, DOF, DOF> = jac_a.transpose() * jac_b * edge.information;
                let mut h_view = hessian.fixed_view_mut::<DOF, DOF>(*offset_a, *offset_b);
                h_view += h_block;
            }
        }
    }

    (hessian, gradient)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::GraphConfig;
    use crate::graph::types::Edge;
    use crate::tracking::frame::{FeatureSet, PointCloud};
    use approx::assert_relative_eq;
    use nalgebra::Vector3;
    use std::sync::Arc;

    /// Square loop of 8 keyframes with a biased odometry (drift) and one
    /// loop edge back to the start.
    fn drifting_square() -> PoseGraph {
        let mut graph = PoseGraph::new(GraphConfig::default());
        let true_step = |i: usize| {
            if i % 2 == 0 {
                SE3::from_translation(Vector3::new(1.0, 0.0, 0.0))
            } else {
                SE3::from_yaw(std::f64::consts::FRAC_PI_2, Vector3::new(1.0, 0.0, 0.0))
            }
        };
        let drift = SE3::from_yaw(0.02, Vector3::new(0.03, 0.01, 0.0));

        let mut pose = SE3::identity();
        for i in 0..8 {
            let odom = (i > 0).then(|| true_step(i - 1).compose(&drift));
            if let Some(ref o) = odom {
                pose = pose.compose(o);
            }
            graph.insert_keyframe(
                i as u64,
                pose.clone(),
                Arc::new(FeatureSet::default()),
                Arc::new(PointCloud::new()),
                odom,
            );
        }

        // Ground-truth relative pose of KF7 to KF0 is the last true step inverted
        let rel_7_0 = true_step(7);
        graph
            .insert_loop_edge(Edge::loop_closure(KeyFrameId::new(7), KeyFrameId::new(0), rel_7_0, 1.0))
            .unwrap();
        graph
    }

    #[test]
    fn test_collect_requires_two_keyframes() {
        let graph = PoseGraph::new(GraphConfig::default());
        assert!(collect_pose_graph_data(&graph).is_none());
    }

    #[test]
    fn test_consistent_chain_is_unchanged() {
        let mut graph = PoseGraph::new(GraphConfig::default());
        let step = SE3::from_yaw(0.2, Vector3::new(1.0, 0.5, 0.0));
        let mut pose = SE3::identity();
        for i in 0..6 {
            if i > 0 {
                pose = pose.compose(&step);
            }
            graph.insert_keyframe(i, pose.clone(), Arc::new(FeatureSet::default()), Arc::new(PointCloud::new()), None);
        }
        let before: Vec<SE3> = graph.keyframes().iter().map(|kf| kf.pose.clone()).collect();

        let result = graph.optimize().unwrap();
        assert!(result.final_error < 1e-9);

        for (kf, old) in graph.keyframes().iter().zip(before.iter()) {
            assert_relative_eq!(kf.pose.translation, old.translation, epsilon = 1e-9);
        }
    }

    #[test]
    fn test_loop_reduces_error() {
        let mut graph = drifting_square();
        let result = graph.optimize().unwrap();

        assert!(result.final_error < result.initial_error);
        assert_relative_eq!(graph.pose(KeyFrameId::new(0)).unwrap().translation.norm(), 0.0);
    }

    #[test]
    fn test_optimize_is_fixed_point() {
        let mut graph = drifting_square();
        graph.optimize().unwrap();
        let first: Vec<SE3> = graph.keyframes().iter().map(|kf| kf.pose.clone()).collect();

        graph.optimize();
        for (kf, prev) in graph.keyframes().iter().zip(first.iter()) {
            assert!(kf.pose.translation_distance(prev) < 1e-6, "{} moved", kf.id);
            assert!(kf.pose.rotation_angle(prev) < 1e-6, "{} rotated", kf.id);
        }
    }
}
