//! PoseGraph: append-only keyframe/edge store.
//!
//! ```text
//!   [KF0] --odom--> [KF1] --odom--> [KF2] --odom--> [KF3]
//!     ^                                               |
//!     +------------------- loop ----------------------+
//! ```
//!
//! Keyframe ids equal their index in the store. Every keyframe except the
//! first gets an odometry edge from its predecessor at insertion, so the
//! odometry chain always spans the whole graph. Loop edges are validated
//! against the current relative pose of their endpoints before insertion.
//! Nothing is ever removed; only poses change, through [`PoseGraph::optimize`].

use std::collections::VecDeque;
use std::sync::Arc;

use crate::config::GraphConfig;
use crate::error::{Result, SlamError};
use crate::geometry::SE3;
use crate::tracking::frame::{FeatureSet, PointCloud};

use super::keyframe::KeyFrame;
use super::optimizer::{apply_pose_graph_results, collect_pose_graph_data, solve_pose_graph, PoseGraphResult};
use super::snapshot::{GraphSnapshot, PoseRecord};
use super::types::{Edge, EdgeKind, KeyFrameId};

/// The pose graph.
#[derive(Debug, Clone)]
pub struct PoseGraph {
    keyframes: Vec<KeyFrame>,
    edges: Vec<Edge>,
    config: GraphConfig,
}

impl PoseGraph {
    pub fn new(config: GraphConfig) -> Self {
        Self {
            keyframes: Vec::new(),
            edges: Vec::new(),
            config,
        }
    }

    pub fn config(&self) -> &GraphConfig {
        &self.config
    }

    pub fn len(&self) -> usize {
        self.keyframes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keyframes.is_empty()
    }

    /// Id the next inserted keyframe will receive.
    pub fn next_id(&self) -> KeyFrameId {
        KeyFrameId::new(self.keyframes.len() as u64)
    }

    pub fn keyframe(&self, id: KeyFrameId) -> Option<&KeyFrame> {
        self.keyframes.get(id.index())
    }

    pub fn keyframes(&self) -> &[KeyFrame] {
        &self.keyframes
    }

    pub fn edges(&self) -> &[Edge] {
        &self.edges
    }

    pub fn pose(&self, id: KeyFrameId) -> Option<&SE3> {
        self.keyframe(id).map(|kf| &kf.pose)
    }

    pub fn num_loop_edges(&self) -> usize {
        self.edges.iter().filter(|e| e.kind == EdgeKind::Loop).count()
    }

    /// Append a keyframe under the next id.
    ///
    /// `odometry` is the measured T_prev_new. When present the stored pose is
    /// the previous keyframe's current pose composed with it, and `pose` is
    /// only used for the first keyframe. When absent the edge is derived
    /// from the two poses.
    pub fn insert_keyframe(
        &mut self,
        timestamp_ns: u64,
        pose: SE3,
        features: Arc<FeatureSet>,
        cloud: Arc<PointCloud>,
        odometry: Option<SE3>,
    ) -> KeyFrameId {
        let id = self.next_id();
        self.append(KeyFrame::new(id, timestamp_ns, pose, features, cloud), odometry);
        id
    }

    /// Append a keyframe whose id was reserved beforehand.
    pub fn insert_keyframe_with_id(
        &mut self,
        id: KeyFrameId,
        timestamp_ns: u64,
        pose: SE3,
        features: Arc<FeatureSet>,
        cloud: Arc<PointCloud>,
        odometry: Option<SE3>,
    ) -> Result<KeyFrameId> {
        let expected = self.next_id();
        if id != expected {
            return Err(SlamError::OutOfOrderKeyFrame { expected, got: id });
        }
        self.append(KeyFrame::new(id, timestamp_ns, pose, features, cloud), odometry);
        Ok(id)
    }

    fn append(&mut self, mut keyframe: KeyFrame, odometry: Option<SE3>) {
        if let Some(prev) = self.keyframes.last() {
            // A measured edge anchors the new pose on the stored (possibly
            // optimized) pose of its predecessor
            if let Some(odometry) = &odometry {
                keyframe.pose = prev.pose.compose(odometry);
            }
            let relative = odometry.unwrap_or_else(|| prev.pose.between(&keyframe.pose));
            self.edges.push(Edge::odometry(
                prev.id,
                keyframe.id,
                relative,
                self.config.odometry_information,
            ));
        }
        self.keyframes.push(keyframe);
    }

    /// Check a proposed loop edge without inserting it.
    ///
    /// Returns the translation disagreement (metres) between the proposed
    /// relative transform and the current relative pose of its endpoints.
    pub fn validate_loop_edge(&self, edge: &Edge) -> Result<f64> {
        let source = self
            .keyframe(edge.source)
            .ok_or(SlamError::UnknownKeyFrame(edge.source))?;
        let target = self
            .keyframe(edge.target)
            .ok_or(SlamError::UnknownKeyFrame(edge.target))?;

        let diff = if edge.source == edge.target {
            f64::INFINITY
        } else {
            let current = source.pose.between(&target.pose);
            current.between(&edge.relative).translation.norm()
        };

        if diff > self.config.max_edge_diff {
            return Err(SlamError::GraphInconsistency {
                source_id: edge.source,
                target_id: edge.target,
                diff,
                max: self.config.max_edge_diff,
            });
        }
        Ok(diff)
    }

    /// Validate and append a loop edge. Accepted edges are permanent.
    pub fn insert_loop_edge(&mut self, mut edge: Edge) -> Result<()> {
        self.validate_loop_edge(&edge)?;
        edge.kind = EdgeKind::Loop;
        self.edges.push(edge);
        Ok(())
    }

    /// Loop search candidates for `id`.
    ///
    /// All keyframes except `id` itself, the `lc_neighbors` keyframes
    /// immediately preceding it, and the `lc_discard_window` most recent
    /// keyframes of the graph.
    pub fn neighbor_candidates(&self, id: KeyFrameId) -> Vec<KeyFrameId> {
        let n = self.keyframes.len();
        let k = id.index();
        let recent_start = n.saturating_sub(self.config.lc_discard_window);
        let neighbor_start = k.saturating_sub(self.config.lc_neighbors);

        (0..n)
            .filter(|&i| i < recent_start)
            .filter(|&i| i != k && !(neighbor_start..k).contains(&i))
            .map(|i| KeyFrameId::new(i as u64))
            .collect()
    }

    /// True when every keyframe is reachable from keyframe 0 through
    /// odometry edges alone.
    pub fn is_odometry_connected(&self) -> bool {
        let n = self.keyframes.len();
        if n == 0 {
            return true;
        }

        let mut adjacency = vec![Vec::new(); n];
        for edge in self.edges.iter().filter(|e| e.kind == EdgeKind::Odometry) {
            adjacency[edge.source.index()].push(edge.target.index());
            adjacency[edge.target.index()].push(edge.source.index());
        }

        let mut visited = vec![false; n];
        let mut queue = VecDeque::from([0usize]);
        visited[0] = true;
        while let Some(i) = queue.pop_front() {
            for &j in &adjacency[i] {
                if !visited[j] {
                    visited[j] = true;
                    queue.push_back(j);
                }
            }
        }
        visited.into_iter().all(|v| v)
    }

    pub(crate) fn set_pose(&mut self, id: KeyFrameId, pose: SE3) -> bool {
        match self.keyframes.get_mut(id.index()) {
            Some(kf) => {
                kf.pose = pose;
                true
            }
            None => false,
        }
    }

    /// Collect, solve and apply a global relaxation in one call.
    pub fn optimize(&mut self) -> Option<PoseGraphResult> {
        let problem = collect_pose_graph_data(self)?;
        let result = solve_pose_graph(&problem, &self.config.optimizer)?;
        apply_pose_graph_results(self, &result);
        Some(result)
    }

    pub fn snapshot(&self) -> GraphSnapshot {
        GraphSnapshot {
            poses: self
                .keyframes
                .iter()
                .map(|kf| PoseRecord::new(kf.id, kf.timestamp_ns, &kf.pose))
                .collect(),
            loop_edges: self
                .edges
                .iter()
                .filter(|e| e.kind == EdgeKind::Loop)
                .map(|e| (e.source, e.target))
                .collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use nalgebra::Vector3;

    fn step() -> SE3 {
        SE3::from_yaw(0.1, Vector3::new(1.0, 0.0, 0.0))
    }

    fn chain(n: usize) -> PoseGraph {
        let mut graph = PoseGraph::new(GraphConfig::default());
        let mut pose = SE3::identity();
        for i in 0..n {
            let odometry = (i > 0).then(step);
            if i > 0 {
                pose = pose.compose(&step());
            }
            graph.insert_keyframe(
                i as u64 * 100,
                pose.clone(),
                Arc::new(FeatureSet::default()),
                Arc::new(PointCloud::new()),
                odometry,
            );
        }
        graph
    }

    #[test]
    fn test_ids_strictly_increasing() {
        let graph = chain(25);
        for (i, kf) in graph.keyframes().iter().enumerate() {
            assert_eq!(kf.id, KeyFrameId::new(i as u64));
        }
        assert_eq!(graph.next_id(), KeyFrameId::new(25));
    }

    #[test]
    fn test_reserved_id_must_be_next() {
        let mut graph = chain(3);
        let err = graph
            .insert_keyframe_with_id(
                KeyFrameId::new(5),
                0,
                SE3::identity(),
                Arc::new(FeatureSet::default()),
                Arc::new(PointCloud::new()),
                None,
            )
            .unwrap_err();
        assert!(matches!(err, SlamError::OutOfOrderKeyFrame { .. }));
        assert_eq!(graph.len(), 3);
    }

    #[test]
    fn test_odometry_edges_form_chain() {
        let graph = chain(5);
        assert_eq!(graph.edges().len(), 4);
        for (i, edge) in graph.edges().iter().enumerate() {
            assert_eq!(edge.kind, EdgeKind::Odometry);
            assert_eq!(edge.source, KeyFrameId::new(i as u64));
            assert_eq!(edge.target, KeyFrameId::new(i as u64 + 1));
        }
        assert!(graph.is_odometry_connected());
    }

    #[test]
    fn test_missing_odometry_derived_from_poses() {
        let mut graph = chain(1);
        let pose = SE3::from_translation(Vector3::new(2.0, 1.0, 0.0));
        graph.insert_keyframe(1, pose, Arc::new(FeatureSet::default()), Arc::new(PointCloud::new()), None);

        assert_relative_eq!(graph.edges()[0].relative.translation, Vector3::new(2.0, 1.0, 0.0));
    }

    #[test]
    fn test_pose_follows_optimized_predecessor() {
        let mut graph = chain(3);
        let moved = SE3::from_translation(Vector3::new(1.0, -2.0, 0.5));
        graph.set_pose(KeyFrameId::new(2), moved.clone());

        // Pose computed against the old predecessor pose
        let odometry = SE3::from_translation(Vector3::new(0.3, 0.0, 0.0));
        let stale = SE3::identity().compose(&odometry);
        graph.insert_keyframe(3, stale, Arc::new(FeatureSet::default()), Arc::new(PointCloud::new()), Some(odometry.clone()));

        let expected = moved.compose(&odometry);
        assert!(graph.pose(KeyFrameId::new(3)).unwrap().translation_distance(&expected) < 1e-12);
    }

    #[test]
    fn test_neighbor_candidates_exclusions() {
        let graph = chain(30);
        let config = graph.config().clone();

        for k in [0usize, 3, 12, 19, 25, 29] {
            let candidates = graph.neighbor_candidates(KeyFrameId::new(k as u64));
            let expected: Vec<KeyFrameId> = (0..30)
                .filter(|&i| i != k)
                .filter(|&i| !(i < k && k - i <= config.lc_neighbors))
                .filter(|&i| i + config.lc_discard_window < 30)
                .map(|i| KeyFrameId::new(i as u64))
                .collect();
            assert_eq!(candidates, expected, "k = {}", k);
        }
    }

    #[test]
    fn test_neighbor_candidates_small_graph() {
        let graph = chain(8);
        assert!(graph.neighbor_candidates(KeyFrameId::new(7)).is_empty());
    }

    #[test]
    fn test_loop_edge_unknown_endpoint() {
        let mut graph = chain(5);
        let edge = Edge::loop_closure(KeyFrameId::new(4), KeyFrameId::new(9), SE3::identity(), 1.0);
        let err = graph.insert_loop_edge(edge).unwrap_err();
        assert!(matches!(err, SlamError::UnknownKeyFrame(id) if id == KeyFrameId::new(9)));
    }

    #[test]
    fn test_loop_edge_consistency_bound() {
        let mut graph = chain(20);
        let source = KeyFrameId::new(19);
        let target = KeyFrameId::new(2);
        let current = graph.pose(source).unwrap().between(graph.pose(target).unwrap());

        // 0.5 m off: accepted
        let near = current.compose(&SE3::from_translation(Vector3::new(0.5, 0.0, 0.0)));
        graph
            .insert_loop_edge(Edge::loop_closure(source, target, near, 1.0))
            .unwrap();

        // 3 m off: rejected as inconsistent
        let far = current.compose(&SE3::from_translation(Vector3::new(3.0, 0.0, 0.0)));
        let err = graph
            .insert_loop_edge(Edge::loop_closure(source, target, far, 1.0))
            .unwrap_err();
        assert!(matches!(err, SlamError::GraphInconsistency { .. }));
        assert_eq!(graph.num_loop_edges(), 1);
    }

    #[test]
    fn test_loop_edges_keep_odometry_connectivity() {
        let mut graph = chain(30);
        for (s, t) in [(29, 3), (25, 1), (20, 8)] {
            let (s, t) = (KeyFrameId::new(s), KeyFrameId::new(t));
            let rel = graph.pose(s).unwrap().between(graph.pose(t).unwrap());
            graph.insert_loop_edge(Edge::loop_closure(s, t, rel, 1.0)).unwrap();
            graph.optimize();
            assert!(graph.is_odometry_connected());
        }
        assert_eq!(graph.num_loop_edges(), 3);
        assert_eq!(graph.edges().len(), 29 + 3);
    }

    #[test]
    fn test_snapshot() {
        let graph = chain(4);
        let snapshot = graph.snapshot();
        assert_eq!(snapshot.poses.len(), 4);
        assert!(snapshot.loop_edges.is_empty());
        assert_eq!(snapshot.poses[3].id, 3);
    }
}
