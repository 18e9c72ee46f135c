//! Synthetic stereo + odometry sequences.
//!
//! The camera drives once around a circle, looking outward at landmarks
//! scattered on a surrounding wall, and ends next to where it started.
//! Every observation carries a noisy binary descriptor of its landmark, a
//! noisy stereo point and a reprojected keypoint; odometry is the true
//! relative motion with noise and a small heading bias, so dead reckoning
//! drifts and the revisit at the end is a real loop closure.

use std::f64::consts::{FRAC_PI_2, TAU};

use nalgebra::{Point2, UnitQuaternion, Vector3};
use rand::prelude::*;

use crate::geometry::{CameraModel, SE3};
use crate::tracking::frame::{Descriptor, Feature, FeatureSet, PointCloud, SensorSample, StereoFrame};

/// Parameters of a synthetic sequence.
#[derive(Debug, Clone)]
pub struct SyntheticConfig {
    pub seed: u64,
    pub num_poses: usize,
    /// Radius of the camera circle (metres).
    pub radius: f64,
    pub num_landmarks: usize,
    /// Landmarks lie between `radius + wall_near` and `radius + wall_far`.
    pub wall_near: f64,
    pub wall_far: f64,
    /// At most this many features per frame, lowest landmark ids first.
    pub max_features: usize,
    /// Extra cloud points reconstructed around each visible landmark.
    pub cloud_density: usize,
    /// Bits flipped per observed descriptor.
    pub descriptor_noise_bits: usize,
    /// Uniform noise on stereo points (metres).
    pub point_noise: f64,
    /// Uniform noise on keypoints (pixels).
    pub pixel_noise: f64,
    /// Uniform noise on odometry translation (metres).
    pub odometry_noise: f64,
    /// Heading bias added to every odometry step (radians).
    pub odometry_yaw_bias: f64,
    pub frame_period_ns: u64,
    pub camera: CameraModel,
}

impl Default for SyntheticConfig {
    fn default() -> Self {
        Self {
            seed: 0,
            num_poses: 120,
            radius: 5.0,
            num_landmarks: 600,
            wall_near: 4.0,
            wall_far: 7.0,
            max_features: 90,
            cloud_density: 2,
            descriptor_noise_bits: 4,
            point_noise: 0.005,
            pixel_noise: 0.3,
            odometry_noise: 0.005,
            odometry_yaw_bias: 0.0005,
            frame_period_ns: 100_000_000,
            camera: CameraModel::default(),
        }
    }
}

struct Landmark {
    position: Vector3<f64>,
    descriptor: Descriptor,
}

/// A generated sequence with its ground truth.
pub struct SyntheticSequence {
    config: SyntheticConfig,
    poses: Vec<SE3>,
    landmarks: Vec<Landmark>,
}

impl SyntheticSequence {
    pub fn new(config: SyntheticConfig) -> Self {
        let mut rng = StdRng::seed_from_u64(config.seed);

        let poses = (0..config.num_poses)
            .map(|i| circle_pose(config.radius, TAU * i as f64 / config.num_poses as f64))
            .collect();

        let landmarks = (0..config.num_landmarks)
            .map(|_| {
                let angle = rng.gen_range(0.0..TAU);
                let r = config.radius + rng.gen_range(config.wall_near..config.wall_far);
                let mut descriptor = [0u8; 32];
                rng.fill(&mut descriptor[..]);
                Landmark {
                    position: Vector3::new(r * angle.cos(), rng.gen_range(-1.5..1.5), r * angle.sin()),
                    descriptor,
                }
            })
            .collect();

        Self {
            config,
            poses,
            landmarks,
        }
    }

    pub fn len(&self) -> usize {
        self.poses.len()
    }

    pub fn is_empty(&self) -> bool {
        self.poses.is_empty()
    }

    pub fn config(&self) -> &SyntheticConfig {
        &self.config
    }

    /// True camera pose (T_wc) of frame `i`.
    pub fn ground_truth(&self, i: usize) -> &SE3 {
        &self.poses[i]
    }

    pub fn timestamp_ns(&self, i: usize) -> u64 {
        (i as u64 + 1) * self.config.frame_period_ns
    }

    /// Stereo output of frame `i`. Deterministic per frame.
    pub fn frame_at(&self, i: usize) -> StereoFrame {
        let mut rng = StdRng::seed_from_u64(self.config.seed ^ (0x9e37_79b9 + i as u64 * 7919));
        let camera = &self.config.camera;
        let world_to_cam = self.poses[i].inverse();
        let width = 2.0 * camera.cx;
        let height = 2.0 * camera.cy;

        let mut features = Vec::new();
        let mut cloud = PointCloud::new();

        for landmark in &self.landmarks {
            let p_cam = world_to_cam.transform_point(&landmark.position);
            let Some(px) = camera.project(&p_cam) else {
                continue;
            };
            if px.x < 0.0 || px.x >= width || px.y < 0.0 || px.y >= height {
                continue;
            }

            let point = p_cam + noise_vector(&mut rng, self.config.point_noise);
            cloud.push(point);
            for _ in 0..self.config.cloud_density {
                cloud.push(p_cam + noise_vector(&mut rng, 0.05));
            }

            if features.len() < self.config.max_features {
                let pn = self.config.pixel_noise;
                let keypoint = if pn > 0.0 {
                    Point2::new(px.x + rng.gen_range(-pn..pn), px.y + rng.gen_range(-pn..pn))
                } else {
                    px
                };
                features.push(Feature {
                    keypoint,
                    descriptor: flip_bits(&mut rng, landmark.descriptor, self.config.descriptor_noise_bits),
                    point: Some(point),
                });
            }
        }

        StereoFrame {
            features: FeatureSet::new(features),
            cloud,
        }
    }

    /// Noisy, biased odometry from frame `i - 1` to frame `i` (identity for
    /// the first frame).
    pub fn odometry_at(&self, i: usize) -> SE3 {
        if i == 0 {
            return SE3::identity();
        }
        let mut rng = StdRng::seed_from_u64(self.config.seed ^ (0x51_7cc1 + i as u64 * 104_729));
        let truth = self.poses[i - 1].between(&self.poses[i]);
        let n = self.config.odometry_noise;
        let jitter = if n > 0.0 {
            Vector3::new(rng.gen_range(-n..n), 0.0, rng.gen_range(-n..n))
        } else {
            Vector3::zeros()
        };
        // Heading error about the camera's vertical axis
        let bias = SE3::new(
            UnitQuaternion::from_axis_angle(&Vector3::y_axis(), self.config.odometry_yaw_bias),
            jitter,
        );
        truth.compose(&bias)
    }

    pub fn sample_at(&self, i: usize) -> SensorSample {
        SensorSample::new(self.timestamp_ns(i), self.odometry_at(i), self.frame_at(i))
    }

    pub fn samples(&self) -> impl Iterator<Item = SensorSample> + '_ {
        (0..self.len()).map(move |i| self.sample_at(i))
    }
}

/// Camera on the circle at `angle`, optical axis pointing outward, y down.
fn circle_pose(radius: f64, angle: f64) -> SE3 {
    SE3::new(
        UnitQuaternion::from_axis_angle(&Vector3::y_axis(), FRAC_PI_2 - angle),
        Vector3::new(radius * angle.cos(), 0.0, radius * angle.sin()),
    )
}

fn noise_vector(rng: &mut StdRng, amplitude: f64) -> Vector3<f64> {
    if amplitude <= 0.0 {
        return Vector3::zeros();
    }
    Vector3::new(
        rng.gen_range(-amplitude..amplitude),
        rng.gen_range(-amplitude..amplitude),
        rng.gen_range(-amplitude..amplitude),
    )
}

fn flip_bits(rng: &mut StdRng, mut descriptor: Descriptor, bits: usize) -> Descriptor {
    for _ in 0..bits {
        let bit = rng.gen_range(0..256);
        descriptor[bit / 8] ^= 1 << (bit % 8);
    }
    descriptor
}
