//! Geometry utilities: SE3 transforms, camera projection, geometric verification.

pub mod camera;
pub mod se3;
pub mod verifier;

pub use camera::CameraModel;
pub use se3::SE3;
pub use verifier::{Correspondence, Estimate, GeometricVerifier};
