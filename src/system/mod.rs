//! SLAM system orchestration and thread management.
//!
//! This module contains the top-level `SlamSystem` that spawns and coordinates
//! the Tracking, Graph and LoopClosing threads, along with inter-thread
//! messaging types and the live trajectory publisher.

pub mod messages;
pub mod publisher;
mod slam_system;

pub use messages::{GraphCommand, NewKeyFrameMsg};
pub use publisher::{NullPublisher, Publisher, TracingPublisher, TrajectorySnapshot};
pub use slam_system::{SlamSummary, SlamSystem};
