//! Input/output around the SLAM core.
//!
//! - `output_dir`: output directory bootstrap with backup
//! - `pose_writer`: CSV snapshot sink
//! - `synthetic`: synthetic stereo + odometry sequences

pub mod output_dir;
pub mod pose_writer;
pub mod synthetic;

pub use output_dir::prepare_output_dir;
pub use pose_writer::CsvPoseWriter;
pub use synthetic::{SyntheticConfig, SyntheticSequence};
