//! CSV persistence of graph snapshots.
//!
//! Each snapshot rewrites two files in the output directory:
//! - `poses.csv`: one row per keyframe (`id,timestamp_ns,x,y,z,qx,qy,qz,qw`)
//! - `loop_edges.csv`: one row per accepted loop edge (`source,target`)

use std::path::{Path, PathBuf};

use csv::{ReaderBuilder, Writer};
use serde::{Deserialize, Serialize};

use crate::error::{Result, SlamError};
use crate::graph::{GraphSnapshot, PoseRecord, SnapshotSink};

pub const POSES_FILE: &str = "poses.csv";
pub const LOOP_EDGES_FILE: &str = "loop_edges.csv";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoopEdgeRecord {
    pub source: u64,
    pub target: u64,
}

/// Writes snapshots into a fixed directory.
pub struct CsvPoseWriter {
    directory: PathBuf,
    snapshots_written: usize,
}

impl CsvPoseWriter {
    /// The directory must already exist; creating it is the bootstrap's job.
    pub fn new(directory: impl Into<PathBuf>) -> Result<Self> {
        let directory = directory.into();
        if !directory.is_dir() {
            return Err(SlamError::StorageFault(format!(
                "output directory {} does not exist",
                directory.display()
            )));
        }
        Ok(Self {
            directory,
            snapshots_written: 0,
        })
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }

    pub fn snapshots_written(&self) -> usize {
        self.snapshots_written
    }

    fn write(&self, snapshot: &GraphSnapshot) -> Result<()> {
        let mut poses = Writer::from_path(self.directory.join(POSES_FILE))?;
        for record in &snapshot.poses {
            poses.serialize(record)?;
        }
        poses.flush()?;

        let mut edges = Writer::from_path(self.directory.join(LOOP_EDGES_FILE))?;
        for (source, target) in &snapshot.loop_edges {
            edges.serialize(LoopEdgeRecord {
                source: source.0,
                target: target.0,
            })?;
        }
        edges.flush()?;
        Ok(())
    }
}

impl SnapshotSink for CsvPoseWriter {
    fn consume(&mut self, snapshot: &GraphSnapshot) -> Result<()> {
        self.write(snapshot)?;
        self.snapshots_written += 1;
        Ok(())
    }
}

/// Read back a `poses.csv` file.
pub fn read_poses(csv_path: &Path) -> Result<Vec<PoseRecord>> {
    let mut rdr = ReaderBuilder::new().has_headers(true).from_path(csv_path)?;

    let mut entries = Vec::new();
    for rec in rdr.deserialize() {
        entries.push(rec?);
    }
    Ok(entries)
}

/// Read back a `loop_edges.csv` file.
pub fn read_loop_edges(csv_path: &Path) -> Result<Vec<LoopEdgeRecord>> {
    let mut rdr = ReaderBuilder::new().has_headers(true).from_path(csv_path)?;

    let mut entries = Vec::new();
    for rec in rdr.deserialize() {
        entries.push(rec?);
    }
    Ok(entries)
}
