use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::warn;
use tracing_subscriber::EnvFilter;

use stereo_slam::config::SlamConfig;
use stereo_slam::io::{prepare_output_dir, CsvPoseWriter, SyntheticConfig, SyntheticSequence};
use stereo_slam::system::{SlamSystem, TracingPublisher};

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_thread_names(true)
        .init();

    let config = match std::env::args().nth(1).map(PathBuf::from) {
        Some(path) => SlamConfig::from_yaml_file(&path)
            .with_context(|| format!("loading configuration from {}", path.display()))?,
        None => SlamConfig::default(),
    };

    let output = config.output.directory.clone();
    if let Some(backup) = prepare_output_dir(&output)? {
        println!("Previous output moved to {}", backup.display());
    }
    let writer = CsvPoseWriter::new(&output)?;

    let sequence = SyntheticSequence::new(SyntheticConfig {
        camera: config.camera,
        ..SyntheticConfig::default()
    });
    println!(
        "Synthetic sequence: {} frames, {} ms apart",
        sequence.len(),
        sequence.config().frame_period_ns / 1_000_000
    );

    let mut slam_system = SlamSystem::new(config, vec![Box::new(writer)], Box::new(TracingPublisher::default()))
        .context("starting SLAM threads")?;

    for sample in sequence.samples() {
        slam_system.feed(sample)?;
    }

    slam_system.stop_tracking();
    if !slam_system.wait_for_loop_closing(Duration::from_secs(120)) {
        warn!("loop closing did not catch up, finalizing anyway");
    }
    let summary = slam_system.shutdown();

    println!(
        "Done! {} keyframes, {} loop edges ({} candidates, {} verified, {} inconsistent)",
        summary.keyframes,
        summary.loop_edges,
        summary.loop_closing.candidates_detected,
        summary.loop_closing.loops_verified,
        summary.loop_closing.loops_inconsistent
    );

    // Final keyframe against ground truth, both relative to the first frame
    let graph = slam_system.graph().read();
    if let Some(last) = graph.keyframes().last() {
        let index = (last.timestamp_ns / sequence.config().frame_period_ns).saturating_sub(1) as usize;
        let truth = sequence.ground_truth(0).between(sequence.ground_truth(index));
        println!(
            "Last keyframe {} (frame {}): position error {:.3} m",
            last.id,
            index,
            last.pose.translation_distance(&truth)
        );
    }
    println!("Poses written to {}", output.display());

    Ok(())
}
