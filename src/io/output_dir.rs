//! Output directory bootstrap.
//!
//! An existing output directory is copied to `<dir>_bk/<n>` (first free
//! `n`, starting at 1), removed, and recreated empty. Any filesystem failure
//! is a `StorageFault`.

use std::fs;
use std::path::{Path, PathBuf};

use tracing::warn;

use crate::error::{Result, SlamError};

/// Backup location for `dir`: the first `<dir>_bk/<n>` that does not exist.
pub fn backup_path(dir: &Path) -> PathBuf {
    let mut root = dir.as_os_str().to_owned();
    root.push("_bk");
    let root = PathBuf::from(root);

    let mut counter = 1;
    loop {
        let candidate = root.join(counter.to_string());
        if !candidate.exists() {
            return candidate;
        }
        counter += 1;
    }
}

/// Make `dir` an empty directory, backing up previous contents.
///
/// Returns the backup location when one was made.
pub fn prepare_output_dir(dir: &Path) -> Result<Option<PathBuf>> {
    let backup = if dir.is_dir() {
        let target = backup_path(dir);
        copy_recursive(dir, &target).map_err(|e| storage_fault("back up", dir, e))?;
        warn!(
            "output directory {} already exists, backed up into {}",
            dir.display(),
            target.display()
        );
        fs::remove_dir_all(dir).map_err(|e| storage_fault("remove", dir, e))?;
        Some(target)
    } else {
        None
    };

    fs::create_dir_all(dir).map_err(|e| storage_fault("create", dir, e))?;
    Ok(backup)
}

fn storage_fault(action: &str, dir: &Path, e: std::io::Error) -> SlamError {
    SlamError::StorageFault(format!("cannot {} {}: {}", action, dir.display(), e))
}

fn copy_recursive(src: &Path, dst: &Path) -> std::io::Result<()> {
    fs::create_dir_all(dst)?;
    for entry in fs::read_dir(src)? {
        let entry = entry?;
        let target = dst.join(entry.file_name());
        if entry.file_type()?.is_dir() {
            copy_recursive(&entry.path(), &target)?;
        } else {
            fs::copy(entry.path(), target)?;
        }
    }
    Ok(())
}
