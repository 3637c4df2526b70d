//! Packs an unpacked rootfs into a single read-only squashfs file by driving
//! the external mksquashfs.

use std::path::{Path, PathBuf};
use std::process::Command;

use crate::config::EngineConfig;
use crate::utils;

#[derive(Debug, thiserror::Error)]
pub enum SquashfsError {
    #[error("failed to execute {command:?}")]
    Spawn {
        command: PathBuf,
        source: std::io::Error,
    },
    #[error("mksquashfs exited with {status}: {stderr}")]
    PackerFailed { status: i32, stderr: String },
    #[error(transparent)]
    Fs(#[from] utils::FsError),
}

type Result<T> = std::result::Result<T, SquashfsError>;

pub struct SquashfsPacker<'a> {
    config: &'a EngineConfig,
}

impl<'a> SquashfsPacker<'a> {
    pub fn new(config: &'a EngineConfig) -> Self {
        SquashfsPacker { config }
    }

    /// Produces `destination` from `rootfs` and returns the file size.
    pub fn pack(&self, rootfs: &Path, destination: &Path) -> Result<u64> {
        tracing::info!(rootfs = %rootfs.display(), destination = %destination.display(),
            "creating squashfs image");

        let args = build_pack_args(self.config, rootfs, destination);
        let output = Command::new(&self.config.mksquashfs_path)
            .args(&args)
            .output()
            .map_err(|err| SquashfsError::Spawn {
                command: self.config.mksquashfs_path.clone(),
                source: err,
            })?;
        if !output.status.success() {
            return Err(SquashfsError::PackerFailed {
                status: output.status.code().unwrap_or(-1),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        let size = utils::file_size(destination)?;
        tracing::info!(size, "squashfs image created");
        Ok(size)
    }
}

/// Compression options come from the configuration as a whitespace-split
/// string; values containing spaces are not supported. No configured options
/// means no extra flags.
fn build_pack_args(config: &EngineConfig, rootfs: &Path, destination: &Path) -> Vec<String> {
    let mut args = vec![
        rootfs.display().to_string(),
        destination.display().to_string(),
    ];
    if let Some(options) = &config.mksquashfs_options {
        args.extend(options.split_whitespace().map(str::to_string));
    }
    args
}
