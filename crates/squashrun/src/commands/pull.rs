//! Runs the pull pipeline: copier, unpacker, squashfs packer, store.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use libsquashrun::config::EngineConfig;
use libsquashrun::image::metadata::ImageMetadata;
use libsquashrun::image::puller::Puller;
use libsquashrun::image::squashfs::SquashfsPacker;
use libsquashrun::image::store::ImageStore;
use libsquashrun::image::unpacker::Unpacker;
use libsquashrun::invocation::UserIdentity;
use libsquashrun::utils;

/// Pull an image from a registry into the repository
#[derive(Parser, Debug)]
pub struct Pull {
    /// Use the site-wide repository instead of the user's
    #[clap(long)]
    pub centralized_repository: bool,
    /// Scratch directory for this pull, overriding the configured one
    #[clap(long)]
    pub temp_dir: Option<PathBuf>,
    /// Image reference, e.g. "debian:11" or "quay.io/org/tool@sha256:..."
    pub reference: String,
}

pub fn pull(args: Pull, config: &EngineConfig) -> Result<()> {
    let reference = super::parse_cli_reference(&args.reference)?;
    let identity = UserIdentity::from_process();

    // Scratch location: --temp-dir, then $TMPDIR, then the configured one.
    let mut config = config.clone();
    if let Some(temp_dir) = args
        .temp_dir
        .or_else(|| std::env::var_os("TMPDIR").map(PathBuf::from))
    {
        config.temp_dir = temp_dir;
    }
    let repository = super::open_repository(&config, &identity, args.centralized_repository)?;

    let scratch = repository
        .scratch_dir()
        .context("failed to create a scratch directory")?;
    let layout_dir = repository
        .oci_image_cache()
        .join(utils::random_hex_string(16));

    let result = (|| -> Result<()> {
        let blob_cache = repository.blob_cache();
        Puller::new(&config, &blob_cache)
            .pull(&reference, &layout_dir)
            .context("failed to pull image")?;

        let unpacked = Unpacker::new(&config)
            .unpack(
                &layout_dir,
                reference.layout_tag(),
                &scratch.path().join("unpacked"),
            )
            .context("failed to unpack image")?;
        let metadata = ImageMetadata::from_image_configuration(&unpacked.configuration);

        let squashfs_file = scratch.path().join("image.squashfs");
        SquashfsPacker::new(&config)
            .pack(&unpacked.rootfs, &squashfs_file)
            .context("failed to create squashfs image")?;

        let stored = ImageStore::new(&repository)
            .store(&reference, &squashfs_file, &metadata, unpacked.config_digest)
            .context("failed to register image in the repository")?;

        println!("{} ({}, id {})", stored.reference, stored.datasize, &stored.id[..12]);
        Ok(())
    })();

    // The layout directory is a cache entry for this pull only; the blob
    // store is what persists across pulls.
    if layout_dir.exists() {
        if let Err(err) = std::fs::remove_dir_all(&layout_dir) {
            tracing::warn!(path = %layout_dir.display(), error = %err,
                "failed to remove OCI layout directory");
        }
    }

    result
}
