//! Materializes an OCI layout into an unpacked rootfs by driving the external
//! unpacker (umoci), and reads the image configuration out of the layout.

use std::path::{Path, PathBuf};
use std::process::Command;

use nix::unistd::geteuid;
use oci_spec::image::{ImageConfiguration, ImageIndex, ImageManifest};

use crate::config::EngineConfig;

/// Annotation carrying the tag a manifest was stored under in the layout.
const REF_NAME_ANNOTATION: &str = "org.opencontainers.image.ref.name";

#[derive(Debug, thiserror::Error)]
pub enum UnpackError {
    #[error("failed to execute {command:?}")]
    Spawn {
        command: PathBuf,
        source: std::io::Error,
    },
    #[error("unpacker exited with {status}: {stderr}")]
    UnpackerFailed { status: i32, stderr: String },
    #[error("failed to read OCI layout at {path:?}")]
    Layout {
        path: PathBuf,
        source: oci_spec::OciSpecError,
    },
    #[error("no manifest for tag {tag:?} in OCI layout {path:?}")]
    NoManifest { tag: String, path: PathBuf },
    #[error("unexpected digest format {digest:?} in OCI layout")]
    MalformedDigest { digest: String },
}

type Result<T> = std::result::Result<T, UnpackError>;

/// What the unpacker hands to the packer and the store.
#[derive(Debug)]
pub struct UnpackedImage {
    /// Root filesystem produced by the unpacker.
    pub rootfs: PathBuf,
    /// sha256 hex of the image configuration, the image id.
    pub config_digest: String,
    pub configuration: ImageConfiguration,
}

pub struct Unpacker<'a> {
    config: &'a EngineConfig,
}

impl<'a> Unpacker<'a> {
    pub fn new(config: &'a EngineConfig) -> Self {
        Unpacker { config }
    }

    /// Unpacks `<layout_dir>:<tag>` into `target_dir` and returns the rootfs
    /// location along with the image configuration read from the layout.
    pub fn unpack(&self, layout_dir: &Path, tag: &str, target_dir: &Path) -> Result<UnpackedImage> {
        tracing::info!(layout = %layout_dir.display(), tag, "unpacking image");

        let args = build_unpack_args(layout_dir, tag, target_dir, !geteuid().is_root());
        let output = Command::new(&self.config.umoci_path)
            .args(&args)
            .output()
            .map_err(|err| UnpackError::Spawn {
                command: self.config.umoci_path.clone(),
                source: err,
            })?;
        if !output.status.success() {
            return Err(UnpackError::UnpackerFailed {
                status: output.status.code().unwrap_or(-1),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        let (config_digest, configuration) = read_image_configuration(layout_dir, tag)?;
        tracing::info!(id = %config_digest, "unpack complete");

        Ok(UnpackedImage {
            rootfs: target_dir.join("rootfs"),
            config_digest,
            configuration,
        })
    }
}

fn build_unpack_args(
    layout_dir: &Path,
    tag: &str,
    target_dir: &Path,
    rootless: bool,
) -> Vec<String> {
    let mut args = vec!["unpack".to_string()];
    if rootless {
        args.push("--rootless".to_string());
    }
    args.push("--image".to_string());
    args.push(format!("{}:{}", layout_dir.display(), tag));
    args.push(target_dir.display().to_string());
    args
}

/// Walks layout index -> manifest -> configuration and returns the
/// configuration digest (hex only) with the parsed configuration.
fn read_image_configuration(
    layout_dir: &Path,
    tag: &str,
) -> Result<(String, ImageConfiguration)> {
    let index_path = layout_dir.join("index.json");
    let index = ImageIndex::from_file(&index_path).map_err(|err| UnpackError::Layout {
        path: index_path.clone(),
        source: err,
    })?;

    let manifest_descriptor = index
        .manifests()
        .iter()
        .find(|descriptor| {
            descriptor
                .annotations()
                .as_ref()
                .and_then(|annotations| annotations.get(REF_NAME_ANNOTATION))
                .is_some_and(|name| name.as_str() == tag)
        })
        .or_else(|| index.manifests().first())
        .ok_or_else(|| UnpackError::NoManifest {
            tag: tag.to_string(),
            path: layout_dir.to_path_buf(),
        })?;

    let manifest_path = blob_path(layout_dir, manifest_descriptor.digest())?;
    let manifest = ImageManifest::from_file(&manifest_path).map_err(|err| UnpackError::Layout {
        path: manifest_path,
        source: err,
    })?;

    let config_hex = digest_hex(manifest.config().digest())?;
    let config_path = blob_path(layout_dir, manifest.config().digest())?;
    let configuration =
        ImageConfiguration::from_file(&config_path).map_err(|err| UnpackError::Layout {
            path: config_path,
            source: err,
        })?;

    Ok((config_hex, configuration))
}

fn blob_path(layout_dir: &Path, digest: &str) -> Result<PathBuf> {
    let hex = digest_hex(digest)?;
    Ok(layout_dir.join("blobs").join("sha256").join(hex))
}

fn digest_hex(digest: &str) -> Result<String> {
    match digest.split_once(':') {
        Some(("sha256", hex)) if hex.len() == 64 => Ok(hex.to_string()),
        _ => Err(UnpackError::MalformedDigest {
            digest: digest.to_string(),
        }),
    }
}
