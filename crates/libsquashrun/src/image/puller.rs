//! Downloads an image from a registry into a local OCI layout by driving the
//! external copier (skopeo).

use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;

use crate::config::EngineConfig;
use crate::reference::ImageReference;

const MAX_ATTEMPTS: u32 = 3;

/// stderr fragments that identify a retryable network problem.
const TRANSIENT_PATTERNS: [&str; 6] = [
    "timeout",
    "timed out",
    "connection refused",
    "connection reset",
    "temporary failure",
    "TLS handshake",
];

/// stderr fragments that identify an authentication problem; retrying these
/// would only lock the account out faster.
const AUTH_PATTERNS: [&str; 3] = ["unauthorized", "authentication required", "invalid username"];

#[derive(Debug, thiserror::Error)]
pub enum PullError {
    #[error("failed to execute {command:?}")]
    Spawn {
        command: PathBuf,
        source: std::io::Error,
    },
    #[error("authentication failed pulling {reference}: {stderr}")]
    AuthenticationFailed { reference: String, stderr: String },
    #[error("pulling {reference} failed after {attempts} attempts: {stderr}")]
    RetriesExhausted {
        reference: String,
        attempts: u32,
        stderr: String,
    },
    #[error("copier exited with {status} pulling {reference}: {stderr}")]
    CopierFailed {
        reference: String,
        status: i32,
        stderr: String,
    },
    #[error("failed to link shared blob store at {path:?}")]
    BlobLink {
        path: PathBuf,
        source: std::io::Error,
    },
}

type Result<T> = std::result::Result<T, PullError>;

pub struct Puller<'a> {
    config: &'a EngineConfig,
    blob_cache: &'a Path,
}

impl<'a> Puller<'a> {
    pub fn new(config: &'a EngineConfig, blob_cache: &'a Path) -> Self {
        Puller { config, blob_cache }
    }

    /// Copies the image into `layout_dir` as an OCI layout tagged with
    /// [`ImageReference::layout_tag`]. Transient network failures are retried
    /// with exponential backoff.
    pub fn pull(&self, reference: &ImageReference, layout_dir: &Path) -> Result<()> {
        let args = build_copy_args(self.blob_cache, reference, layout_dir);

        let mut attempt = 0;
        loop {
            attempt += 1;
            tracing::info!(reference = %reference, attempt, "pulling image");

            let output = Command::new(&self.config.skopeo_path)
                .args(&args)
                .output()
                .map_err(|err| PullError::Spawn {
                    command: self.config.skopeo_path.clone(),
                    source: err,
                })?;

            if output.status.success() {
                self.link_shared_blobs(layout_dir)?;
                tracing::info!(reference = %reference, "pull complete");
                return Ok(());
            }

            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            let lowered = stderr.to_lowercase();

            if AUTH_PATTERNS.iter().any(|p| lowered.contains(p)) {
                return Err(PullError::AuthenticationFailed {
                    reference: reference.to_string(),
                    stderr,
                });
            }

            let transient = TRANSIENT_PATTERNS
                .iter()
                .any(|p| lowered.contains(&p.to_lowercase()));
            if !transient {
                return Err(PullError::CopierFailed {
                    reference: reference.to_string(),
                    status: output.status.code().unwrap_or(-1),
                    stderr,
                });
            }
            if attempt >= MAX_ATTEMPTS {
                return Err(PullError::RetriesExhausted {
                    reference: reference.to_string(),
                    attempts: attempt,
                    stderr,
                });
            }

            let backoff = Duration::from_secs(1 << (attempt - 1));
            tracing::warn!(reference = %reference, error = %stderr, ?backoff,
                "transient pull failure, retrying");
            std::thread::sleep(backoff);
        }
    }

    /// The copier leaves blob payloads in the shared cache; the layout needs
    /// a `blobs/sha256` link pointing there so the unpacker can resolve them.
    fn link_shared_blobs(&self, layout_dir: &Path) -> Result<()> {
        let target = layout_dir.join("blobs").join("sha256");
        if target.exists() {
            return Ok(());
        }
        std::fs::create_dir_all(layout_dir.join("blobs"))
            .and_then(|()| std::os::unix::fs::symlink(self.blob_cache.join("sha256"), &target))
            .map_err(|err| PullError::BlobLink {
                path: target,
                source: err,
            })
    }
}

impl ImageReference {
    /// The source URL handed to the copier. A digest pins the exact
    /// manifest; otherwise the tag selects it.
    pub fn pull_source(&self) -> String {
        match &self.digest {
            Some(digest) => format!(
                "docker://{}/{}/{}@{}",
                self.server, self.namespace, self.name, digest
            ),
            None => format!(
                "docker://{}/{}/{}:{}",
                self.server,
                self.namespace,
                self.name,
                self.tag.as_deref().unwrap_or(crate::reference::DEFAULT_TAG)
            ),
        }
    }

    /// The tag naming the image inside its OCI layout directory.
    pub fn layout_tag(&self) -> &str {
        self.tag.as_deref().unwrap_or(crate::reference::DEFAULT_TAG)
    }
}

fn build_copy_args(blob_cache: &Path, reference: &ImageReference, layout_dir: &Path) -> Vec<String> {
    vec![
        "copy".to_string(),
        "--dest-shared-blob-dir".to_string(),
        blob_cache.display().to_string(),
        reference.pull_source(),
        format!("oci:{}:{}", layout_dir.display(), reference.layout_tag()),
    ]
}
