//! On-disk repository layout and index I/O.
//!
//! A repository holds one squashfs file and one metadata sidecar per image
//! key, plus a JSON index describing all of them:
//!
//! ```text
//! <root>/images/<key>.squashfs
//! <root>/images/<key>.meta
//! <root>/images/index.json
//! <root>/cache/ociImages/      layout targets for the copier
//! <root>/cache/blobs/          blob store shared across pulls
//! ```
//!
//! Index mutations happen under an advisory whole-file lock and are written
//! atomically (sibling temp file, fsync, rename), so concurrent invocations
//! on the same host never observe a torn index. Readers do not take the lock.

use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use fs2::FileExt;
use nix::unistd::{Gid, Uid};

use crate::config::EngineConfig;
use crate::image::store::StoredImage;
use crate::invocation::UserIdentity;
use crate::reference::ImageReference;
use crate::utils::{self, FsError};

const INDEX_FILE: &str = "index.json";
const LOCK_FILE: &str = "index.lock";
const LOCAL_REPOSITORY_DIR: &str = ".squashrun";

#[derive(Debug, thiserror::Error)]
pub enum RepositoryError {
    #[error("cannot determine the local repository: HOME is not set")]
    NoHome,
    #[error("centralized repository is not configured")]
    NoCentralizedRepository,
    #[error("centralized repository {path:?} does not exist")]
    MissingCentralizedRepository { path: PathBuf },
    #[error("invalid temporary directory {path:?}")]
    InvalidTempDir { path: PathBuf },
    #[error(transparent)]
    Fs(#[from] FsError),
    #[error("failed to lock repository index {path:?}")]
    Lock {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to read repository index {path:?}")]
    ReadIndex {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to write repository index {path:?}")]
    WriteIndex {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to create scratch directory under {path:?}")]
    Scratch {
        path: PathBuf,
        source: std::io::Error,
    },
}

type Result<T> = std::result::Result<T, RepositoryError>;

#[derive(Debug, Clone)]
pub struct Repository {
    root: PathBuf,
    temp_dir: PathBuf,
}

impl Repository {
    /// Opens (creating if needed) the invoking user's repository, owned by
    /// that user.
    pub fn open_local(config: &EngineConfig, identity: &UserIdentity) -> Result<Self> {
        let root = match &config.local_repository_base_dir {
            Some(base) => base.join(identity.uid.to_string()).join(LOCAL_REPOSITORY_DIR),
            None => std::env::var_os("HOME")
                .map(PathBuf::from)
                .ok_or(RepositoryError::NoHome)?
                .join(LOCAL_REPOSITORY_DIR),
        };
        let repository = Repository {
            root,
            temp_dir: config.temp_dir.clone(),
        };
        repository.ensure_directories(identity.uid, identity.gid)?;
        Ok(repository)
    }

    /// Opens the site-wide repository. Only a privileged invocation may
    /// create it; everyone else requires it to exist already.
    pub fn open_centralized(config: &EngineConfig, identity: &UserIdentity) -> Result<Self> {
        let root = config
            .centralized_repository_dir
            .clone()
            .ok_or(RepositoryError::NoCentralizedRepository)?;
        let repository = Repository {
            root: root.clone(),
            temp_dir: config.temp_dir.clone(),
        };
        if identity.uid.is_root() {
            repository.ensure_directories(identity.uid, identity.gid)?;
        } else if !root.is_dir() {
            return Err(RepositoryError::MissingCentralizedRepository { path: root });
        }
        Ok(repository)
    }

    /// Opens a repository rooted at an arbitrary directory. Used by tests.
    pub fn open_at(root: impl Into<PathBuf>, temp_dir: impl Into<PathBuf>) -> Result<Self> {
        let repository = Repository {
            root: root.into(),
            temp_dir: temp_dir.into(),
        };
        let identity = UserIdentity::from_process();
        repository.ensure_directories(identity.uid, identity.gid)?;
        Ok(repository)
    }

    fn ensure_directories(&self, uid: Uid, gid: Gid) -> Result<()> {
        for dir in [
            self.images_dir(),
            self.oci_image_cache(),
            self.blob_cache(),
        ] {
            utils::create_dir_all_owned(&dir, uid, gid)?;
        }
        if !self.temp_dir.is_dir() {
            return Err(RepositoryError::InvalidTempDir {
                path: self.temp_dir.clone(),
            });
        }
        Ok(())
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn images_dir(&self) -> PathBuf {
        self.root.join("images")
    }

    pub fn oci_image_cache(&self) -> PathBuf {
        self.root.join("cache").join("ociImages")
    }

    pub fn blob_cache(&self) -> PathBuf {
        self.root.join("cache").join("blobs")
    }

    pub fn image_file(&self, reference: &ImageReference) -> PathBuf {
        self.images_dir().join(format!("{}.squashfs", reference.key()))
    }

    pub fn metadata_file(&self, reference: &ImageReference) -> PathBuf {
        self.images_dir().join(format!("{}.meta", reference.key()))
    }

    pub fn index_file(&self) -> PathBuf {
        self.images_dir().join(INDEX_FILE)
    }

    /// A fresh scratch directory for one pull, removed on drop.
    pub fn scratch_dir(&self) -> Result<tempfile::TempDir> {
        tempfile::Builder::new()
            .prefix("squashrun-pull-")
            .tempdir_in(&self.temp_dir)
            .map_err(|err| RepositoryError::Scratch {
                path: self.temp_dir.clone(),
                source: err,
            })
    }

    /// Takes the advisory exclusive lock serializing index mutations.
    pub fn lock_index(&self) -> Result<IndexLock> {
        let path = self.images_dir().join(LOCK_FILE);
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&path)
            .map_err(|err| RepositoryError::Lock {
                path: path.clone(),
                source: err,
            })?;
        file.lock_exclusive()
            .map_err(|err| RepositoryError::Lock {
                path: path.clone(),
                source: err,
            })?;
        Ok(IndexLock { file })
    }

    /// Reads the index. A missing file is an empty repository; a corrupt
    /// file is reported and treated as empty rather than blocking the user.
    pub fn read_index(&self) -> Result<Vec<StoredImage>> {
        let path = self.index_file();
        let contents = match fs::read(&path) {
            Ok(contents) => contents,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(RepositoryError::ReadIndex { path, source: err }),
        };
        match serde_json::from_slice(&contents) {
            Ok(index) => Ok(index),
            Err(err) => {
                tracing::warn!(index = %path.display(), error = %err,
                    "repository index is corrupt, treating as empty");
                Ok(Vec::new())
            }
        }
    }

    /// Replaces the index atomically: the new content lands in a sibling
    /// temp file which is fsynced and renamed over `index.json`.
    pub fn write_index(&self, images: &[StoredImage]) -> Result<()> {
        let path = self.index_file();
        let mut temp = tempfile::Builder::new()
            .prefix(".index-")
            .tempfile_in(self.images_dir())
            .map_err(|err| RepositoryError::WriteIndex {
                path: path.clone(),
                source: err,
            })?;
        let rendered = serde_json::to_vec_pretty(images).map_err(|err| {
            RepositoryError::WriteIndex {
                path: path.clone(),
                source: err.into(),
            }
        })?;
        temp.write_all(&rendered)
            .and_then(|()| temp.as_file().sync_all())
            .map_err(|err| RepositoryError::WriteIndex {
                path: path.clone(),
                source: err,
            })?;
        temp.persist(&path)
            .map_err(|err| RepositoryError::WriteIndex {
                path: path.clone(),
                source: err.error,
            })?;
        Ok(())
    }
}

/// Held for the duration of any index+artifact mutation. Unlocks on drop.
pub struct IndexLock {
    file: File,
}

impl Drop for IndexLock {
    fn drop(&mut self) {
        if let Err(err) = self.file.unlock() {
            tracing::warn!(error = %err, "failed to unlock repository index");
        }
    }
}
