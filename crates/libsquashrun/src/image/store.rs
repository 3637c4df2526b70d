//! Registers, lists, resolves and removes images in a repository.
//!
//! Every mutation runs under the repository index lock and ends with an
//! atomic index write, keeping the invariant that a squashfs file, its
//! metadata sidecar and its index entry appear and disappear together.

use std::fs;
use std::path::PathBuf;

use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::image::metadata::{ImageMetadata, MetadataError};
use crate::reference::ImageReference;
use crate::repository::{Repository, RepositoryError};
use crate::utils::{self, FsError};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error(transparent)]
    Repository(#[from] RepositoryError),
    #[error(transparent)]
    Fs(#[from] FsError),
    #[error(transparent)]
    Metadata(#[from] MetadataError),
    #[error("image {reference} is not in the repository")]
    NotFound { reference: String },
}

type Result<T> = std::result::Result<T, StoreError>;

/// One repository record, serialized into `index.json`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredImage {
    pub reference: ImageReference,
    /// sha256 hex of the OCI image configuration.
    pub id: String,
    /// Squashfs file size rendered for display.
    pub datasize: String,
    /// UTC registration time, e.g. "2024-03-08T14:05:31".
    pub created: String,
    pub image_file: PathBuf,
    pub metadata_file: PathBuf,
}

pub struct ImageStore<'a> {
    repository: &'a Repository,
}

impl<'a> ImageStore<'a> {
    pub fn new(repository: &'a Repository) -> Self {
        ImageStore { repository }
    }

    /// Installs a packed image: moves the squashfs into place, writes the
    /// metadata sidecar, and replaces any previous record for the same key.
    pub fn store(
        &self,
        reference: &ImageReference,
        squashfs: &std::path::Path,
        metadata: &ImageMetadata,
        id: String,
    ) -> Result<StoredImage> {
        let _lock = self.repository.lock_index()?;

        let image_file = self.repository.image_file(reference);
        let metadata_file = self.repository.metadata_file(reference);
        utils::move_file(squashfs, &image_file)?;
        metadata.save(&metadata_file)?;

        let image = StoredImage {
            reference: reference.clone(),
            id,
            datasize: utils::format_size(utils::file_size(&image_file)?),
            created: Utc::now().format("%Y-%m-%dT%H:%M:%S").to_string(),
            image_file,
            metadata_file,
        };

        let key = reference.key();
        let mut index = self.repository.read_index()?;
        index.retain(|entry| entry.reference.key() != key);
        index.push(image.clone());
        self.repository.write_index(&index)?;

        tracing::info!(reference = %reference, id = %image.id, "image registered");
        Ok(image)
    }

    pub fn list(&self) -> Result<Vec<StoredImage>> {
        Ok(self.repository.read_index()?)
    }

    /// Resolves by exact key first; when the query has no digest, a record
    /// matching server, namespace, name and tag also satisfies it.
    pub fn lookup(&self, reference: &ImageReference) -> Result<Option<StoredImage>> {
        let index = self.repository.read_index()?;
        let key = reference.key();
        if let Some(image) = index.iter().find(|entry| entry.reference.key() == key) {
            return Ok(Some(image.clone()));
        }
        if reference.digest.is_none() {
            return Ok(index
                .iter()
                .find(|entry| entry.reference.same_repository_and_tag(reference))
                .cloned());
        }
        Ok(None)
    }

    /// Unlinks both artifacts and drops the index entry. Artifacts that are
    /// already gone are tolerated; a reference with no index entry is not.
    pub fn remove(&self, reference: &ImageReference) -> Result<()> {
        let _lock = self.repository.lock_index()?;

        let mut index = self.repository.read_index()?;
        let key = reference.key();
        let position = index
            .iter()
            .position(|entry| entry.reference.key() == key)
            .or_else(|| {
                if reference.digest.is_none() {
                    index
                        .iter()
                        .position(|entry| entry.reference.same_repository_and_tag(reference))
                } else {
                    None
                }
            })
            .ok_or_else(|| StoreError::NotFound {
                reference: reference.to_string(),
            })?;

        let removed = index.remove(position);
        for artifact in [&removed.image_file, &removed.metadata_file] {
            match fs::remove_file(artifact) {
                Ok(()) => {}
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                    tracing::warn!(artifact = %artifact.display(), "artifact already missing");
                }
                Err(err) => {
                    tracing::warn!(artifact = %artifact.display(), error = %err,
                        "failed to remove artifact");
                }
            }
        }
        self.repository.write_index(&index)?;

        tracing::info!(reference = %reference, "image removed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result;
    use std::path::Path;

    fn stage_squashfs(dir: &Path, payload: &[u8]) -> PathBuf {
        let staged = dir.join("staged.squashfs");
        fs::write(&staged, payload).unwrap();
        staged
    }

    fn store_test_image(
        store: &ImageStore<'_>,
        scratch: &Path,
        reference: &ImageReference,
    ) -> Result<StoredImage> {
        let staged = stage_squashfs(scratch, b"squashfs-payload");
        let metadata = ImageMetadata {
            cmd: Some(vec!["sh".to_string()]),
            ..Default::default()
        };
        Ok(store.store(reference, &staged, &metadata, "a".repeat(64))?)
    }

    #[test]
    fn test_store_then_lookup() -> Result<()> {
        let (tmp, repository) = crate::repository::tests::test_repository();
        let store = ImageStore::new(&repository);
        let reference = ImageReference::parse("server.com/ns/image:tag")?;

        let stored = store_test_image(&store, tmp.path(), &reference)?;
        assert!(stored.image_file.is_file());
        assert!(stored.metadata_file.is_file());
        assert_eq!(stored.datasize, "16B");
        assert_eq!(stored.id, "a".repeat(64));

        let found = store.lookup(&reference)?.expect("image should resolve");
        assert_eq!(found, stored);
        assert_eq!(store.list()?, vec![stored]);
        Ok(())
    }

    #[test]
    fn test_store_replaces_previous_record_for_same_key() -> Result<()> {
        let (tmp, repository) = crate::repository::tests::test_repository();
        let store = ImageStore::new(&repository);
        let reference = ImageReference::parse("image:tag")?;

        store_test_image(&store, tmp.path(), &reference)?;
        let staged = stage_squashfs(tmp.path(), b"updated");
        let updated = store.store(&reference, &staged, &ImageMetadata::default(), "b".repeat(64))?;

        let index = store.list()?;
        assert_eq!(index.len(), 1);
        assert_eq!(index[0], updated);
        Ok(())
    }

    #[test]
    fn test_lookup_without_digest_matches_tagged_record() -> Result<()> {
        let (tmp, repository) = crate::repository::tests::test_repository();
        let store = ImageStore::new(&repository);
        let digest = format!("sha256:{}", "c".repeat(64));
        let pinned = ImageReference::parse(&format!("image:tag@{digest}"))?;

        store_test_image(&store, tmp.path(), &pinned)?;

        let by_tag = ImageReference::parse("image:tag")?;
        assert!(store.lookup(&by_tag)?.is_some());

        let other_digest = format!("sha256:{}", "d".repeat(64));
        let wrong_pin = ImageReference::parse(&format!("image:tag@{other_digest}"))?;
        assert!(store.lookup(&wrong_pin)?.is_none());
        Ok(())
    }

    #[test]
    fn test_remove_leaves_no_orphans() -> Result<()> {
        let (tmp, repository) = crate::repository::tests::test_repository();
        let store = ImageStore::new(&repository);
        let reference = ImageReference::parse("image:tag")?;

        let stored = store_test_image(&store, tmp.path(), &reference)?;
        store.remove(&reference)?;

        assert!(store.lookup(&reference)?.is_none());
        assert!(!stored.image_file.exists());
        assert!(!stored.metadata_file.exists());
        Ok(())
    }

    #[test]
    fn test_remove_tolerates_missing_artifacts() -> Result<()> {
        let (tmp, repository) = crate::repository::tests::test_repository();
        let store = ImageStore::new(&repository);
        let reference = ImageReference::parse("image:tag")?;

        let stored = store_test_image(&store, tmp.path(), &reference)?;
        fs::remove_file(&stored.image_file)?;
        store.remove(&reference)?;
        assert!(store.list()?.is_empty());
        Ok(())
    }

    #[test]
    fn test_remove_unknown_reference_fails() -> Result<()> {
        let (_tmp, repository) = crate::repository::tests::test_repository();
        let store = ImageStore::new(&repository);
        let reference = ImageReference::parse("image:tag")?;
        assert!(matches!(
            store.remove(&reference),
            Err(StoreError::NotFound { .. })
        ));
        Ok(())
    }
}
