//! Image metadata extracted from the OCI image configuration and stored as a
//! JSON sidecar next to the squashfs file.

use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::{Path, PathBuf};

use oci_spec::image::ImageConfiguration;
use serde::{Deserialize, Serialize};

use crate::utils::split_env_var;

#[derive(Debug, thiserror::Error)]
pub enum MetadataError {
    #[error("failed to open metadata file {path:?}")]
    Open {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse metadata file {path:?}")]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },
    #[error("failed to write metadata file {path:?}")]
    Write {
        path: PathBuf,
        source: serde_json::Error,
    },
}

type Result<T> = std::result::Result<T, MetadataError>;

/// The slice of the image configuration the launch path needs.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageMetadata {
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub cmd: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub entry: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub workdir: Option<PathBuf>,
    /// Environment in image order, deduplicated by key (last wins).
    #[serde(default)]
    pub env: Vec<(String, String)>,
}

impl ImageMetadata {
    pub fn from_image_configuration(configuration: &ImageConfiguration) -> Self {
        let Some(config) = configuration.config() else {
            return ImageMetadata::default();
        };

        let mut env: Vec<(String, String)> = Vec::new();
        for var in config.env().iter().flatten() {
            let Some((key, value)) = split_env_var(var) else {
                continue;
            };
            match env.iter_mut().find(|(k, _)| *k == key) {
                Some(entry) => entry.1 = value,
                None => env.push((key, value)),
            }
        }

        ImageMetadata {
            cmd: config.cmd().clone(),
            entry: config.entrypoint().clone(),
            workdir: config
                .working_dir()
                .as_ref()
                .filter(|dir| !dir.is_empty())
                .map(PathBuf::from),
            env,
        }
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let file = File::open(path).map_err(|err| MetadataError::Open {
            path: path.to_path_buf(),
            source: err,
        })?;
        serde_json::from_reader(BufReader::new(file)).map_err(|err| MetadataError::Parse {
            path: path.to_path_buf(),
            source: err,
        })
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let file = File::create(path).map_err(|err| MetadataError::Open {
            path: path.to_path_buf(),
            source: err,
        })?;
        serde_json::to_writer_pretty(BufWriter::new(file), self).map_err(|err| {
            MetadataError::Write {
                path: path.to_path_buf(),
                source: err,
            }
        })
    }

    pub fn env_value(&self, key: &str) -> Option<&str> {
        self.env
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }
}
