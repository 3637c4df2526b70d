//! Engine configuration, loaded from `squashrun.json` at the installation
//! prefix. Shape errors are rejected at load time; the semantic checks the
//! engine relies on (ram filesystem type, absolute tool paths) run in
//! [`EngineConfig::validate`].

use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

pub const DEFAULT_CONFIG_FILE: &str = "/etc/squashrun/squashrun.json";

/// Filesystem types accepted for the bundle and /dev mounts.
const RAM_FILESYSTEM_TYPES: [&str; 2] = ["tmpfs", "ramfs"];

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to open config file {path:?}")]
    Open {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse config file {path:?}")]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },
    #[error("invalid ramFilesystemType {value:?}, expected one of {RAM_FILESYSTEM_TYPES:?}")]
    InvalidRamFilesystemType { value: String },
    #[error("configured path for {field} must be absolute, got {path:?}")]
    RelativePath { field: &'static str, path: PathBuf },
}

type Result<T> = std::result::Result<T, ConfigError>;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct EngineConfig {
    /// Installation prefix holding the stock /etc files copied into every
    /// container and the static init binary.
    pub prefix_dir: PathBuf,
    pub skopeo_path: PathBuf,
    pub umoci_path: PathBuf,
    pub mksquashfs_path: PathBuf,
    pub runc_path: PathBuf,
    pub init_path: PathBuf,
    /// Base directory for per-user repositories; each user gets
    /// `<base>/<user>` or, when unset, `$HOME/.squashrun`.
    #[serde(default)]
    pub local_repository_base_dir: Option<PathBuf>,
    #[serde(default)]
    pub centralized_repository_dir: Option<PathBuf>,
    #[serde(default = "default_temp_dir")]
    pub temp_dir: PathBuf,
    #[serde(default = "default_ram_filesystem_type")]
    pub ram_filesystem_type: String,
    /// Extra flags for the squashfs packer, whitespace-split. Absent means
    /// no extra flags. The stock config file ships
    /// "-comp gzip -Xcompression-level 6".
    #[serde(default)]
    pub mksquashfs_options: Option<String>,
    /// Administrator-defined mounts applied to every container, in the same
    /// syntax as the CLI `--mount` option.
    #[serde(default)]
    pub site_mounts: Vec<String>,
    /// Administrator-defined devices, in the same syntax as `--device`.
    #[serde(default)]
    pub site_devices: Vec<String>,
    #[serde(default)]
    pub enable_pmix_support: bool,
    /// OCI hooks block copied into every bundle config, with the per-run
    /// hooks environment injected.
    #[serde(default)]
    pub oci_hooks: Option<serde_json::Value>,
}

fn default_temp_dir() -> PathBuf {
    PathBuf::from("/tmp")
}

fn default_ram_filesystem_type() -> String {
    "tmpfs".to_string()
}

impl EngineConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let file = File::open(path).map_err(|err| ConfigError::Open {
            path: path.to_path_buf(),
            source: err,
        })?;
        let config: EngineConfig =
            serde_json::from_reader(BufReader::new(file)).map_err(|err| ConfigError::Parse {
                path: path.to_path_buf(),
                source: err,
            })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if !RAM_FILESYSTEM_TYPES.contains(&self.ram_filesystem_type.as_str()) {
            return Err(ConfigError::InvalidRamFilesystemType {
                value: self.ram_filesystem_type.clone(),
            });
        }
        for (field, path) in [
            ("prefixDir", &self.prefix_dir),
            ("skopeoPath", &self.skopeo_path),
            ("umociPath", &self.umoci_path),
            ("mksquashfsPath", &self.mksquashfs_path),
            ("runcPath", &self.runc_path),
            ("initPath", &self.init_path),
        ] {
            if path.is_relative() {
                return Err(ConfigError::RelativePath {
                    field,
                    path: path.clone(),
                });
            }
        }
        Ok(())
    }
}

/// A minimal valid configuration for unit tests across the crate.
#[cfg(test)]
pub(crate) fn test_config() -> EngineConfig {
    serde_json::from_value(serde_json::json!({
        "prefixDir": "/opt/squashrun",
        "skopeoPath": "/usr/bin/skopeo",
        "umociPath": "/usr/bin/umoci",
        "mksquashfsPath": "/usr/bin/mksquashfs",
        "runcPath": "/usr/bin/runc",
        "initPath": "/opt/squashrun/bin/init",
    }))
    .unwrap()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn minimal_config_json() -> serde_json::Value {
        serde_json::json!({
            "prefixDir": "/opt/squashrun",
            "skopeoPath": "/usr/bin/skopeo",
            "umociPath": "/usr/bin/umoci",
            "mksquashfsPath": "/usr/bin/mksquashfs",
            "runcPath": "/usr/bin/runc",
            "initPath": "/opt/squashrun/bin/init",
        })
    }

    #[test]
    fn test_load_minimal() -> anyhow::Result<()> {
        let mut file = tempfile::NamedTempFile::new()?;
        write!(file, "{}", minimal_config_json())?;
        let config = EngineConfig::load(file.path())?;
        assert_eq!(config.temp_dir, PathBuf::from("/tmp"));
        assert_eq!(config.ram_filesystem_type, "tmpfs");
        assert_eq!(config.mksquashfs_options, None);
        assert!(config.site_mounts.is_empty());
        Ok(())
    }

    #[test]
    fn test_unknown_field_rejected() -> anyhow::Result<()> {
        let mut value = minimal_config_json();
        value["noSuchOption"] = serde_json::json!(true);
        let mut file = tempfile::NamedTempFile::new()?;
        write!(file, "{value}")?;
        assert!(matches!(
            EngineConfig::load(file.path()),
            Err(ConfigError::Parse { .. })
        ));
        Ok(())
    }

    #[test]
    fn test_invalid_ram_filesystem_type() {
        let mut config = test_config();
        config.ram_filesystem_type = "ext4".to_string();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidRamFilesystemType { .. })
        ));
    }

    #[test]
    fn test_relative_tool_path_rejected() {
        let mut config = test_config();
        config.runc_path = PathBuf::from("runc");
        assert!(matches!(
            config.validate(),
            Err(ConfigError::RelativePath { field: "runcPath", .. })
        ));
    }
}
