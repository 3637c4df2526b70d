//! Merges image metadata with invocation data into the values injected into
//! the bundle configuration: command, environment, working directory and the
//! hooks block.

use std::collections::HashMap;
use std::path::PathBuf;

use crate::image::metadata::ImageMetadata;
use crate::invocation::Invocation;

const CUDA_VISIBLE_DEVICES: &str = "CUDA_VISIBLE_DEVICES";
const NVIDIA_VISIBLE_DEVICES: &str = "NVIDIA_VISIBLE_DEVICES";
const NVIDIA_DRIVER_CAPABILITIES: &str = "NVIDIA_DRIVER_CAPABILITIES";
/// Value some workload managers assign when no GPU was allocated.
const NO_DEV_FILES: &str = "NoDevFiles";

#[derive(Debug, thiserror::Error)]
pub enum MergeError {
    #[error("no command to execute: neither the command line nor the image provide one")]
    NoCommand,
}

type Result<T> = std::result::Result<T, MergeError>;

pub struct ConfigsMerger<'a> {
    metadata: &'a ImageMetadata,
    invocation: &'a Invocation,
}

impl<'a> ConfigsMerger<'a> {
    pub fn new(metadata: &'a ImageMetadata, invocation: &'a Invocation) -> Self {
        ConfigsMerger {
            metadata,
            invocation,
        }
    }

    /// Resolves the container argv. A command-line entrypoint discards both
    /// the image entrypoint and the image cmd; a command-line command
    /// replaces the image cmd but keeps the image entrypoint.
    pub fn command_to_execute(&self) -> Result<Vec<String>> {
        let cli_entry = self.invocation.entrypoint.as_deref();
        let cli_cmd = (!self.invocation.exec_args.is_empty())
            .then_some(self.invocation.exec_args.as_slice());
        let image_entry = self.metadata.entry.as_deref();
        let image_cmd = self.metadata.cmd.as_deref();

        let argv: Vec<String> = match (cli_entry, cli_cmd) {
            (Some(entry), Some(cmd)) => entry.iter().chain(cmd).cloned().collect(),
            (Some(entry), None) => entry.to_vec(),
            (None, Some(cmd)) => image_entry
                .unwrap_or_default()
                .iter()
                .chain(cmd)
                .cloned()
                .collect(),
            (None, None) => match (image_entry, image_cmd) {
                (Some(entry), cmd) => {
                    entry.iter().chain(cmd.unwrap_or_default()).cloned().collect()
                }
                (None, Some(cmd)) => cmd.to_vec(),
                (None, None) => return Err(MergeError::NoCommand),
            },
        };
        Ok(argv)
    }

    /// Builds the container environment: the host snapshot is the base, the
    /// image wins on collisions, then hook toggles and the Nvidia device
    /// remapping are applied.
    pub fn environment(&self) -> HashMap<String, String> {
        let mut env = self.invocation.host_environment.clone();
        for (key, value) in &self.metadata.env {
            env.insert(key.clone(), value.clone());
        }

        if self.invocation.use_mpi {
            env.insert("SQUASHRUN_MPI_HOOK".to_string(), "1".to_string());
        }
        if self.invocation.enable_ssh {
            env.insert("SQUASHRUN_SSH_HOOK".to_string(), "1".to_string());
            env.insert(
                "SQUASHRUN_SLURM_GLOBAL_SYNC_HOOK".to_string(),
                "1".to_string(),
            );
        }
        if self.invocation.enable_pmix {
            env.insert("SQUASHRUN_PMIX_HOOK".to_string(), "1".to_string());
        }

        self.apply_nvidia_environment(&mut env);
        env
    }

    /// The working directory: the command-line override wins, then the image
    /// workdir, then `/`.
    pub fn working_directory(&self) -> PathBuf {
        self.invocation
            .workdir_override
            .clone()
            .or_else(|| self.metadata.workdir.clone())
            .unwrap_or_else(|| PathBuf::from("/"))
    }

    /// Returns the configured hooks block with the per-run hooks environment
    /// appended to every hook that declares an `env` array. All other hook
    /// fields pass through untouched.
    pub fn hooks(&self, configured: Option<&serde_json::Value>) -> Option<serde_json::Value> {
        let mut hooks = configured?.clone();
        if self.invocation.hooks_environment.is_empty() {
            return Some(hooks);
        }

        if let Some(by_kind) = hooks.as_object_mut() {
            for entries in by_kind.values_mut() {
                let Some(entries) = entries.as_array_mut() else {
                    continue;
                };
                for hook in entries {
                    let Some(env) = hook.get_mut("env").and_then(|e| e.as_array_mut()) else {
                        continue;
                    };
                    for (key, value) in &self.invocation.hooks_environment {
                        env.push(serde_json::Value::String(format!("{key}={value}")));
                    }
                }
            }
        }
        Some(hooks)
    }

    /// GPU visibility: when the image advertises `NVIDIA_VISIBLE_DEVICES`,
    /// the host's `CUDA_VISIBLE_DEVICES` selection is remapped to the
    /// positional indices the devices will have inside the container. In
    /// every other case (no GPU image, no allocation, `NoDevFiles`) all
    /// Nvidia variables are erased so the container never sees stale host
    /// device numbering.
    fn apply_nvidia_environment(&self, env: &mut HashMap<String, String>) {
        let image_advertises_gpus = self.metadata.env_value(NVIDIA_VISIBLE_DEVICES).is_some();
        let host_selection = self
            .invocation
            .host_environment
            .get(CUDA_VISIBLE_DEVICES)
            .filter(|value| !value.is_empty() && *value != NO_DEV_FILES);

        match host_selection {
            Some(selection) if image_advertises_gpus => {
                env.insert(NVIDIA_VISIBLE_DEVICES.to_string(), selection.clone());
                env.insert(
                    CUDA_VISIBLE_DEVICES.to_string(),
                    remap_cuda_visible_devices(selection),
                );
                let capabilities = self
                    .metadata
                    .env_value(NVIDIA_DRIVER_CAPABILITIES)
                    .unwrap_or("all");
                env.insert(
                    NVIDIA_DRIVER_CAPABILITIES.to_string(),
                    capabilities.to_string(),
                );
            }
            _ => {
                env.remove(CUDA_VISIBLE_DEVICES);
                env.remove(NVIDIA_VISIBLE_DEVICES);
                env.remove(NVIDIA_DRIVER_CAPABILITIES);
            }
        }
    }
}

/// Maps each selected device id to the index it will occupy inside the
/// container (its rank within the sorted selection), preserving the
/// host-supplied order. E.g. "3,1,5" becomes "1,0,2".
fn remap_cuda_visible_devices(selection: &str) -> String {
    let ids: Vec<&str> = selection.split(',').collect();
    let mut sorted: Vec<&str> = ids.clone();
    sorted.sort_by_key(|id| id.parse::<u64>().unwrap_or(u64::MAX));
    ids.iter()
        .map(|id| {
            sorted
                .iter()
                .position(|candidate| candidate == id)
                .unwrap_or(0)
                .to_string()
        })
        .collect::<Vec<_>>()
        .join(",")
}
