//! Data describing one `run` invocation, assembled by the CLI layer and
//! consumed read-only by the merger and the bundle assembler.

use std::collections::HashMap;

use nix::unistd::{getgid, getgroups, getuid, Gid, Uid};

use crate::runtime::mounts::{DeviceMount, MountRequest};

#[derive(Debug, Clone)]
pub struct UserIdentity {
    pub uid: Uid,
    pub gid: Gid,
    pub supplementary_gids: Vec<Gid>,
}

impl UserIdentity {
    /// The identity of the invoking user, captured before any privilege or
    /// namespace changes.
    pub fn from_process() -> Self {
        UserIdentity {
            uid: getuid(),
            gid: getgid(),
            supplementary_gids: getgroups().unwrap_or_default(),
        }
    }
}

/// Everything a single container launch depends on besides the image.
#[derive(Debug)]
pub struct Invocation {
    /// Snapshot of the host environment taken before the pre-fork scrub.
    pub host_environment: HashMap<String, String>,
    pub identity: UserIdentity,
    /// Entrypoint override; providing one discards the image's entrypoint
    /// and cmd.
    pub entrypoint: Option<Vec<String>>,
    pub exec_args: Vec<String>,
    pub workdir_override: Option<std::path::PathBuf>,
    /// Site mounts first, then user mounts, performed in order.
    pub mounts: Vec<MountRequest>,
    pub device_mounts: Vec<DeviceMount>,
    pub use_mpi: bool,
    pub enable_ssh: bool,
    pub enable_pmix: bool,
    pub add_init_process: bool,
    /// Extra key=value pairs injected into each configured OCI hook.
    pub hooks_environment: HashMap<String, String>,
}

impl Invocation {
    pub fn new(identity: UserIdentity) -> Self {
        Invocation {
            host_environment: HashMap::new(),
            identity,
            entrypoint: None,
            exec_args: Vec::new(),
            workdir_override: None,
            mounts: Vec::new(),
            device_mounts: Vec::new(),
            use_mpi: false,
            enable_ssh: false,
            enable_pmix: false,
            add_init_process: false,
            hooks_environment: HashMap::new(),
        }
    }
}

/// An invocation as the current user with everything else defaulted, so
/// ownership changes performed during tests always succeed.
#[cfg(test)]
pub(crate) fn test_invocation() -> Invocation {
    Invocation::new(UserIdentity::from_process())
}
