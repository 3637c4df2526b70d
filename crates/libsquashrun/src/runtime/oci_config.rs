//! Generates the bundle's `config.json` for the OCI runtime from the merger
//! outputs, the invocation identity and the device allow-list.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use oci_spec::runtime::{
    Hooks, LinuxBuilder, LinuxCpuBuilder, LinuxDeviceCgroup, LinuxDeviceCgroupBuilder,
    LinuxNamespaceBuilder, LinuxNamespaceType, LinuxResourcesBuilder, Mount, MountBuilder,
    ProcessBuilder, RootBuilder, Spec, SpecBuilder, UserBuilder,
};

use crate::invocation::UserIdentity;

pub const ROOTFS_DIR: &str = "rootfs";

#[derive(Debug, thiserror::Error)]
pub enum BundleConfigError {
    #[error("failed to build bundle configuration")]
    Build(#[from] oci_spec::OciSpecError),
    #[error("configured hooks block is not a valid OCI hooks object")]
    InvalidHooks(#[from] serde_json::Error),
}

type Result<T> = std::result::Result<T, BundleConfigError>;

/// Everything the generator needs, collected by the bundle assembler.
pub struct BundleConfig {
    pub command: Vec<String>,
    pub environment: HashMap<String, String>,
    pub working_directory: PathBuf,
    pub identity: UserIdentity,
    pub device_allow_entries: Vec<LinuxDeviceCgroup>,
    pub annotations: HashMap<String, String>,
    pub cpu_affinity: Option<String>,
    pub hooks: Option<serde_json::Value>,
    /// Whether the invoking terminal is interactive.
    pub terminal: bool,
}

impl BundleConfig {
    /// Writes `config.json` into the bundle directory.
    pub fn write(&self, bundle_dir: &Path) -> Result<()> {
        let spec = self.build_spec()?;
        spec.save(bundle_dir.join("config.json"))?;
        Ok(())
    }

    fn build_spec(&self) -> Result<Spec> {
        // Stable ordering keeps the generated file reproducible.
        let mut env: Vec<String> = self
            .environment
            .iter()
            .map(|(key, value)| format!("{key}={value}"))
            .collect();
        env.sort();

        let process = ProcessBuilder::default()
            .args(self.command.clone())
            .env(env)
            .cwd(self.working_directory.clone())
            .user(
                UserBuilder::default()
                    .uid(self.identity.uid.as_raw())
                    .gid(self.identity.gid.as_raw())
                    .additional_gids(
                        self.identity
                            .supplementary_gids
                            .iter()
                            .map(|gid| gid.as_raw())
                            .collect::<Vec<_>>(),
                    )
                    .build()?,
            )
            .terminal(self.terminal)
            .no_new_privileges(true)
            .build()?;

        let mut devices = self.device_allow_entries.clone();
        devices.push(
            LinuxDeviceCgroupBuilder::default()
                .allow(false)
                .access("rwm")
                .build()?,
        );

        let mut resources = LinuxResourcesBuilder::default().devices(devices);
        if let Some(cpus) = &self.cpu_affinity {
            resources = resources.cpu(LinuxCpuBuilder::default().cpus(cpus.clone()).build()?);
        }

        let linux = LinuxBuilder::default()
            .namespaces(vec![LinuxNamespaceBuilder::default()
                .typ(LinuxNamespaceType::Mount)
                .build()?])
            .resources(resources.build()?)
            .build()?;

        let mut builder = SpecBuilder::default()
            .root(RootBuilder::default().path(ROOTFS_DIR).build()?)
            .process(process)
            .linux(linux)
            .mounts(baseline_mounts()?)
            .annotations(self.annotations.clone());
        if let Some(hooks) = &self.hooks {
            let hooks: Hooks = serde_json::from_value(hooks.clone())?;
            builder = builder.hooks(hooks);
        }

        Ok(builder.build()?)
    }
}

/// The pseudo-filesystems the runtime mounts on top of the assembled rootfs.
/// `/dev` itself is absent: the assembler has already populated it, and a
/// fresh tmpfs here would hide the device nodes and the init binary.
fn baseline_mounts() -> Result<Vec<Mount>> {
    let mount = |destination: &str, typ: &str, source: &str, options: &[&str]| {
        MountBuilder::default()
            .destination(destination)
            .typ(typ)
            .source(source)
            .options(options.iter().map(|o| o.to_string()).collect::<Vec<_>>())
            .build()
    };
    Ok(vec![
        mount("/proc", "proc", "proc", &[])?,
        mount(
            "/sys",
            "sysfs",
            "sysfs",
            &["nosuid", "noexec", "nodev", "ro"],
        )?,
        mount(
            "/dev/pts",
            "devpts",
            "devpts",
            &[
                "nosuid",
                "noexec",
                "newinstance",
                "ptmxmode=0666",
                "mode=0620",
            ],
        )?,
        mount(
            "/dev/shm",
            "tmpfs",
            "shm",
            &["nosuid", "noexec", "nodev", "mode=1777", "size=65536k"],
        )?,
        mount(
            "/dev/mqueue",
            "mqueue",
            "mqueue",
            &["nosuid", "noexec", "nodev"],
        )?,
    ])
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result;
    use nix::unistd::{Gid, Uid};
    use oci_spec::runtime::LinuxDeviceType;

    fn test_bundle_config() -> BundleConfig {
        BundleConfig {
            command: vec!["/bin/sh".to_string(), "-c".to_string(), "true".to_string()],
            environment: HashMap::from([
                ("B".to_string(), "2".to_string()),
                ("A".to_string(), "1".to_string()),
            ]),
            working_directory: PathBuf::from("/work"),
            identity: UserIdentity {
                uid: Uid::from_raw(1000),
                gid: Gid::from_raw(1001),
                supplementary_gids: vec![Gid::from_raw(30)],
            },
            device_allow_entries: vec![LinuxDeviceCgroupBuilder::default()
                .allow(true)
                .typ(LinuxDeviceType::C)
                .major(1i64)
                .minor(3i64)
                .access("rw")
                .build()
                .unwrap()],
            annotations: HashMap::from([(
                "com.squashrun.hooks.stdout_fd".to_string(),
                "3".to_string(),
            )]),
            cpu_affinity: Some("0-3".to_string()),
            hooks: None,
            terminal: false,
        }
    }

    #[test]
    fn test_spec_process_and_root() -> Result<()> {
        let spec = test_bundle_config().build_spec()?;

        let root = spec.root().as_ref().unwrap();
        assert_eq!(root.path(), &PathBuf::from("rootfs"));

        let process = spec.process().as_ref().unwrap();
        assert_eq!(
            process.args().as_ref().unwrap(),
            &vec!["/bin/sh".to_string(), "-c".to_string(), "true".to_string()]
        );
        // Environment is emitted sorted by key.
        assert_eq!(
            process.env().as_ref().unwrap(),
            &vec!["A=1".to_string(), "B=2".to_string()]
        );
        assert_eq!(process.cwd(), &PathBuf::from("/work"));
        assert_eq!(process.user().uid(), 1000);
        assert_eq!(process.user().gid(), 1001);
        Ok(())
    }

    #[test]
    fn test_spec_has_mount_namespace_and_device_rules() -> Result<()> {
        let spec = test_bundle_config().build_spec()?;
        let linux = spec.linux().as_ref().unwrap();

        let namespaces = linux.namespaces().as_ref().unwrap();
        assert_eq!(namespaces.len(), 1);
        assert_eq!(namespaces[0].typ(), LinuxNamespaceType::Mount);

        let devices = linux
            .resources()
            .as_ref()
            .unwrap()
            .devices()
            .as_ref()
            .unwrap();
        assert_eq!(devices.len(), 2);
        assert!(devices[0].allow());
        // The allow-list ends with the deny-everything rule.
        let last = devices.last().unwrap();
        assert!(!last.allow());
        assert_eq!(last.access().as_deref(), Some("rwm"));

        let cpu = linux.resources().as_ref().unwrap().cpu().as_ref().unwrap();
        assert_eq!(cpu.cpus().as_deref(), Some("0-3"));
        Ok(())
    }

    #[test]
    fn test_spec_baseline_mounts_leave_dev_alone() -> Result<()> {
        let spec = test_bundle_config().build_spec()?;
        let mounts = spec.mounts().as_ref().unwrap();
        let destinations: Vec<&Path> =
            mounts.iter().map(|m| m.destination().as_path()).collect();
        assert!(destinations.contains(&Path::new("/proc")));
        assert!(destinations.contains(&Path::new("/sys")));
        assert!(destinations.contains(&Path::new("/dev/pts")));
        assert!(destinations.contains(&Path::new("/dev/shm")));
        assert!(destinations.contains(&Path::new("/dev/mqueue")));
        // The assembler owns /dev.
        assert!(!destinations.contains(&Path::new("/dev")));
        Ok(())
    }

    #[test]
    fn test_spec_with_hooks_block() -> Result<()> {
        let mut config = test_bundle_config();
        config.hooks = Some(serde_json::json!({
            "prestart": [{"path": "/opt/hooks/mpi", "env": ["SQUASHRUN_MPI_HOOK=1"]}],
        }));
        let spec = config.build_spec()?;
        let hooks = spec.hooks().as_ref().unwrap();
        let prestart = hooks.prestart().as_ref().unwrap();
        assert_eq!(prestart.len(), 1);
        assert_eq!(prestart[0].path(), &PathBuf::from("/opt/hooks/mpi"));
        Ok(())
    }

    #[test]
    fn test_malformed_hooks_block_is_rejected() {
        let mut config = test_bundle_config();
        config.hooks = Some(serde_json::json!({"prestart": "not-an-array"}));
        assert!(matches!(
            config.build_spec(),
            Err(BundleConfigError::InvalidHooks(..))
        ));
    }

    #[test]
    fn test_write_produces_config_json() -> Result<()> {
        let tmp = tempfile::tempdir()?;
        test_bundle_config().write(tmp.path())?;
        let written = std::fs::read_to_string(tmp.path().join("config.json"))?;
        let parsed: serde_json::Value = serde_json::from_str(&written)?;
        assert_eq!(parsed["root"]["path"], "rootfs");
        assert_eq!(
            parsed["annotations"]["com.squashrun.hooks.stdout_fd"],
            "3"
        );
        Ok(())
    }
}
