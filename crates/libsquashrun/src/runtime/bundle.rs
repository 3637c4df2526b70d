//! Assembles the on-disk OCI bundle inside a private mount namespace.
//!
//! The sequence is strictly ordered; every step's post-condition is the next
//! step's precondition. Each step that creates a kernel or filesystem
//! resource registers a release action, and on any failure (or after the
//! runtime exits) the registered actions run in reverse order, so nothing
//! performed here outlives the invocation.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use nix::mount::{MntFlags, MsFlags};
use nix::sched::CloneFlags;
use nix::sys::stat::Mode;
use procfs::process::Process;

use crate::config::EngineConfig;
use crate::image::metadata::{ImageMetadata, MetadataError};
use crate::image::store::StoredImage;
use crate::invocation::Invocation;
use crate::runtime::configs_merger::{ConfigsMerger, MergeError};
use crate::runtime::fd_handler::{FdError, FdHandler};
use crate::runtime::mounts::{BindMount, MountError, MountRequest};
use crate::runtime::oci_config::{BundleConfig, BundleConfigError, ROOTFS_DIR};
use crate::syscall::{Syscall, SyscallError};
use crate::utils::{self, FsError};

const OVERLAY_LOWER: &str = "overlay/rootfs-lower";
const OVERLAY_UPPER: &str = "overlay/rootfs-upper";
const OVERLAY_WORK: &str = "overlay/rootfs-work";

/// Environment variable pointing at the PMIx server rendezvous directory.
const PMIX_SERVER_TMPDIR: &str = "PMIX_SERVER_TMPDIR";

#[derive(Debug, thiserror::Error)]
pub enum BundleError {
    #[error("failed to {step}")]
    Syscall {
        step: &'static str,
        #[source]
        source: SyscallError,
    },
    #[error("bundle directory {path:?} is on a shared mount, refusing to continue")]
    SharedMount { path: PathBuf },
    #[error(transparent)]
    Fs(#[from] FsError),
    #[error(transparent)]
    Metadata(#[from] MetadataError),
    #[error(transparent)]
    Mount(#[from] MountError),
    #[error(transparent)]
    Merge(#[from] MergeError),
    #[error(transparent)]
    Fd(#[from] FdError),
    #[error(transparent)]
    Config(#[from] BundleConfigError),
}

type Result<T> = std::result::Result<T, BundleError>;

/// Release actions registered by the steps, run in reverse on unwind.
enum Release {
    Unmount(PathBuf),
    DetachLoop(PathBuf),
    RemoveDir(PathBuf),
}

#[derive(Default)]
struct ReleaseStack {
    actions: Vec<Release>,
}

impl ReleaseStack {
    fn push(&mut self, action: Release) {
        self.actions.push(action);
    }

    fn unwind(&mut self, syscall: &dyn Syscall) {
        while let Some(action) = self.actions.pop() {
            let outcome = match &action {
                Release::Unmount(path) => syscall
                    .umount(path, MntFlags::MNT_DETACH)
                    .map_err(|err| (path.clone(), err.to_string())),
                Release::DetachLoop(device) => syscall
                    .loop_detach(device)
                    .map_err(|err| (device.clone(), err.to_string())),
                Release::RemoveDir(path) => std::fs::remove_dir_all(path)
                    .map_err(|err| (path.clone(), err.to_string())),
            };
            if let Err((path, error)) = outcome {
                tracing::warn!(path = %path.display(), error, "bundle cleanup step failed");
            }
        }
    }
}

pub struct BundleAssembler<'a> {
    config: &'a EngineConfig,
    invocation: &'a Invocation,
    image: &'a StoredImage,
    bundle_dir: PathBuf,
    rootfs_dir: PathBuf,
    syscall: Box<dyn Syscall>,
    releases: ReleaseStack,
    /// Set by [`BundleAssembler::assemble`]; the count for `--preserve-fds`.
    preserved_fd_count: i32,
}

impl<'a> BundleAssembler<'a> {
    pub fn new(
        config: &'a EngineConfig,
        invocation: &'a Invocation,
        image: &'a StoredImage,
        bundle_dir: PathBuf,
        syscall: Box<dyn Syscall>,
    ) -> Self {
        let rootfs_dir = bundle_dir.join(ROOTFS_DIR);
        BundleAssembler {
            config,
            invocation,
            image,
            bundle_dir,
            rootfs_dir,
            syscall,
            releases: ReleaseStack::default(),
            preserved_fd_count: 0,
        }
    }

    pub fn preserved_fd_count(&self) -> i32 {
        self.preserved_fd_count
    }

    /// Runs the full assembly. On error the executed steps are already
    /// released; on success call [`BundleAssembler::release`] after the
    /// runtime has exited.
    pub fn assemble(&mut self) -> Result<()> {
        tracing::info!(bundle = %self.bundle_dir.display(), "setting up OCI bundle");
        match self.assemble_steps() {
            Ok(()) => {
                tracing::info!("successfully set up OCI bundle");
                Ok(())
            }
            Err(err) => {
                self.release();
                Err(err)
            }
        }
    }

    /// Releases every resource the assembly produced, in reverse order.
    pub fn release(&mut self) {
        self.releases.unwind(self.syscall.as_ref());
    }

    fn assemble_steps(&mut self) -> Result<()> {
        self.detach_mount_namespace()?;
        self.mount_ram_filesystem()?;
        let metadata = self.mount_image_into_rootfs()?;
        self.setup_dev_filesystem()?;
        self.copy_etc_files_into_rootfs()?;
        self.mount_init_program_if_requested()?;
        self.perform_custom_mounts()?;
        self.perform_pmix_mounts()?;
        let device_entries = self.perform_device_mounts()?;
        self.remount_rootfs_nosuid()?;
        self.write_bundle_config(&metadata, device_entries)?;
        Ok(())
    }

    /// Steps 1-2: a private mount namespace, with `/` remounted
    /// slave-recursive so nothing done here propagates back to the host.
    fn detach_mount_namespace(&mut self) -> Result<()> {
        tracing::info!("setting up mount isolation");
        self.syscall
            .unshare(CloneFlags::CLONE_NEWNS)
            .map_err(|err| BundleError::Syscall {
                step: "unshare the mount namespace",
                source: err,
            })?;
        self.syscall
            .mount(
                None,
                Path::new("/"),
                None,
                MsFlags::MS_SLAVE | MsFlags::MS_REC,
                None,
            )
            .map_err(|err| BundleError::Syscall {
                step: "remount / as slave-recursive",
                source: err,
            })?;
        tracing::info!("successfully set up mount isolation");
        Ok(())
    }

    /// Step 3: a ram filesystem over the bundle directory, slave-recursive,
    /// mode 0755.
    fn mount_ram_filesystem(&mut self) -> Result<()> {
        tracing::info!(fstype = %self.config.ram_filesystem_type, "setting up ram filesystem");
        let fstype = self.config.ram_filesystem_type.as_str();
        self.syscall
            .mount(
                None,
                &self.bundle_dir,
                Some(fstype),
                MsFlags::MS_NOSUID | MsFlags::MS_NODEV,
                None,
            )
            .map_err(|err| BundleError::Syscall {
                step: "mount ram filesystem on the bundle directory",
                source: err,
            })?;
        self.releases.push(Release::Unmount(self.bundle_dir.clone()));
        self.syscall
            .mount(
                None,
                &self.bundle_dir,
                None,
                MsFlags::MS_SLAVE | MsFlags::MS_REC,
                None,
            )
            .map_err(|err| BundleError::Syscall {
                step: "remount the bundle directory as slave-recursive",
                source: err,
            })?;
        self.ensure_not_shared(&self.bundle_dir)?;
        self.syscall
            .set_permissions(&self.bundle_dir, Mode::from_bits_truncate(0o755))
            .map_err(|err| BundleError::Syscall {
                step: "set bundle directory permissions",
                source: err,
            })?;
        tracing::info!("successfully set up ram filesystem");
        Ok(())
    }

    /// Steps 4-6: overlay work directories, the loop-mounted squashfs as the
    /// read-only lower layer, and the overlay itself at `rootfs/`.
    fn mount_image_into_rootfs(&mut self) -> Result<ImageMetadata> {
        tracing::info!(image = %self.image.image_file.display(),
            "mounting image into bundle rootfs");
        let identity = &self.invocation.identity;
        let lower = self.bundle_dir.join(OVERLAY_LOWER);
        let upper = self.bundle_dir.join(OVERLAY_UPPER);
        let work = self.bundle_dir.join(OVERLAY_WORK);
        for dir in [&self.rootfs_dir, &lower, &upper, &work] {
            utils::create_dir_all_owned(dir, nix::unistd::getuid(), nix::unistd::getgid())?;
        }
        // The upper layer is where container writes land; the invoking user
        // owns it.
        self.syscall
            .chown(&upper, Some(identity.uid), Some(identity.gid))
            .map_err(|err| BundleError::Syscall {
                step: "hand the overlay upper directory to the invoking user",
                source: err,
            })?;
        self.releases
            .push(Release::RemoveDir(self.bundle_dir.join("overlay")));

        let device =
            self.syscall
                .loop_attach(&self.image.image_file)
                .map_err(|err| BundleError::Syscall {
                    step: "attach the image to a loop device",
                    source: err,
                })?;
        self.releases.push(Release::DetachLoop(device.clone()));
        self.syscall
            .mount(
                Some(&device),
                &lower,
                Some("squashfs"),
                MsFlags::MS_RDONLY,
                None,
            )
            .map_err(|err| BundleError::Syscall {
                step: "mount the squashfs image",
                source: err,
            })?;
        self.releases.push(Release::Unmount(lower.clone()));

        let overlay_options = format!(
            "lowerdir={},upperdir={},workdir={}",
            lower.display(),
            upper.display(),
            work.display()
        );
        self.syscall
            .mount(
                Some(Path::new("overlay")),
                &self.rootfs_dir,
                Some("overlay"),
                MsFlags::empty(),
                Some(&overlay_options),
            )
            .map_err(|err| BundleError::Syscall {
                step: "mount the rootfs overlay",
                source: err,
            })?;
        self.releases.push(Release::Unmount(self.rootfs_dir.clone()));

        let metadata = ImageMetadata::load(&self.image.metadata_file)?;
        tracing::info!("successfully mounted image into bundle rootfs");
        Ok(metadata)
    }

    /// Step 7: a fresh /dev inside the rootfs.
    fn setup_dev_filesystem(&mut self) -> Result<()> {
        tracing::info!("setting up /dev filesystem");
        let dev = self.rootfs_dir.join("dev");
        utils::create_dir_all_owned(&dev, nix::unistd::getuid(), nix::unistd::getgid())?;
        self.syscall
            .mount(
                None,
                &dev,
                Some(self.config.ram_filesystem_type.as_str()),
                MsFlags::MS_NOSUID | MsFlags::MS_STRICTATIME,
                Some("mode=755,size=65536k"),
            )
            .map_err(|err| BundleError::Syscall {
                step: "mount /dev filesystem",
                source: err,
            })?;
        self.releases.push(Release::Unmount(dev));
        tracing::info!("successfully set up /dev filesystem");
        Ok(())
    }

    /// Step 8: name resolution and identity files, owned by the invoking
    /// user. hosts and resolv.conf come from the host, the rest from the
    /// installation's stock files.
    fn copy_etc_files_into_rootfs(&mut self) -> Result<()> {
        tracing::info!("copying /etc files into rootfs");
        let identity = &self.invocation.identity;
        let prefix = &self.config.prefix_dir;
        let copies = [
            (PathBuf::from("/etc/hosts"), "etc/hosts"),
            (PathBuf::from("/etc/resolv.conf"), "etc/resolv.conf"),
            (prefix.join("etc/container/nsswitch.conf"), "etc/nsswitch.conf"),
            (prefix.join("etc/passwd"), "etc/passwd"),
            (prefix.join("etc/group"), "etc/group"),
        ];
        for (source, target) in copies {
            utils::copy_file_owned(
                &source,
                self.rootfs_dir.join(target),
                identity.uid,
                identity.gid,
            )?;
        }
        tracing::info!("successfully copied /etc files into rootfs");
        Ok(())
    }

    /// Step 9: the static init binary bound at /dev/init, when requested.
    fn mount_init_program_if_requested(&mut self) -> Result<()> {
        if !self.invocation.add_init_process {
            return Ok(());
        }
        tracing::info!("mounting init program into rootfs");
        let target = self.rootfs_dir.join("dev/init");
        utils::create_file_if_missing(&target)?;
        self.syscall
            .mount(
                Some(&self.config.init_path),
                &target,
                Some("bind"),
                MsFlags::MS_BIND | MsFlags::MS_REC,
                None,
            )
            .map_err(|err| BundleError::Syscall {
                step: "bind mount the init program",
                source: err,
            })?;
        self.releases.push(Release::Unmount(target));
        tracing::info!("successfully mounted init program into rootfs");
        Ok(())
    }

    /// Step 10: site and user mounts, in the given order.
    fn perform_custom_mounts(&mut self) -> Result<()> {
        tracing::info!("performing custom mounts");
        for mount in &self.invocation.mounts {
            let target = mount.perform(&self.rootfs_dir, self.syscall.as_ref())?;
            self.releases.push(Release::Unmount(target));
        }
        tracing::info!("successfully performed custom mounts");
        Ok(())
    }

    /// Step 11: feature mounts that happen without direct user control.
    /// PMIx needs its server rendezvous directory visible in the container.
    fn perform_pmix_mounts(&mut self) -> Result<()> {
        if !(self.invocation.enable_pmix && self.config.enable_pmix_support) {
            return Ok(());
        }
        tracing::info!("performing PMIx mounts");
        let Some(server_tmpdir) = self
            .invocation
            .host_environment
            .get(PMIX_SERVER_TMPDIR)
            .filter(|dir| !dir.is_empty())
        else {
            tracing::warn!(
                "{PMIX_SERVER_TMPDIR} is not set, skipping PMIx mounts"
            );
            return Ok(());
        };
        let mount = MountRequest::Bind(BindMount::new(
            PathBuf::from(server_tmpdir),
            PathBuf::from(server_tmpdir),
            MsFlags::MS_REC | MsFlags::MS_PRIVATE,
        ));
        let target = mount.perform(&self.rootfs_dir, self.syscall.as_ref())?;
        self.releases.push(Release::Unmount(target));
        tracing::info!("successfully performed PMIx mounts");
        Ok(())
    }

    /// Step 12: device mounts, collecting the cgroup allow entries recorded
    /// in the bundle config.
    fn perform_device_mounts(
        &mut self,
    ) -> Result<Vec<oci_spec::runtime::LinuxDeviceCgroup>> {
        tracing::info!("performing device mounts");
        let mut entries = Vec::with_capacity(self.invocation.device_mounts.len());
        for device in &self.invocation.device_mounts {
            entries.push(device.cgroup_allow_entry()?);
            let request = MountRequest::Device(device.clone());
            let target = request.perform(&self.rootfs_dir, self.syscall.as_ref())?;
            self.releases.push(Release::Unmount(target));
        }
        tracing::info!("successfully performed device mounts");
        Ok(entries)
    }

    /// Step 13: no setuid binaries from the image.
    fn remount_rootfs_nosuid(&mut self) -> Result<()> {
        tracing::info!("remounting rootfs with nosuid");
        self.syscall
            .mount(
                Some(&self.rootfs_dir),
                &self.rootfs_dir,
                Some("overlay"),
                MsFlags::MS_REMOUNT | MsFlags::MS_NOSUID,
                None,
            )
            .map_err(|err| BundleError::Syscall {
                step: "remount rootfs with nosuid",
                source: err,
            })?;
        tracing::info!("successfully remounted rootfs with nosuid");
        Ok(())
    }

    /// Steps 14-15: fd preservation, then `config.json` from the merged
    /// configuration.
    fn write_bundle_config(
        &mut self,
        metadata: &ImageMetadata,
        device_entries: Vec<oci_spec::runtime::LinuxDeviceCgroup>,
    ) -> Result<()> {
        tracing::info!("generating bundle config");
        let merger = ConfigsMerger::new(metadata, self.invocation);
        let command = merger.command_to_execute()?;
        let mut environment = merger.environment();
        let working_directory = merger.working_directory();
        let hooks = merger.hooks(self.config.oci_hooks.as_ref());

        let mut annotations = HashMap::new();
        let mut fd_handler = FdHandler::new();
        fd_handler.preserve_pmi_fd(&self.invocation.host_environment)?;
        fd_handler.pass_stdio_to_hooks(self.syscall.as_ref())?;
        self.preserved_fd_count =
            fd_handler.apply(self.syscall.as_ref(), &mut environment, &mut annotations)?;

        let bundle_config = BundleConfig {
            command,
            environment,
            working_directory,
            identity: self.invocation.identity.clone(),
            device_allow_entries: device_entries,
            annotations,
            cpu_affinity: utils::cpu_affinity_string(),
            hooks,
            terminal: nix::unistd::isatty(0).unwrap_or(false),
        };
        bundle_config.write(&self.bundle_dir)?;
        tracing::info!("successfully generated bundle config");
        Ok(())
    }

    /// Refuses to continue when the bundle directory still has shared
    /// propagation: mounts performed below it would leak to the host.
    fn ensure_not_shared(&self, path: &Path) -> Result<()> {
        let Ok(process) = Process::myself() else {
            return Ok(());
        };
        let Ok(mounts) = process.mountinfo() else {
            return Ok(());
        };
        let entry = mounts.0.into_iter().find(|mount| mount.mount_point == path);
        if let Some(entry) = entry {
            if entry.opt_fields.iter().any(|field| {
                matches!(field, procfs::process::MountOptFields::Shared(_))
            }) {
                return Err(BundleError::SharedMount {
                    path: path.to_path_buf(),
                });
            }
        }
        Ok(())
    }
}
