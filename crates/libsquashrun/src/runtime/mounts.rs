//! User-, site- and device-requested mounts into the container rootfs.
//!
//! Requests are parsed up front (destinations absolute, no traversal) and
//! performed against the assembled rootfs, where the source is required to
//! exist. Device mounts additionally surface an allow entry for the device
//! cgroup of the bundle config.

use std::fmt;
use std::path::{Path, PathBuf};

use nix::mount::MsFlags;
use nix::sys::stat::{major, minor, stat, SFlag};
use oci_spec::runtime::{LinuxDeviceCgroup, LinuxDeviceCgroupBuilder, LinuxDeviceType};

use crate::syscall::{Syscall, SyscallError};
use crate::utils::{self, FsError};

#[derive(Debug, thiserror::Error)]
pub enum MountError {
    #[error("invalid mount request {request:?}: {reason}")]
    InvalidRequest { request: String, reason: String },
    #[error("invalid device request {request:?}: {reason}")]
    InvalidDeviceRequest { request: String, reason: String },
    #[error("mount source {path:?} does not exist on the host")]
    MissingSource { path: PathBuf },
    #[error("{path:?} is not a device file")]
    NotADevice { path: PathBuf },
    #[error("failed to stat {path:?}")]
    Stat { path: PathBuf, source: nix::Error },
    #[error(transparent)]
    Fs(#[from] FsError),
    #[error("failed to mount {source:?} at {destination:?}")]
    Perform {
        source: PathBuf,
        destination: PathBuf,
        #[source]
        error: SyscallError,
    },
    #[error("failed to build device cgroup entry")]
    CgroupEntry(#[from] oci_spec::OciSpecError),
}

type Result<T> = std::result::Result<T, MountError>;

/// A bind mount requested through the CLI or the site configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BindMount {
    pub source: PathBuf,
    pub destination: PathBuf,
    pub flags: MsFlags,
}

impl BindMount {
    pub fn new(source: PathBuf, destination: PathBuf, flags: MsFlags) -> Self {
        BindMount {
            source,
            destination,
            flags,
        }
    }

    /// Parses `src,dst[,ro|rw][,recursive|private]`.
    pub fn parse(request: &str) -> Result<Self> {
        let invalid = |reason: &str| MountError::InvalidRequest {
            request: request.to_string(),
            reason: reason.to_string(),
        };

        let mut tokens = request.split(',');
        let source = tokens.next().filter(|s| !s.is_empty()).ok_or_else(|| {
            invalid("missing source path")
        })?;
        let destination = tokens
            .next()
            .filter(|s| !s.is_empty())
            .ok_or_else(|| invalid("missing destination path"))?;

        let mut flags = MsFlags::MS_REC | MsFlags::MS_PRIVATE;
        for token in tokens {
            match token {
                "ro" => flags |= MsFlags::MS_RDONLY,
                "rw" => flags &= !MsFlags::MS_RDONLY,
                "recursive" => flags |= MsFlags::MS_REC,
                "private" => flags |= MsFlags::MS_PRIVATE,
                other => {
                    return Err(invalid(&format!("unknown option {other:?}")));
                }
            }
        }

        let (source, destination) = (PathBuf::from(source), PathBuf::from(destination));
        validate_mount_path(&destination, "destination", request)?;
        if source.components().any(|c| c.as_os_str() == "..") {
            return Err(invalid("source must not contain '..'"));
        }

        Ok(BindMount::new(source, destination, flags))
    }

    fn perform(&self, rootfs: &Path, syscall: &dyn Syscall) -> Result<PathBuf> {
        if !self.source.exists() {
            return Err(MountError::MissingSource {
                path: self.source.clone(),
            });
        }

        let target = join_under_rootfs(rootfs, &self.destination);
        if self.source.is_dir() {
            utils::create_dir_all_owned(
                &target,
                nix::unistd::getuid(),
                nix::unistd::getgid(),
            )?;
        } else {
            utils::create_file_if_missing(&target)?;
        }

        let perform_error = |error: SyscallError| MountError::Perform {
            source: self.source.clone(),
            destination: target.clone(),
            error,
        };

        syscall
            .mount(
                Some(&self.source),
                &target,
                Some("bind"),
                MsFlags::MS_BIND | MsFlags::MS_REC,
                None,
            )
            .map_err(perform_error)?;
        // Propagation and read-only flags only take effect on a remount.
        syscall
            .mount(
                None,
                &target,
                None,
                MsFlags::MS_PRIVATE | MsFlags::MS_REC,
                None,
            )
            .map_err(perform_error)?;
        if self.flags.contains(MsFlags::MS_RDONLY) {
            syscall
                .mount(
                    Some(&self.source),
                    &target,
                    None,
                    MsFlags::MS_BIND | MsFlags::MS_REMOUNT | MsFlags::MS_RDONLY,
                    None,
                )
                .map_err(perform_error)?;
        }

        Ok(target)
    }
}

/// Which device cgroup permissions a device mount grants.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceAccess {
    pub read: bool,
    pub write: bool,
    pub mknod: bool,
}

impl DeviceAccess {
    pub const FULL: DeviceAccess = DeviceAccess {
        read: true,
        write: true,
        mknod: true,
    };

    /// Accepts a non-empty subset of "rwm" with no repetitions.
    pub fn parse(access: &str) -> std::result::Result<Self, String> {
        if access.is_empty() {
            return Err("device access must not be empty".to_string());
        }
        let mut parsed = DeviceAccess {
            read: false,
            write: false,
            mknod: false,
        };
        for c in access.chars() {
            let field = match c {
                'r' => &mut parsed.read,
                'w' => &mut parsed.write,
                'm' => &mut parsed.mknod,
                other => {
                    return Err(format!(
                        "device access must contain only 'r', 'w', 'm' characters, found {other:?}"
                    ))
                }
            };
            if *field {
                return Err(format!("repeated access character {c:?}"));
            }
            *field = true;
        }
        Ok(parsed)
    }
}

impl fmt::Display for DeviceAccess {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.read {
            write!(f, "r")?;
        }
        if self.write {
            write!(f, "w")?;
        }
        if self.mknod {
            write!(f, "m")?;
        }
        Ok(())
    }
}

/// A device node bound into the container and whitelisted in the devices
/// cgroup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceMount {
    pub bind: BindMount,
    pub access: DeviceAccess,
}

impl DeviceMount {
    /// Parses `host[:container[:access]]`. With two tokens, a relative
    /// second token is the access string, otherwise the container path.
    pub fn parse(request: &str) -> Result<Self> {
        let invalid = |reason: String| MountError::InvalidDeviceRequest {
            request: request.to_string(),
            reason,
        };

        if request.is_empty() {
            return Err(invalid("no values provided".to_string()));
        }
        let tokens: Vec<&str> = request.split(':').collect();
        if tokens.len() > 3 {
            return Err(invalid(format!(
                "expected at most '<host device>:<container device>:<access>', got {} tokens",
                tokens.len()
            )));
        }

        let source = PathBuf::from(tokens[0]);
        let mut destination = source.clone();
        let mut access = DeviceAccess::FULL;

        match tokens.len() {
            3 => {
                destination = PathBuf::from(tokens[1]);
                access = DeviceAccess::parse(tokens[2]).map_err(invalid)?;
            }
            2 => {
                if Path::new(tokens[1]).is_relative() {
                    access = DeviceAccess::parse(tokens[1]).map_err(invalid)?;
                } else {
                    destination = PathBuf::from(tokens[1]);
                }
            }
            _ => {}
        }

        validate_mount_path(&source, "host device", request)
            .map_err(|err| invalid(err.to_string()))?;
        validate_mount_path(&destination, "container device", request)
            .map_err(|err| invalid(err.to_string()))?;

        Ok(DeviceMount {
            bind: BindMount::new(source, destination, MsFlags::MS_REC | MsFlags::MS_PRIVATE),
            access,
        })
    }

    /// The allow entry the bundle config records for this device.
    pub fn cgroup_allow_entry(&self) -> Result<LinuxDeviceCgroup> {
        let path = &self.bind.source;
        let info = stat(path).map_err(|err| MountError::Stat {
            path: path.clone(),
            source: err,
        })?;
        let file_type = SFlag::from_bits_truncate(info.st_mode);
        let device_type = if file_type.contains(SFlag::S_IFBLK) {
            LinuxDeviceType::B
        } else if file_type.contains(SFlag::S_IFCHR) {
            LinuxDeviceType::C
        } else {
            return Err(MountError::NotADevice { path: path.clone() });
        };

        Ok(LinuxDeviceCgroupBuilder::default()
            .allow(true)
            .typ(device_type)
            .major(major(info.st_rdev) as i64)
            .minor(minor(info.st_rdev) as i64)
            .access(self.access.to_string())
            .build()?)
    }
}

impl fmt::Display for DeviceMount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{}:{}",
            self.bind.source.display(),
            self.bind.destination.display(),
            self.access
        )
    }
}

/// The two kinds of requested mounts, performed through one entry point.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MountRequest {
    Bind(BindMount),
    Device(DeviceMount),
}

impl MountRequest {
    /// Performs the mount onto the rootfs and returns the in-rootfs target
    /// (used for reverse-order cleanup).
    pub fn perform(&self, rootfs: &Path, syscall: &dyn Syscall) -> Result<PathBuf> {
        match self {
            MountRequest::Bind(bind) => {
                tracing::info!(source = %bind.source.display(),
                    destination = %bind.destination.display(), "performing bind mount");
                bind.perform(rootfs, syscall)
            }
            MountRequest::Device(device) => {
                tracing::info!(source = %device.bind.source.display(),
                    destination = %device.bind.destination.display(),
                    access = %device.access, "performing device mount");
                device.bind.perform(rootfs, syscall)
            }
        }
    }
}

fn validate_mount_path(path: &Path, context: &str, request: &str) -> Result<()> {
    let invalid = |reason: String| MountError::InvalidRequest {
        request: request.to_string(),
        reason,
    };
    if path.as_os_str().is_empty() {
        return Err(invalid(format!("empty {context} path")));
    }
    if path.is_relative() {
        return Err(invalid(format!(
            "{context} path {path:?} must be absolute"
        )));
    }
    if path.components().any(|c| c.as_os_str() == "..") {
        return Err(invalid(format!(
            "{context} path {path:?} must not contain '..'"
        )));
    }
    Ok(())
}

/// Joins an absolute container path onto the rootfs after lexical
/// normalization, so the target can never escape the rootfs.
pub fn join_under_rootfs(rootfs: &Path, destination: &Path) -> PathBuf {
    let normalized = utils::normalize_path(destination);
    match normalized.strip_prefix("/") {
        Ok(relative) => rootfs.join(relative),
        Err(_) => rootfs.join(normalized),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::syscall::test::TestSyscall;
    use anyhow::Result;

    #[test]
    fn test_parse_bind_mount() -> Result<()> {
        let mount = BindMount::parse("/host/data,/container/data")?;
        assert_eq!(mount.source, PathBuf::from("/host/data"));
        assert_eq!(mount.destination, PathBuf::from("/container/data"));
        assert_eq!(mount.flags, MsFlags::MS_REC | MsFlags::MS_PRIVATE);
        Ok(())
    }

    #[test]
    fn test_parse_bind_mount_readonly() -> Result<()> {
        let mount = BindMount::parse("/host/data,/container/data,ro")?;
        assert!(mount.flags.contains(MsFlags::MS_RDONLY));
        let mount = BindMount::parse("/host/data,/container/data,ro,rw")?;
        assert!(!mount.flags.contains(MsFlags::MS_RDONLY));
        Ok(())
    }

    #[test]
    fn test_parse_bind_mount_rejects_bad_requests() {
        assert!(BindMount::parse("").is_err());
        assert!(BindMount::parse("/only-source").is_err());
        assert!(BindMount::parse("/src,relative/dst").is_err());
        assert!(BindMount::parse("/src,/dst,sideways").is_err());
        assert!(BindMount::parse("/src,/dst/../escape").is_err());
        assert!(BindMount::parse("/src/../etc,/dst").is_err());
    }

    #[test]
    fn test_parse_device_defaults() -> Result<()> {
        let device = DeviceMount::parse("/dev/foo")?;
        assert_eq!(device.bind.source, PathBuf::from("/dev/foo"));
        assert_eq!(device.bind.destination, PathBuf::from("/dev/foo"));
        assert_eq!(device.access, DeviceAccess::FULL);
        assert_eq!(device.bind.flags, MsFlags::MS_REC | MsFlags::MS_PRIVATE);
        Ok(())
    }

    #[test]
    fn test_parse_device_two_tokens() -> Result<()> {
        // An absolute second token is the container path.
        let device = DeviceMount::parse("/dev/foo:/dev/bar")?;
        assert_eq!(device.bind.destination, PathBuf::from("/dev/bar"));
        assert_eq!(device.access, DeviceAccess::FULL);

        // A relative second token is the access string.
        let device = DeviceMount::parse("/dev/foo:rw")?;
        assert_eq!(device.bind.destination, PathBuf::from("/dev/foo"));
        assert_eq!(device.access.to_string(), "rw");
        Ok(())
    }

    #[test]
    fn test_parse_device_three_tokens() -> Result<()> {
        let device = DeviceMount::parse("/dev/foo:/dev/bar:mr")?;
        assert_eq!(device.bind.destination, PathBuf::from("/dev/bar"));
        // Canonical ordering regardless of input order.
        assert_eq!(device.access.to_string(), "rm");
        Ok(())
    }

    #[test]
    fn test_parse_device_rejects_invalid_access() {
        // "ro" contains 'o', which is not an access character.
        assert!(DeviceMount::parse("/dev/foo:ro").is_err());
        assert!(DeviceMount::parse("/dev/foo:/dev/bar:rr").is_err());
        assert!(DeviceMount::parse("/dev/foo:/dev/bar:").is_err());
        assert!(DeviceMount::parse("/dev/foo:/dev/bar:rwm:extra").is_err());
        assert!(DeviceMount::parse("").is_err());
        assert!(DeviceMount::parse("relative/dev").is_err());
    }

    #[test]
    fn test_device_render_parse_round_trip() -> Result<()> {
        for request in ["/dev/foo:/dev/bar:rw", "/dev/gpu0:/dev/gpu0:rwm"] {
            let device = DeviceMount::parse(request)?;
            assert_eq!(DeviceMount::parse(&device.to_string())?, device);
        }
        Ok(())
    }

    #[test]
    fn test_join_under_rootfs() {
        let rootfs = Path::new("/bundle/rootfs");
        assert_eq!(
            join_under_rootfs(rootfs, Path::new("/var/data")),
            PathBuf::from("/bundle/rootfs/var/data")
        );
        assert_eq!(
            join_under_rootfs(rootfs, Path::new("/../../etc")),
            PathBuf::from("/bundle/rootfs/etc")
        );
    }

    #[test]
    fn test_perform_bind_mount_sequence() -> Result<()> {
        let tmp = tempfile::tempdir()?;
        let rootfs = tmp.path().join("rootfs");
        std::fs::create_dir_all(&rootfs)?;
        let source = tmp.path().join("data");
        std::fs::create_dir_all(&source)?;

        let syscall = TestSyscall::default();
        let mount = MountRequest::Bind(BindMount::parse(&format!(
            "{},/data,ro",
            source.display()
        ))?);
        let target = mount.perform(&rootfs, &syscall)?;
        assert_eq!(target, rootfs.join("data"));

        let calls = syscall.get_mount_args();
        assert_eq!(calls.len(), 3);
        assert_eq!(calls[0].source.as_deref(), Some(source.as_path()));
        assert_eq!(calls[0].target, target);
        assert_eq!(calls[0].flags, MsFlags::MS_BIND | MsFlags::MS_REC);
        assert_eq!(calls[1].flags, MsFlags::MS_PRIVATE | MsFlags::MS_REC);
        assert!(calls[2]
            .flags
            .contains(MsFlags::MS_REMOUNT | MsFlags::MS_RDONLY));
        Ok(())
    }

    #[test]
    fn test_perform_requires_existing_source() -> Result<()> {
        let tmp = tempfile::tempdir()?;
        let syscall = TestSyscall::default();
        let mount = MountRequest::Bind(BindMount::parse("/nonexistent-source,/data")?);
        assert!(matches!(
            mount.perform(tmp.path(), &syscall),
            Err(MountError::MissingSource { .. })
        ));
        assert!(syscall.get_mount_args().is_empty());
        Ok(())
    }

    #[test]
    fn test_cgroup_allow_entry_for_null_device() -> Result<()> {
        let device = DeviceMount::parse("/dev/null:rw")?;
        let entry = device.cgroup_allow_entry()?;
        assert_eq!(entry.allow(), true);
        assert_eq!(entry.typ(), Some(LinuxDeviceType::C));
        assert_eq!(entry.major(), Some(1));
        assert_eq!(entry.minor(), Some(3));
        assert_eq!(entry.access().as_deref(), Some("rw"));
        Ok(())
    }

    #[test]
    fn test_cgroup_allow_entry_rejects_non_device() -> Result<()> {
        let tmp = tempfile::tempdir()?;
        let file = tmp.path().join("plain");
        std::fs::write(&file, b"")?;
        let device = DeviceMount {
            bind: BindMount::new(
                file,
                PathBuf::from("/dev/plain"),
                MsFlags::MS_REC | MsFlags::MS_PRIVATE,
            ),
            access: DeviceAccess::FULL,
        };
        assert!(matches!(
            device.cgroup_allow_entry(),
            Err(MountError::NotADevice { .. })
        ));
        Ok(())
    }
}
