//! Implements the Syscall trait against the real kernel.

use std::any::Any;
use std::fs::{self, OpenOptions};
use std::os::unix::io::{AsRawFd, RawFd};
use std::os::unix::prelude::PermissionsExt;
use std::path::{Path, PathBuf};

use nix::fcntl::{fcntl, FcntlArg, FdFlag};
use nix::mount::{mount, umount2, MntFlags, MsFlags};
use nix::sched::{unshare, CloneFlags};
use nix::sys::stat::Mode;
use nix::unistd::{chown, close, dup2, Gid, Uid};

use super::{Result, Syscall, SyscallError};

// Loop device ioctls, see loop(4).
const LOOP_SET_FD: libc::c_ulong = 0x4C00;
const LOOP_CLR_FD: libc::c_ulong = 0x4C01;
const LOOP_CTL_GET_FREE: libc::c_ulong = 0x4C82;

const LOOP_CONTROL: &str = "/dev/loop-control";

#[derive(Clone)]
pub struct LinuxSyscall;

impl Syscall for LinuxSyscall {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn unshare(&self, flags: CloneFlags) -> Result<()> {
        unshare(flags)?;
        Ok(())
    }

    fn mount(
        &self,
        source: Option<&Path>,
        target: &Path,
        fstype: Option<&str>,
        flags: MsFlags,
        data: Option<&str>,
    ) -> Result<()> {
        mount(source, target, fstype, flags, data)?;
        Ok(())
    }

    fn umount(&self, target: &Path, flags: MntFlags) -> Result<()> {
        umount2(target, flags)?;
        Ok(())
    }

    fn chown(&self, path: &Path, owner: Option<Uid>, group: Option<Gid>) -> Result<()> {
        chown(path, owner, group)?;
        Ok(())
    }

    fn set_permissions(&self, path: &Path, mode: Mode) -> Result<()> {
        fs::set_permissions(path, fs::Permissions::from_mode(mode.bits()))?;
        Ok(())
    }

    fn loop_attach(&self, backing_file: &Path) -> Result<PathBuf> {
        let control = OpenOptions::new()
            .read(true)
            .write(true)
            .open(LOOP_CONTROL)?;
        let device_number =
            unsafe { libc::ioctl(control.as_raw_fd(), LOOP_CTL_GET_FREE as _) };
        if device_number < 0 {
            return Err(SyscallError::NoFreeLoopDevice);
        }

        let device = PathBuf::from(format!("/dev/loop{device_number}"));
        let device_file = OpenOptions::new().read(true).write(true).open(&device)?;
        let backing = OpenOptions::new().read(true).open(backing_file)?;
        let ret = unsafe {
            libc::ioctl(
                device_file.as_raw_fd(),
                LOOP_SET_FD as _,
                backing.as_raw_fd(),
            )
        };
        if ret < 0 {
            return Err(std::io::Error::last_os_error().into());
        }

        Ok(device)
    }

    fn loop_detach(&self, device: &Path) -> Result<()> {
        let device_file = OpenOptions::new().read(true).open(device)?;
        let ret = unsafe { libc::ioctl(device_file.as_raw_fd(), LOOP_CLR_FD as _, 0) };
        if ret < 0 {
            return Err(std::io::Error::last_os_error().into());
        }
        Ok(())
    }

    fn dup_fd(&self, fd: RawFd, min: RawFd) -> Result<RawFd> {
        let new = fcntl(fd, FcntlArg::F_DUPFD(min))?;
        Ok(new)
    }

    fn dup2_fd(&self, old: RawFd, new: RawFd) -> Result<()> {
        dup2(old, new)?;
        Ok(())
    }

    fn close_fd(&self, fd: RawFd) -> Result<()> {
        close(fd)?;
        Ok(())
    }

    fn clear_cloexec(&self, fd: RawFd) -> Result<()> {
        fcntl(fd, FcntlArg::F_SETFD(FdFlag::empty()))?;
        Ok(())
    }
}
