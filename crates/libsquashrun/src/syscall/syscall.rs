//! Interface trait for the kernel functionality the engine needs, so callers
//! never depend on a concrete implementation.

use std::any::Any;
use std::os::unix::io::RawFd;
use std::path::{Path, PathBuf};

use nix::mount::{MntFlags, MsFlags};
use nix::sched::CloneFlags;
use nix::sys::stat::Mode;
use nix::unistd::{Gid, Uid};

use crate::syscall::linux::LinuxSyscall;
use crate::syscall::test::TestSyscall;
use crate::syscall::Result;

/// The kernel surface used by bundle assembly and fd preservation.
pub trait Syscall {
    fn as_any(&self) -> &dyn Any;
    fn unshare(&self, flags: CloneFlags) -> Result<()>;
    fn mount(
        &self,
        source: Option<&Path>,
        target: &Path,
        fstype: Option<&str>,
        flags: MsFlags,
        data: Option<&str>,
    ) -> Result<()>;
    fn umount(&self, target: &Path, flags: MntFlags) -> Result<()>;
    fn chown(&self, path: &Path, owner: Option<Uid>, group: Option<Gid>) -> Result<()>;
    fn set_permissions(&self, path: &Path, mode: Mode) -> Result<()>;
    /// Attaches a file to a free loop device and returns the device path.
    fn loop_attach(&self, backing_file: &Path) -> Result<PathBuf>;
    fn loop_detach(&self, device: &Path) -> Result<()>;
    /// Duplicates a descriptor onto the lowest free slot at or above `min`.
    fn dup_fd(&self, fd: RawFd, min: RawFd) -> Result<RawFd>;
    fn dup2_fd(&self, old: RawFd, new: RawFd) -> Result<()>;
    fn close_fd(&self, fd: RawFd) -> Result<()>;
    fn clear_cloexec(&self, fd: RawFd) -> Result<()>;
}

#[derive(Clone, Copy)]
pub enum SyscallType {
    Linux,
    Test,
}

impl Default for SyscallType {
    fn default() -> Self {
        if cfg!(test) {
            SyscallType::Test
        } else {
            SyscallType::Linux
        }
    }
}

impl SyscallType {
    pub fn create_syscall(&self) -> Box<dyn Syscall> {
        match self {
            SyscallType::Linux => Box::new(LinuxSyscall),
            SyscallType::Test => Box::<TestSyscall>::default(),
        }
    }
}

pub fn create_syscall() -> Box<dyn Syscall> {
    SyscallType::default().create_syscall()
}
