//! A Syscall implementation that records every call so tests can assert the
//! exact sequence of mounts and namespace operations.

use std::any::Any;
use std::cell::{Cell, RefCell};
use std::os::unix::io::RawFd;
use std::path::{Path, PathBuf};

use nix::mount::{MntFlags, MsFlags};
use nix::sched::CloneFlags;
use nix::sys::stat::Mode;
use nix::unistd::{Gid, Uid};

use super::{Result, Syscall, SyscallError};

#[derive(Clone, PartialEq, Eq, Debug)]
pub struct MountArgs {
    pub source: Option<PathBuf>,
    pub target: PathBuf,
    pub fstype: Option<String>,
    pub flags: MsFlags,
    pub data: Option<String>,
}

#[derive(Clone, PartialEq, Eq, Debug)]
pub struct ChownArgs {
    pub path: PathBuf,
    pub owner: Option<Uid>,
    pub group: Option<Gid>,
}

#[derive(Default)]
pub struct TestSyscall {
    unshare_args: RefCell<Vec<CloneFlags>>,
    mount_args: RefCell<Vec<MountArgs>>,
    umount_args: RefCell<Vec<PathBuf>>,
    chown_args: RefCell<Vec<ChownArgs>>,
    chmod_args: RefCell<Vec<(PathBuf, Mode)>>,
    loop_attach_args: RefCell<Vec<PathBuf>>,
    loop_detach_args: RefCell<Vec<PathBuf>>,
    dup_args: RefCell<Vec<(RawFd, RawFd)>>,
    dup2_args: RefCell<Vec<(RawFd, RawFd)>>,
    closed_fds: RefCell<Vec<RawFd>>,
    cloexec_cleared: RefCell<Vec<RawFd>>,
    next_dup_fd: Cell<RawFd>,
    // When set, the n-th subsequent mount call fails (0 = next call).
    fail_mount_after: Cell<Option<usize>>,
}

impl TestSyscall {
    pub fn get_unshare_args(&self) -> Vec<CloneFlags> {
        self.unshare_args.borrow().clone()
    }

    pub fn get_mount_args(&self) -> Vec<MountArgs> {
        self.mount_args.borrow().clone()
    }

    pub fn get_umount_args(&self) -> Vec<PathBuf> {
        self.umount_args.borrow().clone()
    }

    pub fn get_chown_args(&self) -> Vec<ChownArgs> {
        self.chown_args.borrow().clone()
    }

    pub fn get_chmod_args(&self) -> Vec<(PathBuf, Mode)> {
        self.chmod_args.borrow().clone()
    }

    pub fn get_loop_attach_args(&self) -> Vec<PathBuf> {
        self.loop_attach_args.borrow().clone()
    }

    pub fn get_loop_detach_args(&self) -> Vec<PathBuf> {
        self.loop_detach_args.borrow().clone()
    }

    pub fn get_dup2_args(&self) -> Vec<(RawFd, RawFd)> {
        self.dup2_args.borrow().clone()
    }

    pub fn get_closed_fds(&self) -> Vec<RawFd> {
        self.closed_fds.borrow().clone()
    }

    pub fn get_cloexec_cleared(&self) -> Vec<RawFd> {
        self.cloexec_cleared.borrow().clone()
    }

    /// Makes the mount call `calls_from_now` calls in the future fail.
    pub fn fail_mount_after(&self, calls_from_now: usize) {
        self.fail_mount_after.set(Some(calls_from_now));
    }
}

impl Syscall for TestSyscall {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn unshare(&self, flags: CloneFlags) -> Result<()> {
        self.unshare_args.borrow_mut().push(flags);
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
        if let Some(remaining) = self.fail_mount_after.get() {
            if remaining == 0 {
                self.fail_mount_after.set(None);
                return Err(SyscallError::Injected);
            }
            self.fail_mount_after.set(Some(remaining - 1));
        }
        self.mount_args.borrow_mut().push(MountArgs {
            source: source.map(Path::to_path_buf),
            target: target.to_path_buf(),
            fstype: fstype.map(str::to_string),
            flags,
            data: data.map(str::to_string),
        });
        Ok(())
    }

    fn umount(&self, target: &Path, _flags: MntFlags) -> Result<()> {
        self.umount_args.borrow_mut().push(target.to_path_buf());
        Ok(())
    }

    fn chown(&self, path: &Path, owner: Option<Uid>, group: Option<Gid>) -> Result<()> {
        self.chown_args.borrow_mut().push(ChownArgs {
            path: path.to_path_buf(),
            owner,
            group,
        });
        Ok(())
    }

    fn set_permissions(&self, path: &Path, mode: Mode) -> Result<()> {
        self.chmod_args.borrow_mut().push((path.to_path_buf(), mode));
        Ok(())
    }

    fn loop_attach(&self, backing_file: &Path) -> Result<PathBuf> {
        let device = PathBuf::from(format!("/dev/loop{}", self.loop_attach_args.borrow().len()));
        self.loop_attach_args
            .borrow_mut()
            .push(backing_file.to_path_buf());
        Ok(device)
    }

    fn loop_detach(&self, device: &Path) -> Result<()> {
        self.loop_detach_args
            .borrow_mut()
            .push(device.to_path_buf());
        Ok(())
    }

    fn dup_fd(&self, fd: RawFd, min: RawFd) -> Result<RawFd> {
        if self.next_dup_fd.get() < min {
            self.next_dup_fd.set(min);
        }
        let new = self.next_dup_fd.get();
        self.next_dup_fd.set(new + 1);
        self.dup_args.borrow_mut().push((fd, new));
        Ok(new)
    }

    fn dup2_fd(&self, old: RawFd, new: RawFd) -> Result<()> {
        self.dup2_args.borrow_mut().push((old, new));
        Ok(())
    }

    fn close_fd(&self, fd: RawFd) -> Result<()> {
        self.closed_fds.borrow_mut().push(fd);
        Ok(())
    }

    fn clear_cloexec(&self, fd: RawFd) -> Result<()> {
        self.cloexec_cleared.borrow_mut().push(fd);
        Ok(())
    }
}
