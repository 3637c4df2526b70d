//! Privileged operations behind a trait so the bundle assembler can be
//! exercised in unit tests without real mounts or namespaces.

pub mod linux;
#[allow(clippy::module_inception)]
pub mod syscall;
pub mod test;

pub use syscall::{create_syscall, Syscall};

#[derive(Debug, thiserror::Error)]
pub enum SyscallError {
    #[error(transparent)]
    Nix(#[from] nix::Error),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("no free loop device available")]
    NoFreeLoopDevice,
    #[error("injected test failure")]
    Injected,
}

type Result<T> = std::result::Result<T, SyscallError>;
