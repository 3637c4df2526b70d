//! Preserves file descriptors across the exec of the OCI runtime.
//!
//! Requested descriptors (the PMI fd, duplicates of the host stdout/stderr
//! for the hooks) are compacted into a contiguous range starting at 3, with
//! close-on-exec cleared, so the runtime can be told `--preserve-fds <n>`.
//! Environment variables and bundle annotations that referenced the original
//! numbers are rewritten to the new ones.

use std::collections::HashMap;
use std::os::unix::io::RawFd;

use crate::syscall::{Syscall, SyscallError};

const PMI_FD: &str = "PMI_FD";
const STDOUT_ANNOTATION: &str = "com.squashrun.hooks.stdout_fd";
const STDERR_ANNOTATION: &str = "com.squashrun.hooks.stderr_fd";

/// The preserved range starts right after stderr.
const FIRST_PRESERVED_FD: RawFd = 3;
/// Staging area well above any fd the engine holds open.
const STAGING_FD_MIN: RawFd = 128;

#[derive(Debug, thiserror::Error)]
pub enum FdError {
    #[error("invalid {PMI_FD} value {value:?}")]
    InvalidPmiFd { value: String },
    #[error("failed to duplicate file descriptor {fd}")]
    Duplicate { fd: RawFd, source: SyscallError },
    #[error("failed to renumber file descriptor {from} to {to}")]
    Renumber {
        from: RawFd,
        to: RawFd,
        source: SyscallError,
    },
}

type Result<T> = std::result::Result<T, FdError>;

#[derive(Debug)]
struct PreservedFd {
    fd: RawFd,
    /// Environment variable holding the fd number, rewritten on renumber.
    env_key: Option<&'static str>,
    /// Bundle annotation advertising the fd to hooks.
    annotation: Option<&'static str>,
    /// Whether the original descriptor should be closed after renumbering.
    close_original: bool,
}

#[derive(Default)]
pub struct FdHandler {
    preserved: Vec<PreservedFd>,
}

impl FdHandler {
    pub fn new() -> Self {
        FdHandler::default()
    }

    /// Keeps the PMI descriptor alive for the MPI wire-up when the workload
    /// manager provided one.
    pub fn preserve_pmi_fd(&mut self, environment: &HashMap<String, String>) -> Result<()> {
        let Some(value) = environment.get(PMI_FD) else {
            return Ok(());
        };
        let fd: RawFd = value.parse().map_err(|_| FdError::InvalidPmiFd {
            value: value.clone(),
        })?;
        tracing::info!(fd, "preserving PMI file descriptor");
        self.preserved.push(PreservedFd {
            fd,
            env_key: Some(PMI_FD),
            annotation: None,
            close_original: true,
        });
        Ok(())
    }

    /// Duplicates the host stdout and stderr so hooks can write to the
    /// user's terminal even after the runtime redirects the container's.
    pub fn pass_stdio_to_hooks(&mut self, syscall: &dyn Syscall) -> Result<()> {
        for (fd, annotation) in [(1, STDOUT_ANNOTATION), (2, STDERR_ANNOTATION)] {
            let duplicate = syscall
                .dup_fd(fd, STAGING_FD_MIN)
                .map_err(|err| FdError::Duplicate { fd, source: err })?;
            self.preserved.push(PreservedFd {
                fd: duplicate,
                env_key: None,
                annotation: Some(annotation),
                close_original: true,
            });
        }
        Ok(())
    }

    /// Compacts all preserved descriptors into `3..3+n`, clears their
    /// close-on-exec flag, rewrites environment variables and records
    /// annotations. Returns `n`, the count passed as `--preserve-fds`.
    pub fn apply(
        &mut self,
        syscall: &dyn Syscall,
        environment: &mut HashMap<String, String>,
        annotations: &mut HashMap<String, String>,
    ) -> Result<i32> {
        // Two phases, so a descriptor sitting on a slot that is some other
        // entry's target can never be clobbered: first everything moves to a
        // staging range, then each lands on its final slot.
        let mut staged: Vec<RawFd> = Vec::with_capacity(self.preserved.len());
        for entry in &self.preserved {
            let high = syscall
                .dup_fd(entry.fd, STAGING_FD_MIN)
                .map_err(|err| FdError::Duplicate {
                    fd: entry.fd,
                    source: err,
                })?;
            if entry.close_original && entry.fd > 2 {
                let _ = syscall.close_fd(entry.fd);
            }
            staged.push(high);
        }

        for (index, (entry, high)) in self.preserved.iter().zip(&staged).enumerate() {
            let target = FIRST_PRESERVED_FD + index as RawFd;
            let renumber_error = |source| FdError::Renumber {
                from: *high,
                to: target,
                source,
            };
            syscall.dup2_fd(*high, target).map_err(renumber_error)?;
            syscall.clear_cloexec(target).map_err(renumber_error)?;
            let _ = syscall.close_fd(*high);

            if let Some(key) = entry.env_key {
                environment.insert(key.to_string(), target.to_string());
            }
            if let Some(annotation) = entry.annotation {
                annotations.insert(annotation.to_string(), target.to_string());
            }
            tracing::info!(from = entry.fd, to = target, "preserved file descriptor");
        }

        Ok(self.preserved.len() as i32)
    }
}
