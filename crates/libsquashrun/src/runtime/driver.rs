//! Forks and executes the external OCI runtime, proxying signals and
//! propagating its exit status.

use std::ffi::CString;
use std::path::{Path, PathBuf};

use nix::sys::signal::{kill, SigSet, Signal};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::{chdir, execv, fork, getpid, getppid, ForkResult, Pid};

use crate::config::EngineConfig;
use crate::utils;

/// Signals the parent forwards to the runtime; everything else is handled
/// locally or ignored.
const PROXIED_SIGNALS: [Signal; 6] = [
    Signal::SIGINT,
    Signal::SIGTERM,
    Signal::SIGHUP,
    Signal::SIGQUIT,
    Signal::SIGUSR1,
    Signal::SIGUSR2,
];

/// PATH installed after the host environment is cleared, just enough for the
/// runtime and its hooks.
const SCRUBBED_PATH: &str = "/bin:/sbin:/usr/bin";

#[derive(Debug, thiserror::Error)]
pub enum DriverError {
    #[error("failed to change directory to bundle {path:?}")]
    Chdir { path: PathBuf, source: nix::Error },
    #[error("failed to clear the host environment")]
    ClearEnv,
    #[error("failed to set up signal handling")]
    SignalSetup { source: nix::Error },
    #[error("failed to fork the OCI runtime process")]
    Fork { source: nix::Error },
    #[error("failed to wait for the OCI runtime")]
    Wait { source: nix::Error },
    #[error("runtime argument {argument:?} contains an interior nul byte")]
    BadArgument { argument: String },
}

type Result<T> = std::result::Result<T, DriverError>;

pub struct RuntimeDriver<'a> {
    config: &'a EngineConfig,
}

impl<'a> RuntimeDriver<'a> {
    pub fn new(config: &'a EngineConfig) -> Self {
        RuntimeDriver { config }
    }

    /// Runs `runc run --preserve-fds <n> <container-id>` from inside the
    /// bundle directory and returns the code this process should exit with:
    /// the runtime's own exit code, or 128+signal when it was killed.
    pub fn execute(&self, bundle_dir: &Path, preserved_fds: i32) -> Result<i32> {
        let container_id = format!("container-{}", utils::random_hex_string(16));
        tracing::info!(container_id = %container_id, "executing OCI runtime");

        chdir(bundle_dir).map_err(|err| DriverError::Chdir {
            path: bundle_dir.to_path_buf(),
            source: err,
        })?;

        // Nothing from the caller's environment may leak into the runtime or
        // its hooks. Safe because the process is single threaded here.
        scrub_environment()?;

        let argv = build_runtime_argv(self.config, preserved_fds, &container_id)?;

        // Block everything up front: the parent receives the proxied signals
        // through sigwait, and the child resets the mask before exec.
        let all_signals = SigSet::all();
        all_signals
            .thread_block()
            .map_err(|err| DriverError::SignalSetup { source: err })?;

        let parent_pid = getpid();
        match unsafe { fork() }.map_err(|err| DriverError::Fork { source: err })? {
            ForkResult::Child => {
                // Ask for SIGHUP should the engine die unexpectedly, then
                // close the race: the parent may have exited before the
                // prctl call took effect.
                if prctl::set_death_signal(Signal::SIGHUP as isize).is_err() {
                    std::process::exit(126);
                }
                if getppid() != parent_pid {
                    std::process::exit(126);
                }
                let _ = SigSet::empty().thread_set_mask();
                let _ = execv(&argv[0], &argv);
                // Only reached when exec failed.
                std::process::exit(127);
            }
            ForkResult::Parent { child } => {
                let status = self.supervise(child, &all_signals);
                tracing::info!(container_id = %container_id, status = ?status,
                    "OCI runtime finished");
                status
            }
        }
    }

    /// Waits for the runtime while forwarding the proxied signals to it.
    fn supervise(&self, child: Pid, signals: &SigSet) -> Result<i32> {
        loop {
            let signal = signals
                .wait()
                .map_err(|err| DriverError::SignalSetup { source: err })?;
            match signal {
                Signal::SIGCHLD => {
                    // Reap until the runtime itself is accounted for.
                    loop {
                        match waitpid(None, Some(WaitPidFlag::WNOHANG))
                            .map_err(|err| DriverError::Wait { source: err })?
                        {
                            WaitStatus::Exited(pid, code) if pid == child => {
                                return Ok(code);
                            }
                            WaitStatus::Signaled(pid, signal, _) if pid == child => {
                                return Ok(128 + signal as i32);
                            }
                            WaitStatus::StillAlive => break,
                            _ => {}
                        }
                    }
                }
                signal if PROXIED_SIGNALS.contains(&signal) => {
                    // Nothing useful to do if forwarding fails.
                    let _ = kill(child, signal);
                }
                _ => {}
            }
        }
    }
}

fn scrub_environment() -> Result<()> {
    if unsafe { libc::clearenv() } != 0 {
        return Err(DriverError::ClearEnv);
    }
    std::env::set_var("PATH", SCRUBBED_PATH);
    Ok(())
}

fn build_runtime_argv(
    config: &EngineConfig,
    preserved_fds: i32,
    container_id: &str,
) -> Result<Vec<CString>> {
    [
        config.runc_path.display().to_string(),
        "run".to_string(),
        "--preserve-fds".to_string(),
        preserved_fds.to_string(),
        container_id.to_string(),
    ]
    .into_iter()
    .map(|argument| {
        CString::new(argument.clone()).map_err(|_| DriverError::BadArgument { argument })
    })
    .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result;

    #[test]
    fn test_build_runtime_argv() -> Result<()> {
        let config = crate::config::test_config();
        let argv = build_runtime_argv(&config, 2, "container-0123456789abcdef")?;
        let rendered: Vec<&str> = argv.iter().map(|arg| arg.to_str().unwrap()).collect();
        assert_eq!(
            rendered,
            vec![
                "/usr/bin/runc",
                "run",
                "--preserve-fds",
                "2",
                "container-0123456789abcdef",
            ]
        );
        Ok(())
    }

    #[test]
    fn test_build_runtime_argv_rejects_nul() {
        let config = crate::config::test_config();
        assert!(matches!(
            build_runtime_argv(&config, 0, "id\0withnul"),
            Err(DriverError::BadArgument { .. })
        ));
    }

    #[test]
    fn test_container_id_shape() {
        let id = format!("container-{}", utils::random_hex_string(16));
        let suffix = id.strip_prefix("container-").unwrap();
        assert_eq!(suffix.len(), 16);
        assert!(suffix.chars().all(|c| c.is_ascii_hexdigit()));
    }
}
