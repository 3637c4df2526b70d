//! Engine library for squashrun, a user-space HPC container engine.
//!
//! Images pulled from OCI registries are stored in a per-user or site-wide
//! repository as one loop-mountable squashfs file per reference. At launch
//! time the engine assembles an OCI bundle in a private mount namespace
//! (squashfs lower layer, tmpfs-backed writable upper layer) and hands it to
//! an external OCI runtime.

pub mod config;
pub mod image;
pub mod invocation;
pub mod reference;
pub mod repository;
pub mod runtime;
pub mod syscall;
pub mod utils;
