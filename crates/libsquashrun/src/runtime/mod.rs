//! The launch path: mount namespace and overlay assembly, configuration
//! merging, fd preservation, and execution of the OCI runtime.

pub mod bundle;
pub mod configs_merger;
pub mod driver;
pub mod fd_handler;
pub mod mounts;
pub mod oci_config;
