//! Assembles an OCI bundle for an image and executes the OCI runtime.

use std::collections::HashMap;
use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::Parser;
use libsquashrun::config::EngineConfig;
use libsquashrun::image::store::ImageStore;
use libsquashrun::invocation::{Invocation, UserIdentity};
use libsquashrun::runtime::bundle::BundleAssembler;
use libsquashrun::runtime::driver::RuntimeDriver;
use libsquashrun::runtime::mounts::{BindMount, DeviceMount, MountRequest};
use libsquashrun::syscall::create_syscall;
use libsquashrun::utils;

/// Run a command inside a container from a pulled image
#[derive(Parser, Debug)]
pub struct Run {
    /// Use the site-wide repository instead of the user's
    #[clap(long)]
    pub centralized_repository: bool,
    /// Bind mount into the container: src,dst[,ro|rw][,recursive|private]
    #[clap(long = "mount")]
    pub mounts: Vec<String>,
    /// Expose a host device: host[:container[:access]] with access in "rwm"
    #[clap(long = "device")]
    pub devices: Vec<String>,
    /// Override the image entrypoint
    #[clap(long)]
    pub entrypoint: Option<String>,
    /// Working directory inside the container
    #[clap(long)]
    pub workdir: Option<PathBuf>,
    /// Set an environment variable in the container (repeatable)
    #[clap(long = "env", value_name = "KEY=VALUE")]
    pub env: Vec<String>,
    /// Enable the MPI hook
    #[clap(long)]
    pub mpi: bool,
    /// Enable the SSH hook
    #[clap(long)]
    pub ssh: bool,
    /// Run an init process inside the container
    #[clap(long)]
    pub init: bool,
    /// Enable PMIx support
    #[clap(long)]
    pub pmix: bool,
    /// Image reference
    pub reference: String,
    /// Command and arguments executed inside the container
    #[clap(trailing_var_arg = true, allow_hyphen_values = true)]
    pub command: Vec<String>,
}

pub fn run(args: Run, config: &EngineConfig) -> Result<i32> {
    let reference = super::parse_cli_reference(&args.reference)?;
    let identity = UserIdentity::from_process();
    let repository = super::open_repository(config, &identity, args.centralized_repository)?;

    let store = ImageStore::new(&repository);
    let Some(image) = store.lookup(&reference)? else {
        bail!("image {reference} is not in the repository, pull it first");
    };

    let invocation = build_invocation(&args, config, identity)?;

    let bundle_dir = config
        .temp_dir
        .join(format!("squashrun-bundle-{}", utils::random_hex_string(16)));
    std::fs::create_dir_all(&bundle_dir)
        .with_context(|| format!("failed to create bundle directory {bundle_dir:?}"))?;

    let mut assembler = BundleAssembler::new(
        config,
        &invocation,
        &image,
        bundle_dir.clone(),
        create_syscall(),
    );
    let status = match assembler.assemble() {
        Ok(()) => RuntimeDriver::new(config)
            .execute(&bundle_dir, assembler.preserved_fd_count())
            .context("failed to execute the OCI runtime"),
        Err(err) => Err(err).context("failed to assemble the OCI bundle"),
    };

    // Mounts first (reverse order), then the bundle directory itself, on
    // success and failure alike.
    assembler.release();
    if let Err(err) = std::fs::remove_dir_all(&bundle_dir) {
        tracing::warn!(path = %bundle_dir.display(), error = %err,
            "failed to remove bundle directory");
    }

    status
}

fn build_invocation(
    args: &Run,
    config: &EngineConfig,
    identity: UserIdentity,
) -> Result<Invocation> {
    let mut invocation = Invocation::new(identity);

    let mut host_environment: HashMap<String, String> = std::env::vars().collect();
    for assignment in &args.env {
        let Some((key, value)) = utils::split_env_var(assignment) else {
            bail!("invalid --env value {assignment:?}, expected KEY=VALUE");
        };
        host_environment.insert(key, value);
    }
    invocation.host_environment = host_environment;

    invocation.entrypoint = args.entrypoint.clone().map(|entry| vec![entry]);
    invocation.exec_args = args.command.clone();
    invocation.workdir_override = args.workdir.clone();
    invocation.use_mpi = args.mpi;
    invocation.enable_ssh = args.ssh;
    invocation.add_init_process = args.init;
    invocation.enable_pmix = args.pmix;

    // Site mounts apply before user mounts.
    for request in config.site_mounts.iter().chain(&args.mounts) {
        let mount = BindMount::parse(request)
            .with_context(|| format!("invalid mount request {request:?}"))?;
        invocation.mounts.push(MountRequest::Bind(mount));
    }
    for request in config.site_devices.iter().chain(&args.devices) {
        let device = DeviceMount::parse(request)
            .with_context(|| format!("invalid device request {request:?}"))?;
        invocation.device_mounts.push(device);
    }

    Ok(invocation)
}
