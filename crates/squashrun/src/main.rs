//! squashrun: pull OCI images into squashfs files and run them through an
//! external OCI runtime.

mod commands;
mod observability;

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use libsquashrun::config::{EngineConfig, DEFAULT_CONFIG_FILE};

#[derive(Parser, Debug)]
#[clap(version, author, about)]
pub struct Opts {
    #[clap(flatten)]
    pub global: GlobalOpts,
    #[clap(subcommand)]
    subcmd: SubCommand,
}

#[derive(Args, Debug)]
pub struct GlobalOpts {
    /// Change log level to debug
    #[clap(long)]
    pub debug: bool,
    /// Set the log level: error, warn, info, debug, trace
    #[clap(long)]
    pub log_level: Option<String>,
    /// Write logs to a file instead of stderr
    #[clap(long)]
    pub log: Option<PathBuf>,
    /// Log format: text or json
    #[clap(long)]
    pub log_format: Option<String>,
    /// Path to the engine configuration file
    #[clap(long, default_value = DEFAULT_CONFIG_FILE)]
    pub config: PathBuf,
}

#[derive(Subcommand, Debug)]
enum SubCommand {
    Pull(commands::pull::Pull),
    Images(commands::images::Images),
    Rmi(commands::rmi::Rmi),
    Run(commands::run::Run),
}

fn main() {
    let opts = Opts::parse();
    let debug = opts.global.debug;

    match run_subcommand(opts) {
        Ok(exit_code) => std::process::exit(exit_code),
        Err(err) => {
            // The outermost message for the user; the full context chain
            // when debugging.
            if debug {
                eprintln!("squashrun: {err:?}");
            } else {
                eprintln!("squashrun: {err:#}");
            }
            std::process::exit(1);
        }
    }
}

fn run_subcommand(opts: Opts) -> Result<i32> {
    observability::init(&opts).context("failed to initialize logging")?;

    let config = EngineConfig::load(&opts.global.config).with_context(|| {
        format!(
            "failed to load engine configuration from {:?}",
            opts.global.config
        )
    })?;

    match opts.subcmd {
        SubCommand::Pull(args) => commands::pull::pull(args, &config).map(|()| 0),
        SubCommand::Images(args) => commands::images::images(args, &config).map(|()| 0),
        SubCommand::Rmi(args) => commands::rmi::rmi(args, &config).map(|()| 0),
        SubCommand::Run(args) => commands::run::run(args, &config),
    }
}
