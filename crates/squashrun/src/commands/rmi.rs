//! Deletes an image's artifacts and index entry.

use anyhow::{Context, Result};
use clap::Parser;
use libsquashrun::config::EngineConfig;
use libsquashrun::image::store::ImageStore;
use libsquashrun::invocation::UserIdentity;

/// Remove an image from the repository
#[derive(Parser, Debug)]
pub struct Rmi {
    /// Use the site-wide repository instead of the user's
    #[clap(long)]
    pub centralized_repository: bool,
    /// Image reference to remove
    pub reference: String,
}

pub fn rmi(args: Rmi, config: &EngineConfig) -> Result<()> {
    let reference = super::parse_cli_reference(&args.reference)?;
    let identity = UserIdentity::from_process();
    let repository = super::open_repository(config, &identity, args.centralized_repository)?;

    ImageStore::new(&repository)
        .remove(&reference)
        .with_context(|| format!("failed to remove image {reference}"))?;
    println!("removed {reference}");
    Ok(())
}
