//! Prints the repository index.

use std::io::{self, Write};

use anyhow::Result;
use clap::Parser;
use libsquashrun::config::EngineConfig;
use libsquashrun::image::store::ImageStore;
use libsquashrun::invocation::UserIdentity;
use tabwriter::TabWriter;

/// List the images in the repository
#[derive(Parser, Debug)]
pub struct Images {
    /// Use the site-wide repository instead of the user's
    #[clap(long)]
    pub centralized_repository: bool,
}

pub fn images(args: Images, config: &EngineConfig) -> Result<()> {
    let identity = UserIdentity::from_process();
    let repository = super::open_repository(config, &identity, args.centralized_repository)?;
    let index = ImageStore::new(&repository).list()?;

    let mut tab_writer = TabWriter::new(io::stdout());
    writeln!(
        &mut tab_writer,
        "REPOSITORY\tTAG\tDIGEST\tIMAGE ID\tCREATED\tSIZE"
    )?;
    for image in index {
        let reference = &image.reference;
        writeln!(
            &mut tab_writer,
            "{}/{}/{}\t{}\t{}\t{}\t{}\t{}",
            reference.server,
            reference.namespace,
            reference.name,
            reference.tag.as_deref().unwrap_or("<none>"),
            reference
                .digest
                .as_deref()
                .map(short_digest)
                .unwrap_or("<none>"),
            &image.id[..12.min(image.id.len())],
            image.created,
            image.datasize,
        )?;
    }
    tab_writer.flush()?;

    Ok(())
}

fn short_digest(digest: &str) -> &str {
    let hex = digest.strip_prefix("sha256:").unwrap_or(digest);
    &hex[..12.min(hex.len())]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_short_digest() {
        let digest = format!("sha256:{}", "a".repeat(64));
        assert_eq!(short_digest(&digest), "aaaaaaaaaaaa");
        assert_eq!(short_digest("abc"), "abc");
    }
}
