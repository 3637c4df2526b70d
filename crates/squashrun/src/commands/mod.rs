use anyhow::{bail, Context, Result};
use libsquashrun::config::EngineConfig;
use libsquashrun::invocation::UserIdentity;
use libsquashrun::reference::ImageReference;
use libsquashrun::repository::Repository;

pub mod images;
pub mod pull;
pub mod rmi;
pub mod run;

/// Parses an image reference given on the command line. Rejects `..`
/// anywhere in the string before the reference grammar is even consulted.
pub(crate) fn parse_cli_reference(reference: &str) -> Result<ImageReference> {
    if reference.contains("..") {
        bail!("invalid image reference {reference:?}: must not contain '..'");
    }
    ImageReference::parse(reference)
        .with_context(|| format!("failed to parse image reference {reference:?}"))
}

pub(crate) fn open_repository(
    config: &EngineConfig,
    identity: &UserIdentity,
    centralized: bool,
) -> Result<Repository> {
    let repository = if centralized {
        Repository::open_centralized(config, identity)
            .context("failed to open the centralized repository")?
    } else {
        Repository::open_local(config, identity).context("failed to open the local repository")?
    };
    Ok(repository)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_cli_reference_rejects_traversal_anywhere() {
        for input in ["../image", "image:..", "image@..", "a..b"] {
            assert!(parse_cli_reference(input).is_err(), "accepted {input:?}");
        }
        assert!(parse_cli_reference("server.com/ns/image:tag").is_ok());
    }
}
