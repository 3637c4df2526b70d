//! Image reference parsing, rendering and key derivation.
//!
//! A reference is written `[server/][namespace/...]name[:tag][@digest]`. The
//! left-most `/`-separated token is a server only when it contains a `.`, a
//! `:`, or equals `localhost`; everything between server and name forms the
//! namespace. Tag and digest may coexist.

use std::fmt;

use serde::{Deserialize, Serialize};

pub const DEFAULT_SERVER: &str = "docker.io";
pub const DEFAULT_NAMESPACE: &str = "library";
pub const DEFAULT_TAG: &str = "latest";

/// Joins the reference fields into a single legal filename. Chosen because
/// `+` cannot appear in any reference field, keeping distinct references
/// mapped to distinct keys.
const KEY_SEPARATOR: char = '+';

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ReferenceError {
    #[error("empty image reference")]
    Empty,
    #[error("invalid image reference {reference:?}: empty segment")]
    EmptySegment { reference: String },
    #[error("invalid image reference {reference:?}: path traversal segment")]
    TraversalSegment { reference: String },
    #[error("invalid image reference {reference:?}: malformed digest, expected sha256:<64 hex>")]
    MalformedDigest { reference: String },
}

type Result<T> = std::result::Result<T, ReferenceError>;

/// Identifies a container image by registry coordinates.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageReference {
    pub server: String,
    pub namespace: String,
    pub name: String,
    /// Defaults to "latest" only when no digest is given.
    #[serde(skip_serializing_if = "Option::is_none")]
    #[serde(default)]
    pub tag: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    #[serde(default)]
    pub digest: Option<String>,
}

impl ImageReference {
    pub fn parse(reference: &str) -> Result<Self> {
        let reference = reference.trim();
        if reference.is_empty() {
            return Err(ReferenceError::Empty);
        }
        if reference
            .split(&['/', ':', '@'][..])
            .any(|segment| segment == "..")
        {
            return Err(ReferenceError::TraversalSegment {
                reference: reference.to_string(),
            });
        }

        let (remainder, digest) = match reference.split_once('@') {
            Some((head, digest)) => {
                if !is_valid_digest(digest) {
                    return Err(ReferenceError::MalformedDigest {
                        reference: reference.to_string(),
                    });
                }
                (head, Some(digest.to_string()))
            }
            None => (reference, None),
        };

        // The tag separator is a ':' after the last '/'.
        let last_slash = remainder.rfind('/').map(|i| i + 1).unwrap_or(0);
        let (path, tag) = match remainder[last_slash..].find(':') {
            Some(colon) => {
                let split_at = last_slash + colon;
                (
                    &remainder[..split_at],
                    Some(remainder[split_at + 1..].to_string()),
                )
            }
            None => (remainder, None),
        };

        let mut tokens: Vec<&str> = path.split('/').collect();
        if tokens.iter().any(|token| token.is_empty())
            || tag.as_deref().is_some_and(str::is_empty)
        {
            return Err(ReferenceError::EmptySegment {
                reference: reference.to_string(),
            });
        }

        // With three or more path levels the first is always the server;
        // with two, only a host-like token (a dot, a port, or "localhost")
        // is, otherwise it is a namespace level on the default registry.
        let server = if tokens.len() > 2 || (tokens.len() == 2 && is_server_token(tokens[0])) {
            tokens.remove(0).to_string()
        } else {
            DEFAULT_SERVER.to_string()
        };

        let name = tokens
            .pop()
            .ok_or_else(|| ReferenceError::EmptySegment {
                reference: reference.to_string(),
            })?
            .to_string();

        let namespace = if tokens.is_empty() {
            DEFAULT_NAMESPACE.to_string()
        } else {
            tokens.join("/")
        };

        let tag = match (&tag, &digest) {
            (None, None) => Some(DEFAULT_TAG.to_string()),
            _ => tag,
        };

        Ok(ImageReference {
            server,
            namespace,
            name,
            tag,
            digest,
        })
    }

    /// The filesystem-safe identifier used to name repository artifacts.
    /// Always five `+`-separated fields; namespace levels are flattened and
    /// the digest's algorithm separator is replaced, so the result is a
    /// single legal filename.
    pub fn key(&self) -> String {
        let namespace = self.namespace.replace('/', "_");
        let digest = self
            .digest
            .as_deref()
            .unwrap_or("")
            .replace(':', "-");
        format!(
            "{server}{sep}{namespace}{sep}{name}{sep}{tag}{sep}{digest}",
            server = self.server,
            namespace = namespace,
            name = self.name,
            tag = self.tag.as_deref().unwrap_or(""),
            digest = digest,
            sep = KEY_SEPARATOR,
        )
    }

    /// The `server/namespace/name[:tag][@digest]` form passed to the copier.
    pub fn canonical(&self) -> String {
        self.to_string()
    }

    /// Same coordinates apart from the digest. Used by lookups where the
    /// query carries no digest.
    pub fn same_repository_and_tag(&self, other: &ImageReference) -> bool {
        self.server == other.server
            && self.namespace == other.namespace
            && self.name == other.name
            && self.tag == other.tag
    }
}

impl fmt::Display for ImageReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.server, self.namespace, self.name)?;
        if let Some(tag) = &self.tag {
            write!(f, ":{tag}")?;
        }
        if let Some(digest) = &self.digest {
            write!(f, "@{digest}")?;
        }
        Ok(())
    }
}

fn is_server_token(token: &str) -> bool {
    token.contains('.') || token.contains(':') || token == "localhost"
}

fn is_valid_digest(digest: &str) -> bool {
    match digest.split_once(':') {
        Some(("sha256", hex)) => hex.len() == 64 && hex.chars().all(|c| c.is_ascii_hexdigit()),
        _ => false,
    }
}
