//! Image references and their identity hash.

use std::fmt;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

pub const DEFAULT_REGISTRY: &str = "docker.io";
pub const DEFAULT_TAG: &str = "latest";

static PATH_COMPONENT: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[a-z0-9]+(?:(?:[._]|__|-+)[a-z0-9]+)*$").expect("static regex"));
static TAG: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[A-Za-z0-9_][A-Za-z0-9_.-]{0,127}$").expect("static regex"));
static DIGEST: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[a-z0-9]+(?:[.+_-][a-z0-9]+)*:[a-fA-F0-9]{32,}$").expect("static regex"));

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ImageRefError {
    #[error("empty image reference")]
    Empty,
    #[error("image reference contains whitespace: {0:?}")]
    Whitespace(String),
    #[error("invalid repository path {path:?} in {reference:?}")]
    Repository { reference: String, path: String },
    #[error("invalid tag {tag:?} in {reference:?}")]
    Tag { reference: String, tag: String },
    #[error("invalid digest {digest:?} in {reference:?}")]
    Digest { reference: String, digest: String },
}

/// A parsed, normalized container image reference.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ImageRef {
    registry: String,
    repository: String,
    tag: Option<String>,
    digest: Option<String>,
}

impl ImageRef {
    pub fn parse(reference: &str) -> Result<Self, ImageRefError> {
        let input = reference.trim();
        if input.is_empty() {
            return Err(ImageRefError::Empty);
        }
        if input.chars().any(char::is_whitespace) {
            return Err(ImageRefError::Whitespace(reference.to_string()));
        }

        let (rest, digest) = match input.split_once('@') {
            Some((r, d)) => {
                if !DIGEST.is_match(d) {
                    return Err(ImageRefError::Digest { reference: input.to_string(), digest: d.to_string() });
                }
                (r, Some(d.to_string()))
            }
            None => (input, None),
        };

        // A ':' after the last '/' separates the tag; earlier ones belong to a registry port.
        let last_slash = rest.rfind('/').map(|i| i + 1).unwrap_or(0);
        let (name, tag) = match rest[last_slash..].rfind(':') {
            Some(i) => {
                let split = last_slash + i;
                let tag = &rest[split + 1..];
                if !TAG.is_match(tag) {
                    return Err(ImageRefError::Tag { reference: input.to_string(), tag: tag.to_string() });
                }
                (&rest[..split], Some(tag.to_string()))
            }
            None => (rest, None),
        };

        let (registry, path) = match name.split_once('/') {
            Some((first, remainder)) if is_registry_host(first) => (normalize_registry(first), remainder.to_string()),
            _ => (DEFAULT_REGISTRY.to_string(), name.to_string()),
        };
        let repository = if registry == DEFAULT_REGISTRY && !path.contains('/') {
            format!("library/{}", path)
        } else {
            path
        };
        if repository.is_empty() || !repository.split('/').all(|c| PATH_COMPONENT.is_match(c)) {
            return Err(ImageRefError::Repository { reference: input.to_string(), path: repository });
        }

        Ok(Self { registry, repository, tag, digest })
    }

    pub fn registry(&self) -> &str { &self.registry }
    pub fn repository(&self) -> &str { &self.repository }
    pub fn digest(&self) -> Option<&str> { self.digest.as_deref() }

    /// Tag, defaulting to `latest` when neither tag nor digest was given.
    pub fn tag(&self) -> Option<&str> {
        match (&self.tag, &self.digest) {
            (Some(t), _) => Some(t.as_str()),
            (None, Some(_)) => None,
            (None, None) => Some(DEFAULT_TAG),
        }
    }

    /// `registry/repository`, without tag or digest.
    pub fn name(&self) -> String { format!("{}/{}", self.registry, self.repository) }

    /// Fully-qualified form used for hashing and for talking to runtimes.
    pub fn canonical(&self) -> String {
        let mut out = self.name();
        if let Some(tag) = self.tag() {
            out.push(':');
            out.push_str(tag);
        }
        if let Some(d) = &self.digest {
            out.push('@');
            out.push_str(d);
        }
        out
    }

    pub fn identity(&self) -> IdentityHash { IdentityHash::of(&self.canonical()) }

    /// Same repository and tag under another registry (mirror destination).
    pub fn rehome(&self, registry: &str) -> Self {
        Self { registry: normalize_registry(registry), ..self.clone() }
    }
}

impl fmt::Display for ImageRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(&self.canonical()) }
}

impl std::str::FromStr for ImageRef {
    type Err = ImageRefError;
    fn from_str(s: &str) -> Result<Self, Self::Err> { Self::parse(s) }
}

fn is_registry_host(component: &str) -> bool {
    component.contains('.') || component.contains(':') || component == "localhost"
}

/// Normalize a registry host or docker-config key to a bare host[:port].
pub fn normalize_registry(raw: &str) -> String {
    let s = raw.trim();
    let s = s.strip_prefix("https://").or_else(|| s.strip_prefix("http://")).unwrap_or(s);
    let host = s.split('/').next().unwrap_or("").to_ascii_lowercase();
    match host.as_str() {
        "index.docker.io" | "registry-1.docker.io" | "registry.hub.docker.com" | "" => DEFAULT_REGISTRY.to_string(),
        _ => host,
    }
}

/// Content-derived identity of an image: first 16 bytes of SHA-256, hex encoded.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct IdentityHash(String);

impl IdentityHash {
    pub fn of(canonical: &str) -> Self {
        let digest = Sha256::digest(canonical.as_bytes());
        Self(hex::encode(&digest[..16]))
    }

    /// Wrap an already-computed hash (e.g. one read back from a label key).
    pub fn from_raw(raw: impl Into<String>) -> Self { Self(raw.into()) }

    pub fn as_str(&self) -> &str { &self.0 }
}

impl fmt::Display for IdentityHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(&self.0) }
}

/// An image some declaration wants on machines.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManagedImage {
    pub reference: ImageRef,
    pub hash: IdentityHash,
}

impl ManagedImage {
    pub fn parse(reference: &str) -> Result<Self, ImageRefError> {
        let reference = ImageRef::parse(reference)?;
        let hash = reference.identity();
        Ok(Self { reference, hash })
    }

    pub fn name(&self) -> String { self.reference.canonical() }
}
