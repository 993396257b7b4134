//! Image reference parsing.
//!
//! Parses references like `ghcr.io/org/bundle:v1` into a registry host,
//! a repository and exactly one selector (tag or digest).

use bundle_core::error::{BundleError, Result};

/// Registry substituted when the reference names none.
pub const DEFAULT_REGISTRY: &str = "index.docker.io";

/// Default tag when none is specified.
const DEFAULT_TAG: &str = "latest";

/// Selects one image within a repository.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Selector {
    /// Mutable tag (e.g., "latest", "v0.1.0")
    Tag(String),
    /// Content digest (e.g., "sha256:abc123...")
    Digest(String),
}

/// Parsed, normalized image reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageReference {
    /// Registry host, with port if one was given (e.g., "ghcr.io", "localhost:5000")
    pub registry: String,
    /// Repository path (e.g., "library/golang", "shipwright-io/sample-go/source-bundle")
    pub repository: String,
    /// Tag or digest
    pub selector: Selector,
}

impl ImageReference {
    /// Parse an image reference string.
    ///
    /// Supports formats:
    /// - `golang` → index.docker.io/library/golang:latest
    /// - `myuser/bundle:v1` → index.docker.io/myuser/bundle:v1
    /// - `ghcr.io/org/bundle` → ghcr.io/org/bundle:latest
    /// - `ghcr.io/org/bundle@sha256:abc...` → digest-addressed
    /// - `ghcr.io/org/bundle:v1@sha256:abc...` → digest-addressed, tag dropped
    pub fn parse(reference: &str) -> Result<Self> {
        let reference = reference.trim();
        if reference.is_empty() {
            return Err(BundleError::Usage("empty image reference".to_string()));
        }

        let (name_tag, digest) = match reference.rfind('@') {
            Some(at_pos) => {
                let digest = &reference[at_pos + 1..];
                validate_digest(digest).map_err(|reason| {
                    BundleError::Usage(format!(
                        "invalid digest in reference '{}': {}",
                        reference, reason
                    ))
                })?;
                (&reference[..at_pos], Some(digest.to_string()))
            }
            None => (reference, None),
        };

        let (name, tag) = split_tag(name_tag);
        if let Some(tag) = tag {
            if tag.is_empty() {
                return Err(BundleError::Usage(format!(
                    "empty tag in reference '{}'",
                    reference
                )));
            }
        }

        let (registry, repository) = split_registry_repository(name, reference)?;

        let selector = match (digest, tag) {
            (Some(digest), _) => Selector::Digest(digest),
            (None, Some(tag)) => Selector::Tag(tag.to_string()),
            (None, None) => Selector::Tag(DEFAULT_TAG.to_string()),
        };

        Ok(ImageReference {
            registry,
            repository,
            selector,
        })
    }

    /// The requested digest, for digest-addressed references.
    pub fn digest(&self) -> Option<&str> {
        match self.selector {
            Selector::Digest(ref d) => Some(d),
            Selector::Tag(_) => None,
        }
    }

    /// The requested tag, for tag-addressed references.
    pub fn tag(&self) -> Option<&str> {
        match self.selector {
            Selector::Tag(ref t) => Some(t),
            Selector::Digest(_) => None,
        }
    }

    /// Same repository, pinned to a digest.
    pub fn with_digest(&self, digest: impl Into<String>) -> Self {
        Self {
            registry: self.registry.clone(),
            repository: self.repository.clone(),
            selector: Selector::Digest(digest.into()),
        }
    }

    /// Whether the registry is Docker Hub.
    pub fn is_docker_hub(&self) -> bool {
        self.registry == DEFAULT_REGISTRY
    }

    /// Get the full reference string.
    pub fn full_reference(&self) -> String {
        match self.selector {
            Selector::Tag(ref tag) => format!("{}/{}:{}", self.registry, self.repository, tag),
            Selector::Digest(ref digest) => {
                format!("{}/{}@{}", self.registry, self.repository, digest)
            }
        }
    }
}

impl std::fmt::Display for ImageReference {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.full_reference())
    }
}

/// Split `name[:tag]`; a colon before the last `/` belongs to a registry port.
fn split_tag(name_tag: &str) -> (&str, Option<&str>) {
    let last_slash = name_tag.rfind('/').map(|p| p + 1).unwrap_or(0);
    match name_tag[last_slash..].rfind(':') {
        Some(colon_pos) => {
            let colon_pos = last_slash + colon_pos;
            (&name_tag[..colon_pos], Some(&name_tag[colon_pos + 1..]))
        }
        None => (name_tag, None),
    }
}

/// Split a name into registry and repository components.
fn split_registry_repository(name: &str, reference: &str) -> Result<(String, String)> {
    if let Some(slash_pos) = name.find('/') {
        let first = &name[..slash_pos];
        if first.contains('.') || first.contains(':') || first == "localhost" {
            let repo = &name[slash_pos + 1..];
            if repo.is_empty() {
                return Err(BundleError::Usage(format!(
                    "empty repository in reference '{}'",
                    reference
                )));
            }
            return Ok((normalize_registry(first), repo.to_string()));
        }
    }

    if name.is_empty() {
        return Err(BundleError::Usage(format!(
            "empty repository in reference '{}'",
            reference
        )));
    }

    let repository = if name.contains('/') {
        name.to_string()
    } else {
        format!("library/{}", name)
    };

    Ok((DEFAULT_REGISTRY.to_string(), repository))
}

/// Fold Docker Hub aliases onto the canonical host.
fn normalize_registry(registry: &str) -> String {
    let r = registry.to_lowercase();
    if r == "docker.io" || r == "registry-1.docker.io" {
        DEFAULT_REGISTRY.to_string()
    } else {
        r
    }
}

/// Check `algorithm:hex` shape. Only sha256 is accepted since it is the only
/// algorithm the fetcher can verify.
fn validate_digest(digest: &str) -> std::result::Result<(), String> {
    let (algorithm, hex) = digest
        .split_once(':')
        .ok_or_else(|| "expected algorithm:hex".to_string())?;
    if algorithm != "sha256" {
        return Err(format!("unsupported digest algorithm '{}'", algorithm));
    }
    if hex.len() != 64 || !hex.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()) {
        return Err("sha256 digest must be 64 lowercase hex characters".to_string());
    }
    Ok(())
}
