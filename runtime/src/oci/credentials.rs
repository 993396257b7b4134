//! Registry credential resolution.
//!
//! Reads a Docker `config.json` style credential store and selects the entry
//! for one registry host. Matching is exact after normalization; a store that
//! has no entry for the host is a configuration error that names every host
//! the store does know about.

use std::collections::{BTreeMap, HashMap};
use std::path::Path;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use bundle_core::error::{BundleError, Result};
use oci_distribution::secrets::RegistryAuth;
use serde::Deserialize;

use super::reference::DEFAULT_REGISTRY;

/// Credential handed to the registry client.
#[derive(Clone, PartialEq, Eq)]
pub enum Credential {
    /// No credentials; public pulls only.
    Anonymous,
    /// Username/password pair.
    Basic { username: String, password: String },
}

impl Credential {
    pub fn basic(username: impl Into<String>, password: impl Into<String>) -> Self {
        Credential::Basic {
            username: username.into(),
            password: password.into(),
        }
    }

    pub fn is_anonymous(&self) -> bool {
        matches!(self, Credential::Anonymous)
    }

    /// Convert to oci-distribution auth type.
    pub(crate) fn to_oci_auth(&self) -> RegistryAuth {
        match self {
            Credential::Anonymous => RegistryAuth::Anonymous,
            Credential::Basic { username, password } => {
                RegistryAuth::Basic(username.clone(), password.clone())
            }
        }
    }
}

// Keeps secrets out of logs.
impl std::fmt::Debug for Credential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Credential::Anonymous => write!(f, "Anonymous"),
            Credential::Basic { username, .. } => f
                .debug_struct("Basic")
                .field("username", username)
                .field("password", &"<redacted>")
                .finish(),
        }
    }
}

/// One `auths` entry as written by `docker login`.
#[derive(Debug, Clone, Default, Deserialize)]
struct AuthEntry {
    #[serde(default)]
    auth: Option<String>,
    #[serde(default)]
    username: Option<String>,
    #[serde(default)]
    password: Option<String>,
    #[serde(default)]
    identitytoken: Option<String>,
    #[serde(default)]
    registrytoken: Option<String>,
}

/// Docker `config.json` file format (only the parts we read).
#[derive(Debug, Default, Deserialize)]
struct DockerConfigFile {
    #[serde(default)]
    auths: HashMap<String, AuthEntry>,
}

/// Immutable, host-indexed credential store.
#[derive(Debug, Default)]
pub struct CredentialStore {
    entries: BTreeMap<String, AuthEntry>,
}

impl CredentialStore {
    /// Load a store from a Docker `config.json` file.
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path).map_err(|e| {
            BundleError::CredentialStore(format!(
                "failed to read credential store {}: {}",
                path.display(),
                e
            ))
        })?;
        Self::parse(&data).map_err(|e| match e {
            BundleError::SerializationError(msg) => BundleError::CredentialStore(format!(
                "failed to parse credential store {}: {}",
                path.display(),
                msg
            )),
            other => other,
        })
    }

    /// Build a store from `config.json` contents.
    ///
    /// Keys that normalize to the same host are rejected rather than
    /// resolved by precedence.
    pub fn parse(data: &str) -> Result<Self> {
        let file: DockerConfigFile = serde_json::from_str(data)?;

        let mut entries = BTreeMap::new();
        for (key, entry) in file.auths {
            let host = normalize_registry(&key);
            if entries.insert(host.clone(), entry).is_some() {
                return Err(BundleError::CredentialStore(format!(
                    "multiple credential entries normalize to registry {}",
                    host
                )));
            }
        }

        Ok(Self { entries })
    }

    /// All configured hosts, normalized and sorted.
    pub fn registries(&self) -> Vec<String> {
        self.entries.keys().cloned().collect()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Select the credential for a registry host.
    pub fn get(&self, registry: &str) -> Result<Credential> {
        let host = normalize_registry(registry);
        let entry = self
            .entries
            .get(&host)
            .ok_or_else(|| BundleError::CredentialMismatch {
                host: registry.to_string(),
                available: self.registries(),
            })?;
        decode_entry(&host, entry)
    }
}

/// Resolve the credential for `registry` from an optional store file.
///
/// No store means anonymous access. A store that exists but has no entry for
/// the host (including an empty store) is a `CredentialMismatch`.
pub fn resolve_credential(registry: &str, secret_path: Option<&Path>) -> Result<Credential> {
    let Some(path) = secret_path.filter(|p| !p.as_os_str().is_empty()) else {
        tracing::debug!(registry = %registry, "No credential store given, using anonymous access");
        return Ok(Credential::Anonymous);
    };

    let store = CredentialStore::load(path)?;
    let credential = store.get(registry)?;

    tracing::debug!(
        registry = %registry,
        store = %path.display(),
        "Resolved registry credentials"
    );
    Ok(credential)
}

/// Turn a stored entry into separate identity and secret.
fn decode_entry(host: &str, entry: &AuthEntry) -> Result<Credential> {
    // Token entries carry a placeholder `auth` that is not a real password.
    let has_token = [&entry.identitytoken, &entry.registrytoken]
        .iter()
        .any(|t| t.as_deref().map_or(false, |t| !t.is_empty()));
    if has_token {
        return Err(BundleError::CredentialStore(format!(
            "credential entry for registry {} uses a token, which is not supported; \
             provide username/password credentials instead",
            host
        )));
    }

    if let Some(ref auth) = entry.auth {
        if !auth.is_empty() {
            let decoded = STANDARD.decode(auth.trim()).map_err(|e| {
                BundleError::CredentialStore(format!(
                    "invalid auth encoding for registry {}: {}",
                    host, e
                ))
            })?;
            let decoded = String::from_utf8(decoded).map_err(|_| {
                BundleError::CredentialStore(format!(
                    "auth for registry {} is not valid UTF-8",
                    host
                ))
            })?;
            let (username, password) = decoded.split_once(':').ok_or_else(|| {
                BundleError::CredentialStore(format!(
                    "auth for registry {} is not in username:password form",
                    host
                ))
            })?;
            return Ok(Credential::basic(username, password));
        }
    }

    match (&entry.username, &entry.password) {
        (Some(u), Some(p)) if !u.is_empty() => Ok(Credential::basic(u.clone(), p.clone())),
        _ => Err(BundleError::CredentialStore(format!(
            "credential entry for registry {} has neither auth nor username/password",
            host
        ))),
    }
}

/// Normalize a registry key: lowercase, no scheme, no trailing slash or API
/// version suffix, Docker Hub aliases folded onto `index.docker.io`.
pub fn normalize_registry(registry: &str) -> String {
    let mut r = registry.trim().to_lowercase();
    for scheme in ["https://", "http://"] {
        if let Some(rest) = r.strip_prefix(scheme) {
            r = rest.to_string();
        }
    }
    let mut r = r.trim_end_matches('/').to_string();
    for suffix in ["/v1", "/v2"] {
        if let Some(rest) = r.strip_suffix(suffix) {
            r = rest.to_string();
        }
    }
    if r == "docker.io" || r == "registry-1.docker.io" {
        DEFAULT_REGISTRY.to_string()
    } else {
        r
    }
}
