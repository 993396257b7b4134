use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use crate::error::{BundleError, Result};

/// Default extraction directory when `--target` is not given.
pub const DEFAULT_TARGET: &str = "/workspace/source";

/// User agent sent to registries.
pub const DEFAULT_USER_AGENT: &str = concat!("bundle-loader/", env!("CARGO_PKG_VERSION"));

/// Per-invocation loader configuration.
///
/// Built once from caller input and passed by reference into every stage.
#[derive(Debug, Clone)]
pub struct LoaderConfig {
    /// Image reference to load
    pub image: String,

    /// Extraction root for the source tree
    pub target: PathBuf,

    /// Docker `config.json` with registry credentials (anonymous if unset)
    pub secret_path: Option<PathBuf>,

    /// File that receives the resolved image digest
    pub result_file_image_digest: Option<PathBuf>,

    /// File that receives the image creation time as Unix seconds
    pub result_file_source_timestamp: Option<PathBuf>,

    /// Delete the remote image after a successful load
    pub prune: bool,

    /// Talk plain HTTP to the registry
    pub insecure: bool,

    /// Platform to select from multi-platform images
    pub platform: Platform,

    /// User agent for registry requests
    pub user_agent: &'static str,

    /// Ownership handling for extracted entries
    pub ownership: Ownership,
}

impl Default for LoaderConfig {
    fn default() -> Self {
        Self {
            image: String::new(),
            target: PathBuf::from(DEFAULT_TARGET),
            secret_path: None,
            result_file_image_digest: None,
            result_file_source_timestamp: None,
            prune: false,
            insecure: false,
            platform: Platform::default(),
            user_agent: DEFAULT_USER_AGENT,
            ownership: Ownership::default(),
        }
    }
}

impl LoaderConfig {
    /// Create a configuration for an image with defaults for everything else.
    pub fn new(image: impl Into<String>) -> Self {
        Self {
            image: image.into(),
            ..Default::default()
        }
    }

    /// Reject input that can never lead to a load.
    pub fn validate(&self) -> Result<()> {
        if self.image.trim().is_empty() {
            return Err(BundleError::Usage(
                "the 'image' argument must not be empty".to_string(),
            ));
        }
        if self.target.as_os_str().is_empty() {
            return Err(BundleError::Usage(
                "the 'target' argument must not be empty".to_string(),
            ));
        }
        Ok(())
    }
}

/// How extracted entries treat the uid/gid recorded in the layer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Ownership {
    /// Files belong to the extracting user
    #[default]
    Ignore,
    /// Apply the recorded uid/gid (requires privileges)
    Preserve,
}

/// Target platform in OCI terms (`os/architecture[/variant]`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Platform {
    pub os: String,
    pub architecture: String,
    pub variant: Option<String>,
}

impl Platform {
    /// Linux on the host CPU architecture.
    pub fn host() -> Self {
        let architecture = match std::env::consts::ARCH {
            "x86_64" => "amd64",
            "aarch64" => "arm64",
            "x86" => "386",
            other => other,
        };
        Self {
            os: "linux".to_string(),
            architecture: architecture.to_string(),
            variant: None,
        }
    }

    /// Whether an index entry's platform satisfies this one.
    ///
    /// Variants only take part when both sides state one.
    pub fn matches(&self, os: &str, architecture: &str, variant: Option<&str>) -> bool {
        if self.os != os || self.architecture != architecture {
            return false;
        }
        match (self.variant.as_deref(), variant) {
            (Some(want), Some(have)) => want == have,
            _ => true,
        }
    }
}

impl Default for Platform {
    fn default() -> Self {
        Self::host()
    }
}

impl FromStr for Platform {
    type Err = BundleError;

    fn from_str(s: &str) -> Result<Self> {
        let parts: Vec<&str> = s.trim().split('/').collect();
        let invalid = || {
            BundleError::Usage(format!(
                "invalid platform '{}': expected os/architecture[/variant]",
                s
            ))
        };
        match parts.as_slice() {
            [os, arch] if !os.is_empty() && !arch.is_empty() => Ok(Self {
                os: os.to_string(),
                architecture: arch.to_string(),
                variant: None,
            }),
            [os, arch, variant] if !os.is_empty() && !arch.is_empty() && !variant.is_empty() => {
                Ok(Self {
                    os: os.to_string(),
                    architecture: arch.to_string(),
                    variant: Some(variant.to_string()),
                })
            }
            _ => Err(invalid()),
        }
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.os, self.architecture)?;
        if let Some(ref variant) = self.variant {
            write!(f, "/{}", variant)?;
        }
        Ok(())
    }
}
