//! OCI registry client for resolving images and streaming layer blobs.
//!
//! Uses the `oci-distribution` crate to talk to container registries
//! (Docker Hub, GHCR, Quay, self-hosted distribution).

use std::future::Future;
use std::io::{BufReader, Seek, SeekFrom};

use async_trait::async_trait;
use bundle_core::error::{BundleError, Result};
use bundle_core::Platform;
use chrono::{DateTime, Utc};
use oci_distribution::client::{ClientConfig, ClientProtocol};
use oci_distribution::manifest::{ImageIndexEntry, OciDescriptor, OciImageManifest, OciManifest};
use oci_distribution::{Client, Reference};
use serde::Deserialize;
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;

use super::credentials::Credential;
use super::image::{
    sha256_digest, sha256_reader, verify_digest, ImageDescriptor, ImageSource, LayerReader,
    LayerRef,
};
use super::reference::ImageReference;

/// Manifest media types the client accepts.
const MANIFEST_MEDIA_TYPES: &[&str] = &[
    "application/vnd.oci.image.manifest.v1+json",
    "application/vnd.oci.image.index.v1+json",
    "application/vnd.docker.distribution.manifest.v2+json",
    "application/vnd.docker.distribution.manifest.list.v2+json",
];

/// Registry client configuration, built once per invocation.
#[derive(Debug, Clone)]
pub struct ClientOptions {
    /// Credential for the image's registry
    pub credential: Credential,
    /// User agent sent by the pruner. oci-distribution 0.11 has no setting for
    /// it, so manifest and blob fetches go out with the library default.
    pub user_agent: &'static str,
    /// Aborts in-flight requests when cancelled
    pub cancel: CancellationToken,
    /// Use plain HTTP
    pub insecure: bool,
    /// Platform selected from image indexes
    pub platform: Platform,
}

impl ClientOptions {
    pub fn new(credential: Credential, cancel: CancellationToken) -> Self {
        Self {
            credential,
            user_agent: bundle_core::DEFAULT_USER_AGENT,
            cancel,
            insecure: false,
            platform: Platform::default(),
        }
    }

    pub(crate) fn protocol(&self) -> ClientProtocol {
        if self.insecure {
            ClientProtocol::Http
        } else {
            ClientProtocol::Https
        }
    }
}

/// The parts of an image config we care about.
#[derive(Debug, Default, Deserialize)]
struct ImageConfigFile {
    #[serde(default)]
    os: Option<String>,
    #[serde(default)]
    architecture: Option<String>,
    #[serde(default)]
    variant: Option<String>,
    #[serde(default)]
    created: Option<String>,
}

/// Pulls image manifests and layer blobs from a container registry.
pub struct RegistryClient {
    client: Client,
    options: ClientOptions,
}

impl RegistryClient {
    /// Create a registry client from explicit options.
    pub fn new(options: ClientOptions) -> Self {
        let config = ClientConfig {
            protocol: options.protocol(),
            ..Default::default()
        };
        let client = Client::new(config);

        Self { client, options }
    }

    /// Run a registry call unless the invocation is cancelled first.
    async fn cancellable<T>(&self, fut: impl Future<Output = T>) -> Result<T> {
        tokio::select! {
            biased;
            _ = self.options.cancel.cancelled() => Err(BundleError::Cancelled),
            value = fut => Ok(value),
        }
    }

    /// Pull a manifest as raw bytes.
    async fn pull_raw_manifest(&self, reference: &ImageReference) -> Result<Vec<u8>> {
        let oci_ref = to_oci_reference(reference)?;
        let auth = self.options.credential.to_oci_auth();

        let (raw, _) = self
            .cancellable(
                self.client
                    .pull_manifest_raw(&oci_ref, &auth, MANIFEST_MEDIA_TYPES),
            )
            .await?
            .map_err(|e| BundleError::Fetch {
                reference: reference.to_string(),
                message: format!("failed to pull manifest: {}", e),
            })?;

        Ok(raw)
    }

    /// Pick the platform manifest out of an index and pull it.
    async fn resolve_index_entry(
        &self,
        reference: &ImageReference,
        entries: &[ImageIndexEntry],
    ) -> Result<(OciImageManifest, String)> {
        let entry = select_platform_entry(entries, &self.options.platform).ok_or_else(|| {
            let available: Vec<String> = entries
                .iter()
                .filter_map(|m| m.platform.as_ref())
                .map(|p| format!("{}/{}", p.os, p.architecture))
                .collect();
            BundleError::Fetch {
                reference: reference.to_string(),
                message: format!(
                    "no manifest for platform {}, available: {}",
                    self.options.platform,
                    available.join(", ")
                ),
            }
        })?;

        tracing::debug!(
            reference = %reference,
            digest = %entry.digest,
            platform = %self.options.platform,
            "Selected manifest from image index"
        );

        let child = reference.with_digest(entry.digest.clone());
        let raw = self.pull_raw_manifest(&child).await?;
        verify_platform_manifest(reference, entry, &raw)
    }

    /// Pull and parse the image config blob.
    async fn pull_config(
        &self,
        reference: &ImageReference,
        config: &OciDescriptor,
    ) -> Result<ImageConfigFile> {
        let oci_ref = to_oci_reference(reference)?;
        let mut data: Vec<u8> = Vec::new();
        self.cancellable(self.client.pull_blob(&oci_ref, config, &mut data))
            .await?
            .map_err(|e| BundleError::Fetch {
                reference: reference.to_string(),
                message: format!("failed to pull config blob: {}", e),
            })?;
        verify_digest(&config.digest, &sha256_digest(&data))?;

        serde_json::from_slice(&data).map_err(|e| BundleError::Fetch {
            reference: reference.to_string(),
            message: format!("invalid image config: {}", e),
        })
    }
}

#[async_trait]
impl ImageSource for RegistryClient {
    async fn resolve(&self, reference: &ImageReference) -> Result<ImageDescriptor> {
        tracing::info!(
            reference = %reference,
            anonymous = self.options.credential.is_anonymous(),
            "Resolving image"
        );

        let raw = self.pull_raw_manifest(reference).await?;
        let (manifest, digest) = verify_manifest(reference, &raw, reference.digest())?;

        let (manifest, digest, index_digest) = match manifest {
            OciManifest::Image(manifest) => (manifest, digest, None),
            OciManifest::ImageIndex(index) => {
                let (manifest, child_digest) =
                    self.resolve_index_entry(reference, &index.manifests).await?;
                (manifest, child_digest, Some(digest))
            }
        };

        let config = self.pull_config(reference, &manifest.config).await?;
        let platform = match (config.os, config.architecture) {
            (Some(os), Some(architecture)) => Some(Platform {
                os,
                architecture,
                variant: config.variant,
            }),
            _ => None,
        };
        let created = config.created.as_deref().and_then(parse_created);

        let layers = manifest
            .layers
            .iter()
            .map(|l| LayerRef {
                digest: l.digest.clone(),
                media_type: l.media_type.clone(),
                size: l.size.max(0) as u64,
            })
            .collect::<Vec<_>>();

        tracing::info!(
            reference = %reference,
            digest = %digest,
            layers = layers.len(),
            "Image resolved"
        );

        Ok(ImageDescriptor {
            digest,
            media_type: manifest
                .media_type
                .clone()
                .unwrap_or_else(|| MANIFEST_MEDIA_TYPES[0].to_string()),
            index_digest,
            platform,
            created,
            layers,
        })
    }

    /// Spool a layer blob to an anonymous temp file, verify its digest, and
    /// hand back a reader positioned at the start.
    async fn open_layer(
        &self,
        reference: &ImageReference,
        layer: &LayerRef,
    ) -> Result<LayerReader> {
        let oci_ref = to_oci_reference(reference)?;
        let fetch_err = |message: String| BundleError::Fetch {
            reference: reference.to_string(),
            message,
        };

        tracing::debug!(
            digest = %layer.digest,
            size = layer.size,
            "Pulling layer"
        );

        let descriptor = OciDescriptor {
            media_type: layer.media_type.clone(),
            digest: layer.digest.clone(),
            size: layer.size as i64,
            urls: None,
            annotations: None,
        };

        let spool = tempfile::tempfile()
            .map_err(|e| fetch_err(format!("failed to create layer spool file: {}", e)))?;
        let mut file = tokio::fs::File::from_std(spool);
        self.cancellable(self.client.pull_blob(&oci_ref, &descriptor, &mut file))
            .await?
            .map_err(|e| fetch_err(format!("failed to pull layer {}: {}", layer.digest, e)))?;
        file.flush()
            .await
            .map_err(|e| fetch_err(format!("failed to spool layer {}: {}", layer.digest, e)))?;
        let spool = file.into_std().await;

        let expected = layer.digest.clone();
        let spool = tokio::task::spawn_blocking(move || -> Result<std::fs::File> {
            let mut spool = spool;
            spool.seek(SeekFrom::Start(0))?;
            let actual = sha256_reader(&mut spool)?;
            verify_digest(&expected, &actual)?;
            spool.seek(SeekFrom::Start(0))?;
            Ok(spool)
        })
        .await
        .map_err(|e| fetch_err(format!("layer verification task failed: {}", e)))??;

        Ok(Box::new(BufReader::new(spool)))
    }
}

/// Convert an ImageReference to an oci-distribution Reference.
pub(crate) fn to_oci_reference(reference: &ImageReference) -> Result<Reference> {
    let ref_str = reference.full_reference();
    ref_str.parse::<Reference>().map_err(|e| {
        BundleError::Usage(format!("invalid image reference '{}': {}", ref_str, e))
    })
}

/// Digest `raw` locally, check it against `expected` and parse it.
fn verify_manifest(
    reference: &ImageReference,
    raw: &[u8],
    expected: Option<&str>,
) -> Result<(OciManifest, String)> {
    let digest = sha256_digest(raw);
    if let Some(expected) = expected {
        verify_digest(expected, &digest)?;
    }
    Ok((parse_manifest(reference, raw)?, digest))
}

/// Check a platform manifest pulled for an index `entry`.
fn verify_platform_manifest(
    reference: &ImageReference,
    entry: &ImageIndexEntry,
    raw: &[u8],
) -> Result<(OciImageManifest, String)> {
    match verify_manifest(reference, raw, Some(&entry.digest))? {
        (OciManifest::Image(manifest), digest) => Ok((manifest, digest)),
        (OciManifest::ImageIndex(_), _) => Err(BundleError::Fetch {
            reference: reference.to_string(),
            message: "nested image index not supported".to_string(),
        }),
    }
}

fn parse_manifest(reference: &ImageReference, raw: &[u8]) -> Result<OciManifest> {
    serde_json::from_slice(raw).map_err(|e| BundleError::Fetch {
        reference: reference.to_string(),
        message: format!("invalid manifest: {}", e),
    })
}

/// First index entry whose platform satisfies `platform`.
fn select_platform_entry<'a>(
    entries: &'a [ImageIndexEntry],
    platform: &Platform,
) -> Option<&'a ImageIndexEntry> {
    entries.iter().find(|entry| {
        entry.platform.as_ref().map_or(false, |p| {
            platform.matches(&p.os, &p.architecture, p.variant.as_deref())
        })
    })
}

fn parse_created(created: &str) -> Option<DateTime<Utc>> {
    match DateTime::parse_from_rfc3339(created) {
        Ok(t) => Some(t.with_timezone(&Utc)),
        Err(e) => {
            tracing::warn!(created = %created, error = %e, "Ignoring unparsable image creation time");
            None
        }
    }
}
