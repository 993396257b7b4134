//! Bundle load orchestrator.
//!
//! One invocation is a single pass through
//! credentials → fetch → extract → record → prune,
//! stopping at the first fatal error. Pruning is best effort and never fails
//! the load.

use bundle_core::error::{BundleError, ErrorKind, Result};
use bundle_core::{LoaderConfig, Platform};
use tokio_util::sync::CancellationToken;

use super::credentials::resolve_credential;
use super::image::{verify_digest, ImageDescriptor, ImageRemover, ImageSource, LayerSequence};
use super::layers::{BundleExtractor, ExtractSummary, LayerCompression};
use super::prune::RegistryPruner;
use super::reference::ImageReference;
use super::registry::{ClientOptions, RegistryClient};
use super::result::{record_digest, record_source_timestamp};

/// What happened to the remote image after the load.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PruneOutcome {
    /// Pruning was not requested
    Skipped,
    /// The registry accepted the delete
    Deleted,
    /// The delete failed; the load still succeeded
    Failed(String),
}

/// Summary of a successful load.
#[derive(Debug, Clone)]
pub struct LoadReport {
    /// Normalized image reference
    pub reference: String,
    /// Digest of the image manifest that was extracted
    pub digest: String,
    /// Platform recorded in the image config
    pub platform: Option<Platform>,
    /// Number of layers applied
    pub layers: usize,
    pub summary: ExtractSummary,
    pub prune: PruneOutcome,
}

/// Load the bundle described by `config` from its registry.
///
/// Credentials are resolved before any network access, so input and
/// credential problems fail fast.
pub async fn load(config: &LoaderConfig, cancel: CancellationToken) -> Result<LoadReport> {
    config.validate()?;
    let reference = ImageReference::parse(&config.image)?;
    let credential = resolve_credential(&reference.registry, config.secret_path.as_deref())?;

    let options = ClientOptions {
        credential,
        user_agent: config.user_agent,
        cancel: cancel.clone(),
        insecure: config.insecure,
        platform: config.platform.clone(),
    };
    let client = RegistryClient::new(options.clone());
    let pruner = RegistryPruner::new(&options);

    BundleLoader::new(config, &client, &pruner, cancel)
        .run(&reference)
        .await
}

/// Drives one load against an image source.
pub struct BundleLoader<'a> {
    config: &'a LoaderConfig,
    source: &'a dyn ImageSource,
    remover: &'a dyn ImageRemover,
    cancel: CancellationToken,
}

impl<'a> BundleLoader<'a> {
    pub fn new(
        config: &'a LoaderConfig,
        source: &'a dyn ImageSource,
        remover: &'a dyn ImageRemover,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            config,
            source,
            remover,
            cancel,
        }
    }

    /// Fetch, extract, record and optionally prune `reference`.
    pub async fn run(&self, reference: &ImageReference) -> Result<LoadReport> {
        tracing::info!(
            reference = %reference,
            target = %self.config.target.display(),
            "Loading bundle"
        );

        let descriptor = self.source.resolve(reference).await?;
        self.check_descriptor(reference, &descriptor)?;

        let summary = self.extract(reference, &descriptor).await?;

        record_digest(
            self.config.result_file_image_digest.as_deref(),
            &descriptor.digest,
        )?;
        record_source_timestamp(
            self.config.result_file_source_timestamp.as_deref(),
            descriptor.created,
        )?;

        // Deleting only a platform child would leave the index and its tag behind.
        let top_level = descriptor
            .index_digest
            .as_deref()
            .unwrap_or(&descriptor.digest);
        let prune = self.prune(reference, top_level).await;

        tracing::info!(
            reference = %reference,
            digest = %descriptor.digest,
            layers = descriptor.layers.len(),
            entries = summary.entries,
            "Bundle loaded"
        );

        Ok(LoadReport {
            reference: reference.to_string(),
            digest: descriptor.digest,
            platform: descriptor.platform,
            layers: descriptor.layers.len(),
            summary,
            prune,
        })
    }

    /// Reject descriptors that cannot be extracted before touching the target.
    fn check_descriptor(
        &self,
        reference: &ImageReference,
        descriptor: &ImageDescriptor,
    ) -> Result<()> {
        if let Some(expected) = reference.digest() {
            let resolved = descriptor
                .index_digest
                .as_deref()
                .unwrap_or(&descriptor.digest);
            verify_digest(expected, resolved)?;
        }

        for layer in &descriptor.layers {
            if LayerCompression::from_media_type(&layer.media_type).is_none() {
                return Err(BundleError::Fetch {
                    reference: reference.to_string(),
                    message: format!(
                        "unsupported layer media type '{}' for {}",
                        layer.media_type, layer.digest
                    ),
                });
            }
        }
        Ok(())
    }

    async fn extract(
        &self,
        reference: &ImageReference,
        descriptor: &ImageDescriptor,
    ) -> Result<ExtractSummary> {
        let mut extractor = BundleExtractor::new(
            &self.config.target,
            self.config.ownership,
            self.cancel.clone(),
        )?;
        let mut layers = LayerSequence::new(self.source, reference, descriptor);

        while let Some(next) = layers.next_layer().await {
            let (layer, reader) = next?;
            let compression = LayerCompression::from_media_type(&layer.media_type)
                .unwrap_or(LayerCompression::None);

            tracing::debug!(
                digest = %layer.digest,
                media_type = %layer.media_type,
                remaining = layers.remaining(),
                "Extracting layer"
            );

            extractor = tokio::task::spawn_blocking(move || -> Result<BundleExtractor> {
                extractor.apply_layer(reader, compression)?;
                Ok(extractor)
            })
            .await
            .map_err(|e| BundleError::Extract(format!("extraction task failed: {}", e)))??;
        }

        tokio::task::spawn_blocking(move || extractor.finish())
            .await
            .map_err(|e| BundleError::Extract(format!("extraction task failed: {}", e)))?
    }

    async fn prune(&self, reference: &ImageReference, digest: &str) -> PruneOutcome {
        if !self.config.prune {
            return PruneOutcome::Skipped;
        }

        match self.remover.delete(reference, digest).await {
            Ok(()) => {
                tracing::info!(reference = %reference, digest = %digest, "Pruned image");
                PruneOutcome::Deleted
            }
            Err(e) => {
                let cancelled = e.kind() == ErrorKind::Cancelled;
                tracing::warn!(
                    reference = %reference,
                    error = %e,
                    cancelled,
                    "Failed to prune image"
                );
                PruneOutcome::Failed(e.to_string())
            }
        }
    }
}
