//! Load command: fetch an image and unpack it into the target directory.

use std::path::PathBuf;

use bundle_core::error::Result;
use bundle_core::{LoaderConfig, Ownership, Platform, DEFAULT_TARGET};
use bundle_runtime::{LoadReport, PruneOutcome};
use clap::Args;
use tokio_util::sync::CancellationToken;

#[derive(Args, Debug)]
pub struct LoadArgs {
    /// Image reference of the source bundle (e.g., "ghcr.io/org/app/source-bundle:latest")
    #[arg(long)]
    pub image: String,

    /// Directory the source tree is unpacked into
    #[arg(long, default_value = DEFAULT_TARGET)]
    pub target: PathBuf,

    /// Docker config.json with registry credentials (anonymous access if omitted)
    #[arg(long)]
    pub secret_path: Option<PathBuf>,

    /// File that receives the digest of the loaded image
    #[arg(long)]
    pub result_file_image_digest: Option<PathBuf>,

    /// File that receives the image creation time as Unix seconds
    #[arg(long)]
    pub result_file_source_timestamp: Option<PathBuf>,

    /// Delete the image from its registry after a successful load
    #[arg(long)]
    pub prune: bool,

    /// Talk plain HTTP to the registry
    #[arg(long)]
    pub insecure: bool,

    /// Platform to select from multi-platform images (e.g., "linux/amd64", "linux/arm/v7")
    #[arg(long)]
    pub platform: Option<String>,

    /// Apply the uid/gid recorded in the layers (requires privileges)
    #[arg(long)]
    pub preserve_ownership: bool,
}

impl LoadArgs {
    /// Build the per-invocation configuration.
    pub fn into_config(self) -> Result<LoaderConfig> {
        let platform = match self.platform {
            Some(ref p) => p.parse::<Platform>()?,
            None => Platform::default(),
        };

        let config = LoaderConfig {
            image: self.image,
            target: self.target,
            secret_path: self.secret_path,
            result_file_image_digest: self.result_file_image_digest,
            result_file_source_timestamp: self.result_file_source_timestamp,
            prune: self.prune,
            insecure: self.insecure,
            platform,
            ownership: if self.preserve_ownership {
                Ownership::Preserve
            } else {
                Ownership::Ignore
            },
            ..Default::default()
        };
        config.validate()?;
        Ok(config)
    }
}

pub async fn execute(args: LoadArgs, cancel: CancellationToken) -> Result<LoadReport> {
    let config = args.into_config()?;
    let report = bundle_runtime::load(&config, cancel).await?;

    tracing::info!(
        reference = %report.reference,
        digest = %report.digest,
        layers = report.layers,
        entries = report.summary.entries,
        target = %config.target.display(),
        "Source bundle loaded"
    );
    if let PruneOutcome::Failed(ref reason) = report.prune {
        tracing::warn!(reason = %reason, "Image was loaded but could not be pruned");
    }

    Ok(report)
}
