//! Resolved image metadata and the seams between the loader and a registry.
//!
//! An [`ImageSource`] resolves a reference to an [`ImageDescriptor`] and opens
//! layer blobs one at a time. [`LayerSequence`] walks the descriptor's layers
//! in manifest order, handing each reader out exactly once.

use std::io::Read;

use async_trait::async_trait;
use bundle_core::error::{BundleError, Result};
use bundle_core::Platform;
use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};

use super::reference::ImageReference;

/// Raw (still compressed) layer blob content.
pub type LayerReader = Box<dyn Read + Send>;

/// One layer of an image manifest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LayerRef {
    /// Content digest of the blob
    pub digest: String,
    /// Layer media type (decides decompression)
    pub media_type: String,
    /// Blob size in bytes
    pub size: u64,
}

/// A reference resolved to one concrete image manifest.
#[derive(Debug, Clone)]
pub struct ImageDescriptor {
    /// Digest of the image manifest
    pub digest: String,
    /// Media type of the image manifest
    pub media_type: String,
    /// Digest of the index the manifest was selected from, if any
    pub index_digest: Option<String>,
    /// Platform recorded in the image config
    pub platform: Option<Platform>,
    /// Creation time recorded in the image config
    pub created: Option<DateTime<Utc>>,
    /// Layers, oldest first
    pub layers: Vec<LayerRef>,
}

/// Something that can resolve image references and serve layer blobs.
#[async_trait]
pub trait ImageSource: Send + Sync {
    /// Resolve a reference to a concrete image manifest.
    async fn resolve(&self, reference: &ImageReference) -> Result<ImageDescriptor>;

    /// Open the content of one layer blob.
    async fn open_layer(&self, reference: &ImageReference, layer: &LayerRef)
        -> Result<LayerReader>;
}

/// Something that can delete an image from its registry.
#[async_trait]
pub trait ImageRemover: Send + Sync {
    /// Delete the image `reference` resolved to `digest`.
    async fn delete(&self, reference: &ImageReference, digest: &str) -> Result<()>;
}

/// Finite, single-pass sequence of layer readers in manifest order.
pub struct LayerSequence<'a> {
    source: &'a dyn ImageSource,
    reference: &'a ImageReference,
    pending: std::vec::IntoIter<LayerRef>,
}

impl<'a> LayerSequence<'a> {
    pub fn new(
        source: &'a dyn ImageSource,
        reference: &'a ImageReference,
        descriptor: &ImageDescriptor,
    ) -> Self {
        Self {
            source,
            reference,
            pending: descriptor.layers.clone().into_iter(),
        }
    }

    /// Number of layers not yet opened.
    pub fn remaining(&self) -> usize {
        self.pending.len()
    }

    /// Open the next layer, or `None` once every layer has been handed out.
    pub async fn next_layer(&mut self) -> Option<Result<(LayerRef, LayerReader)>> {
        let layer = self.pending.next()?;
        Some(
            self.source
                .open_layer(self.reference, &layer)
                .await
                .map(|reader| (layer, reader)),
        )
    }
}

/// `sha256:<hex>` digest of a byte slice.
pub fn sha256_digest(data: &[u8]) -> String {
    format!("sha256:{}", hex::encode(Sha256::digest(data)))
}

/// `sha256:<hex>` digest of everything a reader yields.
pub fn sha256_reader(reader: &mut impl Read) -> std::io::Result<String> {
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 64 * 1024];
    loop {
        let n = reader.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(format!("sha256:{}", hex::encode(hasher.finalize())))
}

/// Fail unless `actual` is exactly the `expected` content address.
pub fn verify_digest(expected: &str, actual: &str) -> Result<()> {
    if expected != actual {
        return Err(BundleError::DigestMismatch {
            expected: expected.to_string(),
            actual: actual.to_string(),
        });
    }
    Ok(())
}
