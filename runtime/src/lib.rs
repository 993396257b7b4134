//! Bundle Runtime - source bundle loading.
//!
//! Resolves registry credentials, fetches an OCI image, replays its layers
//! onto a target directory and records the resolved digest.

#![allow(clippy::result_large_err)]

pub mod oci;

// Re-export common types
pub use oci::{load, BundleLoader, LoadReport, PruneOutcome};
pub use oci::{resolve_credential, Credential, CredentialStore};
pub use oci::{BundleExtractor, EntryKind, ExtractSummary, LayerCompression};
pub use oci::{ClientOptions, ImageReference, RegistryClient, RegistryPruner};
pub use oci::{ImageDescriptor, ImageRemover, ImageSource, LayerRef};

/// Bundle Runtime version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
