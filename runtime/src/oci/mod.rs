//! OCI source bundle loading.
//!
//! A source bundle is an OCI image whose layers carry a source tree rather
//! than a runnable filesystem. Loading one replays its layers onto a target
//! directory:
//!
//! ```text
//! ┌──────────────┐   ┌──────────────┐   ┌──────────────┐   ┌──────────────┐
//! │ credentials  │──▶│   registry   │──▶│    layers    │──▶│    result    │
//! │ config.json  │   │ manifest +   │   │ whiteouts,   │   │ digest file, │
//! │ → Credential │   │ layer blobs  │   │ containment  │   │ prune        │
//! └──────────────┘   └──────────────┘   └──────────────┘   └──────────────┘
//! ```
//!
//! [`load`] wires the real registry client; [`BundleLoader`] runs the same
//! sequence against any [`ImageSource`].

pub mod credentials;
mod image;
mod layers;
mod prune;
mod pull;
pub mod reference;
pub mod registry;
mod result;

pub use credentials::{resolve_credential, Credential, CredentialStore};
pub use image::{
    sha256_digest, ImageDescriptor, ImageRemover, ImageSource, LayerReader, LayerRef,
    LayerSequence,
};
pub use layers::{BundleExtractor, EntryKind, ExtractSummary, LayerCompression};
pub use prune::RegistryPruner;
pub use pull::{load, BundleLoader, LoadReport, PruneOutcome};
pub use reference::{ImageReference, Selector};
pub use registry::{ClientOptions, RegistryClient};
pub use result::{record_digest, record_source_timestamp};
