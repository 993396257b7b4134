//! Bundle Core - shared error taxonomy and invocation configuration
//! for the source bundle loader.

pub mod config;
pub mod error;

// Re-export commonly used types
pub use config::{LoaderConfig, Ownership, Platform, DEFAULT_TARGET, DEFAULT_USER_AGENT};
pub use error::{BundleError, ErrorKind, Result};

/// Bundle loader version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
