use thiserror::Error;

/// Bundle loader error types
#[derive(Error, Debug)]
pub enum BundleError {
    /// Missing or invalid caller input
    #[error("Usage error: {0}")]
    Usage(String),

    /// Credential store has no entry for the requested registry
    #[error("failed to find registry credentials for {host}, available configurations: {}", available_list(.available))]
    CredentialMismatch {
        host: String,
        available: Vec<String>,
    },

    /// Credential store could not be read or is inconsistent
    #[error("Credential store error: {0}")]
    CredentialStore(String),

    /// Manifest or blob retrieval failed
    #[error("Fetch error: {reference} - {message}")]
    Fetch { reference: String, message: String },

    /// Retrieved content does not match its content address
    #[error("Digest mismatch: expected {expected}, got {actual}")]
    DigestMismatch { expected: String, actual: String },

    /// A layer entry would land outside the extraction root
    #[error("Path escapes extraction root: {path} ({reason})")]
    PathEscape { path: String, reason: String },

    /// Layer extraction failed
    #[error("Extract error: {0}")]
    Extract(String),

    /// A result file could not be written
    #[error("Failed to write result file {path}: {message}")]
    ResultWrite { path: String, message: String },

    /// Remote image deletion failed
    #[error("Prune error: {reference} - {message}")]
    Prune { reference: String, message: String },

    /// The invocation was cancelled
    #[error("Operation cancelled")]
    Cancelled,

    /// I/O error
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    SerializationError(String),
}

/// Coarse error classification, one per loader stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Usage,
    Credential,
    Fetch,
    Extract,
    ResultWrite,
    Prune,
    Cancelled,
}

impl BundleError {
    /// Classify this error.
    ///
    /// Bare I/O and serialization errors only escape from the extraction and
    /// credential paths respectively, so they are attributed there.
    pub fn kind(&self) -> ErrorKind {
        match self {
            BundleError::Usage(_) => ErrorKind::Usage,
            BundleError::CredentialMismatch { .. } | BundleError::CredentialStore(_) => {
                ErrorKind::Credential
            }
            BundleError::Fetch { .. } | BundleError::DigestMismatch { .. } => ErrorKind::Fetch,
            BundleError::PathEscape { .. } | BundleError::Extract(_) | BundleError::IoError(_) => {
                ErrorKind::Extract
            }
            BundleError::ResultWrite { .. } => ErrorKind::ResultWrite,
            BundleError::Prune { .. } => ErrorKind::Prune,
            BundleError::Cancelled => ErrorKind::Cancelled,
            BundleError::SerializationError(_) => ErrorKind::Credential,
        }
    }

    /// Whether the error must fail the invocation.
    pub fn is_fatal(&self) -> bool {
        self.kind() != ErrorKind::Prune
    }
}

fn available_list(available: &[String]) -> String {
    if available.is_empty() {
        "none".to_string()
    } else {
        available.join(", ")
    }
}

impl From<serde_json::Error> for BundleError {
    fn from(err: serde_json::Error) -> Self {
        BundleError::SerializationError(err.to_string())
    }
}

/// Result type alias for bundle loader operations
pub type Result<T> = std::result::Result<T, BundleError>;
