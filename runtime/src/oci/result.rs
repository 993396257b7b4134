//! Result files consumed by the build controller.
//!
//! Each file holds a single value with no trailing newline. Writes are atomic
//! (temp file in the same directory, then rename).

use std::io::Write;
use std::path::Path;

use bundle_core::error::{BundleError, Result};
use chrono::{DateTime, Utc};

/// Write the resolved image digest to `path`, if one was requested.
pub fn record_digest(path: Option<&Path>, digest: &str) -> Result<()> {
    let Some(path) = path else {
        return Ok(());
    };
    write_atomic(path, digest)?;

    tracing::debug!(path = %path.display(), digest = %digest, "Recorded image digest");
    Ok(())
}

/// Write the image creation time as Unix seconds to `path`, if requested.
///
/// An image without a creation time leaves the file unwritten.
pub fn record_source_timestamp(path: Option<&Path>, created: Option<DateTime<Utc>>) -> Result<()> {
    let Some(path) = path else {
        return Ok(());
    };
    let Some(created) = created else {
        tracing::warn!(
            path = %path.display(),
            "Image has no creation time, not writing source timestamp"
        );
        return Ok(());
    };

    write_atomic(path, &created.timestamp().to_string())?;

    tracing::debug!(path = %path.display(), created = %created, "Recorded source timestamp");
    Ok(())
}

fn write_atomic(path: &Path, contents: &str) -> Result<()> {
    let failed = |message: String| BundleError::ResultWrite {
        path: path.display().to_string(),
        message,
    };

    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };

    let mut tmp = tempfile::NamedTempFile::new_in(dir)
        .map_err(|e| failed(format!("failed to create temp file: {}", e)))?;
    tmp.write_all(contents.as_bytes())
        .map_err(|e| failed(format!("failed to write: {}", e)))?;
    tmp.persist(path)
        .map_err(|e| failed(format!("failed to rename into place: {}", e.error)))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::fs;
    use tempfile::TempDir;

    const DIGEST: &str = "sha256:9a1b4c8e0e6f6b2a1d3c5e7f9a0b2c4d6e8f0a1b3c5d7e9f1a3b5c7d9e1f3a5b";

    #[test]
    fn test_record_digest_exact_content() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("image-digest");

        record_digest(Some(&path), DIGEST).unwrap();
        assert_eq!(fs::read_to_string(&path).unwrap(), DIGEST);
    }

    #[test]
    fn test_record_digest_overwrites() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("image-digest");
        fs::write(&path, "stale content that is longer than a digest ............").unwrap();

        record_digest(Some(&path), DIGEST).unwrap();
        assert_eq!(fs::read_to_string(&path).unwrap(), DIGEST);
    }

    #[test]
    fn test_record_digest_without_path_is_noop() {
        record_digest(None, DIGEST).unwrap();
    }

    #[test]
    fn test_record_digest_missing_directory_fails() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("missing").join("image-digest");

        let err = record_digest(Some(&path), DIGEST).unwrap_err();
        assert!(matches!(err, BundleError::ResultWrite { .. }));
        assert!(err.to_string().contains("image-digest"));
    }

    #[test]
    fn test_record_source_timestamp() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("source-timestamp");
        let created = Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap();

        record_source_timestamp(Some(&path), Some(created)).unwrap();
        assert_eq!(fs::read_to_string(&path).unwrap(), "1709294400");
    }

    #[test]
    fn test_record_source_timestamp_without_created() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("source-timestamp");

        record_source_timestamp(Some(&path), None).unwrap();
        assert!(!path.exists());
    }
}
