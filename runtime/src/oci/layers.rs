//! OCI layer extraction with union-filesystem semantics.
//!
//! Layers are replayed oldest first onto a single extraction root:
//! - regular files, directories, symlinks and hardlinks overwrite whatever a
//!   lower layer left at the same path
//! - `.wh.<name>` removes the named sibling
//! - `.wh..wh..opq` drops everything lower layers put in its directory
//!
//! Every destination is resolved inside the root before anything is written.
//! Intermediate symlinks are followed manually and must stay within the root.
//! The final path component is never followed.

use std::collections::{BTreeMap, BTreeSet, HashSet, VecDeque};
use std::ffi::OsString;
use std::fs::{self, OpenOptions};
use std::io::{self, Read};
use std::os::unix::fs::{OpenOptionsExt, PermissionsExt};
use std::path::{Component, Path, PathBuf};

use bundle_core::error::{BundleError, Result};
use bundle_core::Ownership;
use flate2::read::GzDecoder;
use tar::{Archive, EntryType, Header};
use tokio_util::sync::CancellationToken;

/// Marker for a deleted sibling entry.
pub const WHITEOUT_PREFIX: &str = ".wh.";

/// Marker for a directory whose lower-layer contents are discarded.
pub const OPAQUE_WHITEOUT: &str = ".wh..wh..opq";

/// Symlinks followed while resolving one path.
const MAX_SYMLINK_HOPS: usize = 40;

const PERMISSION_MASK: u32 = 0o7777;

/// Compression applied to a layer blob, derived from its media type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LayerCompression {
    None,
    Gzip,
    Zstd,
}

impl LayerCompression {
    /// Map a layer media type to its compression.
    ///
    /// Returns `None` for anything that is not an OCI or Docker layer tarball.
    /// Foreign and non-distributable variants share the base type's encoding.
    pub fn from_media_type(media_type: &str) -> Option<Self> {
        let media_type = media_type.trim();
        let is_layer = media_type.starts_with("application/vnd.oci.image.layer.")
            || media_type.starts_with("application/vnd.docker.image.rootfs.");
        if !is_layer {
            return None;
        }

        if media_type.ends_with("+gzip") || media_type.ends_with(".tar.gzip") {
            Some(Self::Gzip)
        } else if media_type.ends_with("+zstd") || media_type.ends_with(".tar.zstd") {
            Some(Self::Zstd)
        } else if media_type.ends_with(".tar") {
            Some(Self::None)
        } else {
            None
        }
    }

    fn decoder<'a, R: Read + 'a>(self, reader: R) -> Result<Box<dyn Read + 'a>> {
        Ok(match self {
            Self::None => Box::new(reader),
            Self::Gzip => Box::new(GzDecoder::new(reader)),
            Self::Zstd => Box::new(zstd::stream::read::Decoder::new(reader).map_err(|e| {
                BundleError::Extract(format!("failed to initialize zstd decoder: {}", e))
            })?),
        })
    }
}

/// What a single tar entry asks the extractor to do.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EntryKind {
    File,
    Directory,
    Symlink { target: PathBuf },
    Hardlink { target: PathBuf },
    /// Remove the sibling named `victim`
    Whiteout { victim: OsString },
    /// Discard lower-layer children of the containing directory
    OpaqueWhiteout,
    /// Devices, FIFOs and anything else with no place in a source tree
    Unsupported(EntryType),
}

impl EntryKind {
    /// Classify a tar entry by its header type and file name.
    ///
    /// Whiteout markers are recognized by name regardless of their header type.
    pub fn classify(entry_type: EntryType, path: &Path, link_name: Option<PathBuf>) -> Result<Self> {
        if let Some(name) = path.file_name().and_then(|n| n.to_str()) {
            if name == OPAQUE_WHITEOUT {
                return Ok(Self::OpaqueWhiteout);
            }
            if let Some(victim) = name.strip_prefix(WHITEOUT_PREFIX) {
                let valid = matches!(
                    Path::new(victim).components().collect::<Vec<_>>().as_slice(),
                    [Component::Normal(_)]
                );
                if !valid {
                    return Err(BundleError::PathEscape {
                        path: path.display().to_string(),
                        reason: "whiteout does not name a sibling entry".to_string(),
                    });
                }
                return Ok(Self::Whiteout {
                    victim: OsString::from(victim),
                });
            }
        }

        let missing_link = || {
            BundleError::Extract(format!("link entry without target: {}", path.display()))
        };

        Ok(match entry_type {
            EntryType::Regular | EntryType::Continuous => Self::File,
            EntryType::Directory => Self::Directory,
            EntryType::Symlink => Self::Symlink {
                target: link_name.ok_or_else(missing_link)?,
            },
            EntryType::Link => Self::Hardlink {
                target: link_name.ok_or_else(missing_link)?,
            },
            other => Self::Unsupported(other),
        })
    }
}

/// Counts of what extraction did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExtractSummary {
    pub layers: usize,
    /// Files, directories and links written
    pub entries: usize,
    /// Whiteout and opaque markers applied
    pub whiteouts: usize,
    /// Entries with no source-tree meaning
    pub skipped: usize,
}

impl ExtractSummary {
    fn add(&mut self, other: &ExtractSummary) {
        self.layers += other.layers;
        self.entries += other.entries;
        self.whiteouts += other.whiteouts;
        self.skipped += other.skipped;
    }
}

enum Applied {
    Written,
    Whiteout,
    Skipped,
    Unchanged,
}

/// Replays layers onto an extraction root.
///
/// One extractor is used for all layers of an image. Directory permissions are
/// held back until [`BundleExtractor::finish`] so that a read-only directory
/// from one layer cannot block writes from a later one.
pub struct BundleExtractor {
    root: PathBuf,
    ownership: Ownership,
    cancel: CancellationToken,
    /// Directory modes to apply once all layers are in place
    dir_modes: BTreeMap<PathBuf, u32>,
    /// Paths written by the current layer, with their ancestors
    touched: HashSet<PathBuf>,
    /// Root-relative paths of every symlink created, re-checked at finish
    links: BTreeSet<PathBuf>,
    summary: ExtractSummary,
}

impl BundleExtractor {
    /// Create an extractor, creating the root directory if needed.
    pub fn new(root: &Path, ownership: Ownership, cancel: CancellationToken) -> Result<Self> {
        fs::create_dir_all(root).map_err(|e| {
            BundleError::Extract(format!(
                "failed to create target directory {}: {}",
                root.display(),
                e
            ))
        })?;
        let root = root.canonicalize().map_err(|e| {
            BundleError::Extract(format!(
                "failed to resolve target directory {}: {}",
                root.display(),
                e
            ))
        })?;

        Ok(Self {
            root,
            ownership,
            cancel,
            dir_modes: BTreeMap::new(),
            touched: HashSet::new(),
            links: BTreeSet::new(),
            summary: ExtractSummary::default(),
        })
    }

    /// Canonical extraction root.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Apply one layer tarball on top of what is already extracted.
    pub fn apply_layer(
        &mut self,
        reader: impl Read,
        compression: LayerCompression,
    ) -> Result<ExtractSummary> {
        let mut layer = ExtractSummary {
            layers: 1,
            ..Default::default()
        };
        self.touched.clear();

        let mut archive = Archive::new(compression.decoder(reader)?);
        let entries = archive
            .entries()
            .map_err(|e| BundleError::Extract(format!("failed to read layer: {}", e)))?;

        for entry in entries {
            if self.cancel.is_cancelled() {
                return Err(BundleError::Cancelled);
            }

            let mut entry = entry
                .map_err(|e| BundleError::Extract(format!("failed to read layer entry: {}", e)))?;
            let path = entry
                .path()
                .map_err(|e| BundleError::Extract(format!("invalid entry path: {}", e)))?
                .into_owned();
            let link_name = entry
                .link_name()
                .map_err(|e| {
                    BundleError::Extract(format!(
                        "invalid link target for {}: {}",
                        path.display(),
                        e
                    ))
                })?
                .map(|l| l.into_owned());
            let kind = EntryKind::classify(entry.header().entry_type(), &path, link_name)?;

            match self.apply_entry(&mut entry, &path, kind)? {
                Applied::Written => layer.entries += 1,
                Applied::Whiteout => layer.whiteouts += 1,
                Applied::Skipped => layer.skipped += 1,
                Applied::Unchanged => {}
            }
        }

        tracing::debug!(
            entries = layer.entries,
            whiteouts = layer.whiteouts,
            skipped = layer.skipped,
            "Applied layer"
        );

        self.summary.add(&layer);
        Ok(layer)
    }

    /// Check the final tree, apply deferred directory permissions and return
    /// the totals.
    ///
    /// A symlink that was contained when written can be redirected by a later
    /// entry, so every created link is resolved again against the final tree.
    pub fn finish(self) -> Result<ExtractSummary> {
        self.verify_links()?;

        // Reverse path order visits children before their parents.
        for (path, mode) in self.dir_modes.iter().rev() {
            match fs::symlink_metadata(path) {
                Ok(md) if md.is_dir() => {
                    fs::set_permissions(path, fs::Permissions::from_mode(*mode))
                        .map_err(|e| io_error("set permissions on", path, e))?;
                }
                _ => {}
            }
        }
        Ok(self.summary)
    }

    fn apply_entry<R: Read>(
        &mut self,
        entry: &mut tar::Entry<'_, R>,
        path: &Path,
        kind: EntryKind,
    ) -> Result<Applied> {
        if let EntryKind::Unsupported(entry_type) = kind {
            tracing::warn!(
                path = %path.display(),
                entry_type = ?entry_type,
                "Skipping unsupported layer entry"
            );
            return Ok(Applied::Skipped);
        }

        let rel = sanitize(path)?;
        let (parent, name) = match (rel.parent(), rel.file_name()) {
            (Some(parent), Some(name)) => (parent, name.to_os_string()),
            // The root itself ("./"); its mode stays the caller's.
            _ => return Ok(Applied::Unchanged),
        };
        let dir = self.root.join(self.resolve_in_root(Path::new(""), parent, path)?);

        match kind {
            EntryKind::Whiteout { victim } => {
                self.remove_existing(&dir.join(victim))?;
                Ok(Applied::Whiteout)
            }
            EntryKind::OpaqueWhiteout => {
                if fs::symlink_metadata(&dir).map(|md| md.is_dir()).unwrap_or(false) {
                    self.clear_opaque(&dir)?;
                }
                Ok(Applied::Whiteout)
            }
            kind => {
                fs::create_dir_all(&dir).map_err(|e| io_error("create directory", &dir, e))?;
                let dest = dir.join(&name);
                let mode = entry
                    .header()
                    .mode()
                    .map_err(|e| io_error("read mode of", path, e))?
                    & PERMISSION_MASK;

                match kind {
                    EntryKind::File => self.write_file(entry, &dest, mode)?,
                    EntryKind::Directory => self.make_dir(&dest, mode)?,
                    EntryKind::Symlink { target } => {
                        let dir_rel = dir.strip_prefix(&self.root).unwrap_or(Path::new(""));
                        self.resolve_in_root(dir_rel, &target, path)?;
                        self.remove_existing(&dest)?;
                        std::os::unix::fs::symlink(&target, &dest)
                            .map_err(|e| io_error("create symlink", &dest, e))?;
                        self.links.insert(dir_rel.join(&name));
                    }
                    EntryKind::Hardlink { target } => {
                        let source = self.resolve_hardlink_source(&target, path)?;
                        if source == dest {
                            return Ok(Applied::Unchanged);
                        }
                        self.remove_existing(&dest)?;
                        fs::hard_link(&source, &dest)
                            .map_err(|e| io_error("create hardlink", &dest, e))?;
                    }
                    _ => return Ok(Applied::Unchanged),
                }

                self.apply_ownership(&dest, entry.header())?;
                self.mark_touched(&dest);
                Ok(Applied::Written)
            }
        }
    }

    fn verify_links(&self) -> Result<()> {
        for rel in &self.links {
            let (parent, name) = match (rel.parent(), rel.file_name()) {
                (Some(parent), Some(name)) => (parent, name),
                _ => continue,
            };
            let dir = self.resolve_in_root(Path::new(""), parent, rel)?;
            let link = self.root.join(&dir).join(name);

            match fs::symlink_metadata(&link) {
                Ok(md) if md.file_type().is_symlink() => {
                    let target =
                        fs::read_link(&link).map_err(|e| io_error("read symlink", &link, e))?;
                    self.resolve_in_root(&dir, &target, rel)?;
                }
                // Replaced or whited out by a later entry.
                Ok(_) => {}
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => return Err(io_error("inspect", &link, e)),
            }
        }
        Ok(())
    }

    fn write_file<R: Read>(
        &mut self,
        entry: &mut tar::Entry<'_, R>,
        dest: &Path,
        mode: u32,
    ) -> Result<()> {
        self.remove_existing(dest)?;
        let mut file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .mode(0o600)
            .open(dest)
            .map_err(|e| io_error("create file", dest, e))?;
        io::copy(entry, &mut file).map_err(|e| io_error("write file", dest, e))?;
        file.set_permissions(fs::Permissions::from_mode(mode))
            .map_err(|e| io_error("set permissions on", dest, e))?;
        Ok(())
    }

    fn make_dir(&mut self, dest: &Path, mode: u32) -> Result<()> {
        match fs::symlink_metadata(dest) {
            Ok(md) if md.is_dir() => {}
            Ok(_) => {
                fs::remove_file(dest).map_err(|e| io_error("remove", dest, e))?;
                fs::create_dir(dest).map_err(|e| io_error("create directory", dest, e))?;
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                fs::create_dir(dest).map_err(|e| io_error("create directory", dest, e))?;
            }
            Err(e) => return Err(io_error("inspect", dest, e)),
        }
        self.dir_modes.insert(dest.to_path_buf(), mode);
        Ok(())
    }

    fn resolve_hardlink_source(&self, target: &Path, entry_path: &Path) -> Result<PathBuf> {
        let rel = sanitize(target)?;
        let (parent, name) = match (rel.parent(), rel.file_name()) {
            (Some(parent), Some(name)) => (parent, name),
            _ => {
                return Err(BundleError::PathEscape {
                    path: entry_path.display().to_string(),
                    reason: "hardlink points at the extraction root".to_string(),
                })
            }
        };
        let source = self
            .root
            .join(self.resolve_in_root(Path::new(""), parent, entry_path)?)
            .join(name);

        match fs::symlink_metadata(&source) {
            Ok(md) if !md.is_dir() => Ok(source),
            Ok(_) => Err(BundleError::Extract(format!(
                "hardlink {} targets a directory",
                entry_path.display()
            ))),
            Err(e) => Err(BundleError::Extract(format!(
                "hardlink {} targets missing entry {}: {}",
                entry_path.display(),
                target.display(),
                e
            ))),
        }
    }

    /// Walk `path` from the root-relative directory `base`, following symlinks
    /// that already exist under the root. Returns the root-relative result.
    fn resolve_in_root(&self, base: &Path, path: &Path, entry_path: &Path) -> Result<PathBuf> {
        let escape = |reason: &str| BundleError::PathEscape {
            path: entry_path.display().to_string(),
            reason: reason.to_string(),
        };

        let mut resolved: Vec<OsString> = base
            .components()
            .map(|c| c.as_os_str().to_os_string())
            .collect();
        let mut pending: VecDeque<Step> =
            steps(path).ok_or_else(|| escape("absolute path"))?.into();
        let mut hops = 0;

        while let Some(step) = pending.pop_front() {
            match step {
                Step::Up => {
                    if resolved.pop().is_none() {
                        return Err(escape("path leaves the extraction root"));
                    }
                }
                Step::Name(name) => {
                    let mut candidate = self.root.clone();
                    candidate.extend(&resolved);
                    candidate.push(&name);

                    match fs::symlink_metadata(&candidate) {
                        Ok(md) if md.file_type().is_symlink() => {
                            hops += 1;
                            if hops > MAX_SYMLINK_HOPS {
                                return Err(escape("too many levels of symbolic links"));
                            }
                            let link = fs::read_link(&candidate)
                                .map_err(|e| io_error("read symlink", &candidate, e))?;
                            let link_steps = steps(&link)
                                .ok_or_else(|| escape("symlink to absolute path"))?;
                            for step in link_steps.into_iter().rev() {
                                pending.push_front(step);
                            }
                        }
                        Ok(_) => resolved.push(name),
                        Err(e) if e.kind() == io::ErrorKind::NotFound => resolved.push(name),
                        Err(e) => return Err(io_error("inspect", &candidate, e)),
                    }
                }
            }
        }

        Ok(resolved.iter().collect())
    }

    fn remove_existing(&mut self, path: &Path) -> Result<()> {
        match fs::symlink_metadata(path) {
            Ok(md) if md.is_dir() => {
                fs::remove_dir_all(path).map_err(|e| io_error("remove", path, e))?;
                self.dir_modes.retain(|p, _| !p.starts_with(path));
            }
            Ok(_) => fs::remove_file(path).map_err(|e| io_error("remove", path, e))?,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(io_error("inspect", path, e)),
        }
        Ok(())
    }

    /// Remove children of `dir` that the current layer has not written.
    fn clear_opaque(&mut self, dir: &Path) -> Result<()> {
        let children = fs::read_dir(dir).map_err(|e| io_error("read directory", dir, e))?;
        for child in children {
            let child = child.map_err(|e| io_error("read directory", dir, e))?;
            let path = child.path();
            if self.touched.contains(&path) {
                let is_dir = child
                    .file_type()
                    .map_err(|e| io_error("inspect", &path, e))?
                    .is_dir();
                if is_dir {
                    self.clear_opaque(&path)?;
                }
                continue;
            }
            self.remove_existing(&path)?;
        }
        Ok(())
    }

    fn mark_touched(&mut self, dest: &Path) {
        let mut current = Some(dest);
        while let Some(path) = current {
            if path == self.root.as_path() || !self.touched.insert(path.to_path_buf()) {
                break;
            }
            current = path.parent();
        }
    }

    fn apply_ownership(&self, dest: &Path, header: &Header) -> Result<()> {
        if self.ownership == Ownership::Ignore {
            return Ok(());
        }
        let uid = header.uid().map_err(|e| io_error("read owner of", dest, e))?;
        let gid = header.gid().map_err(|e| io_error("read group of", dest, e))?;
        std::os::unix::fs::lchown(dest, Some(uid as u32), Some(gid as u32))
            .map_err(|e| io_error("change ownership of", dest, e))
    }
}

/// One step of a path walk.
enum Step {
    Up,
    Name(OsString),
}

/// Split a relative path into walk steps, or `None` if it is absolute.
fn steps(path: &Path) -> Option<Vec<Step>> {
    let mut out = Vec::new();
    for component in path.components() {
        match component {
            Component::Prefix(_) | Component::RootDir => return None,
            Component::CurDir => {}
            Component::ParentDir => out.push(Step::Up),
            Component::Normal(name) => out.push(Step::Name(name.to_os_string())),
        }
    }
    Some(out)
}

/// Lexically normalize an archive path, rejecting absolute paths and `..`
/// that climbs above the root.
fn sanitize(path: &Path) -> Result<PathBuf> {
    let escape = |reason: &str| BundleError::PathEscape {
        path: path.display().to_string(),
        reason: reason.to_string(),
    };

    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::Prefix(_) | Component::RootDir => return Err(escape("absolute path")),
            Component::CurDir => {}
            Component::ParentDir => {
                if !out.pop() {
                    return Err(escape("path leaves the extraction root"));
                }
            }
            Component::Normal(name) => out.push(name),
        }
    }
    Ok(out)
}

fn io_error(action: &str, path: &Path, e: io::Error) -> BundleError {
    BundleError::Extract(format!("failed to {} {}: {}", action, path.display(), e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::write::GzEncoder;
    use std::io::Cursor;
    use tar::Builder;
    use tempfile::TempDir;

    enum TestEntry<'a> {
        File(&'a str, &'a [u8]),
        FileMode(&'a str, &'a [u8], u32),
        Dir(&'a str, u32),
        Symlink(&'a str, &'a str),
        Hardlink(&'a str, &'a str),
        Fifo(&'a str),
        /// Path written straight into the header, bypassing tar's own checks
        RawFile(&'a str, &'a [u8]),
    }

    fn raw_header(path: &str, entry_type: EntryType, size: u64, link: Option<&str>) -> Header {
        let mut header = Header::new_gnu();
        {
            let old = header.as_old_mut();
            old.name[..path.len()].copy_from_slice(path.as_bytes());
            if let Some(link) = link {
                old.linkname[..link.len()].copy_from_slice(link.as_bytes());
            }
        }
        header.set_entry_type(entry_type);
        header.set_size(size);
        header.set_mode(0o644);
        header.set_cksum();
        header
    }

    fn build_tar(entries: &[TestEntry]) -> Vec<u8> {
        let mut builder = Builder::new(Vec::new());

        for entry in entries {
            match entry {
                TestEntry::File(name, content) | TestEntry::FileMode(name, content, _) => {
                    let mode = match entry {
                        TestEntry::FileMode(_, _, mode) => *mode,
                        _ => 0o644,
                    };
                    let mut header = Header::new_gnu();
                    header.set_size(content.len() as u64);
                    header.set_mode(mode);
                    header.set_cksum();
                    builder.append_data(&mut header, name, *content).unwrap();
                }
                TestEntry::Dir(name, mode) => {
                    let mut header = Header::new_gnu();
                    header.set_entry_type(EntryType::Directory);
                    header.set_size(0);
                    header.set_mode(*mode);
                    header.set_cksum();
                    builder.append_data(&mut header, name, io::empty()).unwrap();
                }
                TestEntry::Symlink(name, target) => {
                    let header = raw_header(name, EntryType::Symlink, 0, Some(target));
                    builder.append(&header, io::empty()).unwrap();
                }
                TestEntry::Hardlink(name, target) => {
                    let header = raw_header(name, EntryType::Link, 0, Some(target));
                    builder.append(&header, io::empty()).unwrap();
                }
                TestEntry::Fifo(name) => {
                    let header = raw_header(name, EntryType::Fifo, 0, None);
                    builder.append(&header, io::empty()).unwrap();
                }
                TestEntry::RawFile(name, content) => {
                    let header = raw_header(name, EntryType::Regular, content.len() as u64, None);
                    builder.append(&header, *content).unwrap();
                }
            }
        }

        builder.into_inner().unwrap()
    }

    fn gzip(data: &[u8]) -> Vec<u8> {
        use std::io::Write;
        let mut encoder = GzEncoder::new(Vec::new(), flate2::Compression::default());
        encoder.write_all(data).unwrap();
        encoder.finish().unwrap()
    }

    fn extractor(root: &Path) -> BundleExtractor {
        BundleExtractor::new(root, Ownership::Ignore, CancellationToken::new()).unwrap()
    }

    fn apply(extractor: &mut BundleExtractor, entries: &[TestEntry]) -> Result<ExtractSummary> {
        extractor.apply_layer(Cursor::new(build_tar(entries)), LayerCompression::None)
    }

    #[test]
    fn test_extract_files_and_directories() {
        let temp_dir = TempDir::new().unwrap();
        let root = temp_dir.path().join("source");
        let mut ex = extractor(&root);

        let layer = gzip(&build_tar(&[
            TestEntry::Dir("src", 0o755),
            TestEntry::File("src/main.go", b"package main"),
            TestEntry::FileMode("build.sh", b"#!/bin/sh", 0o755),
            TestEntry::File("docs/README.md", b"readme"),
        ]));
        let summary = ex
            .apply_layer(Cursor::new(layer), LayerCompression::Gzip)
            .unwrap();
        assert_eq!(summary.entries, 4);
        ex.finish().unwrap();

        assert_eq!(
            fs::read_to_string(root.join("src/main.go")).unwrap(),
            "package main"
        );
        assert_eq!(
            fs::read_to_string(root.join("docs/README.md")).unwrap(),
            "readme"
        );
        let mode = fs::metadata(root.join("build.sh")).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o755);
    }

    #[test]
    fn test_zstd_layer() {
        let temp_dir = TempDir::new().unwrap();
        let mut ex = extractor(temp_dir.path());

        let tar = build_tar(&[TestEntry::File("LICENSE", b"Apache-2.0")]);
        let compressed = zstd::stream::encode_all(Cursor::new(tar), 0).unwrap();
        ex.apply_layer(Cursor::new(compressed), LayerCompression::Zstd)
            .unwrap();

        assert_eq!(
            fs::read_to_string(temp_dir.path().join("LICENSE")).unwrap(),
            "Apache-2.0"
        );
    }

    #[test]
    fn test_later_layer_overwrites() {
        let temp_dir = TempDir::new().unwrap();
        let mut ex = extractor(temp_dir.path());

        apply(&mut ex, &[TestEntry::File("file.txt", b"version 1")]).unwrap();
        apply(&mut ex, &[TestEntry::File("file.txt", b"version 2")]).unwrap();
        ex.finish().unwrap();

        assert_eq!(
            fs::read_to_string(temp_dir.path().join("file.txt")).unwrap(),
            "version 2"
        );
    }

    #[test]
    fn test_file_replaces_directory() {
        let temp_dir = TempDir::new().unwrap();
        let mut ex = extractor(temp_dir.path());

        apply(&mut ex, &[TestEntry::File("thing/inner.txt", b"inner")]).unwrap();
        apply(&mut ex, &[TestEntry::File("thing", b"now a file")]).unwrap();

        let path = temp_dir.path().join("thing");
        assert!(path.is_file());
        assert_eq!(fs::read_to_string(path).unwrap(), "now a file");
    }

    #[test]
    fn test_whiteout_removes_file_and_directory() {
        let temp_dir = TempDir::new().unwrap();
        let mut ex = extractor(temp_dir.path());

        apply(
            &mut ex,
            &[
                TestEntry::File("keep.txt", b"keep"),
                TestEntry::File("gone.txt", b"gone"),
                TestEntry::File("olddir/a.txt", b"a"),
                TestEntry::File("olddir/nested/b.txt", b"b"),
            ],
        )
        .unwrap();
        let summary = apply(
            &mut ex,
            &[
                TestEntry::File(".wh.gone.txt", b""),
                TestEntry::File(".wh.olddir", b""),
            ],
        )
        .unwrap();
        assert_eq!(summary.whiteouts, 2);
        assert_eq!(summary.entries, 0);

        assert!(temp_dir.path().join("keep.txt").exists());
        assert!(!temp_dir.path().join("gone.txt").exists());
        assert!(!temp_dir.path().join("olddir").exists());
        assert!(!temp_dir.path().join(".wh.gone.txt").exists());
    }

    #[test]
    fn test_whiteout_missing_target_is_ok() {
        let temp_dir = TempDir::new().unwrap();
        let mut ex = extractor(temp_dir.path());

        let summary = apply(&mut ex, &[TestEntry::File("dir/.wh.never-existed", b"")]).unwrap();
        assert_eq!(summary.whiteouts, 1);
    }

    #[test]
    fn test_whiteout_of_entry_from_same_layer() {
        let temp_dir = TempDir::new().unwrap();
        let mut ex = extractor(temp_dir.path());

        apply(
            &mut ex,
            &[
                TestEntry::File("tmp.txt", b"scratch"),
                TestEntry::File(".wh.tmp.txt", b""),
            ],
        )
        .unwrap();
        assert!(!temp_dir.path().join("tmp.txt").exists());
    }

    #[test]
    fn test_opaque_whiteout_marker_first() {
        let temp_dir = TempDir::new().unwrap();
        let mut ex = extractor(temp_dir.path());

        apply(
            &mut ex,
            &[
                TestEntry::File("app/old.txt", b"old"),
                TestEntry::File("app/sub/deep.txt", b"deep"),
                TestEntry::File("other/untouched.txt", b"other"),
            ],
        )
        .unwrap();
        apply(
            &mut ex,
            &[
                TestEntry::File("app/.wh..wh..opq", b""),
                TestEntry::File("app/new.txt", b"new"),
            ],
        )
        .unwrap();
        ex.finish().unwrap();

        let app = temp_dir.path().join("app");
        assert!(app.join("new.txt").exists());
        assert!(!app.join("old.txt").exists());
        assert!(!app.join("sub").exists());
        assert!(!app.join(".wh..wh..opq").exists());
        assert!(temp_dir.path().join("other/untouched.txt").exists());
    }

    #[test]
    fn test_opaque_whiteout_marker_after_entries() {
        let temp_dir = TempDir::new().unwrap();
        let mut ex = extractor(temp_dir.path());

        apply(
            &mut ex,
            &[
                TestEntry::File("app/old.txt", b"old"),
                TestEntry::File("app/sub/old.txt", b"old"),
                TestEntry::File("app/sub/kept.txt", b"v1"),
            ],
        )
        .unwrap();
        apply(
            &mut ex,
            &[
                TestEntry::File("app/sub/kept.txt", b"v2"),
                TestEntry::File("app/fresh.txt", b"fresh"),
                TestEntry::File("app/.wh..wh..opq", b""),
            ],
        )
        .unwrap();

        let app = temp_dir.path().join("app");
        assert_eq!(fs::read_to_string(app.join("sub/kept.txt")).unwrap(), "v2");
        assert!(app.join("fresh.txt").exists());
        assert!(!app.join("old.txt").exists());
        assert!(!app.join("sub/old.txt").exists());
    }

    #[test]
    fn test_opaque_whiteout_then_later_layer_adds() {
        let temp_dir = TempDir::new().unwrap();
        let mut ex = extractor(temp_dir.path());

        apply(&mut ex, &[TestEntry::File("d/one.txt", b"1")]).unwrap();
        apply(
            &mut ex,
            &[
                TestEntry::File("d/.wh..wh..opq", b""),
                TestEntry::File("d/two.txt", b"2"),
            ],
        )
        .unwrap();
        apply(&mut ex, &[TestEntry::File("d/three.txt", b"3")]).unwrap();

        let mut names: Vec<String> = fs::read_dir(temp_dir.path().join("d"))
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        names.sort();
        assert_eq!(names, vec!["three.txt", "two.txt"]);
    }

    #[test]
    fn test_rejects_parent_escape() {
        let temp_dir = TempDir::new().unwrap();
        let root = temp_dir.path().join("root");
        let mut ex = extractor(&root);

        let err = apply(&mut ex, &[TestEntry::RawFile("../evil.txt", b"pwned")]).unwrap_err();
        assert!(matches!(err, BundleError::PathEscape { .. }));
        assert!(!temp_dir.path().join("evil.txt").exists());
    }

    #[test]
    fn test_rejects_nested_parent_escape() {
        let temp_dir = TempDir::new().unwrap();
        let root = temp_dir.path().join("root");
        let mut ex = extractor(&root);

        let err = apply(
            &mut ex,
            &[TestEntry::RawFile("a/b/../../../evil.txt", b"pwned")],
        )
        .unwrap_err();
        assert!(matches!(err, BundleError::PathEscape { .. }));
        assert!(!temp_dir.path().join("evil.txt").exists());
    }

    #[test]
    fn test_parent_segments_inside_root_are_allowed() {
        let temp_dir = TempDir::new().unwrap();
        let mut ex = extractor(temp_dir.path());

        apply(&mut ex, &[TestEntry::RawFile("a/../b.txt", b"ok")]).unwrap();
        assert!(temp_dir.path().join("b.txt").exists());
    }

    #[test]
    fn test_rejects_absolute_path() {
        let temp_dir = TempDir::new().unwrap();
        let root = temp_dir.path().join("root");
        let mut ex = extractor(&root);

        let outside = temp_dir.path().join("abs.txt");
        let err = apply(
            &mut ex,
            &[TestEntry::RawFile(outside.to_str().unwrap(), b"pwned")],
        )
        .unwrap_err();
        assert!(matches!(err, BundleError::PathEscape { .. }));
        assert!(!outside.exists());
    }

    #[test]
    fn test_rejects_escaping_symlink_target() {
        let temp_dir = TempDir::new().unwrap();
        let root = temp_dir.path().join("root");
        let mut ex = extractor(&root);

        let err = apply(&mut ex, &[TestEntry::Symlink("link", "../../etc")]).unwrap_err();
        assert!(matches!(err, BundleError::PathEscape { .. }));
        assert!(fs::symlink_metadata(root.join("link")).is_err());

        let err = apply(&mut ex, &[TestEntry::Symlink("abs", "/etc/passwd")]).unwrap_err();
        assert!(matches!(err, BundleError::PathEscape { .. }));
    }

    #[test]
    fn test_rejects_symlink_chain_escape() {
        let temp_dir = TempDir::new().unwrap();
        let root = temp_dir.path().join("root");
        let mut ex = extractor(&root);

        // sub/up points at the root, so sub/up/.. would climb out of it.
        let err = apply(
            &mut ex,
            &[
                TestEntry::Symlink("sub/up", ".."),
                TestEntry::Symlink("sub/l", "up/.."),
            ],
        )
        .unwrap_err();
        assert!(matches!(err, BundleError::PathEscape { .. }));
    }

    #[test]
    fn test_rejects_symlink_redirected_by_later_entry() {
        let temp_dir = TempDir::new().unwrap();
        let root = temp_dir.path().join("root");
        let mut ex = extractor(&root);

        // Both links are contained when written, but once d/up points at the
        // root, l resolves to the root's parent.
        apply(
            &mut ex,
            &[
                TestEntry::Symlink("l", "d/up/.."),
                TestEntry::Symlink("d/up", ".."),
            ],
        )
        .unwrap();

        let err = ex.finish().unwrap_err();
        assert!(matches!(err, BundleError::PathEscape { .. }));
    }

    #[test]
    fn test_symlink_redirected_across_layers() {
        let temp_dir = TempDir::new().unwrap();
        let root = temp_dir.path().join("root");
        let mut ex = extractor(&root);

        apply(&mut ex, &[TestEntry::Symlink("src/l", "inner/..")]).unwrap();
        apply(&mut ex, &[TestEntry::Symlink("src/inner", "../..")]).unwrap_err();
        apply(&mut ex, &[TestEntry::Symlink("src/inner", "..")]).unwrap();

        let err = ex.finish().unwrap_err();
        assert!(matches!(err, BundleError::PathEscape { .. }));
    }

    #[test]
    fn test_contained_symlinks_pass_finish() {
        let temp_dir = TempDir::new().unwrap();
        let root = temp_dir.path().join("root");
        let mut ex = extractor(&root);

        apply(
            &mut ex,
            &[
                TestEntry::File("data/file.txt", b"data"),
                TestEntry::Symlink("l", "d/up/file.txt"),
                TestEntry::Symlink("d/up", "../data"),
            ],
        )
        .unwrap();
        apply(&mut ex, &[TestEntry::File(".wh.d", b"")]).unwrap();
        ex.finish().unwrap();

        assert!(fs::symlink_metadata(root.join("l")).unwrap().file_type().is_symlink());
        assert!(!root.join("d").exists());
    }

    #[test]
    fn test_rejects_write_through_symlink_outside_root() {
        let temp_dir = TempDir::new().unwrap();
        let root = temp_dir.path().join("root");
        let outside = temp_dir.path().join("outside");
        fs::create_dir_all(&root).unwrap();
        fs::create_dir_all(&outside).unwrap();
        std::os::unix::fs::symlink(&outside, root.join("link")).unwrap();

        let mut ex = extractor(&root);
        let err = apply(&mut ex, &[TestEntry::File("link/evil.txt", b"pwned")]).unwrap_err();
        assert!(matches!(err, BundleError::PathEscape { .. }));
        assert!(!outside.join("evil.txt").exists());
    }

    #[test]
    fn test_write_through_symlink_inside_root() {
        let temp_dir = TempDir::new().unwrap();
        let mut ex = extractor(temp_dir.path());

        apply(
            &mut ex,
            &[
                TestEntry::Dir("real", 0o755),
                TestEntry::Symlink("alias", "real"),
            ],
        )
        .unwrap();
        apply(&mut ex, &[TestEntry::File("alias/file.txt", b"via alias")]).unwrap();

        let alias = temp_dir.path().join("alias");
        assert!(fs::symlink_metadata(&alias).unwrap().file_type().is_symlink());
        assert_eq!(
            fs::read_to_string(temp_dir.path().join("real/file.txt")).unwrap(),
            "via alias"
        );
    }

    #[test]
    fn test_file_replaces_symlink_without_following_it() {
        let temp_dir = TempDir::new().unwrap();
        let mut ex = extractor(temp_dir.path());

        apply(
            &mut ex,
            &[
                TestEntry::File("target.txt", b"original"),
                TestEntry::Symlink("link.txt", "target.txt"),
            ],
        )
        .unwrap();
        apply(&mut ex, &[TestEntry::File("link.txt", b"replacement")]).unwrap();

        assert_eq!(
            fs::read_to_string(temp_dir.path().join("target.txt")).unwrap(),
            "original"
        );
        let md = fs::symlink_metadata(temp_dir.path().join("link.txt")).unwrap();
        assert!(md.is_file());
    }

    #[test]
    fn test_hardlink() {
        let temp_dir = TempDir::new().unwrap();
        let mut ex = extractor(temp_dir.path());

        apply(
            &mut ex,
            &[
                TestEntry::File("bin/tool", b"binary"),
                TestEntry::Hardlink("bin/tool-alias", "bin/tool"),
            ],
        )
        .unwrap();

        assert_eq!(
            fs::read_to_string(temp_dir.path().join("bin/tool-alias")).unwrap(),
            "binary"
        );
    }

    #[test]
    fn test_rejects_escaping_hardlink() {
        let temp_dir = TempDir::new().unwrap();
        let root = temp_dir.path().join("root");
        fs::write(temp_dir.path().join("secret"), b"secret").unwrap();
        let mut ex = extractor(&root);

        let err = apply(&mut ex, &[TestEntry::Hardlink("stolen", "../secret")]).unwrap_err();
        assert!(matches!(err, BundleError::PathEscape { .. }));
        assert!(!root.join("stolen").exists());
    }

    #[test]
    fn test_hardlink_missing_target() {
        let temp_dir = TempDir::new().unwrap();
        let mut ex = extractor(temp_dir.path());

        let err = apply(&mut ex, &[TestEntry::Hardlink("alias", "missing")]).unwrap_err();
        assert!(matches!(err, BundleError::Extract(_)));
    }

    #[test]
    fn test_directory_modes_applied_on_finish() {
        let temp_dir = TempDir::new().unwrap();
        let mut ex = extractor(temp_dir.path());

        apply(&mut ex, &[TestEntry::Dir("locked", 0o700)]).unwrap();
        apply(
            &mut ex,
            &[
                TestEntry::Dir("locked", 0o750),
                TestEntry::File("locked/inner.txt", b"inner"),
            ],
        )
        .unwrap();
        let summary = ex.finish().unwrap();
        assert_eq!(summary.layers, 2);

        let mode = fs::metadata(temp_dir.path().join("locked"))
            .unwrap()
            .permissions()
            .mode();
        assert_eq!(mode & 0o777, 0o750);
        assert!(temp_dir.path().join("locked/inner.txt").exists());
    }

    #[test]
    fn test_device_entries_skipped() {
        let temp_dir = TempDir::new().unwrap();
        let mut ex = extractor(temp_dir.path());

        let summary = apply(
            &mut ex,
            &[TestEntry::Fifo("pipe"), TestEntry::File("kept.txt", b"kept")],
        )
        .unwrap();
        assert_eq!(summary.skipped, 1);
        assert_eq!(summary.entries, 1);
        assert!(!temp_dir.path().join("pipe").exists());
    }

    #[test]
    fn test_cancelled_before_entries() {
        let temp_dir = TempDir::new().unwrap();
        let cancel = CancellationToken::new();
        let mut ex =
            BundleExtractor::new(temp_dir.path(), Ownership::Ignore, cancel.clone()).unwrap();
        cancel.cancel();

        let err = apply(&mut ex, &[TestEntry::File("a.txt", b"a")]).unwrap_err();
        assert!(matches!(err, BundleError::Cancelled));
        assert!(!temp_dir.path().join("a.txt").exists());
    }

    #[test]
    fn test_corrupt_gzip_layer() {
        let temp_dir = TempDir::new().unwrap();
        let mut ex = extractor(temp_dir.path());

        let err = ex
            .apply_layer(Cursor::new(b"not gzip".to_vec()), LayerCompression::Gzip)
            .unwrap_err();
        assert!(matches!(err, BundleError::Extract(_)));
    }

    #[test]
    fn test_classify_entries() {
        assert_eq!(
            EntryKind::classify(EntryType::Regular, Path::new("a/b.txt"), None).unwrap(),
            EntryKind::File
        );
        assert_eq!(
            EntryKind::classify(EntryType::Regular, Path::new("a/.wh.b.txt"), None).unwrap(),
            EntryKind::Whiteout {
                victim: OsString::from("b.txt")
            }
        );
        assert_eq!(
            EntryKind::classify(EntryType::Regular, Path::new("a/.wh..wh..opq"), None).unwrap(),
            EntryKind::OpaqueWhiteout
        );
        assert_eq!(
            EntryKind::classify(
                EntryType::Symlink,
                Path::new("l"),
                Some(PathBuf::from("target"))
            )
            .unwrap(),
            EntryKind::Symlink {
                target: PathBuf::from("target")
            }
        );
        assert_eq!(
            EntryKind::classify(EntryType::Char, Path::new("dev/null"), None).unwrap(),
            EntryKind::Unsupported(EntryType::Char)
        );
        assert!(EntryKind::classify(EntryType::Symlink, Path::new("l"), None).is_err());
        assert!(EntryKind::classify(EntryType::Regular, Path::new("a/.wh..."), None).is_err());
    }

    #[test]
    fn test_compression_from_media_type() {
        use LayerCompression::*;
        let cases = [
            ("application/vnd.oci.image.layer.v1.tar", Some(None)),
            ("application/vnd.oci.image.layer.v1.tar+gzip", Some(Gzip)),
            ("application/vnd.oci.image.layer.v1.tar+zstd", Some(Zstd)),
            (
                "application/vnd.oci.image.layer.nondistributable.v1.tar+gzip",
                Some(Gzip),
            ),
            ("application/vnd.docker.image.rootfs.diff.tar.gzip", Some(Gzip)),
            (
                "application/vnd.docker.image.rootfs.foreign.diff.tar.gzip",
                Some(Gzip),
            ),
            ("application/vnd.oci.image.config.v1+json", Option::None),
            ("application/octet-stream", Option::None),
        ];
        for (media_type, expected) in cases {
            assert_eq!(
                LayerCompression::from_media_type(media_type),
                expected,
                "{}",
                media_type
            );
        }
    }
}
