//! Log bundle archives
//!
//! Bundles are gzip-compressed tar archives rooted at one top-level
//! directory of plain files. Extraction validates every entry before writing
//! anything: a link, a `..` component or a path outside the destination
//! aborts the whole extraction.

use crate::error::{GlideinError, Result};
use crate::observability::GlideinMetrics;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use std::path::{Component, Path, PathBuf};
use tar::{Archive, Builder, EntryType};

/// Closed set of log files for one terminated glidein
#[derive(Debug, Clone)]
pub struct LogBundle {
    /// Top-level directory inside the archive
    pub root: String,
    pub bytes: Vec<u8>,
}

impl LogBundle {
    /// Archive `log_dir` under `root/`. Blocking.
    pub fn capture(log_dir: &Path, root: &str) -> Result<Self> {
        if !log_dir.is_dir() {
            return Err(GlideinError::Archive(format!(
                "log directory {} does not exist",
                log_dir.display()
            )));
        }

        let encoder = GzEncoder::new(Vec::new(), Compression::default());
        let mut builder = Builder::new(encoder);
        builder.follow_symlinks(false);
        builder
            .append_dir_all(root, log_dir)
            .map_err(|e| GlideinError::Archive(format!("failed to add {}: {e}", log_dir.display())))?;
        let encoder = builder
            .into_inner()
            .map_err(|e| GlideinError::Archive(e.to_string()))?;
        let bytes = encoder
            .finish()
            .map_err(|e| GlideinError::Archive(e.to_string()))?;

        Ok(Self {
            root: root.to_string(),
            bytes,
        })
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

/// Entry paths of a bundle, in archive order
pub fn entry_names(bytes: &[u8]) -> Result<Vec<String>> {
    let mut archive = Archive::new(GzDecoder::new(bytes));
    let mut names = Vec::new();
    for entry in archive.entries()? {
        let entry = entry?;
        names.push(entry.path()?.to_string_lossy().into_owned());
    }
    Ok(names)
}

/// Resolve `path` lexically below a root; `None` if it would escape
fn contained(path: &Path) -> Option<PathBuf> {
    let mut resolved = PathBuf::new();
    for component in path.components() {
        match component {
            Component::Normal(part) => resolved.push(part),
            Component::CurDir => {}
            Component::ParentDir => {
                if !resolved.pop() {
                    return None;
                }
            }
            Component::RootDir | Component::Prefix(_) => return None,
        }
    }
    Some(resolved)
}

fn traversal(entry: &Path, dest: &Path) -> GlideinError {
    GlideinMetrics::new().inc_traversal_rejection();
    GlideinError::PathTraversal {
        entry: entry.to_string_lossy().into_owned(),
        dest: dest.to_path_buf(),
    }
}

/// Check every entry is a plain file or directory inside `dest`
fn validate(bytes: &[u8], dest: &Path) -> Result<()> {
    let mut archive = Archive::new(GzDecoder::new(bytes));
    for entry in archive.entries()? {
        let entry = entry?;
        let path = entry.path()?.into_owned();
        let parent_dir = path.components().any(|c| c == Component::ParentDir);
        if parent_dir || contained(&path).is_none() {
            return Err(traversal(&path, dest));
        }

        match entry.header().entry_type() {
            EntryType::Regular | EntryType::Continuous | EntryType::Directory => {}
            // links are resolved against the filesystem at unpack time
            EntryType::Symlink | EntryType::Link => return Err(traversal(&path, dest)),
            other => {
                return Err(GlideinError::Archive(format!(
                    "unsupported entry type {other:?} for {}",
                    path.display()
                )))
            }
        }
    }
    Ok(())
}

/// Extract a bundle into `dest`, failing closed on any escaping entry.
///
/// Returns the extracted entry paths relative to `dest`. Blocking.
pub fn safe_extract(bytes: &[u8], dest: &Path) -> Result<Vec<PathBuf>> {
    validate(bytes, dest)?;

    std::fs::create_dir_all(dest)?;
    let mut archive = Archive::new(GzDecoder::new(bytes));
    archive.set_preserve_permissions(false);
    let mut extracted = Vec::new();
    for entry in archive.entries()? {
        let mut entry = entry?;
        let path = entry.path()?.into_owned();
        let resolved = contained(&path).ok_or_else(|| traversal(&path, dest))?;
        if resolved.as_os_str().is_empty() {
            continue;
        }
        if !entry.unpack_in(dest)? {
            return Err(traversal(&path, dest));
        }
        extracted.push(resolved);
    }
    Ok(extracted)
}
