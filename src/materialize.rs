//! Writes a [`Tree`] out as a real directory for the lazifier.
//!
//! File bodies come from the pool. By default they are copied; with
//! `link_from_pool` they are hardlinked to the blob instead (falling back to a
//! copy when the filesystem refuses), in which case permission bits are left
//! alone because the inode is shared with the read-only blob.

use anyhow::{Context, Result};
use std::fs;
use std::path::{Path, PathBuf};

use crate::error::ConvertError;
use crate::store::{ContentHash, ContentStore};
use crate::tree::{FileContent, NodeKind, Tree, TreeEntry, TreePath};

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct MaterializeStats {
    pub directories: usize,
    pub files: usize,
    pub symlinks: usize,
    pub hardlinks: usize,
    pub markers: usize,
    pub bytes: u64,
}

struct PendingHardlink<'t> {
    entry: &'t TreeEntry,
    target: &'t TreePath,
    content: FileContent,
}

/// Hardlink `dest` to `target`, copying when linking is not possible.
fn try_link_or_copy(target: &Path, dest: &Path) -> Result<()> {
    if !target.exists() {
        return Err(anyhow::anyhow!("hardlink target missing: {}", target.display()));
    }

    // Remove destination if it already exists
    if fs::symlink_metadata(dest).is_ok() {
        fs::remove_file(dest)
            .with_context(|| format!("Failed to remove existing file: {}", dest.display()))?;
    }

    if let Err(e) = fs::hard_link(target, dest) {
        // Filesystem might not support hardlinks - fall back to copy
        log::debug!(
            "hardlink failed ({}), falling back to copy: {} -> {}",
            e,
            target.display(),
            dest.display()
        );
        fs::copy(target, dest)
            .with_context(|| format!("Failed to copy {} to {}", target.display(), dest.display()))?;
    }

    Ok(())
}

#[cfg(unix)]
fn set_mode(path: &Path, mode: u32) {
    use std::os::unix::fs::PermissionsExt;
    if let Err(e) = fs::set_permissions(path, fs::Permissions::from_mode(mode)) {
        log::warn!("Failed to set permissions on {}: {}", path.display(), e);
    }
}

#[cfg(not(unix))]
fn set_mode(_path: &Path, _mode: u32) {}

/// Materializes `tree` under `root`, which is recreated from scratch.
pub fn materialize_tree(
    tree: &Tree,
    store: &ContentStore,
    root: &Path,
    link_from_pool: bool,
) -> Result<MaterializeStats> {
    if fs::symlink_metadata(root).is_ok() {
        make_writable(root);
        fs::remove_dir_all(root)
            .with_context(|| format!("Failed to clear previous output: {}", root.display()))?;
    }
    fs::create_dir_all(root)
        .with_context(|| format!("Failed to create directory: {}", root.display()))?;

    let mut stats = MaterializeStats::default();
    let mut directories: Vec<(PathBuf, u32)> = Vec::new();
    let mut hardlinks = Vec::new();

    // First pass: directories, files, symlinks and markers. Hardlinks wait for
    // their targets.
    for entry in tree.iter() {
        let dest = root.join(entry.path.as_str());

        match &entry.kind {
            NodeKind::Directory => {
                fs::create_dir_all(&dest)
                    .with_context(|| format!("Failed to create directory: {}", dest.display()))?;
                // Owner keeps write access until every child is in place.
                directories.push((dest, entry.mode | 0o700));
                stats.directories += 1;
            }
            NodeKind::File { content, size } => {
                write_file(store, entry, content, &dest, link_from_pool)?;
                stats.files += 1;
                stats.bytes += size;
            }
            NodeKind::Symlink { target } => {
                create_symlink(target, &dest)?;
                stats.symlinks += 1;
            }
            NodeKind::Hardlink {
                target, content, ..
            } => hardlinks.push(PendingHardlink {
                entry,
                target,
                content: *content,
            }),
            NodeKind::Whiteout | NodeKind::OpaqueWhiteout => {
                fs::File::create(&dest)
                    .with_context(|| format!("Failed to create marker: {}", dest.display()))?;
                stats.markers += 1;
            }
        }
    }

    // Second pass: hardlinks. A target that was replaced or removed since the
    // link was made no longer shares content, so the link gets its own copy.
    for link in hardlinks {
        let dest = root.join(link.entry.path.as_str());
        let shares_content = tree
            .get(link.target)
            .and_then(|t| t.kind.content())
            .map(|c| c == link.content)
            .unwrap_or(false);

        if shares_content {
            try_link_or_copy(&root.join(link.target.as_str()), &dest)?;
        } else {
            log::debug!(
                "Hardlink target {} changed, writing {} from the pool",
                link.target,
                link.entry.path
            );
            write_file(store, link.entry, &link.content, &dest, link_from_pool)?;
        }
        stats.hardlinks += 1;
    }

    // Deepest directories first so restrictive modes never block a parent.
    for (dir, mode) in directories.iter().rev() {
        set_mode(dir, *mode);
    }

    log::debug!(
        "Materialized {} directories, {} files, {} symlinks, {} hardlinks into {}",
        stats.directories,
        stats.files,
        stats.symlinks,
        stats.hardlinks,
        root.display()
    );
    Ok(stats)
}

fn blob_path(store: &ContentStore, entry: &TreeEntry, content: &FileContent) -> Result<PathBuf> {
    let hash: ContentHash = content
        .hash()
        .ok_or_else(|| anyhow::anyhow!("Content of {} was never stored", entry.path))?;
    let blob = store.path_for(&hash);
    if !blob.is_file() {
        return Err(ConvertError::MissingBlob {
            hash: hash.to_hex(),
            path: entry.path.to_string(),
        }
        .into());
    }
    Ok(blob)
}

fn write_file(
    store: &ContentStore,
    entry: &TreeEntry,
    content: &FileContent,
    dest: &Path,
    link_from_pool: bool,
) -> Result<()> {
    let blob = blob_path(store, entry, content)?;

    if link_from_pool {
        return try_link_or_copy(&blob, dest);
    }

    fs::copy(&blob, dest)
        .with_context(|| format!("Failed to copy {} to {}", blob.display(), dest.display()))?;
    // Ensure owner can read
    set_mode(dest, entry.mode | 0o400);
    Ok(())
}

#[cfg(unix)]
fn create_symlink(target: &str, dest: &Path) -> Result<()> {
    std::os::unix::fs::symlink(target, dest)
        .with_context(|| format!("Failed to create symlink {} -> {}", dest.display(), target))
}

#[cfg(not(unix))]
fn create_symlink(target: &str, dest: &Path) -> Result<()> {
    log::warn!("Skipping symlink {} -> {} on this platform", dest.display(), target);
    Ok(())
}

/// Gives the owner write access on every directory below `root` so a previous
/// output can be removed.
fn make_writable(root: &Path) {
    let mut stack = vec![root.to_path_buf()];
    while let Some(dir) = stack.pop() {
        match fs::symlink_metadata(&dir) {
            Ok(meta) if meta.is_dir() => set_mode(&dir, 0o755),
            _ => continue,
        }
        if let Ok(children) = fs::read_dir(&dir) {
            stack.extend(children.filter_map(|c| c.ok()).map(|c| c.path()));
        }
    }
}
