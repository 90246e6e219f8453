//! Layer application with overlay semantics.
//!
//! Entries of a layer are applied in archive order. Regular file bodies are
//! stored in the pool as they are read: small bodies are buffered into a batch
//! and hashed on a worker pool, large ones are streamed on the reading thread.
//! Batched files sit in the tree with a pending ticket until the batch is
//! flushed; every ticket is resolved before [`LayerApplier::apply`] returns.
//!
//! Whiteouts follow the overlayfs conventions used by `docker save`:
//! - `.wh.<name>` deletes `<name>` (and its subtree) from lower layers
//! - `.wh..wh..opq` empties its directory of lower-layer content, keeping
//!   whatever the current layer already put there

use anyhow::{anyhow, Context, Result};
use rayon::prelude::*;
use std::collections::{HashMap, HashSet};
use std::io::{self, Read};

use crate::cancel::CancelToken;
use crate::config::ConvertOptions;
use crate::error::ConvertError;
use crate::manifest::LayerRef;
use crate::store::{ContentHash, ContentStore, HashingReader};
use crate::tar_reader::{EntryKind, TarEntry, TarReader};
use crate::tree::{FileContent, NodeKind, Tree, TreeEntry, TreePath};

const WHITEOUT_PREFIX: &str = ".wh.";
const OPAQUE_WHITEOUT: &str = ".wh..wh..opq";

/// Which trees a conversion produces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TreeMode {
    /// One tree: the final filesystem after all layers.
    #[default]
    Merged,
    /// One tree per layer holding only that layer's entries, whiteouts included.
    PerLayer,
}

/// Counters for one applied layer.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LayerSummary {
    pub layer_id: String,
    pub entries: usize,
    pub files: usize,
    pub directories: usize,
    pub symlinks: usize,
    pub hardlinks: usize,
    pub whiteouts: usize,
    /// Lower-layer entries dropped by whiteouts.
    pub removed: usize,
    /// Devices, fifos and other entries with no tree representation.
    pub skipped: usize,
    pub content_bytes: u64,
    /// SHA-256 of the uncompressed layer tar.
    pub diff_id: Option<ContentHash>,
}

enum Whiteout {
    /// Directory whose lower-layer children go away.
    Opaque(TreePath),
    /// Path that goes away.
    Remove(TreePath),
}

fn classify_whiteout(path: &TreePath) -> Option<Whiteout> {
    let name = path.file_name()?;
    let parent = path.parent().unwrap_or_else(TreePath::root);

    if name == OPAQUE_WHITEOUT {
        return Some(Whiteout::Opaque(parent));
    }
    let target = name.strip_prefix(WHITEOUT_PREFIX)?;
    if target.is_empty() || target == "." || target == ".." {
        log::warn!("Ignoring whiteout {} with no usable target", path);
        return None;
    }
    Some(Whiteout::Remove(parent.join(target)))
}

fn tree_entry<R: Read>(kind: NodeKind, entry: &TarEntry<'_, R>) -> TreeEntry {
    TreeEntry {
        path: entry.path.clone(),
        kind,
        mode: entry.mode,
        uid: entry.uid,
        gid: entry.gid,
        mtime: entry.mtime,
    }
}

struct DeferredLink {
    /// Header fields of the link; `kind` is replaced once the target resolves.
    entry: TreeEntry,
    target: TreePath,
    /// Position of the link among the layer's entries.
    seq: usize,
}

/// Mutable state of one layer pass.
struct LayerPass<'t> {
    merged: &'t mut Tree,
    own: Option<&'t mut Tree>,
    /// Paths written by this layer and their ancestors; an opaque marker
    /// must not remove them.
    touched: HashSet<TreePath>,
    /// Position of the last entry that wrote or removed each path, and
    /// whether that dropped everything below it.
    replaced: HashMap<TreePath, (usize, bool)>,
    /// Position of the entry being applied.
    seq: usize,
    deferred: Vec<DeferredLink>,
    batch: Vec<(usize, Vec<u8>)>,
    batch_size: usize,
    stored: HashMap<usize, ContentHash>,
    next_ticket: usize,
    summary: LayerSummary,
}

impl<'t> LayerPass<'t> {
    fn insert(&mut self, entry: TreeEntry) {
        self.insert_at(entry, self.seq);
    }

    /// Inserts `entry` as if it had been applied at position `seq`.
    fn insert_at(&mut self, entry: TreeEntry, seq: usize) {
        self.touched.extend(entry.path.ancestors());
        self.touched.insert(entry.path.clone());
        self.replaced
            .insert(entry.path.clone(), (seq, !entry.kind.is_dir()));
        if let Some(own) = self.own.as_deref_mut() {
            own.insert(entry.clone());
        }
        self.merged.insert(entry);
    }

    fn record_removal(&mut self, path: &TreePath) {
        self.replaced.insert(path.clone(), (self.seq, true));
    }

    /// Whether an entry after position `seq` wrote `path` or dropped one of
    /// its ancestors.
    fn superseded(&self, path: &TreePath, seq: usize) -> bool {
        if matches!(self.replaced.get(path), Some(&(at, _)) if at > seq) {
            return true;
        }
        path.ancestors()
            .iter()
            .any(|a| matches!(self.replaced.get(a), Some(&(at, true)) if at > seq))
    }

    fn record_marker(&mut self, entry: TreeEntry) {
        if let Some(own) = self.own.as_deref_mut() {
            own.insert(entry);
        }
    }

    fn ticket(&mut self) -> usize {
        let ticket = self.next_ticket;
        self.next_ticket += 1;
        ticket
    }

    /// Node kind for a link to `target`, if `target` can be linked to yet.
    fn link_kind(&self, target: &TreePath) -> Option<NodeKind> {
        match &self.merged.get(target)?.kind {
            NodeKind::File { content, size } => Some(NodeKind::Hardlink {
                target: target.clone(),
                content: *content,
                size: *size,
            }),
            NodeKind::Hardlink {
                target: first,
                content,
                size,
            } => Some(NodeKind::Hardlink {
                target: first.clone(),
                content: *content,
                size: *size,
            }),
            NodeKind::Symlink { target } => Some(NodeKind::Symlink {
                target: target.clone(),
            }),
            _ => None,
        }
    }
}

/// Applies layer tar streams to trees, storing file content on the way.
pub struct LayerApplier<'a> {
    store: &'a ContentStore,
    pool: Option<rayon::ThreadPool>,
    batch_bytes: usize,
    inline_threshold: u64,
    verify_diff_ids: bool,
    cancel: CancelToken,
}

impl<'a> LayerApplier<'a> {
    pub fn new(store: &'a ContentStore, options: &ConvertOptions, cancel: CancelToken) -> Result<Self> {
        let pool = if options.workers > 1 {
            Some(
                rayon::ThreadPoolBuilder::new()
                    .num_threads(options.workers)
                    .thread_name(|i| format!("cafs-hash-{}", i))
                    .build()
                    .context("Failed to start hashing workers")?,
            )
        } else {
            None
        };

        Ok(Self {
            store,
            pool,
            batch_bytes: options.batch_bytes.max(1),
            inline_threshold: options.inline_threshold,
            verify_diff_ids: options.verify_diff_ids,
            cancel,
        })
    }

    /// Applies the uncompressed tar `stream` of `layer` on top of `merged`.
    ///
    /// When `own` is given it additionally receives this layer's entries on
    /// their own, with whiteout markers recorded instead of applied.
    ///
    /// # Errors
    /// - [`ConvertError::ArchiveCorrupt`] for unreadable headers or short bodies
    /// - [`ConvertError::DanglingHardlink`] for links whose target never shows up
    /// - [`ConvertError::DiffIdMismatch`] when the stream digest differs from the config
    /// - [`ConvertError::PoolWriteFailed`] when a blob cannot be stored
    /// - [`ConvertError::Cancelled`] at a cancellation checkpoint
    pub fn apply<R: Read>(
        &self,
        layer: &LayerRef,
        stream: R,
        merged: &mut Tree,
        own: Option<&mut Tree>,
    ) -> Result<LayerSummary> {
        self.cancel.checkpoint()?;

        let mut pass = LayerPass {
            merged,
            own,
            touched: HashSet::new(),
            replaced: HashMap::new(),
            seq: 0,
            deferred: Vec::new(),
            batch: Vec::new(),
            batch_size: 0,
            stored: HashMap::new(),
            next_ticket: 0,
            summary: LayerSummary {
                layer_id: layer.id(),
                ..LayerSummary::default()
            },
        };

        let mut reader = TarReader::new(HashingReader::new(stream));
        for entry in reader.entries()? {
            let entry = entry?;
            self.apply_entry(&mut pass, entry)?;
        }

        self.flush(&mut pass)?;
        self.resolve_deferred(&mut pass)?;

        let stored = &pass.stored;
        let mut unresolved = pass.merged.resolve_pending(|t| stored.get(&t).copied());
        if let Some(own) = pass.own.as_deref_mut() {
            unresolved.extend(own.resolve_pending(|t| stored.get(&t).copied()));
        }
        if !unresolved.is_empty() {
            return Err(anyhow!(
                "{} file bodies of layer {} were never stored",
                unresolved.len(),
                pass.summary.layer_id
            ));
        }

        // The diff-id covers the whole tar stream, end-of-archive padding included.
        let mut hashing = reader.into_inner();
        io::copy(&mut hashing, &mut io::sink()).map_err(|e| {
            ConvertError::ArchiveCorrupt(format!(
                "failed to read trailer of layer {}: {}",
                layer.archive, e
            ))
        })?;
        let digest = hashing.finish();
        self.check_diff_id(layer, &digest)?;
        pass.summary.diff_id = Some(digest);

        log::debug!(
            "Layer {}: {} entries, {} files, {} whiteouts removed {} entries",
            pass.summary.layer_id,
            pass.summary.entries,
            pass.summary.files,
            pass.summary.whiteouts,
            pass.summary.removed
        );
        Ok(pass.summary)
    }

    fn apply_entry<R: Read>(&self, pass: &mut LayerPass<'_>, mut entry: TarEntry<'_, R>) -> Result<()> {
        if entry.path.is_root() {
            return Ok(());
        }
        pass.summary.entries += 1;
        pass.seq += 1;

        if let Some(whiteout) = classify_whiteout(&entry.path) {
            pass.summary.whiteouts += 1;
            let marker = match whiteout {
                Whiteout::Opaque(dir) => {
                    let touched = &pass.touched;
                    let removed = pass.merged.clear_children(&dir, |p| touched.contains(p));
                    log::debug!("Opaque directory {}: cleared {} entries", dir, removed);
                    pass.summary.removed += removed;
                    NodeKind::OpaqueWhiteout
                }
                Whiteout::Remove(target) => {
                    pass.record_removal(&target);
                    let removed = pass.merged.remove(&target);
                    log::debug!("Whiteout {}: removed {} entries", target, removed);
                    pass.summary.removed += removed;
                    NodeKind::Whiteout
                }
            };
            pass.record_marker(tree_entry(marker, &entry));
            return Ok(());
        }

        match entry.kind.clone() {
            EntryKind::Directory => {
                pass.summary.directories += 1;
                pass.insert(tree_entry(NodeKind::Directory, &entry));
            }
            EntryKind::Regular => {
                pass.summary.files += 1;
                pass.summary.content_bytes += entry.size;
                let content = self.store_content(pass, &mut entry)?;
                let size = entry.size;
                pass.insert(tree_entry(NodeKind::File { content, size }, &entry));
            }
            EntryKind::Symlink { target } => {
                pass.summary.symlinks += 1;
                pass.insert(tree_entry(NodeKind::Symlink { target }, &entry));
            }
            EntryKind::Hardlink { target } => {
                pass.summary.hardlinks += 1;
                match pass.link_kind(&target) {
                    Some(kind) => pass.insert(tree_entry(kind, &entry)),
                    None => {
                        log::trace!("Deferring hardlink {} -> {}", entry.path, target);
                        pass.deferred.push(DeferredLink {
                            entry: tree_entry(NodeKind::Directory, &entry),
                            target,
                            seq: pass.seq,
                        });
                    }
                }
            }
            EntryKind::Other(kind) => {
                log::debug!("Skipping {} entry {}", kind, entry.path);
                pass.summary.skipped += 1;
            }
        }
        Ok(())
    }

    fn store_content<R: Read>(&self, pass: &mut LayerPass<'_>, entry: &mut TarEntry<'_, R>) -> Result<FileContent> {
        if entry.size <= self.inline_threshold {
            let bytes = entry.read_content()?;
            let ticket = pass.ticket();
            pass.batch_size += bytes.len();
            pass.batch.push((ticket, bytes));
            if pass.batch_size >= self.batch_bytes {
                self.flush(pass)?;
            }
            return Ok(FileContent::Pending(ticket));
        }

        self.cancel.checkpoint()?;
        let stored = match self.store.put_reader(&mut *entry) {
            Ok(stored) => stored,
            Err(e) => {
                if let Some(reason) = entry.read_error() {
                    return Err(ConvertError::ArchiveCorrupt(format!(
                        "failed to read content of {}: {}",
                        entry.path, reason
                    ))
                    .into());
                }
                return Err(e);
            }
        };
        entry.verify_complete()?;
        Ok(FileContent::Stored(stored.hash))
    }

    /// Hashes and stores the buffered batch, on the worker pool if there is one.
    fn flush(&self, pass: &mut LayerPass<'_>) -> Result<()> {
        if pass.batch.is_empty() {
            return Ok(());
        }
        self.cancel.checkpoint()?;

        let batch = std::mem::take(&mut pass.batch);
        log::trace!(
            "Storing batch of {} files ({} bytes)",
            batch.len(),
            pass.batch_size
        );
        pass.batch_size = 0;

        let store = self.store;
        let put = |(ticket, bytes): &(usize, Vec<u8>)| -> Result<(usize, ContentHash)> {
            Ok((*ticket, store.put(bytes)?.hash))
        };

        let stored: Vec<(usize, ContentHash)> = match &self.pool {
            Some(pool) => pool.install(|| batch.par_iter().map(put).collect::<Result<Vec<_>>>())?,
            None => batch.iter().map(put).collect::<Result<Vec<_>>>()?,
        };
        pass.stored.extend(stored);
        Ok(())
    }

    /// Second pass over hardlinks whose target appeared later in the layer.
    ///
    /// A link goes in at its own archive position: one that a later entry of
    /// the layer overwrote or whited out is dropped.
    fn resolve_deferred(&self, pass: &mut LayerPass<'_>) -> Result<()> {
        let mut pending = std::mem::take(&mut pass.deferred);

        // Links may point at other deferred links; repeat while progress is made.
        loop {
            let before = pending.len();
            let mut still_pending = Vec::new();
            for link in pending {
                if pass.superseded(&link.entry.path, link.seq) {
                    log::debug!(
                        "Dropping hardlink {} -> {}, replaced later in the layer",
                        link.entry.path,
                        link.target
                    );
                    continue;
                }
                match pass.link_kind(&link.target) {
                    Some(kind) => {
                        log::trace!("Resolved hardlink {} -> {}", link.entry.path, link.target);
                        pass.insert_at(TreeEntry { kind, ..link.entry }, link.seq);
                    }
                    None => still_pending.push(link),
                }
            }
            pending = still_pending;
            if pending.is_empty() || pending.len() == before {
                break;
            }
        }

        match pending.into_iter().next() {
            Some(link) => Err(ConvertError::DanglingHardlink {
                link: link.entry.path.to_string(),
                target: link.target.to_string(),
            }
            .into()),
            None => Ok(()),
        }
    }

    fn check_diff_id(&self, layer: &LayerRef, digest: &ContentHash) -> Result<()> {
        let expected = match (&layer.diff_id, self.verify_diff_ids) {
            (Some(expected), true) => expected,
            _ => return Ok(()),
        };

        let expected_hash: ContentHash = expected.parse().map_err(|_| {
            ConvertError::ManifestMalformed(format!(
                "diff-id {} of layer {} is not a sha256 digest",
                expected, layer.archive
            ))
        })?;

        if expected_hash != *digest {
            return Err(ConvertError::DiffIdMismatch {
                layer: layer.id(),
                expected: expected.clone(),
                actual: format!("sha256:{}", digest),
            }
            .into());
        }
        log::trace!("Layer {} matches diff-id {}", layer.id(), expected);
        Ok(())
    }
}
