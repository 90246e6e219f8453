//! In-memory filesystem tree built while layers are applied.
//!
//! A [`Tree`] maps normalized relative paths to [`TreeEntry`] records. Paths
//! are ordered component by component, so iteration is a depth-first walk
//! with siblings in byte order and a directory always precedes its contents.

use serde::Serialize;
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;

use crate::store::ContentHash;

/// Normalized relative path: `/`-separated, no `.`/`..`, no leading slash.
/// The empty path is the tree root.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct TreePath(String);

impl TreePath {
    pub fn root() -> Self {
        Self(String::new())
    }

    /// Builds a path from an archive name, dropping `.`, empty and `..`
    /// components as well as any leading `/`.
    pub fn new(raw: &str) -> Self {
        let mut parts: Vec<&str> = Vec::new();
        for comp in raw.split('/') {
            match comp {
                "" | "." => {}
                ".." => {
                    parts.pop();
                }
                c => parts.push(c),
            }
        }
        Self(parts.join("/"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_root(&self) -> bool {
        self.0.is_empty()
    }

    pub fn components(&self) -> impl Iterator<Item = &str> {
        self.0.split('/').filter(|c| !c.is_empty())
    }

    pub fn file_name(&self) -> Option<&str> {
        if self.is_root() {
            None
        } else {
            self.0.rsplit('/').next()
        }
    }

    /// Parent directory; top-level entries have the root as parent.
    pub fn parent(&self) -> Option<TreePath> {
        if self.is_root() {
            return None;
        }
        match self.0.rfind('/') {
            Some(pos) => Some(Self(self.0[..pos].to_string())),
            None => Some(Self::root()),
        }
    }

    pub fn join(&self, name: &str) -> TreePath {
        if self.is_root() {
            TreePath::new(name)
        } else {
            TreePath::new(&format!("{}/{}", self.0, name))
        }
    }

    /// True when `self` equals `ancestor` or lies beneath it.
    pub fn starts_with(&self, ancestor: &TreePath) -> bool {
        if ancestor.is_root() {
            return true;
        }
        self.0 == ancestor.0
            || (self.0.starts_with(&ancestor.0) && self.0.as_bytes()[ancestor.0.len()] == b'/')
    }

    /// Every proper ancestor, nearest to the root first, root excluded.
    pub fn ancestors(&self) -> Vec<TreePath> {
        let mut out = Vec::new();
        let mut current = self.parent();
        while let Some(p) = current {
            if p.is_root() {
                break;
            }
            current = p.parent();
            out.push(p);
        }
        out.reverse();
        out
    }
}

impl Ord for TreePath {
    fn cmp(&self, other: &Self) -> Ordering {
        self.components().cmp(other.components())
    }
}

impl PartialOrd for TreePath {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for TreePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "/{}", self.0)
    }
}

impl From<&str> for TreePath {
    fn from(raw: &str) -> Self {
        TreePath::new(raw)
    }
}

impl Serialize for TreePath {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

/// Where a regular file's bytes live.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileContent {
    Stored(ContentHash),
    /// Queued for hashing; resolved before the layer is finished.
    Pending(usize),
}

impl FileContent {
    pub fn hash(&self) -> Option<ContentHash> {
        match self {
            FileContent::Stored(h) => Some(*h),
            FileContent::Pending(_) => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeKind {
    File { content: FileContent, size: u64 },
    Directory,
    Symlink { target: String },
    /// Shares content with `target`, which is a regular file in the same tree.
    Hardlink {
        target: TreePath,
        content: FileContent,
        size: u64,
    },
    /// Deletion marker, kept only in per-layer trees.
    Whiteout,
    /// "Drop everything below this directory from lower layers", per-layer trees only.
    OpaqueWhiteout,
}

impl NodeKind {
    pub fn name(&self) -> &'static str {
        match self {
            NodeKind::File { .. } => "file",
            NodeKind::Directory => "dir",
            NodeKind::Symlink { .. } => "symlink",
            NodeKind::Hardlink { .. } => "hardlink",
            NodeKind::Whiteout => "whiteout",
            NodeKind::OpaqueWhiteout => "opaque",
        }
    }

    pub fn is_dir(&self) -> bool {
        matches!(self, NodeKind::Directory)
    }

    pub fn content(&self) -> Option<FileContent> {
        match self {
            NodeKind::File { content, .. } | NodeKind::Hardlink { content, .. } => Some(*content),
            _ => None,
        }
    }

    fn content_mut(&mut self) -> Option<&mut FileContent> {
        match self {
            NodeKind::File { content, .. } | NodeKind::Hardlink { content, .. } => Some(content),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TreeEntry {
    pub path: TreePath,
    pub kind: NodeKind,
    pub mode: u32,
    pub uid: u64,
    pub gid: u64,
    pub mtime: u64,
}

impl TreeEntry {
    pub fn implicit_dir(path: TreePath) -> Self {
        Self {
            path,
            kind: NodeKind::Directory,
            mode: 0o755,
            uid: 0,
            gid: 0,
            mtime: 0,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Tree {
    entries: BTreeMap<TreePath, TreeEntry>,
}

impl Tree {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, path: &TreePath) -> Option<&TreeEntry> {
        self.entries.get(path)
    }

    pub fn contains(&self, path: &TreePath) -> bool {
        self.entries.contains_key(path)
    }

    /// Entries in depth-first, lexicographic order.
    pub fn iter(&self) -> impl Iterator<Item = &TreeEntry> {
        self.entries.values()
    }

    /// Inserts `entry` with overlay semantics: whatever sits at the path is
    /// replaced (a directory is only kept, with new metadata, when the new
    /// entry is a directory too), and missing or non-directory ancestors are
    /// turned into directories.
    pub fn insert(&mut self, entry: TreeEntry) {
        if entry.path.is_root() {
            return;
        }

        for ancestor in entry.path.ancestors() {
            let is_dir = self
                .entries
                .get(&ancestor)
                .map(|e| e.kind.is_dir())
                .unwrap_or(false);
            if !is_dir {
                self.remove(&ancestor);
                self.entries
                    .insert(ancestor.clone(), TreeEntry::implicit_dir(ancestor));
            }
        }

        let replacing_dir_with_dir = entry.kind.is_dir()
            && self
                .entries
                .get(&entry.path)
                .map(|e| e.kind.is_dir())
                .unwrap_or(false);
        if !replacing_dir_with_dir {
            self.remove(&entry.path);
        }
        self.entries.insert(entry.path.clone(), entry);
    }

    /// Removes the entry at `path` and everything below it. Returns the number
    /// of entries dropped.
    pub fn remove(&mut self, path: &TreePath) -> usize {
        if path.is_root() {
            let n = self.entries.len();
            self.entries.clear();
            return n;
        }
        let doomed: Vec<TreePath> = self
            .entries
            .range(path.clone()..)
            .take_while(|(p, _)| p.starts_with(path))
            .map(|(p, _)| p.clone())
            .collect();
        for p in &doomed {
            self.entries.remove(p);
        }
        doomed.len()
    }

    /// Removes every entry strictly below `dir` for which `keep` is false.
    pub fn clear_children<F>(&mut self, dir: &TreePath, keep: F) -> usize
    where
        F: Fn(&TreePath) -> bool,
    {
        let doomed: Vec<TreePath> = if dir.is_root() {
            self.entries.keys().filter(|p| !keep(p)).cloned().collect()
        } else {
            self.entries
                .range(dir.clone()..)
                .take_while(|(p, _)| p.starts_with(dir))
                .filter(|(p, _)| *p != dir && !keep(p))
                .map(|(p, _)| p.clone())
                .collect()
        };
        for p in &doomed {
            self.entries.remove(p);
        }
        doomed.len()
    }

    /// Replaces pending content tickets using `lookup`. Returns the tickets
    /// `lookup` could not resolve.
    pub fn resolve_pending<F>(&mut self, lookup: F) -> Vec<usize>
    where
        F: Fn(usize) -> Option<ContentHash>,
    {
        let mut unresolved = Vec::new();
        for entry in self.entries.values_mut() {
            if let Some(content) = entry.kind.content_mut() {
                if let FileContent::Pending(ticket) = *content {
                    match lookup(ticket) {
                        Some(hash) => *content = FileContent::Stored(hash),
                        None => unresolved.push(ticket),
                    }
                }
            }
        }
        unresolved
    }

    /// Distinct content hashes referenced by the tree.
    pub fn content_hashes(&self) -> Vec<ContentHash> {
        let mut hashes: Vec<ContentHash> = self
            .entries
            .values()
            .filter_map(|e| e.kind.content().and_then(|c| c.hash()))
            .collect();
        hashes.sort();
        hashes.dedup();
        hashes
    }
}
