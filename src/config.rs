//! Conversion options and the on-disk output layout.

use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::layer::TreeMode;
use crate::lazifier::Lazifier;
use crate::store::Sharding;

/// Default upper bound on buffered file content per hashing batch.
pub const DEFAULT_BATCH_BYTES: usize = 64 * 1024 * 1024;
/// Files larger than this are streamed into the pool instead of batched.
pub const DEFAULT_INLINE_THRESHOLD: u64 = 8 * 1024 * 1024;

pub const MERGED_TREE_ID: &str = "merged";
pub const ROOT_DIR: &str = "root";
pub const METADATA_FILE: &str = "tree.jsonl";
pub const LAZIFIER_META_FILE: &str = "meta";

#[derive(Debug, Clone)]
pub struct ConvertOptions {
    pub tree_mode: TreeMode,
    /// Threads hashing and storing file content within a layer.
    pub workers: usize,
    pub batch_bytes: usize,
    pub inline_threshold: u64,
    pub sharding: Sharding,
    /// Check each layer's uncompressed digest against the config's `diff_ids`.
    pub verify_diff_ids: bool,
    /// Materialize files as hardlinks into the pool instead of copies.
    pub link_from_pool: bool,
    /// Program run once per tree; `None` stops after materialization.
    pub lazifier: Option<Lazifier>,
    pub lazifier_timeout: Option<Duration>,
    pub pool_dir: Option<PathBuf>,
    pub output_dir: Option<PathBuf>,
}

impl Default for ConvertOptions {
    fn default() -> Self {
        Self {
            tree_mode: TreeMode::default(),
            workers: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1),
            batch_bytes: DEFAULT_BATCH_BYTES,
            inline_threshold: DEFAULT_INLINE_THRESHOLD,
            sharding: Sharding::default(),
            verify_diff_ids: true,
            link_from_pool: false,
            lazifier: None,
            lazifier_timeout: None,
            pool_dir: None,
            output_dir: None,
        }
    }
}

impl ConvertOptions {
    /// Resolves output locations for `tarball`, honoring the overrides.
    pub fn layout(&self, tarball: &Path) -> OutputLayout {
        let derived = OutputLayout::for_tarball(tarball);
        OutputLayout {
            pool: self.pool_dir.clone().unwrap_or(derived.pool),
            output: self.output_dir.clone().unwrap_or(derived.output),
        }
    }
}

/// Where a conversion writes its results.
///
/// For `images/foo.tar` the defaults are `images/foo-pool/` for the blob pool
/// and `images/foo-lazy/` for the trees, each tree in its own subdirectory:
///
/// ```text
/// foo-lazy/<tree-id>/root/        materialized filesystem
/// foo-lazy/<tree-id>/tree.jsonl   entry metadata
/// foo-lazy/<tree-id>/meta         written by the lazifier
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputLayout {
    pub pool: PathBuf,
    pub output: PathBuf,
}

impl OutputLayout {
    pub fn for_tarball(tarball: &Path) -> Self {
        let file_name = tarball
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "image".to_string());
        let stem = [".tar.gz", ".tgz", ".tar"]
            .iter()
            .find_map(|ext| file_name.strip_suffix(*ext))
            .filter(|s| !s.is_empty())
            .unwrap_or(file_name.as_str())
            .to_string();
        let parent = tarball.parent().unwrap_or_else(|| Path::new(""));

        Self {
            pool: parent.join(format!("{}-pool", stem)),
            output: parent.join(format!("{}-lazy", stem)),
        }
    }

    pub fn tree_dir(&self, tree_id: &str) -> PathBuf {
        self.output.join(tree_id)
    }

    pub fn root_dir(&self, tree_id: &str) -> PathBuf {
        self.tree_dir(tree_id).join(ROOT_DIR)
    }

    pub fn metadata_path(&self, tree_id: &str) -> PathBuf {
        self.tree_dir(tree_id).join(METADATA_FILE)
    }

    pub fn lazifier_meta_path(&self, tree_id: &str) -> PathBuf {
        self.tree_dir(tree_id).join(LAZIFIER_META_FILE)
    }
}
