//! End-to-end "docker save tarball → pool + trees" pipeline.
//!
//! [`Converter`] sequences the pieces:
//! - indexes the image archive and parses its manifest,
//! - replays the layers oldest first, storing file content in the pool,
//! - writes the metadata artifact and materializes `root/` for every tree,
//! - runs the lazifier on each tree when one is configured.
//!
//! Progress follows [`ConversionState`]; any failure ends in
//! [`ConversionState::Failed`] and is returned as a [`ConversionFailure`]
//! naming the stage. The pool may hold blobs from a failed run. That is
//! harmless: puts are idempotent and a rerun starts from the manifest again.

use anyhow::Result;
use indicatif::HumanDuration;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use crate::cancel::CancelToken;
use crate::config::{ConvertOptions, OutputLayout, MERGED_TREE_ID};
use crate::error::{ConversionFailure, ConvertError, Stage};
use crate::image_archive::ImageArchive;
use crate::layer::{LayerApplier, LayerSummary, TreeMode};
use crate::manifest::ImageManifest;
use crate::materialize::materialize_tree;
use crate::notifier::Notifier;
use crate::store::{ContentStore, StoreStats};
use crate::tree::Tree;
use crate::tree_meta::{ImageInfo, MetadataBuilder};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConversionState {
    Init,
    ManifestParsed,
    LayersExtracting,
    TreeReady,
    LazifierInvoked,
    Done,
    Failed,
}

/// One produced tree.
#[derive(Debug, Clone)]
pub struct TreeOutput {
    /// `merged` or the layer id.
    pub id: String,
    pub root: PathBuf,
    pub metadata: PathBuf,
    /// Where the lazifier was told to write, if it ran.
    pub lazifier_meta: Option<PathBuf>,
    pub entries: usize,
    pub bytes: u64,
    pub lazifier_exit: Option<i32>,
}

#[derive(Debug, Clone)]
pub struct ConversionReport {
    pub image: PathBuf,
    pub repo_tags: Vec<String>,
    pub layout: OutputLayout,
    pub layers: Vec<LayerSummary>,
    pub trees: Vec<TreeOutput>,
    /// New vs deduplicated blobs and bytes written by this run.
    pub store: StoreStats,
    pub elapsed: Duration,
}

pub struct Converter {
    options: ConvertOptions,
    notifier: Notifier,
    cancel: CancelToken,
    state: ConversionState,
}

/// Attributes an error to `stage`.
fn at<T>(stage: Stage, result: Result<T>) -> std::result::Result<T, ConversionFailure> {
    result.map_err(|e| ConversionFailure::new(stage, e))
}

/// Pool write failures surfacing during extraction belong to the store stage.
fn extraction_stage(err: &anyhow::Error) -> Stage {
    match err.downcast_ref::<ConvertError>() {
        Some(ConvertError::PoolWriteFailed { .. }) => Stage::StoreContent,
        _ => Stage::ExtractLayers,
    }
}

impl Converter {
    pub fn new(options: ConvertOptions, notifier: Notifier) -> Self {
        Self {
            options,
            notifier,
            cancel: CancelToken::new(),
            state: ConversionState::Init,
        }
    }

    /// Uses `cancel` instead of the converter's own token.
    pub fn with_cancel(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Handle that can be used from another thread to stop the conversion.
    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    pub fn state(&self) -> ConversionState {
        self.state
    }

    pub fn options(&self) -> &ConvertOptions {
        &self.options
    }

    fn transition(&mut self, next: ConversionState) {
        log::info!("State {:?} -> {:?}", self.state, next);
        self.state = next;
    }

    /// Converts the image at `tarball`.
    ///
    /// # Errors
    /// Returns a [`ConversionFailure`] carrying the [`Stage`] that failed; the
    /// underlying [`ConvertError`] is available through [`ConversionFailure::kind`].
    pub fn convert(&mut self, tarball: &Path) -> std::result::Result<ConversionReport, ConversionFailure> {
        self.state = ConversionState::Init;
        match self.run(tarball) {
            Ok(report) => Ok(report),
            Err(failure) => {
                self.transition(ConversionState::Failed);
                self.notifier.warn(&failure.to_string());
                Err(failure)
            }
        }
    }

    fn run(&mut self, tarball: &Path) -> std::result::Result<ConversionReport, ConversionFailure> {
        let started = Instant::now();
        let layout = self.options.layout(tarball);

        self.notifier
            .info(&format!("Starting conversion of {}", tarball.display()));
        self.notifier
            .debug(&format!("Pool directory: {}", layout.pool.display()));
        self.notifier
            .debug(&format!("Output directory: {}", layout.output.display()));

        self.notifier.info("Indexing image archive...");
        let archive = at(Stage::OpenArchive, ImageArchive::open(tarball))?;

        self.notifier.info("Parsing manifest...");
        let manifest = at(Stage::ParseManifest, archive.manifest())?;
        self.notifier.debug(&format!(
            "Image {} ({}/{}) with {} layers",
            manifest.repo_tags.join(", "),
            manifest.image_config.os,
            manifest.image_config.architecture,
            manifest.layers.len()
        ));
        self.transition(ConversionState::ManifestParsed);

        let store = at(
            Stage::StoreContent,
            ContentStore::open(&layout.pool, self.options.sharding),
        )?;

        self.transition(ConversionState::LayersExtracting);
        let (layers, trees) = self.extract_layers(&archive, &manifest, &store)?;
        self.transition(ConversionState::TreeReady);

        let builder = MetadataBuilder::new(
            &store,
            ImageInfo {
                repo_tags: manifest.repo_tags.clone(),
                architecture: Some(manifest.image_config.architecture.clone()),
                os: Some(manifest.image_config.os.clone()),
            },
        );

        let mut outputs = Vec::with_capacity(trees.len());
        let tree_count = trees.len();
        for (i, (id, tree)) in trees.iter().enumerate() {
            outputs.push(self.finish_tree(id, tree, &builder, &store, &layout)?);
            if i + 1 < tree_count && self.state == ConversionState::LazifierInvoked {
                self.transition(ConversionState::TreeReady);
            }
        }

        self.transition(ConversionState::Done);

        let stats = store.stats();
        let elapsed = started.elapsed();
        self.notifier.finish(&format!(
            "Converted {} layers into {} tree(s): {} new blobs, {} deduplicated, in {}",
            layers.len(),
            outputs.len(),
            stats.blobs_written,
            stats.blobs_deduplicated,
            HumanDuration(elapsed)
        ));

        Ok(ConversionReport {
            image: tarball.to_path_buf(),
            repo_tags: manifest.repo_tags,
            layout,
            layers,
            trees: outputs,
            store: stats,
            elapsed,
        })
    }

    /// Replays every layer; returns the per-layer summaries and the trees to emit.
    #[allow(clippy::type_complexity)]
    fn extract_layers(
        &self,
        archive: &ImageArchive,
        manifest: &ImageManifest,
        store: &ContentStore,
    ) -> std::result::Result<(Vec<LayerSummary>, Vec<(String, Tree)>), ConversionFailure> {
        let applier = at(
            Stage::ExtractLayers,
            LayerApplier::new(store, &self.options, self.cancel.clone()),
        )?;
        let per_layer = self.options.tree_mode == TreeMode::PerLayer;
        let total = manifest.layers.len();

        if total == 0 {
            self.notifier.warn("No layers found in the image");
        }

        let bar = self.notifier.create_progress_bar(total as u64, "layers");
        let mut merged = Tree::new();
        let mut own_trees = Vec::new();
        let mut used_ids = HashSet::new();
        let mut summaries = Vec::with_capacity(total);

        for layer in &manifest.layers {
            let result = (|| -> Result<LayerSummary> {
                self.cancel.checkpoint()?;
                let stream = archive.open_layer(layer)?;
                let mut own = per_layer.then(Tree::new);
                let summary = applier.apply(layer, stream, &mut merged, own.as_mut())?;
                if let Some(own) = own {
                    own_trees.push((unique_id(&mut used_ids, &summary.layer_id, layer.index), own));
                }
                Ok(summary)
            })();

            let summary = result.map_err(|e| {
                let stage = extraction_stage(&e);
                ConversionFailure::new(stage, e.context(format!("layer {}", layer.archive)))
            })?;

            self.notifier.info(&format!(
                "Layer {}/{}: {}",
                layer.index + 1,
                total,
                summary.layer_id
            ));
            self.notifier.progress(layer.index as u64 + 1, total as u64, "Applied layers");
            if let Some(bar) = &bar {
                bar.inc(1);
            }
            summaries.push(summary);
        }

        if let Some(bar) = bar {
            bar.finish_and_clear();
        }

        let trees = if per_layer {
            own_trees
        } else {
            vec![(MERGED_TREE_ID.to_string(), merged)]
        };
        Ok((summaries, trees))
    }

    /// Metadata, materialization and lazifier for one tree.
    fn finish_tree(
        &mut self,
        id: &str,
        tree: &Tree,
        builder: &MetadataBuilder<'_>,
        store: &ContentStore,
        layout: &OutputLayout,
    ) -> std::result::Result<TreeOutput, ConversionFailure> {
        let metadata = layout.metadata_path(id);
        let root = layout.root_dir(id);

        self.notifier.info(&format!("Writing metadata for {}...", id));
        let entries = at(Stage::WriteMetadata, builder.write(id, tree, &metadata))?;

        self.notifier.info(&format!("Materializing {}...", id));
        at(Stage::Materialize, self.cancel.checkpoint())?;
        let stats = at(
            Stage::Materialize,
            materialize_tree(tree, store, &root, self.options.link_from_pool),
        )?;

        let mut output = TreeOutput {
            id: id.to_string(),
            root,
            metadata,
            lazifier_meta: None,
            entries,
            bytes: stats.bytes,
            lazifier_exit: None,
        };

        if let Some(lazifier) = self.options.lazifier.clone() {
            let meta = layout.lazifier_meta_path(id);
            self.transition(ConversionState::LazifierInvoked);
            self.notifier
                .info(&format!("Running lazifier {} on {}...", lazifier.program(), id));
            let outcome = at(
                Stage::Lazifier,
                lazifier.invoke(
                    &output.root,
                    &meta,
                    store.root(),
                    self.options.lazifier_timeout,
                    &self.cancel,
                ),
            )?;
            output.lazifier_exit = Some(outcome.exit_code);
            output.lazifier_meta = Some(meta);
        }

        Ok(output)
    }
}

/// Layer ids are normally distinct; repeated ones get the layer index appended.
fn unique_id(used: &mut HashSet<String>, id: &str, index: usize) -> String {
    let id = if used.contains(id) {
        format!("{}-{}", id, index)
    } else {
        id.to_string()
    };
    used.insert(id.clone());
    id
}
