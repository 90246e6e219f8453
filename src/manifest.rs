//! Parsing of the `docker save` manifest and image configuration.
//!
//! The outer archive carries `manifest.json` (an array of image descriptors)
//! and the image config it names. [`ImageManifest::parse`] turns those bytes
//! into the ordered layer list used to replay the image; it performs no I/O.

use anyhow::Result;
use serde::Deserialize;
use std::path::Path;

use crate::error::ConvertError;

pub const MANIFEST_FILE: &str = "manifest.json";

/// One descriptor of `manifest.json`.
#[derive(Debug, Clone, Deserialize)]
pub struct ManifestEntry {
    #[serde(rename = "Config")]
    pub config: String,

    #[serde(rename = "RepoTags", default)]
    pub repo_tags: Option<Vec<String>>,

    #[serde(rename = "Layers")]
    pub layers: Vec<String>,
}

/// Reference to one layer archive inside the image tarball.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LayerRef {
    /// Position in the manifest, oldest layer first.
    pub index: usize,
    /// Member name of the layer tar inside the outer archive.
    pub archive: String,
    /// `sha256:<hex>` digest of the uncompressed layer tar, from the config.
    pub diff_id: Option<String>,
}

impl LayerRef {
    /// Short identifier derived from the archive member name.
    ///
    /// - `<id>/layer.tar` → `<id>`
    /// - `blobs/sha256/<hex>` → `<hex>`
    /// - `<hex>.tar` / `<hex>.tar.gz` → `<hex>`
    pub fn id(&self) -> String {
        let path = Path::new(&self.archive);
        let file_name = path.file_name().and_then(|s| s.to_str()).unwrap_or("");

        if file_name == "layer.tar" {
            if let Some(dir) = path
                .parent()
                .and_then(|p| p.file_name())
                .and_then(|s| s.to_str())
            {
                return dir.to_string();
            }
        }

        let stem = file_name
            .trim_end_matches(".gz")
            .trim_end_matches(".tar")
            .trim_start_matches("sha256:");
        if stem.is_empty() {
            format!("layer-{}", self.index)
        } else {
            stem.to_string()
        }
    }
}

/// The parts of the image configuration the converter relies on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageConfig {
    pub architecture: String,
    pub os: String,
    pub diff_ids: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct ImageManifest {
    /// Member name of the image config blob.
    pub config: String,
    pub repo_tags: Vec<String>,
    /// Layers in application order.
    pub layers: Vec<LayerRef>,
    pub image_config: ImageConfig,
}

impl ImageManifest {
    /// Parses `manifest.json` and the config it references.
    ///
    /// `config_for` is handed the config member name from the manifest and
    /// must return its bytes, or `None` if the archive has no such member.
    pub fn parse<F>(manifest_bytes: &[u8], config_for: F) -> Result<Self>
    where
        F: FnOnce(&str) -> Option<Vec<u8>>,
    {
        let entry = parse_manifest(manifest_bytes)?;

        let config_bytes = config_for(&entry.config).ok_or_else(|| {
            ConvertError::ManifestMissing(format!(
                "image config {} referenced by manifest",
                entry.config
            ))
        })?;
        let image_config = parse_config(&config_bytes)?;

        if !image_config.diff_ids.is_empty() && image_config.diff_ids.len() != entry.layers.len() {
            return Err(ConvertError::ManifestMalformed(format!(
                "config lists {} diff_ids but manifest lists {} layers",
                image_config.diff_ids.len(),
                entry.layers.len()
            ))
            .into());
        }

        let layers = entry
            .layers
            .iter()
            .enumerate()
            .map(|(index, archive)| LayerRef {
                index,
                archive: archive.clone(),
                diff_id: image_config.diff_ids.get(index).cloned(),
            })
            .collect();

        Ok(Self {
            config: entry.config,
            repo_tags: entry.repo_tags.unwrap_or_default(),
            layers,
            image_config,
        })
    }
}

/// Parse the manifest.json and return its first image descriptor
pub fn parse_manifest(manifest_bytes: &[u8]) -> Result<ManifestEntry> {
    let manifest: Vec<ManifestEntry> = serde_json::from_slice(manifest_bytes).map_err(|e| {
        ConvertError::ManifestMalformed(format!("{} is not a valid manifest: {}", MANIFEST_FILE, e))
    })?;

    if manifest.len() > 1 {
        log::warn!(
            "{} describes {} images, converting only the first",
            MANIFEST_FILE,
            manifest.len()
        );
    }

    // Get the first manifest entry (most archives have only one)
    let entry = manifest
        .into_iter()
        .next()
        .ok_or_else(|| ConvertError::ManifestMalformed(format!("empty {}", MANIFEST_FILE)))?;

    if entry.config.is_empty() {
        return Err(ConvertError::ManifestMalformed("manifest has an empty Config".into()).into());
    }

    Ok(entry)
}

/// Parse the image configuration blob
pub fn parse_config(config_bytes: &[u8]) -> Result<ImageConfig> {
    let config: oci_spec::image::ImageConfiguration = serde_json::from_slice(config_bytes)
        .map_err(|e| ConvertError::ManifestMalformed(format!("invalid image configuration: {}", e)))?;

    Ok(ImageConfig {
        architecture: config.architecture().to_string(),
        os: config.os().to_string(),
        diff_ids: config.rootfs().diff_ids().clone(),
    })
}
