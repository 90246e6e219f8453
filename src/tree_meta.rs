//! Metadata artifact describing one tree.
//!
//! The artifact is JSON Lines: a [`MetaHeader`] object on the first line, then
//! one [`MetaRecord`] per entry in the tree's depth-first order. Nothing in it
//! depends on where the run happened (no absolute paths, no timestamps of the
//! run), so identical inputs give byte-identical output.

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::{BufRead, BufWriter, Write};
use std::path::Path;
use tempfile::NamedTempFile;

use crate::error::ConvertError;
use crate::store::{ContentStore, Sharding};
use crate::tree::{FileContent, NodeKind, Tree, TreeEntry};

pub const FORMAT: &str = "cafs-tree";
pub const FORMAT_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetaHeader {
    pub format: String,
    pub version: u32,
    /// `merged` or the layer id.
    pub tree: String,
    pub hash: String,
    pub sharding: String,
    pub entries: usize,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub repo_tags: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub architecture: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub os: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetaRecord {
    /// Absolute path inside the tree, e.g. `/etc/hosts`.
    pub path: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub mode: u32,
    pub uid: u64,
    pub gid: u64,
    pub mtime: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
    /// Lowercase hex SHA-256 of the content, for files and hardlinks.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hash: Option<String>,
    /// Symlink target as stored in the archive, or the hardlink's target path.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
}

/// Image-level facts copied into every header.
#[derive(Debug, Clone, Default)]
pub struct ImageInfo {
    pub repo_tags: Vec<String>,
    pub architecture: Option<String>,
    pub os: Option<String>,
}

pub struct MetadataBuilder<'a> {
    store: &'a ContentStore,
    image: ImageInfo,
}

impl<'a> MetadataBuilder<'a> {
    pub fn new(store: &'a ContentStore, image: ImageInfo) -> Self {
        Self { store, image }
    }

    pub fn header(&self, tree_id: &str, tree: &Tree) -> MetaHeader {
        MetaHeader {
            format: FORMAT.to_string(),
            version: FORMAT_VERSION,
            tree: tree_id.to_string(),
            hash: "sha256".to_string(),
            sharding: sharding_name(self.store.sharding()),
            entries: tree.len(),
            repo_tags: self.image.repo_tags.clone(),
            architecture: self.image.architecture.clone(),
            os: self.image.os.clone(),
        }
    }

    /// Builds the record for one entry, checking that its content is in the pool.
    pub fn record(&self, entry: &TreeEntry) -> Result<MetaRecord> {
        let mut record = MetaRecord {
            path: entry.path.to_string(),
            kind: entry.kind.name().to_string(),
            mode: entry.mode,
            uid: entry.uid,
            gid: entry.gid,
            mtime: entry.mtime,
            size: None,
            hash: None,
            target: None,
        };

        match &entry.kind {
            NodeKind::File { content, size } => {
                record.hash = Some(self.stored_hash(entry, content)?);
                record.size = Some(*size);
            }
            NodeKind::Hardlink {
                target,
                content,
                size,
            } => {
                record.hash = Some(self.stored_hash(entry, content)?);
                record.size = Some(*size);
                record.target = Some(target.to_string());
            }
            NodeKind::Symlink { target } => record.target = Some(target.clone()),
            NodeKind::Directory | NodeKind::Whiteout | NodeKind::OpaqueWhiteout => {}
        }
        Ok(record)
    }

    /// Writes the header and one record per entry. Returns the record count.
    pub fn write_to<W: Write>(&self, tree_id: &str, tree: &Tree, writer: W) -> Result<usize> {
        let mut writer = BufWriter::new(writer);

        serde_json::to_writer(&mut writer, &self.header(tree_id, tree))
            .context("Failed to serialize metadata header")?;
        writer.write_all(b"\n")?;

        let mut count = 0;
        for entry in tree.iter() {
            let record = self.record(entry)?;
            serde_json::to_writer(&mut writer, &record)
                .with_context(|| format!("Failed to serialize metadata for {}", entry.path))?;
            writer.write_all(b"\n")?;
            count += 1;
        }

        writer.flush().context("Failed to flush metadata")?;
        Ok(count)
    }

    /// Writes the artifact to `path`, replacing any previous one atomically.
    pub fn write(&self, tree_id: &str, tree: &Tree, path: &Path) -> Result<usize> {
        let dir = path
            .parent()
            .ok_or_else(|| anyhow!("Metadata path has no parent: {}", path.display()))?;
        fs::create_dir_all(dir)
            .with_context(|| format!("Failed to create directory: {}", dir.display()))?;

        let mut tmp = NamedTempFile::new_in(dir).context("Failed to create temporary metadata file")?;
        let count = self.write_to(tree_id, tree, tmp.as_file_mut())?;
        tmp.persist(path)
            .with_context(|| format!("Failed to write metadata: {}", path.display()))?;

        log::debug!("Wrote {} metadata records to {}", count, path.display());
        Ok(count)
    }

    fn stored_hash(&self, entry: &TreeEntry, content: &FileContent) -> Result<String> {
        let hash = content
            .hash()
            .ok_or_else(|| anyhow!("Content of {} was never stored", entry.path))?;
        if !self.store.has(&hash) {
            return Err(ConvertError::MissingBlob {
                hash: hash.to_hex(),
                path: entry.path.to_string(),
            }
            .into());
        }
        Ok(hash.to_hex())
    }
}

/// Reads an artifact back.
pub fn read_metadata<R: BufRead>(reader: R) -> Result<(MetaHeader, Vec<MetaRecord>)> {
    let mut lines = reader.lines();
    let header_line = lines
        .next()
        .ok_or_else(|| anyhow!("Metadata is empty"))?
        .context("Failed to read metadata header")?;
    let header: MetaHeader =
        serde_json::from_str(&header_line).context("Failed to parse metadata header")?;

    let mut records = Vec::with_capacity(header.entries);
    for line in lines {
        let line = line.context("Failed to read metadata record")?;
        if line.is_empty() {
            continue;
        }
        records.push(serde_json::from_str(&line).context("Failed to parse metadata record")?);
    }
    Ok((header, records))
}

fn sharding_name(sharding: Sharding) -> String {
    match sharding {
        Sharding::Flat => "flat".to_string(),
        Sharding::Prefix { levels, width } => format!("prefix-{}x{}", levels, width),
    }
}
