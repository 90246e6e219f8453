//! Common utilities for integration tests
//!
//! [`ImageBuilder`] writes small `docker save` style archives: a
//! `manifest.json`, an image config carrying real diff-ids, and one
//! `<id>/layer.tar` per layer.

use sha2::{Digest, Sha256};
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use tar_rs as tar;
use walkdir::WalkDir;

use cafs::tree_meta::{read_metadata, MetaHeader, MetaRecord};

/// One entry of a layer.
#[allow(dead_code)]
#[derive(Debug, Clone)]
pub enum Item {
    File(&'static str, &'static [u8]),
    Dir(&'static str),
    Symlink(&'static str, &'static str),
    Hardlink(&'static str, &'static str),
    /// `.wh.<name>` next to the removed path.
    Whiteout(&'static str),
    /// `.wh..wh..opq` inside the directory.
    Opaque(&'static str),
}

#[allow(dead_code)]
pub struct ImageBuilder {
    tags: Vec<String>,
    layers: Vec<Vec<Item>>,
    gzip_layers: bool,
    bad_diff_id: bool,
}

#[allow(dead_code)]
impl ImageBuilder {
    pub fn new() -> Self {
        Self {
            tags: vec!["test:latest".to_string()],
            layers: Vec::new(),
            gzip_layers: false,
            bad_diff_id: false,
        }
    }

    pub fn layer(mut self, items: &[Item]) -> Self {
        self.layers.push(items.to_vec());
        self
    }

    pub fn gzip_layers(mut self) -> Self {
        self.gzip_layers = true;
        self
    }

    /// Records a diff-id in the config that no layer matches.
    pub fn bad_diff_id(mut self) -> Self {
        self.bad_diff_id = true;
        self
    }

    /// Writes the image archive to `path`.
    pub fn write(&self, path: &Path) -> PathBuf {
        let mut diff_ids = Vec::new();
        let mut members = Vec::new();

        for (i, items) in self.layers.iter().enumerate() {
            let layer = layer_tar(items);
            diff_ids.push(if self.bad_diff_id {
                format!("sha256:{}", hex::encode(Sha256::digest(b"something else")))
            } else {
                format!("sha256:{}", hex::encode(Sha256::digest(&layer)))
            });

            let body = if self.gzip_layers { gzip(&layer) } else { layer };
            members.push((format!("layer{}/layer.tar", i), body));
        }

        let config = serde_json::json!({
            "architecture": "amd64",
            "os": "linux",
            "created": "2024-01-01T00:00:00Z",
            "rootfs": { "type": "layers", "diff_ids": diff_ids },
        });
        let config = serde_json::to_vec(&config).unwrap();
        let config_name = format!("{}.json", hex::encode(Sha256::digest(&config)));

        let manifest = serde_json::json!([{
            "Config": config_name,
            "RepoTags": self.tags,
            "Layers": members.iter().map(|(name, _)| name.clone()).collect::<Vec<_>>(),
        }]);

        let mut outer = tar::Builder::new(File::create(path).unwrap());
        append_file(&mut outer, "manifest.json", &serde_json::to_vec(&manifest).unwrap());
        append_file(&mut outer, &config_name, &config);
        for (name, body) in &members {
            append_file(&mut outer, name, body);
        }
        outer.into_inner().unwrap().flush().unwrap();

        path.to_path_buf()
    }
}

fn append_file<W: Write>(builder: &mut tar::Builder<W>, name: &str, body: &[u8]) {
    let mut header = tar::Header::new_gnu();
    header.set_entry_type(tar::EntryType::Regular);
    header.set_mode(0o644);
    header.set_size(body.len() as u64);
    builder.append_data(&mut header, name, body).unwrap();
}

fn gzip(data: &[u8]) -> Vec<u8> {
    let mut encoder = flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
    encoder.write_all(data).unwrap();
    encoder.finish().unwrap()
}

fn whiteout_path(path: &str) -> String {
    match path.rsplit_once('/') {
        Some((dir, name)) => format!("{}/.wh.{}", dir, name),
        None => format!(".wh.{}", path),
    }
}

pub fn layer_tar(items: &[Item]) -> Vec<u8> {
    let mut b = tar::Builder::new(Vec::new());
    for item in items {
        let mut h = tar::Header::new_gnu();
        h.set_mode(0o644);
        h.set_mtime(1_700_000_000);
        h.set_size(0);
        match item {
            Item::File(path, body) => {
                h.set_entry_type(tar::EntryType::Regular);
                h.set_size(body.len() as u64);
                b.append_data(&mut h, path, *body).unwrap();
            }
            Item::Dir(path) => {
                h.set_entry_type(tar::EntryType::Directory);
                h.set_mode(0o755);
                b.append_data(&mut h, path, &[][..]).unwrap();
            }
            Item::Symlink(path, target) => {
                h.set_entry_type(tar::EntryType::Symlink);
                h.set_mode(0o777);
                b.append_link(&mut h, path, target).unwrap();
            }
            Item::Hardlink(path, target) => {
                h.set_entry_type(tar::EntryType::Link);
                b.append_link(&mut h, path, target).unwrap();
            }
            Item::Whiteout(path) => {
                h.set_entry_type(tar::EntryType::Regular);
                b.append_data(&mut h, whiteout_path(path), &[][..]).unwrap();
            }
            Item::Opaque(dir) => {
                h.set_entry_type(tar::EntryType::Regular);
                b.append_data(&mut h, format!("{}/.wh..wh..opq", dir), &[][..])
                    .unwrap();
            }
        }
    }
    b.into_inner().unwrap()
}

pub fn sha256_hex(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

/// Blob files in the pool, ignoring its staging directory.
#[allow(dead_code)]
pub fn pool_blobs(pool: &Path) -> Vec<PathBuf> {
    let mut blobs: Vec<PathBuf> = WalkDir::new(pool)
        .into_iter()
        .filter_entry(|e| e.file_name() != ".tmp")
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .map(|e| e.into_path())
        .collect();
    blobs.sort();
    blobs
}

#[allow(dead_code)]
pub fn load_metadata(path: &Path) -> (MetaHeader, Vec<MetaRecord>) {
    let file = fs::File::open(path).unwrap();
    read_metadata(std::io::BufReader::new(file)).unwrap()
}

#[allow(dead_code)]
pub fn record<'a>(records: &'a [MetaRecord], path: &str) -> Option<&'a MetaRecord> {
    records.iter().find(|r| r.path == path)
}

/// Shell script lazifier; receives `<root> <meta> <pool>` as `$1 $2 $3`.
#[cfg(unix)]
#[allow(dead_code)]
pub fn script_lazifier(script: &str) -> cafs::Lazifier {
    cafs::Lazifier::new("sh").with_args(["-c".to_string(), script.to_string(), "lazifier".to_string()])
}
