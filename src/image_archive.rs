//! Random access to the members of a `docker save` tarball.
//!
//! [`ImageArchive::open`] makes one pass over the outer archive and records
//! where each member's bytes start. Layer tars are then streamed straight out
//! of the file by offset and fed to a nested [`TarReader`](crate::tar_reader::TarReader)
//! without unpacking the outer archive to disk. A gzip-compressed outer archive
//! is first spooled to an uncompressed temporary file so it can be seeked.

use anyhow::{anyhow, Context, Result};
use flate2::read::GzDecoder;
use std::collections::HashMap;
use std::fs::File;
use std::io::{self, BufReader, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;

use crate::error::ConvertError;
use crate::manifest::{ImageManifest, LayerRef, MANIFEST_FILE};
use crate::tar_reader::{open_layer_stream, EntryKind, TarReader};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Member {
    offset: u64,
    size: u64,
}

pub struct ImageArchive {
    path: PathBuf,
    _spool: Option<NamedTempFile>,
    members: HashMap<String, Member>,
}

impl ImageArchive {
    pub fn open<P: AsRef<Path>>(tarball_path: P) -> Result<Self> {
        let tarball_path = tarball_path.as_ref();

        if !tarball_path.exists() {
            return Err(anyhow!(
                "Tarball file does not exist: {}",
                tarball_path.display()
            ));
        }
        if !tarball_path.is_file() {
            return Err(anyhow!("Path is not a file: {}", tarball_path.display()));
        }

        let spool = if Self::is_gzip(tarball_path)? {
            log::info!("Image archive is gzip compressed, decompressing to a temporary file");
            Some(Self::spool_decompressed(tarball_path)?)
        } else {
            None
        };
        let path = spool
            .as_ref()
            .map(|s| s.path().to_path_buf())
            .unwrap_or_else(|| tarball_path.to_path_buf());

        let members = Self::index(&path)?;
        log::debug!("Indexed {} members in {}", members.len(), tarball_path.display());

        Ok(Self {
            path,
            _spool: spool,
            members,
        })
    }

    /// Opens a bounded reader over one member's bytes.
    pub fn open_member(&self, name: &str) -> Result<Option<impl Read>> {
        let member = match self.members.get(&Self::key(name)) {
            Some(m) => *m,
            None => return Ok(None),
        };

        let mut file = File::open(&self.path)
            .with_context(|| format!("Failed to open image archive: {}", self.path.display()))?;
        file.seek(SeekFrom::Start(member.offset))
            .with_context(|| format!("Failed to seek to member {}", name))?;
        Ok(Some(BufReader::new(file.take(member.size))))
    }

    pub fn read_member(&self, name: &str) -> Result<Option<Vec<u8>>> {
        match self.open_member(name)? {
            Some(mut reader) => {
                let mut buf = Vec::new();
                reader
                    .read_to_end(&mut buf)
                    .with_context(|| format!("Failed to read member {}", name))?;
                Ok(Some(buf))
            }
            None => Ok(None),
        }
    }

    /// Parses `manifest.json` and the image config it references.
    pub fn manifest(&self) -> Result<ImageManifest> {
        let manifest_bytes = self
            .read_member(MANIFEST_FILE)?
            .ok_or_else(|| ConvertError::ManifestMissing(MANIFEST_FILE.to_string()))?;

        let mut config_error = None;
        let manifest = ImageManifest::parse(&manifest_bytes, |config_name| {
            match self.read_member(config_name) {
                Ok(bytes) => bytes,
                Err(e) => {
                    config_error = Some(e);
                    None
                }
            }
        });

        if let Some(e) = config_error {
            return Err(e.context("Failed to read image configuration"));
        }
        manifest
    }

    /// Opens the uncompressed tar stream of `layer`.
    pub fn open_layer(&self, layer: &LayerRef) -> Result<Box<dyn Read>> {
        let member = self.open_member(&layer.archive)?.ok_or_else(|| {
            ConvertError::ManifestMalformed(format!(
                "layer {} listed in manifest is not in the archive",
                layer.archive
            ))
        })?;
        open_layer_stream(member)
    }

    fn key(name: &str) -> String {
        crate::tree::TreePath::new(name).as_str().to_string()
    }

    fn is_gzip(path: &Path) -> Result<bool> {
        let mut file = File::open(path)
            .with_context(|| format!("Failed to open tar file: {}", path.display()))?;
        let mut magic_bytes = [0u8; 2];
        match file.read_exact(&mut magic_bytes) {
            Ok(()) => Ok(magic_bytes == [0x1f, 0x8b]),
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Ok(false),
            Err(e) => Err(e).context("Failed to read magic bytes from tar file"),
        }
    }

    fn spool_decompressed(path: &Path) -> Result<NamedTempFile> {
        let file = File::open(path)
            .with_context(|| format!("Failed to open tar file: {}", path.display()))?;
        let mut spool = NamedTempFile::new().context("Failed to create temporary file")?;
        io::copy(&mut GzDecoder::new(BufReader::new(file)), &mut spool).map_err(|e| {
            ConvertError::ArchiveCorrupt(format!("failed to decompress {}: {}", path.display(), e))
        })?;
        Ok(spool)
    }

    /// One pass over the archive recording member offsets. Hardlinked members
    /// are aliased to their targets.
    fn index(path: &Path) -> Result<HashMap<String, Member>> {
        let file = File::open(path)
            .with_context(|| format!("Failed to open tar file: {}", path.display()))?;
        let mut reader = TarReader::new(BufReader::new(file));

        let mut members = HashMap::new();
        let mut aliases = Vec::new();

        for entry in reader.entries()? {
            let entry = entry?;
            match &entry.kind {
                EntryKind::Regular => {
                    members.insert(
                        entry.path.as_str().to_string(),
                        Member {
                            offset: entry.raw_file_position(),
                            size: entry.size,
                        },
                    );
                }
                EntryKind::Hardlink { target } => {
                    aliases.push((entry.path.as_str().to_string(), target.as_str().to_string()));
                }
                _ => {}
            }
        }

        for (alias, target) in aliases {
            match members.get(&target).copied() {
                Some(member) => {
                    members.insert(alias, member);
                }
                None => log::warn!("Archive member {} links to missing {}", alias, target),
            }
        }

        Ok(members)
    }
}
