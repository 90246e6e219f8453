use anyhow::{Context, Result};
use flate2::read::GzDecoder;
use std::io::{self, BufRead, BufReader, Read};
use std::path::{Component, Path};
use tar_rs as tar;

use crate::error::ConvertError;
use crate::tree::TreePath;

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

/// Normalizes a path from a tar archive to be safe for extraction
/// Removes any attempts to escape the root directory
pub fn normalize_tar_path(p: &Path) -> TreePath {
    let mut parts: Vec<String> = Vec::new();

    for comp in p.components() {
        match comp {
            Component::CurDir => { /* skip "." */ }
            Component::ParentDir => {
                // Don't allow escaping the rootfs
                parts.pop();
            }
            Component::Normal(c) => parts.push(c.to_string_lossy().into_owned()),
            // Ignore absolute paths and Windows prefixes
            Component::RootDir | Component::Prefix(_) => { /* ignore */ }
        }
    }

    TreePath::new(&parts.join("/"))
}

/// Wraps `reader` in a gzip decoder when the stream starts with the gzip magic.
pub fn open_layer_stream<'a, R: Read + 'a>(reader: R) -> Result<Box<dyn Read + 'a>> {
    let mut buf_reader = BufReader::new(reader);
    let is_gzip = {
        let head = buf_reader
            .fill_buf()
            .context("Failed to read magic bytes from layer stream")?;
        head.len() >= 2 && head[..2] == GZIP_MAGIC
    };

    if is_gzip {
        log::debug!("Layer stream is gzip compressed");
        Ok(Box::new(GzDecoder::new(buf_reader)))
    } else {
        Ok(Box::new(buf_reader))
    }
}

/// Entry type as far as tree building is concerned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EntryKind {
    Regular,
    Directory,
    Symlink { target: String },
    Hardlink { target: TreePath },
    /// Devices, fifos and other types with no place in the content pool.
    Other(String),
}

/// Streams entries out of one tar archive.
///
/// Each call to [`TarReader::entries`] walks the archive from the reader's
/// current position; to re-read, open a fresh reader. Layer archives nested in
/// an image archive are read by handing the nested byte stream to a new
/// `TarReader`.
pub struct TarReader<R: Read> {
    archive: tar::Archive<R>,
}

impl<R: Read> TarReader<R> {
    pub fn new(reader: R) -> Self {
        Self {
            archive: tar::Archive::new(reader),
        }
    }

    pub fn entries(&mut self) -> Result<TarEntries<'_, R>> {
        let inner = self
            .archive
            .entries()
            .map_err(|e| ConvertError::ArchiveCorrupt(format!("cannot read entries: {}", e)))?;
        Ok(TarEntries { inner })
    }

    /// Gives back the underlying reader, positioned after the end-of-archive marker.
    pub fn into_inner(self) -> R {
        self.archive.into_inner()
    }
}

pub struct TarEntries<'a, R: 'a + Read> {
    inner: tar::Entries<'a, R>,
}

impl<'a, R: Read> Iterator for TarEntries<'a, R> {
    type Item = Result<TarEntry<'a, R>>;

    fn next(&mut self) -> Option<Self::Item> {
        let entry = match self.inner.next()? {
            Ok(entry) => entry,
            Err(e) => {
                return Some(Err(
                    ConvertError::ArchiveCorrupt(format!("bad tar header: {}", e)).into()
                ))
            }
        };
        Some(TarEntry::from_raw(entry))
    }
}

/// One archive member: parsed header fields plus its content, readable once.
pub struct TarEntry<'a, R: 'a + Read> {
    pub path: TreePath,
    pub kind: EntryKind,
    pub size: u64,
    pub mode: u32,
    pub uid: u64,
    pub gid: u64,
    pub mtime: u64,
    inner: tar::Entry<'a, R>,
    consumed: u64,
    read_error: Option<String>,
}

impl<'a, R: Read> TarEntry<'a, R> {
    fn from_raw(entry: tar::Entry<'a, R>) -> Result<Self> {
        let corrupt = |what: &str, e: io::Error| ConvertError::ArchiveCorrupt(format!("{}: {}", what, e));

        let raw_path = entry.path().map_err(|e| corrupt("bad entry path", e))?;
        let path = normalize_tar_path(&raw_path);
        let header = entry.header();
        let entry_type = header.entry_type();

        let link_name = || -> Result<std::path::PathBuf> {
            let link = entry
                .link_name()
                .map_err(|e| corrupt("bad link name", e))?
                .ok_or_else(|| {
                    ConvertError::ArchiveCorrupt(format!("link {} has no target", path))
                })?;
            Ok(link.into_owned())
        };

        let kind = if entry_type.is_file() {
            EntryKind::Regular
        } else if entry_type.is_dir() {
            EntryKind::Directory
        } else if entry_type.is_symlink() {
            EntryKind::Symlink {
                target: link_name()?.to_string_lossy().into_owned(),
            }
        } else if entry_type.is_hard_link() {
            EntryKind::Hardlink {
                target: normalize_tar_path(&link_name()?),
            }
        } else {
            EntryKind::Other(format!("{:?}", entry_type))
        };

        let mode = header.mode().map_err(|e| corrupt("bad mode field", e))?;
        // Ownership and times are left blank by some writers.
        let uid = header.uid().unwrap_or(0);
        let gid = header.gid().unwrap_or(0);
        let mtime = header.mtime().unwrap_or(0);
        let size = entry.size();

        Ok(Self {
            path,
            kind,
            size,
            mode: mode & 0o7777,
            uid,
            gid,
            mtime,
            inner: entry,
            consumed: 0,
            read_error: None,
        })
    }

    /// Reads the whole body, failing with `ArchiveCorrupt` if it is shorter
    /// than the header declares.
    pub fn read_content(&mut self) -> Result<Vec<u8>> {
        let mut buf = Vec::with_capacity(self.size as usize);
        if let Err(e) = self.read_to_end(&mut buf) {
            return Err(ConvertError::ArchiveCorrupt(format!(
                "failed to read content of {}: {}",
                self.path, e
            ))
            .into());
        }
        self.verify_complete()?;
        Ok(buf)
    }

    /// Checks that the body was read to its declared length.
    pub fn verify_complete(&self) -> Result<()> {
        if let Some(err) = &self.read_error {
            return Err(ConvertError::ArchiveCorrupt(format!(
                "failed to read content of {}: {}",
                self.path, err
            ))
            .into());
        }
        if self.consumed != self.size {
            return Err(ConvertError::ArchiveCorrupt(format!(
                "{} declares {} bytes but only {} are present",
                self.path, self.size, self.consumed
            ))
            .into());
        }
        Ok(())
    }

    /// Byte offset of the body within the archive stream.
    pub fn raw_file_position(&self) -> u64 {
        self.inner.raw_file_position()
    }

    /// Error hit while the body was being read through [`Read`], if any.
    pub fn read_error(&self) -> Option<&str> {
        self.read_error.as_deref()
    }
}

impl<'a, R: Read> Read for TarEntry<'a, R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self.inner.read(buf) {
            Ok(n) => {
                self.consumed += n as u64;
                Ok(n)
            }
            Err(e) => {
                self.read_error = Some(e.to_string());
                Err(e)
            }
        }
    }
}
