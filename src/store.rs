//! Hash-addressed blob pool.
//!
//! [`ContentStore`] keeps every distinct file body exactly once, named by the
//! lowercase hex SHA-256 of its bytes. Two blobs with the same hash are taken to
//! be the same content: SHA-256 collisions are assumed not to happen, so no
//! byte comparison is done on a dedup hit.
//!
//! Layout on disk:
//! - [`Sharding::Flat`]: `<pool>/<hex>`
//! - [`Sharding::Prefix`]: `<pool>/<hex[0..w]>/.../<hex>` (`levels` directories of `width` chars)
//!
//! Writes go to `<pool>/.tmp/` first and are moved into place with a no-clobber
//! persist, so a blob path only ever holds complete content and concurrent
//! writers of the same hash end up with a single stored file.

use anyhow::{Context, Result};
use sha2::{Digest, Sha256};
use std::fmt;
use std::fs;
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use tempfile::NamedTempFile;

use crate::error::ConvertError;

const TMP_DIR: &str = ".tmp";

/// Stands in for the hash in errors raised before a streamed blob is hashed.
const STREAMING: &str = "(streaming)";

/// SHA-256 digest of a blob.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ContentHash([u8; 32]);

impl ContentHash {
    pub fn of(bytes: &[u8]) -> Self {
        Self(Sha256::digest(bytes).into())
    }

    pub fn from_digest(hasher: Sha256) -> Self {
        Self(hasher.finalize().into())
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Display for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl FromStr for ContentHash {
    type Err = anyhow::Error;

    /// Accepts bare hex or the `sha256:` prefixed form used by image configs.
    fn from_str(s: &str) -> Result<Self> {
        let hex_part = s.strip_prefix("sha256:").unwrap_or(s);
        let mut out = [0u8; 32];
        hex::decode_to_slice(hex_part, &mut out)
            .with_context(|| format!("Invalid sha256 digest: {}", s))?;
        Ok(Self(out))
    }
}

impl serde::Serialize for ContentHash {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

/// Directory sharding scheme of the pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Sharding {
    #[default]
    Flat,
    Prefix { levels: usize, width: usize },
}

impl Sharding {
    /// Two-character single level sharding (`ab/abcdef...`).
    pub const PREFIX2: Sharding = Sharding::Prefix {
        levels: 1,
        width: 2,
    };

    fn relative_path(&self, hex: &str) -> PathBuf {
        let mut path = PathBuf::new();
        if let Sharding::Prefix { levels, width } = *self {
            for level in 0..levels {
                let start = level * width;
                let end = (start + width).min(hex.len());
                if start >= end {
                    break;
                }
                path.push(&hex[start..end]);
            }
        }
        path.push(hex);
        path
    }
}

/// Result of a single `put`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StoredBlob {
    pub hash: ContentHash,
    pub size: u64,
    /// `false` when a blob with this hash was already in the pool.
    pub written: bool,
}

/// Counters accumulated over the lifetime of a store handle.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct StoreStats {
    pub blobs_written: u64,
    pub blobs_deduplicated: u64,
    pub bytes_written: u64,
}

#[derive(Debug)]
pub struct ContentStore {
    root: PathBuf,
    sharding: Sharding,
    blobs_written: AtomicU64,
    blobs_deduplicated: AtomicU64,
    bytes_written: AtomicU64,
}

impl ContentStore {
    /// Opens (creating if needed) a pool rooted at `root`.
    pub fn open<P: AsRef<Path>>(root: P, sharding: Sharding) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(root.join(TMP_DIR))
            .with_context(|| format!("Failed to create pool directory: {}", root.display()))?;

        Ok(Self {
            root,
            sharding,
            blobs_written: AtomicU64::new(0),
            blobs_deduplicated: AtomicU64::new(0),
            bytes_written: AtomicU64::new(0),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn sharding(&self) -> Sharding {
        self.sharding
    }

    /// Location of the blob for `hash`, whether or not it exists yet.
    pub fn path_for(&self, hash: &ContentHash) -> PathBuf {
        self.root.join(self.sharding.relative_path(&hash.to_hex()))
    }

    pub fn has(&self, hash: &ContentHash) -> bool {
        self.path_for(hash).is_file()
    }

    /// Stores `bytes` unless a blob with the same hash exists. Idempotent.
    pub fn put(&self, bytes: &[u8]) -> Result<StoredBlob> {
        let hash = ContentHash::of(bytes);
        let size = bytes.len() as u64;

        if self.has(&hash) {
            self.record_dedup(&hash);
            return Ok(StoredBlob {
                hash,
                size,
                written: false,
            });
        }

        let mut tmp = self.temp_file(&hash)?;
        tmp.write_all(bytes)
            .map_err(|e| self.write_failed(&hash, e))?;
        let written = self.commit(tmp, &hash, size)?;

        Ok(StoredBlob {
            hash,
            size,
            written,
        })
    }

    /// Streams `reader` into the pool, hashing on the way. Used for bodies too
    /// large to buffer; the temp copy is dropped if the hash already exists.
    pub fn put_reader<R: Read>(&self, reader: R) -> Result<StoredBlob> {
        let mut tmp = self.temp_file(STREAMING)?;

        // Read errors belong to the source; write errors to the pool.
        let mut hashing = HashingReader::new(reader);
        let mut buf = vec![0u8; 64 * 1024];
        let mut size = 0u64;
        loop {
            let n = match hashing.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e).context("Failed to read blob content"),
            };
            tmp.write_all(&buf[..n])
                .map_err(|e| self.write_failed(STREAMING, e))?;
            size += n as u64;
        }
        let hash = hashing.finish();

        if self.has(&hash) {
            self.record_dedup(&hash);
            return Ok(StoredBlob {
                hash,
                size,
                written: false,
            });
        }

        let written = self.commit(tmp, &hash, size)?;
        Ok(StoredBlob {
            hash,
            size,
            written,
        })
    }

    pub fn stats(&self) -> StoreStats {
        StoreStats {
            blobs_written: self.blobs_written.load(Ordering::Relaxed),
            blobs_deduplicated: self.blobs_deduplicated.load(Ordering::Relaxed),
            bytes_written: self.bytes_written.load(Ordering::Relaxed),
        }
    }

    fn temp_file<H: fmt::Display>(&self, hash: H) -> Result<NamedTempFile> {
        NamedTempFile::new_in(self.root.join(TMP_DIR))
            .map_err(|e| self.write_failed(hash, e).into())
    }

    /// Moves a fully written temp file to its final path. Returns `false` if
    /// another writer got there first.
    fn commit(&self, tmp: NamedTempFile, hash: &ContentHash, size: u64) -> Result<bool> {
        tmp.as_file()
            .sync_all()
            .map_err(|e| self.write_failed(hash, e))?;

        let dest = self.path_for(hash);
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent).map_err(|e| self.write_failed(hash, e))?;
        }

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            if let Err(e) = fs::set_permissions(tmp.path(), fs::Permissions::from_mode(0o444)) {
                log::debug!("Failed to make blob {} read-only: {}", hash, e);
            }
        }

        match tmp.persist_noclobber(&dest) {
            Ok(_) => {
                log::trace!("Stored blob {} ({} bytes)", hash, size);
                self.blobs_written.fetch_add(1, Ordering::Relaxed);
                self.bytes_written.fetch_add(size, Ordering::Relaxed);
                Ok(true)
            }
            Err(e) if e.error.kind() == io::ErrorKind::AlreadyExists => {
                // Lost the race to a concurrent writer; its copy is identical.
                self.record_dedup(hash);
                Ok(false)
            }
            Err(e) => Err(self.write_failed(hash, e.error).into()),
        }
    }

    fn record_dedup(&self, hash: &ContentHash) {
        log::trace!("Blob {} already in pool", hash);
        self.blobs_deduplicated.fetch_add(1, Ordering::Relaxed);
    }

    fn write_failed<H: fmt::Display>(&self, hash: H, err: io::Error) -> ConvertError {
        ConvertError::PoolWriteFailed {
            hash: hash.to_string(),
            pool: self.root.clone(),
            reason: err.to_string(),
        }
    }
}

/// Reader adapter feeding every byte it yields into a SHA-256 hasher.
pub struct HashingReader<R> {
    inner: R,
    hasher: Sha256,
}

impl<R: Read> HashingReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            hasher: Sha256::new(),
        }
    }

    pub fn finish(self) -> ContentHash {
        ContentHash::from_digest(self.hasher)
    }
}

impl<R: Read> Read for HashingReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.hasher.update(&buf[..n]);
        Ok(n)
    }
}
