//! Failure taxonomy for a conversion run.
//!
//! Library internals use `anyhow::Result` with context strings; the variants of
//! [`ConvertError`] are raised where a caller needs to tell failures apart and
//! can be recovered with `anyhow::Error::downcast_ref`. The orchestrator wraps
//! whatever went wrong in a [`ConversionFailure`] naming the [`Stage`].

use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum ConvertError {
    #[error("archive is corrupt: {0}")]
    ArchiveCorrupt(String),

    #[error("manifest not found in image archive: {0}")]
    ManifestMissing(String),

    #[error("manifest is malformed: {0}")]
    ManifestMalformed(String),

    #[error("hardlink {link} points at {target}, which does not exist in the tree")]
    DanglingHardlink { link: String, target: String },

    #[error("failed to write blob {hash} into pool {pool}: {reason}")]
    PoolWriteFailed {
        hash: String,
        pool: PathBuf,
        reason: String,
    },

    #[error("blob {hash} for {path} is not present in the pool")]
    MissingBlob { hash: String, path: String },

    #[error("layer {layer} has diff-id {actual}, manifest expects {expected}")]
    DiffIdMismatch {
        layer: String,
        expected: String,
        actual: String,
    },

    #[error("lazifier did not finish within {0:?}")]
    LazifierTimeout(Duration),

    #[error("lazifier exited with {0}")]
    LazifierFailed(String),

    #[error("lazifier command {command} could not be started: {reason}")]
    LazifierNotFound { command: String, reason: String },

    #[error("conversion cancelled")]
    Cancelled,
}

/// Pipeline stage a failure is attributed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    OpenArchive,
    ParseManifest,
    ExtractLayers,
    StoreContent,
    WriteMetadata,
    Materialize,
    Lazifier,
}

impl Stage {
    pub fn as_str(self) -> &'static str {
        match self {
            Stage::OpenArchive => "open-archive",
            Stage::ParseManifest => "parse-manifest",
            Stage::ExtractLayers => "extract-layers",
            Stage::StoreContent => "store-content",
            Stage::WriteMetadata => "write-metadata",
            Stage::Materialize => "materialize",
            Stage::Lazifier => "lazifier",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Terminal error of a conversion: the stage that failed plus the cause.
#[derive(Debug)]
pub struct ConversionFailure {
    pub stage: Stage,
    pub source: anyhow::Error,
}

impl ConversionFailure {
    pub fn new(stage: Stage, source: anyhow::Error) -> Self {
        Self { stage, source }
    }

    /// The domain error behind this failure, if one was raised.
    pub fn kind(&self) -> Option<&ConvertError> {
        self.source
            .chain()
            .find_map(|cause| cause.downcast_ref::<ConvertError>())
    }
}

impl fmt::Display for ConversionFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "stage {} failed: {:#}", self.stage, self.source)
    }
}

impl std::error::Error for ConversionFailure {}
