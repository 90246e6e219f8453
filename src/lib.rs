pub mod cancel;
pub mod config;
pub mod converter;
pub mod error;
pub mod image_archive;
pub mod layer;
pub mod lazifier;
pub mod manifest;
pub mod materialize;
pub mod notifier;
pub mod store;
pub mod tar_reader;
pub mod tree;
pub mod tree_meta;

// Re-exports for easy access
pub use cancel::CancelToken;
pub use config::{ConvertOptions, OutputLayout};
pub use converter::{ConversionReport, ConversionState, Converter, TreeOutput};
pub use error::{ConversionFailure, ConvertError, Stage};
pub use image_archive::ImageArchive;
pub use layer::{LayerApplier, LayerSummary, TreeMode};
pub use lazifier::{Lazifier, LazifierOutcome};
pub use manifest::{ImageManifest, LayerRef};
pub use notifier::Notifier;
pub use store::{ContentHash, ContentStore, Sharding};
pub use tree::{Tree, TreeEntry, TreePath};
pub use tree_meta::{MetaHeader, MetaRecord, MetadataBuilder};
