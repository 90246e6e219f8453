//! End-to-end conversions without a lazifier.

use crate::integration::common::{
    load_metadata, pool_blobs, record, sha256_hex, ImageBuilder, Item,
};
use cafs::{
    CancelToken, ConversionState, ConvertError, ConvertOptions, Converter, Notifier, Sharding,
    Stage, TreeMode,
};
use std::fs;
use tempfile::TempDir;

fn options() -> ConvertOptions {
    ConvertOptions {
        workers: 2,
        ..ConvertOptions::default()
    }
}

fn converter(options: ConvertOptions) -> Converter {
    Converter::new(options, Notifier::new(0))
}

#[test]
fn test_two_files_two_blobs() {
    let dir = TempDir::new().unwrap();
    let tarball = ImageBuilder::new()
        .layer(&[
            Item::File("a.txt", b"hello"),
            Item::Dir("dir"),
            Item::File("dir/b.txt", b"world"),
        ])
        .write(&dir.path().join("image.tar"));

    let mut converter = converter(options());
    let report = converter.convert(&tarball).unwrap();
    assert_eq!(converter.state(), ConversionState::Done);

    assert_eq!(report.layout.pool, dir.path().join("image-pool"));
    assert_eq!(report.layout.output, dir.path().join("image-lazy"));
    assert_eq!(report.repo_tags, vec!["test:latest".to_string()]);
    assert_eq!(report.trees.len(), 1);

    let blobs = pool_blobs(&report.layout.pool);
    assert_eq!(blobs.len(), 2);
    assert!(report.layout.pool.join(sha256_hex(b"hello")).is_file());
    assert_eq!(fs::read(report.layout.pool.join(sha256_hex(b"world"))).unwrap(), b"world");

    let tree = &report.trees[0];
    assert_eq!(tree.id, "merged");
    assert_eq!(tree.metadata, dir.path().join("image-lazy/merged/tree.jsonl"));

    let (header, records) = load_metadata(&tree.metadata);
    assert_eq!(header.format, "cafs-tree");
    assert_eq!(header.tree, "merged");
    assert_eq!(header.sharding, "flat");
    assert_eq!(header.entries, records.len());
    assert_eq!(header.architecture.as_deref(), Some("amd64"));

    let a = record(&records, "/a.txt").unwrap();
    assert_eq!(a.kind, "file");
    assert_eq!(a.size, Some(5));
    assert_eq!(a.hash.as_deref(), Some(sha256_hex(b"hello").as_str()));
    assert_eq!(record(&records, "/dir").unwrap().kind, "dir");
    assert_eq!(
        record(&records, "/dir/b.txt").unwrap().hash.as_deref(),
        Some(sha256_hex(b"world").as_str())
    );

    assert_eq!(fs::read(tree.root.join("a.txt")).unwrap(), b"hello");
    assert_eq!(fs::read(tree.root.join("dir/b.txt")).unwrap(), b"world");
}

#[test]
fn test_duplicate_content_is_stored_once() {
    let dir = TempDir::new().unwrap();
    let tarball = ImageBuilder::new()
        .layer(&[Item::File("one", b"same bytes"), Item::File("two", b"same bytes")])
        .write(&dir.path().join("dup.tar"));

    let report = converter(options()).convert(&tarball).unwrap();

    assert_eq!(pool_blobs(&report.layout.pool).len(), 1);
    assert_eq!(report.store.blobs_written, 1);

    let (_, records) = load_metadata(&report.trees[0].metadata);
    let expected = sha256_hex(b"same bytes");
    assert_eq!(record(&records, "/one").unwrap().hash.as_deref(), Some(expected.as_str()));
    assert_eq!(record(&records, "/two").unwrap().hash.as_deref(), Some(expected.as_str()));
}

#[test]
fn test_rerun_deduplicates_against_existing_pool() {
    let dir = TempDir::new().unwrap();
    let tarball = ImageBuilder::new()
        .layer(&[Item::File("a", b"payload")])
        .write(&dir.path().join("img.tar"));

    let first = converter(options()).convert(&tarball).unwrap();
    assert_eq!(first.store.blobs_written, 1);

    let second = converter(options()).convert(&tarball).unwrap();
    assert_eq!(second.store.blobs_written, 0);
    assert_eq!(second.store.blobs_deduplicated, 1);
    assert_eq!(pool_blobs(&second.layout.pool).len(), 1);
}

#[test]
fn test_whiteout_in_upper_layer_removes_file() {
    let dir = TempDir::new().unwrap();
    let tarball = ImageBuilder::new()
        .layer(&[Item::File("a.txt", b"gone soon"), Item::File("keep.txt", b"kept")])
        .layer(&[Item::Whiteout("a.txt")])
        .write(&dir.path().join("wh.tar"));

    let report = converter(options()).convert(&tarball).unwrap();
    let tree = &report.trees[0];

    let (_, records) = load_metadata(&tree.metadata);
    assert!(record(&records, "/a.txt").is_none());
    assert!(record(&records, "/.wh.a.txt").is_none());
    assert!(record(&records, "/keep.txt").is_some());

    assert!(!tree.root.join("a.txt").exists());
    assert!(tree.root.join("keep.txt").is_file());
    assert_eq!(report.layers[1].removed, 1);
}

#[test]
fn test_opaque_directory_hides_lower_children() {
    let dir = TempDir::new().unwrap();
    let tarball = ImageBuilder::new()
        .layer(&[
            Item::Dir("etc"),
            Item::File("etc/old.conf", b"old"),
            Item::File("etc/other.conf", b"other"),
        ])
        .layer(&[
            Item::Dir("etc"),
            Item::Opaque("etc"),
            Item::File("etc/new.conf", b"new"),
        ])
        .write(&dir.path().join("opq.tar"));

    let report = converter(options()).convert(&tarball).unwrap();
    let (_, records) = load_metadata(&report.trees[0].metadata);

    assert!(record(&records, "/etc").is_some());
    assert!(record(&records, "/etc/new.conf").is_some());
    assert!(record(&records, "/etc/old.conf").is_none());
    assert!(record(&records, "/etc/other.conf").is_none());
}

#[test]
fn test_links_survive_conversion() {
    let dir = TempDir::new().unwrap();
    let tarball = ImageBuilder::new()
        .layer(&[
            Item::Dir("bin"),
            Item::File("bin/busybox", b"#!busybox"),
            Item::Hardlink("bin/ash", "bin/busybox"),
            Item::Symlink("bin/sh", "busybox"),
        ])
        .write(&dir.path().join("links.tar"));

    let report = converter(options()).convert(&tarball).unwrap();
    let tree = &report.trees[0];
    let (_, records) = load_metadata(&tree.metadata);

    let ash = record(&records, "/bin/ash").unwrap();
    assert_eq!(ash.kind, "hardlink");
    assert_eq!(ash.target.as_deref(), Some("/bin/busybox"));
    assert_eq!(ash.hash.as_deref(), Some(sha256_hex(b"#!busybox").as_str()));

    let sh = record(&records, "/bin/sh").unwrap();
    assert_eq!(sh.kind, "symlink");
    assert_eq!(sh.target.as_deref(), Some("busybox"));
    assert_eq!(pool_blobs(&report.layout.pool).len(), 1);

    assert_eq!(fs::read(tree.root.join("bin/ash")).unwrap(), b"#!busybox");
    #[cfg(unix)]
    assert_eq!(
        fs::read_link(tree.root.join("bin/sh")).unwrap(),
        std::path::PathBuf::from("busybox")
    );
}

#[test]
fn test_metadata_is_deterministic_across_locations() {
    let first = TempDir::new().unwrap();
    let second = TempDir::new().unwrap();
    let image = ImageBuilder::new()
        .layer(&[
            Item::Dir("usr"),
            Item::File("usr/z", b"z"),
            Item::File("usr/a", b"a"),
            Item::File("top", b"top"),
        ])
        .layer(&[Item::File("usr/m", b"m"), Item::Whiteout("top")]);

    let a = converter(options())
        .convert(&image.write(&first.path().join("image.tar")))
        .unwrap();
    let b = converter(ConvertOptions {
        workers: 1,
        ..options()
    })
    .convert(&image.write(&second.path().join("image.tar")))
    .unwrap();

    let a_bytes = fs::read(&a.trees[0].metadata).unwrap();
    let b_bytes = fs::read(&b.trees[0].metadata).unwrap();
    assert_eq!(a_bytes, b_bytes);

    let (_, records) = load_metadata(&a.trees[0].metadata);
    let paths: Vec<&str> = records.iter().map(|r| r.path.as_str()).collect();
    assert_eq!(paths, vec!["/usr", "/usr/a", "/usr/m", "/usr/z"]);
}

#[test]
fn test_per_layer_trees() {
    let dir = TempDir::new().unwrap();
    let tarball = ImageBuilder::new()
        .layer(&[Item::File("a.txt", b"base"), Item::File("b.txt", b"b")])
        .layer(&[Item::Whiteout("a.txt"), Item::File("c.txt", b"c")])
        .write(&dir.path().join("layers.tar"));

    let report = converter(ConvertOptions {
        tree_mode: TreeMode::PerLayer,
        ..options()
    })
    .convert(&tarball)
    .unwrap();

    let ids: Vec<&str> = report.trees.iter().map(|t| t.id.as_str()).collect();
    assert_eq!(ids, vec!["layer0", "layer1"]);

    let (header, base) = load_metadata(&report.trees[0].metadata);
    assert_eq!(header.tree, "layer0");
    assert!(record(&base, "/a.txt").is_some());
    assert!(record(&base, "/b.txt").is_some());

    let (_, upper) = load_metadata(&report.trees[1].metadata);
    assert_eq!(record(&upper, "/.wh.a.txt").unwrap().kind, "whiteout");
    assert!(record(&upper, "/c.txt").is_some());
    assert!(record(&upper, "/b.txt").is_none());

    assert!(report.trees[1].root.join(".wh.a.txt").is_file());
    assert_eq!(pool_blobs(&report.layout.pool).len(), 3);
}

#[test]
fn test_gzip_layers_and_prefix_sharding() {
    let dir = TempDir::new().unwrap();
    let tarball = ImageBuilder::new()
        .gzip_layers()
        .layer(&[Item::File("compressed", b"inflated body")])
        .write(&dir.path().join("gz.tar"));

    let report = converter(ConvertOptions {
        sharding: Sharding::PREFIX2,
        ..options()
    })
    .convert(&tarball)
    .unwrap();

    let hash = sha256_hex(b"inflated body");
    assert!(report.layout.pool.join(&hash[..2]).join(&hash).is_file());

    let (header, _) = load_metadata(&report.trees[0].metadata);
    assert_eq!(header.sharding, "prefix-1x2");
    assert_eq!(
        fs::read(report.trees[0].root.join("compressed")).unwrap(),
        b"inflated body"
    );
}

#[test]
fn test_explicit_pool_and_output_dirs() {
    let dir = TempDir::new().unwrap();
    let tarball = ImageBuilder::new()
        .layer(&[Item::File("f", b"f")])
        .write(&dir.path().join("image.tar"));

    let report = converter(ConvertOptions {
        pool_dir: Some(dir.path().join("blobs")),
        output_dir: Some(dir.path().join("out")),
        ..options()
    })
    .convert(&tarball)
    .unwrap();

    assert!(dir.path().join("blobs").join(sha256_hex(b"f")).is_file());
    assert!(dir.path().join("out/merged/tree.jsonl").is_file());
    assert!(dir.path().join("out/merged/root/f").is_file());
    assert!(!dir.path().join("image-pool").exists());
}

#[test]
fn test_corrupt_archive() {
    let dir = TempDir::new().unwrap();
    let tarball = dir.path().join("broken.tar");
    fs::write(&tarball, vec![b'A'; 1024]).unwrap();

    let mut converter = converter(options());
    let failure = converter.convert(&tarball).unwrap_err();

    assert_eq!(failure.stage, Stage::OpenArchive);
    assert!(matches!(failure.kind(), Some(ConvertError::ArchiveCorrupt(_))));
    assert_eq!(converter.state(), ConversionState::Failed);
}

#[test]
fn test_archive_without_manifest() {
    let dir = TempDir::new().unwrap();
    let tarball = dir.path().join("bare.tar");
    fs::write(&tarball, crate::integration::common::layer_tar(&[Item::File("x", b"x")])).unwrap();

    let failure = converter(options()).convert(&tarball).unwrap_err();
    assert_eq!(failure.stage, Stage::ParseManifest);
    assert!(matches!(failure.kind(), Some(ConvertError::ManifestMissing(_))));
}

#[test]
fn test_diff_id_mismatch() {
    let dir = TempDir::new().unwrap();
    let tarball = ImageBuilder::new()
        .bad_diff_id()
        .layer(&[Item::File("f", b"f")])
        .write(&dir.path().join("tampered.tar"));

    let failure = converter(options()).convert(&tarball).unwrap_err();
    assert_eq!(failure.stage, Stage::ExtractLayers);
    assert!(matches!(failure.kind(), Some(ConvertError::DiffIdMismatch { .. })));

    // Same archive goes through once verification is off.
    let report = converter(ConvertOptions {
        verify_diff_ids: false,
        ..options()
    })
    .convert(&tarball)
    .unwrap();
    assert_eq!(report.trees[0].entries, 1);
}

#[test]
fn test_dangling_hardlink_fails_extraction() {
    let dir = TempDir::new().unwrap();
    let tarball = ImageBuilder::new()
        .layer(&[Item::Hardlink("link", "nowhere")])
        .write(&dir.path().join("dangling.tar"));

    let failure = converter(options()).convert(&tarball).unwrap_err();
    assert_eq!(failure.stage, Stage::ExtractLayers);
    assert!(matches!(failure.kind(), Some(ConvertError::DanglingHardlink { .. })));
}

#[test]
fn test_cancelled_before_start() {
    let dir = TempDir::new().unwrap();
    let tarball = ImageBuilder::new()
        .layer(&[Item::File("f", b"f")])
        .write(&dir.path().join("cancel.tar"));

    let cancel = CancelToken::new();
    cancel.cancel();
    let mut converter = converter(options()).with_cancel(cancel);
    let failure = converter.convert(&tarball).unwrap_err();

    assert!(matches!(failure.kind(), Some(ConvertError::Cancelled)));
    assert_eq!(converter.state(), ConversionState::Failed);
    assert!(!dir.path().join("cancel-lazy/merged/tree.jsonl").exists());
}
