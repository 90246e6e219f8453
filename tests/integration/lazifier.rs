//! Conversions that hand their trees to a lazifier.

#[cfg(unix)]
mod tests {
    use crate::integration::common::{script_lazifier, ImageBuilder, Item};
    use cafs::{
        ConversionState, ConvertError, ConvertOptions, Converter, Lazifier, Notifier, Stage,
        TreeMode,
    };
    use std::fs;
    use std::path::{Path, PathBuf};
    use std::thread;
    use std::time::{Duration, Instant};
    use tempfile::TempDir;

    fn small_image(dir: &Path) -> PathBuf {
        ImageBuilder::new()
            .layer(&[Item::File("a.txt", b"hello"), Item::File("dir/b.txt", b"world")])
            .layer(&[Item::File("c.txt", b"again")])
            .write(&dir.join("image.tar"))
    }

    fn with_lazifier(lazifier: Lazifier) -> ConvertOptions {
        ConvertOptions {
            workers: 2,
            lazifier: Some(lazifier),
            ..ConvertOptions::default()
        }
    }

    #[test]
    fn test_lazifier_receives_root_meta_and_pool() {
        let dir = TempDir::new().unwrap();
        let tarball = small_image(dir.path());

        // Records what it saw into the meta file.
        let lazifier = script_lazifier(
            r#"test -f "$1/a.txt" && test -f "$1/dir/b.txt" && test -d "$3" && ls "$3" | wc -l > "$2""#,
        );
        let mut converter = Converter::new(with_lazifier(lazifier), Notifier::new(0));
        let report = converter.convert(&tarball).unwrap();

        assert_eq!(converter.state(), ConversionState::Done);
        let tree = &report.trees[0];
        assert_eq!(tree.lazifier_exit, Some(0));

        let meta = tree.lazifier_meta.clone().unwrap();
        assert_eq!(meta, dir.path().join("image-lazy/merged/meta"));
        // `ls` skips the pool's hidden staging directory.
        assert_eq!(fs::read_to_string(meta).unwrap().trim(), "3");
    }

    #[test]
    fn test_lazifier_runs_once_per_layer_tree() {
        let dir = TempDir::new().unwrap();
        let tarball = small_image(dir.path());

        let options = ConvertOptions {
            tree_mode: TreeMode::PerLayer,
            ..with_lazifier(script_lazifier(r#"ls "$1" > "$2""#))
        };
        let report = Converter::new(options, Notifier::new(0))
            .convert(&tarball)
            .unwrap();

        assert_eq!(report.trees.len(), 2);
        let first = fs::read_to_string(report.trees[0].lazifier_meta.as_ref().unwrap()).unwrap();
        let second = fs::read_to_string(report.trees[1].lazifier_meta.as_ref().unwrap()).unwrap();
        assert_eq!(first, "a.txt\ndir\n");
        assert_eq!(second, "c.txt\n");
    }

    #[test]
    fn test_lazifier_failure() {
        let dir = TempDir::new().unwrap();
        let tarball = small_image(dir.path());

        let mut converter = Converter::new(
            with_lazifier(script_lazifier("echo 'no space left' >&2; exit 3")),
            Notifier::new(0),
        );
        let failure = converter.convert(&tarball).unwrap_err();

        assert_eq!(failure.stage, Stage::Lazifier);
        match failure.kind() {
            Some(ConvertError::LazifierFailed(detail)) => {
                assert!(detail.contains("status 3"), "{}", detail);
                assert!(detail.contains("no space left"), "{}", detail);
            }
            other => panic!("unexpected error: {:?}", other),
        }
        assert_eq!(converter.state(), ConversionState::Failed);

        // Metadata and root are complete before the lazifier runs.
        assert!(dir.path().join("image-lazy/merged/tree.jsonl").is_file());
        assert!(dir.path().join("image-lazy/merged/root/c.txt").is_file());
    }

    #[test]
    fn test_lazifier_not_found() {
        let dir = TempDir::new().unwrap();
        let tarball = small_image(dir.path());

        let failure = Converter::new(
            with_lazifier(Lazifier::new("/nonexistent/lazifier-binary")),
            Notifier::new(0),
        )
        .convert(&tarball)
        .unwrap_err();

        assert_eq!(failure.stage, Stage::Lazifier);
        assert!(matches!(
            failure.kind(),
            Some(ConvertError::LazifierNotFound { .. })
        ));
    }

    #[test]
    fn test_lazifier_timeout() {
        let dir = TempDir::new().unwrap();
        let tarball = small_image(dir.path());

        let options = ConvertOptions {
            lazifier_timeout: Some(Duration::from_millis(200)),
            ..with_lazifier(script_lazifier("exec sleep 30"))
        };
        let failure = Converter::new(options, Notifier::new(0))
            .convert(&tarball)
            .unwrap_err();

        assert_eq!(failure.stage, Stage::Lazifier);
        assert!(matches!(
            failure.kind(),
            Some(ConvertError::LazifierTimeout(_))
        ));
    }

    #[test]
    fn test_cancel_while_lazifier_runs() {
        let dir = TempDir::new().unwrap();
        let tarball = small_image(dir.path());

        let mut converter = Converter::new(
            with_lazifier(script_lazifier(r#"touch "$2"; exec sleep 30"#)),
            Notifier::new(0),
        );
        let cancel = converter.cancel_token();
        let started = dir.path().join("image-lazy/merged/meta");
        let canceller = thread::spawn(move || {
            let deadline = Instant::now() + Duration::from_secs(20);
            while !started.exists() && Instant::now() < deadline {
                thread::sleep(Duration::from_millis(10));
            }
            cancel.cancel();
        });

        let failure = converter.convert(&tarball).unwrap_err();
        canceller.join().unwrap();

        assert_eq!(failure.stage, Stage::Lazifier);
        assert!(matches!(failure.kind(), Some(ConvertError::Cancelled)));
        assert_eq!(converter.state(), ConversionState::Failed);
    }
}
