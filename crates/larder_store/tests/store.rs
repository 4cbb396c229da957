use std::{
    path::{Path, PathBuf},
    sync::{Arc, Barrier},
    time::Duration,
};

use assert_matches::assert_matches;
use fs_err as fs;
use larder_build::{
    build_fn, BuildAction, BuildContext, CancellationToken, DirectoryBuilder, Recipe, RecipeStep,
    SilentTaskHandler, StagingBuilder,
};
use larder_manifest::{Manifest, ManifestDigest, ManifestFormat, ScanOptions, MANIFEST_FILE_NAME};
use larder_store::{
    protection::WRITE_PROTECTION_MARKER, CompositeStore, DirectoryStore, ImplementationStore,
    NoHandleInspector, StoreError, StoreOptions,
};

const HELLO_DIGEST: &str = "sha256new_JETRMOHXIQKQ4B7NSG5R3N6D34VMA73RYGM3NG5KHPK6DMU53LRQ";
const HELLO_MANIFEST: &str =
    "F 8f434346648f6b96df89dda901c5176b10a6d83961dd3c1ac88b59b2dc327aa4 1577836800 2 hello.txt\n";

fn open(path: &Path, write_protection: bool) -> DirectoryStore {
    DirectoryStore::open_with_options(
        path,
        StoreOptions {
            write_protection,
            handle_timeout: Duration::from_millis(50),
            handle_inspector: Arc::new(NoHandleInspector),
        },
    )
    .unwrap()
}

fn hello(content: &'static str) -> impl BuildAction {
    build_fn(move |builder: &mut dyn DirectoryBuilder, _: &BuildContext<'_>| {
        builder.add_file("hello.txt", &mut content.as_bytes(), 1577836800, false)
    })
}

/// Builds `action` in a scratch directory and returns the digest of the result.
fn digest_of(action: &dyn BuildAction, context: &BuildContext<'_>) -> ManifestDigest {
    let scratch = tempfile::tempdir().unwrap();
    let mut builder = StagingBuilder::new(
        scratch.path(),
        ManifestFormat::Sha256New,
        CancellationToken::new(),
    );
    action.build(&mut builder, context).unwrap();
    builder.manifest().digest()
}

#[test]
fn test_hello_scenario() {
    let dir = tempfile::tempdir().unwrap();
    let store = open(dir.path(), false);
    let handler = SilentTaskHandler::new();
    let digest: ManifestDigest = HELLO_DIGEST.parse().unwrap();

    let path = store
        .add(&digest, &hello("hi"), &BuildContext::new(&handler))
        .unwrap();

    assert_eq!(path, dir.path().join(HELLO_DIGEST));
    assert_eq!(
        fs::read_to_string(path.join(MANIFEST_FILE_NAME)).unwrap(),
        HELLO_MANIFEST
    );
    assert_eq!(store.list_all().unwrap(), vec![digest.clone()]);
    store.verify(&digest, &handler).unwrap();
}

#[test]
fn test_digest_mismatch_scenario() {
    let dir = tempfile::tempdir().unwrap();
    let store = open(dir.path(), false);
    let handler = SilentTaskHandler::new();
    let digest: ManifestDigest = HELLO_DIGEST.parse().unwrap();

    let error = store
        .add(&digest, &hello("ho"), &BuildContext::new(&handler))
        .unwrap_err();
    assert_matches!(&error, StoreError::DigestMismatch(mismatch) => {
        assert!(mismatch.actual.starts_with("sha256new_"));
        assert_ne!(mismatch.actual, HELLO_DIGEST);
    });
    assert!(!store.contains(&digest));
    assert!(store.list_all().unwrap().is_empty());
    assert!(store.list_temp().unwrap().is_empty());
}

#[test]
fn test_scanned_digest_matches_built_digest() {
    let dir = tempfile::tempdir().unwrap();
    let store = open(dir.path(), false);
    let handler = SilentTaskHandler::new();
    let context = BuildContext::new(&handler);

    let action = build_fn(|builder: &mut dyn DirectoryBuilder, _: &BuildContext<'_>| {
        builder.add_directory("empty")?;
        builder.add_file("lib/data.txt", &mut "data".as_bytes(), 1600000000, false)?;
        #[cfg(unix)]
        {
            builder.add_file("bin/run", &mut "run".as_bytes(), 1600000000, true)?;
            builder.add_symlink("latest", "bin/run")?;
        }
        Ok(())
    });
    let digest = digest_of(&action, &context);
    let path = store.add(&digest, &action, &context).unwrap();

    let scanned =
        Manifest::from_directory(&path, ManifestFormat::Sha256New, &ScanOptions::default()).unwrap();
    assert_eq!(scanned.digest(), digest);
    assert!(path.join("empty").is_dir());
    store.verify(&digest, &handler).unwrap();

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let mode = fs::metadata(path.join("bin/run")).unwrap().permissions().mode();
        assert_eq!(mode & 0o111, 0o111);
        assert_eq!(
            fs::read_link(path.join("latest")).unwrap(),
            PathBuf::from("bin/run")
        );
    }
}

#[test]
fn test_concurrent_add_publishes_once() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(open(dir.path(), false));
    let digest: ManifestDigest = HELLO_DIGEST.parse().unwrap();
    let barrier = Arc::new(Barrier::new(8));

    let handles: Vec<_> = (0..8)
        .map(|_| {
            let store = store.clone();
            let digest = digest.clone();
            let barrier = barrier.clone();
            std::thread::spawn(move || {
                let handler = SilentTaskHandler::new();
                barrier.wait();
                store.add(&digest, &hello("hi"), &BuildContext::new(&handler))
            })
        })
        .collect();
    let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();

    assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
    for result in results.iter().filter(|r| r.is_err()) {
        assert_matches!(result, Err(StoreError::AlreadyInStore(_)));
    }
    assert_eq!(store.list_all().unwrap(), vec![digest]);
    assert!(store.list_temp().unwrap().is_empty());
}

#[test]
fn test_recipe_with_copy_from() {
    let dir = tempfile::tempdir().unwrap();
    let store = open(&dir.path().join("store"), false);
    let handler = SilentTaskHandler::new();
    let lookup = |digest: &ManifestDigest| store.get_path(digest);
    let context = BuildContext::new(&handler).with_implementation_lookup(&lookup);

    let source = dir.path().join("hello.txt");
    fs::write(&source, "hi").unwrap();
    let recipe = Recipe::new([RecipeStep::SingleFile {
        path: source,
        destination: "hello.txt".to_string(),
        executable: false,
        mtime: Some(1577836800),
    }]);
    let hello_digest: ManifestDigest = HELLO_DIGEST.parse().unwrap();
    store.add(&hello_digest, &recipe, &context).unwrap();

    let copy = Recipe::new([RecipeStep::CopyFrom {
        digest: hello_digest,
        source: None,
        destination: Some("copy".to_string()),
    }]);
    let digest = digest_of(&copy, &context);
    let path = store.add(&digest, &copy, &context).unwrap();
    assert_eq!(fs::read_to_string(path.join("copy/hello.txt")).unwrap(), "hi");
}

#[test]
fn test_cancelled_add_leaves_nothing() {
    let dir = tempfile::tempdir().unwrap();
    let store = open(dir.path(), false);
    let token = CancellationToken::new();
    token.cancel();
    let handler = SilentTaskHandler::new().with_cancellation_token(token);

    assert_matches!(
        store.add(
            &HELLO_DIGEST.parse().unwrap(),
            &hello("hi"),
            &BuildContext::new(&handler)
        ),
        Err(StoreError::Cancelled)
    );
    assert!(store.list_all().unwrap().is_empty());
    assert!(store.list_temp().unwrap().is_empty());
}

#[test]
fn test_half_removed_directories_are_temporary() {
    let dir = tempfile::tempdir().unwrap();
    let store = open(dir.path(), false);
    let handler = SilentTaskHandler::new();
    let digest: ManifestDigest = HELLO_DIGEST.parse().unwrap();
    store
        .add(&digest, &hello("hi"), &BuildContext::new(&handler))
        .unwrap();

    let leftover = dir.path().join("_removing-0123");
    fs::create_dir_all(leftover.join("sub")).unwrap();
    fs::write(leftover.join("sub/file"), "x").unwrap();

    assert_eq!(store.list_all().unwrap(), vec![digest.clone()]);
    assert_eq!(store.list_temp().unwrap(), vec![leftover.clone()]);

    store.purge(&handler).unwrap();
    assert!(!leftover.exists());
    assert!(!store.contains(&digest));
}

#[test]
#[cfg(unix)]
fn test_write_protection() {
    use std::os::unix::fs::PermissionsExt;

    let dir = tempfile::tempdir().unwrap();
    let store = open(dir.path(), true);
    let handler = SilentTaskHandler::new();
    let digest: ManifestDigest = HELLO_DIGEST.parse().unwrap();
    let path = store
        .add(&digest, &hello("hi"), &BuildContext::new(&handler))
        .unwrap();

    for entry in [path.clone(), path.join("hello.txt"), path.join(MANIFEST_FILE_NAME)] {
        let mode = fs::metadata(&entry).unwrap().permissions().mode();
        assert_eq!(mode & 0o222, 0, "{} is writable", entry.display());
    }
    assert!(dir.path().join(WRITE_PROTECTION_MARKER).is_file());
    store.verify(&digest, &handler).unwrap();

    assert!(store.remove(&digest, &handler).unwrap());
    assert!(!path.exists());
    assert!(store.list_temp().unwrap().is_empty());
}

#[test]
fn test_composite_falls_back_to_writable_store() {
    let dir = tempfile::tempdir().unwrap();
    let user: Arc<dyn ImplementationStore> = Arc::new(open(&dir.path().join("user"), false));
    let system: Arc<dyn ImplementationStore> =
        Arc::new(DirectoryStore::open_read_only(dir.path().join("system")));
    let composite = CompositeStore::new(vec![user.clone(), system]);
    let handler = SilentTaskHandler::new();
    let digest: ManifestDigest = HELLO_DIGEST.parse().unwrap();

    let path = composite
        .add(&digest, &hello("hi"), &BuildContext::new(&handler))
        .unwrap();
    assert_eq!(path, dir.path().join("user").join(HELLO_DIGEST));
    assert!(user.contains(&digest));
    assert!(composite.contains(&digest));
}

#[test]
#[cfg(unix)]
fn test_service_round_trip() {
    use larder_store::service::{ServiceStore, StoreService};

    let dir = tempfile::tempdir().unwrap();
    let root = dir.path().join("system");
    let socket = dir.path().join("service.sock");
    let service = StoreService::new(Arc::new(open(&root, false)));
    let listener = StoreService::bind(&socket).unwrap();
    std::thread::spawn(move || service.serve(listener));

    let client_store = ServiceStore::new(&socket, &root);
    let handler = SilentTaskHandler::new();
    let digest: ManifestDigest = HELLO_DIGEST.parse().unwrap();
    let source = dir.path().join("hello.txt");
    fs::write(&source, "hi").unwrap();
    let recipe = Recipe::new([RecipeStep::SingleFile {
        path: source.clone(),
        destination: "hello.txt".to_string(),
        executable: false,
        mtime: Some(1577836800),
    }]);

    let path = client_store
        .add(&digest, &recipe, &BuildContext::new(&handler))
        .unwrap();
    assert_eq!(path, root.join(HELLO_DIGEST));
    assert!(client_store.contains(&digest));
    assert!(client_store.client().contains(&digest).unwrap());
    assert_eq!(client_store.client().get_path(&digest).unwrap(), Some(path));

    assert_matches!(
        client_store.add(&digest, &recipe, &BuildContext::new(&handler)),
        Err(StoreError::AlreadyInStore(_))
    );

    let wrong = Recipe::new([RecipeStep::SingleFile {
        path: source,
        destination: "other.txt".to_string(),
        executable: false,
        mtime: Some(1577836800),
    }]);
    let other: ManifestDigest = "sha256new_AAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAA"
        .parse()
        .unwrap();
    assert_matches!(
        client_store.add(&other, &wrong, &BuildContext::new(&handler)),
        Err(StoreError::DigestMismatch(mismatch)) if mismatch.actual.starts_with("sha256new_")
    );
    assert_matches!(client_store.purge(&handler), Err(StoreError::NotAdmin(_)));
}
