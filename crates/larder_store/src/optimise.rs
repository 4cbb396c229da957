//! Replacing identical files of different implementations with hardlinks.

use std::{
    collections::{hash_map::Entry, HashMap, HashSet},
    fmt::{Debug, Formatter},
    path::{Path, PathBuf},
};

use fs4::fs_std::FileExt;
use fs_err as fs;
use larder_build::{run_task, TaskHandler};
use larder_manifest::{Manifest, ManifestFormat, MANIFEST_FILE_NAME};

use crate::{
    protection::{seal, unseal},
    DirectoryStore, ImplementationStore, StoreError,
};

/// The name of the lock file that serialises optimisation of a store.
pub(crate) const OPTIMISE_LOCK_FILE: &str = ".optimise.lock";

/// Files with equal keys have the same content and metadata and can share an inode.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct DedupKey {
    size: u64,
    mtime: i64,
    executable: bool,
    format: ManifestFormat,
    digest: String,
}

/// An exclusive lock on the optimisation of one store, released when dropped.
struct OptimiseLock {
    file: std::fs::File,
}

impl Debug for OptimiseLock {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OptimiseLock").finish()
    }
}

impl Drop for OptimiseLock {
    fn drop(&mut self) {
        let _ = fs4::fs_std::FileExt::unlock(&self.file);
    }
}

impl OptimiseLock {
    fn acquire(root: &Path) -> Result<Self, StoreError> {
        let path = root.join(OPTIMISE_LOCK_FILE);
        let file = std::fs::OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .read(true)
            .open(&path)
            .map_err(|e| StoreError::io(format!("open lock file '{}'", path.display()), e))?;
        tracing::debug!("waiting for {}", path.display());
        file.lock_exclusive()
            .map_err(|e| StoreError::io(format!("lock '{}'", path.display()), e))?;
        Ok(Self { file })
    }
}

/// Unseals implementations on demand and seals each of them again exactly once when dropped.
struct ResealGuard {
    enabled: bool,
    unsealed: HashSet<PathBuf>,
}

impl ResealGuard {
    fn new(enabled: bool) -> Self {
        Self {
            enabled,
            unsealed: HashSet::new(),
        }
    }

    fn unseal(&mut self, path: &Path) -> Result<(), StoreError> {
        if self.enabled && !self.unsealed.contains(path) {
            // Remember the directory before unsealing so a partial failure is still resealed.
            self.unsealed.insert(path.to_path_buf());
            unseal(path)?;
        }
        Ok(())
    }
}

impl Drop for ResealGuard {
    fn drop(&mut self) {
        for path in self.unsealed.drain() {
            if let Err(e) = seal(&path) {
                tracing::warn!("failed to write-protect {} again: {e}", path.display());
            }
        }
    }
}

/// Hardlinks identical files across all implementations of `store`. Returns the number of bytes
/// saved.
pub(crate) fn optimise(store: &DirectoryStore, handler: &dyn TaskHandler) -> Result<u64, StoreError> {
    store.ensure_writable()?;
    let _lock = OptimiseLock::acquire(store.root())?;
    let implementations = store.list_all()?;

    let mut reseal = ResealGuard::new(store.options().write_protection);
    let mut seen: HashMap<DedupKey, (PathBuf, PathBuf)> = HashMap::new();
    let total = implementations.len() as u64;
    let saved = run_task(handler, "Optimising", Some(total), |progress| {
        let mut saved = 0;
        for digest in &implementations {
            if handler.cancellation_token().is_cancelled() {
                return Err(StoreError::Cancelled);
            }
            progress.inc(1);
            let Some(slot) = store.slot(digest) else {
                continue;
            };
            let manifest = match Manifest::load(&slot.path.join(MANIFEST_FILE_NAME), slot.format) {
                Ok(manifest) => manifest,
                Err(e) => {
                    tracing::warn!("skipping {}: {e}", slot.digest);
                    continue;
                }
            };

            for entry in manifest.files() {
                if entry.file.size == 0 {
                    continue;
                }
                let key = DedupKey {
                    size: entry.file.size,
                    mtime: entry.file.mtime,
                    executable: entry.file.executable,
                    format: slot.format,
                    digest: entry.file.digest.clone(),
                };
                let path = entry
                    .path()
                    .split('/')
                    .fold(slot.path.clone(), |path, component| path.join(component));

                let (existing_slot, existing) = match seen.entry(key) {
                    Entry::Vacant(vacant) => {
                        vacant.insert((slot.path.clone(), path));
                        continue;
                    }
                    Entry::Occupied(occupied) => occupied.get().clone(),
                };
                match is_same_file(&existing, &path) {
                    Ok(true) => continue,
                    Ok(false) => {}
                    Err(e) => {
                        tracing::warn!("skipping {}: {e}", path.display());
                        continue;
                    }
                }

                reseal.unseal(&existing_slot)?;
                reseal.unseal(&slot.path)?;
                replace_with_link(&existing, &path)?;
                tracing::debug!("linked {} to {}", path.display(), existing.display());
                saved += entry.file.size;
            }
        }
        Ok(saved)
    })?;
    drop(reseal);

    tracing::info!("optimised {}, saved {saved} bytes", store.root().display());
    Ok(saved)
}

/// Replaces `duplicate` with a hardlink to `existing`. The link is created under a temporary name
/// first so `duplicate` is never missing.
fn replace_with_link(existing: &Path, duplicate: &Path) -> Result<(), StoreError> {
    let temp = duplicate.with_file_name(format!("_optimise-{}", uuid::Uuid::new_v4().simple()));
    fs::hard_link(existing, &temp)
        .map_err(|e| StoreError::io(format!("link '{}'", existing.display()), e))?;
    if let Err(e) = fs::rename(&temp, duplicate) {
        let _ = fs::remove_file(&temp);
        return Err(StoreError::io(format!("replace '{}'", duplicate.display()), e));
    }
    Ok(())
}

#[cfg(unix)]
fn is_same_file(a: &Path, b: &Path) -> std::io::Result<bool> {
    use std::os::unix::fs::MetadataExt;
    let a = fs::metadata(a)?;
    let b = fs::metadata(b)?;
    Ok(a.dev() == b.dev() && a.ino() == b.ino())
}

#[cfg(not(unix))]
fn is_same_file(a: &Path, b: &Path) -> std::io::Result<bool> {
    fs::metadata(a)?;
    fs::metadata(b)?;
    Ok(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{NoHandleInspector, StoreOptions};
    use larder_build::{build_fn, BuildContext, DirectoryBuilder, SilentTaskHandler};
    use larder_manifest::ManifestDigest;
    use std::{sync::Arc, time::Duration};

    fn add(store: &DirectoryStore, extra: &'static str) -> PathBuf {
        let action = build_fn(move |builder: &mut dyn DirectoryBuilder, _: &BuildContext<'_>| {
            builder.add_file("shared.txt", &mut "shared content".as_bytes(), 1577836800, false)?;
            builder.add_file("empty", &mut "".as_bytes(), 1577836800, false)?;
            builder.add_file(extra, &mut extra.as_bytes(), 1577836800, false)
        });
        let mut staging = larder_build::StagingBuilder::new(
            tempfile::tempdir().unwrap().keep(),
            ManifestFormat::Sha256New,
            Default::default(),
        );
        let handler = SilentTaskHandler::new();
        let context = BuildContext::new(&handler);
        larder_build::BuildAction::build(&action, &mut staging, &context).unwrap();
        let digest: ManifestDigest = staging.manifest().digest();
        fs::remove_dir_all(staging.root()).unwrap();
        store.add(&digest, &action, &context).unwrap()
    }

    #[test]
    #[cfg(unix)]
    fn test_optimise_links_duplicates() {
        let dir = tempfile::tempdir().unwrap();
        let store = DirectoryStore::open_with_options(
            dir.path(),
            StoreOptions {
                write_protection: true,
                handle_timeout: Duration::from_millis(10),
                handle_inspector: Arc::new(NoHandleInspector),
            },
        )
        .unwrap();
        let a = add(&store, "a");
        let b = add(&store, "b");
        let handler = SilentTaskHandler::new();

        assert_eq!(store.optimise(&handler).unwrap(), 14);
        assert!(is_same_file(&a.join("shared.txt"), &b.join("shared.txt")).unwrap());
        assert!(!is_same_file(&a.join("empty"), &b.join("empty")).unwrap());
        assert_eq!(store.optimise(&handler).unwrap(), 0);

        for digest in store.list_all().unwrap() {
            store.verify(&digest, &handler).unwrap();
        }
        assert!(dir.path().join(OPTIMISE_LOCK_FILE).is_file());

        use std::os::unix::fs::PermissionsExt;
        let mode = fs::metadata(&b).unwrap().permissions().mode();
        assert_eq!(mode & 0o222, 0);
    }

    #[test]
    #[cfg(unix)]
    fn test_remove_keeps_shared_files_sealed() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let store = DirectoryStore::open_with_options(
            dir.path(),
            StoreOptions {
                write_protection: true,
                handle_timeout: Duration::from_millis(10),
                handle_inspector: Arc::new(NoHandleInspector),
            },
        )
        .unwrap();
        let a = add(&store, "a");
        let b = add(&store, "b");
        let handler = SilentTaskHandler::new();
        assert_eq!(store.optimise(&handler).unwrap(), 14);

        let digest_b = store
            .list_all()
            .unwrap()
            .into_iter()
            .find(|digest| store.get_path(digest).as_deref() == Some(b.as_path()))
            .unwrap();
        assert!(store.remove(&digest_b, &handler).unwrap());
        assert!(!b.exists());

        let mode = fs::metadata(a.join("shared.txt")).unwrap().permissions().mode();
        assert_eq!(mode & 0o222, 0, "shared file became writable");

        store.purge(&handler).unwrap();
        assert!(store.list_all().unwrap().is_empty());
    }
}
