use std::{
    io::ErrorKind,
    path::{Path, PathBuf},
    sync::Arc,
    time::{Duration, Instant},
};

use filetime::FileTime;
use fs_err as fs;
use larder_build::{run_task, BuildAction, BuildContext, StagingBuilder, TaskHandler};
use larder_manifest::{
    FileSystemCapabilities, Manifest, ManifestDigest, ManifestFormat, ScanOptions,
    MANIFEST_FILE_NAME,
};
use parking_lot::Mutex;

use crate::{
    handles::default_handle_inspector,
    protection::{deploy_marker, seal, unseal},
    DigestMismatch, HandleInspector, ImplementationStore, StoreError, StoreKind,
};

/// Serialises the final check-then-rename of all stores in this process.
static PUBLISH_LOCK: Mutex<()> = Mutex::new(());

/// A modification time with an odd number of seconds, used to detect filesystems that round
/// timestamps.
const PROBE_MTIME: i64 = 1577836801;

/// How long to wait between checks for processes that were asked to shut down.
const HANDLE_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Options that control how a [`DirectoryStore`] modifies its directory.
#[derive(Clone)]
pub struct StoreOptions {
    /// Remove write permissions from published implementations.
    pub write_protection: bool,

    /// How long to wait for processes that were asked to release an implementation before giving
    /// up on removing it.
    pub handle_timeout: Duration,

    /// Finds processes that use files of an implementation.
    pub handle_inspector: Arc<dyn HandleInspector>,
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self {
            write_protection: true,
            handle_timeout: Duration::from_secs(15),
            handle_inspector: default_handle_inspector(),
        }
    }
}

/// An implementation store in a single directory.
///
/// Every implementation lives in a sub-directory named after the best id of its digest. Other
/// sub-directories, such as staging directories of interrupted additions, are temporary and
/// reported by [`ImplementationStore::list_temp`].
pub struct DirectoryStore {
    root: PathBuf,
    read_only: bool,
    options: StoreOptions,
}

/// A stored implementation: the id format and value it was found under, and its directory.
pub(crate) struct Slot {
    pub format: ManifestFormat,
    pub digest: ManifestDigest,
    pub path: PathBuf,
}

impl DirectoryStore {
    /// Opens the store at `root` with default options, creating the directory if needed.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, StoreError> {
        Self::open_with_options(root, StoreOptions::default())
    }

    /// Opens the store at `root`, creating the directory if needed.
    ///
    /// If the directory cannot be written, or the filesystem cannot store modification times with
    /// a precision of one second, the store is opened read-only.
    pub fn open_with_options(
        root: impl Into<PathBuf>,
        options: StoreOptions,
    ) -> Result<Self, StoreError> {
        let root = root.into();
        let read_only = match fs::create_dir_all(&root) {
            Ok(()) => !is_writable(&root)?,
            Err(e) if matches!(e.kind(), ErrorKind::PermissionDenied | ErrorKind::ReadOnlyFilesystem) => {
                true
            }
            Err(e) => {
                return Err(StoreError::io(
                    format!("create store directory '{}'", root.display()),
                    e,
                ))
            }
        };
        if read_only {
            tracing::debug!("opened {} read-only", root.display());
        }
        Ok(Self {
            root,
            read_only,
            options,
        })
    }

    /// Opens the store at `root` for reading only. The directory does not need to exist.
    pub fn open_read_only(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            read_only: true,
            options: StoreOptions::default(),
        }
    }

    /// The directory of the store.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Returns true if the store cannot be modified by this process.
    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    pub(crate) fn options(&self) -> &StoreOptions {
        &self.options
    }

    pub(crate) fn ensure_writable(&self) -> Result<(), StoreError> {
        if self.read_only {
            return Err(StoreError::NotAdmin(self.root.clone()));
        }
        Ok(())
    }

    /// Finds the directory of `digest`, trying its ids in order of preference.
    pub(crate) fn slot(&self, digest: &ManifestDigest) -> Option<Slot> {
        digest.iter().find_map(|(format, value)| {
            let path = self.root.join(format.id(value));
            if !path.is_dir() {
                return None;
            }
            Some(Slot {
                format,
                digest: ManifestDigest::from_value(format, value).ok()?,
                path,
            })
        })
    }

    /// Every directory in the root, split into stored implementations and everything else.
    fn entries(&self) -> Result<(Vec<ManifestDigest>, Vec<PathBuf>), StoreError> {
        let read_error =
            |e| StoreError::io(format!("read store directory '{}'", self.root.display()), e);
        let dir = match fs::read_dir(&self.root) {
            Ok(dir) => dir,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Default::default()),
            Err(e) => return Err(read_error(e)),
        };

        let mut implementations = Vec::new();
        let mut temp = Vec::new();
        for entry in dir {
            let entry = entry.map_err(read_error)?;
            if !entry.file_type().map_err(read_error)?.is_dir() {
                continue;
            }
            match entry
                .file_name()
                .to_str()
                .and_then(|name| name.parse::<ManifestDigest>().ok())
            {
                Some(digest) => implementations.push(digest),
                None => temp.push(entry.path()),
            }
        }
        implementations.sort_by_key(|digest| digest.to_string());
        temp.sort();
        Ok((implementations, temp))
    }

    fn publish(&self, staging: &Path, target: &Path, digest: &ManifestDigest) -> Result<(), StoreError> {
        let _guard = PUBLISH_LOCK.lock();
        if self.contains(digest) {
            return Err(StoreError::AlreadyInStore(digest.clone()));
        }
        match fs::rename(staging, target) {
            Ok(()) => Ok(()),
            Err(e)
                if matches!(e.kind(), ErrorKind::AlreadyExists | ErrorKind::DirectoryNotEmpty)
                    || target.is_dir() =>
            {
                Err(StoreError::AlreadyInStore(digest.clone()))
            }
            Err(e) => Err(StoreError::io(
                format!("move implementation into '{}'", target.display()),
                e,
            )),
        }
    }

    fn check_not_running(&self, path: &Path) -> Result<(), StoreError> {
        let Ok(exe) = std::env::current_exe().and_then(std::fs::canonicalize) else {
            return Ok(());
        };
        let slot = std::fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf());
        if exe.starts_with(&slot) {
            return Err(StoreError::RemovingRunningExecutable(path.to_path_buf()));
        }
        Ok(())
    }

    /// Makes sure no process uses files below `path`, asking them to shut down if the handler
    /// agrees.
    fn wait_for_handles(&self, path: &Path, handler: &dyn TaskHandler) -> Result<(), StoreError> {
        let inspector = &self.options.handle_inspector;
        let path = std::fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf());
        let in_use = |processes: &[crate::ProcessInfo]| StoreError::InUse {
            path: path.clone(),
            processes: processes.iter().map(ToString::to_string).collect(),
        };

        let processes = match inspector.open_handles(&path) {
            Ok(processes) => processes,
            Err(e) => {
                tracing::debug!("failed to look for processes using {}: {e}", path.display());
                return Ok(());
            }
        };
        if processes.is_empty() {
            return Ok(());
        }

        let names = processes
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join(", ");
        if !handler.ask(&format!(
            "{} is in use by {names}. Ask these processes to shut down?",
            path.display()
        )) {
            return Err(in_use(&processes));
        }
        inspector
            .request_shutdown(&processes)
            .map_err(|e| StoreError::io(format!("stop processes using '{}'", path.display()), e))?;

        let deadline = Instant::now() + self.options.handle_timeout;
        loop {
            if handler.cancellation_token().is_cancelled() {
                return Err(StoreError::Cancelled);
            }
            let remaining = inspector.open_handles(&path).unwrap_or_default();
            if remaining.is_empty() {
                return Ok(());
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(in_use(&remaining));
            }
            std::thread::sleep(HANDLE_POLL_INTERVAL.min(deadline - now));
        }
    }

    /// Moves `path` out of the way under a name that is never mistaken for an implementation.
    fn detach(&self, path: &Path) -> Result<PathBuf, StoreError> {
        if let Err(e) = unseal(path) {
            tracing::debug!("failed to unseal {}: {e}", path.display());
        }
        let detached = self
            .root
            .join(format!("_removing-{}", uuid::Uuid::new_v4().simple()));
        fs::rename(path, &detached)
            .map_err(|e| StoreError::io(format!("move '{}' out of the store", path.display()), e))?;
        Ok(detached)
    }

    /// Publishes a staged implementation. `staging` is removed on any failure.
    fn add_staged(
        &self,
        digest: &ManifestDigest,
        format: ManifestFormat,
        action: &dyn BuildAction,
        context: &BuildContext<'_>,
    ) -> Result<PathBuf, StoreError> {
        let staging = tempfile::Builder::new()
            .prefix("_temp")
            .tempdir_in(&self.root)
            .map_err(|e| {
                StoreError::io(
                    format!("create a staging directory in '{}'", self.root.display()),
                    e,
                )
            })?;

        let mut builder = StagingBuilder::new(
            staging.path(),
            format,
            context.cancellation_token().clone(),
        );
        action.build(&mut builder, context)?;
        let manifest = builder.into_manifest();

        let manifest = match manifest.find_time_offset(digest) {
            Some(0) => manifest,
            Some(offset) => {
                tracing::warn!(
                    "modification times of {digest} are off by {offset}s, correcting them"
                );
                let shifted = manifest.with_time_offset(offset);
                apply_mtimes(staging.path(), &shifted)?;
                shifted
            }
            None => {
                return Err(DigestMismatch {
                    expected: digest.clone(),
                    actual: format.id(&manifest.digest_value()),
                    expected_manifest: None,
                    actual_manifest: Some(manifest),
                }
                .into())
            }
        };
        manifest.save(&staging.path().join(MANIFEST_FILE_NAME))?;
        context.check_cancelled()?;

        let target = self.root.join(format.id(&manifest.digest_value()));
        self.publish(staging.path(), &target, digest)?;
        // The directory was moved, there is nothing left to clean up.
        let _ = staging.keep();

        if self.options.write_protection {
            if let Err(e) = seal(&target).and_then(|()| deploy_marker(&self.root)) {
                tracing::warn!("failed to write-protect {}: {e}", target.display());
            }
        }
        tracing::info!("added {digest} to {}", self.root.display());
        Ok(target)
    }
}

impl ImplementationStore for DirectoryStore {
    fn kind(&self) -> StoreKind {
        if self.read_only {
            StoreKind::ReadOnly
        } else {
            StoreKind::ReadWrite
        }
    }

    fn path(&self) -> Option<&Path> {
        Some(&self.root)
    }

    fn contains(&self, digest: &ManifestDigest) -> bool {
        self.slot(digest).is_some()
    }

    fn get_path(&self, digest: &ManifestDigest) -> Option<PathBuf> {
        self.slot(digest).map(|slot| slot.path)
    }

    fn list_all(&self) -> Result<Vec<ManifestDigest>, StoreError> {
        self.entries().map(|(implementations, _)| implementations)
    }

    fn list_temp(&self) -> Result<Vec<PathBuf>, StoreError> {
        self.entries().map(|(_, temp)| temp)
    }

    fn add(
        &self,
        digest: &ManifestDigest,
        action: &dyn BuildAction,
        context: &BuildContext<'_>,
    ) -> Result<PathBuf, StoreError> {
        self.ensure_writable()?;
        let Some((format, _)) = digest.best() else {
            return Err(StoreError::NotSupported(
                "the digest contains no supported algorithm".to_string(),
            ));
        };
        if self.contains(digest) {
            return Err(StoreError::AlreadyInStore(digest.clone()));
        }
        self.add_staged(digest, format, action, context)
    }

    fn verify(&self, digest: &ManifestDigest, handler: &dyn TaskHandler) -> Result<(), StoreError> {
        let slot = self
            .slot(digest)
            .ok_or_else(|| StoreError::NotFound(digest.clone()))?;
        let stored = Manifest::load(&slot.path.join(MANIFEST_FILE_NAME), slot.format).ok();
        let actual = run_task(handler, &format!("Verifying {}", slot.digest), None, |_| {
            Manifest::from_directory(
                &slot.path,
                slot.format,
                &ScanOptions {
                    reference: stored.as_ref(),
                    capabilities: FileSystemCapabilities::native(),
                },
            )
            .map_err(StoreError::from)
        })?;

        match actual.find_time_offset(&slot.digest) {
            Some(0) => Ok(()),
            Some(offset) if self.read_only => {
                tracing::warn!(
                    "modification times of {} are off by {offset}s, leaving them as they are in a \
                     read-only store",
                    slot.digest
                );
                Ok(())
            }
            Some(offset) => {
                tracing::warn!(
                    "modification times of {} are off by {offset}s, correcting them",
                    slot.digest
                );
                apply_mtimes(&slot.path, &actual.with_time_offset(offset))
            }
            None => {
                let mismatch = DigestMismatch {
                    expected: slot.digest.clone(),
                    actual: slot.format.id(&actual.digest_value()),
                    expected_manifest: stored,
                    actual_manifest: Some(actual),
                };
                tracing::warn!("{mismatch}");
                if !self.read_only
                    && handler.ask(&format!(
                        "Implementation {} is damaged. Remove it?",
                        slot.digest
                    ))
                {
                    self.remove(&slot.digest, handler)?;
                }
                Err(mismatch.into())
            }
        }
    }

    fn remove(&self, digest: &ManifestDigest, handler: &dyn TaskHandler) -> Result<bool, StoreError> {
        self.ensure_writable()?;
        let Some(slot) = self.slot(digest) else {
            return Ok(false);
        };
        self.check_not_running(&slot.path)?;
        self.wait_for_handles(&slot.path, handler)?;

        let detached = self.detach(&slot.path)?;
        tracing::info!("removed {} from {}", slot.digest, self.root.display());
        if let Err(e) = remove_tree(&detached) {
            tracing::warn!("{e}, the remains will be removed when the store is purged");
        }
        Ok(true)
    }

    fn purge(&self, handler: &dyn TaskHandler) -> Result<(), StoreError> {
        self.ensure_writable()?;
        let (implementations, temp) = self.entries()?;
        let mut failures = Vec::new();

        for digest in &implementations {
            if handler.cancellation_token().is_cancelled() {
                return Err(StoreError::Cancelled);
            }
            let Some(slot) = self.slot(digest) else {
                continue;
            };
            let result = self
                .check_not_running(&slot.path)
                .and_then(|()| self.wait_for_handles(&slot.path, handler))
                .and_then(|()| self.detach(&slot.path))
                .and_then(|detached| remove_tree(&detached));
            if let Err(e) = result {
                failures.push((slot.path, e.to_string()));
            }
        }
        for path in temp {
            if let Err(e) = unseal(&path).and_then(|()| remove_tree(&path)) {
                failures.push((path, e.to_string()));
            }
        }

        if !failures.is_empty() {
            return Err(StoreError::PurgeIncomplete(failures));
        }
        tracing::info!("purged {}", self.root.display());
        Ok(())
    }

    fn optimise(&self, handler: &dyn TaskHandler) -> Result<u64, StoreError> {
        crate::optimise::optimise(self, handler)
    }
}

/// Sets the modification time of every file on disk to the one recorded in `manifest`.
fn apply_mtimes(root: &Path, manifest: &Manifest) -> Result<(), StoreError> {
    for entry in manifest.files() {
        let path = entry
            .path()
            .split('/')
            .fold(root.to_path_buf(), |path, component| path.join(component));
        filetime::set_file_mtime(&path, FileTime::from_unix_time(entry.file.mtime, 0))
            .map_err(|e| {
                StoreError::io(format!("set modification time of '{}'", path.display()), e)
            })?;
    }
    Ok(())
}

fn remove_tree(path: &Path) -> Result<(), StoreError> {
    fs::remove_dir_all(path).map_err(|e| StoreError::io(format!("remove '{}'", path.display()), e))
}

/// Probes whether files can be created in `root` and keep whole-second modification times.
fn is_writable(root: &Path) -> Result<bool, StoreError> {
    let probe = match tempfile::Builder::new().prefix(".probe").tempfile_in(root) {
        Ok(probe) => probe,
        Err(e) if matches!(e.kind(), ErrorKind::PermissionDenied | ErrorKind::ReadOnlyFilesystem) => {
            return Ok(false)
        }
        Err(e) => {
            return Err(StoreError::io(
                format!("create a file in '{}'", root.display()),
                e,
            ))
        }
    };

    let mtime = FileTime::from_unix_time(PROBE_MTIME, 0);
    let precise = filetime::set_file_mtime(probe.path(), mtime)
        .and_then(|()| std::fs::metadata(probe.path()))
        .map(|metadata| FileTime::from_last_modification_time(&metadata).unix_seconds() == PROBE_MTIME)
        .unwrap_or(false);
    if !precise {
        tracing::warn!(
            "the filesystem of {} cannot store exact modification times, using it read-only",
            root.display()
        );
    }
    Ok(precise)
}
