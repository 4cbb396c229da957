use std::{
    io::Read,
    path::{Path, PathBuf},
};

use filetime::FileTime;
use fs_err as fs;
use larder_digest::HashingWriter;
use larder_manifest::{
    split_path, Manifest, ManifestFile, ManifestFormat, ManifestNode, ManifestSymlink,
};
use tokio_util::sync::CancellationToken;

use crate::{normalize_entry_path, normalize_path, BuildError, DirectoryBuilder};

/// Permission bits of executable files written by the builder.
#[cfg(unix)]
const EXECUTABLE_MODE: u32 = 0o755;

/// Permission bits of all other files written by the builder.
#[cfg(unix)]
const REGULAR_MODE: u32 = 0o644;

/// A [`DirectoryBuilder`] that writes to a directory on disk and keeps a [`Manifest`] of
/// everything it wrote in lock-step.
///
/// File contents are hashed while they are written, so the manifest never has to be recomputed
/// by scanning the directory. If any operation fails the directory is left in an unspecified
/// state and should be discarded.
#[derive(Debug)]
pub struct StagingBuilder {
    root: PathBuf,
    manifest: Manifest,
    cancellation: CancellationToken,
}

impl StagingBuilder {
    /// Creates a builder that writes into the existing directory `root`.
    pub fn new(
        root: impl Into<PathBuf>,
        format: ManifestFormat,
        cancellation: CancellationToken,
    ) -> Self {
        Self {
            root: root.into(),
            manifest: Manifest::new(format),
            cancellation,
        }
    }

    /// The directory the builder writes into.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// The manifest of everything written so far.
    pub fn manifest(&self) -> &Manifest {
        &self.manifest
    }

    /// Consumes the builder and returns the manifest of the built directory.
    pub fn into_manifest(self) -> Manifest {
        self.manifest
    }

    fn check_cancelled(&self) -> Result<(), BuildError> {
        if self.cancellation.is_cancelled() {
            return Err(BuildError::Cancelled);
        }
        Ok(())
    }

    fn absolute(&self, path: &str) -> PathBuf {
        let mut absolute = self.root.clone();
        absolute.extend(split_path(path));
        absolute
    }

    /// Creates the parent directories of `path`, both on disk and in the manifest.
    fn ensure_parent(&mut self, path: &str) -> Result<(), BuildError> {
        let Some((parent, _)) = path.rsplit_once('/') else {
            return Ok(());
        };
        self.manifest.ensure_directory(parent)?;
        let absolute = self.absolute(parent);
        fs::create_dir_all(&absolute).map_err(|e| {
            BuildError::IoError(format!("create directory '{}'", absolute.display()), e)
        })
    }

    /// Removes a file or symlink at `path` so something new can take its place. Directories are
    /// never replaced implicitly.
    fn clear(&mut self, path: &str) -> Result<(), BuildError> {
        match self.manifest.get(path) {
            None => Ok(()),
            Some(ManifestNode::Directory(_)) => Err(BuildError::InvalidPath(path.to_string())),
            Some(_) => {
                let absolute = self.absolute(path);
                fs::remove_file(&absolute).map_err(|e| {
                    BuildError::IoError(format!("remove '{}'", absolute.display()), e)
                })?;
                self.manifest.remove(path);
                Ok(())
            }
        }
    }

    fn finish_file(
        &mut self,
        path: &str,
        absolute: &Path,
        file: ManifestFile,
    ) -> Result<(), BuildError> {
        set_executable(absolute, file.executable)?;
        filetime::set_file_mtime(absolute, FileTime::from_unix_time(file.mtime, 0)).map_err(
            |e| BuildError::IoError(format!("set modification time of '{}'", absolute.display()), e),
        )?;
        self.manifest.insert(path, ManifestNode::File(file))?;
        Ok(())
    }
}

impl DirectoryBuilder for StagingBuilder {
    fn add_directory(&mut self, path: &str) -> Result<(), BuildError> {
        self.check_cancelled()?;
        let Some(path) = normalize_path(path)? else {
            return Ok(());
        };
        self.manifest.ensure_directory(&path)?;
        let absolute = self.absolute(&path);
        fs::create_dir_all(&absolute).map_err(|e| {
            BuildError::IoError(format!("create directory '{}'", absolute.display()), e)
        })
    }

    fn add_file(
        &mut self,
        path: &str,
        content: &mut dyn Read,
        mtime: i64,
        executable: bool,
    ) -> Result<(), BuildError> {
        self.check_cancelled()?;
        let path = normalize_entry_path(path)?;
        self.ensure_parent(&path)?;
        self.clear(&path)?;

        let absolute = self.absolute(&path);
        let file = fs::File::create(&absolute)
            .map_err(|e| BuildError::IoError(format!("create '{}'", absolute.display()), e))?;
        let mut writer = HashingWriter::new(file, self.manifest.format());
        std::io::copy(content, &mut writer)
            .map_err(|e| BuildError::IoError(format!("write '{}'", absolute.display()), e))?;
        let size = writer.bytes_written();
        let (file, digest) = writer.finalize();
        drop(file);

        tracing::trace!("wrote '{path}' ({size} bytes)");
        self.finish_file(
            &path,
            &absolute,
            ManifestFile {
                digest,
                mtime,
                size,
                executable,
            },
        )
    }

    fn add_symlink(&mut self, path: &str, target: &str) -> Result<(), BuildError> {
        self.check_cancelled()?;
        let path = normalize_entry_path(path)?;
        self.ensure_parent(&path)?;
        self.clear(&path)?;

        let absolute = self.absolute(&path);
        write_symlink(target, &absolute)?;
        self.manifest.insert(
            &path,
            ManifestNode::Symlink(ManifestSymlink {
                digest: self.manifest.format().hash_content(target),
                size: target.len() as u64,
            }),
        )?;
        Ok(())
    }

    fn add_hardlink(
        &mut self,
        path: &str,
        existing: &str,
        executable: bool,
    ) -> Result<(), BuildError> {
        self.check_cancelled()?;
        let path = normalize_entry_path(path)?;
        let existing = normalize_entry_path(existing)?;
        let Some(ManifestNode::File(existing_file)) = self.manifest.get(&existing).cloned() else {
            return Err(BuildError::NotFound(existing));
        };
        if path == existing {
            return Ok(());
        }
        self.ensure_parent(&path)?;
        self.clear(&path)?;

        let source = self.absolute(&existing);
        let absolute = self.absolute(&path);
        let file = ManifestFile {
            executable,
            ..existing_file
        };

        // Both names share permission bits, so a link is only possible when they agree.
        if existing_file.executable == executable {
            match fs::hard_link(&source, &absolute) {
                Ok(()) => {
                    self.manifest.insert(&path, ManifestNode::File(file))?;
                    return Ok(());
                }
                Err(e) => tracing::debug!("falling back to a copy of '{existing}': {e}"),
            }
        }

        fs::copy(&source, &absolute).map_err(|e| {
            BuildError::IoError(format!("copy '{}' to '{}'", source.display(), absolute.display()), e)
        })?;
        self.finish_file(&path, &absolute, file)
    }

    fn remove(&mut self, path: &str) -> Result<(), BuildError> {
        self.check_cancelled()?;
        let path = normalize_entry_path(path)?;
        let node = self
            .manifest
            .remove(&path)
            .ok_or_else(|| BuildError::NotFound(path.clone()))?;

        let absolute = self.absolute(&path);
        let result = match node {
            ManifestNode::Directory(_) => fs::remove_dir_all(&absolute),
            _ => fs::remove_file(&absolute),
        };
        result.map_err(|e| BuildError::IoError(format!("remove '{}'", absolute.display()), e))
    }

    fn rename(&mut self, source: &str, destination: &str) -> Result<(), BuildError> {
        self.check_cancelled()?;
        let source = normalize_entry_path(source)?;
        let destination = normalize_entry_path(destination)?;
        if source == destination {
            return Ok(());
        }
        if destination.starts_with(&format!("{source}/")) {
            return Err(BuildError::InvalidPath(destination));
        }
        if self.manifest.get(&source).is_none() {
            return Err(BuildError::NotFound(source));
        }

        self.ensure_parent(&destination)?;
        self.clear(&destination)?;
        let from = self.absolute(&source);
        let to = self.absolute(&destination);
        fs::rename(&from, &to).map_err(|e| {
            BuildError::IoError(format!("rename '{}' to '{}'", from.display(), to.display()), e)
        })?;

        if let Some(node) = self.manifest.remove(&source) {
            self.manifest.insert(&destination, node)?;
        }
        Ok(())
    }
}

#[cfg(unix)]
fn set_executable(path: &Path, executable: bool) -> Result<(), BuildError> {
    use std::os::unix::fs::PermissionsExt;

    let mode = if executable {
        EXECUTABLE_MODE
    } else {
        REGULAR_MODE
    };
    fs::set_permissions(path, std::fs::Permissions::from_mode(mode))
        .map_err(|e| BuildError::IoError(format!("set permissions of '{}'", path.display()), e))
}

#[cfg(not(unix))]
fn set_executable(_path: &Path, _executable: bool) -> Result<(), BuildError> {
    Ok(())
}

#[cfg(unix)]
fn write_symlink(target: &str, path: &Path) -> Result<(), BuildError> {
    std::os::unix::fs::symlink(target, path).map_err(|e| {
        BuildError::IoError(format!("create symlink '{}'", path.display()), e)
    })
}

/// Without native symlinks the target is stored as the content of a regular file. Only the
/// manifest records it as a symlink.
#[cfg(not(unix))]
fn write_symlink(target: &str, path: &Path) -> Result<(), BuildError> {
    fs::write(path, target)
        .map_err(|e| BuildError::IoError(format!("write '{}'", path.display()), e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use larder_manifest::ScanOptions;

    fn builder(dir: &Path) -> StagingBuilder {
        StagingBuilder::new(dir, ManifestFormat::Sha256, CancellationToken::new())
    }

    #[test]
    fn test_manifest_matches_scan() {
        let dir = tempfile::tempdir().unwrap();
        let mut builder = builder(dir.path());
        builder
            .add_file("hello.txt", &mut "hi".as_bytes(), 1577836800, false)
            .unwrap();
        builder
            .add_file("bin/run", &mut "#!/bin/sh\n".as_bytes(), 1577836800, true)
            .unwrap();
        builder.add_directory("empty").unwrap();
        builder.add_symlink("bin/latest", "run").unwrap();
        builder.add_hardlink("copy.txt", "hello.txt", false).unwrap();

        let manifest = builder.into_manifest();
        let scanned =
            Manifest::from_directory(dir.path(), ManifestFormat::Sha256, &ScanOptions {
                reference: Some(&manifest),
                ..ScanOptions::default()
            })
            .unwrap();
        assert_eq!(scanned, manifest);
        assert_eq!(scanned.digest(), manifest.digest());
        assert!(manifest.to_string().starts_with(
            "F 8f434346648f6b96df89dda901c5176b10a6d83961dd3c1ac88b59b2dc327aa4 1577836800 2 copy.txt\n"
        ));
    }

    #[test]
    fn test_hardlink_with_other_executable_flag() {
        let dir = tempfile::tempdir().unwrap();
        let mut builder = builder(dir.path());
        builder.add_file("a", &mut "a".as_bytes(), 5, false).unwrap();
        builder.add_hardlink("b", "a", true).unwrap();

        assert_matches!(
            builder.manifest().get("b"),
            Some(ManifestNode::File(ManifestFile { executable: true, mtime: 5, .. }))
        );
        assert_matches!(
            builder.manifest().get("a"),
            Some(ManifestNode::File(ManifestFile { executable: false, .. }))
        );
        assert_matches!(
            builder.add_hardlink("c", "missing", false),
            Err(BuildError::NotFound(_))
        );
    }

    #[test]
    fn test_remove_and_rename() {
        let dir = tempfile::tempdir().unwrap();
        let mut builder = builder(dir.path());
        builder.add_file("x/a", &mut "a".as_bytes(), 1, false).unwrap();
        builder.add_file("b", &mut "b".as_bytes(), 1, false).unwrap();
        builder.rename("x", "y").unwrap();
        builder.remove("b").unwrap();

        assert!(dir.path().join("y/a").is_file());
        assert!(!dir.path().join("x").exists());
        assert!(!dir.path().join("b").exists());
        assert_eq!(
            builder.manifest().to_string(),
            format!(
                "D /y\nF {} 1 1 a\n",
                ManifestFormat::Sha256.hash_content("a")
            )
        );
        assert_matches!(builder.remove("b"), Err(BuildError::NotFound(_)));
        assert_matches!(builder.rename("y", "y/z"), Err(BuildError::InvalidPath(_)));
    }

    #[test]
    fn test_overwrite_file() {
        let dir = tempfile::tempdir().unwrap();
        let mut builder = builder(dir.path());
        builder.add_file("a", &mut "first".as_bytes(), 1, false).unwrap();
        builder.add_file("a", &mut "second".as_bytes(), 2, false).unwrap();
        assert_eq!(std::fs::read_to_string(dir.path().join("a")).unwrap(), "second");
        assert_matches!(
            builder.manifest().get("a"),
            Some(ManifestNode::File(ManifestFile { size: 6, mtime: 2, .. }))
        );

        builder.add_directory("d").unwrap();
        assert_matches!(
            builder.add_file("d", &mut "x".as_bytes(), 1, false),
            Err(BuildError::InvalidPath(_))
        );
    }

    #[test]
    fn test_rejected_paths() {
        let dir = tempfile::tempdir().unwrap();
        let mut builder = builder(dir.path());
        assert_matches!(
            builder.add_file("../escape", &mut "x".as_bytes(), 1, false),
            Err(BuildError::PathTraversal(_))
        );
        assert_matches!(
            builder.add_file(".manifest", &mut "x".as_bytes(), 1, false),
            Err(BuildError::ReservedName(_))
        );
        assert!(!dir.path().join(".manifest").exists());
        assert!(builder.manifest().root().is_empty());
    }

    #[test]
    fn test_cancelled() {
        let dir = tempfile::tempdir().unwrap();
        let token = CancellationToken::new();
        let mut builder =
            StagingBuilder::new(dir.path(), ManifestFormat::Sha256New, token.clone());
        builder.add_directory("before").unwrap();
        token.cancel();
        assert_matches!(builder.add_directory("after"), Err(BuildError::Cancelled));
        assert!(!dir.path().join("after").exists());
    }

    #[cfg(unix)]
    #[test]
    fn test_permissions() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let mut builder = builder(dir.path());
        builder.add_file("run", &mut "x".as_bytes(), 1, true).unwrap();
        builder.add_file("data", &mut "x".as_bytes(), 1, false).unwrap();
        let mode = |name: &str| {
            std::fs::metadata(dir.path().join(name))
                .unwrap()
                .permissions()
                .mode()
                & 0o777
        };
        assert_eq!(mode("run"), 0o755);
        assert_eq!(mode("data"), 0o644);
    }
}
