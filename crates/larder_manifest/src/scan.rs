//! Building a manifest from a directory on disk.

use std::path::{Path, PathBuf};

use filetime::FileTime;
use fs_err as fs;
use larder_digest::HashingWriter;
use rayon::prelude::*;

use crate::{
    join_path, validate_name, Manifest, ManifestError, ManifestFile, ManifestFormat,
    ManifestNode, ManifestSymlink, MANIFEST_FILE_NAME,
};

/// Describes which file properties the filesystem a directory lives on can represent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileSystemCapabilities {
    /// Whether files carry an executable permission bit.
    pub executable_bits: bool,
    /// Whether symbolic links can be created.
    pub symlinks: bool,
}

impl FileSystemCapabilities {
    /// The capabilities assumed for the platform this was compiled for.
    pub fn native() -> Self {
        Self {
            executable_bits: cfg!(unix),
            symlinks: cfg!(unix),
        }
    }
}

impl Default for FileSystemCapabilities {
    fn default() -> Self {
        Self::native()
    }
}

/// Options for [`Manifest::from_directory`].
#[derive(Debug, Clone, Copy, Default)]
pub struct ScanOptions<'a> {
    /// A manifest previously recorded for the same directory. On filesystems that lack
    /// executable bits or symlinks it supplies the information the filesystem cannot store.
    pub reference: Option<&'a Manifest>,

    /// What the filesystem can represent.
    pub capabilities: FileSystemCapabilities,
}

/// A file whose content still has to be hashed.
struct PendingFile {
    path: String,
    absolute: PathBuf,
    mtime: i64,
    executable: bool,
}

impl Manifest {
    /// Scans the directory at `path` and returns its manifest. Symlinks are recorded, not
    /// followed, and a `.manifest` file at the root is ignored.
    pub fn from_directory(
        path: &Path,
        format: ManifestFormat,
        options: &ScanOptions<'_>,
    ) -> Result<Manifest, ManifestError> {
        let mut manifest = Manifest::new(format);
        let mut pending = Vec::new();
        scan_directory(path, "", format, options, &mut manifest, &mut pending)?;

        let hashed = pending
            .into_par_iter()
            .map(|file| {
                let (digest, size) = hash_file(&file.absolute, format)?;
                Ok((file, digest, size))
            })
            .collect::<Result<Vec<_>, ManifestError>>()?;

        for (file, digest, size) in hashed {
            manifest.insert(
                &file.path,
                ManifestNode::File(ManifestFile {
                    digest,
                    mtime: file.mtime,
                    size,
                    executable: file.executable,
                }),
            )?;
        }

        Ok(manifest)
    }
}

fn scan_directory(
    directory: &Path,
    relative: &str,
    format: ManifestFormat,
    options: &ScanOptions<'_>,
    manifest: &mut Manifest,
    pending: &mut Vec<PendingFile>,
) -> Result<(), ManifestError> {
    let read_error =
        |e| ManifestError::IoError(format!("read directory '{}'", directory.display()), e);
    let mut entries = fs::read_dir(directory)
        .map_err(read_error)?
        .collect::<Result<Vec<_>, _>>()
        .map_err(read_error)?;
    entries.sort_by_key(|entry| entry.file_name());

    for entry in entries {
        let absolute = entry.path();
        let name = entry
            .file_name()
            .into_string()
            .map_err(|_| ManifestError::NonUtf8Name(absolute.clone()))?;
        if relative.is_empty() && name == MANIFEST_FILE_NAME {
            continue;
        }
        validate_name(&name)?;
        let path = join_path(relative, &name);

        let metadata = fs::symlink_metadata(&absolute).map_err(|e| {
            ManifestError::IoError(format!("read metadata of '{}'", absolute.display()), e)
        })?;
        let file_type = metadata.file_type();
        let recorded = options.reference.and_then(|reference| reference.get(&path));

        if file_type.is_dir() {
            manifest.ensure_directory(&path)?;
            scan_directory(&absolute, &path, format, options, manifest, pending)?;
        } else if file_type.is_symlink() {
            let target = fs::read_link(&absolute).map_err(|e| {
                ManifestError::IoError(format!("read link '{}'", absolute.display()), e)
            })?;
            let target = target.as_os_str().as_encoded_bytes();
            manifest.insert(
                &path,
                ManifestNode::Symlink(ManifestSymlink {
                    digest: format.hash_content(target),
                    size: target.len() as u64,
                }),
            )?;
        } else if file_type.is_file() {
            if !options.capabilities.symlinks && matches!(recorded, Some(ManifestNode::Symlink(_)))
            {
                // Stored as a regular file whose content is the link target.
                let target = fs::read(&absolute).map_err(|e| {
                    ManifestError::IoError(format!("read '{}'", absolute.display()), e)
                })?;
                manifest.insert(
                    &path,
                    ManifestNode::Symlink(ManifestSymlink {
                        digest: format.hash_content(&target),
                        size: target.len() as u64,
                    }),
                )?;
                continue;
            }

            let executable = if options.capabilities.executable_bits {
                is_executable(&metadata)
            } else {
                matches!(recorded, Some(ManifestNode::File(file)) if file.executable)
            };
            pending.push(PendingFile {
                path,
                absolute,
                mtime: FileTime::from_last_modification_time(&metadata).unix_seconds(),
                executable,
            });
        } else {
            tracing::warn!(
                "skipping '{}' because it is neither a file, a directory nor a symlink",
                absolute.display()
            );
        }
    }

    Ok(())
}

fn hash_file(path: &Path, format: ManifestFormat) -> Result<(String, u64), ManifestError> {
    let mut file = fs::File::open(path)
        .map_err(|e| ManifestError::IoError(format!("open '{}'", path.display()), e))?;
    let mut writer = HashingWriter::new(std::io::sink(), format);
    std::io::copy(&mut file, &mut writer)
        .map_err(|e| ManifestError::IoError(format!("hash '{}'", path.display()), e))?;
    let size = writer.bytes_written();
    let (_, digest) = writer.finalize();
    Ok((digest, size))
}

#[cfg(unix)]
fn is_executable(metadata: &std::fs::Metadata) -> bool {
    use std::os::unix::fs::PermissionsExt;
    metadata.permissions().mode() & 0o111 != 0
}

#[cfg(not(unix))]
fn is_executable(_metadata: &std::fs::Metadata) -> bool {
    false
}
