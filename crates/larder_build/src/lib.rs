#![deny(missing_docs)]

//! Populating implementation directories.
//!
//! Everything that produces the content of an implementation goes through a
//! [`DirectoryBuilder`]. The [`StagingBuilder`] writes to a staging directory and records a
//! [`Manifest`](larder_manifest::Manifest) of exactly what it wrote, so the digest of the result is
//! known without scanning the directory again.
//!
//! Builders are driven by a [`BuildAction`]: either a serialisable [`Recipe`] of steps (archives to
//! extract, single files to copy, renames, removals) or an arbitrary closure wrapped with
//! [`build_fn`]. Every step receives an explicit [`BuildContext`] carrying the [`TaskHandler`]
//! used for progress, cancellation and questions.

mod archive;
mod builder;
mod recipe;
mod staging;
mod task;

pub use archive::{
    extract, mime_type_from_path, ExtractOptions, BZIP2_TAR, GZIP_TAR, TAR, ZIP, ZSTD_TAR,
};
pub use builder::{DirectoryBuilder, PrefixBuilder};
pub use recipe::{build_fn, BuildAction, BuildContext, FnBuildAction, Recipe, RecipeStep};
pub use staging::StagingBuilder;
pub use task::{run_task, SilentTaskHandler, TaskHandler, TaskProgress};
pub use tokio_util::sync::CancellationToken;

use larder_manifest::{validate_name, ManifestDigest, ManifestError, MANIFEST_FILE_NAME};

/// An error that can occur while building an implementation directory.
#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    /// An IO error occurred.
    #[error("failed to {0}")]
    IoError(String, #[source] std::io::Error),

    /// A path tried to escape the implementation root.
    #[error("path traversal attempt: '{0}'")]
    PathTraversal(String),

    /// A path names the manifest file at the root of the implementation.
    #[error("'{0}' is reserved and cannot be part of an implementation")]
    ReservedName(String),

    /// A path cannot be represented in a manifest.
    #[error("'{0}' is not a valid path")]
    InvalidPath(String),

    /// An operation refers to an entry that does not exist.
    #[error("'{0}' does not exist")]
    NotFound(String),

    /// The archive type is not supported.
    #[error("unsupported archive type '{0}'")]
    UnsupportedArchive(String),

    /// A zip archive could not be read.
    #[error(transparent)]
    Zip(#[from] zip::result::ZipError),

    /// The operation was cancelled through the task handler.
    #[error("the operation was cancelled")]
    Cancelled,

    /// An implementation a recipe copies from is not available.
    #[error("implementation {0} is not available")]
    MissingImplementation(ManifestDigest),

    /// The recorded manifest rejected an operation.
    #[error(transparent)]
    Manifest(#[from] ManifestError),
}

/// Normalizes a `/` separated path relative to an implementation root.
///
/// Empty and `.` components are dropped. Returns `Ok(None)` if nothing remains, which denotes the
/// root itself.
pub fn normalize_path(path: &str) -> Result<Option<String>, BuildError> {
    let mut components = Vec::new();
    for component in path.split('/') {
        match component {
            "" | "." => {}
            ".." => return Err(BuildError::PathTraversal(path.to_string())),
            name => {
                validate_name(name).map_err(|_| BuildError::InvalidPath(path.to_string()))?;
                components.push(name);
            }
        }
    }

    match components.first() {
        None => Ok(None),
        Some(&first) if first == MANIFEST_FILE_NAME => {
            Err(BuildError::ReservedName(path.to_string()))
        }
        Some(_) => Ok(Some(components.join("/"))),
    }
}

/// Like [`normalize_path`] but the root is not accepted.
pub(crate) fn normalize_entry_path(path: &str) -> Result<String, BuildError> {
    normalize_path(path)?.ok_or_else(|| BuildError::InvalidPath(path.to_string()))
}
