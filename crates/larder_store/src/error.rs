use std::{fmt, io::ErrorKind, path::PathBuf};

use larder_build::BuildError;
use larder_manifest::{Manifest, ManifestDiff, ManifestDigest, ManifestError};

/// An error that can occur while operating on an implementation store.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// The implementation is already stored.
    #[error("implementation {0} is already in the store")]
    AlreadyInStore(ManifestDigest),

    /// The implementation is not stored.
    #[error("implementation {0} was not found in the store")]
    NotFound(ManifestDigest),

    /// Built or stored content does not match the expected digest.
    #[error(transparent)]
    DigestMismatch(Box<DigestMismatch>),

    /// The store is read-only for the current process.
    #[error("the store at '{}' is read-only, administrator rights are required to modify it", .0.display())]
    NotAdmin(PathBuf),

    /// The operating system denied access to a file.
    #[error("access denied: failed to {0}")]
    Unauthorized(String, #[source] std::io::Error),

    /// An IO error occurred.
    #[error("failed to {0}")]
    IoError(String, #[source] std::io::Error),

    /// The operation or its input is not supported.
    #[error("{0}")]
    NotSupported(String),

    /// Building the implementation failed.
    #[error(transparent)]
    Build(BuildError),

    /// A manifest could not be read or written.
    #[error(transparent)]
    Manifest(ManifestError),

    /// Processes are using files of an implementation that should be removed.
    #[error("'{}' is in use by {}", .path.display(), .processes.join(", "))]
    InUse {
        /// The implementation directory.
        path: PathBuf,
        /// Descriptions of the processes holding files open.
        processes: Vec<String>,
    },

    /// The implementation contains the executable of the current process.
    #[error("cannot remove '{}' because it contains the running executable", .0.display())]
    RemovingRunningExecutable(PathBuf),

    /// Some entries could not be removed while purging the store.
    #[error("failed to remove {} entries from the store:{}", .0.len(), .0.iter().map(|(path, error)| format!("\n  {}: {error}", path.display())).collect::<String>())]
    PurgeIncomplete(Vec<(PathBuf, String)>),

    /// The operation was cancelled.
    #[error("the operation was cancelled")]
    Cancelled,

    /// Communicating with a store service failed.
    #[error("store service error: {0}")]
    Service(String),
}

impl StoreError {
    /// Wraps an IO error, classifying permission problems as [`StoreError::Unauthorized`].
    pub fn io(action: impl Into<String>, error: std::io::Error) -> Self {
        if error.kind() == ErrorKind::PermissionDenied {
            StoreError::Unauthorized(action.into(), error)
        } else {
            StoreError::IoError(action.into(), error)
        }
    }

    /// Returns true if a [`CompositeStore`](crate::CompositeStore) should try the next store
    /// after this error instead of giving up.
    pub fn is_fall_through(&self) -> bool {
        matches!(
            self,
            StoreError::IoError(..)
                | StoreError::Unauthorized(..)
                | StoreError::NotAdmin(_)
                | StoreError::Service(_)
        )
    }
}

impl From<BuildError> for StoreError {
    fn from(error: BuildError) -> Self {
        match error {
            BuildError::UnsupportedArchive(mime_type) => {
                StoreError::NotSupported(format!("unsupported archive type '{mime_type}'"))
            }
            BuildError::Cancelled => StoreError::Cancelled,
            BuildError::IoError(action, e) => StoreError::io(action, e),
            other => StoreError::Build(other),
        }
    }
}

impl From<ManifestError> for StoreError {
    fn from(error: ManifestError) -> Self {
        match error {
            ManifestError::IoError(action, e) => StoreError::io(action, e),
            other => StoreError::Manifest(other),
        }
    }
}

/// Describes content that does not match the digest it was expected to have.
#[derive(Debug)]
pub struct DigestMismatch {
    /// The digest the content should have.
    pub expected: ManifestDigest,
    /// The id of the digest the content actually has.
    pub actual: String,
    /// The manifest recorded for the expected content, if known.
    pub expected_manifest: Option<Manifest>,
    /// The manifest of the actual content, if known.
    pub actual_manifest: Option<Manifest>,
}

impl DigestMismatch {
    /// The entries that differ between the expected and the actual manifest, if both are known.
    pub fn diff(&self) -> Option<ManifestDiff> {
        Some(self.expected_manifest.as_ref()?.diff(self.actual_manifest.as_ref()?))
    }
}

impl fmt::Display for DigestMismatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "content does not match the digest, expected {} but got {}",
            self.expected, self.actual
        )?;
        if let Some(diff) = self.diff().filter(|diff| !diff.is_empty()) {
            write!(f, "\n{diff}")?;
        }
        Ok(())
    }
}

impl std::error::Error for DigestMismatch {}

impl From<DigestMismatch> for StoreError {
    fn from(mismatch: DigestMismatch) -> Self {
        StoreError::DigestMismatch(Box::new(mismatch))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use larder_manifest::ManifestFormat;

    #[test]
    fn test_fall_through() {
        let io = std::io::Error::new(ErrorKind::PermissionDenied, "denied");
        assert_matches!(StoreError::io("write", io), StoreError::Unauthorized(..));
        assert!(StoreError::NotAdmin(PathBuf::from("/store")).is_fall_through());
        assert!(StoreError::Service("gone".to_string()).is_fall_through());
        assert!(!StoreError::Cancelled.is_fall_through());
        assert!(!StoreError::NotSupported("x".to_string()).is_fall_through());
    }

    #[test]
    fn test_build_error_mapping() {
        assert_matches!(
            StoreError::from(BuildError::UnsupportedArchive("application/x-rar".to_string())),
            StoreError::NotSupported(_)
        );
        assert_matches!(StoreError::from(BuildError::Cancelled), StoreError::Cancelled);
        let denied = std::io::Error::new(ErrorKind::PermissionDenied, "denied");
        let error = StoreError::from(BuildError::IoError("write 'x'".to_string(), denied));
        assert_matches!(error, StoreError::Unauthorized(..));
        assert!(error.is_fall_through());
        let full = std::io::Error::new(ErrorKind::Other, "disk full");
        assert_matches!(
            StoreError::from(BuildError::IoError("write 'x'".to_string(), full)),
            StoreError::IoError(..)
        );
        assert_matches!(
            StoreError::from(BuildError::NotFound("x".to_string())),
            StoreError::Build(BuildError::NotFound(_))
        );
    }

    #[test]
    fn test_mismatch_display() {
        let format = ManifestFormat::Sha256;
        let expected = Manifest::parse(format, "D /a\n").unwrap();
        let actual = Manifest::parse(format, "D /b\n").unwrap();
        let mismatch = DigestMismatch {
            expected: expected.digest(),
            actual: format.id(&actual.digest_value()),
            expected_manifest: Some(expected.clone()),
            actual_manifest: Some(actual.clone()),
        };
        let text = mismatch.to_string();
        assert!(text.starts_with(&format!(
            "content does not match the digest, expected {}",
            expected.digest()
        )));
        assert!(text.ends_with("\n- D /a\n+ D /b\n"));
    }
}
