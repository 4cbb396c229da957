#![deny(missing_docs)]

//! A content-addressed store of implementation directories.
//!
//! An implementation identified by a [`ManifestDigest`] is stored in a directory named after the
//! digest's best id, below the root of a store. Once [added](ImplementationStore::add), such a
//! directory is either fully present and matches its digest, or it does not exist at all:
//! content is built in a staging directory, verified against the digest and only then renamed
//! into place.
//!
//! - [`DirectoryStore`] is a store in a single directory on disk.
//! - [`CompositeStore`] combines several stores, reading from the first that has an
//!   implementation and writing to the last one that accepts it.
//! - `ServiceStore` forwards additions to a privileged process managing a shared store (Unix
//!   only).
//!
//! ```no_run
//! use larder_build::{build_fn, BuildContext, SilentTaskHandler};
//! use larder_store::{DirectoryStore, ImplementationStore};
//!
//! let store = DirectoryStore::open("/tmp/implementations").unwrap();
//! let digest = "sha256new_JETRMOHXIQKQ4B7NSG5R3N6D34VMA73RYGM3NG5KHPK6DMU53LRQ".parse().unwrap();
//! let handler = SilentTaskHandler::new();
//! let path = store
//!     .add(
//!         &digest,
//!         &build_fn(|builder, _| {
//!             builder.add_file("hello.txt", &mut "hi".as_bytes(), 1577836800, false)
//!         }),
//!         &BuildContext::new(&handler),
//!     )
//!     .unwrap();
//! println!("stored at {}", path.display());
//! ```

mod composite;
mod directory;
mod error;
mod handles;
pub mod locations;
mod optimise;
pub mod protection;
#[cfg(unix)]
pub mod service;

use std::path::{Path, PathBuf};

pub use composite::CompositeStore;
pub use directory::{DirectoryStore, StoreOptions};
pub use error::{DigestMismatch, StoreError};
pub use handles::{default_handle_inspector, HandleInspector, NoHandleInspector, ProcessInfo};
#[cfg(target_os = "linux")]
pub use handles::ProcfsHandleInspector;
pub use larder_build::{BuildAction, BuildContext, TaskHandler};
pub use larder_manifest::ManifestDigest;

/// Describes how a store can be used.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreKind {
    /// A directory the current process can modify.
    ReadWrite,
    /// A directory the current process can only read.
    ReadOnly,
    /// A directory managed by a store service. Additions are forwarded to the service.
    Service,
    /// A combination of other stores.
    Composite,
}

/// A place implementations are kept in.
///
/// All operations are blocking. Implementations are safe to share between threads.
pub trait ImplementationStore: Send + Sync {
    /// How the store can be used.
    fn kind(&self) -> StoreKind;

    /// The directory of the store, if it has exactly one.
    fn path(&self) -> Option<&Path>;

    /// Returns true if any of the ids of `digest` is stored. Never fails; inaccessible stores
    /// simply contain nothing.
    fn contains(&self, digest: &ManifestDigest) -> bool;

    /// Returns the directory holding the implementation, if it is stored.
    fn get_path(&self, digest: &ManifestDigest) -> Option<PathBuf>;

    /// Lists the digests of all stored implementations.
    fn list_all(&self) -> Result<Vec<ManifestDigest>, StoreError>;

    /// Lists directories that are not implementations, such as left-over staging directories.
    fn list_temp(&self) -> Result<Vec<PathBuf>, StoreError>;

    /// Builds an implementation with `action` and stores it if its content matches `digest`.
    /// Returns the path of the stored implementation.
    fn add(
        &self,
        digest: &ManifestDigest,
        action: &dyn BuildAction,
        context: &BuildContext<'_>,
    ) -> Result<PathBuf, StoreError>;

    /// Checks that the stored content still matches `digest`.
    ///
    /// If it does not, the handler is asked whether the damaged implementation should be
    /// removed. The mismatch is returned as an error either way.
    fn verify(&self, digest: &ManifestDigest, handler: &dyn TaskHandler)
        -> Result<(), StoreError>;

    /// Removes an implementation. Returns false if it was not stored.
    fn remove(&self, digest: &ManifestDigest, handler: &dyn TaskHandler)
        -> Result<bool, StoreError>;

    /// Removes all implementations and left-over temporary directories.
    fn purge(&self, handler: &dyn TaskHandler) -> Result<(), StoreError>;

    /// Replaces duplicate files with hardlinks. Returns the number of bytes saved.
    fn optimise(&self, handler: &dyn TaskHandler) -> Result<u64, StoreError>;
}
