#![deny(missing_docs)]

//! Deterministic descriptions of directory trees.
//!
//! A [`Manifest`] lists every file, symlink and directory of an implementation together with the
//! hash of its content, its modification time and its size. Its text serialization is fully
//! determined by the tree, so hashing that text yields a digest that identifies the tree: this is
//! the [`ManifestDigest`] an implementation is stored under.
//!
//! ```text
//! F 8f434346648f6b96df89dda901c5176b10a6d83961dd3c1ac88b59b2dc327aa4 1577836800 2 hello.txt
//! X 2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824 1577836800 5 run.sh
//! S 734cad14909bedfafb5b273b6b0eb01fbfa639587d217f78ce9639bba41f4415 9 latest
//! D /lib
//! F 9f86d081884c7d659a2feaa0c55ad015a3bf4f1b2b0b822cd15d6c15b0f00a08 1577836800 4 a.so
//! ```
//!
//! Manifests are created by scanning a directory ([`Manifest::from_directory`]), by recording
//! the operations of a builder, or by [loading](Manifest::load) the `.manifest` file written
//! next to a published implementation.

mod diff;
mod repair;
mod scan;
mod text;

use std::{collections::BTreeMap, path::PathBuf};

pub use diff::ManifestDiff;
pub use larder_digest::{ManifestDigest, ManifestFormat};
pub use repair::{time_offsets, MAX_TIME_OFFSET, TIME_OFFSET_STEP};
pub use scan::{FileSystemCapabilities, ScanOptions};

/// The name of the file a manifest is stored in, at the root of an implementation directory.
pub const MANIFEST_FILE_NAME: &str = ".manifest";

/// An error that can occur while reading, parsing or building a [`Manifest`].
#[derive(Debug, thiserror::Error)]
pub enum ManifestError {
    /// An IO error occurred.
    #[error("failed to {0}")]
    IoError(String, #[source] std::io::Error),

    /// A line of a manifest file could not be parsed.
    #[error("invalid manifest line {line}: '{content}'")]
    InvalidLine {
        /// The one-based line number.
        line: usize,
        /// The offending line.
        content: String,
    },

    /// A name cannot be represented in a manifest.
    #[error("'{0}' is not a valid name in a manifest")]
    InvalidName(String),

    /// A file name on disk is not valid UTF-8.
    #[error("the name of '{}' is not valid UTF-8", .0.display())]
    NonUtf8Name(PathBuf),

    /// A path component that should be a directory is a file or symlink.
    #[error("'{0}' is not a directory")]
    NotADirectory(String),
}

/// A regular file in a manifest.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ManifestFile {
    /// Lower-case hex hash of the file content.
    pub digest: String,
    /// Last modification time in seconds since the Unix epoch.
    pub mtime: i64,
    /// Size in bytes.
    pub size: u64,
    /// Whether the file is executable.
    pub executable: bool,
}

/// A symbolic link in a manifest.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ManifestSymlink {
    /// Lower-case hex hash of the link target.
    pub digest: String,
    /// Length of the link target in bytes.
    pub size: u64,
}

/// A directory in a manifest. Entries are kept ordered by name.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ManifestDirectory {
    entries: BTreeMap<String, ManifestNode>,
}

/// An entry of a [`ManifestDirectory`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ManifestNode {
    /// A regular file.
    File(ManifestFile),
    /// A symbolic link.
    Symlink(ManifestSymlink),
    /// A sub-directory.
    Directory(ManifestDirectory),
}

impl ManifestDirectory {
    /// Iterates over the entries of this directory in name order.
    pub fn entries(&self) -> impl Iterator<Item = (&str, &ManifestNode)> {
        self.entries.iter().map(|(name, node)| (name.as_str(), node))
    }

    /// Returns true if the directory has no entries.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn child_dir_mut(&mut self, name: &str, create: bool) -> Result<&mut Self, ManifestError> {
        if create && !self.entries.contains_key(name) {
            self.entries.insert(
                name.to_string(),
                ManifestNode::Directory(ManifestDirectory::default()),
            );
        }
        match self.entries.get_mut(name) {
            Some(ManifestNode::Directory(dir)) => Ok(dir),
            _ => Err(ManifestError::NotADirectory(name.to_string())),
        }
    }
}

/// A regular file of a manifest together with its location, as yielded by [`Manifest::files`].
#[derive(Debug, Clone)]
pub struct ManifestFileEntry<'a> {
    /// The `/` separated path of the containing directory, empty for the root.
    pub directory: String,
    /// The file name.
    pub name: &'a str,
    /// The file itself.
    pub file: &'a ManifestFile,
}

impl ManifestFileEntry<'_> {
    /// The `/` separated path of the file relative to the implementation root.
    pub fn path(&self) -> String {
        join_path(&self.directory, self.name)
    }
}

/// A manifest: the ordered tree of an implementation directory in one [`ManifestFormat`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Manifest {
    format: ManifestFormat,
    root: ManifestDirectory,
}

impl Manifest {
    /// Creates an empty manifest.
    pub fn new(format: ManifestFormat) -> Self {
        Self {
            format,
            root: ManifestDirectory::default(),
        }
    }

    /// The format entries of this manifest are hashed with.
    pub fn format(&self) -> ManifestFormat {
        self.format
    }

    /// The root directory.
    pub fn root(&self) -> &ManifestDirectory {
        &self.root
    }

    /// Looks up the node at a `/` separated path. The empty path is not a node.
    pub fn get(&self, path: &str) -> Option<&ManifestNode> {
        let components = split_path(path);
        let (name, parents) = components.split_last()?;
        let mut dir = &self.root;
        for parent in parents {
            match dir.entries.get(*parent) {
                Some(ManifestNode::Directory(child)) => dir = child,
                _ => return None,
            }
        }
        dir.entries.get(*name)
    }

    /// Returns the directory at `path`, the root for the empty path.
    pub fn directory(&self, path: &str) -> Option<&ManifestDirectory> {
        if split_path(path).is_empty() {
            return Some(&self.root);
        }
        match self.get(path) {
            Some(ManifestNode::Directory(dir)) => Some(dir),
            _ => None,
        }
    }

    /// Inserts `node` at `path`, creating missing parent directories and replacing an existing
    /// entry of the same name.
    pub fn insert(&mut self, path: &str, node: ManifestNode) -> Result<(), ManifestError> {
        let components = split_path(path);
        let Some((name, parents)) = components.split_last() else {
            return Err(ManifestError::InvalidName(path.to_string()));
        };
        validate_name(name)?;
        let dir = self.directory_mut(parents, true)?;
        dir.entries.insert((*name).to_string(), node);
        Ok(())
    }

    /// Makes sure a directory exists at `path`, creating missing parents. An existing directory is
    /// left untouched.
    pub fn ensure_directory(&mut self, path: &str) -> Result<(), ManifestError> {
        let components = split_path(path);
        for component in &components {
            validate_name(component)?;
        }
        self.directory_mut(&components, true).map(|_| ())
    }

    /// Removes and returns the node at `path`.
    pub fn remove(&mut self, path: &str) -> Option<ManifestNode> {
        let components = split_path(path);
        let (name, parents) = components.split_last()?;
        let dir = self.directory_mut(parents, false).ok()?;
        dir.entries.remove(*name)
    }

    fn directory_mut(
        &mut self,
        components: &[&str],
        create: bool,
    ) -> Result<&mut ManifestDirectory, ManifestError> {
        let mut dir = &mut self.root;
        for component in components {
            dir = dir.child_dir_mut(component, create)?;
        }
        Ok(dir)
    }

    /// Returns every regular file in the manifest in serialization order.
    pub fn files(&self) -> Vec<ManifestFileEntry<'_>> {
        fn walk<'a>(path: &str, dir: &'a ManifestDirectory, out: &mut Vec<ManifestFileEntry<'a>>) {
            for (name, node) in &dir.entries {
                if let ManifestNode::File(file) = node {
                    out.push(ManifestFileEntry {
                        directory: path.to_string(),
                        name,
                        file,
                    });
                }
            }
            for (name, node) in &dir.entries {
                if let ManifestNode::Directory(child) = node {
                    walk(&join_path(path, name), child, out);
                }
            }
        }

        let mut out = Vec::new();
        walk("", &self.root, &mut out);
        out
    }

    /// The combined size of all regular files.
    pub fn total_size(&self) -> u64 {
        self.files().iter().map(|entry| entry.file.size).sum()
    }

    /// Computes the digest value of this manifest in its own format.
    pub fn digest_value(&self) -> String {
        self.format.digest_manifest(self.to_string())
    }

    /// Computes the [`ManifestDigest`] of this manifest in its own format.
    pub fn digest(&self) -> ManifestDigest {
        ManifestDigest::from_value(self.format, self.digest_value())
            .expect("a computed digest value is always valid")
    }
}

/// Returns an error if `name` cannot be an entry of a manifest.
pub fn validate_name(name: &str) -> Result<(), ManifestError> {
    if name.is_empty()
        || name == "."
        || name == ".."
        || name.contains(['/', '\n', '\0'])
    {
        return Err(ManifestError::InvalidName(name.to_string()));
    }
    Ok(())
}

/// Splits a `/` separated path into its components, ignoring empty ones.
pub fn split_path(path: &str) -> Vec<&str> {
    path.split('/').filter(|c| !c.is_empty()).collect()
}

/// Joins a `/` separated directory path and a name.
pub fn join_path(directory: &str, name: &str) -> String {
    if directory.is_empty() {
        name.to_string()
    } else {
        format!("{directory}/{name}")
    }
}
