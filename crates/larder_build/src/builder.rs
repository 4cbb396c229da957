use std::io::Read;

use crate::BuildError;

/// Receives the operations that populate an implementation directory.
///
/// Paths are `/` separated and relative to the implementation root. Implementations create
/// missing parent directories implicitly.
pub trait DirectoryBuilder {
    /// Creates a directory. Adding an existing directory is not an error.
    fn add_directory(&mut self, path: &str) -> Result<(), BuildError>;

    /// Creates a regular file with the given content, modification time (seconds since the Unix
    /// epoch) and executable flag, replacing an existing file.
    fn add_file(
        &mut self,
        path: &str,
        content: &mut dyn Read,
        mtime: i64,
        executable: bool,
    ) -> Result<(), BuildError>;

    /// Creates a symbolic link pointing at `target`.
    fn add_symlink(&mut self, path: &str, target: &str) -> Result<(), BuildError>;

    /// Makes `path` a second name for the regular file `existing`.
    fn add_hardlink(
        &mut self,
        path: &str,
        existing: &str,
        executable: bool,
    ) -> Result<(), BuildError>;

    /// Removes a file, symlink or directory tree.
    fn remove(&mut self, path: &str) -> Result<(), BuildError>;

    /// Moves an entry to a new location, replacing whatever was there.
    fn rename(&mut self, source: &str, destination: &str) -> Result<(), BuildError>;
}

/// A [`DirectoryBuilder`] that places everything below a sub-directory of another builder.
pub struct PrefixBuilder<'a> {
    inner: &'a mut dyn DirectoryBuilder,
    prefix: String,
}

impl<'a> PrefixBuilder<'a> {
    /// Wraps `inner` so that every path is resolved relative to `prefix`.
    pub fn new(inner: &'a mut dyn DirectoryBuilder, prefix: impl Into<String>) -> Self {
        Self {
            inner,
            prefix: prefix.into(),
        }
    }

    fn prefixed(&self, path: &str) -> String {
        format!("{}/{}", self.prefix, path)
    }
}

impl DirectoryBuilder for PrefixBuilder<'_> {
    fn add_directory(&mut self, path: &str) -> Result<(), BuildError> {
        let path = self.prefixed(path);
        self.inner.add_directory(&path)
    }

    fn add_file(
        &mut self,
        path: &str,
        content: &mut dyn Read,
        mtime: i64,
        executable: bool,
    ) -> Result<(), BuildError> {
        let path = self.prefixed(path);
        self.inner.add_file(&path, content, mtime, executable)
    }

    fn add_symlink(&mut self, path: &str, target: &str) -> Result<(), BuildError> {
        let path = self.prefixed(path);
        self.inner.add_symlink(&path, target)
    }

    fn add_hardlink(
        &mut self,
        path: &str,
        existing: &str,
        executable: bool,
    ) -> Result<(), BuildError> {
        let path = self.prefixed(path);
        let existing = self.prefixed(existing);
        self.inner.add_hardlink(&path, &existing, executable)
    }

    fn remove(&mut self, path: &str) -> Result<(), BuildError> {
        let path = self.prefixed(path);
        self.inner.remove(&path)
    }

    fn rename(&mut self, source: &str, destination: &str) -> Result<(), BuildError> {
        let source = self.prefixed(source);
        let destination = self.prefixed(destination);
        self.inner.rename(&source, &destination)
    }
}
