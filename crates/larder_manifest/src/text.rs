//! The line based text format of manifests.

use std::{fmt, path::Path};

use fs_err as fs;

use crate::{
    join_path, split_path, Manifest, ManifestDirectory, ManifestError, ManifestFile,
    ManifestFormat, ManifestNode, ManifestSymlink,
};

impl fmt::Display for Manifest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write_directory(f, "", &self.root)
    }
}

/// Writes the files and symlinks of `dir` first, then every sub-directory as a `D` line followed
/// by its own contents.
fn write_directory(f: &mut fmt::Formatter<'_>, path: &str, dir: &ManifestDirectory) -> fmt::Result {
    for (name, node) in &dir.entries {
        match node {
            ManifestNode::File(file) => writeln!(
                f,
                "{} {} {} {} {}",
                if file.executable { 'X' } else { 'F' },
                file.digest,
                file.mtime,
                file.size,
                name
            )?,
            ManifestNode::Symlink(symlink) => {
                writeln!(f, "S {} {} {}", symlink.digest, symlink.size, name)?;
            }
            ManifestNode::Directory(_) => {}
        }
    }
    for (name, node) in &dir.entries {
        if let ManifestNode::Directory(child) = node {
            let child_path = join_path(path, name);
            writeln!(f, "D /{child_path}")?;
            write_directory(f, &child_path, child)?;
        }
    }
    Ok(())
}

impl Manifest {
    /// Parses the text representation of a manifest.
    pub fn parse(format: ManifestFormat, text: &str) -> Result<Self, ManifestError> {
        let mut manifest = Manifest::new(format);
        let mut current_dir = String::new();

        let lines = text.strip_suffix('\n').unwrap_or(text);
        if lines.is_empty() {
            return Ok(manifest);
        }

        for (idx, line) in lines.split('\n').enumerate() {
            let invalid = || ManifestError::InvalidLine {
                line: idx + 1,
                content: line.to_string(),
            };

            let (kind, rest) = line.split_once(' ').ok_or_else(invalid)?;
            match kind {
                "D" => {
                    let path = rest.strip_prefix('/').ok_or_else(invalid)?;
                    manifest.ensure_directory(path)?;
                    current_dir = split_path(path).join("/");
                }
                "F" | "X" => {
                    let mut parts = rest.splitn(4, ' ');
                    let (Some(digest), Some(mtime), Some(size), Some(name)) =
                        (parts.next(), parts.next(), parts.next(), parts.next())
                    else {
                        return Err(invalid());
                    };
                    let file = ManifestFile {
                        digest: digest.to_string(),
                        mtime: mtime.parse().map_err(|_| invalid())?,
                        size: size.parse().map_err(|_| invalid())?,
                        executable: kind == "X",
                    };
                    manifest.insert(&join_path(&current_dir, name), ManifestNode::File(file))?;
                }
                "S" => {
                    let mut parts = rest.splitn(3, ' ');
                    let (Some(digest), Some(size), Some(name)) =
                        (parts.next(), parts.next(), parts.next())
                    else {
                        return Err(invalid());
                    };
                    let symlink = ManifestSymlink {
                        digest: digest.to_string(),
                        size: size.parse().map_err(|_| invalid())?,
                    };
                    manifest.insert(
                        &join_path(&current_dir, name),
                        ManifestNode::Symlink(symlink),
                    )?;
                }
                _ => return Err(invalid()),
            }
        }

        Ok(manifest)
    }

    /// Reads a manifest file written by [`Manifest::save`].
    pub fn load(path: &Path, format: ManifestFormat) -> Result<Self, ManifestError> {
        let text = fs::read_to_string(path).map_err(|e| {
            ManifestError::IoError(format!("read manifest '{}'", path.display()), e)
        })?;
        Self::parse(format, &text)
    }

    /// Writes the manifest to `path`. The written bytes are exactly the bytes the digest is
    /// computed over.
    pub fn save(&self, path: &Path) -> Result<(), ManifestError> {
        fs::write(path, self.to_string()).map_err(|e| {
            ManifestError::IoError(format!("write manifest '{}'", path.display()), e)
        })
    }
}
