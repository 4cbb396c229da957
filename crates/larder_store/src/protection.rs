//! Making stored implementations read-only.
//!
//! Once an implementation has been published its directory tree is sealed: write permissions are
//! removed from every file and directory so that programs running from the store cannot modify
//! it by accident. Removing or optimising an implementation unseals it first.
//!
//! On Unix only directories are unsealed: replacing or unlinking an entry needs write access to
//! its directory, not to the file. File modes belong to the inode, which optimisation shares
//! between implementations, so making a file writable for one implementation would make it
//! writable for all of them.

use std::path::Path;

use fs_err as fs;
use walkdir::WalkDir;

use crate::StoreError;

/// The name of the explanatory file placed at the root of a write-protected store.
pub const WRITE_PROTECTION_MARKER: &str = "_README-write-protected.txt";

const MARKER_CONTENT: &str = "\
The implementations in this directory are write-protected to prevent accidental modification.

Use `larder remove` or `larder purge` to delete them. Modifying files in place makes them fail
verification.
";

/// Removes write permissions from `path` and everything below it.
///
/// Children are sealed before their parents so the walk never loses access to a directory it still
/// has to visit.
pub fn seal(path: &Path) -> Result<(), StoreError> {
    for entry in WalkDir::new(path).contents_first(true).follow_links(false) {
        let entry = entry.map_err(|e| walk_error(path, e))?;
        if entry.path_is_symlink() {
            continue;
        }
        set_writable(entry.path(), false)?;
    }
    tracing::debug!("sealed {}", path.display());
    Ok(())
}

/// Restores owner write permissions on `path` and the directories below it. Elsewhere than on
/// Unix files are made writable as well, since read-only files cannot be deleted there.
pub fn unseal(path: &Path) -> Result<(), StoreError> {
    // Parents first, a sealed directory does not allow changing its entries.
    for entry in WalkDir::new(path).follow_links(false) {
        let entry = entry.map_err(|e| walk_error(path, e))?;
        if entry.path_is_symlink() || (cfg!(unix) && !entry.file_type().is_dir()) {
            continue;
        }
        set_writable(entry.path(), true)?;
    }
    tracing::debug!("unsealed {}", path.display());
    Ok(())
}

/// Writes the [`WRITE_PROTECTION_MARKER`] into `store_root` unless it is already there.
pub fn deploy_marker(store_root: &Path) -> Result<(), StoreError> {
    let path = store_root.join(WRITE_PROTECTION_MARKER);
    if path.exists() {
        return Ok(());
    }
    fs::write(&path, MARKER_CONTENT)
        .map_err(|e| StoreError::io(format!("write '{}'", path.display()), e))
}

fn walk_error(root: &Path, error: walkdir::Error) -> StoreError {
    let path = error.path().unwrap_or(root).display().to_string();
    StoreError::io(format!("walk '{path}'"), error.into())
}

#[cfg(unix)]
fn set_writable(path: &Path, writable: bool) -> Result<(), StoreError> {
    use std::os::unix::fs::PermissionsExt;

    let metadata = fs::symlink_metadata(path)
        .map_err(|e| StoreError::io(format!("read metadata of '{}'", path.display()), e))?;
    let mode = metadata.permissions().mode();
    let new_mode = if writable { mode | 0o200 } else { mode & !0o222 };
    if new_mode == mode {
        return Ok(());
    }
    fs::set_permissions(path, std::fs::Permissions::from_mode(new_mode))
        .map_err(|e| StoreError::io(format!("change permissions of '{}'", path.display()), e))
}

#[cfg(not(unix))]
fn set_writable(path: &Path, writable: bool) -> Result<(), StoreError> {
    let metadata = fs::symlink_metadata(path)
        .map_err(|e| StoreError::io(format!("read metadata of '{}'", path.display()), e))?;
    // Directories cannot be made read-only in a meaningful way here.
    if metadata.is_dir() {
        return Ok(());
    }
    let mut permissions = metadata.permissions();
    if permissions.readonly() == !writable {
        return Ok(());
    }
    permissions.set_readonly(!writable);
    fs::set_permissions(path, permissions)
        .map_err(|e| StoreError::io(format!("change permissions of '{}'", path.display()), e))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[cfg(unix)]
    fn mode(path: &Path) -> u32 {
        use std::os::unix::fs::PermissionsExt;
        fs::symlink_metadata(path).unwrap().permissions().mode() & 0o777
    }

    #[test]
    #[cfg(unix)]
    fn test_seal_and_unseal() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("impl");
        fs::create_dir_all(root.join("sub")).unwrap();
        fs::write(root.join("sub/file"), "x").unwrap();
        std::os::unix::fs::symlink("sub/file", root.join("link")).unwrap();

        seal(&root).unwrap();
        for path in [root.clone(), root.join("sub"), root.join("sub/file")] {
            assert_eq!(mode(&path) & 0o222, 0, "{} is writable", path.display());
        }

        unseal(&root).unwrap();
        for path in [root.clone(), root.join("sub")] {
            assert_eq!(mode(&path) & 0o200, 0o200, "{} is sealed", path.display());
        }
        assert_eq!(mode(&root.join("sub/file")) & 0o222, 0);
        fs::remove_dir_all(&root).unwrap();
    }

    #[test]
    fn test_marker_is_written_once() {
        let dir = tempfile::tempdir().unwrap();
        deploy_marker(dir.path()).unwrap();
        let marker = dir.path().join(WRITE_PROTECTION_MARKER);
        fs::write(&marker, "custom").unwrap();
        deploy_marker(dir.path()).unwrap();
        assert_eq!(fs::read_to_string(&marker).unwrap(), "custom");
    }
}
