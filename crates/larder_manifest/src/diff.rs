use std::{collections::BTreeSet, fmt};

use crate::{join_path, Manifest, ManifestDirectory, ManifestNode};

/// The difference between an expected and an actual manifest, as lines with absolute paths.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ManifestDiff {
    /// Lines only present in the actual manifest.
    pub added: Vec<String>,
    /// Lines only present in the expected manifest.
    pub removed: Vec<String>,
}

impl ManifestDiff {
    /// Returns true if both manifests describe the same tree.
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty()
    }
}

impl fmt::Display for ManifestDiff {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for line in &self.removed {
            writeln!(f, "- {line}")?;
        }
        for line in &self.added {
            writeln!(f, "+ {line}")?;
        }
        Ok(())
    }
}

/// Flattens a manifest into one line per node, each naming its full path so that lines can be
/// compared independently of their position.
fn flatten(manifest: &Manifest) -> BTreeSet<String> {
    fn walk(path: &str, dir: &ManifestDirectory, out: &mut BTreeSet<String>) {
        for (name, node) in &dir.entries {
            let full = join_path(path, name);
            match node {
                ManifestNode::File(file) => {
                    out.insert(format!(
                        "{} {} {} {} /{full}",
                        if file.executable { 'X' } else { 'F' },
                        file.digest,
                        file.mtime,
                        file.size
                    ));
                }
                ManifestNode::Symlink(symlink) => {
                    out.insert(format!("S {} {} /{full}", symlink.digest, symlink.size));
                }
                ManifestNode::Directory(child) => {
                    out.insert(format!("D /{full}"));
                    walk(&full, child, out);
                }
            }
        }
    }

    let mut out = BTreeSet::new();
    walk("", manifest.root(), &mut out);
    out
}

impl Manifest {
    /// Compares this manifest, the expected one, with `actual`.
    pub fn diff(&self, actual: &Manifest) -> ManifestDiff {
        let expected = flatten(self);
        let actual = flatten(actual);
        ManifestDiff {
            added: actual.difference(&expected).cloned().collect(),
            removed: expected.difference(&actual).cloned().collect(),
        }
    }
}
