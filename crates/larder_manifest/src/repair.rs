//! Recovery from shifted modification times.
//!
//! Some filesystems and archive tools store timestamps in local time, so an implementation that
//! was unpacked in a different time zone can have every mtime off by a whole number of quarter
//! hours. Such a tree still has the right content; only its manifest differs.

use crate::{Manifest, ManifestDirectory, ManifestDigest, ManifestNode};

/// The largest offset, in seconds, that is tried when repairing timestamps.
pub const MAX_TIME_OFFSET: i64 = 27 * 60 * 60;

/// The distance, in seconds, between two tried offsets.
pub const TIME_OFFSET_STEP: i64 = 15 * 60;

/// Returns the non-zero offsets to try, nearest first and the positive offset before the negative
/// one of the same magnitude.
pub fn time_offsets() -> impl Iterator<Item = i64> {
    (1..=MAX_TIME_OFFSET / TIME_OFFSET_STEP)
        .flat_map(|step| [step * TIME_OFFSET_STEP, -step * TIME_OFFSET_STEP])
}

impl Manifest {
    /// Returns a copy of this manifest with `offset` seconds added to the mtime of every file.
    pub fn with_time_offset(&self, offset: i64) -> Manifest {
        fn shift(dir: &mut ManifestDirectory, offset: i64) {
            for node in dir.entries.values_mut() {
                match node {
                    ManifestNode::File(file) => file.mtime += offset,
                    ManifestNode::Directory(child) => shift(child, offset),
                    ManifestNode::Symlink(_) => {}
                }
            }
        }

        let mut shifted = self.clone();
        shift(&mut shifted.root, offset);
        shifted
    }

    /// Finds the offset that, added to every file mtime, makes this manifest match `expected`.
    ///
    /// The unshifted manifest is tried first. A manifest without files can only ever match
    /// without an offset, so no others are tried for it.
    pub fn find_time_offset(&self, expected: &ManifestDigest) -> Option<i64> {
        let value = expected.get(self.format)?;
        if self.digest_value() == value {
            return Some(0);
        }
        if self.files().is_empty() {
            return None;
        }

        let found =
            time_offsets().find(|offset| self.with_time_offset(*offset).digest_value() == value);
        if let Some(offset) = found {
            tracing::debug!("manifest matches {expected} with a time offset of {offset}s");
        }
        found
    }
}
