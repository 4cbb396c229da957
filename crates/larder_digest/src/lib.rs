#![deny(missing_docs)]

//! Hashing primitives shared by the larder crates.
//!
//! An implementation in a larder store is identified by a [`ManifestDigest`]: a set of
//! algorithm-tagged hash values of the implementation's manifest. Every algorithm generation is
//! described by a [`ManifestFormat`], which knows how to hash file contents, how to hash a
//! serialized manifest and how to encode the result as text.
//!
//! # Examples
//!
//! ```
//! use larder_digest::{ManifestDigest, ManifestFormat};
//!
//! let value = ManifestFormat::Sha256New.digest_manifest(b"F 3 1 1 a\n");
//! let digest = ManifestDigest::from_value(ManifestFormat::Sha256New, value).unwrap();
//! assert!(digest.best_id().unwrap().starts_with("sha256new_"));
//! ```
//!
//! File contents are hashed while they are written with a [`HashingWriter`], so content never has
//! to be read twice.

mod format;
mod manifest_digest;

use std::io::Write;

pub use format::{ContentHasher, ManifestFormat};
pub use manifest_digest::{ManifestDigest, ParseManifestDigestError};

/// A simple object that provides a [`Write`] implementation that also immediately hashes the bytes
/// written to it with the content hash of a [`ManifestFormat`]. Call [`HashingWriter::finalize`]
/// to retrieve both the original `impl Write` object as well as the hex encoded hash.
pub struct HashingWriter<W> {
    writer: W,
    hasher: ContentHasher,
    written: u64,
}

impl<W> HashingWriter<W> {
    /// Constructs a new instance from a writer and a new (empty) hasher for `format`.
    pub fn new(writer: W, format: ManifestFormat) -> Self {
        Self {
            writer,
            hasher: format.content_hasher(),
            written: 0,
        }
    }

    /// The number of bytes written so far.
    pub fn bytes_written(&self) -> u64 {
        self.written
    }

    /// Consumes this instance and returns the original writer and the lower-case hex encoded
    /// hash of all bytes written to this instance.
    pub fn finalize(self) -> (W, String) {
        (self.writer, self.hasher.finalize_hex())
    }
}

impl<W: Write> Write for HashingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let bytes = self.writer.write(buf)?;
        self.hasher.update(&buf[..bytes]);
        self.written += bytes as u64;
        Ok(bytes)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.writer.flush()
    }
}

#[cfg(test)]
mod test {
    use super::{HashingWriter, ManifestFormat};
    use rstest::rstest;
    use std::io::Write;

    #[rstest]
    #[case(
        ManifestFormat::Sha256,
        "Hello, world!",
        "315f5bdb76d078c43b8ac0064e4a0164612b1fce77c869345bfc94c75894edd3"
    )]
    #[case(
        ManifestFormat::Sha1New,
        "Hello, world!",
        "943a702d06f34599aee1f8da8ef9f7296031d699"
    )]
    fn test_hashing_writer(
        #[case] format: ManifestFormat,
        #[case] input: &str,
        #[case] expected_hash: &str,
    ) {
        let mut writer = HashingWriter::new(Vec::new(), format);
        writer.write_all(input.as_bytes()).unwrap();
        assert_eq!(writer.bytes_written(), input.len() as u64);
        let (written, hash) = writer.finalize();
        assert_eq!(written, input.as_bytes());
        assert_eq!(hash, expected_hash);
    }
}
