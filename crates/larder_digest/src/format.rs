//! The algorithm generations a manifest can be hashed with.

use std::{fmt, io::Write, str::FromStr};

use digest::Digest;
use sha1::Sha1;
use sha2::Sha256;

use crate::ParseManifestDigestError;

/// A manifest digest algorithm generation.
///
/// The variants are declared in order of preference: when an implementation is known by more
/// than one digest, the first format in this order that is present is used to name its directory
/// in a store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ManifestFormat {
    /// SHA-256 over the manifest, encoded as upper-case base32 without padding.
    Sha256New,

    /// SHA-256 over the manifest, encoded as lower-case hex.
    Sha256,

    /// SHA-1 over the manifest, encoded as lower-case hex. Only kept to be able to verify
    /// implementations published with it.
    Sha1New,
}

impl ManifestFormat {
    /// All supported formats in order of preference.
    pub const ALL: [ManifestFormat; 3] = [
        ManifestFormat::Sha256New,
        ManifestFormat::Sha256,
        ManifestFormat::Sha1New,
    ];

    /// The prefix of digest ids in this format.
    pub fn prefix(self) -> &'static str {
        match self {
            ManifestFormat::Sha256New => "sha256new",
            ManifestFormat::Sha256 => "sha256",
            ManifestFormat::Sha1New => "sha1new",
        }
    }

    /// The character between the prefix and the value of a digest id.
    ///
    /// `sha256new` uses an underscore because its ids double as directory names on filesystems
    /// that do not accept `=`.
    pub fn separator(self) -> char {
        match self {
            ManifestFormat::Sha256New => '_',
            ManifestFormat::Sha256 | ManifestFormat::Sha1New => '=',
        }
    }

    /// Returns a fresh hasher used for file contents and symlink targets.
    pub fn content_hasher(self) -> ContentHasher {
        match self {
            ManifestFormat::Sha256New | ManifestFormat::Sha256 => {
                ContentHasher::Sha256(Sha256::new())
            }
            ManifestFormat::Sha1New => ContentHasher::Sha1(Sha1::new()),
        }
    }

    /// Hashes `bytes` with the content hash and returns it as lower-case hex, the representation
    /// used for entries inside a manifest.
    pub fn hash_content(self, bytes: impl AsRef<[u8]>) -> String {
        let mut hasher = self.content_hasher();
        hasher.update(bytes.as_ref());
        hasher.finalize_hex()
    }

    /// Encodes the raw hash of a manifest as the value part of a digest id.
    pub fn encode_digest(self, hash: &[u8]) -> String {
        match self {
            ManifestFormat::Sha256New => data_encoding::BASE32_NOPAD.encode(hash),
            ManifestFormat::Sha256 | ManifestFormat::Sha1New => hex::encode(hash),
        }
    }

    /// Computes the digest value of a serialized manifest.
    pub fn digest_manifest(self, manifest: impl AsRef<[u8]>) -> String {
        let mut hasher = self.content_hasher();
        hasher.update(manifest.as_ref());
        self.encode_digest(&hasher.finalize())
    }

    /// Formats a digest value as a full id, e.g. `sha256=abc...`.
    pub fn id(self, value: &str) -> String {
        format!("{}{}{}", self.prefix(), self.separator(), value)
    }

    /// Returns true if `value` could have been produced by [`ManifestFormat::encode_digest`].
    pub fn is_valid_value(self, value: &str) -> bool {
        match self {
            ManifestFormat::Sha256New => {
                value.len() == 52
                    && value
                        .bytes()
                        .all(|b| b.is_ascii_uppercase() || (b'2'..=b'7').contains(&b))
            }
            ManifestFormat::Sha256 => value.len() == 64 && is_lower_hex(value),
            ManifestFormat::Sha1New => value.len() == 40 && is_lower_hex(value),
        }
    }

    /// Splits an id like `sha1new=abc` into its format and value, without validating the value.
    pub(crate) fn split_id(id: &str) -> Option<(ManifestFormat, &str)> {
        ManifestFormat::ALL.into_iter().find_map(|format| {
            let rest = id.strip_prefix(format.prefix())?;
            let value = rest.strip_prefix('=').or_else(|| rest.strip_prefix('_'))?;
            Some((format, value))
        })
    }
}

fn is_lower_hex(value: &str) -> bool {
    value
        .bytes()
        .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b))
}

impl fmt::Display for ManifestFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.prefix())
    }
}

impl FromStr for ManifestFormat {
    type Err = ParseManifestDigestError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ManifestFormat::ALL
            .into_iter()
            .find(|format| format.prefix() == s)
            .ok_or_else(|| ParseManifestDigestError::UnknownFormat(s.to_string()))
    }
}

/// The content hash of a [`ManifestFormat`].
///
/// Implements [`Write`] so it can be used as the target of [`std::io::copy`].
#[derive(Clone)]
pub enum ContentHasher {
    /// SHA-1, used by [`ManifestFormat::Sha1New`].
    Sha1(Sha1),
    /// SHA-256, used by [`ManifestFormat::Sha256`] and [`ManifestFormat::Sha256New`].
    Sha256(Sha256),
}

impl ContentHasher {
    /// Feeds more bytes into the hasher.
    pub fn update(&mut self, data: &[u8]) {
        match self {
            ContentHasher::Sha1(hasher) => Digest::update(hasher, data),
            ContentHasher::Sha256(hasher) => Digest::update(hasher, data),
        }
    }

    /// Returns the raw hash.
    pub fn finalize(self) -> Vec<u8> {
        match self {
            ContentHasher::Sha1(hasher) => hasher.finalize().to_vec(),
            ContentHasher::Sha256(hasher) => hasher.finalize().to_vec(),
        }
    }

    /// Returns the hash as lower-case hex.
    pub fn finalize_hex(self) -> String {
        hex::encode(self.finalize())
    }
}

impl Write for ContentHasher {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.update(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}
