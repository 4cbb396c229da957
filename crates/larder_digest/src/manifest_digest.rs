use std::{fmt, str::FromStr};

use crate::ManifestFormat;

/// An error that can occur when parsing a manifest digest id.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ParseManifestDigestError {
    /// The id does not start with the prefix of a supported format.
    #[error("'{0}' does not use a supported manifest digest format")]
    UnknownFormat(String),

    /// The value part of the id is not a valid encoding for its format.
    #[error("'{1}' is not a valid {0} digest value")]
    InvalidValue(ManifestFormat, String),
}

/// Identifies an implementation by the digests of its manifest.
///
/// The same implementation may be known under several algorithm generations at once (for
/// instance when a feed lists both a legacy and a current digest). Two digests identify the same
/// implementation if they are [compatible](ManifestDigest::is_compatible).
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ManifestDigest {
    #[cfg_attr(
        feature = "serde",
        serde(default, skip_serializing_if = "Option::is_none")
    )]
    sha256new: Option<String>,
    #[cfg_attr(
        feature = "serde",
        serde(default, skip_serializing_if = "Option::is_none")
    )]
    sha256: Option<String>,
    #[cfg_attr(
        feature = "serde",
        serde(default, skip_serializing_if = "Option::is_none")
    )]
    sha1new: Option<String>,
}

impl ManifestDigest {
    /// Creates a digest that contains a single validated value.
    pub fn from_value(
        format: ManifestFormat,
        value: impl Into<String>,
    ) -> Result<Self, ParseManifestDigestError> {
        let mut digest = Self::default();
        digest.insert(format, value)?;
        Ok(digest)
    }

    /// Parses a list of ids. Ids in formats this crate does not know are skipped so that digests
    /// published with newer algorithms remain usable through the ones that are understood.
    pub fn from_ids<'a>(
        ids: impl IntoIterator<Item = &'a str>,
    ) -> Result<Self, ParseManifestDigestError> {
        let mut digest = Self::default();
        for id in ids {
            match ManifestFormat::split_id(id) {
                Some((format, value)) => digest.insert(format, value)?,
                None => tracing::debug!("skipping manifest digest in unknown format '{id}'"),
            }
        }
        Ok(digest)
    }

    /// Sets the value for `format`, replacing an existing one.
    pub fn insert(
        &mut self,
        format: ManifestFormat,
        value: impl Into<String>,
    ) -> Result<(), ParseManifestDigestError> {
        let value = value.into();
        if !format.is_valid_value(&value) {
            return Err(ParseManifestDigestError::InvalidValue(format, value));
        }
        *self.slot_mut(format) = Some(value);
        Ok(())
    }

    /// Returns the value for `format` if present.
    pub fn get(&self, format: ManifestFormat) -> Option<&str> {
        match format {
            ManifestFormat::Sha256New => self.sha256new.as_deref(),
            ManifestFormat::Sha256 => self.sha256.as_deref(),
            ManifestFormat::Sha1New => self.sha1new.as_deref(),
        }
    }

    fn slot_mut(&mut self, format: ManifestFormat) -> &mut Option<String> {
        match format {
            ManifestFormat::Sha256New => &mut self.sha256new,
            ManifestFormat::Sha256 => &mut self.sha256,
            ManifestFormat::Sha1New => &mut self.sha1new,
        }
    }

    /// Iterates over all present values in order of preference.
    pub fn iter(&self) -> impl Iterator<Item = (ManifestFormat, &str)> + '_ {
        ManifestFormat::ALL
            .into_iter()
            .filter_map(move |format| self.get(format).map(|value| (format, value)))
    }

    /// Returns true if no value is present, in which case the digest cannot identify anything.
    pub fn is_empty(&self) -> bool {
        self.iter().next().is_none()
    }

    /// The most preferred format and its value.
    pub fn best(&self) -> Option<(ManifestFormat, &str)> {
        self.iter().next()
    }

    /// The id of the most preferred value. This is the name of the directory an implementation is
    /// stored in.
    pub fn best_id(&self) -> Option<String> {
        self.best().map(|(format, value)| format.id(value))
    }

    /// All ids in order of preference.
    pub fn ids(&self) -> impl Iterator<Item = String> + '_ {
        self.iter().map(|(format, value)| format.id(value))
    }

    /// Returns true if both digests share at least one value of the same format.
    pub fn is_compatible(&self, other: &ManifestDigest) -> bool {
        self.iter()
            .any(|(format, value)| other.get(format) == Some(value))
    }
}

impl FromStr for ManifestDigest {
    type Err = ParseManifestDigestError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (format, value) = ManifestFormat::split_id(s)
            .ok_or_else(|| ParseManifestDigestError::UnknownFormat(s.to_string()))?;
        Self::from_value(format, value)
    }
}

impl fmt::Display for ManifestDigest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.best() {
            Some((format, value)) => write!(f, "{}", format.id(value)),
            None => f.write_str("<empty digest>"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    const SHA256: &str = "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855";
    const SHA1: &str = "da39a3ee5e6b4b0d3255bfef95601890afd80709";

    fn sha256new() -> String {
        ManifestFormat::Sha256New.digest_manifest(b"")
    }

    #[test]
    fn test_best_prefers_newest_format() {
        let digest = ManifestDigest::from_ids([
            format!("sha1new={SHA1}").as_str(),
            format!("sha256={SHA256}").as_str(),
        ])
        .unwrap();
        assert_eq!(digest.best(), Some((ManifestFormat::Sha256, SHA256)));
        assert_eq!(
            digest.ids().collect::<Vec<_>>(),
            vec![format!("sha256={SHA256}"), format!("sha1new={SHA1}")]
        );
    }

    #[test]
    fn test_parse_and_display_round_trip() {
        let id = format!("sha256new_{}", sha256new());
        let digest: ManifestDigest = id.parse().unwrap();
        assert_eq!(digest.to_string(), id);

        // The `=` separator is accepted for every format.
        let digest: ManifestDigest = format!("sha256new={}", sha256new()).parse().unwrap();
        assert_eq!(digest.best_id().unwrap(), id);
    }

    #[rstest]
    #[case("sha1=abc")]
    #[case("md5=d41d8cd98f00b204e9800998ecf8427e")]
    #[case("_temp12345")]
    fn test_unknown_format(#[case] id: &str) {
        assert!(matches!(
            id.parse::<ManifestDigest>(),
            Err(ParseManifestDigestError::UnknownFormat(_))
        ));
    }

    #[rstest]
    #[case("sha256=XYZ")]
    #[case("sha256new_e3b0c44298fc1c149afbf4c8996fb924")]
    #[case("sha1new=DA39A3EE5E6B4B0D3255BFEF95601890AFD80709")]
    fn test_invalid_value(#[case] id: &str) {
        assert!(matches!(
            id.parse::<ManifestDigest>(),
            Err(ParseManifestDigestError::InvalidValue(_, _))
        ));
    }

    #[test]
    fn test_compatibility() {
        let a = ManifestDigest::from_value(ManifestFormat::Sha256, SHA256).unwrap();
        let mut b = ManifestDigest::from_value(ManifestFormat::Sha1New, SHA1).unwrap();
        assert!(!a.is_compatible(&b));

        b.insert(ManifestFormat::Sha256, SHA256).unwrap();
        assert!(a.is_compatible(&b));
        assert!(b.is_compatible(&a));
        assert_ne!(a, b);
    }

    #[test]
    fn test_unknown_ids_are_skipped() {
        let digest =
            ManifestDigest::from_ids(["sha512=whatever", format!("sha256={SHA256}").as_str()])
                .unwrap();
        assert_eq!(digest.best(), Some((ManifestFormat::Sha256, SHA256)));

        let empty = ManifestDigest::from_ids(["sha512=whatever"]).unwrap();
        assert!(empty.is_empty());
        assert_eq!(empty.best_id(), None);
    }

    #[cfg(feature = "serde")]
    #[test]
    fn test_serde() {
        let digest = ManifestDigest::from_value(ManifestFormat::Sha256, SHA256).unwrap();
        let json = serde_json::to_string(&digest).unwrap();
        assert_eq!(json, format!(r#"{{"sha256":"{SHA256}"}}"#));
        assert_eq!(
            serde_json::from_str::<ManifestDigest>(&json).unwrap(),
            digest
        );
    }
}
