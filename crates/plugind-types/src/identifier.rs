use std::fmt;

use serde::{Deserialize, Serialize};

/// Minimum length of the hex checksum segment of a [`PluginUniqueIdentifier`].
pub const MIN_CHECKSUM_LEN: usize = 32;

/// The stable external name of one specific build of a plugin:
/// `author/name:semver@hex-checksum`.
///
/// `author` is optional — a bare `name:semver@checksum` is also accepted, in
/// which case [`PluginUniqueIdentifier::author`] returns the empty string and
/// [`PluginUniqueIdentifier::plugin_id`] returns just `name`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(into = "String")]
pub struct PluginUniqueIdentifier {
    author: String,
    name: String,
    version: String,
    checksum: String,
}

#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum IdentifierParseError {
    #[error("identifier is missing the '@checksum' segment: {0:?}")]
    MissingChecksum(String),
    #[error("checksum must be at least {min} hex characters, got {got}: {0:?}", min = MIN_CHECKSUM_LEN)]
    ChecksumTooShort(String, usize),
    #[error("checksum contains non-hex characters: {0:?}")]
    ChecksumNotHex(String),
    #[error("identifier is missing the ':version' segment: {0:?}")]
    MissingVersion(String),
    #[error("plugin name segment is empty: {0:?}")]
    EmptyName(String),
}

impl PluginUniqueIdentifier {
    /// Parses `author/name:semver@checksum` or `name:semver@checksum`.
    pub fn parse(s: &str) -> Result<Self, IdentifierParseError> {
        let (rest, checksum) = s
            .rsplit_once('@')
            .ok_or_else(|| IdentifierParseError::MissingChecksum(s.to_string()))?;

        if checksum.len() < MIN_CHECKSUM_LEN {
            return Err(IdentifierParseError::ChecksumTooShort(
                s.to_string(),
                checksum.len(),
            ));
        }
        if !checksum.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(IdentifierParseError::ChecksumNotHex(s.to_string()));
        }

        let (plugin_id_part, version) = rest
            .split_once(':')
            .ok_or_else(|| IdentifierParseError::MissingVersion(s.to_string()))?;

        let (author, name) = match plugin_id_part.split_once('/') {
            Some((author, name)) => (author.to_string(), name.to_string()),
            None => (String::new(), plugin_id_part.to_string()),
        };

        if name.is_empty() {
            return Err(IdentifierParseError::EmptyName(s.to_string()));
        }

        Ok(Self {
            author,
            name,
            version: version.to_string(),
            checksum: checksum.to_string(),
        })
    }

    pub fn author(&self) -> &str {
        &self.author
    }

    /// `author/name`, or just `name` when no author was present.
    pub fn plugin_id(&self) -> String {
        if self.author.is_empty() {
            self.name.clone()
        } else {
            format!("{}/{}", self.author, self.name)
        }
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    pub fn checksum(&self) -> &str {
        &self.checksum
    }
}

impl fmt::Display for PluginUniqueIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}@{}", self.plugin_id(), self.version, self.checksum)
    }
}

impl From<PluginUniqueIdentifier> for String {
    fn from(id: PluginUniqueIdentifier) -> Self {
        id.to_string()
    }
}

impl<'de> Deserialize<'de> for PluginUniqueIdentifier {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        PluginUniqueIdentifier::parse(&raw).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_author_name_version_checksum() {
        let id = PluginUniqueIdentifier::parse(
            "mlchain/test:1.0.0@1234567890abcdef1234567890abcdef1234567890abcdef",
        )
        .unwrap();
        assert_eq!(id.author(), "mlchain");
        assert_eq!(id.plugin_id(), "mlchain/test");
        assert_eq!(id.version(), "1.0.0");
        assert_eq!(
            id.checksum(),
            "1234567890abcdef1234567890abcdef1234567890abcdef"
        );
    }

    #[test]
    fn author_is_optional() {
        let id = PluginUniqueIdentifier::parse(
            "test:1.0.0@1234567890abcdef1234567890abcdef1234567890abcdef",
        )
        .unwrap();
        assert_eq!(id.author(), "");
        assert_eq!(id.plugin_id(), "test");
    }

    #[test]
    fn rejects_missing_colon() {
        let err = PluginUniqueIdentifier::parse(
            "1.0.0@1234567890abcdef1234567890abcdef1234567890abcdef",
        );
        assert!(matches!(err, Err(IdentifierParseError::MissingVersion(_))));
    }

    #[test]
    fn rejects_missing_at() {
        let err =
            PluginUniqueIdentifier::parse("1234567890abcdef1234567890abcdef1234567890abcdef");
        assert!(matches!(err, Err(IdentifierParseError::MissingChecksum(_))));
    }

    #[test]
    fn rejects_short_checksum() {
        let err = PluginUniqueIdentifier::parse("mlchain/test:1.0.0@123456");
        assert!(matches!(
            err,
            Err(IdentifierParseError::ChecksumTooShort(_, 6))
        ));
    }

    #[test]
    fn rejects_missing_checksum_entirely() {
        let err = PluginUniqueIdentifier::parse("mlchain/test:1.0.0");
        assert!(matches!(err, Err(IdentifierParseError::MissingChecksum(_))));
    }

    #[test]
    fn round_trips_through_display() {
        for s in [
            "mlchain/test:1.0.0@1234567890abcdef1234567890abcdef1234567890abcdef",
            "test:2.3.4@abcdefabcdefabcdefabcdefabcdefabcdef",
        ] {
            let id = PluginUniqueIdentifier::parse(s).unwrap();
            assert_eq!(id.to_string(), s);
        }
    }

    #[test]
    fn equality_is_byte_equality() {
        let a = PluginUniqueIdentifier::parse(
            "mlchain/test:1.0.0@1234567890abcdef1234567890abcdef1234567890abcdef",
        )
        .unwrap();
        let b = PluginUniqueIdentifier::parse(
            "mlchain/test:1.0.0@1234567890abcdef1234567890abcdef1234567890abcdef",
        )
        .unwrap();
        assert_eq!(a, b);
    }
}
