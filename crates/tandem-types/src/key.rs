use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::TypeError;

/// Protocol name of composite reference-mode keys.
pub const REFERENCE_MODE_PROTOCOL: &str = "reference-mode";

/// Address of a storage location, rendered as `protocol://location`.
///
/// The protocol selects the driver that serves the location. Keys are
/// compared and hashed by their parts, so two keys that render identically
/// are the same key.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct StorageKey {
    protocol: String,
    location: String,
}

impl StorageKey {
    pub fn new(protocol: impl Into<String>, location: impl Into<String>) -> Self {
        Self {
            protocol: protocol.into(),
            location: location.into(),
        }
    }

    pub fn protocol(&self) -> &str {
        &self.protocol
    }

    pub fn location(&self) -> &str {
        &self.location
    }

    /// A key nested below this one: `protocol://location/component`.
    pub fn child(&self, component: &str) -> StorageKey {
        let location = if self.location.is_empty() {
            component.to_string()
        } else {
            format!("{}/{}", self.location.trim_end_matches('/'), component)
        };
        StorageKey::new(self.protocol.clone(), location)
    }

    /// Parse a `protocol://location` string.
    pub fn parse(s: &str) -> Result<Self, TypeError> {
        let invalid = |reason: &str| TypeError::InvalidStorageKey {
            key: s.to_string(),
            reason: reason.to_string(),
        };
        let (protocol, location) = s.split_once("://").ok_or_else(|| invalid("missing '://'"))?;
        if protocol.is_empty() {
            return Err(invalid("empty protocol"));
        }
        if !protocol
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        {
            return Err(invalid("protocol must be alphanumeric"));
        }
        Ok(StorageKey::new(protocol, location))
    }

    pub fn is_reference_mode(&self) -> bool {
        self.protocol == REFERENCE_MODE_PROTOCOL
    }
}

impl fmt::Debug for StorageKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "StorageKey({self})")
    }
}

impl fmt::Display for StorageKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}", self.protocol, self.location)
    }
}

impl FromStr for StorageKey {
    type Err = TypeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        StorageKey::parse(s)
    }
}

/// Composite key for stores that keep entities and the collection that
/// references them in two separate locations.
///
/// Rendered as `reference-mode://{<backing>}{<container>}`.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ReferenceModeStorageKey {
    pub backing: StorageKey,
    pub container: StorageKey,
}

impl ReferenceModeStorageKey {
    pub fn new(backing: StorageKey, container: StorageKey) -> Self {
        Self { backing, container }
    }

    /// The plain key form, usable wherever a [`StorageKey`] is expected.
    pub fn to_storage_key(&self) -> StorageKey {
        StorageKey::new(
            REFERENCE_MODE_PROTOCOL,
            format!("{{{}}}{{{}}}", self.backing, self.container),
        )
    }
}

impl fmt::Debug for ReferenceModeStorageKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ReferenceModeStorageKey({self})")
    }
}

impl fmt::Display for ReferenceModeStorageKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_storage_key())
    }
}

impl TryFrom<&StorageKey> for ReferenceModeStorageKey {
    type Error = TypeError;

    fn try_from(key: &StorageKey) -> Result<Self, Self::Error> {
        if !key.is_reference_mode() {
            return Err(TypeError::NotReferenceMode(key.to_string()));
        }
        let invalid = |reason: &str| TypeError::InvalidStorageKey {
            key: key.to_string(),
            reason: reason.to_string(),
        };
        let parts = split_braced(key.location())
            .ok_or_else(|| invalid("expected {backing}{container}"))?;
        match parts.as_slice() {
            [backing, container] => Ok(ReferenceModeStorageKey {
                backing: StorageKey::parse(backing)?,
                container: StorageKey::parse(container)?,
            }),
            _ => Err(invalid("expected exactly two components")),
        }
    }
}

impl FromStr for ReferenceModeStorageKey {
    type Err = TypeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ReferenceModeStorageKey::try_from(&StorageKey::parse(s)?)
    }
}

/// Split `{a}{b}...` into its top-level brace groups.
fn split_braced(s: &str) -> Option<Vec<&str>> {
    let mut parts = Vec::new();
    let mut depth = 0usize;
    let mut start = 0usize;
    for (i, c) in s.char_indices() {
        match c {
            '{' => {
                if depth == 0 {
                    start = i + 1;
                }
                depth += 1;
            }
            '}' => {
                depth = depth.checked_sub(1)?;
                if depth == 0 {
                    parts.push(&s[start..i]);
                }
            }
            _ if depth == 0 => return None,
            _ => {}
        }
    }
    (depth == 0).then_some(parts)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_and_display() {
        let key = StorageKey::parse("volatile://app/people").unwrap();
        assert_eq!(key.protocol(), "volatile");
        assert_eq!(key.location(), "app/people");
        assert_eq!(key.to_string(), "volatile://app/people");
    }

    #[test]
    fn parse_rejects_malformed_keys() {
        assert!(StorageKey::parse("no-separator").is_err());
        assert!(StorageKey::parse("://loc").is_err());
        assert!(StorageKey::parse("bad proto://loc").is_err());
    }

    #[test]
    fn child_appends_component() {
        let key = StorageKey::new("db", "entities");
        assert_eq!(key.child("e1").to_string(), "db://entities/e1");
        assert_eq!(StorageKey::new("db", "").child("x").to_string(), "db://x");
    }

    #[test]
    fn reference_mode_key_roundtrips_through_text() {
        let key = ReferenceModeStorageKey::new(
            StorageKey::new("db", "backing"),
            StorageKey::new("db", "container"),
        );
        let text = key.to_string();
        assert_eq!(text, "reference-mode://{db://backing}{db://container}");
        let parsed: ReferenceModeStorageKey = text.parse().unwrap();
        assert_eq!(parsed, key);
    }

    #[test]
    fn plain_key_is_not_reference_mode() {
        let key = StorageKey::new("volatile", "x");
        assert_eq!(
            ReferenceModeStorageKey::try_from(&key),
            Err(TypeError::NotReferenceMode("volatile://x".into()))
        );
    }

    #[test]
    fn reference_mode_key_requires_two_groups() {
        let key = StorageKey::new(REFERENCE_MODE_PROTOCOL, "{db://a}");
        assert!(ReferenceModeStorageKey::try_from(&key).is_err());
        let key = StorageKey::new(REFERENCE_MODE_PROTOCOL, "{db://a}x{db://b}");
        assert!(ReferenceModeStorageKey::try_from(&key).is_err());
    }
}
