use std::fmt;

use serde::{Deserialize, Serialize};

/// Identifier of an entity or set element, unique within its container.
pub type ReferenceId = String;

/// Name of a field inside an entity.
pub type FieldName = String;

/// A participant that mints versions in a [`VersionMap`](crate::VersionMap).
///
/// Proxies, stores and drivers each write under their own actor. Actors are
/// opaque strings compared by value.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Actor(String);

impl Actor {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Actor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Actor({})", self.0)
    }
}

impl fmt::Display for Actor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Actor {
    fn from(name: &str) -> Self {
        Self(name.to_string())
    }
}

impl From<String> for Actor {
    fn from(name: String) -> Self {
        Self(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn actor_serializes_as_plain_string() {
        let actor = Actor::from("writer-1");
        let json = serde_json::to_string(&actor).unwrap();
        assert_eq!(json, "\"writer-1\"");
        let back: Actor = serde_json::from_str(&json).unwrap();
        assert_eq!(back, actor);
    }

    #[test]
    fn actor_ordering_is_lexicographic() {
        assert!(Actor::from("a") < Actor::from("b"));
        assert_eq!(format!("{}", Actor::new("me")), "me");
    }
}
