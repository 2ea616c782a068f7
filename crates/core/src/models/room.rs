//! Room and peer identity models

use serde::{Deserialize, Serialize};

/// A coordination namespace shared by a set of peers
///
/// The secret token is handed to the transport as pre-shared
/// authentication material. A room is immutable for the lifetime
/// of a session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Room {
    pub id: String,
    pub name: String,
    pub secret_token: String,
}

impl Room {
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        secret_token: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            secret_token: secret_token.into(),
        }
    }
}

/// Opaque peer identifier assigned by the transport
///
/// Unique per connected peer per room. A peer that reconnects may get a
/// new ID, so every ID is treated as a distinct peer. Ordering is plain
/// lexicographic order on the underlying string and is only used for
/// deterministic tie-breaks.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PeerId(String);

impl PeerId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for PeerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for PeerId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl From<String> for PeerId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_room_field_names() {
        let room = Room::new("r1", "Standup", "s3cret");
        let json = serde_json::to_value(&room).unwrap();

        assert_eq!(json["id"], "r1");
        assert_eq!(json["name"], "Standup");
        assert_eq!(json["secretToken"], "s3cret");
    }

    #[test]
    fn test_peer_id_is_plain_string_on_wire() {
        let peer = PeerId::from("peer-a");
        assert_eq!(serde_json::to_string(&peer).unwrap(), "\"peer-a\"");
    }

    #[test]
    fn test_peer_id_ordering_is_lexicographic() {
        assert!(PeerId::from("B") < PeerId::from("C"));
        assert!(PeerId::from("10") < PeerId::from("9"));
    }
}
