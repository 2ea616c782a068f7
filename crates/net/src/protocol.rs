//! Relay protocol message types
//!
//! All messages are JSON-serialized and length-prefixed on the wire.
//! Opaque payloads travel as base64 strings.

use peercoord_core::PeerId;
use serde::{Deserialize, Serialize};

/// Relay protocol messages
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum RelayMessage {
    /// Client asks to enter a room
    Join { room_id: String, token: String },

    /// Relay accepted the join and assigned a peer ID
    Joined { peer_id: PeerId, peers: Vec<PeerId> },

    /// Relay refused the join
    JoinRejected { reason: String },

    /// Client sends to every other peer in its room
    Broadcast {
        kind: String,
        #[serde(with = "base64_bytes")]
        payload: Vec<u8>,
    },

    /// Client sends to one peer in its room
    Unicast {
        to: PeerId,
        kind: String,
        #[serde(with = "base64_bytes")]
        payload: Vec<u8>,
    },

    /// Relay forwards a message from another peer
    Deliver {
        from: PeerId,
        kind: String,
        #[serde(with = "base64_bytes")]
        payload: Vec<u8>,
    },

    NodeAvailable { peer_id: PeerId },

    NodeUnavailable { peer_id: PeerId },

    /// Client is leaving its room
    Leave,
}

impl RelayMessage {
    /// Serialize message to JSON bytes
    pub fn to_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    /// Deserialize message from JSON bytes
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }
}

mod base64_bytes {
    use base64::{engine::general_purpose::STANDARD, Engine as _};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD
            .decode(encoded)
            .map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_payload_travels_as_base64() {
        let msg = RelayMessage::Deliver {
            from: PeerId::from("a"),
            kind: "WEBRTC_SIGNAL".to_string(),
            payload: vec![0, 159, 146, 150],
        };

        let json: serde_json::Value = serde_json::from_slice(&msg.to_bytes().unwrap()).unwrap();
        assert_eq!(json["type"], "Deliver");
        assert_eq!(json["from"], "a");
        assert_eq!(json["payload"], "AJ+Slg==");

        let decoded = RelayMessage::from_bytes(&msg.to_bytes().unwrap()).unwrap();
        assert_eq!(decoded, msg);
    }

    #[test]
    fn test_invalid_base64_rejected() {
        let raw = br#"{"type":"Broadcast","kind":"CHAT","payload":"not base64!"}"#;
        assert!(RelayMessage::from_bytes(raw).is_err());
    }

    #[test]
    fn test_unit_variant_tag() {
        let bytes = RelayMessage::Leave.to_bytes().unwrap();
        assert_eq!(bytes, br#"{"type":"Leave"}"#.to_vec());
    }
}
