//! Control message types exchanged over the transport
//!
//! Every message travels as a `(type, payload)` pair. Payloads are JSON,
//! except `HOST_GOODBYE` (empty) and `WEBRTC_SIGNAL` (opaque bytes).
//! Any type not listed here is an application message.

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::models::{CapabilitySample, PeerId, Room};

pub const ROOM_INFO: &str = "ROOM_INFO";
pub const SPEC_DATA: &str = "SPEC_DATA";
pub const NEXT_HOST_UPDATE: &str = "NEXT_HOST_UPDATE";
pub const HOST_GOODBYE: &str = "HOST_GOODBYE";
pub const WEBRTC_SIGNAL: &str = "WEBRTC_SIGNAL";

/// Message types reserved for the engine
pub const CONTROL_TYPES: [&str; 5] = [
    ROOM_INFO,
    SPEC_DATA,
    NEXT_HOST_UPDATE,
    HOST_GOODBYE,
    WEBRTC_SIGNAL,
];

pub fn is_control_type(kind: &str) -> bool {
    CONTROL_TYPES.contains(&kind)
}

/// `ROOM_INFO` payload: the room snapshot plus the sender's view of the host
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomInfo {
    #[serde(flatten)]
    pub room: Room,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host_id: Option<PeerId>,
}

/// Decoded control message
#[derive(Debug, Clone, PartialEq)]
pub enum ControlMessage {
    RoomInfo(RoomInfo),
    SpecData(CapabilitySample),
    NextHostUpdate(PeerId),
    HostGoodbye,
    WebrtcSignal(Vec<u8>),
}

impl ControlMessage {
    /// Wire type tag
    pub fn kind(&self) -> &'static str {
        match self {
            ControlMessage::RoomInfo(_) => ROOM_INFO,
            ControlMessage::SpecData(_) => SPEC_DATA,
            ControlMessage::NextHostUpdate(_) => NEXT_HOST_UPDATE,
            ControlMessage::HostGoodbye => HOST_GOODBYE,
            ControlMessage::WebrtcSignal(_) => WEBRTC_SIGNAL,
        }
    }

    /// Encode the payload
    pub fn to_payload(&self) -> Result<Vec<u8>> {
        let payload = match self {
            ControlMessage::RoomInfo(info) => serde_json::to_vec(info)?,
            ControlMessage::SpecData(sample) => serde_json::to_vec(sample)?,
            ControlMessage::NextHostUpdate(candidate) => serde_json::to_vec(candidate)?,
            ControlMessage::HostGoodbye => Vec::new(),
            ControlMessage::WebrtcSignal(blob) => blob.clone(),
        };
        Ok(payload)
    }

    /// Decode a received message
    ///
    /// Returns `Ok(None)` for application message types. A control type
    /// whose payload does not match its expected shape is an
    /// `Error::MalformedMessage`.
    pub fn parse(kind: &str, payload: &[u8]) -> Result<Option<Self>> {
        let msg = match kind {
            ROOM_INFO => ControlMessage::RoomInfo(decode(kind, payload)?),
            SPEC_DATA => {
                let sample: CapabilitySample = decode(kind, payload)?;
                ControlMessage::SpecData(sample.validated()?)
            }
            NEXT_HOST_UPDATE => {
                let candidate: PeerId = decode(kind, payload)?;
                if candidate.as_str().is_empty() {
                    return Err(Error::malformed(kind, "empty candidate id"));
                }
                ControlMessage::NextHostUpdate(candidate)
            }
            // Goodbye carries nothing; whatever is attached is ignored
            HOST_GOODBYE => ControlMessage::HostGoodbye,
            WEBRTC_SIGNAL => {
                if payload.is_empty() {
                    return Err(Error::malformed(kind, "empty signaling payload"));
                }
                ControlMessage::WebrtcSignal(payload.to_vec())
            }
            _ => return Ok(None),
        };
        Ok(Some(msg))
    }
}

fn decode<T: for<'de> Deserialize<'de>>(kind: &str, payload: &[u8]) -> Result<T> {
    serde_json::from_slice(payload).map_err(|e| Error::malformed(kind, e.to_string()))
}
