//! Data-only media stack
//!
//! The CLI has no audio or video. Peers still run a two-step offer/answer
//! handshake over `WEBRTC_SIGNAL` so each side learns the other's stream
//! ID, which is what the engine reports as a remote stream.

use peercoord_core::{Error, MediaSink, MediaStack, Negotiation, PeerId, RemoteStream, Result};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

const STREAM_LABEL: &str = "data";

#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "step", rename_all = "lowercase")]
enum Handshake {
    Offer { stream: Uuid },
    Answer { stream: Uuid },
}

#[derive(Debug, Default)]
pub struct HandshakeMedia;

impl MediaStack for HandshakeMedia {
    fn negotiate(
        &self,
        _peer: &PeerId,
        initiator: bool,
        sink: MediaSink,
    ) -> Result<Box<dyn Negotiation>> {
        let negotiation = HandshakeNegotiation {
            local_stream: Uuid::new_v4(),
            sink,
            done: false,
        };
        if initiator {
            negotiation.send(&Handshake::Offer {
                stream: negotiation.local_stream,
            })?;
        }
        Ok(Box::new(negotiation))
    }
}

struct HandshakeNegotiation {
    local_stream: Uuid,
    sink: MediaSink,
    done: bool,
}

impl HandshakeNegotiation {
    fn send(&self, step: &Handshake) -> Result<()> {
        self.sink.signal(serde_json::to_vec(step)?);
        Ok(())
    }

    fn complete(&mut self, remote: Uuid) {
        self.done = true;
        self.sink.stream(RemoteStream {
            id: remote.to_string(),
            label: STREAM_LABEL.to_string(),
        });
    }
}

impl Negotiation for HandshakeNegotiation {
    fn apply_signal(&mut self, payload: &[u8]) -> Result<()> {
        let step: Handshake = serde_json::from_slice(payload).map_err(|e| Error::Signaling {
            peer: self.sink.peer().clone(),
            reason: format!("bad handshake: {}", e),
        })?;

        if self.done {
            tracing::debug!(peer = %self.sink.peer(), ?step, "Handshake already complete");
            return Ok(());
        }

        match step {
            Handshake::Offer { stream } => {
                self.send(&Handshake::Answer {
                    stream: self.local_stream,
                })?;
                self.complete(stream);
            }
            Handshake::Answer { stream } => self.complete(stream),
        }
        Ok(())
    }

    fn stop(&mut self) {
        self.done = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_handshake_wire_format() {
        let stream = Uuid::nil();
        let bytes = serde_json::to_vec(&Handshake::Offer { stream }).unwrap();
        assert_eq!(
            String::from_utf8(bytes).unwrap(),
            r#"{"step":"offer","stream":"00000000-0000-0000-0000-000000000000"}"#
        );
    }

    #[test]
    fn test_garbage_rejected() {
        assert!(serde_json::from_slice::<Handshake>(b"offer").is_err());
        assert!(serde_json::from_slice::<Handshake>(br#"{"step":"bye"}"#).is_err());
    }
}
