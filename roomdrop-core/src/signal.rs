//! Relay wire envelopes. JSON text messages of the form `{"event": name, "data": payload}`.
//!
//! Negotiation blobs (`sdp`, `candidate`) are opaque JSON; the relay never looks inside.

use serde::{Deserialize, Serialize};

use crate::room::{ConnectionId, RoomId};

/// Opaque negotiation payload produced and consumed by a Peer Link.
pub type Blob = serde_json::Value;

/// Envelopes a client sends to the relay.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "kebab-case")]
pub enum ClientSignal {
    JoinRoom(RoomId),
    Offer { target: ConnectionId, sdp: Blob },
    Answer { target: ConnectionId, sdp: Blob },
    IceCandidate { target: ConnectionId, candidate: Blob },
}

/// Envelopes the relay sends to a client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "kebab-case")]
pub enum RelaySignal {
    /// Sent once to a fresh socket: its own connection id.
    Connected(ConnectionId),
    /// A new member joined one of this socket's rooms.
    UserConnected(ConnectionId),
    Offer { sdp: Blob, caller: ConnectionId },
    Answer { sdp: Blob, responder: ConnectionId },
    IceCandidate { candidate: Blob, sender: ConnectionId },
}

impl ClientSignal {
    pub fn to_text(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn from_text(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }

    /// Addressee of a forwarded envelope; `None` for `JoinRoom`.
    pub fn target(&self) -> Option<&ConnectionId> {
        match self {
            ClientSignal::JoinRoom(_) => None,
            ClientSignal::Offer { target, .. }
            | ClientSignal::Answer { target, .. }
            | ClientSignal::IceCandidate { target, .. } => Some(target),
        }
    }

    /// Strip `target` and stamp the sender, as the relay does when forwarding.
    /// Returns the target and the envelope it receives; `None` for `JoinRoom`.
    pub fn into_forwarded(self, from: ConnectionId) -> Option<(ConnectionId, RelaySignal)> {
        match self {
            ClientSignal::JoinRoom(_) => None,
            ClientSignal::Offer { target, sdp } => {
                Some((target, RelaySignal::Offer { sdp, caller: from }))
            }
            ClientSignal::Answer { target, sdp } => Some((
                target,
                RelaySignal::Answer {
                    sdp,
                    responder: from,
                },
            )),
            ClientSignal::IceCandidate { target, candidate } => Some((
                target,
                RelaySignal::IceCandidate {
                    candidate,
                    sender: from,
                },
            )),
        }
    }
}

impl RelaySignal {
    pub fn to_text(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn from_text(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn join_room_shape() {
        let msg = ClientSignal::JoinRoom(RoomId::parse("abc123").unwrap());
        let v: serde_json::Value = serde_json::from_str(&msg.to_text().unwrap()).unwrap();
        assert_eq!(v, json!({"event": "join-room", "data": "abc123"}));
    }

    #[test]
    fn join_with_empty_room_is_malformed() {
        assert!(ClientSignal::from_text(r#"{"event":"join-room","data":""}"#).is_err());
    }

    #[test]
    fn offer_shape_and_parse() {
        let text = r#"{"event":"offer","data":{"target":"y","sdp":{"type":"offer","k":[1,2]}}}"#;
        let msg = ClientSignal::from_text(text).unwrap();
        assert_eq!(
            msg,
            ClientSignal::Offer {
                target: ConnectionId::new("y"),
                sdp: json!({"type": "offer", "k": [1, 2]}),
            }
        );
    }

    #[test]
    fn relay_event_names() {
        let v = serde_json::to_value(RelaySignal::UserConnected(ConnectionId::new("x"))).unwrap();
        assert_eq!(v, json!({"event": "user-connected", "data": "x"}));
        let v = serde_json::to_value(RelaySignal::IceCandidate {
            candidate: json!("c"),
            sender: ConnectionId::new("x"),
        })
        .unwrap();
        assert_eq!(
            v,
            json!({"event": "ice-candidate", "data": {"candidate": "c", "sender": "x"}})
        );
    }

    #[test]
    fn forwarding_replaces_target_with_sender() {
        let sdp = json!({"blob": "opaque"});
        let (to, fwd) = ClientSignal::Answer {
            target: ConnectionId::new("x"),
            sdp: sdp.clone(),
        }
        .into_forwarded(ConnectionId::new("y"))
        .unwrap();
        assert_eq!(to, ConnectionId::new("x"));
        assert_eq!(
            fwd,
            RelaySignal::Answer {
                sdp,
                responder: ConnectionId::new("y")
            }
        );
    }

    #[test]
    fn unknown_event_is_rejected() {
        assert!(ClientSignal::from_text(r#"{"event":"leave","data":"r"}"#).is_err());
        assert!(ClientSignal::from_text("not json").is_err());
    }
}
