//! Wire protocol: the JSON events exchanged over a client connection.
//!
//! Events are internally tagged (`{"event": "send-message", ...}`) so a
//! single WebSocket text frame carries exactly one event. Offer, answer,
//! and ICE candidate payloads are opaque blobs — the coordinator relays
//! them without inspection; only the browser's WebRTC engine interprets
//! them.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ErrorKind;
use crate::history::MessageRecord;
use crate::registry::Identity;

/// Media requested for a call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Audio,
    Video,
}

impl std::fmt::Display for MediaKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MediaKind::Audio => write!(f, "audio"),
            MediaKind::Video => write!(f, "video"),
        }
    }
}

/// Events received from clients.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum ClientEvent {
    /// Claim a username for this connection. Usernames are self-asserted;
    /// a repeat claim from a new connection supersedes the old binding.
    Identify { username: String },

    /// Send a private message. The record is persisted before any
    /// delivery is attempted.
    SendMessage {
        sender: String,
        recipient: String,
        text: String,
    },

    /// Fetch the conversation history between two users.
    FetchHistory { user_a: String, user_b: String },

    /// Ephemeral typing signal toward a recipient.
    StartTyping { sender: String, recipient: String },

    /// Clear a previously sent typing signal.
    StopTyping { sender: String, recipient: String },

    /// Initiate a call: create a session and deliver the offer.
    CallUser {
        to: String,
        offer: Value,
        media_kind: MediaKind,
    },

    /// Accept a pending offer from `to`.
    CallAccept { to: String, answer: Value },

    /// Decline a pending offer from `to`.
    CallDecline { to: String },

    /// Relay an ICE candidate to the call peer.
    IceCandidate { to: String, candidate: Value },

    /// Hang up the call with `to`.
    EndCall { to: String },
}

/// Events pushed to clients.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum ServerEvent {
    /// Full roster, sent to a freshly identified connection only.
    RosterSnapshot { users: Vec<Identity> },

    /// Another user identified.
    UserJoined { user: Identity },

    /// A user's connection went away.
    UserLeft { user: Identity },

    /// A persisted message, delivered to the recipient and echoed to the
    /// sender. Clients deduplicate by `message.id`.
    MessageDelivered { message: MessageRecord },

    /// Response to `fetch-history`, ascending by (timestamp, insertion).
    HistoryResult { messages: Vec<MessageRecord> },

    /// The named sender started typing toward this connection's user.
    TypingStarted { sender: String },

    /// The named sender stopped typing. Receipt order is authoritative:
    /// once observed, "stopped" wins regardless of original send order.
    TypingStopped { sender: String },

    /// An offer arrived for this connection's user.
    IncomingCall {
        from: String,
        offer: Value,
        media_kind: MediaKind,
    },

    /// The callee accepted; here is the answer.
    CallFinalized { answer: Value },

    /// The callee declined the pending offer.
    CallDeclined { from: String },

    /// An ICE candidate from the call peer. Candidate ordering relative
    /// to remote-description application is the receiving peer's job
    /// (queue, then flush once its negotiation state allows).
    IceCandidateRelayed { from: String, candidate: Value },

    /// The call ended: the peer hung up or its connection vanished.
    CallEnded {},

    /// An operation failed; scoped to this connection only.
    OperationError { kind: ErrorKind, message: String },
}

impl ServerEvent {
    /// Build an `operation-error` from a coordinator error.
    pub fn from_error(err: &crate::error::SignalError) -> Self {
        ServerEvent::OperationError {
            kind: err.kind(),
            message: err.client_message(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_event_deserializes_wire_names() {
        let json = r#"{"event":"send-message","sender":"alice","recipient":"bob","text":"hi"}"#;
        let event: ClientEvent = serde_json::from_str(json).unwrap();
        assert!(matches!(
            event,
            ClientEvent::SendMessage { ref sender, ref recipient, ref text }
                if sender == "alice" && recipient == "bob" && text == "hi"
        ));
    }

    #[test]
    fn test_call_user_round_trip() {
        let json = r#"{"event":"call-user","to":"bob","offer":{"sdp":"v=0"},"mediaKind":"video"}"#;
        let event: ClientEvent = serde_json::from_str(json).unwrap();
        match event {
            ClientEvent::CallUser { to, media_kind, .. } => {
                assert_eq!(to, "bob");
                assert_eq!(media_kind, MediaKind::Video);
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[test]
    fn test_server_event_tag_names() {
        let event = ServerEvent::TypingStarted {
            sender: "alice".into(),
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains(r#""event":"typing-started""#));

        let event = ServerEvent::CallEnded {};
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains(r#""event":"call-ended""#));
    }

    #[test]
    fn test_unknown_event_is_rejected() {
        let json = r#"{"event":"self-destruct"}"#;
        assert!(serde_json::from_str::<ClientEvent>(json).is_err());
    }
}
