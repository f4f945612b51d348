//! Call signaling: the offer/answer/ICE state machine.
//!
//! Sessions are keyed by the *unordered username pair*, never by raw
//! connection id — a reconnect during a call must not spawn a second
//! session for the same two people. At most one non-terminal session
//! exists per pair; ended or declined sessions are removed from the
//! table immediately, freeing the pair for a new call.
//!
//! The coordinator relays offers, answers, and candidates verbatim. It
//! performs no candidate buffering: ordering relative to
//! remote-description application is the receiving peer's contract
//! (queue, then flush once its negotiation state allows).

use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::error::SignalError;
use crate::events::{MediaKind, ServerEvent};
use crate::history::{MessageStore, NewMessage};
use crate::registry::{ConnectionRegistry, Identity, SendResult};
use crate::relay::validate_username;

/// Unordered username pair identifying a call session.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PairKey(String, String);

impl PairKey {
    pub fn new(a: &str, b: &str) -> Self {
        if a <= b {
            Self(a.to_string(), b.to_string())
        } else {
            Self(b.to_string(), a.to_string())
        }
    }
}

/// Non-terminal call states. Terminal sessions (ended, declined) are
/// removed from the table rather than retained.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallState {
    /// Offer delivered, awaiting the callee's answer.
    Offered,
    /// Answer relayed back to the caller.
    Answered,
    /// Candidates are flowing; the peers are negotiating or connected.
    Active,
}

#[derive(Debug)]
struct CallSession {
    caller: String,
    callee: String,
    state: CallState,
    offer: Value,
    answer: Option<Value>,
    media_kind: MediaKind,
    /// The caller's registry generation when the offer was made. An
    /// answer is only honoured while the caller is still on that
    /// connection: an answer bound to a stale connection cannot be
    /// recovered without a fresh offer.
    caller_generation: u64,
    offered_at: DateTime<Utc>,
    answered_at: Option<DateTime<Utc>>,
    candidates_relayed: u64,
}

impl CallSession {
    fn offered(caller: &Identity, callee: &str, offer: Value, media_kind: MediaKind) -> Self {
        Self {
            caller: caller.username.clone(),
            callee: callee.to_string(),
            state: CallState::Offered,
            offer,
            answer: None,
            media_kind,
            caller_generation: caller.generation,
            offered_at: Utc::now(),
            answered_at: None,
            candidates_relayed: 0,
        }
    }

    fn involves(&self, username: &str) -> bool {
        self.caller == username || self.callee == username
    }

    fn other_party(&self, username: &str) -> &str {
        if self.caller == username {
            &self.callee
        } else {
            &self.caller
        }
    }
}

/// Owns the call session table and drives the signaling state machine.
pub struct CallCoordinator {
    registry: Arc<ConnectionRegistry>,
    store: Arc<dyn MessageStore>,
    sessions: DashMap<PairKey, CallSession>,
}

impl CallCoordinator {
    pub fn new(registry: Arc<ConnectionRegistry>, store: Arc<dyn MessageStore>) -> Self {
        Self {
            registry,
            store,
            sessions: DashMap::new(),
        }
    }

    /// Create a session and deliver the offer to the callee.
    ///
    /// Rejected as `Busy` while a non-terminal session exists for the
    /// pair (the existing session is untouched), and as
    /// `CallPeerUnreachable` if the callee is offline (no session is
    /// created).
    pub fn call_user(
        &self,
        caller: &Identity,
        callee: &str,
        offer: Value,
        media_kind: MediaKind,
    ) -> Result<(), SignalError> {
        validate_username("callee", callee)?;
        if callee == caller.username {
            return Err(SignalError::Validation("cannot call yourself".into()));
        }
        if self.registry.resolve(callee).is_none() {
            return Err(SignalError::CallPeerUnreachable(format!(
                "{} is not online",
                callee
            )));
        }

        let key = PairKey::new(&caller.username, callee);
        match self.sessions.entry(key.clone()) {
            Entry::Occupied(_) => {
                return Err(SignalError::Busy(format!(
                    "a call between {} and {} is already in progress",
                    caller.username, callee
                )));
            }
            Entry::Vacant(vacant) => {
                vacant.insert(CallSession::offered(caller, callee, offer.clone(), media_kind));
            }
        }

        match self.registry.send_to(
            callee,
            ServerEvent::IncomingCall {
                from: caller.username.clone(),
                offer,
                media_kind,
            },
        ) {
            SendResult::Sent => {
                info!(caller = %caller.username, callee = %callee, media = %media_kind, "Call offered");
                Ok(())
            }
            _ => {
                // Callee vanished between the resolve and the send.
                self.sessions.remove(&key);
                Err(SignalError::CallPeerUnreachable(format!(
                    "{} went offline before the offer was delivered",
                    callee
                )))
            }
        }
    }

    /// Accept a pending offer: transition to `Answered` and relay the
    /// answer to the caller's *current* connection.
    ///
    /// If the caller disconnected — or reconnected, so its generation no
    /// longer matches the one recorded at offer time — the session is
    /// terminated rather than left dangling, and the callee is told the
    /// peer is unreachable.
    pub fn call_accept(
        &self,
        callee: &Identity,
        caller: &str,
        answer: Value,
    ) -> Result<(), SignalError> {
        let key = PairKey::new(&callee.username, caller);

        {
            let mut session = self.sessions.get_mut(&key).ok_or_else(|| {
                SignalError::Validation(format!("no pending offer from {}", caller))
            })?;
            if session.state != CallState::Offered || session.callee != callee.username {
                return Err(SignalError::Validation(format!(
                    "no pending offer from {}",
                    caller
                )));
            }

            let caller_ok = matches!(
                self.registry.identity_for(caller),
                Some(current) if current.generation == session.caller_generation
            );
            if !caller_ok {
                drop(session);
                self.sessions.remove(&key);
                return Err(SignalError::CallPeerUnreachable(format!(
                    "{} disconnected before the answer arrived",
                    caller
                )));
            }

            session.state = CallState::Answered;
            session.answer = Some(answer.clone());
            session.answered_at = Some(Utc::now());
        }

        match self
            .registry
            .send_to(caller, ServerEvent::CallFinalized { answer })
        {
            SendResult::Sent => {
                info!(caller = %caller, callee = %callee.username, "Call answered");
                Ok(())
            }
            _ => {
                self.sessions.remove(&key);
                Err(SignalError::CallPeerUnreachable(format!(
                    "{} went offline before the answer was delivered",
                    caller
                )))
            }
        }
    }

    /// Decline a pending offer: the caller is notified and the pair is
    /// freed. Declining when no offer is pending is a no-op.
    pub fn call_decline(&self, callee: &Identity, caller: &str) {
        let key = PairKey::new(&callee.username, caller);
        let removed = self.sessions.remove_if(&key, |_, session| {
            session.state == CallState::Offered && session.callee == callee.username
        });

        if removed.is_some() {
            info!(caller = %caller, callee = %callee.username, "Call declined");
            let _ = self.registry.send_to(
                caller,
                ServerEvent::CallDeclined {
                    from: callee.username.clone(),
                },
            );
        } else {
            debug!(caller = %caller, "Decline without a pending offer, ignoring");
        }
    }

    /// Relay an ICE candidate to the call peer, if a session exists and
    /// the peer resolves; otherwise the candidate is dropped. The first
    /// candidate relayed after the answer promotes the session to
    /// `Active`.
    pub fn ice_candidate(&self, from: &Identity, to: &str, candidate: Value) {
        let key = PairKey::new(&from.username, to);
        if !self
            .sessions
            .get(&key)
            .is_some_and(|s| s.involves(&from.username))
        {
            debug!(from = %from.username, to = %to, "Candidate without a session, dropped");
            return;
        }

        let sent = matches!(
            self.registry.send_to(
                to,
                ServerEvent::IceCandidateRelayed {
                    from: from.username.clone(),
                    candidate,
                },
            ),
            SendResult::Sent
        );

        if sent {
            if let Some(mut session) = self.sessions.get_mut(&key) {
                session.candidates_relayed += 1;
                if session.state == CallState::Answered {
                    session.state = CallState::Active;
                }
            }
        } else {
            debug!(to = %to, "Candidate dropped, peer offline");
        }
    }

    /// Hang up: notify the other party if reachable and remove the
    /// session. Idempotent — ending an already-gone session is a no-op.
    pub async fn end_call(&self, initiator: &Identity, other: &str) {
        let key = PairKey::new(&initiator.username, other);
        let Some((_, session)) = self.sessions.remove(&key) else {
            debug!(initiator = %initiator.username, other = %other, "End-call without a session, ignoring");
            return;
        };

        info!(initiator = %initiator.username, other = %other, "Call ended");
        let _ = self.registry.send_to(other, ServerEvent::CallEnded {});
        self.log_completed(&session).await;
    }

    /// Tear down every session this user is party to.
    ///
    /// Called when a connection unregisters: without the proactive
    /// `call-ended`, the surviving peer has no signal that the remote
    /// side vanished and would hang indefinitely.
    pub async fn handle_disconnect(&self, username: &str) {
        let affected: Vec<PairKey> = self
            .sessions
            .iter()
            .filter(|entry| entry.value().involves(username))
            .map(|entry| entry.key().clone())
            .collect();

        for key in affected {
            let Some((_, session)) = self
                .sessions
                .remove_if(&key, |_, session| session.involves(username))
            else {
                continue;
            };

            let other = session.other_party(username).to_string();
            info!(departed = %username, notified = %other, "Call torn down on disconnect");
            let _ = self.registry.send_to(&other, ServerEvent::CallEnded {});
            self.log_completed(&session).await;
        }
    }

    /// Current state of the session for a pair, if one exists.
    pub fn session_state(&self, a: &str, b: &str) -> Option<CallState> {
        self.sessions
            .get(&PairKey::new(a, b))
            .map(|session| session.state)
    }

    /// Number of non-terminal sessions.
    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// Leave a call-log record in the conversation for calls that got
    /// answered. Best effort: a store failure loses the log entry, not
    /// the teardown.
    async fn log_completed(&self, session: &CallSession) {
        let Some(answered_at) = session.answered_at else {
            return;
        };
        let duration_secs = (Utc::now() - answered_at).num_seconds().max(0);
        let description = format!("{} call", session.media_kind);

        if let Err(e) = self
            .store
            .store_message(NewMessage::call_log(
                &session.caller,
                &session.callee,
                &description,
                duration_secs,
            ))
            .await
        {
            warn!(
                caller = %session.caller,
                callee = %session.callee,
                error = %e,
                "Failed to persist call-log record"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::history::LibSqlMessageStore;
    use serde_json::json;
    use tokio::sync::mpsc;
    use uuid::Uuid;

    struct Harness {
        registry: Arc<ConnectionRegistry>,
        store: Arc<LibSqlMessageStore>,
        calls: CallCoordinator,
    }

    async fn harness() -> Harness {
        let db = libsql::Builder::new_local(":memory:").build().await.unwrap();
        let store = Arc::new(LibSqlMessageStore::new(db.connect().unwrap()));
        let registry = Arc::new(ConnectionRegistry::new());
        let calls = CallCoordinator::new(Arc::clone(&registry), store.clone());
        Harness {
            registry,
            store,
            calls,
        }
    }

    fn connect(h: &Harness, username: &str) -> (Identity, mpsc::Receiver<ServerEvent>) {
        let (tx, rx) = mpsc::channel(16);
        let identity = h.registry.register(Uuid::new_v4(), username, tx);
        (identity, rx)
    }

    #[tokio::test]
    async fn test_offer_answer_ice_flow() {
        let h = harness().await;
        let (alice, mut alice_rx) = connect(&h, "alice");
        let (bob, mut bob_rx) = connect(&h, "bob");

        h.calls
            .call_user(&alice, "bob", json!({"sdp": "offer"}), MediaKind::Video)
            .unwrap();
        match bob_rx.recv().await.unwrap() {
            ServerEvent::IncomingCall {
                from, media_kind, ..
            } => {
                assert_eq!(from, "alice");
                assert_eq!(media_kind, MediaKind::Video);
            }
            other => panic!("unexpected event: {:?}", other),
        }
        assert_eq!(
            h.calls.session_state("alice", "bob"),
            Some(CallState::Offered)
        );

        h.calls
            .call_accept(&bob, "alice", json!({"sdp": "answer"}))
            .unwrap();
        assert!(matches!(
            alice_rx.recv().await.unwrap(),
            ServerEvent::CallFinalized { .. }
        ));
        assert_eq!(
            h.calls.session_state("alice", "bob"),
            Some(CallState::Answered)
        );

        h.calls.ice_candidate(&alice, "bob", json!({"candidate": "c1"}));
        match bob_rx.recv().await.unwrap() {
            ServerEvent::IceCandidateRelayed { from, .. } => assert_eq!(from, "alice"),
            other => panic!("unexpected event: {:?}", other),
        }
        assert_eq!(
            h.calls.session_state("alice", "bob"),
            Some(CallState::Active)
        );
    }

    #[tokio::test]
    async fn test_offline_callee_creates_no_session() {
        let h = harness().await;
        let (alice, _alice_rx) = connect(&h, "alice");

        let err = h
            .calls
            .call_user(&alice, "bob", json!({}), MediaKind::Audio)
            .unwrap_err();
        assert!(matches!(err, SignalError::CallPeerUnreachable(_)));
        assert_eq!(h.calls.session_count(), 0);
    }

    #[tokio::test]
    async fn test_second_offer_for_pair_is_busy() {
        let h = harness().await;
        let (alice, _alice_rx) = connect(&h, "alice");
        let (bob, _bob_rx) = connect(&h, "bob");

        h.calls
            .call_user(&alice, "bob", json!({}), MediaKind::Audio)
            .unwrap();
        // The callee offering back hits the same pair.
        let err = h
            .calls
            .call_user(&bob, "alice", json!({}), MediaKind::Audio)
            .unwrap_err();
        assert!(matches!(err, SignalError::Busy(_)));
        // The original session survives untouched.
        assert_eq!(
            h.calls.session_state("alice", "bob"),
            Some(CallState::Offered)
        );
    }

    #[tokio::test]
    async fn test_end_call_is_idempotent() {
        let h = harness().await;
        let (alice, _alice_rx) = connect(&h, "alice");
        let (bob, mut bob_rx) = connect(&h, "bob");

        h.calls
            .call_user(&alice, "bob", json!({}), MediaKind::Audio)
            .unwrap();
        bob_rx.recv().await.unwrap(); // incoming-call

        h.calls.end_call(&alice, "bob").await;
        h.calls.end_call(&alice, "bob").await;

        // Exactly one call-ended was delivered.
        assert!(matches!(
            bob_rx.recv().await.unwrap(),
            ServerEvent::CallEnded {}
        ));
        assert!(bob_rx.try_recv().is_err());
        assert_eq!(h.calls.session_count(), 0);
    }

    #[tokio::test]
    async fn test_disconnect_tears_down_session() {
        let h = harness().await;
        let (alice, mut alice_rx) = connect(&h, "alice");
        let (bob, mut bob_rx) = connect(&h, "bob");

        h.calls
            .call_user(&alice, "bob", json!({}), MediaKind::Video)
            .unwrap();
        bob_rx.recv().await.unwrap();
        h.calls.call_accept(&bob, "alice", json!({})).unwrap();
        alice_rx.recv().await.unwrap();

        // Bob vanishes without sending end-call.
        h.registry.unregister(bob.connection_id).unwrap();
        h.calls.handle_disconnect("bob").await;

        assert!(matches!(
            alice_rx.recv().await.unwrap(),
            ServerEvent::CallEnded {}
        ));
        assert_eq!(h.calls.session_count(), 0);
    }

    #[tokio::test]
    async fn test_stale_caller_invalidates_accept() {
        let h = harness().await;
        let (alice, _alice_rx) = connect(&h, "alice");
        let (bob, mut bob_rx) = connect(&h, "bob");

        h.calls
            .call_user(&alice, "bob", json!({}), MediaKind::Audio)
            .unwrap();
        bob_rx.recv().await.unwrap();

        // Alice reconnects: same username, new connection, new generation.
        let (_alice2, _alice2_rx) = connect(&h, "alice");

        let err = h.calls.call_accept(&bob, "alice", json!({})).unwrap_err();
        assert!(matches!(err, SignalError::CallPeerUnreachable(_)));
        // The dangling session was terminated, freeing the pair.
        assert_eq!(h.calls.session_count(), 0);
    }

    #[tokio::test]
    async fn test_decline_frees_pair() {
        let h = harness().await;
        let (alice, mut alice_rx) = connect(&h, "alice");
        let (bob, mut bob_rx) = connect(&h, "bob");

        h.calls
            .call_user(&alice, "bob", json!({}), MediaKind::Audio)
            .unwrap();
        bob_rx.recv().await.unwrap();

        h.calls.call_decline(&bob, "alice");
        match alice_rx.recv().await.unwrap() {
            ServerEvent::CallDeclined { from } => assert_eq!(from, "bob"),
            other => panic!("unexpected event: {:?}", other),
        }
        assert_eq!(h.calls.session_count(), 0);

        // The pair is free for a fresh offer.
        h.calls
            .call_user(&alice, "bob", json!({}), MediaKind::Audio)
            .unwrap();
        assert_eq!(
            h.calls.session_state("alice", "bob"),
            Some(CallState::Offered)
        );
    }

    #[tokio::test]
    async fn test_accept_without_offer_is_rejected() {
        let h = harness().await;
        let (bob, _bob_rx) = connect(&h, "bob");
        let err = h.calls.call_accept(&bob, "alice", json!({})).unwrap_err();
        assert!(matches!(err, SignalError::Validation(_)));
    }

    #[tokio::test]
    async fn test_candidate_without_session_is_dropped() {
        let h = harness().await;
        let (alice, _alice_rx) = connect(&h, "alice");
        let (_bob, mut bob_rx) = connect(&h, "bob");

        h.calls.ice_candidate(&alice, "bob", json!({}));
        assert!(bob_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_answered_call_leaves_call_log() {
        use crate::history::MessageStore;

        let h = harness().await;
        let (alice, mut alice_rx) = connect(&h, "alice");
        let (bob, mut bob_rx) = connect(&h, "bob");

        h.calls
            .call_user(&alice, "bob", json!({}), MediaKind::Video)
            .unwrap();
        bob_rx.recv().await.unwrap();
        h.calls.call_accept(&bob, "alice", json!({})).unwrap();
        alice_rx.recv().await.unwrap();

        h.calls.end_call(&alice, "bob").await;

        let history = h.store.fetch_history("alice", "bob", 10).await.unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].event_type.as_deref(), Some("call"));
        assert_eq!(history[0].text, "video call");
        assert!(history[0].duration_secs.is_some());
    }

    #[tokio::test]
    async fn test_unanswered_call_leaves_no_log() {
        use crate::history::MessageStore;

        let h = harness().await;
        let (alice, _alice_rx) = connect(&h, "alice");
        let (_bob, mut bob_rx) = connect(&h, "bob");

        h.calls
            .call_user(&alice, "bob", json!({}), MediaKind::Audio)
            .unwrap();
        bob_rx.recv().await.unwrap();
        h.calls.end_call(&alice, "bob").await;

        let history = h.store.fetch_history("alice", "bob", 10).await.unwrap();
        assert!(history.is_empty());
    }
}
