//! Top-level event dispatch.
//!
//! One coordinator per server, shared by every connection task. It owns
//! the component set (registry, presence, relay, typing, calls) and maps
//! each inbound client event onto the right component, pushing results
//! and errors back through the originating connection's channel.
//!
//! Failures are connection-scoped: an error in one client's operation is
//! reported to that client alone and never disturbs other sessions.

use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, info};
use uuid::Uuid;

use crate::calls::CallCoordinator;
use crate::error::SignalError;
use crate::events::{ClientEvent, ServerEvent};
use crate::history::MessageStore;
use crate::presence::PresenceBroadcaster;
use crate::registry::{ConnectionRegistry, Identity};
use crate::relay::{validate_username, MessageRelay};
use crate::typing::TypingTracker;

pub struct SignalCoordinator {
    registry: Arc<ConnectionRegistry>,
    presence: PresenceBroadcaster,
    relay: MessageRelay,
    typing: TypingTracker,
    calls: CallCoordinator,
    history_limit: u32,
}

impl SignalCoordinator {
    pub fn new(
        registry: Arc<ConnectionRegistry>,
        store: Arc<dyn MessageStore>,
        history_limit: u32,
    ) -> Self {
        Self {
            presence: PresenceBroadcaster::new(Arc::clone(&registry)),
            relay: MessageRelay::new(Arc::clone(&registry), Arc::clone(&store)),
            typing: TypingTracker::new(Arc::clone(&registry)),
            calls: CallCoordinator::new(Arc::clone(&registry), store),
            registry,
            history_limit,
        }
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    /// Dispatch one inbound event from a connection.
    ///
    /// `origin` is the connection's own outbound channel, used for echoes
    /// and error replies regardless of the connection's identify state.
    pub async fn handle_event(
        &self,
        connection_id: Uuid,
        origin: &mpsc::Sender<ServerEvent>,
        event: ClientEvent,
    ) {
        match event {
            ClientEvent::Identify { username } => {
                if let Err(e) = self.identify(connection_id, origin, &username).await {
                    reply(origin, ServerEvent::from_error(&e));
                }
            }

            ClientEvent::SendMessage {
                sender,
                recipient,
                text,
            } => match self.relay.send(&sender, &recipient, &text).await {
                Ok(record) => {
                    // Echo to the origin so an optimistic UI can reconcile
                    // by id; recipient delivery already happened in the
                    // relay.
                    reply(origin, ServerEvent::MessageDelivered { message: record });
                }
                Err(e) => reply(origin, ServerEvent::from_error(&e)),
            },

            ClientEvent::FetchHistory { user_a, user_b } => {
                match self
                    .relay
                    .fetch_history(&user_a, &user_b, self.history_limit)
                    .await
                {
                    Ok(messages) => reply(origin, ServerEvent::HistoryResult { messages }),
                    Err(e) => reply(origin, ServerEvent::from_error(&e)),
                }
            }

            ClientEvent::StartTyping { sender, recipient } => {
                self.typing.start_typing(&sender, &recipient);
            }

            ClientEvent::StopTyping { sender, recipient } => {
                self.typing.stop_typing(&sender, &recipient);
            }

            ClientEvent::CallUser {
                to,
                offer,
                media_kind,
            } => {
                let Some(caller) = self.require_identity(connection_id, origin) else {
                    return;
                };
                if let Err(e) = self.calls.call_user(&caller, &to, offer, media_kind) {
                    reply(origin, ServerEvent::from_error(&e));
                }
            }

            ClientEvent::CallAccept { to, answer } => {
                let Some(callee) = self.require_identity(connection_id, origin) else {
                    return;
                };
                if let Err(e) = self.calls.call_accept(&callee, &to, answer) {
                    reply(origin, ServerEvent::from_error(&e));
                }
            }

            ClientEvent::CallDecline { to } => {
                let Some(callee) = self.require_identity(connection_id, origin) else {
                    return;
                };
                self.calls.call_decline(&callee, &to);
            }

            ClientEvent::IceCandidate { to, candidate } => {
                let Some(from) = self.require_identity(connection_id, origin) else {
                    return;
                };
                self.calls.ice_candidate(&from, &to, candidate);
            }

            ClientEvent::EndCall { to } => {
                let Some(initiator) = self.require_identity(connection_id, origin) else {
                    return;
                };
                self.calls.end_call(&initiator, &to).await;
            }
        }
    }

    /// Tear down everything tied to a departed connection.
    ///
    /// No-op for connections that never identified, and for superseded
    /// connections whose binding was already replaced by a reconnect.
    pub async fn handle_disconnect(&self, connection_id: Uuid) {
        let Some(identity) = self.registry.unregister(connection_id) else {
            debug!(connection_id = %connection_id, "Disconnect without a live binding");
            return;
        };

        info!(username = %identity.username, "Connection departed");
        self.calls.handle_disconnect(&identity.username).await;
        self.presence.announce_leave(&identity);
    }

    async fn identify(
        &self,
        connection_id: Uuid,
        origin: &mpsc::Sender<ServerEvent>,
        username: &str,
    ) -> Result<(), SignalError> {
        validate_username("username", username)?;

        // A connection re-identifying under a different name releases its
        // old binding first, so the roster never shows both.
        if let Some(previous) = self.registry.identity_of(connection_id) {
            if previous.username != username {
                if let Some(released) = self.registry.unregister(connection_id) {
                    self.calls.handle_disconnect(&released.username).await;
                    self.presence.announce_leave(&released);
                }
            }
        }

        let identity = self
            .registry
            .register(connection_id, username, origin.clone());
        info!(username = %username, "User identified");
        self.presence.announce_join(&identity);
        Ok(())
    }

    fn require_identity(
        &self,
        connection_id: Uuid,
        origin: &mpsc::Sender<ServerEvent>,
    ) -> Option<Identity> {
        match self.registry.identity_of(connection_id) {
            Some(identity) => Some(identity),
            None => {
                reply(
                    origin,
                    ServerEvent::from_error(&SignalError::Validation(
                        "identify before using calls".into(),
                    )),
                );
                None
            }
        }
    }
}

/// Best-effort push to the originating connection.
fn reply(origin: &mpsc::Sender<ServerEvent>, event: ServerEvent) {
    if origin.try_send(event).is_err() {
        debug!("Origin channel unavailable, reply dropped");
    }
}
