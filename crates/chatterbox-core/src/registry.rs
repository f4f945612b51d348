//! Connection Registry.
//!
//! Tracks which live connection currently represents which username, and
//! owns the outbound channel used to push events to that connection.
//!
//! The registry is a single map keyed by username — the stable identity
//! key. Connection ids are ephemeral: a re-identify with the same username
//! replaces the old binding (last-writer-wins), so a reconnect never
//! produces a duplicate roster entry. Each binding carries a monotonically
//! increasing generation so late traffic from a superseded connection can
//! be recognised and ignored.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, instrument, warn};
use uuid::Uuid;

use crate::events::ServerEvent;

/// A username bound to a live connection.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Identity {
    /// Self-asserted username; the stable key.
    pub username: String,
    /// Ephemeral connection id, superseded on reconnect.
    pub connection_id: Uuid,
    /// Registry-wide binding counter; a higher generation for the same
    /// username always means a newer connection.
    pub generation: u64,
    /// When this binding was created.
    pub joined_at: DateTime<Utc>,
}

/// Registry entry: the identity plus the connection's outbound channel.
#[derive(Debug)]
struct RegisteredUser {
    identity: Identity,
    sender: mpsc::Sender<ServerEvent>,
}

/// Result of attempting to push an event to a connection.
#[derive(Debug)]
pub enum SendResult {
    /// Event was queued for delivery.
    Sent,
    /// The username is not bound to any live connection.
    NotConnected,
    /// The outbound channel is full (backpressure); the event is dropped.
    ChannelFull,
    /// The outbound channel is closed; the stale binding was evicted.
    ChannelClosed,
}

/// Registry of live connections keyed by username.
///
/// Thread-safe via DashMap: mutations on a key are serialised against each
/// other, and using the username as the sole key leaves no cross-map state
/// to keep consistent. Delivery uses `try_send` and never blocks a caller.
pub struct ConnectionRegistry {
    users: DashMap<String, RegisteredUser>,
    generation: AtomicU64,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self {
            users: DashMap::new(),
            generation: AtomicU64::new(0),
        }
    }

    /// Bind a username to a connection, superseding any existing binding.
    ///
    /// Returns the new identity. The previous connection (if any) is simply
    /// dropped from the map; its eventual disconnect is a no-op because
    /// [`unregister`](Self::unregister) checks the connection id.
    #[instrument(skip(self, sender), fields(username = %username, connection_id = %connection_id))]
    pub fn register(
        &self,
        connection_id: Uuid,
        username: &str,
        sender: mpsc::Sender<ServerEvent>,
    ) -> Identity {
        let identity = Identity {
            username: username.to_string(),
            connection_id,
            generation: self.generation.fetch_add(1, Ordering::Relaxed) + 1,
            joined_at: Utc::now(),
        };

        let entry = RegisteredUser {
            identity: identity.clone(),
            sender,
        };

        let previous = self.users.insert(username.to_string(), entry);
        if let Some(old) = previous {
            debug!(
                superseded_connection = %old.identity.connection_id,
                "Replaced existing binding (reconnect)"
            );
        } else {
            debug!("Registered new binding");
        }

        identity
    }

    /// Remove the binding owned by this connection, returning its identity.
    ///
    /// A superseded connection's late disconnect must not evict the newer
    /// binding, so removal only happens when the stored connection id still
    /// matches.
    #[instrument(skip(self), fields(connection_id = %connection_id))]
    pub fn unregister(&self, connection_id: Uuid) -> Option<Identity> {
        let username = self.users.iter().find_map(|entry| {
            (entry.value().identity.connection_id == connection_id)
                .then(|| entry.key().clone())
        })?;

        let removed = self
            .users
            .remove_if(&username, |_, user| {
                user.identity.connection_id == connection_id
            })
            .map(|(_, user)| user.identity);

        if removed.is_some() {
            debug!(username = %username, "Unregistered binding");
        }
        removed
    }

    /// The connection currently bound to a username.
    pub fn resolve(&self, username: &str) -> Option<Uuid> {
        self.users
            .get(username)
            .map(|user| user.identity.connection_id)
    }

    /// The identity owned by a connection, if any.
    pub fn identity_of(&self, connection_id: Uuid) -> Option<Identity> {
        self.users.iter().find_map(|entry| {
            (entry.value().identity.connection_id == connection_id)
                .then(|| entry.value().identity.clone())
        })
    }

    /// The current identity bound to a username.
    pub fn identity_for(&self, username: &str) -> Option<Identity> {
        self.users.get(username).map(|user| user.identity.clone())
    }

    /// All current identities, ordered by join time for a stable roster.
    pub fn snapshot(&self) -> Vec<Identity> {
        let mut identities: Vec<Identity> = self
            .users
            .iter()
            .map(|entry| entry.value().identity.clone())
            .collect();
        identities.sort_by(|a, b| a.joined_at.cmp(&b.joined_at).then(a.generation.cmp(&b.generation)));
        identities
    }

    /// Number of live bindings.
    pub fn connection_count(&self) -> usize {
        self.users.len()
    }

    /// Push an event to the connection bound to `username`.
    ///
    /// Never blocks: a full channel drops the event (backpressure), a
    /// closed channel evicts the stale binding on the spot.
    pub fn send_to(&self, username: &str, event: ServerEvent) -> SendResult {
        let (sender, connection_id) = match self.users.get(username) {
            Some(user) => (
                user.value().sender.clone(),
                user.value().identity.connection_id,
            ),
            None => {
                debug!(username = %username, "Recipient not connected");
                return SendResult::NotConnected;
            }
        };

        match sender.try_send(event) {
            Ok(()) => SendResult::Sent,
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!(username = %username, "Outbound channel full, dropping event");
                SendResult::ChannelFull
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                debug!(username = %username, "Outbound channel closed, evicting stale binding");
                self.users.remove_if(username, |_, user| {
                    user.identity.connection_id == connection_id
                });
                SendResult::ChannelClosed
            }
        }
    }

    /// Best-effort fan-out to every connection except `exclude`.
    ///
    /// Delivery failures are dropped silently; presence is eventually
    /// consistent. Senders are snapshotted before any delivery so the map
    /// is never iterated while being mutated.
    pub fn broadcast(&self, event: &ServerEvent, exclude: Option<Uuid>) {
        let targets: Vec<(String, mpsc::Sender<ServerEvent>)> = self
            .users
            .iter()
            .filter(|entry| Some(entry.value().identity.connection_id) != exclude)
            .map(|entry| (entry.key().clone(), entry.value().sender.clone()))
            .collect();

        for (username, sender) in targets {
            if let Err(e) = sender.try_send(event.clone()) {
                debug!(username = %username, error = %e, "Dropped broadcast event");
            }
        }
    }
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for ConnectionRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionRegistry")
            .field("connection_count", &self.users.len())
            .finish()
    }
}
