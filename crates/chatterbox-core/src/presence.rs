//! Presence broadcasting.
//!
//! Emits join/leave notifications and roster snapshots on top of the
//! registry. Delivery is best-effort and never blocks the caller: a send
//! to a since-disconnected target is dropped silently, so presence is
//! eventually consistent.

use std::sync::Arc;

use tracing::debug;

use crate::events::ServerEvent;
use crate::registry::{ConnectionRegistry, Identity};

pub struct PresenceBroadcaster {
    registry: Arc<ConnectionRegistry>,
}

impl PresenceBroadcaster {
    pub fn new(registry: Arc<ConnectionRegistry>) -> Self {
        Self { registry }
    }

    /// Announce a newly identified user.
    ///
    /// Everyone else gets an incremental `user-joined`; the new connection
    /// gets a full `roster-snapshot` instead. Sending the snapshot only to
    /// the newcomer avoids the race where its own join interleaves with a
    /// concurrent joiner's incremental event.
    pub fn announce_join(&self, identity: &Identity) {
        debug!(username = %identity.username, "Broadcasting user-joined");
        self.registry.broadcast(
            &ServerEvent::UserJoined {
                user: identity.clone(),
            },
            Some(identity.connection_id),
        );

        let users = self.registry.snapshot();
        let _ = self
            .registry
            .send_to(&identity.username, ServerEvent::RosterSnapshot { users });
    }

    /// Announce a departed user to all remaining connections.
    pub fn announce_leave(&self, identity: &Identity) {
        debug!(username = %identity.username, "Broadcasting user-left");
        self.registry.broadcast(
            &ServerEvent::UserLeft {
                user: identity.clone(),
            },
            None,
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;
    use uuid::Uuid;

    fn setup() -> (Arc<ConnectionRegistry>, PresenceBroadcaster) {
        let registry = Arc::new(ConnectionRegistry::new());
        let presence = PresenceBroadcaster::new(Arc::clone(&registry));
        (registry, presence)
    }

    #[tokio::test]
    async fn test_join_broadcasts_to_others_and_snapshots_newcomer() {
        let (registry, presence) = setup();

        let (alice_tx, mut alice_rx) = mpsc::channel(16);
        let alice = registry.register(Uuid::new_v4(), "alice", alice_tx);
        presence.announce_join(&alice);

        // Alone in the room: only the roster snapshot arrives.
        match alice_rx.recv().await.unwrap() {
            ServerEvent::RosterSnapshot { users } => {
                assert_eq!(users.len(), 1);
                assert_eq!(users[0].username, "alice");
            }
            other => panic!("unexpected event: {:?}", other),
        }

        let (bob_tx, mut bob_rx) = mpsc::channel(16);
        let bob = registry.register(Uuid::new_v4(), "bob", bob_tx);
        presence.announce_join(&bob);

        // Alice sees the incremental join; Bob gets the snapshot only.
        match alice_rx.recv().await.unwrap() {
            ServerEvent::UserJoined { user } => assert_eq!(user.username, "bob"),
            other => panic!("unexpected event: {:?}", other),
        }
        match bob_rx.recv().await.unwrap() {
            ServerEvent::RosterSnapshot { users } => assert_eq!(users.len(), 2),
            other => panic!("unexpected event: {:?}", other),
        }
        assert!(bob_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_leave_broadcasts_to_remaining() {
        let (registry, presence) = setup();

        let (alice_tx, mut alice_rx) = mpsc::channel(16);
        registry.register(Uuid::new_v4(), "alice", alice_tx);

        let (bob_tx, _bob_rx) = mpsc::channel(16);
        let bob_conn = Uuid::new_v4();
        registry.register(bob_conn, "bob", bob_tx);

        let bob = registry.unregister(bob_conn).unwrap();
        presence.announce_leave(&bob);

        match alice_rx.recv().await.unwrap() {
            ServerEvent::UserLeft { user } => assert_eq!(user.username, "bob"),
            other => panic!("unexpected event: {:?}", other),
        }
    }
}
