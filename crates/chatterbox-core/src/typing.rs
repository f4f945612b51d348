//! Typing indicator forwarding.
//!
//! Stateless: typing signals are forwarded to the recipient's live
//! connection and never stored. The server holds no expiry timer — a
//! `typing-stopped` can be lost on abrupt disconnect, so the receiving
//! client independently clears its indicator after a bounded window
//! (about five seconds) without a stop signal. On the receiver, receipt
//! order is authoritative: once "stopped" is observed it wins, whatever
//! the original send order was.

use std::sync::Arc;

use tracing::debug;

use crate::events::ServerEvent;
use crate::registry::{ConnectionRegistry, SendResult};

pub struct TypingTracker {
    registry: Arc<ConnectionRegistry>,
}

impl TypingTracker {
    pub fn new(registry: Arc<ConnectionRegistry>) -> Self {
        Self { registry }
    }

    /// Forward `typing-started` to the recipient; no-op if offline.
    pub fn start_typing(&self, sender: &str, recipient: &str) {
        match self.registry.send_to(
            recipient,
            ServerEvent::TypingStarted {
                sender: sender.to_string(),
            },
        ) {
            SendResult::Sent => {}
            _ => debug!(recipient = %recipient, "Typing signal dropped, recipient offline"),
        }
    }

    /// Forward `typing-stopped` to the recipient; no-op if offline.
    pub fn stop_typing(&self, sender: &str, recipient: &str) {
        match self.registry.send_to(
            recipient,
            ServerEvent::TypingStopped {
                sender: sender.to_string(),
            },
        ) {
            SendResult::Sent => {}
            _ => debug!(recipient = %recipient, "Stop-typing signal dropped, recipient offline"),
        }
    }
}
