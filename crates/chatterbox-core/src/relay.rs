//! Private message relay.
//!
//! Validates, persists, then routes. The durable write completes before
//! any delivery attempt, so an acknowledged message survives a crashed
//! delivery; an unreachable store fails the send closed rather than
//! delivering an ephemeral, unrecoverable message.

use std::sync::Arc;

use tracing::debug;

use crate::error::SignalError;
use crate::events::ServerEvent;
use crate::history::{MessageRecord, MessageStore, NewMessage};
use crate::registry::{ConnectionRegistry, SendResult};

/// Maximum message length in characters.
pub const MAX_TEXT_LEN: usize = 1000;
/// Maximum username length in characters.
pub const MAX_USERNAME_LEN: usize = 50;

/// Validate a username field (sender, recipient, or identify claim).
pub fn validate_username(field: &str, value: &str) -> Result<(), SignalError> {
    if value.is_empty() {
        return Err(SignalError::Validation(format!("{} must not be empty", field)));
    }
    if value.chars().count() > MAX_USERNAME_LEN {
        return Err(SignalError::Validation(format!(
            "{} exceeds {} characters",
            field, MAX_USERNAME_LEN
        )));
    }
    Ok(())
}

pub struct MessageRelay {
    registry: Arc<ConnectionRegistry>,
    store: Arc<dyn MessageStore>,
}

impl MessageRelay {
    pub fn new(registry: Arc<ConnectionRegistry>, store: Arc<dyn MessageStore>) -> Self {
        Self { registry, store }
    }

    /// Persist a message and deliver it to the recipient if online.
    ///
    /// Returns the persisted record; the caller echoes it back to the
    /// originating connection so an optimistic UI can reconcile by id.
    /// An offline recipient is not an error — delivery is skipped and the
    /// record remains recoverable through history.
    pub async fn send(
        &self,
        sender: &str,
        recipient: &str,
        text: &str,
    ) -> Result<MessageRecord, SignalError> {
        validate_username("sender", sender)?;
        validate_username("recipient", recipient)?;
        if text.is_empty() {
            return Err(SignalError::Validation("text must not be empty".into()));
        }
        if text.chars().count() > MAX_TEXT_LEN {
            return Err(SignalError::Validation(format!(
                "text exceeds {} characters",
                MAX_TEXT_LEN
            )));
        }

        let record = self
            .store
            .store_message(NewMessage::chat(sender, recipient, text))
            .await?;

        match self.registry.send_to(
            recipient,
            ServerEvent::MessageDelivered {
                message: record.clone(),
            },
        ) {
            SendResult::Sent => debug!(recipient = %recipient, id = %record.id, "Message delivered"),
            other => debug!(recipient = %recipient, result = ?other, "Recipient offline, delivery skipped"),
        }

        Ok(record)
    }

    /// Conversation history for a user pair, ascending, capped at `limit`.
    pub async fn fetch_history(
        &self,
        user_a: &str,
        user_b: &str,
        limit: u32,
    ) -> Result<Vec<MessageRecord>, SignalError> {
        validate_username("userA", user_a)?;
        validate_username("userB", user_b)?;

        let records = self.store.fetch_history(user_a, user_b, limit).await?;
        Ok(records)
    }
}
