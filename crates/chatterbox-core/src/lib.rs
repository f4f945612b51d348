//! Chatterbox core: presence, message relay, and call signaling for a
//! small real-time chat service.
//!
//! The server crate wires these components to a WebSocket transport; this
//! crate is transport-agnostic and fully testable with in-process
//! channels.

pub mod calls;
pub mod coordinator;
pub mod error;
pub mod events;
pub mod history;
pub mod presence;
pub mod registry;
pub mod relay;
pub mod typing;

pub use calls::{CallCoordinator, CallState};
pub use coordinator::SignalCoordinator;
pub use error::{ErrorKind, SignalError};
pub use events::{ClientEvent, MediaKind, ServerEvent};
pub use history::{LibSqlMessageStore, MessageRecord, MessageStore, NewMessage, StorageError};
pub use presence::PresenceBroadcaster;
pub use registry::{ConnectionRegistry, Identity, SendResult};
pub use relay::MessageRelay;
pub use typing::TypingTracker;
