//! Client-side messaging core for the assistant chat: real-time channel
//! lifecycle, transport selection with REST fallback, optimistic echoes and
//! history reconciliation.

pub mod backend;
pub mod chat;
pub mod config;
pub mod connection;
pub mod echo;
pub mod error;
pub mod realtime;
pub mod reconcile;
pub mod session;
pub mod transport;
pub mod types;

pub use backend::{ChatBackend, HttpChatBackend};
pub use chat::{AssistantChat, ChatActions};
pub use config::{load_settings, ChatSettings};
pub use connection::{ConnectionManager, ConnectionState, RealtimeConnector};
pub use error::{ConnectionError, FetchError, SendError};
pub use transport::{choose_transport, Transport, TransportSelector};
pub use types::{ActiveChatView, ChatEvent, LocalMessageId, MessageKey, RenderedMessage};

#[cfg(test)]
#[path = "tests/support.rs"]
pub(crate) mod test_support;
