use shared::{domain::ConversationId, error::ApiError};
use thiserror::Error;

/// Failures of the real-time channel. None of these are fatal: they only push
/// sends onto the fallback transport until a new `connect()` succeeds.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConnectionError {
    #[error("realtime handshake failed: {0}")]
    Handshake(String),
    #[error("realtime channel is not connected")]
    NotConnected,
    #[error("realtime transport failed: {0}")]
    Transport(String),
    #[error("realtime channel closed by peer")]
    Closed,
    #[error("server reported error over realtime channel: {0}")]
    Remote(ApiError),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SendError {
    #[error("message must contain text or an attachment")]
    EmptyMessage,
    #[error("message was not delivered: {fallback}")]
    Undelivered {
        realtime: Option<ConnectionError>,
        fallback: String,
    },
    #[error("no failed message with that id")]
    UnknownMessage,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FetchError {
    #[error("failed to load conversations: {0}")]
    Roster(String),
    #[error("failed to load messages for conversation {conversation_id}: {reason}")]
    History {
        conversation_id: ConversationId,
        reason: String,
    },
    #[error("failed to update conversation {conversation_id}: {reason}")]
    Mutation {
        conversation_id: ConversationId,
        reason: String,
    },
}
