use std::fmt;

use chrono::{DateTime, Utc};
use shared::{
    domain::{ClientId, ConversationId, MessageId, ParticipantId, SenderRole},
    protocol::{AttachmentRef, ConversationSummary, MessagePayload, SendMessageRequest},
};
use uuid::Uuid;

use crate::connection::ConnectionState;

/// Identity of a message that so far only exists on this client.
///
/// Backend identities are `MessageId`s; the two never share a type, so a local
/// echo can not be mistaken for a persisted message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LocalMessageId(Uuid);

impl LocalMessageId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for LocalMessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "local-{}", self.0)
    }
}

/// Render key for one row of the message list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKey {
    Server(MessageId),
    Local(LocalMessageId),
}

impl MessageKey {
    pub fn is_local(&self) -> bool {
        matches!(self, MessageKey::Local(_))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EchoStatus {
    /// Handed to a transport, no confirmation yet.
    Sending,
    /// Written to the real-time channel; a `message_created` event confirms it.
    AwaitingEvent,
    /// The fallback request succeeded; waiting for a history refetch issued
    /// after request ticket `after_request`. `message_id` is the id the
    /// backend assigned, when it reported one.
    AwaitingHistory {
        after_request: u64,
        message_id: Option<MessageId>,
    },
    Failed { reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OptimisticMessage {
    pub local_id: LocalMessageId,
    pub conversation_id: Option<ConversationId>,
    pub content: String,
    pub attachments: Vec<AttachmentRef>,
    pub created_at: DateTime<Utc>,
    pub status: EchoStatus,
}

impl OptimisticMessage {
    pub fn sender(&self) -> SenderRole {
        SenderRole::Operator
    }

    pub fn is_unresolved(&self) -> bool {
        !matches!(self.status, EchoStatus::Failed { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutgoingMessage {
    pub conversation_id: Option<ConversationId>,
    pub text: String,
    pub attachments: Vec<AttachmentRef>,
}

impl OutgoingMessage {
    pub fn to_request(&self) -> SendMessageRequest {
        SendMessageRequest {
            conversation_id: self.conversation_id,
            text: self.text.clone(),
            attachments: self.attachments.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryState {
    Delivered,
    Sending,
    Failed { reason: String },
}

/// One row of the reconciled message list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderedMessage {
    pub key: MessageKey,
    pub conversation_id: Option<ConversationId>,
    pub sender: SenderRole,
    pub content: String,
    pub attachments: Vec<AttachmentRef>,
    pub created_at: DateTime<Utc>,
    pub delivery: DeliveryState,
}

impl From<&MessagePayload> for RenderedMessage {
    fn from(message: &MessagePayload) -> Self {
        Self {
            key: MessageKey::Server(message.message_id),
            conversation_id: Some(message.conversation_id),
            sender: message.sender,
            content: message.content.clone(),
            attachments: message.attachments.clone(),
            created_at: message.created_at,
            delivery: DeliveryState::Delivered,
        }
    }
}

impl From<&OptimisticMessage> for RenderedMessage {
    fn from(message: &OptimisticMessage) -> Self {
        let delivery = match &message.status {
            EchoStatus::Failed { reason } => DeliveryState::Failed {
                reason: reason.clone(),
            },
            EchoStatus::Sending
            | EchoStatus::AwaitingEvent
            | EchoStatus::AwaitingHistory { .. } => DeliveryState::Sending,
        };
        Self {
            key: MessageKey::Local(message.local_id),
            conversation_id: message.conversation_id,
            sender: message.sender(),
            content: message.content.clone(),
            attachments: message.attachments.clone(),
            created_at: message.created_at,
            delivery,
        }
    }
}

/// Everything the UI needs to draw the chat screen.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActiveChatView {
    pub conversation_id: Option<ConversationId>,
    pub conversation: Option<ConversationSummary>,
    pub messages: Vec<RenderedMessage>,
    pub is_sending: bool,
    pub connection: ConnectionState,
    pub roster: Vec<ConversationSummary>,
    pub sidebar_visible: bool,
    pub search: String,
    pub roster_error: Option<String>,
    pub history_error: Option<String>,
}

/// Edits from the conversation settings dialog. `None` leaves a field alone;
/// `client_id: Some(None)` clears the client association.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConversationEdit {
    pub client_id: Option<Option<ClientId>>,
    pub participant_ids: Option<Vec<ParticipantId>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChatEvent {
    ViewChanged,
    ConnectionChanged(ConnectionState),
    SendFailed {
        local_id: LocalMessageId,
        reason: String,
    },
    Error(String),
}
