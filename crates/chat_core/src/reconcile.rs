use std::collections::HashMap;

use shared::{
    domain::{ConversationId, MessageId},
    protocol::MessagePayload,
};

use crate::{
    echo::EchoBuffer,
    types::{OptimisticMessage, RenderedMessage},
};

/// Builds the render list: authoritative history by ascending creation time,
/// then optimistic entries in push order.
///
/// No content matching happens between the two halves. An echo disappears
/// only when an event resolves it.
pub fn merge(
    authoritative: &[MessagePayload],
    optimistic: &[OptimisticMessage],
) -> Vec<RenderedMessage> {
    let mut history: Vec<&MessagePayload> = authoritative.iter().collect();
    history.sort_by_key(|message| message.created_at);

    history
        .into_iter()
        .map(RenderedMessage::from)
        .chain(optimistic.iter().map(RenderedMessage::from))
        .collect()
}

/// A pushed message and the newest history ticket issued when it arrived.
/// Responses to requests up to that ticket may predate it.
#[derive(Debug, Clone, Copy)]
struct LivePush {
    message_id: MessageId,
    newest_ticket: u64,
}

#[derive(Debug, Clone, Default)]
struct ConversationHistory {
    messages: Vec<MessagePayload>,
    live: Vec<LivePush>,
    refresh_error: Option<String>,
    applied_ticket: u64,
}

/// Last known authoritative history per conversation.
#[derive(Debug, Default)]
pub struct HistoryStore {
    conversations: HashMap<ConversationId, ConversationHistory>,
}

impl HistoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn messages(&self, conversation_id: ConversationId) -> &[MessagePayload] {
        self.conversations
            .get(&conversation_id)
            .map(|history| history.messages.as_slice())
            .unwrap_or_default()
    }

    pub fn refresh_error(&self, conversation_id: ConversationId) -> Option<&str> {
        self.conversations
            .get(&conversation_id)
            .and_then(|history| history.refresh_error.as_deref())
    }

    /// Installs the result of history request `ticket`. Results of requests
    /// older than the one already applied are dropped. Pushed messages the
    /// response may predate are carried over when it lacks them.
    pub fn replace(
        &mut self,
        conversation_id: ConversationId,
        mut messages: Vec<MessagePayload>,
        ticket: u64,
    ) -> bool {
        let history = self.conversations.entry(conversation_id).or_default();
        if history.applied_ticket > ticket {
            return false;
        }

        history.live.retain(|push| push.newest_ticket >= ticket);
        for push in &history.live {
            if messages.iter().any(|known| known.message_id == push.message_id) {
                continue;
            }
            if let Some(pushed) = history
                .messages
                .iter()
                .find(|known| known.message_id == push.message_id)
            {
                messages.push(pushed.clone());
            }
        }

        history.messages = messages;
        history.refresh_error = None;
        history.applied_ticket = ticket;
        true
    }

    /// Keeps whatever was loaded before and remembers why the refresh failed.
    pub fn record_failure(
        &mut self,
        conversation_id: ConversationId,
        reason: impl Into<String>,
        ticket: u64,
    ) {
        let history = self.conversations.entry(conversation_id).or_default();
        if history.applied_ticket > ticket {
            return;
        }
        history.refresh_error = Some(reason.into());
    }

    /// Adds a pushed message. `newest_ticket` is the latest history request
    /// issued so far. Returns `false` when a message with the same server id
    /// is already known.
    pub fn insert_live(&mut self, message: MessagePayload, newest_ticket: u64) -> bool {
        let history = self.conversations.entry(message.conversation_id).or_default();
        if history
            .messages
            .iter()
            .any(|known| known.message_id == message.message_id)
        {
            return false;
        }
        history.live.push(LivePush {
            message_id: message.message_id,
            newest_ticket,
        });
        history.messages.push(message);
        true
    }

    pub fn invalidate(&mut self, conversation_id: ConversationId) {
        self.conversations.remove(&conversation_id);
    }

    pub fn render(
        &self,
        conversation_id: Option<ConversationId>,
        echo: &EchoBuffer,
    ) -> Vec<RenderedMessage> {
        let authoritative = conversation_id
            .map(|id| self.messages(id))
            .unwrap_or_default();
        merge(authoritative, echo.entries())
    }
}

#[cfg(test)]
#[path = "tests/reconcile_tests.rs"]
mod tests;
