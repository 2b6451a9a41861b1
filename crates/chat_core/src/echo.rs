use chrono::Utc;
use shared::{
    domain::{ConversationId, MessageId},
    protocol::AttachmentRef,
};

use crate::types::{EchoStatus, LocalMessageId, OptimisticMessage};

/// Local echoes of sends that the authoritative history has not caught up
/// with yet.
///
/// The buffer is scoped to one conversation (or to "new conversation" while
/// the scope is `None`). Moving the scope discards every entry and bumps the
/// epoch, which lets late completions of discarded sends detect that they no
/// longer apply.
#[derive(Debug, Default)]
pub struct EchoBuffer {
    scope: Option<ConversationId>,
    entries: Vec<OptimisticMessage>,
    epoch: u64,
}

impl EchoBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn scope(&self) -> Option<ConversationId> {
        self.scope
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    pub fn entries(&self) -> &[OptimisticMessage] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn has_unresolved(&self) -> bool {
        self.entries.iter().any(OptimisticMessage::is_unresolved)
    }

    pub fn push(&mut self, content: String, attachments: Vec<AttachmentRef>) -> LocalMessageId {
        let local_id = LocalMessageId::generate();
        self.entries.push(OptimisticMessage {
            local_id,
            conversation_id: self.scope,
            content,
            attachments,
            created_at: Utc::now(),
            status: EchoStatus::Sending,
        });
        local_id
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.epoch += 1;
    }

    pub fn rescope(&mut self, scope: Option<ConversationId>) {
        self.clear();
        self.scope = scope;
    }

    /// Binds a "new conversation" buffer to the id the backend assigned.
    /// Pending entries stay; they belong to the same logical conversation.
    pub fn adopt_conversation(&mut self, conversation_id: ConversationId) -> bool {
        if self.scope.is_some() {
            return false;
        }
        self.scope = Some(conversation_id);
        for entry in &mut self.entries {
            entry.conversation_id = Some(conversation_id);
        }
        true
    }

    /// Resolves the entry whose fallback send was assigned `message_id`.
    pub fn resolve_message(&mut self, message_id: MessageId) -> Option<LocalMessageId> {
        let index = self.entries.iter().position(|entry| {
            matches!(
                entry.status,
                EchoStatus::AwaitingHistory { message_id: Some(known), .. } if known == message_id
            )
        })?;
        Some(self.entries.remove(index).local_id)
    }

    /// Resolves the earliest pushed entry that is still in flight and not yet
    /// tied to a server id. Used for real-time confirmations, which arrive in
    /// send order.
    pub fn resolve_oldest_unresolved(&mut self) -> Option<LocalMessageId> {
        let index = self.entries.iter().position(|entry| match entry.status {
            EchoStatus::Sending | EchoStatus::AwaitingEvent => true,
            EchoStatus::AwaitingHistory { message_id, .. } => message_id.is_none(),
            EchoStatus::Failed { .. } => false,
        })?;
        Some(self.entries.remove(index).local_id)
    }

    /// Resolves every entry whose fallback request finished before history
    /// request `ticket` was issued.
    pub fn resolve_awaiting_history(&mut self, ticket: u64) -> Vec<LocalMessageId> {
        let mut resolved = Vec::new();
        self.entries.retain(|entry| match entry.status {
            EchoStatus::AwaitingHistory { after_request, .. } if after_request < ticket => {
                resolved.push(entry.local_id);
                false
            }
            _ => true,
        });
        resolved
    }

    pub fn mark_awaiting_event(&mut self, local_id: LocalMessageId) -> bool {
        self.set_status(local_id, EchoStatus::AwaitingEvent)
    }

    pub fn mark_awaiting_history(
        &mut self,
        local_id: LocalMessageId,
        after_request: u64,
        message_id: Option<MessageId>,
    ) -> bool {
        self.set_status(
            local_id,
            EchoStatus::AwaitingHistory {
                after_request,
                message_id,
            },
        )
    }

    pub fn mark_failed(&mut self, local_id: LocalMessageId, reason: impl Into<String>) -> bool {
        self.set_status(
            local_id,
            EchoStatus::Failed {
                reason: reason.into(),
            },
        )
    }

    /// Fails every entry still waiting for a real-time confirmation. Called
    /// once the channel that carried them is gone.
    pub fn fail_awaiting_event(&mut self, reason: &str) -> Vec<LocalMessageId> {
        let mut failed = Vec::new();
        for entry in &mut self.entries {
            if entry.status == EchoStatus::AwaitingEvent {
                entry.status = EchoStatus::Failed {
                    reason: reason.to_string(),
                };
                failed.push(entry.local_id);
            }
        }
        failed
    }

    /// Removes a failed entry, handing it back for a retry or a dismissal.
    pub fn take_failed(&mut self, local_id: LocalMessageId) -> Option<OptimisticMessage> {
        let index = self.entries.iter().position(|entry| {
            entry.local_id == local_id && matches!(entry.status, EchoStatus::Failed { .. })
        })?;
        Some(self.entries.remove(index))
    }

    fn set_status(&mut self, local_id: LocalMessageId, status: EchoStatus) -> bool {
        match self
            .entries
            .iter_mut()
            .find(|entry| entry.local_id == local_id && entry.is_unresolved())
        {
            Some(entry) => {
                entry.status = status;
                true
            }
            None => false,
        }
    }
}

#[cfg(test)]
#[path = "tests/echo_tests.rs"]
mod tests;
