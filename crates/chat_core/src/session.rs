use shared::{
    domain::ConversationId,
    protocol::{ConversationOrdering, ConversationSummary, ListConversationsQuery, MessagePayload},
};
use tracing::info;

use crate::echo::EchoBuffer;

/// Roster, selection and the UI-only bits around them.
#[derive(Debug, Clone)]
pub struct SessionStore {
    roster: Vec<ConversationSummary>,
    active: Option<ConversationId>,
    user_selected: bool,
    sidebar_visible: bool,
    search: String,
    roster_error: Option<String>,
}

impl Default for SessionStore {
    fn default() -> Self {
        Self {
            roster: Vec::new(),
            active: None,
            user_selected: false,
            sidebar_visible: true,
            search: String::new(),
            roster_error: None,
        }
    }
}

impl SessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn active(&self) -> Option<ConversationId> {
        self.active
    }

    pub fn conversation(&self, conversation_id: ConversationId) -> Option<&ConversationSummary> {
        self.roster
            .iter()
            .find(|conversation| conversation.conversation_id == conversation_id)
    }

    pub fn sidebar_visible(&self) -> bool {
        self.sidebar_visible
    }

    pub fn search(&self) -> &str {
        &self.search
    }

    pub fn roster_error(&self) -> Option<&str> {
        self.roster_error.as_deref()
    }

    /// Changes the active conversation. Any real change flushes the echo
    /// buffer; re-selecting the active conversation does not.
    pub fn select(&mut self, next: Option<ConversationId>, echo: &mut EchoBuffer) -> bool {
        self.user_selected = true;
        if self.active == next {
            return false;
        }
        self.active = next;
        echo.rescope(next);
        true
    }

    /// A conversation created by our own send becomes the active one. Only
    /// applies while no conversation is active.
    pub(crate) fn adopt(&mut self, conversation_id: ConversationId) -> bool {
        if self.active.is_some() {
            return false;
        }
        self.active = Some(conversation_id);
        self.user_selected = true;
        true
    }

    /// Installs a freshly fetched roster. On first load, with nothing selected
    /// and nothing pending, the first conversation is selected and returned.
    pub fn apply_roster(
        &mut self,
        mut roster: Vec<ConversationSummary>,
        ordering: ConversationOrdering,
        echo: &mut EchoBuffer,
    ) -> Option<ConversationId> {
        sort_roster(&mut roster, ordering);
        self.roster = roster;
        self.roster_error = None;

        if self.active.is_some() || self.user_selected || !echo.is_empty() {
            return None;
        }
        let first = self.roster.first()?.conversation_id;
        self.active = Some(first);
        echo.rescope(Some(first));
        info!(conversation_id = first.0, "chat: auto-selected first conversation");
        Some(first)
    }

    pub fn record_roster_failure(&mut self, reason: impl Into<String>) {
        self.roster_error = Some(reason.into());
    }

    pub fn upsert(&mut self, conversation: ConversationSummary) {
        match self
            .roster
            .iter_mut()
            .find(|known| known.conversation_id == conversation.conversation_id)
        {
            Some(known) => *known = conversation,
            None => self.roster.insert(0, conversation),
        }
    }

    /// Refreshes the preview line of the conversation a pushed message belongs to.
    pub fn note_message(&mut self, message: &MessagePayload) {
        if let Some(conversation) = self
            .roster
            .iter_mut()
            .find(|known| known.conversation_id == message.conversation_id)
        {
            conversation.last_message_preview = Some(message.content.clone());
            conversation.last_message_at = Some(message.created_at);
        }
    }

    pub fn toggle_sidebar(&mut self) -> bool {
        self.sidebar_visible = !self.sidebar_visible;
        self.sidebar_visible
    }

    pub fn set_search(&mut self, term: impl Into<String>) {
        self.search = term.into();
    }

    pub fn roster_query(&self, ordering: ConversationOrdering) -> ListConversationsQuery {
        let term = self.search.trim();
        ListConversationsQuery {
            search: (!term.is_empty()).then(|| term.to_string()),
            ordering,
        }
    }

    /// Roster narrowed by the search term on title and preview, so typing
    /// filters immediately while the server-side search is still in flight.
    pub fn filtered_roster(&self) -> Vec<ConversationSummary> {
        let term = self.search.trim().to_lowercase();
        if term.is_empty() {
            return self.roster.clone();
        }
        self.roster
            .iter()
            .filter(|conversation| {
                conversation.title.to_lowercase().contains(&term)
                    || conversation
                        .last_message_preview
                        .as_deref()
                        .is_some_and(|preview| preview.to_lowercase().contains(&term))
            })
            .cloned()
            .collect()
    }
}

/// Orders by last-message time. Conversations without messages go last when
/// descending.
pub fn sort_roster(roster: &mut [ConversationSummary], ordering: ConversationOrdering) {
    match ordering {
        ConversationOrdering::LastMessageDesc => {
            roster.sort_by(|a, b| b.last_message_at.cmp(&a.last_message_at))
        }
        ConversationOrdering::LastMessageAsc => {
            roster.sort_by(|a, b| a.last_message_at.cmp(&b.last_message_at))
        }
    }
}

#[cfg(test)]
#[path = "tests/session_tests.rs"]
mod tests;
