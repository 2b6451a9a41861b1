//! The assistant chat screen: roster, active conversation, optimistic sends
//! and the real-time channel, composed behind one handle the UI mounts.

use std::{
    collections::HashSet,
    sync::{Arc, Weak},
};

use anyhow::anyhow;
use async_trait::async_trait;
use shared::{
    domain::{ClientId, ConversationId, MessageId, ParticipantId, SenderRole},
    protocol::{
        AssignParticipantsRequest, AttachmentRef, ConversationOrdering, MessagePayload,
        RealtimeEvent, UpdateConversationRequest,
    },
};
use tokio::{
    sync::{broadcast, mpsc, watch, Mutex},
    task::JoinHandle,
};
use tracing::{debug, info, warn};

use crate::{
    backend::{ChatBackend, HttpChatBackend},
    config::ChatSettings,
    connection::{
        ConnectionManager, ConnectionState, MissingRealtimeConnector, RealtimeConnector,
        Subscription,
    },
    echo::EchoBuffer,
    error::{ConnectionError, FetchError, SendError},
    realtime::WebSocketConnector,
    reconcile::HistoryStore,
    session::SessionStore,
    transport::{Delivery, TransportSelector},
    types::{ActiveChatView, ChatEvent, ConversationEdit, LocalMessageId, OutgoingMessage},
};

const DEFAULT_EVENT_BUFFER: usize = 256;
const CHANNEL_LOST_REASON: &str = "realtime channel lost before the message was confirmed";

#[async_trait]
pub trait ChatActions: Send + Sync {
    async fn select_conversation(&self, conversation_id: ConversationId)
        -> Result<(), FetchError>;
    async fn send_message(
        &self,
        text: &str,
        attachments: Vec<AttachmentRef>,
    ) -> Result<LocalMessageId, SendError>;
    async fn toggle_sidebar(&self) -> bool;
    async fn edit_conversation(
        &self,
        conversation_id: ConversationId,
        edit: ConversationEdit,
    ) -> Result<(), FetchError>;
    async fn view(&self) -> ActiveChatView;
    fn subscribe_events(&self) -> broadcast::Receiver<ChatEvent>;
}

#[derive(Debug, Default)]
struct ChatState {
    session: SessionStore,
    echo: EchoBuffer,
    history: HistoryStore,
    history_requests: u64,
    roster_requests: u64,
    roster_applied: u64,
    /// Operator message ids already matched to an echo.
    confirmed: HashSet<MessageId>,
}

struct LiveOutcome {
    adopted: Option<ConversationId>,
}

impl ChatState {
    fn next_history_ticket(&mut self) -> u64 {
        self.history_requests += 1;
        self.history_requests
    }

    fn next_roster_ticket(&mut self) -> u64 {
        self.roster_requests += 1;
        self.roster_requests
    }

    fn accept_live_message(&mut self, message: MessagePayload) -> LiveOutcome {
        let conversation_id = message.conversation_id;
        let sender = message.sender;

        // First operator message of a conversation we are creating ourselves.
        let mut adopted = None;
        if sender == SenderRole::Operator
            && self.session.active().is_none()
            && self.echo.has_unresolved()
            && self.session.adopt(conversation_id)
        {
            self.echo.adopt_conversation(conversation_id);
            adopted = Some(conversation_id);
        }

        self.session.note_message(&message);

        if self.session.active() != Some(conversation_id) {
            debug!(
                conversation_id = conversation_id.0,
                "chat: message for inactive conversation, dropping cached history"
            );
            self.history.invalidate(conversation_id);
            return LiveOutcome { adopted };
        }

        let message_id = message.message_id;
        self.history.insert_live(message, self.history_requests);
        if sender != SenderRole::Operator {
            return LiveOutcome { adopted };
        }

        // Whether the id is already in history says nothing about whether its
        // echo was matched; a refetch can bring it in before the event.
        let first_sighting = self.confirmed.insert(message_id);
        let resolved = match self.echo.resolve_message(message_id) {
            Some(local_id) => Some(local_id),
            None if first_sighting => self.echo.resolve_oldest_unresolved(),
            None => None,
        };
        if let Some(local_id) = resolved {
            debug!(
                %local_id,
                message_id = message_id.0,
                "chat: echo confirmed by realtime event"
            );
        }
        LiveOutcome { adopted }
    }
}

enum Inbound {
    Event(RealtimeEvent),
    Error(ConnectionError),
}

struct MountedView {
    subscriptions: Vec<Subscription>,
    tasks: Vec<JoinHandle<()>>,
}

pub struct AssistantChat {
    backend: Arc<dyn ChatBackend>,
    connection: ConnectionManager,
    selector: TransportSelector,
    ordering: ConversationOrdering,
    state: Mutex<ChatState>,
    mounted: Mutex<Option<MountedView>>,
    events: broadcast::Sender<ChatEvent>,
}

impl AssistantChat {
    pub fn new(backend: Arc<dyn ChatBackend>, connection: ConnectionManager) -> Arc<Self> {
        Self::with_options(
            backend,
            connection,
            ConversationOrdering::default(),
            DEFAULT_EVENT_BUFFER,
        )
    }

    pub fn with_options(
        backend: Arc<dyn ChatBackend>,
        connection: ConnectionManager,
        ordering: ConversationOrdering,
        event_buffer: usize,
    ) -> Arc<Self> {
        let (events, _) = broadcast::channel(event_buffer.max(1));
        Arc::new(Self {
            selector: TransportSelector::new(connection.clone(), Arc::clone(&backend)),
            backend,
            connection,
            ordering,
            state: Mutex::new(ChatState::default()),
            mounted: Mutex::new(None),
            events,
        })
    }

    pub fn from_settings(settings: &ChatSettings) -> anyhow::Result<Arc<Self>> {
        let http = HttpChatBackend::from_settings(settings)?;
        info!(base_url = http.base_url(), "chat: using backend");
        let backend: Arc<dyn ChatBackend> = Arc::new(http);
        let connector: Arc<dyn RealtimeConnector> = if settings.realtime_enabled {
            let websocket = WebSocketConnector::new(settings.realtime_endpoint()?);
            info!(url = websocket.url(), "chat: realtime endpoint");
            Arc::new(websocket)
        } else {
            info!("chat: realtime channel disabled by configuration");
            Arc::new(MissingRealtimeConnector)
        };
        Ok(Self::with_options(
            backend,
            ConnectionManager::new(connector),
            ConversationOrdering::default(),
            settings.event_buffer,
        ))
    }

    pub fn connection(&self) -> &ConnectionManager {
        &self.connection
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<ChatEvent> {
        self.events.subscribe()
    }

    /// Registers the connection listeners, starts the handshake in the
    /// background and loads the roster. Mounting twice is a no-op.
    pub async fn mount(self: &Arc<Self>) {
        {
            let mut mounted = self.mounted.lock().await;
            if mounted.is_some() {
                debug!("chat: already mounted");
                return;
            }

            let (tx, rx) = mpsc::unbounded_channel();
            let message_tx = tx.clone();
            let on_message = self.connection.on_message(move |event| {
                message_tx
                    .send(Inbound::Event(event.clone()))
                    .map_err(|_| anyhow!("chat view is no longer mounted"))
            });
            let on_error = self.connection.on_error(move |error| {
                tx.send(Inbound::Error(error.clone()))
                    .map_err(|_| anyhow!("chat view is no longer mounted"))
            });

            let pump = tokio::spawn(Self::pump_inbound(Arc::downgrade(self), rx));
            let watcher = tokio::spawn(Self::forward_connection_state(
                self.connection.watch_state(),
                self.events.clone(),
            ));
            *mounted = Some(MountedView {
                subscriptions: vec![on_message, on_error],
                tasks: vec![pump, watcher],
            });
        }

        info!("chat: mounted");
        self.connection.connect();
        if let Err(err) = self.refresh_roster().await {
            debug!("chat: initial roster load failed: {err}");
        }
    }

    /// Releases the connection and everything registered by `mount`. Pending
    /// local echoes are discarded; their sends finish as no-ops.
    pub async fn unmount(&self) {
        let mounted = self.mounted.lock().await.take();
        if let Some(view) = mounted {
            for subscription in view.subscriptions {
                subscription.unsubscribe();
            }
            for task in view.tasks {
                task.abort();
            }
        }
        self.connection.disconnect().await;
        self.state.lock().await.echo.clear();
        info!("chat: unmounted");
    }

    pub async fn is_mounted(&self) -> bool {
        self.mounted.lock().await.is_some()
    }

    pub async fn view(&self) -> ActiveChatView {
        let state = self.state.lock().await;
        let active = state.session.active();
        ActiveChatView {
            conversation_id: active,
            conversation: active.and_then(|id| state.session.conversation(id).cloned()),
            messages: state.history.render(active, &state.echo),
            is_sending: state.echo.has_unresolved(),
            connection: self.connection.state(),
            roster: state.session.filtered_roster(),
            sidebar_visible: state.session.sidebar_visible(),
            search: state.session.search().to_string(),
            roster_error: state.session.roster_error().map(str::to_string),
            history_error: active
                .and_then(|id| state.history.refresh_error(id))
                .map(str::to_string),
        }
    }

    pub async fn select_conversation(
        &self,
        conversation_id: ConversationId,
    ) -> Result<(), FetchError> {
        let changed = {
            let mut guard = self.state.lock().await;
            let state = &mut *guard;
            state.session.select(Some(conversation_id), &mut state.echo)
        };
        if changed {
            info!(conversation_id = conversation_id.0, "chat: conversation selected");
            self.notify_view();
        }
        self.refresh_history(conversation_id).await
    }

    /// Clears the selection so the next send creates a conversation.
    pub async fn start_new_conversation(&self) {
        let changed = {
            let mut guard = self.state.lock().await;
            let state = &mut *guard;
            state.session.select(None, &mut state.echo)
        };
        if changed {
            info!("chat: composing a new conversation");
            self.notify_view();
        }
    }

    /// Shows the message immediately and hands it to a transport in the
    /// background. The returned id identifies the local echo.
    pub async fn send_message(
        self: &Arc<Self>,
        text: impl Into<String>,
        attachments: Vec<AttachmentRef>,
    ) -> Result<LocalMessageId, SendError> {
        let text = text.into();
        if text.trim().is_empty() && attachments.is_empty() {
            return Err(SendError::EmptyMessage);
        }

        let (local_id, outgoing, epoch) = {
            let mut state = self.state.lock().await;
            let conversation_id = state.echo.scope();
            let local_id = state.echo.push(text.clone(), attachments.clone());
            let outgoing = OutgoingMessage {
                conversation_id,
                text,
                attachments,
            };
            (local_id, outgoing, state.echo.epoch())
        };
        debug!(
            %local_id,
            conversation_id = ?outgoing.conversation_id,
            "chat: message queued"
        );
        self.notify_view();

        tokio::spawn(Arc::clone(self).complete_send(local_id, outgoing, epoch));
        Ok(local_id)
    }

    async fn complete_send(
        self: Arc<Self>,
        local_id: LocalMessageId,
        outgoing: OutgoingMessage,
        epoch: u64,
    ) {
        match self.selector.deliver(&outgoing).await {
            Ok(Delivery::RealTime) => {
                // The channel may have dropped between the write and this point.
                let lost = {
                    let mut state = self.state.lock().await;
                    state.echo.epoch() == epoch
                        && state.echo.mark_awaiting_event(local_id)
                        && !self.connection.is_connected()
                };
                if lost {
                    self.fail_unconfirmed().await;
                } else {
                    debug!(%local_id, "chat: awaiting realtime confirmation");
                }
            }
            Ok(Delivery::Fallback(response)) => {
                let conversation_id = response.conversation_id;
                let created = outgoing.conversation_id.is_none();
                let current = {
                    let mut guard = self.state.lock().await;
                    let state = &mut *guard;
                    if state.echo.epoch() != epoch {
                        false
                    } else {
                        if state.echo.scope().is_none() && state.session.adopt(conversation_id) {
                            state.echo.adopt_conversation(conversation_id);
                            info!(
                                conversation_id = conversation_id.0,
                                "chat: new conversation created"
                            );
                        }
                        let after_request = state.history_requests;
                        let message_id =
                            response.message.as_ref().map(|message| message.message_id);
                        if let Some(message_id) = message_id {
                            state.confirmed.insert(message_id);
                        }
                        state
                            .echo
                            .mark_awaiting_history(local_id, after_request, message_id);
                        true
                    }
                };

                if created {
                    if let Err(err) = self.refresh_roster().await {
                        debug!("chat: roster refresh after create failed: {err}");
                    }
                }
                if !current {
                    debug!(%local_id, "chat: send finished for a discarded echo");
                    return;
                }
                self.notify_view();
                if let Err(err) = self.refresh_history(conversation_id).await {
                    debug!(%local_id, "chat: message sent but not yet visible: {err}");
                }
            }
            Err(err) => {
                let reason = err.to_string();
                let marked = {
                    let mut state = self.state.lock().await;
                    state.echo.epoch() == epoch && state.echo.mark_failed(local_id, reason.clone())
                };
                if marked {
                    warn!(%local_id, "chat: {reason}");
                    let _ = self.events.send(ChatEvent::SendFailed { local_id, reason });
                    self.notify_view();
                }
            }
        }
    }

    /// Sends a failed message again as a fresh echo.
    pub async fn retry_failed(
        self: &Arc<Self>,
        local_id: LocalMessageId,
    ) -> Result<LocalMessageId, SendError> {
        let failed = self
            .state
            .lock()
            .await
            .echo
            .take_failed(local_id)
            .ok_or(SendError::UnknownMessage)?;
        debug!(%local_id, "chat: retrying failed message");
        self.send_message(failed.content, failed.attachments).await
    }

    pub async fn dismiss_failed(&self, local_id: LocalMessageId) -> bool {
        let removed = self.state.lock().await.echo.take_failed(local_id).is_some();
        if removed {
            self.notify_view();
        }
        removed
    }

    pub async fn toggle_sidebar(&self) -> bool {
        let visible = self.state.lock().await.session.toggle_sidebar();
        self.notify_view();
        visible
    }

    pub async fn set_search(&self, term: impl Into<String>) -> Result<(), FetchError> {
        self.state.lock().await.session.set_search(term);
        self.notify_view();
        self.refresh_roster().await
    }

    pub async fn refresh_roster(&self) -> Result<(), FetchError> {
        let (query, ticket) = {
            let mut state = self.state.lock().await;
            (state.session.roster_query(self.ordering), state.next_roster_ticket())
        };

        match self.backend.list_conversations(&query).await {
            Ok(roster) => {
                let auto_selected = {
                    let mut guard = self.state.lock().await;
                    let state = &mut *guard;
                    if ticket < state.roster_applied {
                        debug!(ticket, "chat: dropping superseded roster response");
                        return Ok(());
                    }
                    state.roster_applied = ticket;
                    state.session.apply_roster(roster, self.ordering, &mut state.echo)
                };
                self.notify_view();
                if let Some(conversation_id) = auto_selected {
                    // Failures are already recorded in the view.
                    let _ = self.refresh_history(conversation_id).await;
                }
                Ok(())
            }
            Err(err) => {
                let error = FetchError::Roster(format!("{err:#}"));
                {
                    let mut state = self.state.lock().await;
                    if ticket >= state.roster_applied {
                        state.session.record_roster_failure(error.to_string());
                    }
                }
                warn!("chat: {error}");
                let _ = self.events.send(ChatEvent::Error(error.to_string()));
                self.notify_view();
                Err(error)
            }
        }
    }

    /// Refetches the authoritative history. Echoes whose fallback send
    /// finished before this request was issued are resolved by it.
    pub async fn refresh_history(
        &self,
        conversation_id: ConversationId,
    ) -> Result<(), FetchError> {
        let ticket = self.state.lock().await.next_history_ticket();

        match self.backend.list_messages(conversation_id).await {
            Ok(messages) => {
                let resolved = {
                    let mut state = self.state.lock().await;
                    let applied = state.history.replace(conversation_id, messages, ticket);
                    if applied && state.echo.scope() == Some(conversation_id) {
                        state.echo.resolve_awaiting_history(ticket)
                    } else {
                        Vec::new()
                    }
                };
                if !resolved.is_empty() {
                    debug!(
                        conversation_id = conversation_id.0,
                        resolved = resolved.len(),
                        "chat: echoes confirmed by history"
                    );
                }
                self.notify_view();
                Ok(())
            }
            Err(err) => {
                let error = FetchError::History {
                    conversation_id,
                    reason: format!("{err:#}"),
                };
                self.state
                    .lock()
                    .await
                    .history
                    .record_failure(conversation_id, error.to_string(), ticket);
                warn!("chat: {error}");
                let _ = self.events.send(ChatEvent::Error(error.to_string()));
                self.notify_view();
                Err(error)
            }
        }
    }

    /// Retry affordance for a failed roster or history load.
    pub async fn retry_refresh(&self) -> Result<(), FetchError> {
        let roster = self.refresh_roster().await;
        let active = self.state.lock().await.session.active();
        if let Some(conversation_id) = active {
            self.refresh_history(conversation_id).await?;
        }
        roster
    }

    /// Applies the settings dialog: client association and participant
    /// assignment, then refreshes the roster once.
    pub async fn edit_conversation(
        &self,
        conversation_id: ConversationId,
        edit: ConversationEdit,
    ) -> Result<(), FetchError> {
        if let Some(client_id) = edit.client_id {
            self.backend
                .update_conversation(conversation_id, &UpdateConversationRequest { client_id })
                .await
                .map_err(|err| self.mutation_failed(conversation_id, err))?;
            info!(
                conversation_id = conversation_id.0,
                client_id = ?client_id,
                "chat: client association updated"
            );
        }
        if let Some(participant_ids) = edit.participant_ids {
            let count = participant_ids.len();
            self.backend
                .assign_participants(conversation_id, &AssignParticipantsRequest { participant_ids })
                .await
                .map_err(|err| self.mutation_failed(conversation_id, err))?;
            info!(
                conversation_id = conversation_id.0,
                participants = count,
                "chat: participants assigned"
            );
        }

        if let Err(err) = self.refresh_roster().await {
            debug!("chat: roster refresh after edit failed: {err}");
        }
        Ok(())
    }

    pub async fn associate_client(
        &self,
        conversation_id: ConversationId,
        client_id: Option<ClientId>,
    ) -> Result<(), FetchError> {
        self.edit_conversation(
            conversation_id,
            ConversationEdit {
                client_id: Some(client_id),
                participant_ids: None,
            },
        )
        .await
    }

    pub async fn assign_participants(
        &self,
        conversation_id: ConversationId,
        participant_ids: Vec<ParticipantId>,
    ) -> Result<(), FetchError> {
        self.edit_conversation(
            conversation_id,
            ConversationEdit {
                client_id: None,
                participant_ids: Some(participant_ids),
            },
        )
        .await
    }

    fn mutation_failed(&self, conversation_id: ConversationId, err: anyhow::Error) -> FetchError {
        let error = FetchError::Mutation {
            conversation_id,
            reason: format!("{err:#}"),
        };
        warn!("chat: {error}");
        let _ = self.events.send(ChatEvent::Error(error.to_string()));
        error
    }

    async fn apply_realtime_event(&self, event: RealtimeEvent) {
        match event {
            RealtimeEvent::MessageCreated { message } => {
                let outcome = self.state.lock().await.accept_live_message(message);
                self.notify_view();
                if let Some(conversation_id) = outcome.adopted {
                    info!(
                        conversation_id = conversation_id.0,
                        "chat: new conversation created"
                    );
                    if let Err(err) = self.refresh_roster().await {
                        debug!("chat: roster refresh after create failed: {err}");
                    }
                }
            }
            RealtimeEvent::ConversationUpdated { conversation } => {
                self.state.lock().await.session.upsert(conversation);
                self.notify_view();
            }
            RealtimeEvent::Error(api_error) => {
                self.note_connection_error(ConnectionError::Remote(api_error))
                    .await;
            }
        }
    }

    async fn note_connection_error(&self, error: ConnectionError) {
        let _ = self.events.send(ChatEvent::Error(error.to_string()));
        if matches!(error, ConnectionError::Transport(_) | ConnectionError::Closed) {
            self.fail_unconfirmed().await;
        }
    }

    /// Echoes written to a channel that is now gone will never see their
    /// event. They are failed so the operator can retry, and the history is
    /// refetched so a copy that did reach the backend shows up.
    async fn fail_unconfirmed(&self) {
        let (failed, active) = {
            let mut state = self.state.lock().await;
            (
                state.echo.fail_awaiting_event(CHANNEL_LOST_REASON),
                state.session.active(),
            )
        };
        if failed.is_empty() {
            return;
        }
        for local_id in failed {
            warn!(%local_id, "chat: {CHANNEL_LOST_REASON}");
            let _ = self.events.send(ChatEvent::SendFailed {
                local_id,
                reason: CHANNEL_LOST_REASON.to_string(),
            });
        }
        self.notify_view();
        if let Some(conversation_id) = active {
            // Failures are already recorded in the view.
            let _ = self.refresh_history(conversation_id).await;
        }
    }

    async fn pump_inbound(chat: Weak<Self>, mut rx: mpsc::UnboundedReceiver<Inbound>) {
        while let Some(item) = rx.recv().await {
            let Some(chat) = chat.upgrade() else {
                break;
            };
            match item {
                Inbound::Event(event) => chat.apply_realtime_event(event).await,
                Inbound::Error(error) => chat.note_connection_error(error).await,
            }
        }
    }

    async fn forward_connection_state(
        mut state: watch::Receiver<ConnectionState>,
        events: broadcast::Sender<ChatEvent>,
    ) {
        while state.changed().await.is_ok() {
            let current = *state.borrow_and_update();
            let _ = events.send(ChatEvent::ConnectionChanged(current));
        }
    }

    fn notify_view(&self) {
        let _ = self.events.send(ChatEvent::ViewChanged);
    }
}

#[async_trait]
impl ChatActions for Arc<AssistantChat> {
    async fn select_conversation(
        &self,
        conversation_id: ConversationId,
    ) -> Result<(), FetchError> {
        AssistantChat::select_conversation(self, conversation_id).await
    }

    async fn send_message(
        &self,
        text: &str,
        attachments: Vec<AttachmentRef>,
    ) -> Result<LocalMessageId, SendError> {
        AssistantChat::send_message(self, text.to_string(), attachments).await
    }

    async fn toggle_sidebar(&self) -> bool {
        AssistantChat::toggle_sidebar(self).await
    }

    async fn edit_conversation(
        &self,
        conversation_id: ConversationId,
        edit: ConversationEdit,
    ) -> Result<(), FetchError> {
        AssistantChat::edit_conversation(self, conversation_id, edit).await
    }

    async fn view(&self) -> ActiveChatView {
        AssistantChat::view(self).await
    }

    fn subscribe_events(&self) -> broadcast::Receiver<ChatEvent> {
        AssistantChat::subscribe_events(self)
    }
}

#[cfg(test)]
#[path = "tests/chat_tests.rs"]
mod tests;
