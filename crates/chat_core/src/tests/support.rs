use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, AtomicI64, AtomicUsize, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use shared::{
    domain::{ClientId, ConversationId, MessageId, ParticipantId, SenderRole},
    protocol::{
        AssignParticipantsRequest, ConversationSummary, ListConversationsQuery, MessagePayload,
        RealtimeEvent, RealtimeRequest, SendMessageRequest, SendMessageResponse,
        UpdateConversationRequest,
    },
};
use tokio::sync::{mpsc, Notify};

use crate::{
    backend::ChatBackend,
    chat::AssistantChat,
    connection::{
        ChannelFrame, ChannelHandle, ConnectionManager, ConnectionState, RealtimeConnector,
        RealtimeSink,
    },
    types::ActiveChatView,
};

pub(crate) fn base_time() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 1, 1, 9, 0, 0)
        .single()
        .expect("valid base time")
}

pub(crate) fn at(minutes: i64) -> DateTime<Utc> {
    base_time() + chrono::Duration::minutes(minutes)
}

pub(crate) fn conversation(
    id: i64,
    title: &str,
    last_message_minutes: Option<i64>,
) -> ConversationSummary {
    ConversationSummary {
        conversation_id: ConversationId(id),
        title: title.to_string(),
        client_id: None,
        last_message_preview: None,
        last_message_at: last_message_minutes.map(at),
        participant_ids: Vec::new(),
    }
}

pub(crate) fn message(
    id: i64,
    conversation_id: i64,
    sender: SenderRole,
    content: &str,
    minutes: i64,
) -> MessagePayload {
    MessagePayload {
        message_id: MessageId(id),
        conversation_id: ConversationId(conversation_id),
        sender,
        content: content.to_string(),
        created_at: at(minutes),
        attachments: Vec::new(),
    }
}

pub(crate) async fn wait_until(mut check: impl FnMut() -> bool) {
    for _ in 0..200 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not met within 2s");
}

pub(crate) async fn wait_for_state(manager: &ConnectionManager, expected: ConnectionState) {
    let mut state = manager.watch_state();
    tokio::time::timeout(
        Duration::from_secs(2),
        state.wait_for(|current| *current == expected),
    )
    .await
    .expect("timed out waiting for connection state")
    .expect("connection state channel closed");
}

pub(crate) async fn wait_for_view(
    chat: &AssistantChat,
    check: impl Fn(&ActiveChatView) -> bool,
) -> ActiveChatView {
    for _ in 0..200 {
        let view = chat.view().await;
        if check(&view) {
            return view;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("view never reached expected state: {:#?}", chat.view().await);
}

/// The far end of the most recently opened mock channel.
#[derive(Clone, Default)]
pub(crate) struct MockRemote {
    inner: Arc<RemoteState>,
}

#[derive(Default)]
struct RemoteState {
    inbound: Mutex<Option<mpsc::UnboundedSender<ChannelFrame>>>,
    sent: Mutex<Vec<RealtimeRequest>>,
    fail_sends: AtomicBool,
    closed: AtomicBool,
}

impl MockRemote {
    fn attach(&self, inbound: mpsc::UnboundedSender<ChannelFrame>) {
        *self.inner.inbound.lock().unwrap() = Some(inbound);
        self.inner.closed.store(false, Ordering::SeqCst);
    }

    pub(crate) fn push_event(&self, event: RealtimeEvent) -> bool {
        self.push_frame(ChannelFrame::Event(event))
    }

    pub(crate) fn push_frame(&self, frame: ChannelFrame) -> bool {
        match self.inner.inbound.lock().unwrap().as_ref() {
            Some(inbound) => inbound.send(frame).is_ok(),
            None => false,
        }
    }

    /// Drops the inbound side as if the server went away.
    pub(crate) fn hang_up(&self) {
        self.inner.inbound.lock().unwrap().take();
    }

    pub(crate) fn sent(&self) -> Vec<RealtimeRequest> {
        self.inner.sent.lock().unwrap().clone()
    }

    pub(crate) fn fail_sends(&self) {
        self.inner.fail_sends.store(true, Ordering::SeqCst);
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }
}

struct MockSink {
    remote: MockRemote,
}

#[async_trait]
impl RealtimeSink for MockSink {
    async fn send(&self, request: RealtimeRequest) -> Result<()> {
        if self.remote.inner.fail_sends.load(Ordering::SeqCst) {
            return Err(anyhow!("socket reset"));
        }
        self.remote.inner.sent.lock().unwrap().push(request);
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.remote.inner.closed.store(true, Ordering::SeqCst);
        self.remote.hang_up();
        Ok(())
    }
}

pub(crate) struct MockConnector {
    remote: MockRemote,
    refuse: Option<String>,
    gate: Option<Arc<Notify>>,
    opens: AtomicUsize,
}

impl MockConnector {
    pub(crate) fn accepting() -> Arc<Self> {
        Arc::new(Self {
            remote: MockRemote::default(),
            refuse: None,
            gate: None,
            opens: AtomicUsize::new(0),
        })
    }

    pub(crate) fn refusing(reason: &str) -> Arc<Self> {
        Arc::new(Self {
            remote: MockRemote::default(),
            refuse: Some(reason.to_string()),
            gate: None,
            opens: AtomicUsize::new(0),
        })
    }

    /// Handshakes block until the returned gate is notified.
    pub(crate) fn gated() -> (Arc<Self>, Arc<Notify>) {
        let gate = Arc::new(Notify::new());
        let connector = Arc::new(Self {
            remote: MockRemote::default(),
            refuse: None,
            gate: Some(Arc::clone(&gate)),
            opens: AtomicUsize::new(0),
        });
        (connector, gate)
    }

    pub(crate) fn remote(&self) -> MockRemote {
        self.remote.clone()
    }

    pub(crate) fn opens(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl RealtimeConnector for MockConnector {
    async fn open(&self) -> Result<ChannelHandle> {
        self.opens.fetch_add(1, Ordering::SeqCst);
        if let Some(gate) = &self.gate {
            gate.notified().await;
        }
        if let Some(reason) = &self.refuse {
            return Err(anyhow!(reason.clone()));
        }
        let (tx, rx) = mpsc::unbounded_channel();
        self.remote.attach(tx);
        Ok(ChannelHandle {
            sink: Arc::new(MockSink {
                remote: self.remote.clone(),
            }),
            inbound: rx,
        })
    }
}

/// In-memory collaborator backend.
pub(crate) struct MockBackend {
    conversations: Mutex<Vec<ConversationSummary>>,
    messages: Mutex<HashMap<ConversationId, Vec<MessagePayload>>>,
    sent: Mutex<Vec<SendMessageRequest>>,
    queries: Mutex<Vec<ListConversationsQuery>>,
    client_updates: Mutex<Vec<(ConversationId, Option<ClientId>)>>,
    assignments: Mutex<Vec<(ConversationId, Vec<ParticipantId>)>>,
    send_gate: Mutex<Option<Arc<Notify>>>,
    history_gate: Mutex<Option<Arc<Notify>>>,
    fail_sends: AtomicBool,
    fail_history: AtomicBool,
    fail_roster: AtomicBool,
    fail_mutations: AtomicBool,
    persist_sends: AtomicBool,
    completed_sends: AtomicUsize,
    history_calls: AtomicUsize,
    next_conversation_id: AtomicI64,
    next_message_id: AtomicI64,
}

impl Default for MockBackend {
    fn default() -> Self {
        Self {
            conversations: Mutex::new(Vec::new()),
            messages: Mutex::new(HashMap::new()),
            sent: Mutex::new(Vec::new()),
            queries: Mutex::new(Vec::new()),
            client_updates: Mutex::new(Vec::new()),
            assignments: Mutex::new(Vec::new()),
            send_gate: Mutex::new(None),
            history_gate: Mutex::new(None),
            fail_sends: AtomicBool::new(false),
            fail_history: AtomicBool::new(false),
            fail_roster: AtomicBool::new(false),
            fail_mutations: AtomicBool::new(false),
            persist_sends: AtomicBool::new(true),
            completed_sends: AtomicUsize::new(0),
            history_calls: AtomicUsize::new(0),
            next_conversation_id: AtomicI64::new(100),
            next_message_id: AtomicI64::new(1000),
        }
    }
}

impl MockBackend {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn with_conversations(self, conversations: Vec<ConversationSummary>) -> Self {
        *self.conversations.lock().unwrap() = conversations;
        self
    }

    pub(crate) fn with_messages(self, conversation_id: i64, messages: Vec<MessagePayload>) -> Self {
        self.messages
            .lock()
            .unwrap()
            .insert(ConversationId(conversation_id), messages);
        self
    }

    /// Sends park until the returned gate is notified, once per send.
    pub(crate) fn gate_sends(&self) -> Arc<Notify> {
        let gate = Arc::new(Notify::new());
        *self.send_gate.lock().unwrap() = Some(Arc::clone(&gate));
        gate
    }

    /// The next history read takes its snapshot, then parks until the
    /// returned gate is notified. Later reads are not held.
    pub(crate) fn gate_next_history(&self) -> Arc<Notify> {
        let gate = Arc::new(Notify::new());
        *self.history_gate.lock().unwrap() = Some(Arc::clone(&gate));
        gate
    }

    pub(crate) fn set_fail_sends(&self, fail: bool) {
        self.fail_sends.store(fail, Ordering::SeqCst);
    }

    pub(crate) fn set_fail_history(&self, fail: bool) {
        self.fail_history.store(fail, Ordering::SeqCst);
    }

    pub(crate) fn set_fail_roster(&self, fail: bool) {
        self.fail_roster.store(fail, Ordering::SeqCst);
    }

    pub(crate) fn set_fail_mutations(&self, fail: bool) {
        self.fail_mutations.store(fail, Ordering::SeqCst);
    }

    /// When off, accepted sends do not show up in history.
    pub(crate) fn set_persist_sends(&self, persist: bool) {
        self.persist_sends.store(persist, Ordering::SeqCst);
    }

    pub(crate) fn push_message(&self, message: MessagePayload) {
        self.messages
            .lock()
            .unwrap()
            .entry(message.conversation_id)
            .or_default()
            .push(message);
    }

    pub(crate) fn sent(&self) -> Vec<SendMessageRequest> {
        self.sent.lock().unwrap().clone()
    }

    pub(crate) fn completed_sends(&self) -> usize {
        self.completed_sends.load(Ordering::SeqCst)
    }

    pub(crate) fn history_calls(&self) -> usize {
        self.history_calls.load(Ordering::SeqCst)
    }

    pub(crate) fn queries(&self) -> Vec<ListConversationsQuery> {
        self.queries.lock().unwrap().clone()
    }

    pub(crate) fn client_updates(&self) -> Vec<(ConversationId, Option<ClientId>)> {
        self.client_updates.lock().unwrap().clone()
    }

    pub(crate) fn assignments(&self) -> Vec<(ConversationId, Vec<ParticipantId>)> {
        self.assignments.lock().unwrap().clone()
    }

    fn mutation_result(&self) -> Result<()> {
        if self.fail_mutations.load(Ordering::SeqCst) {
            return Err(anyhow!("403 forbidden"));
        }
        Ok(())
    }
}

#[async_trait]
impl ChatBackend for MockBackend {
    async fn list_conversations(
        &self,
        query: &ListConversationsQuery,
    ) -> Result<Vec<ConversationSummary>> {
        self.queries.lock().unwrap().push(query.clone());
        if self.fail_roster.load(Ordering::SeqCst) {
            return Err(anyhow!("502 bad gateway"));
        }
        let conversations = self.conversations.lock().unwrap().clone();
        Ok(match &query.search {
            Some(term) => conversations
                .into_iter()
                .filter(|conversation| conversation.title.contains(term.as_str()))
                .collect(),
            None => conversations,
        })
    }

    async fn list_messages(&self, conversation_id: ConversationId) -> Result<Vec<MessagePayload>> {
        self.history_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_history.load(Ordering::SeqCst) {
            return Err(anyhow!("503 service unavailable"));
        }
        let snapshot = self
            .messages
            .lock()
            .unwrap()
            .get(&conversation_id)
            .cloned()
            .unwrap_or_default();
        let gate = self.history_gate.lock().unwrap().take();
        if let Some(gate) = gate {
            gate.notified().await;
        }
        Ok(snapshot)
    }

    async fn send_message(&self, request: &SendMessageRequest) -> Result<SendMessageResponse> {
        self.sent.lock().unwrap().push(request.clone());
        let gate = self.send_gate.lock().unwrap().clone();
        if let Some(gate) = gate {
            gate.notified().await;
        }
        let result = self.accept_send(request);
        self.completed_sends.fetch_add(1, Ordering::SeqCst);
        result
    }

    async fn update_conversation(
        &self,
        conversation_id: ConversationId,
        request: &UpdateConversationRequest,
    ) -> Result<()> {
        self.mutation_result()?;
        self.client_updates
            .lock()
            .unwrap()
            .push((conversation_id, request.client_id));
        if let Some(conversation) = self
            .conversations
            .lock()
            .unwrap()
            .iter_mut()
            .find(|conversation| conversation.conversation_id == conversation_id)
        {
            conversation.client_id = request.client_id;
        }
        Ok(())
    }

    async fn assign_participants(
        &self,
        conversation_id: ConversationId,
        request: &AssignParticipantsRequest,
    ) -> Result<()> {
        self.mutation_result()?;
        self.assignments
            .lock()
            .unwrap()
            .push((conversation_id, request.participant_ids.clone()));
        if let Some(conversation) = self
            .conversations
            .lock()
            .unwrap()
            .iter_mut()
            .find(|conversation| conversation.conversation_id == conversation_id)
        {
            conversation.participant_ids = request.participant_ids.clone();
        }
        Ok(())
    }
}

impl MockBackend {
    fn accept_send(&self, request: &SendMessageRequest) -> Result<SendMessageResponse> {
        if self.fail_sends.load(Ordering::SeqCst) {
            return Err(anyhow!("500 internal server error"));
        }

        let conversation_id = match request.conversation_id {
            Some(conversation_id) => conversation_id,
            None => {
                let conversation_id =
                    ConversationId(self.next_conversation_id.fetch_add(1, Ordering::SeqCst));
                let mut summary = conversation(conversation_id.0, &request.text, None);
                summary.last_message_at = Some(Utc::now());
                self.conversations.lock().unwrap().insert(0, summary);
                conversation_id
            }
        };

        let id = self.next_message_id.fetch_add(1, Ordering::SeqCst);
        let stored = MessagePayload {
            message_id: MessageId(id),
            conversation_id,
            sender: SenderRole::Operator,
            content: request.text.clone(),
            created_at: at(id),
            attachments: request.attachments.clone(),
        };
        if self.persist_sends.load(Ordering::SeqCst) {
            self.push_message(stored.clone());
        }
        Ok(SendMessageResponse {
            conversation_id,
            message: Some(stored),
            reply: None,
        })
    }
}

pub(crate) fn chat_with(
    backend: MockBackend,
    connector: Arc<MockConnector>,
) -> (Arc<AssistantChat>, Arc<MockBackend>) {
    let backend = Arc::new(backend);
    let chat = AssistantChat::new(backend.clone(), ConnectionManager::new(connector));
    (chat, backend)
}
