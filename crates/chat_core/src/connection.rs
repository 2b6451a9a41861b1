//! Lifecycle of the real-time channel.
//!
//! The manager owns at most one open channel. `connect()` only spawns the
//! handshake, so callers never wait on it; until it succeeds every send goes
//! through the fallback transport. Listener callbacks run on the reader task in
//! arrival order.

use std::{
    collections::BTreeMap,
    panic::{catch_unwind, AssertUnwindSafe},
    sync::{Arc, Mutex, MutexGuard, PoisonError, Weak},
};

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use shared::protocol::{RealtimeEvent, RealtimeRequest};
use tokio::{
    sync::{mpsc, watch},
    task::JoinHandle,
};
use tracing::{debug, error, info, warn};

use crate::error::ConnectionError;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Errored,
}

/// Inbound traffic from an open channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelFrame {
    Event(RealtimeEvent),
    /// Fatal transport failure; the channel is unusable afterwards.
    Error(String),
    Closed,
}

#[async_trait]
pub trait RealtimeSink: Send + Sync {
    async fn send(&self, request: RealtimeRequest) -> Result<()>;
    async fn close(&self) -> Result<()>;
}

pub struct ChannelHandle {
    pub sink: Arc<dyn RealtimeSink>,
    pub inbound: mpsc::UnboundedReceiver<ChannelFrame>,
}

#[async_trait]
pub trait RealtimeConnector: Send + Sync {
    async fn open(&self) -> Result<ChannelHandle>;
}

/// Connector used when real-time delivery is disabled; every handshake fails
/// and the chat runs entirely on the fallback transport.
pub struct MissingRealtimeConnector;

#[async_trait]
impl RealtimeConnector for MissingRealtimeConnector {
    async fn open(&self) -> Result<ChannelHandle> {
        Err(anyhow!("realtime channel is disabled"))
    }
}

type MessageHandler = Arc<dyn Fn(&RealtimeEvent) -> Result<()> + Send + Sync>;
type ErrorHandler = Arc<dyn Fn(&ConnectionError) -> Result<()> + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ListenerKind {
    Message,
    Error,
}

/// Handle returned by [`ConnectionManager::on_message`] and
/// [`ConnectionManager::on_error`].
#[must_use = "dropping a Subscription keeps the listener registered; call unsubscribe()"]
pub struct Subscription {
    id: u64,
    kind: ListenerKind,
    shared: Weak<Shared>,
}

impl Subscription {
    pub fn unsubscribe(self) {
        let Some(shared) = self.shared.upgrade() else {
            return;
        };
        let mut inner = shared.lock();
        match self.kind {
            ListenerKind::Message => {
                inner.message_listeners.remove(&self.id);
            }
            ListenerKind::Error => {
                inner.error_listeners.remove(&self.id);
            }
        }
    }
}

#[derive(Clone)]
pub struct ConnectionManager {
    shared: Arc<Shared>,
}

struct Shared {
    connector: Arc<dyn RealtimeConnector>,
    state: watch::Sender<ConnectionState>,
    inner: Mutex<Inner>,
}

#[derive(Default)]
struct Inner {
    generation: u64,
    sink: Option<Arc<dyn RealtimeSink>>,
    connect_task: Option<JoinHandle<()>>,
    reader_task: Option<JoinHandle<()>>,
    next_listener_id: u64,
    message_listeners: BTreeMap<u64, MessageHandler>,
    error_listeners: BTreeMap<u64, ErrorHandler>,
}

impl ConnectionManager {
    pub fn new(connector: Arc<dyn RealtimeConnector>) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            shared: Arc::new(Shared {
                connector,
                state,
                inner: Mutex::new(Inner::default()),
            }),
        }
    }

    pub fn state(&self) -> ConnectionState {
        *self.shared.state.borrow()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.shared.state.subscribe()
    }

    /// Starts the handshake in the background. A no-op while a handshake is
    /// already running or the channel is open.
    pub fn connect(&self) {
        let generation = {
            let mut inner = self.shared.lock();
            let current = self.state();
            if matches!(
                current,
                ConnectionState::Connecting | ConnectionState::Connected
            ) {
                debug!(state = ?current, "realtime: connect ignored");
                return;
            }
            inner.generation += 1;
            self.shared.set_state(ConnectionState::Connecting);
            inner.generation
        };

        info!(generation, "realtime: connecting");
        let shared = Arc::clone(&self.shared);
        let task = tokio::spawn(async move {
            let result = shared.connector.open().await;
            Shared::finish_connect(&shared, generation, result).await;
        });

        let mut inner = self.shared.lock();
        if inner.generation == generation {
            inner.connect_task = Some(task);
        }
    }

    /// Closes the channel, cancels any pending handshake and drops every
    /// listener. Safe to call repeatedly.
    pub async fn disconnect(&self) {
        let (sink, connect_task, reader_task, previous) = {
            let mut inner = self.shared.lock();
            inner.generation += 1;
            inner.message_listeners.clear();
            inner.error_listeners.clear();
            let previous = self.state();
            self.shared.set_state(ConnectionState::Disconnected);
            (
                inner.sink.take(),
                inner.connect_task.take(),
                inner.reader_task.take(),
                previous,
            )
        };

        if let Some(task) = connect_task {
            task.abort();
        }
        if let Some(task) = reader_task {
            task.abort();
        }
        if let Some(sink) = sink {
            if let Err(err) = sink.close().await {
                debug!("realtime: close after disconnect failed: {err:#}");
            }
        }
        if previous != ConnectionState::Disconnected {
            info!(previous = ?previous, "realtime: disconnected");
        }
    }

    /// Sends over the open channel. Any failure leaves the manager `Errored`.
    pub async fn send(&self, request: RealtimeRequest) -> Result<(), ConnectionError> {
        let (sink, generation) = {
            let inner = self.shared.lock();
            if self.state() != ConnectionState::Connected {
                return Err(ConnectionError::NotConnected);
            }
            match inner.sink.clone() {
                Some(sink) => (sink, inner.generation),
                None => return Err(ConnectionError::NotConnected),
            }
        };

        if let Err(err) = sink.send(request).await {
            let error = ConnectionError::Transport(format!("send failed: {err:#}"));
            if let Some(reader) = self.shared.channel_lost(generation, error.clone()).await {
                reader.abort();
            }
            return Err(error);
        }
        Ok(())
    }

    pub fn on_message<F>(&self, handler: F) -> Subscription
    where
        F: Fn(&RealtimeEvent) -> Result<()> + Send + Sync + 'static,
    {
        let mut inner = self.shared.lock();
        inner.next_listener_id += 1;
        let id = inner.next_listener_id;
        inner.message_listeners.insert(id, Arc::new(handler));
        Subscription {
            id,
            kind: ListenerKind::Message,
            shared: Arc::downgrade(&self.shared),
        }
    }

    pub fn on_error<F>(&self, handler: F) -> Subscription
    where
        F: Fn(&ConnectionError) -> Result<()> + Send + Sync + 'static,
    {
        let mut inner = self.shared.lock();
        inner.next_listener_id += 1;
        let id = inner.next_listener_id;
        inner.error_listeners.insert(id, Arc::new(handler));
        Subscription {
            id,
            kind: ListenerKind::Error,
            shared: Arc::downgrade(&self.shared),
        }
    }

    pub fn listener_count(&self) -> usize {
        let inner = self.shared.lock();
        inner.message_listeners.len() + inner.error_listeners.len()
    }
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_state(&self, next: ConnectionState) {
        let previous = self.state.send_replace(next);
        if previous != next {
            debug!(?previous, ?next, "realtime: state changed");
        }
    }

    async fn finish_connect(
        shared: &Arc<Shared>,
        generation: u64,
        result: Result<ChannelHandle>,
    ) {
        match result {
            Ok(ChannelHandle { sink, inbound }) => {
                let accepted = {
                    let mut inner = shared.lock();
                    if inner.generation == generation {
                        inner.sink = Some(Arc::clone(&sink));
                        inner.connect_task = None;
                        inner.reader_task = Some(tokio::spawn(Shared::read_loop(
                            Arc::clone(shared),
                            generation,
                            inbound,
                        )));
                        shared.set_state(ConnectionState::Connected);
                        true
                    } else {
                        false
                    }
                };
                if accepted {
                    info!(generation, "realtime: connected");
                } else {
                    debug!(generation, "realtime: discarding stale handshake");
                    if let Err(err) = sink.close().await {
                        debug!("realtime: closing stale channel failed: {err:#}");
                    }
                }
            }
            Err(err) => {
                let error = ConnectionError::Handshake(format!("{err:#}"));
                {
                    let mut inner = shared.lock();
                    if inner.generation != generation {
                        return;
                    }
                    inner.connect_task = None;
                    shared.set_state(ConnectionState::Errored);
                }
                warn!(generation, "realtime: {error}; using fallback transport");
                shared.dispatch_error(&error);
            }
        }
    }

    async fn read_loop(
        shared: Arc<Shared>,
        generation: u64,
        mut inbound: mpsc::UnboundedReceiver<ChannelFrame>,
    ) {
        let lost = loop {
            match inbound.recv().await {
                Some(ChannelFrame::Event(RealtimeEvent::Error(api_error))) => {
                    shared.dispatch_error(&ConnectionError::Remote(api_error));
                }
                Some(ChannelFrame::Event(event)) => shared.dispatch_message(&event),
                Some(ChannelFrame::Error(reason)) => break ConnectionError::Transport(reason),
                Some(ChannelFrame::Closed) | None => break ConnectionError::Closed,
            }
        };
        // The handle returned here is this task's own; dropping it does not abort.
        let _ = shared.channel_lost(generation, lost).await;
    }

    /// Marks the open channel of `generation` as gone. Returns the reader task
    /// handle so a caller outside the reader can abort it.
    async fn channel_lost(
        &self,
        generation: u64,
        error: ConnectionError,
    ) -> Option<JoinHandle<()>> {
        let (sink, reader) = {
            let mut inner = self.lock();
            if inner.generation != generation || inner.sink.is_none() {
                return None;
            }
            self.set_state(ConnectionState::Errored);
            (inner.sink.take(), inner.reader_task.take())
        };

        warn!(generation, "realtime: channel lost: {error}");
        self.dispatch_error(&error);
        if let Some(sink) = sink {
            if let Err(err) = sink.close().await {
                debug!("realtime: close after loss failed: {err:#}");
            }
        }
        reader
    }

    fn dispatch_message(&self, event: &RealtimeEvent) {
        let handlers: Vec<(u64, MessageHandler)> = {
            let inner = self.lock();
            inner
                .message_listeners
                .iter()
                .map(|(id, handler)| (*id, Arc::clone(handler)))
                .collect()
        };
        for (id, handler) in handlers {
            invoke_listener(id, "message", || handler(event));
        }
    }

    fn dispatch_error(&self, error: &ConnectionError) {
        let handlers: Vec<(u64, ErrorHandler)> = {
            let inner = self.lock();
            inner
                .error_listeners
                .iter()
                .map(|(id, handler)| (*id, Arc::clone(handler)))
                .collect()
        };
        for (id, handler) in handlers {
            invoke_listener(id, "error", || handler(error));
        }
    }
}

fn invoke_listener(listener_id: u64, kind: &'static str, call: impl FnOnce() -> Result<()>) {
    match catch_unwind(AssertUnwindSafe(call)) {
        Ok(Ok(())) => {}
        Ok(Err(err)) => warn!(listener_id, kind, "realtime: listener failed: {err:#}"),
        Err(_) => error!(listener_id, kind, "realtime: listener panicked"),
    }
}

#[cfg(test)]
#[path = "tests/connection_tests.rs"]
mod tests;
