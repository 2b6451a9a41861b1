use std::sync::Arc;

use shared::protocol::{RealtimeRequest, SendMessageResponse};
use tracing::{debug, error, warn};

use crate::{
    backend::ChatBackend,
    connection::{ConnectionManager, ConnectionState},
    error::SendError,
    types::OutgoingMessage,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transport {
    RealTime,
    Fallback,
}

pub fn choose_transport(state: ConnectionState) -> Transport {
    match state {
        ConnectionState::Connected => Transport::RealTime,
        ConnectionState::Disconnected | ConnectionState::Connecting | ConnectionState::Errored => {
            Transport::Fallback
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Delivery {
    /// Written to the real-time channel; confirmation arrives as an event.
    RealTime,
    /// Accepted by the fallback endpoint; history must be refetched.
    Fallback(SendMessageResponse),
}

impl Delivery {
    pub fn transport(&self) -> Transport {
        match self {
            Delivery::RealTime => Transport::RealTime,
            Delivery::Fallback(_) => Transport::Fallback,
        }
    }
}

#[derive(Clone)]
pub struct TransportSelector {
    connection: ConnectionManager,
    backend: Arc<dyn ChatBackend>,
}

impl TransportSelector {
    pub fn new(connection: ConnectionManager, backend: Arc<dyn ChatBackend>) -> Self {
        Self {
            connection,
            backend,
        }
    }

    /// Delivers one logical send over exactly one transport. The fallback
    /// request is only issued when the real-time path was not taken or its
    /// write failed.
    pub async fn deliver(&self, outgoing: &OutgoingMessage) -> Result<Delivery, SendError> {
        let request = outgoing.to_request();

        let realtime_error = match choose_transport(self.connection.state()) {
            Transport::RealTime => {
                match self
                    .connection
                    .send(RealtimeRequest::SendMessage(request.clone()))
                    .await
                {
                    Ok(()) => {
                        debug!(
                            conversation_id = ?request.conversation_id,
                            "transport: sent over realtime channel"
                        );
                        return Ok(Delivery::RealTime);
                    }
                    Err(err) => {
                        warn!(
                            conversation_id = ?request.conversation_id,
                            "transport: realtime send failed, falling back: {err}"
                        );
                        Some(err)
                    }
                }
            }
            Transport::Fallback => None,
        };

        match self.backend.send_message(&request).await {
            Ok(response) => {
                debug!(
                    conversation_id = response.conversation_id.0,
                    "transport: sent over fallback channel"
                );
                Ok(Delivery::Fallback(response))
            }
            Err(err) => {
                error!(
                    conversation_id = ?request.conversation_id,
                    realtime_attempted = realtime_error.is_some(),
                    "transport: fallback send failed: {err:#}"
                );
                Err(SendError::Undelivered {
                    realtime: realtime_error,
                    fallback: format!("{err:#}"),
                })
            }
        }
    }
}

#[cfg(test)]
#[path = "tests/transport_tests.rs"]
mod tests;
