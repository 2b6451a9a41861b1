//! The collaborator REST API. It stores conversations and messages and is
//! also the fallback delivery channel.

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use shared::{
    domain::ConversationId,
    protocol::{
        AssignParticipantsRequest, ConversationSummary, ListConversationsQuery, MessagePayload,
        SendMessageRequest, SendMessageResponse, UpdateConversationRequest,
    },
};

use crate::config::ChatSettings;

#[async_trait]
pub trait ChatBackend: Send + Sync {
    async fn list_conversations(
        &self,
        query: &ListConversationsQuery,
    ) -> Result<Vec<ConversationSummary>>;
    async fn list_messages(&self, conversation_id: ConversationId) -> Result<Vec<MessagePayload>>;
    async fn send_message(&self, request: &SendMessageRequest) -> Result<SendMessageResponse>;
    async fn update_conversation(
        &self,
        conversation_id: ConversationId,
        request: &UpdateConversationRequest,
    ) -> Result<()>;
    async fn assign_participants(
        &self,
        conversation_id: ConversationId,
        request: &AssignParticipantsRequest,
    ) -> Result<()>;
}

pub struct HttpChatBackend {
    http: Client,
    base_url: String,
}

impl HttpChatBackend {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self::with_client(Client::new(), base_url)
    }

    pub fn with_client(http: Client, base_url: impl Into<String>) -> Self {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        Self { http, base_url }
    }

    pub fn from_settings(settings: &ChatSettings) -> Result<Self> {
        let http = Client::builder()
            .timeout(Duration::from_secs(settings.request_timeout_secs))
            .build()
            .context("failed to build http client")?;
        Ok(Self::with_client(http, settings.api_base_url.clone()))
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }
}

#[async_trait]
impl ChatBackend for HttpChatBackend {
    async fn list_conversations(
        &self,
        query: &ListConversationsQuery,
    ) -> Result<Vec<ConversationSummary>> {
        let conversations = self
            .http
            .get(format!("{}/conversations/", self.base_url))
            .query(query)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await
            .context("invalid conversation list from server")?;
        Ok(conversations)
    }

    async fn list_messages(&self, conversation_id: ConversationId) -> Result<Vec<MessagePayload>> {
        let messages = self
            .http
            .get(format!(
                "{}/conversations/{}/messages/",
                self.base_url, conversation_id.0
            ))
            .send()
            .await?
            .error_for_status()?
            .json()
            .await
            .with_context(|| format!("invalid message list for conversation {conversation_id}"))?;
        Ok(messages)
    }

    async fn send_message(&self, request: &SendMessageRequest) -> Result<SendMessageResponse> {
        let response = self
            .http
            .post(format!("{}/messages/", self.base_url))
            .json(request)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await
            .context("invalid send response from server")?;
        Ok(response)
    }

    async fn update_conversation(
        &self,
        conversation_id: ConversationId,
        request: &UpdateConversationRequest,
    ) -> Result<()> {
        self.http
            .patch(format!(
                "{}/conversations/{}/",
                self.base_url, conversation_id.0
            ))
            .json(request)
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }

    async fn assign_participants(
        &self,
        conversation_id: ConversationId,
        request: &AssignParticipantsRequest,
    ) -> Result<()> {
        self.http
            .post(format!(
                "{}/conversations/{}/participants/",
                self.base_url, conversation_id.0
            ))
            .json(request)
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }
}

#[cfg(test)]
#[path = "tests/backend_tests.rs"]
mod tests;
