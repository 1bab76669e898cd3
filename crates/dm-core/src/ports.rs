//! Backend ports.
//!
//! The managed backend is reached only through these traits so the session
//! runtime can run against the in-memory backend in tests and the smoke app.

use async_trait::async_trait;

use crate::{
    channel::{ChangeFilter, Subscription},
    error::BackendError,
    types::{ConnectionStatus, Conversation, ConversationKey, Message, MessagePage, NewMessage, PageCursor},
};

/// Message table access.
#[async_trait]
pub trait MessageRepository: Send + Sync {
    /// Fetch up to `limit` messages of one conversation, newest first.
    ///
    /// With a cursor, only messages strictly older than it are returned.
    async fn fetch_messages(
        &self,
        key: &ConversationKey,
        before: Option<&PageCursor>,
        limit: u16,
    ) -> Result<MessagePage, BackendError>;

    /// Persist a message and return the stored row.
    async fn create_message(&self, message: NewMessage) -> Result<Message, BackendError>;

    /// Set `is_read` on every listed message.
    async fn mark_read(&self, message_ids: &[String]) -> Result<(), BackendError>;

    async fn upsert_reaction(
        &self,
        message_id: &str,
        user_id: &str,
        emoji: &str,
    ) -> Result<(), BackendError>;

    async fn remove_reaction(
        &self,
        message_id: &str,
        user_id: &str,
        emoji: &str,
    ) -> Result<(), BackendError>;
}

#[async_trait]
pub trait ConnectionRepository: Send + Sync {
    /// Status of the connection row requested by `a` for `b`.
    ///
    /// Returns `ConnectionStatus::None` when no row exists. Callers check the
    /// reverse direction themselves; see [`crate::gate::lookup_status`].
    async fn get_connection_status(
        &self,
        a: &str,
        b: &str,
    ) -> Result<ConnectionStatus, BackendError>;
}

#[async_trait]
pub trait DirectoryRepository: Send + Sync {
    /// Conversations the user has exchanged at least one message in.
    async fn list_conversations(&self, user_id: &str) -> Result<Vec<Conversation>, BackendError>;
}

/// Push-based change feed.
#[async_trait]
pub trait ChangeEventSource: Send + Sync {
    async fn subscribe(&self, filter: ChangeFilter) -> Result<Subscription, BackendError>;
}
