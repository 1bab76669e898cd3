//! In-process backend implementing every port, with a live change feed.
//!
//! Rows are kept in typed form and published on the feed as JSON, so the
//! session exercises the same boundary translation as against a hosted
//! backend. Faults can be injected per call for tests and demos.

use std::{
    collections::{BTreeMap, HashMap},
    sync::{
        Mutex, RwLock,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use dm_core::{
    BackendError, BackendErrorCategory, ChangeEvent, ChangeEventSource, ChangeFilter,
    ChangeOperation, ChangeTable, ConnectionRepository, ConnectionStatus, Conversation,
    ConversationKey, Delivery, DirectoryRepository, Message, MessagePage, MessageRepository,
    NewMessage, PageCursor, Reaction, ReplyRef, Subscription, clock,
    normalization::{encode_connection_row, encode_message_row, encode_reaction_row},
};
use serde_json::json;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

const FEED_BUFFER: usize = 1024;
const SUBSCRIPTION_BUFFER: usize = 256;

#[derive(Debug, Default)]
struct BackendState {
    messages: Vec<Message>,
    reactions: Vec<Reaction>,
    connections: Vec<(String, String, ConnectionStatus)>,
    display_names: HashMap<String, String>,
    next_message: u64,
    last_created_at_ms: u64,
}

/// One-shot or sticky failures returned by the next matching call.
#[derive(Debug, Default)]
struct Faults {
    next_send: Option<BackendError>,
    next_fetch: Option<BackendError>,
    next_mark_read: Option<BackendError>,
    next_reaction_write: Option<BackendError>,
    connection_lookup: Option<BackendError>,
    directory: Option<BackendError>,
    subscribe_failures: u32,
    fetch_delay: Option<Duration>,
}

pub struct InMemoryBackend {
    state: RwLock<BackendState>,
    faults: Mutex<Faults>,
    feed: broadcast::Sender<ChangeEvent>,
    next_subscription: AtomicU64,
    live_subscriptions: Mutex<Vec<CancellationToken>>,
}

impl Default for InMemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryBackend {
    pub fn new() -> Self {
        let (feed, _) = broadcast::channel(FEED_BUFFER);
        Self {
            state: RwLock::new(BackendState::default()),
            faults: Mutex::new(Faults::default()),
            feed,
            next_subscription: AtomicU64::new(1),
            live_subscriptions: Mutex::new(Vec::new()),
        }
    }

    pub fn set_display_name(&self, user_id: &str, name: &str) -> Result<(), BackendError> {
        self.write()?
            .display_names
            .insert(user_id.to_owned(), name.to_owned());
        Ok(())
    }

    /// Create or update the connection row between two accounts.
    pub fn set_connection(
        &self,
        requester_id: &str,
        addressee_id: &str,
        status: ConnectionStatus,
    ) -> Result<(), BackendError> {
        let operation = {
            let mut state = self.write()?;
            let existing = state.connections.iter_mut().find(|(a, b, _)| {
                (a == requester_id && b == addressee_id) || (a == addressee_id && b == requester_id)
            });
            match existing {
                Some(row) => {
                    row.2 = status;
                    ChangeOperation::Update
                }
                None => {
                    state.connections.push((
                        requester_id.to_owned(),
                        addressee_id.to_owned(),
                        status,
                    ));
                    ChangeOperation::Insert
                }
            }
        };

        self.publish(ChangeEvent {
            table: ChangeTable::Connections,
            operation,
            row: encode_connection_row(requester_id, addressee_id, status),
            old_row: None,
        });
        Ok(())
    }

    /// Insert a message as if another client had sent it.
    pub fn deliver(
        &self,
        sender_id: &str,
        receiver_id: &str,
        content: &str,
    ) -> Result<Message, BackendError> {
        self.insert_message(NewMessage {
            sender_id: sender_id.to_owned(),
            receiver_id: receiver_id.to_owned(),
            content: content.to_owned(),
            reply_to_id: None,
            client_txn_id: String::new(),
        })
    }

    pub fn delete_message(&self, message_id: &str) -> Result<bool, BackendError> {
        let removed = {
            let mut state = self.write()?;
            let position = state.messages.iter().position(|m| m.id == message_id);
            let removed = position.map(|idx| state.messages.remove(idx));
            if removed.is_some() {
                state.reactions.retain(|r| r.message_id != message_id);
            }
            removed
        };

        let Some(removed) = removed else {
            return Ok(false);
        };
        self.publish(ChangeEvent {
            table: ChangeTable::Messages,
            operation: ChangeOperation::Delete,
            row: serde_json::Value::Null,
            old_row: Some(json!({
                "id": removed.id,
                "sender_id": removed.sender_id,
                "receiver_id": removed.receiver_id,
            })),
        });
        Ok(true)
    }

    pub fn message_count(&self) -> Result<usize, BackendError> {
        Ok(self.read()?.messages.len())
    }

    /// Subscriptions currently delivering events.
    pub fn live_subscription_count(&self) -> usize {
        self.live_subscriptions
            .lock()
            .map(|mut tokens| {
                tokens.retain(|token| !token.is_cancelled());
                tokens.len()
            })
            .unwrap_or_default()
    }

    /// Close every open subscription from the server side.
    pub fn drop_subscriptions(&self) {
        if let Ok(mut tokens) = self.live_subscriptions.lock() {
            for token in tokens.drain(..) {
                token.cancel();
            }
        }
    }

    pub fn fail_next_send(&self, error: BackendError) {
        self.with_faults(|faults| faults.next_send = Some(error));
    }

    pub fn fail_next_fetch(&self, error: BackendError) {
        self.with_faults(|faults| faults.next_fetch = Some(error));
    }

    pub fn fail_next_mark_read(&self, error: BackendError) {
        self.with_faults(|faults| faults.next_mark_read = Some(error));
    }

    pub fn fail_next_reaction_write(&self, error: BackendError) {
        self.with_faults(|faults| faults.next_reaction_write = Some(error));
    }

    /// Fail every connection lookup until cleared with `None`.
    pub fn set_connection_lookup_failure(&self, error: Option<BackendError>) {
        self.with_faults(|faults| faults.connection_lookup = error);
    }

    /// Fail every directory listing until cleared with `None`.
    pub fn set_directory_failure(&self, error: Option<BackendError>) {
        self.with_faults(|faults| faults.directory = error);
    }

    pub fn fail_next_subscribes(&self, count: u32) {
        self.with_faults(|faults| faults.subscribe_failures = count);
    }

    /// Delay every history fetch, to widen race windows in tests.
    pub fn set_fetch_delay(&self, delay: Option<Duration>) {
        self.with_faults(|faults| faults.fetch_delay = delay);
    }

    fn insert_message(&self, new: NewMessage) -> Result<Message, BackendError> {
        validate_new_message(&new)?;

        let message = {
            let mut state = self.write()?;
            let reply_to = match &new.reply_to_id {
                Some(reply_id) => Some(reply_ref(&state, reply_id, &new)?),
                None => None,
            };

            state.next_message += 1;
            let created_at_ms = clock::now_ms().max(state.last_created_at_ms + 1);
            state.last_created_at_ms = created_at_ms;

            let message = Message {
                id: format!("msg-{:08}", state.next_message),
                sender_id: new.sender_id,
                receiver_id: new.receiver_id,
                content: new.content,
                created_at_ms,
                is_read: false,
                reply_to,
                reactions: Vec::new(),
                client_txn_id: Some(new.client_txn_id).filter(|txn| !txn.is_empty()),
                delivery: Delivery::Confirmed,
            };
            state.messages.push(message.clone());
            message
        };

        debug!(message_id = %message.id, "in-memory backend stored message");
        self.publish(ChangeEvent {
            table: ChangeTable::Messages,
            operation: ChangeOperation::Insert,
            row: encode_message_row(&message),
            old_row: None,
        });
        Ok(message)
    }

    /// Status of the row `requester_id` opened for `addressee_id`.
    fn directed_status(
        &self,
        requester_id: &str,
        addressee_id: &str,
    ) -> Result<ConnectionStatus, BackendError> {
        Ok(self
            .read()?
            .connections
            .iter()
            .find(|(x, y, _)| x == requester_id && y == addressee_id)
            .map(|(_, _, status)| *status)
            .unwrap_or_default())
    }

    fn connection_status(&self, a: &str, b: &str) -> Result<ConnectionStatus, BackendError> {
        Ok(self
            .read()?
            .connections
            .iter()
            .find(|(x, y, _)| (x == a && y == b) || (x == b && y == a))
            .map(|(_, _, status)| *status)
            .unwrap_or_default())
    }

    fn publish(&self, event: ChangeEvent) {
        trace!(table = ?event.table, operation = ?event.operation, "publishing change event");
        let _ = self.feed.send(event);
    }

    fn take_fault(
        &self,
        pick: impl FnOnce(&mut Faults) -> Option<BackendError>,
    ) -> Result<(), BackendError> {
        let fault = self
            .faults
            .lock()
            .map_err(|_| poisoned())
            .map(|mut faults| pick(&mut faults))?;
        match fault {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn with_faults(&self, apply: impl FnOnce(&mut Faults)) {
        if let Ok(mut faults) = self.faults.lock() {
            apply(&mut faults);
        }
    }

    fn fetch_delay(&self) -> Option<Duration> {
        self.faults.lock().ok().and_then(|faults| faults.fetch_delay)
    }

    fn read(&self) -> Result<std::sync::RwLockReadGuard<'_, BackendState>, BackendError> {
        self.state.read().map_err(|_| poisoned())
    }

    fn write(&self) -> Result<std::sync::RwLockWriteGuard<'_, BackendState>, BackendError> {
        self.state.write().map_err(|_| poisoned())
    }
}

#[async_trait]
impl MessageRepository for InMemoryBackend {
    async fn fetch_messages(
        &self,
        key: &ConversationKey,
        before: Option<&PageCursor>,
        limit: u16,
    ) -> Result<MessagePage, BackendError> {
        if let Some(delay) = self.fetch_delay() {
            tokio::time::sleep(delay).await;
        }
        self.take_fault(|faults| faults.next_fetch.take())?;

        let state = self.read()?;
        let mut messages: Vec<Message> = state
            .messages
            .iter()
            .filter(|message| message.conversation_key() == *key)
            .filter(|message| before.is_none_or(|cursor| cursor.admits(message)))
            .cloned()
            .map(|mut message| {
                message.reactions = reactions_for(&state, &message.id);
                message
            })
            .collect();
        messages.sort_by(|a, b| b.display_cmp(a));

        let limit = usize::from(limit.max(1));
        let has_more = messages.len() > limit;
        messages.truncate(limit);
        Ok(MessagePage { messages, has_more })
    }

    async fn create_message(&self, message: NewMessage) -> Result<Message, BackendError> {
        self.take_fault(|faults| faults.next_send.take())?;
        if !self
            .connection_status(&message.sender_id, &message.receiver_id)?
            .permits_messaging()
        {
            return Err(BackendError::not_connected(&message.receiver_id));
        }
        self.insert_message(message)
    }

    async fn mark_read(&self, message_ids: &[String]) -> Result<(), BackendError> {
        self.take_fault(|faults| faults.next_mark_read.take())?;

        let updated: Vec<Message> = {
            let mut state = self.write()?;
            state
                .messages
                .iter_mut()
                .filter(|message| !message.is_read && message_ids.contains(&message.id))
                .map(|message| {
                    message.is_read = true;
                    message.clone()
                })
                .collect()
        };

        for message in &updated {
            self.publish(ChangeEvent {
                table: ChangeTable::Messages,
                operation: ChangeOperation::Update,
                row: encode_message_row(message),
                old_row: None,
            });
        }
        Ok(())
    }

    async fn upsert_reaction(
        &self,
        message_id: &str,
        user_id: &str,
        emoji: &str,
    ) -> Result<(), BackendError> {
        self.take_fault(|faults| faults.next_reaction_write.take())?;

        let reaction = {
            let mut state = self.write()?;
            if !state.messages.iter().any(|message| message.id == message_id) {
                return Err(BackendError::new(
                    BackendErrorCategory::NotFound,
                    "message_not_found",
                    format!("message {message_id} does not exist"),
                ));
            }
            if state.reactions.iter().any(|r| {
                r.message_id == message_id && r.user_id == user_id && r.emoji == emoji
            }) {
                return Ok(());
            }
            let reaction = Reaction {
                message_id: message_id.to_owned(),
                user_id: user_id.to_owned(),
                user_name: state.display_names.get(user_id).cloned(),
                emoji: emoji.to_owned(),
                created_at_ms: clock::now_ms(),
            };
            state.reactions.push(reaction.clone());
            reaction
        };

        self.publish(ChangeEvent {
            table: ChangeTable::Reactions,
            operation: ChangeOperation::Insert,
            row: encode_reaction_row(&reaction),
            old_row: None,
        });
        Ok(())
    }

    async fn remove_reaction(
        &self,
        message_id: &str,
        user_id: &str,
        emoji: &str,
    ) -> Result<(), BackendError> {
        self.take_fault(|faults| faults.next_reaction_write.take())?;

        let removed = {
            let mut state = self.write()?;
            let before = state.reactions.len();
            state.reactions.retain(|r| {
                !(r.message_id == message_id && r.user_id == user_id && r.emoji == emoji)
            });
            before != state.reactions.len()
        };

        if removed {
            self.publish(ChangeEvent {
                table: ChangeTable::Reactions,
                operation: ChangeOperation::Delete,
                row: serde_json::Value::Null,
                old_row: Some(json!({
                    "message_id": message_id,
                    "user_id": user_id,
                    "emoji": emoji,
                })),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl ConnectionRepository for InMemoryBackend {
    async fn get_connection_status(
        &self,
        a: &str,
        b: &str,
    ) -> Result<ConnectionStatus, BackendError> {
        self.take_fault(|faults| faults.connection_lookup.clone())?;
        self.directed_status(a, b)
    }
}

#[async_trait]
impl DirectoryRepository for InMemoryBackend {
    async fn list_conversations(&self, user_id: &str) -> Result<Vec<Conversation>, BackendError> {
        self.take_fault(|faults| faults.directory.clone())?;

        let state = self.read()?;
        let mut latest: BTreeMap<&str, &Message> = BTreeMap::new();
        for message in &state.messages {
            let partner_id = if message.sender_id == user_id {
                message.receiver_id.as_str()
            } else if message.receiver_id == user_id {
                message.sender_id.as_str()
            } else {
                continue;
            };
            let newer = latest
                .get(partner_id)
                .is_none_or(|current| current.display_cmp(message).is_lt());
            if newer {
                latest.insert(partner_id, message);
            }
        }

        Ok(latest
            .into_iter()
            .map(|(partner_id, message)| Conversation {
                partner_id: partner_id.to_owned(),
                display_name: state
                    .display_names
                    .get(partner_id)
                    .cloned()
                    .unwrap_or_else(|| partner_id.to_owned()),
                avatar_ref: None,
                last_message_preview: message.content.clone(),
                last_message_at_ms: message.created_at_ms,
                last_message_read_by_viewer: message.sender_id == user_id || message.is_read,
            })
            .collect())
    }
}

#[async_trait]
impl ChangeEventSource for InMemoryBackend {
    async fn subscribe(&self, filter: ChangeFilter) -> Result<Subscription, BackendError> {
        let refused = {
            let mut faults = self.faults.lock().map_err(|_| poisoned())?;
            if faults.subscribe_failures > 0 {
                faults.subscribe_failures -= 1;
                true
            } else {
                false
            }
        };
        if refused {
            return Err(BackendError::network(
                "subscribe_failed",
                "realtime channel refused the subscription",
            ));
        }

        let id = self.next_subscription.fetch_add(1, Ordering::Relaxed);
        let (subscription, sink) = Subscription::channel(id, SUBSCRIPTION_BUFFER);
        let server_close = CancellationToken::new();
        if let Ok(mut tokens) = self.live_subscriptions.lock() {
            tokens.push(server_close.clone());
        }

        let mut feed = self.feed.subscribe();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = sink.closed() => break,
                    _ = server_close.cancelled() => break,
                    received = feed.recv() => match received {
                        Ok(event) => {
                            if filter.matches(&event) && !sink.deliver(event).await {
                                break;
                            }
                        }
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            warn!(subscription_id = id, skipped, "subscription lagged behind feed");
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    },
                }
            }
            server_close.cancel();
            debug!(subscription_id = id, "subscription closed");
        });

        Ok(subscription)
    }
}

fn validate_new_message(new: &NewMessage) -> Result<(), BackendError> {
    if new.content.trim().is_empty() {
        return Err(BackendError::validation("empty_message", "content must not be empty"));
    }
    if new.sender_id.is_empty() || new.receiver_id.is_empty() || new.sender_id == new.receiver_id {
        return Err(BackendError::validation(
            "invalid_participants",
            "a message needs two distinct participants",
        ));
    }
    Ok(())
}

fn reply_ref(
    state: &BackendState,
    reply_id: &str,
    new: &NewMessage,
) -> Result<ReplyRef, BackendError> {
    let key = ConversationKey::new(new.sender_id.clone(), new.receiver_id.clone());
    state
        .messages
        .iter()
        .find(|message| message.id == reply_id && message.conversation_key() == key)
        .map(|target| ReplyRef {
            id: target.id.clone(),
            sender_id: Some(target.sender_id.clone()),
            content_preview: Some(target.content.clone()),
        })
        .ok_or_else(|| {
            BackendError::validation(
                "reply_target_not_found",
                format!("message {reply_id} is not part of this conversation"),
            )
        })
}

fn reactions_for(state: &BackendState, message_id: &str) -> Vec<Reaction> {
    state
        .reactions
        .iter()
        .filter(|reaction| reaction.message_id == message_id)
        .cloned()
        .collect()
}

fn poisoned() -> BackendError {
    BackendError::new(
        BackendErrorCategory::Internal,
        "lock_poisoned",
        "in-memory backend lock was poisoned",
    )
}
