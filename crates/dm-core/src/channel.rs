use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;

use crate::types::{SessionCommand, SessionEvent};

/// Broadcast event stream type used by frontend subscribers.
pub type EventStream = broadcast::Receiver<SessionEvent>;

/// Errors returned by session channel operations.
#[derive(Debug, Error)]
pub enum SessionChannelError {
    /// The command receiver side is closed.
    #[error("command channel is closed")]
    CommandChannelClosed,
}

/// Command/event channel pair used by the runtime and frontend layers.
#[derive(Clone, Debug)]
pub struct SessionChannels {
    command_tx: mpsc::Sender<SessionCommand>,
    event_tx: broadcast::Sender<SessionEvent>,
}

impl SessionChannels {
    /// Create a new channel set and return it with the command receiver.
    pub fn new(
        command_buffer: usize,
        event_buffer: usize,
    ) -> (Self, mpsc::Receiver<SessionCommand>) {
        let (command_tx, command_rx) = mpsc::channel(command_buffer.max(1));
        let (event_tx, _) = broadcast::channel(event_buffer.max(1));

        (
            Self {
                command_tx,
                event_tx,
            },
            command_rx,
        )
    }

    /// Subscribe to emitted session events.
    pub fn subscribe(&self) -> EventStream {
        self.event_tx.subscribe()
    }

    /// Send one command to the runtime.
    pub async fn send_command(&self, command: SessionCommand) -> Result<(), SessionChannelError> {
        self.command_tx
            .send(command)
            .await
            .map_err(|_| SessionChannelError::CommandChannelClosed)
    }

    /// Emit an event to all subscribers.
    ///
    /// Emission is best-effort; lagged subscribers are handled by `broadcast`.
    pub fn emit(&self, event: SessionEvent) {
        let _ = self.event_tx.send(event);
    }
}

/// Backend table a change event refers to.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum ChangeTable {
    Messages,
    Reactions,
    Connections,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "UPPERCASE")]
pub enum ChangeOperation {
    Insert,
    Update,
    Delete,
}

/// Provider change event with a loosely-typed row, translated by the bridge.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChangeEvent {
    pub table: ChangeTable,
    pub operation: ChangeOperation,
    /// New row for inserts/updates; may be empty for deletes.
    pub row: Value,
    /// Previous row for updates/deletes when the provider sends it.
    pub old_row: Option<Value>,
}

impl ChangeEvent {
    /// The row carrying identifying columns (`old_row` for deletes).
    pub fn identifying_row(&self) -> &Value {
        match (&self.operation, &self.old_row) {
            (ChangeOperation::Delete, Some(old)) => old,
            _ => &self.row,
        }
    }
}

/// Server-side predicate narrowing a subscription to rows visible to one user.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChangeFilter {
    pub tables: Vec<ChangeTable>,
    /// Rows must involve this account.
    pub participant: String,
    /// When set, message/connection rows must be between `participant` and this account.
    pub counterpart: Option<String>,
}

impl ChangeFilter {
    /// Directory scope: any message or connection change involving `viewer_id`.
    pub fn for_user(viewer_id: impl Into<String>) -> Self {
        Self {
            tables: vec![ChangeTable::Messages, ChangeTable::Connections],
            participant: viewer_id.into(),
            counterpart: None,
        }
    }

    /// Conversation scope: messages between the pair plus reaction rows.
    pub fn for_conversation(viewer_id: impl Into<String>, partner_id: impl Into<String>) -> Self {
        Self {
            tables: vec![ChangeTable::Messages, ChangeTable::Reactions],
            participant: viewer_id.into(),
            counterpart: Some(partner_id.into()),
        }
    }

    pub fn matches(&self, event: &ChangeEvent) -> bool {
        if !self.tables.contains(&event.table) {
            return false;
        }

        let row = event.identifying_row();
        match event.table {
            ChangeTable::Messages => self.matches_pair(row, "sender_id", "receiver_id"),
            ChangeTable::Connections => self.matches_pair(row, "requester_id", "addressee_id"),
            // Reaction rows carry no participants; the store drops unknown message ids.
            ChangeTable::Reactions => true,
        }
    }

    fn matches_pair(&self, row: &Value, left_key: &str, right_key: &str) -> bool {
        let (Some(left), Some(right)) = (
            row.get(left_key).and_then(Value::as_str),
            row.get(right_key).and_then(Value::as_str),
        ) else {
            return false;
        };

        let other = if left == self.participant {
            right
        } else if right == self.participant {
            left
        } else {
            return false;
        };

        self.counterpart
            .as_deref()
            .is_none_or(|counterpart| counterpart == other)
    }
}

/// Client-side handle that releases a push subscription.
///
/// Dropping the handle cancels the subscription as well.
#[derive(Debug)]
pub struct SubscriptionHandle {
    id: u64,
    token: CancellationToken,
}

impl SubscriptionHandle {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }
}

impl Drop for SubscriptionHandle {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

/// An established subscription: cancel handle plus its event stream.
#[derive(Debug)]
pub struct Subscription {
    pub handle: SubscriptionHandle,
    pub events: mpsc::Receiver<ChangeEvent>,
}

impl Subscription {
    /// Create a subscription and the provider-side sink feeding it.
    pub fn channel(id: u64, buffer: usize) -> (Self, SubscriptionSink) {
        let (tx, events) = mpsc::channel(buffer.max(1));
        let token = CancellationToken::new();
        let sink = SubscriptionSink {
            tx,
            cancelled: token.clone(),
        };

        (
            Self {
                handle: SubscriptionHandle { id, token },
                events,
            },
            sink,
        )
    }
}

/// Provider side of a subscription.
#[derive(Debug, Clone)]
pub struct SubscriptionSink {
    tx: mpsc::Sender<ChangeEvent>,
    cancelled: CancellationToken,
}

impl SubscriptionSink {
    /// Forward one event; returns `false` once the client cancelled or went away.
    pub async fn deliver(&self, event: ChangeEvent) -> bool {
        if self.cancelled.is_cancelled() {
            return false;
        }
        tokio::select! {
            _ = self.cancelled.cancelled() => false,
            sent = self.tx.send(event) => sent.is_ok(),
        }
    }

    /// Resolves when the client cancels the subscription.
    pub async fn closed(&self) {
        tokio::select! {
            _ = self.cancelled.cancelled() => {}
            _ = self.tx.closed() => {}
        }
    }

    pub fn is_closed(&self) -> bool {
        self.cancelled.is_cancelled() || self.tx.is_closed()
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn message_event(sender: &str, receiver: &str) -> ChangeEvent {
        ChangeEvent {
            table: ChangeTable::Messages,
            operation: ChangeOperation::Insert,
            row: json!({ "sender_id": sender, "receiver_id": receiver }),
            old_row: None,
        }
    }

    #[tokio::test]
    async fn sends_commands_to_receiver() {
        let (channels, mut rx) = SessionChannels::new(8, 8);
        channels
            .send_command(SessionCommand::OpenConversation {
                partner_id: "bob".into(),
            })
            .await
            .expect("command send should work");

        let cmd = rx.recv().await.expect("receiver should have a command");
        match cmd {
            SessionCommand::OpenConversation { partner_id } => assert_eq!(partner_id, "bob"),
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[tokio::test]
    async fn fans_out_events_to_subscribers() {
        let (channels, _) = SessionChannels::new(4, 16);
        let mut a = channels.subscribe();
        let mut b = channels.subscribe();

        channels.emit(SessionEvent::Notice {
            code: "send_failed".into(),
            message: "offline".into(),
        });

        let event_a = a.recv().await.expect("subscriber a should receive event");
        let event_b = b.recv().await.expect("subscriber b should receive event");
        assert_eq!(event_a, event_b);
    }

    #[test]
    fn user_filter_matches_either_direction() {
        let filter = ChangeFilter::for_user("alice");
        assert!(filter.matches(&message_event("alice", "bob")));
        assert!(filter.matches(&message_event("carol", "alice")));
        assert!(!filter.matches(&message_event("bob", "carol")));
    }

    #[test]
    fn conversation_filter_requires_counterpart() {
        let filter = ChangeFilter::for_conversation("alice", "bob");
        assert!(filter.matches(&message_event("bob", "alice")));
        assert!(!filter.matches(&message_event("carol", "alice")));

        let connection = ChangeEvent {
            table: ChangeTable::Connections,
            operation: ChangeOperation::Update,
            row: json!({ "requester_id": "alice", "addressee_id": "bob" }),
            old_row: None,
        };
        assert!(!filter.matches(&connection));
        assert!(ChangeFilter::for_user("alice").matches(&connection));
    }

    #[test]
    fn delete_events_match_on_old_row() {
        let filter = ChangeFilter::for_user("alice");
        let event = ChangeEvent {
            table: ChangeTable::Messages,
            operation: ChangeOperation::Delete,
            row: Value::Null,
            old_row: Some(json!({ "sender_id": "alice", "receiver_id": "bob" })),
        };
        assert!(filter.matches(&event));
    }

    #[tokio::test]
    async fn cancelling_handle_stops_delivery() {
        let (mut subscription, sink) = Subscription::channel(1, 4);
        assert!(sink.deliver(message_event("alice", "bob")).await);
        assert!(subscription.events.recv().await.is_some());

        subscription.handle.cancel();
        assert!(sink.is_closed());
        assert!(!sink.deliver(message_event("alice", "bob")).await);
    }

    #[tokio::test]
    async fn dropping_handle_cancels_subscription() {
        let (subscription, sink) = Subscription::channel(2, 4);
        drop(subscription);
        sink.closed().await;
        assert!(sink.is_closed());
    }
}
