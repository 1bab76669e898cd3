use std::cmp::Ordering;

use serde::{Deserialize, Serialize};

use crate::realtime::SubscriptionScope;

/// Lifecycle state of the per-conversation message store.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum StoreState {
    /// No conversation open, or the initial load failed.
    Empty,
    /// Initial page fetch in flight.
    Loading,
    /// History loaded and live events are being applied.
    Loaded,
    /// Backward pagination fetch in flight.
    LoadingOlder,
    /// Push subscription was lost; a resync (`open` again) is required.
    Stale,
}

/// Relationship between two accounts, owned by the connection-management feature.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionStatus {
    #[default]
    None,
    Pending,
    Accepted,
    Rejected,
}

impl ConnectionStatus {
    /// Parse the wire representation used by the backend.
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "none" => Some(Self::None),
            "pending" => Some(Self::Pending),
            "accepted" => Some(Self::Accepted),
            "rejected" => Some(Self::Rejected),
            _ => None,
        }
    }

    pub fn permits_messaging(self) -> bool {
        self == Self::Accepted
    }
}

/// Unordered pair of account ids identifying one conversation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConversationKey {
    low: String,
    high: String,
}

impl ConversationKey {
    pub fn new(a: impl Into<String>, b: impl Into<String>) -> Self {
        let (a, b) = (a.into(), b.into());
        if a <= b {
            Self { low: a, high: b }
        } else {
            Self { low: b, high: a }
        }
    }

    pub fn contains(&self, user_id: &str) -> bool {
        self.low == user_id || self.high == user_id
    }

    /// The participant that is not `user_id`, if `user_id` is part of the pair.
    pub fn other(&self, user_id: &str) -> Option<&str> {
        if self.low == user_id {
            Some(&self.high)
        } else if self.high == user_id {
            Some(&self.low)
        } else {
            None
        }
    }

    pub fn participants(&self) -> (&str, &str) {
        (&self.low, &self.high)
    }
}

/// Delivery state of a message in local state.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum Delivery {
    /// Inserted optimistically; awaiting server confirmation.
    Pending { client_txn_id: String },
    /// Persisted by the backend.
    Confirmed,
    /// Rejected by the backend; only seen on rolled-back entries.
    Failed {
        client_txn_id: String,
        error_code: String,
    },
}

/// Join metadata describing the message being replied to.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ReplyRef {
    pub id: String,
    pub sender_id: Option<String>,
    pub content_preview: Option<String>,
}

impl ReplyRef {
    pub fn bare(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            sender_id: None,
            content_preview: None,
        }
    }

    pub fn has_preview(&self) -> bool {
        self.sender_id.is_some() || self.content_preview.is_some()
    }
}

/// One emoji reaction by one user on one message.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Reaction {
    pub message_id: String,
    pub user_id: String,
    /// Display name joined from the profile, when the backend provides it.
    pub user_name: Option<String>,
    pub emoji: String,
    pub created_at_ms: u64,
}

impl Reaction {
    /// Whether `self` and `other` are the same (message, user, emoji) triple.
    pub fn same_triple(&self, other: &Reaction) -> bool {
        self.message_id == other.message_id
            && self.user_id == other.user_id
            && self.emoji == other.emoji
    }
}

/// Canonical message payload held by the message store.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Message {
    /// Server-assigned id, or `local-<client_txn_id>` while pending.
    pub id: String,
    pub sender_id: String,
    pub receiver_id: String,
    pub content: String,
    /// Creation time in milliseconds since Unix epoch.
    pub created_at_ms: u64,
    pub is_read: bool,
    pub reply_to: Option<ReplyRef>,
    pub reactions: Vec<Reaction>,
    /// Client-assigned correlation id persisted by the backend for echo dedup.
    pub client_txn_id: Option<String>,
    pub delivery: Delivery,
}

impl Message {
    pub fn conversation_key(&self) -> ConversationKey {
        ConversationKey::new(self.sender_id.clone(), self.receiver_id.clone())
    }

    pub fn is_pending(&self) -> bool {
        matches!(self.delivery, Delivery::Pending { .. })
    }

    pub fn is_outgoing(&self, viewer_id: &str) -> bool {
        self.sender_id == viewer_id
    }

    /// Total display order: `(created_at_ms, id)` ascending.
    pub fn display_cmp(&self, other: &Message) -> Ordering {
        self.created_at_ms
            .cmp(&other.created_at_ms)
            .then_with(|| self.id.cmp(&other.id))
    }

    /// Local id used for an optimistic entry with the given correlation id.
    pub fn local_id(client_txn_id: &str) -> String {
        format!("local-{client_txn_id}")
    }
}

/// Keyset cursor pointing at the oldest loaded message.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PageCursor {
    pub before_created_at_ms: u64,
    pub before_id: String,
}

impl PageCursor {
    pub fn from_oldest(message: &Message) -> Self {
        Self {
            before_created_at_ms: message.created_at_ms,
            before_id: message.id.clone(),
        }
    }

    /// Whether `message` sorts strictly before the cursor position.
    pub fn admits(&self, message: &Message) -> bool {
        (message.created_at_ms, message.id.as_str())
            < (self.before_created_at_ms, self.before_id.as_str())
    }
}

/// One page returned by the history fetch, ordered newest-first on the wire.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct MessagePage {
    pub messages: Vec<Message>,
    pub has_more: bool,
}

/// Payload for the backend `createMessage` call.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct NewMessage {
    pub sender_id: String,
    pub receiver_id: String,
    pub content: String,
    pub reply_to_id: Option<String>,
    pub client_txn_id: String,
}

/// Reaction mutation delivered by the change feed or applied locally.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum ReactionChange {
    Added(Reaction),
    Removed {
        message_id: String,
        user_id: String,
        emoji: String,
    },
}

impl ReactionChange {
    pub fn message_id(&self) -> &str {
        match self {
            Self::Added(reaction) => &reaction.message_id,
            Self::Removed { message_id, .. } => message_id,
        }
    }
}

/// Read-state mutation for one message.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ReadFlag {
    pub message_id: String,
    pub is_read: bool,
}

/// Directory row: one conversation partner with last-message preview.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Conversation {
    pub partner_id: String,
    pub display_name: String,
    pub avatar_ref: Option<String>,
    pub last_message_preview: String,
    pub last_message_at_ms: u64,
    pub last_message_read_by_viewer: bool,
}

/// Aggregated reactions for one emoji on one message.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ReactionGroup {
    pub emoji: String,
    pub count: usize,
    pub user_ids: Vec<String>,
    pub user_names: Vec<String>,
}

impl ReactionGroup {
    pub fn includes(&self, user_id: &str) -> bool {
        self.user_ids.iter().any(|id| id == user_id)
    }
}

/// Timeline row published to frontends.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TimelineEntry {
    pub message: Message,
    pub is_own: bool,
    pub reactions: Vec<ReactionGroup>,
}

/// Runtime tuning values for a messaging session.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SessionConfig {
    /// Messages requested per history page (clamped to `1..=100`).
    pub page_size: u16,
    /// First backoff delay when (re)establishing a subscription.
    pub subscribe_base_delay_ms: u64,
    /// Backoff ceiling when (re)establishing a subscription.
    pub subscribe_max_delay_ms: u64,
    /// Attempts before a subscription failure is reported as fatal.
    pub subscribe_max_attempts: u32,
    pub command_buffer: usize,
    pub event_buffer: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            page_size: 30,
            subscribe_base_delay_ms: 500,
            subscribe_max_delay_ms: 30_000,
            subscribe_max_attempts: 8,
            command_buffer: 128,
            event_buffer: 512,
        }
    }
}

/// Command channel input accepted by the session runtime.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum SessionCommand {
    /// Re-fetch the conversation directory.
    RefreshDirectory,
    /// Select a conversation and load its newest page.
    OpenConversation { partner_id: String },
    /// Fetch the page before the oldest loaded message.
    LoadOlder,
    /// Reload the open conversation after a subscription loss.
    Resync,
    /// Replace the compose draft text.
    SetDraft { text: String },
    /// Set or clear the reply target.
    SetReplyTarget { message_id: Option<String> },
    /// Send the current draft.
    Send,
    /// Add or remove the viewer's reaction.
    ToggleReaction { message_id: String, emoji: String },
    /// The frontend rendered these messages on screen.
    MessagesRendered { message_ids: Vec<String> },
    /// Cancel subscriptions and stop the runtime.
    Shutdown,
}

/// Acknowledgement for a send, keyed by its correlation id.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SendAck {
    pub client_txn_id: String,
    /// Server id on success.
    pub message_id: Option<String>,
    /// Stable error code on failure.
    pub error_code: Option<String>,
}

/// Push subscription health.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RealtimeStatus {
    /// Subscription this status describes; the directory and the open
    /// conversation reconnect independently.
    pub scope: SubscriptionScope,
    pub connected: bool,
    /// Delay until the next subscribe attempt while reconnecting.
    pub retry_in_ms: Option<u64>,
}

/// Event channel output emitted by the session runtime.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum SessionEvent {
    StoreStateChanged {
        partner_id: Option<String>,
        state: StoreState,
    },
    DirectoryUpdated {
        conversations: Vec<Conversation>,
        /// `true` when the last refresh failed and this is the last good list.
        stale: bool,
    },
    TimelineUpdated {
        partner_id: String,
        entries: Vec<TimelineEntry>,
        has_more: bool,
    },
    ConnectionResolved {
        partner_id: String,
        connected: bool,
    },
    ComposeChanged {
        draft: String,
        reply_to: Option<String>,
    },
    SendAck(SendAck),
    RealtimeStatus(RealtimeStatus),
    /// One-shot user-facing notification for a failed action.
    Notice { code: String, message: String },
    FatalError {
        code: String,
        message: String,
        recoverable: bool,
    },
}
