//! Direct-messaging core shared between the session runtime and frontends.
//!
//! This crate holds the domain model, the per-conversation message store and
//! its reconciliation rules, the components layered over it (connection gate,
//! directory, compose, reactions, read receipts, realtime bridge), and the
//! command/event protocol the runtime speaks.

/// Async command/event channels and push-subscription primitives.
pub mod channel;
/// Wall-clock helpers.
pub mod clock;
/// Outgoing draft and optimistic send handling.
pub mod compose;
/// Conversation list ordered by recency.
pub mod directory;
/// Stable error types and HTTP classification helpers.
pub mod error;
/// Send permission resolved from connection status.
pub mod gate;
/// Boundary translation of backend rows and event normalization.
pub mod normalization;
/// Backend ports implemented by concrete providers.
pub mod ports;
/// Reaction grouping and toggle decisions.
pub mod reactions;
/// Push subscription management and change-event translation.
pub mod realtime;
/// Batched mark-read tracking.
pub mod receipts;
/// Backoff policy used by retry loops.
pub mod retry;
/// Message store lifecycle state machine.
pub mod state_machine;
/// Per-conversation message cache.
pub mod store;
/// Sorted message window.
pub mod timeline;
/// Domain and protocol types.
pub mod types;

pub use channel::{
    ChangeEvent, ChangeFilter, ChangeOperation, ChangeTable, EventStream, SessionChannelError,
    SessionChannels, Subscription, SubscriptionHandle, SubscriptionSink,
};
pub use compose::{ComposeController, SendRequest};
pub use directory::{ConversationDirectory, DirectoryRequest};
pub use error::{BackendError, BackendErrorCategory, classify_http_status};
pub use gate::{ConnectionGate, GateRequest, lookup_status};
pub use normalization::{SendOutcome, normalize_send_outcome};
pub use ports::{ChangeEventSource, ConnectionRepository, DirectoryRepository, MessageRepository};
pub use reactions::{ReactionToggle, group_reactions, toggle_action};
pub use realtime::{BridgeAction, ConversationSubscriptions, SubscriptionScope};
pub use receipts::{ReadBatch, ReadReceiptTracker};
pub use retry::RetryPolicy;
pub use state_machine::StoreStateMachine;
pub use store::{MessageStore, OlderRequest, OpenRequest, StoreOutcome, StoreUpdate};
pub use timeline::{MessageTimeline, TimelineChange};
pub use types::{
    ConnectionStatus, Conversation, ConversationKey, Delivery, Message, MessagePage, NewMessage,
    PageCursor, Reaction, ReactionChange, ReactionGroup, ReadFlag, RealtimeStatus, ReplyRef,
    SendAck, SessionCommand, SessionConfig, SessionEvent, StoreState, TimelineEntry,
};
