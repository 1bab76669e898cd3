//! Boundary translation between loosely-typed backend rows and typed values.
//!
//! Every row that crosses into the core passes through exactly one decode
//! function here. A row that cannot be decoded yields a
//! [`BackendErrorCategory::Translation`] error instead of defaulted fields.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use serde_json::Value;

use crate::{
    error::{BackendError, BackendErrorCategory},
    types::{
        ConnectionStatus, Delivery, Message, Reaction, ReactionChange, ReplyRef, SendAck,
        SessionEvent,
    },
};

/// `messages` row as stored by the backend, with the optional reply join.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MessageRow {
    pub id: String,
    pub sender_id: String,
    pub receiver_id: String,
    pub content: String,
    /// RFC 3339 creation timestamp.
    pub created_at: String,
    #[serde(default)]
    pub is_read: bool,
    #[serde(default)]
    pub reply_to_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<ReplyRow>,
    #[serde(default)]
    pub client_txn_id: Option<String>,
}

/// Joined subset of the replied-to message.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ReplyRow {
    pub id: String,
    #[serde(default)]
    pub sender_id: Option<String>,
    #[serde(default)]
    pub content: Option<String>,
}

/// `message_reactions` row with the reacting user's display name joined in.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ReactionRow {
    pub message_id: String,
    pub user_id: String,
    pub emoji: String,
    pub created_at: String,
    #[serde(default)]
    pub user_name: Option<String>,
}

/// `connections` row.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ConnectionRow {
    pub requester_id: String,
    pub addressee_id: String,
    pub status: String,
}

/// Typed view of a connection row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionChange {
    pub requester_id: String,
    pub addressee_id: String,
    pub status: ConnectionStatus,
}

impl ConnectionChange {
    pub fn involves_pair(&self, a: &str, b: &str) -> bool {
        (self.requester_id == a && self.addressee_id == b)
            || (self.requester_id == b && self.addressee_id == a)
    }
}

impl TryFrom<MessageRow> for Message {
    type Error = BackendError;

    fn try_from(row: MessageRow) -> Result<Self, Self::Error> {
        require_non_empty("message.id", &row.id)?;
        require_non_empty("message.sender_id", &row.sender_id)?;
        require_non_empty("message.receiver_id", &row.receiver_id)?;
        let created_at_ms = parse_timestamp_ms(&row.created_at)?;

        let reply_to = match (row.reply_to_id, row.reply_to) {
            (None, None) => None,
            (Some(id), None) => Some(ReplyRef::bare(id)),
            (reply_to_id, Some(joined)) => {
                if let Some(reply_to_id) = reply_to_id
                    && reply_to_id != joined.id
                {
                    return Err(BackendError::translation(
                        "reply_join_mismatch",
                        format!(
                            "message {} references reply {reply_to_id} but joined {}",
                            row.id, joined.id
                        ),
                    ));
                }
                Some(ReplyRef {
                    id: joined.id,
                    sender_id: joined.sender_id,
                    content_preview: joined.content,
                })
            }
        };

        Ok(Message {
            id: row.id,
            sender_id: row.sender_id,
            receiver_id: row.receiver_id,
            content: row.content,
            created_at_ms,
            is_read: row.is_read,
            reply_to,
            reactions: Vec::new(),
            client_txn_id: row.client_txn_id,
            delivery: Delivery::Confirmed,
        })
    }
}

impl From<&Message> for MessageRow {
    fn from(message: &Message) -> Self {
        let reply_to = message
            .reply_to
            .as_ref()
            .filter(|reply| reply.has_preview())
            .map(|reply| ReplyRow {
                id: reply.id.clone(),
                sender_id: reply.sender_id.clone(),
                content: reply.content_preview.clone(),
            });

        Self {
            id: message.id.clone(),
            sender_id: message.sender_id.clone(),
            receiver_id: message.receiver_id.clone(),
            content: message.content.clone(),
            created_at: format_timestamp_ms(message.created_at_ms),
            is_read: message.is_read,
            reply_to_id: message.reply_to.as_ref().map(|reply| reply.id.clone()),
            reply_to,
            client_txn_id: message.client_txn_id.clone(),
        }
    }
}

impl TryFrom<ReactionRow> for Reaction {
    type Error = BackendError;

    fn try_from(row: ReactionRow) -> Result<Self, Self::Error> {
        require_non_empty("reaction.message_id", &row.message_id)?;
        require_non_empty("reaction.user_id", &row.user_id)?;
        require_non_empty("reaction.emoji", &row.emoji)?;

        Ok(Reaction {
            message_id: row.message_id,
            user_id: row.user_id,
            user_name: row.user_name,
            emoji: row.emoji,
            created_at_ms: parse_timestamp_ms(&row.created_at)?,
        })
    }
}

impl From<&Reaction> for ReactionRow {
    fn from(reaction: &Reaction) -> Self {
        Self {
            message_id: reaction.message_id.clone(),
            user_id: reaction.user_id.clone(),
            emoji: reaction.emoji.clone(),
            created_at: format_timestamp_ms(reaction.created_at_ms),
            user_name: reaction.user_name.clone(),
        }
    }
}

pub fn decode_message_row(value: &Value) -> Result<Message, BackendError> {
    decode_row::<MessageRow>("message", value)?.try_into()
}

pub fn decode_reaction_row(value: &Value) -> Result<Reaction, BackendError> {
    decode_row::<ReactionRow>("reaction", value)?.try_into()
}

pub fn decode_connection_row(value: &Value) -> Result<ConnectionChange, BackendError> {
    let row = decode_row::<ConnectionRow>("connection", value)?;
    let status = ConnectionStatus::parse(&row.status).ok_or_else(|| {
        BackendError::translation(
            "connection_status_unknown",
            format!("unknown connection status '{}'", row.status),
        )
    })?;

    Ok(ConnectionChange {
        requester_id: row.requester_id,
        addressee_id: row.addressee_id,
        status,
    })
}

/// Identifying columns of a deleted `messages` row.
#[derive(Debug, Deserialize)]
struct MessageKeyRow {
    id: String,
}

/// Identifying columns of a deleted `message_reactions` row.
#[derive(Debug, Deserialize)]
struct ReactionKeyRow {
    message_id: String,
    user_id: String,
    emoji: String,
}

/// Message id from a delete event's old row, which may carry only the key.
pub fn decode_message_key(value: &Value) -> Result<String, BackendError> {
    let row = decode_row::<MessageKeyRow>("message_key", value)?;
    if row.id.trim().is_empty() {
        return Err(BackendError::translation(
            "message_key_row_invalid",
            "deleted message row has an empty id",
        ));
    }
    Ok(row.id)
}

/// Reaction removal from a delete event's old row.
pub fn decode_reaction_removal(value: &Value) -> Result<ReactionChange, BackendError> {
    let row = decode_row::<ReactionKeyRow>("reaction_key", value)?;
    Ok(ReactionChange::Removed {
        message_id: row.message_id,
        user_id: row.user_id,
        emoji: row.emoji,
    })
}

pub fn encode_message_row(message: &Message) -> Value {
    encode_row(&MessageRow::from(message))
}

pub fn encode_reaction_row(reaction: &Reaction) -> Value {
    encode_row(&ReactionRow::from(reaction))
}

pub fn encode_connection_row(requester_id: &str, addressee_id: &str, status: ConnectionStatus) -> Value {
    encode_row(&ConnectionRow {
        requester_id: requester_id.to_owned(),
        addressee_id: addressee_id.to_owned(),
        status: encode_row(&status)
            .as_str()
            .unwrap_or("none")
            .to_owned(),
    })
}

/// Parse an RFC 3339 timestamp into milliseconds since Unix epoch.
pub fn parse_timestamp_ms(raw: &str) -> Result<u64, BackendError> {
    let parsed = DateTime::parse_from_rfc3339(raw).map_err(|err| {
        BackendError::translation(
            "invalid_timestamp",
            format!("invalid timestamp '{raw}': {err}"),
        )
    })?;

    u64::try_from(parsed.timestamp_millis()).map_err(|_| {
        BackendError::translation(
            "invalid_timestamp",
            format!("timestamp '{raw}' is before the Unix epoch"),
        )
    })
}

/// Format milliseconds since Unix epoch as an RFC 3339 UTC timestamp.
pub fn format_timestamp_ms(ms: u64) -> String {
    i64::try_from(ms)
        .ok()
        .and_then(DateTime::<Utc>::from_timestamp_millis)
        .unwrap_or_default()
        .to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Send result before normalization into a [`SendAck`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendOutcome {
    /// Backend persisted the message under `message_id`.
    Success { message_id: String },
    /// Backend (or local validation) rejected the send.
    Failure { error: BackendError },
}

/// Convert a send outcome to a stable `SessionEvent::SendAck`.
pub fn normalize_send_outcome(
    client_txn_id: impl Into<String>,
    outcome: SendOutcome,
) -> SessionEvent {
    let client_txn_id = client_txn_id.into();
    match outcome {
        SendOutcome::Success { message_id } => SessionEvent::SendAck(SendAck {
            client_txn_id,
            message_id: Some(message_id),
            error_code: None,
        }),
        SendOutcome::Failure { error } => SessionEvent::SendAck(SendAck {
            client_txn_id,
            message_id: None,
            error_code: Some(error.code),
        }),
    }
}

/// Convert an error into a one-shot `Notice` for user-initiated actions.
pub fn normalize_notice(error: &BackendError) -> SessionEvent {
    SessionEvent::Notice {
        code: error.code.clone(),
        message: error.message.clone(),
    }
}

/// Convert an error into a `FatalError` event.
pub fn normalize_fatal_error(error: BackendError, recoverable: bool) -> SessionEvent {
    SessionEvent::FatalError {
        code: error.code,
        message: error.message,
        recoverable,
    }
}

fn decode_row<T: DeserializeOwned>(kind: &str, value: &Value) -> Result<T, BackendError> {
    T::deserialize(value).map_err(|err| {
        BackendError::new(
            BackendErrorCategory::Translation,
            format!("{kind}_row_invalid"),
            format!("cannot decode {kind} row: {err}"),
        )
    })
}

fn encode_row<T: Serialize>(row: &T) -> Value {
    serde_json::to_value(row).unwrap_or(Value::Null)
}

fn require_non_empty(field: &str, value: &str) -> Result<(), BackendError> {
    if value.trim().is_empty() {
        return Err(BackendError::translation(
            "missing_field",
            format!("{field} must not be empty"),
        ));
    }
    Ok(())
}
