//! Push subscription management and change-event translation.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    channel::{ChangeEvent, ChangeFilter, ChangeOperation, ChangeTable, Subscription},
    error::{BackendError, BackendErrorCategory},
    normalization::{
        ConnectionChange, decode_connection_row, decode_message_key, decode_message_row,
        decode_reaction_removal, decode_reaction_row,
    },
    ports::ChangeEventSource,
    retry::RetryPolicy,
    store::StoreUpdate,
    types::ReactionChange,
};

/// Which subscription an event arrived on.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum SubscriptionScope {
    Directory,
    Conversation,
}

/// What the session should do with one translated change event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BridgeAction {
    /// Apply to the open conversation's store.
    Store(StoreUpdate),
    /// Only the directory is affected.
    DirectoryChanged,
    /// A connection row changed; the gate may need a re-check.
    ConnectionChanged(ConnectionChange),
    Ignore,
}

/// Translate one provider event into a typed action.
///
/// `scope` decides routing: message rows on the directory subscription only
/// refresh the directory, since the conversation subscription delivers the
/// same rows for the open pair.
pub fn translate(
    scope: SubscriptionScope,
    event: &ChangeEvent,
) -> Result<BridgeAction, BackendError> {
    let action = match (scope, event.table, event.operation) {
        (SubscriptionScope::Directory, ChangeTable::Messages, _) => BridgeAction::DirectoryChanged,
        (SubscriptionScope::Directory, ChangeTable::Connections, _) => {
            BridgeAction::ConnectionChanged(decode_connection_row(event.identifying_row())?)
        }
        (SubscriptionScope::Conversation, ChangeTable::Messages, ChangeOperation::Insert) => {
            BridgeAction::Store(StoreUpdate::Insert(decode_message_row(&event.row)?))
        }
        (SubscriptionScope::Conversation, ChangeTable::Messages, ChangeOperation::Update) => {
            BridgeAction::Store(StoreUpdate::Update(decode_message_row(&event.row)?))
        }
        (SubscriptionScope::Conversation, ChangeTable::Messages, ChangeOperation::Delete) => {
            BridgeAction::Store(StoreUpdate::Delete {
                message_id: decode_message_key(event.identifying_row())?,
            })
        }
        (SubscriptionScope::Conversation, ChangeTable::Reactions, ChangeOperation::Delete) => {
            let removal = decode_reaction_removal(event.identifying_row())?;
            BridgeAction::Store(StoreUpdate::Reaction(removal))
        }
        (SubscriptionScope::Conversation, ChangeTable::Reactions, _) => {
            let reaction = decode_reaction_row(&event.row)?;
            BridgeAction::Store(StoreUpdate::Reaction(ReactionChange::Added(reaction)))
        }
        _ => BridgeAction::Ignore,
    };
    Ok(action)
}

/// Establish a subscription, retrying transient failures with backoff.
///
/// `on_retry` is called before each wait with the failed attempt count and
/// the delay. Returns a `cancelled` error when `cancel` fires first.
pub async fn subscribe_with_backoff<F>(
    source: &dyn ChangeEventSource,
    filter: ChangeFilter,
    policy: RetryPolicy,
    cancel: &CancellationToken,
    mut on_retry: F,
) -> Result<Subscription, BackendError>
where
    F: FnMut(u32, Duration),
{
    let mut failed_attempts = 0_u32;

    loop {
        if cancel.is_cancelled() {
            return Err(cancelled());
        }

        let attempt = tokio::select! {
            _ = cancel.cancelled() => return Err(cancelled()),
            result = source.subscribe(filter.clone()) => result,
        };

        match attempt {
            Ok(subscription) => {
                info!(
                    participant = %filter.participant,
                    counterpart = ?filter.counterpart,
                    attempts = failed_attempts + 1,
                    "push subscription established"
                );
                return Ok(subscription);
            }
            Err(err) => {
                failed_attempts = failed_attempts.saturating_add(1);
                if !err.is_transient() {
                    warn!(
                        code = %err.code,
                        category = ?err.category,
                        "push subscription refused; not retrying"
                    );
                    return Err(err);
                }
                if !policy.allows_attempt(failed_attempts) {
                    warn!(
                        code = %err.code,
                        attempts = failed_attempts,
                        "push subscription retries exhausted"
                    );
                    return Err(err);
                }

                let delay = policy.delay_for_attempt(failed_attempts - 1, err.retry_after_ms);
                warn!(
                    code = %err.code,
                    attempt = failed_attempts,
                    retry_in_ms = delay.as_millis() as u64,
                    "push subscription failed; retrying"
                );
                on_retry(failed_attempts, delay);

                tokio::select! {
                    _ = cancel.cancelled() => return Err(cancelled()),
                    _ = tokio::time::sleep(delay) => {}
                }
            }
        }
    }
}

fn cancelled() -> BackendError {
    BackendError::new(
        BackendErrorCategory::Internal,
        "subscription_cancelled",
        "subscription attempt was cancelled",
    )
}

/// Owns the conversation-scoped subscription slot.
///
/// Installing a new subscription cancels the previous one first so two
/// conversations never deliver concurrently.
#[derive(Debug, Default)]
pub struct ConversationSubscriptions {
    current: Option<ActiveSubscription>,
    generation: u64,
}

#[derive(Debug)]
struct ActiveSubscription {
    partner_id: String,
    generation: u64,
    token: CancellationToken,
}

impl ConversationSubscriptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn partner_id(&self) -> Option<&str> {
        self.current.as_ref().map(|active| active.partner_id.as_str())
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Cancel the previous subscription and reserve a slot for `partner_id`.
    ///
    /// The returned token is cancelled when the slot is replaced or cleared;
    /// the caller ties the subscription's forwarding task to it.
    pub fn install(&mut self, partner_id: &str) -> (u64, CancellationToken) {
        self.cancel_current();
        self.generation += 1;
        let token = CancellationToken::new();
        self.current = Some(ActiveSubscription {
            partner_id: partner_id.to_owned(),
            generation: self.generation,
            token: token.clone(),
        });
        debug!(
            partner_id,
            generation = self.generation,
            "conversation subscription slot installed"
        );
        (self.generation, token)
    }

    pub fn is_current(&self, generation: u64) -> bool {
        self.current
            .as_ref()
            .is_some_and(|active| active.generation == generation)
    }

    pub fn clear(&mut self) {
        self.cancel_current();
    }

    fn cancel_current(&mut self) {
        if let Some(previous) = self.current.take() {
            previous.token.cancel();
            debug!(
                partner_id = %previous.partner_id,
                generation = previous.generation,
                "cancelled previous conversation subscription"
            );
        }
    }
}

impl Drop for ConversationSubscriptions {
    fn drop(&mut self) {
        self.cancel_current();
    }
}
