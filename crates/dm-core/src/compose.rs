use std::collections::HashMap;

use tracing::{debug, warn};
use uuid::Uuid;

use crate::{
    clock,
    error::{BackendError, BackendErrorCategory},
    gate::ConnectionGate,
    normalization::SendOutcome,
    ports::MessageRepository,
    store::{MessageStore, OptimisticDraft, StoreOutcome},
    types::{Message, NewMessage},
};

/// Send issued by [`ComposeController::begin_send`], awaiting the backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendRequest {
    pub client_txn_id: String,
    pub partner_id: String,
    pub payload: NewMessage,
    /// Reply target at the time of sending.
    pub reply_to: Option<String>,
}

/// Outgoing draft state plus the sends it has in flight.
#[derive(Debug, Default, Clone)]
pub struct ComposeController {
    draft: String,
    reply_to: Option<String>,
    outbox: HashMap<String, SendRequest>,
}

impl ComposeController {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn draft(&self) -> &str {
        &self.draft
    }

    pub fn reply_to(&self) -> Option<&str> {
        self.reply_to.as_deref()
    }

    pub fn pending_sends(&self) -> usize {
        self.outbox.len()
    }

    pub fn set_draft(&mut self, text: impl Into<String>) {
        self.draft = text.into();
    }

    pub fn set_reply_target(&mut self, message_id: Option<String>) {
        self.reply_to = message_id;
    }

    /// Drop draft, reply target and outbox, e.g. when switching conversations.
    pub fn reset(&mut self) {
        self.draft.clear();
        self.reply_to = None;
        self.outbox.clear();
    }

    /// Validate the draft, insert the optimistic entry and clear the input.
    ///
    /// Nothing is mutated when validation fails.
    pub fn begin_send(
        &mut self,
        store: &mut MessageStore,
        gate: &ConnectionGate,
    ) -> Result<SendRequest, BackendError> {
        let content = self.draft.trim();
        if content.is_empty() {
            return Err(BackendError::validation(
                "empty_message",
                "message text must not be empty",
            ));
        }
        let Some(partner_id) = store.partner_id().map(str::to_owned) else {
            return Err(BackendError::validation(
                "no_conversation",
                "open a conversation before sending",
            ));
        };
        gate.ensure_connected()?;
        if gate.partner_id() != Some(partner_id.as_str()) {
            return Err(BackendError::not_connected(&partner_id));
        }

        let client_txn_id = Uuid::new_v4().to_string();
        let newest = store.messages().last().map(|message| message.created_at_ms);
        let pending = store.apply_optimistic_send(OptimisticDraft {
            client_txn_id: client_txn_id.clone(),
            content: content.to_owned(),
            reply_to_id: self.reply_to.clone(),
            created_at_ms: clock::optimistic_timestamp_ms(newest),
        })?;

        let payload = store.new_message_for(&pending).ok_or_else(|| {
            BackendError::new(
                BackendErrorCategory::Internal,
                "missing_correlation_id",
                "optimistic entry has no correlation id",
            )
        })?;

        self.draft.clear();
        let request = SendRequest {
            client_txn_id: client_txn_id.clone(),
            partner_id,
            payload,
            reply_to: self.reply_to.clone(),
        };
        self.outbox.insert(client_txn_id.clone(), request.clone());

        debug!(
            client_txn_id = %client_txn_id,
            partner_id = %request.partner_id,
            "queued optimistic send"
        );
        Ok(request)
    }

    /// Reconcile or roll back the optimistic entry for `request`.
    pub fn complete_send(
        &mut self,
        store: &mut MessageStore,
        request: &SendRequest,
        result: Result<Message, BackendError>,
    ) -> SendOutcome {
        self.outbox.remove(&request.client_txn_id);

        match result {
            Ok(confirmed) => {
                let message_id = confirmed.id.clone();
                let applied = store.confirm_send(&request.client_txn_id, confirmed);
                if applied == StoreOutcome::Ignored {
                    debug!(
                        client_txn_id = %request.client_txn_id,
                        "send confirmed after conversation closed"
                    );
                }
                if self.reply_to == request.reply_to {
                    self.reply_to = None;
                }
                SendOutcome::Success { message_id }
            }
            Err(error) => {
                warn!(
                    client_txn_id = %request.client_txn_id,
                    code = %error.code,
                    "send failed; rolling back optimistic entry"
                );
                store.rollback_optimistic(&request.client_txn_id, &error.code);
                SendOutcome::Failure { error }
            }
        }
    }

    /// Send the current draft through `repo`.
    pub async fn send(
        &mut self,
        store: &mut MessageStore,
        gate: &ConnectionGate,
        repo: &dyn MessageRepository,
    ) -> Result<Message, BackendError> {
        let request = self.begin_send(store, gate)?;
        let result = repo.create_message(request.payload.clone()).await;
        let confirmed = result.clone();
        match self.complete_send(store, &request, result) {
            SendOutcome::Success { .. } => confirmed,
            SendOutcome::Failure { error } => Err(error),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        store::DEFAULT_PAGE_SIZE,
        types::{ConnectionStatus, Delivery, MessagePage, ReplyRef},
    };

    fn message(id: &str, sender: &str, receiver: &str, created_at_ms: u64) -> Message {
        Message {
            id: id.into(),
            sender_id: sender.into(),
            receiver_id: receiver.into(),
            content: format!("body {id}"),
            created_at_ms,
            is_read: false,
            reply_to: None,
            reactions: Vec::new(),
            client_txn_id: None,
            delivery: Delivery::Confirmed,
        }
    }

    fn setup(status: ConnectionStatus, history: Vec<Message>) -> (MessageStore, ConnectionGate) {
        let mut store = MessageStore::new("alice", DEFAULT_PAGE_SIZE);
        let (request, _) = store.begin_open("bob").expect("open");
        store
            .complete_open(
                &request,
                Ok(MessagePage {
                    messages: history,
                    has_more: false,
                }),
            )
            .expect("load");

        let mut gate = ConnectionGate::new("alice");
        let lookup = gate.begin_refresh("bob").expect("gate");
        gate.complete_refresh(&lookup, Ok(status));
        (store, gate)
    }

    fn server_copy(request: &SendRequest, id: &str) -> Message {
        let mut confirmed = message(id, "alice", "bob", 9_999_999_999_999);
        confirmed.content = request.payload.content.clone();
        confirmed.reply_to = request.payload.reply_to_id.as_deref().map(ReplyRef::bare);
        confirmed
    }

    #[test]
    fn not_connected_leaves_store_untouched() {
        let (mut store, gate) = setup(ConnectionStatus::Pending, Vec::new());
        let mut compose = ComposeController::new();
        compose.set_draft("hi");

        let err = compose.begin_send(&mut store, &gate).expect_err("blocked");
        assert_eq!(err.category, BackendErrorCategory::Authorization);
        assert!(store.messages().is_empty());
        assert_eq!(compose.draft(), "hi");
    }

    #[test]
    fn whitespace_only_draft_is_rejected() {
        let (mut store, gate) = setup(ConnectionStatus::Accepted, Vec::new());
        let mut compose = ComposeController::new();
        compose.set_draft("   \n");

        let err = compose.begin_send(&mut store, &gate).expect_err("empty");
        assert_eq!(err.code, "empty_message");
        assert!(store.messages().is_empty());
    }

    #[test]
    fn send_clears_draft_and_inserts_pending_entry() {
        let (mut store, gate) = setup(ConnectionStatus::Accepted, Vec::new());
        let mut compose = ComposeController::new();
        compose.set_draft("  hello  ");

        let request = compose.begin_send(&mut store, &gate).expect("send");
        assert_eq!(compose.draft(), "");
        assert_eq!(request.payload.content, "hello");
        assert_eq!(store.messages().len(), 1);
        assert!(store.messages()[0].is_pending());
        assert_eq!(compose.pending_sends(), 1);
    }

    #[test]
    fn confirmed_send_then_fuller_echo_replaces_in_place() {
        let (mut store, gate) = setup(
            ConnectionStatus::Accepted,
            vec![message("m-1", "bob", "alice", 10)],
        );
        let mut compose = ComposeController::new();
        compose.set_draft("hello");
        compose.set_reply_target(Some("m-1".into()));

        let request = compose.begin_send(&mut store, &gate).expect("send");
        let confirmed = server_copy(&request, "m-2");
        let outcome = compose.complete_send(&mut store, &request, Ok(confirmed.clone()));
        assert_eq!(
            outcome,
            SendOutcome::Success {
                message_id: "m-2".into()
            }
        );
        assert_eq!(compose.reply_to(), None);

        let before: Vec<String> = store.messages().iter().map(|m| m.id.clone()).collect();
        let mut echo = confirmed;
        echo.reply_to = Some(ReplyRef {
            id: "m-1".into(),
            sender_id: Some("bob".into()),
            content_preview: Some("body m-1".into()),
        });
        store.apply_remote_insert(echo);

        let after: Vec<String> = store.messages().iter().map(|m| m.id.clone()).collect();
        assert_eq!(before, after);
        assert_eq!(after, vec!["m-1", "m-2"]);
        assert_eq!(
            store.messages()[1]
                .reply_to
                .as_ref()
                .and_then(|r| r.content_preview.as_deref()),
            Some("body m-1")
        );
    }

    #[test]
    fn failed_send_rolls_back_and_keeps_reply_target() {
        let (mut store, gate) = setup(
            ConnectionStatus::Accepted,
            vec![message("m-1", "bob", "alice", 10)],
        );
        let mut compose = ComposeController::new();
        compose.set_draft("hello");
        compose.set_reply_target(Some("m-1".into()));

        let request = compose.begin_send(&mut store, &gate).expect("send");
        let outcome = compose.complete_send(
            &mut store,
            &request,
            Err(BackendError::network("send_failed", "offline")),
        );

        assert!(matches!(outcome, SendOutcome::Failure { .. }));
        assert_eq!(store.messages().len(), 1);
        assert_eq!(compose.reply_to(), Some("m-1"));
        assert_eq!(compose.draft(), "");
        assert_eq!(compose.pending_sends(), 0);
    }

    #[test]
    fn changed_reply_target_survives_success() {
        let (mut store, gate) = setup(
            ConnectionStatus::Accepted,
            vec![
                message("m-1", "bob", "alice", 10),
                message("m-2", "bob", "alice", 20),
            ],
        );
        let mut compose = ComposeController::new();
        compose.set_draft("hello");
        compose.set_reply_target(Some("m-1".into()));
        let request = compose.begin_send(&mut store, &gate).expect("send");

        compose.set_reply_target(Some("m-2".into()));
        let confirmed = server_copy(&request, "m-3");
        compose.complete_send(&mut store, &request, Ok(confirmed));
        assert_eq!(compose.reply_to(), Some("m-2"));
    }

    #[test]
    fn unknown_reply_target_is_rejected_before_clearing_input() {
        let (mut store, gate) = setup(ConnectionStatus::Accepted, Vec::new());
        let mut compose = ComposeController::new();
        compose.set_draft("hello");
        compose.set_reply_target(Some("m-404".into()));

        let err = compose.begin_send(&mut store, &gate).expect_err("unknown target");
        assert_eq!(err.code, "reply_target_not_found");
        assert_eq!(compose.draft(), "hello");
        assert!(store.messages().is_empty());
    }
}
