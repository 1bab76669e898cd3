//! Per-conversation message cache.
//!
//! Async work is split into `begin_*` (pure state transition that returns a
//! request descriptor) and `complete_*` (applies a result if it is still
//! relevant). The session actor issues the I/O between the two halves, which
//! lets results arrive out of order without locks: each request carries the
//! generation and partner it was issued for, and stale results are discarded.

use tracing::{debug, trace, warn};

use crate::{
    error::BackendError,
    ports::MessageRepository,
    reactions,
    state_machine::{StoreStateMachine, StoreTransition},
    timeline::{MessageTimeline, TimelineChange},
    types::{
        ConversationKey, Delivery, Message, MessagePage, NewMessage, PageCursor, ReactionChange,
        ReadFlag, ReplyRef, StoreState, TimelineEntry,
    },
};

/// Page size used when none is configured.
pub const DEFAULT_PAGE_SIZE: u16 = 30;
/// Largest page the backend accepts.
pub const SERVER_PAGE_SIZE_CAP: u16 = 100;

/// Descriptor for an in-flight initial page fetch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpenRequest {
    pub generation: u64,
    pub partner_id: String,
    pub key: ConversationKey,
    pub page_size: u16,
}

/// Descriptor for an in-flight backward pagination fetch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OlderRequest {
    pub generation: u64,
    pub partner_id: String,
    pub key: ConversationKey,
    pub cursor: PageCursor,
    pub page_size: u16,
}

/// What a `complete_*` or `apply_*` call did to the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreOutcome {
    /// The loaded window changed.
    Applied(TimelineChange),
    /// The operation matched nothing loaded; state unchanged.
    Ignored,
    /// The result belonged to a superseded request and was dropped.
    Discarded,
}

impl StoreOutcome {
    pub fn changed(self) -> bool {
        matches!(self, Self::Applied(change) if change.is_change())
    }
}

/// Optimistic send descriptor produced by [`MessageStore::apply_optimistic_send`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OptimisticDraft {
    pub client_txn_id: String,
    pub content: String,
    pub reply_to_id: Option<String>,
    pub created_at_ms: u64,
}

/// Live change routed into the store by the realtime bridge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreUpdate {
    Insert(Message),
    Update(Message),
    Delete { message_id: String },
    Reaction(ReactionChange),
    ReadFlag(ReadFlag),
}

#[derive(Debug, Clone)]
pub struct MessageStore {
    viewer_id: String,
    partner_id: Option<String>,
    generation: u64,
    machine: StoreStateMachine,
    timeline: MessageTimeline,
    cursor: Option<PageCursor>,
    has_more: bool,
    older_in_flight: Option<OlderRequest>,
    page_size: u16,
}

impl MessageStore {
    pub fn new(viewer_id: impl Into<String>, page_size: u16) -> Self {
        Self {
            viewer_id: viewer_id.into(),
            partner_id: None,
            generation: 0,
            machine: StoreStateMachine::default(),
            timeline: MessageTimeline::new(),
            cursor: None,
            has_more: false,
            older_in_flight: None,
            page_size: MessageTimeline::bounded_paginate_limit(page_size, SERVER_PAGE_SIZE_CAP),
        }
    }

    pub fn viewer_id(&self) -> &str {
        &self.viewer_id
    }

    pub fn partner_id(&self) -> Option<&str> {
        self.partner_id.as_deref()
    }

    pub fn state(&self) -> StoreState {
        self.machine.state()
    }

    pub fn messages(&self) -> &[Message] {
        self.timeline.items()
    }

    pub fn message(&self, id: &str) -> Option<&Message> {
        self.timeline.get(id)
    }

    pub fn has_more(&self) -> bool {
        self.has_more
    }

    pub fn cursor(&self) -> Option<&PageCursor> {
        self.cursor.as_ref()
    }

    pub fn page_size(&self) -> u16 {
        self.page_size
    }

    pub fn older_in_flight(&self) -> Option<&OlderRequest> {
        self.older_in_flight.as_ref()
    }

    /// Display rows for the loaded window with grouped reactions.
    pub fn entries(&self) -> Vec<TimelineEntry> {
        self.timeline
            .items()
            .iter()
            .map(|message| TimelineEntry {
                is_own: message.is_outgoing(&self.viewer_id),
                reactions: reactions::ordered_groups(&message.reactions),
                message: message.clone(),
            })
            .collect()
    }

    /// Key of the open conversation, if any.
    pub fn conversation_key(&self) -> Option<ConversationKey> {
        self.partner_id
            .as_ref()
            .map(|partner| ConversationKey::new(self.viewer_id.clone(), partner.clone()))
    }

    /// Start loading the newest page of the conversation with `partner_id`.
    ///
    /// Any older-page request in flight is dropped and returned so the caller
    /// can cancel its I/O.
    pub fn begin_open(
        &mut self,
        partner_id: &str,
    ) -> Result<(OpenRequest, Option<OlderRequest>), BackendError> {
        let partner_id = partner_id.trim();
        if partner_id.is_empty() {
            return Err(BackendError::validation(
                "invalid_partner",
                "partner id must not be empty",
            ));
        }
        if partner_id == self.viewer_id {
            return Err(BackendError::validation(
                "self_conversation",
                "cannot open a conversation with yourself",
            ));
        }

        self.machine.apply(StoreTransition::Open)?;
        self.generation += 1;
        self.partner_id = Some(partner_id.to_owned());
        self.timeline.clear();
        self.cursor = None;
        self.has_more = false;
        let cancelled = self.older_in_flight.take();

        debug!(
            partner_id,
            generation = self.generation,
            "message store opening conversation"
        );

        Ok((
            OpenRequest {
                generation: self.generation,
                partner_id: partner_id.to_owned(),
                key: ConversationKey::new(self.viewer_id.clone(), partner_id.to_owned()),
                page_size: self.page_size,
            },
            cancelled,
        ))
    }

    pub fn complete_open(
        &mut self,
        request: &OpenRequest,
        result: Result<MessagePage, BackendError>,
    ) -> Result<StoreOutcome, BackendError> {
        let awaiting = matches!(self.state(), StoreState::Loading | StoreState::Stale);
        if !self.is_current(request.generation, &request.partner_id) || !awaiting {
            trace!(
                partner_id = %request.partner_id,
                generation = request.generation,
                "discarding stale open result"
            );
            return Ok(StoreOutcome::Discarded);
        }

        let page = match result {
            Ok(page) => page,
            Err(err) => {
                warn!(
                    partner_id = %request.partner_id,
                    code = %err.code,
                    "initial message page failed to load"
                );
                self.machine.apply(StoreTransition::OpenFailed)?;
                return Err(err);
            }
        };

        // Live inserts that raced the fetch are already in the timeline.
        for message in page.messages {
            if message.conversation_key() == request.key {
                self.timeline.upsert(message);
            }
        }
        self.has_more = page.has_more;
        self.cursor = self.next_cursor();
        self.machine.apply(StoreTransition::OpenSucceeded)?;

        debug!(
            partner_id = %request.partner_id,
            loaded = self.timeline.len(),
            has_more = self.has_more,
            "message store loaded conversation"
        );
        Ok(StoreOutcome::Applied(TimelineChange::Inserted))
    }

    /// Start a backward fetch, or `None` when it would be redundant.
    pub fn begin_load_older(&mut self) -> Option<OlderRequest> {
        if self.state() != StoreState::Loaded || self.older_in_flight.is_some() {
            return None;
        }
        let cursor = self.cursor.clone()?;
        let partner_id = self.partner_id.clone()?;

        self.machine.apply(StoreTransition::BeginLoadOlder).ok()?;
        let request = OlderRequest {
            generation: self.generation,
            key: ConversationKey::new(self.viewer_id.clone(), partner_id.clone()),
            partner_id,
            cursor,
            page_size: self.page_size,
        };
        self.older_in_flight = Some(request.clone());
        Some(request)
    }

    pub fn complete_load_older(
        &mut self,
        request: &OlderRequest,
        result: Result<MessagePage, BackendError>,
    ) -> Result<StoreOutcome, BackendError> {
        if self.older_in_flight.as_ref() != Some(request) {
            trace!(
                partner_id = %request.partner_id,
                generation = request.generation,
                "discarding stale older-page result"
            );
            return Ok(StoreOutcome::Discarded);
        }
        self.older_in_flight = None;
        self.machine.apply(StoreTransition::OlderFinished)?;

        let page = match result {
            Ok(page) => page,
            Err(err) => {
                warn!(
                    partner_id = %request.partner_id,
                    code = %err.code,
                    "older message page failed to load"
                );
                return Err(err);
            }
        };

        let mut inserted = 0_usize;
        for message in page.messages {
            if message.conversation_key() == request.key
                && request.cursor.admits(&message)
                && self.timeline.upsert(message) == TimelineChange::Inserted
            {
                inserted += 1;
            }
        }
        self.has_more = page.has_more;
        self.cursor = self.next_cursor();

        debug!(
            partner_id = %request.partner_id,
            inserted,
            has_more = self.has_more,
            "message store prepended older page"
        );
        Ok(StoreOutcome::Applied(if inserted > 0 {
            TimelineChange::Inserted
        } else {
            TimelineChange::Unchanged
        }))
    }

    /// Apply a confirmed message delivered by the change feed.
    pub fn apply_remote_insert(&mut self, message: Message) -> StoreOutcome {
        if !self.accepts(&message) {
            return StoreOutcome::Ignored;
        }
        StoreOutcome::Applied(self.timeline.upsert(message))
    }

    /// Apply an updated row; unknown ids are dropped rather than backfilled.
    pub fn apply_remote_update(&mut self, message: Message) -> StoreOutcome {
        if !self.accepts(&message) || self.timeline.position(&message.id).is_none() {
            return StoreOutcome::Ignored;
        }
        StoreOutcome::Applied(self.timeline.upsert(message))
    }

    pub fn apply_remote_delete(&mut self, message_id: &str) -> StoreOutcome {
        match self.timeline.remove(message_id) {
            Some(_) => StoreOutcome::Applied(TimelineChange::Removed),
            None => StoreOutcome::Ignored,
        }
    }

    /// Insert a locally-originated message before the backend confirms it.
    pub fn apply_optimistic_send(&mut self, draft: OptimisticDraft) -> Result<Message, BackendError> {
        let Some(partner_id) = self.partner_id.clone() else {
            return Err(BackendError::validation(
                "no_conversation",
                "open a conversation before sending",
            ));
        };

        let reply_to = match draft.reply_to_id {
            Some(reply_id) => Some(self.reply_ref_for(&reply_id)?),
            None => None,
        };

        let message = Message {
            id: Message::local_id(&draft.client_txn_id),
            sender_id: self.viewer_id.clone(),
            receiver_id: partner_id,
            content: draft.content,
            created_at_ms: draft.created_at_ms,
            is_read: false,
            reply_to,
            reactions: Vec::new(),
            delivery: Delivery::Pending {
                client_txn_id: draft.client_txn_id.clone(),
            },
            client_txn_id: Some(draft.client_txn_id),
        };
        self.timeline.upsert(message.clone());
        Ok(message)
    }

    /// Reconcile a pending entry with the backend's `createMessage` response.
    pub fn confirm_send(&mut self, client_txn_id: &str, mut confirmed: Message) -> StoreOutcome {
        confirmed.client_txn_id = Some(client_txn_id.to_owned());
        confirmed.delivery = Delivery::Confirmed;
        self.apply_remote_insert(confirmed)
    }

    /// Remove a pending entry after the backend rejected it.
    pub fn rollback_optimistic(&mut self, client_txn_id: &str, error_code: &str) -> Option<Message> {
        let mut removed = self.timeline.remove_pending(client_txn_id)?;
        removed.delivery = Delivery::Failed {
            client_txn_id: client_txn_id.to_owned(),
            error_code: error_code.to_owned(),
        };
        Some(removed)
    }

    pub fn apply_reaction(&mut self, change: &ReactionChange) -> StoreOutcome {
        let change_result = self
            .timeline
            .update_in_place(change.message_id(), |message| match change {
                ReactionChange::Added(reaction) => {
                    if message.reactions.iter().any(|r| r.same_triple(reaction)) {
                        return false;
                    }
                    message.reactions.push(reaction.clone());
                    true
                }
                ReactionChange::Removed {
                    user_id, emoji, ..
                } => {
                    let before = message.reactions.len();
                    message
                        .reactions
                        .retain(|r| !(r.user_id == *user_id && r.emoji == *emoji));
                    before != message.reactions.len()
                }
            });
        Self::outcome_for_update(&self.timeline, change.message_id(), change_result)
    }

    pub fn apply_read_flag(&mut self, flag: &ReadFlag) -> StoreOutcome {
        let change = self.timeline.update_in_place(&flag.message_id, |message| {
            if message.is_read == flag.is_read {
                return false;
            }
            message.is_read = flag.is_read;
            true
        });
        Self::outcome_for_update(&self.timeline, &flag.message_id, change)
    }

    pub fn apply(&mut self, update: StoreUpdate) -> StoreOutcome {
        match update {
            StoreUpdate::Insert(message) => self.apply_remote_insert(message),
            StoreUpdate::Update(message) => self.apply_remote_update(message),
            StoreUpdate::Delete { message_id } => self.apply_remote_delete(&message_id),
            StoreUpdate::Reaction(change) => self.apply_reaction(&change),
            StoreUpdate::ReadFlag(flag) => self.apply_read_flag(&flag),
        }
    }

    /// The push subscription was lost; the window may be missing events.
    pub fn mark_stale(&mut self) -> StoreState {
        self.machine
            .apply(StoreTransition::SubscriptionLost)
            .unwrap_or(self.machine.state())
    }

    /// Close the conversation and drop all loaded state.
    pub fn close(&mut self) -> Option<OlderRequest> {
        self.generation += 1;
        self.partner_id = None;
        self.timeline.clear();
        self.cursor = None;
        self.has_more = false;
        let _ = self.machine.apply(StoreTransition::Close);
        self.older_in_flight.take()
    }

    /// Load the newest page directly against a repository.
    pub async fn open(
        &mut self,
        partner_id: &str,
        repo: &dyn MessageRepository,
    ) -> Result<StoreOutcome, BackendError> {
        let (request, _cancelled) = self.begin_open(partner_id)?;
        let result = repo
            .fetch_messages(&request.key, None, request.page_size)
            .await;
        self.complete_open(&request, result)
    }

    /// Load one older page directly against a repository.
    pub async fn load_older(
        &mut self,
        repo: &dyn MessageRepository,
    ) -> Result<StoreOutcome, BackendError> {
        let Some(request) = self.begin_load_older() else {
            return Ok(StoreOutcome::Ignored);
        };
        let result = repo
            .fetch_messages(&request.key, Some(&request.cursor), request.page_size)
            .await;
        self.complete_load_older(&request, result)
    }

    /// Build the `createMessage` payload for a pending entry.
    pub fn new_message_for(&self, pending: &Message) -> Option<NewMessage> {
        Some(NewMessage {
            sender_id: pending.sender_id.clone(),
            receiver_id: pending.receiver_id.clone(),
            content: pending.content.clone(),
            reply_to_id: pending.reply_to.as_ref().map(|reply| reply.id.clone()),
            client_txn_id: pending.client_txn_id.clone()?,
        })
    }

    fn reply_ref_for(&self, reply_id: &str) -> Result<ReplyRef, BackendError> {
        let target = self
            .timeline
            .get(reply_id)
            .filter(|target| !target.is_pending())
            .ok_or_else(|| {
                BackendError::validation(
                    "reply_target_not_found",
                    format!("message {reply_id} is not part of this conversation"),
                )
            })?;

        Ok(ReplyRef {
            id: target.id.clone(),
            sender_id: Some(target.sender_id.clone()),
            content_preview: Some(target.content.clone()),
        })
    }

    fn accepts(&self, message: &Message) -> bool {
        if !self.machine.accepts_live_events() {
            return false;
        }
        self.conversation_key()
            .is_some_and(|key| key == message.conversation_key())
    }

    fn is_current(&self, generation: u64, partner_id: &str) -> bool {
        self.generation == generation && self.partner_id.as_deref() == Some(partner_id)
    }

    fn next_cursor(&self) -> Option<PageCursor> {
        if !self.has_more {
            return None;
        }
        self.timeline
            .items()
            .iter()
            .find(|message| !message.is_pending())
            .map(PageCursor::from_oldest)
    }

    fn outcome_for_update(
        timeline: &MessageTimeline,
        message_id: &str,
        change: TimelineChange,
    ) -> StoreOutcome {
        if timeline.position(message_id).is_none() {
            StoreOutcome::Ignored
        } else {
            StoreOutcome::Applied(change)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Reaction;

    fn message(id: &str, sender: &str, receiver: &str, created_at_ms: u64) -> Message {
        Message {
            id: id.to_owned(),
            sender_id: sender.to_owned(),
            receiver_id: receiver.to_owned(),
            content: format!("body {id}"),
            created_at_ms,
            is_read: false,
            reply_to: None,
            reactions: Vec::new(),
            client_txn_id: None,
            delivery: Delivery::Confirmed,
        }
    }

    fn page(messages: Vec<Message>, has_more: bool) -> MessagePage {
        // Wire order is newest-first.
        let mut messages = messages;
        messages.reverse();
        MessagePage { messages, has_more }
    }

    fn loaded_store(messages: Vec<Message>, has_more: bool) -> MessageStore {
        let mut store = MessageStore::new("alice", DEFAULT_PAGE_SIZE);
        let (request, _) = store.begin_open("bob").expect("open");
        store
            .complete_open(&request, Ok(page(messages, has_more)))
            .expect("load");
        store
    }

    fn ids(store: &MessageStore) -> Vec<&str> {
        store.messages().iter().map(|m| m.id.as_str()).collect()
    }

    fn draft(txn: &str, created_at_ms: u64) -> OptimisticDraft {
        OptimisticDraft {
            client_txn_id: txn.to_owned(),
            content: "hello".to_owned(),
            reply_to_id: None,
            created_at_ms,
        }
    }

    #[test]
    fn opening_an_empty_conversation_walks_empty_loading_loaded() {
        let mut store = MessageStore::new("alice", DEFAULT_PAGE_SIZE);
        assert_eq!(store.state(), StoreState::Empty);

        let (request, cancelled) = store.begin_open("bob").expect("open");
        assert!(cancelled.is_none());
        assert_eq!(store.state(), StoreState::Loading);

        let outcome = store
            .complete_open(&request, Ok(MessagePage::default()))
            .expect("load");
        assert!(matches!(outcome, StoreOutcome::Applied(_)));
        assert_eq!(store.state(), StoreState::Loaded);
        assert!(store.messages().is_empty());
        assert!(!store.has_more());
        assert!(store.cursor().is_none());
    }

    #[test]
    fn initial_page_is_resorted_oldest_first() {
        let store = loaded_store(
            vec![
                message("m-1", "alice", "bob", 10),
                message("m-2", "bob", "alice", 20),
            ],
            true,
        );
        assert_eq!(ids(&store), vec!["m-1", "m-2"]);
        assert_eq!(store.cursor().map(|c| c.before_id.as_str()), Some("m-1"));
    }

    #[test]
    fn rejects_self_conversation() {
        let mut store = MessageStore::new("alice", DEFAULT_PAGE_SIZE);
        let err = store.begin_open("alice").expect_err("self must fail");
        assert_eq!(err.code, "self_conversation");
        assert_eq!(store.state(), StoreState::Empty);
    }

    #[test]
    fn failed_open_returns_to_empty_and_surfaces_error() {
        let mut store = MessageStore::new("alice", DEFAULT_PAGE_SIZE);
        let (request, _) = store.begin_open("bob").expect("open");
        let err = store
            .complete_open(&request, Err(BackendError::network("fetch_failed", "offline")))
            .expect_err("error surfaces");
        assert_eq!(err.code, "fetch_failed");
        assert_eq!(store.state(), StoreState::Empty);
    }

    #[test]
    fn load_older_twice_yields_one_request() {
        let mut store = loaded_store(vec![message("m-5", "bob", "alice", 50)], true);

        let first = store.begin_load_older();
        let second = store.begin_load_older();
        assert!(first.is_some());
        assert!(second.is_none());
        assert_eq!(store.state(), StoreState::LoadingOlder);
    }

    #[test]
    fn load_older_is_noop_without_cursor() {
        let mut store = loaded_store(vec![message("m-1", "bob", "alice", 10)], false);
        assert!(store.begin_load_older().is_none());
        assert_eq!(store.state(), StoreState::Loaded);
    }

    #[test]
    fn older_page_lands_at_head_and_advances_cursor() {
        let mut store = loaded_store(vec![message("m-5", "bob", "alice", 50)], true);
        let request = store.begin_load_older().expect("request");
        store
            .complete_load_older(
                &request,
                Ok(page(
                    vec![
                        message("m-3", "alice", "bob", 30),
                        message("m-4", "bob", "alice", 40),
                    ],
                    false,
                )),
            )
            .expect("apply");

        assert_eq!(ids(&store), vec!["m-3", "m-4", "m-5"]);
        assert_eq!(store.state(), StoreState::Loaded);
        assert!(store.cursor().is_none());
        assert!(store.begin_load_older().is_none());
    }

    #[test]
    fn repeated_completion_for_same_cursor_is_discarded() {
        let mut store = loaded_store(vec![message("m-5", "bob", "alice", 50)], true);
        let request = store.begin_load_older().expect("request");
        let older = page(vec![message("m-4", "bob", "alice", 40)], true);

        store
            .complete_load_older(&request, Ok(older.clone()))
            .expect("apply");
        let again = store
            .complete_load_older(&request, Ok(older))
            .expect("second completion");
        assert_eq!(again, StoreOutcome::Discarded);
        assert_eq!(ids(&store), vec!["m-4", "m-5"]);
    }

    #[test]
    fn failed_older_load_keeps_cursor() {
        let mut store = loaded_store(vec![message("m-5", "bob", "alice", 50)], true);
        let request = store.begin_load_older().expect("request");
        store
            .complete_load_older(&request, Err(BackendError::network("n", "offline")))
            .expect_err("error surfaces");
        assert_eq!(store.state(), StoreState::Loaded);
        assert!(store.begin_load_older().is_some());
    }

    #[test]
    fn switching_a_b_a_discards_stale_older_result() {
        let mut store = loaded_store(vec![message("m-5", "bob", "alice", 50)], true);
        let stale = store.begin_load_older().expect("older for bob");

        let (to_carol, cancelled) = store.begin_open("carol").expect("open carol");
        assert_eq!(cancelled.as_ref(), Some(&stale));
        let (back_to_bob, _) = store.begin_open("bob").expect("reopen bob");

        let carol_result =
            store.complete_open(&to_carol, Ok(page(vec![message("c-1", "carol", "alice", 5)], false)));
        assert_eq!(carol_result, Ok(StoreOutcome::Discarded));

        let stale_result = store.complete_load_older(
            &stale,
            Ok(page(vec![message("m-1", "bob", "alice", 10)], false)),
        );
        assert_eq!(stale_result, Ok(StoreOutcome::Discarded));

        store
            .complete_open(&back_to_bob, Ok(page(vec![message("m-5", "bob", "alice", 50)], true)))
            .expect("fresh load");
        assert_eq!(ids(&store), vec!["m-5"]);
    }

    #[test]
    fn remote_insert_for_other_conversation_is_ignored() {
        let mut store = loaded_store(Vec::new(), false);
        let outcome = store.apply_remote_insert(message("x-1", "carol", "alice", 10));
        assert_eq!(outcome, StoreOutcome::Ignored);
        assert!(store.messages().is_empty());
    }

    #[test]
    fn live_insert_during_loading_merges_with_page() {
        let mut store = MessageStore::new("alice", DEFAULT_PAGE_SIZE);
        let (request, _) = store.begin_open("bob").expect("open");
        store.apply_remote_insert(message("m-3", "bob", "alice", 30));
        store
            .complete_open(
                &request,
                Ok(page(
                    vec![
                        message("m-2", "alice", "bob", 20),
                        message("m-3", "bob", "alice", 30),
                    ],
                    false,
                )),
            )
            .expect("load");
        assert_eq!(ids(&store), vec!["m-2", "m-3"]);
    }

    #[test]
    fn echo_replaces_optimistic_placeholder_in_place() {
        let mut store = loaded_store(
            vec![
                message("m-1", "bob", "alice", 10),
                message("m-2", "alice", "bob", 20),
            ],
            false,
        );
        store
            .apply_optimistic_send(OptimisticDraft {
                reply_to_id: Some("m-1".into()),
                ..draft("tx-1", 30)
            })
            .expect("optimistic");
        let confirmed = message("m-3", "alice", "bob", 30);
        store.confirm_send("tx-1", confirmed.clone());
        assert_eq!(ids(&store), vec!["m-1", "m-2", "m-3"]);

        let mut echo = confirmed;
        echo.client_txn_id = Some("tx-1".into());
        echo.reply_to = Some(ReplyRef {
            id: "m-1".into(),
            sender_id: Some("bob".into()),
            content_preview: Some("body m-1".into()),
        });
        let outcome = store.apply_remote_insert(echo);

        assert_eq!(outcome, StoreOutcome::Applied(TimelineChange::Replaced));
        assert_eq!(ids(&store), vec!["m-1", "m-2", "m-3"]);
        assert_eq!(
            store.messages()[2].reply_to.as_ref().map(|r| r.id.as_str()),
            Some("m-1")
        );
    }

    #[test]
    fn optimistic_reply_must_reference_loaded_message() {
        let mut store = loaded_store(vec![message("m-1", "bob", "alice", 10)], false);
        let err = store
            .apply_optimistic_send(OptimisticDraft {
                reply_to_id: Some("m-404".into()),
                ..draft("tx-1", 20)
            })
            .expect_err("unknown reply target");
        assert_eq!(err.code, "reply_target_not_found");
        assert_eq!(store.messages().len(), 1);
    }

    #[test]
    fn rollback_removes_pending_entry_and_marks_failed() {
        let mut store = loaded_store(vec![message("m-1", "bob", "alice", 10)], false);
        store.apply_optimistic_send(draft("tx-1", 20)).expect("optimistic");
        assert_eq!(store.messages().len(), 2);

        let removed = store
            .rollback_optimistic("tx-1", "send_failed")
            .expect("pending entry");
        assert_eq!(
            removed.delivery,
            Delivery::Failed {
                client_txn_id: "tx-1".into(),
                error_code: "send_failed".into()
            }
        );
        assert_eq!(ids(&store), vec!["m-1"]);
    }

    #[test]
    fn reactions_and_read_flags_mutate_loaded_messages_only() {
        let mut store = loaded_store(vec![message("m-1", "bob", "alice", 10)], false);
        let reaction = Reaction {
            message_id: "m-1".into(),
            user_id: "alice".into(),
            user_name: Some("Alice".into()),
            emoji: "👍".into(),
            created_at_ms: 11,
        };

        assert!(store
            .apply_reaction(&ReactionChange::Added(reaction.clone()))
            .changed());
        assert!(!store
            .apply_reaction(&ReactionChange::Added(reaction.clone()))
            .changed());
        assert_eq!(store.messages()[0].reactions.len(), 1);

        let unknown = Reaction {
            message_id: "m-404".into(),
            ..reaction
        };
        assert_eq!(
            store.apply_reaction(&ReactionChange::Added(unknown)),
            StoreOutcome::Ignored
        );

        assert!(store
            .apply_read_flag(&ReadFlag {
                message_id: "m-1".into(),
                is_read: true
            })
            .changed());
        assert!(store.messages()[0].is_read);
        assert_eq!(
            store.apply_read_flag(&ReadFlag {
                message_id: "m-404".into(),
                is_read: true
            }),
            StoreOutcome::Ignored
        );

        assert!(store
            .apply_reaction(&ReactionChange::Removed {
                message_id: "m-1".into(),
                user_id: "alice".into(),
                emoji: "👍".into(),
            })
            .changed());
        assert!(store.messages()[0].reactions.is_empty());
    }

    #[test]
    fn update_for_unloaded_message_is_not_backfilled() {
        let mut store = loaded_store(vec![message("m-2", "bob", "alice", 20)], false);
        let outcome = store.apply_remote_update(message("m-1", "bob", "alice", 10));
        assert_eq!(outcome, StoreOutcome::Ignored);
        assert_eq!(ids(&store), vec!["m-2"]);
        assert_eq!(store.apply_remote_delete("m-2"), StoreOutcome::Applied(TimelineChange::Removed));
        assert!(store.messages().is_empty());
    }

    #[test]
    fn stale_store_keeps_window_until_reopened() {
        let mut store = loaded_store(vec![message("m-1", "bob", "alice", 10)], true);
        assert_eq!(store.mark_stale(), StoreState::Stale);
        assert!(store.begin_load_older().is_none());
        assert_eq!(store.messages().len(), 1);
        assert!(store.apply_remote_insert(message("m-2", "bob", "alice", 20)).changed());
    }
}
