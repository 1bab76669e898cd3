//! Session actor owning every messaging component for one signed-in user.
//!
//! The actor is the single writer of store, directory, gate, compose and
//! read-receipt state. Backend I/O runs in spawned tasks that post a
//! [`Completion`] back to the actor's inbox; each completion carries the
//! request descriptor it was issued for so stale results are discarded
//! instead of applied.

use std::sync::Arc;

use dm_core::{
    BackendError, BackendErrorCategory, BridgeAction, ChangeEvent, ChangeEventSource,
    ChangeFilter, ComposeController, ConnectionGate, ConnectionRepository, ConnectionStatus,
    Conversation, ConversationDirectory, ConversationSubscriptions, DirectoryRepository,
    DirectoryRequest, EventStream, GateRequest, Message, MessagePage, MessageRepository,
    MessageStore, OlderRequest, OpenRequest, Reaction, ReactionChange, ReactionToggle, ReadBatch,
    ReadReceiptTracker, RealtimeStatus, RetryPolicy, SendOutcome, SendRequest,
    SessionChannelError, SessionChannels, SessionCommand, SessionConfig, SessionEvent,
    StoreOutcome, StoreState, SubscriptionScope, clock, lookup_status, normalize_send_outcome,
    normalization::{normalize_fatal_error, normalize_notice},
    realtime::{subscribe_with_backoff, translate},
    toggle_action,
};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Backend ports a session talks to.
#[derive(Clone)]
pub struct SessionServices {
    pub messages: Arc<dyn MessageRepository>,
    pub connections: Arc<dyn ConnectionRepository>,
    pub directory: Arc<dyn DirectoryRepository>,
    pub changes: Arc<dyn ChangeEventSource>,
}

impl SessionServices {
    /// Use one backend value for every port.
    pub fn from_backend<B>(backend: Arc<B>) -> Self
    where
        B: MessageRepository + ConnectionRepository + DirectoryRepository + ChangeEventSource + 'static,
    {
        Self {
            messages: backend.clone(),
            connections: backend.clone(),
            directory: backend.clone(),
            changes: backend,
        }
    }
}

#[derive(Clone, Debug)]
pub struct SessionHandle {
    channels: SessionChannels,
}

impl SessionHandle {
    pub async fn send(&self, command: SessionCommand) -> Result<(), SessionChannelError> {
        self.channels.send_command(command).await
    }

    pub fn subscribe(&self) -> EventStream {
        self.channels.subscribe()
    }
}

/// Start a session actor for `viewer_id` on the current tokio runtime.
pub fn spawn_session(
    viewer_id: impl Into<String>,
    services: SessionServices,
    config: SessionConfig,
) -> SessionHandle {
    let (channels, command_rx) = SessionChannels::new(config.command_buffer, config.event_buffer);
    let runtime = SessionRuntime::new(viewer_id.into(), services, &config, channels.clone(), command_rx);
    tokio::spawn(async move {
        runtime.run().await;
    });

    SessionHandle { channels }
}

/// Result of background work, posted back into the actor.
#[derive(Debug)]
enum Completion {
    Directory {
        request: DirectoryRequest,
        result: Result<Vec<Conversation>, BackendError>,
    },
    Gate {
        request: GateRequest,
        result: Result<ConnectionStatus, BackendError>,
    },
    Open {
        request: OpenRequest,
        result: Result<MessagePage, BackendError>,
    },
    Older {
        request: OlderRequest,
        result: Result<MessagePage, BackendError>,
    },
    Sent {
        request: SendRequest,
        result: Result<Message, BackendError>,
    },
    Read {
        batch: ReadBatch,
        result: Result<(), BackendError>,
    },
    ReactionWritten {
        partner_id: String,
        change: ReactionChange,
        result: Result<(), BackendError>,
    },
    Connected {
        scope: SubscriptionScope,
        generation: u64,
    },
    Reconnecting {
        scope: SubscriptionScope,
        generation: u64,
        retry_in_ms: u64,
    },
    Change {
        scope: SubscriptionScope,
        generation: u64,
        event: ChangeEvent,
    },
    StreamEnded {
        scope: SubscriptionScope,
        generation: u64,
    },
    SubscribeFailed {
        scope: SubscriptionScope,
        generation: u64,
        error: BackendError,
    },
}

struct SessionRuntime {
    viewer_id: String,
    services: SessionServices,
    retry_policy: RetryPolicy,
    channels: SessionChannels,
    command_rx: mpsc::Receiver<SessionCommand>,
    completion_tx: mpsc::UnboundedSender<Completion>,
    completion_rx: mpsc::UnboundedReceiver<Completion>,
    store: MessageStore,
    directory: ConversationDirectory,
    gate: ConnectionGate,
    compose: ComposeController,
    receipts: ReadReceiptTracker,
    conversation_subscriptions: ConversationSubscriptions,
    directory_subscription: CancellationToken,
    directory_generation: u64,
    /// False once the directory subscription gave up retrying.
    directory_subscription_live: bool,
    older_fetch: Option<CancellationToken>,
    last_state: StoreState,
}

impl SessionRuntime {
    fn new(
        viewer_id: String,
        services: SessionServices,
        config: &SessionConfig,
        channels: SessionChannels,
        command_rx: mpsc::Receiver<SessionCommand>,
    ) -> Self {
        let (completion_tx, completion_rx) = mpsc::unbounded_channel();
        Self {
            store: MessageStore::new(viewer_id.clone(), config.page_size),
            directory: ConversationDirectory::new(viewer_id.clone()),
            gate: ConnectionGate::new(viewer_id.clone()),
            compose: ComposeController::new(),
            receipts: ReadReceiptTracker::new(),
            conversation_subscriptions: ConversationSubscriptions::new(),
            directory_subscription: CancellationToken::new(),
            directory_generation: 0,
            directory_subscription_live: false,
            older_fetch: None,
            last_state: StoreState::Empty,
            retry_policy: RetryPolicy::new(
                config.subscribe_base_delay_ms,
                config.subscribe_max_delay_ms,
            )
            .with_max_attempts(config.subscribe_max_attempts),
            viewer_id,
            services,
            channels,
            command_rx,
            completion_tx,
            completion_rx,
        }
    }

    async fn run(mut self) {
        info!(viewer_id = %self.viewer_id, "messaging session started");
        self.ensure_directory_subscription();
        self.refresh_directory();

        loop {
            tokio::select! {
                command = self.command_rx.recv() => match command {
                    Some(SessionCommand::Shutdown) | None => break,
                    Some(command) => {
                        if let Err(err) = self.handle_command(command) {
                            self.channels.emit(normalize_notice(&err));
                        }
                    }
                },
                Some(completion) = self.completion_rx.recv() => {
                    self.handle_completion(completion);
                }
            }
        }

        self.shutdown();
    }

    fn handle_command(&mut self, command: SessionCommand) -> Result<(), BackendError> {
        match command {
            SessionCommand::RefreshDirectory => {
                self.ensure_directory_subscription();
                self.refresh_directory();
                Ok(())
            }
            SessionCommand::OpenConversation { partner_id } => self.handle_open(&partner_id),
            SessionCommand::LoadOlder => {
                self.handle_load_older();
                Ok(())
            }
            SessionCommand::Resync => {
                self.ensure_directory_subscription();
                let partner_id = self.store.partner_id().map(str::to_owned).ok_or_else(|| {
                    BackendError::validation("no_conversation", "no conversation to resync")
                })?;
                self.handle_open(&partner_id)
            }
            SessionCommand::SetDraft { text } => {
                self.compose.set_draft(text);
                self.emit_compose();
                Ok(())
            }
            SessionCommand::SetReplyTarget { message_id } => self.handle_set_reply_target(message_id),
            SessionCommand::Send => self.handle_send(),
            SessionCommand::ToggleReaction { message_id, emoji } => {
                self.handle_toggle_reaction(&message_id, &emoji)
            }
            SessionCommand::MessagesRendered { message_ids } => {
                self.handle_messages_rendered(&message_ids);
                Ok(())
            }
            SessionCommand::Shutdown => Ok(()),
        }
    }

    fn handle_open(&mut self, partner_id: &str) -> Result<(), BackendError> {
        let (request, _superseded) = self.store.begin_open(partner_id)?;
        self.cancel_older_fetch();
        self.compose.reset();
        self.receipts.reset();
        self.emit_compose();
        self.emit_store_state();
        self.emit_timeline();

        // Cancel the previous conversation's feed before subscribing again.
        let (generation, token) = self.conversation_subscriptions.install(&request.partner_id);
        self.spawn_subscription(
            SubscriptionScope::Conversation,
            generation,
            ChangeFilter::for_conversation(self.viewer_id.clone(), request.partner_id.clone()),
            token,
        );

        let gate_request = self.gate.begin_refresh(&request.partner_id)?;
        self.spawn_gate_lookup(gate_request);

        let messages = Arc::clone(&self.services.messages);
        let tx = self.completion_tx.clone();
        tokio::spawn(async move {
            let result = messages
                .fetch_messages(&request.key, None, request.page_size)
                .await;
            let _ = tx.send(Completion::Open { request, result });
        });
        Ok(())
    }

    fn handle_load_older(&mut self) {
        let Some(request) = self.store.begin_load_older() else {
            debug!("load older ignored; no cursor or fetch already in flight");
            return;
        };
        self.emit_store_state();

        let cancel = CancellationToken::new();
        self.older_fetch = Some(cancel.clone());
        let messages = Arc::clone(&self.services.messages);
        let tx = self.completion_tx.clone();
        tokio::spawn(async move {
            let result = tokio::select! {
                _ = cancel.cancelled() => return,
                result = messages.fetch_messages(&request.key, Some(&request.cursor), request.page_size) => result,
            };
            let _ = tx.send(Completion::Older { request, result });
        });
    }

    fn handle_set_reply_target(&mut self, message_id: Option<String>) -> Result<(), BackendError> {
        if let Some(id) = &message_id
            && self.store.message(id).is_none_or(Message::is_pending)
        {
            return Err(BackendError::validation(
                "reply_target_not_found",
                format!("message {id} is not part of this conversation"),
            ));
        }
        self.compose.set_reply_target(message_id);
        self.emit_compose();
        Ok(())
    }

    fn handle_send(&mut self) -> Result<(), BackendError> {
        let request = self.compose.begin_send(&mut self.store, &self.gate)?;
        self.emit_compose();
        self.emit_timeline();

        let messages = Arc::clone(&self.services.messages);
        let tx = self.completion_tx.clone();
        tokio::spawn(async move {
            let result = messages.create_message(request.payload.clone()).await;
            let _ = tx.send(Completion::Sent { request, result });
        });
        Ok(())
    }

    fn handle_toggle_reaction(&mut self, message_id: &str, emoji: &str) -> Result<(), BackendError> {
        let emoji = emoji.trim();
        if emoji.is_empty() {
            return Err(BackendError::validation("empty_emoji", "emoji must not be empty"));
        }
        let partner_id = self.store.partner_id().map(str::to_owned).ok_or_else(|| {
            BackendError::validation("no_conversation", "open a conversation first")
        })?;
        let message = self
            .store
            .message(message_id)
            .filter(|message| !message.is_pending())
            .ok_or_else(|| {
                BackendError::new(
                    BackendErrorCategory::NotFound,
                    "message_not_loaded",
                    format!("message {message_id} is not loaded"),
                )
            })?;

        let change = match toggle_action(&message.reactions, &self.viewer_id, emoji) {
            ReactionToggle::Add => ReactionChange::Added(Reaction {
                message_id: message_id.to_owned(),
                user_id: self.viewer_id.clone(),
                user_name: None,
                emoji: emoji.to_owned(),
                created_at_ms: clock::now_ms(),
            }),
            ReactionToggle::Remove => ReactionChange::Removed {
                message_id: message_id.to_owned(),
                user_id: self.viewer_id.clone(),
                emoji: emoji.to_owned(),
            },
        };

        if self.store.apply_reaction(&change).changed() {
            self.emit_timeline();
        }

        let messages = Arc::clone(&self.services.messages);
        let tx = self.completion_tx.clone();
        let viewer_id = self.viewer_id.clone();
        tokio::spawn(async move {
            let result = match &change {
                ReactionChange::Added(reaction) => {
                    messages
                        .upsert_reaction(&reaction.message_id, &viewer_id, &reaction.emoji)
                        .await
                }
                ReactionChange::Removed {
                    message_id, emoji, ..
                } => messages.remove_reaction(message_id, &viewer_id, emoji).await,
            };
            let _ = tx.send(Completion::ReactionWritten {
                partner_id,
                change,
                result,
            });
        });
        Ok(())
    }

    fn handle_messages_rendered(&mut self, message_ids: &[String]) {
        let Some(batch) = self.receipts.collect_rendered(&self.store, message_ids) else {
            return;
        };

        let messages = Arc::clone(&self.services.messages);
        let tx = self.completion_tx.clone();
        tokio::spawn(async move {
            let result = messages.mark_read(&batch.message_ids).await;
            let _ = tx.send(Completion::Read { batch, result });
        });
    }

    fn handle_completion(&mut self, completion: Completion) {
        match completion {
            Completion::Directory { request, result } => {
                if self.directory.complete_refresh(&request, result) {
                    self.emit_directory();
                }
                if let Some(next) = self.directory.take_queued() {
                    self.spawn_directory_fetch(next);
                }
            }
            Completion::Gate { request, result } => {
                if let Some(connected) = self.gate.complete_refresh(&request, result) {
                    self.channels.emit(SessionEvent::ConnectionResolved {
                        partner_id: request.partner_id,
                        connected,
                    });
                }
            }
            Completion::Open { request, result } => match self.store.complete_open(&request, result) {
                Ok(StoreOutcome::Discarded) => {}
                Ok(_) => {
                    self.emit_store_state();
                    self.emit_timeline();
                }
                Err(err) => {
                    self.emit_store_state();
                    self.emit_timeline();
                    self.channels.emit(normalize_notice(&err));
                }
            },
            Completion::Older { request, result } => {
                if self.store.older_in_flight() == Some(&request) {
                    self.older_fetch = None;
                }
                match self.store.complete_load_older(&request, result) {
                    Ok(StoreOutcome::Discarded) => {}
                    Ok(_) => {
                        self.emit_store_state();
                        self.emit_timeline();
                    }
                    Err(err) => {
                        self.emit_store_state();
                        self.channels.emit(normalize_notice(&err));
                    }
                }
            }
            Completion::Sent { request, result } => {
                let outcome = self.compose.complete_send(&mut self.store, &request, result);
                if let SendOutcome::Failure { error } = &outcome {
                    self.channels.emit(normalize_notice(error));
                }
                self.channels
                    .emit(normalize_send_outcome(request.client_txn_id.clone(), outcome));
                self.emit_compose();
                self.emit_timeline();
            }
            Completion::Read { batch, result } => {
                let flags = self.receipts.complete(&batch, result);
                if flags.is_empty() || self.store.partner_id() != Some(batch.partner_id.as_str()) {
                    return;
                }
                let mut changed = false;
                for flag in &flags {
                    changed |= self.store.apply_read_flag(flag).changed();
                }
                if changed {
                    self.emit_timeline();
                }
                if self.directory.mark_read(&batch.partner_id) {
                    self.emit_directory();
                }
            }
            Completion::ReactionWritten {
                partner_id,
                change,
                result,
            } => {
                let Err(err) = result else {
                    return;
                };
                warn!(
                    message_id = %change.message_id(),
                    code = %err.code,
                    "reaction write failed; reverting local change"
                );
                if self.store.partner_id() == Some(partner_id.as_str()) {
                    let revert = match change {
                        ReactionChange::Added(reaction) => ReactionChange::Removed {
                            message_id: reaction.message_id,
                            user_id: reaction.user_id,
                            emoji: reaction.emoji,
                        },
                        ReactionChange::Removed {
                            message_id,
                            user_id,
                            emoji,
                        } => ReactionChange::Added(Reaction {
                            message_id,
                            user_id,
                            user_name: None,
                            emoji,
                            created_at_ms: clock::now_ms(),
                        }),
                    };
                    if self.store.apply_reaction(&revert).changed() {
                        self.emit_timeline();
                    }
                }
                self.channels.emit(normalize_notice(&err));
            }
            Completion::Connected { scope, generation } => {
                if !self.is_current_subscription(scope, generation) {
                    return;
                }
                self.channels.emit(SessionEvent::RealtimeStatus(RealtimeStatus {
                    scope,
                    connected: true,
                    retry_in_ms: None,
                }));
                // Rows published while disconnected only reach the directory by refetch.
                if scope == SubscriptionScope::Directory {
                    self.refresh_directory();
                }
            }
            Completion::Reconnecting {
                scope,
                generation,
                retry_in_ms,
            } => {
                if self.is_current_subscription(scope, generation) {
                    self.channels.emit(SessionEvent::RealtimeStatus(RealtimeStatus {
                        scope,
                        connected: false,
                        retry_in_ms: Some(retry_in_ms),
                    }));
                }
            }
            Completion::Change {
                scope,
                generation,
                event,
            } => {
                if self.is_current_subscription(scope, generation) {
                    self.handle_change(scope, &event);
                }
            }
            Completion::StreamEnded { scope, generation } => {
                if !self.is_current_subscription(scope, generation) {
                    return;
                }
                warn!(?scope, "push subscription ended; reconnecting");
                self.channels.emit(SessionEvent::RealtimeStatus(RealtimeStatus {
                    scope,
                    connected: false,
                    retry_in_ms: None,
                }));
                if scope == SubscriptionScope::Conversation {
                    self.store.mark_stale();
                    self.emit_store_state();
                }
            }
            Completion::SubscribeFailed {
                scope,
                generation,
                error,
            } => {
                if !self.is_current_subscription(scope, generation) {
                    return;
                }
                match scope {
                    SubscriptionScope::Conversation => {
                        self.store.mark_stale();
                        self.emit_store_state();
                    }
                    SubscriptionScope::Directory => {
                        warn!("directory subscription gave up; waiting for refresh or resync");
                        self.directory_subscription_live = false;
                    }
                }
                self.channels.emit(SessionEvent::RealtimeStatus(RealtimeStatus {
                    scope,
                    connected: false,
                    retry_in_ms: None,
                }));
                self.channels.emit(normalize_fatal_error(error, true));
            }
        }
    }

    fn handle_change(&mut self, scope: SubscriptionScope, event: &ChangeEvent) {
        let action = match translate(scope, event) {
            Ok(action) => action,
            Err(err) => {
                warn!(
                    ?scope,
                    table = ?event.table,
                    code = %err.code,
                    "dropping change event that failed translation"
                );
                return;
            }
        };

        match action {
            BridgeAction::Store(update) => {
                if self.store.apply(update).changed() {
                    self.emit_timeline();
                }
            }
            BridgeAction::DirectoryChanged => self.refresh_directory(),
            BridgeAction::ConnectionChanged(change) => {
                self.refresh_directory();
                if let Some(partner_id) = self.gate.partner_id().map(str::to_owned)
                    && change.involves_pair(&self.viewer_id, &partner_id)
                    && let Ok(request) = self.gate.begin_refresh(&partner_id)
                {
                    self.spawn_gate_lookup(request);
                }
            }
            BridgeAction::Ignore => {}
        }
    }

    fn refresh_directory(&mut self) {
        if let Some(request) = self.directory.begin_refresh() {
            self.spawn_directory_fetch(request);
        }
    }

    fn spawn_directory_fetch(&self, request: DirectoryRequest) {
        let directory = Arc::clone(&self.services.directory);
        let tx = self.completion_tx.clone();
        tokio::spawn(async move {
            let result = directory.list_conversations(&request.user_id).await;
            let _ = tx.send(Completion::Directory { request, result });
        });
    }

    fn spawn_gate_lookup(&self, request: GateRequest) {
        let connections = Arc::clone(&self.services.connections);
        let tx = self.completion_tx.clone();
        tokio::spawn(async move {
            let result = lookup_status(connections.as_ref(), &request).await;
            let _ = tx.send(Completion::Gate { request, result });
        });
    }

    /// Start the directory subscription unless one is already running.
    fn ensure_directory_subscription(&mut self) {
        if self.directory_subscription_live {
            return;
        }
        self.directory_subscription.cancel();
        self.directory_subscription = CancellationToken::new();
        self.directory_generation = self.directory_generation.wrapping_add(1);
        self.directory_subscription_live = true;
        debug!(generation = self.directory_generation, "starting directory subscription");
        self.spawn_subscription(
            SubscriptionScope::Directory,
            self.directory_generation,
            ChangeFilter::for_user(self.viewer_id.clone()),
            self.directory_subscription.clone(),
        );
    }

    /// Keep one push subscription alive for `scope` until `token` is cancelled.
    fn spawn_subscription(
        &self,
        scope: SubscriptionScope,
        generation: u64,
        filter: ChangeFilter,
        token: CancellationToken,
    ) {
        let source = Arc::clone(&self.services.changes);
        let tx = self.completion_tx.clone();
        let policy = self.retry_policy;

        tokio::spawn(async move {
            loop {
                let retry_tx = tx.clone();
                let subscribed = subscribe_with_backoff(
                    source.as_ref(),
                    filter.clone(),
                    policy,
                    &token,
                    |_, delay| {
                        let _ = retry_tx.send(Completion::Reconnecting {
                            scope,
                            generation,
                            retry_in_ms: delay.as_millis() as u64,
                        });
                    },
                )
                .await;

                let mut subscription = match subscribed {
                    Ok(subscription) => subscription,
                    Err(error) => {
                        if !token.is_cancelled() {
                            let _ = tx.send(Completion::SubscribeFailed {
                                scope,
                                generation,
                                error,
                            });
                        }
                        return;
                    }
                };
                let _ = tx.send(Completion::Connected { scope, generation });

                loop {
                    tokio::select! {
                        _ = token.cancelled() => {
                            subscription.handle.cancel();
                            return;
                        }
                        event = subscription.events.recv() => match event {
                            Some(event) => {
                                if tx.send(Completion::Change { scope, generation, event }).is_err() {
                                    return;
                                }
                            }
                            None => break,
                        },
                    }
                }

                if token.is_cancelled() {
                    return;
                }
                let _ = tx.send(Completion::StreamEnded { scope, generation });
            }
        });
    }

    fn is_current_subscription(&self, scope: SubscriptionScope, generation: u64) -> bool {
        match scope {
            SubscriptionScope::Directory => {
                generation == self.directory_generation && !self.directory_subscription.is_cancelled()
            }
            SubscriptionScope::Conversation => self.conversation_subscriptions.is_current(generation),
        }
    }

    fn cancel_older_fetch(&mut self) {
        if let Some(cancel) = self.older_fetch.take() {
            debug!("cancelling in-flight older-page fetch");
            cancel.cancel();
        }
    }

    fn emit_store_state(&mut self) {
        let state = self.store.state();
        if state == self.last_state {
            return;
        }
        self.last_state = state;
        self.channels.emit(SessionEvent::StoreStateChanged {
            partner_id: self.store.partner_id().map(str::to_owned),
            state,
        });
    }

    fn emit_timeline(&self) {
        let Some(partner_id) = self.store.partner_id() else {
            return;
        };
        self.channels.emit(SessionEvent::TimelineUpdated {
            partner_id: partner_id.to_owned(),
            entries: self.store.entries(),
            has_more: self.store.has_more(),
        });
    }

    fn emit_directory(&self) {
        self.channels.emit(SessionEvent::DirectoryUpdated {
            conversations: self.directory.conversations().to_vec(),
            stale: self.directory.is_stale(),
        });
    }

    fn emit_compose(&self) {
        self.channels.emit(SessionEvent::ComposeChanged {
            draft: self.compose.draft().to_owned(),
            reply_to: self.compose.reply_to().map(str::to_owned),
        });
    }

    fn shutdown(&mut self) {
        self.cancel_older_fetch();
        self.conversation_subscriptions.clear();
        self.directory_subscription.cancel();
        if let Some(older) = self.store.close() {
            debug!(partner_id = %older.partner_id, "dropped older-page request on shutdown");
        }
        self.emit_store_state();
        info!(viewer_id = %self.viewer_id, "messaging session stopped");
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use dm_core::{EventStream, TimelineEntry};
    use tokio::time::{sleep, timeout};

    use super::*;
    use crate::memory::InMemoryBackend;

    fn test_config() -> SessionConfig {
        SessionConfig {
            subscribe_base_delay_ms: 5,
            subscribe_max_delay_ms: 20,
            subscribe_max_attempts: 3,
            ..SessionConfig::default()
        }
    }

    fn connected_backend() -> Arc<InMemoryBackend> {
        let backend = Arc::new(InMemoryBackend::new());
        backend
            .set_connection("alice", "bob", ConnectionStatus::Accepted)
            .expect("connection");
        backend
    }

    fn start(backend: &Arc<InMemoryBackend>) -> (SessionHandle, EventStream) {
        let handle = spawn_session(
            "alice",
            SessionServices::from_backend(Arc::clone(backend)),
            test_config(),
        );
        let events = handle.subscribe();
        (handle, events)
    }

    /// Receive events until `pick` returns a value.
    async fn next_matching<T>(
        events: &mut EventStream,
        mut pick: impl FnMut(&SessionEvent) -> Option<T>,
    ) -> T {
        timeout(Duration::from_secs(3), async {
            loop {
                let event = events.recv().await.expect("event receive");
                if let Some(found) = pick(&event) {
                    return found;
                }
            }
        })
        .await
        .expect("event timeout")
    }

    async fn wait_for_subscriptions(backend: &InMemoryBackend, count: usize) {
        timeout(Duration::from_secs(3), async {
            while backend.live_subscription_count() < count {
                sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("subscriptions should come up");
    }

    fn timeline_for<'a>(event: &'a SessionEvent, partner: &str) -> Option<&'a [TimelineEntry]> {
        match event {
            SessionEvent::TimelineUpdated {
                partner_id,
                entries,
                ..
            } if partner_id == partner => Some(entries),
            _ => None,
        }
    }

    async fn open_loaded(
        handle: &SessionHandle,
        events: &mut EventStream,
        partner: &str,
    ) -> bool {
        handle
            .send(SessionCommand::OpenConversation {
                partner_id: partner.to_owned(),
            })
            .await
            .expect("command should enqueue");
        let mut loaded = false;
        let mut connected = None;
        next_matching(events, |event| {
            match event {
                SessionEvent::StoreStateChanged {
                    state: StoreState::Loaded,
                    ..
                } => loaded = true,
                SessionEvent::ConnectionResolved {
                    partner_id,
                    connected: resolved,
                } if partner_id == partner => connected = Some(*resolved),
                _ => {}
            }
            connected.filter(|_| loaded)
        })
        .await
    }

    #[tokio::test]
    async fn send_confirms_optimistic_entry_and_receives_live_messages() {
        let backend = connected_backend();
        backend.deliver("bob", "alice", "hi alice").expect("deliver");
        let (handle, mut events) = start(&backend);

        assert!(open_loaded(&handle, &mut events, "bob").await);
        wait_for_subscriptions(&backend, 2).await;

        handle
            .send(SessionCommand::SetDraft {
                text: "hi bob".to_owned(),
            })
            .await
            .expect("command should enqueue");
        handle
            .send(SessionCommand::Send)
            .await
            .expect("command should enqueue");

        let ack = next_matching(&mut events, |event| match event {
            SessionEvent::SendAck(ack) => Some(ack.clone()),
            _ => None,
        })
        .await;
        let message_id = ack.message_id.expect("server id");
        assert_eq!(ack.error_code, None);

        let entries = next_matching(&mut events, |event| {
            timeline_for(event, "bob")
                .filter(|entries| entries.iter().all(|entry| !entry.message.is_pending()))
                .map(<[TimelineEntry]>::to_vec)
        })
        .await;
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[1].message.id, message_id);
        assert!(entries[1].is_own);

        backend.deliver("bob", "alice", "again").expect("deliver");
        let entries = next_matching(&mut events, |event| {
            timeline_for(event, "bob")
                .filter(|entries| entries.len() == 3)
                .map(<[TimelineEntry]>::to_vec)
        })
        .await;
        assert_eq!(entries[2].message.content, "again");
        assert!(!entries[2].is_own);
    }

    #[tokio::test]
    async fn connection_requested_by_partner_permits_sending() {
        let backend = Arc::new(InMemoryBackend::new());
        backend
            .set_connection("bob", "alice", ConnectionStatus::Accepted)
            .expect("connection");
        let (handle, mut events) = start(&backend);

        assert!(open_loaded(&handle, &mut events, "bob").await);
        handle
            .send(SessionCommand::SetDraft {
                text: "thanks for the invite".to_owned(),
            })
            .await
            .expect("command should enqueue");
        handle
            .send(SessionCommand::Send)
            .await
            .expect("command should enqueue");

        let ack = next_matching(&mut events, |event| match event {
            SessionEvent::SendAck(ack) => Some(ack.clone()),
            _ => None,
        })
        .await;
        assert_eq!(ack.error_code, None);
        assert_eq!(backend.message_count().expect("count"), 1);
    }

    #[tokio::test]
    async fn send_without_accepted_connection_emits_notice() {
        let backend = Arc::new(InMemoryBackend::new());
        backend
            .set_connection("alice", "bob", ConnectionStatus::Pending)
            .expect("connection");
        let (handle, mut events) = start(&backend);

        assert!(!open_loaded(&handle, &mut events, "bob").await);
        handle
            .send(SessionCommand::SetDraft {
                text: "hello?".to_owned(),
            })
            .await
            .expect("command should enqueue");
        handle
            .send(SessionCommand::Send)
            .await
            .expect("command should enqueue");

        let code = next_matching(&mut events, |event| match event {
            SessionEvent::Notice { code, .. } => Some(code.clone()),
            _ => None,
        })
        .await;
        assert_eq!(code, "not_connected");
        assert_eq!(backend.message_count().expect("count"), 0);
    }

    #[tokio::test]
    async fn switching_conversations_discards_the_superseded_page() {
        let backend = connected_backend();
        backend
            .set_connection("alice", "carol", ConnectionStatus::Accepted)
            .expect("connection");
        backend.deliver("bob", "alice", "from bob").expect("deliver");
        backend.deliver("carol", "alice", "from carol").expect("deliver");
        backend.set_fetch_delay(Some(Duration::from_millis(50)));
        let (handle, mut events) = start(&backend);

        for partner in ["bob", "carol"] {
            handle
                .send(SessionCommand::OpenConversation {
                    partner_id: partner.to_owned(),
                })
                .await
                .expect("command should enqueue");
        }

        let mut saw_bob_rows = false;
        let entries = next_matching(&mut events, |event| {
            if timeline_for(event, "bob").is_some_and(|entries| !entries.is_empty()) {
                saw_bob_rows = true;
            }
            timeline_for(event, "carol")
                .filter(|entries| !entries.is_empty())
                .map(<[TimelineEntry]>::to_vec)
        })
        .await;
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].message.content, "from carol");

        // Give the superseded fetch time to land.
        sleep(Duration::from_millis(150)).await;
        while let Ok(event) = events.try_recv() {
            if timeline_for(&event, "bob").is_some_and(|entries| !entries.is_empty()) {
                saw_bob_rows = true;
            }
        }
        assert!(!saw_bob_rows);
    }

    #[tokio::test]
    async fn stream_loss_marks_store_stale_until_resync() {
        let backend = connected_backend();
        let (handle, mut events) = start(&backend);

        assert!(open_loaded(&handle, &mut events, "bob").await);
        wait_for_subscriptions(&backend, 2).await;

        backend.drop_subscriptions();
        next_matching(&mut events, |event| match event {
            SessionEvent::StoreStateChanged {
                state: StoreState::Stale,
                ..
            } => Some(()),
            _ => None,
        })
        .await;

        backend.deliver("bob", "alice", "while away").expect("deliver");
        handle
            .send(SessionCommand::Resync)
            .await
            .expect("command should enqueue");

        let entries = next_matching(&mut events, |event| {
            timeline_for(event, "bob")
                .filter(|entries| !entries.is_empty())
                .map(<[TimelineEntry]>::to_vec)
        })
        .await;
        assert_eq!(entries[0].message.content, "while away");
    }

    #[tokio::test]
    async fn resync_without_conversation_is_a_notice() {
        let backend = connected_backend();
        let (handle, mut events) = start(&backend);

        handle
            .send(SessionCommand::Resync)
            .await
            .expect("command should enqueue");
        let code = next_matching(&mut events, |event| match event {
            SessionEvent::Notice { code, .. } => Some(code.clone()),
            _ => None,
        })
        .await;
        assert_eq!(code, "no_conversation");
    }

    #[tokio::test]
    async fn rendered_inbound_messages_are_marked_read_once() {
        let backend = connected_backend();
        let inbound = backend.deliver("bob", "alice", "unread").expect("deliver");
        let (handle, mut events) = start(&backend);

        assert!(open_loaded(&handle, &mut events, "bob").await);
        handle
            .send(SessionCommand::MessagesRendered {
                message_ids: vec![inbound.id.clone()],
            })
            .await
            .expect("command should enqueue");

        next_matching(&mut events, |event| {
            timeline_for(event, "bob")
                .and_then(|entries| entries.first())
                .filter(|entry| entry.message.is_read)
                .map(|_| ())
        })
        .await;
        next_matching(&mut events, |event| match event {
            SessionEvent::DirectoryUpdated { conversations, .. } => conversations
                .iter()
                .find(|conversation| conversation.partner_id == "bob")
                .filter(|conversation| conversation.last_message_read_by_viewer)
                .map(|_| ()),
            _ => None,
        })
        .await;
    }

    #[tokio::test]
    async fn failed_reaction_write_is_reverted() {
        let backend = connected_backend();
        let target = backend.deliver("bob", "alice", "react to me").expect("deliver");
        let (handle, mut events) = start(&backend);

        assert!(open_loaded(&handle, &mut events, "bob").await);
        backend.fail_next_reaction_write(BackendError::network("reaction_write_failed", "offline"));
        handle
            .send(SessionCommand::ToggleReaction {
                message_id: target.id.clone(),
                emoji: "👍".to_owned(),
            })
            .await
            .expect("command should enqueue");

        let optimistic = next_matching(&mut events, |event| {
            timeline_for(event, "bob")
                .and_then(|entries| entries.first())
                .filter(|entry| !entry.reactions.is_empty())
                .map(|entry| entry.reactions.clone())
        })
        .await;
        assert_eq!(optimistic.len(), 1);
        assert!(optimistic[0].includes("alice"));

        // The reverted timeline is published just before the notice.
        let mut reverted = false;
        let code = next_matching(&mut events, |event| match event {
            SessionEvent::TimelineUpdated { .. } => {
                if let Some(entry) = timeline_for(event, "bob")
                    .and_then(|entries| entries.iter().find(|entry| entry.message.id == target.id))
                {
                    reverted = entry.reactions.is_empty();
                }
                None
            }
            SessionEvent::Notice { code, .. } => Some(code.clone()),
            _ => None,
        })
        .await;
        assert_eq!(code, "reaction_write_failed");
        assert!(reverted, "optimistic reaction should be rolled back");
    }

    #[tokio::test]
    async fn exhausted_subscribe_retries_surface_a_recoverable_fatal_error() {
        let backend = connected_backend();
        backend.fail_next_subscribes(10);
        let (_handle, mut events) = start(&backend);

        let recoverable = next_matching(&mut events, |event| match event {
            SessionEvent::FatalError { recoverable, .. } => Some(*recoverable),
            _ => None,
        })
        .await;
        assert!(recoverable);
    }

    #[tokio::test]
    async fn directory_subscription_restarts_on_refresh_after_giving_up() {
        let backend = connected_backend();
        backend.fail_next_subscribes(3);
        let (handle, mut events) = start(&backend);

        next_matching(&mut events, |event| match event {
            SessionEvent::FatalError { .. } => Some(()),
            _ => None,
        })
        .await;
        assert_eq!(backend.live_subscription_count(), 0);

        handle
            .send(SessionCommand::RefreshDirectory)
            .await
            .expect("command should enqueue");
        next_matching(&mut events, |event| match event {
            SessionEvent::RealtimeStatus(RealtimeStatus {
                scope: SubscriptionScope::Directory,
                connected: true,
                ..
            }) => Some(()),
            _ => None,
        })
        .await;
        wait_for_subscriptions(&backend, 1).await;

        backend.deliver("carol", "alice", "new here").expect("deliver");
        next_matching(&mut events, |event| match event {
            SessionEvent::DirectoryUpdated { conversations, .. } => conversations
                .iter()
                .any(|conversation| conversation.partner_id == "carol")
                .then_some(()),
            _ => None,
        })
        .await;
    }

    #[tokio::test]
    async fn realtime_status_reports_each_subscription_separately() {
        let backend = connected_backend();
        let (handle, mut events) = start(&backend);

        assert!(open_loaded(&handle, &mut events, "bob").await);
        wait_for_subscriptions(&backend, 2).await;

        backend.drop_subscriptions();
        let mut dropped = Vec::new();
        next_matching(&mut events, |event| {
            if let SessionEvent::RealtimeStatus(status) = event
                && !status.connected
                && !dropped.contains(&status.scope)
            {
                dropped.push(status.scope);
            }
            (dropped.len() == 2).then_some(())
        })
        .await;
        assert!(dropped.contains(&SubscriptionScope::Directory));
        assert!(dropped.contains(&SubscriptionScope::Conversation));

        let mut restored = Vec::new();
        next_matching(&mut events, |event| {
            if let SessionEvent::RealtimeStatus(status) = event
                && status.connected
                && !restored.contains(&status.scope)
            {
                restored.push(status.scope);
            }
            (restored.len() == 2).then_some(())
        })
        .await;
    }
}
