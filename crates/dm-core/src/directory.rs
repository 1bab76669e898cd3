use tracing::{debug, warn};

use crate::{error::BackendError, ports::DirectoryRepository, types::Conversation};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirectoryRequest {
    pub generation: u64,
    pub user_id: String,
}

/// Conversation list for the signed-in user, most recent activity first.
///
/// A failed refresh keeps the last good list and flags it stale. Refresh
/// requests that arrive while one is in flight are coalesced into a single
/// follow-up fetch.
#[derive(Debug, Clone)]
pub struct ConversationDirectory {
    user_id: String,
    conversations: Vec<Conversation>,
    stale: bool,
    generation: u64,
    in_flight: bool,
    refresh_queued: bool,
    last_error: Option<BackendError>,
}

impl ConversationDirectory {
    pub fn new(user_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            conversations: Vec::new(),
            stale: false,
            generation: 0,
            in_flight: false,
            refresh_queued: false,
            last_error: None,
        }
    }

    pub fn conversations(&self) -> &[Conversation] {
        &self.conversations
    }

    pub fn get(&self, partner_id: &str) -> Option<&Conversation> {
        self.conversations
            .iter()
            .find(|conversation| conversation.partner_id == partner_id)
    }

    pub fn is_stale(&self) -> bool {
        self.stale
    }

    /// Whether the UI should offer a manual retry.
    pub fn retry_available(&self) -> bool {
        self.stale && !self.in_flight
    }

    pub fn last_error(&self) -> Option<&BackendError> {
        self.last_error.as_ref()
    }

    /// Start a refresh, or queue one behind the fetch already in flight.
    pub fn begin_refresh(&mut self) -> Option<DirectoryRequest> {
        if self.in_flight {
            self.refresh_queued = true;
            return None;
        }
        self.in_flight = true;
        self.refresh_queued = false;
        self.generation += 1;
        Some(DirectoryRequest {
            generation: self.generation,
            user_id: self.user_id.clone(),
        })
    }

    /// Apply a fetch result.
    ///
    /// Returns `true` when the visible list or its stale flag changed. The
    /// caller should check [`Self::take_queued`] afterwards.
    pub fn complete_refresh(
        &mut self,
        request: &DirectoryRequest,
        result: Result<Vec<Conversation>, BackendError>,
    ) -> bool {
        if request.generation != self.generation {
            return false;
        }
        self.in_flight = false;

        match result {
            Ok(mut conversations) => {
                conversations.retain(|conversation| conversation.partner_id != self.user_id);
                sort_by_recency(&mut conversations);
                dedupe_partners(&mut conversations);
                debug!(count = conversations.len(), "conversation directory refreshed");

                let changed = self.stale || conversations != self.conversations;
                self.conversations = conversations;
                self.stale = false;
                self.last_error = None;
                changed
            }
            Err(err) => {
                warn!(
                    code = %err.code,
                    kept = self.conversations.len(),
                    "directory refresh failed; keeping last good list"
                );
                let changed = !self.stale;
                self.stale = true;
                self.last_error = Some(err);
                changed
            }
        }
    }

    /// Start the coalesced follow-up refresh, if one was requested.
    pub fn take_queued(&mut self) -> Option<DirectoryRequest> {
        if self.refresh_queued && !self.in_flight {
            return self.begin_refresh();
        }
        None
    }

    /// Mark the preview for `partner_id` as read locally.
    pub fn mark_read(&mut self, partner_id: &str) -> bool {
        match self
            .conversations
            .iter_mut()
            .find(|conversation| conversation.partner_id == partner_id)
        {
            Some(conversation) if !conversation.last_message_read_by_viewer => {
                conversation.last_message_read_by_viewer = true;
                true
            }
            _ => false,
        }
    }

    /// Fetch directly against a repository, draining coalesced requests.
    pub async fn refresh(&mut self, repo: &dyn DirectoryRepository) -> Result<(), BackendError> {
        let mut next = self.begin_refresh();
        while let Some(request) = next {
            let result = repo.list_conversations(&request.user_id).await;
            self.complete_refresh(&request, result);
            next = self.take_queued();
        }
        match &self.last_error {
            Some(err) if self.stale => Err(err.clone()),
            _ => Ok(()),
        }
    }
}

fn sort_by_recency(conversations: &mut [Conversation]) {
    conversations.sort_by(|a, b| {
        b.last_message_at_ms
            .cmp(&a.last_message_at_ms)
            .then_with(|| a.partner_id.cmp(&b.partner_id))
    });
}

/// Keep the most recent row per partner; input must already be sorted.
fn dedupe_partners(conversations: &mut Vec<Conversation>) {
    let mut seen = std::collections::HashSet::new();
    conversations.retain(|conversation| seen.insert(conversation.partner_id.clone()));
}
