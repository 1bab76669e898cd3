use std::cmp::Ordering;

use crate::types::Message;

/// Result of applying one mutation to the timeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimelineChange {
    Inserted,
    Replaced,
    Updated,
    Removed,
    Unchanged,
}

impl TimelineChange {
    pub fn is_change(self) -> bool {
        self != Self::Unchanged
    }
}

/// Loaded message window, kept strictly ordered by `(created_at_ms, id)`.
#[derive(Debug, Clone, Default)]
pub struct MessageTimeline {
    items: Vec<Message>,
}

impl MessageTimeline {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current messages in display order (oldest first).
    pub fn items(&self) -> &[Message] {
        &self.items
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn clear(&mut self) {
        self.items.clear();
    }

    pub fn oldest(&self) -> Option<&Message> {
        self.items.first()
    }

    pub fn get(&self, id: &str) -> Option<&Message> {
        self.position(id).map(|idx| &self.items[idx])
    }

    pub fn position(&self, id: &str) -> Option<usize> {
        self.items.iter().position(|item| item.id == id)
    }

    /// Index of the pending optimistic entry carrying `client_txn_id`.
    pub fn pending_position(&self, client_txn_id: &str) -> Option<usize> {
        self.items.iter().position(|item| {
            item.is_pending() && item.client_txn_id.as_deref() == Some(client_txn_id)
        })
    }

    /// Insert or reconcile a message.
    ///
    /// Matches an existing entry by id first, then a pending entry by
    /// correlation id. A match is replaced in place; anything else is inserted
    /// at its sorted position.
    pub fn upsert(&mut self, message: Message) -> TimelineChange {
        let by_id = self.position(&message.id);
        let by_txn = message
            .client_txn_id
            .as_deref()
            .and_then(|txn| self.pending_position(txn));

        match (by_id, by_txn) {
            (Some(id_idx), Some(txn_idx)) if id_idx != txn_idx => {
                // Echo was inserted before the placeholder was reconciled.
                self.items.remove(txn_idx);
                let id_idx = if txn_idx < id_idx { id_idx - 1 } else { id_idx };
                self.replace_at(id_idx, message);
                TimelineChange::Replaced
            }
            (Some(idx), _) | (None, Some(idx)) => {
                self.replace_at(idx, message);
                TimelineChange::Replaced
            }
            (None, None) => {
                self.insert_sorted(message);
                TimelineChange::Inserted
            }
        }
    }

    /// Mutate one message without touching its sort key.
    pub fn update_in_place<F>(&mut self, id: &str, mutate: F) -> TimelineChange
    where
        F: FnOnce(&mut Message) -> bool,
    {
        let Some(idx) = self.position(id) else {
            return TimelineChange::Unchanged;
        };
        if mutate(&mut self.items[idx]) {
            TimelineChange::Updated
        } else {
            TimelineChange::Unchanged
        }
    }

    pub fn remove(&mut self, id: &str) -> Option<Message> {
        let idx = self.position(id)?;
        Some(self.items.remove(idx))
    }

    pub fn remove_pending(&mut self, client_txn_id: &str) -> Option<Message> {
        let idx = self.pending_position(client_txn_id)?;
        Some(self.items.remove(idx))
    }

    /// Clamp a requested page size against safety and server caps.
    ///
    /// The result is always in `1..=100`.
    pub fn bounded_paginate_limit(requested: u16, server_cap: u16) -> u16 {
        let safe_requested = requested.max(1);
        let safe_cap = server_cap.max(1);
        safe_requested.min(safe_cap).min(100)
    }

    fn insert_sorted(&mut self, message: Message) {
        let idx = self
            .items
            .partition_point(|item| item.display_cmp(&message) == Ordering::Less);
        self.items.insert(idx, message);
    }

    fn replace_at(&mut self, idx: usize, incoming: Message) {
        let merged = merge_replacement(&self.items[idx], incoming);
        self.items[idx] = merged;

        if !self.in_order_at(idx) {
            let moved = self.items.remove(idx);
            self.insert_sorted(moved);
        }
    }

    fn in_order_at(&self, idx: usize) -> bool {
        let current = &self.items[idx];
        let after_prev = idx == 0 || self.items[idx - 1].display_cmp(current) == Ordering::Less;
        let before_next = self
            .items
            .get(idx + 1)
            .is_none_or(|next| current.display_cmp(next) == Ordering::Less);
        after_prev && before_next
    }
}

/// Server copies carry no reactions and may omit the reply join; keep what we have.
fn merge_replacement(existing: &Message, mut incoming: Message) -> Message {
    if incoming.reactions.is_empty() {
        incoming.reactions = existing.reactions.clone();
    }

    match (&incoming.reply_to, &existing.reply_to) {
        (None, Some(_)) => incoming.reply_to = existing.reply_to.clone(),
        (Some(new_reply), Some(old_reply))
            if new_reply.id == old_reply.id && !new_reply.has_preview() =>
        {
            incoming.reply_to = existing.reply_to.clone();
        }
        _ => {}
    }

    if incoming.client_txn_id.is_none() {
        incoming.client_txn_id = existing.client_txn_id.clone();
    }

    incoming
}
