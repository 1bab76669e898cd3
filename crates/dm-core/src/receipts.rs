use std::collections::HashSet;

use tracing::{debug, warn};

use crate::{
    error::BackendError,
    ports::MessageRepository,
    store::MessageStore,
    types::{Message, ReadFlag},
};

/// One batched mark-read call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadBatch {
    pub partner_id: String,
    pub message_ids: Vec<String>,
}

/// Tracks which inbound messages have a mark-read call in flight.
#[derive(Debug, Default, Clone)]
pub struct ReadReceiptTracker {
    in_flight: HashSet<String>,
}

impl ReadReceiptTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }

    /// Select unread inbound messages from the rendered window and claim them.
    ///
    /// Returns `None` when nothing needs marking.
    pub fn collect<'a>(
        &mut self,
        viewer_id: &str,
        partner_id: &str,
        rendered: impl IntoIterator<Item = &'a Message>,
    ) -> Option<ReadBatch> {
        let message_ids: Vec<String> = rendered
            .into_iter()
            .filter(|message| {
                message.sender_id == partner_id
                    && message.sender_id != viewer_id
                    && !message.is_read
                    && !message.is_pending()
                    && !self.in_flight.contains(&message.id)
            })
            .map(|message| message.id.clone())
            .collect();

        if message_ids.is_empty() {
            return None;
        }
        self.in_flight.extend(message_ids.iter().cloned());
        Some(ReadBatch {
            partner_id: partner_id.to_owned(),
            message_ids,
        })
    }

    /// Collect from the rendered ids that are loaded in `store`.
    pub fn collect_rendered(
        &mut self,
        store: &MessageStore,
        rendered_ids: &[String],
    ) -> Option<ReadBatch> {
        let partner_id = store.partner_id()?.to_owned();
        let rendered: Vec<&Message> = rendered_ids
            .iter()
            .filter_map(|id| store.message(id))
            .collect();
        self.collect(store.viewer_id(), &partner_id, rendered)
    }

    /// Settle a batch; on success the read flags to apply are returned.
    pub fn complete(
        &mut self,
        batch: &ReadBatch,
        result: Result<(), BackendError>,
    ) -> Vec<ReadFlag> {
        for id in &batch.message_ids {
            self.in_flight.remove(id);
        }

        match result {
            Ok(()) => {
                debug!(
                    partner_id = %batch.partner_id,
                    count = batch.message_ids.len(),
                    "marked messages as read"
                );
                batch
                    .message_ids
                    .iter()
                    .map(|id| ReadFlag {
                        message_id: id.clone(),
                        is_read: true,
                    })
                    .collect()
            }
            Err(err) => {
                warn!(
                    partner_id = %batch.partner_id,
                    count = batch.message_ids.len(),
                    code = %err.code,
                    "mark-read failed; will retry on next render"
                );
                Vec::new()
            }
        }
    }

    /// Forget all claims, e.g. when the conversation changes.
    pub fn reset(&mut self) {
        self.in_flight.clear();
    }

    /// Mark the rendered window read against a repository and update `store`.
    pub async fn mark_rendered(
        &mut self,
        store: &mut MessageStore,
        rendered_ids: &[String],
        repo: &dyn MessageRepository,
    ) -> Result<usize, BackendError> {
        let Some(batch) = self.collect_rendered(store, rendered_ids) else {
            return Ok(0);
        };
        let result = repo.mark_read(&batch.message_ids).await;
        let failure = result.as_ref().err().cloned();
        let flags = self.complete(&batch, result);
        if let Some(err) = failure {
            return Err(err);
        }
        for flag in &flags {
            store.apply_read_flag(flag);
        }
        Ok(flags.len())
    }
}
