use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::StoreState;

/// Broad error category used for user-facing handling and retry behavior.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum BackendErrorCategory {
    /// Input rejected before any network call (empty message, self-conversation).
    Validation,
    /// Caller is not permitted to perform the action (not connected).
    Authorization,
    /// Duplicate or conflicting write; resolved locally by id dedup.
    Conflict,
    /// Transient network or transport failure.
    Network,
    /// Rate-limited by the backend.
    RateLimited,
    /// Referenced row does not exist.
    NotFound,
    /// A remote row could not be translated into a typed value.
    Translation,
    /// Internal bug or invariant break.
    Internal,
}

/// Stable error payload emitted across the command/event boundary.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Error)]
#[error("{category:?}:{code}: {message}")]
pub struct BackendError {
    /// High-level error category.
    pub category: BackendErrorCategory,
    /// Stable machine-readable error code.
    pub code: String,
    /// Human-readable message.
    pub message: String,
    /// Optional retry hint in milliseconds.
    pub retry_after_ms: Option<u64>,
}

impl BackendError {
    /// Construct a new error.
    pub fn new(
        category: BackendErrorCategory,
        code: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            category,
            code: code.into(),
            message: message.into(),
            retry_after_ms: None,
        }
    }

    /// Attach a retry hint to the error.
    pub fn with_retry_after(mut self, retry_after: Duration) -> Self {
        self.retry_after_ms = Some(retry_after.as_millis() as u64);
        self
    }

    pub fn validation(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(BackendErrorCategory::Validation, code, message)
    }

    pub fn network(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(BackendErrorCategory::Network, code, message)
    }

    pub fn translation(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(BackendErrorCategory::Translation, code, message)
    }

    /// The partner is not an accepted connection of the viewer.
    pub fn not_connected(partner_id: &str) -> Self {
        Self::new(
            BackendErrorCategory::Authorization,
            "not_connected",
            format!("messaging '{partner_id}' requires an accepted connection"),
        )
    }

    /// Build a standard invalid-state-transition error.
    pub fn invalid_state(current: StoreState, action: impl Into<String>) -> Self {
        let action = action.into();
        Self::new(
            BackendErrorCategory::Internal,
            "invalid_state_transition",
            format!("cannot run '{action}' while message store is in state {current:?}"),
        )
    }

    /// Whether retrying the same call may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(
            self.category,
            BackendErrorCategory::Network | BackendErrorCategory::RateLimited
        )
    }
}

/// Map HTTP status codes returned by the managed backend to error categories.
pub fn classify_http_status(status: u16) -> BackendErrorCategory {
    match status {
        401 | 403 => BackendErrorCategory::Authorization,
        404 => BackendErrorCategory::NotFound,
        409 => BackendErrorCategory::Conflict,
        408 | 429 => BackendErrorCategory::RateLimited,
        400..=499 => BackendErrorCategory::Validation,
        500..=599 => BackendErrorCategory::Network,
        _ => BackendErrorCategory::Internal,
    }
}
