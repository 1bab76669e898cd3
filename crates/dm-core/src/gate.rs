use tracing::{debug, warn};

use crate::{
    error::BackendError,
    ports::ConnectionRepository,
    types::ConnectionStatus,
};

/// Descriptor for an in-flight connection status lookup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GateRequest {
    pub generation: u64,
    pub viewer_id: String,
    pub partner_id: String,
}

/// Resolves whether the viewer may message the selected partner.
///
/// Unknown, pending, or failed lookups all read as "not connected".
#[derive(Debug, Clone)]
pub struct ConnectionGate {
    viewer_id: String,
    partner_id: Option<String>,
    generation: u64,
    connected: bool,
    resolved: bool,
}

impl ConnectionGate {
    pub fn new(viewer_id: impl Into<String>) -> Self {
        Self {
            viewer_id: viewer_id.into(),
            partner_id: None,
            generation: 0,
            connected: false,
            resolved: false,
        }
    }

    pub fn partner_id(&self) -> Option<&str> {
        self.partner_id.as_deref()
    }

    pub fn is_connected(&self) -> bool {
        self.connected
    }

    /// Whether a lookup for the current partner has completed.
    pub fn is_resolved(&self) -> bool {
        self.resolved
    }

    /// Forget the previous partner's status and start a lookup for `partner_id`.
    pub fn begin_refresh(&mut self, partner_id: &str) -> Result<GateRequest, BackendError> {
        let partner_id = partner_id.trim();
        if partner_id.is_empty() || partner_id == self.viewer_id {
            self.reset();
            return Err(BackendError::validation(
                "invalid_partner",
                "partner must be another account",
            ));
        }

        self.generation += 1;
        self.partner_id = Some(partner_id.to_owned());
        self.connected = false;
        self.resolved = false;
        Ok(GateRequest {
            generation: self.generation,
            viewer_id: self.viewer_id.clone(),
            partner_id: partner_id.to_owned(),
        })
    }

    /// Apply a lookup result; returns the new status if the request is current.
    pub fn complete_refresh(
        &mut self,
        request: &GateRequest,
        result: Result<ConnectionStatus, BackendError>,
    ) -> Option<bool> {
        if request.generation != self.generation
            || self.partner_id.as_deref() != Some(request.partner_id.as_str())
        {
            return None;
        }

        self.connected = match result {
            Ok(status) => {
                debug!(
                    partner_id = %request.partner_id,
                    ?status,
                    "connection status resolved"
                );
                status.permits_messaging()
            }
            Err(err) => {
                warn!(
                    partner_id = %request.partner_id,
                    code = %err.code,
                    "connection lookup failed; treating as not connected"
                );
                false
            }
        };
        self.resolved = true;
        Some(self.connected)
    }

    /// Guard for the send path.
    pub fn ensure_connected(&self) -> Result<(), BackendError> {
        match (&self.partner_id, self.connected) {
            (Some(_), true) => Ok(()),
            (Some(partner_id), false) => Err(BackendError::not_connected(partner_id)),
            (None, _) => Err(BackendError::validation(
                "no_conversation",
                "open a conversation before sending",
            )),
        }
    }

    pub fn reset(&mut self) {
        self.generation += 1;
        self.partner_id = None;
        self.connected = false;
        self.resolved = false;
    }

    /// Look up the status for `partner_id` directly against a repository.
    pub async fn refresh(
        &mut self,
        partner_id: &str,
        repo: &dyn ConnectionRepository,
    ) -> Result<bool, BackendError> {
        let request = self.begin_refresh(partner_id)?;
        let result = lookup_status(repo, &request).await;
        Ok(self.complete_refresh(&request, result).unwrap_or(false))
    }
}

/// Resolve the pair's status, asking for `(viewer, partner)` then `(partner, viewer)`.
///
/// Connection rows are keyed by requester and addressee, so an accepted
/// request from the partner only shows up on the reverse lookup. Either
/// lookup failing fails the whole resolution.
pub async fn lookup_status(
    repo: &dyn ConnectionRepository,
    request: &GateRequest,
) -> Result<ConnectionStatus, BackendError> {
    let forward = repo
        .get_connection_status(&request.viewer_id, &request.partner_id)
        .await?;
    if forward.permits_messaging() {
        return Ok(forward);
    }

    let reverse = repo
        .get_connection_status(&request.partner_id, &request.viewer_id)
        .await?;
    if reverse.permits_messaging() || forward == ConnectionStatus::None {
        Ok(reverse)
    } else {
        Ok(forward)
    }
}
