//! Scripted end-to-end run of a messaging session against the in-memory backend.

mod config;
mod logging;

use std::{process::ExitCode, sync::Arc, time::Duration};

use dm_core::{
    BackendError, ConnectionStatus, EventStream, SessionChannelError, SessionCommand,
    SessionEvent, StoreState, TimelineEntry,
};
use dm_runtime::{InMemoryBackend, SessionHandle, SessionServices, spawn_session};
use thiserror::Error;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, error, info, warn};

use crate::config::{ConfigError, SmokeConfig};

const STEP_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
enum SmokeError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Backend(#[from] BackendError),
    #[error(transparent)]
    Channel(#[from] SessionChannelError),
    #[error("timed out waiting for {0}")]
    Timeout(&'static str),
    #[error("event stream closed while waiting for {0}")]
    EventsClosed(&'static str),
    #[error("send {client_txn_id} failed: {code}")]
    SendRejected { client_txn_id: String, code: String },
}

#[tokio::main]
async fn main() -> ExitCode {
    logging::init();

    match run().await {
        Ok(()) => {
            info!("smoke run finished");
            ExitCode::SUCCESS
        }
        Err(err) => {
            error!(error = %err, "smoke run failed");
            ExitCode::FAILURE
        }
    }
}

async fn run() -> Result<(), SmokeError> {
    let config = SmokeConfig::from_env()?;
    let viewer = config.viewer_id.as_str();
    let partner = config.partner_id.as_str();

    let backend = Arc::new(InMemoryBackend::new());
    backend.set_display_name(partner, &capitalize(partner))?;
    backend.set_connection(viewer, partner, ConnectionStatus::Accepted)?;
    for n in 0..config.seed_messages {
        let (from, to) = if n % 3 == 0 { (viewer, partner) } else { (partner, viewer) };
        backend.deliver(from, to, &format!("seed message {n}"))?;
    }
    info!(
        viewer_id = viewer,
        partner_id = partner,
        seeded = config.seed_messages,
        "in-memory backend ready"
    );

    let handle = spawn_session(
        viewer,
        SessionServices::from_backend(Arc::clone(&backend)),
        config.session.clone(),
    );
    let mut events = handle.subscribe();

    command(
        &handle,
        SessionCommand::OpenConversation {
            partner_id: partner.to_owned(),
        },
    )
    .await?;
    // The loaded timeline is published right after the state change; the
    // connection lookup may resolve on either side of it.
    let mut loaded = false;
    let mut status = None;
    let mut first_page = None;
    let (connected, (mut entries, mut has_more)) =
        wait_for(&mut events, "first page", |event| {
            match event {
                SessionEvent::StoreStateChanged {
                    state: StoreState::Loaded,
                    ..
                } => loaded = true,
                SessionEvent::TimelineUpdated {
                    entries, has_more, ..
                } if loaded && first_page.is_none() => {
                    first_page = Some((entries.clone(), *has_more));
                }
                SessionEvent::ConnectionResolved {
                    connected: resolved,
                    ..
                } => status = Some(*resolved),
                _ => {}
            }
            status.zip(first_page.clone())
        })
        .await?;
    info!(connected, loaded = entries.len(), has_more, "conversation opened");

    while has_more {
        command(&handle, SessionCommand::LoadOlder).await?;
        let before = entries.len();
        (entries, has_more) = wait_for(&mut events, "older page", |event| match event {
            SessionEvent::TimelineUpdated {
                entries, has_more, ..
            } if entries.len() > before || !*has_more => Some((entries.clone(), *has_more)),
            _ => None,
        })
        .await?;
        info!(loaded = entries.len(), has_more, "older page merged");
    }

    let unread = unread_inbound(&entries, viewer);
    if !unread.is_empty() {
        info!(count = unread.len(), "marking rendered messages read");
        command(
            &handle,
            SessionCommand::MessagesRendered {
                message_ids: unread,
            },
        )
        .await?;
    }

    let reply_target = entries.last().map(|entry| entry.message.id.clone());
    command(
        &handle,
        SessionCommand::SetReplyTarget {
            message_id: reply_target,
        },
    )
    .await?;
    command(
        &handle,
        SessionCommand::SetDraft {
            text: "hello from the smoke run".to_owned(),
        },
    )
    .await?;
    command(&handle, SessionCommand::Send).await?;
    let ack = wait_for(&mut events, "send ack", |event| match event {
        SessionEvent::SendAck(ack) => Some(ack.clone()),
        _ => None,
    })
    .await?;
    if let Some(code) = ack.error_code {
        return Err(SmokeError::SendRejected {
            client_txn_id: ack.client_txn_id,
            code,
        });
    }
    info!(
        client_txn_id = %ack.client_txn_id,
        message_id = ?ack.message_id,
        "send confirmed"
    );

    let reply = backend.deliver(partner, viewer, "got it")?;
    wait_for(&mut events, "live reply", |event| match event {
        SessionEvent::TimelineUpdated { entries, .. }
            if entries.iter().any(|entry| entry.message.id == reply.id) =>
        {
            Some(())
        }
        _ => None,
    })
    .await?;
    info!(message_id = %reply.id, "live reply received");

    command(
        &handle,
        SessionCommand::ToggleReaction {
            message_id: reply.id.clone(),
            emoji: "👍".to_owned(),
        },
    )
    .await?;
    let reacted = wait_for(&mut events, "reaction", |event| match event {
        SessionEvent::TimelineUpdated { entries, .. } => entries
            .iter()
            .find(|entry| entry.message.id == reply.id && !entry.reactions.is_empty())
            .map(|entry| entry.reactions.len()),
        _ => None,
    })
    .await?;
    info!(groups = reacted, "reaction applied");

    command(&handle, SessionCommand::Shutdown).await?;
    info!(stored = backend.message_count()?, "session shut down");
    Ok(())
}

async fn command(handle: &SessionHandle, command: SessionCommand) -> Result<(), SmokeError> {
    debug!(?command, "sending command");
    handle.send(command).await?;
    Ok(())
}

/// Drain events until `pick` matches, logging everything observed on the way.
async fn wait_for<T>(
    events: &mut EventStream,
    step: &'static str,
    mut pick: impl FnMut(&SessionEvent) -> Option<T>,
) -> Result<T, SmokeError> {
    let waited = tokio::time::timeout(STEP_TIMEOUT, async {
        loop {
            match events.recv().await {
                Ok(event) => {
                    log_event(&event);
                    if let Some(found) = pick(&event) {
                        return Ok(found);
                    }
                }
                Err(RecvError::Lagged(skipped)) => {
                    warn!(skipped, "event stream lagged");
                }
                Err(RecvError::Closed) => return Err(SmokeError::EventsClosed(step)),
            }
        }
    })
    .await;

    waited.unwrap_or(Err(SmokeError::Timeout(step)))
}

fn log_event(event: &SessionEvent) {
    match event {
        SessionEvent::StoreStateChanged { partner_id, state } => {
            debug!(partner_id = ?partner_id, ?state, "store state changed");
            if *state == StoreState::Stale {
                warn!("conversation is stale; a resync is required");
            }
        }
        SessionEvent::DirectoryUpdated {
            conversations,
            stale,
        } => debug!(count = conversations.len(), stale, "directory updated"),
        SessionEvent::TimelineUpdated {
            entries, has_more, ..
        } => debug!(count = entries.len(), has_more, "timeline updated"),
        SessionEvent::Notice { code, message } => warn!(%code, %message, "notice"),
        SessionEvent::FatalError {
            code,
            message,
            recoverable,
        } => error!(%code, %message, recoverable, "session error"),
        other => debug!(event = ?other, "session event"),
    }
}

fn unread_inbound(entries: &[TimelineEntry], viewer_id: &str) -> Vec<String> {
    entries
        .iter()
        .filter(|entry| entry.message.sender_id != viewer_id && !entry.message.is_read)
        .map(|entry| entry.message.id.clone())
        .collect()
}

fn capitalize(value: &str) -> String {
    let mut chars = value.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}
