//! Wall-clock helpers for optimistic timestamps.

/// Current Unix time in milliseconds.
pub fn now_ms() -> u64 {
    u64::try_from(chrono::Utc::now().timestamp_millis()).unwrap_or_default()
}

/// Timestamp for a new optimistic entry: now, but never before `floor`.
///
/// Keeps a local send from sorting above the newest loaded message when the
/// device clock lags the server.
pub fn optimistic_timestamp_ms(floor: Option<u64>) -> u64 {
    let now = now_ms();
    match floor {
        Some(floor) if floor >= now => floor.saturating_add(1),
        _ => now,
    }
}
