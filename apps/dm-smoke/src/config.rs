//! Environment-backed configuration for `dm-smoke`.

use std::env;

use dm_core::SessionConfig;
use thiserror::Error;

const DEFAULT_VIEWER_ID: &str = "alice";
const DEFAULT_PARTNER_ID: &str = "bob";
const DEFAULT_SEED_MESSAGES: usize = 45;
const MAX_PAGE_SIZE: u16 = 100;

/// Scripted session parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct SmokeConfig {
    pub viewer_id: String,
    pub partner_id: String,
    /// Inbound messages seeded into the in-memory backend before the run.
    pub seed_messages: usize,
    /// Tuning forwarded to the session actor.
    pub session: SessionConfig,
}

impl SmokeConfig {
    /// Parse configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    fn from_lookup<F>(mut lookup: F) -> Result<Self, ConfigError>
    where
        F: FnMut(&str) -> Option<String>,
    {
        let viewer_id = optional_trimmed_env("DM_VIEWER_ID", &mut lookup)
            .unwrap_or_else(|| DEFAULT_VIEWER_ID.to_owned());
        let partner_id = optional_trimmed_env("DM_PARTNER_ID", &mut lookup)
            .unwrap_or_else(|| DEFAULT_PARTNER_ID.to_owned());
        if viewer_id == partner_id {
            return Err(ConfigError::InvalidValue {
                key: "DM_PARTNER_ID",
                value: partner_id,
                reason: "must differ from DM_VIEWER_ID".to_owned(),
            });
        }

        let defaults = SessionConfig::default();
        let page_size = parse_or("DM_PAGE_SIZE", defaults.page_size, &mut lookup)?;
        if !(1..=MAX_PAGE_SIZE).contains(&page_size) {
            return Err(ConfigError::InvalidValue {
                key: "DM_PAGE_SIZE",
                value: page_size.to_string(),
                reason: format!("must be between 1 and {MAX_PAGE_SIZE}"),
            });
        }
        let subscribe_base_delay_ms = parse_or(
            "DM_SUBSCRIBE_BASE_DELAY_MS",
            defaults.subscribe_base_delay_ms,
            &mut lookup,
        )?;
        let subscribe_max_delay_ms = parse_or(
            "DM_SUBSCRIBE_MAX_DELAY_MS",
            defaults.subscribe_max_delay_ms,
            &mut lookup,
        )?;
        if subscribe_max_delay_ms < subscribe_base_delay_ms {
            return Err(ConfigError::InvalidValue {
                key: "DM_SUBSCRIBE_MAX_DELAY_MS",
                value: subscribe_max_delay_ms.to_string(),
                reason: "must not be below DM_SUBSCRIBE_BASE_DELAY_MS".to_owned(),
            });
        }
        let subscribe_max_attempts = parse_or(
            "DM_SUBSCRIBE_MAX_ATTEMPTS",
            defaults.subscribe_max_attempts,
            &mut lookup,
        )?;
        if subscribe_max_attempts == 0 {
            return Err(ConfigError::InvalidValue {
                key: "DM_SUBSCRIBE_MAX_ATTEMPTS",
                value: "0".to_owned(),
                reason: "must be at least 1".to_owned(),
            });
        }
        let seed_messages = parse_or("DM_SEED_MESSAGES", DEFAULT_SEED_MESSAGES, &mut lookup)?;

        Ok(Self {
            viewer_id,
            partner_id,
            seed_messages,
            session: SessionConfig {
                page_size,
                subscribe_base_delay_ms,
                subscribe_max_delay_ms,
                subscribe_max_attempts,
                ..defaults
            },
        })
    }
}

/// Errors produced while parsing runtime configuration.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("invalid {key}='{value}': {reason}")]
    InvalidValue {
        key: &'static str,
        value: String,
        reason: String,
    },
}

fn optional_trimmed_env<F>(key: &'static str, lookup: &mut F) -> Option<String>
where
    F: FnMut(&str) -> Option<String>,
{
    lookup(key)
        .map(|value| value.trim().to_owned())
        .filter(|value| !value.is_empty())
}

fn parse_or<T, F>(key: &'static str, default: T, lookup: &mut F) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
    F: FnMut(&str) -> Option<String>,
{
    let Some(value) = optional_trimmed_env(key, lookup) else {
        return Ok(default);
    };
    value.parse::<T>().map_err(|err| ConfigError::InvalidValue {
        key,
        reason: err.to_string(),
        value,
    })
}
