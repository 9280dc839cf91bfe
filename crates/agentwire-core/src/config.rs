//! Client configuration.
//!
//! Configuration is an explicit value handed to the client at construction.
//! Nothing here is global.

use std::{path::Path, time::Duration};

use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::ConfigError;

/// Environment variable overriding [`ClientConfig::base_url`].
pub const ENV_URL: &str = "AGENTWIRE_URL";
/// Environment variable overriding [`ClientConfig::agent_id`].
pub const ENV_AGENT: &str = "AGENTWIRE_AGENT";

/// Exponential backoff policy for reconnection.
///
/// The delay before retry `k` (1-indexed) is `base_delay * multiplier^(k-1)`,
/// optionally capped at `max_delay`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectPolicy {
    /// Retries allowed before the session fails. Zero fails on the first error.
    pub max_attempts: u32,
    /// Delay before the first retry, in milliseconds.
    pub base_delay_ms: u64,
    /// Growth factor between retries.
    pub multiplier: f64,
    /// Upper bound on any single delay, in milliseconds.
    pub max_delay_ms: Option<u64>,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay_ms: 1000,
            multiplier: 2.0,
            max_delay_ms: None,
        }
    }
}

impl ReconnectPolicy {
    /// Create an uncapped policy.
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub const fn new(max_attempts: u32, base_delay: Duration, multiplier: f64) -> Self {
        Self {
            max_attempts,
            base_delay_ms: base_delay.as_millis() as u64,
            multiplier,
            max_delay_ms: None,
        }
    }

    /// Cap every delay at `max_delay`.
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub const fn with_max_delay(mut self, max_delay: Duration) -> Self {
        self.max_delay_ms = Some(max_delay.as_millis() as u64);
        self
    }

    /// Delay before retry `attempt` (1-indexed; 0 is treated as 1).
    #[must_use]
    #[allow(
        clippy::cast_precision_loss,
        clippy::cast_possible_truncation,
        clippy::cast_sign_loss
    )]
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt.saturating_sub(1)).unwrap_or(i32::MAX);
        let millis = self.base_delay_ms as f64 * self.multiplier.powi(exponent);
        let millis = if millis.is_finite() && millis < u64::MAX as f64 {
            millis.round() as u64
        } else {
            u64::MAX
        };
        let millis = self.max_delay_ms.map_or(millis, |cap| millis.min(cap));
        Duration::from_millis(millis)
    }

    /// Check the policy is usable.
    ///
    /// # Errors
    /// Returns [`ConfigError::InvalidPolicy`] for a zero base delay or a
    /// multiplier that is not a finite number >= 1.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.base_delay_ms == 0 {
            return Err(ConfigError::InvalidPolicy("base delay must be positive".into()));
        }
        if !self.multiplier.is_finite() || self.multiplier < 1.0 {
            return Err(ConfigError::InvalidPolicy(format!(
                "multiplier must be a finite number >= 1, got {}",
                self.multiplier
            )));
        }
        Ok(())
    }
}

/// Connection target for one agent.
///
/// The agent id is the last path segment, so a handoff only swaps that
/// segment and never needs a new client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    agent_id: String,
    url: Url,
}

impl Endpoint {
    /// Build the endpoint for `agent_id` under a `ws://` or `wss://` base.
    ///
    /// # Errors
    /// Returns error for an empty agent id or a non-websocket base URL.
    pub fn for_agent(base: &Url, agent_id: &str) -> Result<Self, ConfigError> {
        let agent_id = agent_id.trim();
        if agent_id.is_empty() {
            return Err(ConfigError::EmptyAgentId);
        }
        if base.scheme() != "ws" && base.scheme() != "wss" {
            return Err(ConfigError::InvalidUrl {
                url: base.to_string(),
                reason: "scheme must be ws or wss".into(),
            });
        }

        let mut url = base.clone();
        url.path_segments_mut()
            .map_err(|()| ConfigError::InvalidUrl {
                url: base.to_string(),
                reason: "URL cannot be a base".into(),
            })?
            .pop_if_empty()
            .push(agent_id);

        Ok(Self {
            agent_id: agent_id.to_string(),
            url,
        })
    }

    /// Agent this endpoint is bound to.
    #[must_use]
    pub fn agent_id(&self) -> &str {
        &self.agent_id
    }

    /// Full websocket URL.
    #[must_use]
    pub const fn url(&self) -> &Url {
        &self.url
    }
}

impl std::fmt::Display for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.url.fmt(f)
    }
}

/// Session client configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Websocket base URL; the agent id is appended as a path segment.
    pub base_url: String,
    /// Agent the first session binds to.
    pub agent_id: String,
    /// Reconnection backoff.
    pub reconnect: ReconnectPolicy,
    /// Bound on a single connect attempt, in milliseconds.
    pub connect_timeout_ms: Option<u64>,
    /// Keepalive ping interval while open, in milliseconds.
    pub keepalive_interval_ms: Option<u64>,
    /// Rebind automatically when the backend announces a handoff.
    pub follow_handoffs: bool,
    /// Number of session events kept for late subscribers.
    pub event_history: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            base_url: "ws://localhost:8000/ws".to_string(),
            agent_id: "default".to_string(),
            reconnect: ReconnectPolicy::default(),
            connect_timeout_ms: None,
            keepalive_interval_ms: None,
            follow_handoffs: true,
            event_history: 256,
        }
    }
}

impl ClientConfig {
    /// Config for `agent_id` under `base_url` with default policies.
    pub fn new(base_url: impl Into<String>, agent_id: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            agent_id: agent_id.into(),
            ..Self::default()
        }
    }

    /// Load and validate a JSON config file.
    ///
    /// # Errors
    /// Returns error if the file cannot be read, parsed, or validated.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)?;
        let config = Self::from_json_str(&raw)?;
        tracing::info!(path = %path.display(), "Configuration loaded");
        Ok(config)
    }

    /// Parse and validate a JSON config document.
    ///
    /// # Errors
    /// Returns error if the document cannot be parsed or validated.
    pub fn from_json_str(raw: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Apply `AGENTWIRE_URL` / `AGENTWIRE_AGENT` overrides.
    #[must_use]
    pub fn apply_env(self) -> Self {
        self.apply_overrides(std::env::var(ENV_URL).ok(), std::env::var(ENV_AGENT).ok())
    }

    /// Replace the base URL and/or agent id when present.
    #[must_use]
    pub fn apply_overrides(mut self, base_url: Option<String>, agent_id: Option<String>) -> Self {
        if let Some(url) = base_url.filter(|u| !u.trim().is_empty()) {
            self.base_url = url;
        }
        if let Some(agent) = agent_id.filter(|a| !a.trim().is_empty()) {
            self.agent_id = agent;
        }
        self
    }

    /// Check every field.
    ///
    /// # Errors
    /// Returns the first invalid field.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.reconnect.validate()?;
        self.endpoint_for(&self.agent_id)?;
        Ok(())
    }

    /// Parsed base URL.
    ///
    /// # Errors
    /// Returns [`ConfigError::InvalidUrl`] if `base_url` does not parse.
    pub fn base_url(&self) -> Result<Url, ConfigError> {
        Url::parse(&self.base_url).map_err(|e| ConfigError::InvalidUrl {
            url: self.base_url.clone(),
            reason: e.to_string(),
        })
    }

    /// Endpoint for an arbitrary agent under the configured base.
    ///
    /// # Errors
    /// Returns error for an invalid base URL or empty agent id.
    pub fn endpoint_for(&self, agent_id: &str) -> Result<Endpoint, ConfigError> {
        Endpoint::for_agent(&self.base_url()?, agent_id)
    }

    /// Connect timeout, if configured.
    #[must_use]
    pub fn connect_timeout(&self) -> Option<Duration> {
        self.connect_timeout_ms.map(Duration::from_millis)
    }

    /// Keepalive interval, if configured.
    #[must_use]
    pub fn keepalive_interval(&self) -> Option<Duration> {
        self.keepalive_interval_ms
            .filter(|ms| *ms > 0)
            .map(Duration::from_millis)
    }
}
