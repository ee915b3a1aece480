use anyhow::{bail, Context, Result};
use std::env;
use std::time::Duration;

use crate::pbx::RetryPolicy;

pub const DEFAULT_POLL_INTERVAL_SECS: u64 = 30;
pub const DEFAULT_FETCH_DEADLINE_SECS: u64 = 300;
pub const DEFAULT_HTTP_TIMEOUT_SECS: u64 = 15;
pub const DEFAULT_DISCORD_API_BASE: &str = "https://discord.com/api/v10";

#[derive(Debug, Clone)]
pub struct Config {
    // MikoPBX REST API
    pub pbx_base_url: String,
    /// Empty login or password means the PBX accepts anonymous API calls
    pub pbx_login: String,
    pub pbx_password: String,

    // Discord notification sink (optional only for dry runs)
    pub discord_token: Option<String>,
    pub discord_channel_id: Option<String>,
    pub discord_api_base: String,

    // Polling
    pub poll_interval_secs: u64,
    // Overall retry budget per fetch; 0 retries forever
    pub fetch_deadline_secs: u64,
    pub http_timeout_secs: u64,

    // Health check HTTP server port (optional, disabled if not set)
    // When set, exposes /health, /ready, and /metrics endpoints
    pub health_port: Option<u16>,

    // Verbose HTTP logging for the PBX client
    pub debug: bool,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok(); // Load .env if present, ignore if missing
        Self::from_getter(|key| env::var(key).ok())
    }

    /// Parse config from a custom getter function (for testing)
    pub fn from_getter<F>(get: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let pbx_base_url = get("MIKOPBX_BASE_URL")
            .filter(|s| !s.trim().is_empty())
            .context("MIKOPBX_BASE_URL not set")?;

        Ok(Config {
            pbx_base_url: pbx_base_url.trim().trim_end_matches('/').to_string(),
            pbx_login: get("MIKOPBX_LOGIN").unwrap_or_default(),
            pbx_password: get("MIKOPBX_PASSWORD").unwrap_or_default(),

            discord_token: get("DISCORD_TOKEN").filter(|s| !s.is_empty()),
            discord_channel_id: get("DISCORD_CHANNEL_ID").filter(|s| !s.is_empty()),
            discord_api_base: get("DISCORD_API_BASE")
                .filter(|s| !s.is_empty())
                .unwrap_or_else(|| DEFAULT_DISCORD_API_BASE.to_string())
                .trim_end_matches('/')
                .to_string(),

            poll_interval_secs: get("POLL_INTERVAL_SEC")
                .and_then(|s| s.trim().parse().ok())
                .unwrap_or(DEFAULT_POLL_INTERVAL_SECS),
            fetch_deadline_secs: get("FETCH_DEADLINE_SEC")
                .and_then(|s| s.trim().parse().ok())
                .unwrap_or(DEFAULT_FETCH_DEADLINE_SECS),
            http_timeout_secs: get("HTTP_TIMEOUT_SEC")
                .and_then(|s| s.trim().parse().ok())
                .unwrap_or(DEFAULT_HTTP_TIMEOUT_SECS),

            health_port: get("HEALTH_PORT").and_then(|s| s.parse().ok()),

            debug: get("PBX_DEBUG").map(|s| parse_flag(&s)).unwrap_or(false),
        })
    }

    /// Create config from a HashMap (convenience for testing)
    #[cfg(test)]
    pub fn from_map(map: &std::collections::HashMap<&str, &str>) -> Result<Self> {
        Self::from_getter(|key| map.get(key).map(|v| v.to_string()))
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn fetch_deadline(&self) -> Option<Duration> {
        match self.fetch_deadline_secs {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        }
    }

    pub fn http_timeout(&self) -> Duration {
        Duration::from_secs(self.http_timeout_secs)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            deadline: self.fetch_deadline(),
            ..RetryPolicy::default()
        }
    }

    /// Discord credentials, required unless running dry.
    pub fn discord(&self) -> Result<(&str, &str)> {
        let token = self.discord_token.as_deref().context("DISCORD_TOKEN not set")?;
        let channel = self
            .discord_channel_id
            .as_deref()
            .context("DISCORD_CHANNEL_ID not set")?;
        Ok((token, channel))
    }

    /// Validate configuration values at startup.
    /// Returns Ok(()) if all validations pass, or Err with details of what failed.
    pub fn validate(&self, dry_run: bool) -> Result<()> {
        let mut errors: Vec<String> = Vec::new();

        if !(self.pbx_base_url.starts_with("http://") || self.pbx_base_url.starts_with("https://")) {
            errors.push(format!(
                "MIKOPBX_BASE_URL '{}' must start with http:// or https://.",
                self.pbx_base_url
            ));
        }

        if self.pbx_login.is_empty() != self.pbx_password.is_empty() {
            errors.push("MIKOPBX_LOGIN and MIKOPBX_PASSWORD must be set together.".to_string());
        }

        if !dry_run {
            if self.discord_token.is_none() {
                errors.push("DISCORD_TOKEN must be set.".to_string());
            }
            match self.discord_channel_id.as_deref() {
                None => errors.push("DISCORD_CHANNEL_ID must be set.".to_string()),
                Some(id) if !id.chars().all(|c| c.is_ascii_digit()) => errors.push(format!(
                    "DISCORD_CHANNEL_ID '{}' invalid. Expected a numeric snowflake.",
                    id
                )),
                Some(_) => {}
            }
        }

        if self.poll_interval_secs == 0 {
            errors.push("POLL_INTERVAL_SEC must be greater than 0.".to_string());
        }

        if self.http_timeout_secs == 0 {
            errors.push("HTTP_TIMEOUT_SEC must be greater than 0.".to_string());
        }

        if let Some(deadline) = self.fetch_deadline() {
            if deadline < self.http_timeout() {
                errors.push(format!(
                    "FETCH_DEADLINE_SEC={} is shorter than HTTP_TIMEOUT_SEC={}.",
                    self.fetch_deadline_secs, self.http_timeout_secs
                ));
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            bail!(
                "Configuration validation failed:\n  - {}",
                errors.join("\n  - ")
            )
        }
    }
}

fn parse_flag(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}
