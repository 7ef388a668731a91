//! Ambient server configuration: YAML file + environment overlay, profile
//! selection via `RELAY_PROFILE`, `.env` loading via `dotenvy`.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::Failure;

fn default_bind_addr() -> String {
    "0.0.0.0:8080".to_string()
}

fn default_publish_timeout_ms() -> u64 {
    10_000
}

fn default_trace_header() -> String {
    "X-Request-ID".to_string()
}

fn default_metadata_header() -> String {
    "X-RPC-Metadata".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventConfig {
    #[serde(default = "default_publish_timeout_ms")]
    pub publish_timeout_ms: u64,
}

impl Default for EventConfig {
    fn default() -> Self {
        Self {
            publish_timeout_ms: default_publish_timeout_ms(),
        }
    }
}

impl EventConfig {
    pub fn publish_timeout(&self) -> Duration {
        Duration::from_millis(self.publish_timeout_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpConfig {
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,
    #[serde(default = "default_trace_header")]
    pub trace_header: String,
    #[serde(default = "default_metadata_header")]
    pub metadata_header: String,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_addr(),
            trace_header: default_trace_header(),
            metadata_header: default_metadata_header(),
        }
    }
}

/// Process-wide configuration, analogous to the teacher's layered
/// `R2eConfig`: defaults, overlaid by a YAML file (selected by
/// `RELAY_PROFILE`, defaulting to `default`), overlaid by `RELAY_*`
/// environment variables, with `.env` loaded first via `dotenvy`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RelayConfig {
    #[serde(default)]
    pub http: HttpConfig,
    #[serde(default)]
    pub event: EventConfig,
}

impl RelayConfig {
    /// Load `.env` (if present), then `config/{profile}.yaml` (if
    /// present; missing file is not an error), then apply `RELAY_*`
    /// environment overrides.
    pub fn load() -> Result<Self, Failure> {
        let _ = dotenvy::dotenv();
        let profile = std::env::var("RELAY_PROFILE").unwrap_or_else(|_| "default".to_string());
        let path = format!("config/{profile}.yaml");

        let mut config = match std::fs::read_to_string(&path) {
            Ok(contents) => serde_yaml::from_str(&contents)
                .map_err(|err| Failure::internal(format!("invalid config at {path}: {err}")))?,
            Err(_) => RelayConfig::default(),
        };

        config.apply_env_overrides();
        Ok(config)
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("RELAY_HTTP_BIND_ADDR") {
            self.http.bind_addr = v;
        }
        if let Ok(v) = std::env::var("RELAY_HTTP_TRACE_HEADER") {
            self.http.trace_header = v;
        }
        if let Ok(v) = std::env::var("RELAY_HTTP_METADATA_HEADER") {
            self.http.metadata_header = v;
        }
        if let Ok(v) = std::env::var("RELAY_EVENT_PUBLISH_TIMEOUT_MS") {
            if let Ok(ms) = v.parse() {
                self.event.publish_timeout_ms = ms;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let config = RelayConfig::default();
        assert_eq!(config.http.bind_addr, "0.0.0.0:8080");
        assert_eq!(config.event.publish_timeout(), Duration::from_secs(10));
    }

    #[test]
    fn env_override_wins_over_default() {
        std::env::set_var("RELAY_EVENT_PUBLISH_TIMEOUT_MS", "2500");
        let mut config = RelayConfig::default();
        config.apply_env_overrides();
        assert_eq!(config.event.publish_timeout_ms, 2500);
        std::env::remove_var("RELAY_EVENT_PUBLISH_TIMEOUT_MS");
    }
}
