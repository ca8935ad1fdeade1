//! Broker configuration.
//!
//! A TOML file with a `[WebService]` table for broker-wide knobs and one
//! table per authentication scheme (`[basic]`, `[negotiate]`, ...) naming
//! the helper command, the dispatch action, and the conversation timeouts.
//! Timeouts arrive as strings and are clamped into `[1, 900]` seconds;
//! anything unparseable falls back to the per-call default with a warning.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;
use tracing::warn;

pub const MIN_AUTH_TIMEOUT: u64 = 1;
pub const MAX_AUTH_TIMEOUT: u64 = 900;

/// The amount of time a spawned helper has to complete authentication.
pub const DEFAULT_AUTH_TIMEOUT: u64 = 30;
/// The longest gap allowed between helper messages.
pub const DEFAULT_RESPONSE_TIMEOUT: u64 = 60;

/// Timeout of an authenticated session with no connections.
pub const DEFAULT_SERVICE_IDLE: u64 = 15;
/// Timeout of everything when no one is connected.
pub const DEFAULT_PROCESS_IDLE: u64 = 90;

pub const DEFAULT_SESSION_COMMAND: &str = "/usr/libexec/enirejo-session";
pub const DEFAULT_BRIDGE_COMMAND: &str = "enirejo-bridge";
pub const DEFAULT_SSH_HOST: &str = "127.0.0.1";
pub const DEFAULT_SSH_PORT: u16 = 22;

pub const ACTION_SPAWN_HEADER: &str = "spawn-login-with-header";
pub const ACTION_SPAWN_DECODE: &str = "spawn-login-with-decoded";
pub const ACTION_SSH: &str = "remote-login-ssh";
pub const ACTION_NONE: &str = "none";

#[derive(Debug, Default, Deserialize)]
pub struct Config {
    #[serde(rename = "WebService", default)]
    pub web_service: WebServiceConfig,
    #[serde(flatten)]
    schemes: HashMap<String, SchemeConfig>,
}

#[derive(Debug, Deserialize)]
pub struct WebServiceConfig {
    #[serde(rename = "MaxStartups")]
    pub max_startups: Option<String>,
    #[serde(rename = "ServiceIdle", default = "default_service_idle")]
    pub service_idle: u64,
    #[serde(rename = "ProcessIdle", default = "default_process_idle")]
    pub process_idle: u64,
    #[serde(rename = "LoginLoopback", default)]
    pub login_loopback: bool,
}

impl Default for WebServiceConfig {
    fn default() -> Self {
        Self {
            max_startups: None,
            service_idle: default_service_idle(),
            process_idle: default_process_idle(),
            login_loopback: false,
        }
    }
}

const fn default_service_idle() -> u64 {
    DEFAULT_SERVICE_IDLE
}

const fn default_process_idle() -> u64 {
    DEFAULT_PROCESS_IDLE
}

#[derive(Clone, Debug, Default, Deserialize)]
pub struct SchemeConfig {
    pub action: Option<String>,
    pub command: Option<String>,
    pub timeout: Option<String>,
    #[serde(rename = "response-timeout")]
    pub response_timeout: Option<String>,
    pub host: Option<String>,
    pub port: Option<u16>,
}

impl Config {
    /// # Errors
    /// Returns an error if the file cannot be read or is not valid TOML.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        Self::parse(&raw).with_context(|| format!("failed to parse {}", path.display()))
    }

    /// # Errors
    /// Returns an error if the text is not valid TOML.
    pub fn parse(raw: &str) -> Result<Self> {
        toml::from_str(raw).context("invalid configuration")
    }

    #[must_use]
    pub fn scheme(&self, scheme: &str) -> Option<&SchemeConfig> {
        self.schemes.get(scheme)
    }

    /// The dispatch action configured for a scheme, if any.
    #[must_use]
    pub fn action(&self, scheme: &str) -> Option<&str> {
        self.scheme(scheme).and_then(|s| s.action.as_deref())
    }

    /// The helper command for a scheme, or the compiled-in default.
    #[must_use]
    pub fn command(&self, scheme: &str) -> &str {
        self.scheme(scheme)
            .and_then(|s| s.command.as_deref())
            .unwrap_or(DEFAULT_SESSION_COMMAND)
    }

    /// Wall-clock conversation timeout for a scheme, in seconds.
    #[must_use]
    pub fn auth_timeout(&self, scheme: &str) -> u64 {
        clamp_timeout(
            scheme,
            self.scheme(scheme).and_then(|s| s.timeout.as_deref()),
            DEFAULT_AUTH_TIMEOUT,
        )
    }

    /// Inter-message timeout for a scheme, in seconds.
    #[must_use]
    pub fn response_timeout(&self, scheme: &str) -> u64 {
        clamp_timeout(
            scheme,
            self.scheme(scheme).and_then(|s| s.response_timeout.as_deref()),
            DEFAULT_RESPONSE_TIMEOUT,
        )
    }

    #[must_use]
    pub fn ssh_host(&self) -> &str {
        self.scheme(ACTION_SSH)
            .and_then(|s| s.host.as_deref())
            .unwrap_or(DEFAULT_SSH_HOST)
    }

    #[must_use]
    pub fn ssh_port(&self) -> u16 {
        self.scheme(ACTION_SSH)
            .and_then(|s| s.port)
            .unwrap_or(DEFAULT_SSH_PORT)
    }

    #[must_use]
    pub fn ssh_command(&self) -> &str {
        self.scheme(ACTION_SSH)
            .and_then(|s| s.command.as_deref())
            .unwrap_or(DEFAULT_BRIDGE_COMMAND)
    }
}

fn clamp_timeout(scheme: &str, configured: Option<&str>, default: u64) -> u64 {
    let Some(configured) = configured else {
        return default;
    };

    let timeout = match configured.trim().parse::<u64>() {
        Ok(value) => value.clamp(MIN_AUTH_TIMEOUT, MAX_AUTH_TIMEOUT),
        Err(_) => default,
    };

    if configured.trim().parse::<u64>() != Ok(timeout) {
        warn!("Invalid {scheme} timeout value '{configured}', setting to {timeout}");
    }

    timeout
}
