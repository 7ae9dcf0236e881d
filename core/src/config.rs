// SPDX-FileCopyrightText: 2023 Phoenix R&D GmbH <hello@phnx.im>
//
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Configuration (§6.3), loaded the way the teacher's
//! `server/src/configurations.rs` layers a base file with environment
//! overrides via the `config` crate.

use std::time::Duration;

use serde::Deserialize;

use crate::rate_limiter::RateLimiterConfig;

fn default_http_port() -> u16 {
    8080
}

fn default_https_port() -> u16 {
    8443
}

fn default_heartbeat_interval_secs() -> u64 {
    30
}

fn default_max_frame_bytes() -> usize {
    400 * 1024
}

#[derive(Debug, Deserialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct TlsSettings {
    pub https_key: String,
    pub https_cert: String,
}

/// Options forwarded verbatim to the (out-of-scope) administrator control
/// plane; parsed here so the configuration file is self-describing, but
/// otherwise unused by the core.
#[derive(Debug, Deserialize, Clone, Default)]
#[serde(rename_all = "camelCase")]
pub struct AdminProvisioningSettings {
    #[serde(default)]
    pub admin_api_url: Option<String>,
    #[serde(default)]
    pub admin_api_key: Option<String>,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct RateLimitSettings {
    #[serde(default = "default_rate_limit_max_requests")]
    pub max_requests: u64,
    #[serde(default = "default_rate_limit_window_secs")]
    pub window_secs: u64,
}

fn default_rate_limit_max_requests() -> u64 {
    100
}

fn default_rate_limit_window_secs() -> u64 {
    10
}

impl Default for RateLimitSettings {
    fn default() -> Self {
        Self {
            max_requests: default_rate_limit_max_requests(),
            window_secs: default_rate_limit_window_secs(),
        }
    }
}

impl From<RateLimitSettings> for RateLimiterConfig {
    fn from(value: RateLimitSettings) -> Self {
        RateLimiterConfig {
            max_requests: value.max_requests,
            window: Duration::from_secs(value.window_secs),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct Settings {
    #[serde(default = "default_http_port")]
    pub http_port: u16,
    #[serde(default = "default_https_port")]
    pub https_port: u16,
    #[serde(default)]
    pub tls: Option<TlsSettings>,
    #[serde(default)]
    pub admin_provisioning: AdminProvisioningSettings,
    #[serde(default = "default_heartbeat_interval_secs")]
    pub heartbeat_interval_secs: u64,
    #[serde(default)]
    pub rate_limit: RateLimitSettings,
    #[serde(default = "default_max_frame_bytes")]
    pub max_frame_bytes: usize,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            http_port: default_http_port(),
            https_port: default_https_port(),
            tls: None,
            admin_provisioning: AdminProvisioningSettings::default(),
            heartbeat_interval_secs: default_heartbeat_interval_secs(),
            rate_limit: RateLimitSettings::default(),
            max_frame_bytes: default_max_frame_bytes(),
        }
    }
}

impl Settings {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }

    /// §4.3: two missed intervals (60s with the 30s default) before forced
    /// termination.
    pub fn heartbeat_timeout(&self) -> Duration {
        self.heartbeat_interval() * 2
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_spec() {
        let settings = Settings::default();
        assert_eq!(settings.http_port, 8080);
        assert_eq!(settings.https_port, 8443);
        assert_eq!(settings.heartbeat_interval_secs, 30);
        assert_eq!(settings.heartbeat_timeout(), Duration::from_secs(60));
        assert_eq!(settings.max_frame_bytes, 400 * 1024);
    }
}
