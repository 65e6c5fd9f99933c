// Copyright 2021-2024 SecureDNA Stiftung (SecureDNA Foundation) <licensing@securedna.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

use std::path::Path;

use anyhow::Context;
use serde::{Deserialize, Serialize};

use picture::ProxyConfig;
use pushstream::{Heartbeat, InvalidHeartbeat};

/// Contents of the server's TOML config file.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default)]
    pub image: ProxyConfig,
    #[serde(default)]
    pub stream: StreamConfig,
}

/// A configured heartbeat: `true`/`false` to toggle the default interval, or an
/// interval in milliseconds.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum HeartbeatSetting {
    Enabled(bool),
    Millis(i64),
}

impl HeartbeatSetting {
    pub fn heartbeat(self) -> Result<Heartbeat, InvalidHeartbeat> {
        match self {
            Self::Enabled(true) => Ok(Heartbeat::default()),
            Self::Enabled(false) => Ok(Heartbeat::Disabled),
            Self::Millis(millis) => Heartbeat::from_millis(millis),
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StreamConfig {
    /// Heartbeat of event streams; on by default.
    #[serde(default)]
    pub heartbeat: Option<HeartbeatSetting>,
    /// Heartbeat of tasks; off by default.
    #[serde(default)]
    pub task_heartbeat: Option<HeartbeatSetting>,
}

impl StreamConfig {
    pub fn stream_heartbeat(&self) -> Result<Heartbeat, InvalidHeartbeat> {
        self.heartbeat
            .map_or(Ok(Heartbeat::default()), HeartbeatSetting::heartbeat)
    }

    pub fn task_heartbeat(&self) -> Result<Heartbeat, InvalidHeartbeat> {
        self.task_heartbeat
            .map_or(Ok(Heartbeat::Disabled), HeartbeatSetting::heartbeat)
    }
}

impl Config {
    /// Reads and parses a TOML config file.
    pub async fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let config = tokio::fs::read(path)
            .await
            .with_context(|| format!("Couldn't open config TOML: {path:?}"))?;
        let config = String::from_utf8(config)
            .with_context(|| format!("Couldn't interpret config TOML as UTF-8: {path:?}"))?;
        toml::from_str(&config).with_context(|| format!("Couldn't parse as TOML: {path:?}"))
    }
}
