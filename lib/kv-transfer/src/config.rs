// SPDX-FileCopyrightText: Copyright (c) 2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Transfer layer configuration.
//!
//! Sources in priority order (lowest to highest):
//! 1. Code defaults
//! 2. System config file at /opt/dynamo/etc/kv_transfer.toml
//! 3. TOML file from the `DYN_KV_TRANSFER_CONFIG_PATH` environment variable
//! 4. Environment variables (`DYN_KV_TRANSFER_*`)

use std::net::Ipv4Addr;
use std::time::Duration;

use figment::{
    Figment, Metadata, Profile, Provider,
    providers::{Env, Format, Json, Serialized, Toml},
    value::{Dict, Map},
};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use validator::{Validate, ValidationErrors};

use crate::transport::TransportAddr;

const CONFIG_PATH_ENV: &str = "DYN_KV_TRANSFER_CONFIG_PATH";
const SYSTEM_CONFIG_PATH: &str = "/opt/dynamo/etc/kv_transfer.toml";

/// Upper bound on simultaneously linked clusters.
pub const DEFAULT_MAX_LINKS: usize = 512;

/// Largest single send; bigger transfer slots are split.
pub const DEFAULT_MAX_SEND_BYTES: u64 = 2 * 1024 * 1024 * 1024;

pub const DEFAULT_TIMEOUT_CHECK_INTERVAL: u32 = 5;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to extract configuration: {0}")]
    Extraction(#[from] Box<figment::Error>),

    #[error("Configuration validation failed: {0}")]
    Validation(#[from] ValidationErrors),
}

/// Link/unlink settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct LinkConfig {
    /// Global ceiling on linked clusters per side.
    #[validate(range(min = 1, max = 65536))]
    pub max_links: usize,

    /// Listen backlog of the prompt side.
    #[validate(range(min = 1))]
    pub backlog: u32,

    /// Used when a link request carries a zero timeout.
    #[validate(range(min = 1))]
    pub default_timeout_us: u64,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            max_links: DEFAULT_MAX_LINKS,
            backlog: 512,
            default_timeout_us: 3_000_000,
        }
    }
}

/// Pull/transfer settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct TransferConfig {
    #[validate(range(min = 1))]
    pub default_timeout_us: u64,

    #[validate(range(min = 1))]
    pub max_send_bytes: u64,

    /// Polls between two clock reads while waiting on a timeout.
    #[validate(range(min = 1))]
    pub timeout_check_interval: u32,

    /// Caches are block tables (paged attention) rather than batch slots.
    pub paged_attention: bool,
}

impl TransferConfig {
    /// Chunk size announced at link time and used to split pull replies to
    /// this side. Capped to fit the handshake field.
    pub fn pull_chunk_bytes(&self) -> u32 {
        u32::try_from(self.max_send_bytes).unwrap_or(u32::MAX)
    }
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            default_timeout_us: 1_000_000,
            max_send_bytes: DEFAULT_MAX_SEND_BYTES,
            timeout_check_interval: DEFAULT_TIMEOUT_CHECK_INTERVAL,
            paged_attention: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct StatsConfig {
    /// Seconds between periodic dumps from idle entities. 0 disables them.
    pub dump_interval_secs: u64,

    /// Warm-up samples left out of every cost statistic.
    pub ignore_first: u64,
}

impl Default for StatsConfig {
    fn default() -> Self {
        Self {
            dump_interval_secs: 60,
            ignore_first: 1,
        }
    }
}

/// Settings for the outer polling harness.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct PollConfig {
    /// Registry sweeps per driver invocation.
    #[validate(range(min = 1))]
    pub budget: usize,

    /// Sleep between invocations.
    pub idle_sleep_us: u64,
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            budget: 64,
            idle_sleep_us: 50,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct CommConfig {
    /// Id this process announces when it links to a peer.
    pub cluster_id: u64,

    pub listen_ip: Ipv4Addr,

    /// 0 lets the transport pick a port.
    pub listen_port: u16,

    #[validate(nested)]
    pub link: LinkConfig,

    #[validate(nested)]
    pub transfer: TransferConfig,

    #[validate(nested)]
    pub stats: StatsConfig,

    #[validate(nested)]
    pub poll: PollConfig,
}

impl Default for CommConfig {
    fn default() -> Self {
        Self {
            cluster_id: 0,
            listen_ip: Ipv4Addr::LOCALHOST,
            listen_port: 0,
            link: LinkConfig::default(),
            transfer: TransferConfig::default(),
            stats: StatsConfig::default(),
            poll: PollConfig::default(),
        }
    }
}

impl CommConfig {
    pub fn figment() -> Figment {
        let config_path = std::env::var(CONFIG_PATH_ENV).unwrap_or_default();

        Figment::new()
            .merge(Serialized::defaults(CommConfig::default()))
            .merge(Toml::file(SYSTEM_CONFIG_PATH))
            .merge(Toml::file(&config_path))
            // DYN_KV_TRANSFER_CLUSTER_ID, DYN_KV_TRANSFER_LISTEN_IP, DYN_KV_TRANSFER_LISTEN_PORT
            .merge(Env::prefixed("DYN_KV_TRANSFER_").only(&[
                "cluster_id",
                "listen_ip",
                "listen_port",
            ]))
            // DYN_KV_TRANSFER_LINK_MAX_LINKS, DYN_KV_TRANSFER_LINK_DEFAULT_TIMEOUT_US, ...
            .merge(
                Env::prefixed("DYN_KV_TRANSFER_LINK_")
                    .map(|k| format!("link.{}", k.as_str().to_lowercase()).into()),
            )
            .merge(
                Env::prefixed("DYN_KV_TRANSFER_TRANSFER_")
                    .map(|k| format!("transfer.{}", k.as_str().to_lowercase()).into()),
            )
            .merge(
                Env::prefixed("DYN_KV_TRANSFER_STATS_")
                    .map(|k| format!("stats.{}", k.as_str().to_lowercase()).into()),
            )
            .merge(
                Env::prefixed("DYN_KV_TRANSFER_POLL_")
                    .map(|k| format!("poll.{}", k.as_str().to_lowercase()).into()),
            )
    }

    pub fn from_env() -> Result<Self, ConfigError> {
        Self::extract_from(Self::figment())
    }

    pub fn extract_from<T: Provider>(provider: T) -> Result<Self, ConfigError> {
        let config: Self = Figment::from(provider)
            .extract()
            .map_err(|e| ConfigError::Extraction(Box::new(e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Defaults, files and env, then `json` on top.
    pub fn from_figment_with_json(json: &str) -> Result<Self, ConfigError> {
        Self::extract_from(Self::figment().merge(Json::string(json)))
    }

    pub fn listen_addr(&self) -> TransportAddr {
        TransportAddr::new(self.listen_ip, self.listen_port)
    }

    pub fn with_cluster_id(mut self, cluster_id: u64) -> Self {
        self.cluster_id = cluster_id;
        self
    }

    pub fn with_listen_addr(mut self, addr: TransportAddr) -> Self {
        self.listen_ip = addr.ip;
        self.listen_port = addr.port;
        self
    }

    pub fn stats_dump_interval(&self) -> Option<Duration> {
        (self.stats.dump_interval_secs > 0)
            .then(|| Duration::from_secs(self.stats.dump_interval_secs))
    }

    pub fn idle_sleep(&self) -> Duration {
        Duration::from_micros(self.poll.idle_sleep_us)
    }
}

impl Provider for CommConfig {
    fn metadata(&self) -> Metadata {
        Metadata::named("CommConfig")
    }

    fn data(&self) -> Result<Map<Profile, Dict>, figment::Error> {
        Serialized::defaults(self).data()
    }
}

/// `1`, `true`, `on` or `yes` (any case).
pub fn env_is_truthy(name: &str) -> bool {
    std::env::var(name)
        .map(|v| matches!(v.to_lowercase().as_str(), "1" | "true" | "on" | "yes"))
        .unwrap_or(false)
}

pub fn disable_ansi_logging() -> bool {
    env_is_truthy("DYN_DISABLE_ANSI_LOGGING")
}
