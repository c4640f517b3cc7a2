// SPDX-FileCopyrightText: Copyright (c) 2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Logging setup.
//!
//! Filters come from the `DYN_LOG` environment variable (default `info`),
//! plus per-module levels from the TOML file named by
//! `DYN_LOGGING_CONFIG_PATH` or `/opt/dynamo/etc/logging.toml`:
//!
//! ```toml
//! log_level = "warn"
//!
//! [log_filters]
//! "dynamo_kv_transfer::entity" = "debug"
//! ```
//!
//! Output is the compact fmt format on stderr. `DYN_DISABLE_ANSI_LOGGING=1`
//! turns colors off.

use std::collections::HashMap;
use std::sync::Once;

use figment::{
    Figment,
    providers::{Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};
use tracing::level_filters::LevelFilter;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{EnvFilter, filter::Directive, fmt};

use crate::config::disable_ansi_logging;

/// ENV used to set the log level
const FILTER_ENV: &str = "DYN_LOG";

const DEFAULT_FILTER_LEVEL: &str = "info";

const CONFIG_PATH_ENV: &str = "DYN_LOGGING_CONFIG_PATH";

static INIT: Once = Once::new();

#[derive(Serialize, Deserialize, Debug)]
struct LoggingConfig {
    log_level: String,
    log_filters: HashMap<String, String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        LoggingConfig {
            log_level: DEFAULT_FILTER_LEVEL.to_string(),
            log_filters: HashMap::new(),
        }
    }
}

/// Installs the global subscriber. Later calls are no-ops.
pub fn init() {
    INIT.call_once(setup_logging);
}

fn setup_logging() {
    let l = fmt::layer()
        .with_ansi(!disable_ansi_logging())
        .event_format(fmt::format().compact())
        .with_writer(std::io::stderr)
        .with_filter(filters(load_config()));
    // another subscriber may already be installed by the host process
    if let Err(e) = tracing_subscriber::registry().with(l).try_init() {
        eprintln!("kv-transfer logging not installed: {e}");
    }
}

fn filters(config: LoggingConfig) -> EnvFilter {
    let default_directive = config
        .log_level
        .parse::<Directive>()
        .unwrap_or_else(|_| LevelFilter::INFO.into());
    let mut filter_layer = EnvFilter::builder()
        .with_default_directive(default_directive)
        .with_env_var(FILTER_ENV)
        .from_env_lossy();

    for (module, level) in config.log_filters {
        match format!("{module}={level}").parse::<Directive>() {
            Ok(d) => {
                filter_layer = filter_layer.add_directive(d);
            }
            Err(e) => {
                eprintln!("Failed parsing filter '{level}' for module '{module}': {e}");
            }
        }
    }
    filter_layer
}

fn load_config() -> LoggingConfig {
    let config_path = std::env::var(CONFIG_PATH_ENV).unwrap_or_default();
    Figment::new()
        .merge(Serialized::defaults(LoggingConfig::default()))
        .merge(Toml::file("/opt/dynamo/etc/logging.toml"))
        .merge(Toml::file(config_path))
        .extract()
        .unwrap_or_else(|e| {
            eprintln!("Failed loading logging config, using defaults: {e}");
            LoggingConfig::default()
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_is_idempotent() {
        init();
        init();
        tracing::info!("logging initialised");
    }

    #[test]
    fn test_filters_skip_bad_directives() {
        let config = LoggingConfig {
            log_level: "not a level".to_string(),
            log_filters: HashMap::from([
                ("dynamo_kv_transfer".to_string(), "debug".to_string()),
                ("bad module".to_string(), "???".to_string()),
            ]),
        };
        let filter = filters(config).to_string();
        assert!(filter.contains("dynamo_kv_transfer=debug"));
    }
}
