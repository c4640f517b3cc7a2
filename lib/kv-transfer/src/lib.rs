// SPDX-FileCopyrightText: Copyright (c) 2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! KV cache transfer between prompt and decoder clusters.
//!
//! A decoder links to prompt clusters with [`ClusterManager::update_link`],
//! then pulls caches ([`ClusterManager::pull_cache`]) or receives caches the
//! prompt pushes ([`ClusterManager::transfer_cache`]). Every connection is a
//! poll-driven [`entity::CommEntity`] advanced by the [`registry`] sweeps;
//! [`driver::PollingDriver`] runs those sweeps on a dedicated thread.

pub mod blocks;
pub mod cache;
pub mod cluster;
pub mod config;
pub mod context;
pub mod driver;
pub mod entity;
pub mod entrypoint;
pub mod link;
pub mod logging;
pub mod protocol;
pub mod registry;
pub mod stats;
pub mod status;
pub mod timing;
pub mod transport;

pub use cluster::ClusterManager;
pub use config::CommConfig;
pub use context::CommContext;
pub use driver::PollingDriver;
pub use entrypoint::{EngineOp, EngineOutput, Entrypoint};
pub use registry::{EntityRegistry, Side};
pub use status::{LlmError, Result, StatusCode};
