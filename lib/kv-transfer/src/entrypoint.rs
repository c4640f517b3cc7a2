// SPDX-FileCopyrightText: Copyright (c) 2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Engine glue: raw operator inputs in, one status out.

use std::sync::Arc;

use anyhow::Context;
use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::cache::{CacheStore, KvKey};
use crate::cluster::ClusterManager;
use crate::config::CommConfig;
use crate::context::CommContext;
use crate::logging;
use crate::protocol::{
    INVALID_PREFIX_ID, LinkBatchRequest, LinkOperator, WireError, require_exact,
};
use crate::registry::Side;
use crate::status::{Result, StatusCode};
use crate::transport::{Transport, TransportAddr};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EngineOp {
    PullCache,
    TransferCache,
    CheckLink,
    UpdateLink,
    Unlink,
    SaveKv,
    /// One bounded polling pass for the entrypoint's side.
    Sync,
}

/// Input of [`EngineOp::CheckLink`].
///
/// Layout: `[cluster_id: 8][timeout_us: 4][reserved: 4]`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CheckLinkInput {
    pub cluster_id: u64,
    pub timeout_us: u32,
}

impl CheckLinkInput {
    pub const SIZE: usize = 16;

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(Self::SIZE);
        buf.put_u64_le(self.cluster_id);
        buf.put_u32_le(self.timeout_us);
        buf.put_u32_le(0);
        buf.freeze()
    }

    pub fn decode(data: &[u8]) -> Result<Self, WireError> {
        require_exact("CheckLinkInput", data, Self::SIZE, &[])?;
        let mut buf = data;
        Ok(Self {
            cluster_id: buf.get_u64_le(),
            timeout_us: buf.get_u32_le(),
        })
    }
}

/// Input of [`EngineOp::SaveKv`]: publishes a batch slot of a local cache
/// under the request key, and under the prefix key when one is given.
///
/// Layout: `[req_id: 8][prefix_id: 8][model_id: 8][cache_id: 8][batch_index: 4][reserved: 4][size: 8]`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SaveKvInput {
    pub req_id: u64,
    pub prefix_id: u64,
    pub model_id: u64,
    pub cache_id: i64,
    pub batch_index: u32,
    pub size: u64,
}

impl SaveKvInput {
    pub const SIZE: usize = 48;

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(Self::SIZE);
        buf.put_u64_le(self.req_id);
        buf.put_u64_le(self.prefix_id);
        buf.put_u64_le(self.model_id);
        buf.put_i64_le(self.cache_id);
        buf.put_u32_le(self.batch_index);
        buf.put_u32_le(0);
        buf.put_u64_le(self.size);
        buf.freeze()
    }

    pub fn decode(data: &[u8]) -> Result<Self, WireError> {
        require_exact("SaveKvInput", data, Self::SIZE, &[])?;
        let mut buf = data;
        let req_id = buf.get_u64_le();
        let prefix_id = buf.get_u64_le();
        let model_id = buf.get_u64_le();
        let cache_id = buf.get_i64_le();
        let batch_index = buf.get_u32_le();
        buf.advance(4);
        let size = buf.get_u64_le();
        Ok(Self {
            req_id,
            prefix_id,
            model_id,
            cache_id,
            batch_index,
            size,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineOutput {
    pub status: StatusCode,
    /// Per-cluster results of link operations, empty otherwise.
    pub link_results: Vec<StatusCode>,
}

impl EngineOutput {
    fn status(status: StatusCode) -> Self {
        Self {
            status,
            link_results: Vec::new(),
        }
    }

    fn from_result(result: Result<()>) -> Self {
        Self::status(result.map_or_else(|e| e.status(), |()| StatusCode::Success))
    }
}

#[derive(Debug, Clone)]
pub struct Entrypoint {
    manager: Arc<ClusterManager>,
    side: Side,
    listen_addr: Option<TransportAddr>,
}

impl Entrypoint {
    pub fn new(manager: Arc<ClusterManager>, side: Side) -> Self {
        Self {
            manager,
            side,
            listen_addr: None,
        }
    }

    /// Process start-up: logging, layered configuration, the shared context,
    /// and the prompt listener.
    pub fn initialize(
        side: Side,
        transport: Arc<dyn Transport>,
        store: Arc<dyn CacheStore>,
    ) -> anyhow::Result<Self> {
        logging::init();
        let config = CommConfig::from_env().context("failed to load kv-transfer config")?;
        Self::initialize_with_config(config, side, transport, store)
    }

    pub fn initialize_with_config(
        config: CommConfig,
        side: Side,
        transport: Arc<dyn Transport>,
        store: Arc<dyn CacheStore>,
    ) -> anyhow::Result<Self> {
        let cluster_id = config.cluster_id;
        let manager = ClusterManager::new(CommContext::new(config, transport, store));
        let mut entrypoint = Self::new(manager, side);
        if side == Side::Prompt {
            let addr = entrypoint
                .manager
                .listen()
                .with_context(|| format!("cluster {cluster_id} failed to listen"))?;
            entrypoint.listen_addr = Some(addr);
        }
        tracing::info!(
            cluster_id,
            ?side,
            listen = ?entrypoint.listen_addr,
            "kv-transfer initialized"
        );
        Ok(entrypoint)
    }

    pub fn manager(&self) -> &Arc<ClusterManager> {
        &self.manager
    }

    pub fn side(&self) -> Side {
        self.side
    }

    /// Address the prompt listener is bound to.
    pub fn listen_addr(&self) -> Option<TransportAddr> {
        self.listen_addr
    }

    /// Returns the number of state transitions made.
    pub fn sync(&self) -> usize {
        self.manager.poll(self.side)
    }

    pub fn run(&self, op: EngineOp, input: &[u8]) -> EngineOutput {
        match op {
            EngineOp::PullCache => EngineOutput::from_result(self.manager.pull_cache(input)),
            EngineOp::TransferCache => {
                EngineOutput::from_result(self.manager.transfer_cache(input))
            }
            EngineOp::CheckLink => EngineOutput::from_result(
                CheckLinkInput::decode(input)
                    .map_err(Into::into)
                    .and_then(|req| {
                        self.manager
                            .check_link(req.cluster_id, req.timeout_us as u64)
                    }),
            ),
            EngineOp::UpdateLink => self.link(input, None),
            EngineOp::Unlink => self.link(input, Some(LinkOperator::Unlink)),
            EngineOp::SaveKv => EngineOutput::from_result(self.save_kv(input)),
            EngineOp::Sync => {
                self.sync();
                EngineOutput::status(StatusCode::Success)
            }
        }
    }

    fn link(&self, input: &[u8], operator: Option<LinkOperator>) -> EngineOutput {
        let mut req = match LinkBatchRequest::decode(input) {
            Ok(req) => req,
            Err(e) => {
                tracing::warn!(error = %e, "malformed link request");
                return EngineOutput::status(StatusCode::ParamInvalid);
            }
        };
        if req.clusters.is_empty() {
            return EngineOutput::status(StatusCode::ParamInvalid);
        }
        // the unlink entry point keeps a prompt-side ServerUnlink as is
        if let Some(op) = operator
            && req.operator() != Ok(LinkOperator::ServerUnlink)
        {
            req.operator = op as u32;
        }
        let link_results = self.manager.link_clusters(&req);
        let status = link_results
            .iter()
            .copied()
            .find(|s| !s.is_success())
            .unwrap_or(StatusCode::Success);
        EngineOutput {
            status,
            link_results,
        }
    }

    fn save_kv(&self, input: &[u8]) -> Result<()> {
        let req = SaveKvInput::decode(input)?;
        self.manager.save_kv(
            req.cache_id,
            KvKey::request(req.req_id, req.model_id),
            req.batch_index,
            req.size,
        )?;
        if req.prefix_id != INVALID_PREFIX_ID {
            self.manager.save_kv(
                req.cache_id,
                KvKey::prefix(req.prefix_id, req.model_id),
                req.batch_index,
                req.size,
            )?;
        }
        Ok(())
    }
}
