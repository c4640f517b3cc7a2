// SPDX-FileCopyrightText: Copyright (c) 2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Public operation surface.
//!
//! [`ClusterManager`] decodes caller buffers, resolves the entity of the
//! addressed cluster, claims it for the duration of the call and records
//! per-operation statistics.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;

use crate::cache::{HostBuffer, KvKey};
use crate::context::{CommContext, MemoryRegistration};
use crate::link::LinkReqHandler;
use crate::protocol::{LinkBatchRequest, LinkOperator, PullKvRequest, TransferKvRequest};
use crate::registry::{EntityRegistry, Side};
use crate::stats::{ClusterStats, Operation};
use crate::status::{LlmError, Result, StatusCode};
use crate::transport::TransportAddr;

pub struct ClusterManager {
    ctx: Arc<CommContext>,
    registry: Arc<EntityRegistry>,
    links: LinkReqHandler,
    stats: ClusterStats,
    registrations: Mutex<HashMap<i64, Vec<MemoryRegistration>>>,
}

impl ClusterManager {
    pub fn new(ctx: Arc<CommContext>) -> Arc<Self> {
        let registry = EntityRegistry::new(ctx.clone());
        let links = LinkReqHandler::new(ctx.clone(), registry.clone());
        let stats = ClusterStats::new(ctx.config().stats.ignore_first);
        Arc::new(Self {
            ctx,
            registry,
            links,
            stats,
            registrations: Mutex::new(HashMap::new()),
        })
    }

    pub fn context(&self) -> &Arc<CommContext> {
        &self.ctx
    }

    pub fn registry(&self) -> &Arc<EntityRegistry> {
        &self.registry
    }

    pub fn stats(&self) -> &ClusterStats {
        &self.stats
    }

    /// Starts accepting decoder links. See [`EntityRegistry::listen`].
    pub fn listen(&self) -> Result<TransportAddr> {
        self.registry.listen()
    }

    fn timed<T>(&self, op: Operation, f: impl FnOnce() -> Result<T>) -> Result<T> {
        let start = Instant::now();
        let result = f();
        self.stats.record(op, result.is_ok(), start.elapsed());
        if let Err(e) = &result {
            tracing::warn!(?op, error = %e, "operation failed");
        }
        result
    }

    /// Decodes a [`LinkBatchRequest`] and runs it; one status per cluster.
    pub fn update_link(&self, data: &[u8]) -> Result<Vec<StatusCode>> {
        let req = LinkBatchRequest::decode(data)?;
        if req.clusters.is_empty() {
            return Err(LlmError::param("link request names no clusters"));
        }
        Ok(self.link_clusters(&req))
    }

    pub fn link_clusters(&self, req: &LinkBatchRequest) -> Vec<StatusCode> {
        let op = match req.operator() {
            Ok(LinkOperator::Link) => Operation::Link,
            _ => Operation::Unlink,
        };
        let start = Instant::now();
        let results = self.links.handle(req);
        let ok = results.iter().all(|s| s.is_success());
        self.stats.record(op, ok, start.elapsed());
        results
    }

    pub fn pull_cache(&self, data: &[u8]) -> Result<()> {
        let req = PullKvRequest::decode(data)?;
        self.pull(&req)
    }

    pub fn pull(&self, req: &PullKvRequest) -> Result<()> {
        self.timed(Operation::PullCache, || {
            if req.is_pull_block() && !self.ctx.config().transfer.paged_attention {
                return Err(LlmError::param("block pull requires paged attention"));
            }
            let handle = self
                .registry
                .client(req.prompt_cluster_id)
                .ok_or(LlmError::NotLink(req.prompt_cluster_id))?;
            let mut entity = handle.claim()?;
            entity.pull(req)
        })
    }

    pub fn transfer_cache(&self, data: &[u8]) -> Result<()> {
        let req = TransferKvRequest::decode(data)?;
        self.transfer(&req)
    }

    pub fn transfer(&self, req: &TransferKvRequest) -> Result<()> {
        self.timed(Operation::TransferCache, || {
            if req.is_block_transfer() && !self.ctx.config().transfer.paged_attention {
                return Err(LlmError::param("block transfer requires paged attention"));
            }
            let handle = self
                .registry
                .server(req.dst_cluster_id)
                .ok_or(LlmError::NotLink(req.dst_cluster_id))?;
            let mut entity = handle.claim()?;
            entity.transfer(req)
        })
    }

    /// Sends a liveness token over a client link. A server link counts as
    /// alive while its entity is not in Error or Destroy.
    pub fn check_link(&self, cluster_id: u64, timeout_us: u64) -> Result<()> {
        self.timed(Operation::CheckLink, || {
            if let Some(handle) = self.registry.client(cluster_id) {
                let mut entity = handle.claim()?;
                return entity.check_link(timeout_us);
            }
            let handle = self
                .registry
                .server(cluster_id)
                .ok_or(LlmError::NotLink(cluster_id))?;
            match handle.try_lock() {
                Some(entity) if entity.is_terminal() => Err(LlmError::NotLink(cluster_id)),
                _ => Ok(()),
            }
        })
    }

    /// Publishes the batch slot of a store cache under `key` for pulls that
    /// address it by request.
    pub fn save_kv(&self, cache_id: i64, key: KvKey, batch_index: u32, size: u64) -> Result<()> {
        self.ctx.store().bind_key(cache_id, key, batch_index, size)
    }

    /// Saves host tensors into the KV index; returns the new index cache id.
    pub fn save_tensors(
        &self,
        key: KvKey,
        tensors: Vec<Arc<HostBuffer>>,
        offset: u64,
        size: u64,
    ) -> Result<u64> {
        self.ctx.kv_index().save(key, tensors, offset, size)
    }

    /// Pins every tensor of a store cache with the transport.
    pub fn register_cache(&self, cache_id: i64) -> Result<()> {
        let entry = self
            .ctx
            .store()
            .entry(cache_id)
            .ok_or_else(|| LlmError::KvNotExist(format!("cache {cache_id}")))?;
        let mut registrations = self.registrations.lock();
        if registrations.contains_key(&cache_id) {
            return Err(LlmError::RepeatRequest(format!(
                "cache {cache_id} is already registered"
            )));
        }
        let guards = entry
            .tensors
            .iter()
            .map(|tensor| self.ctx.register_memory(tensor))
            .collect::<Result<Vec<_>>>()?;
        tracing::debug!(cache_id, tensors = guards.len(), "cache registered");
        registrations.insert(cache_id, guards);
        Ok(())
    }

    pub fn unregister_cache(&self, cache_id: i64) -> Result<()> {
        self.registrations
            .lock()
            .remove(&cache_id)
            .map(drop)
            .ok_or_else(|| LlmError::KvNotExist(format!("cache {cache_id} is not registered")))
    }

    pub fn is_registered(&self, cache_id: i64) -> bool {
        self.registrations.lock().contains_key(&cache_id)
    }

    /// Bounded polling for one side; see [`EntityRegistry::run_for`].
    pub fn poll(&self, side: Side) -> usize {
        self.registry.run_for(side, self.ctx.config().poll.budget)
    }

    /// Stops listening and dumps statistics. Fails with `ExistLink` while
    /// links remain; the caller unlinks them first.
    pub fn finalize(&self) -> Result<()> {
        let links = self.registry.link_count();
        if links > 0 {
            return Err(LlmError::ExistLink(links));
        }
        self.registry.close_listener();
        self.registrations.lock().clear();
        self.stats.dump();
        tracing::info!(cluster_id = self.ctx.cluster_id(), "cluster manager finalized");
        Ok(())
    }
}

impl std::fmt::Debug for ClusterManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClusterManager")
            .field("cluster_id", &self.ctx.cluster_id())
            .field("registry", &self.registry)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{CacheDesc, HostCacheStore};
    use crate::config::CommConfig;
    use crate::transport::LoopbackFabric;

    fn manager() -> Arc<ClusterManager> {
        let fabric = LoopbackFabric::new();
        ClusterManager::new(CommContext::new(
            CommConfig::default().with_cluster_id(7),
            Arc::new(fabric.endpoint()),
            Arc::new(HostCacheStore::new()),
        ))
    }

    #[test]
    fn test_unlinked_cluster() {
        let manager = manager();
        assert_eq!(
            manager.check_link(3, 1000).unwrap_err().status(),
            StatusCode::NotLink
        );
        let stats = manager.stats().get(Operation::CheckLink);
        assert_eq!((stats.success, stats.failed), (0, 1));
    }

    #[test]
    fn test_truncated_input_is_param_invalid() {
        let manager = manager();
        assert_eq!(
            manager.pull_cache(&[0u8; 7]).unwrap_err().status(),
            StatusCode::ParamInvalid
        );
        assert_eq!(
            manager.update_link(&[1u8; 3]).unwrap_err().status(),
            StatusCode::ParamInvalid
        );
    }

    #[test]
    fn test_empty_link_batch_is_param_invalid() {
        let manager = manager();
        let req = LinkBatchRequest::new(LinkOperator::Link, 100, vec![]);
        assert_eq!(
            manager.update_link(&req.encode()).unwrap_err().status(),
            StatusCode::ParamInvalid
        );
    }

    #[test]
    fn test_register_cache() {
        let manager = manager();
        let desc = CacheDesc::builder()
            .num_tensors(2)
            .batch_size(1)
            .tensor_size(64)
            .build()
            .unwrap();
        let cache_id = manager.context().store().allocate(&desc).unwrap();

        manager.register_cache(cache_id).unwrap();
        assert!(manager.is_registered(cache_id));
        assert_eq!(
            manager.register_cache(cache_id).unwrap_err().status(),
            StatusCode::RepeatRequest
        );
        manager.unregister_cache(cache_id).unwrap();
        assert_eq!(
            manager.unregister_cache(cache_id).unwrap_err().status(),
            StatusCode::KvNotExist
        );
        assert_eq!(
            manager.register_cache(99).unwrap_err().status(),
            StatusCode::KvNotExist
        );
    }

    #[test]
    fn test_finalize() {
        let manager = manager();
        manager.listen().unwrap();
        manager.finalize().unwrap();
    }
}
