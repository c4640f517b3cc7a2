// SPDX-FileCopyrightText: Copyright (c) 2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Batch link and unlink orchestration on the decoder side.
//!
//! All clusters of a batch advance round-robin through their connection
//! steps under one shared deadline, so a slow peer only costs the batch its
//! own timeout instead of serialising the others behind it.

use std::collections::HashSet;
use std::sync::Arc;

use crate::context::CommContext;
use crate::entity::{CommEntity, EntityHandle};
use crate::protocol::{
    ClientClusterInfo, ClusterLinkInfo, ClusterRole, LinkBatchRequest, LinkOperator,
    MAX_CLUSTERS_PER_REQUEST,
};
use crate::registry::EntityRegistry;
use crate::status::{LlmError, Result, StatusCode};
use crate::transport::{Connection, RequestSet, TransportError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LinkStep {
    Open,
    Bind,
    Connect,
    SendInfo,
    TestSend,
    Register,
}

struct LinkTask {
    index: usize,
    info: ClusterLinkInfo,
    step: LinkStep,
    conn: Option<Connection>,
    sends: RequestSet,
}

impl LinkTask {
    fn new(index: usize, info: ClusterLinkInfo) -> Self {
        Self {
            index,
            info,
            step: LinkStep::Open,
            conn: None,
            sends: RequestSet::new(),
        }
    }

    fn conn(&self) -> Result<&Connection> {
        self.conn
            .as_ref()
            .ok_or_else(|| LlmError::Internal("link task without connection".into()))
    }

    /// Advances until the transport asks to come back later. Returns `true`
    /// once the connection is ready to be registered.
    fn advance(&mut self, ctx: &CommContext) -> Result<bool> {
        let transport = ctx.transport();
        loop {
            match self.step {
                LinkStep::Open => {
                    self.conn = Some(Connection::open(transport.clone())?);
                    self.step = LinkStep::Bind;
                }
                LinkStep::Bind => {
                    transport.bind(self.conn()?.handle(), self.info.local_addr)?;
                    self.step = LinkStep::Connect;
                }
                LinkStep::Connect => {
                    match transport.connect(self.conn()?.handle(), self.info.remote_addr) {
                        Ok(()) => self.step = LinkStep::SendInfo,
                        Err(TransportError::Again) => return Ok(false),
                        Err(e) => return Err(e.into()),
                    }
                }
                LinkStep::SendInfo => {
                    let info = ClientClusterInfo {
                        cluster_id: self.info.local_cluster_id,
                        role: ClusterRole::Decoder,
                        pull_chunk_bytes: ctx.config().transfer.pull_chunk_bytes(),
                    };
                    let handle = self.conn()?.handle();
                    match self
                        .sends
                        .isend(transport.as_ref(), handle, info.encode().into())
                    {
                        Ok(()) => self.step = LinkStep::TestSend,
                        Err(TransportError::Again) => return Ok(false),
                        Err(e) => return Err(e.into()),
                    }
                }
                LinkStep::TestSend => {
                    self.sends.poll(transport.as_ref())?;
                    if !self.sends.is_empty() {
                        return Ok(false);
                    }
                    self.step = LinkStep::Register;
                }
                LinkStep::Register => return Ok(true),
            }
        }
    }
}

struct UnlinkTask {
    index: usize,
    cluster_id: u64,
    handle: Arc<EntityHandle>,
}

/// Executes [`LinkBatchRequest`]s against the entity registry.
pub struct LinkReqHandler {
    ctx: Arc<CommContext>,
    registry: Arc<EntityRegistry>,
}

impl LinkReqHandler {
    pub fn new(ctx: Arc<CommContext>, registry: Arc<EntityRegistry>) -> Self {
        Self { ctx, registry }
    }

    /// One status per cluster, in request order.
    pub fn handle(&self, req: &LinkBatchRequest) -> Vec<StatusCode> {
        let n = req.clusters.len();
        if n > MAX_CLUSTERS_PER_REQUEST {
            tracing::warn!(
                clusters = n,
                max = MAX_CLUSTERS_PER_REQUEST,
                "link batch over limit"
            );
            return vec![StatusCode::ReqOverLimit; n];
        }
        let operator = match req.operator() {
            Ok(op) => op,
            Err(e) => {
                tracing::warn!(error = %e, "unknown link operator");
                return vec![StatusCode::ParamInvalid; n];
            }
        };
        tracing::info!(?operator, clusters = n, force = req.force, "handling link batch");
        match operator {
            LinkOperator::Link => self.link(req),
            LinkOperator::Unlink => self.unlink(req),
            LinkOperator::ServerUnlink => self.server_unlink(req),
        }
    }

    fn link(&self, req: &LinkBatchRequest) -> Vec<StatusCode> {
        let mut results = vec![StatusCode::Success; req.clusters.len()];
        let mut tasks = Vec::new();
        let mut seen = HashSet::new();
        let linked = self.registry.client_count();
        let max_links = self.ctx.config().link.max_links;

        for (index, cluster) in req.clusters.iter().enumerate() {
            let info = match cluster.validate(self.ctx.cluster_id()) {
                Ok(info) => info,
                Err(e) => {
                    tracing::warn!(index, error = %e, "invalid cluster descriptor");
                    results[index] = StatusCode::ParamInvalid;
                    continue;
                }
            };
            if !seen.insert(info.remote_cluster_id) {
                results[index] = StatusCode::ParamInvalid;
                continue;
            }
            if self.registry.client(info.remote_cluster_id).is_some() {
                results[index] = StatusCode::AlreadyLinked;
                continue;
            }
            if linked + tasks.len() >= max_links {
                results[index] = StatusCode::ReqOverLimit;
                continue;
            }
            tasks.push(LinkTask::new(index, info));
        }

        let mut deadline = self.ctx.link_deadline(req.timeout_us as u64);
        while !tasks.is_empty() {
            let mut pending = Vec::with_capacity(tasks.len());
            for mut task in tasks {
                let cluster_id = task.info.remote_cluster_id;
                match task.advance(&self.ctx) {
                    Ok(false) => pending.push(task),
                    Ok(true) => {
                        let index = task.index;
                        results[index] = self.register(task);
                    }
                    Err(e) => {
                        tracing::warn!(cluster_id, step = ?task.step, error = %e, "link failed");
                        results[task.index] = match e {
                            LlmError::Transport(_) => StatusCode::LinkFailed,
                            other => other.status(),
                        };
                    }
                }
            }
            tasks = pending;
            if tasks.is_empty() {
                break;
            }
            if let Err(e) = deadline.poll() {
                for task in &tasks {
                    tracing::warn!(
                        cluster_id = task.info.remote_cluster_id,
                        step = ?task.step,
                        error = %e,
                        "link timed out"
                    );
                    results[task.index] = StatusCode::Timeout;
                }
                break;
            }
            std::thread::yield_now();
        }
        results
    }

    fn register(&self, mut task: LinkTask) -> StatusCode {
        let cluster_id = task.info.remote_cluster_id;
        let Some(conn) = task.conn.take() else {
            return StatusCode::Failed;
        };
        let entity = CommEntity::client(self.ctx.clone(), conn, task.info.remote_addr, cluster_id);
        match self.registry.add_client(entity) {
            Ok(_) => {
                tracing::info!(cluster_id, remote = %task.info.remote_addr, "cluster linked");
                StatusCode::Success
            }
            Err(e) => {
                tracing::warn!(cluster_id, error = %e, "cannot register link");
                e.status()
            }
        }
    }

    fn unlink(&self, req: &LinkBatchRequest) -> Vec<StatusCode> {
        let mut results = vec![StatusCode::Success; req.clusters.len()];
        let mut tasks = Vec::new();
        let mut seen = HashSet::new();

        for (index, cluster) in req.clusters.iter().enumerate() {
            let info = match cluster.validate(self.ctx.cluster_id()) {
                Ok(info) => info,
                Err(e) => {
                    tracing::warn!(index, error = %e, "invalid cluster descriptor");
                    results[index] = StatusCode::ParamInvalid;
                    continue;
                }
            };
            let cluster_id = info.remote_cluster_id;
            if !seen.insert(cluster_id) {
                results[index] = StatusCode::ParamInvalid;
                continue;
            }
            let Some(handle) = self.registry.client(cluster_id) else {
                results[index] = StatusCode::NotLink;
                continue;
            };
            if handle.is_in_use() {
                results[index] = StatusCode::LinkBusy;
                continue;
            }
            let entity = handle.lock();
            if entity.peer_addr().ip != info.remote_addr.ip {
                tracing::warn!(
                    cluster_id,
                    linked = %entity.peer_addr(),
                    requested = %info.remote_addr,
                    "unlink address does not match the link"
                );
                results[index] = StatusCode::ParamInvalid;
                continue;
            }
            if !handle.begin_unlink() {
                results[index] = StatusCode::LinkBusy;
                continue;
            }
            drop(entity);
            tasks.push(UnlinkTask {
                index,
                cluster_id,
                handle,
            });
        }

        let mut deadline = self.ctx.link_deadline(req.timeout_us as u64);
        while !tasks.is_empty() {
            let mut pending = Vec::with_capacity(tasks.len());
            for task in tasks {
                if task.handle.is_in_use() {
                    pending.push(task);
                    continue;
                }
                let Some(mut entity) = task.handle.try_lock() else {
                    pending.push(task);
                    continue;
                };
                if !req.force
                    && !entity.is_terminal()
                    && entity.notify_unlink(&mut deadline).is_err()
                {
                    results[task.index] = StatusCode::NotifyPromptUnlinkFailed;
                }
                entity.teardown(req.force);
                drop(entity);
                self.registry.remove_client(task.cluster_id, &task.handle);
                tracing::info!(cluster_id = task.cluster_id, "cluster unlinked");
            }
            tasks = pending;
            if tasks.is_empty() {
                break;
            }
            if let Err(e) = deadline.poll() {
                for task in tasks {
                    tracing::warn!(cluster_id = task.cluster_id, error = %e, "unlink timed out");
                    results[task.index] = StatusCode::Timeout;
                    if let Some(mut entity) = task.handle.try_lock() {
                        entity.teardown(true);
                    }
                    self.registry.remove_client(task.cluster_id, &task.handle);
                }
                break;
            }
            std::thread::yield_now();
        }
        results
    }

    fn server_unlink(&self, req: &LinkBatchRequest) -> Vec<StatusCode> {
        req.clusters
            .iter()
            .enumerate()
            .map(|(index, cluster)| {
                let info = match cluster.validate(self.ctx.cluster_id()) {
                    Ok(info) => info,
                    Err(e) => {
                        tracing::warn!(index, error = %e, "invalid cluster descriptor");
                        return StatusCode::ParamInvalid;
                    }
                };
                let cluster_id = info.remote_cluster_id;
                let Some(handle) = self.registry.server(cluster_id) else {
                    return StatusCode::NotLink;
                };
                if handle.is_in_use() {
                    return StatusCode::LinkBusy;
                }
                let mut entity = handle.lock();
                entity.teardown(true);
                drop(entity);
                self.registry.remove_server(&handle);
                tracing::info!(cluster_id, "server link dropped");
                StatusCode::Success
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use std::net::Ipv4Addr;

    use super::*;
    use crate::cache::HostCacheStore;
    use crate::config::CommConfig;
    use crate::protocol::ClusterInfo;
    use crate::registry::Side;
    use crate::transport::{LoopbackFabric, TransportAddr};

    fn node(
        fabric: &Arc<LoopbackFabric>,
        cluster_id: u64,
    ) -> (LinkReqHandler, Arc<EntityRegistry>) {
        let ctx = CommContext::new(
            CommConfig::default().with_cluster_id(cluster_id),
            Arc::new(fabric.endpoint()),
            Arc::new(HostCacheStore::new()),
        );
        let registry = EntityRegistry::new(ctx.clone());
        (LinkReqHandler::new(ctx, registry.clone()), registry)
    }

    fn cluster(remote_id: u64, local_ip: u8, remote: TransportAddr) -> ClusterInfo {
        ClusterInfo::new(
            remote_id,
            ClusterRole::Prompt,
            TransportAddr::new(Ipv4Addr::new(10, 0, 0, local_ip), 0),
            remote,
        )
    }

    #[test]
    fn test_batch_over_limit() {
        let fabric = LoopbackFabric::new();
        let (handler, _) = node(&fabric, 2);
        let remote = TransportAddr::new(Ipv4Addr::new(10, 0, 1, 1), 9000);
        let clusters = (0..17).map(|i| cluster(i, 2, remote)).collect();
        let results = handler.handle(&LinkBatchRequest::new(LinkOperator::Link, 1000, clusters));
        assert_eq!(results, vec![StatusCode::ReqOverLimit; 17]);
    }

    #[test]
    fn test_unknown_operator() {
        let fabric = LoopbackFabric::new();
        let (handler, _) = node(&fabric, 2);
        let remote = TransportAddr::new(Ipv4Addr::new(10, 0, 1, 1), 9000);
        let mut req = LinkBatchRequest::new(LinkOperator::Link, 1000, vec![cluster(1, 2, remote)]);
        req.operator = 7;
        assert_eq!(handler.handle(&req), vec![StatusCode::ParamInvalid]);
    }

    #[test]
    fn test_link_without_listener_times_out() {
        let fabric = LoopbackFabric::new();
        let (handler, registry) = node(&fabric, 2);
        let remote = TransportAddr::new(Ipv4Addr::new(10, 0, 1, 9), 9000);
        let results = handler.handle(&LinkBatchRequest::new(
            LinkOperator::Link,
            20_000,
            vec![cluster(9, 2, remote)],
        ));
        assert_eq!(results, vec![StatusCode::Timeout]);
        assert_eq!(registry.client_count(), 0);
    }

    #[test]
    fn test_link_then_unlink() {
        let fabric = LoopbackFabric::new();
        let (_, prompt) = node(&fabric, 1);
        let addr = prompt.listen().unwrap();
        let (handler, decoder) = node(&fabric, 2);

        let link = LinkBatchRequest::new(LinkOperator::Link, 100_000, vec![cluster(1, 2, addr)]);
        assert_eq!(handler.handle(&link), vec![StatusCode::Success]);
        assert_eq!(handler.handle(&link), vec![StatusCode::AlreadyLinked]);
        prompt.run_for(Side::Prompt, 8);
        assert!(prompt.server(2).is_some());

        let unlink =
            LinkBatchRequest::new(LinkOperator::Unlink, 100_000, vec![cluster(1, 2, addr)]);
        assert_eq!(handler.handle(&unlink), vec![StatusCode::Success]);
        assert_eq!(decoder.client_count(), 0);
        assert_eq!(handler.handle(&unlink), vec![StatusCode::NotLink]);

        prompt.run_for(Side::Prompt, 8);
        assert!(prompt.server(2).is_none());
        assert_eq!(prompt.server_count(), 0);
    }

    #[test]
    fn test_duplicate_cluster_in_batch() {
        let fabric = LoopbackFabric::new();
        let (_, prompt) = node(&fabric, 1);
        let addr = prompt.listen().unwrap();
        let (handler, _) = node(&fabric, 2);

        let results = handler.handle(&LinkBatchRequest::new(
            LinkOperator::Link,
            100_000,
            vec![cluster(1, 2, addr), cluster(1, 2, addr)],
        ));
        assert_eq!(results, vec![StatusCode::Success, StatusCode::ParamInvalid]);
    }
}
