// SPDX-FileCopyrightText: Copyright (c) 2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Entity registry and the per-side polling sweeps.
//!
//! The prompt side accepts connections and steps server entities; the
//! decoder side steps the client entities created by link requests. A sweep
//! never blocks: entities claimed by a caller, or whose lock is held, are
//! skipped until the next sweep.

use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use parking_lot::Mutex;

use crate::context::CommContext;
use crate::entity::{CommEntity, EntityHandle, StateId};
use crate::status::{LlmError, Result};
use crate::transport::{ConnHandle, Connection, TransportAddr, TransportError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Side {
    Prompt,
    Decoder,
}

#[derive(Default)]
struct Maps {
    servers: HashMap<ConnHandle, Arc<EntityHandle>>,
    server_by_ip: HashMap<Ipv4Addr, ConnHandle>,
    server_by_cluster: HashMap<u64, ConnHandle>,
    clients: HashMap<u64, Arc<EntityHandle>>,
    // accepted while the entity to rebind was locked by a caller
    pending_rebind: Vec<(Connection, TransportAddr)>,
}

pub struct EntityRegistry {
    ctx: Arc<CommContext>,
    maps: Mutex<Maps>,
    mutating: AtomicBool,
    server_count: AtomicUsize,
    client_count: AtomicUsize,
    listener: Mutex<Option<Connection>>,
}

impl EntityRegistry {
    pub fn new(ctx: Arc<CommContext>) -> Arc<Self> {
        Arc::new(Self {
            ctx,
            maps: Mutex::new(Maps::default()),
            mutating: AtomicBool::new(false),
            server_count: AtomicUsize::new(0),
            client_count: AtomicUsize::new(0),
            listener: Mutex::new(None),
        })
    }

    pub fn context(&self) -> &Arc<CommContext> {
        &self.ctx
    }

    fn mutate<R>(&self, f: impl FnOnce(&mut Maps) -> R) -> R {
        let mut maps = self.maps.lock();
        self.mutating.store(true, Ordering::Release);
        let result = f(&mut maps);
        self.server_count.store(maps.servers.len(), Ordering::Release);
        self.client_count.store(maps.clients.len(), Ordering::Release);
        self.mutating.store(false, Ordering::Release);
        result
    }

    pub fn server_count(&self) -> usize {
        if self.mutating.load(Ordering::Acquire) {
            return self.maps.lock().servers.len();
        }
        self.server_count.load(Ordering::Acquire)
    }

    pub fn client_count(&self) -> usize {
        if self.mutating.load(Ordering::Acquire) {
            return self.maps.lock().clients.len();
        }
        self.client_count.load(Ordering::Acquire)
    }

    pub fn link_count(&self) -> usize {
        self.server_count() + self.client_count()
    }

    /// Opens the prompt listener on the configured address. Returns the
    /// bound address, which differs from the configured one when the port
    /// was 0.
    pub fn listen(&self) -> Result<TransportAddr> {
        let mut listener = self.listener.lock();
        if listener.is_some() {
            return Err(LlmError::param("registry is already listening"));
        }
        let transport = self.ctx.transport().clone();
        let conn = Connection::open(transport.clone())?;
        let addr = transport.bind(conn.handle(), self.ctx.config().listen_addr())?;
        transport.listen(conn.handle(), self.ctx.config().link.backlog)?;
        tracing::info!(%addr, cluster_id = self.ctx.cluster_id(), "listening for decoder links");
        *listener = Some(conn);
        Ok(addr)
    }

    pub fn close_listener(&self) {
        if let Some(mut conn) = self.listener.lock().take()
            && let Err(e) = conn.close()
        {
            tracing::warn!(error = %e, "failed to close listener");
        }
    }

    pub fn client(&self, cluster_id: u64) -> Option<Arc<EntityHandle>> {
        self.maps.lock().clients.get(&cluster_id).cloned()
    }

    pub fn server(&self, cluster_id: u64) -> Option<Arc<EntityHandle>> {
        let maps = self.maps.lock();
        let conn = maps.server_by_cluster.get(&cluster_id)?;
        maps.servers.get(conn).cloned()
    }

    pub fn server_by_ip(&self, ip: Ipv4Addr) -> Option<Arc<EntityHandle>> {
        let maps = self.maps.lock();
        let conn = maps.server_by_ip.get(&ip)?;
        maps.servers.get(conn).cloned()
    }

    pub fn servers(&self) -> Vec<Arc<EntityHandle>> {
        self.maps.lock().servers.values().cloned().collect()
    }

    pub fn clients(&self) -> Vec<(u64, Arc<EntityHandle>)> {
        self.maps
            .lock()
            .clients
            .iter()
            .map(|(id, handle)| (*id, handle.clone()))
            .collect()
    }

    /// Registers the client entity of a freshly linked cluster.
    pub fn add_client(&self, entity: CommEntity) -> Result<Arc<EntityHandle>> {
        let cluster_id = entity
            .remote_cluster_id()
            .ok_or_else(|| LlmError::Internal("client entity without cluster id".into()))?;
        let max_links = self.ctx.config().link.max_links;
        self.mutate(|maps| {
            if maps.clients.contains_key(&cluster_id) {
                return Err(LlmError::AlreadyLinked(cluster_id));
            }
            if maps.clients.len() >= max_links {
                return Err(LlmError::ReqOverLimit(format!(
                    "{max_links} clusters already linked"
                )));
            }
            let handle = EntityHandle::new(entity);
            maps.clients.insert(cluster_id, handle.clone());
            Ok(handle)
        })
    }

    /// Drops the client entry of `cluster_id` if it still refers to `handle`.
    pub fn remove_client(&self, cluster_id: u64, handle: &Arc<EntityHandle>) -> bool {
        self.mutate(|maps| {
            if maps
                .clients
                .get(&cluster_id)
                .is_some_and(|current| Arc::ptr_eq(current, handle))
            {
                maps.clients.remove(&cluster_id);
                return true;
            }
            false
        })
    }

    /// Drops a server entity from every index.
    pub fn remove_server(&self, handle: &Arc<EntityHandle>) -> bool {
        self.mutate(|maps| {
            let Some(conn) = maps
                .servers
                .iter()
                .find(|(_, h)| Arc::ptr_eq(h, handle))
                .map(|(conn, _)| *conn)
            else {
                return false;
            };
            Self::erase_server(maps, conn);
            true
        })
    }

    fn erase_server(maps: &mut Maps, conn: ConnHandle) {
        maps.servers.remove(&conn);
        maps.server_by_ip.retain(|_, c| *c != conn);
        maps.server_by_cluster.retain(|_, c| *c != conn);
    }

    // ----- prompt side -----

    fn accept_pending(&self) -> usize {
        let transport = self.ctx.transport().clone();
        let mut accepted = Vec::new();
        {
            let listener = self.listener.lock();
            let Some(listener) = listener.as_ref() else {
                return 0;
            };
            loop {
                match transport.accept(listener.handle()) {
                    Ok(Some((handle, peer))) => {
                        accepted.push((Connection::from_handle(transport.clone(), handle), peer))
                    }
                    Ok(None) | Err(TransportError::Again) => break,
                    Err(e) => {
                        tracing::warn!(error = %e, "accept failed");
                        break;
                    }
                }
            }
        }

        let count = accepted.len();
        for (conn, peer) in accepted {
            self.admit(conn, peer);
        }
        count
    }

    fn admit(&self, conn: Connection, peer: TransportAddr) {
        if let Some(handle) = self.server_by_ip(peer.ip) {
            let Some(mut entity) = handle.try_lock() else {
                self.maps.lock().pending_rebind.push((conn, peer));
                return;
            };
            let old = entity.connection().handle();
            entity.rebind(conn, peer);
            let new = entity.connection().handle();
            drop(entity);
            self.mutate(|maps| {
                if let Some(h) = maps.servers.remove(&old) {
                    maps.servers.insert(new, h);
                }
                maps.server_by_ip.insert(peer.ip, new);
                // the cluster id is mapped again once the new handshake lands
                maps.server_by_cluster.retain(|_, c| *c != old);
            });
            return;
        }

        let max_links = self.ctx.config().link.max_links;
        if self.server_count() >= max_links {
            tracing::warn!(%peer, max_links, "refusing connection, link ceiling reached");
            return;
        }
        let handle = conn.handle();
        tracing::debug!(%peer, conn = ?handle, "accepted connection");
        let entity = EntityHandle::new(CommEntity::server(self.ctx.clone(), conn, peer));
        self.mutate(|maps| {
            maps.servers.insert(handle, entity);
            maps.server_by_ip.insert(peer.ip, handle);
        });
    }

    fn retry_rebinds(&self) -> usize {
        let pending = std::mem::take(&mut self.maps.lock().pending_rebind);
        let count = pending.len();
        for (conn, peer) in pending {
            self.admit(conn, peer);
        }
        count
    }

    /// One prompt sweep: accept, then step every idle server entity once.
    /// Returns the amount of progress made.
    pub fn poll_prompt(&self) -> usize {
        let mut progress = self.accept_pending() + self.retry_rebinds();

        let snapshot: Vec<(ConnHandle, Arc<EntityHandle>)> = self
            .maps
            .lock()
            .servers
            .iter()
            .map(|(conn, handle)| (*conn, handle.clone()))
            .collect();

        let mut established = Vec::new();
        let mut destroyed = Vec::new();
        for (conn, handle) in snapshot {
            if handle.is_in_use() {
                continue;
            }
            let Some(mut entity) = handle.try_lock() else {
                continue;
            };
            if entity.state() == StateId::Error {
                continue;
            }
            let result = entity.step();
            if result.progressed {
                progress += 1;
            }
            if result.established
                && let Some(cluster_id) = entity.remote_cluster_id()
            {
                established.push((cluster_id, entity.connection().handle()));
            }
            if result.state == StateId::Destroy {
                destroyed.push(conn);
            }
        }

        if !established.is_empty() || !destroyed.is_empty() {
            self.mutate(|maps| {
                for (cluster_id, conn) in established {
                    maps.server_by_cluster.retain(|_, c| *c != conn);
                    maps.server_by_cluster.insert(cluster_id, conn);
                }
                for conn in destroyed {
                    tracing::debug!(?conn, "erasing destroyed server entity");
                    Self::erase_server(maps, conn);
                }
            });
        }
        progress
    }

    // ----- decoder side -----

    /// One decoder sweep over the client entities not claimed by a caller
    /// and not being unlinked.
    pub fn poll_decoder(&self) -> usize {
        let mut progress = 0;
        let mut destroyed = Vec::new();
        for (cluster_id, handle) in self.clients() {
            if handle.is_in_use() || handle.is_unlinking() {
                continue;
            }
            let Some(mut entity) = handle.try_lock() else {
                continue;
            };
            if entity.state() == StateId::Error {
                continue;
            }
            let result = entity.step();
            if result.progressed {
                progress += 1;
            }
            if result.state == StateId::Destroy {
                drop(entity);
                destroyed.push((cluster_id, handle));
            }
        }
        for (cluster_id, handle) in destroyed {
            self.remove_client(cluster_id, &handle);
        }
        progress
    }

    pub fn poll(&self, side: Side) -> usize {
        match side {
            Side::Prompt => self.poll_prompt(),
            Side::Decoder => self.poll_decoder(),
        }
    }

    /// Runs up to `budget` sweeps, stopping early once a sweep makes no
    /// progress.
    pub fn run_for(&self, side: Side, budget: usize) -> usize {
        let mut total = 0;
        for _ in 0..budget {
            let progress = self.poll(side);
            if progress == 0 {
                break;
            }
            total += progress;
        }
        total
    }
}

impl std::fmt::Debug for EntityRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EntityRegistry")
            .field("servers", &self.server_count())
            .field("clients", &self.client_count())
            .finish()
    }
}
