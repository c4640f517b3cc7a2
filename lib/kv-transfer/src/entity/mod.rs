// SPDX-FileCopyrightText: Copyright (c) 2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Per-connection protocol entity.
//!
//! A [`CommEntity`] owns one [`Connection`] and drives it through a small
//! poll-based state machine. The registry calls [`CommEntity::step`] once per
//! sweep; every state either finishes its work, or returns
//! [`Transition::Keep`] to be re-invoked on the next sweep. Nothing here
//! blocks: waiting only happens in the caller-driven operations (pull,
//! transfer, check, unlink notification), which spin on the transport until
//! their [`Deadline`] expires.
//!
//! Server entities live on the prompt side and are created on accept. Client
//! entities live on the decoder side and are created after a successful link
//! handshake.

mod pull;
mod push;
mod states;

pub use states::StateId;

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use bytes::Bytes;
use parking_lot::{Mutex, MutexGuard};

use crate::cache::{HostBuffer, KvKey, MemRegion};
use crate::context::CommContext;
use crate::protocol::{CHECK_LINK_TOKEN_SIZE, INVALID_PREFIX_ID, SyncKvRequest};
use crate::stats::EntityStats;
use crate::status::{LlmError, Result, StatusCode};
use crate::timing::Deadline;
use crate::transport::{
    Connection, Envelope, RequestSet, SendBuffer, TransportAddr, TransportError,
};

/// Entries kept in the transition history.
const HISTORY_LEN: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    /// Prompt side, accepted connection.
    Server,
    /// Decoder side, connection opened by a link request.
    Client,
}

/// Outcome of one state invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// Re-invoke the same state on the next sweep.
    Keep,
    To(StateId),
    /// Handshake received; the peer cluster id is now known.
    EstablishLink,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StepResult {
    pub state: StateId,
    pub established: bool,
    pub progressed: bool,
}

/// Request a single operation is working on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RequestScope {
    pub req_id: u64,
    pub prefix_id: u64,
    pub model_id: u64,
}

impl RequestScope {
    pub fn new(req_id: u64, prefix_id: u64, model_id: u64) -> Self {
        Self {
            req_id,
            prefix_id,
            model_id,
        }
    }

    pub fn request_key(&self) -> KvKey {
        KvKey::request(self.req_id, self.model_id)
    }

    pub fn prefix_key(&self) -> Option<KvKey> {
        (self.prefix_id != INVALID_PREFIX_ID).then(|| KvKey::prefix(self.prefix_id, self.model_id))
    }
}

/// What to unpublish once a pull has been served.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Release {
    Index(KvKey),
    Store(KvKey),
}

/// Per-operation working set, reset whenever the entity goes back to Idle.
#[derive(Debug, Default)]
pub(crate) struct Scratch {
    envelope: Option<Envelope>,
    staging: Option<Arc<HostBuffer>>,
    recvs: RequestSet,
    sends: RequestSet,
    queue: VecDeque<SendBuffer>,
    sync_req: Option<SyncKvRequest>,
    rejected: Option<StatusCode>,
    prepared: bool,
    reply: Option<StatusCode>,
    dests: Vec<MemRegion>,
    cursor: usize,
    filled: usize,
    release: Option<Release>,
}

pub struct CommEntity {
    ctx: Arc<CommContext>,
    role: Role,
    conn: Connection,
    state: StateId,
    local_cluster_id: u64,
    remote_cluster_id: Option<u64>,
    peer_addr: TransportAddr,
    /// Chunk size the linked decoder splits pull replies on.
    peer_pull_chunk: Option<u64>,
    occupied: bool,
    scope: RequestScope,
    op_start: Option<Instant>,
    stats: EntityStats,
    last_dump: Instant,
    error_dumped: bool,
    history: VecDeque<StateId>,
    scratch: Scratch,
}

impl CommEntity {
    fn new(
        ctx: Arc<CommContext>,
        role: Role,
        conn: Connection,
        peer_addr: TransportAddr,
        remote_cluster_id: Option<u64>,
    ) -> Self {
        let stats = EntityStats::new(ctx.config().stats.ignore_first);
        let local_cluster_id = ctx.cluster_id();
        let mut entity = Self {
            ctx,
            role,
            conn,
            state: StateId::Init,
            local_cluster_id,
            remote_cluster_id,
            peer_addr,
            peer_pull_chunk: None,
            occupied: false,
            scope: RequestScope::default(),
            op_start: None,
            stats,
            last_dump: Instant::now(),
            error_dumped: false,
            history: VecDeque::with_capacity(HISTORY_LEN),
            scratch: Scratch::default(),
        };
        entity.record(StateId::Init);
        entity
    }

    /// Entity for a connection accepted by the prompt listener.
    pub fn server(ctx: Arc<CommContext>, conn: Connection, peer_addr: TransportAddr) -> Self {
        Self::new(ctx, Role::Server, conn, peer_addr, None)
    }

    /// Entity for a connection that completed the link handshake.
    pub fn client(
        ctx: Arc<CommContext>,
        conn: Connection,
        peer_addr: TransportAddr,
        remote_cluster_id: u64,
    ) -> Self {
        Self::new(ctx, Role::Client, conn, peer_addr, Some(remote_cluster_id))
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn state(&self) -> StateId {
        self.state
    }

    pub fn local_cluster_id(&self) -> u64 {
        self.local_cluster_id
    }

    pub fn remote_cluster_id(&self) -> Option<u64> {
        self.remote_cluster_id
    }

    pub fn peer_addr(&self) -> TransportAddr {
        self.peer_addr
    }

    pub fn is_occupied(&self) -> bool {
        self.occupied
    }

    pub fn stats(&self) -> &EntityStats {
        &self.stats
    }

    pub fn history(&self) -> Vec<StateId> {
        self.history.iter().copied().collect()
    }

    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    /// No operation is in flight, so a caller may drive the connection.
    pub fn is_quiescent(&self) -> bool {
        !self.occupied && matches!(self.state, StateId::Init | StateId::Idle | StateId::Probe)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self.state, StateId::Error | StateId::Destroy)
    }

    /// Runs the current state once.
    pub fn step(&mut self) -> StepResult {
        let from = self.state;
        let transition = match states::process(from, self) {
            Ok(transition) => transition,
            Err(err) => self.on_failure(from, err),
        };
        let (next, established) = match transition {
            Transition::Keep => (None, false),
            Transition::To(next) => (Some(next), false),
            Transition::EstablishLink => (Some(StateId::Idle), true),
        };
        if let Some(next) = next {
            self.enter(next);
        }
        StepResult {
            state: self.state,
            established,
            progressed: next.is_some(),
        }
    }

    /// Restarts a server entity on a fresh connection from the same peer.
    pub fn rebind(&mut self, conn: Connection, peer_addr: TransportAddr) {
        tracing::info!(
            old = ?self.conn.handle(),
            new = ?conn.handle(),
            %peer_addr,
            "peer reconnected, rebinding server entity"
        );
        self.conn = conn;
        self.peer_addr = peer_addr;
        self.reset_scratch();
        self.error_dumped = false;
        self.enter(StateId::Link);
    }

    fn on_failure(&mut self, from: StateId, err: LlmError) -> Transition {
        tracing::error!(
            role = ?self.role,
            state = ?from,
            remote = ?self.remote_cluster_id,
            error = %err,
            "entity step failed"
        );
        if err.is_fatal_for_connection() {
            self.conn.force_close();
        }
        match from {
            StateId::Unlink => {
                self.stats.unlink_failed += 1;
                self.conn.force_close();
                Transition::To(StateId::Destroy)
            }
            StateId::Error | StateId::Destroy => Transition::Keep,
            _ => Transition::To(StateId::Error),
        }
    }

    fn enter(&mut self, next: StateId) {
        if next == self.state && next != StateId::Link {
            return;
        }
        tracing::debug!(role = ?self.role, from = ?self.state, to = ?next, "state transition");
        self.state = next;
        self.record(next);
    }

    fn record(&mut self, state: StateId) {
        if self.history.len() == HISTORY_LEN {
            self.history.pop_front();
        }
        self.history.push_back(state);
    }

    /// Moves the entity to Error from a caller-driven operation.
    fn fail_connection(&mut self, err: &LlmError) {
        tracing::error!(
            role = ?self.role,
            remote = ?self.remote_cluster_id,
            error = %err,
            "connection failed during operation"
        );
        self.conn.force_close();
        self.reset_scratch();
        self.enter(StateId::Error);
    }

    fn reset_scratch(&mut self) {
        self.scratch = Scratch::default();
        self.occupied = false;
        self.op_start = None;
    }

    fn maybe_dump_stats(&mut self) {
        let Some(interval) = self.ctx.config().stats_dump_interval() else {
            return;
        };
        if self.last_dump.elapsed() < interval {
            return;
        }
        self.last_dump = Instant::now();
        self.dump_stats();
    }

    pub fn dump_stats(&self) {
        match serde_json::to_string(&self.stats) {
            Ok(json) => tracing::info!(
                role = ?self.role,
                remote = ?self.remote_cluster_id,
                "entity stats: {json}"
            ),
            Err(e) => tracing::warn!(error = %e, "failed to serialize entity stats"),
        }
    }

    fn dump_diagnostics(&mut self) {
        if self.error_dumped {
            return;
        }
        self.error_dumped = true;
        let stats = serde_json::to_string(&self.stats).unwrap_or_default();
        tracing::error!(
            role = ?self.role,
            local = self.local_cluster_id,
            remote = ?self.remote_cluster_id,
            peer = %self.peer_addr,
            history = ?self.history,
            scope = ?self.scope,
            "entity in error state, stats: {stats}"
        );
    }

    // ----- non-blocking helpers used by the states -----

    /// Returns the pending envelope, probing for a new one if needed.
    fn probe(&mut self) -> Result<Option<Envelope>> {
        if let Some(envelope) = self.scratch.envelope {
            return Ok(Some(envelope));
        }
        match self.conn.transport().improbe(self.conn.handle()) {
            Ok(Some(envelope)) => {
                self.stats.probe_hits += 1;
                self.scratch.envelope = Some(envelope);
                Ok(Some(envelope))
            }
            Ok(None) => Ok(None),
            Err(TransportError::Again) => {
                self.stats.again_count += 1;
                Ok(None)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Receives the probed message into a staging buffer of its size. `None`
    /// while the receive is still in flight.
    fn receive_probed(&mut self) -> Result<Option<Bytes>> {
        if self.scratch.staging.is_none() {
            let envelope = self
                .scratch
                .envelope
                .ok_or_else(|| LlmError::Internal("receive without a probed message".into()))?;
            let count = self.conn.transport().get_count(&envelope);
            let staging = HostBuffer::zeroed(count)?;
            match self.scratch.recvs.imrecv(
                self.conn.transport().as_ref(),
                envelope,
                MemRegion::whole(staging.clone()),
            ) {
                Ok(()) => {
                    self.stats.recv_requests += 1;
                    self.scratch.staging = Some(staging);
                }
                Err(TransportError::Again) => {
                    self.stats.again_count += 1;
                    return Ok(None);
                }
                Err(e) => return Err(e.into()),
            }
        }
        self.poll_recvs()?;
        if !self.scratch.recvs.is_empty() {
            return Ok(None);
        }
        Ok(self
            .scratch
            .staging
            .as_ref()
            .map(|staging| Bytes::from(staging.to_vec())))
    }

    fn poll_recvs(&mut self) -> Result<()> {
        let bytes = self.scratch.recvs.poll(self.conn.transport().as_ref())?;
        self.stats.recv_bytes += bytes as u64;
        Ok(())
    }

    fn poll_sends(&mut self) -> Result<()> {
        let bytes = self.scratch.sends.poll(self.conn.transport().as_ref())?;
        self.stats.send_bytes += bytes as u64;
        Ok(())
    }

    /// Issues queued sends until the queue is empty or the transport pushes
    /// back.
    fn flush_queue(&mut self) -> Result<()> {
        while let Some(buf) = self.scratch.queue.pop_front() {
            match self.scratch.sends.isend(
                self.conn.transport().as_ref(),
                self.conn.handle(),
                buf.clone(),
            ) {
                Ok(()) => self.stats.send_requests += 1,
                Err(TransportError::Again) => {
                    self.stats.again_count += 1;
                    self.scratch.queue.push_front(buf);
                    break;
                }
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    fn sends_done(&self) -> bool {
        self.scratch.queue.is_empty() && self.scratch.sends.is_empty()
    }

    // ----- caller-driven helpers, spin until done or the deadline expires -----

    fn send_blocking(&mut self, buf: SendBuffer, deadline: &mut Deadline) -> Result<()> {
        self.scratch.queue.push_back(buf);
        self.drain_sends(deadline)
    }

    fn drain_sends(&mut self, deadline: &mut Deadline) -> Result<()> {
        loop {
            self.flush_queue()?;
            self.poll_sends()?;
            if self.sends_done() {
                return Ok(());
            }
            deadline.poll()?;
            std::thread::yield_now();
        }
    }

    fn recv_blocking(&mut self, deadline: &mut Deadline) -> Result<Bytes> {
        loop {
            if self.probe()?.is_some()
                && let Some(data) = self.receive_probed()?
            {
                self.scratch.envelope = None;
                self.scratch.staging = None;
                return Ok(data);
            }
            deadline.poll()?;
            std::thread::yield_now();
        }
    }

    /// Sends the one-byte liveness token and waits for it to complete.
    pub fn check_link(&mut self, timeout_us: u64) -> Result<()> {
        if self.is_terminal() || !self.conn.is_open() {
            return Err(LlmError::NotLink(self.remote_cluster_id.unwrap_or_default()));
        }
        let mut deadline = self.ctx.link_deadline(timeout_us);
        let token = Bytes::from_static(&[1u8; CHECK_LINK_TOKEN_SIZE]);
        let result = self.send_blocking(token.into(), &mut deadline);
        if let Err(err) = &result {
            self.fail_connection(err);
        }
        result
    }

    /// Tells the prompt this client is going away.
    pub fn notify_unlink(&mut self, deadline: &mut Deadline) -> Result<()> {
        let result = self.send_blocking(SendBuffer::Bytes(Bytes::new()), deadline);
        self.reset_scratch();
        result.map_err(|e| {
            tracing::warn!(
                remote = ?self.remote_cluster_id,
                error = %e,
                "unlink notification failed"
            );
            LlmError::UnlinkFailed {
                cluster_id: self.remote_cluster_id.unwrap_or_default(),
                reason: e.to_string(),
            }
        })
    }

    /// Closes the connection and marks the entity for removal.
    pub fn teardown(&mut self, force: bool) {
        if force {
            self.conn.force_close();
        } else if let Err(e) = self.conn.close() {
            tracing::warn!(remote = ?self.remote_cluster_id, error = %e, "close failed");
        }
        self.reset_scratch();
        self.stats.unlink_ok += 1;
        self.enter(StateId::Destroy);
    }
}

impl std::fmt::Debug for CommEntity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommEntity")
            .field("role", &self.role)
            .field("state", &self.state)
            .field("remote_cluster_id", &self.remote_cluster_id)
            .field("peer_addr", &self.peer_addr)
            .field("conn", &self.conn)
            .finish()
    }
}

/// Registry slot of one entity.
///
/// The entity mutex serialises the registry sweep against caller-driven
/// operations; `in_use` marks a caller claim and `unlinking` a pending
/// unlink. Lock order is entity mutex first, then the unlink flag.
#[derive(Debug)]
pub struct EntityHandle {
    entity: Mutex<CommEntity>,
    in_use: AtomicBool,
    unlinking: AtomicBool,
}

impl EntityHandle {
    pub fn new(entity: CommEntity) -> Arc<Self> {
        Arc::new(Self {
            entity: Mutex::new(entity),
            in_use: AtomicBool::new(false),
            unlinking: AtomicBool::new(false),
        })
    }

    pub fn is_in_use(&self) -> bool {
        self.in_use.load(Ordering::Acquire)
    }

    pub fn is_unlinking(&self) -> bool {
        self.unlinking.load(Ordering::Acquire)
    }

    /// Used by the registry sweep; never blocks.
    pub fn try_lock(&self) -> Option<MutexGuard<'_, CommEntity>> {
        self.entity.try_lock()
    }

    pub fn lock(&self) -> MutexGuard<'_, CommEntity> {
        self.entity.lock()
    }

    /// Claims the entity for one caller operation. Fails with `LinkBusy` when
    /// another caller holds it or the entity is in the middle of an exchange.
    pub fn claim(&self) -> Result<EntityClaim<'_>> {
        if self
            .in_use
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            let cluster_id = self
                .entity
                .try_lock()
                .and_then(|guard| guard.remote_cluster_id)
                .unwrap_or_default();
            return Err(LlmError::LinkBusy(cluster_id));
        }
        let guard = self.entity.lock();
        if guard.is_terminal() {
            let cluster_id = guard.remote_cluster_id.unwrap_or_default();
            drop(guard);
            self.in_use.store(false, Ordering::Release);
            return Err(LlmError::NotLink(cluster_id));
        }
        if !guard.is_quiescent() || self.is_unlinking() {
            let cluster_id = guard.remote_cluster_id.unwrap_or_default();
            drop(guard);
            self.in_use.store(false, Ordering::Release);
            return Err(LlmError::LinkBusy(cluster_id));
        }
        Ok(EntityClaim {
            guard,
            in_use: &self.in_use,
        })
    }

    /// Marks the entity as being unlinked; `false` if it already was.
    pub fn begin_unlink(&self) -> bool {
        self.unlinking
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub fn end_unlink(&self) {
        self.unlinking.store(false, Ordering::Release);
    }
}

/// Exclusive access for one caller operation; releases the claim on drop.
pub struct EntityClaim<'a> {
    guard: MutexGuard<'a, CommEntity>,
    in_use: &'a AtomicBool,
}

impl std::ops::Deref for EntityClaim<'_> {
    type Target = CommEntity;

    fn deref(&self) -> &Self::Target {
        &self.guard
    }
}

impl std::ops::DerefMut for EntityClaim<'_> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.guard
    }
}

impl std::fmt::Debug for EntityClaim<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EntityClaim")
            .field("entity", &*self.guard)
            .finish()
    }
}

impl Drop for EntityClaim<'_> {
    fn drop(&mut self) {
        self.in_use.store(false, Ordering::Release);
    }
}

/// Splits `len` bytes into sends of at most `max` bytes.
///
/// With `terminated` every slot ends with a message shorter than `max`
/// (possibly empty), so a receiver that does not know the slot size can tell
/// where it ends. Without it the receiver is expected to know the size.
pub(crate) fn chunk_ranges(len: u64, max: u64, terminated: bool) -> Vec<(u64, u64)> {
    let max = max.max(1);
    let mut ranges = Vec::new();
    let mut offset = 0;
    while len - offset >= max {
        ranges.push((offset, max));
        offset += max;
    }
    if terminated || offset < len {
        ranges.push((offset, len - offset));
    }
    ranges
}

pub(crate) fn chunk_buffer(
    buf: SendBuffer,
    max: u64,
    terminated: bool,
) -> Result<Vec<SendBuffer>> {
    chunk_ranges(buf.len() as u64, max, terminated)
        .into_iter()
        .map(|(offset, size)| {
            let (offset, size) = (offset as usize, size as usize);
            Ok(match &buf {
                SendBuffer::Bytes(b) => SendBuffer::Bytes(b.slice(offset..offset + size)),
                SendBuffer::Region(r) => SendBuffer::Region(r.slice(offset, size)?),
            })
        })
        .collect()
}
