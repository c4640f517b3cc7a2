// SPDX-FileCopyrightText: Copyright (c) 2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! In-process transport.
//!
//! A [`LoopbackFabric`] is the shared "network": it owns every connection,
//! listener and in-flight request. Each [`LoopbackTransport`] endpoint is one
//! process' view of it and carries its own fault injection, so a test can make
//! only the decoder side see `Again` on sends, for example.
//!
//! Data is copied at `isend` time; completion of a request can be deferred
//! for a number of `test_some` calls to exercise the polling paths.

use std::collections::{HashMap, VecDeque};
use std::net::Ipv4Addr;
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;

use super::{
    Completion, ConnHandle, Envelope, MemHandle, MessageHandle, RequestHandle, SendBuffer,
    Transport, TransportAddr, TransportError,
};
use crate::cache::MemRegion;

const EPHEMERAL_PORT_BASE: u16 = 40000;

/// Status code reported when a receive buffer is smaller than the message.
pub const LOOPBACK_E_TRUNCATE: i32 = 7;

/// Transport calls that faults can be injected into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FaultOp {
    Connect,
    Accept,
    Isend,
    Improbe,
    Imrecv,
    TestSome,
    RegisterMemory,
}

impl FaultOp {
    fn name(self) -> &'static str {
        match self {
            FaultOp::Connect => "connect",
            FaultOp::Accept => "accept",
            FaultOp::Isend => "isend",
            FaultOp::Improbe => "improbe",
            FaultOp::Imrecv => "imrecv",
            FaultOp::TestSome => "test_some",
            FaultOp::RegisterMemory => "register_memory",
        }
    }
}

#[derive(Debug, Default)]
struct ConnState {
    local: Option<TransportAddr>,
    peer: Option<u64>,
    listening: bool,
    backlog_limit: usize,
    backlog: VecDeque<(u64, TransportAddr)>,
    inbox: VecDeque<Bytes>,
}

#[derive(Debug, Default)]
struct FabricState {
    next_id: u64,
    next_port: u16,
    conns: HashMap<u64, ConnState>,
    listeners: HashMap<TransportAddr, u64>,
    messages: HashMap<u64, Bytes>,
    // request id -> remaining test_some calls before completion, status
    requests: HashMap<u64, (u32, i32)>,
    memory: HashMap<u64, (u64, usize)>,
}

impl FabricState {
    fn next(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    fn conn(&mut self, conn: ConnHandle) -> Result<&mut ConnState, TransportError> {
        self.conns
            .get_mut(&conn.0)
            .ok_or(TransportError::InvalidHandle {
                kind: "connection",
                id: conn.0,
            })
    }

    fn drop_conn(&mut self, id: u64) {
        let Some(state) = self.conns.remove(&id) else {
            return;
        };
        if state.listening
            && let Some(addr) = state.local
        {
            self.listeners.remove(&addr);
        }
        for (pending, _) in state.backlog {
            self.conns.remove(&pending);
        }
    }
}

/// Shared in-process network.
#[derive(Debug, Default)]
pub struct LoopbackFabric {
    state: Mutex<FabricState>,
}

impl LoopbackFabric {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(FabricState {
                next_port: EPHEMERAL_PORT_BASE,
                ..Default::default()
            }),
        })
    }

    pub fn endpoint(self: &Arc<Self>) -> LoopbackTransport {
        LoopbackTransport {
            fabric: self.clone(),
            faults: Mutex::new(Faults::default()),
        }
    }

    pub fn open_connections(&self) -> usize {
        self.state.lock().conns.len()
    }

    pub fn in_flight(&self) -> usize {
        self.state.lock().requests.len()
    }
}

#[derive(Debug, Default)]
struct Faults {
    again: HashMap<FaultOp, u32>,
    fail: HashMap<FaultOp, i32>,
    defer: u32,
}

/// One endpoint on a [`LoopbackFabric`].
#[derive(Debug)]
pub struct LoopbackTransport {
    fabric: Arc<LoopbackFabric>,
    faults: Mutex<Faults>,
}

impl LoopbackTransport {
    pub fn fabric(&self) -> &Arc<LoopbackFabric> {
        &self.fabric
    }

    /// The next `count` calls of `op` return [`TransportError::Again`].
    pub fn inject_again(&self, op: FaultOp, count: u32) {
        self.faults.lock().again.insert(op, count);
    }

    /// The next call of `op` fails with `code`.
    pub fn inject_failure(&self, op: FaultOp, code: i32) {
        self.faults.lock().fail.insert(op, code);
    }

    /// Requests issued from now on complete after `polls` extra `test_some`
    /// calls.
    pub fn defer_completions(&self, polls: u32) {
        self.faults.lock().defer = polls;
    }

    pub fn clear_faults(&self) {
        *self.faults.lock() = Faults::default();
    }

    fn check_fault(&self, op: FaultOp) -> Result<(), TransportError> {
        let mut faults = self.faults.lock();
        if let Some(code) = faults.fail.remove(&op) {
            return Err(TransportError::Failed {
                op: op.name(),
                code,
            });
        }
        if let Some(count) = faults.again.get_mut(&op)
            && *count > 0
        {
            *count -= 1;
            return Err(TransportError::Again);
        }
        Ok(())
    }

    fn new_request(&self, state: &mut FabricState, status: i32) -> RequestHandle {
        let defer = self.faults.lock().defer;
        let id = state.next();
        state.requests.insert(id, (defer, status));
        RequestHandle(id)
    }

    fn take_message(
        state: &mut FabricState,
        envelope: Envelope,
    ) -> Result<Bytes, TransportError> {
        state
            .messages
            .remove(&envelope.message.0)
            .ok_or(TransportError::InvalidHandle {
                kind: "message",
                id: envelope.message.0,
            })
    }
}

impl Transport for LoopbackTransport {
    fn open(&self) -> Result<ConnHandle, TransportError> {
        let mut state = self.fabric.state.lock();
        let id = state.next();
        state.conns.insert(id, ConnState::default());
        Ok(ConnHandle(id))
    }

    fn close(&self, conn: ConnHandle) -> Result<(), TransportError> {
        let mut state = self.fabric.state.lock();
        state.conn(conn)?;
        state.drop_conn(conn.0);
        Ok(())
    }

    fn force_close(&self, conn: ConnHandle) -> Result<(), TransportError> {
        self.close(conn)
    }

    fn bind(
        &self,
        conn: ConnHandle,
        addr: TransportAddr,
    ) -> Result<TransportAddr, TransportError> {
        let mut state = self.fabric.state.lock();
        state.conn(conn)?;
        let mut addr = addr;
        if addr.port == 0 {
            state.next_port = state.next_port.wrapping_add(1).max(EPHEMERAL_PORT_BASE);
            addr.port = state.next_port;
        }
        state.conn(conn)?.local = Some(addr);
        Ok(addr)
    }

    fn listen(&self, conn: ConnHandle, backlog: u32) -> Result<(), TransportError> {
        let mut state = self.fabric.state.lock();
        let addr = state.conn(conn)?.local.ok_or(TransportError::Failed {
            op: "listen",
            code: -1,
        })?;
        if state.listeners.contains_key(&addr) {
            return Err(TransportError::Failed {
                op: "listen",
                code: -2,
            });
        }
        let entry = state.conn(conn)?;
        entry.listening = true;
        entry.backlog_limit = backlog.max(1) as usize;
        state.listeners.insert(addr, conn.0);
        Ok(())
    }

    fn connect(&self, conn: ConnHandle, addr: TransportAddr) -> Result<(), TransportError> {
        self.check_fault(FaultOp::Connect)?;
        let mut state = self.fabric.state.lock();
        let local = {
            let entry = state.conn(conn)?;
            if entry.peer.is_some() {
                return Ok(());
            }
            entry
                .local
                .unwrap_or(TransportAddr::new(Ipv4Addr::LOCALHOST, 0))
        };
        // peer not listening yet: keep retrying until the caller's timeout
        let Some(&listener) = state.listeners.get(&addr) else {
            return Err(TransportError::Again);
        };
        let full = state
            .conns
            .get(&listener)
            .is_none_or(|l| l.backlog.len() >= l.backlog_limit);
        if full {
            return Err(TransportError::Again);
        }
        let server_id = state.next();
        state.conns.insert(
            server_id,
            ConnState {
                local: Some(addr),
                peer: Some(conn.0),
                ..Default::default()
            },
        );
        state.conn(conn)?.peer = Some(server_id);
        if let Some(l) = state.conns.get_mut(&listener) {
            l.backlog.push_back((server_id, local));
        }
        Ok(())
    }

    fn accept(
        &self,
        listener: ConnHandle,
    ) -> Result<Option<(ConnHandle, TransportAddr)>, TransportError> {
        self.check_fault(FaultOp::Accept)?;
        let mut state = self.fabric.state.lock();
        let entry = state.conn(listener)?;
        if !entry.listening {
            return Err(TransportError::Failed {
                op: "accept",
                code: -1,
            });
        }
        Ok(entry
            .backlog
            .pop_front()
            .map(|(id, peer)| (ConnHandle(id), peer)))
    }

    fn isend(&self, conn: ConnHandle, buf: &SendBuffer) -> Result<RequestHandle, TransportError> {
        self.check_fault(FaultOp::Isend)?;
        let mut state = self.fabric.state.lock();
        let peer = state.conn(conn)?.peer.ok_or(TransportError::Failed {
            op: "isend",
            code: -1,
        })?;
        let data = buf.to_bytes();
        state
            .conns
            .get_mut(&peer)
            .ok_or(TransportError::Closed)?
            .inbox
            .push_back(data);
        Ok(self.new_request(&mut state, 0))
    }

    fn improbe(&self, conn: ConnHandle) -> Result<Option<Envelope>, TransportError> {
        self.check_fault(FaultOp::Improbe)?;
        let mut state = self.fabric.state.lock();
        let entry = state.conn(conn)?;
        let Some(peer) = entry.peer else {
            return Ok(None);
        };
        if let Some(data) = entry.inbox.pop_front() {
            let id = state.next();
            let count = data.len();
            state.messages.insert(id, data);
            return Ok(Some(Envelope {
                message: MessageHandle(id),
                count,
            }));
        }
        if !state.conns.contains_key(&peer) {
            return Err(TransportError::Closed);
        }
        Ok(None)
    }

    fn imrecv(&self, envelope: Envelope, dst: &MemRegion) -> Result<RequestHandle, TransportError> {
        self.imrecv_scatter(envelope, std::slice::from_ref(dst))
    }

    fn imrecv_scatter(
        &self,
        envelope: Envelope,
        dsts: &[MemRegion],
    ) -> Result<RequestHandle, TransportError> {
        self.check_fault(FaultOp::Imrecv)?;
        let mut state = self.fabric.state.lock();
        let data = Self::take_message(&mut state, envelope)?;
        let capacity: usize = dsts.iter().map(MemRegion::len).sum();
        if data.len() > capacity {
            return Ok(self.new_request(&mut state, LOOPBACK_E_TRUNCATE));
        }
        let mut cursor = 0;
        for dst in dsts {
            if cursor >= data.len() {
                break;
            }
            let n = dst.len().min(data.len() - cursor);
            dst.write(&data[cursor..cursor + n])
                .map_err(|_| TransportError::Failed {
                    op: "imrecv",
                    code: LOOPBACK_E_TRUNCATE,
                })?;
            cursor += n;
        }
        Ok(self.new_request(&mut state, 0))
    }

    fn test_some(&self, requests: &[RequestHandle]) -> Result<Vec<Completion>, TransportError> {
        self.check_fault(FaultOp::TestSome)?;
        let mut state = self.fabric.state.lock();
        let mut done = Vec::new();
        for (index, request) in requests.iter().enumerate() {
            let (remaining, status) =
                state
                    .requests
                    .get_mut(&request.0)
                    .ok_or(TransportError::InvalidHandle {
                        kind: "request",
                        id: request.0,
                    })?;
            if *remaining > 0 {
                *remaining -= 1;
                continue;
            }
            done.push(Completion {
                index,
                error: *status,
            });
            state.requests.remove(&request.0);
        }
        Ok(done)
    }

    fn register_memory(&self, addr: u64, len: usize) -> Result<MemHandle, TransportError> {
        self.check_fault(FaultOp::RegisterMemory)?;
        let mut state = self.fabric.state.lock();
        let id = state.next();
        state.memory.insert(id, (addr, len));
        Ok(MemHandle(id))
    }

    fn unregister_memory(&self, handle: MemHandle) -> Result<(), TransportError> {
        self.fabric
            .state
            .lock()
            .memory
            .remove(&handle.0)
            .map(|_| ())
            .ok_or(TransportError::InvalidHandle {
                kind: "memory",
                id: handle.0,
            })
    }
}
