// SPDX-FileCopyrightText: Copyright (c) 2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Point-to-point transport primitives.
//!
//! Everything is non-blocking: `connect` and the data calls report
//! [`TransportError::Again`] on back-pressure, `accept`/`improbe` return
//! `None` when nothing is pending, and completion is observed with
//! [`Transport::test_some`].

mod loopback;

#[cfg(feature = "hccl")]
mod hccl;

pub use loopback::{FaultOp, LoopbackFabric, LoopbackTransport};

#[cfg(feature = "hccl")]
pub use hccl::HcclTransport;

use std::fmt;
use std::net::Ipv4Addr;
use std::sync::Arc;

use bytes::Bytes;

use crate::cache::MemRegion;

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("resource temporarily unavailable")]
    Again,

    #[error("{op} failed with code {code}")]
    Failed { op: &'static str, code: i32 },

    #[error("unknown {kind} handle {id}")]
    InvalidHandle { kind: &'static str, id: u64 },

    #[error("connection closed by peer")]
    Closed,

    #[error("transport unavailable: {0}")]
    Unavailable(String),
}

impl TransportError {
    pub fn is_again(&self) -> bool {
        matches!(self, TransportError::Again)
    }
}

/// IPv4 endpoint of a transport connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TransportAddr {
    pub ip: Ipv4Addr,
    pub port: u16,
}

impl TransportAddr {
    pub fn new(ip: Ipv4Addr, port: u16) -> Self {
        Self { ip, port }
    }
}

impl fmt::Display for TransportAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.ip, self.port)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnHandle(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RequestHandle(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MessageHandle(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MemHandle(pub u64);

/// A matched message that has been probed but not yet received.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Envelope {
    pub message: MessageHandle,
    pub count: usize,
}

/// One finished request reported by [`Transport::test_some`]. `index` points
/// into the slice that was tested; `error` is the vendor status (0 = ok).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Completion {
    pub index: usize,
    pub error: i32,
}

/// Payload of an outgoing message.
#[derive(Debug, Clone)]
pub enum SendBuffer {
    Bytes(Bytes),
    Region(MemRegion),
}

impl SendBuffer {
    pub fn len(&self) -> usize {
        match self {
            SendBuffer::Bytes(b) => b.len(),
            SendBuffer::Region(r) => r.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn to_bytes(&self) -> Bytes {
        match self {
            SendBuffer::Bytes(b) => b.clone(),
            SendBuffer::Region(r) => r.read(),
        }
    }
}

impl From<Bytes> for SendBuffer {
    fn from(value: Bytes) -> Self {
        SendBuffer::Bytes(value)
    }
}

impl From<MemRegion> for SendBuffer {
    fn from(value: MemRegion) -> Self {
        SendBuffer::Region(value)
    }
}

pub trait Transport: Send + Sync {
    fn open(&self) -> Result<ConnHandle, TransportError>;

    /// Graceful close; queued data is still delivered to the peer.
    fn close(&self, conn: ConnHandle) -> Result<(), TransportError>;

    fn force_close(&self, conn: ConnHandle) -> Result<(), TransportError>;

    /// Port 0 lets the transport pick one; the bound address is returned.
    fn bind(
        &self,
        conn: ConnHandle,
        addr: TransportAddr,
    ) -> Result<TransportAddr, TransportError>;

    fn listen(&self, conn: ConnHandle, backlog: u32) -> Result<(), TransportError>;

    /// Returns [`TransportError::Again`] until the connection is established.
    fn connect(&self, conn: ConnHandle, addr: TransportAddr) -> Result<(), TransportError>;

    fn accept(
        &self,
        listener: ConnHandle,
    ) -> Result<Option<(ConnHandle, TransportAddr)>, TransportError>;

    fn isend(&self, conn: ConnHandle, buf: &SendBuffer) -> Result<RequestHandle, TransportError>;

    fn improbe(&self, conn: ConnHandle) -> Result<Option<Envelope>, TransportError>;

    fn get_count(&self, envelope: &Envelope) -> usize {
        envelope.count
    }

    fn imrecv(&self, envelope: Envelope, dst: &MemRegion) -> Result<RequestHandle, TransportError>;

    /// Receives one message into consecutive destination regions.
    fn imrecv_scatter(
        &self,
        envelope: Envelope,
        dsts: &[MemRegion],
    ) -> Result<RequestHandle, TransportError>;

    fn test_some(&self, requests: &[RequestHandle]) -> Result<Vec<Completion>, TransportError>;

    fn register_memory(&self, addr: u64, len: usize) -> Result<MemHandle, TransportError>;

    fn unregister_memory(&self, handle: MemHandle) -> Result<(), TransportError>;
}

/// An open connection that is force-closed on drop unless closed explicitly.
pub struct Connection {
    transport: Arc<dyn Transport>,
    handle: ConnHandle,
    open: bool,
}

impl Connection {
    pub fn open(transport: Arc<dyn Transport>) -> Result<Self, TransportError> {
        let handle = transport.open()?;
        Ok(Self::from_handle(transport, handle))
    }

    /// Takes ownership of a handle returned by `accept`.
    pub fn from_handle(transport: Arc<dyn Transport>, handle: ConnHandle) -> Self {
        Self {
            transport,
            handle,
            open: true,
        }
    }

    pub fn handle(&self) -> ConnHandle {
        self.handle
    }

    pub fn is_open(&self) -> bool {
        self.open
    }

    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    pub fn close(&mut self) -> Result<(), TransportError> {
        if !self.open {
            return Ok(());
        }
        self.open = false;
        self.transport.close(self.handle)
    }

    pub fn force_close(&mut self) {
        if !self.open {
            return;
        }
        self.open = false;
        if let Err(e) = self.transport.force_close(self.handle) {
            tracing::warn!(conn = self.handle.0, error = %e, "force close failed");
        }
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.force_close();
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("handle", &self.handle)
            .field("open", &self.open)
            .finish()
    }
}

#[derive(Debug)]
enum Keepalive {
    Send(SendBuffer),
    Recv(Vec<MemRegion>),
}

/// An in-flight request together with the memory it references.
#[derive(Debug)]
pub struct PendingRequest {
    handle: RequestHandle,
    bytes: usize,
    _buffer: Keepalive,
}

impl PendingRequest {
    pub fn handle(&self) -> RequestHandle {
        self.handle
    }

    pub fn bytes(&self) -> usize {
        self.bytes
    }
}

/// Outstanding requests of one direction on one connection.
#[derive(Debug, Default)]
pub struct RequestSet {
    pending: Vec<PendingRequest>,
}

impl RequestSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn isend(
        &mut self,
        transport: &dyn Transport,
        conn: ConnHandle,
        buf: SendBuffer,
    ) -> Result<(), TransportError> {
        let handle = transport.isend(conn, &buf)?;
        self.pending.push(PendingRequest {
            handle,
            bytes: buf.len(),
            _buffer: Keepalive::Send(buf),
        });
        Ok(())
    }

    pub fn imrecv(
        &mut self,
        transport: &dyn Transport,
        envelope: Envelope,
        dst: MemRegion,
    ) -> Result<(), TransportError> {
        let handle = transport.imrecv(envelope, &dst)?;
        self.pending.push(PendingRequest {
            handle,
            bytes: dst.len(),
            _buffer: Keepalive::Recv(vec![dst]),
        });
        Ok(())
    }

    pub fn imrecv_scatter(
        &mut self,
        transport: &dyn Transport,
        envelope: Envelope,
        dsts: Vec<MemRegion>,
    ) -> Result<(), TransportError> {
        let handle = transport.imrecv_scatter(envelope, &dsts)?;
        self.pending.push(PendingRequest {
            handle,
            bytes: dsts.iter().map(MemRegion::len).sum(),
            _buffer: Keepalive::Recv(dsts),
        });
        Ok(())
    }

    /// Tests every pending request once and drops the finished ones. Returns
    /// the number of bytes completed by this call.
    pub fn poll(&mut self, transport: &dyn Transport) -> Result<usize, TransportError> {
        if self.pending.is_empty() {
            return Ok(0);
        }
        let handles: Vec<RequestHandle> = self.pending.iter().map(|p| p.handle).collect();
        let mut done = transport.test_some(&handles)?;
        if let Some(failed) = done.iter().find(|c| c.error != 0) {
            return Err(TransportError::Failed {
                op: "test_some",
                code: failed.error,
            });
        }
        done.sort_unstable_by(|a, b| b.index.cmp(&a.index));
        let mut bytes = 0;
        for completion in done {
            if completion.index < self.pending.len() {
                bytes += self.pending.swap_remove(completion.index).bytes;
            }
        }
        Ok(bytes)
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn clear(&mut self) {
        self.pending.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::HostBuffer;

    fn addr(port: u16) -> TransportAddr {
        TransportAddr::new(Ipv4Addr::LOCALHOST, port)
    }

    #[test]
    fn test_connection_force_closes_on_drop() {
        let fabric = LoopbackFabric::new();
        let transport: Arc<dyn Transport> = Arc::new(fabric.endpoint());
        let handle = {
            let conn = Connection::open(transport.clone()).unwrap();
            conn.handle()
        };
        assert!(transport.bind(handle, addr(1)).is_err());
    }

    #[test]
    fn test_request_set_keeps_buffer_until_complete() {
        let fabric = LoopbackFabric::new();
        let server = fabric.endpoint();
        let client = fabric.endpoint();
        server.defer_completions(2);

        let listener = server.open().unwrap();
        server.bind(listener, addr(7000)).unwrap();
        server.listen(listener, 8).unwrap();
        let conn = client.open().unwrap();
        client.bind(conn, addr(0)).unwrap();
        client.connect(conn, addr(7000)).unwrap();
        let (peer, _) = server.accept(listener).unwrap().unwrap();

        let src = HostBuffer::from_vec(vec![5; 32]);
        let mut sends = RequestSet::new();
        sends
            .isend(&server, peer, MemRegion::whole(src.clone()).into())
            .unwrap();
        assert_eq!(Arc::strong_count(&src), 2);
        assert_eq!(sends.poll(&server).unwrap(), 0);
        assert_eq!(sends.poll(&server).unwrap(), 0);
        assert_eq!(sends.poll(&server).unwrap(), 32);
        assert!(sends.is_empty());
        assert_eq!(Arc::strong_count(&src), 1);

        let envelope = client.improbe(conn).unwrap().unwrap();
        assert_eq!(client.get_count(&envelope), 32);
        let dst = HostBuffer::zeroed(32).unwrap();
        let mut recvs = RequestSet::new();
        recvs
            .imrecv(&client, envelope, MemRegion::whole(dst.clone()))
            .unwrap();
        assert_eq!(recvs.poll(&client).unwrap(), 32);
        assert_eq!(dst.to_vec(), vec![5; 32]);
    }
}
