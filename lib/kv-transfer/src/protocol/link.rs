// SPDX-FileCopyrightText: Copyright (c) 2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Link handshake and link/unlink batch requests.

use std::net::Ipv4Addr;

use bytes::{Buf, BufMut, Bytes, BytesMut};

use super::{WireError, require_exact, require_header};
use crate::transport::TransportAddr;

/// Upper bound on clusters in one link/unlink request.
pub const MAX_CLUSTERS_PER_REQUEST: usize = 16;

/// Address pairs carried by one cluster descriptor.
pub const MAX_IP_NUM: usize = 4;

/// Exact size of the handshake message a client sends after connecting.
pub const CLIENT_CLUSTER_INFO_SIZE: usize = ClientClusterInfo::SIZE;

#[repr(i32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ClusterRole {
    Prompt = 0,
    Decoder = 1,
}

impl TryFrom<i32> for ClusterRole {
    type Error = WireError;

    fn try_from(value: i32) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::Prompt),
            1 => Ok(Self::Decoder),
            _ => Err(WireError::InvalidField {
                what: "ClusterRole",
                field: "role",
                value: value as u32 as u64,
            }),
        }
    }
}

/// Handshake sent by the linking (client) side.
///
/// Layout: `[cluster_id: 8][role: 4][pull_chunk_bytes: 4]`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClientClusterInfo {
    pub cluster_id: u64,
    pub role: ClusterRole,
    /// Chunk size the client splits pull replies on. 0 lets the server use
    /// its own `max_send_bytes`.
    pub pull_chunk_bytes: u32,
}

impl ClientClusterInfo {
    pub const SIZE: usize = 16;

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(Self::SIZE);
        buf.put_u64_le(self.cluster_id);
        buf.put_i32_le(self.role as i32);
        buf.put_u32_le(self.pull_chunk_bytes);
        buf.freeze()
    }

    pub fn decode(data: &[u8]) -> Result<Self, WireError> {
        require_exact("ClientClusterInfo", data, Self::SIZE, &[])?;
        let mut buf = data;
        let cluster_id = buf.get_u64_le();
        let role = ClusterRole::try_from(buf.get_i32_le())?;
        let pull_chunk_bytes = buf.get_u32_le();
        Ok(Self {
            cluster_id,
            role,
            pull_chunk_bytes,
        })
    }
}

/// One transport endpoint on the wire.
///
/// Layout: `[ip: 4][port: 2][reserved: 2]`
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IpInfo {
    pub ip: u32,
    pub port: u16,
}

impl IpInfo {
    pub const SIZE: usize = 8;

    pub fn from_addr(addr: TransportAddr) -> Self {
        Self {
            ip: u32::from(addr.ip),
            port: addr.port,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.ip == 0
    }

    pub fn to_addr(self) -> TransportAddr {
        TransportAddr::new(Ipv4Addr::from(self.ip), self.port)
    }

    fn put(&self, buf: &mut BytesMut) {
        buf.put_u32_le(self.ip);
        buf.put_u16_le(self.port);
        buf.put_u16_le(0);
    }

    fn get(buf: &mut &[u8]) -> Self {
        let ip = buf.get_u32_le();
        let port = buf.get_u16_le();
        buf.advance(2);
        Self { ip, port }
    }
}

/// Per-cluster descriptor inside a [`LinkBatchRequest`].
///
/// Layout: `[remote_cluster_id: 8][remote_role: 4][ip_num: 4][local: 4 × 8][remote: 4 × 8]`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClusterInfo {
    pub remote_cluster_id: u64,
    pub remote_role: i32,
    pub ip_num: u32,
    pub local_ips: [IpInfo; MAX_IP_NUM],
    pub remote_ips: [IpInfo; MAX_IP_NUM],
}

/// A validated cluster descriptor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClusterLinkInfo {
    pub local_cluster_id: u64,
    pub remote_cluster_id: u64,
    pub remote_role: ClusterRole,
    pub local_addr: TransportAddr,
    pub remote_addr: TransportAddr,
}

impl ClusterInfo {
    pub const SIZE: usize = 80;

    /// Builds a single-address descriptor.
    pub fn new(
        remote_cluster_id: u64,
        remote_role: ClusterRole,
        local: TransportAddr,
        remote: TransportAddr,
    ) -> Self {
        let mut local_ips = [IpInfo::default(); MAX_IP_NUM];
        let mut remote_ips = [IpInfo::default(); MAX_IP_NUM];
        local_ips[0] = IpInfo::from_addr(local);
        remote_ips[0] = IpInfo::from_addr(remote);
        Self {
            remote_cluster_id,
            remote_role: remote_role as i32,
            ip_num: 1,
            local_ips,
            remote_ips,
        }
    }

    fn put(&self, buf: &mut BytesMut) {
        buf.put_u64_le(self.remote_cluster_id);
        buf.put_i32_le(self.remote_role);
        buf.put_u32_le(self.ip_num);
        for ip in self.local_ips.iter().chain(self.remote_ips.iter()) {
            ip.put(buf);
        }
    }

    fn get(buf: &mut &[u8]) -> Self {
        let remote_cluster_id = buf.get_u64_le();
        let remote_role = buf.get_i32_le();
        let ip_num = buf.get_u32_le();
        let mut local_ips = [IpInfo::default(); MAX_IP_NUM];
        let mut remote_ips = [IpInfo::default(); MAX_IP_NUM];
        for ip in local_ips.iter_mut() {
            *ip = IpInfo::get(buf);
        }
        for ip in remote_ips.iter_mut() {
            *ip = IpInfo::get(buf);
        }
        Self {
            remote_cluster_id,
            remote_role,
            ip_num,
            local_ips,
            remote_ips,
        }
    }

    /// Checks the declared `ip_num` against the populated address slots and
    /// returns the link endpoints (the first address pair is the one used).
    pub fn validate(&self, local_cluster_id: u64) -> Result<ClusterLinkInfo, WireError> {
        let what = "ClusterInfo";
        let ip_num = self.ip_num as usize;
        if ip_num == 0 || ip_num > MAX_IP_NUM {
            return Err(WireError::InvalidField {
                what,
                field: "ip_num",
                value: self.ip_num as u64,
            });
        }
        let local_used = self.local_ips.iter().filter(|ip| !ip.is_empty()).count();
        let remote_used = self.remote_ips.iter().filter(|ip| !ip.is_empty()).count();
        if local_used != ip_num || remote_used != ip_num {
            return Err(WireError::InvalidField {
                what,
                field: "ip_num",
                value: self.ip_num as u64,
            });
        }
        if self.local_ips[..ip_num].iter().any(IpInfo::is_empty)
            || self.remote_ips[..ip_num].iter().any(IpInfo::is_empty)
        {
            return Err(WireError::InvalidField {
                what,
                field: "ip",
                value: 0,
            });
        }
        if self.remote_ips[..ip_num].iter().any(|ip| ip.port == 0) {
            return Err(WireError::InvalidField {
                what,
                field: "remote_port",
                value: 0,
            });
        }
        let remote_role = ClusterRole::try_from(self.remote_role)?;
        Ok(ClusterLinkInfo {
            local_cluster_id,
            remote_cluster_id: self.remote_cluster_id,
            remote_role,
            local_addr: self.local_ips[0].to_addr(),
            remote_addr: self.remote_ips[0].to_addr(),
        })
    }
}

#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LinkOperator {
    Link = 0,
    Unlink = 1,
    /// Prompt side drops the server entity of a decoder cluster.
    ServerUnlink = 2,
}

impl TryFrom<u32> for LinkOperator {
    type Error = WireError;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::Link),
            1 => Ok(Self::Unlink),
            2 => Ok(Self::ServerUnlink),
            _ => Err(WireError::InvalidField {
                what: "LinkBatchRequest",
                field: "operator_type",
                value: value as u64,
            }),
        }
    }
}

/// Batch link/unlink request.
///
/// Layout: `[operator: 4][cluster_num: 4][timeout_us: 4][force: 4][clusters: cluster_num × 80]`
///
/// The operator is kept raw so an unknown value is reported by the
/// orchestrator for the whole batch instead of failing the decode.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkBatchRequest {
    pub operator: u32,
    pub timeout_us: u32,
    pub force: bool,
    pub clusters: Vec<ClusterInfo>,
}

impl LinkBatchRequest {
    pub const HEADER_SIZE: usize = 16;

    pub fn new(operator: LinkOperator, timeout_us: u32, clusters: Vec<ClusterInfo>) -> Self {
        Self {
            operator: operator as u32,
            timeout_us,
            force: false,
            clusters,
        }
    }

    pub fn with_force(mut self, force: bool) -> Self {
        self.force = force;
        self
    }

    pub fn operator(&self) -> Result<LinkOperator, WireError> {
        LinkOperator::try_from(self.operator)
    }

    pub fn encode(&self) -> Bytes {
        let mut buf =
            BytesMut::with_capacity(Self::HEADER_SIZE + self.clusters.len() * ClusterInfo::SIZE);
        buf.put_u32_le(self.operator);
        buf.put_u32_le(self.clusters.len() as u32);
        buf.put_u32_le(self.timeout_us);
        buf.put_u32_le(self.force as u32);
        for cluster in &self.clusters {
            cluster.put(&mut buf);
        }
        buf.freeze()
    }

    pub fn decode(data: &[u8]) -> Result<Self, WireError> {
        let what = "LinkBatchRequest";
        require_header(what, data, Self::HEADER_SIZE)?;
        let mut buf = data;
        let operator = buf.get_u32_le();
        let cluster_num = buf.get_u32_le();
        let timeout_us = buf.get_u32_le();
        let force = buf.get_u32_le() != 0;
        require_exact(
            what,
            data,
            Self::HEADER_SIZE,
            &[(cluster_num as u64, ClusterInfo::SIZE)],
        )?;
        let clusters = (0..cluster_num).map(|_| ClusterInfo::get(&mut buf)).collect();
        Ok(Self {
            operator,
            timeout_us,
            force,
            clusters,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(last: u8, port: u16) -> TransportAddr {
        TransportAddr::new(Ipv4Addr::new(10, 0, 0, last), port)
    }

    #[test]
    fn test_client_cluster_info() {
        let info = ClientClusterInfo {
            cluster_id: 42,
            role: ClusterRole::Decoder,
            pull_chunk_bytes: 4096,
        };
        let bytes = info.encode();
        assert_eq!(bytes.len(), CLIENT_CLUSTER_INFO_SIZE);
        assert_eq!(ClientClusterInfo::decode(&bytes).unwrap(), info);
        assert!(ClientClusterInfo::decode(&bytes[..15]).is_err());
    }

    #[test]
    fn test_link_batch_size_law() {
        let clusters = vec![
            ClusterInfo::new(1, ClusterRole::Prompt, addr(1, 0), addr(2, 5000)),
            ClusterInfo::new(2, ClusterRole::Prompt, addr(1, 0), addr(3, 5000)),
        ];
        let req = LinkBatchRequest::new(LinkOperator::Link, 100, clusters).with_force(true);
        let bytes = req.encode();
        assert_eq!(
            bytes.len(),
            LinkBatchRequest::HEADER_SIZE + 2 * ClusterInfo::SIZE
        );
        assert_eq!(LinkBatchRequest::decode(&bytes).unwrap(), req);

        // truncated tail
        assert!(matches!(
            LinkBatchRequest::decode(&bytes[..bytes.len() - 1]),
            Err(WireError::SizeMismatch { .. })
        ));

        // inflated count
        let mut raw = bytes.to_vec();
        raw[4] = 3;
        assert!(LinkBatchRequest::decode(&raw).is_err());
    }

    #[test]
    fn test_unknown_operator_survives_decode() {
        let mut req = LinkBatchRequest::new(LinkOperator::Link, 0, vec![]);
        req.operator = 9;
        let decoded = LinkBatchRequest::decode(&req.encode()).unwrap();
        assert!(decoded.operator().is_err());
    }

    #[test]
    fn test_cluster_validate_ip_num_mismatch() {
        let mut info = ClusterInfo::new(7, ClusterRole::Prompt, addr(1, 0), addr(2, 6000));
        assert!(info.validate(1).is_ok());

        info.ip_num = 2;
        assert!(info.validate(1).is_err());

        info.ip_num = 0;
        assert!(info.validate(1).is_err());

        let mut info = ClusterInfo::new(7, ClusterRole::Prompt, addr(1, 0), addr(2, 0));
        assert!(info.validate(1).is_err());
        info.remote_ips[0].port = 1;
        info.remote_role = 5;
        assert!(info.validate(1).is_err());
    }

    #[test]
    fn test_cluster_validate_endpoints() {
        let info = ClusterInfo::new(7, ClusterRole::Prompt, addr(1, 0), addr(2, 6000));
        let link = info.validate(11).unwrap();
        assert_eq!(link.local_cluster_id, 11);
        assert_eq!(link.remote_cluster_id, 7);
        assert_eq!(link.remote_addr, addr(2, 6000));
        assert_eq!(link.local_addr, addr(1, 0));
    }
}
