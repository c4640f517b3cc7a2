// SPDX-FileCopyrightText: Copyright (c) 2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Push path: caller request on the prompt and the transfer-to-remote
//! exchange with the decoder.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use super::{WireError, require_exact, require_header};

/// Raw destination addresses of one layer on the decoder.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LayerAddr {
    pub key_addr: u64,
    pub value_addr: u64,
}

/// Caller request to push a local cache into a decoder cluster.
///
/// Layout:
/// ```text
/// [req_id: 8][prefix_id: 8][model_id: 8][dst_cluster_id: 8]
/// [src_cache_id: 8][dst_cache_id: 8]
/// [src_batch_index: 4][dst_batch_index: 4][timeout_us: 4][block_len: 4]
/// [src_block_num: 4][dst_block_num: 4][layer_addr_num: 4][reserved: 4]
/// [src_blocks: 8 × n][dst_blocks: 8 × n][layer_addrs: 16 × n]
/// ```
///
/// When `layer_addrs` is non-empty the decoder resolves destinations from the
/// raw addresses, otherwise from `dst_cache_id`/`dst_batch_index`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferKvRequest {
    pub req_id: u64,
    pub prefix_id: u64,
    pub model_id: u64,
    pub dst_cluster_id: u64,
    pub src_cache_id: i64,
    pub dst_cache_id: i64,
    pub src_batch_index: u32,
    pub dst_batch_index: u32,
    pub timeout_us: u32,
    pub block_len: u32,
    pub src_blocks: Vec<u64>,
    pub dst_blocks: Vec<u64>,
    pub layer_addrs: Vec<LayerAddr>,
}

impl TransferKvRequest {
    pub const HEADER_SIZE: usize = 80;

    pub fn is_block_transfer(&self) -> bool {
        !self.src_blocks.is_empty() || !self.dst_blocks.is_empty()
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(
            Self::HEADER_SIZE
                + 8 * (self.src_blocks.len() + self.dst_blocks.len())
                + 16 * self.layer_addrs.len(),
        );
        buf.put_u64_le(self.req_id);
        buf.put_u64_le(self.prefix_id);
        buf.put_u64_le(self.model_id);
        buf.put_u64_le(self.dst_cluster_id);
        buf.put_i64_le(self.src_cache_id);
        buf.put_i64_le(self.dst_cache_id);
        buf.put_u32_le(self.src_batch_index);
        buf.put_u32_le(self.dst_batch_index);
        buf.put_u32_le(self.timeout_us);
        buf.put_u32_le(self.block_len);
        buf.put_u32_le(self.src_blocks.len() as u32);
        buf.put_u32_le(self.dst_blocks.len() as u32);
        buf.put_u32_le(self.layer_addrs.len() as u32);
        buf.put_u32_le(0);
        self.src_blocks.iter().for_each(|b| buf.put_u64_le(*b));
        self.dst_blocks.iter().for_each(|b| buf.put_u64_le(*b));
        for addr in &self.layer_addrs {
            buf.put_u64_le(addr.key_addr);
            buf.put_u64_le(addr.value_addr);
        }
        buf.freeze()
    }

    pub fn decode(data: &[u8]) -> Result<Self, WireError> {
        let what = "TransferKvRequest";
        require_header(what, data, Self::HEADER_SIZE)?;
        let mut buf = data;
        let req_id = buf.get_u64_le();
        let prefix_id = buf.get_u64_le();
        let model_id = buf.get_u64_le();
        let dst_cluster_id = buf.get_u64_le();
        let src_cache_id = buf.get_i64_le();
        let dst_cache_id = buf.get_i64_le();
        let src_batch_index = buf.get_u32_le();
        let dst_batch_index = buf.get_u32_le();
        let timeout_us = buf.get_u32_le();
        let block_len = buf.get_u32_le();
        let src_block_num = buf.get_u32_le() as u64;
        let dst_block_num = buf.get_u32_le() as u64;
        let layer_addr_num = buf.get_u32_le() as u64;
        buf.advance(4);
        require_exact(
            what,
            data,
            Self::HEADER_SIZE,
            &[(src_block_num, 8), (dst_block_num, 8), (layer_addr_num, 16)],
        )?;
        let src_blocks = (0..src_block_num).map(|_| buf.get_u64_le()).collect();
        let dst_blocks = (0..dst_block_num).map(|_| buf.get_u64_le()).collect();
        let layer_addrs = (0..layer_addr_num)
            .map(|_| LayerAddr {
                key_addr: buf.get_u64_le(),
                value_addr: buf.get_u64_le(),
            })
            .collect();
        Ok(Self {
            req_id,
            prefix_id,
            model_id,
            dst_cluster_id,
            src_cache_id,
            dst_cache_id,
            src_batch_index,
            dst_batch_index,
            timeout_us,
            block_len,
            src_blocks,
            dst_blocks,
            layer_addrs,
        })
    }
}

/// Destination slice of one transfer, relative to the resolved base.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferSlot {
    pub offset: u64,
    pub size: u64,
}

impl TransferSlot {
    pub const SIZE: usize = 16;
}

/// Per-layer push request sent by the prompt.
///
/// Layout:
/// ```text
/// [key_addr: 8][value_addr: 8][cache_id: 8]
/// [batch_index: 4][layer_index: 4][total_slot_nums: 4][reserved: 4]
/// [slots: 16 × total_slot_nums]
/// ```
///
/// `cache_id < 0` selects raw address mode (`key_addr`/`value_addr`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferToRemoteRequest {
    pub key_addr: u64,
    pub value_addr: u64,
    pub cache_id: i64,
    pub batch_index: u32,
    pub layer_index: u32,
    pub slots: Vec<TransferSlot>,
}

impl TransferToRemoteRequest {
    pub const HEADER_SIZE: usize = 40;

    pub fn total_bytes(&self) -> u64 {
        self.slots.iter().map(|s| s.size).sum()
    }

    pub fn encode(&self) -> Bytes {
        self.encode_with_slot_count(self.slots.len() as u32)
    }

    /// Encodes with an explicit `total_slot_nums`, which lets tests produce
    /// requests whose header disagrees with their tail.
    pub fn encode_with_slot_count(&self, total_slot_nums: u32) -> Bytes {
        let mut buf =
            BytesMut::with_capacity(Self::HEADER_SIZE + TransferSlot::SIZE * self.slots.len());
        buf.put_u64_le(self.key_addr);
        buf.put_u64_le(self.value_addr);
        buf.put_i64_le(self.cache_id);
        buf.put_u32_le(self.batch_index);
        buf.put_u32_le(self.layer_index);
        buf.put_u32_le(total_slot_nums);
        buf.put_u32_le(0);
        for slot in &self.slots {
            buf.put_u64_le(slot.offset);
            buf.put_u64_le(slot.size);
        }
        buf.freeze()
    }

    pub fn decode(data: &[u8]) -> Result<Self, WireError> {
        let what = "TransferToRemoteRequest";
        require_header(what, data, Self::HEADER_SIZE)?;
        let mut buf = data;
        let key_addr = buf.get_u64_le();
        let value_addr = buf.get_u64_le();
        let cache_id = buf.get_i64_le();
        let batch_index = buf.get_u32_le();
        let layer_index = buf.get_u32_le();
        let total_slot_nums = buf.get_u32_le() as u64;
        buf.advance(4);
        require_exact(
            what,
            data,
            Self::HEADER_SIZE,
            &[(total_slot_nums, TransferSlot::SIZE)],
        )?;
        let slots = (0..total_slot_nums)
            .map(|_| TransferSlot {
                offset: buf.get_u64_le(),
                size: buf.get_u64_le(),
            })
            .collect();
        Ok(Self {
            key_addr,
            value_addr,
            cache_id,
            batch_index,
            layer_index,
            slots,
        })
    }
}

/// Meta reply from the decoder to a [`TransferToRemoteRequest`].
///
/// Layout: `[ret_code: 4][reserved: 4]`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferToRemoteResponse {
    pub ret_code: u32,
}

impl TransferToRemoteResponse {
    pub const SIZE: usize = 8;

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(Self::SIZE);
        buf.put_u32_le(self.ret_code);
        buf.put_u32_le(0);
        buf.freeze()
    }

    pub fn decode(data: &[u8]) -> Result<Self, WireError> {
        require_exact("TransferToRemoteResponse", data, Self::SIZE, &[])?;
        let mut buf = data;
        Ok(Self {
            ret_code: buf.get_u32_le(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_remote() -> TransferToRemoteRequest {
        TransferToRemoteRequest {
            key_addr: 0,
            value_addr: 0,
            cache_id: 3,
            batch_index: 1,
            layer_index: 0,
            slots: vec![
                TransferSlot { offset: 0, size: 64 },
                TransferSlot {
                    offset: 128,
                    size: 32,
                },
            ],
        }
    }

    #[test]
    fn test_transfer_request_decode() {
        let req = TransferKvRequest {
            req_id: 1,
            prefix_id: 2,
            model_id: 3,
            dst_cluster_id: 4,
            src_cache_id: 5,
            dst_cache_id: 6,
            src_batch_index: 0,
            dst_batch_index: 0,
            timeout_us: 0,
            block_len: 16,
            src_blocks: vec![0, 1],
            dst_blocks: vec![8, 9],
            layer_addrs: vec![LayerAddr {
                key_addr: 0x1000,
                value_addr: 0x2000,
            }],
        };
        let bytes = req.encode();
        assert_eq!(bytes.len(), TransferKvRequest::HEADER_SIZE + 32 + 16);
        assert_eq!(TransferKvRequest::decode(&bytes).unwrap(), req);
    }

    #[test]
    fn test_remote_request_slot_count_law() {
        let req = sample_remote();
        let bytes = req.encode();
        assert_eq!(
            bytes.len(),
            TransferToRemoteRequest::HEADER_SIZE + 2 * TransferSlot::SIZE
        );
        assert_eq!(TransferToRemoteRequest::decode(&bytes).unwrap(), req);
        assert_eq!(req.total_bytes(), 96);

        for declared in [0u32, 1, 3, u32::MAX] {
            let bytes = req.encode_with_slot_count(declared);
            assert!(TransferToRemoteRequest::decode(&bytes).is_err());
        }
    }

    #[test]
    fn test_remote_response() {
        let resp = TransferToRemoteResponse { ret_code: 1 };
        assert_eq!(TransferToRemoteResponse::decode(&resp.encode()).unwrap(), resp);
    }
}
