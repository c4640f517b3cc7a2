// SPDX-FileCopyrightText: Copyright (c) 2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Pull path: caller request on the decoder and the sync-kv exchange between
//! decoder and prompt.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use super::{INVALID_CACHE_ID, INVALID_PREFIX_ID, WireError, require_exact, require_header};

/// Caller request to pull KV from a prompt cluster into a local cache.
///
/// Layout:
/// ```text
/// [req_id: 8][prefix_id: 8][model_id: 8][prompt_cluster_id: 8]
/// [prompt_cache_id: 8][decoder_cache_id: 8]
/// [prompt_batch_index: 4][decoder_batch_index: 4][timeout_us: 4][block_len: 4]
/// [pull_with_offset: 4][prompt_block_num: 4][decoder_block_num: 4][tensor_num: 4]
/// [prompt_blocks: 8 × n][decoder_blocks: 8 × n][tensor_indices: 4 × n]
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PullKvRequest {
    pub req_id: u64,
    pub prefix_id: u64,
    pub model_id: u64,
    pub prompt_cluster_id: u64,
    pub prompt_cache_id: i64,
    pub decoder_cache_id: i64,
    pub prompt_batch_index: u32,
    pub decoder_batch_index: u32,
    pub timeout_us: u32,
    pub block_len: u32,
    pub pull_with_offset: bool,
    pub prompt_blocks: Vec<u64>,
    pub decoder_blocks: Vec<u64>,
    pub tensor_indices: Vec<u32>,
}

impl PullKvRequest {
    pub const HEADER_SIZE: usize = 80;

    /// Pull by request id through the prompt's KV index into
    /// `decoder_cache_id`/`decoder_batch_index`.
    pub fn by_request(
        prompt_cluster_id: u64,
        req_id: u64,
        model_id: u64,
        decoder_cache_id: i64,
        decoder_batch_index: u32,
    ) -> Self {
        Self {
            req_id,
            prefix_id: INVALID_PREFIX_ID,
            model_id,
            prompt_cluster_id,
            prompt_cache_id: INVALID_CACHE_ID,
            decoder_cache_id,
            prompt_batch_index: 0,
            decoder_batch_index,
            timeout_us: 0,
            block_len: 0,
            pull_with_offset: false,
            prompt_blocks: Vec::new(),
            decoder_blocks: Vec::new(),
            tensor_indices: Vec::new(),
        }
    }

    pub fn is_pull_block(&self) -> bool {
        !self.prompt_blocks.is_empty() || !self.decoder_blocks.is_empty()
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(
            Self::HEADER_SIZE
                + 8 * (self.prompt_blocks.len() + self.decoder_blocks.len())
                + 4 * self.tensor_indices.len(),
        );
        buf.put_u64_le(self.req_id);
        buf.put_u64_le(self.prefix_id);
        buf.put_u64_le(self.model_id);
        buf.put_u64_le(self.prompt_cluster_id);
        buf.put_i64_le(self.prompt_cache_id);
        buf.put_i64_le(self.decoder_cache_id);
        buf.put_u32_le(self.prompt_batch_index);
        buf.put_u32_le(self.decoder_batch_index);
        buf.put_u32_le(self.timeout_us);
        buf.put_u32_le(self.block_len);
        buf.put_u32_le(self.pull_with_offset as u32);
        buf.put_u32_le(self.prompt_blocks.len() as u32);
        buf.put_u32_le(self.decoder_blocks.len() as u32);
        buf.put_u32_le(self.tensor_indices.len() as u32);
        self.prompt_blocks.iter().for_each(|b| buf.put_u64_le(*b));
        self.decoder_blocks.iter().for_each(|b| buf.put_u64_le(*b));
        self.tensor_indices.iter().for_each(|t| buf.put_u32_le(*t));
        buf.freeze()
    }

    pub fn decode(data: &[u8]) -> Result<Self, WireError> {
        let what = "PullKvRequest";
        require_header(what, data, Self::HEADER_SIZE)?;
        let mut buf = data;
        let req_id = buf.get_u64_le();
        let prefix_id = buf.get_u64_le();
        let model_id = buf.get_u64_le();
        let prompt_cluster_id = buf.get_u64_le();
        let prompt_cache_id = buf.get_i64_le();
        let decoder_cache_id = buf.get_i64_le();
        let prompt_batch_index = buf.get_u32_le();
        let decoder_batch_index = buf.get_u32_le();
        let timeout_us = buf.get_u32_le();
        let block_len = buf.get_u32_le();
        let pull_with_offset = buf.get_u32_le() != 0;
        let prompt_block_num = buf.get_u32_le() as u64;
        let decoder_block_num = buf.get_u32_le() as u64;
        let tensor_num = buf.get_u32_le() as u64;
        require_exact(
            what,
            data,
            Self::HEADER_SIZE,
            &[(prompt_block_num, 8), (decoder_block_num, 8), (tensor_num, 4)],
        )?;
        let prompt_blocks = (0..prompt_block_num).map(|_| buf.get_u64_le()).collect();
        let decoder_blocks = (0..decoder_block_num).map(|_| buf.get_u64_le()).collect();
        let tensor_indices = (0..tensor_num).map(|_| buf.get_u32_le()).collect();
        Ok(Self {
            req_id,
            prefix_id,
            model_id,
            prompt_cluster_id,
            prompt_cache_id,
            decoder_cache_id,
            prompt_batch_index,
            decoder_batch_index,
            timeout_us,
            block_len,
            pull_with_offset,
            prompt_blocks,
            decoder_blocks,
            tensor_indices,
        })
    }
}

/// A contiguous run of prompt-side blocks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferInfo {
    pub block_start: u64,
    pub block_count: u64,
}

impl BufferInfo {
    pub const SIZE: usize = 16;
}

/// Request sent by a decoder entity to the prompt that owns the cache.
///
/// Layout:
/// ```text
/// [req_id: 8][prefix_id: 8][model_id: 8][cache_id: 8]
/// [batch_index: 4][pull_block: 1][pull_with_offset: 1][reserved: 2]
/// [buffer_num: 4][tensor_num: 4]
/// [buffers: 16 × buffer_num][tensor_indices: 4 × tensor_num]
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncKvRequest {
    pub req_id: u64,
    pub prefix_id: u64,
    pub model_id: u64,
    pub cache_id: i64,
    pub batch_index: u32,
    pub pull_block: bool,
    pub pull_with_offset: bool,
    pub buffers: Vec<BufferInfo>,
    pub tensor_indices: Vec<u32>,
}

impl SyncKvRequest {
    pub const HEADER_SIZE: usize = 48;

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(
            Self::HEADER_SIZE
                + BufferInfo::SIZE * self.buffers.len()
                + 4 * self.tensor_indices.len(),
        );
        buf.put_u64_le(self.req_id);
        buf.put_u64_le(self.prefix_id);
        buf.put_u64_le(self.model_id);
        buf.put_i64_le(self.cache_id);
        buf.put_u32_le(self.batch_index);
        buf.put_u8(self.pull_block as u8);
        buf.put_u8(self.pull_with_offset as u8);
        buf.put_u16_le(0);
        buf.put_u32_le(self.buffers.len() as u32);
        buf.put_u32_le(self.tensor_indices.len() as u32);
        for info in &self.buffers {
            buf.put_u64_le(info.block_start);
            buf.put_u64_le(info.block_count);
        }
        self.tensor_indices.iter().for_each(|t| buf.put_u32_le(*t));
        buf.freeze()
    }

    pub fn decode(data: &[u8]) -> Result<Self, WireError> {
        let what = "SyncKvRequest";
        require_header(what, data, Self::HEADER_SIZE)?;
        let mut buf = data;
        let req_id = buf.get_u64_le();
        let prefix_id = buf.get_u64_le();
        let model_id = buf.get_u64_le();
        let cache_id = buf.get_i64_le();
        let batch_index = buf.get_u32_le();
        let pull_block = buf.get_u8() != 0;
        let pull_with_offset = buf.get_u8() != 0;
        buf.advance(2);
        let buffer_num = buf.get_u32_le() as u64;
        let tensor_num = buf.get_u32_le() as u64;
        require_exact(
            what,
            data,
            Self::HEADER_SIZE,
            &[(buffer_num, BufferInfo::SIZE), (tensor_num, 4)],
        )?;
        let buffers = (0..buffer_num)
            .map(|_| BufferInfo {
                block_start: buf.get_u64_le(),
                block_count: buf.get_u64_le(),
            })
            .collect();
        let tensor_indices = (0..tensor_num).map(|_| buf.get_u32_le()).collect();
        Ok(Self {
            req_id,
            prefix_id,
            model_id,
            cache_id,
            batch_index,
            pull_block,
            pull_with_offset,
            buffers,
            tensor_indices,
        })
    }
}

/// Meta reply from the prompt: status plus the number of data messages
/// that follow.
///
/// Layout: `[ret_code: 4][transfer_count: 4]`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncKvResponse {
    pub ret_code: u32,
    pub transfer_count: u32,
}

impl SyncKvResponse {
    pub const SIZE: usize = 8;

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(Self::SIZE);
        buf.put_u32_le(self.ret_code);
        buf.put_u32_le(self.transfer_count);
        buf.freeze()
    }

    pub fn decode(data: &[u8]) -> Result<Self, WireError> {
        require_exact("SyncKvResponse", data, Self::SIZE, &[])?;
        let mut buf = data;
        Ok(Self {
            ret_code: buf.get_u32_le(),
            transfer_count: buf.get_u32_le(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_pull() -> PullKvRequest {
        PullKvRequest {
            req_id: 7,
            prefix_id: 3,
            model_id: 1,
            prompt_cluster_id: 100,
            prompt_cache_id: 5,
            decoder_cache_id: 6,
            prompt_batch_index: 0,
            decoder_batch_index: 1,
            timeout_us: 1000,
            block_len: 16,
            pull_with_offset: false,
            prompt_blocks: vec![1, 2, 3],
            decoder_blocks: vec![4, 5, 6],
            tensor_indices: vec![0, 2],
        }
    }

    #[test]
    fn test_pull_request_decode() {
        let req = sample_pull();
        let bytes = req.encode();
        assert_eq!(bytes.len(), PullKvRequest::HEADER_SIZE + 6 * 8 + 2 * 4);
        assert_eq!(PullKvRequest::decode(&bytes).unwrap(), req);
        assert!(req.is_pull_block());
    }

    #[test]
    fn test_pull_request_rejects_short_tail() {
        let bytes = sample_pull().encode();
        for cut in [1usize, 4, 8] {
            assert!(PullKvRequest::decode(&bytes[..bytes.len() - cut]).is_err());
        }
        assert!(PullKvRequest::decode(&bytes[..10]).is_err());
    }

    #[test]
    fn test_sync_request_rejects_extra_bytes() {
        let req = SyncKvRequest {
            req_id: 1,
            prefix_id: INVALID_PREFIX_ID,
            model_id: 2,
            cache_id: INVALID_CACHE_ID,
            batch_index: 0,
            pull_block: true,
            pull_with_offset: false,
            buffers: vec![BufferInfo {
                block_start: 4,
                block_count: 2,
            }],
            tensor_indices: vec![],
        };
        let mut bytes = req.encode().to_vec();
        assert_eq!(SyncKvRequest::decode(&bytes).unwrap(), req);
        bytes.push(0);
        assert!(matches!(
            SyncKvRequest::decode(&bytes),
            Err(WireError::SizeMismatch { .. })
        ));
    }

    #[test]
    fn test_sync_response() {
        let resp = SyncKvResponse {
            ret_code: 3,
            transfer_count: 0,
        };
        assert_eq!(SyncKvResponse::decode(&resp.encode()).unwrap(), resp);
        assert!(SyncKvResponse::decode(&[0u8; 7]).is_err());
    }
}
