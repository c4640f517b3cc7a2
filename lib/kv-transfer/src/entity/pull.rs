// SPDX-FileCopyrightText: Copyright (c) 2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Pull path.
//!
//! The decoder sends a [`SyncKvRequest`] and receives a [`SyncKvResponse`]
//! followed by `transfer_count` data messages. Every slot is sent as full
//! chunks closed by one shorter (possibly empty) chunk, so the decoder
//! advances to the next destination on any short message. The chunk size is
//! the one the decoder announced in its link handshake.

use std::time::Instant;

use bytes::BytesMut;

use super::{CommEntity, Release, RequestScope, chunk_buffer};
use crate::blocks::aggregate_block_pairs;
use crate::cache::MemRegion;
use crate::protocol::{BufferInfo, PullKvRequest, SyncKvRequest, SyncKvResponse};
use crate::status::{LlmError, Result, StatusCode};
use crate::timing::Deadline;
use crate::transport::{SendBuffer, TransportError};

/// Tensor indices selected by a request; empty selects all.
pub(crate) fn select_tensors(indices: &[u32], count: usize) -> Result<Vec<usize>> {
    if indices.is_empty() {
        return Ok((0..count).collect());
    }
    indices
        .iter()
        .map(|&index| {
            let index = index as usize;
            if index >= count {
                return Err(LlmError::param(format!(
                    "tensor index {index} >= tensor count {count}"
                )));
            }
            Ok(index)
        })
        .collect()
}

struct PullSources {
    slots: Vec<SendBuffer>,
    release: Option<Release>,
}

impl CommEntity {
    // ----- prompt side -----

    fn resolve_pull_sources(&self, req: &SyncKvRequest) -> Result<PullSources> {
        let scope = RequestScope::new(req.req_id, req.prefix_id, req.model_id);
        if req.cache_id >= 0 {
            let entry = self
                .ctx
                .store()
                .entry(req.cache_id)
                .ok_or_else(|| LlmError::KvNotExist(format!("cache {}", req.cache_id)))?;
            let tensors = select_tensors(&req.tensor_indices, entry.tensors.len())?;
            let mut slots: Vec<SendBuffer> = Vec::new();
            if req.pull_block {
                if !entry.is_paged() {
                    return Err(LlmError::param(format!(
                        "block pull from non-paged cache {}",
                        req.cache_id
                    )));
                }
                for &t in &tensors {
                    for info in &req.buffers {
                        slots.push(
                            entry
                                .block_region(t, info.block_start, info.block_count)?
                                .into(),
                        );
                    }
                }
            } else {
                let (batch_index, size) = if req.pull_with_offset {
                    let key = scope.request_key();
                    let (batch_index, size) = entry
                        .key_slot(&key)
                        .ok_or_else(|| LlmError::KvNotExist(format!("{key:?}")))?;
                    (batch_index, Some(size))
                } else {
                    (req.batch_index, None)
                };
                for &t in &tensors {
                    slots.push(entry.batch_region(t, batch_index, size)?.into());
                }
            }
            return Ok(PullSources {
                slots,
                release: None,
            });
        }

        let key = scope.request_key();
        match self.index_sources(&scope, &req.tensor_indices) {
            Ok(slots) => Ok(PullSources {
                slots,
                release: Some(Release::Index(key)),
            }),
            Err(e) if e.status() == StatusCode::KvNotExist => {
                let (entry, batch_index, size) = self.ctx.store().entry_by_key(&key).ok_or(e)?;
                let tensors = select_tensors(&req.tensor_indices, entry.tensors.len())?;
                let slots = tensors
                    .into_iter()
                    .map(|t| Ok(entry.batch_region(t, batch_index, Some(size))?.into()))
                    .collect::<Result<Vec<SendBuffer>>>()?;
                Ok(PullSources {
                    slots,
                    release: Some(Release::Store(key)),
                })
            }
            Err(e) => Err(e),
        }
    }

    /// Slots published in the KV index; a prefix, when present, is sent in
    /// front of the request's own slice.
    fn index_sources(
        &self,
        scope: &RequestScope,
        tensor_indices: &[u32],
    ) -> Result<Vec<SendBuffer>> {
        let index = self.ctx.kv_index();
        let request = index.query(&scope.request_key())?;
        let prefix = scope.prefix_key().map(|key| index.query(&key)).transpose()?;
        if let Some(prefix) = &prefix
            && prefix.len() != request.len()
        {
            return Err(LlmError::param(format!(
                "prefix has {} tensors, request has {}",
                prefix.len(),
                request.len()
            )));
        }
        select_tensors(tensor_indices, request.len())?
            .into_iter()
            .map(|t| {
                let region = request[t].region()?;
                let Some(prefix) = &prefix else {
                    return Ok(region.into());
                };
                let head = prefix[t].region()?;
                let mut joined = BytesMut::with_capacity(head.len() + region.len());
                joined.extend_from_slice(&head.read());
                joined.extend_from_slice(&region.read());
                Ok(SendBuffer::Bytes(joined.freeze()))
            })
            .collect()
    }

    /// Queues the meta reply and the data chunks for the Send state.
    pub(super) fn prepare_pull_reply(&mut self) -> Result<()> {
        self.scratch.prepared = true;
        let resolved = match (self.scratch.rejected, self.scratch.sync_req.take()) {
            (Some(code), _) => Err(code),
            (None, Some(req)) => self.resolve_pull_sources(&req).map_err(|e| {
                tracing::warn!(scope = ?self.scope, error = %e, "cannot serve pull");
                e.status()
            }),
            (None, None) => Err(StatusCode::Failed),
        };

        let max = self
            .peer_pull_chunk
            .unwrap_or(self.ctx.config().transfer.max_send_bytes);
        let (status, chunks) = match resolved {
            Ok(sources) => {
                let mut chunks = Vec::new();
                for slot in sources.slots {
                    chunks.extend(chunk_buffer(slot, max, true)?);
                }
                match u32::try_from(chunks.len()) {
                    Ok(_) => {
                        self.scratch.release = sources.release;
                        (StatusCode::Success, chunks)
                    }
                    Err(_) => (StatusCode::ReqOverLimit, Vec::new()),
                }
            }
            Err(code) => (code, Vec::new()),
        };

        self.scratch.reply = Some(status);
        let meta = SyncKvResponse {
            ret_code: status.as_u32(),
            transfer_count: chunks.len() as u32,
        };
        self.scratch.queue.push_back(meta.encode().into());
        self.scratch.queue.extend(chunks);
        Ok(())
    }

    pub(super) fn finish_pull_reply(&mut self) {
        match self.scratch.release.take() {
            Some(Release::Index(key)) => {
                self.ctx.kv_index().release(&key);
            }
            Some(Release::Store(key)) => {
                self.ctx.store().remove_index(&key);
            }
            None => {}
        }
        if self.scratch.reply == Some(StatusCode::Success) {
            self.stats.pull_served += 1;
        } else {
            self.stats.pull_failed += 1;
        }
        if let Some(start) = self.op_start {
            self.stats.serve_cost.record(start.elapsed());
        }
        tracing::debug!(scope = ?self.scope, reply = ?self.scratch.reply, "pull served");
    }

    // ----- decoder side -----

    fn pull_destinations(
        &self,
        req: &PullKvRequest,
    ) -> Result<(Vec<MemRegion>, Vec<BufferInfo>)> {
        if req.decoder_cache_id < 0 {
            return Err(LlmError::param(format!(
                "decoder cache id {} is invalid",
                req.decoder_cache_id
            )));
        }
        let entry = self
            .ctx
            .store()
            .entry(req.decoder_cache_id)
            .ok_or_else(|| LlmError::KvNotExist(format!("cache {}", req.decoder_cache_id)))?;
        let tensors = select_tensors(&req.tensor_indices, entry.tensors.len())?;

        if !req.is_pull_block() {
            let dests = tensors
                .into_iter()
                .map(|t| entry.batch_region(t, req.decoder_batch_index, None))
                .collect::<Result<Vec<_>>>()?;
            return Ok((dests, Vec::new()));
        }

        if !entry.is_paged() {
            return Err(LlmError::param(format!(
                "block pull into non-paged cache {}",
                req.decoder_cache_id
            )));
        }
        let runs = aggregate_block_pairs(&req.prompt_blocks, &req.decoder_blocks)?;
        let mut dests = Vec::with_capacity(tensors.len() * runs.len());
        for &t in &tensors {
            for run in &runs {
                dests.push(entry.block_region(t, run.dst_start, run.len)?);
            }
        }
        let buffers = runs
            .iter()
            .map(|run| BufferInfo {
                block_start: run.src_start,
                block_count: run.len,
            })
            .collect();
        Ok((dests, buffers))
    }

    /// Pulls the cache described by `req` from the prompt behind this
    /// connection.
    ///
    /// Errors raised before the request is sent leave the entity untouched.
    /// A non-success meta reply is returned as [`LlmError::Remote`] and also
    /// leaves it healthy. Anything else after the request went out leaves
    /// the stream position unknown: the connection is closed and the entity
    /// moves to Error.
    pub fn pull(&mut self, req: &PullKvRequest) -> Result<()> {
        let start = Instant::now();
        let (dests, buffers) = self.pull_destinations(req)?;
        let sync = SyncKvRequest {
            req_id: req.req_id,
            prefix_id: req.prefix_id,
            model_id: req.model_id,
            cache_id: req.prompt_cache_id,
            batch_index: req.prompt_batch_index,
            pull_block: req.is_pull_block(),
            pull_with_offset: req.pull_with_offset,
            buffers,
            tensor_indices: req.tensor_indices.clone(),
        };

        self.scope = RequestScope::new(req.req_id, req.prefix_id, req.model_id);
        self.occupied = true;
        let mut deadline = self.ctx.transfer_deadline(req.timeout_us as u64);
        let result = self.pull_exchange(&sync, &dests, &mut deadline);
        self.reset_scratch();

        let filled = match result {
            Ok(filled) => filled,
            Err(err) => {
                self.stats.pull_failed += 1;
                if !matches!(err, LlmError::Remote { .. }) {
                    self.fail_connection(&err);
                }
                return Err(err);
            }
        };
        if filled != dests.len() {
            self.stats.pull_failed += 1;
            return Err(LlmError::param(format!(
                "prompt filled {filled} of {} destination slots",
                dests.len()
            )));
        }
        self.stats.receive_cost.record(start.elapsed());
        tracing::debug!(scope = ?self.scope, slots = filled, "pull complete");
        Ok(())
    }

    /// Returns the number of destination slots closed by the prompt.
    fn pull_exchange(
        &mut self,
        sync: &SyncKvRequest,
        dests: &[MemRegion],
        deadline: &mut Deadline,
    ) -> Result<usize> {
        self.send_blocking(sync.encode().into(), deadline)?;
        let meta = SyncKvResponse::decode(&self.recv_blocking(deadline)?)?;
        StatusCode::from_u32(meta.ret_code).into_result(format!(
            "pull of req {} from cluster {}",
            sync.req_id,
            self.remote_cluster_id.unwrap_or_default()
        ))?;

        let max = self.ctx.config().transfer.pull_chunk_bytes() as usize;
        let (mut cursor, mut filled) = (0usize, 0usize);
        let mut received = 0u32;
        while received < meta.transfer_count {
            self.poll_recvs()?;
            let Some(envelope) = self.probe()? else {
                deadline.poll()?;
                std::thread::yield_now();
                continue;
            };
            let count = self.conn.transport().get_count(&envelope);
            let dst = dests.get(cursor).ok_or_else(|| {
                LlmError::param(format!("prompt sent more than {} slots", dests.len()))
            })?;
            if count > dst.len() - filled {
                return Err(LlmError::param(format!(
                    "message of {count} bytes overflows slot {cursor} of {} bytes",
                    dst.len()
                )));
            }
            let region = dst.slice(filled, count)?;
            match self
                .scratch
                .recvs
                .imrecv(self.conn.transport().as_ref(), envelope, region)
            {
                Ok(()) => self.stats.recv_requests += 1,
                Err(TransportError::Again) => {
                    self.stats.again_count += 1;
                    deadline.poll()?;
                    continue;
                }
                Err(e) => return Err(e.into()),
            }
            self.scratch.envelope = None;
            received += 1;
            if count < max {
                cursor += 1;
                filled = 0;
            } else {
                filled += count;
            }
        }

        while !self.scratch.recvs.is_empty() {
            self.poll_recvs()?;
            deadline.poll()?;
        }
        Ok(cursor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_select_tensors() {
        assert_eq!(select_tensors(&[], 3).unwrap(), vec![0, 1, 2]);
        assert_eq!(select_tensors(&[2, 0], 3).unwrap(), vec![2, 0]);
        assert_eq!(
            select_tensors(&[3], 3).unwrap_err().status(),
            StatusCode::ParamInvalid
        );
    }
}
