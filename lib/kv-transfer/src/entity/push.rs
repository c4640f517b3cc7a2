// SPDX-FileCopyrightText: Copyright (c) 2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Push path: the prompt writes a cache into the decoder, one layer at a
//! time. Each layer is a [`TransferToRemoteRequest`] answered by a
//! [`TransferToRemoteResponse`], then the key slots and the value slots.
//! The decoder knows every slot size, so the layer is a plain byte stream:
//! large slots are split into `max_send_bytes` chunks, runs of small slots
//! are packed into one message, and there is no closing empty message. A
//! packed message lands in several destination regions at once.

use std::time::Instant;

use bytes::BytesMut;

use super::{CommEntity, RequestScope, chunk_buffer};
use crate::blocks::aggregate_block_pairs;
use crate::cache::MemRegion;
use crate::protocol::{
    INVALID_CACHE_ID, TransferKvRequest, TransferSlot, TransferToRemoteRequest,
    TransferToRemoteResponse,
};
use crate::status::{LlmError, Result, StatusCode};
use crate::timing::Deadline;
use crate::transport::SendBuffer;

/// Messages for the slots of one layer. Slots of at least `max` bytes are
/// chunked; consecutive smaller ones share a message of at most `max` bytes.
pub(crate) fn pack_slots(sources: Vec<MemRegion>, max: u64) -> Result<Vec<SendBuffer>> {
    fn flush(group: &mut Vec<MemRegion>, out: &mut Vec<SendBuffer>) {
        match group.len() {
            0 => {}
            1 => out.extend(group.pop().map(SendBuffer::from)),
            _ => {
                let len = group.iter().map(MemRegion::len).sum();
                let mut packed = BytesMut::with_capacity(len);
                for region in group.drain(..) {
                    packed.extend_from_slice(&region.read());
                }
                out.push(SendBuffer::Bytes(packed.freeze()));
            }
        }
    }

    let mut out = Vec::new();
    let mut group: Vec<MemRegion> = Vec::new();
    let mut group_len = 0u64;
    for source in sources.into_iter().filter(|s| !s.is_empty()) {
        let len = source.len() as u64;
        if len >= max {
            flush(&mut group, &mut out);
            group_len = 0;
            out.extend(chunk_buffer(source.into(), max, false)?);
            continue;
        }
        if group_len + len > max {
            flush(&mut group, &mut out);
            group_len = 0;
        }
        group_len += len;
        group.push(source);
    }
    flush(&mut group, &mut out);
    Ok(out)
}

/// Destination regions a `count` byte message covers when the layer stream
/// is at `filled` bytes into slot `cursor`. Returns the regions and the new
/// stream position.
pub(crate) fn place_message(
    dests: &[MemRegion],
    cursor: usize,
    filled: usize,
    count: usize,
) -> Result<(Vec<MemRegion>, usize, usize)> {
    if count == 0 {
        return Err(LlmError::param("empty transfer message"));
    }
    let (mut cursor, mut filled, mut remaining) = (cursor, filled, count);
    let mut regions = Vec::new();
    while remaining > 0 {
        let dst = dests.get(cursor).ok_or_else(|| {
            LlmError::param(format!(
                "transfer message of {count} bytes overflows the {} slots of the layer",
                dests.len()
            ))
        })?;
        let take = (dst.len() - filled).min(remaining);
        regions.push(dst.slice(filled, take)?);
        remaining -= take;
        filled += take;
        if filled == dst.len() {
            cursor += 1;
            filled = 0;
        }
    }
    Ok((regions, cursor, filled))
}

struct LayerPlan {
    request: TransferToRemoteRequest,
    /// Key slot sources followed by value slot sources.
    sources: Vec<MemRegion>,
}

impl CommEntity {
    // ----- prompt side -----

    fn transfer_plan(&self, req: &TransferKvRequest) -> Result<Vec<LayerPlan>> {
        let entry = self
            .ctx
            .store()
            .entry(req.src_cache_id)
            .ok_or_else(|| LlmError::KvNotExist(format!("cache {}", req.src_cache_id)))?;
        let layers = entry.layer_num();
        if layers == 0 {
            return Err(LlmError::param(format!(
                "cache {} holds no key/value layers",
                req.src_cache_id
            )));
        }
        let raw = !req.layer_addrs.is_empty();
        if raw && req.layer_addrs.len() != layers {
            return Err(LlmError::param(format!(
                "{} layer addresses for {layers} layers",
                req.layer_addrs.len()
            )));
        }
        if !raw && req.dst_cache_id < 0 {
            return Err(LlmError::param(format!(
                "destination cache id {} is invalid",
                req.dst_cache_id
            )));
        }

        // (source block start, block count) per slot, or the whole batch slot
        let (slots, src_runs, batch_index) = if req.is_block_transfer() {
            if !entry.is_paged() {
                return Err(LlmError::param(format!(
                    "block transfer from non-paged cache {}",
                    req.src_cache_id
                )));
            }
            let block_bytes = entry.batch_stride;
            let runs = aggregate_block_pairs(&req.src_blocks, &req.dst_blocks)?;
            let slots = runs
                .iter()
                .map(|run| {
                    let offset = run.dst_start.checked_mul(block_bytes);
                    let size = run.len.checked_mul(block_bytes);
                    match (offset, size) {
                        (Some(offset), Some(size)) => Ok(TransferSlot { offset, size }),
                        _ => Err(LlmError::param("block offset overflows")),
                    }
                })
                .collect::<Result<Vec<_>>>()?;
            let src_runs: Vec<Option<(u64, u64)>> = runs
                .iter()
                .map(|run| Some((run.src_start, run.len)))
                .collect();
            (slots, src_runs, 0)
        } else {
            let slots = vec![TransferSlot {
                offset: 0,
                size: entry.batch_stride,
            }];
            (slots, vec![None], req.dst_batch_index)
        };

        let source = |tensor: usize, run: Option<(u64, u64)>| match run {
            Some((start, count)) => entry.block_region(tensor, start, count),
            None => entry.batch_region(tensor, req.src_batch_index, None),
        };

        (0..layers)
            .map(|layer| {
                let (key_addr, value_addr, cache_id) = match req.layer_addrs.get(layer) {
                    Some(addr) => (addr.key_addr, addr.value_addr, INVALID_CACHE_ID),
                    None => (0, 0, req.dst_cache_id),
                };
                let mut sources = Vec::with_capacity(src_runs.len() * 2);
                for tensor in [2 * layer, 2 * layer + 1] {
                    for run in &src_runs {
                        sources.push(source(tensor, *run)?);
                    }
                }
                Ok(LayerPlan {
                    request: TransferToRemoteRequest {
                        key_addr,
                        value_addr,
                        cache_id,
                        batch_index,
                        layer_index: layer as u32,
                        slots: slots.clone(),
                    },
                    sources,
                })
            })
            .collect()
    }

    /// Pushes a local cache into the decoder behind this connection.
    ///
    /// A rejected layer surfaces as [`LlmError::Remote`] and leaves the
    /// entity healthy; a timeout or transport failure closes the connection
    /// and moves the entity to Error.
    pub fn transfer(&mut self, req: &TransferKvRequest) -> Result<()> {
        let start = Instant::now();
        let plan = self.transfer_plan(req)?;
        self.scope = RequestScope::new(req.req_id, req.prefix_id, req.model_id);
        self.occupied = true;
        let mut deadline = self.ctx.transfer_deadline(req.timeout_us as u64);

        let mut result = Ok(());
        for layer in plan {
            result = self.push_layer(layer, &mut deadline);
            if result.is_err() {
                break;
            }
        }
        self.reset_scratch();

        match &result {
            Ok(()) => {
                self.stats.serve_cost.record(start.elapsed());
                tracing::debug!(scope = ?self.scope, "transfer complete");
            }
            Err(err @ LlmError::Remote { .. }) => {
                self.stats.transfer_failed += 1;
                tracing::warn!(scope = ?self.scope, error = %err, "decoder rejected transfer");
            }
            Err(err) => {
                self.stats.transfer_failed += 1;
                self.fail_connection(err);
            }
        }
        result
    }

    fn push_layer(&mut self, layer: LayerPlan, deadline: &mut Deadline) -> Result<()> {
        let layer_index = layer.request.layer_index;
        self.send_blocking(layer.request.encode().into(), deadline)?;
        let reply = TransferToRemoteResponse::decode(&self.recv_blocking(deadline)?)?;
        StatusCode::from_u32(reply.ret_code).into_result(format!(
            "transfer of layer {layer_index} to cluster {}",
            self.remote_cluster_id.unwrap_or_default()
        ))?;

        let max = self.ctx.config().transfer.max_send_bytes;
        self.scratch.queue.extend(pack_slots(layer.sources, max)?);
        self.drain_sends(deadline)
    }

    // ----- decoder side -----

    /// Where the slots of one layer land: key slots first, then value slots.
    /// Zero-sized slots carry no data and are skipped.
    pub(super) fn resolve_transfer_dests(
        &self,
        req: &TransferToRemoteRequest,
    ) -> Result<Vec<MemRegion>> {
        let slots: Vec<&TransferSlot> = req.slots.iter().filter(|s| s.size > 0).collect();
        let mut keys = Vec::with_capacity(slots.len() * 2);
        let mut values = Vec::with_capacity(slots.len());

        if req.cache_id < 0 {
            let store = self.ctx.store();
            let resolve = |base: u64, slot: &TransferSlot| {
                base.checked_add(slot.offset)
                    .and_then(|addr| store.resolve_address(addr, slot.size))
                    .ok_or_else(|| {
                        LlmError::param(format!(
                            "address {base:#x}+{} ({} bytes) is not registered",
                            slot.offset, slot.size
                        ))
                    })
            };
            for slot in slots {
                keys.push(resolve(req.key_addr, slot)?);
                values.push(resolve(req.value_addr, slot)?);
            }
        } else {
            let entry = self
                .ctx
                .store()
                .entry(req.cache_id)
                .ok_or_else(|| LlmError::KvNotExist(format!("cache {}", req.cache_id)))?;
            let layer = req.layer_index as usize;
            if layer >= entry.layer_num() {
                return Err(LlmError::param(format!(
                    "layer {layer} >= {} layers in cache {}",
                    entry.layer_num(),
                    req.cache_id
                )));
            }
            if req.batch_index >= entry.batch_size {
                return Err(LlmError::param(format!(
                    "batch index {} >= batch size {}",
                    req.batch_index, entry.batch_size
                )));
            }
            let base = req.batch_index as u64 * entry.batch_stride;
            for slot in slots {
                let offset = base
                    .checked_add(slot.offset)
                    .ok_or_else(|| LlmError::param("slot offset overflows"))?;
                keys.push(entry.tensor_region(2 * layer, offset, slot.size)?);
                values.push(entry.tensor_region(2 * layer + 1, offset, slot.size)?);
            }
        }
        keys.extend(values);
        Ok(keys)
    }
}
