// SPDX-FileCopyrightText: Copyright (c) 2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Decoder side of a push from the prompt, one layer per round.

use super::{EntityState, StateId};
use crate::entity::push::place_message;
use crate::entity::{CommEntity, Transition};
use crate::protocol::{TransferToRemoteRequest, TransferToRemoteResponse};
use crate::status::{Result, StatusCode};
use crate::transport::TransportError;

/// Receives the layer request, resolves where its slots land and answers.
/// The answer is sent even when the request is rejected.
pub(super) struct ReceiveTransferReqState;

impl EntityState for ReceiveTransferReqState {
    fn process(&self, entity: &mut CommEntity) -> Result<Transition> {
        if entity.scratch.reply.is_none() {
            let Some(data) = entity.receive_probed()? else {
                return Ok(Transition::Keep);
            };
            entity.scratch.envelope = None;
            entity.scratch.staging = None;

            let status = match TransferToRemoteRequest::decode(&data) {
                Ok(req) => match entity.resolve_transfer_dests(&req) {
                    Ok(dests) => {
                        entity.scratch.dests = dests;
                        entity.scratch.cursor = 0;
                        entity.scratch.filled = 0;
                        StatusCode::Success
                    }
                    Err(e) => {
                        tracing::warn!(
                            layer = req.layer_index,
                            error = %e,
                            "cannot place transfer"
                        );
                        e.status()
                    }
                },
                Err(e) => {
                    tracing::warn!(error = %e, "rejecting transfer request");
                    StatusCode::ParamInvalid
                }
            };
            entity.scratch.reply = Some(status);
            entity.scratch.queue.push_back(
                TransferToRemoteResponse {
                    ret_code: status.as_u32(),
                }
                .encode()
                .into(),
            );
        }

        entity.flush_queue()?;
        entity.poll_sends()?;
        if !entity.sends_done() {
            return Ok(Transition::Keep);
        }
        if entity.scratch.reply == Some(StatusCode::Success) {
            Ok(Transition::To(StateId::ReceiveTransferCache))
        } else {
            entity.stats.transfer_failed += 1;
            Ok(Transition::To(StateId::Idle))
        }
    }
}

/// Receives the key slots then the value slots of the current layer. A
/// message covering several slots is scattered into them.
pub(super) struct ReceiveTransferCacheState;

impl EntityState for ReceiveTransferCacheState {
    fn process(&self, entity: &mut CommEntity) -> Result<Transition> {
        entity.poll_recvs()?;
        while entity.scratch.cursor < entity.scratch.dests.len() {
            let Some(envelope) = entity.probe()? else {
                return Ok(Transition::Keep);
            };
            let count = entity.conn.transport().get_count(&envelope);
            let (mut regions, cursor, filled) = place_message(
                &entity.scratch.dests,
                entity.scratch.cursor,
                entity.scratch.filled,
                count,
            )?;
            let transport = entity.conn.transport().clone();
            let posted = if regions.len() == 1 {
                let region = regions.remove(0);
                entity.scratch.recvs.imrecv(transport.as_ref(), envelope, region)
            } else {
                entity
                    .scratch
                    .recvs
                    .imrecv_scatter(transport.as_ref(), envelope, regions)
            };
            match posted {
                Ok(()) => entity.stats.recv_requests += 1,
                Err(TransportError::Again) => {
                    // envelope stays pending, position unchanged
                    entity.stats.again_count += 1;
                    return Ok(Transition::Keep);
                }
                Err(e) => return Err(e.into()),
            }
            entity.scratch.envelope = None;
            entity.scratch.cursor = cursor;
            entity.scratch.filled = filled;
        }

        entity.poll_recvs()?;
        if !entity.scratch.recvs.is_empty() {
            return Ok(Transition::Keep);
        }
        entity.stats.transfer_received += 1;
        if let Some(start) = entity.op_start {
            entity.stats.receive_cost.record(start.elapsed());
        }
        Ok(Transition::To(StateId::Idle))
    }
}
