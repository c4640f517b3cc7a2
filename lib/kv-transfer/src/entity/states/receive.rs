// SPDX-FileCopyrightText: Copyright (c) 2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

use super::{EntityState, StateId};
use crate::entity::{CommEntity, RequestScope, Transition};
use crate::protocol::SyncKvRequest;
use crate::status::{Result, StatusCode};

/// Receives a sync-kv request from the decoder. A malformed request is still
/// answered from Send, with `ParamInvalid`.
pub(super) struct ReceiveState;

impl EntityState for ReceiveState {
    fn process(&self, entity: &mut CommEntity) -> Result<Transition> {
        let Some(data) = entity.receive_probed()? else {
            return Ok(Transition::Keep);
        };
        entity.scratch.envelope = None;
        entity.scratch.staging = None;
        match SyncKvRequest::decode(&data) {
            Ok(req) => {
                entity.scope = RequestScope::new(req.req_id, req.prefix_id, req.model_id);
                entity.scratch.sync_req = Some(req);
            }
            Err(e) => {
                tracing::warn!(
                    remote = ?entity.remote_cluster_id,
                    error = %e,
                    "rejecting sync request"
                );
                entity.scratch.rejected = Some(StatusCode::ParamInvalid);
            }
        }
        Ok(Transition::To(StateId::Send))
    }
}
