// SPDX-FileCopyrightText: Copyright (c) 2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

use super::EntityState;
use crate::entity::{CommEntity, Transition};
use crate::protocol::{CLIENT_CLUSTER_INFO_SIZE, ClientClusterInfo};
use crate::status::{LlmError, Result};

/// Waits for the handshake a decoder sends right after connecting.
pub(super) struct LinkState;

impl EntityState for LinkState {
    fn process(&self, entity: &mut CommEntity) -> Result<Transition> {
        let Some(envelope) = entity.probe()? else {
            return Ok(Transition::Keep);
        };
        let count = entity.conn.transport().get_count(&envelope);
        if count != CLIENT_CLUSTER_INFO_SIZE {
            return Err(LlmError::param(format!(
                "link handshake of {count} bytes, expected {CLIENT_CLUSTER_INFO_SIZE}"
            )));
        }
        let Some(data) = entity.receive_probed()? else {
            return Ok(Transition::Keep);
        };
        let info = ClientClusterInfo::decode(&data)?;
        tracing::info!(
            remote = info.cluster_id,
            role = ?info.role,
            peer = %entity.peer_addr,
            "link established"
        );
        entity.remote_cluster_id = Some(info.cluster_id);
        entity.peer_pull_chunk =
            (info.pull_chunk_bytes > 0).then_some(u64::from(info.pull_chunk_bytes));
        entity.reset_scratch();
        Ok(Transition::EstablishLink)
    }
}
