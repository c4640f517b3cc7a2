// SPDX-FileCopyrightText: Copyright (c) 2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

use super::{EntityState, StateId};
use crate::entity::{CommEntity, Transition};
use crate::status::Result;

/// The decoder announced it is unlinking. Failures here still end in
/// Destroy.
pub(super) struct UnlinkState;

impl EntityState for UnlinkState {
    fn process(&self, entity: &mut CommEntity) -> Result<Transition> {
        if entity.receive_probed()?.is_none() {
            return Ok(Transition::Keep);
        }
        tracing::info!(
            remote = ?entity.remote_cluster_id,
            peer = %entity.peer_addr,
            "peer unlinked"
        );
        entity.teardown(false);
        Ok(Transition::To(StateId::Destroy))
    }
}
