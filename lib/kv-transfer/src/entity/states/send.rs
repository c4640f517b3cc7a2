// SPDX-FileCopyrightText: Copyright (c) 2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

use super::{EntityState, StateId};
use crate::entity::{CommEntity, Transition};
use crate::status::Result;

/// Serves a pull: meta reply, then the cache slots. Sends refused with
/// `Again` stay queued for the next sweep.
pub(super) struct SendState;

impl EntityState for SendState {
    fn process(&self, entity: &mut CommEntity) -> Result<Transition> {
        if !entity.scratch.prepared {
            entity.prepare_pull_reply()?;
        }
        entity.flush_queue()?;
        entity.poll_sends()?;
        if !entity.sends_done() {
            return Ok(Transition::Keep);
        }
        entity.finish_pull_reply();
        Ok(Transition::To(StateId::Idle))
    }
}
