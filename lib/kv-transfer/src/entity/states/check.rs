// SPDX-FileCopyrightText: Copyright (c) 2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

use super::{EntityState, StateId};
use crate::entity::{CommEntity, Transition};
use crate::status::Result;

/// Consumes the liveness token sent by `check_link` on the decoder.
pub(super) struct ReceiveCheckState;

impl EntityState for ReceiveCheckState {
    fn process(&self, entity: &mut CommEntity) -> Result<Transition> {
        if entity.receive_probed()?.is_none() {
            return Ok(Transition::Keep);
        }
        entity.stats.check_received += 1;
        Ok(Transition::To(StateId::Idle))
    }
}
