// SPDX-FileCopyrightText: Copyright (c) 2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

use super::{EntityState, StateId};
use crate::entity::{CommEntity, Transition};
use crate::status::Result;

pub(super) struct IdleState;

impl EntityState for IdleState {
    fn process(&self, entity: &mut CommEntity) -> Result<Transition> {
        entity.reset_scratch();
        entity.maybe_dump_stats();
        Ok(Transition::To(StateId::Probe))
    }
}
