// SPDX-FileCopyrightText: Copyright (c) 2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

use super::{EntityState, StateId};
use crate::entity::{CommEntity, Role, Transition};
use crate::status::Result;

pub(super) struct InitState;

impl EntityState for InitState {
    fn process(&self, entity: &mut CommEntity) -> Result<Transition> {
        Ok(Transition::To(match entity.role {
            Role::Server => StateId::Link,
            Role::Client => StateId::Probe,
        }))
    }
}
