// SPDX-FileCopyrightText: Copyright (c) 2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

use super::EntityState;
use crate::entity::{CommEntity, Transition};
use crate::status::Result;

/// Resident until unlinked or the peer reconnects.
pub(super) struct ErrorState;

impl EntityState for ErrorState {
    fn process(&self, entity: &mut CommEntity) -> Result<Transition> {
        entity.reset_scratch();
        entity.dump_diagnostics();
        Ok(Transition::Keep)
    }
}

/// Erased by the registry on its next sweep.
pub(super) struct DestroyState;

impl EntityState for DestroyState {
    fn process(&self, _entity: &mut CommEntity) -> Result<Transition> {
        Ok(Transition::Keep)
    }
}
