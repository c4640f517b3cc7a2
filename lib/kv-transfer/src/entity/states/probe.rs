// SPDX-FileCopyrightText: Copyright (c) 2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

use std::time::Instant;

use super::{EntityState, StateId};
use crate::entity::{CommEntity, Role, Transition};
use crate::protocol::{CHECK_LINK_TOKEN_SIZE, UNLINK_TOKEN_SIZE};
use crate::status::Result;

pub(super) struct ProbeState;

impl EntityState for ProbeState {
    fn process(&self, entity: &mut CommEntity) -> Result<Transition> {
        let Some(envelope) = entity.probe()? else {
            return Ok(Transition::Keep);
        };
        entity.occupied = true;
        entity.op_start = Some(Instant::now());

        let count = entity.conn.transport().get_count(&envelope);
        let next = match entity.role {
            Role::Server => match count {
                UNLINK_TOKEN_SIZE => StateId::Unlink,
                CHECK_LINK_TOKEN_SIZE => StateId::ReceiveCheck,
                _ => StateId::Receive,
            },
            Role::Client => StateId::ReceiveTransferReq,
        };
        Ok(Transition::To(next))
    }
}
