// SPDX-FileCopyrightText: Copyright (c) 2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! State objects of the entity state machine.
//!
//! | State                | Role   | Exits                                  |
//! |----------------------|--------|----------------------------------------|
//! | Init                 | both   | Link (server), Probe (client)          |
//! | Link                 | server | Idle (link established)                |
//! | Idle                 | both   | Probe                                  |
//! | Probe                | both   | Unlink, ReceiveCheck, Receive, ReceiveTransferReq |
//! | Receive              | server | Send                                   |
//! | Send                 | server | Idle                                   |
//! | ReceiveTransferReq   | client | ReceiveTransferCache, Idle             |
//! | ReceiveTransferCache | client | Idle                                   |
//! | ReceiveCheck         | server | Idle                                   |
//! | Unlink               | server | Destroy                                |
//! | Error, Destroy       | both   | absorbing                              |

mod check;
mod idle;
mod init;
mod link;
mod probe;
mod receive;
mod send;
mod terminal;
mod transfer;
mod unlink;

use super::{CommEntity, Transition};
use crate::status::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StateId {
    Init,
    Link,
    Idle,
    Probe,
    Receive,
    Send,
    ReceiveTransferReq,
    ReceiveTransferCache,
    ReceiveCheck,
    Unlink,
    Error,
    Destroy,
}

pub(super) trait EntityState: Sync {
    fn process(&self, entity: &mut CommEntity) -> Result<Transition>;
}

fn state_for(id: StateId) -> &'static dyn EntityState {
    match id {
        StateId::Init => &init::InitState,
        StateId::Link => &link::LinkState,
        StateId::Idle => &idle::IdleState,
        StateId::Probe => &probe::ProbeState,
        StateId::Receive => &receive::ReceiveState,
        StateId::Send => &send::SendState,
        StateId::ReceiveTransferReq => &transfer::ReceiveTransferReqState,
        StateId::ReceiveTransferCache => &transfer::ReceiveTransferCacheState,
        StateId::ReceiveCheck => &check::ReceiveCheckState,
        StateId::Unlink => &unlink::UnlinkState,
        StateId::Error => &terminal::ErrorState,
        StateId::Destroy => &terminal::DestroyState,
    }
}

pub(super) fn process(id: StateId, entity: &mut CommEntity) -> Result<Transition> {
    state_for(id).process(entity)
}
