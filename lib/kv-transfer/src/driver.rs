// SPDX-FileCopyrightText: Copyright (c) 2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Dedicated polling thread for one side of the registry.
//!
//! The registry itself never spawns threads; services and tests that want
//! background progress start a [`PollingDriver`] per side.

use std::sync::Arc;
use std::thread::JoinHandle;

use anyhow::Context;
use tokio_util::sync::CancellationToken;

use crate::registry::{EntityRegistry, Side};

#[derive(Debug)]
pub struct PollingDriver {
    side: Side,
    cancel_token: CancellationToken,
    thread: Option<JoinHandle<()>>,
}

impl PollingDriver {
    /// Starts a thread that runs `run_for(side, budget)` until cancelled,
    /// sleeping for the configured idle time whenever a run makes no
    /// progress.
    pub fn spawn(registry: Arc<EntityRegistry>, side: Side) -> anyhow::Result<Self> {
        Self::spawn_with_token(registry, side, CancellationToken::new())
    }

    pub fn spawn_with_token(
        registry: Arc<EntityRegistry>,
        side: Side,
        cancel_token: CancellationToken,
    ) -> anyhow::Result<Self> {
        let name = match side {
            Side::Prompt => "kv-transfer-prompt",
            Side::Decoder => "kv-transfer-decoder",
        };
        let token = cancel_token.clone();
        let thread = std::thread::Builder::new()
            .name(name.to_string())
            .spawn(move || run(registry, side, token))
            .with_context(|| format!("failed to spawn {name} thread"))?;
        tracing::debug!(?side, "polling driver started");
        Ok(Self {
            side,
            cancel_token,
            thread: Some(thread),
        })
    }

    pub fn side(&self) -> Side {
        self.side
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel_token.clone()
    }

    /// Cancels the loop and waits for the thread to exit.
    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        self.cancel_token.cancel();
        if let Some(thread) = self.thread.take()
            && thread.join().is_err()
        {
            tracing::error!(side = ?self.side, "polling thread panicked");
        }
    }
}

impl Drop for PollingDriver {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn run(registry: Arc<EntityRegistry>, side: Side, cancel_token: CancellationToken) {
    let budget = registry.context().config().poll.budget;
    let idle = registry.context().config().idle_sleep();
    while !cancel_token.is_cancelled() {
        if registry.run_for(side, budget) == 0 {
            std::thread::sleep(idle);
        }
    }
    tracing::debug!(?side, "polling driver stopped");
}
