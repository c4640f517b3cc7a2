// SPDX-FileCopyrightText: Copyright (c) 2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Process-wide collaborators shared by every component of one side.

use std::sync::Arc;
use std::time::Duration;

use crate::cache::{CacheStore, HostBuffer, KvCacheManager};
use crate::config::CommConfig;
use crate::status::{LlmError, Result};
use crate::timing::{Deadline, resolve_timeout_us};
use crate::transport::{MemHandle, Transport};

pub struct CommContext {
    config: CommConfig,
    transport: Arc<dyn Transport>,
    store: Arc<dyn CacheStore>,
    kv_index: Arc<KvCacheManager>,
}

impl CommContext {
    pub fn new(
        config: CommConfig,
        transport: Arc<dyn Transport>,
        store: Arc<dyn CacheStore>,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            transport,
            store,
            kv_index: Arc::new(KvCacheManager::new()),
        })
    }

    pub fn config(&self) -> &CommConfig {
        &self.config
    }

    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    pub fn store(&self) -> &Arc<dyn CacheStore> {
        &self.store
    }

    pub fn kv_index(&self) -> &Arc<KvCacheManager> {
        &self.kv_index
    }

    pub fn cluster_id(&self) -> u64 {
        self.config.cluster_id
    }

    pub fn transfer_timeout(&self, timeout_us: u64) -> Duration {
        resolve_timeout_us(timeout_us, self.config.transfer.default_timeout_us)
    }

    pub fn link_timeout(&self, timeout_us: u64) -> Duration {
        resolve_timeout_us(timeout_us, self.config.link.default_timeout_us)
    }

    pub fn transfer_deadline(&self, timeout_us: u64) -> Deadline {
        Deadline::new(
            self.transfer_timeout(timeout_us),
            self.config.transfer.timeout_check_interval,
        )
    }

    pub fn link_deadline(&self, timeout_us: u64) -> Deadline {
        Deadline::new(
            self.link_timeout(timeout_us),
            self.config.transfer.timeout_check_interval,
        )
    }

    /// Pins `buffer` with the transport for as long as the returned guard
    /// lives.
    pub fn register_memory(&self, buffer: &Arc<HostBuffer>) -> Result<MemoryRegistration> {
        let handle = self
            .transport
            .register_memory(buffer.addr(), buffer.len())
            .map_err(|e| LlmError::DriverFailed(format!("register {buffer:?}: {e}")))?;
        Ok(MemoryRegistration {
            transport: self.transport.clone(),
            handle,
            buffer: buffer.clone(),
        })
    }
}

/// Pinned memory; unregistered on drop.
pub struct MemoryRegistration {
    transport: Arc<dyn Transport>,
    handle: MemHandle,
    buffer: Arc<HostBuffer>,
}

impl MemoryRegistration {
    pub fn buffer(&self) -> &Arc<HostBuffer> {
        &self.buffer
    }

    pub fn handle(&self) -> MemHandle {
        self.handle
    }
}

impl Drop for MemoryRegistration {
    fn drop(&mut self) {
        if let Err(e) = self.transport.unregister_memory(self.handle) {
            tracing::warn!(buffer = ?self.buffer, error = %e, "failed to unregister memory");
        }
    }
}

impl std::fmt::Debug for MemoryRegistration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryRegistration")
            .field("handle", &self.handle)
            .field("buffer", &self.buffer)
            .finish()
    }
}
