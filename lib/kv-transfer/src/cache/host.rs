// SPDX-FileCopyrightText: Copyright (c) 2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! In-memory [`CacheStore`] over host buffers.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use parking_lot::Mutex;
use validator::Validate;

use super::{CacheDesc, CacheEntry, CacheStore, HostBuffer, KvKey, MemRegion};
use crate::status::{LlmError, Result};

#[derive(Default)]
struct Inner {
    next_id: i64,
    entries: HashMap<i64, Arc<CacheEntry>>,
    keys: HashMap<KvKey, i64>,
    // base address -> buffer, for raw-address resolution
    addrs: BTreeMap<u64, Arc<HostBuffer>>,
}

#[derive(Default)]
pub struct HostCacheStore {
    inner: Mutex<Inner>,
}

impl HostCacheStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl CacheStore for HostCacheStore {
    fn allocate(&self, desc: &CacheDesc) -> Result<i64> {
        desc.validate()
            .map_err(|e| LlmError::param(format!("invalid cache desc: {e}")))?;
        let size = usize::try_from(desc.tensor_size)
            .map_err(|_| LlmError::BufferAllocFailed(usize::MAX))?;
        let tensors = (0..desc.num_tensors)
            .map(|_| HostBuffer::zeroed(size))
            .collect::<Result<Vec<_>>>()?;

        let mut inner = self.inner.lock();
        let cache_id = inner.next_id;
        inner.next_id += 1;
        for tensor in &tensors {
            inner.addrs.insert(tensor.addr(), tensor.clone());
        }
        inner
            .entries
            .insert(cache_id, Arc::new(CacheEntry::new(cache_id, desc, tensors)));
        tracing::debug!(cache_id, ?desc, "allocated cache");
        Ok(cache_id)
    }

    fn deallocate(&self, cache_id: i64) -> Result<()> {
        let mut inner = self.inner.lock();
        let entry = inner
            .entries
            .remove(&cache_id)
            .ok_or_else(|| LlmError::KvNotExist(format!("cache {cache_id}")))?;
        for tensor in &entry.tensors {
            inner.addrs.remove(&tensor.addr());
        }
        inner.keys.retain(|_, id| *id != cache_id);
        Ok(())
    }

    fn entry(&self, cache_id: i64) -> Option<Arc<CacheEntry>> {
        self.inner.lock().entries.get(&cache_id).cloned()
    }

    fn entry_by_key(&self, key: &KvKey) -> Option<(Arc<CacheEntry>, u32, u64)> {
        let inner = self.inner.lock();
        let entry = inner.entries.get(inner.keys.get(key)?)?.clone();
        drop(inner);
        let (batch_index, size) = entry.key_slot(key)?;
        Some((entry, batch_index, size))
    }

    fn bind_key(&self, cache_id: i64, key: KvKey, batch_index: u32, size: u64) -> Result<()> {
        let mut inner = self.inner.lock();
        if inner.keys.contains_key(&key) {
            return Err(LlmError::RepeatRequest(format!("{key:?} already bound")));
        }
        let entry = inner
            .entries
            .get(&cache_id)
            .cloned()
            .ok_or_else(|| LlmError::KvNotExist(format!("cache {cache_id}")))?;
        entry.bind_key(key, batch_index, size)?;
        inner.keys.insert(key, cache_id);
        Ok(())
    }

    fn remove_index(&self, key: &KvKey) -> bool {
        let mut inner = self.inner.lock();
        let Some(cache_id) = inner.keys.remove(key) else {
            return false;
        };
        if let Some(entry) = inner.entries.get(&cache_id) {
            entry.unbind_key(key);
        }
        true
    }

    fn resolve_address(&self, addr: u64, len: u64) -> Option<MemRegion> {
        let inner = self.inner.lock();
        let (&base, buffer) = inner.addrs.range(..=addr).next_back()?;
        let offset = addr - base;
        let end = offset.checked_add(len)?;
        if end > buffer.len() as u64 {
            return None;
        }
        MemRegion::new(buffer.clone(), offset as usize, len as usize).ok()
    }
}
