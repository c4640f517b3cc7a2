// SPDX-FileCopyrightText: Copyright (c) 2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! KV cache index keyed by request and prefix.
//!
//! Maps `(req_id, model_id)` and `(prefix_id, model_id)` to an internal cache
//! id, and cache ids to the tensors plus the byte range each key owns inside
//! them. Several keys may share one cache id (a batch of requests written
//! into the same tensors at different offsets).

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

use super::{HostBuffer, KvKey, MemRegion};
use crate::status::{LlmError, Result};

/// One `(tensor, offset, size)` triple ready for the transport.
#[derive(Debug, Clone)]
pub struct KvSlice {
    pub tensor: Arc<HostBuffer>,
    pub offset: u64,
    pub size: u64,
}

impl KvSlice {
    pub fn region(&self) -> Result<MemRegion> {
        MemRegion::new(
            self.tensor.clone(),
            self.offset as usize,
            self.size as usize,
        )
    }
}

#[derive(Debug)]
struct KvEntry {
    tensors: Vec<Arc<HostBuffer>>,
    slots: HashMap<KvKey, (u64, u64)>,
}

#[derive(Debug, Default)]
struct Inner {
    next_id: u64,
    index: HashMap<KvKey, u64>,
    entries: HashMap<u64, KvEntry>,
}

impl Inner {
    fn unlink(&mut self, key: &KvKey) -> bool {
        let Some(cache_id) = self.index.remove(key) else {
            return false;
        };
        if let Some(entry) = self.entries.get_mut(&cache_id) {
            entry.slots.remove(key);
            if entry.slots.is_empty() {
                self.entries.remove(&cache_id);
            }
        }
        true
    }
}

/// Slot of a key as seen by the first phase of a shrink.
#[derive(Debug)]
struct ShrinkSnapshot {
    cache_id: u64,
    offset: u64,
    size: u64,
    tensors: Vec<Arc<HostBuffer>>,
}

impl ShrinkSnapshot {
    fn copy(&self) -> Result<Vec<Arc<HostBuffer>>> {
        self.tensors
            .iter()
            .map(|tensor| {
                let data = tensor.read(self.offset as usize, self.size as usize)?;
                let buffer = HostBuffer::zeroed(data.len())?;
                buffer.write(0, &data)?;
                Ok(buffer)
            })
            .collect()
    }
}

#[derive(Debug, Default)]
pub struct KvCacheManager {
    inner: Mutex<Inner>,
}

fn check_slot(tensors: &[Arc<HostBuffer>], offset: u64, size: u64) -> Result<()> {
    if tensors.is_empty() {
        return Err(LlmError::param("kv entry without tensors"));
    }
    let end = offset
        .checked_add(size)
        .ok_or_else(|| LlmError::param("kv slot overflows"))?;
    if let Some(t) = tensors.iter().find(|t| end > t.len() as u64) {
        return Err(LlmError::param(format!(
            "kv slot {offset}+{size} outside tensor of {} bytes",
            t.len()
        )));
    }
    Ok(())
}

impl KvCacheManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores a new entry for `key`; returns its cache id.
    pub fn save(
        &self,
        key: KvKey,
        tensors: Vec<Arc<HostBuffer>>,
        offset: u64,
        size: u64,
    ) -> Result<u64> {
        check_slot(&tensors, offset, size)?;
        let mut inner = self.inner.lock();
        if inner.index.contains_key(&key) {
            return Err(LlmError::RepeatRequest(format!("{key:?}")));
        }
        let cache_id = inner.next_id;
        inner.next_id += 1;
        inner.entries.insert(
            cache_id,
            KvEntry {
                tensors,
                slots: HashMap::from([(key, (offset, size))]),
            },
        );
        inner.index.insert(key, cache_id);
        Ok(cache_id)
    }

    /// Publishes `key` into the tensors of an existing entry.
    pub fn save_into(&self, cache_id: u64, key: KvKey, offset: u64, size: u64) -> Result<()> {
        let mut inner = self.inner.lock();
        if inner.index.contains_key(&key) {
            return Err(LlmError::RepeatRequest(format!("{key:?}")));
        }
        let entry = inner
            .entries
            .get_mut(&cache_id)
            .ok_or_else(|| LlmError::KvNotExist(format!("kv cache {cache_id}")))?;
        check_slot(&entry.tensors, offset, size)?;
        entry.slots.insert(key, (offset, size));
        inner.index.insert(key, cache_id);
        Ok(())
    }

    pub fn release(&self, key: &KvKey) -> bool {
        self.inner.lock().unlink(key)
    }

    /// Releases every request key carrying `req_id`, whatever the model.
    pub fn release_request(&self, req_id: u64) -> usize {
        let mut inner = self.inner.lock();
        let keys: Vec<KvKey> = inner
            .index
            .keys()
            .filter(|k| matches!(k, KvKey::Request { req_id: r, .. } if *r == req_id))
            .copied()
            .collect();
        keys.iter().filter(|k| inner.unlink(k)).count()
    }

    pub fn contains(&self, key: &KvKey) -> bool {
        self.inner.lock().index.contains_key(key)
    }

    pub fn cache_id(&self, key: &KvKey) -> Option<u64> {
        self.inner.lock().index.get(key).copied()
    }

    /// One slice per tensor of the entry `key` belongs to.
    pub fn query(&self, key: &KvKey) -> Result<Vec<KvSlice>> {
        let inner = self.inner.lock();
        let entry = inner
            .index
            .get(key)
            .and_then(|id| inner.entries.get(id))
            .ok_or_else(|| LlmError::KvNotExist(format!("{key:?}")))?;
        let (offset, size) = entry.slots[key];
        Ok(entry
            .tensors
            .iter()
            .map(|tensor| KvSlice {
                tensor: tensor.clone(),
                offset,
                size,
            })
            .collect())
    }

    /// Copies the slice of a prefix into buffers of exactly its size and
    /// rebinds the prefix to them, freeing the original entry once no other
    /// key refers to it. Returns the new cache id.
    ///
    /// The copy runs without the lock. If `key` is released or re-saved in
    /// the meantime the copy is dropped and the index is left untouched.
    pub fn shrink(&self, key: &KvKey) -> Result<u64> {
        let snapshot = self.begin_shrink(key)?;
        let copies = snapshot.copy()?;
        self.finish_shrink(key, snapshot, copies)
    }

    fn begin_shrink(&self, key: &KvKey) -> Result<ShrinkSnapshot> {
        let inner = self.inner.lock();
        let (cache_id, entry) = inner
            .index
            .get(key)
            .and_then(|id| Some((*id, inner.entries.get(id)?)))
            .ok_or_else(|| LlmError::KvNotExist(format!("{key:?}")))?;
        let (offset, size) = entry.slots[key];
        Ok(ShrinkSnapshot {
            cache_id,
            offset,
            size,
            tensors: entry.tensors.clone(),
        })
    }

    fn finish_shrink(
        &self,
        key: &KvKey,
        snapshot: ShrinkSnapshot,
        copies: Vec<Arc<HostBuffer>>,
    ) -> Result<u64> {
        let mut inner = self.inner.lock();
        let current = inner
            .index
            .get(key)
            .copied()
            .ok_or_else(|| LlmError::KvNotExist(format!("{key:?} released while shrinking")))?;
        let slot = inner
            .entries
            .get(&current)
            .and_then(|entry| entry.slots.get(key).copied());
        if current != snapshot.cache_id || slot != Some((snapshot.offset, snapshot.size)) {
            return Err(LlmError::RepeatRequest(format!(
                "{key:?} re-saved while shrinking"
            )));
        }
        inner.unlink(key);
        let cache_id = inner.next_id;
        inner.next_id += 1;
        inner.entries.insert(
            cache_id,
            KvEntry {
                tensors: copies,
                slots: HashMap::from([(*key, (0, snapshot.size))]),
            },
        );
        inner.index.insert(*key, cache_id);
        tracing::debug!(?key, cache_id, size = snapshot.size, "shrunk kv cache");
        Ok(cache_id)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn entry_count(&self) -> usize {
        self.inner.lock().entries.len()
    }
}
