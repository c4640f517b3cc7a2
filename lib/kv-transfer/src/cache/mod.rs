// SPDX-FileCopyrightText: Copyright (c) 2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Host memory, cache entries and the cache store interface.
//!
//! Tensor memory is owned by the cache store. The transfer layer only holds
//! [`MemRegion`]s: a shared handle to the backing [`HostBuffer`] plus a byte
//! range, so an in-flight transport request keeps its memory alive for as
//! long as the request exists.

mod host;
mod index;

pub use host::HostCacheStore;
pub use index::{KvCacheManager, KvSlice};

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use bytes::Bytes;
use derive_builder::Builder;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use validator::{Validate, ValidationError};

use crate::status::{LlmError, Result};

/// Key a cache slice is published under.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KvKey {
    Request { req_id: u64, model_id: u64 },
    Prefix { prefix_id: u64, model_id: u64 },
}

impl KvKey {
    pub fn request(req_id: u64, model_id: u64) -> Self {
        KvKey::Request { req_id, model_id }
    }

    pub fn prefix(prefix_id: u64, model_id: u64) -> Self {
        KvKey::Prefix { prefix_id, model_id }
    }
}

/// A fixed-size, pinned-in-place host allocation.
///
/// The boxed slice never moves once created, so its address doubles as the
/// transport-visible address used by raw-address transfers.
pub struct HostBuffer {
    data: Mutex<Box<[u8]>>,
    addr: u64,
    len: usize,
}

impl HostBuffer {
    /// Allocates `len` zeroed bytes, reporting allocation failure instead of
    /// aborting.
    pub fn zeroed(len: usize) -> Result<Arc<Self>> {
        let mut data: Vec<u8> = Vec::new();
        data.try_reserve_exact(len)
            .map_err(|_| LlmError::BufferAllocFailed(len))?;
        data.resize(len, 0);
        Ok(Self::from_vec(data))
    }

    pub fn from_vec(data: Vec<u8>) -> Arc<Self> {
        let data = data.into_boxed_slice();
        let addr = data.as_ptr() as u64;
        let len = data.len();
        Arc::new(Self {
            data: Mutex::new(data),
            addr,
            len,
        })
    }

    pub fn addr(&self) -> u64 {
        self.addr
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Raw pointer for transports that hand the memory to a driver.
    pub fn as_mut_ptr(&self) -> *mut u8 {
        self.data.lock().as_mut_ptr()
    }

    pub fn to_vec(&self) -> Vec<u8> {
        self.data.lock().to_vec()
    }

    pub fn fill(&self, value: u8) {
        self.data.lock().fill(value);
    }

    fn check(&self, offset: usize, len: usize) -> Result<()> {
        match offset.checked_add(len) {
            Some(end) if end <= self.len => Ok(()),
            _ => Err(LlmError::param(format!(
                "range {offset}+{len} outside buffer of {} bytes",
                self.len
            ))),
        }
    }

    pub fn read(&self, offset: usize, len: usize) -> Result<Bytes> {
        self.check(offset, len)?;
        Ok(Bytes::copy_from_slice(
            &self.data.lock()[offset..offset + len],
        ))
    }

    pub fn write(&self, offset: usize, src: &[u8]) -> Result<()> {
        self.check(offset, src.len())?;
        self.data.lock()[offset..offset + src.len()].copy_from_slice(src);
        Ok(())
    }
}

impl fmt::Debug for HostBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HostBuffer")
            .field("addr", &format_args!("{:#x}", self.addr))
            .field("len", &self.len)
            .finish()
    }
}

/// A byte range inside a [`HostBuffer`].
#[derive(Clone, Debug)]
pub struct MemRegion {
    buffer: Arc<HostBuffer>,
    offset: usize,
    len: usize,
}

impl MemRegion {
    pub fn new(buffer: Arc<HostBuffer>, offset: usize, len: usize) -> Result<Self> {
        buffer.check(offset, len)?;
        Ok(Self {
            buffer,
            offset,
            len,
        })
    }

    pub fn whole(buffer: Arc<HostBuffer>) -> Self {
        let len = buffer.len();
        Self {
            buffer,
            offset: 0,
            len,
        }
    }

    pub fn buffer(&self) -> &Arc<HostBuffer> {
        &self.buffer
    }

    pub fn offset(&self) -> usize {
        self.offset
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn addr(&self) -> u64 {
        self.buffer.addr() + self.offset as u64
    }

    /// Sub-range relative to this region.
    pub fn slice(&self, offset: usize, len: usize) -> Result<Self> {
        match offset.checked_add(len) {
            Some(end) if end <= self.len => {
                MemRegion::new(self.buffer.clone(), self.offset + offset, len)
            }
            _ => Err(LlmError::param(format!(
                "slice {offset}+{len} outside region of {} bytes",
                self.len
            ))),
        }
    }

    pub fn read(&self) -> Bytes {
        // range validated at construction
        self.buffer
            .read(self.offset, self.len)
            .unwrap_or_else(|_| Bytes::new())
    }

    pub fn write(&self, src: &[u8]) -> Result<()> {
        if src.len() > self.len {
            return Err(LlmError::param(format!(
                "write of {} bytes into region of {}",
                src.len(),
                self.len
            )));
        }
        self.buffer.write(self.offset, src)
    }
}

fn validate_stride(desc: &CacheDesc) -> std::result::Result<(), ValidationError> {
    if desc.batch_size == 0 || desc.tensor_size % desc.batch_size as u64 != 0 {
        return Err(ValidationError::new(
            "tensor_size must be a multiple of batch_size",
        ));
    }
    Ok(())
}

/// Allocation request for a cache entry.
///
/// In paged mode (`block_len > 0`) `batch_size` is the number of blocks and
/// the batch stride is the byte size of one block.
#[derive(Debug, Clone, Builder, Validate, Serialize, Deserialize, PartialEq, Eq)]
#[validate(schema(function = "validate_stride"))]
pub struct CacheDesc {
    /// Number of tensors, two (key, value) per layer.
    #[validate(range(min = 1))]
    pub num_tensors: usize,

    #[validate(range(min = 1))]
    pub batch_size: u32,

    /// Bytes per tensor.
    #[validate(range(min = 1))]
    pub tensor_size: u64,

    #[builder(default = "0")]
    #[serde(default)]
    pub block_len: u32,
}

impl CacheDesc {
    pub fn builder() -> CacheDescBuilder {
        CacheDescBuilder::default()
    }

    pub fn batch_stride(&self) -> u64 {
        self.tensor_size / self.batch_size as u64
    }
}

/// Tensor set of one allocation plus the keys published into its batch slots.
#[derive(Debug)]
pub struct CacheEntry {
    pub cache_id: i64,
    pub batch_size: u32,
    pub tensor_size: u64,
    pub batch_stride: u64,
    pub block_len: u32,
    pub tensors: Vec<Arc<HostBuffer>>,
    ids: RwLock<HashMap<KvKey, (u32, u64)>>,
}

impl CacheEntry {
    pub fn new(cache_id: i64, desc: &CacheDesc, tensors: Vec<Arc<HostBuffer>>) -> Self {
        Self {
            cache_id,
            batch_size: desc.batch_size,
            tensor_size: desc.tensor_size,
            batch_stride: desc.batch_stride(),
            block_len: desc.block_len,
            tensors,
            ids: RwLock::new(HashMap::new()),
        }
    }

    pub fn is_paged(&self) -> bool {
        self.block_len > 0
    }

    pub fn layer_num(&self) -> usize {
        self.tensors.len() / 2
    }

    pub fn key_slot(&self, key: &KvKey) -> Option<(u32, u64)> {
        self.ids.read().get(key).copied()
    }

    pub(crate) fn bind_key(&self, key: KvKey, batch_index: u32, size: u64) -> Result<()> {
        if batch_index >= self.batch_size || size > self.batch_stride {
            return Err(LlmError::param(format!(
                "slot ({batch_index}, {size}) outside cache {} ({} x {})",
                self.cache_id, self.batch_size, self.batch_stride
            )));
        }
        self.ids.write().insert(key, (batch_index, size));
        Ok(())
    }

    pub(crate) fn unbind_key(&self, key: &KvKey) -> bool {
        self.ids.write().remove(key).is_some()
    }

    fn tensor(&self, tensor_index: usize) -> Result<&Arc<HostBuffer>> {
        self.tensors.get(tensor_index).ok_or_else(|| {
            LlmError::param(format!(
                "tensor index {tensor_index} >= {} in cache {}",
                self.tensors.len(),
                self.cache_id
            ))
        })
    }

    /// `size` bytes (or the full stride) of one batch slot.
    pub fn batch_region(
        &self,
        tensor_index: usize,
        batch_index: u32,
        size: Option<u64>,
    ) -> Result<MemRegion> {
        if batch_index >= self.batch_size {
            return Err(LlmError::param(format!(
                "batch index {batch_index} >= batch size {}",
                self.batch_size
            )));
        }
        let size = size.unwrap_or(self.batch_stride);
        if size > self.batch_stride {
            return Err(LlmError::param(format!(
                "size {size} exceeds batch stride {}",
                self.batch_stride
            )));
        }
        let offset = batch_index as u64 * self.batch_stride;
        MemRegion::new(
            self.tensor(tensor_index)?.clone(),
            offset as usize,
            size as usize,
        )
    }

    /// `count` blocks starting at `start` in paged mode.
    pub fn block_region(&self, tensor_index: usize, start: u64, count: u64) -> Result<MemRegion> {
        let end = start.checked_add(count);
        if end.is_none_or(|end| end > self.batch_size as u64) {
            return Err(LlmError::param(format!(
                "blocks {start}+{count} outside {} blocks",
                self.batch_size
            )));
        }
        MemRegion::new(
            self.tensor(tensor_index)?.clone(),
            (start * self.batch_stride) as usize,
            (count * self.batch_stride) as usize,
        )
    }

    /// Absolute byte range of a tensor with bounds checking.
    pub fn tensor_region(&self, tensor_index: usize, offset: u64, size: u64) -> Result<MemRegion> {
        let end = offset.checked_add(size);
        if end.is_none_or(|end| end > self.tensor_size) {
            return Err(LlmError::param(format!(
                "range {offset}+{size} outside tensor of {} bytes",
                self.tensor_size
            )));
        }
        MemRegion::new(
            self.tensor(tensor_index)?.clone(),
            offset as usize,
            size as usize,
        )
    }
}

/// Tensor storage backend consumed by the transfer layer.
pub trait CacheStore: Send + Sync {
    fn allocate(&self, desc: &CacheDesc) -> Result<i64>;

    fn deallocate(&self, cache_id: i64) -> Result<()>;

    fn entry(&self, cache_id: i64) -> Option<Arc<CacheEntry>>;

    /// Entry and slot a key was published to.
    fn entry_by_key(&self, key: &KvKey) -> Option<(Arc<CacheEntry>, u32, u64)>;

    /// Publishes `key` into a batch slot of an existing entry.
    fn bind_key(&self, cache_id: i64, key: KvKey, batch_index: u32, size: u64) -> Result<()>;

    fn remove_index(&self, key: &KvKey) -> bool;

    /// Resolves a raw address range to the region that backs it, or `None`
    /// when the range is not fully inside one allocation.
    fn resolve_address(&self, addr: u64, len: u64) -> Option<MemRegion>;

    fn copy(&self, src: &MemRegion, dst: &MemRegion) -> Result<()> {
        if src.len() != dst.len() {
            return Err(LlmError::param(format!(
                "copy length mismatch: {} vs {}",
                src.len(),
                dst.len()
            )));
        }
        dst.write(&src.read())
    }
}
