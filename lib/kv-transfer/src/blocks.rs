// SPDX-FileCopyrightText: Copyright (c) 2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Paged-cache block aggregation.
//!
//! Consecutive block indices are merged into runs so one transport message
//! covers a contiguous byte range instead of one message per block.

use crate::status::{LlmError, Result};

/// A run of `len` consecutive blocks starting at `start`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockRun {
    pub start: u64,
    pub len: u64,
}

/// A run that is contiguous on both the source and destination side.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PairedRun {
    pub src_start: u64,
    pub dst_start: u64,
    pub len: u64,
}

pub fn aggregate_blocks(indices: &[u64]) -> Vec<BlockRun> {
    let mut runs: Vec<BlockRun> = Vec::new();
    for &index in indices {
        match runs.last_mut() {
            Some(run) if run.start.checked_add(run.len) == Some(index) => run.len += 1,
            _ => runs.push(BlockRun { start: index, len: 1 }),
        }
    }
    runs
}

/// Merges `src[i] -> dst[i]` pairs; a run breaks as soon as either side stops
/// being consecutive.
pub fn aggregate_block_pairs(src: &[u64], dst: &[u64]) -> Result<Vec<PairedRun>> {
    if src.len() != dst.len() {
        return Err(LlmError::param(format!(
            "block count mismatch: src={} dst={}",
            src.len(),
            dst.len()
        )));
    }
    let mut runs: Vec<PairedRun> = Vec::new();
    for (&s, &d) in src.iter().zip(dst) {
        match runs.last_mut() {
            Some(run)
                if run.src_start.checked_add(run.len) == Some(s)
                    && run.dst_start.checked_add(run.len) == Some(d) =>
            {
                run.len += 1
            }
            _ => runs.push(PairedRun {
                src_start: s,
                dst_start: d,
                len: 1,
            }),
        }
    }
    Ok(runs)
}

/// Inverse of [`aggregate_blocks`]. A run never extends past `u64::MAX`.
pub fn expand_runs(runs: &[BlockRun]) -> Vec<u64> {
    runs.iter()
        .flat_map(|run| (0..run.len).map_while(move |i| run.start.checked_add(i)))
        .collect()
}
