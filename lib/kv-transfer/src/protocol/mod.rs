// SPDX-FileCopyrightText: Copyright (c) 2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Wire protocol between prompt and decoder clusters.
//!
//! All messages use the same shape:
//! - Little-endian byte order
//! - No padding (packed)
//! - A fixed header declaring element counts, followed by the counted arrays
//!
//! Decoding is a single validated step: the total message size must equal
//! `header + Σ count × element_size` before any element of the tail is read.

mod kv;
mod link;
mod transfer;

pub use kv::{BufferInfo, PullKvRequest, SyncKvRequest, SyncKvResponse};
pub use link::{
    CLIENT_CLUSTER_INFO_SIZE, ClientClusterInfo, ClusterInfo, ClusterLinkInfo, ClusterRole,
    IpInfo, LinkBatchRequest, LinkOperator, MAX_CLUSTERS_PER_REQUEST, MAX_IP_NUM,
};
pub use transfer::{
    LayerAddr, TransferKvRequest, TransferSlot, TransferToRemoteRequest,
    TransferToRemoteResponse,
};

/// Sentinel for "no cache id": the request is resolved through the KV index.
pub const INVALID_CACHE_ID: i64 = -1;

/// Sentinel for "no prefix".
pub const INVALID_PREFIX_ID: u64 = u64::MAX;

/// Size of the check-link liveness token.
pub const CHECK_LINK_TOKEN_SIZE: usize = 1;

/// Size of the unlink notification.
pub const UNLINK_TOKEN_SIZE: usize = 0;

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum WireError {
    #[error("{what}: message too short ({actual} < {min} bytes)")]
    TooShort {
        what: &'static str,
        actual: usize,
        min: usize,
    },

    #[error("{what}: size mismatch, expected {expected} bytes, got {actual}")]
    SizeMismatch {
        what: &'static str,
        expected: usize,
        actual: usize,
    },

    #[error("{what}: declared element count overflows message size")]
    CountOverflow { what: &'static str },

    #[error("{what}: invalid {field} = {value}")]
    InvalidField {
        what: &'static str,
        field: &'static str,
        value: u64,
    },
}

/// Checks the fixed header is present.
pub(crate) fn require_header(
    what: &'static str,
    data: &[u8],
    header: usize,
) -> Result<(), WireError> {
    if data.len() < header {
        return Err(WireError::TooShort {
            what,
            actual: data.len(),
            min: header,
        });
    }
    Ok(())
}

/// Checks `header + Σ count × size == data.len()` without overflowing.
pub(crate) fn require_exact(
    what: &'static str,
    data: &[u8],
    header: usize,
    arrays: &[(u64, usize)],
) -> Result<(), WireError> {
    let mut expected = header;
    for &(count, elem) in arrays {
        let count = usize::try_from(count).map_err(|_| WireError::CountOverflow { what })?;
        let bytes = count
            .checked_mul(elem)
            .ok_or(WireError::CountOverflow { what })?;
        expected = expected
            .checked_add(bytes)
            .ok_or(WireError::CountOverflow { what })?;
    }
    if expected != data.len() {
        return Err(WireError::SizeMismatch {
            what,
            expected,
            actual: data.len(),
        });
    }
    Ok(())
}
