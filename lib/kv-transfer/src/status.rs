// SPDX-FileCopyrightText: Copyright (c) 2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Status codes and the crate error type.
//!
//! [`StatusCode`] is the value that crosses the wire (meta replies) and the
//! caller boundary (one status per operation, one per cluster for link
//! batches). [`LlmError`] carries the context for logs and maps back to a
//! [`StatusCode`] with [`LlmError::status`].

use std::fmt;

use crate::transport::TransportError;

/// Wire and caller visible status values.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StatusCode {
    Success = 0,
    ParamInvalid = 1,
    Timeout = 2,
    KvNotExist = 3,
    RepeatRequest = 4,
    NotLink = 5,
    AlreadyLinked = 6,
    LinkFailed = 7,
    UnlinkFailed = 8,
    NotifyPromptUnlinkFailed = 9,
    ReqOverLimit = 10,
    LinkBusy = 11,
    ExistLink = 12,
    TransportFailed = 13,
    BufferAllocFailed = 14,
    DriverFailed = 15,
    Failed = 16,
}

impl StatusCode {
    pub fn as_u32(self) -> u32 {
        self as u32
    }

    /// Decode a status received from a peer. Unknown values collapse to
    /// [`StatusCode::Failed`] so a newer peer can never crash an older one.
    pub fn from_u32(value: u32) -> Self {
        match value {
            0 => Self::Success,
            1 => Self::ParamInvalid,
            2 => Self::Timeout,
            3 => Self::KvNotExist,
            4 => Self::RepeatRequest,
            5 => Self::NotLink,
            6 => Self::AlreadyLinked,
            7 => Self::LinkFailed,
            8 => Self::UnlinkFailed,
            9 => Self::NotifyPromptUnlinkFailed,
            10 => Self::ReqOverLimit,
            11 => Self::LinkBusy,
            12 => Self::ExistLink,
            13 => Self::TransportFailed,
            14 => Self::BufferAllocFailed,
            15 => Self::DriverFailed,
            _ => Self::Failed,
        }
    }

    pub fn is_success(self) -> bool {
        self == Self::Success
    }

    /// `Ok(())` for [`StatusCode::Success`], otherwise an [`LlmError`]
    /// carrying this code.
    pub fn into_result(self, context: impl Into<String>) -> Result<(), LlmError> {
        if self.is_success() {
            Ok(())
        } else {
            Err(LlmError::Remote {
                code: self,
                context: context.into(),
            })
        }
    }
}

impl fmt::Display for StatusCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}({})", self, self.as_u32())
    }
}

/// Errors produced by the transfer layer.
#[derive(thiserror::Error, Debug)]
pub enum LlmError {
    #[error("invalid parameter: {0}")]
    ParamInvalid(String),

    #[error("operation timed out after {elapsed_us}us (limit {timeout_us}us)")]
    Timeout { elapsed_us: u64, timeout_us: u64 },

    #[error("kv cache does not exist: {0}")]
    KvNotExist(String),

    #[error("repeated request: {0}")]
    RepeatRequest(String),

    #[error("cluster {0} is not linked")]
    NotLink(u64),

    #[error("cluster {0} is already linked")]
    AlreadyLinked(u64),

    #[error("link to cluster {cluster_id} failed: {reason}")]
    LinkFailed { cluster_id: u64, reason: String },

    #[error("unlink of cluster {cluster_id} failed: {reason}")]
    UnlinkFailed { cluster_id: u64, reason: String },

    #[error("request over limit: {0}")]
    ReqOverLimit(String),

    #[error("link to cluster {0} is busy")]
    LinkBusy(u64),

    #[error("{0} links still exist")]
    ExistLink(usize),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("failed to allocate {0} bytes")]
    BufferAllocFailed(usize),

    #[error("driver call failed: {0}")]
    DriverFailed(String),

    #[error("peer replied {code}: {context}")]
    Remote { code: StatusCode, context: String },

    #[error("internal error: {0}")]
    Internal(String),
}

impl LlmError {
    pub fn status(&self) -> StatusCode {
        match self {
            LlmError::ParamInvalid(_) => StatusCode::ParamInvalid,
            LlmError::Timeout { .. } => StatusCode::Timeout,
            LlmError::KvNotExist(_) => StatusCode::KvNotExist,
            LlmError::RepeatRequest(_) => StatusCode::RepeatRequest,
            LlmError::NotLink(_) => StatusCode::NotLink,
            LlmError::AlreadyLinked(_) => StatusCode::AlreadyLinked,
            LlmError::LinkFailed { .. } => StatusCode::LinkFailed,
            LlmError::UnlinkFailed { .. } => StatusCode::UnlinkFailed,
            LlmError::ReqOverLimit(_) => StatusCode::ReqOverLimit,
            LlmError::LinkBusy(_) => StatusCode::LinkBusy,
            LlmError::ExistLink(_) => StatusCode::ExistLink,
            LlmError::Transport(_) => StatusCode::TransportFailed,
            LlmError::BufferAllocFailed(_) => StatusCode::BufferAllocFailed,
            LlmError::DriverFailed(_) => StatusCode::DriverFailed,
            LlmError::Remote { code, .. } => *code,
            LlmError::Internal(_) => StatusCode::Failed,
        }
    }

    pub fn param(msg: impl Into<String>) -> Self {
        LlmError::ParamInvalid(msg.into())
    }

    /// True when the failure leaves the connection in an unknown protocol
    /// position and it has to be torn down.
    pub fn is_fatal_for_connection(&self) -> bool {
        matches!(
            self,
            LlmError::Transport(_) | LlmError::Timeout { .. } | LlmError::BufferAllocFailed(_)
        )
    }
}

impl From<crate::protocol::WireError> for LlmError {
    fn from(err: crate::protocol::WireError) -> Self {
        LlmError::ParamInvalid(err.to_string())
    }
}

pub type Result<T, E = LlmError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_roundtrip_known_values() {
        for value in 0..=16u32 {
            assert_eq!(StatusCode::from_u32(value).as_u32(), value);
        }
    }

    #[test]
    fn test_unknown_status_is_failed() {
        assert_eq!(StatusCode::from_u32(9999), StatusCode::Failed);
    }

    #[test]
    fn test_into_result() {
        assert!(StatusCode::Success.into_result("ok").is_ok());
        let err = StatusCode::KvNotExist.into_result("pull").unwrap_err();
        assert_eq!(err.status(), StatusCode::KvNotExist);
    }

    #[test]
    fn test_error_status_mapping() {
        assert_eq!(LlmError::NotLink(3).status(), StatusCode::NotLink);
        assert_eq!(
            LlmError::Transport(TransportError::Again).status(),
            StatusCode::TransportFailed
        );
        assert!(
            LlmError::Timeout {
                elapsed_us: 2,
                timeout_us: 1
            }
            .is_fatal_for_connection()
        );
        assert!(!LlmError::KvNotExist("x".into()).is_fatal_for_connection());
    }
}
