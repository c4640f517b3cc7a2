// SPDX-FileCopyrightText: Copyright (c) 2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Timeout bookkeeping for the polling loops.
//!
//! Every blocking-style operation carries a caller timeout in microseconds.
//! Reading the monotonic clock on every loop iteration is measurable on the
//! hot path, so [`Deadline`] only consults it every `check_every` polls.

use std::time::{Duration, Instant};

use crate::status::{LlmError, Result};

/// `Timeout` iff `elapsed >= timeout`.
pub fn check_timeout(elapsed: Duration, timeout: Duration) -> Result<()> {
    if elapsed >= timeout {
        return Err(LlmError::Timeout {
            elapsed_us: elapsed.as_micros() as u64,
            timeout_us: timeout.as_micros() as u64,
        });
    }
    Ok(())
}

/// A caller timeout of zero selects the configured default.
pub fn resolve_timeout_us(timeout_us: u64, default_us: u64) -> Duration {
    if timeout_us == 0 {
        Duration::from_micros(default_us)
    } else {
        Duration::from_micros(timeout_us)
    }
}

#[derive(Debug, Clone)]
pub struct Deadline {
    start: Instant,
    timeout: Duration,
    check_every: u32,
    polls: u32,
}

impl Deadline {
    pub fn new(timeout: Duration, check_every: u32) -> Self {
        Self {
            start: Instant::now(),
            timeout,
            check_every: check_every.max(1),
            polls: 0,
        }
    }

    /// Counts one loop iteration and checks the clock when the interval is
    /// reached.
    pub fn poll(&mut self) -> Result<()> {
        self.polls += 1;
        if self.polls < self.check_every {
            return Ok(());
        }
        self.polls = 0;
        self.check_now()
    }

    pub fn check_now(&self) -> Result<()> {
        check_timeout(self.start.elapsed(), self.timeout)
    }

    pub fn is_expired(&self) -> bool {
        self.check_now().is_err()
    }

    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn start(&self) -> Instant {
        self.start
    }
}
