// SPDX-FileCopyrightText: Copyright (c) 2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Per-entity and per-cluster-manager statistics.

use std::fmt;
use std::time::Duration;

use dashmap::DashMap;
use serde::{Serialize, Serializer};

/// Running cost tracker. The first `ignore_first` samples are dropped so
/// warm-up (first registration, first connect) does not skew min/avg.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TickCost {
    ignore_first: u64,
    seen: u64,
    count: u64,
    min: Duration,
    max: Duration,
    total: Duration,
}

impl TickCost {
    pub fn new(ignore_first: u64) -> Self {
        Self {
            ignore_first,
            ..Default::default()
        }
    }

    pub fn record(&mut self, cost: Duration) {
        self.seen += 1;
        if self.seen <= self.ignore_first {
            return;
        }
        if self.count == 0 || cost < self.min {
            self.min = cost;
        }
        if cost > self.max {
            self.max = cost;
        }
        self.total += cost;
        self.count += 1;
    }

    pub fn count(&self) -> u64 {
        self.count
    }

    pub fn min(&self) -> Duration {
        self.min
    }

    pub fn max(&self) -> Duration {
        self.max
    }

    pub fn total(&self) -> Duration {
        self.total
    }

    pub fn avg(&self) -> Duration {
        if self.count == 0 {
            return Duration::ZERO;
        }
        let nanos = self.total.as_nanos() / self.count as u128;
        Duration::from_nanos(u64::try_from(nanos).unwrap_or(u64::MAX))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CostSummary {
    pub count: u64,
    pub min_us: u64,
    pub max_us: u64,
    pub avg_us: u64,
    pub total_us: u64,
}

impl TickCost {
    pub fn summary(&self) -> CostSummary {
        CostSummary {
            count: self.count,
            min_us: self.min.as_micros() as u64,
            max_us: self.max.as_micros() as u64,
            avg_us: self.avg().as_micros() as u64,
            total_us: self.total.as_micros() as u64,
        }
    }
}

impl Serialize for TickCost {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.summary().serialize(serializer)
    }
}

impl fmt::Display for TickCost {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "count={} min={}us max={}us avg={}us total={}us",
            self.count,
            self.min.as_micros(),
            self.max.as_micros(),
            self.avg().as_micros(),
            self.total.as_micros()
        )
    }
}

/// Counters kept on every entity.
#[derive(Debug, Clone, Default, Serialize)]
pub struct EntityStats {
    pub send_requests: u64,
    pub recv_requests: u64,
    pub send_bytes: u64,
    pub recv_bytes: u64,
    pub again_count: u64,
    pub probe_hits: u64,
    pub pull_served: u64,
    pub pull_failed: u64,
    pub transfer_received: u64,
    pub transfer_failed: u64,
    pub check_received: u64,
    pub unlink_ok: u64,
    pub unlink_failed: u64,
    pub serve_cost: TickCost,
    pub receive_cost: TickCost,
}

impl EntityStats {
    pub fn new(ignore_first: u64) -> Self {
        Self {
            serve_cost: TickCost::new(ignore_first),
            receive_cost: TickCost::new(ignore_first),
            ..Default::default()
        }
    }
}

/// Operations timed by the cluster manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    Link,
    Unlink,
    PullCache,
    TransferCache,
    CheckLink,
}

#[derive(Debug, Clone, Default)]
pub struct OperationStats {
    pub success: u64,
    pub failed: u64,
    pub cost: TickCost,
}

/// Aggregate statistics for the public operation surface.
#[derive(Debug)]
pub struct ClusterStats {
    ignore_first: u64,
    ops: DashMap<Operation, OperationStats>,
}

impl ClusterStats {
    pub fn new(ignore_first: u64) -> Self {
        Self {
            ignore_first,
            ops: DashMap::new(),
        }
    }

    pub fn record(&self, op: Operation, ok: bool, cost: Duration) {
        let mut entry = self.ops.entry(op).or_insert_with(|| OperationStats {
            cost: TickCost::new(self.ignore_first),
            ..Default::default()
        });
        if ok {
            entry.success += 1;
        } else {
            entry.failed += 1;
        }
        entry.cost.record(cost);
    }

    pub fn get(&self, op: Operation) -> OperationStats {
        self.ops
            .get(&op)
            .map(|stats| stats.clone())
            .unwrap_or_default()
    }

    pub fn dump(&self) {
        for item in self.ops.iter() {
            let (op, stats) = item.pair();
            tracing::info!(
                ?op,
                success = stats.success,
                failed = stats.failed,
                "cluster operation stats: {}",
                stats.cost
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(0)]
    #[case(1)]
    #[case(3)]
    fn test_tick_cost_ordering(#[case] ignore_first: u64) {
        let samples = [40u64, 10, 70, 25, 55, 5, 90];
        let mut cost = TickCost::new(ignore_first);
        for s in samples {
            cost.record(Duration::from_micros(s));
        }

        let kept: Vec<u64> = samples.iter().skip(ignore_first as usize).copied().collect();
        assert_eq!(cost.count(), kept.len() as u64);
        assert_eq!(
            cost.total(),
            Duration::from_micros(kept.iter().sum::<u64>())
        );
        assert!(cost.min() <= cost.avg());
        assert!(cost.avg() <= cost.max());
        assert_eq!(cost.min(), Duration::from_micros(*kept.iter().min().unwrap()));
        assert_eq!(cost.max(), Duration::from_micros(*kept.iter().max().unwrap()));
    }

    #[test]
    fn test_tick_cost_all_ignored() {
        let mut cost = TickCost::new(5);
        cost.record(Duration::from_micros(10));
        assert_eq!(cost.count(), 0);
        assert_eq!(cost.avg(), Duration::ZERO);
    }

    #[test]
    fn test_tick_cost_avg_past_u32_samples() {
        let count = u64::from(u32::MAX) + 1;
        let cost = TickCost {
            count,
            total: Duration::from_micros(3 * count),
            ..TickCost::new(0)
        };
        assert_eq!(cost.avg(), Duration::from_micros(3));
    }

    #[test]
    fn test_cluster_stats_record() {
        let stats = ClusterStats::new(0);
        stats.record(Operation::PullCache, true, Duration::from_micros(3));
        stats.record(Operation::PullCache, false, Duration::from_micros(9));
        let pull = stats.get(Operation::PullCache);
        assert_eq!(pull.success, 1);
        assert_eq!(pull.failed, 1);
        assert_eq!(pull.cost.count(), 2);
        assert_eq!(stats.get(Operation::Link).success, 0);
    }

    #[test]
    fn test_entity_stats_serialize() {
        let mut stats = EntityStats::new(0);
        stats.send_requests = 2;
        stats.serve_cost.record(Duration::from_micros(12));
        let json = serde_json::to_value(&stats).unwrap();
        assert_eq!(json["send_requests"], 2);
        assert_eq!(json["serve_cost"]["count"], 1);
        assert_eq!(json["serve_cost"]["max_us"], 12);
    }
}
