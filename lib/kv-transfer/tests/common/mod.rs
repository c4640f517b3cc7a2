// SPDX-FileCopyrightText: Copyright (c) 2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

#![allow(dead_code)]

use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use dynamo_kv_transfer::cache::{CacheDesc, CacheEntry, HostCacheStore};
use dynamo_kv_transfer::protocol::{ClusterInfo, ClusterRole, LinkBatchRequest, LinkOperator};
use dynamo_kv_transfer::transport::{LoopbackFabric, LoopbackTransport, TransportAddr};
use dynamo_kv_transfer::{ClusterManager, CommConfig, CommContext, PollingDriver, Side, StatusCode};

pub const PROMPT_ID: u64 = 1;
pub const DECODER_ID: u64 = 2;

pub fn config(cluster_id: u64) -> CommConfig {
    let mut config = CommConfig::default().with_cluster_id(cluster_id);
    config.stats.dump_interval_secs = 0;
    config
}

pub fn node(fabric: &Arc<LoopbackFabric>, config: CommConfig) -> Arc<ClusterManager> {
    node_on(Arc::new(fabric.endpoint()), config)
}

/// A manager on an endpoint the test keeps for fault injection.
pub fn node_on(transport: Arc<LoopbackTransport>, config: CommConfig) -> Arc<ClusterManager> {
    ClusterManager::new(CommContext::new(
        config,
        transport,
        Arc::new(HostCacheStore::new()),
    ))
}

/// Decoder descriptor of the prompt listening at `prompt_addr`. Every
/// decoder in a test uses its own `10.0.0.x` address.
pub fn prompt_cluster(decoder_ip: u8, prompt_addr: TransportAddr) -> ClusterInfo {
    ClusterInfo::new(
        PROMPT_ID,
        ClusterRole::Prompt,
        TransportAddr::new(Ipv4Addr::new(10, 0, 0, decoder_ip), 0),
        prompt_addr,
    )
}

pub fn wait_until(what: &str, mut cond: impl FnMut() -> bool) {
    let start = Instant::now();
    while !cond() {
        assert!(
            start.elapsed() < Duration::from_secs(5),
            "timed out waiting for {what}"
        );
        std::thread::sleep(Duration::from_millis(1));
    }
}

pub fn allocate(manager: &ClusterManager, desc: &CacheDesc) -> (i64, Arc<CacheEntry>) {
    let store = manager.context().store();
    let cache_id = store.allocate(desc).unwrap();
    (cache_id, store.entry(cache_id).unwrap())
}

pub fn batch_desc(num_tensors: usize, batch_size: u32, tensor_size: u64) -> CacheDesc {
    CacheDesc::builder()
        .num_tensors(num_tensors)
        .batch_size(batch_size)
        .tensor_size(tensor_size)
        .build()
        .unwrap()
}

pub fn paged_desc(num_tensors: usize, blocks: u32, tensor_size: u64, block_len: u32) -> CacheDesc {
    CacheDesc::builder()
        .num_tensors(num_tensors)
        .batch_size(blocks)
        .tensor_size(tensor_size)
        .block_len(block_len)
        .build()
        .unwrap()
}

/// Writes a distinct byte pattern into every tensor of `entry`.
pub fn fill_pattern(entry: &CacheEntry, seed: u8) {
    for (t, tensor) in entry.tensors.iter().enumerate() {
        let data: Vec<u8> = (0..tensor.len())
            .map(|i| seed.wrapping_add((t * 97 + i) as u8))
            .collect();
        tensor.write(0, &data).unwrap();
    }
}

/// A linked prompt/decoder pair with a driver thread on each side.
pub struct Pair {
    pub prompt: Arc<ClusterManager>,
    pub decoder: Arc<ClusterManager>,
    pub prompt_addr: TransportAddr,
    pub decoder_ip: u8,
    pub fabric: Arc<LoopbackFabric>,
    pub prompt_transport: Arc<LoopbackTransport>,
    pub decoder_transport: Arc<LoopbackTransport>,
    _drivers: Vec<PollingDriver>,
}

impl Pair {
    pub fn new(decoder_ip: u8) -> Self {
        Self::with_configs(config(PROMPT_ID), config(DECODER_ID), decoder_ip)
    }

    pub fn with_configs(prompt: CommConfig, decoder: CommConfig, decoder_ip: u8) -> Self {
        let fabric = LoopbackFabric::new();
        let prompt_transport = Arc::new(fabric.endpoint());
        let decoder_transport = Arc::new(fabric.endpoint());
        let prompt = node_on(prompt_transport.clone(), prompt);
        let decoder = node_on(decoder_transport.clone(), decoder);
        let prompt_addr = prompt.listen().unwrap();
        let drivers = vec![
            PollingDriver::spawn(prompt.registry().clone(), Side::Prompt).unwrap(),
            PollingDriver::spawn(decoder.registry().clone(), Side::Decoder).unwrap(),
        ];
        let pair = Self {
            prompt,
            decoder,
            prompt_addr,
            decoder_ip,
            fabric,
            prompt_transport,
            decoder_transport,
            _drivers: drivers,
        };
        assert_eq!(pair.link(LinkOperator::Link), vec![StatusCode::Success]);
        wait_until("prompt side link", || {
            pair.prompt.registry().server(DECODER_ID).is_some()
        });
        pair
    }

    /// Both endpoints, prompt first.
    pub fn transports(&self) -> [&LoopbackTransport; 2] {
        [self.prompt_transport.as_ref(), self.decoder_transport.as_ref()]
    }

    pub fn link(&self, operator: LinkOperator) -> Vec<StatusCode> {
        let req = LinkBatchRequest::new(
            operator,
            500_000,
            vec![prompt_cluster(self.decoder_ip, self.prompt_addr)],
        );
        self.decoder.update_link(&req.encode()).unwrap()
    }
}
