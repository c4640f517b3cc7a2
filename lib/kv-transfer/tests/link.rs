// SPDX-FileCopyrightText: Copyright (c) 2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

mod common;

use common::*;
use dynamo_kv_transfer::entity::StateId;
use dynamo_kv_transfer::entrypoint::CheckLinkInput;
use dynamo_kv_transfer::protocol::{LinkBatchRequest, LinkOperator};
use dynamo_kv_transfer::stats::Operation;
use dynamo_kv_transfer::transport::LoopbackFabric;
use dynamo_kv_transfer::{EngineOp, Entrypoint, PollingDriver, Side, StatusCode};
use rstest::rstest;

#[rstest]
#[case(1)]
#[case(3)]
#[case(16)]
fn test_link_result_has_one_slot_per_cluster(#[case] clusters: usize) {
    let fabric = LoopbackFabric::new();
    let prompt = node(&fabric, config(PROMPT_ID));
    let addr = prompt.listen().unwrap();
    let decoder = node(&fabric, config(DECODER_ID));

    // cluster 0 reaches the prompt, the others point at closed ports
    let infos = (0..clusters)
        .map(|i| {
            let mut info = prompt_cluster(2, addr);
            info.remote_cluster_id = PROMPT_ID + i as u64;
            if i > 0 {
                info.remote_ips[0].port = addr.port + 1;
            }
            info
        })
        .collect();
    let req = LinkBatchRequest::new(LinkOperator::Link, 20_000, infos);
    let results = decoder.update_link(&req.encode()).unwrap();

    assert_eq!(results.len(), clusters);
    assert_eq!(results[0], StatusCode::Success);
    assert!(results[1..].iter().all(|s| *s == StatusCode::Timeout));
    assert_eq!(decoder.registry().client_count(), 1);
}

#[test]
fn test_link_twice_and_unlink_twice() {
    let pair = Pair::new(3);
    assert_eq!(pair.link(LinkOperator::Link), vec![StatusCode::AlreadyLinked]);

    assert_eq!(pair.link(LinkOperator::Unlink), vec![StatusCode::Success]);
    assert_eq!(pair.link(LinkOperator::Unlink), vec![StatusCode::NotLink]);
    assert_eq!(pair.decoder.registry().client_count(), 0);

    wait_until("prompt side teardown", || {
        pair.prompt.registry().server_count() == 0
    });
}

#[test]
fn test_bad_ip_num_only_fails_its_slot() {
    let fabric = LoopbackFabric::new();
    let prompt = node(&fabric, config(PROMPT_ID));
    let addr = prompt.listen().unwrap();
    let decoder = node(&fabric, config(DECODER_ID));

    let first = prompt_cluster(4, addr);
    let mut second = prompt_cluster(4, addr);
    second.remote_cluster_id = 77;
    second.ip_num = 2;
    let req = LinkBatchRequest::new(LinkOperator::Link, 100_000, vec![first, second]);

    let results = decoder.update_link(&req.encode()).unwrap();
    assert_eq!(results, vec![StatusCode::Success, StatusCode::ParamInvalid]);
    assert!(decoder.registry().client(PROMPT_ID).is_some());
    assert!(decoder.registry().client(77).is_none());
}

#[test]
fn test_check_link_state_sequence() {
    let pair = Pair::new(5);
    pair.decoder.check_link(PROMPT_ID, 100_000).unwrap();

    let server = pair.prompt.registry().server(DECODER_ID).unwrap();
    wait_until("check token", || {
        server.lock().history().contains(&StateId::ReceiveCheck)
    });
    wait_until("return to idle", || {
        server.lock().history().len() >= 6
    });
    let history = server.lock().history();
    assert_eq!(
        &history[..6],
        &[
            StateId::Init,
            StateId::Link,
            StateId::Idle,
            StateId::Probe,
            StateId::ReceiveCheck,
            StateId::Idle,
        ]
    );
    assert_eq!(server.lock().stats().check_received, 1);

    // the prompt reports its server link alive without a round trip
    pair.prompt.check_link(DECODER_ID, 0).unwrap();
    assert_eq!(pair.decoder.stats().get(Operation::CheckLink).success, 1);
}

#[test]
fn test_entrypoint_link_and_check() {
    let fabric = LoopbackFabric::new();
    let prompt = node(&fabric, config(PROMPT_ID));
    let addr = prompt.listen().unwrap();
    let _driver = PollingDriver::spawn(prompt.registry().clone(), Side::Prompt).unwrap();
    let decoder = Entrypoint::new(node(&fabric, config(DECODER_ID)), Side::Decoder);

    let link = LinkBatchRequest::new(LinkOperator::Link, 100_000, vec![prompt_cluster(6, addr)]);
    let out = decoder.run(EngineOp::UpdateLink, &link.encode());
    assert_eq!(out.status, StatusCode::Success);
    assert_eq!(out.link_results, vec![StatusCode::Success]);

    let check = CheckLinkInput {
        cluster_id: PROMPT_ID,
        timeout_us: 100_000,
    };
    assert_eq!(
        decoder.run(EngineOp::CheckLink, &check.encode()).status,
        StatusCode::Success
    );

    // the unlink entry point forces the operator
    let out = decoder.run(EngineOp::Unlink, &link.encode());
    assert_eq!(out.link_results, vec![StatusCode::Success]);
    assert_eq!(
        decoder.run(EngineOp::CheckLink, &check.encode()).status,
        StatusCode::NotLink
    );
    decoder.manager().finalize().unwrap();
}

#[test]
fn test_finalize_refuses_live_links() {
    let pair = Pair::new(7);
    assert_eq!(
        pair.decoder.finalize().unwrap_err().status(),
        StatusCode::ExistLink
    );
    assert_eq!(pair.link(LinkOperator::Unlink), vec![StatusCode::Success]);
    pair.decoder.finalize().unwrap();
}

#[test]
fn test_server_unlink_drops_prompt_entity() {
    let pair = Pair::new(8);
    let mut info = prompt_cluster(8, pair.prompt_addr);
    info.remote_cluster_id = DECODER_ID;
    let req = LinkBatchRequest::new(LinkOperator::ServerUnlink, 100_000, vec![info]);
    assert_eq!(
        pair.prompt.update_link(&req.encode()).unwrap(),
        vec![StatusCode::Success]
    );
    assert!(pair.prompt.registry().server(DECODER_ID).is_none());
    assert_eq!(
        pair.prompt.update_link(&req.encode()).unwrap(),
        vec![StatusCode::NotLink]
    );
}
