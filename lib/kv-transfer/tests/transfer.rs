// SPDX-FileCopyrightText: Copyright (c) 2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

mod common;

use bytes::Bytes;
use common::*;
use dynamo_kv_transfer::StatusCode;
use dynamo_kv_transfer::cache::{HostBuffer, MemRegion};
use dynamo_kv_transfer::entity::{EntityHandle, StateId};
use dynamo_kv_transfer::protocol::{
    INVALID_CACHE_ID, INVALID_PREFIX_ID, LayerAddr, TransferKvRequest, TransferSlot,
    TransferToRemoteRequest, TransferToRemoteResponse,
};
use dynamo_kv_transfer::stats::Operation;
use dynamo_kv_transfer::transport::{FaultOp, RequestSet};
use rstest::rstest;

fn request(src_cache_id: i64, dst_cache_id: i64) -> TransferKvRequest {
    TransferKvRequest {
        req_id: 1,
        prefix_id: INVALID_PREFIX_ID,
        model_id: 0,
        dst_cluster_id: DECODER_ID,
        src_cache_id,
        dst_cache_id,
        src_batch_index: 0,
        dst_batch_index: 0,
        timeout_us: 500_000,
        block_len: 0,
        src_blocks: Vec::new(),
        dst_blocks: Vec::new(),
        layer_addrs: Vec::new(),
    }
}

/// Sends a raw layer request over the prompt's server connection and waits
/// for the decoder's meta reply.
fn exchange_layer_request(server: &EntityHandle, request: Bytes) -> TransferToRemoteResponse {
    let claim = server.claim().unwrap();
    let transport = claim.connection().transport().clone();
    let conn = claim.connection().handle();

    let mut sends = RequestSet::new();
    sends.isend(transport.as_ref(), conn, request.into()).unwrap();
    wait_until("layer request sent", || {
        sends.poll(transport.as_ref()).unwrap();
        sends.is_empty()
    });

    let mut envelope = None;
    wait_until("meta reply", || {
        envelope = transport.improbe(conn).unwrap();
        envelope.is_some()
    });
    let envelope = envelope.unwrap();
    let reply = HostBuffer::zeroed(envelope.count).unwrap();
    let mut recvs = RequestSet::new();
    recvs
        .imrecv(transport.as_ref(), envelope, MemRegion::whole(reply.clone()))
        .unwrap();
    wait_until("meta reply received", || {
        recvs.poll(transport.as_ref()).unwrap();
        recvs.is_empty()
    });
    TransferToRemoteResponse::decode(&reply.to_vec()).unwrap()
}

#[test]
fn test_transfer_into_batch_slot() {
    let mut prompt = config(PROMPT_ID);
    prompt.transfer.max_send_bytes = 12;
    let pair = Pair::with_configs(prompt, config(DECODER_ID), 20);

    // two layers, key and value each
    let (src_id, src) = allocate(&pair.prompt, &batch_desc(4, 2, 64));
    let (dst_id, dst) = allocate(&pair.decoder, &batch_desc(4, 2, 64));
    fill_pattern(&src, 5);

    let mut req = request(src_id, dst_id);
    req.src_batch_index = 0;
    req.dst_batch_index = 1;
    pair.prompt.transfer(&req).unwrap();

    let client = pair.decoder.registry().client(PROMPT_ID).unwrap();
    wait_until("decoder receives both layers", || {
        client.lock().stats().transfer_received == 2
    });
    for t in 0..4 {
        assert_eq!(
            dst.tensors[t].read(32, 32).unwrap(),
            src.tensors[t].read(0, 32).unwrap()
        );
        assert!(dst.tensors[t].read(0, 32).unwrap().iter().all(|b| *b == 0));
    }
    assert_eq!(pair.prompt.stats().get(Operation::TransferCache).success, 1);
}

#[test]
fn test_transfer_to_raw_addresses() {
    let pair = Pair::new(21);
    let (src_id, src) = allocate(&pair.prompt, &batch_desc(2, 1, 24));
    let (_, dst) = allocate(&pair.decoder, &batch_desc(2, 1, 24));
    fill_pattern(&src, 8);

    let mut req = request(src_id, INVALID_CACHE_ID);
    req.layer_addrs = vec![LayerAddr {
        key_addr: dst.tensors[0].addr(),
        value_addr: dst.tensors[1].addr(),
    }];
    pair.prompt.transfer(&req).unwrap();

    let client = pair.decoder.registry().client(PROMPT_ID).unwrap();
    wait_until("decoder receives the layer", || {
        client.lock().stats().transfer_received == 1
    });
    assert_eq!(dst.tensors[0].to_vec(), src.tensors[0].to_vec());
    assert_eq!(dst.tensors[1].to_vec(), src.tensors[1].to_vec());
}

#[test]
fn test_transfer_paged_blocks() {
    let mut prompt = config(PROMPT_ID);
    prompt.transfer.paged_attention = true;
    let pair = Pair::with_configs(prompt, config(DECODER_ID), 22);

    let (src_id, src) = allocate(&pair.prompt, &paged_desc(2, 4, 32, 8));
    let (dst_id, dst) = allocate(&pair.decoder, &paged_desc(2, 4, 32, 8));
    fill_pattern(&src, 2);

    let mut req = request(src_id, dst_id);
    req.block_len = 8;
    req.src_blocks = vec![0, 1];
    req.dst_blocks = vec![2, 3];
    pair.prompt.transfer(&req).unwrap();

    let client = pair.decoder.registry().client(PROMPT_ID).unwrap();
    wait_until("decoder receives the blocks", || {
        client.lock().stats().transfer_received == 1
    });
    for t in 0..2 {
        assert_eq!(
            dst.tensors[t].read(16, 16).unwrap(),
            src.tensors[t].read(0, 16).unwrap()
        );
    }
}

#[test]
fn test_rejected_layer_keeps_link() {
    let pair = Pair::new(23);
    let (src_id, _) = allocate(&pair.prompt, &batch_desc(2, 1, 16));

    // the decoder has no such cache
    let req = request(src_id, 5);
    let err = pair.prompt.transfer(&req).unwrap_err();
    assert_eq!(err.status(), StatusCode::KvNotExist);

    let client = pair.decoder.registry().client(PROMPT_ID).unwrap();
    wait_until("decoder counts the failure", || {
        client.lock().stats().transfer_failed == 1
    });
    let server = pair.prompt.registry().server(DECODER_ID).unwrap();
    assert_ne!(server.lock().state(), StateId::Error);
    assert_ne!(client.lock().state(), StateId::Error);
}

#[test]
fn test_transfer_local_errors() {
    let pair = Pair::new(24);
    let (src_id, _) = allocate(&pair.prompt, &batch_desc(2, 1, 16));

    let missing = request(77, 0);
    assert_eq!(
        pair.prompt.transfer(&missing).unwrap_err().status(),
        StatusCode::KvNotExist
    );

    let mut unlinked = request(src_id, 0);
    unlinked.dst_cluster_id = 99;
    assert_eq!(
        pair.prompt.transfer(&unlinked).unwrap_err().status(),
        StatusCode::NotLink
    );

    let mut bad_addrs = request(src_id, INVALID_CACHE_ID);
    bad_addrs.layer_addrs = vec![
        LayerAddr {
            key_addr: 1,
            value_addr: 2,
        };
        2
    ];
    assert_eq!(
        pair.prompt.transfer(&bad_addrs).unwrap_err().status(),
        StatusCode::ParamInvalid
    );
    assert_eq!(pair.prompt.stats().get(Operation::TransferCache).failed, 3);
}

#[test]
fn test_slot_count_mismatch_is_answered() {
    let pair = Pair::new(26);
    let (src_id, _) = allocate(&pair.prompt, &batch_desc(2, 1, 16));
    let (dst_id, _) = allocate(&pair.decoder, &batch_desc(2, 1, 16));

    // the header announces three slots, the body carries one
    let layer = TransferToRemoteRequest {
        key_addr: 0,
        value_addr: 0,
        cache_id: dst_id,
        batch_index: 0,
        layer_index: 0,
        slots: vec![TransferSlot { offset: 0, size: 16 }],
    };
    let server = pair.prompt.registry().server(DECODER_ID).unwrap();
    let reply = exchange_layer_request(&server, layer.encode_with_slot_count(3));
    assert_eq!(StatusCode::from_u32(reply.ret_code), StatusCode::ParamInvalid);

    let client = pair.decoder.registry().client(PROMPT_ID).unwrap();
    wait_until("decoder counts the rejection", || {
        client.lock().stats().transfer_failed == 1
    });
    assert_ne!(client.lock().state(), StateId::Error);

    // the link still carries a well-formed transfer
    pair.prompt.transfer(&request(src_id, dst_id)).unwrap();
    wait_until("decoder receives the layer", || {
        client.lock().stats().transfer_received == 1
    });
}

#[rstest]
#[case::send_again(FaultOp::Isend)]
#[case::peek_again(FaultOp::Improbe)]
#[case::recv_again(FaultOp::Imrecv)]
fn test_transfer_retries_busy_transport(#[case] op: FaultOp) {
    let mut prompt = config(PROMPT_ID);
    prompt.transfer.max_send_bytes = 8;
    let pair = Pair::with_configs(prompt, config(DECODER_ID), 27);
    let (src_id, src) = allocate(&pair.prompt, &batch_desc(2, 1, 32));
    let (dst_id, dst) = allocate(&pair.decoder, &batch_desc(2, 1, 32));
    fill_pattern(&src, 4);

    for transport in pair.transports() {
        transport.inject_again(op, 3);
        transport.defer_completions(2);
    }
    pair.prompt.transfer(&request(src_id, dst_id)).unwrap();

    let client = pair.decoder.registry().client(PROMPT_ID).unwrap();
    wait_until("decoder receives the layer", || {
        client.lock().stats().transfer_received == 1
    });
    for t in 0..2 {
        assert_eq!(dst.tensors[t].to_vec(), src.tensors[t].to_vec());
    }
    let server = pair.prompt.registry().server(DECODER_ID).unwrap();
    assert_ne!(server.lock().state(), StateId::Error);
}

#[test]
fn test_transport_failure_moves_server_to_error() {
    let pair = Pair::new(28);
    let (src_id, _) = allocate(&pair.prompt, &batch_desc(2, 1, 16));
    let (dst_id, _) = allocate(&pair.decoder, &batch_desc(2, 1, 16));

    pair.prompt_transport.inject_failure(FaultOp::Isend, 13);
    let err = pair.prompt.transfer(&request(src_id, dst_id)).unwrap_err();
    assert_eq!(err.status(), StatusCode::TransportFailed);

    let server = pair.prompt.registry().server(DECODER_ID).unwrap();
    assert_eq!(server.lock().state(), StateId::Error);
    assert_eq!(pair.prompt.stats().get(Operation::TransferCache).failed, 1);
}
