// SPDX-FileCopyrightText: Copyright (c) 2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

mod common;

use std::sync::Arc;

use common::*;
use dynamo_kv_transfer::cache::{HostBuffer, KvKey};
use dynamo_kv_transfer::entity::StateId;
use dynamo_kv_transfer::protocol::{INVALID_CACHE_ID, PullKvRequest};
use dynamo_kv_transfer::stats::Operation;
use dynamo_kv_transfer::transport::FaultOp;
use dynamo_kv_transfer::StatusCode;
use rstest::rstest;

fn by_cache(prompt_cache_id: i64, decoder_cache_id: i64) -> PullKvRequest {
    let mut req = PullKvRequest::by_request(PROMPT_ID, 1, 0, decoder_cache_id, 0);
    req.prompt_cache_id = prompt_cache_id;
    req.timeout_us = 500_000;
    req
}

#[rstest]
#[case::single_message(u64::MAX)]
#[case::exact_chunks(8)]
#[case::uneven_chunks(5)]
fn test_pull_batch_slot(#[case] max_send_bytes: u64) {
    let mut prompt = config(PROMPT_ID);
    prompt.transfer.max_send_bytes = max_send_bytes;
    let mut decoder = config(DECODER_ID);
    decoder.transfer.max_send_bytes = max_send_bytes;
    let pair = Pair::with_configs(prompt, decoder, 10);

    let (src_id, src) = allocate(&pair.prompt, &batch_desc(4, 2, 64));
    let (dst_id, dst) = allocate(&pair.decoder, &batch_desc(4, 2, 64));
    fill_pattern(&src, 3);

    let mut req = by_cache(src_id, dst_id);
    req.prompt_batch_index = 1;
    req.decoder_batch_index = 0;
    pair.decoder.pull(&req).unwrap();

    for t in 0..4 {
        let expected = src.tensors[t].read(32, 32).unwrap();
        assert_eq!(dst.tensors[t].read(0, 32).unwrap(), expected);
        assert!(dst.tensors[t].read(32, 32).unwrap().iter().all(|b| *b == 0));
    }
    let stats = pair.decoder.stats().get(Operation::PullCache);
    assert_eq!((stats.success, stats.failed), (1, 0));
}

#[rstest]
#[case::prompt_smaller(8, u64::MAX)]
#[case::decoder_smaller(u64::MAX, 8)]
#[case::both_uneven(5, 7)]
fn test_pull_with_different_chunk_sizes(#[case] prompt_max: u64, #[case] decoder_max: u64) {
    let mut prompt = config(PROMPT_ID);
    prompt.transfer.max_send_bytes = prompt_max;
    let mut decoder = config(DECODER_ID);
    decoder.transfer.max_send_bytes = decoder_max;
    let pair = Pair::with_configs(prompt, decoder, 25);

    let (src_id, src) = allocate(&pair.prompt, &batch_desc(2, 2, 64));
    let (dst_id, dst) = allocate(&pair.decoder, &batch_desc(2, 2, 64));
    fill_pattern(&src, 6);

    pair.decoder.pull(&by_cache(src_id, dst_id)).unwrap();

    for t in 0..2 {
        assert_eq!(
            dst.tensors[t].read(0, 32).unwrap(),
            src.tensors[t].read(0, 32).unwrap()
        );
    }
    let client = pair.decoder.registry().client(PROMPT_ID).unwrap();
    assert_ne!(client.lock().state(), StateId::Error);
}

#[test]
fn test_pull_selected_tensors() {
    let pair = Pair::new(11);
    let (src_id, src) = allocate(&pair.prompt, &batch_desc(4, 1, 16));
    let (dst_id, dst) = allocate(&pair.decoder, &batch_desc(4, 1, 16));
    fill_pattern(&src, 9);

    let mut req = by_cache(src_id, dst_id);
    req.tensor_indices = vec![1, 3];
    pair.decoder.pull(&req).unwrap();

    assert_eq!(dst.tensors[1].to_vec(), src.tensors[1].to_vec());
    assert_eq!(dst.tensors[3].to_vec(), src.tensors[3].to_vec());
    assert!(dst.tensors[0].to_vec().iter().all(|b| *b == 0));
}

#[test]
fn test_pull_paged_blocks() {
    let mut prompt = config(PROMPT_ID);
    prompt.transfer.paged_attention = true;
    let mut decoder = config(DECODER_ID);
    decoder.transfer.paged_attention = true;
    let pair = Pair::with_configs(prompt, decoder, 12);

    // 4 blocks of 16 bytes per tensor
    let (src_id, src) = allocate(&pair.prompt, &paged_desc(2, 4, 64, 16));
    let (dst_id, dst) = allocate(&pair.decoder, &paged_desc(2, 4, 64, 16));
    fill_pattern(&src, 1);

    let mut req = by_cache(src_id, dst_id);
    req.block_len = 16;
    req.prompt_blocks = vec![0, 1, 3];
    req.decoder_blocks = vec![2, 3, 0];
    pair.decoder.pull(&req).unwrap();

    for t in 0..2 {
        let block = |buf: &Arc<HostBuffer>, i: usize| buf.read(i * 16, 16).unwrap();
        assert_eq!(block(&dst.tensors[t], 2), block(&src.tensors[t], 0));
        assert_eq!(block(&dst.tensors[t], 3), block(&src.tensors[t], 1));
        assert_eq!(block(&dst.tensors[t], 0), block(&src.tensors[t], 3));
        assert!(block(&dst.tensors[t], 1).iter().all(|b| *b == 0));
    }
}

#[test]
fn test_block_pull_requires_paged_attention() {
    let pair = Pair::new(13);
    let (dst_id, _) = allocate(&pair.decoder, &paged_desc(2, 4, 64, 16));
    let mut req = by_cache(0, dst_id);
    req.prompt_blocks = vec![0];
    req.decoder_blocks = vec![0];
    assert_eq!(
        pair.decoder.pull(&req).unwrap_err().status(),
        StatusCode::ParamInvalid
    );
}

#[test]
fn test_pull_by_request_releases_index() {
    let pair = Pair::new(14);
    let key = KvKey::request(42, 0);
    let tensors: Vec<_> = (0..2u8)
        .map(|t| HostBuffer::from_vec(vec![t + 1; 48]))
        .collect();
    pair.prompt.save_tensors(key, tensors, 8, 24).unwrap();
    let (dst_id, dst) = allocate(&pair.decoder, &batch_desc(2, 1, 32));

    let mut req = PullKvRequest::by_request(PROMPT_ID, 42, 0, dst_id, 0);
    req.timeout_us = 500_000;
    pair.decoder.pull(&req).unwrap();

    assert_eq!(dst.tensors[0].read(0, 24).unwrap().as_ref(), &[1u8; 24]);
    assert_eq!(dst.tensors[1].read(0, 24).unwrap().as_ref(), &[2u8; 24]);
    wait_until("index release", || {
        !pair.prompt.context().kv_index().contains(&key)
    });

    // the key is gone once served
    assert_eq!(
        pair.decoder.pull(&req).unwrap_err().status(),
        StatusCode::KvNotExist
    );
}

#[test]
fn test_pull_prefix_then_request() {
    let pair = Pair::new(15);
    let index = pair.prompt.context().kv_index().clone();
    let prefix: Vec<_> = (0..2).map(|_| HostBuffer::from_vec(vec![7u8; 8])).collect();
    let request: Vec<_> = (0..2).map(|_| HostBuffer::from_vec(vec![9u8; 8])).collect();
    index.save(KvKey::prefix(5, 0), prefix, 0, 8).unwrap();
    index.save(KvKey::request(6, 0), request, 0, 8).unwrap();
    let (dst_id, dst) = allocate(&pair.decoder, &batch_desc(2, 1, 16));

    let mut req = PullKvRequest::by_request(PROMPT_ID, 6, 0, dst_id, 0);
    req.prefix_id = 5;
    req.timeout_us = 500_000;
    pair.decoder.pull(&req).unwrap();

    let mut expected = vec![7u8; 8];
    expected.extend([9u8; 8]);
    assert_eq!(dst.tensors[0].to_vec(), expected);
    assert_eq!(dst.tensors[1].to_vec(), expected);
}

#[test]
fn test_pull_with_offset_uses_bound_key() {
    let pair = Pair::new(16);
    let (src_id, src) = allocate(&pair.prompt, &batch_desc(2, 4, 64));
    fill_pattern(&src, 4);
    pair.prompt
        .save_kv(src_id, KvKey::request(8, 0), 2, 10)
        .unwrap();
    let (dst_id, dst) = allocate(&pair.decoder, &batch_desc(2, 4, 64));

    let mut req = by_cache(src_id, dst_id);
    req.req_id = 8;
    req.pull_with_offset = true;
    req.decoder_batch_index = 3;
    pair.decoder.pull(&req).unwrap();

    for t in 0..2 {
        assert_eq!(
            dst.tensors[t].read(48, 10).unwrap(),
            src.tensors[t].read(32, 10).unwrap()
        );
        assert!(dst.tensors[t].read(58, 6).unwrap().iter().all(|b| *b == 0));
    }
}

#[test]
fn test_pull_unknown_key_keeps_link() {
    let pair = Pair::new(17);
    let (dst_id, _) = allocate(&pair.decoder, &batch_desc(2, 1, 16));
    let mut req = PullKvRequest::by_request(PROMPT_ID, 404, 0, dst_id, 0);
    req.timeout_us = 500_000;

    let err = pair.decoder.pull(&req).unwrap_err();
    assert_eq!(err.status(), StatusCode::KvNotExist);

    let server = pair.prompt.registry().server(DECODER_ID).unwrap();
    wait_until("prompt back to idle", || {
        server.lock().stats().pull_failed == 1
    });
    let client = pair.decoder.registry().client(PROMPT_ID).unwrap();
    let entity = client.lock();
    assert_eq!(entity.stats().send_requests, 1);
    assert_eq!(entity.stats().recv_requests, 1);
    assert!(!entity.is_terminal());
    drop(entity);
    pair.decoder.check_link(PROMPT_ID, 100_000).unwrap();
}

#[test]
fn test_tensor_count_mismatch_reply_is_delivered() {
    let pair = Pair::new(18);
    let (src_id, _) = allocate(&pair.prompt, &batch_desc(2, 1, 16));
    let (dst_id, _) = allocate(&pair.decoder, &batch_desc(4, 1, 16));

    let mut req = by_cache(src_id, dst_id);
    req.tensor_indices = vec![0, 3];
    let err = pair.decoder.pull(&req).unwrap_err();
    assert_eq!(err.status(), StatusCode::ParamInvalid);

    // the prompt answered with a meta reply, so the link is still usable
    let server = pair.prompt.registry().server(DECODER_ID).unwrap();
    wait_until("prompt reply", || server.lock().stats().pull_failed == 1);
    assert_ne!(server.lock().state(), StateId::Error);
    pair.decoder.check_link(PROMPT_ID, 100_000).unwrap();
}

#[test]
fn test_pull_from_unlinked_cluster() {
    let pair = Pair::new(19);
    let (dst_id, _) = allocate(&pair.decoder, &batch_desc(2, 1, 16));
    let mut req = by_cache(INVALID_CACHE_ID, dst_id);
    req.prompt_cluster_id = 99;
    assert_eq!(
        pair.decoder.pull(&req).unwrap_err().status(),
        StatusCode::NotLink
    );
}

#[rstest]
#[case::send_again(FaultOp::Isend)]
#[case::peek_again(FaultOp::Improbe)]
#[case::recv_again(FaultOp::Imrecv)]
fn test_pull_retries_busy_transport(#[case] op: FaultOp) {
    let mut prompt = config(PROMPT_ID);
    prompt.transfer.max_send_bytes = 8;
    let mut decoder = config(DECODER_ID);
    decoder.transfer.max_send_bytes = 8;
    let pair = Pair::with_configs(prompt, decoder, 29);
    let (src_id, src) = allocate(&pair.prompt, &batch_desc(2, 1, 32));
    let (dst_id, dst) = allocate(&pair.decoder, &batch_desc(2, 1, 32));
    fill_pattern(&src, 9);

    for transport in pair.transports() {
        transport.inject_again(op, 3);
        transport.defer_completions(2);
    }
    pair.decoder.pull(&by_cache(src_id, dst_id)).unwrap();

    for t in 0..2 {
        assert_eq!(dst.tensors[t].to_vec(), src.tensors[t].to_vec());
    }
    let server = pair.prompt.registry().server(DECODER_ID).unwrap();
    wait_until("prompt serves the pull", || {
        server.lock().stats().pull_served == 1
    });
    assert_ne!(server.lock().state(), StateId::Error);
}

#[test]
fn test_send_failure_moves_client_to_error() {
    let pair = Pair::new(30);
    let (src_id, _) = allocate(&pair.prompt, &batch_desc(2, 1, 16));
    let (dst_id, _) = allocate(&pair.decoder, &batch_desc(2, 1, 16));

    pair.decoder_transport.inject_failure(FaultOp::Isend, 13);
    let err = pair.decoder.pull(&by_cache(src_id, dst_id)).unwrap_err();
    assert_eq!(err.status(), StatusCode::TransportFailed);

    let client = pair.decoder.registry().client(PROMPT_ID).unwrap();
    let entity = client.lock();
    assert_eq!(entity.state(), StateId::Error);
    assert_eq!(entity.stats().pull_failed, 1);
}

#[test]
fn test_prompt_send_failure_fails_both_sides() {
    let pair = Pair::new(31);
    let (src_id, _) = allocate(&pair.prompt, &batch_desc(2, 1, 16));
    let (dst_id, _) = allocate(&pair.decoder, &batch_desc(2, 1, 16));

    // the prompt cannot send its meta reply
    pair.prompt_transport.inject_failure(FaultOp::Isend, 13);
    let mut req = by_cache(src_id, dst_id);
    req.timeout_us = 100_000;
    pair.decoder.pull(&req).unwrap_err();

    let server = pair.prompt.registry().server(DECODER_ID).unwrap();
    wait_until("prompt entity fails", || {
        server.lock().state() == StateId::Error
    });
    let client = pair.decoder.registry().client(PROMPT_ID).unwrap();
    assert_eq!(client.lock().state(), StateId::Error);
}
