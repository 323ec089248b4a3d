use crate::*;

use bytes::Bytes;
use serde_json::json;
use strand_channels::RawEvent;
use strand_core::{ChannelConfig, ChannelError, Envelope};

fn chunked(chunk_size: usize) -> ChannelConfig {
    let mut config = ChannelConfig::default();
    config.chunk_size = chunk_size;
    config
}

/// The canonical scenario on the wire: 10000 bytes at chunk size 4000 turn
/// into one CHUNK_META (totalSize=10000, chunkCount=3) followed by three
/// CHUNK_DATA frames with indices 0, 1, 2.
#[tokio::test]
async fn test_wire_sequence_for_declared_layout() {
    let (a, mut b) = MemoryChannel::pair(64 * 1024);
    let (sender, _incoming) = TransferChannel::spawn(a.channel, a.events, chunked(4000));

    let payload = Bytes::from(patterned_bytes(10000));
    sender
        .send_transfer(payload.clone(), json!({"name": "a.bin"}))
        .await
        .unwrap();

    let mut frames = Vec::new();
    for _ in 0..4 {
        match b.events.recv().await.unwrap() {
            RawEvent::Message(data) => {
                frames.push(Envelope::decode(std::str::from_utf8(&data).unwrap()).unwrap());
            }
            other => panic!("unexpected raw event: {other:?}"),
        }
    }

    match &frames[0] {
        Envelope::ChunkMeta {
            total_size,
            chunk_count,
            meta,
            ..
        } => {
            assert_eq!(*total_size, 10000);
            assert_eq!(*chunk_count, 3);
            assert_eq!(*meta, json!({"name": "a.bin"}));
        }
        other => panic!("first frame is not metadata: {other:?}"),
    }

    let mut reassembled = Vec::new();
    for (expected_index, frame) in frames[1..].iter().enumerate() {
        match frame {
            Envelope::ChunkData { index, data, .. } => {
                assert_eq!(*index, expected_index as u32);
                reassembled.extend_from_slice(data);
            }
            other => panic!("expected chunk data: {other:?}"),
        }
    }
    assert_eq!(reassembled, payload);
}

/// End to end: the receiving side emits one completed transfer with the
/// original bytes and metadata.
#[tokio::test]
async fn test_transfer_round_trip_with_metadata() {
    let (sender, _sender_incoming, _receiver, mut incoming) = transfer_pair(chunked(4000));

    let payload = Bytes::from(patterned_bytes(10000));
    sender
        .send_transfer(payload.clone(), json!({"name": "a.bin"}))
        .await
        .unwrap();

    match incoming.recv().await.unwrap() {
        TransferEvent::Completed(transfer) => {
            assert_eq!(transfer.payload, payload);
            assert_eq!(transfer.meta, json!({"name": "a.bin"}));
        }
        other => panic!("expected completion, got {other:?}"),
    }
}

/// A payload much larger than the chunk size survives the split intact.
#[tokio::test]
async fn test_large_transfer_reassembles_exactly() {
    let (sender, _sender_incoming, _receiver, mut incoming) = transfer_pair(chunked(4096));

    let payload = Bytes::from(patterned_bytes(100_000)); // 25 chunks
    sender
        .send_transfer(payload.clone(), json!({"name": "big"}))
        .await
        .unwrap();

    match incoming.recv().await.unwrap() {
        TransferEvent::Completed(transfer) => {
            assert_eq!(transfer.payload.len(), 100_000);
            assert_eq!(transfer.payload, payload);
        }
        other => panic!("expected completion, got {other:?}"),
    }
}

/// Transfers queued concurrently never interleave chunks: each completes
/// with its own payload and metadata.
#[tokio::test]
async fn test_concurrent_transfers_do_not_interleave() {
    let (sender, _sender_incoming, _receiver, mut incoming) = transfer_pair(chunked(64));

    let first = Bytes::from(patterned_bytes(1000));
    let second = Bytes::from(vec![0xAB; 500]);

    let s1 = tokio::spawn({
        let sender = sender.clone();
        let first = first.clone();
        async move { sender.send_transfer(first, json!({"name": "one"})).await }
    });
    let s2 = tokio::spawn({
        let sender = sender.clone();
        let second = second.clone();
        async move { sender.send_transfer(second, json!({"name": "two"})).await }
    });
    s1.await.unwrap().unwrap();
    s2.await.unwrap().unwrap();

    let mut seen = Vec::new();
    for _ in 0..2 {
        match incoming.recv().await.unwrap() {
            TransferEvent::Completed(transfer) => seen.push(transfer),
            other => panic!("expected completion, got {other:?}"),
        }
    }
    seen.sort_by_key(|t| t.meta["name"].as_str().unwrap().to_string());
    assert_eq!(seen[0].meta, json!({"name": "one"}));
    assert_eq!(seen[0].payload, first);
    assert_eq!(seen[1].meta, json!({"name": "two"}));
    assert_eq!(seen[1].payload, second);
}

/// With a backpressure threshold below the first chunk's size, the sender
/// suspends after chunk 0 and resumes only on the low-buffer signal.
#[tokio::test]
async fn test_backpressure_gates_second_chunk() {
    let config = chunked(4000);
    let (a, b) = MemoryChannel::manual_pair(100); // threshold < one chunk
    let raw = a.channel.clone();
    let (sender, _sender_incoming) = TransferChannel::spawn(a.channel, a.events, config.clone());
    let (_receiver, mut incoming) = TransferChannel::spawn(b.channel, b.events, config);

    let payload = Bytes::from(patterned_bytes(10000));
    let send = tokio::spawn({
        let sender = sender.clone();
        let payload = payload.clone();
        async move { sender.send_transfer(payload, json!({"name": "a.bin"})).await }
    });
    tokio::task::yield_now().await;

    // Metadata + chunk 0 went out; chunk 1 is parked above the threshold.
    assert_eq!(raw.queued_messages(), 2);
    tokio::task::yield_now().await;
    assert_eq!(raw.queued_messages(), 2, "chunk 1 sent without a low-buffer signal");

    // Each drain empties the queue, fires low-buffer, and releases one more
    // chunk until the sender finishes.
    while !send.is_finished() {
        raw.drain_all();
        tokio::task::yield_now().await;
    }
    send.await.unwrap().unwrap();
    raw.drain_all();

    match incoming.recv().await.unwrap() {
        TransferEvent::Completed(transfer) => assert_eq!(transfer.payload, payload),
        other => panic!("expected completion, got {other:?}"),
    }
}

/// Closing mid-transfer aborts the sender with Closed instead of hanging.
#[tokio::test]
async fn test_close_aborts_inflight_transfer() {
    let (a, _b) = MemoryChannel::manual_pair(100);
    let raw = a.channel.clone();
    let (sender, _incoming) = TransferChannel::spawn(a.channel, a.events, chunked(4000));

    let send = tokio::spawn({
        let sender = sender.clone();
        async move {
            sender
                .send_transfer(Bytes::from(patterned_bytes(10000)), json!(null))
                .await
        }
    });
    tokio::task::yield_now().await;
    assert_eq!(raw.queued_messages(), 2);

    sender.close();
    assert!(matches!(
        send.await.unwrap().unwrap_err(),
        ChannelError::Closed
    ));

    // The channel refuses further work.
    let err = sender
        .send_transfer(Bytes::from_static(b"x"), json!(null))
        .await
        .unwrap_err();
    assert!(matches!(err, ChannelError::Closed));
}
