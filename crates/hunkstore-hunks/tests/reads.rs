//! Read path tests over the in-memory backend

use bytes::Bytes;
use hunkstore_common::{
    ErasureCodecId, Error, HedgingManagerConfig, HunkStoreConfig, MissingParts,
};
use hunkstore_hunks::{
    ChunkRepairer, HunkChunkReader, HunkChunkWriter, MemoryChunkBackend, ReadHunkRequest,
    StorageContext, write_blob_chunk, write_journal_chunk,
};
use hunkstore_placement::ClusterTopology;
use rand::RngCore;
use std::sync::Arc;
use std::time::Duration;

fn context(config: HunkStoreConfig) -> (StorageContext, Arc<MemoryChunkBackend>) {
    StorageContext::in_memory(config, ClusterTopology::with_nodes(12, 4)).unwrap()
}

fn rs63() -> ErasureCodecId {
    "reed_solomon_6_3".parse().unwrap()
}

fn random_payload(len: usize) -> Vec<u8> {
    let mut data = vec![0u8; len];
    rand::thread_rng().fill_bytes(&mut data);
    data
}

#[tokio::test]
async fn test_journal_block_range() {
    let (ctx, _backend) = context(HunkStoreConfig::default());
    let chunk_id = write_journal_chunk(
        &ctx,
        ErasureCodecId::None,
        vec![
            Bytes::from_static(b"abc"),
            Bytes::from_static(b"0123456789"),
            Bytes::from_static(b"abcdef"),
        ],
    )
    .await
    .unwrap();
    let reader = HunkChunkReader::new(ctx).unwrap();

    let responses = reader
        .read_hunks(&[
            ReadHunkRequest::new(chunk_id, 1, 2, 5),
            ReadHunkRequest::new(chunk_id, 2, 0, 6),
            ReadHunkRequest::new(chunk_id, 0, 2, 2),
            ReadHunkRequest::new(chunk_id, 3, 0, 1),
        ])
        .await;
    assert_eq!(responses[0].as_ref().unwrap().as_ref(), b"23456");
    assert_eq!(responses[1].as_ref().unwrap().as_ref(), b"abcdef");
    assert!(matches!(responses[2], Err(Error::OutOfRange { .. })));
    assert!(matches!(responses[3], Err(Error::InvalidBlockIndex { .. })));
}

#[tokio::test]
async fn test_erasure_hunks_survive_lost_parts() {
    let (ctx, backend) = context(HunkStoreConfig::default());
    let payloads: Vec<Vec<u8>> = (0..20).map(|i| random_payload(100 + i * 37)).collect();

    let mut writer = HunkChunkWriter::new(rs63(), &ctx.config.hunk_chunk_writer);
    let refs: Vec<_> = payloads.iter().map(|p| writer.add_hunk(p).unwrap()).collect();
    let chunk_id = writer.chunk_id();
    writer.close(&ctx).await.unwrap();

    let parts = ctx
        .ledger
        .chunk_meta(chunk_id)
        .unwrap()
        .layout
        .nodes()
        .to_vec();
    for index in [0, 3, 7] {
        backend.ban_node(parts[index]);
    }

    let reader = HunkChunkReader::new(ctx.clone()).unwrap();
    let requests: Vec<_> = refs.iter().map(ReadHunkRequest::from_ref).collect();
    for (response, payload) in reader.read_hunks(&requests).await.iter().zip(&payloads) {
        assert_eq!(response.as_ref().unwrap().as_ref(), payload.as_slice());
    }

    backend.ban_node(parts[5]);
    let responses = reader.read_hunks(&requests[..1]).await;
    match &responses[0] {
        Err(Error::DataUnavailable { missing, .. }) => {
            assert_eq!(
                missing,
                &MissingParts {
                    data: vec![0, 3, 5],
                    parity: vec![7],
                }
            );
        }
        other => panic!("expected DataUnavailable, got {other:?}"),
    }

    for node in &parts {
        backend.unban_node(*node);
    }
    let repairer = ChunkRepairer::new(ctx);
    assert!(repairer.scan().await.unwrap().is_healthy());
}

#[tokio::test(start_paused = true)]
async fn test_hedged_erasure_read_uses_reconstruction() {
    let mut config = HunkStoreConfig::default();
    config.hunk_chunk_reader.fragment_read_hedging_delay_ms = Some(10);
    config.hunk_chunk_reader.hedging_manager = Some(HedgingManagerConfig {
        max_backup_request_ratio: 1.0,
    });
    let (ctx, backend) = context(config);

    let data = random_payload(3000);
    let chunk_id = write_blob_chunk(&ctx, rs63(), Bytes::from(data.clone()))
        .await
        .unwrap();
    let parts = ctx
        .ledger
        .chunk_meta(chunk_id)
        .unwrap()
        .layout
        .nodes()
        .to_vec();
    backend.set_latency(parts[0], Duration::from_secs(10));

    let reader = HunkChunkReader::new(ctx).unwrap();
    let started = tokio::time::Instant::now();
    let responses = reader
        .read_hunks(&[ReadHunkRequest::new(chunk_id, 0, 10, 10)])
        .await;
    assert_eq!(responses[0].as_ref().unwrap().as_ref(), &data[10..20]);
    assert!(started.elapsed() < Duration::from_secs(10));

    let counters = reader.hedging_counters().unwrap();
    assert_eq!(counters.primary_request_count, 1);
    assert_eq!(counters.backup_request_count, 1);
}

#[tokio::test]
async fn test_partial_success_across_chunks() {
    let (ctx, backend) = context(HunkStoreConfig::default());
    let healthy = write_blob_chunk(&ctx, ErasureCodecId::None, Bytes::from_static(b"healthy"))
        .await
        .unwrap();
    let lost = write_blob_chunk(&ctx, ErasureCodecId::None, Bytes::from_static(b"lost"))
        .await
        .unwrap();
    for node in ctx.ledger.chunk_meta(lost).unwrap().layout.nodes() {
        backend.ban_node(*node);
    }

    let reader = HunkChunkReader::new(ctx).unwrap();
    let responses = reader
        .read_hunks(&[
            ReadHunkRequest::new(lost, 0, 0, 4),
            ReadHunkRequest::new(healthy, 0, 0, 7),
        ])
        .await;
    assert!(matches!(responses[0], Err(Error::DataUnavailable { .. })));
    assert_eq!(responses[1].as_ref().unwrap().as_ref(), b"healthy");
}
