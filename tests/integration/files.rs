use bytes::Bytes;

use fanout_core::chunk::Chunk;
use fanout_core::crypto::checksum;
use fanout_services::{Assembler, ChunkTransport, TcpTransport};

use crate::*;

const MIB: usize = 1024 * 1024;

/// 10 MiB over two nodes with 4 MiB − 500 B chunks and three workers.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_ten_mib_round_trip() {
    let dir = TestDir::new("ten-mib");
    let input = write_input(dir.path(), "payload.bin", 10 * MIB);
    let node_a = TestReceiver::start(&dir.path().join("node-a")).await.unwrap();
    let node_b = TestReceiver::start(&dir.path().join("node-b")).await.unwrap();

    let sent = send_file(
        &input,
        4 * MIB - 500,
        fast_config(&[&node_a.addr, &node_b.addr], 3, 3),
    )
    .await
    .unwrap();

    assert_eq!(sent.total, 3);
    assert_eq!(sent.summary.delivered, 3);
    assert_eq!(sent.summary.failed, 0);
    assert_eq!(sent.progress, 3);
    assert!(node_a.received.is_complete(&sent.file_id));

    // First attempts all target the first node.
    let prefix = dir.path().join("out").join("restored");
    let summary = Assembler::from_store(node_a.store.clone())
        .assemble_all(&prefix)
        .unwrap();
    assert!(summary.is_success(), "{:?}", summary.failed);
    let report = &summary.assembled[0];
    assert_eq!(report.file_id, sent.file_id);
    assert_eq!(report.file_name.as_deref(), Some("payload.bin"));
    assert_eq!(report.bytes, (10 * MIB) as u64);

    let original = std::fs::read(&input).unwrap();
    assert_eq!(report.checksum, checksum(&original));
    assert_eq!(std::fs::read(&report.output).unwrap(), original);

    node_a.stop().await.unwrap();
    node_b.stop().await.unwrap();
}

/// Many small chunks, more than the queue holds, reassemble byte-for-byte.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_many_chunks_with_backpressure() {
    let dir = TestDir::new("many");
    let input = write_input(dir.path(), "notes.txt", 100_000);
    let node = TestReceiver::start(&dir.path().join("node")).await.unwrap();

    let sent = send_file(&input, 4096, fast_config(&[&node.addr], 3, 4)).await.unwrap();
    assert_eq!(sent.total, 25);
    assert_eq!(sent.summary.delivered, 25);
    assert_eq!(node.store.count(), 25);

    let summary = Assembler::from_store(node.store.clone())
        .assemble_all(&dir.path().join("restored"))
        .unwrap();
    assert_eq!(
        std::fs::read(&summary.assembled[0].output).unwrap(),
        std::fs::read(&input).unwrap()
    );

    node.stop().await.unwrap();
}

/// Two transfers into one directory assemble as two independent files.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_two_files_share_a_node() {
    let dir = TestDir::new("two-files");
    let first = write_input(dir.path(), "first.bin", 9_000);
    let second = write_input(dir.path(), "second.bin", 5_000);
    let node = TestReceiver::start(&dir.path().join("node")).await.unwrap();

    let a = send_file(&first, 1000, fast_config(&[&node.addr], 2, 2)).await.unwrap();
    let b = send_file(&second, 1000, fast_config(&[&node.addr], 2, 2)).await.unwrap();
    assert_ne!(a.file_id, b.file_id);
    assert_eq!(node.received.file_count(), 2);

    let summary = Assembler::from_store(node.store.clone())
        .assemble_all(&dir.path().join("restored"))
        .unwrap();
    assert_eq!(summary.assembled.len(), 2);
    for report in &summary.assembled {
        let source = if report.file_id == a.file_id { &first } else { &second };
        assert_eq!(report.checksum, checksum(&std::fs::read(source).unwrap()));
    }

    node.stop().await.unwrap();
}

/// Re-sending a chunk leaves exactly one identical file.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_redelivery_is_idempotent() {
    let dir = TestDir::new("redeliver");
    let node = TestReceiver::start(&dir.path().join("node")).await.unwrap();
    let transport = TcpTransport::new(Duration::from_secs(5));

    let chunk = Chunk::new("redeliver-01", 0, 2, Bytes::from_static(b"same bytes"), "r.bin");
    for _ in 0..3 {
        let ack = transport.send_chunk(&node.addr, &chunk).await.unwrap();
        assert!(ack.success, "{}", ack.message);
        assert_eq!(ack.message, "chunk received");
    }

    assert_eq!(node.store.count(), 1);
    assert_eq!(node.received.received_count("redeliver-01"), 1);
    let stored = node.store.get("redeliver-01", 0).unwrap().unwrap();
    assert_eq!(checksum(&stored), chunk.checksum);

    node.stop().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_empty_file_sends_nothing() {
    let dir = TestDir::new("empty");
    let input = write_input(dir.path(), "empty.bin", 0);
    let node = TestReceiver::start(&dir.path().join("node")).await.unwrap();

    let sent = send_file(&input, 4096, fast_config(&[&node.addr], 2, 1)).await.unwrap();
    assert_eq!(sent.total, 0);
    assert_eq!(sent.summary.delivered, 0);
    assert_eq!(node.store.count(), 0);

    node.stop().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_health_probe() {
    let dir = TestDir::new("health");
    let node = TestReceiver::start(&dir.path().join("node")).await.unwrap();
    let transport = TcpTransport::new(Duration::from_secs(5));

    assert!(transport.health_check(&node.addr).await.unwrap());
    let dead = dead_node().await;
    assert!(transport.health_check(&dead).await.unwrap_err().is_transport());

    node.stop().await.unwrap();
}
