use bytes::Bytes;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;

use fanout_core::chunk::Chunk;
use fanout_core::crypto::checksum;
use fanout_core::wire::{FrameKind, Request, Response};
use fanout_services::rpc::{read_frame, write_frame};
use fanout_services::{
    Assembler, AssemblyError, ChunkTransport, DispatchEngine, DispatchError, TcpTransport,
};

use crate::*;

// ══════════════════════════════════════════════════════════════════════════════
//  Node failures
// ══════════════════════════════════════════════════════════════════════════════

/// The first node is down. Every chunk fails there once, then lands on the second.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_dead_first_node_rotates() {
    let dir = TestDir::new("dead-first");
    let input = write_input(dir.path(), "input.bin", 50_000);
    let dead = dead_node().await;
    let live = TestReceiver::start(&dir.path().join("live")).await.unwrap();

    let sent = send_file(&input, 8192, fast_config(&[&dead, &live.addr], 3, 2))
        .await
        .unwrap();
    assert_eq!(sent.total, 7);
    assert_eq!(sent.summary.delivered, 7);
    assert_eq!(sent.summary.failed, 0);
    assert!(live.received.is_complete(&sent.file_id));

    live.stop().await.unwrap();
}

/// No node reachable: every chunk is permanently failed and `wait` still returns.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_all_nodes_dead() {
    let dir = TestDir::new("all-dead");
    let input = write_input(dir.path(), "input.bin", 3000);
    let a = dead_node().await;
    let b = dead_node().await;

    let sent = send_file(&input, 1000, fast_config(&[&a, &b], 2, 3)).await.unwrap();
    assert_eq!(sent.summary.delivered, 0);
    assert_eq!(sent.summary.failed, 3);
    assert_eq!(sent.progress, 0);
    assert!(sent.summary.failures.iter().all(|f| f.attempts == 5));
}

// ══════════════════════════════════════════════════════════════════════════════
//  Integrity
// ══════════════════════════════════════════════════════════════════════════════

/// A corrupted payload is refused on the wire and never stored.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_checksum_mismatch_rejected_over_the_wire() {
    let dir = TestDir::new("mismatch");
    let node = TestReceiver::start(&dir.path().join("node")).await.unwrap();
    let transport = TcpTransport::new(Duration::from_secs(5));

    let mut chunk = Chunk::new("mismatch-01", 0, 1, Bytes::from_static(b"original"), "m.bin");
    chunk.payload = Bytes::from_static(b"tampered");

    let ack = transport.send_chunk(&node.addr, &chunk).await.unwrap();
    assert!(!ack.success);
    assert_eq!(ack.message, "checksum mismatch");
    assert!(!node.store.has("mismatch-01", 0));
    assert!(!node.received.contains("mismatch-01", 0));

    node.stop().await.unwrap();
}

/// One chunk that every node refuses fails alone after five attempts; the
/// rest of the file still arrives, and assembly then reports the hole.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_rejected_chunk_is_isolated() {
    let dir = TestDir::new("isolated");
    let a = TestReceiver::start(&dir.path().join("a")).await.unwrap();
    let b = TestReceiver::start(&dir.path().join("b")).await.unwrap();

    let transport = Arc::new(TcpTransport::new(Duration::from_secs(5)));
    let mut engine =
        DispatchEngine::new(fast_config(&[&a.addr, &b.addr], 2, 4), transport, 4).unwrap();
    for i in 0..4u32 {
        let mut chunk = Chunk::new("isolated-01", i, 4, Bytes::from(vec![i as u8; 64]), "i.bin");
        if i == 2 {
            chunk.checksum = checksum(b"not the payload");
        }
        engine.enqueue(chunk).await.unwrap();
    }
    engine.run();
    let summary = engine.wait().await;

    assert_eq!(summary.delivered, 3);
    assert_eq!(summary.failed, 1);
    assert_eq!(summary.failures[0].index, 2);
    assert_eq!(summary.failures[0].attempts, 5);
    assert!(summary.failures[0].last_error.contains("checksum mismatch"));

    let assembled = Assembler::from_store(a.store.clone())
        .assemble_all(&dir.path().join("restored"))
        .unwrap();
    assert!(assembled.assembled.is_empty());
    assert!(matches!(
        assembled.failed[0].1,
        AssemblyError::Gap { expected: 2, found: 3 }
    ));

    a.stop().await.unwrap();
    b.stop().await.unwrap();
}

// ══════════════════════════════════════════════════════════════════════════════
//  Receiver lifecycle
// ══════════════════════════════════════════════════════════════════════════════

/// Garbage on one connection closes that connection only.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_malformed_frame_closes_only_that_connection() {
    let dir = TestDir::new("malformed");
    let node = TestReceiver::start(&dir.path().join("node")).await.unwrap();

    let mut bad = TcpStream::connect(&node.addr).await.unwrap();
    bad.write_all(&[0xEE; 20]).await.unwrap();
    let reply = read_frame(&mut bad).await.unwrap().unwrap();
    assert_eq!(reply.kind, FrameKind::Error);

    let mut good = TcpStream::connect(&node.addr).await.unwrap();
    write_frame(&mut good, &Request::HealthCheck.encode().unwrap())
        .await
        .unwrap();
    let raw = read_frame(&mut good).await.unwrap().unwrap();
    assert!(matches!(
        Response::decode(raw.kind, &raw.meta).unwrap(),
        Response::Health(h) if h.ready
    ));

    node.stop().await.unwrap();
}

/// Shutdown stops accepting, closes idle connections and returns.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_graceful_shutdown() {
    let dir = TestDir::new("shutdown");
    let node = TestReceiver::start(&dir.path().join("node")).await.unwrap();
    let addr = node.addr.clone();
    let transport = TcpTransport::new(Duration::from_secs(5));

    let chunk = Chunk::new("shutdown-01", 0, 1, Bytes::from_static(b"last words"), "s.bin");
    assert!(transport.send_chunk(&addr, &chunk).await.unwrap().success);

    let idle = TcpStream::connect(&addr).await.unwrap();
    let store = node.store.clone();
    node.stop().await.unwrap();

    assert!(store.has("shutdown-01", 0));
    assert!(transport.health_check(&addr).await.unwrap_err().is_transport());
    drop(idle);
}

/// A request already arriving when shutdown fires is still answered.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_shutdown_mid_frame_completes_request() {
    use zerocopy::AsBytes;

    let dir = TestDir::new("shutdown-mid-frame");
    let node = TestReceiver::start(&dir.path().join("node")).await.unwrap();
    let store = node.store.clone();

    let chunk = Chunk::new("midframe-01", 0, 1, Bytes::from(vec![9u8; 65_536]), "m.bin");
    let frame = Request::SendChunk(chunk).encode().unwrap();

    let mut stream = TcpStream::connect(&node.addr).await.unwrap();
    stream.write_all(frame.header.as_bytes()).await.unwrap();
    stream.write_all(&frame.meta).await.unwrap();
    stream.write_all(&frame.payload[..1000]).await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    let stopping = tokio::spawn(node.stop());
    tokio::time::sleep(Duration::from_millis(100)).await;
    stream.write_all(&frame.payload[1000..]).await.unwrap();

    let raw = read_frame(&mut stream).await.unwrap().expect("ack before close");
    assert_eq!(
        Response::decode(raw.kind, &raw.meta).unwrap(),
        Response::ack(true, "chunk received")
    );
    stopping.await.unwrap().unwrap();
    assert!(store.has("midframe-01", 0));
}

/// Cancelling while every node is down stops the engine during backoff.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_cancel_while_backing_off() {
    let dead = dead_node().await;
    let mut config = fast_config(&[&dead], 1, 8);
    config.retry.backoff_unit = Duration::from_secs(60);

    let transport = Arc::new(TcpTransport::new(Duration::from_secs(5)));
    let mut engine = DispatchEngine::new(config, transport, 8).unwrap();
    let queue = engine.queue();
    for i in 0..8u32 {
        let chunk = Chunk::new("cancel-01", i, 8, Bytes::from(vec![1u8; 16]), "c.bin");
        queue.enqueue(chunk).await.unwrap();
    }
    let cancel = engine.cancel_handle();
    engine.run();

    tokio::time::sleep(Duration::from_millis(200)).await;
    cancel.cancel();
    assert!(matches!(
        queue.enqueue(Chunk::new("cancel-01", 0, 8, Bytes::from_static(b"x"), "c.bin")).await,
        Err(DispatchError::Cancelled)
    ));
    drop(queue);

    let summary = tokio::time::timeout(Duration::from_secs(5), engine.wait())
        .await
        .expect("cancelled engine finishes promptly");
    assert_eq!(summary.delivered, 0);
    assert_eq!(summary.failed, 0);
    assert_eq!(summary.cancelled, 8);
}
