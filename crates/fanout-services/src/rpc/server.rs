//! RPC server: accepts TCP connections and serves transfer requests.
//!
//! One task per connection. Each connection carries any number of
//! request/response exchanges until the peer closes it, it idles past the
//! timeout, or it sends a frame we cannot decode. On shutdown the listener
//! stops accepting, idle connections close, and requests already arriving
//! or being processed run to completion before `run` returns.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio::task::JoinSet;

use fanout_core::wire::{HealthMeta, Request, Response};

use super::frame::{read_frame, write_frame, FrameError};
use crate::service::TransferService;

pub struct RpcServer {
    listener: TcpListener,
    service: Arc<dyn TransferService>,
    idle_timeout: Duration,
    shutdown: broadcast::Receiver<()>,
}

impl RpcServer {
    pub async fn bind(
        addr: &str,
        service: Arc<dyn TransferService>,
        idle_timeout: Duration,
        shutdown: broadcast::Receiver<()>,
    ) -> Result<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("failed to bind {addr}"))?;
        Ok(Self {
            listener,
            service,
            idle_timeout,
            shutdown,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.listener
            .local_addr()
            .context("failed to read listener address")
    }

    pub async fn run(mut self) -> Result<()> {
        let mut connections = JoinSet::new();
        let (close_tx, _) = broadcast::channel::<()>(1);
        tracing::info!(addr = ?self.listener.local_addr().ok(), "rpc server listening");

        loop {
            tokio::select! {
                _ = self.shutdown.recv() => {
                    tracing::info!("rpc server shutting down");
                    break;
                }

                accepted = self.listener.accept() => {
                    let (stream, peer) = match accepted {
                        Ok(a) => a,
                        Err(e) => {
                            tracing::warn!(error = %e, "accept failed");
                            continue;
                        }
                    };
                    let _ = stream.set_nodelay(true);
                    connections.spawn(serve_connection(
                        stream,
                        peer,
                        self.service.clone(),
                        self.idle_timeout,
                        close_tx.subscribe(),
                    ));
                }

                Some(done) = connections.join_next(), if !connections.is_empty() => {
                    if let Err(e) = done {
                        tracing::warn!(error = %e, "connection task panicked");
                    }
                }
            }
        }

        drop(self.listener);
        let _ = close_tx.send(());
        let in_flight = connections.len();
        if in_flight > 0 {
            tracing::info!(connections = in_flight, "draining connections");
        }
        while let Some(done) = connections.join_next().await {
            if let Err(e) = done {
                tracing::warn!(error = %e, "connection task panicked");
            }
        }
        tracing::info!("rpc server stopped");
        Ok(())
    }
}

async fn serve_connection(
    mut stream: TcpStream,
    peer: SocketAddr,
    service: Arc<dyn TransferService>,
    idle_timeout: Duration,
    mut close: broadcast::Receiver<()>,
) {
    tracing::debug!(%peer, "connection opened");

    loop {
        // Shutdown is only observed between frames. Once the first byte of a
        // frame is here, the request is read, handled and answered.
        let mut first = [0u8; 1];
        let arrived = tokio::select! {
            _ = close.recv() => break,
            arrived = tokio::time::timeout(idle_timeout, stream.peek(&mut first)) => arrived,
        };
        match arrived {
            Err(_) => {
                tracing::debug!(%peer, "connection idle, closing");
                break;
            }
            Ok(Ok(0)) => break,
            Ok(Ok(_)) => {}
            Ok(Err(e)) => {
                tracing::debug!(%peer, error = %e, "connection read failed");
                break;
            }
        }

        let raw = match tokio::time::timeout(idle_timeout, read_frame(&mut stream)).await {
            Err(_) => {
                tracing::debug!(%peer, "connection stalled mid-frame, closing");
                break;
            }
            Ok(Ok(Some(raw))) => raw,
            Ok(Ok(None)) => break,
            Ok(Err(FrameError::Io(e))) => {
                tracing::debug!(%peer, error = %e, "connection read failed");
                break;
            }
            Ok(Err(FrameError::Wire(e))) => {
                tracing::warn!(%peer, error = %e, "malformed frame, closing connection");
                reply(&mut stream, peer, Response::error(e.to_string())).await;
                break;
            }
        };

        let request = match Request::decode(raw.kind, &raw.meta, raw.payload) {
            Ok(r) => r,
            Err(e) => {
                tracing::warn!(%peer, error = %e, "undecodable request, closing connection");
                reply(&mut stream, peer, Response::error(e.to_string())).await;
                break;
            }
        };

        let response = handle(request, service.clone()).await;
        if !reply(&mut stream, peer, response).await {
            break;
        }
    }

    tracing::debug!(%peer, "connection closed");
}

async fn handle(request: Request, service: Arc<dyn TransferService>) -> Response {
    // Service calls touch the disk; keep them off the async workers.
    let result = match request {
        Request::SendChunk(chunk) => {
            tokio::task::spawn_blocking(move || Response::from(service.accept_chunk(chunk))).await
        }
        Request::HealthCheck => {
            tokio::task::spawn_blocking(move || {
                Response::Health(HealthMeta {
                    ready: service.health_check(),
                })
            })
            .await
        }
    };
    result.unwrap_or_else(|e| {
        tracing::error!(error = %e, "service call panicked");
        Response::error("internal error")
    })
}

async fn reply(stream: &mut TcpStream, peer: SocketAddr, response: Response) -> bool {
    let frame = match response.encode() {
        Ok(f) => f,
        Err(e) => {
            tracing::error!(%peer, error = %e, "failed to encode response");
            return false;
        }
    };
    match write_frame(stream, &frame).await {
        Ok(()) => true,
        Err(e) => {
            tracing::debug!(%peer, error = %e, "failed to write response");
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use fanout_core::chunk::Chunk;
    use fanout_core::wire::FrameKind;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::io::AsyncWriteExt;

    use crate::service::Ack;

    #[derive(Default)]
    struct CountingService {
        accepted: AtomicUsize,
    }

    impl TransferService for CountingService {
        fn accept_chunk(&self, chunk: Chunk) -> Ack {
            self.accepted.fetch_add(1, Ordering::SeqCst);
            if chunk.checksum_matches() {
                Ack::ok("chunk received")
            } else {
                Ack::rejected("checksum mismatch")
            }
        }

        fn health_check(&self) -> bool {
            true
        }
    }

    async fn start(
        service: Arc<CountingService>,
    ) -> (SocketAddr, broadcast::Sender<()>, tokio::task::JoinHandle<Result<()>>) {
        let (tx, rx) = broadcast::channel(1);
        let server = RpcServer::bind("127.0.0.1:0", service, Duration::from_secs(5), rx)
            .await
            .unwrap();
        let addr = server.local_addr().unwrap();
        (addr, tx, tokio::spawn(server.run()))
    }

    async fn exchange(stream: &mut TcpStream, request: Request) -> Response {
        write_frame(stream, &request.encode().unwrap()).await.unwrap();
        let raw = read_frame(stream).await.unwrap().unwrap();
        Response::decode(raw.kind, &raw.meta).unwrap()
    }

    #[tokio::test]
    async fn serves_multiple_requests_per_connection() {
        let service = Arc::new(CountingService::default());
        let (addr, shutdown, task) = start(service.clone()).await;

        let mut stream = TcpStream::connect(addr).await.unwrap();
        let health = exchange(&mut stream, Request::HealthCheck).await;
        assert_eq!(health, Response::Health(HealthMeta { ready: true }));

        let chunk = Chunk::new("f", 0, 1, Bytes::from_static(b"data"), "a.bin");
        let ack = exchange(&mut stream, Request::SendChunk(chunk.clone())).await;
        assert_eq!(ack, Response::ack(true, "chunk received"));

        let mut bad = chunk;
        bad.checksum = "00".repeat(32);
        let ack = exchange(&mut stream, Request::SendChunk(bad)).await;
        assert_eq!(ack, Response::ack(false, "checksum mismatch"));
        assert_eq!(service.accepted.load(Ordering::SeqCst), 2);

        drop(stream);
        let _ = shutdown.send(());
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn malformed_frame_gets_error_and_close() {
        let service = Arc::new(CountingService::default());
        let (addr, shutdown, task) = start(service.clone()).await;

        let mut stream = TcpStream::connect(addr).await.unwrap();
        stream.write_all(b"GET / HTTP/1.1\r\n\r\n  ").await.unwrap();

        let raw = read_frame(&mut stream).await.unwrap().unwrap();
        assert_eq!(raw.kind, FrameKind::Error);
        assert!(read_frame(&mut stream).await.unwrap().is_none());
        assert_eq!(service.accepted.load(Ordering::SeqCst), 0);

        // The server itself keeps serving.
        let mut other = TcpStream::connect(addr).await.unwrap();
        let health = exchange(&mut other, Request::HealthCheck).await;
        assert_eq!(health, Response::Health(HealthMeta { ready: true }));

        let _ = shutdown.send(());
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn shutdown_closes_idle_connections() {
        let service = Arc::new(CountingService::default());
        let (addr, shutdown, task) = start(service).await;

        let mut stream = TcpStream::connect(addr).await.unwrap();
        exchange(&mut stream, Request::HealthCheck).await;

        let _ = shutdown.send(());
        tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .expect("server drains promptly")
            .unwrap()
            .unwrap();
        assert!(read_frame(&mut stream).await.map(|f| f.is_none()).unwrap_or(true));
        assert!(TcpStream::connect(addr).await.is_err());
    }
}
