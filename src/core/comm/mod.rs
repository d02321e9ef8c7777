// src/core/comm/mod.rs

//! TCP transport for the protocol layer: a connection-caching client and a
//! per-connection dispatch loop on the serving side.

pub mod clients;

pub use clients::{MasterClient, RangeServerClient};

use crate::core::TesseraError;
use crate::core::protocol::messages::RpcBody;
use crate::core::protocol::{Envelope, RpcCodec, RpcRequest, RpcResponse, WireError};
use async_trait::async_trait;
use dashmap::DashMap;
use futures::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc};
use tokio_util::codec::Framed;
use tracing::{debug, error, warn};

/// A service that answers protocol requests. Long-running commands reply
/// immediately and continue asynchronously, reporting back through their own
/// client connection, so handlers are expected to return promptly.
#[async_trait]
pub trait RpcService: Send + Sync + 'static {
    async fn handle(&self, request: RpcRequest) -> Result<RpcResponse, TesseraError>;
}

/// One cached connection to a peer. Calls are serialized on the connection;
/// a send or receive failure drops the stream so the next call reconnects.
pub struct RpcClient {
    addr: SocketAddr,
    stream: tokio::sync::Mutex<Option<Framed<TcpStream, RpcCodec>>>,
    next_id: AtomicU64,
}

impl RpcClient {
    pub fn new(addr: SocketAddr) -> Self {
        Self {
            addr,
            stream: tokio::sync::Mutex::new(None),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Sends a request and awaits its response within `timeout`.
    pub async fn call(
        &self,
        request: RpcRequest,
        timeout: Duration,
    ) -> Result<RpcResponse, TesseraError> {
        match tokio::time::timeout(timeout, self.call_inner(request, timeout)).await {
            Ok(result) => result,
            Err(_) => {
                // Leave no half-read response behind on the connection.
                *self.stream.lock().await = None;
                Err(TesseraError::RequestTimeout(self.addr.to_string()))
            }
        }
    }

    async fn call_inner(
        &self,
        request: RpcRequest,
        timeout: Duration,
    ) -> Result<RpcResponse, TesseraError> {
        let mut guard = self.stream.lock().await;
        if guard.is_none() {
            let stream = TcpStream::connect(self.addr)
                .await
                .map_err(|e| TesseraError::Connection(format!("{}: {e}", self.addr)))?;
            *guard = Some(Framed::new(stream, RpcCodec));
        }
        let framed = guard.as_mut().expect("connected above");
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let envelope = Envelope::request(id, timeout.as_millis() as u32, request);

        if let Err(e) = framed.send(envelope).await {
            *guard = None;
            return Err(TesseraError::Connection(format!("{}: {e}", self.addr)));
        }

        loop {
            match framed.next().await {
                Some(Ok(envelope)) => {
                    let Envelope { header, body } = envelope;
                    match body {
                        RpcBody::Response(response) if header.id == id => {
                            return Ok(response);
                        }
                        RpcBody::Response(_) => {
                            debug!("{}: discarding stale response", self.addr);
                        }
                        RpcBody::Request(_) => {
                            warn!("{}: unexpected request on client connection", self.addr);
                        }
                    }
                }
                Some(Err(e)) => {
                    *guard = None;
                    return Err(e);
                }
                None => {
                    *guard = None;
                    return Err(TesseraError::Connection(format!(
                        "{}: connection closed",
                        self.addr
                    )));
                }
            }
        }
    }
}

/// Process-wide cache of client connections, keyed by peer address.
#[derive(Default)]
pub struct CommRegistry {
    clients: DashMap<SocketAddr, Arc<RpcClient>>,
}

impl CommRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn get(&self, addr: SocketAddr) -> Arc<RpcClient> {
        self.clients
            .entry(addr)
            .or_insert_with(|| Arc::new(RpcClient::new(addr)))
            .clone()
    }

    pub fn invalidate(&self, addr: SocketAddr) {
        self.clients.remove(&addr);
    }
}

/// Accept loop: one task per connection, one task per in-flight request, and
/// a writer draining responses back to the socket.
pub async fn serve(
    listener: TcpListener,
    service: Arc<dyn RpcService>,
    mut shutdown: broadcast::Receiver<()>,
) {
    loop {
        tokio::select! {
            _ = shutdown.recv() => {
                debug!("RPC listener shutting down");
                return;
            }
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, peer)) => {
                        tokio::spawn(handle_connection(stream, peer, service.clone()));
                    }
                    Err(e) => {
                        error!("Accept failed: {}", e);
                    }
                }
            }
        }
    }
}

async fn handle_connection(stream: TcpStream, peer: SocketAddr, service: Arc<dyn RpcService>) {
    let framed = Framed::new(stream, RpcCodec);
    let (mut sink, mut source) = framed.split();
    let (reply_tx, mut reply_rx) = mpsc::channel::<Envelope>(64);

    let writer = tokio::spawn(async move {
        while let Some(envelope) = reply_rx.recv().await {
            if let Err(e) = sink.send(envelope).await {
                debug!("Reply to {} failed: {}", peer, e);
                break;
            }
        }
    });

    while let Some(frame) = source.next().await {
        match frame {
            Ok(envelope) => {
                let id = envelope.header.id;
                match envelope.body {
                    RpcBody::Request(request) => {
                        let service = service.clone();
                        let reply_tx = reply_tx.clone();
                        tokio::spawn(async move {
                            let response = match service.handle(request).await {
                                Ok(response) => response,
                                Err(e) => RpcResponse::Error(WireError::from(&e)),
                            };
                            let _ = reply_tx.send(Envelope::response(id, response)).await;
                        });
                    }
                    RpcBody::Response(_) => {
                        warn!("{}: unexpected response on server connection", peer);
                    }
                }
            }
            Err(e) => {
                debug!("{}: connection error: {}", peer, e);
                break;
            }
        }
    }
    drop(reply_tx);
    let _ = writer.await;
}
