//! Mesh Datagram Transport
//!
//! Envelopes travel as single bincode-encoded datagrams. The
//! [`PeerTransport`] trait is the seam every subsystem sends through;
//! inbound traffic is delivered on an mpsc channel so a single dispatch
//! task owns message handling.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, oneshot, Mutex, RwLock};
use tracing::{debug, info, trace, warn};

use crate::error::{NetworkError, NetworkResult};
use crate::protocol::{Envelope, MAX_ENVELOPE_SIZE};

/// Inbound channel depth per transport
const INBOUND_QUEUE: usize = 1024;

/// A decoded envelope and the address it arrived from
#[derive(Debug, Clone)]
pub struct InboundMessage {
    pub from: SocketAddr,
    pub envelope: Envelope,
}

/// Outbound side of a mesh transport
#[async_trait]
pub trait PeerTransport: Send + Sync {
    /// Address other peers reach us at
    fn local_addr(&self) -> SocketAddr;

    /// Send one envelope (fire and forget)
    async fn send(&self, to: SocketAddr, envelope: &Envelope) -> NetworkResult<()>;
}

/// UDP mesh transport
pub struct UdpMeshTransport {
    socket: Arc<UdpSocket>,
    local_addr: SocketAddr,
}

impl UdpMeshTransport {
    /// Bind a socket and spawn its receive loop
    pub async fn bind(
        bind_addr: SocketAddr,
    ) -> NetworkResult<(Arc<Self>, mpsc::Receiver<InboundMessage>)> {
        let socket = Arc::new(UdpSocket::bind(bind_addr).await?);
        let local_addr = socket.local_addr()?;
        info!("Mesh transport listening on {}", local_addr);

        let (tx, rx) = mpsc::channel(INBOUND_QUEUE);
        let recv_socket = socket.clone();
        tokio::spawn(async move {
            let mut buf = vec![0u8; MAX_ENVELOPE_SIZE];
            loop {
                let (len, from) = match recv_socket.recv_from(&mut buf).await {
                    Ok(r) => r,
                    Err(e) => {
                        warn!("Mesh socket receive error: {}", e);
                        continue;
                    }
                };

                match Envelope::from_bytes(&buf[..len]) {
                    Ok(envelope) => {
                        trace!("Received {} from {}", envelope.body.kind(), from);
                        if tx.send(InboundMessage { from, envelope }).await.is_err() {
                            debug!("Mesh inbound channel closed, stopping receive loop");
                            break;
                        }
                    }
                    Err(e) => {
                        debug!("Dropping malformed datagram from {}: {}", from, e);
                    }
                }
            }
        });

        Ok((Arc::new(Self { socket, local_addr }), rx))
    }
}

#[async_trait]
impl PeerTransport for UdpMeshTransport {
    fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    async fn send(&self, to: SocketAddr, envelope: &Envelope) -> NetworkResult<()> {
        let bytes = envelope.to_bytes()?;
        self.socket.send_to(&bytes, to).await?;
        trace!("Sent {} to {}", envelope.body.kind(), to);
        Ok(())
    }
}

/// In-process switchboard connecting [`MemoryTransport`] endpoints
#[derive(Clone, Default)]
pub struct MemoryHub {
    endpoints: Arc<RwLock<HashMap<SocketAddr, mpsc::Sender<InboundMessage>>>>,
}

impl MemoryHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an endpoint at `addr`
    pub async fn endpoint(
        &self,
        addr: SocketAddr,
    ) -> (Arc<MemoryTransport>, mpsc::Receiver<InboundMessage>) {
        let (tx, rx) = mpsc::channel(INBOUND_QUEUE);
        self.endpoints.write().await.insert(addr, tx);
        let transport = MemoryTransport {
            hub: self.clone(),
            local_addr: addr,
        };
        (Arc::new(transport), rx)
    }

    /// Detach an endpoint; later sends to it fail
    pub async fn disconnect(&self, addr: &SocketAddr) {
        self.endpoints.write().await.remove(addr);
    }
}

/// Endpoint attached to a [`MemoryHub`]
pub struct MemoryTransport {
    hub: MemoryHub,
    local_addr: SocketAddr,
}

#[async_trait]
impl PeerTransport for MemoryTransport {
    fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    async fn send(&self, to: SocketAddr, envelope: &Envelope) -> NetworkResult<()> {
        // Encode anyway so size limits apply exactly as on UDP
        let bytes = envelope.to_bytes()?;
        let envelope = Envelope::from_bytes(&bytes)?;

        let sender = {
            let endpoints = self.hub.endpoints.read().await;
            endpoints.get(&to).cloned()
        };
        let sender = sender
            .ok_or_else(|| NetworkError::ConnectionFailed(format!("No endpoint at {}", to)))?;

        sender
            .send(InboundMessage {
                from: self.local_addr,
                envelope,
            })
            .await
            .map_err(|_| NetworkError::ConnectionFailed(format!("Endpoint {} closed", to)))
    }
}

/// Pending request table matching responses to requests by id
pub struct RequestTracker<T> {
    pending: Mutex<HashMap<u64, oneshot::Sender<T>>>,
    next_id: AtomicU64,
}

impl<T> RequestTracker<T> {
    pub fn new() -> Self {
        Self {
            pending: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(rand::random::<u32>() as u64),
        }
    }

    /// Allocate an id and the receiver its response will arrive on
    pub async fn register(&self) -> (u64, oneshot::Receiver<T>) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(id, tx);
        (id, rx)
    }

    /// Deliver a response; returns false for unknown or already-completed ids
    pub async fn complete(&self, id: u64, value: T) -> bool {
        let sender = self.pending.lock().await.remove(&id);
        match sender {
            Some(tx) => tx.send(value).is_ok(),
            None => false,
        }
    }

    /// Forget a request (e.g. after its timeout fired)
    pub async fn cancel(&self, id: u64) {
        self.pending.lock().await.remove(&id);
    }

    /// Drop every waiter; their receivers see the sender closed
    pub async fn cancel_all(&self) -> usize {
        self.pending.lock().await.drain().count()
    }

    pub async fn outstanding(&self) -> usize {
        self.pending.lock().await.len()
    }
}

impl<T> Default for RequestTracker<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{MessageBody, PeerId};

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::from(([10, 0, 0, 1], port))
    }

    #[tokio::test]
    async fn test_memory_hub_delivery() {
        let hub = MemoryHub::new();
        let (a, _rx_a) = hub.endpoint(addr(1)).await;
        let (_b, mut rx_b) = hub.endpoint(addr(2)).await;

        let msg = Envelope::new(PeerId::random(), MessageBody::Ping { nonce: 9 });
        a.send(addr(2), &msg).await.unwrap();

        let inbound = rx_b.recv().await.unwrap();
        assert_eq!(inbound.from, addr(1));
        assert_eq!(inbound.envelope, msg);
    }

    #[tokio::test]
    async fn test_memory_hub_unknown_endpoint() {
        let hub = MemoryHub::new();
        let (a, _rx) = hub.endpoint(addr(1)).await;
        let msg = Envelope::new(PeerId::random(), MessageBody::Ping { nonce: 1 });

        assert!(a.send(addr(3), &msg).await.is_err());
    }

    #[tokio::test]
    async fn test_udp_loopback() {
        let (a, _rx_a) = UdpMeshTransport::bind("127.0.0.1:0".parse().unwrap()).await.unwrap();
        let (b, mut rx_b) = UdpMeshTransport::bind("127.0.0.1:0".parse().unwrap()).await.unwrap();

        let msg = Envelope::new(PeerId::random(), MessageBody::Pong { nonce: 42 });
        a.send(b.local_addr(), &msg).await.unwrap();

        let inbound = rx_b.recv().await.unwrap();
        assert_eq!(inbound.envelope.body, MessageBody::Pong { nonce: 42 });
    }

    #[tokio::test]
    async fn test_request_tracker() {
        let tracker: RequestTracker<u32> = RequestTracker::new();
        let (id, rx) = tracker.register().await;
        assert_eq!(tracker.outstanding().await, 1);

        assert!(tracker.complete(id, 7).await);
        assert_eq!(rx.await.unwrap(), 7);
        assert!(!tracker.complete(id, 8).await);
        assert_eq!(tracker.outstanding().await, 0);
    }

    #[tokio::test]
    async fn test_request_tracker_cancel_all() {
        let tracker: RequestTracker<u32> = RequestTracker::new();
        let (_, first) = tracker.register().await;
        let (_, second) = tracker.register().await;

        assert_eq!(tracker.cancel_all().await, 2);
        assert!(first.await.is_err());
        assert!(second.await.is_err());
    }
}
