//! The one capability the protocol layers need from a socket: fire-and-forget
//! sending to an address. Receiving is the endpoint loop's job (see `udp`).

use std::net::SocketAddr;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::warn;

pub trait Transport {
    fn send(&self, bytes: Vec<u8>, target: SocketAddr);
}

/// An outbound datagram.
pub type Outbound = (Vec<u8>, SocketAddr);

/// Hands datagrams to an async writer task.
#[derive(Clone)]
pub struct ChannelTransport {
    tx: mpsc::UnboundedSender<Outbound>,
}

impl ChannelTransport {
    pub fn new(tx: mpsc::UnboundedSender<Outbound>) -> Self {
        Self { tx }
    }
}

impl Transport for ChannelTransport {
    fn send(&self, bytes: Vec<u8>, target: SocketAddr) {
        if self.tx.send((bytes, target)).is_err() {
            warn!(%target, "writer closed, datagram dropped");
        }
    }
}

/// Records what would have been sent. Used by tests and dry runs.
#[derive(Clone, Default)]
pub struct MemoryTransport {
    sent: Arc<Mutex<Vec<Outbound>>>,
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drain everything sent so far.
    pub fn take(&self) -> Vec<Outbound> {
        std::mem::take(&mut *self.sent.lock())
    }

    pub fn len(&self) -> usize {
        self.sent.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.sent.lock().is_empty()
    }
}

impl Transport for MemoryTransport {
    fn send(&self, bytes: Vec<u8>, target: SocketAddr) {
        self.sent.lock().push((bytes, target));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_transport_records_in_order() {
        let t = MemoryTransport::new();
        let a: SocketAddr = "127.0.0.1:1".parse().unwrap();
        t.send(vec![1], a);
        t.send(vec![2], a);
        assert_eq!(t.len(), 2);
        assert_eq!(t.take(), vec![(vec![1], a), (vec![2], a)]);
        assert!(t.is_empty());
    }

    #[test]
    fn channel_transport_forwards() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let t = ChannelTransport::new(tx);
        let a: SocketAddr = "127.0.0.1:2".parse().unwrap();
        t.send(b"x".to_vec(), a);
        assert_eq!(rx.try_recv().unwrap(), (b"x".to_vec(), a));

        drop(rx);
        t.send(b"y".to_vec(), a);
    }
}
