//! tokio UDP endpoint.
//!
//! Three tasks per socket: a reader pushing datagrams into a bounded queue,
//! a writer draining the [`ChannelTransport`] queue, and one processing loop
//! that owns the protocol state and handles datagrams strictly in arrival
//! order. Nothing in the protocol path takes a lock.

use std::io;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, Instant};

use nms_core::wire::MAX_FRAME_SIZE;
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::agent::Agent;
use crate::server::Server;
use crate::transport::{ChannelTransport, Outbound, Transport};

/// Datagrams buffered between the reader and the processing loop.
const INBOUND_QUEUE: usize = 1024;

/// How long `close` waits for queued replies (KYS) to flush.
const FLUSH_GRACE: Duration = Duration::from_millis(250);

/// Protocol state driven by an endpoint's processing loop.
pub trait DatagramHandler: Send + 'static {
    fn on_datagram(&mut self, buf: &[u8], from: SocketAddr, now: Instant);

    /// Periodic housekeeping.
    fn on_tick(&mut self, _now: Instant) {}

    /// The endpoint is shutting down.
    fn on_close(&mut self) {}
}

impl<T: Transport + Send + 'static> DatagramHandler for Server<T> {
    fn on_datagram(&mut self, buf: &[u8], from: SocketAddr, now: Instant) {
        self.handle_datagram(buf, from, now);
    }

    fn on_tick(&mut self, now: Instant) {
        self.expire(now);
    }

    fn on_close(&mut self) {
        self.close();
    }
}

impl<T: Transport + Send + 'static> DatagramHandler for Agent<T> {
    fn on_datagram(&mut self, buf: &[u8], from: SocketAddr, _now: Instant) {
        self.handle_datagram(buf, from);
    }

    fn on_close(&mut self) {
        self.close();
    }
}

pub struct UdpEndpoint {
    local: SocketAddr,
    socket: Arc<UdpSocket>,
    out_tx: mpsc::UnboundedSender<Outbound>,
    writer: JoinHandle<()>,
    reader: Option<JoinHandle<()>>,
    processor: Option<(oneshot::Sender<()>, JoinHandle<()>)>,
}

impl UdpEndpoint {
    /// Bind `addr` and start the writer.
    pub async fn bind(addr: SocketAddr) -> io::Result<Self> {
        let socket = Arc::new(UdpSocket::bind(addr).await?);
        let local = socket.local_addr()?;
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let writer = tokio::spawn(write_loop(Arc::clone(&socket), out_rx));
        info!(%local, "udp endpoint bound");
        Ok(Self {
            local,
            socket,
            out_tx,
            writer,
            reader: None,
            processor: None,
        })
    }

    /// Bind every interface on `port`.
    pub async fn listen(port: u16) -> io::Result<Self> {
        Self::bind(SocketAddr::from((Ipv4Addr::UNSPECIFIED, port))).await
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local
    }

    /// Outbound handle for the protocol layers.
    pub fn transport(&self) -> ChannelTransport {
        ChannelTransport::new(self.out_tx.clone())
    }

    pub fn is_running(&self) -> bool {
        self.processor.is_some()
    }

    /// Start receiving into `handler`. `tick` paces its housekeeping.
    ///
    /// # Errors
    /// `AlreadyExists` if a handler is already running.
    pub fn spawn<H: DatagramHandler>(&mut self, mut handler: H, tick: Duration) -> io::Result<()> {
        if self.processor.is_some() {
            return Err(io::Error::new(
                io::ErrorKind::AlreadyExists,
                "endpoint already has a handler",
            ));
        }

        let (in_tx, mut in_rx) = mpsc::channel::<(Vec<u8>, SocketAddr)>(INBOUND_QUEUE);
        self.reader = Some(tokio::spawn(read_loop(Arc::clone(&self.socket), in_tx)));

        let (stop_tx, mut stop_rx) = oneshot::channel::<()>();
        let processor = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(tick);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = &mut stop_rx => break,
                    msg = in_rx.recv() => match msg {
                        Some((buf, from)) => handler.on_datagram(&buf, from, Instant::now()),
                        None => break,
                    },
                    _ = ticker.tick() => handler.on_tick(Instant::now()),
                }
            }
            handler.on_close();
        });
        self.processor = Some((stop_tx, processor));
        Ok(())
    }

    /// Stop all tasks, let the handler discard its sessions, release the socket.
    pub async fn close(mut self) {
        if let Some(reader) = self.reader.take() {
            reader.abort();
            let _ = reader.await;
        }
        if let Some((stop, processor)) = self.processor.take() {
            let _ = stop.send(());
            if let Err(e) = processor.await {
                warn!("processing loop ended abnormally: {e}");
            }
        }

        // Senders held elsewhere keep the writer alive; give it a moment to
        // flush what the handler queued on close, then stop it.
        drop(self.out_tx);
        if tokio::time::timeout(FLUSH_GRACE, &mut self.writer).await.is_err() {
            self.writer.abort();
        }
        info!(local = %self.local, "udp endpoint closed");
    }
}

async fn read_loop(socket: Arc<UdpSocket>, inbound: mpsc::Sender<(Vec<u8>, SocketAddr)>) {
    let mut buf = vec![0u8; MAX_FRAME_SIZE];
    loop {
        match socket.recv_from(&mut buf).await {
            Ok((n, from)) => {
                debug!(%from, len = n, "recv");
                if inbound.send((buf[..n].to_vec(), from)).await.is_err() {
                    break;
                }
            }
            // ICMP errors from an earlier send surface here on some platforms.
            Err(e) => warn!("udp recv error: {e}"),
        }
    }
}

async fn write_loop(socket: Arc<UdpSocket>, mut outbound: mpsc::UnboundedReceiver<Outbound>) {
    while let Some((bytes, to)) = outbound.recv().await {
        if bytes.len() > MAX_FRAME_SIZE {
            warn!(%to, len = bytes.len(), "datagram too large, dropped");
            continue;
        }
        if let Err(e) = socket.send_to(&bytes, to).await {
            warn!(%to, "udp send error: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Echo;

    impl DatagramHandler for Echo {
        fn on_datagram(&mut self, _buf: &[u8], _from: SocketAddr, _now: Instant) {}
    }

    #[tokio::test]
    async fn spawn_twice_is_rejected() {
        let mut ep = UdpEndpoint::bind("127.0.0.1:0".parse().unwrap()).await.unwrap();
        assert_ne!(ep.local_addr().port(), 0);
        ep.spawn(Echo, Duration::from_millis(50)).unwrap();
        assert!(ep.is_running());
        assert_eq!(
            ep.spawn(Echo, Duration::from_millis(50)).unwrap_err().kind(),
            io::ErrorKind::AlreadyExists
        );
        ep.close().await;
    }

    #[tokio::test]
    async fn close_releases_the_port() {
        let ep = UdpEndpoint::bind("127.0.0.1:0".parse().unwrap()).await.unwrap();
        let addr = ep.local_addr();
        ep.close().await;
        let again = UdpEndpoint::bind(addr).await.unwrap();
        again.close().await;
    }
}
