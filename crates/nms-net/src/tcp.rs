//! TCP side channel: the agent announces itself with a fixed greeting on the
//! base port before the UDP handshake starts.

use std::io;
use std::net::SocketAddr;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info, warn};

use crate::target::ConnectionTarget;

pub const TCP_GREETING: &str = "Hello from TCP Client.";

/// Bytes read from a single connection before it is cut off.
const MAX_GREETING: usize = 4096;

pub struct GreetingServer {
    listener: TcpListener,
}

impl GreetingServer {
    pub async fn bind(addr: SocketAddr) -> io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        info!(local = %listener.local_addr()?, "tcp greeting server bound");
        Ok(Self { listener })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accept one connection and read it to EOF.
    pub async fn accept_one(&self) -> io::Result<(SocketAddr, Vec<u8>)> {
        let (stream, peer) = self.listener.accept().await?;
        let bytes = read_greeting(stream).await?;
        Ok((peer, bytes))
    }

    /// Accept forever, logging whatever each client sends.
    pub async fn run(self) -> io::Result<()> {
        loop {
            let (stream, peer) = self.listener.accept().await?;
            debug!(%peer, "tcp connection");
            tokio::spawn(async move {
                match read_greeting(stream).await {
                    Ok(bytes) => info!(%peer, "tcp: {}", String::from_utf8_lossy(&bytes)),
                    Err(e) => warn!(%peer, "tcp read failed: {e}"),
                }
            });
        }
    }
}

async fn read_greeting(stream: TcpStream) -> io::Result<Vec<u8>> {
    let mut bytes = Vec::new();
    stream
        .take(MAX_GREETING as u64)
        .read_to_end(&mut bytes)
        .await?;
    Ok(bytes)
}

/// Connect to `target`, send the greeting and close the write half.
pub async fn send_greeting(target: &ConnectionTarget) -> io::Result<()> {
    let mut stream = TcpStream::connect(target.socket_addr()).await?;
    stream.write_all(TCP_GREETING.as_bytes()).await?;
    stream.shutdown().await?;
    info!(%target, "tcp greeting sent");
    Ok(())
}
