// crates/nms-net/src/server.rs

use std::net::SocketAddr;
use std::time::Instant;

use nms_core::error::Result;
use nms_core::wire::{demux, Frame, FrameSigner, NetflowFrame};
use tracing::{debug, info};

use crate::handshake::{HandshakeEvent, HandshakeState, ServerHandshake, ServerHandshakeCfg};
use crate::task::TaskSession;
use crate::transport::Transport;
use crate::EventSink;

/// Server endpoint: one handshake per agent plus the task responder.
///
/// NetTask requests are answered only for peers that completed the
/// handshake, and each one counts as session activity. A task frame from a
/// peer with no session gets KYS; one from a peer still mid-handshake is
/// dropped.
pub struct Server<T: Transport> {
    transport: T,
    signer: FrameSigner,
    handshake: ServerHandshake,
    tasks: TaskSession,
    events: Option<EventSink>,
}

impl<T: Transport> Server<T> {
    pub fn new(transport: T, signer: FrameSigner, cfg: ServerHandshakeCfg) -> Self {
        Self {
            transport,
            signer,
            handshake: ServerHandshake::new(cfg),
            tasks: TaskSession::server(),
            events: None,
        }
    }

    /// Forward handshake events to `sink` as well as returning them.
    #[must_use]
    pub fn with_events(mut self, sink: EventSink) -> Self {
        self.events = Some(sink);
        self
    }

    pub fn handshake(&self) -> &ServerHandshake {
        &self.handshake
    }

    /// Register task handlers here.
    pub fn tasks_mut(&mut self) -> &mut TaskSession {
        &mut self.tasks
    }

    fn send_netflow(&self, frame: &NetflowFrame, to: SocketAddr) {
        debug!(%to, kind = %frame.kind(), "send");
        self.transport.send(frame.encode(&self.signer), to);
    }

    /// Run one inbound buffer through the demultiplexer and both protocol
    /// layers. Replies go out through the transport; handshake events are
    /// returned in arrival order.
    pub fn handle_datagram(
        &mut self,
        buf: &[u8],
        from: SocketAddr,
        now: Instant,
    ) -> Vec<HandshakeEvent> {
        let (frames, stats) = demux(buf, &self.signer);
        if stats.frames == 0 {
            debug!(%from, len = buf.len(), ?stats, "datagram carried no valid frame");
        }

        let mut events = Vec::new();
        for frame in frames {
            match frame {
                Frame::Netflow(frame) => {
                    let step = self.handshake.on_frame(&from, frame, now);
                    if let Some(reply) = step.reply {
                        self.send_netflow(&reply, from);
                    }
                    if let Some(event) = step.event {
                        if let HandshakeEvent::Message(m) = &event {
                            info!(%from, "message: {}", String::from_utf8_lossy(m));
                        }
                        if let Some(sink) = &self.events {
                            let _ = sink.send((from, event.clone()));
                        }
                        events.push(event);
                    }
                }
                Frame::NetTask(task) => {
                    let state = self.handshake.state_of(&from, now);
                    match self.handshake.authorize(&from, now) {
                        Some(ledger) => {
                            if let Some(reply) = self.tasks.answer(ledger, &task) {
                                debug!(%from, kind = %reply.task_type, ack = reply.acknowledgement_number, "send");
                                self.transport.send(reply.encode(&self.signer), from);
                            }
                        }
                        // No session at all (never had one, or it expired):
                        // tell the agent so it can handshake again.
                        None if state == HandshakeState::Idle => {
                            info!(%from, kind = %task.task_type, "task frame without a session, sending KYS");
                            self.send_netflow(&NetflowFrame::Kys, from);
                        }
                        None => {
                            debug!(%from, kind = %task.task_type, "task frame before handshake completed, dropped");
                        }
                    }
                }
            }
        }
        events
    }

    /// Seal and send an application message to an authenticated peer.
    ///
    /// # Errors
    /// `NoSessionKey` if `peer` is not authenticated.
    pub fn send_message(&mut self, peer: SocketAddr, plaintext: &[u8], now: Instant) -> Result<()> {
        let frame = self.handshake.seal_message(&peer, plaintext, now)?;
        self.send_netflow(&frame, peer);
        Ok(())
    }

    pub fn expire(&mut self, now: Instant) -> usize {
        self.handshake.expire(now)
    }

    /// Tell every known peer to go away and discard all session state.
    pub fn close(&mut self) {
        let peers = self.handshake.peers();
        for peer in &peers {
            self.send_netflow(&NetflowFrame::Kys, *peer);
        }
        self.handshake.close();
        info!(peers = peers.len(), "server closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use crate::transport::MemoryTransport;
    use nms_core::crypto::{Curve, KeyExchange};
    use nms_core::wire::{NetTaskFrame, TaskType};
    use parking_lot::Mutex;

    fn agent_addr() -> SocketAddr {
        "127.0.0.1:40001".parse().unwrap()
    }

    #[test]
    fn task_frame_without_session_gets_kys() {
        let signer = FrameSigner::default();
        let transport = MemoryTransport::new();
        let mut server = Server::new(transport.clone(), signer.clone(), ServerHandshakeCfg::default());
        let calls = Arc::new(Mutex::new(0));
        {
            let calls = Arc::clone(&calls);
            server
                .tasks_mut()
                .register(TaskType::RequestRegister, move |_: &NetTaskFrame| {
                    *calls.lock() += 1;
                    Some(vec![1])
                });
        }

        let req = NetTaskFrame::new(7, 1, TaskType::RequestRegister, vec![]).encode(&signer);
        let events = server.handle_datagram(&req, agent_addr(), Instant::now());
        assert!(events.is_empty());
        assert_eq!(*calls.lock(), 0);

        let sent = transport.take();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].1, agent_addr());
        let (frames, _) = demux(&sent[0].0, &signer);
        assert_eq!(frames, vec![Frame::Netflow(NetflowFrame::Kys)]);
    }

    #[test]
    fn task_frame_mid_handshake_is_dropped_quietly() {
        let signer = FrameSigner::default();
        let transport = MemoryTransport::new();
        let mut server = Server::new(transport.clone(), signer.clone(), ServerHandshakeCfg::default());
        let now = Instant::now();

        let kex = KeyExchange::new(Curve::X25519);
        let hello = NetflowFrame::HelloThere {
            public_key: kex.public_key(),
        };
        server.handle_datagram(&hello.encode(&signer), agent_addr(), now);
        transport.take();

        let req = NetTaskFrame::new(7, 1, TaskType::RequestRegister, vec![]).encode(&signer);
        server.handle_datagram(&req, agent_addr(), now);
        assert!(transport.is_empty());
        assert_eq!(
            server.handshake().state_of(&agent_addr(), now),
            HandshakeState::AwaitNegotiatorAck
        );
    }

    #[test]
    fn noise_produces_nothing() {
        let transport = MemoryTransport::new();
        let mut server = Server::new(
            transport.clone(),
            FrameSigner::default(),
            ServerHandshakeCfg::default(),
        );
        let events = server.handle_datagram(b"CNCNCN garbage", agent_addr(), Instant::now());
        assert!(events.is_empty());
        assert!(transport.is_empty());
        assert_eq!(
            server.handshake().state_of(&agent_addr(), Instant::now()),
            HandshakeState::Idle
        );
    }

    #[test]
    fn send_message_needs_a_session() {
        let mut server = Server::new(
            MemoryTransport::new(),
            FrameSigner::default(),
            ServerHandshakeCfg::default(),
        );
        assert!(server.send_message(agent_addr(), b"hi", Instant::now()).is_err());
    }
}
