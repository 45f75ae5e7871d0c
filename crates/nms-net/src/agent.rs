// crates/nms-net/src/agent.rs

use std::net::SocketAddr;
use std::time::Instant;

use nms_core::crypto::Curve;
use nms_core::wire::{demux, Frame, FrameSigner, NetflowFrame, TaskType};
use nms_core::ProtocolError;
use thiserror::Error;
use tracing::{debug, info};

use crate::handshake::{ClientHandshake, HandshakeEvent, HandshakeState};
use crate::target::ConnectionTarget;
use crate::task::{TaskError, TaskSession};
use crate::transport::Transport;
use crate::EventSink;

#[derive(Error, Debug)]
pub enum AgentError {
    #[error("not authenticated with {0}")]
    NotAuthenticated(ConnectionTarget),

    #[error(transparent)]
    Task(#[from] TaskError),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

/// Agent endpoint: one handshake with one server plus the task requester.
pub struct Agent<T: Transport> {
    transport: T,
    signer: FrameSigner,
    handshake: ClientHandshake,
    tasks: TaskSession,
    events: Option<EventSink>,
}

impl<T: Transport> Agent<T> {
    pub fn new(
        transport: T,
        signer: FrameSigner,
        target: ConnectionTarget,
        curve: Curve,
        agent_id: u32,
    ) -> Self {
        Self {
            transport,
            signer,
            handshake: ClientHandshake::new(target, curve),
            tasks: TaskSession::agent(agent_id),
            events: None,
        }
    }

    #[must_use]
    pub fn with_events(mut self, sink: EventSink) -> Self {
        self.events = Some(sink);
        self
    }

    pub fn target(&self) -> ConnectionTarget {
        *self.handshake.target()
    }

    pub fn state(&self) -> HandshakeState {
        self.handshake.state()
    }

    pub fn is_authenticated(&self) -> bool {
        self.handshake.is_authenticated()
    }

    /// Register response handlers here.
    pub fn tasks_mut(&mut self) -> &mut TaskSession {
        &mut self.tasks
    }

    fn send_netflow(&self, frame: &NetflowFrame) {
        let to = self.target().socket_addr();
        debug!(%to, kind = %frame.kind(), "send");
        self.transport.send(frame.encode(&self.signer), to);
    }

    /// Send HELLO_THERE to the target, restarting any previous handshake.
    pub fn connect(&mut self) {
        let hello = self.handshake.start();
        self.send_netflow(&hello);
    }

    /// Send a task request, returning its sequence number.
    ///
    /// # Errors
    /// `NotAuthenticated` before the handshake completes, otherwise whatever
    /// [`TaskSession::request`] rejects.
    pub fn request(
        &mut self,
        task_type: TaskType,
        payload: Vec<u8>,
        now: Instant,
    ) -> Result<u32, AgentError> {
        if !self.is_authenticated() {
            return Err(AgentError::NotAuthenticated(self.target()));
        }
        let frame = self.tasks.request(task_type, payload, now)?;
        debug!(kind = %frame.task_type, seq = frame.sequence_number, "send");
        self.transport
            .send(frame.encode(&self.signer), self.target().socket_addr());
        Ok(frame.sequence_number)
    }

    /// Seal and send an application message.
    ///
    /// # Errors
    /// `NoSessionKey` unless authenticated.
    pub fn send_message(&mut self, plaintext: &[u8]) -> Result<(), AgentError> {
        let frame = self.handshake.seal_message(plaintext)?;
        self.send_netflow(&frame);
        Ok(())
    }

    /// Run one inbound buffer through the demultiplexer and both protocol
    /// layers. Buffers from anyone other than the target are ignored.
    pub fn handle_datagram(&mut self, buf: &[u8], from: SocketAddr) -> Vec<HandshakeEvent> {
        let (frames, _) = demux(buf, &self.signer);
        let mut events = Vec::new();
        for frame in frames {
            match frame {
                Frame::Netflow(frame) => {
                    let step = self.handshake.on_frame(&from, frame);
                    if let Some(reply) = step.reply {
                        self.send_netflow(&reply);
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
                    if !self.handshake.target().matches(&from) || !self.is_authenticated() {
                        debug!(%from, kind = %task.task_type, "task frame dropped");
                        continue;
                    }
                    if !self.tasks.dispatch(&task) {
                        debug!(%from, kind = %task.task_type, ack = task.acknowledgement_number, "response not matched");
                    }
                }
            }
        }
        events
    }

    /// Send KYS if a handshake is in flight or complete, then drop all keys.
    pub fn close(&mut self) {
        if matches!(
            self.state(),
            HandshakeState::AwaitGeneralKenobi | HandshakeState::Authenticated
        ) {
            self.send_netflow(&NetflowFrame::Kys);
        }
        self.handshake.close();
        info!(target = %self.target(), "agent closed");
    }
}
