//! Netflow handshake state machines.
//!
//! ```text
//! Agent (client)                              Server
//!   | HELLO_THERE(pk)                           |
//!   |------------------------------------------>| link, issue challenge
//!   |        GENERAL_KENOBI(pk, salt, challenge)|
//!   |<------------------------------------------|
//!   | link, verify, regenerate keys             |
//!   | THE_NEGOTIATOR(counter)                   |
//!   |------------------------------------------>| confirm, regenerate keys
//!   |              MESSAGE("Authenticated!")    |
//!   |<------------------------------------------|
//! ```
//!
//! The client trusts its key as soon as THE_NEGOTIATOR is out. A failed
//! confirmation on the server answers KYS and forgets the peer.
//!
//! Both machines are pure: they take a decoded frame and return a [`Step`]
//! telling the caller what to send back and what happened. Sockets live
//! elsewhere.

use std::net::SocketAddr;
use std::time::{Duration, Instant};

use nms_core::crypto::{ChallengeControl, Curve, KeyExchange};
use nms_core::error::{ProtocolError, Result};
use nms_core::wire::{NetflowFrame, MAX_MESSAGE_LEN};
use tracing::{debug, info, warn};

use crate::session_table::SessionTable;
use crate::target::ConnectionTarget;
use crate::task::RequestLedger;

/// Plaintext the server seals into its first MESSAGE.
pub const AUTH_ACK: &str = "Authenticated!";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeState {
    Idle,
    AwaitGeneralKenobi,
    AwaitNegotiatorAck,
    Authenticated,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    PeerKys,
    AuthenticationFailure,
    DecryptionFailure,
    Local,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandshakeEvent {
    Authenticated,
    Message(Vec<u8>),
    Closed(CloseReason),
}

/// Outcome of feeding one frame to a state machine.
#[derive(Debug, Default)]
pub struct Step {
    pub reply: Option<NetflowFrame>,
    pub event: Option<HandshakeEvent>,
}

impl Step {
    fn ignore() -> Self {
        Self::default()
    }

    fn reply(frame: NetflowFrame) -> Self {
        Self {
            reply: Some(frame),
            event: None,
        }
    }

    fn event(event: HandshakeEvent) -> Self {
        Self {
            reply: None,
            event: Some(event),
        }
    }

    fn with_event(mut self, event: HandshakeEvent) -> Self {
        self.event = Some(event);
        self
    }
}

fn message_frame(ciphertext: Vec<u8>) -> Result<NetflowFrame> {
    if ciphertext.len() > MAX_MESSAGE_LEN {
        return Err(ProtocolError::MalformedFrame("message too large for one frame"));
    }
    Ok(NetflowFrame::Message { ciphertext })
}

fn unexpected(from: &SocketAddr, frame: &NetflowFrame) -> Step {
    debug!(%from, kind = %frame.kind(), code = %ProtocolError::UnexpectedState.code(), "no matching handshake state");
    Step::ignore()
}

//
// ──────────────────────────────────────────────
//   Client
// ──────────────────────────────────────────────
//

/// Agent side: one handshake with one server target.
pub struct ClientHandshake {
    target: ConnectionTarget,
    curve: Curve,
    kex: Option<KeyExchange>,
    state: HandshakeState,
}

impl ClientHandshake {
    pub fn new(target: ConnectionTarget, curve: Curve) -> Self {
        Self {
            target,
            curve,
            kex: None,
            state: HandshakeState::Idle,
        }
    }

    pub fn target(&self) -> &ConnectionTarget {
        &self.target
    }

    pub fn state(&self) -> HandshakeState {
        self.state
    }

    pub fn is_authenticated(&self) -> bool {
        self.state == HandshakeState::Authenticated
    }

    /// Begin (or restart) the handshake with a fresh ephemeral key.
    pub fn start(&mut self) -> NetflowFrame {
        let kex = KeyExchange::new(self.curve);
        let public_key = kex.public_key();
        self.kex = Some(kex);
        self.state = HandshakeState::AwaitGeneralKenobi;
        info!(target = %self.target, "sending HELLO_THERE");
        NetflowFrame::HelloThere { public_key }
    }

    /// Seal `plaintext` into a MESSAGE for the server.
    ///
    /// # Errors
    /// `NoSessionKey` unless authenticated, `MalformedFrame` if the sealed
    /// message would not fit in one frame.
    pub fn seal_message(&self, plaintext: &[u8]) -> Result<NetflowFrame> {
        match (&self.kex, self.state) {
            (Some(kex), HandshakeState::Authenticated) => message_frame(kex.encrypt(plaintext)?),
            _ => Err(ProtocolError::NoSessionKey),
        }
    }

    /// Discard key material and close.
    pub fn close(&mut self) {
        self.kex = None;
        self.state = HandshakeState::Closed;
    }

    fn abort(&mut self, reason: CloseReason) -> Step {
        self.close();
        Step::reply(NetflowFrame::Kys).with_event(HandshakeEvent::Closed(reason))
    }

    fn on_general_kenobi(
        &mut self,
        public_key: &[u8; 32],
        salt: [u8; 32],
        challenge: &[u8; 32],
    ) -> Result<NetflowFrame> {
        let kex = self.kex.as_mut().ok_or(ProtocolError::UnexpectedState)?;
        kex.link(public_key, Some(salt))?;
        let verified = kex.verify_challenge(challenge)?;
        // Optimistic: the key is trusted as soon as the counter-challenge goes out.
        kex.regenerate_keys(&verified.control)?;
        Ok(NetflowFrame::TheNegotiator {
            challenge: verified.challenge,
        })
    }

    pub fn on_frame(&mut self, from: &SocketAddr, frame: NetflowFrame) -> Step {
        if !self.target.matches(from) {
            debug!(%from, target = %self.target, "ignored frame: not from target");
            return Step::ignore();
        }

        match (self.state, frame) {
            (
                HandshakeState::AwaitGeneralKenobi,
                NetflowFrame::GeneralKenobi {
                    public_key,
                    salt,
                    challenge,
                },
            ) => match self.on_general_kenobi(&public_key, salt, &challenge) {
                Ok(reply) => {
                    self.state = HandshakeState::Authenticated;
                    info!(target = %self.target, "handshake complete, sending THE_NEGOTIATOR");
                    Step::reply(reply).with_event(HandshakeEvent::Authenticated)
                }
                Err(e) => {
                    warn!(target = %self.target, code = %e.code(), "server failed authentication: {e}");
                    self.abort(CloseReason::AuthenticationFailure)
                }
            },
            (HandshakeState::Authenticated, NetflowFrame::Message { ciphertext }) => {
                let opened = self
                    .kex
                    .as_ref()
                    .ok_or(ProtocolError::NoSessionKey)
                    .and_then(|kex| kex.decrypt(&ciphertext));
                match opened {
                    Ok(plaintext) => Step::event(HandshakeEvent::Message(plaintext)),
                    Err(e) => {
                        warn!(target = %self.target, code = %ProtocolError::DecryptionFailure.code(), "message failed to decrypt: {e}");
                        self.abort(CloseReason::DecryptionFailure)
                    }
                }
            }
            (HandshakeState::AwaitGeneralKenobi | HandshakeState::Authenticated, NetflowFrame::Kys) => {
                info!(target = %self.target, "server sent KYS, closing");
                self.close();
                Step::event(HandshakeEvent::Closed(CloseReason::PeerKys))
            }
            (_, frame) => unexpected(from, &frame),
        }
    }
}

//
// ──────────────────────────────────────────────
//   Server
// ──────────────────────────────────────────────
//

/// Handshake state kept per remote peer.
pub struct PeerSession {
    kex: KeyExchange,
    issued: Option<ChallengeControl>,
    state: HandshakeState,
    ledger: RequestLedger,
}

impl PeerSession {
    pub fn state(&self) -> HandshakeState {
        self.state
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ServerHandshakeCfg {
    pub curve: Curve,
    /// How long an unfinished handshake may sit idle.
    pub handshake_ttl: Duration,
    /// How long an authenticated session may sit idle.
    pub session_idle_ttl: Duration,
    pub max_peers: usize,
}

impl Default for ServerHandshakeCfg {
    fn default() -> Self {
        Self {
            curve: Curve::X25519,
            handshake_ttl: Duration::from_secs(30),
            session_idle_ttl: Duration::from_secs(600),
            max_peers: 1024,
        }
    }
}

/// Server side: one handshake per remote peer, held in a TTL-bounded table.
pub struct ServerHandshake {
    cfg: ServerHandshakeCfg,
    sessions: SessionTable<PeerSession>,
}

impl ServerHandshake {
    pub fn new(cfg: ServerHandshakeCfg) -> Self {
        Self {
            sessions: SessionTable::new(cfg.handshake_ttl, cfg.max_peers),
            cfg,
        }
    }

    pub fn peer_count(&self) -> usize {
        self.sessions.len()
    }

    pub fn state_of(&self, peer: &SocketAddr, now: Instant) -> HandshakeState {
        self.sessions
            .get(peer, now)
            .map_or(HandshakeState::Idle, PeerSession::state)
    }

    pub fn is_authenticated(&self, peer: &SocketAddr, now: Instant) -> bool {
        self.state_of(peer, now) == HandshakeState::Authenticated
    }

    /// Request ledger of an authenticated peer. Counts as activity: the
    /// session's idle timer restarts. `None` for any other state.
    pub fn authorize(&mut self, peer: &SocketAddr, now: Instant) -> Option<&mut RequestLedger> {
        if !self.is_authenticated(peer, now) {
            return None;
        }
        self.sessions.get_mut(peer, now).map(|s| &mut s.ledger)
    }

    /// Drop stalled handshakes and idle sessions.
    pub fn expire(&mut self, now: Instant) -> usize {
        let n = self.sessions.expire(now);
        if n > 0 {
            debug!(expired = n, "expired peer sessions");
        }
        n
    }

    /// Forget a single peer.
    pub fn evict(&mut self, peer: &SocketAddr) -> bool {
        self.sessions.evict(peer).is_some()
    }

    /// Peers currently holding handshake or session state.
    pub fn peers(&self) -> Vec<SocketAddr> {
        self.sessions.peers().copied().collect()
    }

    /// Forget every peer.
    pub fn close(&mut self) {
        self.sessions.clear();
    }

    /// Seal `plaintext` for an authenticated peer.
    ///
    /// # Errors
    /// `NoSessionKey` unless that peer is authenticated, `MalformedFrame` if
    /// the sealed message would not fit in one frame.
    pub fn seal_message(
        &mut self,
        peer: &SocketAddr,
        plaintext: &[u8],
        now: Instant,
    ) -> Result<NetflowFrame> {
        match self.sessions.get_mut(peer, now) {
            Some(s) if s.state == HandshakeState::Authenticated => {
                message_frame(s.kex.encrypt(plaintext)?)
            }
            _ => Err(ProtocolError::NoSessionKey),
        }
    }

    fn on_hello_there(&mut self, from: &SocketAddr, public_key: &[u8; 32], now: Instant) -> Step {
        let mut kex = KeyExchange::new(self.cfg.curve);
        let issued = kex
            .link(public_key, None)
            .and_then(|salt| kex.issue_challenge().map(|issued| (salt, issued)));

        match issued {
            Ok((salt, issued)) => {
                let reply = NetflowFrame::GeneralKenobi {
                    public_key: kex.public_key(),
                    salt,
                    challenge: issued.challenge,
                };
                let session = PeerSession {
                    kex,
                    issued: Some(issued),
                    state: HandshakeState::AwaitNegotiatorAck,
                    ledger: RequestLedger::default(),
                };
                if self.sessions.insert(*from, session, now).is_some() {
                    debug!(%from, "replaced previous handshake");
                }
                info!(%from, "HELLO_THERE accepted, sending GENERAL_KENOBI");
                Step::reply(reply)
            }
            Err(e) => {
                warn!(%from, code = %e.code(), "rejecting HELLO_THERE: {e}");
                self.sessions.evict(from);
                Step::reply(NetflowFrame::Kys)
            }
        }
    }

    fn on_negotiator(&mut self, from: &SocketAddr, challenge: &[u8; 32], now: Instant) -> Step {
        let Some(session) = self.sessions.get_mut(from, now) else {
            return unexpected(from, &NetflowFrame::TheNegotiator { challenge: *challenge });
        };
        if session.state != HandshakeState::AwaitNegotiatorAck {
            return unexpected(from, &NetflowFrame::TheNegotiator { challenge: *challenge });
        }

        let confirmed = match session.issued.take() {
            Some(issued) if session.kex.confirm_challenge(challenge, &issued) => session
                .kex
                .regenerate_keys(&issued.control)
                .and_then(|()| session.kex.encrypt(AUTH_ACK.as_bytes())),
            _ => Err(ProtocolError::AuthenticationFailure),
        };

        match confirmed {
            Ok(ciphertext) => {
                session.state = HandshakeState::Authenticated;
                self.sessions.set_ttl(from, self.cfg.session_idle_ttl);
                info!(%from, "peer authenticated");
                Step::reply(NetflowFrame::Message { ciphertext })
                    .with_event(HandshakeEvent::Authenticated)
            }
            Err(e) => {
                warn!(%from, code = %e.code(), "challenge confirmation failed: {e}");
                self.sessions.evict(from);
                Step::reply(NetflowFrame::Kys)
                    .with_event(HandshakeEvent::Closed(CloseReason::AuthenticationFailure))
            }
        }
    }

    fn on_message(&mut self, from: &SocketAddr, ciphertext: &[u8], now: Instant) -> Step {
        let opened = match self.sessions.get_mut(from, now) {
            Some(s) if s.state == HandshakeState::Authenticated => s.kex.decrypt(ciphertext),
            _ => {
                return unexpected(
                    from,
                    &NetflowFrame::Message {
                        ciphertext: Vec::new(),
                    },
                )
            }
        };
        match opened {
            Ok(plaintext) => Step::event(HandshakeEvent::Message(plaintext)),
            Err(e) => {
                warn!(%from, code = %ProtocolError::DecryptionFailure.code(), "message failed to decrypt: {e}");
                self.sessions.evict(from);
                Step::reply(NetflowFrame::Kys)
                    .with_event(HandshakeEvent::Closed(CloseReason::DecryptionFailure))
            }
        }
    }

    pub fn on_frame(&mut self, from: &SocketAddr, frame: NetflowFrame, now: Instant) -> Step {
        match frame {
            NetflowFrame::HelloThere { public_key } => self.on_hello_there(from, &public_key, now),
            NetflowFrame::TheNegotiator { challenge } => self.on_negotiator(from, &challenge, now),
            NetflowFrame::Message { ciphertext } => self.on_message(from, &ciphertext, now),
            NetflowFrame::Kys => {
                if self.sessions.evict(from).is_some() {
                    info!(%from, "peer sent KYS, session discarded");
                    Step::event(HandshakeEvent::Closed(CloseReason::PeerKys))
                } else {
                    unexpected(from, &NetflowFrame::Kys)
                }
            }
            frame @ NetflowFrame::GeneralKenobi { .. } => unexpected(from, &frame),
        }
    }
}
