use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use nms_core::crypto::{Curve, KeyExchange};
use nms_core::wire::{demux, Frame, FrameSigner, NetTaskFrame, NetflowFrame, TaskType};
use nms_net::handshake::ServerHandshakeCfg;
use nms_net::{
    Agent, CloseReason, ConnectionTarget, HandshakeEvent, HandshakeState, MemoryTransport, Server,
    AUTH_ACK,
};
use parking_lot::Mutex;

fn server_addr() -> SocketAddr {
    "127.0.0.1:2023".parse().unwrap()
}

fn agent_addr() -> SocketAddr {
    "127.0.0.1:2022".parse().unwrap()
}

fn secs(n: u64) -> Duration {
    Duration::from_secs(n)
}

struct Peer {
    addr: SocketAddr,
    agent: Agent<MemoryTransport>,
    out: MemoryTransport,
    events: Vec<HandshakeEvent>,
}

/// One server and any number of agents wired through in-memory transports.
struct Rig {
    signer: FrameSigner,
    server: Server<MemoryTransport>,
    server_out: MemoryTransport,
    server_events: Vec<HandshakeEvent>,
    peers: Vec<Peer>,
}

impl Rig {
    fn empty() -> Self {
        let signer = FrameSigner::default();
        let server_out = MemoryTransport::new();
        Self {
            server: Server::new(server_out.clone(), signer.clone(), ServerHandshakeCfg::default()),
            signer,
            server_out,
            server_events: Vec::new(),
            peers: Vec::new(),
        }
    }

    fn new(agent_id: u32) -> Self {
        let mut rig = Self::empty();
        rig.add_agent(agent_addr(), agent_id);
        rig
    }

    /// Adds an agent bound at `addr` and returns its index.
    fn add_agent(&mut self, addr: SocketAddr, agent_id: u32) -> usize {
        let out = MemoryTransport::new();
        let target = ConnectionTarget::from(server_addr());
        self.peers.push(Peer {
            addr,
            agent: Agent::new(out.clone(), self.signer.clone(), target, Curve::X25519, agent_id),
            out,
            events: Vec::new(),
        });
        self.peers.len() - 1
    }

    fn agent(&mut self, i: usize) -> &mut Agent<MemoryTransport> {
        &mut self.peers[i].agent
    }

    fn pump(&mut self) {
        self.pump_at(Instant::now());
    }

    /// Deliver queued datagrams both ways until nothing moves, with the
    /// server's clock held at `now`.
    fn pump_at(&mut self, now: Instant) {
        loop {
            let mut moved = false;
            for i in 0..self.peers.len() {
                let from = self.peers[i].addr;
                for (bytes, to) in self.peers[i].out.take() {
                    moved = true;
                    assert_eq!(to, server_addr());
                    let ev = self.server.handle_datagram(&bytes, from, now);
                    self.server_events.extend(ev);
                }
            }
            for (bytes, to) in self.server_out.take() {
                moved = true;
                let Some(peer) = self.peers.iter_mut().find(|p| p.addr == to) else {
                    continue;
                };
                let ev = peer.agent.handle_datagram(&bytes, server_addr());
                peer.events.extend(ev);
            }
            if !moved {
                break;
            }
        }
    }
}

/// Server answers REQUEST_REGISTER and counts how often it ran.
fn count_register_calls(rig: &mut Rig) -> Arc<Mutex<usize>> {
    let calls = Arc::new(Mutex::new(0));
    let c = Arc::clone(&calls);
    rig.server
        .tasks_mut()
        .register(TaskType::RequestRegister, move |f: &NetTaskFrame| {
            *c.lock() += 1;
            Some(format!("registered {}", f.agent_id).into_bytes())
        });
    calls
}

fn record_responses(
    agent: &mut Agent<MemoryTransport>,
    kind: TaskType,
) -> Arc<Mutex<Vec<NetTaskFrame>>> {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let s = Arc::clone(&seen);
    agent.tasks_mut().register(kind, move |f: &NetTaskFrame| {
        s.lock().push(f.clone());
        None
    });
    seen
}

#[test]
fn agent_receives_authenticated_ack() {
    let mut rig = Rig::new(1);
    rig.agent(0).connect();
    rig.pump();

    assert!(rig.agent(0).is_authenticated());
    assert!(rig
        .server
        .handshake()
        .is_authenticated(&agent_addr(), Instant::now()));
    assert_eq!(
        rig.peers[0].events,
        vec![
            HandshakeEvent::Authenticated,
            HandshakeEvent::Message(AUTH_ACK.as_bytes().to_vec()),
        ]
    );
    assert_eq!(rig.server_events, vec![HandshakeEvent::Authenticated]);

    rig.agent(0).send_message(b"metrics soon").unwrap();
    rig.pump();
    assert_eq!(
        rig.server_events.last(),
        Some(&HandshakeEvent::Message(b"metrics soon".to_vec()))
    );
}

#[test]
fn wrong_negotiator_challenge_is_killed() {
    let signer = FrameSigner::default();
    let out = MemoryTransport::new();
    let mut server = Server::new(out.clone(), signer.clone(), ServerHandshakeCfg::default());
    let now = Instant::now();

    let kex = KeyExchange::new(Curve::X25519);
    let hello = NetflowFrame::HelloThere {
        public_key: kex.public_key(),
    };
    server.handle_datagram(&hello.encode(&signer), agent_addr(), now);
    let (frames, _) = demux(&out.take()[0].0, &signer);
    assert!(matches!(
        frames.as_slice(),
        [Frame::Netflow(NetflowFrame::GeneralKenobi { .. })]
    ));

    let forged = NetflowFrame::TheNegotiator {
        challenge: [0xEE; 32],
    };
    let events = server.handle_datagram(&forged.encode(&signer), agent_addr(), now);
    assert_eq!(
        events,
        vec![HandshakeEvent::Closed(CloseReason::AuthenticationFailure)]
    );
    let (frames, _) = demux(&out.take()[0].0, &signer);
    assert_eq!(frames, vec![Frame::Netflow(NetflowFrame::Kys)]);
    assert!(!server.handshake().is_authenticated(&agent_addr(), now));
    assert_eq!(server.handshake().peer_count(), 0);
}

#[test]
fn register_request_round_trip_after_handshake() {
    let mut rig = Rig::new(7);
    count_register_calls(&mut rig);
    let answers = record_responses(rig.agent(0), TaskType::ResponseRegister);

    rig.agent(0).connect();
    rig.pump();
    let seq = rig
        .agent(0)
        .request(TaskType::RequestRegister, b"host=a1".to_vec(), Instant::now())
        .unwrap();
    assert_eq!(seq, 1);
    rig.pump();

    let answers = answers.lock();
    assert_eq!(answers.len(), 1);
    assert_eq!(answers[0].agent_id, 7);
    assert_eq!(answers[0].task_type, TaskType::ResponseRegister);
    assert_eq!(answers[0].acknowledgement_number, 1);
    assert_eq!(answers[0].payload, b"registered 7");
}

#[test]
fn steady_reporting_keeps_the_session_alive() {
    let mut rig = Rig::new(3);
    rig.server
        .tasks_mut()
        .register(TaskType::RequestMetrics, |_: &NetTaskFrame| Some(b"ok".to_vec()));
    let answers = record_responses(rig.agent(0), TaskType::ResponseMetrics);

    let t0 = Instant::now();
    rig.agent(0).connect();
    rig.pump_at(t0);

    // Each gap stays under the idle TTL; the total runs well past it.
    for at in [300, 590, 610, 650, 1200] {
        let now = t0 + secs(at);
        rig.agent(0)
            .request(TaskType::RequestMetrics, vec![], now)
            .unwrap();
        rig.pump_at(now);
        rig.server.expire(now);
    }

    let acks: Vec<u32> = answers.lock().iter().map(|f| f.acknowledgement_number).collect();
    assert_eq!(acks, vec![1, 2, 3, 4, 5]);
    assert!(rig.agent(0).is_authenticated());
    assert!(rig
        .server
        .handshake()
        .is_authenticated(&agent_addr(), t0 + secs(1200)));
}

#[test]
fn silence_past_the_idle_ttl_draws_kys() {
    let mut rig = Rig::new(3);
    let calls = count_register_calls(&mut rig);

    let t0 = Instant::now();
    rig.agent(0).connect();
    rig.pump_at(t0);
    rig.peers[0].events.clear();

    let late = t0 + secs(601);
    rig.agent(0)
        .request(TaskType::RequestRegister, vec![], late)
        .unwrap();
    rig.pump_at(late);

    assert_eq!(*calls.lock(), 0);
    assert_eq!(
        rig.peers[0].events,
        vec![HandshakeEvent::Closed(CloseReason::PeerKys)]
    );
    assert_eq!(rig.agent(0).state(), HandshakeState::Closed);
    assert_eq!(
        rig.server.handshake().state_of(&agent_addr(), late),
        HandshakeState::Idle
    );

    // A fresh handshake restores service.
    rig.agent(0).connect();
    rig.pump_at(late);
    assert!(rig.agent(0).is_authenticated());
    rig.agent(0)
        .request(TaskType::RequestRegister, vec![], late)
        .unwrap();
    rig.pump_at(late);
    assert_eq!(*calls.lock(), 1);
}

#[test]
fn agents_sharing_an_id_are_tracked_apart() {
    let mut rig = Rig::empty();
    let calls = count_register_calls(&mut rig);
    let a = rig.add_agent("127.0.0.1:40001".parse().unwrap(), 1);
    let b = rig.add_agent("127.0.0.1:40002".parse().unwrap(), 1);
    let answers_a = record_responses(rig.agent(a), TaskType::ResponseRegister);
    let answers_b = record_responses(rig.agent(b), TaskType::ResponseRegister);

    let now = Instant::now();
    rig.agent(a).connect();
    rig.agent(b).connect();
    rig.pump_at(now);
    assert_eq!(rig.server.handshake().peer_count(), 2);

    for i in [a, b] {
        let seq = rig
            .agent(i)
            .request(TaskType::RequestRegister, vec![], now)
            .unwrap();
        assert_eq!(seq, 1);
    }
    rig.pump_at(now);

    assert_eq!(*calls.lock(), 2);
    assert_eq!(answers_a.lock().len(), 1);
    assert_eq!(answers_b.lock().len(), 1);
    assert_eq!(answers_b.lock()[0].acknowledgement_number, 1);
}

#[test]
fn restarted_agent_starts_its_sequence_over() {
    let mut rig = Rig::empty();
    let calls = count_register_calls(&mut rig);
    let now = Instant::now();

    let first = rig.add_agent("127.0.0.1:40001".parse().unwrap(), 5);
    rig.agent(first).connect();
    rig.pump_at(now);
    rig.agent(first)
        .request(TaskType::RequestRegister, vec![], now)
        .unwrap();
    rig.pump_at(now);
    assert_eq!(*calls.lock(), 1);

    // Same id, new process on a new port, counting from 1 again.
    let second = rig.add_agent("127.0.0.1:40002".parse().unwrap(), 5);
    let answers = record_responses(rig.agent(second), TaskType::ResponseRegister);
    rig.agent(second).connect();
    rig.pump_at(now);
    let seq = rig
        .agent(second)
        .request(TaskType::RequestRegister, vec![], now)
        .unwrap();
    assert_eq!(seq, 1);
    rig.pump_at(now);

    assert_eq!(*calls.lock(), 2);
    assert_eq!(answers.lock().len(), 1);
    assert_eq!(answers.lock()[0].acknowledgement_number, 1);
}

#[test]
fn rehandshake_on_the_same_port_resets_duplicate_tracking() {
    let mut rig = Rig::new(9);
    let calls = count_register_calls(&mut rig);
    let now = Instant::now();

    rig.agent(0).connect();
    rig.pump_at(now);
    rig.agent(0)
        .request(TaskType::RequestRegister, vec![], now)
        .unwrap();
    rig.pump_at(now);

    // Restart in place: a new agent at the same address reuses seq 1.
    rig.peers.clear();
    rig.add_agent(agent_addr(), 9);
    rig.agent(0).connect();
    rig.pump_at(now);
    assert_eq!(
        rig.agent(0)
            .request(TaskType::RequestRegister, vec![], now)
            .unwrap(),
        1
    );
    rig.pump_at(now);

    assert_eq!(*calls.lock(), 2);
}

#[test]
fn agent_kys_clears_server_session() {
    let mut rig = Rig::new(1);
    rig.agent(0).connect();
    rig.pump();
    assert_eq!(rig.server.handshake().peer_count(), 1);

    rig.agent(0).close();
    rig.pump();
    assert_eq!(rig.server.handshake().peer_count(), 0);
    assert_eq!(
        rig.server_events.last(),
        Some(&HandshakeEvent::Closed(CloseReason::PeerKys))
    );
}

#[test]
fn frames_signed_with_another_key_are_ignored() {
    let mut rig = Rig::new(1);
    let stranger = FrameSigner::new([9; 32]);
    let kex = KeyExchange::new(Curve::X25519);
    let hello = NetflowFrame::HelloThere {
        public_key: kex.public_key(),
    };
    let events = rig
        .server
        .handle_datagram(&hello.encode(&stranger), agent_addr(), Instant::now());
    assert!(events.is_empty());
    assert!(rig.server_out.is_empty());
    assert_eq!(rig.server.handshake().peer_count(), 0);
}
