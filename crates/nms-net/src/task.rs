//! NetTask session layer: request/response dispatch and correlation.
//!
//! The server answers `REQUEST_*` frames through registered handlers; the
//! agent issues requests and matches `RESPONSE_*` frames back to them by
//! `acknowledgement_number == request.sequence_number`.
//!
//! There is no retransmission here. Sequence numbers give duplicate
//! detection on the server and correlation on the agent, nothing more.
//! Server-side bookkeeping lives in a [`RequestLedger`] owned by the peer's
//! session, so it starts fresh with every handshake and goes away with it.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::time::{Duration, Instant};

use nms_core::wire::{NetTaskFrame, TaskType, MAX_PAYLOAD_LEN};
use thiserror::Error;
use tracing::{debug, warn};

/// How many recent request sequence numbers the server remembers per peer.
const SEEN_WINDOW: usize = 64;

/// Outstanding requests an agent keeps before dropping the oldest.
const MAX_PENDING: usize = 1024;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TaskError {
    #[error("{0} is not a request type")]
    NotARequest(TaskType),

    #[error("operation requires the {0:?} role")]
    WrongRole(Role),

    #[error("payload of {0} bytes does not fit in one frame")]
    PayloadTooLarge(usize),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Answers REQUEST_* frames.
    Server,
    /// Sends requests, consumes RESPONSE_* frames.
    Agent,
}

/// Business logic behind one task type.
///
/// On the server the returned payload becomes the matching `RESPONSE_*`;
/// returning `None` sends nothing. On the agent the return value is ignored.
pub trait TaskHandler: Send {
    fn handle(&mut self, frame: &NetTaskFrame) -> Option<Vec<u8>>;
}

impl<F> TaskHandler for F
where
    F: FnMut(&NetTaskFrame) -> Option<Vec<u8>> + Send,
{
    fn handle(&mut self, frame: &NetTaskFrame) -> Option<Vec<u8>> {
        self(frame)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PendingRequest {
    pub task_type: TaskType,
    pub sent_at: Instant,
}

/// What the server remembers about the agent behind one peer session.
///
/// The first request binds the agent id; later requests claiming another id
/// are dropped.
#[derive(Debug, Default)]
pub struct RequestLedger {
    agent_id: Option<u32>,
    next_seq: u32,
    seen: VecDeque<u32>,
}

impl RequestLedger {
    pub fn agent_id(&self) -> Option<u32> {
        self.agent_id
    }

    fn claim(&mut self, agent_id: u32) -> bool {
        *self.agent_id.get_or_insert(agent_id) == agent_id
    }

    /// Record `seq`; false if it was already seen.
    fn observe(&mut self, seq: u32) -> bool {
        if self.seen.contains(&seq) {
            return false;
        }
        if self.seen.len() >= SEEN_WINDOW {
            self.seen.pop_front();
        }
        self.seen.push_back(seq);
        true
    }

    fn next_seq(&mut self) -> u32 {
        self.next_seq = self.next_seq.wrapping_add(1).max(1);
        self.next_seq
    }
}

pub struct TaskSession {
    role: Role,
    handlers: HashMap<TaskType, Box<dyn TaskHandler>>,
    agent_id: u32,
    next_seq: u32,
    pending: BTreeMap<u32, PendingRequest>,
}

impl TaskSession {
    fn with_role(role: Role, agent_id: u32) -> Self {
        Self {
            role,
            handlers: HashMap::new(),
            agent_id,
            next_seq: 0,
            pending: BTreeMap::new(),
        }
    }

    pub fn server() -> Self {
        Self::with_role(Role::Server, 0)
    }

    pub fn agent(agent_id: u32) -> Self {
        Self::with_role(Role::Agent, agent_id)
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn agent_id(&self) -> u32 {
        self.agent_id
    }

    /// Install the handler for `task_type`, replacing any previous one.
    pub fn register<H>(&mut self, task_type: TaskType, handler: H)
    where
        H: TaskHandler + 'static,
    {
        self.handlers.insert(task_type, Box::new(handler));
    }

    /// Build the next request frame and remember it as pending.
    ///
    /// # Errors
    /// `WrongRole` on the server, `NotARequest` for a response type,
    /// `PayloadTooLarge` past the frame limit.
    pub fn request(
        &mut self,
        task_type: TaskType,
        payload: Vec<u8>,
        now: Instant,
    ) -> Result<NetTaskFrame, TaskError> {
        if self.role != Role::Agent {
            return Err(TaskError::WrongRole(Role::Agent));
        }
        if !task_type.is_request() {
            return Err(TaskError::NotARequest(task_type));
        }
        if payload.len() > MAX_PAYLOAD_LEN {
            return Err(TaskError::PayloadTooLarge(payload.len()));
        }

        self.next_seq = self.next_seq.wrapping_add(1).max(1);
        let seq = self.next_seq;

        if self.pending.len() >= MAX_PENDING {
            if let Some((&oldest, _)) = self.pending.iter().next() {
                debug!(seq = oldest, "pending table full, forgetting oldest request");
                self.pending.remove(&oldest);
            }
        }
        self.pending.insert(
            seq,
            PendingRequest {
                task_type,
                sent_at: now,
            },
        );

        Ok(NetTaskFrame::new(self.agent_id, seq, task_type, payload))
    }

    /// Outstanding requests, oldest sequence number first.
    pub fn pending(&self) -> impl Iterator<Item = (u32, &PendingRequest)> {
        self.pending.iter().map(|(seq, p)| (*seq, p))
    }

    /// Forget requests older than `timeout`, returning their sequence numbers.
    pub fn expire_pending(&mut self, now: Instant, timeout: Duration) -> Vec<u32> {
        let stale: Vec<u32> = self
            .pending
            .iter()
            .filter(|(_, p)| now.saturating_duration_since(p.sent_at) > timeout)
            .map(|(seq, _)| *seq)
            .collect();
        for seq in &stale {
            self.pending.remove(seq);
        }
        stale
    }

    /// Server: answer one request from the peer owning `ledger`. Returns the
    /// response to send, if any.
    pub fn answer(
        &mut self,
        ledger: &mut RequestLedger,
        frame: &NetTaskFrame,
    ) -> Option<NetTaskFrame> {
        if self.role != Role::Server || !frame.task_type.is_request() {
            debug!(kind = %frame.task_type, role = ?self.role, "not a request for this role");
            return None;
        }
        if !ledger.claim(frame.agent_id) {
            debug!(
                agent = frame.agent_id,
                bound = ?ledger.agent_id(),
                "request claims another agent id, dropped"
            );
            return None;
        }
        if !ledger.observe(frame.sequence_number) {
            debug!(
                agent = frame.agent_id,
                seq = frame.sequence_number,
                "duplicate request dropped"
            );
            return None;
        }

        let Some(handler) = self.handlers.get_mut(&frame.task_type) else {
            debug!(kind = %frame.task_type, "no handler registered");
            return None;
        };
        let payload = handler.handle(frame)?;
        if payload.len() > MAX_PAYLOAD_LEN {
            warn!(kind = %frame.task_type, len = payload.len(), "response payload too large, dropped");
            return None;
        }
        let response_type = frame.task_type.response()?;

        Some(NetTaskFrame {
            agent_id: frame.agent_id,
            sequence_number: ledger.next_seq(),
            acknowledgement_number: frame.sequence_number,
            task_type: response_type,
            payload,
        })
    }

    /// Agent: match one response to its pending request and run the handler.
    /// Returns whether the response was accepted.
    pub fn dispatch(&mut self, frame: &NetTaskFrame) -> bool {
        if self.role != Role::Agent || !frame.task_type.is_response() {
            debug!(kind = %frame.task_type, role = ?self.role, "not a response for this role");
            return false;
        }
        if frame.agent_id != self.agent_id {
            debug!(agent = frame.agent_id, "response addressed to another agent");
            return false;
        }
        let ack = frame.acknowledgement_number;
        let Some(pending) = self.pending.get(&ack) else {
            debug!(ack, "unmatched or duplicate response dropped");
            return false;
        };
        if pending.task_type.response() != Some(frame.task_type) {
            debug!(ack, kind = %frame.task_type, "response type does not match request");
            return false;
        }
        self.pending.remove(&ack);

        if let Some(handler) = self.handlers.get_mut(&frame.task_type) {
            let _ = handler.handle(frame);
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use nms_core::wire::{demux, Frame, FrameSigner};
    use parking_lot::Mutex;

    #[test]
    fn register_request_is_acknowledged() {
        let signer = FrameSigner::default();
        let mut server = TaskSession::server();
        server.register(TaskType::RequestRegister, |f: &NetTaskFrame| {
            Some(format!("welcome {}", f.agent_id).into_bytes())
        });

        let req = NetTaskFrame::new(7, 1, TaskType::RequestRegister, vec![]);
        let wire = req.encode(&signer);
        let (frames, _) = demux(&wire, &signer);
        let Some(Frame::NetTask(decoded)) = frames.into_iter().next() else {
            panic!("no task frame");
        };

        let mut ledger = RequestLedger::default();
        let resp = server.answer(&mut ledger, &decoded).expect("response");
        assert_eq!(resp.task_type, TaskType::ResponseRegister);
        assert_eq!(resp.agent_id, 7);
        assert_eq!(resp.acknowledgement_number, 1);
        assert_eq!(resp.payload, b"welcome 7");
        assert_eq!(ledger.agent_id(), Some(7));
    }

    #[test]
    fn duplicate_requests_are_dropped() {
        let mut server = TaskSession::server();
        server.register(TaskType::RequestMetrics, |_: &NetTaskFrame| Some(vec![1]));
        let mut ledger = RequestLedger::default();
        let req = NetTaskFrame::new(2, 5, TaskType::RequestMetrics, vec![]);

        let first = server.answer(&mut ledger, &req).unwrap();
        assert!(server.answer(&mut ledger, &req).is_none());

        let next = NetTaskFrame::new(2, 6, TaskType::RequestMetrics, vec![]);
        let second = server.answer(&mut ledger, &next).unwrap();
        assert_eq!(second.sequence_number, first.sequence_number + 1);
    }

    #[test]
    fn ledgers_are_independent() {
        let mut server = TaskSession::server();
        server.register(TaskType::RequestRegister, |_: &NetTaskFrame| Some(vec![]));
        let req = NetTaskFrame::new(1, 1, TaskType::RequestRegister, vec![]);

        let mut first_peer = RequestLedger::default();
        let mut second_peer = RequestLedger::default();
        let a = server.answer(&mut first_peer, &req).unwrap();
        let b = server.answer(&mut second_peer, &req).unwrap();
        assert_eq!(a.sequence_number, 1);
        assert_eq!(b.sequence_number, 1);
        assert_eq!(b.acknowledgement_number, 1);
    }

    #[test]
    fn ledger_is_bound_to_first_agent_id() {
        let mut server = TaskSession::server();
        server.register(TaskType::RequestMetrics, |_: &NetTaskFrame| Some(vec![]));
        let mut ledger = RequestLedger::default();

        assert!(server
            .answer(&mut ledger, &NetTaskFrame::new(3, 1, TaskType::RequestMetrics, vec![]))
            .is_some());
        assert!(server
            .answer(&mut ledger, &NetTaskFrame::new(4, 2, TaskType::RequestMetrics, vec![]))
            .is_none());
        // The rejected claim did not burn sequence number 2.
        assert!(server
            .answer(&mut ledger, &NetTaskFrame::new(3, 2, TaskType::RequestMetrics, vec![]))
            .is_some());
    }

    #[test]
    fn server_ignores_responses_and_unhandled_types() {
        let mut server = TaskSession::server();
        let mut ledger = RequestLedger::default();
        let resp = NetTaskFrame::new(1, 1, TaskType::ResponseTask, vec![]);
        assert!(server.answer(&mut ledger, &resp).is_none());
        let req = NetTaskFrame::new(1, 2, TaskType::RequestTask, vec![]);
        assert!(server.answer(&mut ledger, &req).is_none());
        assert!(!server.dispatch(&resp));
    }

    #[test]
    fn oversized_response_is_not_sent() {
        let mut server = TaskSession::server();
        server.register(TaskType::RequestTask, |_: &NetTaskFrame| {
            Some(vec![0; MAX_PAYLOAD_LEN + 1])
        });
        let req = NetTaskFrame::new(1, 1, TaskType::RequestTask, vec![]);
        assert!(server
            .answer(&mut RequestLedger::default(), &req)
            .is_none());
    }

    #[test]
    fn agent_correlates_responses() {
        let now = Instant::now();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let mut agent = TaskSession::agent(7);
        {
            let seen = Arc::clone(&seen);
            agent.register(TaskType::ResponseRegister, move |f: &NetTaskFrame| {
                seen.lock().push(f.payload.clone());
                None
            });
        }

        let req = agent
            .request(TaskType::RequestRegister, vec![], now)
            .unwrap();
        assert_eq!(req.sequence_number, 1);
        assert_eq!(agent.pending().count(), 1);

        let mut server = TaskSession::server();
        server.register(TaskType::RequestRegister, |_: &NetTaskFrame| Some(b"ok".to_vec()));
        let resp = server.answer(&mut RequestLedger::default(), &req).unwrap();

        assert!(agent.dispatch(&resp));
        assert_eq!(seen.lock().as_slice(), &[b"ok".to_vec()]);
        assert_eq!(agent.pending().count(), 0);

        // A replayed response finds nothing pending.
        assert!(!agent.dispatch(&resp));
        assert_eq!(seen.lock().len(), 1);
    }

    #[test]
    fn agent_rejects_mismatched_responses() {
        let now = Instant::now();
        let mut agent = TaskSession::agent(1);
        let req = agent.request(TaskType::RequestTask, vec![], now).unwrap();

        let mut wrong_kind = NetTaskFrame::new(1, 1, TaskType::ResponseMetrics, vec![]);
        wrong_kind.acknowledgement_number = req.sequence_number;
        assert!(!agent.dispatch(&wrong_kind));

        let mut other_agent = NetTaskFrame::new(2, 1, TaskType::ResponseTask, vec![]);
        other_agent.acknowledgement_number = req.sequence_number;
        assert!(!agent.dispatch(&other_agent));
        assert_eq!(agent.pending().count(), 1);
    }

    #[test]
    fn request_validation_and_expiry() {
        let now = Instant::now();
        let mut agent = TaskSession::agent(1);
        assert_eq!(
            agent.request(TaskType::ResponseTask, vec![], now),
            Err(TaskError::NotARequest(TaskType::ResponseTask))
        );
        assert_eq!(
            TaskSession::server().request(TaskType::RequestTask, vec![], now),
            Err(TaskError::WrongRole(Role::Agent))
        );
        assert_eq!(
            agent.request(TaskType::RequestTask, vec![0; MAX_PAYLOAD_LEN + 1], now),
            Err(TaskError::PayloadTooLarge(MAX_PAYLOAD_LEN + 1))
        );

        agent.request(TaskType::RequestMetrics, vec![], now).unwrap();
        let later = now + Duration::from_secs(5);
        agent.request(TaskType::RequestMetrics, vec![], later).unwrap();
        assert_eq!(
            agent.expire_pending(later, Duration::from_secs(1)),
            vec![1]
        );
        assert_eq!(agent.pending().map(|(s, _)| s).collect::<Vec<_>>(), vec![2]);
    }
}
