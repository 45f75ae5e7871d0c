use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use nms_core::wire::{NetTaskFrame, TaskType};
use nms_net::tcp::send_greeting;
use nms_net::{
    Agent, ChannelTransport, DatagramHandler, HandshakeEvent, NetConfig, UdpEndpoint, AUTH_ACK,
};
use tokio::{signal, sync::mpsc};
use tracing::{debug, info, warn};

/// Requests unanswered for this long are forgotten.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Drives an [`Agent`]: registers once the server acknowledges the
/// handshake, then reports metrics on a fixed interval.
struct AgentDriver {
    agent: Agent<ChannelTransport>,
    started: Instant,
    report_every: Duration,
    last_report: Option<Instant>,
}

impl AgentDriver {
    fn send(&mut self, task_type: TaskType, payload: Vec<u8>, now: Instant) {
        match self.agent.request(task_type, payload, now) {
            Ok(seq) => debug!(%task_type, seq, "request sent"),
            Err(e) => warn!(%task_type, "request not sent: {e}"),
        }
    }
}

impl DatagramHandler for AgentDriver {
    fn on_datagram(&mut self, buf: &[u8], from: SocketAddr, now: Instant) {
        let events = self.agent.handle_datagram(buf, from);
        let acked = events
            .iter()
            .any(|e| matches!(e, HandshakeEvent::Message(m) if m == AUTH_ACK.as_bytes()));
        if acked {
            let id = self.agent.tasks_mut().agent_id();
            self.send(TaskType::RequestRegister, format!("agent {id}").into_bytes(), now);
            self.last_report = Some(now);
        }
    }

    fn on_tick(&mut self, now: Instant) {
        let stale = self.agent.tasks_mut().expire_pending(now, REQUEST_TIMEOUT);
        if !stale.is_empty() {
            warn!(?stale, "requests went unanswered");
        }

        let due = self
            .last_report
            .is_some_and(|t| now.saturating_duration_since(t) >= self.report_every);
        if due && self.agent.is_authenticated() {
            let uptime = now.saturating_duration_since(self.started).as_secs();
            self.send(TaskType::RequestMetrics, format!("uptime_secs={uptime}").into_bytes(), now);
            self.last_report = Some(now);
        }
    }

    fn on_close(&mut self) {
        self.agent.close();
    }
}

pub async fn run(cfg: NetConfig, report_every: Duration) -> Result<()> {
    let tcp = cfg.tcp_target()?;
    let udp = cfg.udp_target()?;

    send_greeting(&tcp)
        .await
        .with_context(|| format!("tcp greeting to {tcp}"))?;

    let local: SocketAddr = if udp.address().is_ipv6() {
        (Ipv6Addr::UNSPECIFIED, 0).into()
    } else {
        (Ipv4Addr::UNSPECIFIED, 0).into()
    };
    let mut endpoint = UdpEndpoint::bind(local).await.context("binding udp")?;

    let (events_tx, mut events_rx) = mpsc::unbounded_channel();
    let mut agent = Agent::new(
        endpoint.transport(),
        cfg.signer()?,
        udp,
        cfg.curve()?,
        cfg.agent_id,
    )
    .with_events(events_tx);
    agent.tasks_mut().register(TaskType::ResponseRegister, |f: &NetTaskFrame| {
        info!("registered: {}", String::from_utf8_lossy(&f.payload));
        None
    });
    agent.tasks_mut().register(TaskType::ResponseMetrics, |f: &NetTaskFrame| {
        debug!(ack = f.acknowledgement_number, "metrics acknowledged");
        None
    });
    agent.connect();

    endpoint.spawn(
        AgentDriver {
            agent,
            started: Instant::now(),
            report_every,
            last_report: None,
        },
        cfg.tick(),
    )?;

    loop {
        tokio::select! {
            Some((_, event)) = events_rx.recv() => match event {
                HandshakeEvent::Authenticated => info!(server = %udp, "handshake complete"),
                HandshakeEvent::Message(_) => {}
                HandshakeEvent::Closed(reason) => {
                    warn!(?reason, "session closed by protocol");
                    break;
                }
            },
            _ = signal::ctrl_c() => {
                info!("Ctrl+C received, shutting down");
                break;
            }
        }
    }

    endpoint.close().await;
    Ok(())
}
