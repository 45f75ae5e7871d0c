use std::net::SocketAddr;

use anyhow::{Context, Result};
use nms_core::wire::{NetTaskFrame, TaskType};
use nms_net::tcp::GreetingServer;
use nms_net::{HandshakeEvent, NetConfig, Server, UdpEndpoint};
use tokio::{signal, sync::mpsc};
use tracing::{error, info};

fn register_handlers<T: nms_net::Transport>(server: &mut Server<T>) {
    let tasks = server.tasks_mut();
    tasks.register(TaskType::RequestRegister, |f: &NetTaskFrame| {
        info!(agent = f.agent_id, "register: {}", String::from_utf8_lossy(&f.payload));
        Some(format!("registered {}", f.agent_id).into_bytes())
    });
    tasks.register(TaskType::RequestMetrics, |f: &NetTaskFrame| {
        info!(agent = f.agent_id, seq = f.sequence_number, "metrics: {}", String::from_utf8_lossy(&f.payload));
        Some(b"ok".to_vec())
    });
    // No task queue yet: every agent is told there is nothing to do.
    tasks.register(TaskType::RequestTask, |_: &NetTaskFrame| Some(Vec::new()));
}

pub async fn run(cfg: NetConfig) -> Result<()> {
    let tcp_addr = cfg.tcp_target()?.socket_addr();
    let udp_addr: SocketAddr = cfg.udp_target()?.socket_addr();

    let greeter = GreetingServer::bind(tcp_addr)
        .await
        .with_context(|| format!("binding tcp {tcp_addr}"))?;
    let mut tcp_task = tokio::spawn(greeter.run());

    let mut endpoint = UdpEndpoint::bind(udp_addr)
        .await
        .with_context(|| format!("binding udp {udp_addr}"))?;
    let (events_tx, mut events_rx) = mpsc::unbounded_channel();
    let mut server = Server::new(endpoint.transport(), cfg.signer()?, cfg.handshake_cfg()?)
        .with_events(events_tx);
    register_handlers(&mut server);
    endpoint.spawn(server, cfg.tick())?;

    info!(tcp = %tcp_addr, udp = %udp_addr, "server listening");

    loop {
        tokio::select! {
            Some((peer, event)) = events_rx.recv() => match event {
                HandshakeEvent::Authenticated => info!(%peer, "agent authenticated"),
                HandshakeEvent::Closed(reason) => info!(%peer, ?reason, "agent session closed"),
                HandshakeEvent::Message(_) => {}
            },
            res = &mut tcp_task => {
                match res {
                    Ok(Err(e)) => error!("tcp listener failed: {e}"),
                    Err(e) => error!("tcp listener task: {e}"),
                    Ok(Ok(())) => {}
                }
                break;
            }
            _ = signal::ctrl_c() => {
                info!("Ctrl+C received, shutting down");
                break;
            }
        }
    }

    tcp_task.abort();
    endpoint.close().await;
    Ok(())
}
