//! Transport runners for each subcommand.

use crate::demo::{self, PongTracker};
use duplex_wire::{
    Channel, EndpointPolicy, Orchestrator, OrchestratorState, Protocol, Role, TcpAcceptor,
    TcpChannel, UdpChannel, UdpServer, WireConfig, WireError,
};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// How long a client waits for its pongs.
const PONG_WAIT: Duration = Duration::from_secs(10);

/// Everything a session needs besides its transport.
#[derive(Clone)]
pub struct SessionContext {
    pub config: WireConfig,
    pub node: String,
    pub secret: Option<String>,
}

impl SessionContext {
    fn protocol(&self, tracker: Arc<PongTracker>) -> Result<Arc<Protocol>, WireError> {
        Ok(demo::protocol(self.node.clone(), self.secret.clone(), tracker)?)
    }
}

/// Drive an answering session until the peer leaves.
async fn serve_channel(
    channel: Arc<dyn Channel>,
    ctx: &SessionContext,
) -> Result<OrchestratorState, WireError> {
    let orch = Orchestrator::new(channel, ctx.protocol(PongTracker::new())?, ctx.config.clone());
    orch.start().await?;
    info!(session = %orch.session_id(), "Session running");
    if orch.channel().signals_end_of_stream() {
        orch.run_to_end().await
    } else {
        // Datagram peers cannot be observed closing; their `Bye` ends the session.
        Ok(orch.terminated().await)
    }
}

/// Drive a pinging session and report how many pongs came back.
async fn ping_channel(
    channel: Arc<dyn Channel>,
    ctx: &SessionContext,
    count: u32,
) -> Result<(), WireError> {
    let tracker = PongTracker::new();
    let orch = Orchestrator::new(channel, ctx.protocol(Arc::clone(&tracker))?, ctx.config.clone());
    orch.start().await?;

    let received = demo::ping_session(&orch, &tracker, count, PONG_WAIT).await?;
    let state = orch.finish().await;
    println!(
        "received {received}/{count} pongs in {}ms ({state})",
        tracker.now_ms()
    );
    if received < count as usize {
        return Err(WireError::Unsupported(format!(
            "only {received} of {count} pongs arrived"
        )));
    }
    Ok(())
}

pub async fn tcp_serve(addr: SocketAddr, once: bool, ctx: SessionContext) -> Result<(), WireError> {
    let policy = Arc::new(EndpointPolicy::from_config(&ctx.config));
    let acceptor = TcpAcceptor::bind(addr, policy, ctx.config.clone()).await?;
    println!("listening on {}", acceptor.local_addr());

    loop {
        let channel = tokio::select! {
            channel = acceptor.accept() => channel,
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted, no longer accepting");
                return Ok(());
            }
        };
        let peer = channel.peer_addr();
        let ctx = ctx.clone();
        let session = async move {
            match serve_channel(Arc::new(channel), &ctx).await {
                Ok(state) => info!(%peer, %state, "Session ended"),
                Err(e) => warn!(%peer, error = %e, "Session failed"),
            }
        };
        if once {
            session.await;
            return Ok(());
        }
        tokio::spawn(session);
    }
}

pub async fn tcp_connect(addr: SocketAddr, count: u32, ctx: SessionContext) -> Result<(), WireError> {
    let channel = TcpChannel::connect(addr, &ctx.config);
    ping_channel(Arc::new(channel), &ctx, count).await
}

pub async fn udp_serve(addr: SocketAddr, once: bool, ctx: SessionContext) -> Result<(), WireError> {
    let policy = Arc::new(EndpointPolicy::from_config(&ctx.config));
    let server = Arc::new(UdpServer::bind(addr, policy, ctx.config.clone()).await?);
    println!("listening on {}", server.local_addr());

    let sweeper = {
        let server = Arc::clone(&server);
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(Duration::from_secs(5));
            loop {
                tick.tick().await;
                let removed = server.reevaluate();
                if removed > 0 {
                    info!(removed, live = server.channel_count(), "Re-evaluated UDP peers");
                }
            }
        })
    };

    let result = loop {
        let channel = tokio::select! {
            accepted = server.accept() => match accepted {
                Some(channel) => channel,
                None => break Ok(()),
            },
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted, shutting down UDP server");
                break Ok(());
            }
        };
        let peer = channel.remote_addr();
        let ctx = ctx.clone();
        let session = async move {
            match serve_channel(channel, &ctx).await {
                Ok(state) => info!(%peer, %state, "Session ended"),
                Err(e) => warn!(%peer, error = %e, "Session failed"),
            }
        };
        if once {
            session.await;
            break Ok(());
        }
        tokio::spawn(session);
    };

    sweeper.abort();
    server.shutdown().await;
    result
}

pub async fn udp_connect(
    addr: SocketAddr,
    bind: SocketAddr,
    count: u32,
    ctx: SessionContext,
) -> Result<(), WireError> {
    let channel = UdpChannel::new(bind, Some(addr), Role::Client, &ctx.config);
    ping_channel(Arc::new(channel), &ctx, count).await
}

#[cfg(unix)]
pub async fn pipe_parent(
    count: u32,
    config_path: Option<std::path::PathBuf>,
    ctx: SessionContext,
) -> Result<(), WireError> {
    let exe = std::env::current_exe()?;
    let mut command = tokio::process::Command::new(exe);
    if let Some(path) = config_path {
        command.arg("--config").arg(path);
    }
    if let Some(secret) = &ctx.secret {
        command.env("DUPLEX_SECRET", secret);
    }
    command.arg("--node").arg(format!("{}-child", ctx.node));
    command.arg("pipe-child");

    let channel = duplex_wire::PipeChannel::spawn(command, &ctx.config);
    ping_channel(Arc::new(channel), &ctx, count).await
}

#[cfg(unix)]
pub async fn pipe_child(handles: duplex_wire::PipeHandles, ctx: SessionContext) -> Result<(), WireError> {
    // SAFETY: the parent passed these descriptors on our command line for
    // this process alone, and nothing else in the process touches them.
    let channel = unsafe { duplex_wire::PipeChannel::from_handles(handles, &ctx.config) };
    let state = serve_channel(Arc::new(channel), &ctx).await?;
    info!(%state, "Pipe child done");
    Ok(())
}
