//! The demo protocol spoken by every subcommand.
//!
//! Handshake: `Synchronize` → `Ack` → `Verack` (or the authenticated handshake when a
//! secret is configured). After that the client sends `Ping` requests, the
//! server answers each with a `Pong`, and the client says `Bye` when done.

use duplex_wire::{
    Handshake, HandshakeOutcome, Message, Orchestrator, Protocol, ProtocolError, Role,
};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Notify;
use tracing::{debug, info, warn};

/// Demo protocol revision; peers with a different revision are refused.
pub const DEMO_REVISION: u32 = 1;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Synchronize {
    pub node: String,
    pub revision: u32,
}

impl Message for Synchronize {
    const TAG: &'static str = "demo.sync";
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Ack {
    pub node: String,
}

impl Message for Ack {
    const TAG: &'static str = "demo.ack";
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Verack;

impl Message for Verack {
    const TAG: &'static str = "demo.verack";
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Ping {
    pub seq: u32,
    /// Sender's clock, milliseconds since its session started.
    pub sent_ms: u64,
}

impl Message for Ping {
    const TAG: &'static str = "demo.ping";
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Pong {
    pub seq: u32,
    pub sent_ms: u64,
}

impl Message for Pong {
    const TAG: &'static str = "demo.pong";
}

/// Tells the peer to wind down its session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Bye {
    pub reason: String,
}

impl Message for Bye {
    const TAG: &'static str = "demo.bye";
}

/// Round-trip bookkeeping shared with the response handler.
pub struct PongTracker {
    started: Instant,
    received: AtomicUsize,
    notify: Notify,
}

impl PongTracker {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            started: Instant::now(),
            received: AtomicUsize::new(0),
            notify: Notify::new(),
        })
    }

    pub fn now_ms(&self) -> u64 {
        self.started.elapsed().as_millis() as u64
    }

    pub fn received(&self) -> usize {
        self.received.load(Ordering::SeqCst)
    }

    fn record(&self, pong: &Pong) {
        let rtt = self.now_ms().saturating_sub(pong.sent_ms);
        info!(seq = pong.seq, rtt_ms = rtt, "Pong");
        self.received.fetch_add(1, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    /// Wait until `expected` pongs arrived or `limit` elapses. Returns how
    /// many arrived.
    pub async fn wait_for(&self, expected: usize, limit: Duration) -> usize {
        let _ = tokio::time::timeout(limit, async {
            loop {
                let notified = self.notify.notified();
                if self.received() >= expected {
                    return;
                }
                notified.await;
            }
        })
        .await;
        self.received()
    }
}

/// Build the demo protocol.
///
/// Both peers build the same definition; `tracker` receives pongs on the
/// side that sends pings.
pub fn protocol(
    node: String,
    secret: Option<String>,
    tracker: Arc<PongTracker>,
) -> Result<Arc<Protocol>, ProtocolError> {
    let builder = Protocol::builder()
        .on_request(|_orch: &Orchestrator, ping: &Ping| {
            debug!(seq = ping.seq, "Ping");
            Ok(Pong {
                seq: ping.seq,
                sent_ms: ping.sent_ms,
            })
        })
        .on_response(move |_orch: &Orchestrator, ping: &Ping, pong: &Pong| {
            if ping.seq != pong.seq {
                return Err(format!("pong {} answers ping {}", pong.seq, ping.seq).into());
            }
            tracker.record(pong);
            Ok(())
        })
        .on_command(|orch: &Orchestrator, bye: &Bye| {
            info!(session = %orch.session_id(), reason = %bye.reason, "Peer said goodbye");
            orch.request_finish();
            Ok(())
        })
        .json::<Ping>()
        .msgpack::<Pong>()
        .json::<Bye>();

    let builder = match secret {
        Some(secret) => builder.authenticated_handshake(
            duplex_wire::AuthConfig::new(secret).with_node_id(node),
        ),
        None => builder
            .handshake(sync_handshake(node))
            .json::<Synchronize>()
            .json::<Ack>()
            .json::<Verack>(),
    };
    builder.build()
}

fn sync_handshake(node: String) -> impl duplex_wire::handshake::HandshakeDecl {
    let initiator_node = node.clone();
    Handshake::three_way::<Synchronize, Ack, Verack>(Role::Client)
        .initiate(move || Synchronize {
            node: initiator_node.clone(),
            revision: DEMO_REVISION,
        })
        .respond(move |sync| {
            let ack = Ack { node: node.clone() };
            if sync.revision != DEMO_REVISION {
                warn!(peer = %sync.node, revision = sync.revision, "Refusing peer revision");
                return (ack, HandshakeOutcome::UnsupportedVersion);
            }
            info!(peer = %sync.node, "Peer synced");
            (ack, HandshakeOutcome::Accepted)
        })
        .confirm(|_sync, ack| {
            info!(peer = %ack.node, "Peer acknowledged");
            (Verack, HandshakeOutcome::Accepted)
        })
}

/// Send `count` pings and wait for their pongs. Returns how many came back.
pub async fn ping_session(
    orch: &Orchestrator,
    tracker: &PongTracker,
    count: u32,
    limit: Duration,
) -> Result<usize, duplex_wire::WireError> {
    for seq in 1..=count {
        orch.send_request(Ping {
            seq,
            sent_ms: tracker.now_ms(),
        })?;
    }
    let received = tracker.wait_for(count as usize, limit).await;
    orch.send_command(Bye {
        reason: "done".to_string(),
    })?;
    Ok(received)
}
