//! UDP server: one socket demultiplexed into a logical channel per remote endpoint.
//!
//! The server owns the only receive loop. Each datagram is routed by source
//! address to that endpoint's [`MultiplexedChannel`], creating one on first
//! contact. The endpoint map is read-mostly: the loop takes the write lock
//! only to insert or remove an entry, never across an await point.

use super::udp::{is_transient, RECV_BUFFER_SIZE};
use super::{Channel, ChannelCore, ChannelEvent, ChannelState, Role};
use crate::config::WireConfig;
use crate::error::WireError;
use crate::policy::{EndpointPolicy, PolicyViolation};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// One remote endpoint's logical channel on a [`UdpServer`].
///
/// It has no receive loop of its own: the server injects frames into it.
pub struct MultiplexedChannel {
    core: Arc<ChannelCore>,
    socket: Arc<UdpSocket>,
    remote: SocketAddr,
    max_datagram_size: usize,
    last_seen: Mutex<Instant>,
}

impl MultiplexedChannel {
    fn new(socket: Arc<UdpSocket>, remote: SocketAddr, config: &WireConfig) -> Arc<Self> {
        let core = Arc::new(ChannelCore::new(
            Role::Server,
            format!("udp server <- {remote}"),
            config.inbound_queue_capacity,
            config.event_capacity,
        ));
        // Created already open: the shared socket is live.
        if matches!(core.begin_open(), Ok(true)) {
            core.finish_open();
        }
        Arc::new(Self {
            core,
            socket,
            remote,
            max_datagram_size: config.max_datagram_size,
            last_seen: Mutex::new(Instant::now()),
        })
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.remote
    }

    /// Time since the last datagram from this endpoint.
    pub fn idle(&self) -> Duration {
        self.last_seen
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .elapsed()
    }

    fn deliver(&self, frame: Bytes) -> bool {
        *self.last_seen.lock().unwrap_or_else(|e| e.into_inner()) = Instant::now();
        self.core.inject(frame)
    }

    fn shut(&self) {
        if self.core.begin_close() {
            self.core.finish_close();
        }
    }
}

#[async_trait]
impl Channel for MultiplexedChannel {
    fn core(&self) -> &ChannelCore {
        &self.core
    }

    async fn open(&self) -> Result<(), WireError> {
        if self.core.begin_open()? {
            self.core.finish_open();
        }
        Ok(())
    }

    async fn close(&self) {
        self.shut();
    }

    async fn try_send_bytes(&self, bytes: Bytes) -> bool {
        if self.core.state() != ChannelState::Open {
            return false;
        }
        if bytes.len() > self.max_datagram_size {
            warn!(
                channel = self.core.id(),
                size = bytes.len(),
                max = self.max_datagram_size,
                "Frame exceeds datagram size, not sent"
            );
            return false;
        }
        match self.socket.send_to(&bytes, self.remote).await {
            Ok(_) => {
                self.core.emit(ChannelEvent::SentBytes(bytes));
                true
            }
            Err(e) => {
                debug!(channel = self.core.id(), peer = %self.remote, error = %e, "UDP send failed");
                false
            }
        }
    }

    fn is_connection_alive(&self) -> bool {
        true
    }

    fn signals_end_of_stream(&self) -> bool {
        false
    }
}

/// Snapshot of one endpoint known to a [`UdpServer`].
#[derive(Debug, Clone)]
pub struct PeerSummary {
    pub remote: SocketAddr,
    pub channel_id: u64,
    pub state: ChannelState,
    pub opened_at: Option<DateTime<Utc>>,
    pub idle: Duration,
}

struct Demux {
    socket: Arc<UdpSocket>,
    channels: RwLock<HashMap<SocketAddr, Arc<MultiplexedChannel>>>,
    policy: Arc<EndpointPolicy>,
    config: WireConfig,
    accepted_tx: mpsc::UnboundedSender<Arc<MultiplexedChannel>>,
}

impl Demux {
    async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut buf = vec![0u8; RECV_BUFFER_SIZE];
        loop {
            let (len, from) = tokio::select! {
                _ = shutdown.changed() => break,
                received = self.socket.recv_from(&mut buf) => match received {
                    Ok(received) => received,
                    Err(e) if is_transient(e.kind()) => continue,
                    Err(e) => {
                        error!(error = %e, "UDP server receive failed");
                        tokio::time::sleep(Duration::from_millis(100)).await;
                        continue;
                    }
                },
            };

            if let Err(violation) = self.policy.admit_datagram(from, len) {
                debug!(peer = %from, %violation, "Dropping datagram");
                continue;
            }
            let Some(channel) = self.route(from) else {
                continue;
            };
            channel.deliver(Bytes::copy_from_slice(&buf[..len]));
        }
        debug!("UDP server demultiplexer stopped");
    }

    /// Find or create the logical channel for `from`.
    fn route(&self, from: SocketAddr) -> Option<Arc<MultiplexedChannel>> {
        {
            let channels = self.channels.read().unwrap_or_else(|e| e.into_inner());
            if let Some(channel) = channels.get(&from) {
                if channel.core.state() == ChannelState::Open
                    && self.policy.still_admitted(from, Duration::ZERO).is_ok()
                {
                    return Some(Arc::clone(channel));
                }
            }
        }

        let mut channels = self.channels.write().unwrap_or_else(|e| e.into_inner());
        if let Some(existing) = channels.get(&from) {
            if existing.core.state() == ChannelState::Open {
                match self.policy.still_admitted(from, Duration::ZERO) {
                    Ok(()) => return Some(Arc::clone(existing)),
                    Err(violation) => {
                        let removed = channels.remove(&from);
                        drop(channels);
                        info!(peer = %from, %violation, "Dropping logical channel");
                        if let Some(channel) = removed {
                            channel.shut();
                        }
                        return None;
                    }
                }
            }
            // Closed by its owner; the next datagram starts a fresh channel.
            channels.remove(&from);
        }

        if let Err(violation) = self.policy.admit_endpoint(from, channels.len()) {
            drop(channels);
            warn!(peer = %from, %violation, "Refusing new endpoint");
            return None;
        }
        let channel = MultiplexedChannel::new(Arc::clone(&self.socket), from, &self.config);
        channels.insert(from, Arc::clone(&channel));
        drop(channels);

        info!(peer = %from, channel = channel.core.id(), "New logical UDP channel");
        let _ = self.accepted_tx.send(Arc::clone(&channel));
        Some(channel)
    }
}

/// A UDP socket serving many remote endpoints.
pub struct UdpServer {
    demux: Arc<Demux>,
    local_addr: SocketAddr,
    accepted_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<Arc<MultiplexedChannel>>>,
    shutdown_tx: watch::Sender<bool>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl UdpServer {
    /// Bind `addr` and start demultiplexing.
    pub async fn bind(
        addr: SocketAddr,
        policy: Arc<EndpointPolicy>,
        config: WireConfig,
    ) -> Result<Self, WireError> {
        let socket = Arc::new(UdpSocket::bind(addr).await?);
        let local_addr = socket.local_addr()?;
        let (accepted_tx, accepted_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let demux = Arc::new(Demux {
            socket,
            channels: RwLock::new(HashMap::new()),
            policy,
            config,
            accepted_tx,
        });
        let task = tokio::spawn(Arc::clone(&demux).run(shutdown_rx));
        info!(addr = %local_addr, "UDP server listening");

        Ok(Self {
            demux,
            local_addr,
            accepted_rx: tokio::sync::Mutex::new(accepted_rx),
            shutdown_tx,
            task: Mutex::new(Some(task)),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn policy(&self) -> &Arc<EndpointPolicy> {
        &self.demux.policy
    }

    /// Wait for the next newly created logical channel. `None` after shutdown.
    pub async fn accept(&self) -> Option<Arc<MultiplexedChannel>> {
        let mut shutdown = self.shutdown_tx.subscribe();
        if *shutdown.borrow_and_update() {
            return None;
        }
        let mut accepted = self.accepted_rx.lock().await;
        tokio::select! {
            channel = accepted.recv() => channel,
            _ = shutdown.changed() => None,
        }
    }

    /// The live channel for `remote`, if any.
    pub fn channel(&self, remote: SocketAddr) -> Option<Arc<MultiplexedChannel>> {
        let channels = self.demux.channels.read().unwrap_or_else(|e| e.into_inner());
        channels.get(&remote).cloned()
    }

    pub fn channel_count(&self) -> usize {
        let channels = self.demux.channels.read().unwrap_or_else(|e| e.into_inner());
        channels.len()
    }

    pub fn peers(&self) -> Vec<PeerSummary> {
        let channels = self.demux.channels.read().unwrap_or_else(|e| e.into_inner());
        channels
            .values()
            .map(|channel| PeerSummary {
                remote: channel.remote,
                channel_id: channel.core.id(),
                state: channel.core.state(),
                opened_at: channel.core.opened_at(),
                idle: channel.idle(),
            })
            .collect()
    }

    /// Re-apply the policy to every known endpoint, closing and removing the
    /// channels that no longer pass (banned, idle) along with any already
    /// closed by their owner. Returns how many were removed.
    pub fn reevaluate(&self) -> usize {
        let mut dropped: Vec<(Arc<MultiplexedChannel>, Option<PolicyViolation>)> = Vec::new();
        {
            let mut channels = self.demux.channels.write().unwrap_or_else(|e| e.into_inner());
            channels.retain(|addr, channel| {
                if channel.core.state() != ChannelState::Open {
                    dropped.push((Arc::clone(channel), None));
                    return false;
                }
                match self.demux.policy.still_admitted(*addr, channel.idle()) {
                    Ok(()) => true,
                    Err(violation) => {
                        dropped.push((Arc::clone(channel), Some(violation)));
                        false
                    }
                }
            });
        }

        for (channel, violation) in &dropped {
            match violation {
                Some(violation) => {
                    info!(peer = %channel.remote, %violation, "Closing logical channel")
                }
                None => debug!(peer = %channel.remote, "Forgetting closed logical channel"),
            }
            channel.shut();
        }
        self.demux.policy.forget_idle_quotas();
        dropped.len()
    }

    /// Stop the demultiplexer and close every logical channel.
    pub async fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
        let task = self.task.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(task) = task {
            let _ = task.await;
        }
        let drained: Vec<_> = {
            let mut channels = self.demux.channels.write().unwrap_or_else(|e| e.into_inner());
            channels.drain().map(|(_, channel)| channel).collect()
        };
        for channel in drained {
            channel.shut();
        }
        info!(addr = %self.local_addr, "UDP server stopped");
    }
}

impl Drop for UdpServer {
    fn drop(&mut self) {
        let _ = self.shutdown_tx.send(true);
    }
}
