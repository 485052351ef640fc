//! TCP stream channel with length-prefixed framing.

use super::{Channel, ChannelCore, ChannelEvent, ChannelState, FrameSource, Role};
use crate::config::WireConfig;
use crate::error::WireError;
use crate::frame::{read_frame, write_frame};
use crate::policy::EndpointPolicy;
use async_trait::async_trait;
use bytes::Bytes;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, error, info, warn};

/// Pause after a failed `accept`, e.g. when the process is out of descriptors.
const ACCEPT_BACKOFF: Duration = Duration::from_secs(1);

enum Target {
    /// Client: dial this address on open.
    Connect(SocketAddr),
    /// Server: stream handed over by the acceptor, consumed on open.
    Accepted(Mutex<Option<TcpStream>>),
}

struct TcpFrames {
    reader: OwnedReadHalf,
    max_frame_size: u32,
}

#[async_trait]
impl FrameSource for TcpFrames {
    async fn next_frame(&mut self) -> Result<Option<Bytes>, WireError> {
        read_frame(&mut self.reader, self.max_frame_size).await
    }
}

/// Counts against the acceptor's channel limit until closed or dropped.
struct LiveSlot(Arc<AtomicUsize>);

impl LiveSlot {
    fn claim(live: &Arc<AtomicUsize>) -> Self {
        live.fetch_add(1, Ordering::SeqCst);
        Self(Arc::clone(live))
    }
}

impl Drop for LiveSlot {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// A TCP connection carrying length-prefixed frames.
///
/// A failed write closes the channel: a stream cannot resynchronise after a
/// partial frame.
pub struct TcpChannel {
    core: Arc<ChannelCore>,
    target: Target,
    peer_addr: SocketAddr,
    writer: tokio::sync::Mutex<Option<OwnedWriteHalf>>,
    max_frame_size: u32,
    slot: Mutex<Option<LiveSlot>>,
}

impl TcpChannel {
    /// Client-side channel that dials `addr` when opened.
    pub fn connect(addr: SocketAddr, config: &WireConfig) -> Self {
        Self::with_target(Role::Client, addr, Target::Connect(addr), config)
    }

    fn accepted(stream: TcpStream, peer: SocketAddr, slot: LiveSlot, config: &WireConfig) -> Self {
        let channel = Self::with_target(
            Role::Server,
            peer,
            Target::Accepted(Mutex::new(Some(stream))),
            config,
        );
        *channel.slot.lock().unwrap_or_else(|e| e.into_inner()) = Some(slot);
        channel
    }

    fn with_target(role: Role, peer: SocketAddr, target: Target, config: &WireConfig) -> Self {
        let description = match role {
            Role::Client => format!("tcp client -> {peer}"),
            Role::Server => format!("tcp server <- {peer}"),
        };
        Self {
            core: Arc::new(ChannelCore::new(
                role,
                description,
                config.inbound_queue_capacity,
                config.event_capacity,
            )),
            target,
            peer_addr: peer,
            writer: tokio::sync::Mutex::new(None),
            max_frame_size: config.max_frame_size,
            slot: Mutex::new(None),
        }
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    async fn establish(&self) -> Result<TcpStream, WireError> {
        match &self.target {
            Target::Connect(addr) => Ok(TcpStream::connect(addr).await?),
            Target::Accepted(slot) => slot
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .take()
                .ok_or(WireError::ConnectionClosed),
        }
    }
}

#[async_trait]
impl Channel for TcpChannel {
    fn core(&self) -> &ChannelCore {
        &self.core
    }

    async fn open(&self) -> Result<(), WireError> {
        if !self.core.begin_open()? {
            return Ok(());
        }

        let stream = match self.establish().await {
            Ok(stream) => stream,
            Err(e) => {
                warn!(peer = %self.peer_addr, error = %e, "TCP open failed");
                self.core.fail_open();
                return Err(e);
            }
        };
        if let Err(e) = stream.set_nodelay(true) {
            debug!(error = %e, "Failed to set TCP_NODELAY");
        }

        let (reader, writer) = stream.into_split();
        *self.writer.lock().await = Some(writer);
        self.core.spawn_receive_loop(TcpFrames {
            reader,
            max_frame_size: self.max_frame_size,
        });
        self.core.finish_open();
        info!(
            channel = self.core.id(),
            peer = %self.peer_addr,
            role = %self.core.role(),
            "TCP channel open"
        );
        Ok(())
    }

    async fn close(&self) {
        let began = self.core.begin_close();
        if let Some(mut writer) = self.writer.lock().await.take() {
            let _ = writer.shutdown().await;
        }
        if let Target::Accepted(stream) = &self.target {
            stream.lock().unwrap_or_else(|e| e.into_inner()).take();
        }
        self.slot.lock().unwrap_or_else(|e| e.into_inner()).take();
        if began {
            self.core.finish_close();
        }
    }

    async fn try_send_bytes(&self, bytes: Bytes) -> bool {
        if self.core.state() != ChannelState::Open {
            return false;
        }
        let mut guard = self.writer.lock().await;
        let Some(writer) = guard.as_mut() else {
            return false;
        };

        match write_frame(writer, &bytes, self.max_frame_size).await {
            Ok(()) => {
                drop(guard);
                self.core.emit(ChannelEvent::SentBytes(bytes));
                true
            }
            Err(WireError::MessageTooLarge { size, max }) => {
                // Nothing was written; the stream is still in sync.
                warn!(channel = self.core.id(), size, max, "Frame too large, not sent");
                false
            }
            Err(e) => {
                warn!(
                    channel = self.core.id(),
                    peer = %self.peer_addr,
                    error = %e,
                    "TCP write failed, closing channel"
                );
                guard.take();
                drop(guard);
                self.core.fault_close();
                false
            }
        }
    }

    fn is_connection_alive(&self) -> bool {
        self.core.state() == ChannelState::Open
    }

    fn signals_end_of_stream(&self) -> bool {
        true
    }
}

/// Listens for inbound TCP connections and hands out server-role channels.
///
/// Connections from banned addresses, and connections beyond the policy's
/// `max_channels` while that many accepted channels are still unclosed, are
/// dropped as soon as they are accepted.
pub struct TcpAcceptor {
    listener: TcpListener,
    local_addr: SocketAddr,
    policy: Arc<EndpointPolicy>,
    config: WireConfig,
    live: Arc<AtomicUsize>,
}

impl TcpAcceptor {
    pub async fn bind(
        addr: SocketAddr,
        policy: Arc<EndpointPolicy>,
        config: WireConfig,
    ) -> Result<Self, WireError> {
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        info!(addr = %local_addr, "TCP acceptor listening");
        Ok(Self {
            listener,
            local_addr,
            policy,
            config,
            live: Arc::new(AtomicUsize::new(0)),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn policy(&self) -> &Arc<EndpointPolicy> {
        &self.policy
    }

    /// Accepted channels that have not been closed or dropped yet.
    pub fn live_channels(&self) -> usize {
        self.live.load(Ordering::SeqCst)
    }

    /// Wait for the next admissible connection. The returned channel is
    /// still `Closed`; opening it adopts the accepted stream.
    ///
    /// Accept failures are logged and retried after a short pause.
    pub async fn accept(&self) -> TcpChannel {
        loop {
            let (stream, peer) = match self.listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    error!(addr = %self.local_addr, error = %e, "TCP accept failed");
                    tokio::time::sleep(ACCEPT_BACKOFF).await;
                    continue;
                }
            };
            if let Err(violation) = self.policy.admit_endpoint(peer, self.live_channels()) {
                warn!(peer = %peer, %violation, "Refusing TCP connection");
                drop(stream);
                continue;
            }
            debug!(peer = %peer, "Accepted TCP connection");
            let slot = LiveSlot::claim(&self.live);
            return TcpChannel::accepted(stream, peer, slot, &self.config);
        }
    }
}
