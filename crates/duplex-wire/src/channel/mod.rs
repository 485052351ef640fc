//! Transport channels.
//!
//! A [`Channel`] is one duplex logical connection. Concrete transports only
//! provide byte-level primitives (open, close, send a frame, feed received
//! frames); the lifecycle state machine, event publication and the inbound
//! frame queue live in the shared [`ChannelCore`].
//!
//! Two shapes of channel exist:
//!
//! - **standalone** channels ([`TcpChannel`], [`UdpChannel`], [`PipeChannel`])
//!   own a background receive loop started by `open()`;
//! - **multiplexed** channels ([`MultiplexedChannel`]) own no loop at all and
//!   receive frames injected by the [`UdpServer`] demultiplexer.

pub mod tcp;
pub mod udp;
pub mod udp_server;
#[cfg(unix)]
pub mod pipe;

pub use tcp::{TcpAcceptor, TcpChannel};
pub use udp::UdpChannel;
pub use udp_server::{MultiplexedChannel, PeerSummary, UdpServer};
#[cfg(unix)]
pub use pipe::{PipeChannel, PipeHandles};

use crate::error::WireError;
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::{broadcast, mpsc, watch};
use tracing::{debug, warn};

static NEXT_CHANNEL_ID: AtomicU64 = AtomicU64::new(1);

/// Which end of a connection a channel represents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    Client,
    Server,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Client => write!(f, "client"),
            Self::Server => write!(f, "server"),
        }
    }
}

/// Channel lifecycle: `Closed → Opening → Open → Closing → Closed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Closed,
    Opening,
    Open,
    Closing,
}

impl std::fmt::Display for ChannelState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Closed => write!(f, "closed"),
            Self::Opening => write!(f, "opening"),
            Self::Open => write!(f, "open"),
            Self::Closing => write!(f, "closing"),
        }
    }
}

/// Lifecycle and traffic notifications published by a channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelEvent {
    Opening,
    Opened,
    Closing,
    Closed,
    ReceivedBytes(Bytes),
    SentBytes(Bytes),
}

/// A duplex, frame-oriented transport connection.
#[async_trait]
pub trait Channel: Send + Sync + 'static {
    /// Shared lifecycle state for this channel.
    fn core(&self) -> &ChannelCore;

    /// Process-unique numeric id.
    fn id(&self) -> u64 {
        self.core().id()
    }

    fn description(&self) -> &str {
        self.core().description()
    }

    fn role(&self) -> Role {
        self.core().role()
    }

    fn state(&self) -> ChannelState {
        self.core().state()
    }

    fn subscribe(&self) -> broadcast::Receiver<ChannelEvent> {
        self.core().subscribe()
    }

    /// Establish connectivity. Calling `open` on an open channel is a no-op.
    async fn open(&self) -> Result<(), WireError>;

    /// Tear down the transport. Always safe, including before `open`.
    async fn close(&self);

    /// Attempt to deliver one frame. Whether a failure is fatal to the
    /// connection depends on the transport.
    async fn try_send_bytes(&self, bytes: Bytes) -> bool;

    /// Wait for the next inbound frame.
    ///
    /// Returns `None` once the channel has closed and its queue is drained,
    /// or as soon as `cancel` flips to `true`.
    async fn receive_bytes(&self, cancel: &mut watch::Receiver<bool>) -> Option<Bytes> {
        self.core().receive(cancel).await
    }

    /// Liveness probe. Connectionless transports always report `true`.
    fn is_connection_alive(&self) -> bool;

    /// Whether the transport can tell that the peer will send nothing more.
    fn signals_end_of_stream(&self) -> bool;
}

/// Source of inbound frames driven by a channel's receive loop.
#[async_trait]
pub trait FrameSource: Send + 'static {
    /// Next frame; `Ok(None)` means the peer finished cleanly.
    async fn next_frame(&mut self) -> Result<Option<Bytes>, WireError>;
}

/// State machine, events and inbound queue shared by every channel type.
pub struct ChannelCore {
    id: u64,
    role: Role,
    description: String,
    state: watch::Sender<ChannelState>,
    events: broadcast::Sender<ChannelEvent>,
    inbound_tx: mpsc::Sender<Bytes>,
    inbound_rx: tokio::sync::Mutex<mpsc::Receiver<Bytes>>,
    /// Dropping the sender stops the receive loop.
    loop_stop: Mutex<Option<watch::Sender<bool>>>,
    opened_at: Mutex<Option<DateTime<Utc>>>,
}

impl ChannelCore {
    pub fn new(
        role: Role,
        description: String,
        inbound_capacity: usize,
        event_capacity: usize,
    ) -> Self {
        let (state, _) = watch::channel(ChannelState::Closed);
        let (events, _) = broadcast::channel(event_capacity.max(1));
        let (inbound_tx, inbound_rx) = mpsc::channel(inbound_capacity.max(1));
        Self {
            id: NEXT_CHANNEL_ID.fetch_add(1, Ordering::Relaxed),
            role,
            description,
            state,
            events,
            inbound_tx,
            inbound_rx: tokio::sync::Mutex::new(inbound_rx),
            loop_stop: Mutex::new(None),
            opened_at: Mutex::new(None),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn state(&self) -> ChannelState {
        *self.state.borrow()
    }

    /// When the channel last reached `Open`.
    pub fn opened_at(&self) -> Option<DateTime<Utc>> {
        *self.opened_at.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ChannelEvent> {
        self.events.subscribe()
    }

    pub fn emit(&self, event: ChannelEvent) {
        let _ = self.events.send(event);
    }

    /// `Closed → Opening`. Returns `Ok(false)` when already open.
    pub fn begin_open(&self) -> Result<bool, WireError> {
        let mut outcome = Ok(false);
        self.state.send_if_modified(|state| match *state {
            ChannelState::Closed => {
                *state = ChannelState::Opening;
                outcome = Ok(true);
                true
            }
            ChannelState::Open => false,
            other => {
                outcome = Err(WireError::InvalidState {
                    current: other.to_string(),
                    operation: "open",
                });
                false
            }
        });
        if matches!(outcome, Ok(true)) {
            debug!(channel = self.id, desc = %self.description, "Channel opening");
            self.emit(ChannelEvent::Opening);
        }
        outcome
    }

    /// `Opening → Open`. A fault that already closed the channel wins.
    pub fn finish_open(&self) {
        let opened = self.state.send_if_modified(|state| {
            if *state == ChannelState::Opening {
                *state = ChannelState::Open;
                true
            } else {
                false
            }
        });
        if opened {
            *self.opened_at.lock().unwrap_or_else(|e| e.into_inner()) = Some(Utc::now());
            debug!(channel = self.id, desc = %self.description, "Channel open");
            self.emit(ChannelEvent::Opened);
        }
    }

    /// `Opening → Closed` after a failed open.
    pub fn fail_open(&self) {
        self.stop_loop();
        let failed = self.state.send_if_modified(|state| {
            if *state == ChannelState::Opening {
                *state = ChannelState::Closed;
                true
            } else {
                false
            }
        });
        if failed {
            self.emit(ChannelEvent::Closed);
        }
    }

    /// `Opening | Open → Closing`. Returns `false` when already closing or closed.
    pub fn begin_close(&self) -> bool {
        let began = self.state.send_if_modified(|state| match *state {
            ChannelState::Opening | ChannelState::Open => {
                *state = ChannelState::Closing;
                true
            }
            _ => false,
        });
        if began {
            debug!(channel = self.id, desc = %self.description, "Channel closing");
            self.emit(ChannelEvent::Closing);
            self.stop_loop();
        }
        began
    }

    /// `Closing → Closed`.
    pub fn finish_close(&self) {
        let closed = self.state.send_if_modified(|state| {
            if *state == ChannelState::Closing {
                *state = ChannelState::Closed;
                true
            } else {
                false
            }
        });
        if closed {
            debug!(channel = self.id, desc = %self.description, "Channel closed");
            self.emit(ChannelEvent::Closed);
        }
    }

    /// Close in response to a transport failure observed by the receive loop.
    pub fn fault_close(&self) {
        if self.begin_close() {
            self.finish_close();
        }
    }

    fn stop_loop(&self) {
        self.loop_stop
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
    }

    /// Push a frame delivered by someone else's socket (multiplexed channels).
    pub fn inject(&self, frame: Bytes) -> bool {
        if self.state() != ChannelState::Open {
            return false;
        }
        self.emit(ChannelEvent::ReceivedBytes(frame.clone()));
        match self.inbound_tx.try_send(frame) {
            Ok(()) => true,
            Err(_) => {
                warn!(channel = self.id, "Inbound queue full, dropping frame");
                false
            }
        }
    }

    /// Start the background receive loop for a standalone channel.
    pub fn spawn_receive_loop<S: FrameSource>(self: &Arc<Self>, mut source: S) {
        let (stop_tx, mut stop_rx) = watch::channel(false);
        *self.loop_stop.lock().unwrap_or_else(|e| e.into_inner()) = Some(stop_tx);

        let core = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                let frame = tokio::select! {
                    _ = stop_rx.changed() => break,
                    result = source.next_frame() => match result {
                        Ok(Some(frame)) => frame,
                        Ok(None) => {
                            debug!(channel = core.id, "Peer closed the transport");
                            core.fault_close();
                            break;
                        }
                        Err(e) => {
                            debug!(channel = core.id, error = %e, "Receive failed, closing channel");
                            core.fault_close();
                            break;
                        }
                    },
                };

                core.emit(ChannelEvent::ReceivedBytes(frame.clone()));
                tokio::select! {
                    _ = stop_rx.changed() => break,
                    sent = core.inbound_tx.send(frame) => {
                        if sent.is_err() {
                            break;
                        }
                    }
                }
            }
        });
    }

    /// Next queued inbound frame; see [`Channel::receive_bytes`].
    pub async fn receive(&self, cancel: &mut watch::Receiver<bool>) -> Option<Bytes> {
        let mut inbound = self.inbound_rx.lock().await;
        let mut state = self.state.subscribe();
        loop {
            if *cancel.borrow_and_update() {
                return None;
            }
            if let Ok(frame) = inbound.try_recv() {
                return Some(frame);
            }
            if matches!(
                *state.borrow_and_update(),
                ChannelState::Closing | ChannelState::Closed
            ) {
                return None;
            }

            tokio::select! {
                frame = inbound.recv() => return frame,
                changed = state.changed() => {
                    if changed.is_err() {
                        return None;
                    }
                }
                changed = cancel.changed() => {
                    if changed.is_err() {
                        return None;
                    }
                }
            }
        }
    }
}
