//! Standalone UDP channel: one socket, one remote, one frame per datagram.

use super::{Channel, ChannelCore, ChannelEvent, ChannelState, FrameSource, Role};
use crate::config::WireConfig;
use crate::error::WireError;
use async_trait::async_trait;
use bytes::Bytes;
use std::io::ErrorKind;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use tokio::net::UdpSocket;
use tracing::{debug, info, warn};

/// Receive buffer; larger than any admissible datagram so oversize ones are detected.
pub(crate) const RECV_BUFFER_SIZE: usize = 65_536;

/// Transient errors some platforms report on unconnected UDP sockets.
pub(crate) fn is_transient(kind: ErrorKind) -> bool {
    matches!(
        kind,
        ErrorKind::ConnectionReset | ErrorKind::ConnectionRefused | ErrorKind::Interrupted
    )
}

struct Datagrams {
    socket: Arc<UdpSocket>,
    remote: Option<SocketAddr>,
    last_peer: Arc<Mutex<Option<SocketAddr>>>,
    max_datagram_size: usize,
    buf: Vec<u8>,
}

#[async_trait]
impl FrameSource for Datagrams {
    async fn next_frame(&mut self) -> Result<Option<Bytes>, WireError> {
        loop {
            let (len, from) = match self.socket.recv_from(&mut self.buf).await {
                Ok(received) => received,
                Err(e) if is_transient(e.kind()) => continue,
                Err(e) => return Err(e.into()),
            };
            if self.remote.is_some_and(|remote| remote != from) {
                debug!(from = %from, "Ignoring datagram from unexpected endpoint");
                continue;
            }
            if len > self.max_datagram_size {
                warn!(from = %from, len, "Dropping oversized datagram");
                continue;
            }
            *self.last_peer.lock().unwrap_or_else(|e| e.into_inner()) = Some(from);
            return Ok(Some(Bytes::copy_from_slice(&self.buf[..len])));
        }
    }
}

/// A UDP socket bound to `local`, talking to a fixed `remote` or, when none
/// was given, to whoever sent the most recent datagram.
///
/// UDP cannot tell when a peer has gone away: the channel always reports
/// itself alive and never signals end-of-stream. Send failures are
/// reported per frame and never close the channel.
pub struct UdpChannel {
    core: Arc<ChannelCore>,
    local: SocketAddr,
    remote: Option<SocketAddr>,
    socket: Mutex<Option<Arc<UdpSocket>>>,
    last_peer: Arc<Mutex<Option<SocketAddr>>>,
    max_datagram_size: usize,
}

impl UdpChannel {
    pub fn new(
        local: SocketAddr,
        remote: Option<SocketAddr>,
        role: Role,
        config: &WireConfig,
    ) -> Self {
        let description = match remote {
            Some(remote) => format!("udp {role} {local} -> {remote}"),
            None => format!("udp {role} {local}"),
        };
        Self {
            core: Arc::new(ChannelCore::new(
                role,
                description,
                config.inbound_queue_capacity,
                config.event_capacity,
            )),
            local,
            remote,
            socket: Mutex::new(None),
            last_peer: Arc::new(Mutex::new(None)),
            max_datagram_size: config.max_datagram_size,
        }
    }

    /// Actual bound address once open (resolves port 0).
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.current_socket()
            .and_then(|socket| socket.local_addr().ok())
    }

    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.remote
            .or_else(|| *self.last_peer.lock().unwrap_or_else(|e| e.into_inner()))
    }

    fn current_socket(&self) -> Option<Arc<UdpSocket>> {
        self.socket.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

#[async_trait]
impl Channel for UdpChannel {
    fn core(&self) -> &ChannelCore {
        &self.core
    }

    async fn open(&self) -> Result<(), WireError> {
        if !self.core.begin_open()? {
            return Ok(());
        }
        let socket = match UdpSocket::bind(self.local).await {
            Ok(socket) => Arc::new(socket),
            Err(e) => {
                warn!(local = %self.local, error = %e, "UDP bind failed");
                self.core.fail_open();
                return Err(e.into());
            }
        };
        *self.socket.lock().unwrap_or_else(|e| e.into_inner()) = Some(Arc::clone(&socket));

        let bound = socket.local_addr().ok();
        self.core.spawn_receive_loop(Datagrams {
            socket,
            remote: self.remote,
            last_peer: Arc::clone(&self.last_peer),
            max_datagram_size: self.max_datagram_size,
            buf: vec![0u8; RECV_BUFFER_SIZE],
        });
        self.core.finish_open();
        info!(
            channel = self.core.id(),
            local = ?bound,
            remote = ?self.remote,
            "UDP channel open"
        );
        Ok(())
    }

    async fn close(&self) {
        let began = self.core.begin_close();
        self.socket.lock().unwrap_or_else(|e| e.into_inner()).take();
        if began {
            self.core.finish_close();
        }
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
        let Some(target) = self.remote_addr() else {
            debug!(channel = self.core.id(), "No peer to reply to yet");
            return false;
        };
        let Some(socket) = self.current_socket() else {
            return false;
        };

        match socket.send_to(&bytes, target).await {
            Ok(_) => {
                self.core.emit(ChannelEvent::SentBytes(bytes));
                true
            }
            Err(e) => {
                debug!(channel = self.core.id(), target = %target, error = %e, "UDP send failed");
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
