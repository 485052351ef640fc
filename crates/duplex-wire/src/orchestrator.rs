//! Per-channel protocol driver.
//!
//! An [`Orchestrator`] binds one [`Channel`] to one [`Protocol`]:
//!
//! 1. `start()` opens the channel and runs the handshake inline;
//! 2. on success it spawns a writer task (draining the outbound queue) and a
//!    dispatch task (decoding inbound frames and invoking handlers);
//! 3. `finish()` stops dispatch after the in-flight message, flushes queued
//!    sends and closes the channel.
//!
//! Handlers run on the dispatch task one at a time, in arrival order. A
//! handler that fails or panics is reported through
//! [`OrchestratorEvent::MessageError`] and dispatch carries on.

use crate::channel::Channel;
use crate::config::WireConfig;
use crate::error::{DispatchError, HandlerError, WireError};
use crate::frame::{Dispatch, Envelope, EnvelopeHeader};
use crate::handshake::LegIo;
use crate::protocol::Protocol;
use crate::serializer::{AnyMessage, Message};
use bytes::Bytes;
use dashmap::DashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Orchestrator lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrchestratorState {
    Created,
    Handshaking,
    Ready,
    Running,
    Finishing,
    Finished,
    Faulted,
}

impl OrchestratorState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Finished | Self::Faulted)
    }
}

impl std::fmt::Display for OrchestratorState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Created => "created",
            Self::Handshaking => "handshaking",
            Self::Ready => "ready",
            Self::Running => "running",
            Self::Finishing => "finishing",
            Self::Finished => "finished",
            Self::Faulted => "faulted",
        };
        f.write_str(name)
    }
}

/// Notifications published by an orchestrator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OrchestratorEvent {
    StateChanged {
        from: OrchestratorState,
        to: OrchestratorState,
    },
    /// An ordinary message arrived and is about to be dispatched.
    ReceivedMessage(EnvelopeHeader),
    /// An ordinary message was handed to the transport.
    SentMessage(EnvelopeHeader),
    /// A single message could not be processed. The header is absent when
    /// the frame itself could not be decoded.
    MessageError {
        header: Option<EnvelopeHeader>,
        error: DispatchError,
    },
}

struct PendingRequest {
    request_tag: &'static str,
    request: AnyMessage,
}

struct Outbound {
    header: EnvelopeHeader,
    frame: Bytes,
}

/// Drives the handshake and message dispatch for one channel.
pub struct Orchestrator {
    session: Uuid,
    channel: Arc<dyn Channel>,
    protocol: Arc<Protocol>,
    config: WireConfig,
    state: watch::Sender<OrchestratorState>,
    events: broadcast::Sender<OrchestratorEvent>,
    outbound: Mutex<Option<mpsc::UnboundedSender<Outbound>>>,
    pending: DashMap<u64, PendingRequest>,
    next_correlation: AtomicU64,
    shutdown: watch::Sender<bool>,
    last_error: Mutex<Option<String>>,
}

impl Orchestrator {
    pub fn new(channel: Arc<dyn Channel>, protocol: Arc<Protocol>, config: WireConfig) -> Arc<Self> {
        let (state, _) = watch::channel(OrchestratorState::Created);
        let (events, _) = broadcast::channel(config.event_capacity.max(1));
        let (shutdown, _) = watch::channel(false);
        Arc::new(Self {
            session: Uuid::new_v4(),
            channel,
            protocol,
            config,
            state,
            events,
            outbound: Mutex::new(None),
            pending: DashMap::new(),
            next_correlation: AtomicU64::new(1),
            shutdown,
            last_error: Mutex::new(None),
        })
    }

    /// Random id used to tell orchestrators apart in logs.
    pub fn session_id(&self) -> Uuid {
        self.session
    }

    pub fn state(&self) -> OrchestratorState {
        *self.state.borrow()
    }

    pub fn channel(&self) -> &Arc<dyn Channel> {
        &self.channel
    }

    pub fn protocol(&self) -> &Arc<Protocol> {
        &self.protocol
    }

    pub fn subscribe(&self) -> broadcast::Receiver<OrchestratorEvent> {
        self.events.subscribe()
    }

    /// Description of the error that faulted this orchestrator.
    pub fn last_error(&self) -> Option<String> {
        self.last_error
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Requests still waiting for their response.
    pub fn pending_requests(&self) -> usize {
        self.pending.len()
    }

    fn emit(&self, event: OrchestratorEvent) {
        let _ = self.events.send(event);
    }

    fn transition(&self, to: OrchestratorState) {
        let from = self.state.send_replace(to);
        if from != to {
            debug!(session = %self.session, %from, %to, "Orchestrator state change");
            self.emit(OrchestratorEvent::StateChanged { from, to });
        }
    }

    fn transition_from(&self, expected: OrchestratorState, to: OrchestratorState) -> bool {
        let moved = self.state.send_if_modified(|state| {
            if *state == expected {
                *state = to;
                true
            } else {
                false
            }
        });
        if moved {
            debug!(session = %self.session, from = %expected, %to, "Orchestrator state change");
            self.emit(OrchestratorEvent::StateChanged { from: expected, to });
        }
        moved
    }

    /// Open the channel, complete the handshake and start dispatching.
    ///
    /// A failed or rejected handshake faults the orchestrator, closes the
    /// channel and is returned here.
    pub async fn start(self: &Arc<Self>) -> Result<(), WireError> {
        if !self.transition_from(OrchestratorState::Created, OrchestratorState::Handshaking) {
            return Err(WireError::InvalidState {
                current: self.state().to_string(),
                operation: "start",
            });
        }

        if let Err(e) = self.channel.open().await {
            self.fault(&e).await;
            return Err(e);
        }

        let handshake = self.run_handshake();
        let result = match self.config.handshake_timeout() {
            Some(limit) => tokio::time::timeout(limit, handshake)
                .await
                .unwrap_or(Err(WireError::HandshakeTimeout)),
            None => handshake.await,
        };
        if let Err(e) = result {
            self.fault(&e).await;
            return Err(e);
        }

        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        *self.outbound.lock().unwrap_or_else(|e| e.into_inner()) = Some(outbound_tx);
        self.transition(OrchestratorState::Ready);
        info!(
            session = %self.session,
            channel = self.channel.id(),
            desc = %self.channel.description(),
            "Handshake complete"
        );

        self.transition(OrchestratorState::Running);
        let writer = tokio::spawn(Arc::clone(self).write_loop(outbound_rx));
        tokio::spawn(Arc::clone(self).dispatch_loop(writer));
        Ok(())
    }

    async fn run_handshake(&self) -> Result<(), WireError> {
        let mut io = LegIo {
            channel: self.channel.as_ref(),
            protocol: &self.protocol,
            cancel: self.shutdown.subscribe(),
        };
        self.protocol
            .handshake()
            .run(self.channel.role(), &mut io)
            .await
    }

    async fn fault(&self, error: &WireError) {
        warn!(
            session = %self.session,
            channel = self.channel.id(),
            error = %error,
            "Orchestrator faulted"
        );
        *self.last_error.lock().unwrap_or_else(|e| e.into_inner()) = Some(error.to_string());
        self.outbound.lock().unwrap_or_else(|e| e.into_inner()).take();
        self.channel.close().await;
        self.pending.clear();
        self.transition(OrchestratorState::Faulted);
    }

    async fn write_loop(self: Arc<Self>, mut outbound: mpsc::UnboundedReceiver<Outbound>) {
        while let Some(Outbound { header, frame }) = outbound.recv().await {
            if self.channel.try_send_bytes(frame).await {
                self.emit(OrchestratorEvent::SentMessage(header));
            } else {
                warn!(session = %self.session, tag = %header.tag, "Transport refused message");
                let error = DispatchError::SendFailed {
                    tag: header.tag.clone(),
                };
                if header.dispatch == Dispatch::Request {
                    self.pending.remove(&header.correlation);
                }
                self.emit(OrchestratorEvent::MessageError {
                    header: Some(header),
                    error,
                });
            }
        }
    }

    async fn dispatch_loop(self: Arc<Self>, writer: JoinHandle<()>) {
        let mut cancel = self.shutdown.subscribe();
        while let Some(frame) = self.channel.receive_bytes(&mut cancel).await {
            self.dispatch(frame);
        }

        if *cancel.borrow() {
            debug!(session = %self.session, "Finish requested, stopping dispatch");
        } else {
            debug!(session = %self.session, "Transport ended, stopping dispatch");
        }
        self.transition(OrchestratorState::Finishing);
        self.outbound.lock().unwrap_or_else(|e| e.into_inner()).take();
        let _ = writer.await;
        self.channel.close().await;
        self.pending.clear();
        info!(session = %self.session, channel = self.channel.id(), "Orchestrator finished");
        self.transition(OrchestratorState::Finished);
    }

    fn dispatch(&self, frame: Bytes) {
        let envelope = match Envelope::decode(frame) {
            Ok(envelope) => envelope,
            Err(e) => {
                self.report(None, DispatchError::Decode(e.to_string()));
                return;
            }
        };
        let header = envelope.header();
        self.emit(OrchestratorEvent::ReceivedMessage(header.clone()));

        let result = match envelope.dispatch {
            Dispatch::Request => self.dispatch_request(&envelope),
            Dispatch::Response => self.dispatch_response(&envelope),
            Dispatch::Command => self.dispatch_command(&envelope),
            Dispatch::Handshake => Err(DispatchError::UnexpectedHandshake {
                tag: envelope.tag.clone(),
            }),
        };
        if let Err(error) = result {
            self.report(Some(header), error);
        }
    }

    fn report(&self, header: Option<EnvelopeHeader>, error: DispatchError) {
        warn!(session = %self.session, error = %error, "Message not processed");
        self.emit(OrchestratorEvent::MessageError { header, error });
    }

    fn decode_payload(&self, envelope: &Envelope) -> Result<AnyMessage, DispatchError> {
        self.protocol
            .decode(envelope)
            .map_err(|e| DispatchError::Decode(e.to_string()))
    }

    fn dispatch_request(&self, envelope: &Envelope) -> Result<(), DispatchError> {
        let handler = self
            .protocol
            .request_handler(&envelope.tag)
            .ok_or_else(|| DispatchError::Unhandled {
                tag: envelope.tag.clone(),
                dispatch: Dispatch::Request,
            })?;
        let request = self.decode_payload(envelope)?;
        let response = invoke(&envelope.tag, || (handler.call)(self, &request))?;
        self.enqueue(
            Dispatch::Response,
            handler.response_tag,
            &response,
            envelope.correlation,
        )
        .map_err(|e| DispatchError::Serialize {
            tag: handler.response_tag.to_string(),
            reason: e.to_string(),
        })
    }

    fn dispatch_response(&self, envelope: &Envelope) -> Result<(), DispatchError> {
        let (_, pending) = self.pending.remove(&envelope.correlation).ok_or_else(|| {
            DispatchError::UnsolicitedResponse {
                tag: envelope.tag.clone(),
                correlation: envelope.correlation,
            }
        })?;
        let handler = self
            .protocol
            .response_handler(pending.request_tag, &envelope.tag)
            .ok_or_else(|| DispatchError::Unhandled {
                tag: envelope.tag.clone(),
                dispatch: Dispatch::Response,
            })?;
        let response = self.decode_payload(envelope)?;
        invoke(&envelope.tag, || handler(self, &pending.request, &response))
    }

    fn dispatch_command(&self, envelope: &Envelope) -> Result<(), DispatchError> {
        let handler = self
            .protocol
            .command_handler(&envelope.tag)
            .ok_or_else(|| DispatchError::Unhandled {
                tag: envelope.tag.clone(),
                dispatch: Dispatch::Command,
            })?;
        let command = self.decode_payload(envelope)?;
        invoke(&envelope.tag, || handler(self, &command))
    }

    fn ensure_ready(&self) -> Result<(), WireError> {
        match self.state() {
            OrchestratorState::Ready | OrchestratorState::Running => Ok(()),
            _ => Err(WireError::NotReady),
        }
    }

    fn enqueue(
        &self,
        dispatch: Dispatch,
        tag: &'static str,
        message: &AnyMessage,
        correlation: u64,
    ) -> Result<(), WireError> {
        let frame = self.protocol.encode(dispatch, tag, message, correlation, 0)?;
        let outbound = self.outbound.lock().unwrap_or_else(|e| e.into_inner());
        let sender = outbound.as_ref().ok_or(WireError::NotReady)?;
        sender
            .send(Outbound {
                header: EnvelopeHeader {
                    dispatch,
                    correlation,
                    tag: tag.to_string(),
                },
                frame,
            })
            .map_err(|_| WireError::ConnectionClosed)
    }

    /// Queue a request. Returns its correlation id.
    ///
    /// If the protocol has a response handler for `T`, the request is kept
    /// until the matching response arrives. At most `max_pending_requests`
    /// are kept; older ones are evicted and reported as `RequestEvicted`.
    pub fn send_request<T: Message>(&self, request: T) -> Result<u64, WireError> {
        self.ensure_ready()?;
        let correlation = self.next_correlation.fetch_add(1, Ordering::Relaxed);
        let message: AnyMessage = Arc::new(request);
        if self.protocol.expects_response(T::TAG) {
            self.evict_oldest_pending(self.config.max_pending_requests.max(1) - 1);
            self.pending.insert(
                correlation,
                PendingRequest {
                    request_tag: T::TAG,
                    request: Arc::clone(&message),
                },
            );
        }
        if let Err(e) = self.enqueue(Dispatch::Request, T::TAG, &message, correlation) {
            self.pending.remove(&correlation);
            return Err(e);
        }
        Ok(correlation)
    }

    /// Drop the oldest pending requests until at most `keep` remain.
    /// Correlation ids grow monotonically, so the smallest id is the oldest.
    fn evict_oldest_pending(&self, keep: usize) {
        while self.pending.len() > keep {
            let Some(oldest) = self.pending.iter().map(|entry| *entry.key()).min() else {
                return;
            };
            if let Some((correlation, stale)) = self.pending.remove(&oldest) {
                let tag = stale.request_tag.to_string();
                self.report(
                    Some(EnvelopeHeader {
                        dispatch: Dispatch::Request,
                        correlation,
                        tag: tag.clone(),
                    }),
                    DispatchError::RequestEvicted { tag, correlation },
                );
            }
        }
    }

    /// Queue a one-way command.
    pub fn send_command<T: Message>(&self, command: T) -> Result<(), WireError> {
        self.ensure_ready()?;
        let message: AnyMessage = Arc::new(command);
        self.enqueue(Dispatch::Command, T::TAG, &message, 0)
    }

    /// Queue `message` with an explicit dispatch class. Returns the
    /// correlation id for requests.
    ///
    /// Responses are produced by request handlers and handshake legs by the
    /// handshake, so neither can be sent this way.
    pub fn send_message<T: Message>(
        &self,
        dispatch: Dispatch,
        message: T,
    ) -> Result<Option<u64>, WireError> {
        match dispatch {
            Dispatch::Request => self.send_request(message).map(Some),
            Dispatch::Command => self.send_command(message).map(|()| None),
            Dispatch::Response | Dispatch::Handshake => Err(WireError::Unsupported(format!(
                "cannot send a {dispatch} message directly"
            ))),
        }
    }

    /// Ask the dispatch loop to stop after the in-flight message. Callable
    /// from handlers.
    pub fn request_finish(&self) {
        self.shutdown.send_replace(true);
    }

    /// Stop dispatch, flush queued sends, close the channel and wait until
    /// the orchestrator is `Finished` (or `Faulted`).
    pub async fn finish(&self) -> OrchestratorState {
        self.request_finish();
        if self.transition_from(OrchestratorState::Created, OrchestratorState::Finishing) {
            self.channel.close().await;
            self.transition(OrchestratorState::Finished);
        }
        self.terminated().await
    }

    /// Wait until the peer closes the transport (or `finish` is called).
    ///
    /// Fails immediately on transports that cannot signal end-of-stream.
    pub async fn run_to_end(&self) -> Result<OrchestratorState, WireError> {
        if !self.channel.signals_end_of_stream() {
            return Err(WireError::Unsupported(format!(
                "{} cannot detect peer closure; use finish()",
                self.channel.description()
            )));
        }
        Ok(self.terminated().await)
    }

    /// Wait until the orchestrator is `Finished` or `Faulted`, whatever ends
    /// it: `finish`, a handler calling `request_finish`, or the transport.
    pub async fn terminated(&self) -> OrchestratorState {
        let mut state = self.state.subscribe();
        loop {
            let current = *state.borrow_and_update();
            if current.is_terminal() {
                return current;
            }
            if state.changed().await.is_err() {
                return self.state();
            }
        }
    }
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator")
            .field("session", &self.session)
            .field("channel", &self.channel.description())
            .field("state", &self.state())
            .field("pending", &self.pending.len())
            .finish()
    }
}

/// Run a handler, turning errors and panics into dispatch errors.
fn invoke<T>(
    tag: &str,
    handler: impl FnOnce() -> Result<T, HandlerError>,
) -> Result<T, DispatchError> {
    match catch_unwind(AssertUnwindSafe(handler)) {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(e)) => Err(DispatchError::Handler {
            tag: tag.to_string(),
            reason: e.to_string(),
        }),
        Err(_) => Err(DispatchError::Panicked {
            tag: tag.to_string(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::{ChannelCore, Role};
    use crate::handshake::{Handshake, HandshakeOutcome};
    use async_trait::async_trait;
    use serde::{Deserialize, Serialize};

    #[derive(Debug, Serialize, Deserialize)]
    struct Hello;
    impl Message for Hello {
        const TAG: &'static str = "hello";
    }

    #[derive(Debug, Serialize, Deserialize)]
    struct Welcome;
    impl Message for Welcome {
        const TAG: &'static str = "welcome";
    }

    #[derive(Debug, Serialize, Deserialize)]
    struct Note(String);
    impl Message for Note {
        const TAG: &'static str = "note";
    }

    /// A channel that never opens a real transport.
    struct Inert {
        core: ChannelCore,
    }

    #[async_trait]
    impl Channel for Inert {
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
            if self.core.begin_close() {
                self.core.finish_close();
            }
        }
        async fn try_send_bytes(&self, _bytes: Bytes) -> bool {
            true
        }
        fn is_connection_alive(&self) -> bool {
            true
        }
        fn signals_end_of_stream(&self) -> bool {
            false
        }
    }

    fn orchestrator() -> Arc<Orchestrator> {
        let protocol = Protocol::builder()
            .handshake(
                Handshake::two_way::<Hello, Welcome>(Role::Client)
                    .initiate(|| Hello)
                    .respond(|_| (Welcome, HandshakeOutcome::Accepted)),
            )
            .json::<Hello>()
            .json::<Welcome>()
            .json::<Note>()
            .build()
            .unwrap();
        let channel = Arc::new(Inert {
            core: ChannelCore::new(Role::Client, "inert".into(), 4, 4),
        });
        Orchestrator::new(channel, protocol, WireConfig::default())
    }

    #[test]
    fn test_send_before_handshake_is_not_ready() {
        let orch = orchestrator();
        assert_eq!(orch.state(), OrchestratorState::Created);
        assert!(matches!(
            orch.send_command(Note("early".into())),
            Err(WireError::NotReady)
        ));
        assert!(matches!(
            orch.send_request(Note("early".into())),
            Err(WireError::NotReady)
        ));
    }

    #[test]
    fn test_send_message_refuses_responses() {
        let orch = orchestrator();
        assert!(matches!(
            orch.send_message(Dispatch::Response, Note("x".into())),
            Err(WireError::Unsupported(_))
        ));
    }

    #[tokio::test]
    async fn test_finish_before_start() {
        let orch = orchestrator();
        let mut events = orch.subscribe();
        assert_eq!(orch.finish().await, OrchestratorState::Finished);
        assert!(matches!(
            orch.start().await,
            Err(WireError::InvalidState { operation: "start", .. })
        ));
        assert_eq!(
            events.try_recv().unwrap(),
            OrchestratorEvent::StateChanged {
                from: OrchestratorState::Created,
                to: OrchestratorState::Finishing
            }
        );
    }

    #[tokio::test]
    async fn test_run_to_end_unsupported_without_end_of_stream() {
        let orch = orchestrator();
        assert!(matches!(
            orch.run_to_end().await,
            Err(WireError::Unsupported(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_silent_peer_times_out_handshake() {
        let orch = orchestrator();
        let err = orch.start().await.unwrap_err();
        assert!(matches!(err, WireError::HandshakeTimeout));
        assert_eq!(orch.state(), OrchestratorState::Faulted);
        assert!(orch.last_error().unwrap().contains("timed out"));
        assert_eq!(orch.channel().state(), crate::channel::ChannelState::Closed);
    }

    #[test]
    fn test_invoke_catches_errors_and_panics() {
        let ok: Result<u8, DispatchError> = invoke("t", || Ok(7));
        assert_eq!(ok.unwrap(), 7);

        let failed = invoke::<()>("t", || Err("boom".into()));
        assert_eq!(
            failed.unwrap_err(),
            DispatchError::Handler {
                tag: "t".into(),
                reason: "boom".into()
            }
        );

        let panicked = invoke::<()>("t", || panic!("handler bug"));
        assert_eq!(panicked.unwrap_err(), DispatchError::Panicked { tag: "t".into() });
    }
}
