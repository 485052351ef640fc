//! Handshake declarations and the exchange that runs them.
//!
//! A protocol declares exactly one handshake, either two-way
//! (`leg1 → leg2`) or three-way (`leg1 → leg2 → leg3`). Each leg is a typed
//! message. The side whose channel role matches the declared initiator sends
//! the first leg. Every reply leg carries a [`HandshakeOutcome`] in its
//! envelope, so a rejection is seen by both peers.
//!
//! The side that receives the last leg closes the exchange with a verdict
//! frame: an empty handshake envelope tagged [`VERDICT_TAG`] whose outcome
//! byte is the result of its optional `on_reply` / `finalize` check. The
//! other side does not report ready until that verdict arrives.
//!
//! Callbacks are plain closures over the typed legs. Receivers of later legs
//! are handed the earlier ones, so a callback never needs connection state of
//! its own.

pub mod auth;

use crate::channel::{Channel, Role};
use crate::error::{ProtocolError, RejectionOrigin, WireError};
use crate::frame::{Dispatch, Envelope};
use crate::protocol::Protocol;
use crate::serializer::{expect_message, AnyMessage, Message, MessageType};
use bytes::Bytes;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::debug;

/// Tag of the frame that closes every handshake.
pub const VERDICT_TAG: &str = "duplex.handshake.verdict";

/// Verdict attached to every reply leg.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HandshakeOutcome {
    Accepted,
    Rejected,
    Unauthorized,
    UnsupportedVersion,
    Busy,
}

impl HandshakeOutcome {
    pub fn is_accepted(self) -> bool {
        self == Self::Accepted
    }

    pub(crate) fn code(self) -> u8 {
        match self {
            Self::Accepted => 0,
            Self::Rejected => 1,
            Self::Unauthorized => 2,
            Self::UnsupportedVersion => 3,
            Self::Busy => 4,
        }
    }

    pub(crate) fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(Self::Accepted),
            1 => Some(Self::Rejected),
            2 => Some(Self::Unauthorized),
            3 => Some(Self::UnsupportedVersion),
            4 => Some(Self::Busy),
            _ => None,
        }
    }
}

impl std::fmt::Display for HandshakeOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Accepted => write!(f, "accepted"),
            Self::Rejected => write!(f, "rejected"),
            Self::Unauthorized => write!(f, "unauthorized"),
            Self::UnsupportedVersion => write!(f, "unsupported version"),
            Self::Busy => write!(f, "busy"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeKind {
    TwoWay,
    ThreeWay,
}

type InitiateFn = Box<dyn Fn() -> AnyMessage + Send + Sync>;
type RespondFn =
    Box<dyn Fn(&AnyMessage) -> Result<(AnyMessage, HandshakeOutcome), WireError> + Send + Sync>;
type ConfirmFn = Box<
    dyn Fn(&AnyMessage, &AnyMessage) -> Result<(AnyMessage, HandshakeOutcome), WireError>
        + Send
        + Sync,
>;
type CheckFn =
    Box<dyn Fn(&AnyMessage, &AnyMessage) -> Result<HandshakeOutcome, WireError> + Send + Sync>;

/// A validated, type-erased handshake ready to run.
pub struct HandshakeSpec {
    kind: HandshakeKind,
    initiator: Role,
    legs: Vec<MessageType>,
    initiate: InitiateFn,
    respond: RespondFn,
    /// Three-way only: the initiator's third leg.
    confirm: Option<ConfirmFn>,
    /// Two-way: initiator's check of leg 2. Three-way: receiver's check of leg 3.
    check: Option<CheckFn>,
}

impl HandshakeSpec {
    pub fn kind(&self) -> HandshakeKind {
        self.kind
    }

    pub fn initiator(&self) -> Role {
        self.initiator
    }

    /// Wire tags of the legs, in exchange order.
    pub fn leg_tags(&self) -> Vec<&'static str> {
        self.legs.iter().map(|leg| leg.tag).collect()
    }

    pub(crate) fn legs(&self) -> &[MessageType] {
        &self.legs
    }

    /// Run the exchange over `io.channel` with the given local role.
    pub(crate) async fn run(&self, role: Role, io: &mut LegIo<'_>) -> Result<(), WireError> {
        if role == self.initiator {
            self.run_initiator(io).await
        } else {
            self.run_receiver(io).await
        }
    }

    async fn run_initiator(&self, io: &mut LegIo<'_>) -> Result<(), WireError> {
        let first = (self.initiate)();
        io.send(&self.legs[0], &first, HandshakeOutcome::Accepted)
            .await?;

        let (second, remote) = io.recv(&self.legs[1]).await?;
        reject_unless_accepted(remote, RejectionOrigin::Remote)?;

        match self.kind {
            HandshakeKind::TwoWay => self.conclude(io, &first, &second).await,
            HandshakeKind::ThreeWay => {
                let confirm = self
                    .confirm
                    .as_ref()
                    .ok_or(ProtocolError::IncompleteHandshake("confirm"))?;
                let (third, local) = confirm(&first, &second)?;
                io.send(&self.legs[2], &third, local).await?;
                reject_unless_accepted(local, RejectionOrigin::Local)?;
                reject_unless_accepted(io.recv_verdict().await?, RejectionOrigin::Remote)
            }
        }
    }

    async fn run_receiver(&self, io: &mut LegIo<'_>) -> Result<(), WireError> {
        let (first, _) = io.recv(&self.legs[0]).await?;
        let (second, local) = (self.respond)(&first)?;
        io.send(&self.legs[1], &second, local).await?;
        reject_unless_accepted(local, RejectionOrigin::Local)?;

        match self.kind {
            HandshakeKind::TwoWay => {
                reject_unless_accepted(io.recv_verdict().await?, RejectionOrigin::Remote)
            }
            HandshakeKind::ThreeWay => {
                let (third, remote) = io.recv(&self.legs[2]).await?;
                reject_unless_accepted(remote, RejectionOrigin::Remote)?;
                self.conclude(io, &second, &third).await
            }
        }
    }

    /// Judge the last leg and tell the peer. A check that cannot run is
    /// reported to the peer as `Rejected`.
    async fn conclude(
        &self,
        io: &mut LegIo<'_>,
        earlier: &AnyMessage,
        last: &AnyMessage,
    ) -> Result<(), WireError> {
        let verdict = match &self.check {
            Some(check) => check(earlier, last),
            None => Ok(HandshakeOutcome::Accepted),
        };
        let sent = io
            .send_verdict(*verdict.as_ref().unwrap_or(&HandshakeOutcome::Rejected))
            .await;
        let verdict = verdict?;
        sent?;
        reject_unless_accepted(verdict, RejectionOrigin::Local)
    }
}

fn reject_unless_accepted(
    outcome: HandshakeOutcome,
    origin: RejectionOrigin,
) -> Result<(), WireError> {
    if outcome.is_accepted() {
        Ok(())
    } else {
        Err(WireError::HandshakeRejected { outcome, origin })
    }
}

/// Sends and receives handshake legs directly on the channel.
pub(crate) struct LegIo<'a> {
    pub channel: &'a dyn Channel,
    pub protocol: &'a Protocol,
    pub cancel: watch::Receiver<bool>,
}

impl LegIo<'_> {
    async fn send(
        &mut self,
        leg: &MessageType,
        message: &AnyMessage,
        outcome: HandshakeOutcome,
    ) -> Result<(), WireError> {
        let frame = self
            .protocol
            .encode(Dispatch::Handshake, leg.tag, message, 0, outcome.code())?;
        debug!(channel = self.channel.id(), leg = leg.tag, %outcome, "Sending handshake leg");
        if self.channel.try_send_bytes(frame).await {
            Ok(())
        } else {
            Err(WireError::HandshakeFailed(format!(
                "transport refused handshake leg '{}'",
                leg.tag
            )))
        }
    }

    async fn send_verdict(&mut self, outcome: HandshakeOutcome) -> Result<(), WireError> {
        let frame = Envelope {
            dispatch: Dispatch::Handshake,
            outcome: outcome.code(),
            correlation: 0,
            tag: VERDICT_TAG.to_string(),
            payload: Bytes::new(),
        }
        .encode()?;
        debug!(channel = self.channel.id(), %outcome, "Sending handshake verdict");
        if self.channel.try_send_bytes(frame).await {
            Ok(())
        } else {
            Err(WireError::HandshakeFailed(
                "transport refused handshake verdict".to_string(),
            ))
        }
    }

    async fn recv(
        &mut self,
        leg: &MessageType,
    ) -> Result<(AnyMessage, HandshakeOutcome), WireError> {
        let (envelope, outcome) = self.recv_envelope(leg.tag).await?;
        let message = self.protocol.decode(&envelope)?;
        debug!(channel = self.channel.id(), leg = leg.tag, %outcome, "Received handshake leg");
        Ok((message, outcome))
    }

    async fn recv_verdict(&mut self) -> Result<HandshakeOutcome, WireError> {
        let (_, outcome) = self.recv_envelope(VERDICT_TAG).await?;
        debug!(channel = self.channel.id(), %outcome, "Received handshake verdict");
        Ok(outcome)
    }

    async fn recv_envelope(
        &mut self,
        tag: &str,
    ) -> Result<(Envelope, HandshakeOutcome), WireError> {
        let frame = self
            .channel
            .receive_bytes(&mut self.cancel)
            .await
            .ok_or(WireError::ConnectionClosed)?;
        let envelope = Envelope::decode(frame)?;
        if envelope.dispatch != Dispatch::Handshake || envelope.tag != tag {
            return Err(WireError::HandshakeFailed(format!(
                "expected handshake frame '{tag}', got {} '{}'",
                envelope.dispatch, envelope.tag
            )));
        }
        let outcome = HandshakeOutcome::from_code(envelope.outcome).ok_or_else(|| {
            WireError::HandshakeFailed(format!("unknown outcome code {}", envelope.outcome))
        })?;
        Ok((envelope, outcome))
    }
}

/// Anything that can be registered as a protocol's handshake.
pub trait HandshakeDecl: Send + 'static {
    fn into_spec(self) -> Result<HandshakeSpec, ProtocolError>;
}

impl HandshakeDecl for HandshakeSpec {
    fn into_spec(self) -> Result<HandshakeSpec, ProtocolError> {
        Ok(self)
    }
}

/// Entry point for typed handshake declarations.
pub struct Handshake;

impl Handshake {
    /// `L1` from the initiator, answered by `L2`.
    pub fn two_way<L1: Message, L2: Message>(initiator: Role) -> TwoWay<L1, L2> {
        TwoWay {
            initiator,
            initiate: None,
            respond: None,
            on_reply: None,
        }
    }

    /// `L1` from the initiator, `L2` back, then `L3` from the initiator.
    pub fn three_way<L1: Message, L2: Message, L3: Message>(
        initiator: Role,
    ) -> ThreeWay<L1, L2, L3> {
        ThreeWay {
            initiator,
            initiate: None,
            respond: None,
            confirm: None,
            finalize: None,
        }
    }
}

type Respond<L1, L2> = Box<dyn Fn(&L1) -> (L2, HandshakeOutcome) + Send + Sync>;
type Verify<A, B> = Box<dyn Fn(&A, &B) -> HandshakeOutcome + Send + Sync>;

/// Two-leg handshake declaration.
pub struct TwoWay<L1, L2> {
    initiator: Role,
    initiate: Option<Box<dyn Fn() -> L1 + Send + Sync>>,
    respond: Option<Respond<L1, L2>>,
    on_reply: Option<Verify<L1, L2>>,
}

impl<L1: Message, L2: Message> TwoWay<L1, L2> {
    /// Build the first leg (initiator).
    pub fn initiate(mut self, f: impl Fn() -> L1 + Send + Sync + 'static) -> Self {
        self.initiate = Some(Box::new(f));
        self
    }

    /// Answer the first leg with the second and a verdict (receiver).
    pub fn respond(mut self, f: impl Fn(&L1) -> (L2, HandshakeOutcome) + Send + Sync + 'static) -> Self {
        self.respond = Some(Box::new(f));
        self
    }

    /// Optionally judge the answer (initiator). Without it an accepted
    /// second leg completes the handshake.
    pub fn on_reply(mut self, f: impl Fn(&L1, &L2) -> HandshakeOutcome + Send + Sync + 'static) -> Self {
        self.on_reply = Some(Box::new(f));
        self
    }
}

impl<L1: Message, L2: Message> HandshakeDecl for TwoWay<L1, L2> {
    fn into_spec(self) -> Result<HandshakeSpec, ProtocolError> {
        let initiate = self
            .initiate
            .ok_or(ProtocolError::IncompleteHandshake("initiate"))?;
        let respond = self
            .respond
            .ok_or(ProtocolError::IncompleteHandshake("respond"))?;

        Ok(HandshakeSpec {
            kind: HandshakeKind::TwoWay,
            initiator: self.initiator,
            legs: vec![MessageType::of::<L1>(), MessageType::of::<L2>()],
            initiate: erase_initiate(initiate),
            respond: erase_respond(respond),
            confirm: None,
            check: self.on_reply.map(erase_verify),
        })
    }
}

/// Three-leg handshake declaration.
pub struct ThreeWay<L1, L2, L3> {
    initiator: Role,
    initiate: Option<Box<dyn Fn() -> L1 + Send + Sync>>,
    respond: Option<Respond<L1, L2>>,
    confirm: Option<Box<dyn Fn(&L1, &L2) -> (L3, HandshakeOutcome) + Send + Sync>>,
    finalize: Option<Verify<L2, L3>>,
}

impl<L1: Message, L2: Message, L3: Message> ThreeWay<L1, L2, L3> {
    /// Build the first leg (initiator).
    pub fn initiate(mut self, f: impl Fn() -> L1 + Send + Sync + 'static) -> Self {
        self.initiate = Some(Box::new(f));
        self
    }

    /// Answer the first leg with the second and a verdict (receiver).
    pub fn respond(mut self, f: impl Fn(&L1) -> (L2, HandshakeOutcome) + Send + Sync + 'static) -> Self {
        self.respond = Some(Box::new(f));
        self
    }

    /// Judge the second leg and produce the third (initiator).
    pub fn confirm(
        mut self,
        f: impl Fn(&L1, &L2) -> (L3, HandshakeOutcome) + Send + Sync + 'static,
    ) -> Self {
        self.confirm = Some(Box::new(f));
        self
    }

    /// Optionally judge the third leg (receiver).
    pub fn finalize(mut self, f: impl Fn(&L2, &L3) -> HandshakeOutcome + Send + Sync + 'static) -> Self {
        self.finalize = Some(Box::new(f));
        self
    }
}

impl<L1: Message, L2: Message, L3: Message> HandshakeDecl for ThreeWay<L1, L2, L3> {
    fn into_spec(self) -> Result<HandshakeSpec, ProtocolError> {
        let initiate = self
            .initiate
            .ok_or(ProtocolError::IncompleteHandshake("initiate"))?;
        let respond = self
            .respond
            .ok_or(ProtocolError::IncompleteHandshake("respond"))?;
        let confirm = self
            .confirm
            .ok_or(ProtocolError::IncompleteHandshake("confirm"))?;

        let confirm: ConfirmFn = Box::new(move |first: &AnyMessage, second: &AnyMessage| {
            let (third, outcome) = confirm(expect_message::<L1>(first)?, expect_message::<L2>(second)?);
            Ok((Arc::new(third) as AnyMessage, outcome))
        });

        Ok(HandshakeSpec {
            kind: HandshakeKind::ThreeWay,
            initiator: self.initiator,
            legs: vec![
                MessageType::of::<L1>(),
                MessageType::of::<L2>(),
                MessageType::of::<L3>(),
            ],
            initiate: erase_initiate(initiate),
            respond: erase_respond(respond),
            confirm: Some(confirm),
            check: self.finalize.map(erase_verify),
        })
    }
}

fn erase_initiate<L1: Message>(f: Box<dyn Fn() -> L1 + Send + Sync>) -> InitiateFn {
    Box::new(move || Arc::new(f()) as AnyMessage)
}

fn erase_respond<L1: Message, L2: Message>(f: Respond<L1, L2>) -> RespondFn {
    Box::new(move |first: &AnyMessage| {
        let (second, outcome) = f(expect_message::<L1>(first)?);
        Ok((Arc::new(second) as AnyMessage, outcome))
    })
}

fn erase_verify<A: Message, B: Message>(f: Verify<A, B>) -> CheckFn {
    Box::new(move |a: &AnyMessage, b: &AnyMessage| Ok(f(expect_message::<A>(a)?, expect_message::<B>(b)?)))
}
