//! Protocol definition: handshake, handlers and serializers.
//!
//! A [`Protocol`] is built once, validated eagerly, and shared read-only by
//! every orchestrator that speaks it:
//!
//! ```ignore
//! let protocol = Protocol::builder()
//!     .handshake(Handshake::two_way::<Hello, Welcome>(Role::Client)
//!         .initiate(|| Hello)
//!         .respond(|_| (Welcome, HandshakeOutcome::Accepted)))
//!     .on_request(|_orch, ping: &Ping| Ok(Pong { seq: ping.seq }))
//!     .on_response(|_orch, _ping: &Ping, pong: &Pong| { println!("{}", pong.seq); Ok(()) })
//!     .json::<Hello>()
//!     .json::<Welcome>()
//!     .json::<Ping>()
//!     .json::<Pong>()
//!     .build()?;
//! ```

use crate::error::{HandlerError, ProtocolError, WireError};
use crate::frame::{Dispatch, Envelope};
use crate::handshake::auth::{self, AuthAck, AuthConfig, AuthConfirm, AuthHello};
use crate::handshake::{HandshakeDecl, HandshakeSpec};
use crate::orchestrator::Orchestrator;
use crate::serializer::{expect_message, AnyMessage, Json, Message, MessageSerializer, MessageType, MsgPack};
use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

pub(crate) type RequestFn =
    Box<dyn Fn(&Orchestrator, &AnyMessage) -> Result<AnyMessage, HandlerError> + Send + Sync>;
pub(crate) type ResponseFn = Box<
    dyn Fn(&Orchestrator, &AnyMessage, &AnyMessage) -> Result<(), HandlerError> + Send + Sync,
>;
pub(crate) type CommandFn =
    Box<dyn Fn(&Orchestrator, &AnyMessage) -> Result<(), HandlerError> + Send + Sync>;

/// A request handler and the tag of the response it produces.
pub(crate) struct RequestHandler {
    pub response_tag: &'static str,
    pub call: RequestFn,
}

/// An immutable, validated protocol definition.
pub struct Protocol {
    handshake: HandshakeSpec,
    requests: HashMap<&'static str, RequestHandler>,
    /// Keyed by request tag, then response tag.
    responses: HashMap<&'static str, HashMap<&'static str, ResponseFn>>,
    commands: HashMap<&'static str, CommandFn>,
    serializers: HashMap<&'static str, Box<dyn MessageSerializer>>,
}

impl Protocol {
    pub fn builder() -> ProtocolBuilder {
        ProtocolBuilder::default()
    }

    pub fn handshake(&self) -> &HandshakeSpec {
        &self.handshake
    }

    /// Whether a request with this tag has at least one response handler,
    /// i.e. whether sending it records a pending correlation entry.
    pub fn expects_response(&self, request_tag: &str) -> bool {
        self.responses.contains_key(request_tag)
    }

    pub fn handles_request(&self, tag: &str) -> bool {
        self.requests.contains_key(tag)
    }

    pub fn handles_command(&self, tag: &str) -> bool {
        self.commands.contains_key(tag)
    }

    /// Every tag with a registered serializer.
    pub fn message_tags(&self) -> Vec<&'static str> {
        let mut tags: Vec<_> = self.serializers.keys().copied().collect();
        tags.sort_unstable();
        tags
    }

    pub(crate) fn request_handler(&self, tag: &str) -> Option<&RequestHandler> {
        self.requests.get(tag)
    }

    pub(crate) fn response_handler(&self, request_tag: &str, response_tag: &str) -> Option<&ResponseFn> {
        self.responses.get(request_tag)?.get(response_tag)
    }

    pub(crate) fn command_handler(&self, tag: &str) -> Option<&CommandFn> {
        self.commands.get(tag)
    }

    fn serializer(&self, tag: &str) -> Result<&dyn MessageSerializer, WireError> {
        self.serializers
            .get(tag)
            .map(|s| s.as_ref())
            .ok_or_else(|| WireError::MissingSerializer(tag.to_string()))
    }

    /// Serialize `message` and wrap it in an encoded envelope.
    pub(crate) fn encode(
        &self,
        dispatch: Dispatch,
        tag: &str,
        message: &AnyMessage,
        correlation: u64,
        outcome: u8,
    ) -> Result<Bytes, WireError> {
        let payload = self.serializer(tag)?.serialize(&**message)?;
        Envelope {
            dispatch,
            outcome,
            correlation,
            tag: tag.to_string(),
            payload: Bytes::from(payload),
        }
        .encode()
    }

    /// Deserialize an envelope's payload with the serializer for its tag.
    pub(crate) fn decode(&self, envelope: &Envelope) -> Result<AnyMessage, WireError> {
        self.serializer(&envelope.tag)?.deserialize(&envelope.payload)
    }
}

impl std::fmt::Debug for Protocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Protocol")
            .field("handshake", &self.handshake.leg_tags())
            .field("requests", &self.requests.keys().collect::<Vec<_>>())
            .field("commands", &self.commands.keys().collect::<Vec<_>>())
            .field("serializers", &self.message_tags())
            .finish()
    }
}

struct RequestEntry {
    request: MessageType,
    response: MessageType,
    call: RequestFn,
}

struct ResponseEntry {
    response: MessageType,
    request: MessageType,
    call: ResponseFn,
}

struct CommandEntry {
    command: MessageType,
    call: CommandFn,
}

struct SerializerEntry {
    message: MessageType,
    serializer: Box<dyn MessageSerializer>,
}

/// Collects a protocol definition; [`build`](Self::build) validates it.
///
/// Registration order is free. All errors are reported by `build`.
#[derive(Default)]
pub struct ProtocolBuilder {
    handshakes: Vec<Result<HandshakeSpec, ProtocolError>>,
    requests: Vec<RequestEntry>,
    responses: Vec<ResponseEntry>,
    commands: Vec<CommandEntry>,
    serializers: Vec<SerializerEntry>,
}

impl ProtocolBuilder {
    /// Declare the handshake. Exactly one is required.
    pub fn handshake(mut self, declaration: impl HandshakeDecl) -> Self {
        self.handshakes.push(declaration.into_spec());
        self
    }

    /// Use the pre-shared-key handshake from [`auth`] and register JSON
    /// serializers for its three legs.
    pub fn authenticated_handshake(mut self, config: AuthConfig) -> Self {
        match auth::handshake(config) {
            Ok(decl) => self = self.handshake(decl),
            Err(e) => self.handshakes.push(Err(e)),
        }
        self.json::<AuthHello>()
            .json::<AuthAck>()
            .json::<AuthConfirm>()
    }

    /// Answer `Req` with `Resp`.
    pub fn on_request<Req, Resp, F>(mut self, handler: F) -> Self
    where
        Req: Message,
        Resp: Message,
        F: Fn(&Orchestrator, &Req) -> Result<Resp, HandlerError> + Send + Sync + 'static,
    {
        let call: RequestFn = Box::new(move |orchestrator: &Orchestrator, message: &AnyMessage| {
            let request = expect_message::<Req>(message)?;
            let response = handler(orchestrator, request)?;
            Ok(Arc::new(response) as AnyMessage)
        });
        self.requests.push(RequestEntry {
            request: MessageType::of::<Req>(),
            response: MessageType::of::<Resp>(),
            call,
        });
        self
    }

    /// Handle a `Resp` arriving for an earlier `Req` of ours. The handler
    /// receives the original request alongside the response.
    pub fn on_response<Resp, Req, F>(mut self, handler: F) -> Self
    where
        Resp: Message,
        Req: Message,
        F: Fn(&Orchestrator, &Req, &Resp) -> Result<(), HandlerError> + Send + Sync + 'static,
    {
        let call: ResponseFn = Box::new(
            move |orchestrator: &Orchestrator, request: &AnyMessage, response: &AnyMessage| {
                handler(
                    orchestrator,
                    expect_message::<Req>(request)?,
                    expect_message::<Resp>(response)?,
                )
            },
        );
        self.responses.push(ResponseEntry {
            response: MessageType::of::<Resp>(),
            request: MessageType::of::<Req>(),
            call,
        });
        self
    }

    /// Handle a one-way `Cmd`.
    pub fn on_command<Cmd, F>(mut self, handler: F) -> Self
    where
        Cmd: Message,
        F: Fn(&Orchestrator, &Cmd) -> Result<(), HandlerError> + Send + Sync + 'static,
    {
        let call: CommandFn = Box::new(move |orchestrator: &Orchestrator, message: &AnyMessage| {
            handler(orchestrator, expect_message::<Cmd>(message)?)
        });
        self.commands.push(CommandEntry {
            command: MessageType::of::<Cmd>(),
            call,
        });
        self
    }

    /// Register a serializer for `T`.
    pub fn message<T: Message>(mut self, serializer: impl MessageSerializer) -> Self {
        self.serializers.push(SerializerEntry {
            message: MessageType::of::<T>(),
            serializer: Box::new(serializer),
        });
        self
    }

    /// Register a JSON serializer for `T`.
    pub fn json<T>(self) -> Self
    where
        T: Message + Serialize + DeserializeOwned,
    {
        self.message::<T>(Json::<T>::new())
    }

    /// Register a MessagePack serializer for `T`.
    pub fn msgpack<T>(self) -> Self
    where
        T: Message + Serialize + DeserializeOwned,
    {
        self.message::<T>(MsgPack::<T>::new())
    }

    /// Validate and freeze the definition.
    pub fn build(self) -> Result<Arc<Protocol>, ProtocolError> {
        let mut handshakes = self.handshakes.into_iter();
        let handshake = match (handshakes.next(), handshakes.next()) {
            (None, _) => return Err(ProtocolError::MissingHandshake),
            (Some(_), Some(_)) => return Err(ProtocolError::DuplicateHandshake),
            (Some(spec), None) => spec?,
        };

        let mut known: HashMap<&'static str, MessageType> = HashMap::new();
        let mut serializers: HashMap<&'static str, Box<dyn MessageSerializer>> = HashMap::new();
        for entry in self.serializers {
            let tag = entry.message.tag;
            if let Some(existing) = known.get(tag) {
                return Err(if existing.type_id == entry.message.type_id {
                    ProtocolError::DuplicateSerializer(tag.to_string())
                } else {
                    ProtocolError::TagConflict(tag.to_string())
                });
            }
            known.insert(tag, entry.message);
            serializers.insert(tag, entry.serializer);
        }

        let check = |message: &MessageType, referenced_by: &'static str| -> Result<(), ProtocolError> {
            match known.get(message.tag) {
                None => Err(ProtocolError::MissingSerializer {
                    tag: message.tag.to_string(),
                    referenced_by,
                }),
                Some(registered) if registered.type_id != message.type_id => {
                    Err(ProtocolError::TagConflict(message.tag.to_string()))
                }
                Some(_) => Ok(()),
            }
        };

        let mut leg_tags = HashSet::new();
        for leg in handshake.legs() {
            check(leg, "the handshake")?;
            if !leg_tags.insert(leg.tag) {
                return Err(ProtocolError::TagConflict(leg.tag.to_string()));
            }
        }

        let mut requests = HashMap::new();
        for entry in self.requests {
            check(&entry.request, "a request handler")?;
            check(&entry.response, "a request handler")?;
            let tag = entry.request.tag;
            if requests.contains_key(tag) {
                return Err(ProtocolError::DuplicateHandler {
                    section: "request",
                    tag: tag.to_string(),
                });
            }
            requests.insert(
                tag,
                RequestHandler {
                    response_tag: entry.response.tag,
                    call: entry.call,
                },
            );
        }

        let mut responses: HashMap<&'static str, HashMap<&'static str, ResponseFn>> = HashMap::new();
        for entry in self.responses {
            check(&entry.response, "a response handler")?;
            check(&entry.request, "a response handler")?;
            let by_response = responses.entry(entry.request.tag).or_default();
            if by_response.contains_key(entry.response.tag) {
                return Err(ProtocolError::DuplicateHandler {
                    section: "response",
                    tag: format!("{} for {}", entry.response.tag, entry.request.tag),
                });
            }
            by_response.insert(entry.response.tag, entry.call);
        }

        let mut commands = HashMap::new();
        for entry in self.commands {
            check(&entry.command, "a command handler")?;
            let tag = entry.command.tag;
            if commands.contains_key(tag) {
                return Err(ProtocolError::DuplicateHandler {
                    section: "command",
                    tag: tag.to_string(),
                });
            }
            commands.insert(tag, entry.call);
        }

        Ok(Arc::new(Protocol {
            handshake,
            requests,
            responses,
            commands,
            serializers,
        }))
    }
}
