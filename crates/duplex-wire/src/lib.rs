//! Duplex wire: transport-agnostic, handshake-gated message exchange.
//!
//! Two peers connected by any duplex transport run a declared handshake and
//! then exchange typed requests, responses and commands, each routed to the
//! handler registered for its type.
//!
//! ## Architecture
//!
//! - **Channel**: One logical connection over TCP, UDP or an anonymous pipe
//! - **UdpServer**: Demultiplexes one UDP socket into a channel per endpoint
//! - **Protocol**: Validated set of handshake, handlers and serializers
//! - **Orchestrator**: Runs the handshake, then dispatches inbound messages
//! - **EndpointPolicy**: Ban list, channel limit and datagram quota for servers

pub mod channel;
pub mod config;
pub mod error;
pub mod frame;
pub mod handshake;
pub mod orchestrator;
pub mod policy;
pub mod protocol;
pub mod serializer;

pub use channel::{
    Channel, ChannelCore, ChannelEvent, ChannelState, MultiplexedChannel, PeerSummary, Role,
    TcpAcceptor, TcpChannel, UdpChannel, UdpServer,
};
#[cfg(unix)]
pub use channel::{PipeChannel, PipeHandles};
pub use config::{load_config, PolicyConfig, WireConfig};
pub use error::{DispatchError, HandlerError, ProtocolError, RejectionOrigin, WireError};
pub use frame::{Dispatch, EnvelopeHeader};
pub use handshake::auth::AuthConfig;
pub use handshake::{Handshake, HandshakeOutcome};
pub use orchestrator::{Orchestrator, OrchestratorEvent, OrchestratorState};
pub use policy::{EndpointPolicy, PolicyViolation};
pub use protocol::{Protocol, ProtocolBuilder};
pub use serializer::{Json, Message, MessageSerializer, MsgPack};
