//! Ready-made three-way handshake authenticated with a pre-shared key.
//!
//! ```text
//! initiator                                   receiver
//!   AuthHello { node_id, version, n1, HMAC(n1 ‖ id_i) }   ──►
//!   ◄──  AuthAck { node_id, version, n2, n1, id_i, HMAC(n1 ‖ n2 ‖ id_r) } + outcome
//!   AuthConfirm { HMAC(n2 ‖ n1 ‖ id_i) } + outcome        ──►
//! ```
//!
//! Each side proves knowledge of the secret over a nonce chosen by the other,
//! so a recorded exchange cannot be replayed.

use super::{Handshake, HandshakeOutcome, ThreeWay};
use crate::channel::Role;
use crate::error::ProtocolError;
use crate::serializer::Message;
use hmac::{Hmac, Mac};
use rand::Rng;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::sync::Arc;
use tracing::warn;

/// Version advertised in the authenticated handshake.
pub const AUTH_PROTOCOL_VERSION: u32 = 1;

type HmacSha256 = Hmac<Sha256>;

fn hmac_sign(secret: &str, data: &[u8]) -> Option<String> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).ok()?;
    mac.update(data);
    Some(hex::encode(mac.finalize().into_bytes()))
}

/// Constant-time check of a hex HMAC over `data`.
fn hmac_verify(secret: &str, data: &[u8], signature: &str) -> bool {
    match hmac_sign(secret, data) {
        Some(expected) => {
            subtle::ConstantTimeEq::ct_eq(expected.as_bytes(), signature.as_bytes()).into()
        }
        None => false,
    }
}

fn nonce() -> String {
    let mut bytes = [0u8; 16];
    rand::thread_rng().fill(&mut bytes);
    hex::encode(bytes)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthHello {
    pub node_id: String,
    pub protocol_version: u32,
    pub nonce: String,
    pub auth_hmac: String,
}

impl Message for AuthHello {
    const TAG: &'static str = "duplex.auth.hello";
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthAck {
    pub node_id: String,
    pub protocol_version: u32,
    pub nonce: String,
    /// The hello's nonce, echoed back.
    pub peer_nonce: String,
    /// The hello's node id, echoed back.
    pub peer_node_id: String,
    pub auth_hmac: String,
}

impl Message for AuthAck {
    const TAG: &'static str = "duplex.auth.ack";
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthConfirm {
    pub auth_hmac: String,
}

impl Message for AuthConfirm {
    const TAG: &'static str = "duplex.auth.confirm";
}

/// Settings for the authenticated handshake.
#[derive(Debug, Clone)]
pub struct AuthConfig {
    /// Pre-shared key; must match on both peers.
    pub shared_secret: String,
    /// Identity advertised to the peer.
    pub node_id: String,
    /// Which role sends `AuthHello`.
    pub initiator: Role,
}

impl AuthConfig {
    /// A config with a random node id and the client as initiator.
    pub fn new(shared_secret: impl Into<String>) -> Self {
        Self {
            shared_secret: shared_secret.into(),
            node_id: uuid::Uuid::new_v4().to_string(),
            initiator: Role::Client,
        }
    }

    pub fn with_node_id(mut self, node_id: impl Into<String>) -> Self {
        self.node_id = node_id.into();
        self
    }

    pub fn with_initiator(mut self, initiator: Role) -> Self {
        self.initiator = initiator;
        self
    }
}

/// Build the three-way authenticated handshake for `config`.
pub fn handshake(
    config: AuthConfig,
) -> Result<ThreeWay<AuthHello, AuthAck, AuthConfirm>, ProtocolError> {
    if config.shared_secret.is_empty() {
        return Err(ProtocolError::EmptySharedSecret);
    }
    let config = Arc::new(config);
    let initiator = config.initiator;

    let hello_cfg = Arc::clone(&config);
    let ack_cfg = Arc::clone(&config);
    let confirm_cfg = Arc::clone(&config);
    let finalize_cfg = config;

    Ok(Handshake::three_way::<AuthHello, AuthAck, AuthConfirm>(initiator)
        .initiate(move || {
            let nonce = nonce();
            let data = format!("{}{}", nonce, hello_cfg.node_id);
            AuthHello {
                node_id: hello_cfg.node_id.clone(),
                protocol_version: AUTH_PROTOCOL_VERSION,
                auth_hmac: hmac_sign(&hello_cfg.shared_secret, data.as_bytes()).unwrap_or_default(),
                nonce,
            }
        })
        .respond(move |hello| {
            let ack_nonce = nonce();
            let data = format!("{}{}{}", hello.nonce, ack_nonce, ack_cfg.node_id);
            let ack = AuthAck {
                node_id: ack_cfg.node_id.clone(),
                protocol_version: AUTH_PROTOCOL_VERSION,
                auth_hmac: hmac_sign(&ack_cfg.shared_secret, data.as_bytes()).unwrap_or_default(),
                nonce: ack_nonce,
                peer_nonce: hello.nonce.clone(),
                peer_node_id: hello.node_id.clone(),
            };

            if hello.protocol_version != AUTH_PROTOCOL_VERSION {
                warn!(
                    peer = %hello.node_id,
                    version = hello.protocol_version,
                    "Auth handshake: version mismatch"
                );
                return (ack, HandshakeOutcome::UnsupportedVersion);
            }
            let expected = format!("{}{}", hello.nonce, hello.node_id);
            if !hmac_verify(&ack_cfg.shared_secret, expected.as_bytes(), &hello.auth_hmac) {
                warn!(peer = %hello.node_id, "Auth handshake: HMAC verification failed");
                return (ack, HandshakeOutcome::Unauthorized);
            }
            (ack, HandshakeOutcome::Accepted)
        })
        .confirm(move |hello, ack| {
            let data = format!("{}{}{}", ack.nonce, hello.nonce, confirm_cfg.node_id);
            let confirm = AuthConfirm {
                auth_hmac: hmac_sign(&confirm_cfg.shared_secret, data.as_bytes())
                    .unwrap_or_default(),
            };

            if ack.protocol_version != AUTH_PROTOCOL_VERSION {
                warn!(
                    peer = %ack.node_id,
                    version = ack.protocol_version,
                    "Auth handshake: version mismatch"
                );
                return (confirm, HandshakeOutcome::UnsupportedVersion);
            }
            if ack.peer_nonce != hello.nonce {
                warn!(peer = %ack.node_id, "Auth handshake: ack answers a different hello");
                return (confirm, HandshakeOutcome::Unauthorized);
            }
            let expected = format!("{}{}{}", hello.nonce, ack.nonce, ack.node_id);
            if !hmac_verify(&confirm_cfg.shared_secret, expected.as_bytes(), &ack.auth_hmac) {
                warn!(peer = %ack.node_id, "Auth handshake: ack HMAC verification failed");
                return (confirm, HandshakeOutcome::Unauthorized);
            }
            (confirm, HandshakeOutcome::Accepted)
        })
        .finalize(move |ack, confirm| {
            let expected = format!("{}{}{}", ack.nonce, ack.peer_nonce, ack.peer_node_id);
            if hmac_verify(&finalize_cfg.shared_secret, expected.as_bytes(), &confirm.auth_hmac) {
                HandshakeOutcome::Accepted
            } else {
                warn!(peer = %ack.peer_node_id, "Auth handshake: confirm HMAC verification failed");
                HandshakeOutcome::Unauthorized
            }
        }))
}
