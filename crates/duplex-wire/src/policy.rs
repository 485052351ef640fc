//! Endpoint acceptance policy for server-side transports.
//!
//! An [`EndpointPolicy`] is handed to the transport that accepts peers (the
//! UDP server demultiplexer, the TCP acceptor). It decides whether a new
//! endpoint may open a logical channel, whether a single datagram is
//! admissible, and whether an existing endpoint is still welcome when the
//! server re-evaluates its peers. Violations are ordinary values: the
//! transport logs them and refuses the peer.

use crate::config::{PolicyConfig, WireConfig};
use governor::{DefaultKeyedRateLimiter, Quota, RateLimiter};
use std::collections::HashSet;
use std::net::{IpAddr, SocketAddr};
use std::num::NonZeroU32;
use std::sync::RwLock;
use std::time::Duration;
use thiserror::Error;

/// Why an endpoint or datagram was refused.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum PolicyViolation {
    #[error("endpoint {0} is banned")]
    Banned(SocketAddr),
    #[error("channel limit of {limit} reached")]
    TooManyChannels { limit: usize },
    #[error("endpoint {0} exceeded its datagram quota")]
    RateLimited(SocketAddr),
    #[error("datagram of {size} bytes exceeds {max}")]
    DatagramTooLarge { size: usize, max: usize },
    #[error("endpoint {addr} idle for {idle_secs}s")]
    Idle { addr: SocketAddr, idle_secs: u64 },
}

/// Acceptance rules for remote endpoints.
pub struct EndpointPolicy {
    max_channels: usize,
    max_datagram_size: usize,
    banned: RwLock<HashSet<IpAddr>>,
    limiter: Option<DefaultKeyedRateLimiter<IpAddr>>,
    idle_timeout: Option<Duration>,
}

impl EndpointPolicy {
    /// A policy that admits up to `max_channels` endpoints with no quota.
    pub fn new(max_channels: usize) -> Self {
        Self {
            max_channels,
            max_datagram_size: crate::config::MAX_DATAGRAM_SIZE,
            banned: RwLock::new(HashSet::new()),
            limiter: None,
            idle_timeout: None,
        }
    }

    /// Build a policy from the `[policy]` section of the wire config.
    pub fn from_config(config: &WireConfig) -> Self {
        let PolicyConfig {
            max_channels,
            banned,
            datagrams_per_second,
            idle_timeout_secs,
        } = &config.policy;

        let mut policy = Self::new(*max_channels);
        policy.max_datagram_size = config.max_datagram_size;
        if let Some(rate) = datagrams_per_second.and_then(NonZeroU32::new) {
            policy = policy.with_rate_limit(rate);
        }
        if let Some(secs) = idle_timeout_secs {
            policy = policy.with_idle_timeout(Duration::from_secs(*secs));
        }
        for ip in banned {
            policy.ban(*ip);
        }
        policy
    }

    /// Limit every remote address to `per_second` datagrams (GCRA).
    pub fn with_rate_limit(mut self, per_second: NonZeroU32) -> Self {
        self.limiter = Some(RateLimiter::keyed(Quota::per_second(per_second)));
        self
    }

    /// Drop endpoints that stay silent longer than `timeout`.
    pub fn with_idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = Some(timeout);
        self
    }

    pub fn max_channels(&self) -> usize {
        self.max_channels
    }

    /// Refuse every endpoint from `ip` from now on.
    pub fn ban(&self, ip: IpAddr) {
        let mut banned = self.banned.write().unwrap_or_else(|e| e.into_inner());
        banned.insert(ip);
    }

    pub fn unban(&self, ip: IpAddr) {
        let mut banned = self.banned.write().unwrap_or_else(|e| e.into_inner());
        banned.remove(&ip);
    }

    pub fn is_banned(&self, ip: IpAddr) -> bool {
        let banned = self.banned.read().unwrap_or_else(|e| e.into_inner());
        banned.contains(&ip)
    }

    /// May a previously unseen endpoint open a channel while `live` channels exist?
    pub fn admit_endpoint(&self, addr: SocketAddr, live: usize) -> Result<(), PolicyViolation> {
        if self.is_banned(addr.ip()) {
            return Err(PolicyViolation::Banned(addr));
        }
        if live >= self.max_channels {
            return Err(PolicyViolation::TooManyChannels {
                limit: self.max_channels,
            });
        }
        Ok(())
    }

    /// Is a single datagram of `len` bytes from `addr` admissible?
    pub fn admit_datagram(&self, addr: SocketAddr, len: usize) -> Result<(), PolicyViolation> {
        if len > self.max_datagram_size {
            return Err(PolicyViolation::DatagramTooLarge {
                size: len,
                max: self.max_datagram_size,
            });
        }
        if let Some(limiter) = &self.limiter {
            if limiter.check_key(&addr.ip()).is_err() {
                return Err(PolicyViolation::RateLimited(addr));
            }
        }
        Ok(())
    }

    /// Drop rate-limiter state for addresses whose quota has fully
    /// replenished. Without this the limiter keeps one entry per source IP
    /// ever seen.
    pub fn forget_idle_quotas(&self) {
        if let Some(limiter) = &self.limiter {
            limiter.retain_recent();
            limiter.shrink_to_fit();
        }
    }

    /// Addresses the rate limiter currently tracks.
    pub fn tracked_quotas(&self) -> usize {
        self.limiter.as_ref().map_or(0, |limiter| limiter.len())
    }

    /// Re-check an endpoint that already owns a channel.
    pub fn still_admitted(&self, addr: SocketAddr, idle: Duration) -> Result<(), PolicyViolation> {
        if self.is_banned(addr.ip()) {
            return Err(PolicyViolation::Banned(addr));
        }
        if let Some(timeout) = self.idle_timeout {
            if idle > timeout {
                return Err(PolicyViolation::Idle {
                    addr,
                    idle_secs: idle.as_secs(),
                });
            }
        }
        Ok(())
    }
}

impl Default for EndpointPolicy {
    fn default() -> Self {
        Self::from_config(&WireConfig::default())
    }
}

impl std::fmt::Debug for EndpointPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EndpointPolicy")
            .field("max_channels", &self.max_channels)
            .field("max_datagram_size", &self.max_datagram_size)
            .field("rate_limited", &self.limiter.is_some())
            .field("idle_timeout", &self.idle_timeout)
            .finish()
    }
}
