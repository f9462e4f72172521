//! Rotating pool of scored network relays.
//!
//! Endpoints are registered as untested, promoted by a successful health check,
//! scored by every reported use and banned for a cooldown when their score
//! drops below the configured threshold.

mod endpoint;
mod pool;

pub use endpoint::{
    next_state, EndpointStatus, Outcome, ProxyEndpoint, ProxyProtocol, ProxyState, ScorePolicy,
    MAX_SCORE,
};
pub use pool::{EndpointSnapshot, PoolStats, ProxyLease, ProxyPool, SweepSummary};

use thiserror::Error;

/// Errors raised by the pool.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProxyPoolError {
    /// Every endpoint is banned, untested, degraded or at its concurrency cap
    #[error("no proxy available")]
    NoProxyAvailable,

    #[error("invalid proxy address: {0}")]
    InvalidAddress(String),
}
