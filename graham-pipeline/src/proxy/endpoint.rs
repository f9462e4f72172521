//! Relay endpoint model and score/state transitions.
//!
//! All score and state changes go through [`next_state`], a pure function of
//! the current [`EndpointStatus`], an [`Outcome`] and the [`ScorePolicy`].

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::{Duration, Instant};

use graham_common::util::redact_credentials;

use crate::config::ProxyConfig;

use super::ProxyPoolError;

/// Upper bound of an endpoint score.
pub const MAX_SCORE: u32 = 100;

/// Weight of the previous average when folding in a new latency sample.
const LATENCY_DECAY: f64 = 0.7;

// ============================================================================
// Protocol & State
// ============================================================================

/// Relay protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProxyProtocol {
    Http,
    Https,
    Socks5,
}

impl ProxyProtocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Http => "http",
            Self::Https => "https",
            Self::Socks5 => "socks5",
        }
    }
}

impl fmt::Display for ProxyProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProxyProtocol {
    type Err = ProxyPoolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "http" => Ok(Self::Http),
            "https" => Ok(Self::Https),
            "socks5" | "socks5h" => Ok(Self::Socks5),
            other => Err(ProxyPoolError::InvalidAddress(format!(
                "unsupported protocol '{}'",
                other
            ))),
        }
    }
}

/// Lifecycle state of a relay.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProxyState {
    /// Registered or back from cooldown; must pass a health check before use
    Untested,
    /// Eligible for selection
    Active,
    /// Too many consecutive failures; waits for a successful health check
    Degraded,
    /// Score fell below the threshold; sits out the cooldown
    Banned,
}

impl fmt::Display for ProxyState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Untested => write!(f, "untested"),
            Self::Active => write!(f, "active"),
            Self::Degraded => write!(f, "degraded"),
            Self::Banned => write!(f, "banned"),
        }
    }
}

// ============================================================================
// Transitions
// ============================================================================

/// Scoring parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScorePolicy {
    pub initial_score: u32,
    pub reward: u32,
    pub penalty: u32,
    pub ban_threshold: u32,
    pub degraded_after: u32,
}

impl Default for ScorePolicy {
    fn default() -> Self {
        Self::from(&ProxyConfig::default())
    }
}

impl From<&ProxyConfig> for ScorePolicy {
    fn from(config: &ProxyConfig) -> Self {
        Self {
            initial_score: config.initial_score.min(MAX_SCORE),
            reward: config.reward,
            penalty: config.penalty,
            ban_threshold: config.score_threshold,
            degraded_after: config.degraded_after_failures,
        }
    }
}

/// What happened to a relay.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Success,
    Failure,
    /// The ban cooldown has run out
    CooldownElapsed,
}

/// The part of an endpoint that transitions own.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EndpointStatus {
    pub score: u32,
    pub consecutive_failures: u32,
    pub state: ProxyState,
}

/// Compute the status that follows `outcome`.
pub fn next_state(current: EndpointStatus, outcome: Outcome, policy: &ScorePolicy) -> EndpointStatus {
    match outcome {
        Outcome::Success => EndpointStatus {
            score: current.score.saturating_add(policy.reward).min(MAX_SCORE),
            consecutive_failures: 0,
            // A ban is only lifted by its cooldown
            state: match current.state {
                ProxyState::Banned => ProxyState::Banned,
                _ => ProxyState::Active,
            },
        },
        Outcome::Failure => {
            let multiplier = current.consecutive_failures.saturating_add(1);
            let score = current
                .score
                .saturating_sub(policy.penalty.saturating_mul(multiplier));
            let consecutive_failures = current.consecutive_failures.saturating_add(1);

            let state = if score < policy.ban_threshold {
                ProxyState::Banned
            } else if consecutive_failures >= policy.degraded_after {
                match current.state {
                    ProxyState::Banned => ProxyState::Banned,
                    _ => ProxyState::Degraded,
                }
            } else {
                current.state
            };

            EndpointStatus {
                score,
                consecutive_failures,
                state,
            }
        }
        Outcome::CooldownElapsed => match current.state {
            ProxyState::Banned => EndpointStatus {
                score: policy.initial_score,
                consecutive_failures: 0,
                state: ProxyState::Untested,
            },
            _ => current,
        },
    }
}

// ============================================================================
// Endpoint
// ============================================================================

/// A registered relay.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxyEndpoint {
    /// `host:port`, optionally with `user:pass@` credentials
    pub address: String,
    pub protocol: ProxyProtocol,
    pub score: u32,
    pub consecutive_failures: u32,
    pub last_checked_at: Option<DateTime<Utc>>,
    pub state: ProxyState,
    /// Total successful uses
    pub successes: u64,
    /// Total failed uses
    pub failures: u64,
    /// Exponentially weighted average latency of successful uses
    pub avg_latency_ms: Option<f64>,
    #[serde(skip)]
    pub(crate) banned_since: Option<Instant>,
    #[serde(skip)]
    pub(crate) in_use: usize,
}

impl ProxyEndpoint {
    /// Parse `[scheme://]host:port`. The scheme defaults to `http`.
    pub fn parse(raw: &str, initial_score: u32) -> Result<Self, ProxyPoolError> {
        let raw = raw.trim();
        let (protocol, address) = match raw.split_once("://") {
            Some((scheme, rest)) => (scheme.parse::<ProxyProtocol>()?, rest),
            None => (ProxyProtocol::Http, raw),
        };

        let parsed = url::Url::parse(&format!("{}://{}", protocol, address))
            .map_err(|e| ProxyPoolError::InvalidAddress(format!("{}: {}", redact_credentials(raw), e)))?;
        let has_port = address
            .rsplit_once(':')
            .is_some_and(|(_, port)| port.parse::<u16>().is_ok());
        if parsed.host_str().is_none() || !has_port {
            return Err(ProxyPoolError::InvalidAddress(format!(
                "{}: expected host:port",
                redact_credentials(raw)
            )));
        }

        Ok(Self {
            address: address.to_string(),
            protocol,
            score: initial_score.min(MAX_SCORE),
            consecutive_failures: 0,
            last_checked_at: None,
            state: ProxyState::Untested,
            successes: 0,
            failures: 0,
            avg_latency_ms: None,
            banned_since: None,
            in_use: 0,
        })
    }

    /// Full relay URL, e.g. `socks5://10.0.0.1:1080`.
    pub fn url(&self) -> String {
        format!("{}://{}", self.protocol, self.address)
    }

    pub fn status(&self) -> EndpointStatus {
        EndpointStatus {
            score: self.score,
            consecutive_failures: self.consecutive_failures,
            state: self.state,
        }
    }

    /// Record a success or failure. Returns the state before the change.
    pub(crate) fn record(&mut self, success: bool, latency: Duration, policy: &ScorePolicy) -> ProxyState {
        let previous = self.state;
        let outcome = if success {
            self.successes += 1;
            self.fold_latency(latency);
            Outcome::Success
        } else {
            self.failures += 1;
            Outcome::Failure
        };

        self.apply(next_state(self.status(), outcome, policy));
        self.last_checked_at = Some(Utc::now());

        if self.state == ProxyState::Banned && previous != ProxyState::Banned {
            self.banned_since = Some(Instant::now());
        }
        previous
    }

    /// Lift the ban if the cooldown has run out. Returns true when lifted.
    pub(crate) fn release_if_cooled(&mut self, cooldown: Duration, policy: &ScorePolicy) -> bool {
        if self.state != ProxyState::Banned {
            return false;
        }
        let cooled = self
            .banned_since
            .map_or(true, |since| since.elapsed() >= cooldown);
        if cooled {
            self.apply(next_state(self.status(), Outcome::CooldownElapsed, policy));
            self.banned_since = None;
        }
        cooled
    }

    pub fn success_rate(&self) -> f64 {
        let total = self.successes + self.failures;
        if total == 0 {
            0.0
        } else {
            self.successes as f64 / total as f64
        }
    }

    fn apply(&mut self, status: EndpointStatus) {
        self.score = status.score;
        self.consecutive_failures = status.consecutive_failures;
        self.state = status.state;
    }

    fn fold_latency(&mut self, latency: Duration) {
        let sample = latency.as_secs_f64() * 1000.0;
        self.avg_latency_ms = Some(match self.avg_latency_ms {
            Some(avg) => avg * LATENCY_DECAY + sample * (1.0 - LATENCY_DECAY),
            None => sample,
        });
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    fn status(score: u32, consecutive_failures: u32, state: ProxyState) -> EndpointStatus {
        EndpointStatus {
            score,
            consecutive_failures,
            state,
        }
    }

    #[test]
    fn test_success_rewards_and_activates() {
        let policy = ScorePolicy::default();
        let next = next_state(status(50, 2, ProxyState::Untested), Outcome::Success, &policy);
        assert_eq!(next, status(60, 0, ProxyState::Active));
    }

    #[test]
    fn test_success_score_clamped() {
        let policy = ScorePolicy::default();
        let next = next_state(status(95, 0, ProxyState::Active), Outcome::Success, &policy);
        assert_eq!(next.score, MAX_SCORE);
    }

    #[test]
    fn test_penalty_escalates_with_consecutive_failures() {
        let policy = ScorePolicy::default();
        let mut s = status(60, 0, ProxyState::Active);

        s = next_state(s, Outcome::Failure, &policy);
        assert_eq!(s, status(55, 1, ProxyState::Active));
        s = next_state(s, Outcome::Failure, &policy);
        assert_eq!(s, status(45, 2, ProxyState::Active));
        s = next_state(s, Outcome::Failure, &policy);
        assert_eq!(s, status(30, 3, ProxyState::Degraded));
    }

    #[test]
    fn test_score_below_threshold_bans() {
        let policy = ScorePolicy::default();
        let next = next_state(status(25, 1, ProxyState::Active), Outcome::Failure, &policy);
        assert_eq!(next, status(15, 2, ProxyState::Banned));
    }

    #[test]
    fn test_score_never_underflows() {
        let policy = ScorePolicy::default();
        let next = next_state(status(3, 10, ProxyState::Degraded), Outcome::Failure, &policy);
        assert_eq!(next.score, 0);
        assert_eq!(next.state, ProxyState::Banned);
    }

    #[test]
    fn test_success_does_not_lift_ban() {
        let policy = ScorePolicy::default();
        let next = next_state(status(10, 3, ProxyState::Banned), Outcome::Success, &policy);
        assert_eq!(next.state, ProxyState::Banned);
        assert_eq!(next.score, 20);
    }

    #[test]
    fn test_cooldown_resets_to_untested() {
        let policy = ScorePolicy::default();
        let next = next_state(status(5, 4, ProxyState::Banned), Outcome::CooldownElapsed, &policy);
        assert_eq!(next, status(50, 0, ProxyState::Untested));

        let active = status(70, 0, ProxyState::Active);
        assert_eq!(next_state(active, Outcome::CooldownElapsed, &policy), active);
    }

    #[test_case("10.0.0.1:8080", ProxyProtocol::Http, "10.0.0.1:8080")]
    #[test_case("socks5://10.0.0.1:1080", ProxyProtocol::Socks5, "10.0.0.1:1080")]
    #[test_case("HTTPS://user:pw@proxy.local:443", ProxyProtocol::Https, "user:pw@proxy.local:443")]
    fn test_parse(raw: &str, protocol: ProxyProtocol, address: &str) {
        let endpoint = ProxyEndpoint::parse(raw, 50).unwrap();
        assert_eq!(endpoint.protocol, protocol);
        assert_eq!(endpoint.address, address);
        assert_eq!(endpoint.state, ProxyState::Untested);
        assert_eq!(endpoint.score, 50);
    }

    #[test_case("ftp://10.0.0.1:21")]
    #[test_case("10.0.0.1")]
    #[test_case("")]
    fn test_parse_rejects(raw: &str) {
        assert!(ProxyEndpoint::parse(raw, 50).is_err());
    }

    #[test]
    fn test_latency_is_exponentially_weighted() {
        let policy = ScorePolicy::default();
        let mut endpoint = ProxyEndpoint::parse("10.0.0.1:8080", 50).unwrap();

        endpoint.record(true, Duration::from_millis(100), &policy);
        assert_eq!(endpoint.avg_latency_ms, Some(100.0));

        endpoint.record(true, Duration::from_millis(200), &policy);
        let avg = endpoint.avg_latency_ms.unwrap();
        assert!((avg - 130.0).abs() < 1e-6, "avg was {}", avg);
    }

    #[test]
    fn test_record_stamps_ban_and_cooldown_lifts_it() {
        let policy = ScorePolicy::default();
        let mut endpoint = ProxyEndpoint::parse("10.0.0.1:8080", 20).unwrap();

        endpoint.record(false, Duration::ZERO, &policy);
        assert_eq!(endpoint.state, ProxyState::Banned);
        assert!(endpoint.banned_since.is_some());

        assert!(!endpoint.release_if_cooled(Duration::from_secs(300), &policy));
        assert!(endpoint.release_if_cooled(Duration::ZERO, &policy));
        assert_eq!(endpoint.state, ProxyState::Untested);
        assert_eq!(endpoint.score, 50);
    }
}
