use std::time::Duration;

use rate_limit::{RateLimit, RateLimitError};
use thiserror::Error;
use url::Url;

use crate::nat::NatType;

/// Immutable runtime parameters, shared read-only by every component.
///
/// Build one with [`Config::default`] and adjust fields, then call
/// [`Config::validate`] (or [`Config::rate_limiter`], which validates the
/// limit as a side effect) before wiring the scheduler.
#[derive(Debug, Clone)]
pub struct Config {
    /// Rendezvous server, as configured. Scheme and trailing slash are
    /// normalised by the broker client.
    pub broker_url: String,
    /// Relay used when the broker does not name one.
    pub relay_url: Url,
    /// Pattern a broker-chosen relay hostname must satisfy (`^` prefix for
    /// exact match, otherwise suffix).
    pub allowed_relay_pattern: String,
    /// Outbound rate limit in bytes per second; `None` means unlimited.
    pub rate_limit_bytes: Option<u64>,
    /// Sliding-window length the rate limit is measured over.
    pub rate_limit_window: Duration,
    /// Baseline delay between broker polls.
    pub poll_interval: Duration,
    /// Poll delay used while our NAT is known to be unrestricted.
    pub fast_poll_interval: Duration,
    /// Upper bound the poll delay backs off towards under failures.
    pub slowest_poll_interval: Duration,
    /// Step applied per adaptive adjustment.
    pub poll_adjustment: Duration,
    /// How long after signalling a client's datachannel may take to open
    /// before the attempt counts as failed.
    pub datachannel_timeout: Duration,
    /// Stale-connection watchdog: a serving session with no client traffic
    /// for this long is torn down.
    pub message_timeout: Duration,
    /// How long to wait for ICE gathering before answering with whatever
    /// local description exists.
    pub answer_timeout: Duration,
    /// Concurrent client cap at poll-scheduling time.
    pub max_clients: usize,
    /// Hard bound on either direction's pending forward queue; exceeding
    /// it closes the session.
    pub max_queue_bytes: usize,
    /// ICE servers handed to the peer connection.
    pub ice_servers: Vec<String>,
    /// Proxy type tag reported to the broker.
    pub proxy_type: String,
    /// Our NAT classification as established by an external probe. The
    /// scheduler may later downgrade it to restricted, never back.
    pub nat: NatType,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            broker_url: "snowflake-broker.freehaven.net".to_string(),
            relay_url: Url::parse("wss://snowflake.freehaven.net")
                .expect("default relay URL parses"),
            allowed_relay_pattern: "snowflake.torproject.net".to_string(),
            rate_limit_bytes: None,
            rate_limit_window: Duration::from_secs(5),
            poll_interval: Duration::from_secs(60),
            fast_poll_interval: Duration::from_secs(30),
            slowest_poll_interval: Duration::from_secs(6 * 60 * 60),
            poll_adjustment: Duration::from_secs(100),
            datachannel_timeout: Duration::from_secs(20),
            message_timeout: Duration::from_secs(30),
            answer_timeout: Duration::from_secs(6),
            max_clients: 1,
            max_queue_bytes: 32 * 1024 * 1024,
            ice_servers: vec!["stun:stun.l.google.com:19302".to_string()],
            proxy_type: "standalone".to_string(),
            nat: NatType::Unknown,
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error(transparent)]
    RateLimit(#[from] RateLimitError),
    #[error("default relay URL must use the wss scheme, got '{scheme}'")]
    RelayScheme { scheme: String },
    #[error("max_clients must be at least 1")]
    NoCapacity,
}

impl Config {
    /// Reject configurations the runtime would misbehave under.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.relay_url.scheme() != "wss" {
            return Err(ConfigError::RelayScheme {
                scheme: self.relay_url.scheme().to_string(),
            });
        }
        if self.max_clients == 0 {
            return Err(ConfigError::NoCapacity);
        }
        if let Some(rate) = self.rate_limit_bytes {
            // Construct and discard: the floor check lives in rate-limit.
            RateLimit::per_second(rate, self.rate_limit_window)?;
        }
        Ok(())
    }

    /// Build the shared rate limiter described by this configuration.
    pub fn rate_limiter(&self) -> Result<RateLimit, ConfigError> {
        self.validate()?;
        match self.rate_limit_bytes {
            Some(rate) => Ok(RateLimit::per_second(rate, self.rate_limit_window)?),
            None => Ok(RateLimit::unlimited()),
        }
    }
}
