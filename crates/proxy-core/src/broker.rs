use async_trait::async_trait;
use thiserror::Error;

use crate::nat::NatType;
use crate::sdp::SessionDescription;

/// One registration-and-fetch-offer attempt, as the scheduler states it.
/// The broker implementation owns wire encoding, including quantising the
/// client count.
#[derive(Debug, Clone)]
pub struct PollRequest {
    /// Session identifier of the candidate pair, 16 hex characters.
    pub sid: String,
    /// Proxy type tag, e.g. `standalone`.
    pub proxy_type: String,
    /// Our current NAT classification.
    pub nat: NatType,
    /// Unquantised count of sessions we are already carrying.
    pub clients: usize,
    /// Relay pattern we are willing to serve.
    pub accepted_relay_pattern: String,
}

/// Outcome of a successful broker round trip.
#[derive(Debug, Clone)]
pub enum PollOutcome {
    /// A client is waiting: here is its offer, its NAT classification,
    /// and optionally the relay the broker wants used.
    Matched {
        offer: String,
        client_nat: NatType,
        relay_url: Option<String>,
    },
    /// No client right now; retry on the next poll.
    NoMatch,
}

#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("broker request failed: {0}")]
    Request(String),
    #[error("broker returned HTTP status {0}")]
    Status(u16),
    #[error("broker response was malformed: {0}")]
    Malformed(String),
    #[error("broker returned unexpected status '{0}'")]
    Unexpected(String),
}

/// The rendezvous capability the scheduler polls.
///
/// Implementations must resolve network failures into [`BrokerError`]
/// rather than panicking or propagating; no broker error is ever fatal to
/// the proxy.
#[async_trait]
pub trait Broker: Send + Sync {
    /// Register availability and ask for a waiting client.
    async fn poll(&self, request: PollRequest) -> Result<PollOutcome, BrokerError>;

    /// Submit the answer for a previously matched session.
    async fn answer(
        &self,
        sid: &str,
        answer: &SessionDescription,
    ) -> Result<(), BrokerError>;
}

/// Quantise a live client count to a multiple of 8 before it leaves the
/// proxy, so the exact load is not observable from broker traffic.
pub fn quantize_clients(count: usize) -> usize {
    count / 8 * 8
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quantises_to_multiples_of_eight() {
        assert_eq!(quantize_clients(0), 0);
        assert_eq!(quantize_clients(1), 0);
        assert_eq!(quantize_clients(7), 0);
        assert_eq!(quantize_clients(8), 8);
        assert_eq!(quantize_clients(12), 8);
        assert_eq!(quantize_clients(16), 16);
    }
}
