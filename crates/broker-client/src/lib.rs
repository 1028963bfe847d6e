//! HTTP rendezvous client for the flurry proxy.
//!
//! Speaks the broker's two-endpoint protocol: `POST {broker}proxy`
//! registers the proxy and fetches a waiting client's offer, and
//! `POST {broker}answer` returns our answer to that client. Wire bodies
//! are small JSON objects with versioned, capitalised fields; see the
//! serde structs below for the exact shapes.
//!
//! Network and decoding failures all land in
//! [`BrokerError`](proxy_core::BrokerError): a broker hiccup must never
//! take the proxy down, so callers log and carry on polling.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

use proxy_core::{
    broker::quantize_clients, Broker, BrokerError, NatType, PollOutcome, PollRequest,
    SessionDescription,
};

/// Protocol version of the registration message.
const POLL_VERSION: &str = "1.3";
/// Protocol version of the answer message.
const ANSWER_VERSION: &str = "1.0";

/// Outer bound on one broker round trip. The broker holds poll requests
/// open while it waits for a client, so this is generous.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Broker client over HTTPS (or plain HTTP towards localhost brokers).
pub struct HttpBroker {
    /// Normalised base URL, scheme included, trailing slash guaranteed.
    base: String,
    client: reqwest::Client,
}

impl HttpBroker {
    pub fn new(broker_url: &str) -> Result<Self, BrokerError> {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| BrokerError::Request(e.to_string()))?;
        Ok(Self {
            base: normalize_broker_url(broker_url),
            client,
        })
    }

    /// The URL requests go to, mostly interesting for logs.
    pub fn base(&self) -> &str {
        &self.base
    }

    async fn post<T: Serialize>(
        &self,
        endpoint: &str,
        body: &T,
    ) -> Result<reqwest::Response, BrokerError> {
        let url = format!("{}{}", self.base, endpoint);
        let response = self
            .client
            .post(&url)
            .json(body)
            .send()
            .await
            .map_err(|e| BrokerError::Request(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(BrokerError::Status(status.as_u16()));
        }
        Ok(response)
    }
}

/// Scheme and trailing-slash normalisation of the configured broker URL:
/// `localhost…` gets `http://`, anything else without an `http` prefix
/// gets `https://`, and the result always ends in `/`.
fn normalize_broker_url(raw: &str) -> String {
    let mut url = if raw.starts_with("localhost") {
        format!("http://{raw}")
    } else if !raw.starts_with("http") {
        format!("https://{raw}")
    } else {
        raw.to_string()
    };
    if !url.ends_with('/') {
        url.push('/');
    }
    url
}

#[derive(Serialize)]
struct PollBody<'a> {
    #[serde(rename = "Version")]
    version: &'static str,
    #[serde(rename = "Sid")]
    sid: &'a str,
    #[serde(rename = "Type")]
    proxy_type: &'a str,
    #[serde(rename = "NAT")]
    nat: &'a str,
    #[serde(rename = "Clients")]
    clients: usize,
    #[serde(rename = "AcceptedRelayPattern")]
    accepted_relay_pattern: &'a str,
}

#[derive(Debug, Deserialize)]
struct PollReply {
    #[serde(rename = "Status")]
    status: String,
    #[serde(rename = "Offer")]
    offer: Option<String>,
    #[serde(rename = "NAT")]
    nat: Option<String>,
    #[serde(rename = "RelayURL")]
    relay_url: Option<String>,
}

#[derive(Serialize)]
struct AnswerBody<'a> {
    #[serde(rename = "Version")]
    version: &'static str,
    #[serde(rename = "Sid")]
    sid: &'a str,
    #[serde(rename = "Answer")]
    answer: String,
}

#[async_trait]
impl Broker for HttpBroker {
    async fn poll(&self, request: PollRequest) -> Result<PollOutcome, BrokerError> {
        let body = PollBody {
            version: POLL_VERSION,
            sid: &request.sid,
            proxy_type: &request.proxy_type,
            nat: request.nat.as_str(),
            clients: quantize_clients(request.clients),
            accepted_relay_pattern: &request.accepted_relay_pattern,
        };

        let reply: PollReply = self
            .post("proxy", &body)
            .await?
            .json()
            .await
            .map_err(|e| BrokerError::Malformed(e.to_string()))?;

        match reply.status.as_str() {
            "client match" => {
                let offer = reply.offer.ok_or_else(|| {
                    BrokerError::Malformed("client match without an offer".to_string())
                })?;
                let client_nat = reply
                    .nat
                    .as_deref()
                    .and_then(|nat| nat.parse::<NatType>().ok())
                    .unwrap_or_default();
                debug!(sid = %request.sid, %client_nat, "broker matched a client");
                Ok(PollOutcome::Matched {
                    offer,
                    client_nat,
                    relay_url: reply.relay_url,
                })
            }
            "no match" => Ok(PollOutcome::NoMatch),
            other => Err(BrokerError::Unexpected(other.to_string())),
        }
    }

    async fn answer(
        &self,
        sid: &str,
        answer: &SessionDescription,
    ) -> Result<(), BrokerError> {
        let body = AnswerBody {
            version: ANSWER_VERSION,
            sid,
            answer: serde_json::to_string(answer)
                .map_err(|e| BrokerError::Malformed(e.to_string()))?,
        };

        self.post("answer", &body).await?;
        debug!(%sid, "answer submitted");
        Ok(())
    }
}
