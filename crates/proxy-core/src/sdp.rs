use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use serde::{Deserialize, Serialize};
use url::Url;

/// The session-description envelope exchanged through the broker, a JSON
/// object of the form `{"type":"offer","sdp":"..."}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub kind: String,
    pub sdp: String,
}

impl SessionDescription {
    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            kind: "answer".to_string(),
            sdp: sdp.into(),
        }
    }

    pub fn is_offer(&self) -> bool {
        self.kind == "offer"
    }
}

/// Extract the client's publicly routable address from an offer SDP, if
/// any of its `a=candidate` lines carries one.
///
/// Candidate lines look like
/// `a=candidate:foundation 1 udp 2113937151 192.0.2.7 56688 typ srflx ...`;
/// the connection address is the fifth field. Private, loopback,
/// link-local and otherwise non-routable addresses are skipped; the
/// relay only wants an address it could meaningfully attribute traffic to.
pub fn client_addr(sdp: &str) -> Option<IpAddr> {
    sdp.lines()
        .map(str::trim)
        .filter_map(|line| line.strip_prefix("a=candidate:").or_else(|| line.strip_prefix("candidate:")))
        .filter_map(|candidate| candidate.split_whitespace().nth(4))
        .filter_map(|field| field.parse::<IpAddr>().ok())
        .find(is_remote_addr)
}

/// True when `addr` looks routable from the public internet.
fn is_remote_addr(addr: &IpAddr) -> bool {
    match addr {
        IpAddr::V4(v4) => !is_reserved_v4(v4),
        IpAddr::V6(v6) => !is_reserved_v6(v6),
    }
}

fn is_reserved_v4(addr: &Ipv4Addr) -> bool {
    let octets = addr.octets();
    addr.is_private()
        || addr.is_loopback()
        || addr.is_link_local()
        || addr.is_unspecified()
        || addr.is_broadcast()
        || addr.is_documentation()
        // Carrier-grade NAT, 100.64.0.0/10.
        || (octets[0] == 100 && (octets[1] & 0xc0) == 64)
}

fn is_reserved_v6(addr: &Ipv6Addr) -> bool {
    let segments = addr.segments();
    addr.is_loopback()
        || addr.is_unspecified()
        // Unique-local, fc00::/7.
        || (segments[0] & 0xfe00) == 0xfc00
        // Link-local, fe80::/10.
        || (segments[0] & 0xffc0) == 0xfe80
}

/// Relay URL for a session, with the client's address attached for the
/// relay's per-client accounting when one could be extracted.
pub fn relay_url_for(base: &Url, client: Option<IpAddr>) -> Url {
    let mut url = base.clone();
    if let Some(addr) = client {
        url.query_pairs_mut()
            .append_pair("client_ip", &addr.to_string());
    }
    url
}
