//! Relay address policy checks.
//!
//! The rendezvous broker may hand a proxy the relay it should forward to.
//! That address is attacker-observable input: a malicious broker (or a
//! tampered response) could otherwise turn volunteers into open proxies to
//! arbitrary hosts. Every broker-supplied relay URL is therefore checked
//! against the operator-configured pattern before it is dialled.
//!
//! Pattern language, kept deliberately tiny:
//!
//! * `^host.example`: the leading `^` demands the hostname equal
//!   `host.example` exactly.
//! * `example`: without `^`, any hostname with the suffix `example`
//!   matches (`relay.example`, `example` itself, but also `badexample`,
//!   which is why operators are expected to include the leading dot or
//!   use `^`).

use thiserror::Error;
use url::Url;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RelayRejection {
    #[error("relay URL is not parseable: {reason}")]
    Unparseable { reason: String },
    #[error("relay scheme '{scheme}' is not allowed; only wss is")]
    SchemeNotAllowed { scheme: String },
    #[error("relay URL has no hostname")]
    MissingHost,
    #[error("relay host '{host}' does not match the allowed pattern '{pattern}'")]
    HostNotAllowed { host: String, pattern: String },
}

/// Check `host` against `pattern`.
///
/// A pattern starting with `^` strips the caret and requires exact,
/// byte-for-byte equality. Any other pattern is a required suffix.
pub fn matches(pattern: &str, host: &str) -> bool {
    match pattern.strip_prefix('^') {
        Some(exact) => host == exact,
        None => host.ends_with(pattern),
    }
}

/// Validate a broker-supplied relay URL string against the allowed pattern.
///
/// Returns the parsed URL only when the scheme is `wss` and the hostname
/// matches. Everything else, unparseable input included, is a rejection,
/// never a panic.
pub fn validate_relay_url(raw: &str, pattern: &str) -> Result<Url, RelayRejection> {
    let url = Url::parse(raw).map_err(|e| RelayRejection::Unparseable {
        reason: e.to_string(),
    })?;

    if url.scheme() != "wss" {
        return Err(RelayRejection::SchemeNotAllowed {
            scheme: url.scheme().to_string(),
        });
    }

    let host = url.host_str().ok_or(RelayRejection::MissingHost)?;
    if !matches(pattern, host) {
        return Err(RelayRejection::HostNotAllowed {
            host: host.to_string(),
            pattern: pattern.to_string(),
        });
    }

    Ok(url)
}

#[cfg(test)]
mod tests {
    use super::*;

    // -----------------------------------------------------------------------
    // matches
    // -----------------------------------------------------------------------

    #[test]
    fn caret_requires_exact_equality() {
        assert!(matches("^foo", "foo"));
        assert!(!matches("^foo", "foobar"));
        assert!(!matches("^foo", "barfoo"));
        assert!(!matches("^foo", ""));
    }

    #[test]
    fn bare_pattern_is_a_suffix() {
        assert!(matches("foo", "barfoo"));
        assert!(matches("foo", "foo"));
        assert!(!matches("foo", "fooX"));
        assert!(!matches("foo", "bar"));
    }

    #[test]
    fn empty_pattern_matches_everything() {
        assert!(matches("", "anything"));
        assert!(matches("", ""));
    }

    #[test]
    fn dotted_suffix_scopes_to_a_domain() {
        assert!(matches(".torproject.net", "snowflake.torproject.net"));
        assert!(!matches(".torproject.net", "eviltorproject.net"));
    }

    // -----------------------------------------------------------------------
    // validate_relay_url
    // -----------------------------------------------------------------------

    const PATTERN: &str = "snowflake.torproject.net";

    #[test]
    fn accepts_matching_wss_url() {
        let url = validate_relay_url("wss://snowflake.torproject.net/", PATTERN)
            .expect("url should validate");
        assert_eq!(url.host_str(), Some("snowflake.torproject.net"));
    }

    #[test]
    fn accepts_subdomain_of_suffix_pattern() {
        assert!(validate_relay_url("wss://eu.snowflake.torproject.net/", PATTERN).is_ok());
    }

    #[test]
    fn rejects_wrong_host() {
        let err = validate_relay_url("wss://attacker.example/", PATTERN).unwrap_err();
        assert!(matches!(err, RelayRejection::HostNotAllowed { .. }));
    }

    #[test]
    fn rejects_non_wss_scheme() {
        let err = validate_relay_url("ws://snowflake.torproject.net/", PATTERN).unwrap_err();
        assert!(matches!(err, RelayRejection::SchemeNotAllowed { scheme } if scheme == "ws"));

        let err = validate_relay_url("https://snowflake.torproject.net/", PATTERN).unwrap_err();
        assert!(matches!(err, RelayRejection::SchemeNotAllowed { .. }));
    }

    #[test]
    fn rejects_garbage() {
        let err = validate_relay_url("not a url at all", PATTERN).unwrap_err();
        assert!(matches!(err, RelayRejection::Unparseable { .. }));
    }

    #[test]
    fn exact_pattern_rejects_lookalike_suffix() {
        let err =
            validate_relay_url("wss://not-snowflake.torproject.net/", "^snowflake.torproject.net")
                .unwrap_err();
        assert!(matches!(err, RelayRejection::HostNotAllowed { .. }));
    }
}
