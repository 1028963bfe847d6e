use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A single proxy activity event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxyEvent {
    pub timestamp: DateTime<Utc>,
    /// Session identifier, for events tied to one client conduit.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session: Option<String>,
    #[serde(flatten)]
    pub kind: EventKind,
}

impl ProxyEvent {
    /// Stamp an event with the current UTC time.
    pub fn new(session: Option<String>, kind: EventKind) -> Self {
        Self {
            timestamp: Utc::now(),
            session,
            kind,
        }
    }
}

/// What happened.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum EventKind {
    /// The proxy process came up.
    ProxyStarted { version: String },
    /// A broker poll matched this proxy with a waiting client.
    ClientMatched,
    /// The client's datachannel opened; the session is serving.
    ClientConnected,
    /// A previously connected client went away.
    ClientDisconnected,
    /// The outbound relay connection completed.
    RelayConnected { relay: String },
    /// A session reached its terminal state.
    SessionClosed { reason: String },
    /// The proxy reclassified its own NAT.
    NatUpdated { nat: String },
}

impl EventKind {
    /// Short human label used in log lines.
    pub fn label(&self) -> &'static str {
        match self {
            EventKind::ProxyStarted { .. } => "proxy started",
            EventKind::ClientMatched => "client matched",
            EventKind::ClientConnected => "client connected",
            EventKind::ClientDisconnected => "client disconnected",
            EventKind::RelayConnected { .. } => "relay connected",
            EventKind::SessionClosed { .. } => "session closed",
            EventKind::NatUpdated { .. } => "nat updated",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serializes_as_flat_tagged_json() {
        let event = ProxyEvent::new(
            Some("0123456789abcdef".to_string()),
            EventKind::SessionClosed {
                reason: "stale".to_string(),
            },
        );

        let value = serde_json::to_value(&event).expect("serializable");
        assert_eq!(value["event"], "session_closed");
        assert_eq!(value["session"], "0123456789abcdef");
        assert_eq!(value["reason"], "stale");
        assert!(value["timestamp"].is_string());
    }

    #[test]
    fn omits_session_when_absent() {
        let event = ProxyEvent::new(
            None,
            EventKind::NatUpdated {
                nat: "restricted".to_string(),
            },
        );

        let json = serde_json::to_string(&event).expect("serializable");
        assert!(!json.contains("\"session\""));
    }
}
