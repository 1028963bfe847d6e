//! Core runtime of the flurry circumvention proxy.
//!
//! A flurry instance volunteers bandwidth to censored users: it polls a
//! rendezvous broker for waiting clients, answers their connection offers,
//! opens an outbound secure channel to a vetted relay, and pumps opaque
//! bytes between the two until either side goes away.
//!
//! This crate is the transport-agnostic heart of that loop:
//!
//! | Module | Purpose |
//! |--------|---------|
//! | `config` | immutable runtime parameters and their validation |
//! | `nat` | NAT classification exchanged with the broker |
//! | `transport` | capability traits for the client and relay conduits |
//! | `sdp` | session-description envelope and candidate-address helpers |
//! | `broker` | rendezvous capability consumed by the scheduler |
//! | `session` | one client↔proxy↔relay conduit (`ProxyPair`) |
//! | `scheduler` | session ownership, adaptive polling, NAT inference |
//!
//! Concrete stacks plug in from the outside: an HTTP broker client, a
//! WebSocket relay dialer, and a WebRTC peer connector all implement the
//! traits defined here, which is also what makes the whole state machine
//! drivable by in-memory fakes under test.

pub mod broker;
pub mod config;
pub mod nat;
pub mod scheduler;
pub mod sdp;
pub mod session;
pub mod transport;

pub use broker::{Broker, BrokerError, PollOutcome, PollRequest};
pub use config::{Config, ConfigError};
pub use nat::NatType;
pub use scheduler::{PollPolicy, Scheduler};
pub use session::{
    new_session_id, CloseReason, OfferError, ProxyPair, RunningSession, SessionNotice,
    SessionState,
};
pub use sdp::SessionDescription;
pub use transport::{
    PeerConnector, PeerEndpoint, RelayDialer, SignalingEvent, TransportError, TransportEvent,
    TransportPair, TransportSink, MAX_BUFFER,
};
