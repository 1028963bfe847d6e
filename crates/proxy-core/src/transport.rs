use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;
use url::Url;

use crate::sdp::SessionDescription;

/// High-water mark on a destination transport's send buffer. Once our own
/// unsent writes reach this, chunks wait in the session queue instead.
pub const MAX_BUFFER: usize = 10 * 1024 * 1024;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("transport is closed")]
    Closed,
    #[error("connect failed: {0}")]
    Connect(String),
    #[error("signalling failed: {0}")]
    Signaling(String),
    #[error("{0}")]
    Io(String),
}

/// Lifecycle and traffic events of one conduit endpoint, delivered in
/// occurrence order.
#[derive(Debug)]
pub enum TransportEvent {
    /// The conduit finished connecting and can carry traffic.
    Opened,
    /// One opaque binary chunk arrived from the remote side.
    Message(Vec<u8>),
    /// The conduit closed normally.
    Closed,
    /// The conduit failed; no further events follow.
    Error(TransportError),
}

/// Write half of a reliable, binary-framed duplex conduit.
///
/// `send` enqueues without blocking; delivery order matches call order.
pub trait TransportSink: Send {
    fn send(&mut self, chunk: Vec<u8>) -> Result<(), TransportError>;
    /// Bytes accepted by `send` but not yet handed to the wire.
    fn buffered_amount(&self) -> usize;
    /// Begin closing. Idempotent; buffered chunks are still delivered
    /// best-effort.
    fn close(&mut self);
}

/// One endpoint of a conduit: its write half plus its event stream.
pub struct TransportPair {
    pub sink: Box<dyn TransportSink>,
    pub events: mpsc::UnboundedReceiver<TransportEvent>,
}

impl std::fmt::Debug for TransportPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransportPair").finish_non_exhaustive()
    }
}

/// Opens outbound connections to relays.
///
/// Dialling returns immediately; `Opened` (or `Error`) arrives on the
/// pair's event stream once the connection attempt resolves.
pub trait RelayDialer: Send + Sync {
    fn dial(&self, url: &Url) -> TransportPair;
}

/// Signalling-side events of a peer endpoint.
#[derive(Debug)]
pub enum SignalingEvent {
    /// Candidate gathering finished; the local description is final.
    IceComplete,
    /// The remote peer opened its data channel towards us.
    Channel(TransportPair),
    /// The peer connection failed; the endpoint is dead.
    Failed(String),
}

/// An unconnected client-side peer endpoint for exactly one session.
///
/// The remote client supplies the offer; we answer. Once negotiation
/// succeeds the endpoint yields the client conduit as a
/// [`SignalingEvent::Channel`].
#[async_trait]
pub trait PeerEndpoint: Send {
    async fn apply_offer(&mut self, offer: &SessionDescription) -> Result<(), TransportError>;
    /// Create the answer and install it as the local description.
    async fn create_answer(&mut self) -> Result<(), TransportError>;
    /// Current local description, including any candidates gathered so far.
    async fn local_description(&self) -> Option<SessionDescription>;
    /// Next signalling event; `None` once the endpoint is spent.
    async fn next_event(&mut self) -> Option<SignalingEvent>;
}

/// Creates peer endpoints; one per broker match.
#[async_trait]
pub trait PeerConnector: Send + Sync {
    async fn connect(&self, ice_servers: &[String]) -> Result<Box<dyn PeerEndpoint>, TransportError>;
}
