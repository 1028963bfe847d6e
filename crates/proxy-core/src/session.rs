use std::collections::VecDeque;
use std::fmt::Write as _;
use std::net::IpAddr;
use std::sync::Arc;

use proxy_events::{EventKind, EventSink};
use rand::rngs::OsRng;
use rand::RngCore;
use rate_limit::RateLimit;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, timeout, Duration, Instant};
use url::Url;

use crate::config::Config;
use crate::sdp::{self, SessionDescription};
use crate::transport::{
    PeerEndpoint, RelayDialer, SignalingEvent, TransportError, TransportEvent, TransportPair,
    TransportSink, MAX_BUFFER,
};

/// Hard limit on the relay connection attempt, from dial to open.
const RELAY_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Re-poll delay for a flush stalled on a full destination buffer rather
/// than on the rate limiter (whose `when()` is zero in that situation).
const DRAIN_POLL: Duration = Duration::from_millis(50);

/// Generate a session identifier: 16 hex characters, 64 bits from the
/// operating system RNG.
pub fn new_session_id() -> String {
    let mut bytes = [0u8; 8];
    OsRng.fill_bytes(&mut bytes);
    let mut sid = String::with_capacity(16);
    for byte in bytes {
        let _ = write!(sid, "{byte:02x}");
    }
    sid
}

/// Where a session currently is in its life.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    AwaitingOffer,
    AwaitingIceComplete,
    AwaitingClientOpen,
    AwaitingRelayOpen,
    Forwarding,
    Closed,
}

/// Why a session reached `Closed`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    /// The scheduler asked us to stop.
    Requested,
    ClientClosed,
    ClientFailed(String),
    RelayClosed,
    RelayFailed(String),
    /// The relay did not open within [`RELAY_CONNECT_TIMEOUT`].
    RelayTimeout,
    /// No client traffic within the stale-message window.
    Stale,
    /// A forward queue outgrew its bound.
    QueueOverflow,
}

impl std::fmt::Display for CloseReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CloseReason::Requested => f.write_str("close requested"),
            CloseReason::ClientClosed => f.write_str("client closed"),
            CloseReason::ClientFailed(err) => write!(f, "client transport failed: {err}"),
            CloseReason::RelayClosed => f.write_str("relay closed"),
            CloseReason::RelayFailed(err) => write!(f, "relay transport failed: {err}"),
            CloseReason::RelayTimeout => f.write_str("relay connect timeout"),
            CloseReason::Stale => f.write_str("stale connection"),
            CloseReason::QueueOverflow => f.write_str("forward queue overflow"),
        }
    }
}

/// What a session reports back to its owning scheduler. Cleanup is an
/// event, not a callback: the scheduler maps `sid` back to its handle.
#[derive(Debug)]
pub enum SessionNotice {
    /// The client's datachannel opened; this session now serves traffic.
    Ready { sid: String },
    /// Terminal. Sent exactly once per spawned session.
    Closed { sid: String, reason: CloseReason },
}

/// Control handle for a spawned session, owned by the scheduler.
pub struct RunningSession {
    close: mpsc::Sender<()>,
    pub task: JoinHandle<()>,
}

impl RunningSession {
    /// Ask the session to close. Idempotent; completion is reported via
    /// [`SessionNotice::Closed`].
    pub fn close(&self) {
        let _ = self.close.try_send(());
    }
}

/// One client ↔ proxy ↔ relay conduit.
///
/// Construction corresponds to the client-side transport being created
/// and leaves the pair awaiting the broker-delivered offer. The scheduler
/// drives signalling through [`receive_offer`](Self::receive_offer), then
/// hands the pair its own task via [`spawn`](Self::spawn).
pub struct ProxyPair {
    sid: String,
    config: Arc<Config>,
    rate: Arc<RateLimit>,
    peer: Box<dyn PeerEndpoint>,
    dialer: Arc<dyn RelayDialer>,
    events: EventSink,
    notices: mpsc::UnboundedSender<SessionNotice>,
    relay_url: Url,
    client_addr: Option<IpAddr>,
    /// Data channel that arrived before signalling finished.
    pending_channel: Option<TransportPair>,
    state: SessionState,
    counted: bool,
}

#[derive(Debug, thiserror::Error)]
pub enum OfferError {
    #[error("offer does not parse: {0}")]
    Parse(String),
    #[error("descriptor type '{kind}' is not an offer")]
    NotAnOffer { kind: String },
    #[error(transparent)]
    RelayRejected(#[from] relay_match::RelayRejection),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("signalling ended before an answer could be produced")]
    SignalingEnded,
    #[error("no local description available to answer with")]
    NoLocalDescription,
}

impl ProxyPair {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        sid: String,
        config: Arc<Config>,
        rate: Arc<RateLimit>,
        peer: Box<dyn PeerEndpoint>,
        dialer: Arc<dyn RelayDialer>,
        events: EventSink,
        notices: mpsc::UnboundedSender<SessionNotice>,
    ) -> Self {
        let relay_url = config.relay_url.clone();
        Self {
            sid,
            config,
            rate,
            peer,
            dialer,
            events,
            notices,
            relay_url,
            client_addr: None,
            pending_channel: None,
            state: SessionState::AwaitingOffer,
            counted: false,
        }
    }

    pub fn sid(&self) -> &str {
        &self.sid
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Handle the broker-delivered offer and produce our answer.
    ///
    /// Validates the descriptor and the broker's relay choice, applies the
    /// offer, and waits for ICE gathering to complete or for the answer
    /// timeout, in which case the answer ships with whatever candidates
    /// have been gathered so far. The answer is returned (not submitted):
    /// the scheduler owns broker traffic, and returning it once makes a
    /// double submission unrepresentable.
    pub async fn receive_offer(
        &mut self,
        raw_offer: &str,
        broker_relay: Option<&str>,
    ) -> Result<SessionDescription, OfferError> {
        let offer: SessionDescription =
            serde_json::from_str(raw_offer).map_err(|e| OfferError::Parse(e.to_string()))?;
        if !offer.is_offer() {
            return Err(OfferError::NotAnOffer { kind: offer.kind });
        }

        if let Some(raw_url) = broker_relay {
            let url =
                relay_match::validate_relay_url(raw_url, &self.config.allowed_relay_pattern)?;
            tracing::debug!(
                sid = %self.sid,
                relay = url.host_str().unwrap_or("<none>"),
                "using broker-chosen relay"
            );
            self.relay_url = url;
        }

        self.client_addr = sdp::client_addr(&offer.sdp);

        self.peer.apply_offer(&offer).await?;
        self.state = SessionState::AwaitingIceComplete;
        self.peer.create_answer().await?;

        match timeout(self.config.answer_timeout, self.wait_ice_complete()).await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => return Err(err),
            Err(_) => {
                tracing::debug!(sid = %self.sid, "answer timeout; shipping partial candidates");
            }
        }

        let answer = self
            .peer
            .local_description()
            .await
            .ok_or(OfferError::NoLocalDescription)?;
        self.state = SessionState::AwaitingClientOpen;
        Ok(answer)
    }

    async fn wait_ice_complete(&mut self) -> Result<(), OfferError> {
        loop {
            match self.peer.next_event().await {
                Some(SignalingEvent::IceComplete) => return Ok(()),
                Some(SignalingEvent::Channel(pair)) => self.pending_channel = Some(pair),
                Some(SignalingEvent::Failed(reason)) => {
                    return Err(OfferError::Transport(TransportError::Signaling(reason)))
                }
                None => return Err(OfferError::SignalingEnded),
            }
        }
    }

    /// Drop a pair that never made it past signalling.
    pub fn discard(self, why: &str) {
        tracing::debug!(sid = %self.sid, why, "discarding session");
    }

    /// Hand the session its own task. From here on the scheduler interacts
    /// only through the returned handle and [`SessionNotice`]s.
    pub fn spawn(self) -> RunningSession {
        let (close_tx, close_rx) = mpsc::channel(1);
        let task = tokio::spawn(self.run(close_rx));
        RunningSession {
            close: close_tx,
            task,
        }
    }

    async fn run(mut self, mut close_rx: mpsc::Receiver<()>) {
        let reason = self.serve(&mut close_rx).await;
        self.finish(reason);
    }

    async fn serve(&mut self, close_rx: &mut mpsc::Receiver<()>) -> CloseReason {
        let client = match self.await_client(close_rx).await {
            Ok(pair) => pair,
            Err(reason) => return reason,
        };

        // The client is on the wire: count it, then bring up the relay leg.
        self.counted = true;
        self.events
            .emit(Some(self.sid.clone()), EventKind::ClientConnected);
        let _ = self.notices.send(SessionNotice::Ready {
            sid: self.sid.clone(),
        });

        let relay_url = sdp::relay_url_for(&self.relay_url, self.client_addr);
        tracing::debug!(
            sid = %self.sid,
            relay = relay_url.host_str().unwrap_or("<none>"),
            "dialling relay"
        );
        let relay = self.dialer.dial(&relay_url);
        self.state = SessionState::AwaitingRelayOpen;

        self.forward(client, relay, close_rx).await
    }

    /// Wait for the remote peer's data channel to arrive and open.
    async fn await_client(
        &mut self,
        close_rx: &mut mpsc::Receiver<()>,
    ) -> Result<TransportPair, CloseReason> {
        let mut pair = loop {
            if let Some(pair) = self.pending_channel.take() {
                break pair;
            }
            tokio::select! {
                _ = close_rx.recv() => return Err(CloseReason::Requested),
                event = self.peer.next_event() => match event {
                    Some(SignalingEvent::Channel(pair)) => break pair,
                    Some(SignalingEvent::IceComplete) => {}
                    Some(SignalingEvent::Failed(reason)) => {
                        return Err(CloseReason::ClientFailed(reason))
                    }
                    None => return Err(CloseReason::ClientFailed("signalling ended".to_string())),
                },
            }
        };

        loop {
            tokio::select! {
                _ = close_rx.recv() => return Err(CloseReason::Requested),
                event = pair.events.recv() => match event {
                    Some(TransportEvent::Opened) => return Ok(pair),
                    Some(TransportEvent::Message(_)) => {
                        tracing::debug!(sid = %self.sid, "dropping message on unopened channel");
                    }
                    Some(TransportEvent::Closed) | None => return Err(CloseReason::ClientClosed),
                    Some(TransportEvent::Error(err)) => {
                        return Err(CloseReason::ClientFailed(err.to_string()))
                    }
                },
            }
        }
    }

    /// Pump bytes in both directions until something terminal happens.
    async fn forward(
        &mut self,
        client: TransportPair,
        relay: TransportPair,
        close_rx: &mut mpsc::Receiver<()>,
    ) -> CloseReason {
        let TransportPair {
            sink: client_sink,
            events: mut client_rx,
        } = client;
        let TransportPair {
            sink: relay_sink,
            events: mut relay_rx,
        } = relay;

        // The client leg is already open; the relay leg opens via event.
        let mut to_client = Outbound::new("client", client_sink, true);
        let mut to_relay = Outbound::new("relay", relay_sink, false);

        let rate = Arc::clone(&self.rate);
        let events = self.events.clone();
        let sid = self.sid.clone();
        let max_queue = self.config.max_queue_bytes;
        let message_timeout = self.config.message_timeout;
        let relay_host = self
            .relay_url
            .host_str()
            .unwrap_or("<none>")
            .to_string();

        let mut relay_deadline = Some(Instant::now() + RELAY_CONNECT_TIMEOUT);
        let mut stale_deadline = Instant::now() + message_timeout;
        let mut flush_at: Option<Instant> = None;
        let mut peer_live = true;

        let reason = loop {
            // Disabled arms still evaluate their expression, so feed the
            // sleeps a dummy instant when no deadline is armed.
            let relay_sleep = relay_deadline.unwrap_or_else(Instant::now);
            let flush_sleep = flush_at.unwrap_or_else(Instant::now);

            tokio::select! {
                _ = close_rx.recv() => break CloseReason::Requested,

                event = client_rx.recv() => match event {
                    Some(TransportEvent::Message(chunk)) => {
                        // Client traffic doubles as the keep-alive.
                        stale_deadline = Instant::now() + message_timeout;
                        if !to_relay.push(chunk, max_queue) {
                            break CloseReason::QueueOverflow;
                        }
                        pump(&mut to_relay, &mut to_client, &rate, &mut flush_at);
                    }
                    Some(TransportEvent::Opened) => {}
                    Some(TransportEvent::Closed) | None => break CloseReason::ClientClosed,
                    Some(TransportEvent::Error(err)) => {
                        break CloseReason::ClientFailed(err.to_string())
                    }
                },

                event = relay_rx.recv() => match event {
                    Some(TransportEvent::Opened) => {
                        to_relay.open = true;
                        relay_deadline = None;
                        self.state = SessionState::Forwarding;
                        events.emit(
                            Some(sid.clone()),
                            EventKind::RelayConnected {
                                relay: relay_host.clone(),
                            },
                        );
                        pump(&mut to_relay, &mut to_client, &rate, &mut flush_at);
                    }
                    Some(TransportEvent::Message(chunk)) => {
                        if !to_client.push(chunk, max_queue) {
                            break CloseReason::QueueOverflow;
                        }
                        pump(&mut to_relay, &mut to_client, &rate, &mut flush_at);
                    }
                    Some(TransportEvent::Closed) | None => break CloseReason::RelayClosed,
                    Some(TransportEvent::Error(err)) => {
                        break CloseReason::RelayFailed(err.to_string())
                    }
                },

                event = self.peer.next_event(), if peer_live => match event {
                    Some(SignalingEvent::Failed(reason)) => {
                        break CloseReason::ClientFailed(reason)
                    }
                    Some(_) => {}
                    None => peer_live = false,
                },

                _ = sleep_until(relay_sleep), if relay_deadline.is_some() => {
                    break CloseReason::RelayTimeout;
                }

                _ = sleep_until(stale_deadline) => break CloseReason::Stale,

                _ = sleep_until(flush_sleep), if flush_at.is_some() => {
                    flush_at = None;
                    pump(&mut to_relay, &mut to_client, &rate, &mut flush_at);
                }
            }
        };

        // Best-effort drain, then release both conduits.
        flush(&mut to_relay, &mut to_client, &rate);
        to_relay.sink.close();
        to_client.sink.close();

        reason
    }

    /// Terminal bookkeeping. Runs exactly once per spawned session.
    fn finish(&mut self, reason: CloseReason) {
        self.state = SessionState::Closed;

        if self.counted {
            self.counted = false;
            self.events
                .emit(Some(self.sid.clone()), EventKind::ClientDisconnected);
        }
        self.events.emit(
            Some(self.sid.clone()),
            EventKind::SessionClosed {
                reason: reason.to_string(),
            },
        );

        tracing::info!(sid = %self.sid, %reason, "session closed");

        let _ = self.notices.send(SessionNotice::Closed {
            sid: self.sid.clone(),
            reason,
        });
    }
}

/// Outbound leg of one forwarding direction: the queue of chunks waiting
/// for `sink`, which may not have opened yet.
struct Outbound {
    destination: &'static str,
    sink: Box<dyn TransportSink>,
    queue: VecDeque<Vec<u8>>,
    queued_bytes: usize,
    open: bool,
}

impl Outbound {
    fn new(destination: &'static str, sink: Box<dyn TransportSink>, open: bool) -> Self {
        Self {
            destination,
            sink,
            queue: VecDeque::new(),
            queued_bytes: 0,
            open,
        }
    }

    /// Queue a chunk. Returns false once the queue outgrows `max_queue`,
    /// at which point the session must close rather than buffer without
    /// bound.
    fn push(&mut self, chunk: Vec<u8>, max_queue: usize) -> bool {
        self.queued_bytes += chunk.len();
        self.queue.push_back(chunk);
        if self.queued_bytes > max_queue {
            tracing::warn!(
                destination = self.destination,
                queued = self.queued_bytes,
                "forward queue over bound"
            );
            return false;
        }
        true
    }

    /// Send the oldest queued chunk if the destination can take it.
    fn try_send_one(&mut self, rate: &RateLimit) -> bool {
        if !self.open || self.sink.buffered_amount() >= MAX_BUFFER {
            return false;
        }
        let Some(chunk) = self.queue.pop_front() else {
            return false;
        };
        let len = chunk.len();
        self.queued_bytes -= len;
        match self.sink.send(chunk) {
            Ok(()) => {
                rate.update(len as u64);
                true
            }
            Err(err) => {
                // The matching Closed/Error event is already on its way;
                // stop trying in the meantime.
                tracing::debug!(destination = self.destination, %err, "send failed");
                self.open = false;
                false
            }
        }
    }

    fn backlog(&self) -> bool {
        !self.queue.is_empty()
    }
}

/// One flush pass: alternate directions while the rate limiter allows and
/// progress is being made. Returns true if anything is still queued.
fn flush(to_relay: &mut Outbound, to_client: &mut Outbound, rate: &RateLimit) -> bool {
    let mut progress = true;
    while progress && !rate.is_limited() {
        progress = to_relay.try_send_one(rate);
        progress |= to_client.try_send_one(rate);
    }
    to_relay.backlog() || to_client.backlog()
}

/// Flush and, if a backlog remains, arm the (single) deferred flush.
fn pump(
    to_relay: &mut Outbound,
    to_client: &mut Outbound,
    rate: &RateLimit,
    flush_at: &mut Option<Instant>,
) {
    if flush(to_relay, to_client, rate) {
        if flush_at.is_none() {
            let mut delay = rate.when();
            if delay.is_zero() {
                delay = DRAIN_POLL;
            }
            *flush_at = Some(Instant::now() + delay);
        }
    } else {
        *flush_at = None;
    }
}
