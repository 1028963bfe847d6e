//! In-memory collaborators for driving the session and scheduler state
//! machines without any network.
#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::mpsc;
use url::Url;

use proxy_core::{
    Broker, BrokerError, NatType, PeerConnector, PeerEndpoint, PollOutcome, PollRequest,
    RelayDialer, SessionDescription, SignalingEvent, TransportError, TransportEvent,
    TransportPair, TransportSink,
};

/// Wire-shaped offer JSON around a raw SDP body.
pub fn offer_json(sdp: &str) -> String {
    serde_json::to_string(&SessionDescription {
        kind: "offer".to_string(),
        sdp: sdp.to_string(),
    })
    .expect("offer serializes")
}

// ---------------------------------------------------------------------------
// Memory transport
// ---------------------------------------------------------------------------

/// Test-side handle to one in-memory conduit: push events at the session,
/// observe what it sent.
#[derive(Clone)]
pub struct MemoryConduit {
    events: mpsc::UnboundedSender<TransportEvent>,
    sent: Arc<Mutex<Vec<Vec<u8>>>>,
    buffered: Arc<Mutex<usize>>,
    closed: Arc<Mutex<bool>>,
}

impl MemoryConduit {
    /// Build a conduit and the `TransportPair` handed to the session.
    pub fn pair() -> (Self, TransportPair) {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let sent = Arc::new(Mutex::new(Vec::new()));
        let buffered = Arc::new(Mutex::new(0));
        let closed = Arc::new(Mutex::new(false));

        let conduit = Self {
            events: event_tx,
            sent: Arc::clone(&sent),
            buffered: Arc::clone(&buffered),
            closed: Arc::clone(&closed),
        };
        let pair = TransportPair {
            sink: Box::new(MemorySink {
                sent,
                buffered,
                closed,
            }),
            events: event_rx,
        };
        (conduit, pair)
    }

    pub fn open(&self) {
        let _ = self.events.send(TransportEvent::Opened);
    }

    pub fn message(&self, chunk: &[u8]) {
        let _ = self.events.send(TransportEvent::Message(chunk.to_vec()));
    }

    pub fn close_remote(&self) {
        let _ = self.events.send(TransportEvent::Closed);
    }

    pub fn fail(&self, reason: &str) {
        let _ = self
            .events
            .send(TransportEvent::Error(TransportError::Io(reason.to_string())));
    }

    /// Chunks the session has written to this conduit, in order.
    pub fn sent(&self) -> Vec<Vec<u8>> {
        self.sent.lock().expect("lock").clone()
    }

    /// Pretend the wire is backed up by this many unsent bytes.
    pub fn set_buffered(&self, amount: usize) {
        *self.buffered.lock().expect("lock") = amount;
    }

    pub fn sink_closed(&self) -> bool {
        *self.closed.lock().expect("lock")
    }
}

struct MemorySink {
    sent: Arc<Mutex<Vec<Vec<u8>>>>,
    buffered: Arc<Mutex<usize>>,
    closed: Arc<Mutex<bool>>,
}

impl TransportSink for MemorySink {
    fn send(&mut self, chunk: Vec<u8>) -> Result<(), TransportError> {
        if *self.closed.lock().expect("lock") {
            return Err(TransportError::Closed);
        }
        self.sent.lock().expect("lock").push(chunk);
        Ok(())
    }

    fn buffered_amount(&self) -> usize {
        *self.buffered.lock().expect("lock")
    }

    fn close(&mut self) {
        *self.closed.lock().expect("lock") = true;
    }
}

// ---------------------------------------------------------------------------
// Fake peer endpoint
// ---------------------------------------------------------------------------

/// How a [`FakePeer`] behaves through signalling.
#[derive(Clone)]
pub struct PeerScript {
    /// SDP of the answer `local_description` reports after
    /// `create_answer`; `None` models a transport with no description.
    pub answer: Option<String>,
    pub fail_apply: bool,
    pub fail_create: bool,
    /// Queue an `IceComplete` as soon as the endpoint exists.
    pub ice_complete_immediately: bool,
}

impl PeerScript {
    /// The cooperative default: answers promptly, ICE completes at once.
    pub fn answering() -> Self {
        Self {
            answer: Some("v=0 answer".to_string()),
            fail_apply: false,
            fail_create: false,
            ice_complete_immediately: true,
        }
    }
}

/// Test-side handle for driving a [`FakePeer`]'s signalling events.
#[derive(Clone)]
pub struct PeerHandle {
    signals: mpsc::UnboundedSender<SignalingEvent>,
}

impl PeerHandle {
    pub fn ice_complete(&self) {
        let _ = self.signals.send(SignalingEvent::IceComplete);
    }

    pub fn channel(&self, pair: TransportPair) {
        let _ = self.signals.send(SignalingEvent::Channel(pair));
    }

    pub fn fail(&self, reason: &str) {
        let _ = self.signals.send(SignalingEvent::Failed(reason.to_string()));
    }
}

pub struct FakePeer {
    script: PeerScript,
    answered: bool,
    offers: Arc<Mutex<Vec<SessionDescription>>>,
    signals: mpsc::UnboundedReceiver<SignalingEvent>,
}

/// Build a fake endpoint plus its driving handle.
pub fn fake_peer(script: PeerScript) -> (PeerHandle, FakePeer) {
    let (signal_tx, signal_rx) = mpsc::unbounded_channel();
    if script.ice_complete_immediately {
        let _ = signal_tx.send(SignalingEvent::IceComplete);
    }
    (
        PeerHandle {
            signals: signal_tx,
        },
        FakePeer {
            script,
            answered: false,
            offers: Arc::new(Mutex::new(Vec::new())),
            signals: signal_rx,
        },
    )
}

#[async_trait]
impl PeerEndpoint for FakePeer {
    async fn apply_offer(&mut self, offer: &SessionDescription) -> Result<(), TransportError> {
        if self.script.fail_apply {
            return Err(TransportError::Signaling("remote description rejected".to_string()));
        }
        self.offers.lock().expect("lock").push(offer.clone());
        Ok(())
    }

    async fn create_answer(&mut self) -> Result<(), TransportError> {
        if self.script.fail_create {
            return Err(TransportError::Signaling("answer creation failed".to_string()));
        }
        self.answered = true;
        Ok(())
    }

    async fn local_description(&self) -> Option<SessionDescription> {
        if !self.answered {
            return None;
        }
        self.script
            .answer
            .as_ref()
            .map(|sdp| SessionDescription::answer(sdp.clone()))
    }

    async fn next_event(&mut self) -> Option<SignalingEvent> {
        self.signals.recv().await
    }
}

/// Connector that manufactures [`FakePeer`]s from one script and records
/// their handles for the test to drive.
pub struct ScriptedConnector {
    script: PeerScript,
    handles: Arc<Mutex<Vec<PeerHandle>>>,
}

impl ScriptedConnector {
    pub fn new(script: PeerScript) -> Self {
        Self {
            script,
            handles: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Handle of the `index`-th endpoint created so far.
    pub fn handle(&self, index: usize) -> Option<PeerHandle> {
        self.handles.lock().expect("lock").get(index).cloned()
    }

    pub fn created(&self) -> usize {
        self.handles.lock().expect("lock").len()
    }
}

#[async_trait]
impl PeerConnector for ScriptedConnector {
    async fn connect(
        &self,
        _ice_servers: &[String],
    ) -> Result<Box<dyn PeerEndpoint>, TransportError> {
        let (handle, peer) = fake_peer(self.script.clone());
        self.handles.lock().expect("lock").push(handle);
        Ok(Box::new(peer))
    }
}

// ---------------------------------------------------------------------------
// Fake relay dialer
// ---------------------------------------------------------------------------

/// Dialer returning in-memory conduits; records every dialled URL.
#[derive(Clone)]
pub struct FakeDialer {
    auto_open: bool,
    dialed: Arc<Mutex<Vec<Url>>>,
    conduits: Arc<Mutex<Vec<MemoryConduit>>>,
}

impl FakeDialer {
    pub fn new(auto_open: bool) -> Self {
        Self {
            auto_open,
            dialed: Arc::new(Mutex::new(Vec::new())),
            conduits: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn dialed(&self) -> Vec<Url> {
        self.dialed.lock().expect("lock").clone()
    }

    /// The conduit handed out for the `index`-th dial.
    pub fn conduit(&self, index: usize) -> Option<MemoryConduit> {
        self.conduits.lock().expect("lock").get(index).cloned()
    }
}

impl RelayDialer for FakeDialer {
    fn dial(&self, url: &Url) -> TransportPair {
        let (conduit, pair) = MemoryConduit::pair();
        if self.auto_open {
            conduit.open();
        }
        self.dialed.lock().expect("lock").push(url.clone());
        self.conduits.lock().expect("lock").push(conduit);
        pair
    }
}

// ---------------------------------------------------------------------------
// Stub broker
// ---------------------------------------------------------------------------

/// Per-poll broker behaviour; polls beyond the script answer `NoMatch`.
#[derive(Clone)]
pub enum BrokerScript {
    NoMatch,
    Fail,
    Match {
        offer: String,
        client_nat: NatType,
        relay_url: Option<String>,
    },
}

#[derive(Default)]
pub struct StubBroker {
    script: Mutex<VecDeque<BrokerScript>>,
    polls: Mutex<Vec<PollRequest>>,
    answers: Mutex<Vec<(String, SessionDescription)>>,
}

impl StubBroker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, step: BrokerScript) {
        self.script.lock().expect("lock").push_back(step);
    }

    pub fn poll_count(&self) -> usize {
        self.polls.lock().expect("lock").len()
    }

    pub fn polls(&self) -> Vec<PollRequest> {
        self.polls.lock().expect("lock").clone()
    }

    pub fn answers(&self) -> Vec<(String, SessionDescription)> {
        self.answers.lock().expect("lock").clone()
    }
}

#[async_trait]
impl Broker for StubBroker {
    async fn poll(&self, request: PollRequest) -> Result<PollOutcome, BrokerError> {
        self.polls.lock().expect("lock").push(request);
        let step = self
            .script
            .lock()
            .expect("lock")
            .pop_front()
            .unwrap_or(BrokerScript::NoMatch);
        match step {
            BrokerScript::NoMatch => Ok(PollOutcome::NoMatch),
            BrokerScript::Fail => Err(BrokerError::Status(500)),
            BrokerScript::Match {
                offer,
                client_nat,
                relay_url,
            } => Ok(PollOutcome::Matched {
                offer,
                client_nat,
                relay_url,
            }),
        }
    }

    async fn answer(
        &self,
        sid: &str,
        answer: &SessionDescription,
    ) -> Result<(), BrokerError> {
        self.answers
            .lock()
            .expect("lock")
            .push((sid.to_string(), answer.clone()));
        Ok(())
    }
}
