use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use proxy_events::{EventKind, EventSink};
use rate_limit::RateLimit;
use tokio::sync::{broadcast, mpsc};
use tokio::time::{sleep_until, Duration, Instant};

use crate::broker::{Broker, PollOutcome, PollRequest};
use crate::config::Config;
use crate::nat::NatType;
use crate::session::{new_session_id, ProxyPair, RunningSession, SessionNotice};
use crate::transport::{PeerConnector, RelayDialer};

/// Consecutive restricted-client failures before we conclude our own NAT
/// is the problem.
const NAT_FAILURE_THRESHOLD: u32 = 3;

/// Adaptive polling state: how eagerly to ask the broker for clients, and
/// what we currently believe about our NAT.
///
/// Failures (a matched client whose datachannel never opened) back the
/// poll interval off towards the slowest bound; successes walk it back.
/// Repeated failures against restricted clients teach us that we are the
/// restricted side; that learning is one-way for the life of the process.
#[derive(Debug, Clone)]
pub struct PollPolicy {
    interval: Duration,
    default_interval: Duration,
    fast_interval: Duration,
    slowest_interval: Duration,
    adjustment: Duration,
    nat: NatType,
    nat_failures: u32,
    max_clients: usize,
}

impl PollPolicy {
    pub fn new(config: &Config) -> Self {
        Self {
            interval: config.poll_interval,
            default_interval: config.poll_interval,
            fast_interval: config.fast_poll_interval,
            slowest_interval: config.slowest_poll_interval,
            adjustment: config.poll_adjustment,
            nat: config.nat,
            nat_failures: 0,
            max_clients: config.max_clients,
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn nat(&self) -> NatType {
        self.nat
    }

    pub fn max_clients(&self) -> usize {
        self.max_clients
    }

    /// A matched client came up: speed polling back up.
    pub fn on_success(&mut self) {
        self.nat_failures = 0;
        self.interval = self
            .interval
            .saturating_sub(self.adjustment)
            .max(self.default_interval);
        if self.nat == NatType::Unrestricted {
            self.interval = self.fast_interval;
            self.max_clients = 2;
        }
    }

    /// A matched client never connected: back off, and account the
    /// failure towards NAT inference when the client was restricted.
    /// Returns true when this failure flipped our classification.
    pub fn on_failure(&mut self, client_nat: NatType) -> bool {
        self.interval = (self.interval + self.adjustment).min(self.slowest_interval);

        if client_nat != NatType::Restricted {
            return false;
        }
        self.nat_failures += 1;
        if self.nat_failures < NAT_FAILURE_THRESHOLD {
            return false;
        }

        self.nat_failures = 0;
        self.max_clients = 1;
        let flipped = self.nat != NatType::Restricted;
        self.nat = NatType::Restricted;
        flipped
    }
}

struct SessionEntry {
    running: RunningSession,
    /// Whether the client's datachannel has opened.
    ready: bool,
    client_nat: NatType,
}

struct Probe {
    at: Instant,
    sid: String,
}

/// Owns every live session and the broker poll loop.
pub struct Scheduler {
    config: Arc<Config>,
    broker: Arc<dyn Broker>,
    connector: Arc<dyn PeerConnector>,
    dialer: Arc<dyn RelayDialer>,
    rate: Arc<RateLimit>,
    events: EventSink,
    policy: PollPolicy,
    sessions: HashMap<String, SessionEntry>,
    /// Pending datachannel-timeout checks, in deadline order.
    probes: VecDeque<Probe>,
    /// Readiness of sessions that closed before their probe fired.
    settled: HashMap<String, (bool, NatType)>,
    retries: u64,
    notice_tx: mpsc::UnboundedSender<SessionNotice>,
    notice_rx: Option<mpsc::UnboundedReceiver<SessionNotice>>,
}

impl Scheduler {
    pub fn new(
        config: Arc<Config>,
        broker: Arc<dyn Broker>,
        connector: Arc<dyn PeerConnector>,
        dialer: Arc<dyn RelayDialer>,
        rate: Arc<RateLimit>,
        events: EventSink,
    ) -> Self {
        let (notice_tx, notice_rx) = mpsc::unbounded_channel();
        let policy = PollPolicy::new(&config);
        Self {
            config,
            broker,
            connector,
            dialer,
            rate,
            events,
            policy,
            sessions: HashMap::new(),
            probes: VecDeque::new(),
            settled: HashMap::new(),
            retries: 0,
            notice_tx,
            notice_rx: Some(notice_rx),
        }
    }

    /// Broker polls attempted so far.
    pub fn retries(&self) -> u64 {
        self.retries
    }

    /// Sessions currently owned, in any pre-terminal state.
    pub fn live_sessions(&self) -> usize {
        self.sessions.len()
    }

    pub fn policy(&self) -> &PollPolicy {
        &self.policy
    }

    /// Serve until `shutdown` fires, then close every live session.
    ///
    /// The poll timer re-arms unconditionally: a proxy at capacity skips
    /// the broker pass but keeps ticking, so freed capacity is noticed on
    /// the next tick without extra machinery.
    pub async fn run(mut self, mut shutdown: broadcast::Receiver<()>) {
        let Some(mut notices) = self.notice_rx.take() else {
            return;
        };

        tracing::info!(
            broker = %self.config.broker_url,
            nat = %self.policy.nat(),
            "serving clients"
        );

        let mut next_poll = Instant::now();
        loop {
            let probe_sleep = self.probes.front().map(|p| p.at).unwrap_or_else(Instant::now);

            tokio::select! {
                _ = shutdown.recv() => break,

                notice = notices.recv() => {
                    if let Some(notice) = notice {
                        self.handle_notice(notice);
                    }
                }

                _ = sleep_until(next_poll) => {
                    if self.sessions.len() < self.policy.max_clients() {
                        self.poll_broker().await;
                    } else {
                        tracing::debug!(
                            live = self.sessions.len(),
                            "at capacity; skipping this poll"
                        );
                    }
                    next_poll = Instant::now() + self.policy.interval();
                }

                _ = sleep_until(probe_sleep), if !self.probes.is_empty() => {
                    if let Some(probe) = self.probes.pop_front() {
                        self.run_probe(&probe.sid);
                    }
                }
            }
        }

        self.disable().await;
    }

    /// One rendezvous pass: allocate a candidate session, ask the broker
    /// for a client, and on a match drive signalling to completion.
    async fn poll_broker(&mut self) {
        self.retries += 1;

        let sid = new_session_id();
        let peer = match self.connector.connect(&self.config.ice_servers).await {
            Ok(peer) => peer,
            Err(err) => {
                tracing::warn!(%err, "peer transport unavailable; will retry");
                return;
            }
        };

        let mut pair = ProxyPair::new(
            sid.clone(),
            Arc::clone(&self.config),
            Arc::clone(&self.rate),
            peer,
            Arc::clone(&self.dialer),
            self.events.clone(),
            self.notice_tx.clone(),
        );

        let request = PollRequest {
            sid: sid.clone(),
            proxy_type: self.config.proxy_type.clone(),
            nat: self.policy.nat(),
            clients: self.sessions.len(),
            accepted_relay_pattern: self.config.allowed_relay_pattern.clone(),
        };

        tracing::debug!(sid = %sid, interval = ?self.policy.interval(), "polling broker");

        match self.broker.poll(request).await {
            Err(err) => {
                tracing::warn!(sid = %sid, %err, "broker poll failed");
                pair.discard("broker failure");
            }
            Ok(PollOutcome::NoMatch) => {
                tracing::debug!(sid = %sid, "no client match");
                pair.discard("no match");
            }
            Ok(PollOutcome::Matched {
                offer,
                client_nat,
                relay_url,
            }) => {
                self.events.emit(Some(sid.clone()), EventKind::ClientMatched);
                match pair.receive_offer(&offer, relay_url.as_deref()).await {
                    Err(err) => {
                        tracing::warn!(sid = %sid, %err, "rejecting client offer");
                        pair.discard("offer rejected");
                    }
                    Ok(answer) => {
                        if let Err(err) = self.broker.answer(&sid, &answer).await {
                            // Submission failures are not fatal here; the
                            // datachannel probe will reap the session if
                            // the client never got our answer.
                            tracing::warn!(sid = %sid, %err, "answer submission failed");
                        }
                        let running = pair.spawn();
                        self.sessions.insert(
                            sid.clone(),
                            SessionEntry {
                                running,
                                ready: false,
                                client_nat,
                            },
                        );
                        self.probes.push_back(Probe {
                            at: Instant::now() + self.config.datachannel_timeout,
                            sid,
                        });
                    }
                }
            }
        }
    }

    fn handle_notice(&mut self, notice: SessionNotice) {
        match notice {
            SessionNotice::Ready { sid } => {
                if let Some(entry) = self.sessions.get_mut(&sid) {
                    entry.ready = true;
                }
            }
            SessionNotice::Closed { sid, reason } => {
                if let Some(entry) = self.sessions.remove(&sid) {
                    tracing::debug!(sid = %sid, %reason, live = self.sessions.len(), "session removed");
                    // Keep the outcome around if its probe has not fired.
                    if self.probes.iter().any(|p| p.sid == sid) {
                        self.settled.insert(sid, (entry.ready, entry.client_nat));
                    }
                }
            }
        }
    }

    /// The datachannel-timeout check for one earlier match: did the client
    /// actually connect? Feeds the adaptive policy either way.
    fn run_probe(&mut self, sid: &str) {
        let (ready, client_nat) = if let Some(entry) = self.sessions.get(sid) {
            (entry.ready, entry.client_nat)
        } else if let Some(settled) = self.settled.remove(sid) {
            settled
        } else {
            return;
        };

        if ready {
            self.policy.on_success();
            tracing::debug!(
                sid = %sid,
                interval = ?self.policy.interval(),
                "client connected in time"
            );
        } else {
            if let Some(entry) = self.sessions.get(sid) {
                tracing::debug!(sid = %sid, "datachannel timeout; closing session");
                entry.running.close();
            }
            let flipped = self.policy.on_failure(client_nat);
            tracing::debug!(
                sid = %sid,
                interval = ?self.policy.interval(),
                nat_failure = client_nat == NatType::Restricted,
                "client never connected"
            );
            if flipped {
                tracing::info!("repeated restricted-client failures; assuming restricted NAT");
                self.events.emit(
                    None,
                    EventKind::NatUpdated {
                        nat: self.policy.nat().to_string(),
                    },
                );
            }
        }
    }

    /// Stop polling and close every live session.
    async fn disable(&mut self) {
        tracing::info!(live = self.sessions.len(), "disabling proxy");
        for entry in self.sessions.values() {
            entry.running.close();
        }
        for (_, entry) in self.sessions.drain() {
            let _ = entry.running.task.await;
        }
        self.probes.clear();
        self.settled.clear();
    }
}
