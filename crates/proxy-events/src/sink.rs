use std::path::PathBuf;
use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::event::{EventKind, ProxyEvent};

/// How often the reporter logs an activity summary for a quiet proxy.
const SUMMARY_INTERVAL: Duration = Duration::from_secs(60 * 60);

/// Receiving half of the event channel, consumed by a [`Reporter`] (or a
/// test harness inspecting raw events).
pub type EventStream = mpsc::UnboundedReceiver<ProxyEvent>;

/// Cheap, cloneable handle for emitting [`ProxyEvent`]s.
///
/// Shared freely across the scheduler and every session task. Emission
/// never blocks; if the reporter is gone the event is dropped silently,
/// since activity reporting must never take a session down with it.
#[derive(Clone)]
pub struct EventSink {
    tx: mpsc::UnboundedSender<ProxyEvent>,
}

impl EventSink {
    /// Create a sink and the stream its events arrive on.
    pub fn channel() -> (Self, EventStream) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    /// Emit one event, stamped now.
    pub fn emit(&self, session: Option<String>, kind: EventKind) {
        let _ = self.tx.send(ProxyEvent::new(session, kind));
    }
}

/// Background consumer of the event stream.
///
/// Keeps the connected-client tally, mirrors every event into `tracing`,
/// logs a periodic summary, and optionally appends each event as a JSON
/// line to an activity log file.
pub struct Reporter {
    log_path: Option<PathBuf>,
}

impl Reporter {
    pub fn new(log_path: Option<PathBuf>) -> Self {
        Self { log_path }
    }

    /// Spawn the reporter task. It exits after the last [`EventSink`]
    /// clone is dropped and the stream drains.
    pub fn spawn(self, stream: EventStream) -> JoinHandle<()> {
        tokio::spawn(run(self.log_path, stream))
    }
}

async fn run(log_path: Option<PathBuf>, mut stream: EventStream) {
    let mut log = match log_path {
        Some(path) => match open_log(&path).await {
            Ok(file) => Some(file),
            Err(err) => {
                tracing::error!(path = %path.display(), %err, "cannot open event log; continuing without");
                None
            }
        },
        None => None,
    };

    let mut connected: u64 = 0;
    let mut served_total: u64 = 0;
    let mut summary = tokio::time::interval(SUMMARY_INTERVAL);
    // The first tick of an interval is immediate; skip it so the first
    // summary arrives a full period in.
    summary.tick().await;

    loop {
        tokio::select! {
            event = stream.recv() => {
                let event = match event {
                    Some(event) => event,
                    None => break,
                };

                match &event.kind {
                    EventKind::ClientConnected => {
                        connected += 1;
                        served_total += 1;
                    }
                    EventKind::ClientDisconnected => {
                        connected = connected.saturating_sub(1);
                    }
                    _ => {}
                }

                trace_event(&event, connected);

                let mut log_broken = false;
                if let Some(file) = log.as_mut() {
                    if let Err(err) = append_line(file, &event).await {
                        tracing::error!(%err, "event log write failed; disabling file logging");
                        log_broken = true;
                    }
                }
                if log_broken {
                    log = None;
                }
            }
            _ = summary.tick() => {
                tracing::info!(connected, served_total, "proxy activity summary");
            }
        }
    }

    if let Some(mut file) = log {
        if let Err(err) = file.flush().await {
            tracing::error!(%err, "final event log flush failed");
        }
    }
    tracing::debug!("event reporter shutting down");
}

fn trace_event(event: &ProxyEvent, connected: u64) {
    let session = event.session.as_deref().unwrap_or("-");
    match &event.kind {
        EventKind::ClientConnected | EventKind::ClientDisconnected => {
            tracing::info!(session, connected, "{}", event.kind.label());
        }
        EventKind::SessionClosed { reason } => {
            tracing::info!(session, %reason, "session closed");
        }
        EventKind::RelayConnected { relay } => {
            tracing::debug!(session, %relay, "relay connected");
        }
        EventKind::NatUpdated { nat } => {
            tracing::info!(%nat, "nat classification updated");
        }
        EventKind::ProxyStarted { version } => {
            tracing::info!(%version, "proxy started");
        }
        EventKind::ClientMatched => {
            tracing::debug!(session, "client matched");
        }
    }
}

async fn open_log(path: &PathBuf) -> std::io::Result<tokio::fs::File> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await
}

async fn append_line(file: &mut tokio::fs::File, event: &ProxyEvent) -> std::io::Result<()> {
    let mut line = serde_json::to_vec(event).map_err(std::io::Error::other)?;
    line.push(b'\n');
    file.write_all(&line).await?;
    file.flush().await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn writes_one_json_line_per_event() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("events.jsonl");

        let (sink, stream) = EventSink::channel();
        let handle = Reporter::new(Some(path.clone())).spawn(stream);

        sink.emit(Some("aabbccddeeff0011".to_string()), EventKind::ClientConnected);
        sink.emit(
            Some("aabbccddeeff0011".to_string()),
            EventKind::SessionClosed {
                reason: "client closed".to_string(),
            },
        );
        drop(sink);
        handle.await.expect("reporter exits cleanly");

        let contents = std::fs::read_to_string(&path).expect("log readable");
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines.len(), 2);

        let first: ProxyEvent = serde_json::from_str(lines[0]).expect("valid json line");
        assert!(matches!(first.kind, EventKind::ClientConnected));
        let second: ProxyEvent = serde_json::from_str(lines[1]).expect("valid json line");
        assert!(matches!(second.kind, EventKind::SessionClosed { .. }));
    }

    #[tokio::test]
    async fn runs_without_a_log_file() {
        let (sink, stream) = EventSink::channel();
        let handle = Reporter::new(None).spawn(stream);

        sink.emit(None, EventKind::ClientMatched);
        drop(sink);
        handle.await.expect("reporter exits cleanly");
    }
}
