//! Outbound WebSocket relay transport.
//!
//! Implements the core's [`RelayDialer`] capability on top of
//! tokio-tungstenite. Each dial spawns one connection task that owns the
//! socket: the read half feeds the session's event stream, the write half
//! drains an outbound queue while keeping the buffered-byte counter the
//! session consults for backpressure.
//!
//! Dialling never blocks the caller. Connection failures surface as
//! `Error` followed by `Closed` on the event stream, which is exactly the
//! shape the session's relay-connect timeout expects.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use url::Url;

use proxy_core::{RelayDialer, TransportError, TransportEvent, TransportPair, TransportSink};

/// Dials relays over `wss://`.
#[derive(Debug, Default)]
pub struct WsDialer;

impl WsDialer {
    pub fn new() -> Self {
        Self
    }
}

impl RelayDialer for WsDialer {
    fn dial(&self, url: &Url) -> TransportPair {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (chunk_tx, chunk_rx) = mpsc::unbounded_channel::<Vec<u8>>();
        let buffered = Arc::new(AtomicUsize::new(0));

        tokio::spawn(run_connection(
            url.clone(),
            event_tx,
            chunk_rx,
            Arc::clone(&buffered),
        ));

        TransportPair {
            sink: Box::new(WsSink {
                chunk_tx: Some(chunk_tx),
                buffered,
            }),
            events: event_rx,
        }
    }
}

/// Write half handed to the session. Sending enqueues towards the
/// connection task; closing drops the queue sender, which the task takes
/// as its cue to send a close frame and wind down.
struct WsSink {
    chunk_tx: Option<mpsc::UnboundedSender<Vec<u8>>>,
    buffered: Arc<AtomicUsize>,
}

impl TransportSink for WsSink {
    fn send(&mut self, chunk: Vec<u8>) -> Result<(), TransportError> {
        let tx = self.chunk_tx.as_ref().ok_or(TransportError::Closed)?;
        self.buffered.fetch_add(chunk.len(), Ordering::Relaxed);
        tx.send(chunk).map_err(|_| TransportError::Closed)
    }

    fn buffered_amount(&self) -> usize {
        self.buffered.load(Ordering::Relaxed)
    }

    fn close(&mut self) {
        self.chunk_tx = None;
    }
}

async fn run_connection(
    url: Url,
    events: mpsc::UnboundedSender<TransportEvent>,
    mut chunks: mpsc::UnboundedReceiver<Vec<u8>>,
    buffered: Arc<AtomicUsize>,
) {
    let host = url.host_str().unwrap_or("<none>").to_string();

    let stream = match connect_async(url.as_str()).await {
        Ok((stream, _response)) => stream,
        Err(err) => {
            tracing::debug!(%host, %err, "relay connect failed");
            let _ = events.send(TransportEvent::Error(TransportError::Connect(
                err.to_string(),
            )));
            let _ = events.send(TransportEvent::Closed);
            return;
        }
    };

    tracing::debug!(%host, "relay websocket open");
    if events.send(TransportEvent::Opened).is_err() {
        // Session is already gone; nothing to relay for.
        return;
    }

    let (mut write, mut read) = stream.split();

    loop {
        tokio::select! {
            incoming = read.next() => match incoming {
                Some(Ok(Message::Binary(payload))) => {
                    if events
                        .send(TransportEvent::Message(payload.to_vec()))
                        .is_err()
                    {
                        break;
                    }
                }
                Some(Ok(Message::Text(text))) => {
                    // Relays speak binary; tolerate text frames anyway.
                    if events
                        .send(TransportEvent::Message(text.as_str().as_bytes().to_vec()))
                        .is_err()
                    {
                        break;
                    }
                }
                Some(Ok(Message::Close(_))) | None => {
                    let _ = events.send(TransportEvent::Closed);
                    break;
                }
                // Ping/pong and raw frames are tungstenite's business.
                Some(Ok(_)) => {}
                Some(Err(err)) => {
                    tracing::debug!(%host, %err, "relay read failed");
                    let _ = events.send(TransportEvent::Error(TransportError::Io(
                        err.to_string(),
                    )));
                    let _ = events.send(TransportEvent::Closed);
                    break;
                }
            },

            outgoing = chunks.recv() => match outgoing {
                Some(chunk) => {
                    let len = chunk.len();
                    let result = write.send(Message::Binary(chunk.into())).await;
                    buffered.fetch_sub(len, Ordering::Relaxed);
                    if let Err(err) = result {
                        tracing::debug!(%host, %err, "relay write failed");
                        let _ = events.send(TransportEvent::Error(TransportError::Io(
                            err.to_string(),
                        )));
                        let _ = events.send(TransportEvent::Closed);
                        break;
                    }
                }
                // Sink closed: say goodbye and wind down.
                None => {
                    let _ = write.send(Message::Close(None)).await;
                    break;
                }
            },
        }
    }

    tracing::debug!(%host, "relay connection task done");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn dial_failure_surfaces_as_error_then_closed() {
        // Nothing listens on this port; the connect must fail fast.
        let url = Url::parse("ws://127.0.0.1:9/").expect("url");
        let mut pair = WsDialer::new().dial(&url);

        match pair.events.recv().await {
            Some(TransportEvent::Error(TransportError::Connect(_))) => {}
            other => panic!("expected connect error, got {other:?}"),
        }
        assert!(matches!(pair.events.recv().await, Some(TransportEvent::Closed)));
    }

    #[tokio::test]
    async fn sink_rejects_sends_after_close() {
        let url = Url::parse("ws://127.0.0.1:9/").expect("url");
        let mut pair = WsDialer::new().dial(&url);

        pair.sink.close();
        assert!(matches!(
            pair.sink.send(b"late".to_vec()),
            Err(TransportError::Closed)
        ));
    }

    #[test]
    fn buffered_amount_tracks_queued_bytes() {
        let (chunk_tx, _chunk_rx) = mpsc::unbounded_channel();
        let mut sink = WsSink {
            chunk_tx: Some(chunk_tx),
            buffered: Arc::new(AtomicUsize::new(0)),
        };

        sink.send(vec![0u8; 16]).expect("send queues");
        sink.send(vec![0u8; 8]).expect("send queues");
        assert_eq!(sink.buffered_amount(), 24);
    }
}
