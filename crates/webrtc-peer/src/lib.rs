//! WebRTC peer endpoint.
//!
//! Implements the core's [`PeerConnector`]/[`PeerEndpoint`] capabilities
//! on top of the `webrtc` crate. The remote client is the offerer and
//! creates the data channel; we answer and wait. Channel traffic is
//! bridged onto the core's event-stream transport surface: callbacks feed
//! an event channel, and a writer task drains the outbound queue into
//! `RTCDataChannel::send` while maintaining the buffered-byte counter.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::APIBuilder;
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::data_channel::RTCDataChannel;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;

use proxy_core::{
    PeerConnector, PeerEndpoint, SessionDescription, SignalingEvent, TransportError,
    TransportEvent, TransportPair, TransportSink,
};

/// Builds one peer connection per broker match.
#[derive(Debug, Default)]
pub struct WebRtcConnector;

impl WebRtcConnector {
    pub fn new() -> Self {
        Self
    }
}

fn signaling_err(err: webrtc::Error) -> TransportError {
    TransportError::Signaling(err.to_string())
}

#[async_trait]
impl PeerConnector for WebRtcConnector {
    async fn connect(
        &self,
        ice_servers: &[String],
    ) -> Result<Box<dyn PeerEndpoint>, TransportError> {
        // Media engine and interceptors are required boilerplate even for
        // a data-only connection.
        let mut media_engine = MediaEngine::default();
        media_engine
            .register_default_codecs()
            .map_err(signaling_err)?;
        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut media_engine)
            .map_err(signaling_err)?;
        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let config = RTCConfiguration {
            ice_servers: vec![RTCIceServer {
                urls: ice_servers.to_vec(),
                ..Default::default()
            }],
            ..Default::default()
        };

        let pc = Arc::new(
            api.new_peer_connection(config)
                .await
                .map_err(signaling_err)?,
        );

        let (signal_tx, signal_rx) = mpsc::unbounded_channel();

        // The client opens the data channel towards us.
        let channel_signal = signal_tx.clone();
        pc.on_data_channel(Box::new(move |dc: Arc<RTCDataChannel>| {
            let signal = channel_signal.clone();
            Box::pin(async move {
                tracing::debug!(label = dc.label(), "data channel arrived");
                let pair = wrap_channel(dc);
                let _ = signal.send(SignalingEvent::Channel(pair));
            })
        }));

        let state_signal = signal_tx.clone();
        pc.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
            let signal = state_signal.clone();
            Box::pin(async move {
                if matches!(
                    state,
                    RTCPeerConnectionState::Failed
                        | RTCPeerConnectionState::Disconnected
                        | RTCPeerConnectionState::Closed
                ) {
                    let _ = signal.send(SignalingEvent::Failed(format!(
                        "peer connection {state}"
                    )));
                }
            })
        }));

        // ICE completion: resolve the library's promise into our event.
        let mut gathering_done = pc.gathering_complete_promise().await;
        let ice_signal = signal_tx;
        tokio::spawn(async move {
            let _ = gathering_done.recv().await;
            let _ = ice_signal.send(SignalingEvent::IceComplete);
        });

        Ok(Box::new(WebRtcEndpoint {
            pc,
            signals: signal_rx,
        }))
    }
}

struct WebRtcEndpoint {
    pc: Arc<RTCPeerConnection>,
    signals: mpsc::UnboundedReceiver<SignalingEvent>,
}

#[async_trait]
impl PeerEndpoint for WebRtcEndpoint {
    async fn apply_offer(&mut self, offer: &SessionDescription) -> Result<(), TransportError> {
        let remote =
            RTCSessionDescription::offer(offer.sdp.clone()).map_err(signaling_err)?;
        self.pc
            .set_remote_description(remote)
            .await
            .map_err(signaling_err)
    }

    async fn create_answer(&mut self) -> Result<(), TransportError> {
        let answer = self.pc.create_answer(None).await.map_err(signaling_err)?;
        self.pc
            .set_local_description(answer)
            .await
            .map_err(signaling_err)
    }

    async fn local_description(&self) -> Option<SessionDescription> {
        self.pc
            .local_description()
            .await
            .map(|description| SessionDescription {
                kind: description.sdp_type.to_string(),
                sdp: description.sdp,
            })
    }

    async fn next_event(&mut self) -> Option<SignalingEvent> {
        self.signals.recv().await
    }
}

impl Drop for WebRtcEndpoint {
    fn drop(&mut self) {
        let pc = Arc::clone(&self.pc);
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                let _ = pc.close().await;
            });
        }
    }
}

/// Bridge one `RTCDataChannel` onto the core transport surface.
fn wrap_channel(dc: Arc<RTCDataChannel>) -> TransportPair {
    let (event_tx, event_rx) = mpsc::unbounded_channel();
    let buffered = Arc::new(AtomicUsize::new(0));

    let open_events = event_tx.clone();
    dc.on_open(Box::new(move || {
        let events = open_events.clone();
        Box::pin(async move {
            let _ = events.send(TransportEvent::Opened);
        })
    }));

    let message_events = event_tx.clone();
    dc.on_message(Box::new(move |msg: DataChannelMessage| {
        let events = message_events.clone();
        Box::pin(async move {
            let _ = events.send(TransportEvent::Message(msg.data.to_vec()));
        })
    }));

    let close_events = event_tx.clone();
    dc.on_close(Box::new(move || {
        let events = close_events.clone();
        Box::pin(async move {
            let _ = events.send(TransportEvent::Closed);
        })
    }));

    let error_events = event_tx.clone();
    dc.on_error(Box::new(move |err| {
        let events = error_events.clone();
        Box::pin(async move {
            let _ = events.send(TransportEvent::Error(TransportError::Io(err.to_string())));
        })
    }));

    let (chunk_tx, mut chunk_rx) = mpsc::unbounded_channel::<Vec<u8>>();
    let writer_dc = Arc::clone(&dc);
    let writer_buffered = Arc::clone(&buffered);
    tokio::spawn(async move {
        while let Some(chunk) = chunk_rx.recv().await {
            let len = chunk.len();
            let result = writer_dc.send(&Bytes::from(chunk)).await;
            writer_buffered.fetch_sub(len, Ordering::Relaxed);
            if let Err(err) = result {
                tracing::debug!(%err, "data channel write failed");
                let _ = event_tx.send(TransportEvent::Error(TransportError::Io(
                    err.to_string(),
                )));
                break;
            }
        }
        let _ = writer_dc.close().await;
    });

    TransportPair {
        sink: Box::new(DcSink {
            chunk_tx: Some(chunk_tx),
            buffered,
        }),
        events: event_rx,
    }
}

/// Write half handed to the session; mirrors the relay sink's contract.
struct DcSink {
    chunk_tx: Option<mpsc::UnboundedSender<Vec<u8>>>,
    buffered: Arc<AtomicUsize>,
}

impl TransportSink for DcSink {
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
