//! Native-mode transport: capture and encoding delegated to an external
//! encoder process.
//!
//! This transport never touches local capture devices; the encoder already
//! holds them. Call control goes over the encoder's control plane, and media
//! arrives as pre-encoded chunks on binary WebSockets that feed progressive
//! buffers. SDP and ICE are entirely the encoder's business.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};

use async_trait::async_trait;
use futures_util::StreamExt;
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;

use super::{MediaStream, Transport, TransportEvent};
use crate::error::CallError;
use crate::media::{
    MediaBuffer, MediaBufferConfig, MediaLane, StallConfig, StallMonitor, SurfaceFactory,
};
use crate::mode::MediaKind;
use crate::signaling::IceCandidateInit;

/// One live call as reported by the encoder's session list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NativeSessionInfo {
    pub channel_id: String,
    pub remote_peer: String,
    pub media_kind: MediaKind,
}

/// Where the encoder serves a call's media streams.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaEndpoints {
    pub remote_url: String,
    /// Absent when the encoder does not echo a self-view feed.
    pub self_view_url: Option<String>,
}

/// Control plane of the out-of-process encoder.
///
/// All requests are idempotent from the caller's perspective. Toggle and
/// hangup requests are fire-and-forget: a failure is logged, never retried.
#[async_trait]
pub trait ControlClient: Send + Sync {
    async fn start_call(
        &self,
        channel_id: &str,
        remote_peer: &str,
        media_kind: MediaKind,
    ) -> Result<(), CallError>;

    async fn accept_call(&self, channel_id: &str) -> Result<(), CallError>;

    async fn hang_up(&self, channel_id: &str) -> Result<(), CallError>;

    async fn set_track_enabled(
        &self,
        channel_id: &str,
        kind: MediaKind,
        enabled: bool,
    ) -> Result<(), CallError>;

    async fn list_sessions(&self) -> Result<Vec<NativeSessionInfo>, CallError>;

    async fn media_endpoints(&self, channel_id: &str) -> Result<MediaEndpoints, CallError>;
}

#[derive(Debug, Clone, Default)]
pub struct NativeTransportConfig {
    pub buffer: MediaBufferConfig,
    pub stall: StallConfig,
}

/// Delegated-encoding media pipeline.
pub struct NativeTransport {
    channel_id: String,
    remote_peer: String,
    is_initiator: bool,
    control: Arc<dyn ControlClient>,
    surfaces: Arc<dyn SurfaceFactory>,
    events: mpsc::UnboundedSender<TransportEvent>,
    config: NativeTransportConfig,
    readers: StdMutex<Vec<JoinHandle<()>>>,
    monitors: StdMutex<Vec<StallMonitor>>,
    buffers: StdMutex<Vec<Arc<MediaBuffer>>>,
    closed: AtomicBool,
}

impl NativeTransport {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        channel_id: impl Into<String>,
        remote_peer: impl Into<String>,
        is_initiator: bool,
        control: Arc<dyn ControlClient>,
        surfaces: Arc<dyn SurfaceFactory>,
        events: mpsc::UnboundedSender<TransportEvent>,
        config: NativeTransportConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            channel_id: channel_id.into(),
            remote_peer: remote_peer.into(),
            is_initiator,
            control,
            surfaces,
            events,
            config,
            readers: StdMutex::new(Vec::new()),
            monitors: StdMutex::new(Vec::new()),
            buffers: StdMutex::new(Vec::new()),
            closed: AtomicBool::new(false),
        })
    }

    /// Connect one media socket and wire it into a fresh buffer.
    ///
    /// A socket that cannot be reached is fatal; a source that fails to open
    /// (timeout, unsupported codec) only degrades the lane.
    async fn open_lane(
        &self,
        lane: MediaLane,
        url: &str,
    ) -> Result<Option<Arc<MediaBuffer>>, CallError> {
        let (ws, _) = connect_async(url)
            .await
            .map_err(|e| CallError::Transport(format!("media socket {url}: {e}")))?;

        let surface = self.surfaces.surface(&self.channel_id, lane);
        let buffer = MediaBuffer::new(surface.sink.clone(), self.config.buffer.clone());
        if let Err(e) = buffer.open().await {
            warn!(
                "{:?} source for {} did not open ({e}); continuing degraded",
                lane, self.channel_id
            );
            buffer.finish().await;
            return Ok(None);
        }

        let monitor = StallMonitor::spawn(surface.probe.clone(), self.config.stall.clone());
        self.monitors.lock().unwrap().push(monitor);

        let reader = tokio::spawn(pump(ws, buffer.clone()));
        self.readers.lock().unwrap().push(reader);
        self.buffers.lock().unwrap().push(buffer.clone());
        Ok(Some(buffer))
    }

    /// Open the remote and self-view sockets and start feeding playback.
    ///
    /// Also the native restore path: the encoder kept the session alive, so
    /// re-attaching is exactly this, with no renegotiation.
    pub async fn attach_media(&self) -> Result<(), CallError> {
        let endpoints = self.control.media_endpoints(&self.channel_id).await?;

        let remote = self.open_lane(MediaLane::Remote, &endpoints.remote_url).await?;
        match remote {
            Some(buffer) => {
                let _ = self
                    .events
                    .send(TransportEvent::RemoteMedia(MediaStream::Buffered(
                        buffer.clone(),
                    )));
                // Connected once the first remote chunk actually rendered.
                let events = self.events.clone();
                let waiter = tokio::spawn(async move {
                    buffer.wait_first_append().await;
                    let _ = events.send(TransportEvent::Connected);
                });
                self.readers.lock().unwrap().push(waiter);
            }
            None => {
                // Degraded call still carries signaling and encoder-side audio.
                let _ = self.events.send(TransportEvent::Connected);
            }
        }

        if let Some(url) = &endpoints.self_view_url {
            if let Some(buffer) = self.open_lane(MediaLane::SelfView, url).await? {
                let _ = self
                    .events
                    .send(TransportEvent::LocalMedia(MediaStream::Buffered(buffer)));
            }
        }
        Ok(())
    }

    fn request_track_enabled(&self, kind: MediaKind, enabled: bool) {
        let control = self.control.clone();
        let channel_id = self.channel_id.clone();
        tokio::spawn(async move {
            if let Err(e) = control.set_track_enabled(&channel_id, kind, enabled).await {
                warn!("toggle request for {channel_id} failed: {e}");
            }
        });
    }
}

#[async_trait]
impl Transport for NativeTransport {
    async fn setup(&self, media_kind: MediaKind) -> Result<(), CallError> {
        if self.is_initiator {
            self.control
                .start_call(&self.channel_id, &self.remote_peer, media_kind)
                .await
        } else {
            self.control.accept_call(&self.channel_id).await
        }
    }

    async fn on_ack(&self) -> Result<(), CallError> {
        info!("peer ready; opening media sockets for {}", self.channel_id);
        self.attach_media().await
    }

    // The encoder owns the offer/answer/ICE exchange; negotiation signals
    // reaching a native session carry nothing for us.
    async fn on_offer(&self, _sdp: &str) -> Result<(), CallError> {
        debug!("ignoring sdp offer in native mode for {}", self.channel_id);
        Ok(())
    }

    async fn on_answer(&self, _sdp: &str) -> Result<(), CallError> {
        debug!("ignoring sdp answer in native mode for {}", self.channel_id);
        Ok(())
    }

    async fn on_candidate(&self, _candidate: IceCandidateInit) -> Result<(), CallError> {
        debug!("ignoring ice candidate in native mode for {}", self.channel_id);
        Ok(())
    }

    fn set_audio_enabled(&self, enabled: bool) {
        self.request_track_enabled(MediaKind::Audio, enabled);
    }

    fn set_video_enabled(&self, enabled: bool) {
        self.request_track_enabled(MediaKind::Video, enabled);
    }

    async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        for reader in self.readers.lock().unwrap().drain(..) {
            reader.abort();
        }
        self.monitors.lock().unwrap().clear();
        let buffers: Vec<_> = self.buffers.lock().unwrap().drain(..).collect();
        for buffer in buffers {
            buffer.finish().await;
        }
        if let Err(e) = self.control.hang_up(&self.channel_id).await {
            warn!("encoder hangup for {} failed: {e}", self.channel_id);
        }
    }
}

type WsStream =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

/// Feed socket chunks into the buffer until the socket ends, then close the
/// buffer stream cleanly.
async fn pump(mut ws: WsStream, buffer: Arc<MediaBuffer>) {
    while let Some(message) = ws.next().await {
        match message {
            Ok(Message::Binary(data)) => buffer.push(data.into()).await,
            Ok(Message::Close(_)) => break,
            Ok(_) => {}
            Err(e) => {
                debug!("media socket read ended: {e}");
                break;
            }
        }
    }
    buffer.finish().await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::testutil::{FakeControl, FakeSink, FakeSurfaces};
    use futures_util::SinkExt;
    use std::time::Duration;
    use tokio::net::TcpListener;

    /// One-shot media server: accepts a socket, sends the chunks, closes.
    async fn serve_chunks(chunks: Vec<Vec<u8>>) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
            for chunk in chunks {
                ws.send(Message::Binary(chunk.into())).await.unwrap();
            }
            ws.close(None).await.unwrap();
        });
        format!("ws://{addr}")
    }

    fn transport(
        control: Arc<FakeControl>,
        sink: Arc<FakeSink>,
        is_initiator: bool,
    ) -> (Arc<NativeTransport>, mpsc::UnboundedReceiver<TransportEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let transport = NativeTransport::new(
            "nc-test",
            "peer-b",
            is_initiator,
            control,
            Arc::new(FakeSurfaces { sink }),
            tx,
            NativeTransportConfig::default(),
        );
        (transport, rx)
    }

    #[tokio::test]
    async fn test_setup_routes_to_start_or_accept() {
        let control = Arc::new(FakeControl::default());
        let sink = Arc::new(FakeSink::default());

        let (initiator, _rx) = transport(control.clone(), sink.clone(), true);
        initiator.setup(MediaKind::Video).await.unwrap();
        assert_eq!(
            control.started.lock().unwrap()[0],
            ("nc-test".into(), "peer-b".into(), MediaKind::Video)
        );

        let (callee, _rx) = transport(control.clone(), sink, false);
        callee.setup(MediaKind::Video).await.unwrap();
        assert_eq!(control.accepted.lock().unwrap()[0], "nc-test");
    }

    #[tokio::test]
    async fn test_ack_streams_chunks_and_connects_on_first_render() {
        let control = Arc::new(FakeControl::default());
        let url = serve_chunks(vec![vec![1, 2], vec![3]]).await;
        *control.endpoints.lock().unwrap() = Some(MediaEndpoints {
            remote_url: url,
            self_view_url: None,
        });
        let sink = Arc::new(FakeSink::default());
        let (transport, mut rx) = transport(control, sink.clone(), false);

        transport.on_ack().await.unwrap();

        let first = rx.recv().await.unwrap();
        assert!(matches!(
            first,
            TransportEvent::RemoteMedia(MediaStream::Buffered(_))
        ));
        let second = rx.recv().await.unwrap();
        assert!(matches!(second, TransportEvent::Connected));

        // Both chunks land in the playback sink in order.
        let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
        loop {
            if sink.appends.lock().unwrap().len() == 2 {
                break;
            }
            assert!(tokio::time::Instant::now() < deadline, "chunks never landed");
            tokio::task::yield_now().await;
        }
        let appends = sink.appends.lock().unwrap();
        assert_eq!(appends[0].as_ref(), &[1, 2]);
        assert_eq!(appends[1].as_ref(), &[3]);
    }

    #[tokio::test]
    async fn test_unopenable_source_degrades_instead_of_failing() {
        let control = Arc::new(FakeControl::default());
        let url = serve_chunks(vec![vec![9]]).await;
        *control.endpoints.lock().unwrap() = Some(MediaEndpoints {
            remote_url: url,
            self_view_url: None,
        });
        let sink = Arc::new(FakeSink {
            refuse_open: true,
            ..Default::default()
        });
        let (transport, mut rx) = transport(control, sink.clone(), false);

        transport.on_ack().await.unwrap();

        // Still connected, but no media surfaced for the dead lane.
        let event = rx.recv().await.unwrap();
        assert!(matches!(event, TransportEvent::Connected));
        assert!(sink.appends.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_unreachable_media_socket_is_fatal() {
        let control = Arc::new(FakeControl::default());
        *control.endpoints.lock().unwrap() = Some(MediaEndpoints {
            remote_url: "ws://127.0.0.1:1".into(),
            self_view_url: None,
        });
        let sink = Arc::new(FakeSink::default());
        let (transport, _rx) = transport(control, sink, false);

        let result = transport.on_ack().await;
        assert!(matches!(result, Err(CallError::Transport(_))));
    }

    #[tokio::test]
    async fn test_toggles_are_forwarded_to_the_encoder() {
        let control = Arc::new(FakeControl::default());
        let sink = Arc::new(FakeSink::default());
        let (transport, _rx) = transport(control.clone(), sink, true);

        transport.set_audio_enabled(false);
        transport.set_video_enabled(true);

        let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
        while control.toggles.lock().unwrap().len() < 2 {
            assert!(tokio::time::Instant::now() < deadline, "toggles never arrived");
            tokio::task::yield_now().await;
        }
        let toggles = control.toggles.lock().unwrap();
        assert!(toggles.contains(&(MediaKind::Audio, false)));
        assert!(toggles.contains(&(MediaKind::Video, true)));
    }

    #[tokio::test]
    async fn test_close_is_idempotent_and_hangs_up_once() {
        let control = Arc::new(FakeControl::default());
        let sink = Arc::new(FakeSink::default());
        let (transport, _rx) = transport(control.clone(), sink, true);

        transport.close().await;
        transport.close().await;
        assert_eq!(control.hangups.lock().unwrap().len(), 1);
    }
}
