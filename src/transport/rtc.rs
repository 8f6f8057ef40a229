//! Browser-mode transport: local capture plus a real-time peer connection.
//!
//! Negotiation is glare-free by construction: the initiator creates the offer
//! only after `call-ack`, the callee answers from the offer handler. Trickled
//! ICE candidates arriving before both descriptions are set are held in a
//! gate and flushed exactly once, in arrival order.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};

use async_trait::async_trait;
use log::{debug, info, warn};
use tokio::sync::{mpsc, RwLock};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::APIBuilder;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::track::track_local::TrackLocal;

use super::{LinkState, MediaStream, Transport, TransportEvent};
use crate::error::CallError;
use crate::mode::MediaKind;
use crate::signaling::{IceCandidateInit, Signal, SignalBody, SignalingBus};

/// Local device capture boundary.
///
/// The embedder owns the actual devices; the transport only asks for tracks
/// and flips their enabled state.
#[async_trait]
pub trait MediaCapture: Send + Sync {
    /// Acquire local tracks for the requested media kind.
    async fn capture(
        &self,
        kind: MediaKind,
    ) -> Result<Vec<Arc<dyn TrackLocal + Send + Sync>>, CallError>;

    /// Enable or disable the captured track of the given kind.
    fn set_enabled(&self, kind: MediaKind, enabled: bool);
}

/// Holds trickled candidates until both session descriptions are set.
///
/// The flush happens exactly once per negotiation round; afterwards every
/// candidate passes straight through.
struct CandidateGate {
    inner: StdMutex<GateInner>,
}

#[derive(Default)]
struct GateInner {
    local_set: bool,
    remote_set: bool,
    flushed: bool,
    pending: Vec<IceCandidateInit>,
}

enum Admit {
    Apply(IceCandidateInit),
    Queued,
}

impl CandidateGate {
    fn new() -> Self {
        Self {
            inner: StdMutex::new(GateInner::default()),
        }
    }

    fn admit(&self, candidate: IceCandidateInit) -> Admit {
        let mut inner = self.inner.lock().unwrap();
        if inner.flushed {
            Admit::Apply(candidate)
        } else {
            inner.pending.push(candidate);
            Admit::Queued
        }
    }

    /// Record that the local description is set; returns the flush batch if
    /// this completed the pair.
    fn local_description_set(&self) -> Option<Vec<IceCandidateInit>> {
        let mut inner = self.inner.lock().unwrap();
        inner.local_set = true;
        Self::take_flush(&mut inner)
    }

    fn remote_description_set(&self) -> Option<Vec<IceCandidateInit>> {
        let mut inner = self.inner.lock().unwrap();
        inner.remote_set = true;
        Self::take_flush(&mut inner)
    }

    fn take_flush(inner: &mut GateInner) -> Option<Vec<IceCandidateInit>> {
        if inner.local_set && inner.remote_set && !inner.flushed {
            inner.flushed = true;
            Some(std::mem::take(&mut inner.pending))
        } else {
            None
        }
    }
}

/// Direct peer-to-peer media over a `webrtc` peer connection.
pub struct RtcTransport {
    channel_id: String,
    bus: Arc<dyn SignalingBus>,
    capture: Arc<dyn MediaCapture>,
    events: mpsc::UnboundedSender<TransportEvent>,
    pc: RwLock<Option<Arc<RTCPeerConnection>>>,
    gate: CandidateGate,
    closed: Arc<AtomicBool>,
}

impl RtcTransport {
    pub fn new(
        channel_id: impl Into<String>,
        bus: Arc<dyn SignalingBus>,
        capture: Arc<dyn MediaCapture>,
        events: mpsc::UnboundedSender<TransportEvent>,
    ) -> Arc<Self> {
        Arc::new(Self {
            channel_id: channel_id.into(),
            bus,
            capture,
            events,
            pc: RwLock::new(None),
            gate: CandidateGate::new(),
            closed: Arc::new(AtomicBool::new(false)),
        })
    }

    async fn peer_connection(&self) -> Result<Arc<RTCPeerConnection>, CallError> {
        self.pc
            .read()
            .await
            .clone()
            .ok_or_else(|| CallError::Negotiation("no peer connection".into()))
    }

    async fn publish(&self, body: SignalBody) -> Result<(), CallError> {
        let signal = Signal::new(self.channel_id.clone(), body);
        self.bus.publish(&signal.topic(), &signal).await
    }

    async fn capture_with_fallback(
        &self,
        kind: MediaKind,
    ) -> Result<Vec<Arc<dyn TrackLocal + Send + Sync>>, CallError> {
        match self.capture.capture(kind).await {
            Ok(tracks) => Ok(tracks),
            Err(e) if kind.has_video() => {
                // A degraded audio-only call beats no call.
                warn!("video capture failed ({e}); retrying audio-only");
                self.capture.capture(MediaKind::Audio).await
            }
            Err(e) => Err(e),
        }
    }

    async fn apply_flush(
        &self,
        pc: &Arc<RTCPeerConnection>,
        batch: Vec<IceCandidateInit>,
    ) -> Result<(), CallError> {
        debug!(
            "flushing {} buffered ice candidates for {}",
            batch.len(),
            self.channel_id
        );
        for candidate in batch {
            pc.add_ice_candidate(to_rtc_init(candidate))
                .await
                .map_err(|e| CallError::Negotiation(e.to_string()))?;
        }
        Ok(())
    }
}

#[async_trait]
impl Transport for RtcTransport {
    async fn setup(&self, media_kind: MediaKind) -> Result<(), CallError> {
        let tracks = self.capture_with_fallback(media_kind).await?;

        let mut media_engine = MediaEngine::default();
        media_engine
            .register_default_codecs()
            .map_err(|e| CallError::Negotiation(e.to_string()))?;
        let registry = register_default_interceptors(Registry::new(), &mut media_engine)
            .map_err(|e| CallError::Negotiation(e.to_string()))?;
        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();
        let pc = Arc::new(
            api.new_peer_connection(RTCConfiguration::default())
                .await
                .map_err(|e| CallError::Negotiation(e.to_string()))?,
        );

        for track in &tracks {
            pc.add_track(track.clone())
                .await
                .map_err(|e| CallError::Negotiation(e.to_string()))?;
        }

        let bus = self.bus.clone();
        let channel_id = self.channel_id.clone();
        let closed = self.closed.clone();
        pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
            let bus = bus.clone();
            let channel_id = channel_id.clone();
            let closed = closed.clone();
            Box::pin(async move {
                let Some(candidate) = candidate else { return };
                if closed.load(Ordering::SeqCst) {
                    return;
                }
                let init = match candidate.to_json() {
                    Ok(init) => init,
                    Err(e) => {
                        warn!("dropping unserializable ice candidate: {e}");
                        return;
                    }
                };
                let signal = Signal::new(
                    channel_id,
                    SignalBody::IceCandidate {
                        candidate: from_rtc_init(init),
                    },
                );
                // Best-effort; the bus owns retries.
                if let Err(e) = bus.publish(&signal.topic(), &signal).await {
                    warn!("failed to publish ice candidate: {e}");
                }
            })
        }));

        let events = self.events.clone();
        pc.on_track(Box::new(move |track, _receiver, _transceiver| {
            let events = events.clone();
            Box::pin(async move {
                info!("remote track received: {}", track.id());
                let _ = events.send(TransportEvent::RemoteMedia(MediaStream::RemoteTrack(track)));
                let _ = events.send(TransportEvent::Connected);
            })
        }));

        let events = self.events.clone();
        pc.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
            let events = events.clone();
            Box::pin(async move {
                debug!("peer connection state: {state}");
                let event = match state {
                    RTCPeerConnectionState::Connecting => {
                        Some(TransportEvent::Link(LinkState::Connecting))
                    }
                    RTCPeerConnectionState::Connected => Some(TransportEvent::Link(LinkState::Up)),
                    // Disconnected may recover via ICE restart or reconnect.
                    RTCPeerConnectionState::Disconnected => {
                        Some(TransportEvent::Link(LinkState::Degraded))
                    }
                    RTCPeerConnectionState::Failed => {
                        Some(TransportEvent::Failed("peer connection failed".into()))
                    }
                    _ => None,
                };
                if let Some(event) = event {
                    let _ = events.send(event);
                }
            })
        }));

        let _ = self
            .events
            .send(TransportEvent::LocalMedia(MediaStream::LocalTracks(tracks)));
        *self.pc.write().await = Some(pc);
        Ok(())
    }

    async fn on_ack(&self) -> Result<(), CallError> {
        let pc = self.peer_connection().await?;
        let offer = pc
            .create_offer(None)
            .await
            .map_err(|e| CallError::Negotiation(e.to_string()))?;
        let sdp = offer.sdp.clone();
        pc.set_local_description(offer)
            .await
            .map_err(|e| CallError::Negotiation(e.to_string()))?;
        if let Some(batch) = self.gate.local_description_set() {
            self.apply_flush(&pc, batch).await?;
        }
        self.publish(SignalBody::CallOffer { sdp }).await
    }

    async fn on_offer(&self, sdp: &str) -> Result<(), CallError> {
        let pc = self.peer_connection().await?;
        let offer = RTCSessionDescription::offer(sdp.to_string())
            .map_err(|e| CallError::Negotiation(e.to_string()))?;
        pc.set_remote_description(offer)
            .await
            .map_err(|e| CallError::Negotiation(e.to_string()))?;
        if let Some(batch) = self.gate.remote_description_set() {
            self.apply_flush(&pc, batch).await?;
        }

        let answer = pc
            .create_answer(None)
            .await
            .map_err(|e| CallError::Negotiation(e.to_string()))?;
        let sdp = answer.sdp.clone();
        pc.set_local_description(answer)
            .await
            .map_err(|e| CallError::Negotiation(e.to_string()))?;
        if let Some(batch) = self.gate.local_description_set() {
            self.apply_flush(&pc, batch).await?;
        }
        self.publish(SignalBody::CallAnswer { sdp }).await
    }

    async fn on_answer(&self, sdp: &str) -> Result<(), CallError> {
        let pc = self.peer_connection().await?;
        let answer = RTCSessionDescription::answer(sdp.to_string())
            .map_err(|e| CallError::Negotiation(e.to_string()))?;
        pc.set_remote_description(answer)
            .await
            .map_err(|e| CallError::Negotiation(e.to_string()))?;
        if let Some(batch) = self.gate.remote_description_set() {
            self.apply_flush(&pc, batch).await?;
        }
        Ok(())
    }

    async fn on_candidate(&self, candidate: IceCandidateInit) -> Result<(), CallError> {
        match self.gate.admit(candidate) {
            Admit::Queued => {
                debug!("ice candidate buffered for {}", self.channel_id);
                Ok(())
            }
            Admit::Apply(candidate) => {
                let pc = self.peer_connection().await?;
                pc.add_ice_candidate(to_rtc_init(candidate))
                    .await
                    .map_err(|e| CallError::Negotiation(e.to_string()))
            }
        }
    }

    fn set_audio_enabled(&self, enabled: bool) {
        self.capture.set_enabled(MediaKind::Audio, enabled);
    }

    fn set_video_enabled(&self, enabled: bool) {
        self.capture.set_enabled(MediaKind::Video, enabled);
    }

    async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(pc) = self.pc.write().await.take() {
            if let Err(e) = pc.close().await {
                debug!("peer connection close: {e}");
            }
        }
    }
}

fn to_rtc_init(init: IceCandidateInit) -> RTCIceCandidateInit {
    RTCIceCandidateInit {
        candidate: init.candidate,
        sdp_mid: init.sdp_mid,
        sdp_mline_index: init.sdp_mline_index,
        username_fragment: init.username_fragment,
    }
}

fn from_rtc_init(init: RTCIceCandidateInit) -> IceCandidateInit {
    IceCandidateInit {
        candidate: init.candidate,
        sdp_mid: init.sdp_mid,
        sdp_mline_index: init.sdp_mline_index,
        username_fragment: init.username_fragment,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candidate(n: u32) -> IceCandidateInit {
        IceCandidateInit {
            candidate: format!("candidate:{n} 1 UDP 1 10.0.0.{n} 5000 typ host"),
            sdp_mid: Some("0".into()),
            sdp_mline_index: Some(0),
            username_fragment: None,
        }
    }

    #[test]
    fn test_gate_queues_until_both_descriptions() {
        let gate = CandidateGate::new();
        assert!(matches!(gate.admit(candidate(1)), Admit::Queued));
        assert!(gate.local_description_set().is_none());
        assert!(matches!(gate.admit(candidate(2)), Admit::Queued));

        let batch = gate.remote_description_set().unwrap();
        let numbers: Vec<_> = batch.iter().map(|c| c.candidate.clone()).collect();
        assert_eq!(numbers, vec![candidate(1).candidate, candidate(2).candidate]);
    }

    #[test]
    fn test_gate_flushes_exactly_once() {
        let gate = CandidateGate::new();
        gate.admit(candidate(1));
        assert!(gate.remote_description_set().is_none());
        assert!(gate.local_description_set().is_some());
        // Marks after the flush never yield a second batch.
        assert!(gate.local_description_set().is_none());
        assert!(gate.remote_description_set().is_none());
    }

    #[test]
    fn test_gate_passes_candidates_through_after_flush() {
        let gate = CandidateGate::new();
        gate.local_description_set();
        let batch = gate.remote_description_set().unwrap();
        assert!(batch.is_empty());
        assert!(matches!(gate.admit(candidate(3)), Admit::Apply(_)));
    }

    #[test]
    fn test_flush_preserves_arrival_order() {
        let gate = CandidateGate::new();
        for n in 0..5 {
            gate.admit(candidate(n));
        }
        gate.local_description_set();
        let batch = gate.remote_description_set().unwrap();
        for (n, init) in batch.iter().enumerate() {
            assert_eq!(init.candidate, candidate(n as u32).candidate);
        }
    }
}
