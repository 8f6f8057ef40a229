//! One call's state machine and signal dispatch.
//!
//! A [`CallSession`] owns the call's identity, its transport, and the
//! observables the UI overlay subscribes to. State moves only through
//! [`CallSession::advance`], transport events and signal handlers drive it,
//! and `Ended` is terminal: once reached, dispatch is a no-op.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex, Weak};

use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use tokio::sync::mpsc;

use crate::error::CallError;
use crate::manager::SessionManager;
use crate::mode::MediaKind;
use crate::observable::Observable;
use crate::signaling::{Signal, SignalBody, SignalingBus};
use crate::transport::{MediaStream, Transport, TransportEvent};

/// Lifecycle state of a call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallState {
    Idle,
    Connecting,
    Connected,
    Error,
    Ended,
}

impl CallState {
    /// Whether `next` is a legal successor of `self`.
    ///
    /// `Connected -> Connecting` covers renegotiation after a navigation
    /// reconnect; `Ended` has no successors.
    pub fn can_transition(self, next: CallState) -> bool {
        use CallState::*;
        matches!(
            (self, next),
            (Idle, Connecting)
                | (Idle, Ended)
                | (Connecting, Connected)
                | (Connecting, Error)
                | (Connecting, Ended)
                | (Connected, Connecting)
                | (Connected, Error)
                | (Connected, Ended)
                | (Error, Ended)
        )
    }
}

impl fmt::Display for CallState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Idle => "idle",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Error => "error",
            Self::Ended => "ended",
        };
        f.write_str(s)
    }
}

/// Why a call ended, delivered to hangup subscribers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallEndReason {
    LocalHangup,
    RemoteHangup,
    TransportFailure,
    NegotiationFailure,
    /// The remote peer never acknowledged the invite.
    AnswerTimeout,
}

/// Cloneable view of a session for UI consumption.
#[derive(Debug, Clone)]
pub struct CallSnapshot {
    pub channel_id: String,
    pub remote_peer: String,
    pub is_initiator: bool,
    pub media_kind: MediaKind,
    pub state: CallState,
    pub created_at: DateTime<Utc>,
    pub audio_enabled: bool,
    pub video_enabled: bool,
}

/// One in-progress call.
pub struct CallSession {
    channel_id: String,
    remote_peer: String,
    is_initiator: bool,
    media_kind: MediaKind,
    created_at: DateTime<Utc>,

    state: StdMutex<CallState>,
    state_changes: Observable<CallState>,
    local_media: Observable<MediaStream>,
    remote_media: Observable<MediaStream>,
    hangups: Observable<CallEndReason>,

    transport: StdMutex<Option<Arc<dyn Transport>>>,
    transport_ready: AtomicBool,
    ack_received: AtomicBool,
    audio_enabled: AtomicBool,
    video_enabled: AtomicBool,
    hung_up: AtomicBool,
    /// Offer that outran local transport setup; replayed once setup finishes.
    pending_offer: StdMutex<Option<String>>,

    bus: Arc<dyn SignalingBus>,
    manager: Weak<SessionManager>,
}

impl std::fmt::Debug for CallSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallSession")
            .field("channel_id", &self.channel_id)
            .field("remote_peer", &self.remote_peer)
            .field("is_initiator", &self.is_initiator)
            .field("media_kind", &self.media_kind)
            .finish_non_exhaustive()
    }
}

impl CallSession {
    pub(crate) fn new(
        channel_id: impl Into<String>,
        remote_peer: impl Into<String>,
        is_initiator: bool,
        media_kind: MediaKind,
        bus: Arc<dyn SignalingBus>,
        manager: Weak<SessionManager>,
    ) -> Arc<Self> {
        Arc::new(Self {
            channel_id: channel_id.into(),
            remote_peer: remote_peer.into(),
            is_initiator,
            media_kind,
            created_at: Utc::now(),
            state: StdMutex::new(CallState::Idle),
            state_changes: Observable::new(),
            local_media: Observable::new(),
            remote_media: Observable::new(),
            hangups: Observable::new(),
            transport: StdMutex::new(None),
            transport_ready: AtomicBool::new(false),
            ack_received: AtomicBool::new(false),
            audio_enabled: AtomicBool::new(true),
            video_enabled: AtomicBool::new(media_kind.has_video()),
            hung_up: AtomicBool::new(false),
            pending_offer: StdMutex::new(None),
            bus,
            manager,
        })
    }

    pub fn channel_id(&self) -> &str {
        &self.channel_id
    }

    pub fn remote_peer(&self) -> &str {
        &self.remote_peer
    }

    pub fn is_initiator(&self) -> bool {
        self.is_initiator
    }

    pub fn media_kind(&self) -> MediaKind {
        self.media_kind
    }

    pub fn state(&self) -> CallState {
        *self.state.lock().unwrap()
    }

    pub fn is_ended(&self) -> bool {
        self.state() == CallState::Ended
    }

    pub(crate) fn acked(&self) -> bool {
        self.ack_received.load(Ordering::SeqCst)
    }

    pub fn snapshot(&self) -> CallSnapshot {
        CallSnapshot {
            channel_id: self.channel_id.clone(),
            remote_peer: self.remote_peer.clone(),
            is_initiator: self.is_initiator,
            media_kind: self.media_kind,
            state: self.state(),
            created_at: self.created_at,
            audio_enabled: self.audio_enabled.load(Ordering::SeqCst),
            video_enabled: self.video_enabled.load(Ordering::SeqCst),
        }
    }

    pub fn subscribe_state(&self) -> mpsc::UnboundedReceiver<CallState> {
        self.state_changes.subscribe()
    }

    pub fn subscribe_local_media(&self) -> mpsc::UnboundedReceiver<MediaStream> {
        self.local_media.subscribe()
    }

    pub fn subscribe_remote_media(&self) -> mpsc::UnboundedReceiver<MediaStream> {
        self.remote_media.subscribe()
    }

    pub fn subscribe_hangup(&self) -> mpsc::UnboundedReceiver<CallEndReason> {
        self.hangups.subscribe()
    }

    /// Apply a state transition, notifying subscribers.
    ///
    /// Same-state is a silent no-op; an illegal transition is an error and
    /// leaves the state untouched.
    pub(crate) fn advance(&self, next: CallState) -> Result<(), CallError> {
        let mut state = self.state.lock().unwrap();
        if *state == next {
            return Ok(());
        }
        if !state.can_transition(next) {
            return Err(CallError::InvalidTransition {
                from: *state,
                attempted: next,
            });
        }
        debug!("call {}: {} -> {next}", self.channel_id, *state);
        *state = next;
        drop(state);
        self.state_changes.emit(next);
        Ok(())
    }

    /// Install the transport and start consuming its events.
    pub(crate) fn install_transport(
        self: &Arc<Self>,
        transport: Arc<dyn Transport>,
        events: mpsc::UnboundedReceiver<TransportEvent>,
    ) {
        *self.transport.lock().unwrap() = Some(transport);
        self.spawn_event_loop(events);
    }

    /// Swap in a fresh transport after a navigation reconnect.
    ///
    /// The dead transport is closed without firing hangup subscribers; the
    /// session identity and observers carry over to the new negotiation.
    pub(crate) async fn replace_transport(
        self: &Arc<Self>,
        transport: Arc<dyn Transport>,
        events: mpsc::UnboundedReceiver<TransportEvent>,
    ) {
        let old = self.transport.lock().unwrap().take();
        if let Some(old) = old {
            old.close().await;
        }
        self.transport_ready.store(false, Ordering::SeqCst);
        self.ack_received.store(false, Ordering::SeqCst);
        self.pending_offer.lock().unwrap().take();
        self.install_transport(transport, events);
    }

    /// Run transport setup, then replay any offer that arrived early.
    pub(crate) async fn setup_transport(&self) -> Result<(), CallError> {
        let transport = self.transport()?;
        transport.setup(self.media_kind).await?;
        self.transport_ready.store(true, Ordering::SeqCst);

        let buffered = self.pending_offer.lock().unwrap().take();
        if let Some(sdp) = buffered {
            debug!("replaying buffered offer for {}", self.channel_id);
            transport.on_offer(&sdp).await?;
        }
        Ok(())
    }

    fn transport(&self) -> Result<Arc<dyn Transport>, CallError> {
        self.transport
            .lock()
            .unwrap()
            .clone()
            .ok_or_else(|| CallError::Transport("no transport installed".into()))
    }

    pub(crate) async fn send(&self, body: SignalBody) -> Result<(), CallError> {
        let signal = Signal::new(self.channel_id.clone(), body);
        self.bus.publish(&signal.topic(), &signal).await
    }

    /// Handle one inbound signal for this call.
    ///
    /// Mid-call failures are never surfaced to a caller: they move the
    /// session to `Error` and hang it up, reaching the UI via observables.
    pub async fn dispatch(self: &Arc<Self>, body: SignalBody) {
        if self.is_ended() {
            debug!(
                "dropping {} for ended call {}",
                body.tag(),
                self.channel_id
            );
            return;
        }
        let tag = body.tag();
        if let Err(e) = self.handle(body).await {
            warn!("handling {tag} for {} failed: {e}", self.channel_id);
            // A session that never left Idle goes straight to Ended.
            if self.state() != CallState::Idle {
                let _ = self.advance(CallState::Error);
            }
            self.hang_up_with(CallEndReason::NegotiationFailure, true)
                .await;
        }
    }

    async fn handle(self: &Arc<Self>, body: SignalBody) -> Result<(), CallError> {
        match body {
            SignalBody::CallAck { .. } | SignalBody::CallReconnectAck { .. } => {
                if self.ack_received.swap(true, Ordering::SeqCst) {
                    debug!("duplicate ack for {}", self.channel_id);
                    return Ok(());
                }
                self.transport()?.on_ack().await?;
                self.advance(CallState::Connecting)
            }
            SignalBody::CallOffer { sdp } => {
                if !self.transport_ready.load(Ordering::SeqCst) {
                    debug!("offer outran setup for {}; buffering", self.channel_id);
                    *self.pending_offer.lock().unwrap() = Some(sdp);
                    return Ok(());
                }
                self.transport()?.on_offer(&sdp).await
            }
            SignalBody::CallAnswer { sdp } => self.transport()?.on_answer(&sdp).await,
            SignalBody::IceCandidate { candidate } => {
                self.transport()?.on_candidate(candidate).await
            }
            SignalBody::CallHangup => {
                self.hang_up_with(CallEndReason::RemoteHangup, false).await;
                Ok(())
            }
            SignalBody::CallRequest { .. } | SignalBody::CallReconnect { .. } => {
                // Routed by the manager before reaching a live session.
                debug!("unexpected invite signal for live call {}", self.channel_id);
                Ok(())
            }
        }
    }

    /// Hang up locally, notifying the remote peer.
    pub async fn hang_up(&self) {
        self.hang_up_with(CallEndReason::LocalHangup, true).await;
    }

    /// Terminal teardown; runs at most once no matter how often it is called.
    pub(crate) async fn hang_up_with(&self, reason: CallEndReason, notify_remote: bool) {
        if self.hung_up.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("call {} ending: {reason:?}", self.channel_id);

        if notify_remote {
            // Best-effort; the peer also times out on its own.
            if let Err(e) = self.send(SignalBody::CallHangup).await {
                debug!("hangup signal for {} not delivered: {e}", self.channel_id);
            }
        }

        let transport = self.transport.lock().unwrap().take();
        if let Some(transport) = transport {
            transport.close().await;
        }

        {
            let mut state = self.state.lock().unwrap();
            if *state != CallState::Ended {
                *state = CallState::Ended;
                drop(state);
                self.state_changes.emit(CallState::Ended);
            }
        }
        self.hangups.emit(reason);

        if let Some(manager) = self.manager.upgrade() {
            manager.forget(&self.channel_id).await;
        }
    }

    /// Flip the audio intent, returning the new enabled flag.
    pub fn toggle_audio(&self) -> bool {
        let enabled = !self.audio_enabled.fetch_xor(true, Ordering::SeqCst);
        if let Ok(transport) = self.transport() {
            transport.set_audio_enabled(enabled);
        }
        enabled
    }

    /// Flip the video intent, returning the new enabled flag.
    pub fn toggle_video(&self) -> bool {
        let enabled = !self.video_enabled.fetch_xor(true, Ordering::SeqCst);
        if let Ok(transport) = self.transport() {
            transport.set_video_enabled(enabled);
        }
        enabled
    }

    fn spawn_event_loop(self: &Arc<Self>, mut events: mpsc::UnboundedReceiver<TransportEvent>) {
        let weak = Arc::downgrade(self);
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                let Some(session) = weak.upgrade() else { break };
                session.handle_transport_event(event).await;
            }
        });
    }

    async fn handle_transport_event(self: &Arc<Self>, event: TransportEvent) {
        if self.is_ended() {
            return;
        }
        match event {
            TransportEvent::LocalMedia(stream) => self.local_media.emit(stream),
            TransportEvent::RemoteMedia(stream) => self.remote_media.emit(stream),
            TransportEvent::Connected => {
                if let Err(e) = self.advance(CallState::Connected) {
                    debug!("ignoring connected event for {}: {e}", self.channel_id);
                }
            }
            TransportEvent::Link(link) => {
                debug!("call {} link state: {link:?}", self.channel_id);
            }
            TransportEvent::Failed(reason) => {
                warn!("call {} transport failed: {reason}", self.channel_id);
                if self.state() != CallState::Idle {
                    let _ = self.advance(CallState::Error);
                }
                self.hang_up_with(CallEndReason::TransportFailure, true).await;
            }
        }
    }
}
