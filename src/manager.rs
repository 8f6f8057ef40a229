//! The session registry and call orchestration.
//!
//! [`SessionManager`] owns the only shared mutable state in the crate: the
//! channel-id to session map. It starts outgoing calls, turns unknown
//! `call-request`s into invites, routes every other inbound signal to its
//! session, and rebuilds calls after navigation.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use log::{debug, info, warn};
use rand::distr::Alphanumeric;
use rand::Rng;
use tokio::sync::{mpsc, RwLock};

use crate::error::CallError;
use crate::invite::CallInvite;
use crate::mode::{MediaKind, ModeInfo, ModeResolver, RuntimeProbe, TransportMode};
use crate::observable::Observable;
use crate::reconnect::{CallRefStore, PersistedCallRef};
use crate::session::{CallEndReason, CallSession, CallSnapshot, CallState};
use crate::signaling::{Signal, SignalBody, SignalingBus};
use crate::transport::{
    ControlClient, MediaCapture, NativeTransport, NativeTransportConfig, RtcTransport, Transport,
    TransportEvent,
};
use crate::media::SurfaceFactory;

#[derive(Debug, Clone)]
pub struct SessionManagerConfig {
    /// How long an initiator waits for `call-ack` before giving up.
    pub ring_timeout: Duration,
    pub native: NativeTransportConfig,
}

impl Default for SessionManagerConfig {
    fn default() -> Self {
        Self {
            ring_timeout: Duration::from_secs(45),
            native: NativeTransportConfig::default(),
        }
    }
}

pub struct SessionManagerBuilder {
    local_peer: String,
    probe: Arc<dyn RuntimeProbe>,
    bus: Arc<dyn SignalingBus>,
    store: Arc<dyn CallRefStore>,
    config: SessionManagerConfig,
    capture: Option<Arc<dyn MediaCapture>>,
    control: Option<Arc<dyn ControlClient>>,
    surfaces: Option<Arc<dyn SurfaceFactory>>,
}

impl SessionManagerBuilder {
    pub fn new(
        local_peer: impl Into<String>,
        probe: Arc<dyn RuntimeProbe>,
        bus: Arc<dyn SignalingBus>,
        store: Arc<dyn CallRefStore>,
    ) -> Self {
        Self {
            local_peer: local_peer.into(),
            probe,
            bus,
            store,
            config: SessionManagerConfig::default(),
            capture: None,
            control: None,
            surfaces: None,
        }
    }

    pub fn config(mut self, config: SessionManagerConfig) -> Self {
        self.config = config;
        self
    }

    /// Device capture, required for browser mode.
    pub fn capture(mut self, capture: Arc<dyn MediaCapture>) -> Self {
        self.capture = Some(capture);
        self
    }

    /// Encoder control plane, required for native mode.
    pub fn control(mut self, control: Arc<dyn ControlClient>) -> Self {
        self.control = Some(control);
        self
    }

    /// Playback surfaces, required for native mode.
    pub fn surfaces(mut self, surfaces: Arc<dyn SurfaceFactory>) -> Self {
        self.surfaces = Some(surfaces);
        self
    }

    pub fn build(self) -> Arc<SessionManager> {
        Arc::new(SessionManager {
            local_peer: self.local_peer,
            config: self.config,
            resolver: ModeResolver::new(self.probe),
            bus: self.bus,
            store: self.store,
            capture: self.capture,
            control: self.control,
            surfaces: self.surfaces,
            sessions: RwLock::new(HashMap::new()),
            invites: Observable::new(),
            reconnect_pending: StdMutex::new(HashSet::new()),
        })
    }
}

pub struct SessionManager {
    local_peer: String,
    config: SessionManagerConfig,
    resolver: ModeResolver,
    bus: Arc<dyn SignalingBus>,
    store: Arc<dyn CallRefStore>,
    capture: Option<Arc<dyn MediaCapture>>,
    control: Option<Arc<dyn ControlClient>>,
    surfaces: Option<Arc<dyn SurfaceFactory>>,
    sessions: RwLock<HashMap<String, Arc<CallSession>>>,
    invites: Observable<Arc<CallInvite>>,
    /// Channels for which we initiated a navigation reconnect and are still
    /// waiting on the ack; used to break simultaneous-reconnect ties.
    reconnect_pending: StdMutex<HashSet<String>>,
}

impl SessionManager {
    pub fn builder(
        local_peer: impl Into<String>,
        probe: Arc<dyn RuntimeProbe>,
        bus: Arc<dyn SignalingBus>,
        store: Arc<dyn CallRefStore>,
    ) -> SessionManagerBuilder {
        SessionManagerBuilder::new(local_peer, probe, bus, store)
    }

    pub fn local_peer(&self) -> &str {
        &self.local_peer
    }

    /// Incoming invites; replay-on-subscribe like every other observable.
    pub fn subscribe_invites(&self) -> mpsc::UnboundedReceiver<Arc<CallInvite>> {
        self.invites.subscribe()
    }

    pub async fn get(&self, channel_id: &str) -> Option<Arc<CallSession>> {
        self.sessions.read().await.get(channel_id).cloned()
    }

    pub async fn active_sessions(&self) -> Vec<CallSnapshot> {
        self.sessions
            .read()
            .await
            .values()
            .map(|s| s.snapshot())
            .collect()
    }

    pub async fn has_active_call(&self) -> bool {
        !self.sessions.read().await.is_empty()
    }

    /// Start an outgoing call.
    ///
    /// Resolves the transport mode, registers the session, runs local setup
    /// and announces the call. Any failure before the invite is on the wire
    /// rejects this future and leaves no session behind.
    pub async fn start(
        self: &Arc<Self>,
        remote_peer: &str,
        media_kind: MediaKind,
    ) -> Result<Arc<CallSession>, CallError> {
        let info = self.resolver.resolve().await;
        let channel_id = generate_channel_id(info.mode);
        info!(
            "starting {media_kind:?} call to {remote_peer} on {channel_id} ({} mode)",
            info.mode
        );

        let session = CallSession::new(
            channel_id.clone(),
            remote_peer,
            true,
            media_kind,
            self.bus.clone(),
            Arc::downgrade(self),
        );
        self.register(session.clone()).await?;

        if let Err(e) = self.prepare_transport(&session, info.mode).await {
            self.forget(&channel_id).await;
            return Err(e);
        }
        self.persist(&session).await;

        let request = SignalBody::CallRequest {
            media_kind,
            mode: info.mode,
            platform: info.platform.clone(),
        };
        if let Err(e) = session.send(request).await {
            session
                .hang_up_with(CallEndReason::NegotiationFailure, false)
                .await;
            return Err(e);
        }
        session.advance(CallState::Connecting)?;
        self.spawn_ring_timeout(&session);
        Ok(session)
    }

    /// Callee-side setup for an accepted invite.
    pub(crate) async fn accept_invite(
        self: &Arc<Self>,
        invite: &CallInvite,
    ) -> Result<Arc<CallSession>, CallError> {
        let info = self.resolver.resolve().await;
        let session = CallSession::new(
            invite.channel_id(),
            invite.caller(),
            false,
            invite.media_kind(),
            self.bus.clone(),
            Arc::downgrade(self),
        );
        self.register(session.clone()).await?;

        if let Err(e) = self.prepare_transport(&session, info.mode).await {
            self.forget(invite.channel_id()).await;
            // Let the caller stop ringing.
            let _ = self.send_hangup(invite.channel_id()).await;
            return Err(e);
        }
        self.persist(&session).await;

        let ack = SignalBody::CallAck {
            mode: info.mode,
            platform: info.platform.clone(),
        };
        if let Err(e) = session.send(ack).await {
            session
                .hang_up_with(CallEndReason::NegotiationFailure, false)
                .await;
            return Err(e);
        }
        session.advance(CallState::Connecting)?;
        Ok(session)
    }

    /// Route one inbound signal.
    ///
    /// Unknown channels only matter for `call-request` (a new invite) and
    /// `call-reconnect` (a peer recovering a call we lost); anything else for
    /// an unknown channel is dropped.
    pub async fn handle_signal(self: &Arc<Self>, from: &str, signal: Signal) {
        let Signal { channel_id, body } = signal;
        debug!("signal {} for {channel_id} from {from}", body.tag());

        if matches!(body, SignalBody::CallReconnectAck { .. }) {
            self.reconnect_pending.lock().unwrap().remove(&channel_id);
        }

        let session = self.sessions.read().await.get(&channel_id).cloned();
        match (session, body) {
            (Some(session), SignalBody::CallReconnect { .. }) => {
                self.handle_reconnect(from, &session).await;
            }
            (Some(session), body) => session.dispatch(body).await,
            (None, SignalBody::CallRequest { media_kind, mode, platform }) => {
                info!("incoming {media_kind:?} call from {from} on {channel_id}");
                let invite = CallInvite::new(
                    channel_id,
                    from.to_string(),
                    media_kind,
                    mode,
                    platform,
                    Arc::downgrade(self),
                );
                self.invites.emit(invite);
            }
            (None, SignalBody::CallReconnect { media_kind }) => {
                self.adopt_reconnect(from, channel_id, media_kind).await;
            }
            (None, body) => {
                debug!("dropping {} for unknown channel {channel_id}", body.tag());
            }
        }
    }

    /// Consume the persisted call ref, if any, and rebuild the session.
    pub async fn restore(self: &Arc<Self>) -> Result<Option<Arc<CallSession>>, CallError> {
        let Some(call_ref) = self.store.take().await? else {
            return Ok(None);
        };
        info!("restoring call {} after navigation", call_ref.channel_id);
        let info = self.resolver.resolve().await;
        match info.mode {
            TransportMode::Native => self.restore_native(call_ref).await,
            TransportMode::Browser => self.restore_browser(call_ref, &info).await,
        }
    }

    /// The encoder outlives the page, so native restoration is a query plus
    /// a socket re-attach; no renegotiation happens.
    async fn restore_native(
        self: &Arc<Self>,
        call_ref: PersistedCallRef,
    ) -> Result<Option<Arc<CallSession>>, CallError> {
        let control = self
            .control
            .clone()
            .ok_or(CallError::Configuration("control client"))?;
        let live = control.list_sessions().await?;
        let Some(native) = live.into_iter().find(|s| s.channel_id == call_ref.channel_id) else {
            info!("encoder no longer holds {}; nothing to restore", call_ref.channel_id);
            return Ok(None);
        };

        let session = CallSession::new(
            native.channel_id,
            native.remote_peer,
            call_ref.is_initiator,
            native.media_kind,
            self.bus.clone(),
            Arc::downgrade(self),
        );
        self.register(session.clone()).await?;
        let (transport, events) = self.build_transport(&session, TransportMode::Native)?;
        session.install_transport(transport.clone(), events);
        session.advance(CallState::Connecting)?;
        self.persist(&session).await;

        // Socket attach happens in the background; a failure surfaces to the
        // UI as a transport-failure hangup, not as a restore error.
        let attach_session = session.clone();
        tokio::spawn(async move {
            if let Err(e) = transport.on_ack().await {
                warn!(
                    "re-attach for {} failed: {e}",
                    attach_session.channel_id()
                );
                let _ = attach_session.advance(CallState::Error);
                attach_session
                    .hang_up_with(CallEndReason::TransportFailure, true)
                    .await;
            }
        });
        Ok(Some(session))
    }

    async fn restore_browser(
        self: &Arc<Self>,
        call_ref: PersistedCallRef,
        info: &ModeInfo,
    ) -> Result<Option<Arc<CallSession>>, CallError> {
        let session = CallSession::new(
            call_ref.channel_id.clone(),
            call_ref.remote_peer.clone(),
            call_ref.is_initiator,
            call_ref.media_kind,
            self.bus.clone(),
            Arc::downgrade(self),
        );
        self.register(session.clone()).await?;

        if let Err(e) = self.prepare_transport(&session, info.mode).await {
            self.forget(&call_ref.channel_id).await;
            return Err(e);
        }
        self.persist(&session).await;

        self.reconnect_pending
            .lock()
            .unwrap()
            .insert(call_ref.channel_id.clone());
        let reconnect = SignalBody::CallReconnect {
            media_kind: call_ref.media_kind,
        };
        if let Err(e) = session.send(reconnect).await {
            session
                .hang_up_with(CallEndReason::NegotiationFailure, false)
                .await;
            return Err(e);
        }
        session.advance(CallState::Connecting)?;
        self.spawn_ring_timeout(&session);
        Ok(Some(session))
    }

    /// The peer navigated and rebuilt its context; refresh our side of the
    /// negotiation without changing the call's identity.
    async fn handle_reconnect(self: &Arc<Self>, from: &str, session: &Arc<CallSession>) {
        {
            let mut pending = self.reconnect_pending.lock().unwrap();
            if pending.contains(session.channel_id()) {
                // Both sides navigated at once; the smaller peer id keeps the
                // offerer role and ignores the competing reconnect.
                if self.local_peer.as_str() < from {
                    debug!(
                        "simultaneous reconnect on {}; keeping offerer role",
                        session.channel_id()
                    );
                    return;
                }
                debug!(
                    "simultaneous reconnect on {}; yielding offerer role to {from}",
                    session.channel_id()
                );
                pending.remove(session.channel_id());
            }
        }

        let info = self.resolver.resolve().await;
        if info.mode == TransportMode::Browser {
            // The old peer connection is dead; swap in a fresh one silently.
            let (transport, events) = match self.build_transport(session, info.mode) {
                Ok(built) => built,
                Err(e) => {
                    warn!("reconnect transport for {} failed: {e}", session.channel_id());
                    let _ = session.advance(CallState::Error);
                    session
                        .hang_up_with(CallEndReason::TransportFailure, true)
                        .await;
                    return;
                }
            };
            session.replace_transport(transport, events).await;
            if let Err(e) = session.setup_transport().await {
                warn!("reconnect setup for {} failed: {e}", session.channel_id());
                let _ = session.advance(CallState::Error);
                session
                    .hang_up_with(CallEndReason::TransportFailure, true)
                    .await;
                return;
            }
        }

        let ack = SignalBody::CallReconnectAck {
            mode: info.mode,
            platform: info.platform.clone(),
        };
        if let Err(e) = session.send(ack).await {
            warn!("reconnect ack for {} failed: {e}", session.channel_id());
            return;
        }
        let _ = session.advance(CallState::Connecting);
    }

    /// A peer is reconnecting a call we have no session for (our context was
    /// rebuilt too, or we never persisted it). Run the callee flow from the
    /// reconnect payload; the call was already accepted once.
    async fn adopt_reconnect(
        self: &Arc<Self>,
        from: &str,
        channel_id: String,
        media_kind: MediaKind,
    ) {
        info!("adopting reconnect for {channel_id} from {from}");
        let info = self.resolver.resolve().await;
        let session = CallSession::new(
            channel_id.clone(),
            from,
            false,
            media_kind,
            self.bus.clone(),
            Arc::downgrade(self),
        );
        if let Err(e) = self.register(session.clone()).await {
            warn!("cannot adopt reconnect for {channel_id}: {e}");
            return;
        }
        if let Err(e) = self.prepare_transport(&session, info.mode).await {
            warn!("adopted reconnect setup for {channel_id} failed: {e}");
            self.forget(&channel_id).await;
            let _ = self.send_hangup(&channel_id).await;
            return;
        }
        self.persist(&session).await;

        let ack = SignalBody::CallReconnectAck {
            mode: info.mode,
            platform: info.platform.clone(),
        };
        if let Err(e) = session.send(ack).await {
            session
                .hang_up_with(CallEndReason::NegotiationFailure, false)
                .await;
            return;
        }
        let _ = session.advance(CallState::Connecting);
    }

    pub(crate) async fn send_hangup(&self, channel_id: &str) -> Result<(), CallError> {
        let signal = Signal::new(channel_id, SignalBody::CallHangup);
        self.bus.publish(&signal.topic(), &signal).await
    }

    /// Drop a session from the registry and clear the persisted ref.
    pub(crate) async fn forget(&self, channel_id: &str) {
        if self.sessions.write().await.remove(channel_id).is_some() {
            debug!("session {channel_id} removed from registry");
        }
        self.reconnect_pending.lock().unwrap().remove(channel_id);
        if let Err(e) = self.store.clear().await {
            warn!("failed to clear persisted call ref: {e}");
        }
    }

    async fn register(&self, session: Arc<CallSession>) -> Result<(), CallError> {
        let mut sessions = self.sessions.write().await;
        let channel_id = session.channel_id().to_string();
        if sessions.contains_key(&channel_id) {
            return Err(CallError::DuplicateChannel(channel_id));
        }
        sessions.insert(channel_id, session);
        Ok(())
    }

    /// Build, install and set up the session's transport.
    async fn prepare_transport(
        self: &Arc<Self>,
        session: &Arc<CallSession>,
        mode: TransportMode,
    ) -> Result<(), CallError> {
        let (transport, events) = self.build_transport(session, mode)?;
        session.install_transport(transport, events);
        session.setup_transport().await
    }

    fn build_transport(
        self: &Arc<Self>,
        session: &Arc<CallSession>,
        mode: TransportMode,
    ) -> Result<(Arc<dyn Transport>, mpsc::UnboundedReceiver<TransportEvent>), CallError> {
        let (tx, rx) = mpsc::unbounded_channel();
        let transport: Arc<dyn Transport> = match mode {
            TransportMode::Browser => {
                let capture = self
                    .capture
                    .clone()
                    .ok_or(CallError::Configuration("media capture"))?;
                RtcTransport::new(session.channel_id(), self.bus.clone(), capture, tx)
            }
            TransportMode::Native => {
                let control = self
                    .control
                    .clone()
                    .ok_or(CallError::Configuration("control client"))?;
                let surfaces = self
                    .surfaces
                    .clone()
                    .ok_or(CallError::Configuration("surface factory"))?;
                NativeTransport::new(
                    session.channel_id(),
                    session.remote_peer(),
                    session.is_initiator(),
                    control,
                    surfaces,
                    tx,
                    self.config.native.clone(),
                )
            }
        };
        Ok((transport, rx))
    }

    async fn persist(&self, session: &Arc<CallSession>) {
        let call_ref = PersistedCallRef {
            channel_id: session.channel_id().to_string(),
            remote_peer: session.remote_peer().to_string(),
            is_initiator: session.is_initiator(),
            media_kind: session.media_kind(),
        };
        // The call works without it; only navigation survival is lost.
        if let Err(e) = self.store.save(&call_ref).await {
            warn!("failed to persist call ref for {}: {e}", call_ref.channel_id);
        }
    }

    fn spawn_ring_timeout(&self, session: &Arc<CallSession>) {
        let weak = Arc::downgrade(session);
        let timeout = self.config.ring_timeout;
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            if let Some(session) = weak.upgrade() {
                if !session.acked() && !session.is_ended() {
                    info!("call {} was never answered", session.channel_id());
                    session
                        .hang_up_with(CallEndReason::AnswerTimeout, true)
                        .await;
                }
            }
        });
    }
}

fn generate_channel_id(mode: TransportMode) -> String {
    let prefix = match mode {
        TransportMode::Browser => "mc",
        TransportMode::Native => "nc",
    };
    let mut rng = rand::rng();
    let suffix: String = (0..12).map(|_| rng.sample(Alphanumeric) as char).collect();
    format!("{prefix}-{suffix}")
}
