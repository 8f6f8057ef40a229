//! Media transports for call sessions.
//!
//! A session owns exactly one transport, chosen at construction time from
//! the resolved [`TransportMode`](crate::mode::TransportMode):
//!
//! - [`RtcTransport`]: direct peer-to-peer media with local device capture
//!   and SDP/ICE negotiation over the signaling channel.
//! - [`NativeTransport`]: capture and encoding delegated to an out-of-process
//!   encoder; media arrives as pre-encoded chunks over binary sockets.
//!
//! Transports never mutate session state directly: they emit
//! [`TransportEvent`]s the session consumes.

mod native;
mod rtc;

pub use native::{
    ControlClient, MediaEndpoints, NativeSessionInfo, NativeTransport, NativeTransportConfig,
};
pub use rtc::{MediaCapture, RtcTransport};

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_remote::TrackRemote;

use crate::error::CallError;
use crate::media::MediaBuffer;
use crate::mode::MediaKind;
use crate::signaling::IceCandidateInit;

/// A playable media handle surfaced to the UI through session observables.
#[derive(Clone)]
pub enum MediaStream {
    /// Local capture tracks (browser mode).
    LocalTracks(Vec<Arc<dyn TrackLocal + Send + Sync>>),
    /// A remote track received over the peer connection (browser mode).
    RemoteTrack(Arc<TrackRemote>),
    /// A progressive buffer fed from a media socket (native mode).
    Buffered(Arc<MediaBuffer>),
}

impl fmt::Debug for MediaStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::LocalTracks(tracks) => write!(f, "LocalTracks({})", tracks.len()),
            Self::RemoteTrack(track) => write!(f, "RemoteTrack({})", track.id()),
            Self::Buffered(_) => write!(f, "Buffered"),
        }
    }
}

/// Link-level connectivity as reported by the underlying transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Connecting,
    Up,
    /// Transiently down; may recover via ICE restart or a reconnect signal.
    Degraded,
}

/// Events a transport feeds back to its owning session.
#[derive(Debug, Clone)]
pub enum TransportEvent {
    LocalMedia(MediaStream),
    RemoteMedia(MediaStream),
    /// A live media path exists; the session becomes `Connected`.
    Connected,
    Link(LinkState),
    /// Unrecoverable failure; the session errors out and hangs up.
    Failed(String),
}

/// One media pipeline behind a session.
///
/// `on_*` handlers are invoked from signal dispatch once the session has
/// verified the transport prerequisite for that signal.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Acquire local resources (capture, peer connection) for the call.
    async fn setup(&self, media_kind: MediaKind) -> Result<(), CallError>;

    /// The remote side is ready: as initiator create and send the offer;
    /// in native mode open the media sockets.
    async fn on_ack(&self) -> Result<(), CallError>;

    /// Apply a remote SDP offer and reply with an answer.
    async fn on_offer(&self, sdp: &str) -> Result<(), CallError>;

    /// Apply the remote SDP answer.
    async fn on_answer(&self, sdp: &str) -> Result<(), CallError>;

    /// Apply (or queue) a trickled remote ICE candidate.
    async fn on_candidate(&self, candidate: IceCandidateInit) -> Result<(), CallError>;

    /// Apply the session's audio intent; best-effort.
    fn set_audio_enabled(&self, enabled: bool);

    /// Apply the session's video intent; best-effort.
    fn set_video_enabled(&self, enabled: bool);

    /// Release every owned resource. Idempotent.
    async fn close(&self);
}
