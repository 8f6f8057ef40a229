//! Media plumbing for the delegated-encoding transport.
//!
//! - [`MediaBuffer`]: bounded, strictly serialized chunk ingestion into a
//!   progressive playback source, with a retention-window trim after each
//!   append.
//! - [`StallMonitor`]: cooperative polling watchdog that tears a stream down
//!   when its playback position stops advancing.
//!
//! The playback surface itself is external; it appears here only as the
//! [`SourceSink`] and [`PlaybackProbe`] trait boundaries.

mod buffer;
mod stall;

pub use buffer::{MediaBuffer, MediaBufferConfig, SourceError, SourceSink};
pub use stall::{PlaybackProbe, StallConfig, StallMonitor};

use std::sync::Arc;

/// Which media lane a surface renders.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaLane {
    /// The remote party's feed.
    Remote,
    /// The local peer's own feed, echoed back by the encoder.
    SelfView,
}

/// One playback surface: the sink chunks are appended to, and the probe the
/// stall monitor polls.
#[derive(Clone)]
pub struct MediaSurface {
    pub sink: Arc<dyn SourceSink>,
    pub probe: Arc<dyn PlaybackProbe>,
}

/// Provides playback surfaces for a call's media lanes.
pub trait SurfaceFactory: Send + Sync {
    fn surface(&self, channel_id: &str, lane: MediaLane) -> MediaSurface;
}
