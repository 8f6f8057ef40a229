//! Client-side peer-to-peer call session management.
//!
//! One [`SessionManager`] per client establishes, maintains and tears down
//! real-time audio/video calls between two peers over an abstract signaling
//! bus, and survives full navigation away from and back to the hosting
//! context.
//!
//! # Architecture
//!
//! - [`ModeResolver`]: one-shot runtime discovery of the transport mode
//! - [`Signal`] & [`SignalingBus`]: typed call signals over a per-call topic
//! - [`CallSession`]: the per-call state machine and signal dispatch
//! - [`transport`]: browser transport (local capture + peer connection) and
//!   native transport (delegated encoding over binary media sockets)
//! - [`media`]: progressive buffer ingestion and playback stall detection
//! - [`reconnect`]: persisted call identity for navigation survival
//! - [`CallInvite`]: actionable handle for an incoming call
//! - [`SessionManager`]: the registry that routes signals and owns sessions
//!
//! Every external collaborator (the bus, device capture, playback surfaces,
//! the encoder control plane, persisted storage) enters through a trait, so
//! the whole call flow is testable against in-memory doubles.

mod error;
mod invite;
mod manager;
pub mod media;
mod mode;
mod observable;
mod reconnect;
mod session;
mod signaling;
pub mod transport;

pub use error::CallError;
pub use invite::CallInvite;
pub use manager::{SessionManager, SessionManagerBuilder, SessionManagerConfig};
pub use mode::{MediaKind, ModeInfo, ModeResolver, RuntimeProbe, TransportMode};
pub use observable::Observable;
pub use reconnect::{CallRefStore, FileCallRefStore, MemoryCallRefStore, PersistedCallRef};
pub use session::{CallEndReason, CallSession, CallSnapshot, CallState};
pub use signaling::{
    call_topic, IceCandidateInit, InMemorySignalingBus, Signal, SignalBody, SignalingBus,
};
pub use transport::{
    ControlClient, MediaCapture, MediaEndpoints, MediaStream, NativeSessionInfo, Transport,
    TransportEvent,
};
