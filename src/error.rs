//! Call-related error types.

use thiserror::Error;

use crate::session::CallState;

#[derive(Debug, Error)]
pub enum CallError {
    #[error("no session for channel: {0}")]
    NotFound(String),

    #[error("session already exists for channel: {0}")]
    DuplicateChannel(String),

    #[error("invalid call state transition: {from:?} -> {attempted:?}")]
    InvalidTransition { from: CallState, attempted: CallState },

    #[error("media capture failed: {0}")]
    Capture(String),

    #[error("negotiation failure: {0}")]
    Negotiation(String),

    #[error("transport failure: {0}")]
    Transport(String),

    #[error("signaling delivery failed: {0}")]
    Signaling(String),

    #[error("control request failed: {0}")]
    Control(String),

    #[error("media source did not open in time")]
    SourceOpenTimeout,

    #[error("storage error: {0}")]
    Storage(#[from] std::io::Error),

    #[error("persisted call state corrupt: {0}")]
    Persist(#[from] serde_json::Error),

    #[error("missing dependency for resolved transport mode: {0}")]
    Configuration(&'static str),

    #[error("session manager dropped")]
    Shutdown,

    #[error("invite already consumed")]
    InviteConsumed,
}
