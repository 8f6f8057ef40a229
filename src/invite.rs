//! Incoming-call invites.
//!
//! A `call-request` for an unknown channel becomes a [`CallInvite`] on the
//! manager's invite observable. The invite is an actionable handle: exactly
//! one of [`accept`](CallInvite::accept) or [`reject`](CallInvite::reject)
//! may run, and any transport decision is deferred until mode resolution
//! completes, even when the invite arrived first.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use chrono::{DateTime, Utc};
use log::info;

use crate::error::CallError;
use crate::manager::SessionManager;
use crate::mode::{MediaKind, TransportMode};
use crate::session::CallSession;

/// An incoming call awaiting a local decision.
pub struct CallInvite {
    channel_id: String,
    caller: String,
    media_kind: MediaKind,
    caller_mode: TransportMode,
    caller_platform: String,
    received_at: DateTime<Utc>,
    consumed: AtomicBool,
    manager: Weak<SessionManager>,
}

impl CallInvite {
    pub(crate) fn new(
        channel_id: String,
        caller: String,
        media_kind: MediaKind,
        caller_mode: TransportMode,
        caller_platform: String,
        manager: Weak<SessionManager>,
    ) -> Arc<Self> {
        Arc::new(Self {
            channel_id,
            caller,
            media_kind,
            caller_mode,
            caller_platform,
            received_at: Utc::now(),
            consumed: AtomicBool::new(false),
            manager,
        })
    }

    pub fn channel_id(&self) -> &str {
        &self.channel_id
    }

    pub fn caller(&self) -> &str {
        &self.caller
    }

    pub fn media_kind(&self) -> MediaKind {
        self.media_kind
    }

    pub fn caller_mode(&self) -> TransportMode {
        self.caller_mode
    }

    pub fn caller_platform(&self) -> &str {
        &self.caller_platform
    }

    pub fn received_at(&self) -> DateTime<Utc> {
        self.received_at
    }

    /// Accept the call: full callee-side setup for the resolved mode, then
    /// `call-ack`. Rejects the future if local setup fails.
    pub async fn accept(&self) -> Result<Arc<CallSession>, CallError> {
        let manager = self.manager.upgrade().ok_or(CallError::Shutdown)?;
        if self.consumed.swap(true, Ordering::SeqCst) {
            return Err(CallError::InviteConsumed);
        }
        info!("accepting call {} from {}", self.channel_id, self.caller);
        manager.accept_invite(self).await
    }

    /// Decline the call. Sends `call-hangup`; no transport is ever built.
    pub async fn reject(&self) -> Result<(), CallError> {
        let manager = self.manager.upgrade().ok_or(CallError::Shutdown)?;
        if self.consumed.swap(true, Ordering::SeqCst) {
            return Err(CallError::InviteConsumed);
        }
        info!("rejecting call {} from {}", self.channel_id, self.caller);
        manager.send_hangup(&self.channel_id).await
    }
}
