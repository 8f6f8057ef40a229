//! Transport mode resolution.
//!
//! A client runs in exactly one of two transport modes, discovered once at
//! startup by querying its own runtime. Everything that picks a transport
//! blocks on [`ModeResolver::resolve`], so no call setup can race ahead of
//! mode discovery and no code path ever branches on a default value.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::OnceCell;

/// How call media is transported for this client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportMode {
    /// Capture and encoding are delegated to an out-of-process encoder.
    Native,
    /// Direct peer-to-peer media with local device capture.
    Browser,
}

impl fmt::Display for TransportMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Native => write!(f, "native"),
            Self::Browser => write!(f, "browser"),
        }
    }
}

/// Requested media for a call, immutable for the session's lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Audio,
    Video,
}

impl MediaKind {
    pub fn has_video(&self) -> bool {
        matches!(self, Self::Video)
    }
}

/// Result of runtime mode discovery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModeInfo {
    pub mode: TransportMode,
    /// Free-form platform tag, echoed in call-request/call-ack payloads.
    pub platform: String,
}

/// One-shot query against the hosting runtime.
#[async_trait]
pub trait RuntimeProbe: Send + Sync {
    async fn mode_info(&self) -> ModeInfo;
}

/// One-shot latch over the runtime probe.
///
/// Safe to await from any number of concurrent call sites; the underlying
/// probe runs at most once and its answer is cached for the lifetime of the
/// resolver.
pub struct ModeResolver {
    probe: Arc<dyn RuntimeProbe>,
    resolved: OnceCell<ModeInfo>,
}

impl ModeResolver {
    pub fn new(probe: Arc<dyn RuntimeProbe>) -> Self {
        Self {
            probe,
            resolved: OnceCell::new(),
        }
    }

    /// Await mode resolution, triggering the probe on first use only.
    pub async fn resolve(&self) -> ModeInfo {
        self.resolved
            .get_or_init(|| async { self.probe.mode_info().await })
            .await
            .clone()
    }

    /// The resolved mode, if resolution already completed.
    pub fn peek(&self) -> Option<&ModeInfo> {
        self.resolved.get()
    }
}
