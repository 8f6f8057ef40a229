//! Signal types and the signaling bus boundary.
//!
//! Call control rides an abstract publish/subscribe bus with ordered
//! per-topic delivery and application-level acknowledgement; this crate never
//! re-implements delivery guarantees, it only defines the message shapes and
//! the one-method seam ([`SignalingBus`]) outbound signals go through.
//! Inbound delivery is the embedder's job: it feeds received signals to
//! [`SessionManager::handle_signal`](crate::manager::SessionManager::handle_signal).

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::CallError;
use crate::mode::{MediaKind, TransportMode};

/// Topic name for a call's signaling channel.
pub fn call_topic(channel_id: &str) -> String {
    format!("call:{channel_id}")
}

/// A single ICE candidate exchanged during browser-mode negotiation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidateInit {
    pub candidate: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp_mline_index: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username_fragment: Option<String>,
}

/// Typed payload of a call signal, tagged with `type` on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum SignalBody {
    /// Invite: the initiator announces a call.
    #[serde(rename_all = "camelCase")]
    CallRequest {
        media_kind: MediaKind,
        mode: TransportMode,
        platform: String,
    },
    /// The callee accepted and finished local setup.
    CallAck {
        mode: TransportMode,
        platform: String,
    },
    /// SDP offer (browser mode only).
    CallOffer { sdp: String },
    /// SDP answer (browser mode only).
    CallAnswer { sdp: String },
    /// Trickled ICE candidate (browser mode only).
    IceCandidate { candidate: IceCandidateInit },
    /// Hangup, either direction.
    CallHangup,
    /// Navigation recovery: the sender rebuilt its context and wants to
    /// renegotiate without changing the call's identity.
    #[serde(rename_all = "camelCase")]
    CallReconnect { media_kind: MediaKind },
    /// Reply to `call-reconnect`; treated exactly like `call-ack`.
    CallReconnectAck {
        mode: TransportMode,
        platform: String,
    },
}

impl SignalBody {
    /// Wire tag for logging.
    pub fn tag(&self) -> &'static str {
        match self {
            Self::CallRequest { .. } => "call-request",
            Self::CallAck { .. } => "call-ack",
            Self::CallOffer { .. } => "call-offer",
            Self::CallAnswer { .. } => "call-answer",
            Self::IceCandidate { .. } => "ice-candidate",
            Self::CallHangup => "call-hangup",
            Self::CallReconnect { .. } => "call-reconnect",
            Self::CallReconnectAck { .. } => "call-reconnect-ack",
        }
    }
}

/// A call signal addressed to one call's topic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Signal {
    pub channel_id: String,
    #[serde(flatten)]
    pub body: SignalBody,
}

impl Signal {
    pub fn new(channel_id: impl Into<String>, body: SignalBody) -> Self {
        Self {
            channel_id: channel_id.into(),
            body,
        }
    }

    pub fn topic(&self) -> String {
        call_topic(&self.channel_id)
    }
}

/// Outbound half of the signaling bus.
///
/// `publish` resolves once the bus has acknowledged the message; delivery
/// retries belong to the bus, not to this crate.
#[async_trait]
pub trait SignalingBus: Send + Sync {
    async fn publish(&self, topic: &str, signal: &Signal) -> Result<(), CallError>;
}

/// Loopback bus endpoint delivering straight to a peer's inbound queue.
///
/// Used by the integration tests to wire two session managers together;
/// acknowledgement is immediate and ordering is the channel's FIFO order.
pub struct InMemorySignalingBus {
    local_peer: String,
    remote_tx: tokio::sync::mpsc::UnboundedSender<(String, Signal)>,
}

impl InMemorySignalingBus {
    /// Build a connected pair of endpoints for peers `a` and `b`.
    ///
    /// Each receiver yields `(sender_peer_id, signal)` in publish order.
    #[allow(clippy::type_complexity)]
    pub fn pair(
        a: &str,
        b: &str,
    ) -> (
        (
            std::sync::Arc<Self>,
            tokio::sync::mpsc::UnboundedReceiver<(String, Signal)>,
        ),
        (
            std::sync::Arc<Self>,
            tokio::sync::mpsc::UnboundedReceiver<(String, Signal)>,
        ),
    ) {
        let (a_to_b_tx, a_to_b_rx) = tokio::sync::mpsc::unbounded_channel();
        let (b_to_a_tx, b_to_a_rx) = tokio::sync::mpsc::unbounded_channel();
        let bus_a = std::sync::Arc::new(Self {
            local_peer: a.to_string(),
            remote_tx: a_to_b_tx,
        });
        let bus_b = std::sync::Arc::new(Self {
            local_peer: b.to_string(),
            remote_tx: b_to_a_tx,
        });
        ((bus_a, b_to_a_rx), (bus_b, a_to_b_rx))
    }
}

#[async_trait]
impl SignalingBus for InMemorySignalingBus {
    async fn publish(&self, _topic: &str, signal: &Signal) -> Result<(), CallError> {
        self.remote_tx
            .send((self.local_peer.clone(), signal.clone()))
            .map_err(|_| CallError::Signaling("peer endpoint closed".into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_call_request_wire_shape() {
        let signal = Signal::new(
            "mc-abc123",
            SignalBody::CallRequest {
                media_kind: MediaKind::Video,
                mode: TransportMode::Browser,
                platform: "linux".into(),
            },
        );
        let value = serde_json::to_value(&signal).unwrap();
        assert_eq!(
            value,
            json!({
                "type": "call-request",
                "channelId": "mc-abc123",
                "mediaKind": "video",
                "mode": "browser",
                "platform": "linux",
            })
        );
    }

    #[test]
    fn test_hangup_wire_shape() {
        let signal = Signal::new("nc-x", SignalBody::CallHangup);
        let value = serde_json::to_value(&signal).unwrap();
        assert_eq!(value, json!({"type": "call-hangup", "channelId": "nc-x"}));
    }

    #[test]
    fn test_ice_candidate_roundtrip() {
        let signal = Signal::new(
            "mc-1",
            SignalBody::IceCandidate {
                candidate: IceCandidateInit {
                    candidate: "candidate:1 1 UDP 2130706431 192.168.1.1 8888 typ host".into(),
                    sdp_mid: Some("0".into()),
                    sdp_mline_index: Some(0),
                    username_fragment: None,
                },
            },
        );
        let text = serde_json::to_string(&signal).unwrap();
        let back: Signal = serde_json::from_str(&text).unwrap();
        assert_eq!(signal, back);
    }

    #[test]
    fn test_deserialize_incoming_reconnect() {
        let back: Signal = serde_json::from_value(json!({
            "type": "call-reconnect",
            "channelId": "mc-abc",
            "mediaKind": "audio",
        }))
        .unwrap();
        assert_eq!(back.channel_id, "mc-abc");
        assert_eq!(
            back.body,
            SignalBody::CallReconnect {
                media_kind: MediaKind::Audio
            }
        );
    }

    #[test]
    fn test_topic_name() {
        assert_eq!(call_topic("mc-abc"), "call:mc-abc");
        let signal = Signal::new("mc-abc", SignalBody::CallHangup);
        assert_eq!(signal.topic(), "call:mc-abc");
    }

    #[tokio::test]
    async fn test_in_memory_pair_delivers_in_order() {
        let ((bus_a, mut rx_a), (_bus_b, mut rx_b)) = InMemorySignalingBus::pair("alice", "bob");

        for i in 0..3 {
            let signal = Signal::new(format!("mc-{i}"), SignalBody::CallHangup);
            bus_a.publish(&signal.topic(), &signal).await.unwrap();
        }
        for i in 0..3 {
            let (from, signal) = rx_b.recv().await.unwrap();
            assert_eq!(from, "alice");
            assert_eq!(signal.channel_id, format!("mc-{i}"));
        }
        assert!(rx_a.try_recv().is_err());
    }
}
