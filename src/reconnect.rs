//! Persisted call identity for navigation survival.
//!
//! A live call writes a minimal [`PersistedCallRef`] at setup time. After the
//! hosting context is torn down and recreated,
//! [`SessionManager::restore`](crate::manager::SessionManager::restore) reads
//! it back exactly once and rebuilds the session under the same identity.
//! At most one ref exists at a time; it is cleared on hangup and consumed
//! immediately before a restore uses it.

use std::path::PathBuf;
use std::sync::Mutex as StdMutex;

use async_trait::async_trait;
use log::debug;
use serde::{Deserialize, Serialize};

use crate::error::CallError;
use crate::mode::MediaKind;

/// The minimal identity a call needs to survive navigation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PersistedCallRef {
    pub channel_id: String,
    pub remote_peer: String,
    pub is_initiator: bool,
    pub media_kind: MediaKind,
}

/// Storage slot holding at most one call ref.
#[async_trait]
pub trait CallRefStore: Send + Sync {
    async fn save(&self, call_ref: &PersistedCallRef) -> Result<(), CallError>;

    /// Read and consume the ref in one step; absence yields `None`.
    async fn take(&self) -> Result<Option<PersistedCallRef>, CallError>;

    async fn clear(&self) -> Result<(), CallError>;
}

/// JSON file slot, the on-disk analogue of an origin-scoped storage key.
pub struct FileCallRefStore {
    path: PathBuf,
}

impl FileCallRefStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl CallRefStore for FileCallRefStore {
    async fn save(&self, call_ref: &PersistedCallRef) -> Result<(), CallError> {
        let json = serde_json::to_vec(call_ref)?;
        tokio::fs::write(&self.path, json).await?;
        debug!("persisted call ref for {}", call_ref.channel_id);
        Ok(())
    }

    async fn take(&self) -> Result<Option<PersistedCallRef>, CallError> {
        let bytes = match tokio::fs::read(&self.path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        // Consume before handing the ref out, so a crash mid-restore cannot
        // replay it on the next load.
        tokio::fs::remove_file(&self.path).await?;
        let call_ref: PersistedCallRef = serde_json::from_slice(&bytes)?;
        Ok(Some(call_ref))
    }

    async fn clear(&self) -> Result<(), CallError> {
        match tokio::fs::remove_file(&self.path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// In-memory slot for tests and embedders without durable storage.
#[derive(Default)]
pub struct MemoryCallRefStore {
    slot: StdMutex<Option<PersistedCallRef>>,
}

#[async_trait]
impl CallRefStore for MemoryCallRefStore {
    async fn save(&self, call_ref: &PersistedCallRef) -> Result<(), CallError> {
        *self.slot.lock().unwrap() = Some(call_ref.clone());
        Ok(())
    }

    async fn take(&self) -> Result<Option<PersistedCallRef>, CallError> {
        Ok(self.slot.lock().unwrap().take())
    }

    async fn clear(&self) -> Result<(), CallError> {
        self.slot.lock().unwrap().take();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> PersistedCallRef {
        PersistedCallRef {
            channel_id: "mc-abc".into(),
            remote_peer: "peer-q".into(),
            is_initiator: true,
            media_kind: MediaKind::Video,
        }
    }

    #[tokio::test]
    async fn test_file_store_roundtrip_consumes_the_ref() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileCallRefStore::new(dir.path().join("call-ref.json"));

        store.save(&sample()).await.unwrap();
        assert_eq!(store.take().await.unwrap(), Some(sample()));
        // Consumed: a second take sees nothing.
        assert_eq!(store.take().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_file_store_empty_slot_and_clear() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileCallRefStore::new(dir.path().join("call-ref.json"));

        assert_eq!(store.take().await.unwrap(), None);
        store.clear().await.unwrap();

        store.save(&sample()).await.unwrap();
        store.clear().await.unwrap();
        assert_eq!(store.take().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_save_overwrites_previous_ref() {
        let store = MemoryCallRefStore::default();
        store.save(&sample()).await.unwrap();
        let mut second = sample();
        second.channel_id = "nc-xyz".into();
        store.save(&second).await.unwrap();

        assert_eq!(store.take().await.unwrap(), Some(second));
    }

    #[test]
    fn test_ref_wire_shape() {
        let json = serde_json::to_value(sample()).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "channelId": "mc-abc",
                "remotePeer": "peer-q",
                "isInitiator": true,
                "mediaKind": "video",
            })
        );
    }
}
