//! End-to-end encryption collaborators.
//!
//! The cipher engine itself is external. Intents only pick a device,
//! hand the engine an authenticated session and feed it room events.

use std::sync::Arc;

use async_trait::async_trait;
use ruma::{DeviceId, OwnedDeviceId, OwnedRoomId, RoomId, UserId};

use super::HomeserverApi;
use crate::{events::RawEvent, Result};

/// Per-user crypto session store.
#[async_trait]
pub trait CryptoStore: Send + Sync {
    /// Device the engine's keys belong to, if one was recorded.
    async fn device_id(&self) -> Result<Option<OwnedDeviceId>>;

    async fn set_device_id(&self, device_id: &DeviceId) -> Result<()>;
}

#[async_trait]
pub trait CryptoEngine: Send + Sync {
    /// Uploads keys and loads room state for the given joined rooms.
    async fn prepare(&self, joined_rooms: &[OwnedRoomId]) -> Result<()>;

    async fn on_room_event(&self, room_id: &RoomId, event: &RawEvent) -> Result<()>;
}

pub trait CryptoProvider: Send + Sync {
    fn store_for_user(&self, user_id: &UserId) -> Arc<dyn CryptoStore>;

    fn create_engine(
        &self,
        client: Arc<dyn HomeserverApi>,
        store: Arc<dyn CryptoStore>,
    ) -> Arc<dyn CryptoEngine>;
}
