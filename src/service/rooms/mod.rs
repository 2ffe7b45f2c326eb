// =============================================================================
// Matrixon Appservice - Rooms Module
// =============================================================================
//
// Project: Matrixon - Ultra High Performance Matrix NextServer (Synapse Alternative)
// Author: arkSong (arksong2018@gmail.com) - Founder of Matrixon Innovation Project
// Date: 2024-12-11
// Version: 0.11.0-alpha
// License: Apache 2.0 / MIT
//
// Description:
//   Room state access and the upgrade chain resolver built on top of it.
//
// =============================================================================

pub mod upgrade;

pub use upgrade::{get_upgrade_history, RoomReference, RoomUpgradeHistory};

use async_trait::async_trait;
use ruma::RoomId;

use crate::{api::HomeserverApi, events::RawEvent, Result};

/// Read access to a room's current state events.
#[async_trait]
pub trait RoomStateAccessor: Send + Sync {
    async fn state_events(&self, room_id: &RoomId) -> Result<Vec<RawEvent>>;
}

#[async_trait]
impl<T> RoomStateAccessor for T
where
    T: HomeserverApi + ?Sized,
{
    async fn state_events(&self, room_id: &RoomId) -> Result<Vec<RawEvent>> {
        self.room_state(room_id).await
    }
}

/// First state event of `event_type` with an empty state key.
pub fn room_state_event<'a>(state: &'a [RawEvent], event_type: &str) -> Option<&'a RawEvent> {
    state
        .iter()
        .find(|event| event.event_type() == Some(event_type) && event.is_room_state())
}
