// =============================================================================
// Matrixon Appservice - API Module
// =============================================================================
//
// Project: Matrixon - Ultra High Performance Matrix NextServer (Synapse Alternative)
// Author: arkSong (arksong2018@gmail.com) - Founder of Matrixon Innovation Project
// Date: 2024-12-11
// Version: 0.11.0-alpha
// License: Apache 2.0 / MIT
//
// Description:
//   Collaborator interfaces toward the homeserver. The HTTP transport lives
//   behind these traits; the appservice layer only orchestrates calls.
//
// Dependencies:
//   • async-trait for object-safe async collaborators
//   • ruma identifiers for room, user, device and event IDs
//
// =============================================================================

mod context;
pub mod crypto;

pub use context::RequestContext;

use std::{collections::BTreeMap, sync::Arc};

use async_trait::async_trait;
use ruma::{OwnedDeviceId, OwnedEventId, OwnedRoomId, OwnedUserId, RoomId, UserId};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{
    events::{RawEvent, SyncSnapshot},
    Result,
};

/// Parameters of one long-poll request.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncRequest {
    pub since: Option<String>,
    /// Server-side wait, in milliseconds.
    pub timeout_ms: u64,
    pub filter: Option<String>,
    pub full_state: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WhoAmI {
    pub user_id: OwnedUserId,
    pub device_id: Option<OwnedDeviceId>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoginResponse {
    pub access_token: String,
    pub device_id: Option<OwnedDeviceId>,
}

/// One authenticated session against the homeserver.
///
/// Errors follow the layer's taxonomy: transport failures map to
/// `Error::Transport`, error bodies to `Error::Matrix` with the original
/// `errcode` and message.
#[async_trait]
pub trait HomeserverApi: Send + Sync {
    async fn whoami(&self) -> Result<WhoAmI>;

    async fn sync(&self, request: &SyncRequest) -> Result<SyncSnapshot>;

    /// `POST /register` with `m.login.application_service`.
    async fn register_appservice_user(&self, localpart: &str) -> Result<()>;

    /// `POST /login` with `m.login.application_service` for `user_id`.
    async fn login_appservice(&self, user_id: &UserId) -> Result<LoginResponse>;

    async fn joined_rooms(&self) -> Result<Vec<OwnedRoomId>>;

    /// Joins by room ID or alias and returns the joined room ID.
    async fn join_room(&self, room_id_or_alias: &str) -> Result<OwnedRoomId>;

    async fn leave_room(&self, room_id: &RoomId) -> Result<()>;

    async fn send_event(
        &self,
        room_id: &RoomId,
        event_type: &str,
        content: Value,
    ) -> Result<OwnedEventId>;

    async fn room_state(&self, room_id: &RoomId) -> Result<Vec<RawEvent>>;

    /// Device IDs listed by `GET /devices` for the session's user.
    async fn own_devices(&self) -> Result<Vec<OwnedDeviceId>>;

    /// `device_keys[user_id]` from `POST /keys/query`.
    async fn query_device_keys(&self, user_id: &UserId)
        -> Result<BTreeMap<OwnedDeviceId, Value>>;
}

/// Who a client session acts as.
///
/// Without an access token the session uses the appservice token and
/// impersonates `user_id` (and `device_id`, when set).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientIdentity {
    pub user_id: OwnedUserId,
    pub device_id: Option<OwnedDeviceId>,
    pub access_token: Option<String>,
}

impl ClientIdentity {
    pub fn impersonating(user_id: OwnedUserId) -> Self {
        Self {
            user_id,
            device_id: None,
            access_token: None,
        }
    }
}

/// Builds client sessions; owned by the transport layer.
pub trait ClientFactory: Send + Sync {
    fn create_client(&self, identity: ClientIdentity) -> Arc<dyn HomeserverApi>;
}
