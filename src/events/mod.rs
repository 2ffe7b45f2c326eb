// =============================================================================
// Matrixon Appservice - Events Module
// =============================================================================
//
// Project: Matrixon - Ultra High Performance Matrix NextServer (Synapse Alternative)
// Author: arkSong (arksong2018@gmail.com) - Founder of Matrixon Innovation Project
// Date: 2024-12-11
// Version: 0.11.0-alpha
// License: Apache 2.0 / MIT
//
// Description:
//   Raw room events as they arrive from the homeserver, and the typed view
//   built over them for the event kinds the appservice layer acts on.
//
// =============================================================================

mod lifecycle;
mod sync;

pub use lifecycle::{LifecycleEvent, LifecycleKind};
pub use sync::{EventList, InvitedRoom, RoomSection, Rooms, SyncSnapshot};

use ruma::{EventId, OwnedEventId, OwnedRoomId, RoomId};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Event type names the layer classifies on.
pub mod event_type {
    pub const ROOM_MESSAGE: &str = "m.room.message";
    pub const ROOM_MEMBER: &str = "m.room.member";
    pub const ROOM_CREATE: &str = "m.room.create";
    pub const ROOM_TOMBSTONE: &str = "m.room.tombstone";
}

/// Room version assumed when a create event does not name one.
pub const DEFAULT_ROOM_VERSION: &str = "1";

/// An untyped event payload.
///
/// Every accessor tolerates missing or mistyped fields and answers `None`.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RawEvent(Value);

impl RawEvent {
    pub fn new(json: Value) -> Self {
        Self(json)
    }

    pub fn json(&self) -> &Value {
        &self.0
    }

    /// Mutable access for preprocessors.
    pub fn json_mut(&mut self) -> &mut Value {
        &mut self.0
    }

    pub fn into_json(self) -> Value {
        self.0
    }

    fn str_field(&self, key: &str) -> Option<&str> {
        self.0.get(key).and_then(Value::as_str)
    }

    pub fn event_type(&self) -> Option<&str> {
        self.str_field("type")
    }

    pub fn state_key(&self) -> Option<&str> {
        self.str_field("state_key")
    }

    pub fn sender(&self) -> Option<&str> {
        self.str_field("sender")
    }

    pub fn room_id(&self) -> Option<&str> {
        self.str_field("room_id")
    }

    pub fn event_id(&self) -> Option<OwnedEventId> {
        self.str_field("event_id")
            .and_then(|id| EventId::parse(id).ok())
    }

    pub fn content(&self) -> Option<&Value> {
        self.0.get("content")
    }

    /// `unsigned.age` in milliseconds.
    pub fn age(&self) -> Option<u64> {
        self.0
            .get("unsigned")
            .and_then(|unsigned| unsigned.get("age"))
            .and_then(Value::as_u64)
    }

    /// Whether this is a state event with an empty state key.
    pub fn is_room_state(&self) -> bool {
        self.state_key() == Some("")
    }

    fn content_str(&self, key: &str) -> Option<&str> {
        self.content()?.get(key)?.as_str()
    }

    /// Builds the typed view of this event.
    pub fn typed(&self) -> EventContent {
        match self.event_type() {
            Some(event_type::ROOM_CREATE) => EventContent::Create {
                room_version: self
                    .content_str("room_version")
                    .unwrap_or(DEFAULT_ROOM_VERSION)
                    .to_owned(),
                predecessor: self
                    .content()
                    .and_then(|c| c.get("predecessor"))
                    .and_then(|p| p.get("room_id"))
                    .and_then(Value::as_str)
                    .and_then(|id| RoomId::parse(id).ok()),
            },
            Some(event_type::ROOM_TOMBSTONE) => EventContent::Tombstone {
                replacement_room: self
                    .content_str("replacement_room")
                    .and_then(|id| RoomId::parse(id).ok()),
                body: self.content_str("body").map(str::to_owned),
            },
            Some(event_type::ROOM_MEMBER) => match self.state_key() {
                Some(state_key) => EventContent::Member {
                    state_key: state_key.to_owned(),
                    membership: Membership::from(self.content_str("membership").unwrap_or("")),
                },
                None => EventContent::Other,
            },
            Some(event_type::ROOM_MESSAGE) => EventContent::Message {
                msgtype: self.content_str("msgtype").map(str::to_owned),
                body: self.content_str("body").map(str::to_owned),
            },
            _ => EventContent::Other,
        }
    }
}

impl From<Value> for RawEvent {
    fn from(json: Value) -> Self {
        Self(json)
    }
}

/// Typed view over the event kinds the layer understands.
///
/// Anything else is `Other`; the raw payload stays available on the
/// [`RawEvent`] it came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventContent {
    Create {
        room_version: String,
        predecessor: Option<OwnedRoomId>,
    },
    Tombstone {
        replacement_room: Option<OwnedRoomId>,
        body: Option<String>,
    },
    Member {
        state_key: String,
        membership: Membership,
    },
    Message {
        msgtype: Option<String>,
        body: Option<String>,
    },
    Other,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Membership {
    Join,
    Leave,
    Ban,
    Invite,
    Knock,
    Unknown(String),
}

impl From<&str> for Membership {
    fn from(value: &str) -> Self {
        match value {
            "join" => Membership::Join,
            "leave" => Membership::Leave,
            "ban" => Membership::Ban,
            "invite" => Membership::Invite,
            "knock" => Membership::Knock,
            other => Membership::Unknown(other.to_owned()),
        }
    }
}
