//! Sync response model.
//!
//! Every level is optional on the wire. Missing keys and explicit `null`
//! both deserialize to an empty value.

use std::collections::BTreeMap;

use ruma::OwnedRoomId;
use serde::{Deserialize, Deserializer, Serialize};

use super::RawEvent;

fn nullable<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SyncSnapshot {
    /// Cursor for the next long-poll request.
    #[serde(default, deserialize_with = "nullable")]
    pub next_batch: Option<String>,
    #[serde(default, deserialize_with = "nullable")]
    pub account_data: EventList,
    #[serde(default, deserialize_with = "nullable")]
    pub rooms: Rooms,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EventList {
    #[serde(default, deserialize_with = "nullable")]
    pub events: Vec<RawEvent>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Rooms {
    #[serde(default, deserialize_with = "nullable")]
    pub join: BTreeMap<OwnedRoomId, RoomSection>,
    #[serde(default, deserialize_with = "nullable")]
    pub leave: BTreeMap<OwnedRoomId, RoomSection>,
    #[serde(default, deserialize_with = "nullable")]
    pub invite: BTreeMap<OwnedRoomId, InvitedRoom>,
}

/// A joined or left room.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RoomSection {
    #[serde(default, deserialize_with = "nullable")]
    pub timeline: EventList,
    #[serde(default, deserialize_with = "nullable")]
    pub account_data: EventList,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InvitedRoom {
    #[serde(default, deserialize_with = "nullable")]
    pub invite_state: EventList,
}

#[cfg(test)]
mod tests {
    use super::*;
    use ruma::room_id;
    use serde_json::json;

    #[test]
    fn test_empty_object_is_empty_snapshot() {
        let snapshot: SyncSnapshot = serde_json::from_value(json!({})).unwrap();
        assert_eq!(snapshot, SyncSnapshot::default());
    }

    #[test]
    fn test_nulls_and_missing_sections() {
        let snapshot: SyncSnapshot = serde_json::from_value(json!({
            "next_batch": "s72595_4483_1934",
            "account_data": null,
            "rooms": {
                "join": {
                    "!a:example.org": {},
                    "!b:example.org": {"timeline": null, "account_data": {"events": null}}
                },
                "leave": null,
                "invite": {"!c:example.org": {"invite_state": {}}}
            }
        }))
        .unwrap();

        assert_eq!(snapshot.next_batch.as_deref(), Some("s72595_4483_1934"));
        assert!(snapshot.account_data.events.is_empty());
        assert_eq!(snapshot.rooms.join.len(), 2);
        assert!(snapshot.rooms.join[room_id!("!b:example.org")]
            .timeline
            .events
            .is_empty());
        assert!(snapshot.rooms.leave.is_empty());
        assert!(snapshot.rooms.invite[room_id!("!c:example.org")]
            .invite_state
            .events
            .is_empty());
    }
}
