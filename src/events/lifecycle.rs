//! Typed room-lifecycle callbacks.

use ruma::{OwnedRoomId, RoomId};

use super::RawEvent;

/// Callback channel a [`LifecycleEvent`] belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LifecycleKind {
    Join,
    Leave,
    Invite,
    Archived,
    Upgraded,
    Message,
    /// Fires once for every timeline event.
    Generic,
    RoomAccountData,
    AccountData,
}

impl LifecycleKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            LifecycleKind::Join => "room.join",
            LifecycleKind::Leave => "room.leave",
            LifecycleKind::Invite => "room.invite",
            LifecycleKind::Archived => "room.archived",
            LifecycleKind::Upgraded => "room.upgraded",
            LifecycleKind::Message => "room.message",
            LifecycleKind::Generic => "room.event",
            LifecycleKind::RoomAccountData => "room.account_data",
            LifecycleKind::AccountData => "account_data",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum LifecycleEvent {
    /// The local identity joined a room. Sync-detected joins carry no event.
    Join {
        room_id: OwnedRoomId,
        event: Option<RawEvent>,
    },
    Leave {
        room_id: OwnedRoomId,
        event: RawEvent,
    },
    Invite {
        room_id: OwnedRoomId,
        event: RawEvent,
    },
    /// A tombstone closed the room.
    Archived {
        room_id: OwnedRoomId,
        event: RawEvent,
    },
    /// The room's create event names a different predecessor.
    Upgraded {
        room_id: OwnedRoomId,
        event: RawEvent,
    },
    Message {
        room_id: OwnedRoomId,
        event: RawEvent,
    },
    Event {
        room_id: OwnedRoomId,
        event: RawEvent,
    },
    RoomAccountData {
        room_id: OwnedRoomId,
        event: RawEvent,
    },
    AccountData {
        event: RawEvent,
    },
}

impl LifecycleEvent {
    pub fn kind(&self) -> LifecycleKind {
        match self {
            LifecycleEvent::Join { .. } => LifecycleKind::Join,
            LifecycleEvent::Leave { .. } => LifecycleKind::Leave,
            LifecycleEvent::Invite { .. } => LifecycleKind::Invite,
            LifecycleEvent::Archived { .. } => LifecycleKind::Archived,
            LifecycleEvent::Upgraded { .. } => LifecycleKind::Upgraded,
            LifecycleEvent::Message { .. } => LifecycleKind::Message,
            LifecycleEvent::Event { .. } => LifecycleKind::Generic,
            LifecycleEvent::RoomAccountData { .. } => LifecycleKind::RoomAccountData,
            LifecycleEvent::AccountData { .. } => LifecycleKind::AccountData,
        }
    }

    pub fn room_id(&self) -> Option<&RoomId> {
        match self {
            LifecycleEvent::Join { room_id, .. }
            | LifecycleEvent::Leave { room_id, .. }
            | LifecycleEvent::Invite { room_id, .. }
            | LifecycleEvent::Archived { room_id, .. }
            | LifecycleEvent::Upgraded { room_id, .. }
            | LifecycleEvent::Message { room_id, .. }
            | LifecycleEvent::Event { room_id, .. }
            | LifecycleEvent::RoomAccountData { room_id, .. } => Some(room_id),
            LifecycleEvent::AccountData { .. } => None,
        }
    }

    pub fn event(&self) -> Option<&RawEvent> {
        match self {
            LifecycleEvent::Join { event, .. } => event.as_ref(),
            LifecycleEvent::Leave { event, .. }
            | LifecycleEvent::Invite { event, .. }
            | LifecycleEvent::Archived { event, .. }
            | LifecycleEvent::Upgraded { event, .. }
            | LifecycleEvent::Message { event, .. }
            | LifecycleEvent::Event { event, .. }
            | LifecycleEvent::RoomAccountData { event, .. }
            | LifecycleEvent::AccountData { event } => Some(event),
        }
    }
}
