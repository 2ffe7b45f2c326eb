// =============================================================================
// Matrixon Appservice - Sync Module
// =============================================================================
//
// Project: Matrixon - Ultra High Performance Matrix NextServer (Synapse Alternative)
// Author: arkSong (arksong2018@gmail.com) - Founder of Matrixon Innovation Project
// Date: 2024-12-11
// Version: 0.11.0-alpha
// License: Apache 2.0 / MIT
//
// Description:
//   Turns sync snapshots into an ordered, deduplicated stream of room
//   lifecycle events. Join detection is idempotent across the engine's
//   lifetime; every other callback follows the snapshot as delivered.
//
// Architecture:
//   • classifier: preprocessor chain and per-event classification
//   • runner: sequential long-poll loop with a cooperative stop flag
//   • data: sync cursor storage
//
// =============================================================================

pub mod classifier;
mod data;
mod runner;

pub use classifier::{EventClassifier, Preprocessor};
pub use data::Data;
pub use runner::{StopHandle, SyncRunner, SyncSettings};

use std::{collections::HashSet, sync::Arc, time::Instant};

use ruma::{OwnedRoomId, OwnedUserId, RoomId, UserId};
use tracing::{debug, info, instrument};

use crate::{
    events::{event_type, LifecycleEvent, RawEvent, SyncSnapshot},
    service::dispatcher::Dispatcher,
};

/// Rooms the local identity is known to be joined to.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KnownRooms {
    rooms: HashSet<OwnedRoomId>,
}

impl KnownRooms {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, room_id: &RoomId) -> bool {
        self.rooms.contains(room_id)
    }

    /// Returns `true` if the room was not known before.
    pub fn insert(&mut self, room_id: OwnedRoomId) -> bool {
        self.rooms.insert(room_id)
    }

    pub fn remove(&mut self, room_id: &RoomId) -> bool {
        self.rooms.remove(room_id)
    }

    /// Replaces the cache with an authoritative joined-rooms answer.
    pub fn replace(&mut self, rooms: impl IntoIterator<Item = OwnedRoomId>) {
        self.rooms = rooms.into_iter().collect();
    }

    pub fn len(&self) -> usize {
        self.rooms.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rooms.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &OwnedRoomId> {
        self.rooms.iter()
    }
}

/// Picks the local user's most recent membership event.
///
/// Smaller `unsigned.age` is newer. A missing age counts as zero, and on
/// equal ages the event later in the list wins.
pub fn latest_own_membership<'a>(user_id: &UserId, events: &'a [RawEvent]) -> Option<&'a RawEvent> {
    let mut selected: Option<&RawEvent> = None;

    for event in events {
        if event.event_type() != Some(event_type::ROOM_MEMBER)
            || event.state_key() != Some(user_id.as_str())
        {
            continue;
        }

        if let Some(current) = selected {
            if current.age().unwrap_or(0) < event.age().unwrap_or(0) {
                continue;
            }
        }
        selected = Some(event);
    }

    selected
}

pub struct SyncEngine {
    user_id: OwnedUserId,
    classifier: EventClassifier,
    known_rooms: KnownRooms,
    dispatcher: Arc<Dispatcher>,
}

impl SyncEngine {
    pub fn new(user_id: OwnedUserId, dispatcher: Arc<Dispatcher>) -> Self {
        Self::with_classifier(user_id, dispatcher, EventClassifier::new())
    }

    /// Builds an engine that shares already registered preprocessors.
    pub fn with_classifier(
        user_id: OwnedUserId,
        dispatcher: Arc<Dispatcher>,
        classifier: EventClassifier,
    ) -> Self {
        Self {
            user_id,
            classifier,
            known_rooms: KnownRooms::new(),
            dispatcher,
        }
    }

    pub fn user_id(&self) -> &UserId {
        &self.user_id
    }

    pub fn add_preprocessor(&mut self, preprocessor: Arc<dyn Preprocessor>) {
        self.classifier.add_preprocessor(preprocessor);
    }

    pub fn known_rooms(&self) -> &KnownRooms {
        &self.known_rooms
    }

    /// Seeds the join cache from an authoritative joined-rooms query, so
    /// rooms joined before startup do not produce join callbacks.
    pub fn seed_known_rooms(&mut self, rooms: impl IntoIterator<Item = OwnedRoomId>) {
        self.known_rooms.replace(rooms);
    }

    /// Classifies a snapshot without dispatching it.
    ///
    /// Order: global account data, left rooms, invites, joined rooms.
    pub async fn collect(&mut self, snapshot: SyncSnapshot) -> Vec<LifecycleEvent> {
        let SyncSnapshot {
            account_data,
            rooms,
            ..
        } = snapshot;
        let mut out = Vec::new();

        for event in account_data.events {
            out.push(LifecycleEvent::AccountData { event });
        }

        for (room_id, room) in rooms.leave {
            if let Some(event) = latest_own_membership(&self.user_id, &room.timeline.events) {
                self.known_rooms.remove(&room_id);
                out.push(LifecycleEvent::Leave {
                    room_id: room_id.clone(),
                    event: event.clone(),
                });
            } else {
                debug!("No own membership event for left room {}, skipping", room_id);
            }

            for event in room.account_data.events {
                out.push(LifecycleEvent::RoomAccountData {
                    room_id: room_id.clone(),
                    event,
                });
            }
        }

        for (room_id, room) in rooms.invite {
            match latest_own_membership(&self.user_id, &room.invite_state.events) {
                Some(event) => out.push(LifecycleEvent::Invite {
                    room_id,
                    event: event.clone(),
                }),
                None => debug!("No own membership event for invite to {}, skipping", room_id),
            }
        }

        for (room_id, room) in rooms.join {
            if self.known_rooms.insert(room_id.clone()) {
                out.push(LifecycleEvent::Join {
                    room_id: room_id.clone(),
                    event: None,
                });
            }

            for event in room.account_data.events {
                out.push(LifecycleEvent::RoomAccountData {
                    room_id: room_id.clone(),
                    event,
                });
            }

            for event in room.timeline.events {
                out.extend(self.classifier.classify(&room_id, event).await);
            }
        }

        out
    }

    /// Classifies a snapshot and dispatches every resulting event in order.
    #[instrument(level = "debug", skip(self, snapshot), fields(user_id = %self.user_id))]
    pub async fn process_snapshot(&mut self, snapshot: SyncSnapshot) -> usize {
        let start = Instant::now();
        let events = self.collect(snapshot).await;
        let count = events.len();

        for event in events {
            self.dispatcher.emit(event).await;
        }

        info!(
            "✅ Processed sync snapshot: {} events, {} known rooms in {:?}",
            count,
            self.known_rooms.len(),
            start.elapsed()
        );
        count
    }
}
