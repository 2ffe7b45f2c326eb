//! Room upgrade chain resolution.
//!
//! Walks predecessor links (from `m.room.create`) and successor links (from
//! `m.room.tombstone`) outward from one room. Each direction keeps its own
//! visited set seeded with the queried room, so malformed or cyclic graphs
//! terminate after every distinct room has been seen once.

use std::{collections::HashSet, time::Instant};

use ruma::{OwnedEventId, OwnedRoomId, RoomId};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};

use super::{room_state_event, RoomStateAccessor};
use crate::{
    events::{event_type, EventContent, RawEvent, DEFAULT_ROOM_VERSION},
    Result,
};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoomReference {
    pub room_id: OwnedRoomId,
    pub version: String,
    /// The event linking this room to its neighbour in the chain: a
    /// predecessor's tombstone, or a successor's create event.
    pub ref_event_id: Option<OwnedEventId>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoomUpgradeHistory {
    /// Predecessors, nearest first.
    pub previous: Vec<RoomReference>,
    pub current: RoomReference,
    /// Successors, nearest first.
    pub newer: Vec<RoomReference>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Direction {
    Backward,
    Forward,
}

impl Direction {
    /// The neighbouring room this state points at.
    fn link(self, state: &[RawEvent]) -> Option<OwnedRoomId> {
        match self {
            Direction::Backward => match room_state_event(state, event_type::ROOM_CREATE)?.typed() {
                EventContent::Create { predecessor, .. } => predecessor,
                _ => None,
            },
            Direction::Forward => {
                match room_state_event(state, event_type::ROOM_TOMBSTONE)?.typed() {
                    EventContent::Tombstone {
                        replacement_room, ..
                    } => replacement_room,
                    _ => None,
                }
            }
        }
    }

    /// Event in `state` (the room being recorded) that points back at
    /// `from`, the room the walk came from.
    fn ref_event(self, state: &[RawEvent], from: &RoomId) -> Option<OwnedEventId> {
        match self {
            Direction::Backward => {
                let tombstone = room_state_event(state, event_type::ROOM_TOMBSTONE)?;
                match tombstone.typed() {
                    EventContent::Tombstone {
                        replacement_room: Some(replacement),
                        ..
                    } if replacement.as_str() == from.as_str() => tombstone.event_id(),
                    _ => None,
                }
            }
            Direction::Forward => room_state_event(state, event_type::ROOM_CREATE)?.event_id(),
        }
    }
}

fn room_version(state: &[RawEvent]) -> String {
    room_state_event(state, event_type::ROOM_CREATE)
        .and_then(|create| match create.typed() {
            EventContent::Create { room_version, .. } => Some(room_version),
            _ => None,
        })
        .unwrap_or_else(|| DEFAULT_ROOM_VERSION.to_owned())
}

async fn walk<A>(
    accessor: &A,
    room_id: &RoomId,
    state: &[RawEvent],
    direction: Direction,
) -> Vec<RoomReference>
where
    A: RoomStateAccessor + ?Sized,
{
    let mut visited = HashSet::from([room_id.to_owned()]);
    let mut chain = Vec::new();
    let mut from = room_id.to_owned();
    let mut next = direction.link(state);

    while let Some(target) = next.take() {
        if !visited.insert(target.clone()) {
            debug!(
                "{:?} walk from {} reached {} again, stopping",
                direction, room_id, target
            );
            break;
        }

        match accessor.state_events(&target).await {
            Ok(target_state) => {
                chain.push(RoomReference {
                    room_id: target.clone(),
                    version: room_version(&target_state),
                    ref_event_id: direction.ref_event(&target_state, &from),
                });
                next = direction.link(&target_state);
                from = target;
            }
            Err(e) => {
                warn!(
                    "⚠️ Could not fetch state of {}, ending {:?} walk: {}",
                    target, direction, e
                );
                chain.push(RoomReference {
                    room_id: target,
                    version: DEFAULT_ROOM_VERSION.to_owned(),
                    ref_event_id: None,
                });
            }
        }
    }

    chain
}

/// Resolves the upgrade chain around `room_id`.
///
/// Only a failure to read the queried room's own state is returned as an
/// error; any other unreadable room ends its direction of the walk.
#[instrument(level = "debug", skip(accessor))]
pub async fn get_upgrade_history<A>(accessor: &A, room_id: &RoomId) -> Result<RoomUpgradeHistory>
where
    A: RoomStateAccessor + ?Sized,
{
    let start = Instant::now();
    let state = accessor.state_events(room_id).await?;

    let previous = walk(accessor, room_id, &state, Direction::Backward).await;
    let newer = walk(accessor, room_id, &state, Direction::Forward).await;

    info!(
        "✅ Resolved upgrade history of {}: {} previous, {} newer in {:?}",
        room_id,
        previous.len(),
        newer.len(),
        start.elapsed()
    );

    Ok(RoomUpgradeHistory {
        previous,
        current: RoomReference {
            room_id: room_id.to_owned(),
            version: room_version(&state),
            ref_event_id: None,
        },
        newer,
    })
}
