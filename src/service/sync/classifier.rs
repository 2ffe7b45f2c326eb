// =============================================================================
// Matrixon Appservice - Event Classifier
// =============================================================================
//
// Project: Matrixon - Ultra High Performance Matrix NextServer (Synapse Alternative)
// Author: arkSong (arksong2018@gmail.com) - Founder of Matrixon Innovation Project
// Date: 2024-12-11
// Version: 0.11.0-alpha
// License: Apache 2.0 / MIT
//
// Description:
//   Runs registered preprocessors over a room event, then decides which
//   lifecycle callbacks it produces. Every event produces the generic
//   callback; message, tombstone and upgrade-create events produce one
//   specialized callback on top of it.
//
// =============================================================================

use std::sync::Arc;

use async_trait::async_trait;
use ruma::RoomId;
use tracing::{debug, warn};

use crate::{
    events::{event_type, EventContent, LifecycleEvent, LifecycleKind, RawEvent},
    Result,
};

/// Rewrites or annotates events of selected types before dispatch.
#[async_trait]
pub trait Preprocessor: Send + Sync {
    fn supported_event_types(&self) -> Vec<String>;

    async fn process_event(&self, room_id: &RoomId, event: &mut RawEvent) -> Result<()>;
}

#[derive(Default, Clone)]
pub struct EventClassifier {
    preprocessors: Vec<Arc<dyn Preprocessor>>,
}

impl EventClassifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_preprocessor(&mut self, preprocessor: Arc<dyn Preprocessor>) {
        self.preprocessors.push(preprocessor);
    }

    /// Runs every preprocessor that supports the event's type, in
    /// registration order. A failing preprocessor is logged and skipped.
    pub async fn preprocess(&self, room_id: &RoomId, event: &mut RawEvent) {
        for preprocessor in &self.preprocessors {
            let supported = match event.event_type() {
                Some(ty) => preprocessor.supported_event_types().iter().any(|s| s == ty),
                None => false,
            };
            if !supported {
                continue;
            }

            if let Err(e) = preprocessor.process_event(room_id, event).await {
                warn!("⚠️ Preprocessor failed for event in {}: {}", room_id, e);
            }
        }
    }

    /// The specialized callback an event maps to, if any.
    pub fn specialized_kind(room_id: &RoomId, event: &RawEvent) -> Option<LifecycleKind> {
        match event.event_type()? {
            event_type::ROOM_MESSAGE => Some(LifecycleKind::Message),
            event_type::ROOM_TOMBSTONE if event.is_room_state() => Some(LifecycleKind::Archived),
            event_type::ROOM_CREATE if event.is_room_state() => match event.typed() {
                EventContent::Create {
                    predecessor: Some(predecessor),
                    ..
                } if predecessor.as_str() != room_id.as_str() => Some(LifecycleKind::Upgraded),
                _ => None,
            },
            _ => None,
        }
    }

    /// Preprocesses and classifies one timeline event.
    ///
    /// The generic callback always comes first.
    pub async fn classify(&self, room_id: &RoomId, mut event: RawEvent) -> Vec<LifecycleEvent> {
        self.preprocess(room_id, &mut event).await;

        let room_id = room_id.to_owned();
        let specialized = Self::specialized_kind(&room_id, &event);
        debug!(
            "Classified {:?} in {} as {:?}",
            event.event_type(),
            room_id,
            specialized
        );

        let mut out = Vec::with_capacity(2);
        out.push(LifecycleEvent::Event {
            room_id: room_id.clone(),
            event: event.clone(),
        });
        match specialized {
            Some(LifecycleKind::Message) => out.push(LifecycleEvent::Message { room_id, event }),
            Some(LifecycleKind::Archived) => out.push(LifecycleEvent::Archived { room_id, event }),
            Some(LifecycleKind::Upgraded) => out.push(LifecycleEvent::Upgraded { room_id, event }),
            _ => {}
        }
        out
    }
}
