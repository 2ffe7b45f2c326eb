// =============================================================================
// Matrixon Appservice - Autojoin Module
// =============================================================================
//
// Project: Matrixon - Ultra High Performance Matrix NextServer (Synapse Alternative)
// Author: arkSong (arksong2018@gmail.com) - Founder of Matrixon Innovation Project
// Date: 2024-12-11
// Version: 0.11.0-alpha
// License: Apache 2.0 / MIT
//
// Description:
//   Optional handlers that accept invites and follow room upgrades. They
//   hold weak references so subscribing them never keeps an intent or the
//   appservice alive.
//
// =============================================================================

use std::sync::{Arc, Weak};

use async_trait::async_trait;
use ruma::{RoomId, UserId};
use tracing::{debug, info};

use crate::{
    events::{EventContent, LifecycleEvent, RawEvent},
    service::{appservice::Appservice, dispatcher::EventHandler, intent::Intent},
    Result,
};

#[derive(Clone)]
enum JoinTarget {
    /// The single identity a sync engine runs as.
    Intent(Weak<Intent>),
    /// Whichever of the appservice's users the event concerns.
    Appservice(Weak<Appservice>),
}

impl JoinTarget {
    /// The intent that received `invite`, if it is still around and ours.
    async fn invitee(&self, invite: &RawEvent) -> Option<Arc<Intent>> {
        match self {
            JoinTarget::Intent(intent) => intent.upgrade(),
            JoinTarget::Appservice(appservice) => {
                let appservice = appservice.upgrade()?;
                let user_id = UserId::parse(invite.state_key()?).ok()?;
                if !appservice.is_namespaced_user(&user_id) {
                    return None;
                }
                Some(appservice.intent_for_user_id(&user_id).await)
            }
        }
    }

    /// Intents joined to `room_id`.
    async fn members(&self, room_id: &RoomId) -> Vec<Arc<Intent>> {
        let candidates = match self {
            JoinTarget::Intent(intent) => intent.upgrade().into_iter().collect(),
            JoinTarget::Appservice(appservice) => match appservice.upgrade() {
                Some(appservice) => appservice.intents().await,
                None => Vec::new(),
            },
        };

        let mut members = Vec::new();
        for intent in candidates {
            if intent.is_joined(room_id).await {
                members.push(intent);
            }
        }
        members
    }
}

/// Joins every room an intent is invited to.
pub struct AutojoinHandler {
    target: JoinTarget,
}

impl AutojoinHandler {
    pub fn for_intent(intent: &Arc<Intent>) -> Self {
        Self {
            target: JoinTarget::Intent(Arc::downgrade(intent)),
        }
    }

    pub fn for_appservice(appservice: &Arc<Appservice>) -> Self {
        Self {
            target: JoinTarget::Appservice(Arc::downgrade(appservice)),
        }
    }
}

#[async_trait]
impl EventHandler for AutojoinHandler {
    async fn handle(&self, event: &LifecycleEvent) -> Result<()> {
        let LifecycleEvent::Invite { room_id, event } = event else {
            return Ok(());
        };
        let Some(intent) = self.target.invitee(event).await else {
            debug!("Ignoring invite to {} for a user we do not manage", room_id);
            return Ok(());
        };

        info!("📨 Accepting invite of {} to {}", intent.user_id(), room_id);
        intent.join_room(room_id.as_str()).await?;
        Ok(())
    }
}

/// Follows tombstones: intents in an archived room join its replacement.
pub struct AutojoinUpgradedHandler {
    target: JoinTarget,
}

impl AutojoinUpgradedHandler {
    pub fn for_intent(intent: &Arc<Intent>) -> Self {
        Self {
            target: JoinTarget::Intent(Arc::downgrade(intent)),
        }
    }

    pub fn for_appservice(appservice: &Arc<Appservice>) -> Self {
        Self {
            target: JoinTarget::Appservice(Arc::downgrade(appservice)),
        }
    }
}

#[async_trait]
impl EventHandler for AutojoinUpgradedHandler {
    async fn handle(&self, event: &LifecycleEvent) -> Result<()> {
        let LifecycleEvent::Archived { room_id, event } = event else {
            return Ok(());
        };
        let EventContent::Tombstone {
            replacement_room: Some(replacement),
            ..
        } = event.typed()
        else {
            debug!("Tombstone in {} names no replacement room", room_id);
            return Ok(());
        };

        for intent in self.target.members(room_id).await {
            info!(
                "⬆️ {} following upgrade of {} to {}",
                intent.user_id(),
                room_id,
                replacement
            );
            intent.join_room(replacement.as_str()).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        config::AppserviceConfig,
        database::MemoryStorage,
        service::{appservice::Appservice, dispatcher::Dispatcher, intent::IntentServices},
        api::RequestContext,
        test_utils::{member_event, FakeFactory, FakeHomeserver},
    };
    use ruma::{room_id, user_id};
    use serde_json::json;

    fn intent(server: &FakeHomeserver) -> Arc<Intent> {
        Arc::new(Intent::new(
            user_id!("@bridgebot:example.org").to_owned(),
            true,
            IntentServices {
                db: Arc::new(MemoryStorage::new()),
                factory: Arc::new(FakeFactory::new(server.clone())),
                crypto: None,
                dispatcher: Arc::new(Dispatcher::new()),
                ctx: Arc::new(RequestContext::new()),
                retry_failed_setup: false,
            },
        ))
    }

    fn tombstone(replacement: &str) -> RawEvent {
        RawEvent::new(json!({
            "type": "m.room.tombstone",
            "state_key": "",
            "content": {"replacement_room": replacement, "body": "This room was upgraded"}
        }))
    }

    #[tokio::test]
    async fn test_intent_accepts_invites() {
        let server = FakeHomeserver::new();
        let intent = intent(&server);
        let handler = AutojoinHandler::for_intent(&intent);

        handler
            .handle(&LifecycleEvent::Invite {
                room_id: room_id!("!a:example.org").to_owned(),
                event: RawEvent::new(member_event("@bridgebot:example.org", "invite", None, "$i")),
            })
            .await
            .unwrap();

        assert_eq!(server.join_calls(), vec!["!a:example.org".to_owned()]);
        assert!(intent.is_joined(room_id!("!a:example.org")).await);
    }

    #[tokio::test]
    async fn test_dropped_intent_is_ignored() {
        let server = FakeHomeserver::new();
        let handler = AutojoinHandler::for_intent(&intent(&server));

        handler
            .handle(&LifecycleEvent::Invite {
                room_id: room_id!("!a:example.org").to_owned(),
                event: RawEvent::new(member_event("@bridgebot:example.org", "invite", None, "$i")),
            })
            .await
            .unwrap();

        assert!(server.join_calls().is_empty());
    }

    #[tokio::test]
    async fn test_appservice_joins_for_namespaced_invitees_only() {
        let server = FakeHomeserver::new();
        let config: AppserviceConfig = serde_json::from_value(json!({
            "homeserver_url": "https://matrix.example.org",
            "homeserver_name": "example.org",
            "registration": {
                "id": "bridge",
                "as_token": "as_secret",
                "hs_token": "hs_secret",
                "sender_localpart": "bridgebot",
                "namespaces": {"users": [{"regex": "@bridge_.*", "exclusive": true}]}
            }
        }))
        .unwrap();
        let appservice = Arc::new(
            Appservice::new(
                &config,
                Arc::new(MemoryStorage::new()),
                Arc::new(FakeFactory::new(server.clone())),
            )
            .unwrap(),
        );
        let handler = AutojoinHandler::for_appservice(&appservice);

        for invitee in ["@bridge_alice:example.org", "@alice:example.org"] {
            handler
                .handle(&LifecycleEvent::Invite {
                    room_id: room_id!("!a:example.org").to_owned(),
                    event: RawEvent::new(member_event(invitee, "invite", None, "$i")),
                })
                .await
                .unwrap();
        }

        assert_eq!(server.join_calls().len(), 1);
        let alice = appservice.intent("bridge_alice").await.unwrap();
        assert!(alice.is_joined(room_id!("!a:example.org")).await);
    }

    #[tokio::test]
    async fn test_upgrade_is_followed_by_members_only() {
        let server = FakeHomeserver::new();
        let intent = intent(&server);
        let handler = AutojoinUpgradedHandler::for_intent(&intent);

        handler
            .handle(&LifecycleEvent::Archived {
                room_id: room_id!("!old:example.org").to_owned(),
                event: tombstone("!new:example.org"),
            })
            .await
            .unwrap();
        assert!(server.join_calls().is_empty());

        intent.join_room("!old:example.org").await.unwrap();
        handler
            .handle(&LifecycleEvent::Archived {
                room_id: room_id!("!old:example.org").to_owned(),
                event: tombstone("!new:example.org"),
            })
            .await
            .unwrap();

        assert_eq!(
            server.join_calls(),
            vec!["!old:example.org".to_owned(), "!new:example.org".to_owned()]
        );
    }
}
