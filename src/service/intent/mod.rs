// =============================================================================
// Matrixon Appservice - Intent Module
// =============================================================================
//
// Project: Matrixon - Ultra High Performance Matrix NextServer (Synapse Alternative)
// Author: arkSong (arksong2018@gmail.com) - Founder of Matrixon Innovation Project
// Date: 2024-12-11
// Version: 0.11.0-alpha
// License: Apache 2.0 / MIT
//
// Description:
//   One intent per virtual user. Operations register the user and join the
//   target room on demand before acting, so callers never have to.
//
// Concurrency:
//   • ensure_registered and ensure_joined are not serialized per user. Two
//     callers may both try to register; the loser gets M_USER_IN_USE,
//     which is treated as success.
//   • enable_encryption is memoized: concurrent callers share one
//     in-flight setup.
//
// =============================================================================

mod crypto;

use std::{sync::Arc, time::Instant};

use futures::future::{BoxFuture, FutureExt, Shared};
use ruma::{OwnedEventId, OwnedRoomId, OwnedUserId, RoomId, UserId};
use serde_json::{json, Value};
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, error, info, instrument, warn};

use crate::{
    api::{
        crypto::{CryptoEngine, CryptoProvider},
        ClientFactory, ClientIdentity, HomeserverApi, RequestContext,
    },
    errcode,
    events::event_type,
    service::{
        appservice::Data,
        dispatcher::Dispatcher,
        rooms::{get_upgrade_history, RoomUpgradeHistory},
        sync::KnownRooms,
    },
    utils::timed,
    Error, Result,
};

/// Storage key under which a user's fresh-login access token is kept.
pub fn access_token_key(user_id: &UserId) -> String {
    format!("access_token:{user_id}")
}

/// Collaborators shared by every intent of one appservice.
#[derive(Clone)]
pub struct IntentServices {
    pub db: Arc<dyn Data>,
    pub factory: Arc<dyn ClientFactory>,
    pub crypto: Option<Arc<dyn CryptoProvider>>,
    pub dispatcher: Arc<Dispatcher>,
    pub ctx: Arc<RequestContext>,
    /// Whether a failed encryption setup may be attempted again.
    pub retry_failed_setup: bool,
}

type SetupFuture = Shared<BoxFuture<'static, std::result::Result<(), Arc<Error>>>>;

pub struct Intent {
    user_id: OwnedUserId,
    is_bot: bool,
    services: IntentServices,
    client: RwLock<Arc<dyn HomeserverApi>>,
    joined_rooms: RwLock<KnownRooms>,
    encryption: Mutex<Option<SetupFuture>>,
    crypto_engine: RwLock<Option<Arc<dyn CryptoEngine>>>,
}

impl Intent {
    /// Creates an intent acting as `user_id` through the appservice token.
    pub fn new(user_id: OwnedUserId, is_bot: bool, services: IntentServices) -> Self {
        let client = services
            .factory
            .create_client(ClientIdentity::impersonating(user_id.clone()));

        Self {
            user_id,
            is_bot,
            services,
            client: RwLock::new(client),
            joined_rooms: RwLock::new(KnownRooms::new()),
            encryption: Mutex::new(None),
            crypto_engine: RwLock::new(None),
        }
    }

    pub fn user_id(&self) -> &UserId {
        &self.user_id
    }

    /// Whether this intent is the appservice's own sender identity.
    pub fn is_bot(&self) -> bool {
        self.is_bot
    }

    /// The session this intent currently acts through.
    pub async fn client(&self) -> Arc<dyn HomeserverApi> {
        self.client.read().await.clone()
    }

    /// The crypto engine, once encryption has been enabled.
    pub async fn crypto_engine(&self) -> Option<Arc<dyn CryptoEngine>> {
        self.crypto_engine.read().await.clone()
    }

    /// Registers the user unless storage says it already is.
    ///
    /// `M_USER_IN_USE` means the account exists, so it also marks the user
    /// registered. Any other error leaves the flag unset.
    pub async fn ensure_registered(&self) -> Result<()> {
        timed(&self.services.ctx, "intent.ensure_registered", async {
            if self.services.db.is_user_registered(&self.user_id)? {
                return Ok(());
            }

            debug!("🔧 Registering {}", self.user_id);
            let client = self.client().await;
            match client.register_appservice_user(self.user_id.localpart()).await {
                Ok(()) => info!("✅ Registered {}", self.user_id),
                Err(e) if e.is_errcode(errcode::USER_IN_USE) => {
                    if self.is_bot {
                        debug!("Sender {} is already registered", self.user_id);
                    } else {
                        warn!("⚠️ {} already in use, marking as registered", self.user_id);
                    }
                }
                Err(e) => {
                    error!("❌ Failed to register {}: {}", self.user_id, e);
                    return Err(e);
                }
            }

            self.services.db.add_registered_user(&self.user_id)
        })
        .await
    }

    /// Replaces the join cache with the homeserver's joined-rooms answer.
    #[instrument(level = "debug", skip(self), fields(user_id = %self.user_id))]
    pub async fn refresh_joined_rooms(&self) -> Result<Vec<OwnedRoomId>> {
        let rooms = self.client().await.joined_rooms().await?;
        self.joined_rooms.write().await.replace(rooms.iter().cloned());
        debug!("Refreshed joined rooms: {}", rooms.len());
        Ok(rooms)
    }

    /// Cached joined rooms, without a network call.
    pub async fn joined_rooms(&self) -> Vec<OwnedRoomId> {
        self.joined_rooms.read().await.iter().cloned().collect()
    }

    pub async fn is_joined(&self, room_id: &RoomId) -> bool {
        self.joined_rooms.read().await.contains(room_id)
    }

    /// Joins `room_id` unless this intent is already known to be in it.
    ///
    /// A cache hit makes no network call. A miss refreshes the cache first
    /// and only joins when the room is still absent.
    pub async fn ensure_joined(&self, room_id: &RoomId) -> Result<OwnedRoomId> {
        timed(&self.services.ctx, "intent.ensure_joined", async {
            if self.is_joined(room_id).await {
                return Ok(room_id.to_owned());
            }

            self.refresh_joined_rooms().await?;
            if self.is_joined(room_id).await {
                return Ok(room_id.to_owned());
            }

            debug!("🔧 {} joining {}", self.user_id, room_id);
            let joined = self.client().await.join_room(room_id.as_str()).await?;
            self.joined_rooms.write().await.insert(joined.clone());
            info!("✅ {} joined {}", self.user_id, joined);
            Ok(joined)
        })
        .await
    }

    /// Registration first; a registration failure prevents the join.
    pub async fn ensure_registered_and_joined(&self, room_id: &RoomId) -> Result<()> {
        self.ensure_registered().await?;
        self.ensure_joined(room_id).await?;
        Ok(())
    }

    /// Joins by room ID or alias.
    pub async fn join_room(&self, room_id_or_alias: &str) -> Result<OwnedRoomId> {
        timed(&self.services.ctx, "intent.join_room", async {
            self.ensure_registered().await?;
            let joined = self.client().await.join_room(room_id_or_alias).await?;
            self.joined_rooms.write().await.insert(joined.clone());
            info!("✅ {} joined {} ({})", self.user_id, joined, room_id_or_alias);
            Ok(joined)
        })
        .await
    }

    pub async fn leave_room(&self, room_id: &RoomId) -> Result<()> {
        timed(&self.services.ctx, "intent.leave_room", async {
            self.ensure_registered().await?;
            self.client().await.leave_room(room_id).await?;
            self.joined_rooms.write().await.remove(room_id);
            info!("👋 {} left {}", self.user_id, room_id);
            Ok(())
        })
        .await
    }

    pub async fn send_event(
        &self,
        room_id: &RoomId,
        event_type: &str,
        content: Value,
    ) -> Result<OwnedEventId> {
        timed(&self.services.ctx, "intent.send_event", async {
            self.ensure_registered_and_joined(room_id).await?;
            let start = Instant::now();
            let event_id = self
                .client()
                .await
                .send_event(room_id, event_type, content)
                .await?;
            debug!(
                "✅ {} sent {} to {} in {:?}",
                self.user_id,
                event_type,
                room_id,
                start.elapsed()
            );
            Ok(event_id)
        })
        .await
    }

    /// Sends a plain `m.text` message.
    pub async fn send_text(&self, room_id: &RoomId, body: &str) -> Result<OwnedEventId> {
        let content = json!({"msgtype": "m.text", "body": body});
        self.send_event(room_id, event_type::ROOM_MESSAGE, content)
            .await
    }

    pub async fn room_upgrade_history(&self, room_id: &RoomId) -> Result<RoomUpgradeHistory> {
        timed(&self.services.ctx, "intent.room_upgrade_history", async {
            let client = self.client().await;
            get_upgrade_history(&*client, room_id).await
        })
        .await
    }

    /// Sets up end-to-end encryption for this user.
    ///
    /// Runs at most once at a time; concurrent callers await the same
    /// setup. A failed setup stays failed unless `retry_failed_setup` is
    /// set, in which case the next call starts over.
    pub async fn enable_encryption(self: &Arc<Self>) -> Result<()> {
        timed(&self.services.ctx, "intent.enable_encryption", async {
            let setup = {
                let mut slot = self.encryption.lock().await;
                let failed = slot
                    .as_ref()
                    .is_some_and(|setup| matches!(setup.peek(), Some(Err(_))));
                if failed && self.services.retry_failed_setup {
                    debug!("Retrying failed encryption setup for {}", self.user_id);
                    *slot = None;
                }

                slot.get_or_insert_with(|| {
                    let intent = Arc::clone(self);
                    async move { intent.setup_encryption().await.map_err(Arc::new) }
                        .boxed()
                        .shared()
                })
                .clone()
            };

            setup.await.map_err(Error::CryptoSetup)
        })
        .await
    }

    async fn replace_client(&self, client: Arc<dyn HomeserverApi>) {
        *self.client.write().await = client;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        database::MemoryStorage,
        test_utils::{FakeFactory, FakeHomeserver},
        MatrixError,
    };
    use ruma::{room_id, user_id};
    use test_log::test;

    fn services(server: &FakeHomeserver) -> (IntentServices, Arc<MemoryStorage>) {
        let storage = Arc::new(MemoryStorage::new());
        let services = IntentServices {
            db: storage.clone(),
            factory: Arc::new(FakeFactory::new(server.clone())),
            crypto: None,
            dispatcher: Arc::new(Dispatcher::new()),
            ctx: Arc::new(RequestContext::new()),
            retry_failed_setup: false,
        };
        (services, storage)
    }

    fn user_in_use() -> MatrixError {
        MatrixError::new(400, errcode::USER_IN_USE, "User ID already taken.")
    }

    #[test(tokio::test)]
    async fn test_user_in_use_marks_virtual_user_registered() {
        let server = FakeHomeserver::new();
        server.fail_registration(user_in_use());
        let (services, storage) = services(&server);
        let user = user_id!("@bridge_alice:example.org");
        let intent = Intent::new(user.to_owned(), false, services);

        intent.ensure_registered().await.unwrap();

        assert!(Data::is_user_registered(&*storage, user).unwrap());
        assert_eq!(server.registered_localparts(), vec!["bridge_alice".to_owned()]);
    }

    #[test(tokio::test)]
    async fn test_user_in_use_marks_bot_registered() {
        let server = FakeHomeserver::new();
        server.fail_registration(user_in_use());
        let (services, storage) = services(&server);
        let bot = user_id!("@bridgebot:example.org");
        let intent = Intent::new(bot.to_owned(), true, services);

        intent.ensure_registered().await.unwrap();
        intent.ensure_registered().await.unwrap();

        assert!(Data::is_user_registered(&*storage, bot).unwrap());
        assert_eq!(server.registered_localparts().len(), 1);
    }

    #[test(tokio::test)]
    async fn test_other_registration_errors_propagate() {
        let server = FakeHomeserver::new();
        server.fail_registration(MatrixError::new(403, errcode::FORBIDDEN, "Exclusive namespace"));
        let (services, storage) = services(&server);
        let user = user_id!("@bridge_alice:example.org");
        let intent = Intent::new(user.to_owned(), false, services);

        let err = intent.ensure_registered().await.unwrap_err();

        let matrix = err.as_matrix().unwrap();
        assert_eq!(matrix.errcode, errcode::FORBIDDEN);
        assert_eq!(matrix.error, "Exclusive namespace");
        assert!(!Data::is_user_registered(&*storage, user).unwrap());
    }

    #[test(tokio::test)]
    async fn test_ensure_joined_cache_hit_skips_network() {
        let server = FakeHomeserver::new();
        let (services, _storage) = services(&server);
        let intent = Intent::new(user_id!("@bridge_alice:example.org").to_owned(), false, services);
        let room = room_id!("!a:example.org");

        intent.ensure_joined(room).await.unwrap();
        let joins = server.join_calls().len();
        let queries = server.joined_rooms_calls();

        intent.ensure_joined(room).await.unwrap();

        assert_eq!(joins, 1);
        assert_eq!(server.join_calls().len(), 1);
        assert_eq!(server.joined_rooms_calls(), queries);
    }

    #[test(tokio::test)]
    async fn test_ensure_joined_refresh_hit_skips_join() {
        let server = FakeHomeserver::new();
        server.set_joined_rooms([room_id!("!a:example.org").to_owned()]);
        let (services, _storage) = services(&server);
        let intent = Intent::new(user_id!("@bridge_alice:example.org").to_owned(), false, services);

        intent.ensure_joined(room_id!("!a:example.org")).await.unwrap();

        assert!(server.join_calls().is_empty());
        assert_eq!(server.joined_rooms_calls(), 1);
    }

    #[test(tokio::test)]
    async fn test_registration_failure_prevents_join() {
        let server = FakeHomeserver::new();
        server.fail_registration(MatrixError::new(403, errcode::FORBIDDEN, "nope"));
        let (services, _storage) = services(&server);
        let intent = Intent::new(user_id!("@bridge_alice:example.org").to_owned(), false, services);

        assert!(intent
            .send_text(room_id!("!a:example.org"), "hello")
            .await
            .is_err());
        assert!(server.join_calls().is_empty());
        assert!(server.sent_events().is_empty());
    }

    #[test(tokio::test)]
    async fn test_join_failure_propagates() {
        let server = FakeHomeserver::new();
        server.fail_joins(MatrixError::new(403, errcode::FORBIDDEN, "You are not invited"));
        let (services, storage) = services(&server);
        let user = user_id!("@bridge_alice:example.org");
        let intent = Intent::new(user.to_owned(), false, services);

        let err = intent
            .ensure_registered_and_joined(room_id!("!a:example.org"))
            .await
            .unwrap_err();

        assert!(err.is_errcode(errcode::FORBIDDEN));
        assert!(Data::is_user_registered(&*storage, user).unwrap());
    }

    #[test(tokio::test)]
    async fn test_send_text_registers_joins_and_sends() {
        let server = FakeHomeserver::new();
        let (services, _storage) = services(&server);
        let intent = Intent::new(user_id!("@bridge_alice:example.org").to_owned(), false, services);
        let room = room_id!("!a:example.org");

        intent.send_text(room, "hello").await.unwrap();
        intent.send_text(room, "again").await.unwrap();

        let sent = server.sent_events();
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[0].0.as_str(), room.as_str());
        assert_eq!(sent[0].1, "m.room.message");
        assert_eq!(sent[0].2, json!({"msgtype": "m.text", "body": "hello"}));
        assert_eq!(server.join_calls().len(), 1);
        assert_eq!(server.registered_localparts().len(), 1);
    }

    #[test(tokio::test)]
    async fn test_leave_room_forgets_cache() {
        let server = FakeHomeserver::new();
        let (services, _storage) = services(&server);
        let intent = Intent::new(user_id!("@bridge_alice:example.org").to_owned(), false, services);
        let room = room_id!("!a:example.org");

        intent.join_room(room.as_str()).await.unwrap();
        assert!(intent.is_joined(room).await);

        intent.leave_room(room).await.unwrap();
        assert!(!intent.is_joined(room).await);
    }
}
