//! Encryption setup for an intent.
//!
//! The crypto engine needs a session bound to one device. An already known
//! device is reused through device impersonation when the homeserver still
//! lists it; otherwise the user logs in and the access token is kept for
//! the next start.

use std::{
    sync::{Arc, Weak},
    time::Instant,
};

use async_trait::async_trait;
use ruma::OwnedDeviceId;
use tracing::{debug, info, warn};

use super::{access_token_key, Intent};
use crate::{
    api::{crypto::CryptoStore, ClientIdentity},
    events::LifecycleEvent,
    service::dispatcher::EventHandler,
    Error, Result,
};

impl Intent {
    pub(super) async fn setup_encryption(self: Arc<Self>) -> Result<()> {
        let start = Instant::now();
        let provider = self
            .services
            .crypto
            .clone()
            .ok_or_else(|| Error::Crypto("no crypto provider configured".to_owned()))?;
        debug!("🔧 Setting up encryption for {}", self.user_id);

        self.ensure_registered().await?;

        let store = provider.store_for_user(&self.user_id);
        let prepared = match self.reusable_device(&*store).await? {
            Some(device_id) => self.impersonate_device(&*store, device_id).await?,
            None => false,
        };
        if !prepared {
            self.login_device(&*store).await?;
        }

        let engine = provider.create_engine(self.client().await, store);
        let rooms = self.refresh_joined_rooms().await?;
        engine.prepare(&rooms).await?;
        *self.crypto_engine.write().await = Some(engine);

        self.services
            .dispatcher
            .subscribe(Arc::new(CryptoRelay {
                intent: Arc::downgrade(&self),
            }))
            .await;

        info!(
            "🔐 Encryption enabled for {} across {} rooms in {:?}",
            self.user_id,
            rooms.len(),
            start.elapsed()
        );
        Ok(())
    }

    /// Picks a device the engine can take over without a fresh login.
    ///
    /// The stored device wins while the homeserver still lists it. Failing
    /// that, any listed device that never uploaded an identity key is free.
    async fn reusable_device(&self, store: &dyn CryptoStore) -> Result<Option<OwnedDeviceId>> {
        let client = self.client().await;
        let devices = client.own_devices().await?;

        if let Some(stored) = store.device_id().await? {
            if devices.contains(&stored) {
                return Ok(Some(stored));
            }
            debug!("Stored device {} of {} is gone", stored, self.user_id);
        }

        let keys = client.query_device_keys(&self.user_id).await?;
        let free = devices.into_iter().find(|device_id| {
            let identity_key = format!("curve25519:{device_id}");
            keys.get(device_id)
                .and_then(|device| device.get("keys"))
                .and_then(|keys| keys.get(&identity_key))
                .is_none()
        });
        Ok(free)
    }

    /// Switches to `device_id` when the homeserver honours device
    /// impersonation, checked with a whoami round trip.
    async fn impersonate_device(
        &self,
        store: &dyn CryptoStore,
        device_id: OwnedDeviceId,
    ) -> Result<bool> {
        let client = self.services.factory.create_client(ClientIdentity {
            user_id: self.user_id.clone(),
            device_id: Some(device_id.clone()),
            access_token: None,
        });

        let whoami = client.whoami().await?;
        if whoami.device_id.as_ref() != Some(&device_id) {
            warn!(
                "⚠️ Homeserver ignored device impersonation for {}, logging in instead",
                self.user_id
            );
            return Ok(false);
        }

        store.set_device_id(&device_id).await?;
        self.replace_client(client).await;
        debug!("Reusing device {} for {}", device_id, self.user_id);
        Ok(true)
    }

    /// Uses the stored access token, or logs in and stores a new one.
    async fn login_device(&self, store: &dyn CryptoStore) -> Result<()> {
        let key = access_token_key(&self.user_id);
        let access_token = match self.services.db.read_value(&key)? {
            Some(token) => token,
            None => {
                let login = self.client().await.login_appservice(&self.user_id).await?;
                self.services.db.store_value(&key, &login.access_token)?;
                info!("🔑 Logged in {} for encryption", self.user_id);
                login.access_token
            }
        };

        let client = self.services.factory.create_client(ClientIdentity {
            user_id: self.user_id.clone(),
            device_id: None,
            access_token: Some(access_token),
        });
        if let Some(device_id) = client.whoami().await?.device_id {
            store.set_device_id(&device_id).await?;
        }
        self.replace_client(client).await;
        Ok(())
    }
}

/// Feeds room events from the intent's joined rooms into its engine.
struct CryptoRelay {
    intent: Weak<Intent>,
}

#[async_trait]
impl EventHandler for CryptoRelay {
    async fn handle(&self, event: &LifecycleEvent) -> Result<()> {
        let LifecycleEvent::Event { room_id, event } = event else {
            return Ok(());
        };
        let Some(intent) = self.intent.upgrade() else {
            return Ok(());
        };
        if !intent.is_joined(room_id).await {
            return Ok(());
        }

        match intent.crypto_engine().await {
            Some(engine) => engine.on_room_event(room_id, event).await,
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        api::{
            crypto::{CryptoEngine, CryptoProvider},
            HomeserverApi, RequestContext,
        },
        database::MemoryStorage,
        events::RawEvent,
        service::{appservice::Data, dispatcher::Dispatcher, intent::IntentServices},
        test_utils::{FakeFactory, FakeHomeserver},
        MatrixError,
    };
    use mockall::mock;
    use ruma::{device_id, room_id, user_id, DeviceId, OwnedRoomId, RoomId, UserId};
    use serde_json::json;
    use std::{sync::Mutex, time::Duration};
    use test_log::test;

    mock! {
        Engine {}

        #[async_trait]
        impl CryptoEngine for Engine {
            async fn prepare(&self, joined_rooms: &[OwnedRoomId]) -> Result<()>;
            async fn on_room_event(&self, room_id: &RoomId, event: &RawEvent) -> Result<()>;
        }
    }

    #[derive(Default)]
    struct MemoryStore {
        device_id: Mutex<Option<OwnedDeviceId>>,
    }

    #[async_trait]
    impl CryptoStore for MemoryStore {
        async fn device_id(&self) -> Result<Option<OwnedDeviceId>> {
            Ok(self.device_id.lock().unwrap().clone())
        }

        async fn set_device_id(&self, device_id: &DeviceId) -> Result<()> {
            *self.device_id.lock().unwrap() = Some(device_id.to_owned());
            Ok(())
        }
    }

    struct Provider {
        store: Arc<MemoryStore>,
        engine: Arc<MockEngine>,
        engines_created: Mutex<usize>,
    }

    impl Provider {
        fn new(engine: MockEngine) -> Self {
            Self {
                store: Arc::new(MemoryStore::default()),
                engine: Arc::new(engine),
                engines_created: Mutex::new(0),
            }
        }
    }

    impl CryptoProvider for Provider {
        fn store_for_user(&self, _user_id: &UserId) -> Arc<dyn CryptoStore> {
            self.store.clone()
        }

        fn create_engine(
            &self,
            _client: Arc<dyn HomeserverApi>,
            _store: Arc<dyn CryptoStore>,
        ) -> Arc<dyn CryptoEngine> {
            *self.engines_created.lock().unwrap() += 1;
            self.engine.clone()
        }
    }

    fn quiet_engine() -> MockEngine {
        let mut engine = MockEngine::new();
        engine.expect_prepare().returning(|_| Ok(()));
        engine.expect_on_room_event().returning(|_, _| Ok(()));
        engine
    }

    fn intent(
        server: &FakeHomeserver,
        provider: Arc<Provider>,
        retry_failed_setup: bool,
    ) -> (Arc<Intent>, Arc<MemoryStorage>, Arc<Dispatcher>) {
        let storage = Arc::new(MemoryStorage::new());
        let dispatcher = Arc::new(Dispatcher::new());
        let services = IntentServices {
            db: storage.clone(),
            factory: Arc::new(FakeFactory::new(server.clone())),
            crypto: Some(provider),
            dispatcher: dispatcher.clone(),
            ctx: Arc::new(RequestContext::new()),
            retry_failed_setup,
        };
        let intent = Arc::new(Intent::new(
            user_id!("@bridge_alice:example.org").to_owned(),
            false,
            services,
        ));
        (intent, storage, dispatcher)
    }

    #[test(tokio::test)]
    async fn test_concurrent_setup_logs_in_once() {
        let server = FakeHomeserver::new();
        server.set_login_delay(Duration::from_millis(20));
        let provider = Arc::new(Provider::new(quiet_engine()));
        let (intent, storage, dispatcher) = intent(&server, provider.clone(), false);

        let (a, b, c) = tokio::join!(
            intent.enable_encryption(),
            intent.enable_encryption(),
            intent.enable_encryption(),
        );
        a.unwrap();
        b.unwrap();
        c.unwrap();
        intent.enable_encryption().await.unwrap();

        assert_eq!(server.login_calls(), 1);
        assert_eq!(*provider.engines_created.lock().unwrap(), 1);
        assert_eq!(dispatcher.handler_count().await, 1);
        assert!(storage
            .read_value(&access_token_key(intent.user_id()))
            .unwrap()
            .is_some());
        assert!(intent.crypto_engine().await.is_some());
    }

    #[test(tokio::test)]
    async fn test_stored_token_skips_login() {
        let server = FakeHomeserver::new();
        let provider = Arc::new(Provider::new(quiet_engine()));
        let (intent, storage, _dispatcher) = intent(&server, provider, false);
        storage
            .store_value(&access_token_key(intent.user_id()), "syt_stored")
            .unwrap();

        intent.enable_encryption().await.unwrap();

        assert_eq!(server.login_calls(), 0);
    }

    #[test(tokio::test)]
    async fn test_listed_stored_device_is_impersonated() {
        let server = FakeHomeserver::new();
        server.set_devices([device_id!("KEPT").to_owned()]);
        let provider = Arc::new(Provider::new(quiet_engine()));
        *provider.store.device_id.lock().unwrap() = Some(device_id!("KEPT").to_owned());
        let (intent, _storage, _dispatcher) = intent(&server, provider, false);

        intent.enable_encryption().await.unwrap();

        assert_eq!(server.login_calls(), 0);
        assert_eq!(
            intent.client().await.whoami().await.unwrap().device_id.as_deref(),
            Some(device_id!("KEPT"))
        );
    }

    #[test(tokio::test)]
    async fn test_device_with_identity_key_is_not_reused() {
        let server = FakeHomeserver::new();
        server.set_devices([device_id!("USED").to_owned(), device_id!("FRESH").to_owned()]);
        server.set_device_keys(
            device_id!("USED"),
            json!({"keys": {"curve25519:USED": "abc", "ed25519:USED": "def"}}),
        );
        let provider = Arc::new(Provider::new(quiet_engine()));
        let (intent, _storage, _dispatcher) = intent(&server, provider.clone(), false);

        intent.enable_encryption().await.unwrap();

        assert_eq!(server.login_calls(), 0);
        assert_eq!(
            provider.store.device_id.lock().unwrap().as_deref(),
            Some(device_id!("FRESH"))
        );
    }

    #[test(tokio::test)]
    async fn test_ignored_impersonation_falls_back_to_login() {
        let server = FakeHomeserver::new();
        server.set_devices([device_id!("FRESH").to_owned()]);
        server.set_device_impersonation(false);
        let provider = Arc::new(Provider::new(quiet_engine()));
        let (intent, _storage, _dispatcher) = intent(&server, provider, false);

        intent.enable_encryption().await.unwrap();

        assert_eq!(server.login_calls(), 1);
    }

    #[test(tokio::test)]
    async fn test_failed_setup_stays_failed() {
        let server = FakeHomeserver::new();
        server.fail_logins(1, MatrixError::new(500, "M_UNKNOWN", "login broke"));
        let provider = Arc::new(Provider::new(quiet_engine()));
        let (intent, _storage, _dispatcher) = intent(&server, provider, false);

        let first = intent.enable_encryption().await.unwrap_err();
        let second = intent.enable_encryption().await.unwrap_err();

        assert!(matches!(first, Error::CryptoSetup(_)));
        assert!(matches!(second, Error::CryptoSetup(_)));
        assert_eq!(server.login_calls(), 1);
    }

    #[test(tokio::test)]
    async fn test_failed_setup_is_retried_when_allowed() {
        let server = FakeHomeserver::new();
        server.fail_logins(1, MatrixError::new(500, "M_UNKNOWN", "login broke"));
        let provider = Arc::new(Provider::new(quiet_engine()));
        let (intent, _storage, _dispatcher) = intent(&server, provider, true);

        assert!(intent.enable_encryption().await.is_err());
        intent.enable_encryption().await.unwrap();

        assert_eq!(server.login_calls(), 2);
    }

    #[test(tokio::test)]
    async fn test_relay_forwards_only_joined_room_events() {
        let server = FakeHomeserver::new();
        server.set_joined_rooms([room_id!("!joined:example.org").to_owned()]);

        let mut engine = MockEngine::new();
        engine
            .expect_prepare()
            .withf(|rooms| rooms.len() == 1)
            .times(1)
            .returning(|_| Ok(()));
        engine
            .expect_on_room_event()
            .withf(|room_id, _| room_id.as_str() == "!joined:example.org")
            .times(1)
            .returning(|_, _| Ok(()));
        let provider = Arc::new(Provider::new(engine));
        let (intent, _storage, dispatcher) = intent(&server, provider, false);

        intent.enable_encryption().await.unwrap();

        for room in ["!joined:example.org", "!elsewhere:example.org"] {
            dispatcher
                .emit(LifecycleEvent::Event {
                    room_id: RoomId::parse(room).unwrap(),
                    event: RawEvent::new(json!({"type": "m.room.encrypted"})),
                })
                .await;
        }
        dispatcher
            .emit(LifecycleEvent::Message {
                room_id: room_id!("!joined:example.org").to_owned(),
                event: RawEvent::new(json!({"type": "m.room.message"})),
            })
            .await;
    }

    #[test(tokio::test)]
    async fn test_missing_provider_is_a_setup_error() {
        let server = FakeHomeserver::new();
        let services = IntentServices {
            db: Arc::new(MemoryStorage::new()),
            factory: Arc::new(FakeFactory::new(server.clone())),
            crypto: None,
            dispatcher: Arc::new(Dispatcher::new()),
            ctx: Arc::new(RequestContext::new()),
            retry_failed_setup: false,
        };
        let intent = Arc::new(Intent::new(
            user_id!("@bridge_alice:example.org").to_owned(),
            false,
            services,
        ));

        let err = intent.enable_encryption().await.unwrap_err();
        assert!(err.to_string().contains("no crypto provider"));
    }
}
