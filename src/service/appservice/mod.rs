// =============================================================================
// Matrixon Appservice - Appservice Module
// =============================================================================
//
// Project: Matrixon - Ultra High Performance Matrix NextServer (Synapse Alternative)
// Author: arkSong (arksong2018@gmail.com) - Founder of Matrixon Innovation Project
// Date: 2024-12-11
// Version: 0.11.0-alpha
// License: Apache 2.0 / MIT
//
// Description:
//   Owns the user namespace, the intent for every virtual user, and the
//   handling of transactions pushed by the homeserver. Transactions are
//   processed at most once per transaction ID.
//
// =============================================================================

mod data;

use std::{collections::HashMap, sync::Arc, time::Instant};

pub use data::Data;

use regex::RegexSet;
use ruma::{OwnedServerName, OwnedUserId, RoomId, ServerName, TransactionId, UserId};
use tokio::sync::RwLock;
use tracing::{debug, info, instrument, warn};

use crate::{
    api::{crypto::CryptoProvider, ClientFactory, RequestContext},
    config::{AppserviceConfig, NamespaceConfig},
    events::{EventContent, LifecycleEvent, Membership, RawEvent},
    service::{
        dispatcher::Dispatcher,
        intent::{Intent, IntentServices},
        sync::{self, EventClassifier, Preprocessor, SyncEngine, SyncRunner, SyncSettings},
    },
    Error, Result,
};

/// Compiled regular expressions for a namespace.
#[derive(Clone, Debug, Default)]
pub struct NamespaceRegex {
    pub exclusive: Option<RegexSet>,
    pub non_exclusive: Option<RegexSet>,
}

impl NamespaceRegex {
    /// Checks if this namespace has rights to a namespace
    pub fn is_match(&self, haystack: &str) -> bool {
        self.is_exclusive_match(haystack)
            || self
                .non_exclusive
                .as_ref()
                .is_some_and(|set| set.is_match(haystack))
    }

    /// Checks if this namespace has exclusive rights to a namespace
    pub fn is_exclusive_match(&self, haystack: &str) -> bool {
        self.exclusive
            .as_ref()
            .is_some_and(|set| set.is_match(haystack))
    }
}

impl TryFrom<&[NamespaceConfig]> for NamespaceRegex {
    type Error = regex::Error;

    fn try_from(value: &[NamespaceConfig]) -> std::result::Result<Self, regex::Error> {
        let (exclusive, non_exclusive): (Vec<_>, Vec<_>) =
            value.iter().partition(|namespace| namespace.exclusive);

        let compile = |namespaces: Vec<&NamespaceConfig>| {
            if namespaces.is_empty() {
                Ok(None)
            } else {
                RegexSet::new(namespaces.iter().map(|n| n.regex.as_str())).map(Some)
            }
        };

        Ok(NamespaceRegex {
            exclusive: compile(exclusive)?,
            non_exclusive: compile(non_exclusive)?,
        })
    }
}

pub struct Appservice {
    server_name: OwnedServerName,
    bot_user_id: OwnedUserId,
    hs_token: String,
    users: NamespaceRegex,
    services: IntentServices,
    classifier: RwLock<EventClassifier>,
    intents: RwLock<HashMap<OwnedUserId, Arc<Intent>>>,
}

impl Appservice {
    pub fn new(
        config: &AppserviceConfig,
        db: Arc<dyn Data>,
        factory: Arc<dyn ClientFactory>,
    ) -> Result<Self> {
        let server_name = ServerName::parse(&config.homeserver_name)?;
        let registration = &config.registration;
        let bot_user_id =
            UserId::parse_with_server_name(registration.sender_localpart.as_str(), &server_name)?;
        let users = NamespaceRegex::try_from(registration.namespaces.users.as_slice())
            .map_err(|e| Error::Config(format!("Invalid user namespace: {e}")))?;

        Ok(Self {
            server_name,
            bot_user_id,
            hs_token: registration.hs_token.clone(),
            users,
            services: IntentServices {
                db,
                factory,
                crypto: None,
                dispatcher: Arc::new(Dispatcher::new()),
                ctx: Arc::new(RequestContext::new()),
                retry_failed_setup: config.encryption.retry_failed_setup,
            },
            classifier: RwLock::new(EventClassifier::new()),
            intents: RwLock::new(HashMap::new()),
        })
    }

    /// Enables `Intent::enable_encryption` for intents created afterwards.
    pub fn with_crypto(mut self, provider: Arc<dyn CryptoProvider>) -> Self {
        self.services.crypto = Some(provider);
        self
    }

    pub fn server_name(&self) -> &ServerName {
        &self.server_name
    }

    pub fn bot_user_id(&self) -> &UserId {
        &self.bot_user_id
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.services.dispatcher
    }

    pub fn request_context(&self) -> &Arc<RequestContext> {
        &self.services.ctx
    }

    pub fn verify_hs_token(&self, token: &str) -> bool {
        self.hs_token == token
    }

    pub fn user_id_for_localpart(&self, localpart: &str) -> Result<OwnedUserId> {
        Ok(UserId::parse_with_server_name(localpart, &self.server_name)?)
    }

    /// Whether `user_id` lives on our server and falls in our namespace,
    /// the sender itself included.
    pub fn is_namespaced_user(&self, user_id: &UserId) -> bool {
        user_id.server_name().as_str() == self.server_name.as_str()
            && (user_id.as_str() == self.bot_user_id.as_str()
                || self.users.is_match(user_id.as_str()))
    }

    /// Returns the intent for `user_id`, creating it on first use.
    ///
    /// The same user always gets the same intent.
    pub async fn intent_for_user_id(&self, user_id: &UserId) -> Arc<Intent> {
        if let Some(intent) = self.intents.read().await.get(user_id) {
            return Arc::clone(intent);
        }

        let mut intents = self.intents.write().await;
        Arc::clone(intents.entry(user_id.to_owned()).or_insert_with(|| {
            debug!("🔧 Creating intent for {}", user_id);
            Arc::new(Intent::new(
                user_id.to_owned(),
                user_id.as_str() == self.bot_user_id.as_str(),
                self.services.clone(),
            ))
        }))
    }

    pub async fn intent(&self, localpart: &str) -> Result<Arc<Intent>> {
        let user_id = self.user_id_for_localpart(localpart)?;
        Ok(self.intent_for_user_id(&user_id).await)
    }

    pub async fn bot_intent(&self) -> Arc<Intent> {
        self.intent_for_user_id(&self.bot_user_id).await
    }

    /// Every intent created so far.
    pub async fn intents(&self) -> Vec<Arc<Intent>> {
        self.intents.read().await.values().cloned().collect()
    }

    pub async fn add_preprocessor(&self, preprocessor: Arc<dyn Preprocessor>) {
        self.classifier.write().await.add_preprocessor(preprocessor);
    }

    /// Builds a long-poll runner for the sender identity that feeds this
    /// appservice's dispatcher.
    pub async fn sync_runner(&self, db: Arc<dyn sync::Data>, settings: SyncSettings) -> SyncRunner {
        let classifier = self.classifier.read().await.clone();
        let engine = SyncEngine::with_classifier(
            self.bot_user_id.clone(),
            Arc::clone(&self.services.dispatcher),
            classifier,
        );
        let client = self.bot_intent().await.client().await;
        SyncRunner::new(engine, client, db, settings)
    }

    /// Handles one pushed transaction.
    ///
    /// A transaction ID that was already completed is acknowledged without
    /// processing. Events without a room ID are skipped.
    #[instrument(level = "debug", skip(self, events), fields(events = events.len()))]
    pub async fn on_transaction(&self, txn_id: &TransactionId, events: Vec<RawEvent>) -> Result<()> {
        let start = Instant::now();
        if self.services.db.is_transaction_completed(txn_id)? {
            debug!("Transaction {} already processed, skipping", txn_id);
            return Ok(());
        }

        let count = events.len();
        for event in events {
            let Some(room_id) = event.room_id().and_then(|id| RoomId::parse(id).ok()) else {
                debug!("Skipping transaction event without a room ID");
                continue;
            };

            let classified = self.classifier.read().await.classify(&room_id, event).await;
            let processed = classified.first().and_then(LifecycleEvent::event).cloned();

            for lifecycle in classified {
                self.services.dispatcher.emit(lifecycle).await;
            }
            if let Some(event) = processed {
                self.process_membership(&room_id, event).await;
            }
        }

        self.services.db.set_transaction_completed(txn_id)?;
        info!(
            "✅ Processed transaction {} with {} events in {:?}",
            txn_id,
            count,
            start.elapsed()
        );
        Ok(())
    }

    /// Tracks membership changes of users on our server.
    async fn process_membership(&self, room_id: &RoomId, event: RawEvent) {
        let EventContent::Member {
            state_key,
            membership,
        } = event.typed()
        else {
            return;
        };
        let Ok(user_id) = UserId::parse(state_key.as_str()) else {
            return;
        };
        if user_id.server_name().as_str() != self.server_name.as_str() {
            return;
        }

        let intent = self.intent_for_user_id(&user_id).await;
        let room_id = room_id.to_owned();
        match membership {
            Membership::Join => {
                self.services
                    .dispatcher
                    .emit(LifecycleEvent::Join {
                        room_id,
                        event: Some(event),
                    })
                    .await;
                refresh(&intent).await;
            }
            Membership::Leave | Membership::Ban => {
                self.services
                    .dispatcher
                    .emit(LifecycleEvent::Leave { room_id, event })
                    .await;
                refresh(&intent).await;
            }
            Membership::Invite => {
                self.services
                    .dispatcher
                    .emit(LifecycleEvent::Invite { room_id, event })
                    .await;
            }
            _ => {}
        }
    }
}

async fn refresh(intent: &Intent) {
    if let Err(e) = intent.refresh_joined_rooms().await {
        warn!(
            "⚠️ Failed to refresh joined rooms of {}: {}",
            intent.user_id(),
            e
        );
    }
}
