//! Sequential long-poll loop.
//!
//! At most one sync request is outstanding. The next request goes out only
//! after the previous snapshot has been fully dispatched. Stopping is
//! cooperative: the flag is checked before each request, and a response
//! that arrives after stop was requested is discarded unprocessed.

use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use tokio::sync::Notify;
use tracing::{debug, info, instrument, warn};

use super::{Data, SyncEngine};
use crate::{
    api::{HomeserverApi, SyncRequest},
    config::SyncConfig,
    Result,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncSettings {
    /// Server-side long-poll wait.
    pub timeout_ms: u64,
    /// Pause after a failed poll, unless the error asks for longer.
    pub retry_delay_ms: u64,
    pub filter: Option<String>,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            timeout_ms: 30_000,
            retry_delay_ms: 5_000,
            filter: None,
        }
    }
}

impl From<&SyncConfig> for SyncSettings {
    fn from(config: &SyncConfig) -> Self {
        Self {
            timeout_ms: config.timeout_ms,
            retry_delay_ms: config.retry_delay_ms,
            filter: config.filter.clone(),
        }
    }
}

/// Cloneable handle that asks a running [`SyncRunner`] to stop.
#[derive(Debug, Clone, Default)]
pub struct StopHandle {
    stopped: Arc<AtomicBool>,
    notify: Arc<Notify>,
}

impl StopHandle {
    pub fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
        self.notify.notify_one();
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    async fn wait(&self) {
        self.notify.notified().await;
    }
}

pub struct SyncRunner {
    engine: SyncEngine,
    client: Arc<dyn HomeserverApi>,
    db: Arc<dyn Data>,
    settings: SyncSettings,
    stop: StopHandle,
}

impl SyncRunner {
    pub fn new(
        engine: SyncEngine,
        client: Arc<dyn HomeserverApi>,
        db: Arc<dyn Data>,
        settings: SyncSettings,
    ) -> Self {
        Self {
            engine,
            client,
            db,
            settings,
            stop: StopHandle::default(),
        }
    }

    pub fn engine(&self) -> &SyncEngine {
        &self.engine
    }

    pub fn engine_mut(&mut self) -> &mut SyncEngine {
        &mut self.engine
    }

    pub fn stop_handle(&self) -> StopHandle {
        self.stop.clone()
    }

    /// Performs one poll cycle.
    ///
    /// Returns `false` when the response was discarded because stop was
    /// requested while it was in flight.
    #[instrument(level = "debug", skip(self))]
    pub async fn sync_once(&mut self) -> Result<bool> {
        let request = SyncRequest {
            since: self.db.sync_token()?,
            timeout_ms: self.settings.timeout_ms,
            filter: self.settings.filter.clone(),
            full_state: false,
        };

        let snapshot = self.client.sync(&request).await?;
        if self.stop.is_stopped() {
            debug!("Stop requested during sync, discarding response");
            return Ok(false);
        }

        let next_batch = snapshot.next_batch.clone();
        self.engine.process_snapshot(snapshot).await;

        if let Some(token) = next_batch {
            self.db.set_sync_token(&token)?;
        }
        Ok(true)
    }

    /// Seeds the join cache and polls until stopped.
    ///
    /// Only the initial joined-rooms query is fatal; failed polls are
    /// logged and retried on the next iteration.
    #[instrument(level = "debug", skip(self), fields(user_id = %self.engine.user_id()))]
    pub async fn run(&mut self) -> Result<()> {
        info!("🚀 Starting sync loop");
        let joined = self.client.joined_rooms().await?;
        self.engine.seed_known_rooms(joined);

        while !self.stop.is_stopped() {
            if let Err(e) = self.sync_once().await {
                let hinted = e.as_matrix().and_then(|m| m.retry_after_ms).unwrap_or(0);
                let delay = Duration::from_millis(self.settings.retry_delay_ms.max(hinted));
                warn!("⚠️ Sync failed, retrying in {:?}: {}", delay, e);

                if self.stop.is_stopped() {
                    break;
                }
                tokio::select! {
                    _ = self.stop.wait() => break,
                    _ = tokio::time::sleep(delay) => {}
                }
            }
        }

        info!("🛑 Sync loop stopped");
        Ok(())
    }
}
