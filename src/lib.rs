// =============================================================================
// Matrixon Appservice - Library Crate
// =============================================================================
//
// Project: Matrixon - Ultra High Performance Matrix NextServer (Synapse Alternative)
// Author: arkSong (arksong2018@gmail.com) - Founder of Matrixon Innovation Project
// Date: 2024-12-11
// Version: 0.11.0-alpha
// License: Apache 2.0 / MIT
//
// Description:
//   Application-service layer for Matrix bridges and bots: a sync engine
//   that turns long-poll snapshots into room lifecycle events, intents that
//   act as virtual users, and a room upgrade chain resolver.
//
// =============================================================================

pub mod api;
pub mod config;
pub mod database;
pub mod events;
pub mod service;
pub mod utils;

#[cfg(any(test, feature = "testing"))]
pub mod test_utils;

// Re-export common types
pub use ruma;
pub use tokio;
pub use tracing;

pub use matrixon_common::{
    errcode, parse_retry_after_header, Error, MatrixError, Result, RetryAfterParseError,
};

pub use api::{ClientFactory, ClientIdentity, HomeserverApi, RequestContext};
pub use config::AppserviceConfig;
pub use database::MemoryStorage;
pub use events::{LifecycleEvent, LifecycleKind, RawEvent, SyncSnapshot};
pub use service::{
    appservice::Appservice,
    autojoin::{AutojoinHandler, AutojoinUpgradedHandler},
    dispatcher::{ChannelHandler, Dispatcher, EventHandler, FnHandler},
    intent::{Intent, IntentServices},
    rooms::{get_upgrade_history, RoomReference, RoomUpgradeHistory},
    sync::{StopHandle, SyncEngine, SyncRunner, SyncSettings},
};
