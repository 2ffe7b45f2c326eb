// =============================================================================
// Matrixon Appservice - Database Module
// =============================================================================
//
// Project: Matrixon - Ultra High Performance Matrix NextServer (Synapse Alternative)
// Author: arkSong (arksong2018@gmail.com) - Founder of Matrixon Innovation Project
// Date: 2024-12-11
// Version: 0.11.0-alpha
// License: Apache 2.0 / MIT
//
// Description:
//   In-process storage backing the service Data traits. Durable engines
//   implement the same traits outside this crate.
//
// =============================================================================

mod key_value;

use std::{
    collections::{HashMap, HashSet},
    sync::{PoisonError, RwLock},
};

use ruma::{OwnedTransactionId, OwnedUserId};

use crate::Error;

/// Memory-only storage. Everything is lost when the process exits.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    registered_users: RwLock<HashSet<OwnedUserId>>,
    completed_transactions: RwLock<HashSet<OwnedTransactionId>>,
    values: RwLock<HashMap<String, String>>,
    sync_token: RwLock<Option<String>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

fn poisoned<T>(_: PoisonError<T>) -> Error {
    Error::Storage("memory storage lock poisoned".to_owned())
}
