// =============================================================================
// Matrixon Appservice - Configuration Module
// =============================================================================
//
// Project: Matrixon - Ultra High Performance Matrix NextServer (Synapse Alternative)
// Author: arkSong (arksong2018@gmail.com) - Founder of Matrixon Innovation Project
// Date: 2024-12-11
// Version: 0.11.0-alpha
// License: Apache 2.0 / MIT
//
// Description:
//   Appservice configuration loaded from a TOML file, with MATRIXON_
//   prefixed environment variables layered on top. Nested keys use a
//   double underscore, e.g. MATRIXON_SYNC__TIMEOUT_MS.
//
// =============================================================================

use std::path::Path;

use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::{Error, Result};

pub const ENV_PREFIX: &str = "MATRIXON_";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppserviceConfig {
    pub homeserver_url: String,
    /// Server name used to build user IDs, e.g. `example.org`.
    pub homeserver_name: String,
    pub registration: RegistrationConfig,
    #[serde(default)]
    pub sync: SyncConfig,
    #[serde(default)]
    pub encryption: EncryptionConfig,
    #[serde(default = "default_log")]
    pub log: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistrationConfig {
    pub id: String,
    pub as_token: String,
    pub hs_token: String,
    pub sender_localpart: String,
    #[serde(default)]
    pub namespaces: NamespacesConfig,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NamespacesConfig {
    #[serde(default)]
    pub users: Vec<NamespaceConfig>,
    #[serde(default)]
    pub aliases: Vec<NamespaceConfig>,
    #[serde(default)]
    pub rooms: Vec<NamespaceConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NamespaceConfig {
    pub regex: String,
    #[serde(default)]
    pub exclusive: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    #[serde(default = "default_sync_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
    #[serde(default)]
    pub filter: Option<String>,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            timeout_ms: default_sync_timeout_ms(),
            retry_delay_ms: default_retry_delay_ms(),
            filter: None,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EncryptionConfig {
    /// Allow a later `enable_encryption` call to retry a failed setup.
    #[serde(default)]
    pub retry_failed_setup: bool,
}

fn default_log() -> String {
    "info".to_owned()
}

fn default_sync_timeout_ms() -> u64 {
    30_000
}

fn default_retry_delay_ms() -> u64 {
    5_000
}

impl AppserviceConfig {
    /// Loads the configuration from `path` and the environment.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        debug!("🔧 Loading configuration from {}", path.display());

        let config: Self = Figment::new()
            .merge(Toml::file(path))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .extract()
            .map_err(|e| Error::Config(e.to_string()))?;
        config.validate()?;

        info!("✅ Loaded configuration for appservice {}", config.registration.id);
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.homeserver_name.is_empty() {
            return Err(Error::Config("homeserver_name cannot be empty".into()));
        }
        if self.homeserver_url.is_empty() {
            return Err(Error::Config("homeserver_url cannot be empty".into()));
        }
        if self.registration.as_token.is_empty() || self.registration.hs_token.is_empty() {
            return Err(Error::Config("as_token and hs_token are required".into()));
        }
        if self.registration.sender_localpart.is_empty() {
            return Err(Error::Config("sender_localpart cannot be empty".into()));
        }

        let namespaces = &self.registration.namespaces;
        for namespace in namespaces
            .users
            .iter()
            .chain(&namespaces.aliases)
            .chain(&namespaces.rooms)
        {
            Regex::new(&namespace.regex).map_err(|e| {
                Error::Config(format!("Invalid namespace regex {:?}: {}", namespace.regex, e))
            })?;
        }

        Ok(())
    }
}
