use tracing::warn;
use tracing_subscriber::{filter::ParseError, prelude::*, EnvFilter};

use crate::{Error, Result};

/// Installs the global `tracing` subscriber.
///
/// An invalid filter falls back to `warn` instead of failing startup.
pub fn init_tracing(filter: &str) -> Result<()> {
    let (filter_layer, rejected) = filter_layer(filter);

    let subscriber = tracing_subscriber::Registry::default()
        .with(filter_layer)
        .with(tracing_subscriber::fmt::Layer::new());
    tracing::subscriber::set_global_default(subscriber)
        .map_err(|e| Error::Config(format!("Failed to install tracing subscriber: {e}")))?;

    if let Some(e) = rejected {
        warn!("⚠️ Invalid log filter {:?}, falling back to warn: {}", filter, e);
    }

    Ok(())
}

fn filter_layer(filter: &str) -> (EnvFilter, Option<ParseError>) {
    match EnvFilter::try_new(filter) {
        Ok(layer) => (layer, None),
        Err(e) => (EnvFilter::new("warn"), Some(e)),
    }
}
