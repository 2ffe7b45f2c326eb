// =============================================================================
// Matrixon Appservice - Dispatcher Module
// =============================================================================
//
// Project: Matrixon - Ultra High Performance Matrix NextServer (Synapse Alternative)
// Author: arkSong (arksong2018@gmail.com) - Founder of Matrixon Innovation Project
// Date: 2024-12-11
// Version: 0.11.0-alpha
// License: Apache 2.0 / MIT
//
// Description:
//   Typed handler registry for room-lifecycle events. Handlers run in
//   registration order; one failing handler does not stop the others.
//
// =============================================================================

use std::{future::Future, sync::Arc};

use async_trait::async_trait;
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, warn};

use crate::{
    events::{LifecycleEvent, LifecycleKind},
    Result,
};

#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn handle(&self, event: &LifecycleEvent) -> Result<()>;
}

/// Adapts an async closure into an [`EventHandler`].
pub struct FnHandler<F>(pub F);

#[async_trait]
impl<F, Fut> EventHandler for FnHandler<F>
where
    F: Fn(LifecycleEvent) -> Fut + Send + Sync,
    Fut: Future<Output = Result<()>> + Send,
{
    async fn handle(&self, event: &LifecycleEvent) -> Result<()> {
        (self.0)(event.clone()).await
    }
}

/// Forwards events into an unbounded channel, optionally filtered by kind.
pub struct ChannelHandler {
    sender: mpsc::UnboundedSender<LifecycleEvent>,
    kinds: Option<Vec<LifecycleKind>>,
}

impl ChannelHandler {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<LifecycleEvent>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (
            Self {
                sender,
                kinds: None,
            },
            receiver,
        )
    }

    /// Only forwards the listed kinds.
    pub fn filtered(kinds: &[LifecycleKind]) -> (Self, mpsc::UnboundedReceiver<LifecycleEvent>) {
        let (mut handler, receiver) = Self::new();
        handler.kinds = Some(kinds.to_vec());
        (handler, receiver)
    }
}

#[async_trait]
impl EventHandler for ChannelHandler {
    async fn handle(&self, event: &LifecycleEvent) -> Result<()> {
        if let Some(kinds) = &self.kinds {
            if !kinds.contains(&event.kind()) {
                return Ok(());
            }
        }
        // A dropped receiver just means nobody listens anymore.
        let _ = self.sender.send(event.clone());
        Ok(())
    }
}

#[derive(Default)]
pub struct Dispatcher {
    handlers: RwLock<Vec<Arc<dyn EventHandler>>>,
}

impl Dispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn subscribe(&self, handler: Arc<dyn EventHandler>) {
        self.handlers.write().await.push(handler);
    }

    pub async fn handler_count(&self) -> usize {
        self.handlers.read().await.len()
    }

    /// Delivers `event` to every handler registered at call time.
    pub async fn emit(&self, event: LifecycleEvent) {
        let handlers = self.handlers.read().await.clone();
        debug!(
            "Dispatching {} to {} handlers",
            event.kind().as_str(),
            handlers.len()
        );

        for handler in handlers {
            if let Err(e) = handler.handle(&event).await {
                warn!("⚠️ Handler for {} failed: {}", event.kind().as_str(), e);
            }
        }
    }
}
