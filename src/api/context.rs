use std::sync::atomic::{AtomicU64, Ordering};

/// Per-process request context passed to every component that talks to the
/// homeserver.
#[derive(Debug, Default)]
pub struct RequestContext {
    last_request_id: AtomicU64,
}

impl RequestContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocates the next request ID. IDs start at 1.
    pub fn next_request_id(&self) -> u64 {
        self.last_request_id.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Number of IDs handed out so far.
    pub fn issued(&self) -> u64 {
        self.last_request_id.load(Ordering::Relaxed)
    }
}
