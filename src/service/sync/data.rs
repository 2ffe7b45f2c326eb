use crate::Result;

/// Storage for the long-poll cursor.
pub trait Data: Send + Sync {
    fn sync_token(&self) -> Result<Option<String>>;

    fn set_sync_token(&self, token: &str) -> Result<()>;
}
