use crate::{
    database::{poisoned, MemoryStorage},
    service, Result,
};

impl service::sync::Data for MemoryStorage {
    fn sync_token(&self) -> Result<Option<String>> {
        Ok(self.sync_token.read().map_err(poisoned)?.clone())
    }

    fn set_sync_token(&self, token: &str) -> Result<()> {
        *self.sync_token.write().map_err(poisoned)? = Some(token.to_owned());
        Ok(())
    }
}
