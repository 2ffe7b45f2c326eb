use ruma::{TransactionId, UserId};

use crate::Result;

/// Registration flags, completed transactions and small per-user values.
pub trait Data: Send + Sync {
    fn is_user_registered(&self, user_id: &UserId) -> Result<bool>;

    fn add_registered_user(&self, user_id: &UserId) -> Result<()>;

    fn is_transaction_completed(&self, txn_id: &TransactionId) -> Result<bool>;

    fn set_transaction_completed(&self, txn_id: &TransactionId) -> Result<()>;

    fn read_value(&self, key: &str) -> Result<Option<String>>;

    fn store_value(&self, key: &str, value: &str) -> Result<()>;
}
