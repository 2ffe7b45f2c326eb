use ruma::{TransactionId, UserId};

use crate::{
    database::{poisoned, MemoryStorage},
    service, Result,
};

impl service::appservice::Data for MemoryStorage {
    fn is_user_registered(&self, user_id: &UserId) -> Result<bool> {
        Ok(self
            .registered_users
            .read()
            .map_err(poisoned)?
            .contains(user_id))
    }

    fn add_registered_user(&self, user_id: &UserId) -> Result<()> {
        self.registered_users
            .write()
            .map_err(poisoned)?
            .insert(user_id.to_owned());
        Ok(())
    }

    fn is_transaction_completed(&self, txn_id: &TransactionId) -> Result<bool> {
        Ok(self
            .completed_transactions
            .read()
            .map_err(poisoned)?
            .contains(txn_id))
    }

    /// Transactions are never forgotten once recorded.
    fn set_transaction_completed(&self, txn_id: &TransactionId) -> Result<()> {
        self.completed_transactions
            .write()
            .map_err(poisoned)?
            .insert(txn_id.to_owned());
        Ok(())
    }

    fn read_value(&self, key: &str) -> Result<Option<String>> {
        Ok(self.values.read().map_err(poisoned)?.get(key).cloned())
    }

    fn store_value(&self, key: &str, value: &str) -> Result<()> {
        self.values
            .write()
            .map_err(poisoned)?
            .insert(key.to_owned(), value.to_owned());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::service::appservice::Data;
    use ruma::{user_id, OwnedTransactionId};

    #[test]
    fn test_registered_users() {
        let storage = MemoryStorage::new();
        let user = user_id!("@bridge_alice:example.org");

        assert!(!storage.is_user_registered(user).unwrap());
        storage.add_registered_user(user).unwrap();
        storage.add_registered_user(user).unwrap();
        assert!(storage.is_user_registered(user).unwrap());
        assert!(!storage
            .is_user_registered(user_id!("@bridge_bob:example.org"))
            .unwrap());
    }

    #[test]
    fn test_transactions_only_grow() {
        let storage = MemoryStorage::new();
        let first = OwnedTransactionId::from("txn1".to_owned());
        let second = OwnedTransactionId::from("txn2".to_owned());

        storage.set_transaction_completed(&first).unwrap();
        storage.set_transaction_completed(&second).unwrap();
        storage.set_transaction_completed(&first).unwrap();

        assert!(storage.is_transaction_completed(&first).unwrap());
        assert!(storage.is_transaction_completed(&second).unwrap());
        assert!(!storage
            .is_transaction_completed(&OwnedTransactionId::from("txn3".to_owned()))
            .unwrap());
    }

    #[test]
    fn test_values() {
        let storage = MemoryStorage::new();
        assert_eq!(storage.read_value("access_token").unwrap(), None);
        storage.store_value("access_token", "syt_abc").unwrap();
        assert_eq!(
            storage.read_value("access_token").unwrap().as_deref(),
            Some("syt_abc")
        );
    }
}
