//! Persistence behind the ACME engine. A `Batch` is applied atomically by
//! `commit`; multi-entity state transitions (cascades, challenge outcomes)
//! always go through a single commit.

use std::collections::HashMap;

use chrono::prelude::*;

use crate::acme::models;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("storage backend error: {0}")]
    Backend(String),
}

#[derive(Debug, Default)]
pub struct Batch {
    pub accounts: Vec<models::Account>,
    pub orders: Vec<models::Order>,
    pub authorizations: Vec<models::Authorization>,
    pub challenges: Vec<models::Challenge>,
}

impl Batch {
    pub fn is_empty(&self) -> bool {
        self.accounts.is_empty() && self.orders.is_empty()
            && self.authorizations.is_empty() && self.challenges.is_empty()
    }
}

#[async_trait::async_trait]
pub trait Store: Send + Sync {
    async fn insert_nonce(&self, nonce: models::Nonce) -> Result<(), StoreError>;

    /// Removes and returns the nonce in one step; a nonce can only ever be
    /// taken once.
    async fn take_nonce(&self, nonce: &uuid::Uuid) -> Result<Option<models::Nonce>, StoreError>;

    async fn purge_expired_nonces(&self, now: DateTime<Utc>) -> Result<(), StoreError>;

    async fn account(&self, id: &uuid::Uuid) -> Result<Option<models::Account>, StoreError>;

    async fn account_by_key(&self, public_key: &[u8]) -> Result<Option<models::Account>, StoreError>;

    async fn order(&self, id: &uuid::Uuid) -> Result<Option<models::Order>, StoreError>;

    async fn order_by_certificate(&self, certificate_id: &str) -> Result<Option<models::Order>, StoreError>;

    async fn orders_by_account(&self, account: &uuid::Uuid) -> Result<Vec<models::Order>, StoreError>;

    async fn authorization(&self, id: &uuid::Uuid) -> Result<Option<models::Authorization>, StoreError>;

    async fn authorizations_by_order(&self, order: &uuid::Uuid) -> Result<Vec<models::Authorization>, StoreError>;

    async fn challenge(&self, id: &uuid::Uuid) -> Result<Option<models::Challenge>, StoreError>;

    async fn challenges_by_authorization(&self, authorization: &uuid::Uuid) -> Result<Vec<models::Challenge>, StoreError>;

    /// Upserts every entity in the batch atomically.
    async fn commit(&self, batch: Batch) -> Result<(), StoreError>;
}

#[derive(Debug, Default)]
struct MemoryInner {
    nonces: HashMap<uuid::Uuid, models::Nonce>,
    accounts: HashMap<uuid::Uuid, models::Account>,
    orders: HashMap<uuid::Uuid, models::Order>,
    authorizations: HashMap<uuid::Uuid, models::Authorization>,
    challenges: HashMap<uuid::Uuid, models::Challenge>,
}

/// In-memory store. One lock around all tables, so a `commit` is trivially
/// atomic and account-scoped mutations are serialized.
#[derive(Debug, Default)]
pub struct MemoryStore {
    inner: tokio::sync::Mutex<MemoryInner>,
}

impl MemoryStore {
    pub fn new() -> MemoryStore {
        MemoryStore::default()
    }
}

#[async_trait::async_trait]
impl Store for MemoryStore {
    async fn insert_nonce(&self, nonce: models::Nonce) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        inner.nonces.insert(nonce.nonce, nonce);
        Ok(())
    }

    async fn take_nonce(&self, nonce: &uuid::Uuid) -> Result<Option<models::Nonce>, StoreError> {
        let mut inner = self.inner.lock().await;
        Ok(inner.nonces.remove(nonce))
    }

    async fn purge_expired_nonces(&self, now: DateTime<Utc>) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        inner.nonces.retain(|_, n| n.expires_at > now);
        Ok(())
    }

    async fn account(&self, id: &uuid::Uuid) -> Result<Option<models::Account>, StoreError> {
        let inner = self.inner.lock().await;
        Ok(inner.accounts.get(id).cloned())
    }

    async fn account_by_key(&self, public_key: &[u8]) -> Result<Option<models::Account>, StoreError> {
        let inner = self.inner.lock().await;
        Ok(inner.accounts.values().find(|a| a.public_key == public_key).cloned())
    }

    async fn order(&self, id: &uuid::Uuid) -> Result<Option<models::Order>, StoreError> {
        let inner = self.inner.lock().await;
        Ok(inner.orders.get(id).cloned())
    }

    async fn order_by_certificate(&self, certificate_id: &str) -> Result<Option<models::Order>, StoreError> {
        let inner = self.inner.lock().await;
        Ok(inner.orders.values()
            .find(|o| o.certificate_id.as_deref() == Some(certificate_id)).cloned())
    }

    async fn orders_by_account(&self, account: &uuid::Uuid) -> Result<Vec<models::Order>, StoreError> {
        let inner = self.inner.lock().await;
        let mut orders: Vec<_> = inner.orders.values()
            .filter(|o| &o.account == account).cloned().collect();
        orders.sort_by_key(|o| o.created_at);
        Ok(orders)
    }

    async fn authorization(&self, id: &uuid::Uuid) -> Result<Option<models::Authorization>, StoreError> {
        let inner = self.inner.lock().await;
        Ok(inner.authorizations.get(id).cloned())
    }

    async fn authorizations_by_order(&self, order: &uuid::Uuid) -> Result<Vec<models::Authorization>, StoreError> {
        let inner = self.inner.lock().await;
        let mut authorizations: Vec<_> = inner.authorizations.values()
            .filter(|a| &a.order == order).cloned().collect();
        authorizations.sort_by_key(|a| a.created_at);
        Ok(authorizations)
    }

    async fn challenge(&self, id: &uuid::Uuid) -> Result<Option<models::Challenge>, StoreError> {
        let inner = self.inner.lock().await;
        Ok(inner.challenges.get(id).cloned())
    }

    async fn challenges_by_authorization(&self, authorization: &uuid::Uuid) -> Result<Vec<models::Challenge>, StoreError> {
        let inner = self.inner.lock().await;
        let mut challenges: Vec<_> = inner.challenges.values()
            .filter(|c| &c.authorization == authorization).cloned().collect();
        challenges.sort_by_key(|c| c.created_at);
        Ok(challenges)
    }

    async fn commit(&self, batch: Batch) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        for account in batch.accounts {
            inner.accounts.insert(account.id, account);
        }
        for order in batch.orders {
            inner.orders.insert(order.id, order);
        }
        for authorization in batch.authorizations {
            inner.authorizations.insert(authorization.id, authorization);
        }
        for challenge in batch.challenges {
            inner.challenges.insert(challenge.id, challenge);
        }
        Ok(())
    }
}
