use std::sync::Arc;

use chrono::prelude::*;

use super::ACMEResult;
use crate::acme::models;
use crate::types;

pub const NONCE_VALIDITY_SECS: i64 = 3600;

fn bad_nonce(detail: &str) -> types::error::Error {
    types::error::Error {
        error_type: types::error::Type::BadNonce,
        status: 400,
        title: "Bad nonce".to_string(),
        detail: detail.to_string(),
        sub_problems: vec![],
        instance: None,
        identifier: None,
    }
}

#[derive(Clone)]
pub struct NonceRegistry {
    store: Arc<dyn crate::store::Store>,
}

impl NonceRegistry {
    pub fn new(store: Arc<dyn crate::store::Store>) -> NonceRegistry {
        NonceRegistry {
            store,
        }
    }

    pub async fn issue(&self) -> ACMEResult<String> {
        let id = uuid::Uuid::new_v4();
        let now = Utc::now();
        let nonce = models::Nonce {
            nonce: id,
            issued_at: now,
            expires_at: now + chrono::Duration::seconds(NONCE_VALIDITY_SECS),
        };
        try_store_result!(
            self.store.insert_nonce(nonce).await, "Unable to save nonce: {}")?;
        Ok(crate::util::uuid_as_b64(&id))
    }

    /// Expired nonces are purged before the take so a stale value can never
    /// authenticate a request.
    pub async fn consume(&self, nonce: &str) -> ACMEResult<()> {
        let nonce_uuid = match crate::util::b64_to_uuid(nonce) {
            Some(v) => v,
            None => {
                return Err(bad_nonce("Invalid nonce format"));
            }
        };
        try_store_result!(
            self.store.purge_expired_nonces(Utc::now()).await,
            "Unable to purge expired nonces: {}")?;
        let taken = try_store_result!(
            self.store.take_nonce(&nonce_uuid).await, "Unable to take nonce: {}")?;
        match taken {
            Some(_) => Ok(()),
            None => Err(bad_nonce("The nonce may have expired or it is being reused.")),
        }
    }
}
