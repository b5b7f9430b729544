//! Stored entities and their mapping to the wire objects in `types`.

use base64::prelude::*;
use chrono::prelude::*;

use super::{ACMEResult, Scope, UrlBuilder};
use crate::types;

#[derive(Debug, Clone)]
pub struct Nonce {
    pub nonce: uuid::Uuid,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccountStatus {
    Valid,
    Deactivated,
}

#[derive(Debug, Clone)]
pub struct Account {
    pub id: uuid::Uuid,
    pub created_at: DateTime<Utc>,
    pub tos_agreed_at: Option<DateTime<Utc>>,
    pub status: AccountStatus,
    pub public_key: Vec<u8>,
    pub contacts: Vec<String>,
    pub profile: String,
}

impl Account {
    pub fn pkey(&self) -> ACMEResult<openssl::pkey::PKey<openssl::pkey::Public>> {
        match openssl::pkey::PKey::public_key_from_der(&self.public_key) {
            Ok(v) => Ok(v),
            Err(err) => {
                error!("Stored public key for account {} is invalid: {}", self.id, err);
                Err(internal_server_error!())
            }
        }
    }

    pub fn kid(&self, urls: &UrlBuilder, scope: &Scope) -> String {
        urls.account(scope, &self.id)
    }

    pub fn to_json(&self, urls: &UrlBuilder, scope: &Scope) -> types::account::Account {
        types::account::Account {
            status: match self.status {
                AccountStatus::Valid => types::account::Status::Valid,
                AccountStatus::Deactivated => types::account::Status::Deactivated,
            },
            contact: self.contacts.clone(),
            terms_of_service_agreed: self.tos_agreed_at.is_some(),
            orders: urls.account_orders(scope, &self.id),
        }
    }
}

pub fn parse_contacts(contacts: &[String]) -> ACMEResult<Vec<String>> {
    let mut errors = vec![];
    for contact in contacts {
        let contact_url = match url::Url::parse(contact) {
            Ok(v) => v,
            Err(_) => {
                errors.push(types::error::Error {
                    error_type: types::error::Type::InvalidContact,
                    status: 400,
                    title: "Invalid contact".to_string(),
                    detail: format!("'{}' is not a valid URL", contact),
                    sub_problems: vec![],
                    instance: None,
                    identifier: None,
                });
                continue;
            }
        };
        if contact_url.scheme() != "mailto" {
            errors.push(types::error::Error {
                error_type: types::error::Type::UnsupportedContact,
                status: 400,
                title: "Unsupported contact".to_string(),
                detail: format!("'{}' is not a supported contact scheme", contact_url.scheme()),
                sub_problems: vec![],
                instance: None,
                identifier: None,
            });
            continue;
        }
        let address = contact_url.path();
        if address.is_empty() || !address.contains('@') {
            errors.push(types::error::Error {
                error_type: types::error::Type::InvalidContact,
                status: 400,
                title: "Invalid contact".to_string(),
                detail: format!("'{}' is not a valid email address", address),
                sub_problems: vec![],
                instance: None,
                identifier: None,
            });
        }
    }
    crate::util::error_list_to_result(errors, "Errors validating contacts".to_string())?;
    Ok(contacts.to_vec())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrderStatus {
    Pending,
    Ready,
    Processing,
    Valid,
    Invalid,
}

#[derive(Debug, Clone)]
pub struct Order {
    pub id: uuid::Uuid,
    pub account: uuid::Uuid,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub status: OrderStatus,
    pub identifiers: Vec<types::identifier::Identifier>,
    pub not_before: Option<DateTime<Utc>>,
    pub not_after: Option<DateTime<Utc>>,
    pub certificate_id: Option<String>,
    pub error: Option<types::error::Error>,
}

impl Order {
    pub fn transition(&mut self, to: OrderStatus) -> bool {
        let allowed = matches!(
            (self.status, to),
            (OrderStatus::Pending, OrderStatus::Ready)
                | (OrderStatus::Pending, OrderStatus::Invalid)
                | (OrderStatus::Ready, OrderStatus::Processing)
                | (OrderStatus::Ready, OrderStatus::Invalid)
                | (OrderStatus::Processing, OrderStatus::Valid)
                | (OrderStatus::Processing, OrderStatus::Invalid)
        );
        if allowed {
            self.status = to;
        } else {
            warn!("Disallowed order transition {:?} -> {:?} on {}", self.status, to, self.id);
        }
        allowed
    }

    /// Orders never reach a terminal state on a timer, only when read.
    pub fn expire_if_due(&mut self, now: DateTime<Utc>) -> bool {
        if now > self.expires_at
            && self.status != OrderStatus::Valid && self.status != OrderStatus::Invalid {
            self.status = OrderStatus::Invalid;
            return true;
        }
        false
    }

    pub fn to_json(
        &self, authorizations: &[Authorization], urls: &UrlBuilder, scope: &Scope,
    ) -> types::order::Order {
        types::order::Order {
            status: match self.status {
                OrderStatus::Pending => types::order::Status::Pending,
                OrderStatus::Ready => types::order::Status::Ready,
                OrderStatus::Processing => types::order::Status::Processing,
                OrderStatus::Valid => types::order::Status::Valid,
                OrderStatus::Invalid => types::order::Status::Invalid,
            },
            expires: Some(self.expires_at),
            identifiers: self.identifiers.clone(),
            not_before: self.not_before,
            not_after: self.not_after,
            error: self.error.clone(),
            authorizations: authorizations.iter()
                .map(|a| urls.authorization(scope, &a.id)).collect(),
            finalize: urls.finalize(scope, &self.id),
            certificate: self.certificate_id.as_ref()
                .map(|id| urls.certificate(scope, id)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthorizationStatus {
    Pending,
    Valid,
    Invalid,
    Deactivated,
}

#[derive(Debug, Clone)]
pub struct Authorization {
    pub id: uuid::Uuid,
    pub order: uuid::Uuid,
    pub account: uuid::Uuid,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub status: AuthorizationStatus,
    pub identifier: types::identifier::Identifier,
    pub wildcard: bool,
}

impl Authorization {
    pub fn transition(&mut self, to: AuthorizationStatus) -> bool {
        let allowed = matches!(
            (self.status, to),
            (AuthorizationStatus::Pending, AuthorizationStatus::Valid)
                | (AuthorizationStatus::Pending, AuthorizationStatus::Invalid)
                | (AuthorizationStatus::Pending, AuthorizationStatus::Deactivated)
                | (AuthorizationStatus::Valid, AuthorizationStatus::Deactivated)
        );
        if allowed {
            self.status = to;
        } else {
            warn!("Disallowed authorization transition {:?} -> {:?} on {}",
                  self.status, to, self.id);
        }
        allowed
    }

    pub fn expire_if_due(&mut self, now: DateTime<Utc>) -> bool {
        if now > self.expires_at && self.status == AuthorizationStatus::Pending {
            self.status = AuthorizationStatus::Invalid;
            return true;
        }
        false
    }

    pub fn to_json(
        &self, challenges: &[Challenge], urls: &UrlBuilder, scope: &Scope,
    ) -> types::authorization::Authorization {
        types::authorization::Authorization {
            identifier: self.identifier.clone(),
            status: match self.status {
                AuthorizationStatus::Pending => types::authorization::Status::Pending,
                AuthorizationStatus::Valid => types::authorization::Status::Valid,
                AuthorizationStatus::Invalid => types::authorization::Status::Invalid,
                AuthorizationStatus::Deactivated => types::authorization::Status::Deactivated,
            },
            expires: Some(self.expires_at),
            challenges: challenges.iter().map(|c| c.to_json(urls, scope)).collect(),
            wildcard: if self.wildcard {
                Some(true)
            } else {
                None
            },
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChallengeType {
    Http01,
    Dns01,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChallengeStatus {
    Pending,
    Valid,
    Invalid,
}

#[derive(Debug, Clone)]
pub struct Challenge {
    pub id: uuid::Uuid,
    pub authorization: uuid::Uuid,
    pub created_at: DateTime<Utc>,
    pub challenge_type: ChallengeType,
    pub token: String,
    pub status: ChallengeStatus,
    pub validated_at: Option<DateTime<Utc>>,
    pub error: Option<types::error::Error>,
}

impl Challenge {
    pub fn transition(&mut self, to: ChallengeStatus) -> bool {
        let allowed = matches!(
            (self.status, to),
            (ChallengeStatus::Pending, ChallengeStatus::Valid)
                | (ChallengeStatus::Pending, ChallengeStatus::Invalid)
                | (ChallengeStatus::Valid, ChallengeStatus::Invalid)
        );
        if allowed {
            self.status = to;
        } else {
            warn!("Disallowed challenge transition {:?} -> {:?} on {}",
                  self.status, to, self.id);
        }
        allowed
    }

    pub fn to_json(&self, urls: &UrlBuilder, scope: &Scope) -> types::challenge::Challenge {
        types::challenge::Challenge {
            challenge_type: match self.challenge_type {
                ChallengeType::Http01 => types::challenge::Type::HTTP01,
                ChallengeType::Dns01 => types::challenge::Type::DNS01,
            },
            url: urls.challenge(scope, &self.id),
            status: match self.status {
                ChallengeStatus::Pending => types::challenge::Status::Pending,
                ChallengeStatus::Valid => types::challenge::Status::Valid,
                ChallengeStatus::Invalid => types::challenge::Status::Invalid,
            },
            validated: self.validated_at,
            error: self.error.clone(),
            token: Some(self.token.clone()),
        }
    }
}

pub fn new_token() -> ACMEResult<String> {
    let mut token = [0u8; 32];
    match openssl::rand::rand_bytes(&mut token) {
        Ok(()) => Ok(BASE64_URL_SAFE_NO_PAD.encode(token)),
        Err(err) => {
            error!("Unable to generate a challenge token: {}", err);
            Err(internal_server_error!())
        }
    }
}
