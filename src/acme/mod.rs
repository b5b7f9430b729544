use std::sync::Arc;

use crate::types;

pub type ACMEResult<I> = Result<I, types::error::Error>;

#[macro_export]
macro_rules! try_store_result {
    ($src:expr, $err:expr) => {
        (match ($src) {
            Ok(inner) => Ok(inner),
            Err(err) => {
                error!($err, err);
                Err(crate::internal_server_error!())
            }
        })
    }
}

#[macro_export]
macro_rules! internal_server_error {
    () => {
        crate::types::error::Error {
            error_type: crate::types::error::Type::ServerInternal,
            status: 500,
            title: String::from("Internal Server Error"),
            detail: "Something really went wrong there, we have no idea what it was".to_string(),
            sub_problems: vec ! [],
            instance: None,
            identifier: None,
        }
    }
}

macro_rules! ensure_request_key_kid {
    ($src:expr) => {
        match $src {
            crate::acme::jws::JwsRequestKey::Kid(k) => k,
            crate::acme::jws::JwsRequestKey::Jwk { kid: _, key: _ } => {
                return Err(crate::types::error::Error {
                    error_type: crate::types::error::Type::Malformed,
                    status: 400,
                    title: "Bad request".to_string(),
                    detail: "'jwk' field cannot be used".to_string(),
                    sub_problems: vec![],
                    instance: None,
                    identifier: None,
                });
            }
        }
    }
}

macro_rules! ensure_request_key_jwk {
    ($src:expr) => {
        match $src {
            crate::acme::jws::JwsRequestKey::Jwk { kid: _, key } => key,
            crate::acme::jws::JwsRequestKey::Kid(_) => {
                return Err(crate::types::error::Error {
                    error_type: crate::types::error::Type::Malformed,
                    status: 400,
                    title: "Bad request".to_string(),
                    detail: "'kid' field cannot be used".to_string(),
                    sub_problems: vec![],
                    instance: None,
                    identifier: None,
                });
            }
        }
    }
}

macro_rules! ensure_not_post_as_get {
    ($src:expr) => {
        match $src {
            Some(v) => v,
            None => {
                return Err(crate::types::error::Error {
                    error_type: crate::types::error::Type::Malformed,
                    status: 405,
                    title: "Method not allowed".to_string(),
                    detail: "POST-as-GET is not allowed".to_string(),
                    sub_problems: vec![],
                    instance: None,
                    identifier: None,
                });
            }
        }
    }
}

macro_rules! ensure_post_as_get {
    ($src:expr) => {
        match $src {
            None => {},
            Some(_) => {
                return Err(crate::types::error::Error {
                    error_type: crate::types::error::Type::Malformed,
                    status: 405,
                    title: "Method not allowed".to_string(),
                    detail: "POST-as-GET is required".to_string(),
                    sub_problems: vec![],
                    instance: None,
                    identifier: None,
                });
            }
        }
    }
}

macro_rules! decode_id {
    ($oid:expr) => {
        (match crate::util::b64_to_uuid($oid) {
            Some(v) => Ok(v),
            None => Err(crate::types::error::Error {
                    error_type: crate::types::error::Type::Malformed,
                    status: 400,
                    title: "Bad ID".to_string(),
                    detail: "Invalid ID format".to_string(),
                    sub_problems: vec![],
                    instance: None,
                    identifier: None,
                })
        })
    }
}

pub mod csr;
pub mod issuance;
pub mod jws;
pub mod models;
pub mod processing;
pub mod replay;
mod responses;

pub use responses::{AcmeResponse, Link};

/// Which directory prefix a request came in under. Every profile is served
/// both under its own name and under a `raProfile/` alias.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Scope {
    Profile(String),
    RaProfile(String),
}

impl Scope {
    pub fn profile_name(&self) -> &str {
        match self {
            Scope::Profile(n) => n,
            Scope::RaProfile(n) => n,
        }
    }

    fn path_segment(&self) -> String {
        match self {
            Scope::Profile(n) => n.clone(),
            Scope::RaProfile(n) => format!("raProfile/{}", n),
        }
    }
}

#[derive(Debug, Clone)]
pub struct UrlBuilder {
    external: url::Url,
}

impl UrlBuilder {
    fn new(mut external: url::Url) -> UrlBuilder {
        if !external.path().ends_with('/') {
            let path = format!("{}/", external.path());
            external.set_path(&path);
        }
        UrlBuilder {
            external,
        }
    }

    fn scoped(&self, scope: &Scope, tail: &str) -> String {
        format!("{}{}/{}", self.external, scope.path_segment(), tail)
    }

    pub fn directory(&self, scope: &Scope) -> String {
        self.scoped(scope, "directory")
    }

    pub fn new_nonce(&self, scope: &Scope) -> String {
        self.scoped(scope, "new-nonce")
    }

    pub fn new_account(&self, scope: &Scope) -> String {
        self.scoped(scope, "new-account")
    }

    pub fn new_order(&self, scope: &Scope) -> String {
        self.scoped(scope, "new-order")
    }

    pub fn new_authz(&self, scope: &Scope) -> String {
        self.scoped(scope, "new-authz")
    }

    pub fn revoke_cert(&self, scope: &Scope) -> String {
        self.scoped(scope, "revoke-cert")
    }

    pub fn key_change(&self, scope: &Scope) -> String {
        self.scoped(scope, "key-change")
    }

    pub fn account(&self, scope: &Scope, id: &uuid::Uuid) -> String {
        self.scoped(scope, &format!("acct/{}", crate::util::uuid_as_b64(id)))
    }

    pub fn account_orders(&self, scope: &Scope, id: &uuid::Uuid) -> String {
        self.scoped(scope, &format!("acct/{}/orders", crate::util::uuid_as_b64(id)))
    }

    pub fn order(&self, scope: &Scope, id: &uuid::Uuid) -> String {
        self.scoped(scope, &format!("order/{}", crate::util::uuid_as_b64(id)))
    }

    pub fn finalize(&self, scope: &Scope, id: &uuid::Uuid) -> String {
        self.scoped(scope, &format!("order/{}/finalize", crate::util::uuid_as_b64(id)))
    }

    pub fn authorization(&self, scope: &Scope, id: &uuid::Uuid) -> String {
        self.scoped(scope, &format!("authz/{}", crate::util::uuid_as_b64(id)))
    }

    pub fn challenge(&self, scope: &Scope, id: &uuid::Uuid) -> String {
        self.scoped(scope, &format!("chall/{}", crate::util::uuid_as_b64(id)))
    }

    pub fn certificate(&self, scope: &Scope, certificate_id: &str) -> String {
        self.scoped(scope, &format!("cert/{}", certificate_id))
    }
}

pub struct Server {
    pub(crate) config: crate::config::Config,
    pub(crate) urls: UrlBuilder,
    pub(crate) store: Arc<dyn crate::store::Store>,
    pub(crate) ca: Arc<dyn crate::ca::CertificateAuthority>,
    pub(crate) profiles: Arc<dyn crate::profile::ProfileSource>,
    pub(crate) validator: crate::validator::Validator,
    pub(crate) nonces: replay::NonceRegistry,
    pub(crate) issuance: issuance::IssuancePool,
}

impl Server {
    pub fn new(
        config: crate::config::Config,
        store: Arc<dyn crate::store::Store>,
        ca: Arc<dyn crate::ca::CertificateAuthority>,
        profiles: Arc<dyn crate::profile::ProfileSource>,
    ) -> Result<Server, url::ParseError> {
        let external = url::Url::parse(&config.external_uri)?;
        let validator = crate::validator::Validator::new(
            std::time::Duration::from_secs(config.validation_timeout_secs));
        Ok(Server {
            urls: UrlBuilder::new(external),
            nonces: replay::NonceRegistry::new(store.clone()),
            issuance: issuance::IssuancePool::new(config.finalize_workers),
            config,
            store,
            ca,
            profiles,
            validator,
        })
    }

    pub fn urls(&self) -> &UrlBuilder {
        &self.urls
    }

    pub async fn new_nonce(&self) -> ACMEResult<String> {
        self.nonces.issue().await
    }

    pub async fn directory(&self, scope: &Scope) -> ACMEResult<types::directory::Directory> {
        let profile = self.resolve_profile(scope).await?;
        Ok(types::directory::Directory {
            new_nonce: self.urls.new_nonce(scope),
            new_account: Some(self.urls.new_account(scope)),
            new_order: Some(self.urls.new_order(scope)),
            new_authz: Some(self.urls.new_authz(scope)),
            revoke_cert: Some(self.urls.revoke_cert(scope)),
            key_change: Some(self.urls.key_change(scope)),
            meta: Some(types::directory::Meta {
                terms_of_service: profile.terms_of_service_url.clone()
                    .or_else(|| self.config.tos_uri.clone()),
                website: profile.website_url.clone()
                    .or_else(|| self.config.website_uri.clone()),
                caa_identities: self.config.caa_identities.clone(),
                external_account_required: Some(false),
            }),
        })
    }

    /// Maps an error into a full response carrying a fresh nonce, for the
    /// embedding HTTP layer.
    pub async fn problem_response(&self, error: types::error::Error) -> AcmeResponse<types::error::Error> {
        let nonce = match self.nonces.issue().await {
            Ok(v) => v,
            Err(err) => {
                error!("Unable to issue a nonce for an error response: {}", err.detail);
                String::new()
            }
        };
        let status = error.status;
        AcmeResponse::new(status, error, nonce)
    }

    pub(crate) async fn resolve_profile(&self, scope: &Scope) -> ACMEResult<crate::profile::Profile> {
        match self.profiles.by_name(scope.profile_name()).await {
            Ok(Some(p)) => Ok(p),
            Ok(None) => Err(types::error::Error {
                error_type: types::error::Type::ProfileNotFound,
                status: 400,
                title: "Profile not found".to_string(),
                detail: format!("Given profile name '{}' does not exist", scope.profile_name()),
                sub_problems: vec![],
                instance: None,
                identifier: None,
            }),
            Err(err) => {
                error!("Unable to look up profile '{}': {}", scope.profile_name(), err);
                Err(internal_server_error!())
            }
        }
    }

    pub(crate) async fn authenticate<R: serde::de::DeserializeOwned + std::fmt::Debug>(
        &self, jws: &types::jose::FlattenedJWS, request_url: &str,
    ) -> ACMEResult<jws::JwsRequest<R>> {
        jws::JwsRequest::from_jws(jws, request_url, self.store.as_ref(), &self.nonces).await
    }

    pub(crate) async fn load_order(
        &self, id: &uuid::Uuid, account: &models::Account,
    ) -> ACMEResult<models::Order> {
        let order = try_store_result!(
            self.store.order(id).await, "Unable to fetch order: {}")?;
        let order = match order {
            Some(v) => v,
            None => {
                return Err(types::error::Error {
                    error_type: types::error::Type::Malformed,
                    status: 404,
                    title: "Not found".to_string(),
                    detail: "Order does not exist".to_string(),
                    sub_problems: vec![],
                    instance: None,
                    identifier: None,
                });
            }
        };
        if order.account != account.id {
            return Err(types::error::Error {
                error_type: types::error::Type::Unauthorized,
                status: 403,
                title: "Unauthorized".to_string(),
                detail: "Order does not belong to this account".to_string(),
                sub_problems: vec![],
                instance: None,
                identifier: None,
            });
        }
        Ok(order)
    }

    pub(crate) async fn load_authorization(
        &self, id: &uuid::Uuid, account: &models::Account,
    ) -> ACMEResult<models::Authorization> {
        let authorization = try_store_result!(
            self.store.authorization(id).await, "Unable to fetch authorization: {}")?;
        let authorization = match authorization {
            Some(v) => v,
            None => {
                return Err(types::error::Error {
                    error_type: types::error::Type::Malformed,
                    status: 404,
                    title: "Not found".to_string(),
                    detail: "Authorization does not exist".to_string(),
                    sub_problems: vec![],
                    instance: None,
                    identifier: None,
                });
            }
        };
        if authorization.account != account.id {
            return Err(types::error::Error {
                error_type: types::error::Type::Unauthorized,
                status: 403,
                title: "Unauthorized".to_string(),
                detail: "Authorization does not belong to this account".to_string(),
                sub_problems: vec![],
                instance: None,
                identifier: None,
            });
        }
        Ok(authorization)
    }

    pub(crate) async fn load_challenge(
        &self, id: &uuid::Uuid, account: &models::Account,
    ) -> ACMEResult<(models::Challenge, models::Authorization)> {
        let challenge = try_store_result!(
            self.store.challenge(id).await, "Unable to fetch challenge: {}")?;
        let challenge = match challenge {
            Some(v) => v,
            None => {
                return Err(types::error::Error {
                    error_type: types::error::Type::Malformed,
                    status: 404,
                    title: "Not found".to_string(),
                    detail: "Challenge does not exist".to_string(),
                    sub_problems: vec![],
                    instance: None,
                    identifier: None,
                });
            }
        };
        let authorization = self.load_authorization(&challenge.authorization, account).await?;
        Ok((challenge, authorization))
    }
}

pub(crate) async fn lookup_account(
    kid: &str, store: &dyn crate::store::Store,
) -> ACMEResult<Option<models::Account>> {
    let kid_url = match url::Url::parse(kid) {
        Ok(v) => v,
        Err(err) => {
            return Err(types::error::Error {
                error_type: types::error::Type::Malformed,
                status: 400,
                title: "Bad kid".to_string(),
                detail: format!("Invalid kid URL format: {}", err),
                sub_problems: vec![],
                instance: None,
                identifier: None,
            });
        }
    };
    let kid_str = match kid_url.path_segments().and_then(|s| s.last()) {
        Some(v) => v,
        None => {
            return Err(types::error::Error {
                error_type: types::error::Type::Malformed,
                status: 400,
                title: "Bad kid".to_string(),
                detail: "Invalid kid format".to_string(),
                sub_problems: vec![],
                instance: None,
                identifier: None,
            });
        }
    };
    let kid_uuid = decode_id!(kid_str)?;

    let existing_account = try_store_result!(
        store.account(&kid_uuid).await, "Unable to search for existing account: {}")?;

    let existing_account = match existing_account {
        Some(v) => v,
        None => {
            return Ok(None);
        }
    };

    if existing_account.status == models::AccountStatus::Deactivated {
        return Err(types::error::Error {
            error_type: types::error::Type::AccountDeactivated,
            status: 401,
            title: "Unauthorized".to_string(),
            detail: format!("Account '{}' has been deactivated", kid),
            sub_problems: vec![],
            instance: None,
            identifier: None,
        });
    }

    Ok(Some(existing_account))
}

pub(crate) fn check_account(aid: &str, account: &models::Account) -> ACMEResult<()> {
    let aid_uuid = decode_id!(aid)?;

    if aid_uuid != account.id {
        return Err(types::error::Error {
            error_type: types::error::Type::Unauthorized,
            status: 400,
            title: "Unauthorized".to_string(),
            detail: "Signing key does not match account URL".to_string(),
            sub_problems: vec![],
            instance: None,
            identifier: None,
        });
    }

    Ok(())
}
