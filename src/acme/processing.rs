//! Account, order, authorization and challenge operations.

use std::collections::HashSet;
use std::convert::TryFrom;

use chrono::prelude::*;

use super::{models, AcmeResponse, ACMEResult, Scope};
use crate::store::Batch;
use crate::types;

impl super::Server {
    pub async fn new_account(
        &self, scope: &Scope, jws: &types::jose::FlattenedJWS,
    ) -> ACMEResult<AcmeResponse<types::account::Account>> {
        let profile = self.resolve_profile(scope).await?;
        let url = self.urls.new_account(scope);
        let request: super::jws::JwsRequest<types::account::AccountCreate> =
            self.authenticate(jws, &url).await?;
        let key = ensure_request_key_jwk!(request.key);
        let payload = ensure_not_post_as_get!(request.payload);

        let public_key = match key.public_key_to_der() {
            Ok(v) => v,
            Err(err) => {
                error!("Unable to encode account key: {}", err);
                return Err(internal_server_error!());
            }
        };

        let existing = try_store_result!(
            self.store.account_by_key(&public_key).await,
            "Unable to search for existing account: {}")?;
        if let Some(existing) = existing {
            let nonce = self.nonces.issue().await?;
            let location = existing.kid(&self.urls, scope);
            return Ok(AcmeResponse::new(200, existing.to_json(&self.urls, scope), nonce)
                .with_location(location));
        }

        if payload.only_return_existing {
            return Err(types::error::Error {
                error_type: types::error::Type::AccountDoesNotExist,
                status: 400,
                title: "Account does not exist".to_string(),
                detail: "No account exists with the provided key, and the onlyReturnExisting field was set".to_string(),
                sub_problems: vec![],
                instance: None,
                identifier: None,
            });
        }

        if profile.require_terms_of_service && !payload.terms_of_service_agreed {
            return Err(types::error::Error {
                error_type: types::error::Type::TermsOfServiceNotAgreed,
                status: 403,
                title: "Terms of service not agreed".to_string(),
                detail: "Terms of service must be agreed to before registering".to_string(),
                sub_problems: vec![],
                instance: profile.terms_of_service_url.clone()
                    .or_else(|| self.config.tos_uri.clone()),
                identifier: None,
            });
        }

        let contacts = models::parse_contacts(&payload.contact)?;
        if profile.require_contact && contacts.is_empty() {
            return Err(types::error::Error {
                error_type: types::error::Type::InvalidContact,
                status: 400,
                title: "Invalid contact".to_string(),
                detail: "A contact address is required by this profile".to_string(),
                sub_problems: vec![],
                instance: None,
                identifier: None,
            });
        }

        let now = Utc::now();
        let account = models::Account {
            id: uuid::Uuid::new_v4(),
            created_at: now,
            tos_agreed_at: if payload.terms_of_service_agreed {
                Some(now)
            } else {
                None
            },
            status: models::AccountStatus::Valid,
            public_key,
            contacts,
            profile: profile.name.clone(),
        };
        try_store_result!(self.store.commit(Batch {
            accounts: vec![account.clone()],
            ..Default::default()
        }).await, "Unable to save account: {}")?;

        info!("Registered account {} under profile {}", account.id, profile.name);
        let nonce = self.nonces.issue().await?;
        let location = account.kid(&self.urls, scope);
        Ok(AcmeResponse::new(201, account.to_json(&self.urls, scope), nonce)
            .with_location(location))
    }

    pub async fn account(
        &self, scope: &Scope, aid: &str, jws: &types::jose::FlattenedJWS,
    ) -> ACMEResult<AcmeResponse<types::account::Account>> {
        let profile = self.resolve_profile(scope).await?;
        let aid_uuid = decode_id!(aid)?;
        let url = self.urls.account(scope, &aid_uuid);
        let request: super::jws::JwsRequest<types::account::AccountUpdate> =
            self.authenticate(jws, &url).await?;
        let mut account = ensure_request_key_kid!(request.key);
        super::check_account(aid, &account)?;

        let payload = match request.payload {
            Some(v) => v,
            None => {
                let nonce = self.nonces.issue().await?;
                return Ok(AcmeResponse::new(200, account.to_json(&self.urls, scope), nonce)
                    .with_location(url));
            }
        };

        if let Some(status) = payload.status {
            if payload.contact.is_some() {
                return Err(types::error::Error {
                    error_type: types::error::Type::Malformed,
                    status: 400,
                    title: "Bad request".to_string(),
                    detail: "'status' can only be updated on its own".to_string(),
                    sub_problems: vec![],
                    instance: None,
                    identifier: None,
                });
            }
            if status != types::account::Status::Deactivated {
                return Err(types::error::Error {
                    error_type: types::error::Type::Malformed,
                    status: 400,
                    title: "Bad request".to_string(),
                    detail: "'status' can only be set to 'deactivated'".to_string(),
                    sub_problems: vec![],
                    instance: None,
                    identifier: None,
                });
            }
            let account = self.deactivate_account(account).await?;
            info!("Deactivated account {}", account.id);
            let nonce = self.nonces.issue().await?;
            return Ok(AcmeResponse::new(200, account.to_json(&self.urls, scope), nonce)
                .with_location(url));
        }

        if let Some(contact) = payload.contact {
            let contacts = models::parse_contacts(&contact)?;
            if profile.require_contact && contacts.is_empty() {
                return Err(types::error::Error {
                    error_type: types::error::Type::InvalidContact,
                    status: 400,
                    title: "Invalid contact".to_string(),
                    detail: "A contact address is required by this profile".to_string(),
                    sub_problems: vec![],
                    instance: None,
                    identifier: None,
                });
            }
            account.contacts = contacts;
            try_store_result!(self.store.commit(Batch {
                accounts: vec![account.clone()],
                ..Default::default()
            }).await, "Unable to save account: {}")?;
        }

        let nonce = self.nonces.issue().await?;
        Ok(AcmeResponse::new(200, account.to_json(&self.urls, scope), nonce)
            .with_location(url))
    }

    /// Deactivation takes the whole account graph down in one commit:
    /// non-terminal orders become invalid, their authorizations deactivated,
    /// live challenges invalid.
    async fn deactivate_account(
        &self, mut account: models::Account,
    ) -> ACMEResult<models::Account> {
        let orders = try_store_result!(
            self.store.orders_by_account(&account.id).await,
            "Unable to fetch orders: {}")?;
        let authorization_lists = try_store_result!(
            futures::future::try_join_all(
                orders.iter().map(|o| self.store.authorizations_by_order(&o.id))).await,
            "Unable to fetch authorizations: {}")?;
        let authorizations: Vec<_> = authorization_lists.into_iter().flatten().collect();
        let challenge_lists = try_store_result!(
            futures::future::try_join_all(
                authorizations.iter().map(|a| self.store.challenges_by_authorization(&a.id))).await,
            "Unable to fetch challenges: {}")?;

        let mut batch = Batch::default();
        for mut order in orders {
            if !matches!(order.status, models::OrderStatus::Valid | models::OrderStatus::Invalid) {
                order.transition(models::OrderStatus::Invalid);
                batch.orders.push(order);
            }
        }
        for mut authorization in authorizations {
            if matches!(authorization.status,
                        models::AuthorizationStatus::Pending | models::AuthorizationStatus::Valid) {
                authorization.transition(models::AuthorizationStatus::Deactivated);
                batch.authorizations.push(authorization);
            }
        }
        for mut challenge in challenge_lists.into_iter().flatten() {
            if matches!(challenge.status,
                        models::ChallengeStatus::Pending | models::ChallengeStatus::Valid) {
                challenge.transition(models::ChallengeStatus::Invalid);
                batch.challenges.push(challenge);
            }
        }
        account.status = models::AccountStatus::Deactivated;
        batch.accounts.push(account.clone());

        try_store_result!(self.store.commit(batch).await,
                          "Unable to save deactivated account: {}")?;
        Ok(account)
    }

    pub async fn new_order(
        &self, scope: &Scope, jws: &types::jose::FlattenedJWS,
    ) -> ACMEResult<AcmeResponse<types::order::Order>> {
        let profile = self.resolve_profile(scope).await?;
        let url = self.urls.new_order(scope);
        let request: super::jws::JwsRequest<types::order::OrderCreate> =
            self.authenticate(jws, &url).await?;
        let account = ensure_request_key_kid!(request.key);
        let payload = ensure_not_post_as_get!(request.payload);

        if payload.identifiers.is_empty() {
            return Err(types::error::Error {
                error_type: types::error::Type::Malformed,
                status: 400,
                title: "Bad request".to_string(),
                detail: "At least one identifier must be specified".to_string(),
                sub_problems: vec![],
                instance: None,
                identifier: None,
            });
        }

        let mut errors = vec![];
        for identifier in &payload.identifiers {
            match types::identifier::Type::from_str(&identifier.id_type) {
                Some(types::identifier::Type::DNS) => {}
                _ => {
                    errors.push(types::error::Error {
                        error_type: types::error::Type::UnsupportedIdentifier,
                        status: 400,
                        title: "Unsupported identifier".to_string(),
                        detail: format!("'{}' is not a supported identifier type",
                                        identifier.id_type),
                        sub_problems: vec![],
                        instance: None,
                        identifier: Some(identifier.clone()),
                    });
                }
            }
        }
        crate::util::error_list_to_result(errors, "Errors validating identifiers".to_string())?;

        let mut seen = HashSet::new();
        let identifiers: Vec<_> = payload.identifiers.into_iter()
            .filter(|i| seen.insert((i.id_type.clone(), i.value.clone())))
            .collect();

        let now = Utc::now();
        let validity = profile.validity_secs.unwrap_or(self.config.default_validity_secs);
        let expires_at = now + chrono::Duration::seconds(validity as i64);

        let order = models::Order {
            id: uuid::Uuid::new_v4(),
            account: account.id,
            created_at: now,
            expires_at,
            status: models::OrderStatus::Pending,
            identifiers: identifiers.clone(),
            not_before: payload.not_before,
            not_after: payload.not_after,
            certificate_id: None,
            error: None,
        };

        let mut batch = Batch {
            orders: vec![order.clone()],
            ..Default::default()
        };
        for identifier in identifiers {
            let wildcard = identifier.value.starts_with("*.");
            let authorization = models::Authorization {
                id: uuid::Uuid::new_v4(),
                order: order.id,
                account: account.id,
                created_at: now,
                expires_at,
                status: models::AuthorizationStatus::Pending,
                identifier: types::identifier::Identifier {
                    id_type: identifier.id_type,
                    value: identifier.value.trim_start_matches("*.").to_string(),
                },
                wildcard,
            };
            for challenge_type in [models::ChallengeType::Http01, models::ChallengeType::Dns01] {
                batch.challenges.push(models::Challenge {
                    id: uuid::Uuid::new_v4(),
                    authorization: authorization.id,
                    created_at: now,
                    challenge_type,
                    token: models::new_token()?,
                    status: models::ChallengeStatus::Pending,
                    validated_at: None,
                    error: None,
                });
            }
            batch.authorizations.push(authorization);
        }
        let authorizations = batch.authorizations.clone();
        try_store_result!(self.store.commit(batch).await, "Unable to save order: {}")?;

        let nonce = self.nonces.issue().await?;
        let location = self.urls.order(scope, &order.id);
        Ok(AcmeResponse::new(201, order.to_json(&authorizations, &self.urls, scope), nonce)
            .with_location(location))
    }

    pub async fn order(
        &self, scope: &Scope, oid: &str, jws: &types::jose::FlattenedJWS,
    ) -> ACMEResult<AcmeResponse<types::order::Order>> {
        let profile = self.resolve_profile(scope).await?;
        let oid_uuid = decode_id!(oid)?;
        let url = self.urls.order(scope, &oid_uuid);
        let request: super::jws::JwsRequest<serde_json::Value> =
            self.authenticate(jws, &url).await?;
        let account = ensure_request_key_kid!(request.key);
        ensure_post_as_get!(request.payload);

        let mut order = self.load_order(&oid_uuid, &account).await?;
        if order.expire_if_due(Utc::now()) {
            try_store_result!(self.store.commit(Batch {
                orders: vec![order.clone()],
                ..Default::default()
            }).await, "Unable to save expired order: {}")?;
        }

        let authorizations = try_store_result!(
            self.store.authorizations_by_order(&order.id).await,
            "Unable to fetch authorizations: {}")?;
        let nonce = self.nonces.issue().await?;
        let mut response = AcmeResponse::new(
            200, order.to_json(&authorizations, &self.urls, scope), nonce)
            .with_location(url);
        if order.status == models::OrderStatus::Processing {
            response = response.with_retry_after(profile.retry_interval_secs);
        }
        Ok(response)
    }

    pub async fn order_list(
        &self, scope: &Scope, aid: &str, jws: &types::jose::FlattenedJWS,
    ) -> ACMEResult<AcmeResponse<types::order::List>> {
        self.resolve_profile(scope).await?;
        let aid_uuid = decode_id!(aid)?;
        let url = self.urls.account_orders(scope, &aid_uuid);
        let request: super::jws::JwsRequest<serde_json::Value> =
            self.authenticate(jws, &url).await?;
        let account = ensure_request_key_kid!(request.key);
        super::check_account(aid, &account)?;
        ensure_post_as_get!(request.payload);

        let mut orders = try_store_result!(
            self.store.orders_by_account(&account.id).await,
            "Unable to fetch orders: {}")?;
        let now = Utc::now();
        let mut batch = Batch::default();
        for order in orders.iter_mut() {
            if order.expire_if_due(now) {
                batch.orders.push(order.clone());
            }
        }
        if !batch.is_empty() {
            try_store_result!(self.store.commit(batch).await,
                              "Unable to save expired orders: {}")?;
        }

        let nonce = self.nonces.issue().await?;
        Ok(AcmeResponse::new(200, types::order::List {
            orders: orders.iter().map(|o| self.urls.order(scope, &o.id)).collect(),
        }, nonce))
    }

    pub async fn new_authz(
        &self, scope: &Scope, jws: &types::jose::FlattenedJWS,
    ) -> ACMEResult<AcmeResponse<types::authorization::Authorization>> {
        self.resolve_profile(scope).await?;
        let url = self.urls.new_authz(scope);
        let request: super::jws::JwsRequest<serde_json::Value> =
            self.authenticate(jws, &url).await?;
        ensure_request_key_kid!(request.key);
        Err(types::error::Error {
            error_type: types::error::Type::Malformed,
            status: 403,
            title: "Unsupported".to_string(),
            detail: "Pre-authorization is not supported".to_string(),
            sub_problems: vec![],
            instance: None,
            identifier: None,
        })
    }

    pub async fn authorization(
        &self, scope: &Scope, auth_id: &str, jws: &types::jose::FlattenedJWS,
    ) -> ACMEResult<AcmeResponse<types::authorization::Authorization>> {
        self.resolve_profile(scope).await?;
        let auth_uuid = decode_id!(auth_id)?;
        let url = self.urls.authorization(scope, &auth_uuid);
        let request: super::jws::JwsRequest<types::authorization::AuthorizationUpdate> =
            self.authenticate(jws, &url).await?;
        let account = ensure_request_key_kid!(request.key);

        let mut authorization = self.load_authorization(&auth_uuid, &account).await?;
        if authorization.expire_if_due(Utc::now()) {
            try_store_result!(self.store.commit(Batch {
                authorizations: vec![authorization.clone()],
                ..Default::default()
            }).await, "Unable to save expired authorization: {}")?;
        }

        if let Some(payload) = request.payload {
            match payload.status {
                Some(types::authorization::Status::Deactivated) => {
                    if !matches!(authorization.status,
                                 models::AuthorizationStatus::Pending
                                     | models::AuthorizationStatus::Valid) {
                        return Err(types::error::Error {
                            error_type: types::error::Type::Malformed,
                            status: 400,
                            title: "Bad request".to_string(),
                            detail: "Only pending or valid authorizations can be deactivated".to_string(),
                            sub_problems: vec![],
                            instance: None,
                            identifier: None,
                        });
                    }
                    authorization.transition(models::AuthorizationStatus::Deactivated);
                    try_store_result!(self.store.commit(Batch {
                        authorizations: vec![authorization.clone()],
                        ..Default::default()
                    }).await, "Unable to save authorization: {}")?;
                }
                _ => {
                    return Err(types::error::Error {
                        error_type: types::error::Type::Malformed,
                        status: 400,
                        title: "Bad request".to_string(),
                        detail: "'status' can only be set to 'deactivated'".to_string(),
                        sub_problems: vec![],
                        instance: None,
                        identifier: None,
                    });
                }
            }
        }

        let challenges = try_store_result!(
            self.store.challenges_by_authorization(&authorization.id).await,
            "Unable to fetch challenges: {}")?;
        let nonce = self.nonces.issue().await?;
        Ok(AcmeResponse::new(
            200, authorization.to_json(&challenges, &self.urls, scope), nonce)
            .with_location(url))
    }

    pub async fn challenge(
        &self, scope: &Scope, chall_id: &str, jws: &types::jose::FlattenedJWS,
    ) -> ACMEResult<AcmeResponse<types::challenge::Challenge>> {
        let profile = self.resolve_profile(scope).await?;
        let chall_uuid = decode_id!(chall_id)?;
        let url = self.urls.challenge(scope, &chall_uuid);
        let request: super::jws::JwsRequest<types::challenge::ChallengeRespond> =
            self.authenticate(jws, &url).await?;
        let account = ensure_request_key_kid!(request.key);

        let (mut challenge, mut authorization) =
            self.load_challenge(&chall_uuid, &account).await?;
        if authorization.expire_if_due(Utc::now()) {
            try_store_result!(self.store.commit(Batch {
                authorizations: vec![authorization.clone()],
                ..Default::default()
            }).await, "Unable to save expired authorization: {}")?;
        }

        let authorization_url = self.urls.authorization(scope, &authorization.id);
        let retry_interval = profile.retry_interval_secs;
        let respond = |challenge: &models::Challenge, nonce: String| {
            let mut response = AcmeResponse::new(
                200, challenge.to_json(&self.urls, scope), nonce)
                .with_location(url.clone())
                .with_link(authorization_url.clone(), "up");
            if challenge.status == models::ChallengeStatus::Pending {
                response = response.with_retry_after(retry_interval);
            }
            response
        };

        if request.payload.is_none()
            || challenge.status != models::ChallengeStatus::Pending
            || authorization.status != models::AuthorizationStatus::Pending {
            let nonce = self.nonces.issue().await?;
            return Ok(respond(&challenge, nonce));
        }

        let account_key = account.pkey()?;
        let jwk = match types::jose::JWK::try_from(&account_key) {
            Ok(v) => v,
            Err(err) => {
                error!("Unable to build JWK for account {}: {}", account.id, err);
                return Err(internal_server_error!());
            }
        };
        let thumbprint = super::jws::make_jwk_thumbprint(&jwk)?;
        let key_authorization = crate::validator::key_authorization(
            &challenge.token, &thumbprint);
        let domain = authorization.identifier.value.clone();

        let verdict = match challenge.challenge_type {
            models::ChallengeType::Http01 => {
                self.validator.validate_http01(
                    &domain, &challenge.token, &key_authorization).await?
            }
            models::ChallengeType::Dns01 => {
                let digest = crate::validator::dns_txt_digest(&key_authorization)?;
                let resolver = profile.dns_resolver_ip
                    .map(|ip| (ip, profile.dns_resolver_port.unwrap_or(53)));
                self.validator.validate_dns01(&domain, &digest, resolver).await?
            }
        };

        match verdict {
            crate::validator::Verdict::Pass => {
                challenge.transition(models::ChallengeStatus::Valid);
                challenge.validated_at = Some(Utc::now());
                authorization.transition(models::AuthorizationStatus::Valid);

                let mut batch = Batch {
                    challenges: vec![challenge.clone()],
                    authorizations: vec![authorization.clone()],
                    ..Default::default()
                };
                let mut order = try_store_result!(
                    self.store.order(&authorization.order).await,
                    "Unable to fetch order: {}")?;
                if let Some(order) = order.as_mut() {
                    let siblings = try_store_result!(
                        self.store.authorizations_by_order(&order.id).await,
                        "Unable to fetch authorizations: {}")?;
                    let all_valid = siblings.iter().all(|a| {
                        if a.id == authorization.id {
                            true
                        } else {
                            a.status == models::AuthorizationStatus::Valid
                        }
                    });
                    if all_valid && order.transition(models::OrderStatus::Ready) {
                        batch.orders.push(order.clone());
                    }
                }
                try_store_result!(self.store.commit(batch).await,
                                  "Unable to save challenge outcome: {}")?;
                info!("Challenge {} validated for {}", challenge.id, domain);
            }
            crate::validator::Verdict::Fail(problem) => {
                info!("Challenge {} failed for {}: {}", challenge.id, domain, problem.detail);
                challenge.error = Some(problem);
                challenge.transition(models::ChallengeStatus::Invalid);
                try_store_result!(self.store.commit(Batch {
                    challenges: vec![challenge.clone()],
                    ..Default::default()
                }).await, "Unable to save challenge outcome: {}")?;
            }
        }

        let nonce = self.nonces.issue().await?;
        Ok(respond(&challenge, nonce))
    }

    pub async fn key_change(
        &self, scope: &Scope, jws: &types::jose::FlattenedJWS,
    ) -> ACMEResult<AcmeResponse<types::account::Account>> {
        self.resolve_profile(scope).await?;
        let url = self.urls.key_change(scope);
        let request: super::jws::JwsRequest<types::jose::FlattenedJWS> =
            self.authenticate(jws, &url).await?;
        let _requesting_account = ensure_request_key_kid!(request.key);
        let inner = ensure_not_post_as_get!(request.payload);

        let (payload, new_key, _new_jwk) =
            super::jws::decode_inner_jws::<types::account::KeyChange>(&inner, &url)?;

        let mut target = match super::lookup_account(&payload.account, self.store.as_ref()).await? {
            Some(v) => v,
            None => {
                return Err(types::error::Error {
                    error_type: types::error::Type::AccountDoesNotExist,
                    status: 400,
                    title: "Account does not exist".to_string(),
                    detail: format!("No account can be found with the ID {}", payload.account),
                    sub_problems: vec![],
                    instance: None,
                    identifier: None,
                });
            }
        };

        let old_key = match openssl::pkey::PKey::try_from(&payload.old_key) {
            Ok(v) => v,
            Err(err) => {
                return Err(types::error::Error {
                    error_type: types::error::Type::BadPublicKey,
                    status: 400,
                    title: "Bad public key".to_string(),
                    detail: err,
                    sub_problems: vec![],
                    instance: None,
                    identifier: None,
                });
            }
        };
        let stored_key = target.pkey()?;
        if !old_key.public_eq(&stored_key) {
            return Err(types::error::Error {
                error_type: types::error::Type::Malformed,
                status: 400,
                title: "Bad request".to_string(),
                detail: "Old key does not match the account key".to_string(),
                sub_problems: vec![],
                instance: None,
                identifier: None,
            });
        }

        let new_der = match new_key.public_key_to_der() {
            Ok(v) => v,
            Err(err) => {
                error!("Unable to encode replacement key: {}", err);
                return Err(internal_server_error!());
            }
        };
        if new_der == target.public_key {
            return Err(types::error::Error {
                error_type: types::error::Type::Malformed,
                status: 400,
                title: "Bad request".to_string(),
                detail: "New and old keys must be different".to_string(),
                sub_problems: vec![],
                instance: None,
                identifier: None,
            });
        }

        let conflicting = try_store_result!(
            self.store.account_by_key(&new_der).await,
            "Unable to search for existing account: {}")?;
        if let Some(conflicting) = conflicting {
            return Err(types::error::Error {
                error_type: types::error::Type::KeyExists,
                status: 409,
                title: "Key exists".to_string(),
                detail: "An account already exists with the provided key".to_string(),
                sub_problems: vec![],
                instance: Some(conflicting.kid(&self.urls, scope)),
                identifier: None,
            });
        }

        target.public_key = new_der;
        try_store_result!(self.store.commit(Batch {
            accounts: vec![target.clone()],
            ..Default::default()
        }).await, "Unable to save account: {}")?;

        info!("Rolled over key for account {}", target.id);
        let nonce = self.nonces.issue().await?;
        let location = target.kid(&self.urls, scope);
        Ok(AcmeResponse::new(200, target.to_json(&self.urls, scope), nonce)
            .with_location(location))
    }
}
