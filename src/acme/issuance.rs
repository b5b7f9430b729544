//! Finalization and the background issuance pool.

use std::collections::HashSet;
use std::sync::Arc;

use base64::prelude::*;
use chrono::prelude::*;

use super::{csr, models, AcmeResponse, ACMEResult, Scope};
use crate::types;

fn bad_csr(detail: String) -> types::error::Error {
    types::error::Error {
        error_type: types::error::Type::BadCSR,
        status: 400,
        title: "Bad CSR".to_string(),
        detail,
        sub_problems: vec![],
        instance: None,
        identifier: None,
    }
}

/// Hands CSRs to the upstream CA from a bounded number of concurrent tasks.
/// `submit` returns immediately; the receiver resolves when the order reaches
/// a terminal state.
pub struct IssuancePool {
    permits: Arc<tokio::sync::Semaphore>,
}

impl IssuancePool {
    pub fn new(workers: usize) -> IssuancePool {
        IssuancePool {
            permits: Arc::new(tokio::sync::Semaphore::new(std::cmp::max(workers, 1))),
        }
    }

    pub fn submit(
        &self, store: Arc<dyn crate::store::Store>,
        ca: Arc<dyn crate::ca::CertificateAuthority>,
        order: models::Order, csr_der: Vec<u8>,
    ) -> tokio::sync::oneshot::Receiver<ACMEResult<()>> {
        let (tx, rx) = tokio::sync::oneshot::channel();
        let permits = self.permits.clone();
        tokio::spawn(async move {
            let _permit = match permits.acquire_owned().await {
                Ok(v) => v,
                Err(_) => {
                    return;
                }
            };
            let result = issue_order(store.as_ref(), ca.as_ref(), order, &csr_der).await;
            let _ = tx.send(result);
        });
        rx
    }
}

async fn issue_order(
    store: &dyn crate::store::Store, ca: &dyn crate::ca::CertificateAuthority,
    mut order: models::Order, csr_der: &[u8],
) -> ACMEResult<()> {
    match ca.issue(csr_der, &order.identifiers).await {
        Ok(issued) => {
            order.certificate_id = Some(issued.id);
            order.transition(models::OrderStatus::Valid);
            try_store_result!(store.commit(crate::store::Batch {
                orders: vec![order],
                ..Default::default()
            }).await, "Unable to save issued order: {}")?;
            Ok(())
        }
        Err(err) => {
            warn!("Issuance for order {} failed: {}", order.id, err);
            let problem = match err {
                crate::ca::CaError::Rejected(detail) => bad_csr(detail),
                _ => internal_server_error!(),
            };
            order.error = Some(problem.clone());
            order.transition(models::OrderStatus::Invalid);
            try_store_result!(store.commit(crate::store::Batch {
                orders: vec![order],
                ..Default::default()
            }).await, "Unable to save failed order: {}")?;
            Err(problem)
        }
    }
}

/// Every order identifier must appear in CN union SAN, and DNS identifiers in
/// CN union dNSName SANs specifically.
fn validate_csr_names(
    info: &csr::CsrInfo, identifiers: &[types::identifier::Identifier],
) -> ACMEResult<()> {
    let mut sans: HashSet<&str> = info.sans.iter().map(|s| s.as_str()).collect();
    let mut dns_names: HashSet<&str> = info.dns_names.iter().map(|s| s.as_str()).collect();
    if let Some(cn) = &info.common_name {
        sans.insert(cn);
        dns_names.insert(cn);
    }

    let mut errors = vec![];
    for identifier in identifiers {
        let covered = sans.contains(identifier.value.as_str())
            && (identifier.id_type != "dns" || dns_names.contains(identifier.value.as_str()));
        if !covered {
            errors.push(types::error::Error {
                error_type: types::error::Type::BadCSR,
                status: 400,
                title: "Bad CSR".to_string(),
                detail: format!("CSR does not cover the identifier '{}'", identifier.value),
                sub_problems: vec![],
                instance: None,
                identifier: Some(identifier.clone()),
            });
        }
    }
    crate::util::error_list_to_result(errors, "CSR does not cover all order identifiers".to_string())
}

impl super::Server {
    pub async fn finalize_order(
        &self, scope: &Scope, oid: &str, jws: &types::jose::FlattenedJWS,
    ) -> ACMEResult<(AcmeResponse<types::order::Order>, tokio::sync::oneshot::Receiver<ACMEResult<()>>)> {
        let profile = self.resolve_profile(scope).await?;
        let oid_uuid = decode_id!(oid)?;
        let url = self.urls.finalize(scope, &oid_uuid);
        let request: super::jws::JwsRequest<types::order::OrderFinalize> =
            self.authenticate(jws, &url).await?;
        let account = ensure_request_key_kid!(request.key);
        let payload = ensure_not_post_as_get!(request.payload);

        let mut order = self.load_order(&oid_uuid, &account).await?;
        if order.expire_if_due(Utc::now()) {
            try_store_result!(self.store.commit(crate::store::Batch {
                orders: vec![order.clone()],
                ..Default::default()
            }).await, "Unable to save expired order: {}")?;
        }

        if order.status != models::OrderStatus::Ready {
            return Err(types::error::Error {
                error_type: types::error::Type::OrderNotReady,
                status: 403,
                title: "Order not ready".to_string(),
                detail: format!(
                    "Order status is '{}', it must be 'ready' to finalize",
                    format!("{:?}", order.status).to_lowercase()),
                sub_problems: vec![],
                instance: None,
                identifier: None,
            });
        }

        let csr_der = match BASE64_URL_SAFE_NO_PAD.decode(&payload.csr) {
            Ok(v) => v,
            Err(_) => {
                return Err(bad_csr("Invalid CSR encoding".to_string()));
            }
        };
        let csr_info = csr::parse(&csr_der)?;
        validate_csr_names(&csr_info, &order.identifiers)?;

        order.transition(models::OrderStatus::Processing);
        try_store_result!(self.store.commit(crate::store::Batch {
            orders: vec![order.clone()],
            ..Default::default()
        }).await, "Unable to save finalizing order: {}")?;

        let receiver = self.issuance.submit(
            self.store.clone(), self.ca.clone(), order.clone(), csr_der);

        let authorizations = try_store_result!(
            self.store.authorizations_by_order(&order.id).await,
            "Unable to fetch authorizations: {}")?;
        let nonce = self.nonces.issue().await?;
        let body = order.to_json(&authorizations, &self.urls, scope);
        Ok((
            AcmeResponse::new(200, body, nonce)
                .with_location(self.urls.order(scope, &order.id))
                .with_retry_after(profile.retry_interval_secs),
            receiver,
        ))
    }

    pub async fn certificate(
        &self, scope: &Scope, cert_id: &str, jws: &types::jose::FlattenedJWS,
    ) -> ACMEResult<AcmeResponse<String>> {
        self.resolve_profile(scope).await?;
        let url = self.urls.certificate(scope, cert_id);
        let request: super::jws::JwsRequest<serde_json::Value> =
            self.authenticate(jws, &url).await?;
        let account = ensure_request_key_kid!(request.key);
        ensure_post_as_get!(request.payload);

        let order = try_store_result!(
            self.store.order_by_certificate(cert_id).await,
            "Unable to fetch order: {}")?;
        let order = match order {
            Some(v) => v,
            None => {
                return Err(types::error::Error {
                    error_type: types::error::Type::Malformed,
                    status: 404,
                    title: "Not found".to_string(),
                    detail: "Certificate does not exist".to_string(),
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
                detail: "Certificate does not belong to this account".to_string(),
                sub_problems: vec![],
                instance: None,
                identifier: None,
            });
        }

        let chain = match self.ca.certificate_chain(cert_id).await {
            Ok(v) => v,
            Err(crate::ca::CaError::NotFound) => {
                return Err(types::error::Error {
                    error_type: types::error::Type::Malformed,
                    status: 404,
                    title: "Not found".to_string(),
                    detail: "Certificate does not exist".to_string(),
                    sub_problems: vec![],
                    instance: None,
                    identifier: None,
                });
            }
            Err(err) => {
                error!("Unable to fetch certificate chain: {}", err);
                return Err(internal_server_error!());
            }
        };

        let nonce = self.nonces.issue().await?;
        Ok(AcmeResponse::new(200, chain, nonce))
    }

    pub async fn revoke_certificate(
        &self, scope: &Scope, jws: &types::jose::FlattenedJWS,
    ) -> ACMEResult<AcmeResponse<()>> {
        self.resolve_profile(scope).await?;
        let url = self.urls.revoke_cert(scope);
        let request: super::jws::JwsRequest<types::certificate::CertificateRevocation> =
            self.authenticate(jws, &url).await?;
        let payload = ensure_not_post_as_get!(request.payload);

        let cert_der = match BASE64_URL_SAFE_NO_PAD.decode(&payload.certificate) {
            Ok(v) => v,
            Err(_) => {
                return Err(types::error::Error {
                    error_type: types::error::Type::Malformed,
                    status: 400,
                    title: "Bad request".to_string(),
                    detail: "Invalid certificate encoding".to_string(),
                    sub_problems: vec![],
                    instance: None,
                    identifier: None,
                });
            }
        };

        let certificate = match self.ca.certificate_by_der(&cert_der).await {
            Ok(v) => v,
            Err(crate::ca::CaError::NotFound) => {
                return Err(types::error::Error {
                    error_type: types::error::Type::Malformed,
                    status: 404,
                    title: "Not found".to_string(),
                    detail: "The certificate is not known to this server".to_string(),
                    sub_problems: vec![],
                    instance: None,
                    identifier: None,
                });
            }
            Err(err) => {
                error!("Unable to look up certificate: {}", err);
                return Err(internal_server_error!());
            }
        };

        if certificate.revoked {
            return Err(types::error::Error {
                error_type: types::error::Type::AlreadyRevoked,
                status: 400,
                title: "Already revoked".to_string(),
                detail: "The certificate has already been revoked".to_string(),
                sub_problems: vec![],
                instance: None,
                identifier: None,
            });
        }

        if let super::jws::JwsRequestKey::Jwk { key, .. } = &request.key {
            let cert_key = match openssl::pkey::PKey::public_key_from_der(
                &certificate.public_key_der) {
                Ok(v) => v,
                Err(err) => {
                    error!("CA returned an invalid public key: {}", err);
                    return Err(internal_server_error!());
                }
            };
            if !key.public_eq(&cert_key) {
                return Err(types::error::Error {
                    error_type: types::error::Type::BadPublicKey,
                    status: 403,
                    title: "Bad public key".to_string(),
                    detail: "Requests signed with the certificate key must use the key of the certificate being revoked".to_string(),
                    sub_problems: vec![],
                    instance: None,
                    identifier: None,
                });
            }
        }

        let reason_code = payload.reason.unwrap_or(0);
        let reason = match crate::ca::RevocationReason::from_code(reason_code) {
            Some(v) => v,
            None => {
                return Err(types::error::Error {
                    error_type: types::error::Type::BadRevocationReason,
                    status: 403,
                    title: "Bad revocation reason".to_string(),
                    detail: format!(
                        "Reason code {} is not allowed; allowed codes are 0-6 and 8-10",
                        reason_code),
                    sub_problems: vec![],
                    instance: None,
                    identifier: None,
                });
            }
        };

        match self.ca.revoke(&certificate.id, reason).await {
            Ok(()) => {}
            Err(crate::ca::CaError::Rejected(detail)) => {
                return Err(types::error::Error {
                    error_type: types::error::Type::Malformed,
                    status: 400,
                    title: "Revocation rejected".to_string(),
                    detail,
                    sub_problems: vec![],
                    instance: None,
                    identifier: None,
                });
            }
            Err(err) => {
                error!("Unable to revoke certificate: {}", err);
                return Err(internal_server_error!());
            }
        }

        let nonce = self.nonces.issue().await?;
        Ok(AcmeResponse::new(200, (), nonce))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn identifier(value: &str) -> types::identifier::Identifier {
        types::identifier::Identifier {
            id_type: "dns".to_string(),
            value: value.to_string(),
        }
    }

    #[test]
    fn csr_name_coverage() {
        let info = csr::CsrInfo {
            common_name: Some("example.com".to_string()),
            sans: vec!["www.example.com".to_string()],
            dns_names: vec!["www.example.com".to_string()],
        };
        validate_csr_names(&info, &[
            identifier("example.com"),
            identifier("www.example.com"),
        ]).unwrap();

        let err = validate_csr_names(&info, &[identifier("other.example.com")]).unwrap_err();
        assert_eq!(err.error_type, types::error::Type::BadCSR);
        assert_eq!(err.identifier, Some(identifier("other.example.com")));
    }

    #[test]
    fn dns_identifier_needs_dns_san() {
        // An email SAN alone cannot satisfy a dns identifier of the same value.
        let info = csr::CsrInfo {
            common_name: None,
            sans: vec!["example.com".to_string()],
            dns_names: vec![],
        };
        let err = validate_csr_names(&info, &[identifier("example.com")]).unwrap_err();
        assert_eq!(err.error_type, types::error::Type::BadCSR);
    }
}
