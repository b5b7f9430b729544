use std::collections::{HashMap, HashSet};
use std::convert::TryFrom;
use std::sync::Arc;

use base64::prelude::*;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use freyr::acme::{Scope, Server};
use freyr::ca::{CaCertificate, CaError, CertificateAuthority, IssuedCertificate, RevocationReason};
use freyr::profile::{Profile, StaticProfiles};
use freyr::store::MemoryStore;
use freyr::types;

const CHAIN_PEM: &str = "-----BEGIN CERTIFICATE-----\nMIIBfake\n-----END CERTIFICATE-----\n";

#[derive(Default)]
struct StubCaInner {
    chains: HashMap<String, String>,
    certificates: HashMap<Vec<u8>, CaCertificate>,
    revoked: HashSet<String>,
    issued: u64,
    reject_next: Option<String>,
}

#[derive(Default)]
struct StubCa {
    inner: tokio::sync::Mutex<StubCaInner>,
}

impl StubCa {
    async fn add_certificate(&self, der: Vec<u8>, public_key_der: Vec<u8>) -> String {
        let mut inner = self.inner.lock().await;
        inner.issued += 1;
        let id = format!("cert-{}", inner.issued);
        inner.chains.insert(id.clone(), CHAIN_PEM.to_string());
        inner.certificates.insert(der, CaCertificate {
            id: id.clone(),
            public_key_der,
            revoked: false,
        });
        id
    }
}

#[async_trait::async_trait]
impl CertificateAuthority for StubCa {
    async fn issue(
        &self, _csr_der: &[u8], _identifiers: &[types::identifier::Identifier],
    ) -> Result<IssuedCertificate, CaError> {
        let mut inner = self.inner.lock().await;
        if let Some(reason) = inner.reject_next.take() {
            return Err(CaError::Rejected(reason));
        }
        inner.issued += 1;
        let id = format!("cert-{}", inner.issued);
        inner.chains.insert(id.clone(), CHAIN_PEM.to_string());
        Ok(IssuedCertificate {
            id,
            chain_pem: CHAIN_PEM.to_string(),
        })
    }

    async fn certificate_by_der(&self, der: &[u8]) -> Result<CaCertificate, CaError> {
        let inner = self.inner.lock().await;
        match inner.certificates.get(der) {
            Some(cert) => {
                let mut cert = cert.clone();
                cert.revoked = inner.revoked.contains(&cert.id);
                Ok(cert)
            }
            None => Err(CaError::NotFound),
        }
    }

    async fn certificate_chain(&self, certificate_id: &str) -> Result<String, CaError> {
        let inner = self.inner.lock().await;
        inner.chains.get(certificate_id).cloned().ok_or(CaError::NotFound)
    }

    async fn revoke(&self, certificate_id: &str, _reason: RevocationReason) -> Result<(), CaError> {
        let mut inner = self.inner.lock().await;
        if !inner.chains.contains_key(certificate_id) {
            return Err(CaError::NotFound);
        }
        inner.revoked.insert(certificate_id.to_string());
        Ok(())
    }
}

fn server_with(profiles: Vec<Profile>) -> (Server, Arc<MemoryStore>, Arc<StubCa>) {
    let _ = pretty_env_logger::try_init();
    let config = freyr::config::Config {
        external_uri: "https://acme.test".to_string(),
        ..Default::default()
    };
    let store = Arc::new(MemoryStore::new());
    let ca = Arc::new(StubCa::default());
    let server = Server::new(
        config, store.clone(), ca.clone(),
        Arc::new(StaticProfiles::new(profiles))).unwrap();
    (server, store, ca)
}

fn default_server() -> (Server, Arc<MemoryStore>, Arc<StubCa>) {
    server_with(vec![Profile::default()])
}

fn scope() -> Scope {
    Scope::Profile("default".to_string())
}

fn new_key() -> openssl::pkey::PKey<openssl::pkey::Private> {
    let rsa = openssl::rsa::Rsa::generate(2048).unwrap();
    openssl::pkey::PKey::from_rsa(rsa).unwrap()
}

fn public_jwk(key: &openssl::pkey::PKey<openssl::pkey::Private>) -> types::jose::JWK {
    let public = openssl::pkey::PKey::public_key_from_der(
        &key.public_key_to_der().unwrap()).unwrap();
    types::jose::JWK::try_from(&public).unwrap()
}

enum KeyMode {
    Jwk,
    Kid(String),
}

fn sign(
    key: &openssl::pkey::PKey<openssl::pkey::Private>, mode: &KeyMode,
    nonce: Option<&str>, url: &str, payload: Option<&serde_json::Value>,
) -> types::jose::FlattenedJWS {
    let mut protected = serde_json::json!({
        "alg": "RS256",
        "url": url,
    });
    match mode {
        KeyMode::Jwk => {
            protected["jwk"] = serde_json::to_value(public_jwk(key)).unwrap();
        }
        KeyMode::Kid(kid) => {
            protected["kid"] = serde_json::json!(kid);
        }
    }
    if let Some(nonce) = nonce {
        protected["nonce"] = serde_json::json!(nonce);
    }
    let protected = BASE64_URL_SAFE_NO_PAD.encode(protected.to_string());
    let payload = match payload {
        Some(v) => BASE64_URL_SAFE_NO_PAD.encode(v.to_string()),
        None => String::new(),
    };
    let signed = format!("{}.{}", protected, payload);
    let mut signer = openssl::sign::Signer::new(
        openssl::hash::MessageDigest::sha256(), key).unwrap();
    let signature = signer.sign_oneshot_to_vec(signed.as_bytes()).unwrap();
    types::jose::FlattenedJWS {
        protected,
        payload,
        signature: BASE64_URL_SAFE_NO_PAD.encode(signature),
    }
}

async fn signed(
    server: &Server, key: &openssl::pkey::PKey<openssl::pkey::Private>,
    mode: KeyMode, url: &str, payload: Option<serde_json::Value>,
) -> types::jose::FlattenedJWS {
    let nonce = server.new_nonce().await.unwrap();
    sign(key, &mode, Some(&nonce), url, payload.as_ref())
}

fn tail(url: &str) -> String {
    url.rsplit('/').next().unwrap().to_string()
}

async fn register(
    server: &Server, key: &openssl::pkey::PKey<openssl::pkey::Private>,
) -> String {
    let url = server.urls().new_account(&scope());
    let jws = signed(server, key, KeyMode::Jwk, &url,
                     Some(serde_json::json!({"termsOfServiceAgreed": true}))).await;
    let response = server.new_account(&scope(), &jws).await.unwrap();
    assert_eq!(response.status, 201);
    response.location.unwrap()
}

async fn place_order(
    server: &Server, key: &openssl::pkey::PKey<openssl::pkey::Private>,
    kid: &str, domain: &str,
) -> (String, types::order::Order) {
    let url = server.urls().new_order(&scope());
    let jws = signed(server, key, KeyMode::Kid(kid.to_string()), &url,
                     Some(serde_json::json!({
                         "identifiers": [{"type": "dns", "value": domain}],
                     }))).await;
    let response = server.new_order(&scope(), &jws).await.unwrap();
    assert_eq!(response.status, 201);
    (response.location.unwrap(), response.body)
}

async fn fetch_authorization(
    server: &Server, key: &openssl::pkey::PKey<openssl::pkey::Private>,
    kid: &str, authorization_url: &str,
) -> types::authorization::Authorization {
    let jws = signed(server, key, KeyMode::Kid(kid.to_string()),
                     authorization_url, None).await;
    server.authorization(&scope(), &tail(authorization_url), &jws).await.unwrap().body
}

/// Serves the key authorization over a local HTTP listener and answers the
/// http-01 challenge on the order's sole authorization.
async fn pass_http01(
    server: &Server, key: &openssl::pkey::PKey<openssl::pkey::Private>,
    kid: &str, order: &types::order::Order, mock: &MockServer,
) {
    let authorization = fetch_authorization(server, key, kid, &order.authorizations[0]).await;
    let challenge = authorization.challenges.iter()
        .find(|c| c.challenge_type == types::challenge::Type::HTTP01).unwrap();
    let token = challenge.token.clone().unwrap();

    let thumbprint = freyr::acme::jws::make_jwk_thumbprint(&public_jwk(key)).unwrap();
    let key_authorization = freyr::validator::key_authorization(&token, &thumbprint);
    Mock::given(method("GET"))
        .and(path(format!("/.well-known/acme-challenge/{}", token)))
        .respond_with(ResponseTemplate::new(200).set_body_string(key_authorization))
        .mount(mock)
        .await;

    let jws = signed(server, key, KeyMode::Kid(kid.to_string()),
                     &challenge.url, Some(serde_json::json!({}))).await;
    let response = server.challenge(&scope(), &tail(&challenge.url), &jws).await.unwrap();
    assert_eq!(response.body.status, types::challenge::Status::Valid);
}

fn build_csr(cn: Option<&str>, dns_sans: &[&str]) -> Vec<u8> {
    let key = new_key();
    let mut builder = openssl::x509::X509ReqBuilder::new().unwrap();
    if let Some(cn) = cn {
        let mut name = openssl::x509::X509NameBuilder::new().unwrap();
        name.append_entry_by_nid(openssl::nid::Nid::COMMONNAME, cn).unwrap();
        let name = name.build();
        builder.set_subject_name(&name).unwrap();
    }
    builder.set_pubkey(&key).unwrap();
    if !dns_sans.is_empty() {
        let mut san = openssl::x509::extension::SubjectAlternativeName::new();
        for s in dns_sans {
            san.dns(s);
        }
        let ext = {
            let ctx = builder.x509v3_context(None);
            san.build(&ctx).unwrap()
        };
        let mut extensions = openssl::stack::Stack::new().unwrap();
        extensions.push(ext).unwrap();
        builder.add_extensions(&extensions).unwrap();
    }
    builder.sign(&key, openssl::hash::MessageDigest::sha256()).unwrap();
    builder.build().to_der().unwrap()
}

async fn poll_order(
    server: &Server, key: &openssl::pkey::PKey<openssl::pkey::Private>,
    kid: &str, order_url: &str,
) -> types::order::Order {
    let jws = signed(server, key, KeyMode::Kid(kid.to_string()), order_url, None).await;
    server.order(&scope(), &tail(order_url), &jws).await.unwrap().body
}

#[tokio::test]
async fn directory_lists_endpoints() {
    let (server, _, _) = default_server();
    let directory = server.directory(&scope()).await.unwrap();
    assert_eq!(directory.new_nonce, "https://acme.test/default/new-nonce");
    assert_eq!(directory.new_account.as_deref(), Some("https://acme.test/default/new-account"));
    assert_eq!(directory.meta.unwrap().external_account_required, Some(false));

    let ra_scope = Scope::RaProfile("default".to_string());
    let directory = server.directory(&ra_scope).await.unwrap();
    assert_eq!(directory.new_nonce, "https://acme.test/raProfile/default/new-nonce");
}

#[tokio::test]
async fn unknown_profile_rejected() {
    let (server, _, _) = default_server();
    let err = server.directory(&Scope::Profile("nope".to_string())).await.unwrap_err();
    assert_eq!(err.error_type, types::error::Type::ProfileNotFound);
    assert_eq!(err.status, 400);
}

#[tokio::test]
async fn registration_is_idempotent() {
    let (server, _, _) = default_server();
    let key = new_key();
    let kid = register(&server, &key).await;

    let url = server.urls().new_account(&scope());
    let jws = signed(&server, &key, KeyMode::Jwk, &url,
                     Some(serde_json::json!({"termsOfServiceAgreed": true}))).await;
    let response = server.new_account(&scope(), &jws).await.unwrap();
    assert_eq!(response.status, 200);
    assert_eq!(response.location.as_deref(), Some(kid.as_str()));
}

#[tokio::test]
async fn only_return_existing_without_account() {
    let (server, _, _) = default_server();
    let url = server.urls().new_account(&scope());
    let jws = signed(&server, &new_key(), KeyMode::Jwk, &url,
                     Some(serde_json::json!({"onlyReturnExisting": true}))).await;
    let err = server.new_account(&scope(), &jws).await.unwrap_err();
    assert_eq!(err.error_type, types::error::Type::AccountDoesNotExist);
}

#[tokio::test]
async fn profile_policy_enforced_on_registration() {
    let (server, _, _) = server_with(vec![Profile {
        name: "default".to_string(),
        require_contact: true,
        require_terms_of_service: true,
        ..Default::default()
    }]);
    let key = new_key();
    let url = server.urls().new_account(&scope());

    let jws = signed(&server, &key, KeyMode::Jwk, &url,
                     Some(serde_json::json!({}))).await;
    let err = server.new_account(&scope(), &jws).await.unwrap_err();
    assert_eq!(err.error_type, types::error::Type::TermsOfServiceNotAgreed);
    assert_eq!(err.status, 403);

    let jws = signed(&server, &key, KeyMode::Jwk, &url,
                     Some(serde_json::json!({"termsOfServiceAgreed": true}))).await;
    let err = server.new_account(&scope(), &jws).await.unwrap_err();
    assert_eq!(err.error_type, types::error::Type::InvalidContact);

    let jws = signed(&server, &key, KeyMode::Jwk, &url,
                     Some(serde_json::json!({
                         "termsOfServiceAgreed": true,
                         "contact": ["mailto:admin@example.com"],
                     }))).await;
    let response = server.new_account(&scope(), &jws).await.unwrap();
    assert_eq!(response.status, 201);
    assert_eq!(response.body.contact, vec!["mailto:admin@example.com"]);
}

#[tokio::test]
async fn nonce_reuse_rejected() {
    let (server, _, _) = default_server();
    let key = new_key();
    let url = server.urls().new_account(&scope());
    let nonce = server.new_nonce().await.unwrap();
    let payload = serde_json::json!({"termsOfServiceAgreed": true});

    let jws = sign(&key, &KeyMode::Jwk, Some(&nonce), &url, Some(&payload));
    server.new_account(&scope(), &jws).await.unwrap();

    let jws = sign(&key, &KeyMode::Jwk, Some(&nonce), &url, Some(&payload));
    let err = server.new_account(&scope(), &jws).await.unwrap_err();
    assert_eq!(err.error_type, types::error::Type::BadNonce);
}

#[tokio::test]
async fn full_issuance_flow() {
    let (server, _, _) = default_server();
    let key = new_key();
    let kid = register(&server, &key).await;

    let mock = MockServer::start().await;
    let domain = format!("{}", mock.address());
    let (order_url, order) = place_order(&server, &key, &kid, &domain).await;
    assert_eq!(order.status, types::order::Status::Pending);
    assert_eq!(order.authorizations.len(), 1);

    pass_http01(&server, &key, &kid, &order, &mock).await;

    let order = poll_order(&server, &key, &kid, &order_url).await;
    assert_eq!(order.status, types::order::Status::Ready);

    let csr = build_csr(Some(&domain), &[&domain]);
    let jws = signed(&server, &key, KeyMode::Kid(kid.clone()), &order.finalize,
                     Some(serde_json::json!({
                         "csr": BASE64_URL_SAFE_NO_PAD.encode(&csr),
                     }))).await;
    let (response, receiver) = server.finalize_order(
        &scope(), &tail(&order_url), &jws).await.unwrap();
    assert_eq!(response.body.status, types::order::Status::Processing);
    assert!(response.retry_after.is_some());

    receiver.await.unwrap().unwrap();

    let order = poll_order(&server, &key, &kid, &order_url).await;
    assert_eq!(order.status, types::order::Status::Valid);
    let certificate_url = order.certificate.unwrap();

    let jws = signed(&server, &key, KeyMode::Kid(kid.clone()), &certificate_url, None).await;
    let response = server.certificate(&scope(), &tail(&certificate_url), &jws).await.unwrap();
    assert!(response.body.contains("BEGIN CERTIFICATE"));
}

#[tokio::test]
async fn finalize_requires_ready_order() {
    let (server, _, _) = default_server();
    let key = new_key();
    let kid = register(&server, &key).await;
    let (order_url, order) = place_order(&server, &key, &kid, "example.com").await;

    let csr = build_csr(Some("example.com"), &["example.com"]);
    let jws = signed(&server, &key, KeyMode::Kid(kid.clone()), &order.finalize,
                     Some(serde_json::json!({
                         "csr": BASE64_URL_SAFE_NO_PAD.encode(&csr),
                     }))).await;
    let err = server.finalize_order(&scope(), &tail(&order_url), &jws).await.unwrap_err();
    assert_eq!(err.error_type, types::error::Type::OrderNotReady);
    assert_eq!(err.status, 403);
}

#[tokio::test]
async fn finalize_rejects_uncovered_identifiers() {
    let (server, _, _) = default_server();
    let key = new_key();
    let kid = register(&server, &key).await;

    let mock = MockServer::start().await;
    let domain = format!("{}", mock.address());
    let (order_url, order) = place_order(&server, &key, &kid, &domain).await;
    pass_http01(&server, &key, &kid, &order, &mock).await;

    let csr = build_csr(Some("unrelated.example.com"), &["unrelated.example.com"]);
    let jws = signed(&server, &key, KeyMode::Kid(kid.clone()), &order.finalize,
                     Some(serde_json::json!({
                         "csr": BASE64_URL_SAFE_NO_PAD.encode(&csr),
                     }))).await;
    let err = server.finalize_order(&scope(), &tail(&order_url), &jws).await.unwrap_err();
    assert_eq!(err.error_type, types::error::Type::BadCSR);

    // The order is untouched and can still be finalized correctly.
    let order = poll_order(&server, &key, &kid, &order_url).await;
    assert_eq!(order.status, types::order::Status::Ready);
}

#[tokio::test]
async fn cn_only_csr_accepted() {
    let (server, _, _) = default_server();
    let key = new_key();
    let kid = register(&server, &key).await;

    let mock = MockServer::start().await;
    let domain = format!("{}", mock.address());
    let (order_url, order) = place_order(&server, &key, &kid, &domain).await;
    pass_http01(&server, &key, &kid, &order, &mock).await;

    let csr = build_csr(Some(&domain), &[]);
    let jws = signed(&server, &key, KeyMode::Kid(kid.clone()), &order.finalize,
                     Some(serde_json::json!({
                         "csr": BASE64_URL_SAFE_NO_PAD.encode(&csr),
                     }))).await;
    let (response, receiver) = server.finalize_order(
        &scope(), &tail(&order_url), &jws).await.unwrap();
    assert_eq!(response.body.status, types::order::Status::Processing);
    receiver.await.unwrap().unwrap();
}

#[tokio::test]
async fn rejected_issuance_invalidates_order() {
    let (server, _, ca) = default_server();
    let key = new_key();
    let kid = register(&server, &key).await;

    let mock = MockServer::start().await;
    let domain = format!("{}", mock.address());
    let (order_url, order) = place_order(&server, &key, &kid, &domain).await;
    pass_http01(&server, &key, &kid, &order, &mock).await;

    ca.inner.lock().await.reject_next = Some("policy violation".to_string());

    let csr = build_csr(Some(&domain), &[&domain]);
    let jws = signed(&server, &key, KeyMode::Kid(kid.clone()), &order.finalize,
                     Some(serde_json::json!({
                         "csr": BASE64_URL_SAFE_NO_PAD.encode(&csr),
                     }))).await;
    let (_, receiver) = server.finalize_order(&scope(), &tail(&order_url), &jws).await.unwrap();
    let err = receiver.await.unwrap().unwrap_err();
    assert_eq!(err.error_type, types::error::Type::BadCSR);

    let order = poll_order(&server, &key, &kid, &order_url).await;
    assert_eq!(order.status, types::order::Status::Invalid);
    assert!(order.error.is_some());
}

#[tokio::test]
async fn unsupported_identifier_type_rejected() {
    let (server, _, _) = default_server();
    let key = new_key();
    let kid = register(&server, &key).await;

    let url = server.urls().new_order(&scope());
    let jws = signed(&server, &key, KeyMode::Kid(kid.clone()), &url,
                     Some(serde_json::json!({
                         "identifiers": [{"type": "ip", "value": "10.0.0.1"}],
                     }))).await;
    let err = server.new_order(&scope(), &jws).await.unwrap_err();
    assert_eq!(err.error_type, types::error::Type::UnsupportedIdentifier);
    assert!(err.identifier.is_some());
}

#[tokio::test]
async fn wildcard_orders_flag_their_authorizations() {
    let (server, _, _) = default_server();
    let key = new_key();
    let kid = register(&server, &key).await;
    let (_, order) = place_order(&server, &key, &kid, "*.example.com").await;

    let authorization = fetch_authorization(&server, &key, &kid, &order.authorizations[0]).await;
    assert_eq!(authorization.wildcard, Some(true));
    assert_eq!(authorization.identifier.value, "example.com");
    assert_eq!(authorization.challenges.len(), 2);
}

#[tokio::test]
async fn orders_expire_on_read() {
    let (server, _, _) = server_with(vec![Profile {
        name: "default".to_string(),
        validity_secs: Some(0),
        ..Default::default()
    }]);
    let key = new_key();
    let kid = register(&server, &key).await;
    let (order_url, _) = place_order(&server, &key, &kid, "example.com").await;

    tokio::time::sleep(std::time::Duration::from_millis(50)).await;

    let order = poll_order(&server, &key, &kid, &order_url).await;
    assert_eq!(order.status, types::order::Status::Invalid);

    let listed_order_url = {
        let jws = signed(&server, &key, KeyMode::Kid(kid.clone()),
                         &server.urls().account_orders(&scope(), &freyr::util::b64_to_uuid(&tail(&kid)).unwrap()),
                         None).await;
        let list = server.order_list(&scope(), &tail(&kid), &jws).await.unwrap().body;
        assert_eq!(list.orders.len(), 1);
        list.orders[0].clone()
    };
    assert_eq!(listed_order_url, order_url);
}

#[tokio::test]
async fn deactivation_cascades() {
    let (server, store, _) = default_server();
    let key = new_key();
    let kid = register(&server, &key).await;
    let (order_url, order) = place_order(&server, &key, &kid, "example.com").await;
    let authorization_url = order.authorizations[0].clone();
    let authorization = fetch_authorization(&server, &key, &kid, &authorization_url).await;
    let challenge_url = authorization.challenges[0].url.clone();

    let jws = signed(&server, &key, KeyMode::Kid(kid.clone()), &kid,
                     Some(serde_json::json!({"status": "deactivated"}))).await;
    let response = server.account(&scope(), &tail(&kid), &jws).await.unwrap();
    assert_eq!(response.body.status, types::account::Status::Deactivated);

    use freyr::store::Store;
    let order_id = freyr::util::b64_to_uuid(&tail(&order_url)).unwrap();
    let stored_order = store.order(&order_id).await.unwrap().unwrap();
    assert_eq!(stored_order.status, freyr::acme::models::OrderStatus::Invalid);

    let auth_id = freyr::util::b64_to_uuid(&tail(&authorization_url)).unwrap();
    let stored_auth = store.authorization(&auth_id).await.unwrap().unwrap();
    assert_eq!(stored_auth.status, freyr::acme::models::AuthorizationStatus::Deactivated);

    let challenge_id = freyr::util::b64_to_uuid(&tail(&challenge_url)).unwrap();
    let stored_challenge = store.challenge(&challenge_id).await.unwrap().unwrap();
    assert_eq!(stored_challenge.status, freyr::acme::models::ChallengeStatus::Invalid);

    // Any further authenticated request bounces off the dead account.
    let jws = signed(&server, &key, KeyMode::Kid(kid.clone()), &kid, None).await;
    let err = server.account(&scope(), &tail(&kid), &jws).await.unwrap_err();
    assert_eq!(err.error_type, types::error::Type::AccountDeactivated);
    assert_eq!(err.status, 401);
}

#[tokio::test]
async fn contact_and_status_cannot_change_together() {
    let (server, _, _) = default_server();
    let key = new_key();
    let kid = register(&server, &key).await;

    let jws = signed(&server, &key, KeyMode::Kid(kid.clone()), &kid,
                     Some(serde_json::json!({
                         "status": "deactivated",
                         "contact": ["mailto:x@example.com"],
                     }))).await;
    let err = server.account(&scope(), &tail(&kid), &jws).await.unwrap_err();
    assert_eq!(err.error_type, types::error::Type::Malformed);
    assert!(err.detail.contains("on its own"));
}

async fn key_change_jws(
    server: &Server, outer_key: &openssl::pkey::PKey<openssl::pkey::Private>,
    outer_kid: &str, inner_key: &openssl::pkey::PKey<openssl::pkey::Private>,
    target_kid: &str, old_key: &openssl::pkey::PKey<openssl::pkey::Private>,
    inner_nonce: Option<&str>,
) -> types::jose::FlattenedJWS {
    let url = server.urls().key_change(&scope());
    let inner_payload = serde_json::json!({
        "account": target_kid,
        "oldKey": public_jwk(old_key),
    });
    let inner = sign(inner_key, &KeyMode::Jwk, inner_nonce, &url, Some(&inner_payload));
    signed(server, outer_key, KeyMode::Kid(outer_kid.to_string()), &url,
           Some(serde_json::to_value(inner).unwrap())).await
}

#[tokio::test]
async fn key_rollover() {
    let (server, _, _) = default_server();
    let old_key = new_key();
    let kid = register(&server, &old_key).await;
    let new_key_pair = new_key();

    let jws = key_change_jws(&server, &old_key, &kid, &new_key_pair, &kid, &old_key, None).await;
    let response = server.key_change(&scope(), &jws).await.unwrap();
    assert_eq!(response.status, 200);

    // The new key now authenticates the account; the old one no longer maps
    // to it.
    let jws = signed(&server, &new_key_pair, KeyMode::Kid(kid.clone()), &kid, None).await;
    server.account(&scope(), &tail(&kid), &jws).await.unwrap();

    let jws = signed(&server, &old_key, KeyMode::Kid(kid.clone()), &kid, None).await;
    let err = server.account(&scope(), &tail(&kid), &jws).await.unwrap_err();
    assert_eq!(err.error_type, types::error::Type::Malformed);
}

#[tokio::test]
async fn rollover_to_existing_key_conflicts() {
    let (server, _, _) = default_server();
    let key_one = new_key();
    let kid_one = register(&server, &key_one).await;
    let key_two = new_key();
    let kid_two = register(&server, &key_two).await;

    let jws = key_change_jws(&server, &key_one, &kid_one, &key_two, &kid_one, &key_one, None).await;
    let err = server.key_change(&scope(), &jws).await.unwrap_err();
    assert_eq!(err.error_type, types::error::Type::KeyExists);
    assert_eq!(err.status, 409);
    assert_eq!(err.instance.as_deref(), Some(kid_two.as_str()));
}

#[tokio::test]
async fn rollover_rejects_wrong_old_key() {
    let (server, _, _) = default_server();
    let old_key = new_key();
    let kid = register(&server, &old_key).await;

    let jws = key_change_jws(&server, &old_key, &kid, &new_key(), &kid, &new_key(), None).await;
    let err = server.key_change(&scope(), &jws).await.unwrap_err();
    assert_eq!(err.error_type, types::error::Type::Malformed);
    assert!(err.detail.contains("Old key"));
}

#[tokio::test]
async fn rollover_rejects_same_key() {
    let (server, _, _) = default_server();
    let old_key = new_key();
    let kid = register(&server, &old_key).await;

    let jws = key_change_jws(&server, &old_key, &kid, &old_key, &kid, &old_key, None).await;
    let err = server.key_change(&scope(), &jws).await.unwrap_err();
    assert_eq!(err.error_type, types::error::Type::Malformed);
    assert!(err.detail.contains("different"));
}

#[tokio::test]
async fn rollover_rejects_inner_nonce() {
    let (server, _, _) = default_server();
    let old_key = new_key();
    let kid = register(&server, &old_key).await;

    let jws = key_change_jws(&server, &old_key, &kid, &new_key(), &kid, &old_key,
                             Some("bm9uY2U")).await;
    let err = server.key_change(&scope(), &jws).await.unwrap_err();
    assert_eq!(err.error_type, types::error::Type::Malformed);
    assert!(err.detail.contains("nonce"));
}

#[tokio::test]
async fn rollover_by_other_account_holder() {
    // The outer signer and the inner target account are not required to
    // match; the inner envelope's own proofs carry the authorization.
    let (server, _, _) = default_server();
    let key_one = new_key();
    let kid_one = register(&server, &key_one).await;
    let key_two = new_key();
    let _kid_two = register(&server, &key_two).await;

    let jws = key_change_jws(&server, &key_two, &_kid_two, &new_key(), &kid_one, &key_one, None).await;
    server.key_change(&scope(), &jws).await.unwrap();
}

fn build_certificate(key: &openssl::pkey::PKey<openssl::pkey::Private>) -> Vec<u8> {
    let mut builder = openssl::x509::X509Builder::new().unwrap();
    builder.set_pubkey(key).unwrap();
    let mut name = openssl::x509::X509NameBuilder::new().unwrap();
    name.append_entry_by_nid(openssl::nid::Nid::COMMONNAME, "example.com").unwrap();
    let name = name.build();
    builder.set_subject_name(&name).unwrap();
    builder.set_issuer_name(&name).unwrap();
    builder.sign(key, openssl::hash::MessageDigest::sha256()).unwrap();
    builder.build().to_der().unwrap()
}

#[tokio::test]
async fn revocation() {
    let (server, _, ca) = default_server();
    let account_key = new_key();
    let kid = register(&server, &account_key).await;

    let certificate_key = new_key();
    let der = build_certificate(&certificate_key);
    ca.add_certificate(der.clone(), certificate_key.public_key_to_der().unwrap()).await;

    let url = server.urls().revoke_cert(&scope());
    let payload = serde_json::json!({
        "certificate": BASE64_URL_SAFE_NO_PAD.encode(&der),
        "reason": 1,
    });

    let jws = signed(&server, &account_key, KeyMode::Kid(kid.clone()), &url,
                     Some(payload.clone())).await;
    let response = server.revoke_certificate(&scope(), &jws).await.unwrap();
    assert_eq!(response.status, 200);

    let jws = signed(&server, &account_key, KeyMode::Kid(kid.clone()), &url,
                     Some(payload)).await;
    let err = server.revoke_certificate(&scope(), &jws).await.unwrap_err();
    assert_eq!(err.error_type, types::error::Type::AlreadyRevoked);
}

#[tokio::test]
async fn revocation_with_certificate_key() {
    let (server, _, ca) = default_server();
    let certificate_key = new_key();
    let der = build_certificate(&certificate_key);
    ca.add_certificate(der.clone(), certificate_key.public_key_to_der().unwrap()).await;

    let url = server.urls().revoke_cert(&scope());
    let jws = signed(&server, &certificate_key, KeyMode::Jwk, &url,
                     Some(serde_json::json!({
                         "certificate": BASE64_URL_SAFE_NO_PAD.encode(&der),
                     }))).await;
    let response = server.revoke_certificate(&scope(), &jws).await.unwrap();
    assert_eq!(response.status, 200);
}

#[tokio::test]
async fn revocation_rejects_wrong_key() {
    let (server, _, ca) = default_server();
    let certificate_key = new_key();
    let der = build_certificate(&certificate_key);
    ca.add_certificate(der.clone(), certificate_key.public_key_to_der().unwrap()).await;

    let url = server.urls().revoke_cert(&scope());
    let jws = signed(&server, &new_key(), KeyMode::Jwk, &url,
                     Some(serde_json::json!({
                         "certificate": BASE64_URL_SAFE_NO_PAD.encode(&der),
                     }))).await;
    let err = server.revoke_certificate(&scope(), &jws).await.unwrap_err();
    assert_eq!(err.error_type, types::error::Type::BadPublicKey);
    assert_eq!(err.status, 403);
}

#[tokio::test]
async fn revocation_rejects_bad_reason() {
    let (server, _, ca) = default_server();
    let account_key = new_key();
    let kid = register(&server, &account_key).await;
    let certificate_key = new_key();
    let der = build_certificate(&certificate_key);
    ca.add_certificate(der.clone(), certificate_key.public_key_to_der().unwrap()).await;

    let url = server.urls().revoke_cert(&scope());
    let jws = signed(&server, &account_key, KeyMode::Kid(kid.clone()), &url,
                     Some(serde_json::json!({
                         "certificate": BASE64_URL_SAFE_NO_PAD.encode(&der),
                         "reason": 7,
                     }))).await;
    let err = server.revoke_certificate(&scope(), &jws).await.unwrap_err();
    assert_eq!(err.error_type, types::error::Type::BadRevocationReason);
    assert!(err.detail.contains("0-6 and 8-10"));
}

#[tokio::test]
async fn revocation_of_unknown_certificate() {
    let (server, _, _) = default_server();
    let account_key = new_key();
    let kid = register(&server, &account_key).await;

    let url = server.urls().revoke_cert(&scope());
    let jws = signed(&server, &account_key, KeyMode::Kid(kid.clone()), &url,
                     Some(serde_json::json!({
                         "certificate": BASE64_URL_SAFE_NO_PAD.encode(b"garbage"),
                     }))).await;
    let err = server.revoke_certificate(&scope(), &jws).await.unwrap_err();
    assert_eq!(err.status, 404);
}

#[tokio::test]
async fn authorization_deactivation() {
    let (server, _, _) = default_server();
    let key = new_key();
    let kid = register(&server, &key).await;
    let (_, order) = place_order(&server, &key, &kid, "example.com").await;
    let authorization_url = order.authorizations[0].clone();

    let jws = signed(&server, &key, KeyMode::Kid(kid.clone()), &authorization_url,
                     Some(serde_json::json!({"status": "deactivated"}))).await;
    let response = server.authorization(&scope(), &tail(&authorization_url), &jws).await.unwrap();
    assert_eq!(response.body.status, types::authorization::Status::Deactivated);

    let jws = signed(&server, &key, KeyMode::Kid(kid.clone()), &authorization_url,
                     Some(serde_json::json!({"status": "deactivated"}))).await;
    let err = server.authorization(&scope(), &tail(&authorization_url), &jws).await.unwrap_err();
    assert_eq!(err.error_type, types::error::Type::Malformed);
}

#[tokio::test]
async fn other_accounts_cannot_read_orders() {
    let (server, _, _) = default_server();
    let key_one = new_key();
    let kid_one = register(&server, &key_one).await;
    let (order_url, _) = place_order(&server, &key_one, &kid_one, "example.com").await;

    let key_two = new_key();
    let kid_two = register(&server, &key_two).await;
    let jws = signed(&server, &key_two, KeyMode::Kid(kid_two.clone()), &order_url, None).await;
    let err = server.order(&scope(), &tail(&order_url), &jws).await.unwrap_err();
    assert_eq!(err.error_type, types::error::Type::Unauthorized);
    assert_eq!(err.status, 403);
}

#[tokio::test]
async fn failed_challenge_records_error() {
    let (server, _, _) = default_server();
    let key = new_key();
    let kid = register(&server, &key).await;

    let mock = MockServer::start().await;
    let domain = format!("{}", mock.address());
    let (_, order) = place_order(&server, &key, &kid, &domain).await;
    let authorization = fetch_authorization(&server, &key, &kid, &order.authorizations[0]).await;
    let challenge = authorization.challenges.iter()
        .find(|c| c.challenge_type == types::challenge::Type::HTTP01).unwrap();

    // Nothing mounted at the well-known path, so validation sees a 404.
    let jws = signed(&server, &key, KeyMode::Kid(kid.clone()), &challenge.url,
                     Some(serde_json::json!({}))).await;
    let response = server.challenge(&scope(), &tail(&challenge.url), &jws).await.unwrap();
    assert_eq!(response.body.status, types::challenge::Status::Invalid);
    let problem = response.body.error.unwrap();
    assert_eq!(problem.error_type, types::error::Type::IncorrectResponse);
}

#[tokio::test]
async fn pre_authorization_not_offered() {
    let (server, _, _) = default_server();
    let key = new_key();
    let kid = register(&server, &key).await;

    let url = server.urls().new_authz(&scope());
    let jws = signed(&server, &key, KeyMode::Kid(kid.clone()), &url,
                     Some(serde_json::json!({
                         "identifier": {"type": "dns", "value": "example.com"},
                     }))).await;
    let err = server.new_authz(&scope(), &jws).await.unwrap_err();
    assert_eq!(err.status, 403);
}
