//! Challenge validation over live HTTP and DNS.

use base64::prelude::*;

use crate::acme::ACMEResult;
use crate::internal_server_error;
use crate::types;

pub const MAX_REDIRECT_COUNT: usize = 15;

/// A validation attempt either passes or fails with the problem to record on
/// the challenge. Transport trouble is a `Fail`, not a server error.
#[derive(Debug)]
pub enum Verdict {
    Pass,
    Fail(types::error::Error),
}

fn connection_fail(detail: String) -> types::error::Error {
    types::error::Error {
        error_type: types::error::Type::Connection,
        status: 400,
        title: "Connection error".to_string(),
        detail,
        sub_problems: vec![],
        instance: None,
        identifier: None,
    }
}

fn incorrect_response(detail: String) -> types::error::Error {
    types::error::Error {
        error_type: types::error::Type::IncorrectResponse,
        status: 400,
        title: "Incorrect response".to_string(),
        detail,
        sub_problems: vec![],
        instance: None,
        identifier: None,
    }
}

fn dns_fail(detail: String) -> types::error::Error {
    types::error::Error {
        error_type: types::error::Type::DNS,
        status: 400,
        title: "DNS error".to_string(),
        detail,
        sub_problems: vec![],
        instance: None,
        identifier: None,
    }
}

pub fn key_authorization(token: &str, thumbprint: &str) -> String {
    format!("{}.{}", token, thumbprint)
}

pub fn dns_txt_digest(key_authorization: &str) -> ACMEResult<String> {
    match openssl::hash::hash(
        openssl::hash::MessageDigest::sha256(), key_authorization.as_bytes()) {
        Ok(digest) => Ok(BASE64_URL_SAFE_NO_PAD.encode(digest)),
        Err(err) => {
            error!("Unable to hash key authorization: {}", err);
            Err(internal_server_error!())
        }
    }
}

#[derive(Debug)]
enum RedirectOutcome {
    Next(url::Url),
    Fail(types::error::Error),
}

/// Resolves a `Location` header against the current URL. A redirect may stay
/// on the current host and port; any other target with an explicit port
/// besides 80, 443 or the scheme default aborts the whole validation.
fn redirect_target(current: &url::Url, location: &str) -> ACMEResult<RedirectOutcome> {
    let target = match current.join(location) {
        Ok(v) => v,
        Err(err) => {
            return Ok(RedirectOutcome::Fail(incorrect_response(format!(
                "Invalid redirect location: {}", err))));
        }
    };
    let same_authority = target.host() == current.host() && target.port() == current.port();
    if let Some(port) = target.port() {
        if !same_authority && port != 80 && port != 443 {
            return Err(types::error::Error {
                error_type: types::error::Type::InvalidRedirect,
                status: 400,
                title: "Invalid redirect".to_string(),
                detail: "Only ports 80 and 443 can be followed".to_string(),
                sub_problems: vec![],
                instance: None,
                identifier: None,
            });
        }
    }
    Ok(RedirectOutcome::Next(target))
}

pub struct Validator {
    client: reqwest::Client,
    dns_resolver: trust_dns_resolver::TokioAsyncResolver,
    timeout: std::time::Duration,
}

impl Validator {
    pub fn new(timeout: std::time::Duration) -> Validator {
        Validator {
            client: reqwest::Client::builder()
                .user_agent(concat!(env!("CARGO_PKG_NAME"), " ", env!("CARGO_PKG_VERSION")))
                .redirect(reqwest::redirect::Policy::none())
                .gzip(true)
                .brotli(true)
                .deflate(true)
                .no_proxy()
                .timeout(timeout)
                .build().unwrap(),
            dns_resolver: trust_dns_resolver::TokioAsyncResolver::tokio_from_system_conf()
                .expect("Unable to read system DNS config"),
            timeout,
        }
    }

    pub async fn validate_http01(
        &self, domain: &str, token: &str, key_authorization: &str,
    ) -> ACMEResult<Verdict> {
        let initial = format!("http://{}/.well-known/acme-challenge/{}", domain, token);
        let mut current = match url::Url::parse(&initial) {
            Ok(v) => v,
            Err(_) => {
                return Ok(Verdict::Fail(incorrect_response("Invalid URI".to_string())));
            }
        };

        let attempt = async {
            let mut hops = 0;
            loop {
                let response = match self.client.get(current.clone()).send().await {
                    Ok(v) => v,
                    Err(err) => {
                        let detail = if err.is_timeout() {
                            "Connection timed out".to_string()
                        } else if err.is_connect() {
                            "Connection refused".to_string()
                        } else {
                            "Unknown request error".to_string()
                        };
                        return Ok(Verdict::Fail(connection_fail(detail)));
                    }
                };

                if response.status().is_redirection() {
                    if let Some(location) = response.headers()
                        .get(reqwest::header::LOCATION)
                        .and_then(|l| l.to_str().ok()) {
                        hops += 1;
                        if hops > MAX_REDIRECT_COUNT {
                            return Ok(Verdict::Fail(connection_fail(
                                "Too many redirects".to_string())));
                        }
                        match redirect_target(&current, location)? {
                            RedirectOutcome::Next(target) => {
                                current = target;
                                continue;
                            }
                            RedirectOutcome::Fail(err) => {
                                return Ok(Verdict::Fail(err));
                            }
                        }
                    }
                }

                if !response.status().is_success() {
                    return Ok(Verdict::Fail(incorrect_response(format!(
                        "HTTP {} received", response.status().as_u16()))));
                }

                let body = match response.text().await {
                    Ok(v) => v,
                    Err(_) => {
                        return Ok(Verdict::Fail(incorrect_response(
                            "Text charset error".to_string())));
                    }
                };
                return if body.trim() == key_authorization {
                    Ok(Verdict::Pass)
                } else {
                    Ok(Verdict::Fail(incorrect_response(format!(
                        "Expected '{}', received '{}'", key_authorization, body.trim()))))
                };
            }
        };

        match tokio::time::timeout(self.timeout, attempt).await {
            Ok(verdict) => verdict,
            Err(_) => Ok(Verdict::Fail(connection_fail("Connection timed out".to_string()))),
        }
    }

    pub async fn validate_dns01(
        &self, domain: &str, digest: &str,
        resolver_override: Option<(std::net::IpAddr, u16)>,
    ) -> ACMEResult<Verdict> {
        let custom_resolver;
        let resolver = match resolver_override {
            Some((ip, port)) => {
                let mut config = trust_dns_resolver::config::ResolverConfig::new();
                config.add_name_server(trust_dns_resolver::config::NameServerConfig::new(
                    std::net::SocketAddr::new(ip, port),
                    trust_dns_resolver::config::Protocol::Udp,
                ));
                custom_resolver = match trust_dns_resolver::TokioAsyncResolver::tokio(
                    config, trust_dns_resolver::config::ResolverOpts::default()) {
                    Ok(v) => v,
                    Err(err) => {
                        error!("Unable to build DNS resolver: {}", err);
                        return Err(internal_server_error!());
                    }
                };
                &custom_resolver
            }
            None => &self.dns_resolver,
        };

        let search_domain = format!("_acme-challenge.{}.", domain.trim_end_matches('.'));
        match resolver.lookup(
            search_domain.as_str(), trust_dns_proto::rr::record_type::RecordType::TXT).await {
            Ok(lookup) => {
                for record in lookup.iter() {
                    if let trust_dns_proto::rr::record_data::RData::TXT(txt) = record {
                        for chunk in txt.txt_data() {
                            if chunk.as_ref() == digest.as_bytes() {
                                return Ok(Verdict::Pass);
                            }
                        }
                    }
                }
                Ok(Verdict::Fail(incorrect_response(format!(
                    "No TXT records found for {} with the value '{}'", search_domain, digest))))
            }
            Err(err) => match err.kind() {
                trust_dns_resolver::error::ResolveErrorKind::NoRecordsFound { .. } => {
                    Ok(Verdict::Fail(dns_fail(format!(
                        "No TXT records found for {}", search_domain))))
                }
                _ => Ok(Verdict::Fail(dns_fail(format!(
                    "SERVFAIL whilst getting records for {}", search_domain)))),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[test]
    fn redirect_ports() {
        let current = url::Url::parse("http://example.com/.well-known/acme-challenge/tok").unwrap();

        match redirect_target(&current, "/elsewhere").unwrap() {
            RedirectOutcome::Next(target) => {
                assert_eq!(target.as_str(), "http://example.com/elsewhere");
            }
            RedirectOutcome::Fail(_) => panic!("relative redirect should resolve"),
        }

        match redirect_target(&current, "https://example.com:443/x").unwrap() {
            RedirectOutcome::Next(_) => {}
            RedirectOutcome::Fail(_) => panic!("port 443 should be allowed"),
        }

        let err = redirect_target(&current, "http://example.com:8080/x").unwrap_err();
        assert_eq!(err.error_type, types::error::Type::InvalidRedirect);

        // Staying on the current host and port is fine even off 80/443.
        let current = url::Url::parse("http://127.0.0.1:8080/a").unwrap();
        match redirect_target(&current, "/b").unwrap() {
            RedirectOutcome::Next(target) => {
                assert_eq!(target.as_str(), "http://127.0.0.1:8080/b");
            }
            RedirectOutcome::Fail(_) => panic!("same-authority redirect should resolve"),
        }
        let err = redirect_target(&current, "http://127.0.0.1:8081/b").unwrap_err();
        assert_eq!(err.error_type, types::error::Type::InvalidRedirect);
    }

    #[test]
    fn key_authorization_format() {
        let ka = key_authorization("tok", "thumb");
        assert_eq!(ka, "tok.thumb");
        let digest = dns_txt_digest(&ka).unwrap();
        let expected = BASE64_URL_SAFE_NO_PAD.encode(openssl::hash::hash(
            openssl::hash::MessageDigest::sha256(), b"tok.thumb").unwrap());
        assert_eq!(digest, expected);
    }

    #[tokio::test]
    async fn http01_direct_success() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/.well-known/acme-challenge/tok"))
            .respond_with(ResponseTemplate::new(200).set_body_string("tok.thumb\n"))
            .mount(&server)
            .await;

        let validator = Validator::new(std::time::Duration::from_secs(5));
        let domain = format!("{}", server.address());
        let verdict = validator.validate_http01(&domain, "tok", "tok.thumb").await.unwrap();
        assert!(matches!(verdict, Verdict::Pass));
    }

    #[tokio::test]
    async fn http01_wrong_body() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/.well-known/acme-challenge/tok"))
            .respond_with(ResponseTemplate::new(200).set_body_string("something else"))
            .mount(&server)
            .await;

        let validator = Validator::new(std::time::Duration::from_secs(5));
        let domain = format!("{}", server.address());
        let verdict = validator.validate_http01(&domain, "tok", "tok.thumb").await.unwrap();
        match verdict {
            Verdict::Fail(err) => {
                assert_eq!(err.error_type, types::error::Type::IncorrectResponse);
            }
            Verdict::Pass => panic!("mismatched body should fail"),
        }
    }

    #[tokio::test]
    async fn http01_not_found() {
        let server = MockServer::start().await;

        let validator = Validator::new(std::time::Duration::from_secs(5));
        let domain = format!("{}", server.address());
        let verdict = validator.validate_http01(&domain, "tok", "tok.thumb").await.unwrap();
        match verdict {
            Verdict::Fail(err) => {
                assert_eq!(err.error_type, types::error::Type::IncorrectResponse);
                assert!(err.detail.contains("404"));
            }
            Verdict::Pass => panic!("404 should fail"),
        }
    }

    #[tokio::test]
    async fn http01_redirect_to_forbidden_port() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/.well-known/acme-challenge/tok"))
            .respond_with(ResponseTemplate::new(302)
                .insert_header("Location", "http://127.0.0.1:8080/tok"))
            .mount(&server)
            .await;

        let validator = Validator::new(std::time::Duration::from_secs(5));
        let domain = format!("{}", server.address());
        let err = validator.validate_http01(&domain, "tok", "tok.thumb").await.unwrap_err();
        assert_eq!(err.error_type, types::error::Type::InvalidRedirect);
    }

    #[tokio::test]
    async fn http01_redirect_loop_hits_hop_cap() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/.well-known/acme-challenge/tok"))
            .respond_with(ResponseTemplate::new(302)
                .insert_header("Location", "/.well-known/acme-challenge/tok"))
            .mount(&server)
            .await;

        let validator = Validator::new(std::time::Duration::from_secs(5));
        let domain = format!("{}", server.address());
        let verdict = validator.validate_http01(&domain, "tok", "tok.thumb").await.unwrap();
        match verdict {
            Verdict::Fail(err) => {
                assert_eq!(err.error_type, types::error::Type::Connection);
                assert_eq!(err.detail, "Too many redirects");
            }
            Verdict::Pass => panic!("redirect loop should fail"),
        }
    }

    #[tokio::test]
    async fn http01_times_out() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/.well-known/acme-challenge/tok"))
            .respond_with(ResponseTemplate::new(200)
                .set_body_string("tok.thumb")
                .set_delay(std::time::Duration::from_secs(10)))
            .mount(&server)
            .await;

        let validator = Validator::new(std::time::Duration::from_secs(1));
        let domain = format!("{}", server.address());
        let verdict = validator.validate_http01(&domain, "tok", "tok.thumb").await.unwrap();
        match verdict {
            Verdict::Fail(err) => {
                assert_eq!(err.error_type, types::error::Type::Connection);
            }
            Verdict::Pass => panic!("delayed response should fail"),
        }
    }

    /// Answers every query with the given TXT strings.
    async fn run_txt_server(values: Vec<String>) -> std::net::SocketAddr {
        let socket = tokio::net::UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = socket.local_addr().unwrap();
        tokio::spawn(async move {
            let mut buf = [0u8; 512];
            loop {
                let (len, peer) = match socket.recv_from(&mut buf).await {
                    Ok(v) => v,
                    Err(_) => return,
                };
                let query = match trust_dns_proto::op::Message::from_vec(&buf[..len]) {
                    Ok(v) => v,
                    Err(_) => continue,
                };
                let mut response = trust_dns_proto::op::Message::new();
                response.set_id(query.id());
                response.set_message_type(trust_dns_proto::op::MessageType::Response);
                response.set_op_code(trust_dns_proto::op::OpCode::Query);
                response.set_recursion_desired(query.recursion_desired());
                response.set_recursion_available(true);
                for q in query.queries() {
                    response.add_query(q.clone());
                    response.add_answer(trust_dns_proto::rr::Record::from_rdata(
                        q.name().clone(),
                        1,
                        trust_dns_proto::rr::RData::TXT(
                            trust_dns_proto::rr::rdata::TXT::new(values.clone())),
                    ));
                }
                let bytes = match response.to_vec() {
                    Ok(v) => v,
                    Err(_) => continue,
                };
                let _ = socket.send_to(&bytes, peer).await;
            }
        });
        addr
    }

    #[tokio::test]
    async fn dns01_txt_match() {
        let digest = dns_txt_digest(&key_authorization("tok", "thumb")).unwrap();
        let addr = run_txt_server(vec![digest.clone()]).await;

        let validator = Validator::new(std::time::Duration::from_secs(5));
        let verdict = validator
            .validate_dns01("example.com", &digest, Some((addr.ip(), addr.port())))
            .await
            .unwrap();
        assert!(matches!(verdict, Verdict::Pass));
    }

    #[tokio::test]
    async fn dns01_wrong_txt_value() {
        let addr = run_txt_server(vec!["not-the-digest".to_string()]).await;

        let validator = Validator::new(std::time::Duration::from_secs(5));
        let digest = dns_txt_digest(&key_authorization("tok", "thumb")).unwrap();
        let verdict = validator
            .validate_dns01("example.com", &digest, Some((addr.ip(), addr.port())))
            .await
            .unwrap();
        match verdict {
            Verdict::Fail(err) => {
                assert_eq!(err.error_type, types::error::Type::IncorrectResponse);
                assert!(err.detail.contains("_acme-challenge.example.com."));
            }
            Verdict::Pass => panic!("mismatched TXT value should fail"),
        }
    }
}
