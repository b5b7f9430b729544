use std::collections::BTreeMap;
use std::convert::TryFrom;

use base64::prelude::*;

use super::{models, ACMEResult};
use crate::types;

fn malformed(detail: String) -> types::error::Error {
    types::error::Error {
        error_type: types::error::Type::Malformed,
        status: 400,
        title: "Bad request".to_string(),
        detail,
        sub_problems: vec![],
        instance: None,
        identifier: None,
    }
}

fn bad_public_key(detail: String) -> types::error::Error {
    types::error::Error {
        error_type: types::error::Type::BadPublicKey,
        status: 400,
        title: "Bad public key".to_string(),
        detail,
        sub_problems: vec![],
        instance: None,
        identifier: None,
    }
}

fn bad_signature_algorithm(detail: String) -> types::error::Error {
    types::error::Error {
        error_type: types::error::Type::BadSignatureAlgorithm,
        status: 400,
        title: "Bad signature algorithm".to_string(),
        detail,
        sub_problems: vec![],
        instance: None,
        identifier: None,
    }
}

#[derive(Debug)]
pub enum JwsRequestKey {
    Jwk {
        kid: Option<String>,
        key: openssl::pkey::PKey<openssl::pkey::Public>,
    },
    Kid(models::Account),
}

impl JwsRequestKey {
    pub fn pkey(&self) -> ACMEResult<openssl::pkey::PKey<openssl::pkey::Public>> {
        match self {
            JwsRequestKey::Jwk { key, .. } => Ok(key.clone()),
            JwsRequestKey::Kid(account) => account.pkey(),
        }
    }
}

#[derive(Debug)]
pub struct JwsRequest<R> {
    pub payload: Option<R>,
    pub key: JwsRequestKey,
    pub url: String,
}

/// Keys admitted for account signatures. Anything outside this set is
/// rejected before any crypto runs.
pub enum AccountKey {
    Rsa(openssl::rsa::Rsa<openssl::pkey::Public>),
    Ecdsa(openssl::ec::EcKey<openssl::pkey::Public>),
}

impl AccountKey {
    pub fn from_pkey(key: &openssl::pkey::PKey<openssl::pkey::Public>) -> ACMEResult<AccountKey> {
        match key.id() {
            openssl::pkey::Id::RSA => match key.rsa() {
                Ok(k) => Ok(AccountKey::Rsa(k)),
                Err(_) => Err(bad_public_key("Invalid RSA key".to_string())),
            },
            openssl::pkey::Id::EC => match key.ec_key() {
                Ok(k) => Ok(AccountKey::Ecdsa(k)),
                Err(_) => Err(bad_public_key("Invalid ECDSA key".to_string())),
            },
            _ => Err(bad_public_key("Only RSA and ECDSA keys are supported".to_string())),
        }
    }

    /// RSA moduli under 1024 bits and curves with an order under 112 bits are
    /// refused.
    pub fn check_strength(&self) -> ACMEResult<()> {
        match self {
            AccountKey::Rsa(key) => {
                if key.n().num_bits() < 1024 {
                    return Err(bad_public_key(
                        "RSA keys must be at least 1024 bits".to_string()));
                }
            }
            AccountKey::Ecdsa(key) => {
                let order_bits = (|| -> Result<i32, openssl::error::ErrorStack> {
                    let mut ctx = openssl::bn::BigNumContext::new()?;
                    let mut order = openssl::bn::BigNum::new()?;
                    key.group().order(&mut order, &mut ctx)?;
                    Ok(order.num_bits())
                })();
                match order_bits {
                    Ok(bits) => {
                        if bits < 112 {
                            return Err(bad_public_key(
                                "ECDSA curves must have an order of at least 112 bits".to_string()));
                        }
                    }
                    Err(err) => {
                        error!("Unable to inspect EC key: {}", err);
                        return Err(internal_server_error!());
                    }
                }
            }
        }
        Ok(())
    }
}

fn ecdsa_sig_to_der(signature: &[u8]) -> ACMEResult<Vec<u8>> {
    if signature.len() % 2 != 0 {
        return Err(malformed("Invalid JWS signature".to_string()));
    }
    let (r, s) = signature.split_at(signature.len() / 2);
    let der = (|| -> Result<Vec<u8>, openssl::error::ErrorStack> {
        let r = openssl::bn::BigNum::from_slice(r)?;
        let s = openssl::bn::BigNum::from_slice(s)?;
        openssl::ecdsa::EcdsaSig::from_private_components(r, s)?.to_der()
    })();
    match der {
        Ok(der) => Ok(der),
        Err(_) => Err(malformed("Invalid JWS signature".to_string())),
    }
}

pub fn verify_jws_sig(
    signed: &[u8], alg: &str,
    key: &openssl::pkey::PKey<openssl::pkey::Public>, signature: &[u8],
) -> ACMEResult<()> {
    let account_key = AccountKey::from_pkey(key)?;
    account_key.check_strength()?;

    let (digest, signature) = match alg {
        "RS256" | "RS384" | "RS512" => {
            if !matches!(account_key, AccountKey::Rsa(_)) {
                return Err(bad_signature_algorithm(format!(
                    "'{}' is not an appropriate algorithm for the given key", alg)));
            }
            let digest = match alg {
                "RS256" => openssl::hash::MessageDigest::sha256(),
                "RS384" => openssl::hash::MessageDigest::sha384(),
                _ => openssl::hash::MessageDigest::sha512(),
            };
            (digest, signature.to_vec())
        }
        "ES256" | "ES384" | "ES512" => {
            if !matches!(account_key, AccountKey::Ecdsa(_)) {
                return Err(bad_signature_algorithm(format!(
                    "'{}' is not an appropriate algorithm for the given key", alg)));
            }
            let digest = match alg {
                "ES256" => openssl::hash::MessageDigest::sha256(),
                "ES384" => openssl::hash::MessageDigest::sha384(),
                _ => openssl::hash::MessageDigest::sha512(),
            };
            (digest, ecdsa_sig_to_der(signature)?)
        }
        o => {
            return Err(bad_signature_algorithm(format!(
                "'{}' is not a supported algorithm", o)));
        }
    };

    let valid = (|| -> Result<bool, openssl::error::ErrorStack> {
        let mut verifier = openssl::sign::Verifier::new(digest, key)?;
        verifier.verify_oneshot(&signature, signed)
    })();
    match valid {
        Ok(true) => Ok(()),
        Ok(false) => Err(malformed("Invalid JWS signature".to_string())),
        Err(err) => {
            error!("Unable to verify JWS signature: {}", err);
            Err(internal_server_error!())
        }
    }
}

fn start_decode_jws(
    jws: &types::jose::FlattenedJWS,
) -> ACMEResult<(types::jose::JWSProtectedHeader, Vec<u8>, Vec<u8>)> {
    let protected_bytes = match BASE64_URL_SAFE_NO_PAD.decode(&jws.protected) {
        Ok(v) => v,
        Err(_) => {
            return Err(malformed("Invalid protected header encoding".to_string()));
        }
    };
    let header = match serde_json::from_slice::<types::jose::JWSProtectedHeader>(&protected_bytes) {
        Ok(v) => v,
        Err(err) => {
            return Err(malformed(format!("Invalid protected header: {}", err)));
        }
    };
    if let Some(crit) = &header.crit {
        if !crit.is_empty() {
            return Err(malformed(format!("Unsupported critical constraints: {:?}", crit)));
        }
    }
    if header.b64 == Some(false) {
        return Err(malformed("Unencoded payload not supported".to_string()));
    }
    let payload = match BASE64_URL_SAFE_NO_PAD.decode(&jws.payload) {
        Ok(v) => v,
        Err(_) => {
            return Err(malformed("Invalid payload encoding".to_string()));
        }
    };
    let signature = match BASE64_URL_SAFE_NO_PAD.decode(&jws.signature) {
        Ok(v) => v,
        Err(_) => {
            return Err(malformed("Invalid signature encoding".to_string()));
        }
    };
    Ok((header, payload, signature))
}

fn decode_payload<R: serde::de::DeserializeOwned>(payload: &[u8]) -> ACMEResult<Option<R>> {
    if payload.is_empty() {
        return Ok(None);
    }
    match serde_json::from_slice::<R>(payload) {
        Ok(v) => Ok(Some(v)),
        Err(err) => Err(malformed(format!("Invalid payload: {}", err))),
    }
}

impl<R: serde::de::DeserializeOwned + std::fmt::Debug> JwsRequest<R> {
    pub async fn from_jws(
        jws: &types::jose::FlattenedJWS, request_url: &str,
        store: &dyn crate::store::Store, nonces: &super::replay::NonceRegistry,
    ) -> ACMEResult<JwsRequest<R>> {
        let (header, payload, signature) = start_decode_jws(jws)?;

        let nonce = match &header.nonce {
            Some(v) => v,
            None => {
                return Err(malformed("A nonce must be provided".to_string()));
            }
        };
        nonces.consume(nonce).await?;

        if header.url != request_url {
            return Err(malformed(format!(
                "JWS is for '{}' but request made to '{}'", header.url, request_url)));
        }

        let key = match &header.key {
            types::jose::JWKKey::JWK(jwk) => {
                let key = match openssl::pkey::PKey::try_from(jwk) {
                    Ok(v) => v,
                    Err(err) => {
                        return Err(bad_public_key(err));
                    }
                };
                JwsRequestKey::Jwk {
                    kid: jwk.kid.clone(),
                    key,
                }
            }
            types::jose::JWKKey::KID(kid) => {
                match super::lookup_account(kid, store).await? {
                    Some(account) => JwsRequestKey::Kid(account),
                    None => {
                        return Err(types::error::Error {
                            error_type: types::error::Type::AccountDoesNotExist,
                            status: 400,
                            title: "Account does not exist".to_string(),
                            detail: format!("No account can be found with the ID {}", kid),
                            sub_problems: vec![],
                            instance: None,
                            identifier: None,
                        });
                    }
                }
            }
        };

        let signed = format!("{}.{}", jws.protected, jws.payload);
        verify_jws_sig(signed.as_bytes(), &header.alg, &key.pkey()?, &signature)?;

        Ok(JwsRequest {
            payload: decode_payload(&payload)?,
            key,
            url: header.url,
        })
    }
}

/// Decodes the inner JWS of a key rollover request. The inner envelope must
/// carry a 'jwk', no nonce, and the same url as the outer request.
pub fn decode_inner_jws<R: serde::de::DeserializeOwned>(
    jws: &types::jose::FlattenedJWS, outer_url: &str,
) -> ACMEResult<(R, openssl::pkey::PKey<openssl::pkey::Public>, types::jose::JWK)> {
    let (header, payload, signature) = start_decode_jws(jws)?;

    if header.nonce.is_some() {
        return Err(malformed("Inner JWS must not contain a nonce".to_string()));
    }
    if header.url != outer_url {
        return Err(malformed(format!(
            "Inner JWS is for '{}' but request made to '{}'", header.url, outer_url)));
    }

    let jwk = match &header.key {
        types::jose::JWKKey::JWK(jwk) => jwk.clone(),
        types::jose::JWKKey::KID(_) => {
            return Err(malformed("Inner JWS must contain a 'jwk' field".to_string()));
        }
    };
    let key = match openssl::pkey::PKey::try_from(&jwk) {
        Ok(v) => v,
        Err(err) => {
            return Err(bad_public_key(err));
        }
    };

    let signed = format!("{}.{}", jws.protected, jws.payload);
    verify_jws_sig(signed.as_bytes(), &header.alg, &key, &signature)?;

    let payload = match decode_payload::<R>(&payload)? {
        Some(v) => v,
        None => {
            return Err(malformed("Inner JWS must have a payload".to_string()));
        }
    };

    Ok((payload, key, jwk))
}

/// RFC 7638 thumbprint over the canonical JSON of the key's required members.
pub fn make_jwk_thumbprint(jwk: &types::jose::JWK) -> ACMEResult<String> {
    let mut members = BTreeMap::new();
    members.insert("kty".to_string(), jwk.kty.clone());
    match &jwk.params {
        types::jose::JWKType::EC { crv, x, y } => {
            members.insert("crv".to_string(), crv.clone());
            members.insert("x".to_string(), x.clone());
            members.insert("y".to_string(), y.clone());
        }
        types::jose::JWKType::RSA { n, e } => {
            members.insert("n".to_string(), n.clone());
            members.insert("e".to_string(), e.clone());
        }
    }
    let canonical = match serde_json::to_string(&members) {
        Ok(v) => v,
        Err(err) => {
            error!("Unable to canonicalize JWK: {}", err);
            return Err(internal_server_error!());
        }
    };
    let digest = match openssl::hash::hash(
        openssl::hash::MessageDigest::sha256(), canonical.as_bytes()) {
        Ok(v) => v,
        Err(err) => {
            error!("Unable to hash JWK: {}", err);
            return Err(internal_server_error!());
        }
    };
    Ok(BASE64_URL_SAFE_NO_PAD.encode(digest))
}
