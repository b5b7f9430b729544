//! The upstream certificate authority the server orders certificates from.

use crate::types;

#[derive(Debug, Clone)]
pub struct IssuedCertificate {
    pub id: String,
    pub chain_pem: String,
}

#[derive(Debug, Clone)]
pub struct CaCertificate {
    pub id: String,
    pub public_key_der: Vec<u8>,
    pub revoked: bool,
}

#[derive(Debug, thiserror::Error)]
pub enum CaError {
    #[error("certificate not found")]
    NotFound,
    #[error("issuance rejected: {0}")]
    Rejected(String),
    #[error("CA unavailable: {0}")]
    Unavailable(String),
}

#[async_trait::async_trait]
pub trait CertificateAuthority: Send + Sync {
    async fn issue(
        &self, csr_der: &[u8], identifiers: &[types::identifier::Identifier],
    ) -> Result<IssuedCertificate, CaError>;

    async fn certificate_by_der(&self, der: &[u8]) -> Result<CaCertificate, CaError>;

    async fn certificate_chain(&self, certificate_id: &str) -> Result<String, CaError>;

    async fn revoke(&self, certificate_id: &str, reason: RevocationReason) -> Result<(), CaError>;
}

/// RFC 5280 CRL reason codes. Value 7 is unused by the RFC and rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RevocationReason {
    Unspecified,
    KeyCompromise,
    CaCompromise,
    AffiliationChanged,
    Superseded,
    CessationOfOperation,
    CertificateHold,
    RemoveFromCrl,
    PrivilegeWithdrawn,
    AaCompromise,
}

impl RevocationReason {
    pub fn from_code(code: u32) -> Option<RevocationReason> {
        match code {
            0 => Some(RevocationReason::Unspecified),
            1 => Some(RevocationReason::KeyCompromise),
            2 => Some(RevocationReason::CaCompromise),
            3 => Some(RevocationReason::AffiliationChanged),
            4 => Some(RevocationReason::Superseded),
            5 => Some(RevocationReason::CessationOfOperation),
            6 => Some(RevocationReason::CertificateHold),
            8 => Some(RevocationReason::RemoveFromCrl),
            9 => Some(RevocationReason::PrivilegeWithdrawn),
            10 => Some(RevocationReason::AaCompromise),
            _ => None,
        }
    }

    pub fn code(&self) -> u32 {
        match self {
            RevocationReason::Unspecified => 0,
            RevocationReason::KeyCompromise => 1,
            RevocationReason::CaCompromise => 2,
            RevocationReason::AffiliationChanged => 3,
            RevocationReason::Superseded => 4,
            RevocationReason::CessationOfOperation => 5,
            RevocationReason::CertificateHold => 6,
            RevocationReason::RemoveFromCrl => 8,
            RevocationReason::PrivilegeWithdrawn => 9,
            RevocationReason::AaCompromise => 10,
        }
    }
}
