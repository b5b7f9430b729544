#[derive(Debug, Deserialize)]
pub struct CertificateRevocation {
    pub certificate: String,
    #[serde(default)]
    pub reason: Option<u32>,
}
