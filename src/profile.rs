//! Profile lookup. A profile carries the issuance policy an ACME directory is
//! served under; the embedding application decides where profiles live.

#[derive(Debug, Clone)]
pub struct Profile {
    pub name: String,
    pub require_contact: bool,
    pub require_terms_of_service: bool,
    pub terms_of_service_url: Option<String>,
    pub website_url: Option<String>,
    pub validity_secs: Option<u32>,
    pub retry_interval_secs: u32,
    pub dns_resolver_ip: Option<std::net::IpAddr>,
    pub dns_resolver_port: Option<u16>,
}

impl Default for Profile {
    fn default() -> Profile {
        Profile {
            name: "default".to_string(),
            require_contact: false,
            require_terms_of_service: false,
            terms_of_service_url: None,
            website_url: None,
            validity_secs: None,
            retry_interval_secs: 30,
            dns_resolver_ip: None,
            dns_resolver_port: None,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ProfileError {
    #[error("profile backend error: {0}")]
    Backend(String),
}

#[async_trait::async_trait]
pub trait ProfileSource: Send + Sync {
    async fn by_name(&self, name: &str) -> Result<Option<Profile>, ProfileError>;
}

/// A fixed set of profiles, for embedders with static policy and for tests.
#[derive(Debug, Default)]
pub struct StaticProfiles {
    profiles: Vec<Profile>,
}

impl StaticProfiles {
    pub fn new(profiles: Vec<Profile>) -> StaticProfiles {
        StaticProfiles {
            profiles,
        }
    }
}

#[async_trait::async_trait]
impl ProfileSource for StaticProfiles {
    async fn by_name(&self, name: &str) -> Result<Option<Profile>, ProfileError> {
        Ok(self.profiles.iter().find(|p| p.name == name).cloned())
    }
}
