use figment::providers::{Env, Format, Toml};

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub external_uri: String,
    #[serde(default)]
    pub caa_identities: Vec<String>,
    #[serde(default)]
    pub tos_uri: Option<String>,
    #[serde(default)]
    pub website_uri: Option<String>,
    #[serde(default = "default_validity_secs")]
    pub default_validity_secs: u32,
    #[serde(default = "default_validation_timeout_secs")]
    pub validation_timeout_secs: u64,
    #[serde(default = "default_finalize_workers")]
    pub finalize_workers: usize,
}

fn default_validity_secs() -> u32 {
    86400
}

fn default_validation_timeout_secs() -> u64 {
    30
}

fn default_finalize_workers() -> usize {
    4
}

impl Config {
    pub fn figment() -> figment::Figment {
        figment::Figment::new()
            .merge(Toml::file("freyr.toml"))
            .merge(Env::prefixed("FREYR_"))
    }

    pub fn load() -> Result<Config, figment::Error> {
        Self::figment().extract()
    }
}

impl Default for Config {
    fn default() -> Config {
        Config {
            external_uri: "http://localhost:8000".to_string(),
            caa_identities: vec![],
            tos_uri: None,
            website_uri: None,
            default_validity_secs: default_validity_secs(),
            validation_timeout_secs: default_validation_timeout_secs(),
            finalize_workers: default_finalize_workers(),
        }
    }
}
