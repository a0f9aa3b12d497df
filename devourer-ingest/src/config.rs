use figment::providers::{Env, Format, Serialized, Toml};
use figment::Figment;
use serde::{Deserialize, Serialize};

#[derive(Debug, PartialEq, Deserialize, Serialize)]
pub struct HubSpotSettings {
    pub page_limit: usize,
    pub gate_retry_seconds: u64,
    pub worker_count: usize,
}

impl Default for HubSpotSettings {
    fn default() -> Self {
        Self {
            page_limit: 100,
            gate_retry_seconds: 10,
            worker_count: 4,
        }
    }
}

#[derive(Debug, PartialEq, Deserialize, Serialize)]
pub struct BitwerxSettings {
    pub base_url: String,
    pub poll_delay_seconds: u64,
    pub download_timeout_seconds: u64,
    pub practice_id: String,
}

impl Default for BitwerxSettings {
    fn default() -> Self {
        Self {
            base_url: "https://partner.daylight.vet".to_owned(),
            poll_delay_seconds: 10,
            download_timeout_seconds: 5 * 60,
            practice_id: "1234|1".to_owned(),
        }
    }
}

#[derive(Debug, PartialEq, Deserialize, Serialize)]
pub struct IngestConfig {
    pub redis_url: String,
    pub upstream_db_url: Option<String>,
    pub db_pool_size: usize,
    pub bus_topic: String,
    pub secrets_path: String,
    pub config_name: String,
    pub hubspot: HubSpotSettings,
    pub bitwerx: BitwerxSettings,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            redis_url: "redis://127.0.0.1:6379/1".to_owned(),
            upstream_db_url: None,
            db_pool_size: 16,
            bus_topic: "devourer-public".to_owned(),
            secrets_path: "secrets.json".to_owned(),
            config_name: "devourer".to_owned(),
            hubspot: Default::default(),
            bitwerx: Default::default(),
        }
    }
}

impl IngestConfig {
    pub fn figment() -> Figment {
        Figment::from(Serialized::defaults(Self::default()))
            .merge(Toml::file("DEVOURER.toml"))
            .merge(Env::prefixed("DEVOURER_"))
    }

    pub fn config() -> figment::Result<Self> {
        Self::figment().extract()
    }
}
