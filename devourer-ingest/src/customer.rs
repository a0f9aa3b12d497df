//! Customer configuration, retrieved by name from a secret-manager style
//! backend. The handle is built once at startup and passed explicitly to
//! whoever needs it; `reload` is the only way it changes.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use miette::Diagnostic;
use serde::Deserialize;
use serde_json::Value as JsonValue;
use thiserror::Error;

pub const CONFIG_CUSTOMERS_KEY: &str = "customers";

#[derive(Debug, Error, Diagnostic)]
pub enum SecretError {
    #[error("could not read secret store at {path}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("secret store is not valid JSON")]
    Parse(#[source] serde_json::Error),

    #[error("no secret named `{0}`")]
    Missing(String),

    #[error("customer config has an unexpected shape")]
    Shape(#[source] serde_json::Error),
}

/// The only surface required of the external secret manager.
pub trait SecretBackend: Send + Sync {
    fn get(&self, name: &str) -> Result<JsonValue, SecretError>;
}

/// File-backed secret store for local runs and tests: one JSON document,
/// secrets keyed by name at the top level.
pub struct JsonFileBackend {
    path: PathBuf,
}

impl JsonFileBackend {
    pub fn new(path: impl AsRef<Path>) -> JsonFileBackend {
        JsonFileBackend {
            path: path.as_ref().to_owned(),
        }
    }
}

impl SecretBackend for JsonFileBackend {
    fn get(&self, name: &str) -> Result<JsonValue, SecretError> {
        let raw = std::fs::read_to_string(&self.path).map_err(|source| SecretError::Io {
            path: self.path.clone(),
            source,
        })?;
        let doc: JsonValue = serde_json::from_str(&raw).map_err(SecretError::Parse)?;
        doc.get(name)
            .cloned()
            .ok_or_else(|| SecretError::Missing(name.to_owned()))
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct HubSpotObject {
    #[serde(default)]
    pub properties: Vec<String>,
    pub last_update_field: String,
    #[serde(default)]
    pub priority: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct HubSpotIntegration {
    pub apikey: String,
    pub objects: HashMap<String, HubSpotObject>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BitwerxCredentials {
    pub username: String,
    pub password: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Integrations {
    pub hubspot: Option<HubSpotIntegration>,
    pub bitwerx: Option<BitwerxCredentials>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Customer {
    #[serde(default)]
    pub integrations: Integrations,
    #[serde(default)]
    pub datasources: Vec<String>,
}

pub struct CustomerConfig {
    customers: HashMap<String, Customer>,
}

impl CustomerConfig {
    pub fn load(backend: &dyn SecretBackend, config_name: &str) -> Result<CustomerConfig, SecretError> {
        Self::from_value(backend.get(config_name)?)
    }

    pub fn from_value(doc: JsonValue) -> Result<CustomerConfig, SecretError> {
        let customers = doc
            .get(CONFIG_CUSTOMERS_KEY)
            .cloned()
            .unwrap_or_else(|| JsonValue::Object(Default::default()));
        Ok(CustomerConfig {
            customers: serde_json::from_value(customers).map_err(SecretError::Shape)?,
        })
    }

    #[allow(dead_code)]
    pub fn reload(
        &mut self,
        backend: &dyn SecretBackend,
        config_name: &str,
    ) -> Result<(), SecretError> {
        self.customers = Self::load(backend, config_name)?.customers;
        Ok(())
    }

    pub fn customer(&self, name: &str) -> Option<&Customer> {
        self.customers.get(name)
    }

    pub fn hubspot_for(&self, name: &str) -> Option<&HubSpotIntegration> {
        self.customer(name)?.integrations.hubspot.as_ref()
    }

    /// Customers carrying a HubSpot integration, ordered by name so runs are
    /// deterministic.
    pub fn with_hubspot(&self) -> Vec<(&str, &HubSpotIntegration)> {
        let mut found: Vec<_> = self
            .customers
            .iter()
            .filter_map(|(name, customer)| {
                customer
                    .integrations
                    .hubspot
                    .as_ref()
                    .map(|integration| (name.as_str(), integration))
            })
            .collect();
        found.sort_by_key(|(name, _)| *name);
        found
    }

    /// All customers, ordered by name.
    pub fn all(&self) -> Vec<(&str, &Customer)> {
        let mut found: Vec<_> = self
            .customers
            .iter()
            .map(|(name, customer)| (name.as_str(), customer))
            .collect();
        found.sort_by_key(|(name, _)| *name);
        found
    }
}
