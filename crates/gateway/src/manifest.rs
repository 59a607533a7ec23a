//! Static service manifest
//!
//! Services that cannot call `POST /bus/register` themselves can be listed
//! in a JSON manifest loaded at gateway startup:
//!
//! ```json
//! {
//!   "services": [
//!     {"name": "user-service", "host": "localhost", "port": 3001,
//!      "routes": [{"path": "/api/users", "methods": ["GET", "POST"]}]}
//!   ]
//! }
//! ```

use meridian_shared::service_bus::{ServiceRecord, ServiceRegistration, ServiceRegistry};
use meridian_shared::{MeridianError, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::{info, instrument};

/// Services registered by the gateway on startup
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ServiceManifest {
    /// Remote services, in registration order
    #[serde(default)]
    pub services: Vec<ServiceRegistration>,
}

impl ServiceManifest {
    /// Parses a manifest from JSON text
    pub fn from_json(text: &str) -> Result<Self> {
        serde_json::from_str(text).map_err(|e| {
            MeridianError::configuration(format!("Invalid service manifest: {}", e), Some(Box::new(e)))
        })
    }

    /// Reads and parses a manifest file
    #[instrument(skip_all, fields(path = %path.as_ref().display()))]
    pub async fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = tokio::fs::read_to_string(path).await.map_err(|e| {
            MeridianError::storage(
                path.display().to_string(),
                "Failed to read service manifest",
                Some(Box::new(e)),
            )
        })?;
        Self::from_json(&text)
    }

    /// Registers every listed service as remote
    ///
    /// Stops at the first invalid entry; entries before it stay registered.
    pub async fn register_all(&self, registry: &ServiceRegistry) -> Result<Vec<ServiceRecord>> {
        let mut records = Vec::with_capacity(self.services.len());
        for registration in &self.services {
            let record = registry.register(registration.clone().into_record(false)).await?;
            records.push(record);
        }
        info!(count = records.len(), "Registered services from manifest");
        Ok(records)
    }
}
