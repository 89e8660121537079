//! Source routing table
//! Maps the `source` attachment name of a metric line to the tenant it is stored under

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::Result;

/// Immutable source → tenant mapping, loaded once at startup.
///
/// Configured from a JSON object such as
/// `{"DATABASE": "tenant_a", "DATABASE_ONYX": "tenant_b"}`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RoutingTable {
    routes: HashMap<String, String>,
}

impl RoutingTable {
    pub fn new(routes: HashMap<String, String>) -> Self {
        Self { routes }
    }

    /// Parse the routing JSON, failing on malformed input.
    pub fn try_from_json(json: &str) -> Result<Self> {
        let routes: HashMap<String, String> = serde_json::from_str(json)?;
        Ok(Self { routes })
    }

    /// Parse the routing JSON. Malformed input yields an empty table, so every
    /// record is dropped at the router.
    pub fn from_json(json: &str) -> Self {
        match Self::try_from_json(json) {
            Ok(table) => {
                info!("Loaded routing table with {} sources", table.len());
                table
            }
            Err(e) => {
                warn!("Invalid routing table JSON, no tenants configured: {}", e);
                Self::default()
            }
        }
    }

    /// Tenant identifier for a source tag.
    pub fn resolve(&self, source: &str) -> Option<&str> {
        self.routes.get(source).map(String::as_str)
    }

    pub fn sources(&self) -> impl Iterator<Item = &str> {
        self.routes.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}

impl FromIterator<(String, String)> for RoutingTable {
    fn from_iter<I: IntoIterator<Item = (String, String)>>(iter: I) -> Self {
        Self {
            routes: iter.into_iter().collect(),
        }
    }
}
