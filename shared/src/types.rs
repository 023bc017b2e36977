use std::collections::BTreeMap;
use serde::{Serialize, Deserialize};

/// Point-in-time mapping from service name to its tag list.
pub type CatalogSnapshot = BTreeMap<String, Vec<String>>;

/// One instance health record for a service, independent of the transport
/// that delivered it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthRecord {
    /// Instance id, stable across health updates
    pub id: String,

    /// Tags registered on the instance
    #[serde(default)]
    pub tags: Vec<String>,

    /// Address registered with the service, may be empty
    #[serde(default)]
    pub service_address: String,

    /// Address of the node running the instance
    #[serde(default)]
    pub node_address: String,

    /// Name of the node running the instance
    #[serde(default)]
    pub node: String,

    pub port: u16,

    /// Free-form service metadata
    #[serde(default)]
    pub meta: BTreeMap<String, String>,
}

/// Body of `GET /v1/catalog/services`. Consul reports `null` for services
/// registered without tags.
pub type ConsulCatalogServices = BTreeMap<String, Option<Vec<String>>>;

/// Convert the Consul catalog listing into a snapshot.
pub fn catalog_snapshot_from_consul(services: ConsulCatalogServices) -> CatalogSnapshot {
    services
        .into_iter()
        .map(|(name, tags)| (name, tags.unwrap_or_default()))
        .collect()
}

/// One element of `GET /v1/health/service/<name>`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ConsulHealthEntry {
    pub node: ConsulNode,
    pub service: ConsulService,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ConsulNode {
    #[serde(default)]
    pub node: String,
    #[serde(default)]
    pub address: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ConsulService {
    #[serde(rename = "ID")]
    pub id: String,
    #[serde(default)]
    pub service: String,
    #[serde(default)]
    pub tags: Option<Vec<String>>,
    #[serde(default)]
    pub address: String,
    #[serde(default)]
    pub port: u16,
    #[serde(default)]
    pub meta: Option<BTreeMap<String, String>>,
}

impl From<ConsulHealthEntry> for HealthRecord {
    fn from(entry: ConsulHealthEntry) -> Self {
        HealthRecord {
            id: entry.service.id,
            tags: entry.service.tags.unwrap_or_default(),
            service_address: entry.service.address,
            node_address: entry.node.address,
            node: entry.node.node,
            port: entry.service.port,
            meta: entry.service.meta.unwrap_or_default(),
        }
    }
}
