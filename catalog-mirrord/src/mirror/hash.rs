use std::collections::{BTreeMap, BTreeSet};
use serde::Serialize;
use sha2::{Sha256, Digest};
use super::instance::InstanceEntry;
use super::service::ServiceEntry;

/// Hash only what handlers can observe. Timestamps and raw records change
/// on every delivery without representing a catalog change.
#[derive(Serialize)]
struct ServiceView<'a> {
    name: &'a str,
    tags: &'a BTreeSet<String>,
    instances: Option<Vec<InstanceView<'a>>>,
}

#[derive(Serialize)]
struct InstanceView<'a> {
    id: &'a str,
    tags: &'a [String],
    address: &'a str,
    port: u16,
    node: &'a str,
    meta: &'a BTreeMap<String, String>,
}

impl<'a> From<&'a InstanceEntry> for InstanceView<'a> {
    fn from(instance: &'a InstanceEntry) -> Self {
        InstanceView {
            id: &instance.id,
            tags: &instance.tags,
            address: &instance.address,
            port: instance.port,
            node: &instance.node,
            meta: &instance.meta,
        }
    }
}

/// Computes a SHA-256 fingerprint of the mirrored catalog.
/// Services are sorted by name and instances by id, so discovery order does
/// not affect the result.
pub fn compute_fingerprint(services: &[ServiceEntry]) -> String {
    let mut views: Vec<ServiceView<'_>> = services
        .iter()
        .map(|s| ServiceView {
            name: s.name(),
            tags: s.tags(),
            instances: s.instances().map(|instances| {
                let mut list: Vec<InstanceView<'_>> = instances.iter().map(InstanceView::from).collect();
                list.sort_by(|a, b| a.id.cmp(&b.id));
                list
            }),
        })
        .collect();
    views.sort_by(|a, b| a.name.cmp(&b.name));

    let mut hasher = Sha256::new();
    for view in &views {
        // Serializing borrowed strings and maps cannot fail
        if let Ok(json) = serde_json::to_vec(view) {
            hasher.update(&json);
        }
        hasher.update(b"\n");
    }
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared::types::HealthRecord;

    fn test_record(id: &str, port: u16) -> HealthRecord {
        HealthRecord {
            id: id.to_string(),
            tags: Vec::new(),
            service_address: "10.0.0.2".to_string(),
            node_address: "10.0.0.1".to_string(),
            node: "node-1".to_string(),
            port,
            meta: BTreeMap::new(),
        }
    }

    #[test]
    fn test_fingerprint_deterministic() {
        let a = ServiceEntry::new("a", vec!["x".to_string()]);
        let b = ServiceEntry::new("b", vec!["y".to_string()]);
        let a2 = ServiceEntry::new("a", vec!["x".to_string()]);
        let b2 = ServiceEntry::new("b", vec!["y".to_string()]);

        assert_eq!(
            compute_fingerprint(&[a, b]),
            compute_fingerprint(&[b2, a2]),
            "Fingerprint should not depend on discovery order"
        );
    }

    #[test]
    fn test_fingerprint_changes_on_modification() {
        let mut entry = ServiceEntry::new("a", Vec::new());
        entry.apply_health_data(vec![test_record("i1", 80)]);
        let before = compute_fingerprint(std::slice::from_ref(&entry));

        entry.apply_health_data(vec![test_record("i1", 8080)]);
        let after = compute_fingerprint(std::slice::from_ref(&entry));

        assert_ne!(before, after, "Fingerprint should change when an instance changes");
    }

    #[test]
    fn test_fingerprint_stable_across_redelivery() {
        let mut entry = ServiceEntry::new("a", Vec::new());
        entry.apply_health_data(vec![test_record("i1", 80)]);
        let before = compute_fingerprint(std::slice::from_ref(&entry));

        // Same data again only moves last_seen
        entry.apply_health_data(vec![test_record("i1", 80)]);
        let after = compute_fingerprint(std::slice::from_ref(&entry));

        assert_eq!(before, after);
    }

    #[test]
    fn test_fetched_empty_differs_from_unfetched() {
        let unfetched = ServiceEntry::new("a", Vec::new());
        let mut fetched = ServiceEntry::new("a", Vec::new());
        fetched.apply_health_data(Vec::new());

        assert_ne!(compute_fingerprint(&[unfetched]), compute_fingerprint(&[fetched]));
    }
}
