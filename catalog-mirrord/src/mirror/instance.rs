use std::collections::BTreeMap;
use chrono::{DateTime, Utc};
use serde::Serialize;
use shared::types::HealthRecord;

/// One healthy instance of a service.
#[derive(Debug, Clone, Serialize)]
pub struct InstanceEntry {
    /// Stable across health updates
    pub id: String,

    pub tags: Vec<String>,

    /// Service address, or the node address when the service registered none
    pub address: String,

    pub port: u16,

    /// Node the instance runs on
    pub node: String,

    pub meta: BTreeMap<String, String>,

    /// Last raw health record, kept for diagnostics
    pub raw: HealthRecord,

    pub first_seen: DateTime<Utc>,

    pub last_seen: DateTime<Utc>,
}

impl InstanceEntry {
    pub fn from_record(record: HealthRecord) -> Self {
        let now = Utc::now();
        Self {
            id: record.id.clone(),
            tags: record.tags.clone(),
            address: resolve_address(&record),
            port: record.port,
            node: record.node.clone(),
            meta: record.meta.clone(),
            raw: record,
            first_seen: now,
            last_seen: now,
        }
    }

    /// Overwrite every derived field from `record`. Returns true if any of
    /// them differed from the previous values.
    pub fn apply_health_record(&mut self, record: HealthRecord) -> bool {
        let next = Self::from_record(record);
        let changed = instance_data_changed(self, &next);

        self.id = next.id;
        self.tags = next.tags;
        self.address = next.address;
        self.port = next.port;
        self.node = next.node;
        self.meta = next.meta;
        self.raw = next.raw;
        self.last_seen = next.last_seen;

        changed
    }

    /// `address:port`
    pub fn endpoint(&self) -> String {
        if self.address.contains(':') {
            format!("[{}]:{}", self.address, self.port)
        } else {
            format!("{}:{}", self.address, self.port)
        }
    }
}

fn resolve_address(record: &HealthRecord) -> String {
    if record.service_address.is_empty() {
        record.node_address.clone()
    } else {
        record.service_address.clone()
    }
}

/// Timestamps and the raw record are bookkeeping and do not count as a change.
fn instance_data_changed(old: &InstanceEntry, new: &InstanceEntry) -> bool {
    old.id != new.id
        || old.tags != new.tags
        || old.address != new.address
        || old.port != new.port
        || old.node != new.node
        || old.meta != new.meta
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_record(id: &str) -> HealthRecord {
        HealthRecord {
            id: id.to_string(),
            tags: vec!["v1".to_string()],
            service_address: String::new(),
            node_address: "10.0.0.1".to_string(),
            node: "node-1".to_string(),
            port: 80,
            meta: BTreeMap::new(),
        }
    }

    #[test]
    fn test_address_falls_back_to_node() {
        let instance = InstanceEntry::from_record(test_record("i1"));

        assert_eq!(instance.id, "i1");
        assert_eq!(instance.address, "10.0.0.1");
        assert_eq!(instance.port, 80);
        assert_eq!(instance.endpoint(), "10.0.0.1:80");
    }

    #[test]
    fn test_service_address_preferred() {
        let mut record = test_record("i1");
        record.service_address = "192.168.1.5".to_string();

        let instance = InstanceEntry::from_record(record);
        assert_eq!(instance.address, "192.168.1.5");
    }

    #[test]
    fn test_ipv6_endpoint() {
        let mut record = test_record("i1");
        record.service_address = "fd00::1".to_string();

        assert_eq!(InstanceEntry::from_record(record).endpoint(), "[fd00::1]:80");
    }

    #[test]
    fn test_reapply_detects_field_changes() {
        let mut instance = InstanceEntry::from_record(test_record("i1"));

        assert!(!instance.apply_health_record(test_record("i1")), "identical record is not a change");

        let mut moved = test_record("i1");
        moved.port = 8080;
        assert!(instance.apply_health_record(moved));
        assert_eq!(instance.port, 8080);

        let mut retagged = test_record("i1");
        retagged.port = 8080;
        retagged.tags = vec!["v2".to_string()];
        assert!(instance.apply_health_record(retagged));
        assert_eq!(instance.tags, vec!["v2".to_string()]);
    }

    #[test]
    fn test_reapply_keeps_first_seen() {
        let mut instance = InstanceEntry::from_record(test_record("i1"));
        let first_seen = instance.first_seen;

        instance.apply_health_record(test_record("i1"));
        assert_eq!(instance.first_seen, first_seen);
        assert!(instance.last_seen >= first_seen);
    }
}
