use std::collections::{BTreeSet, HashMap};
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use shared::types::HealthRecord;
use crate::error::CatalogError;
use super::instance::InstanceEntry;

/// Reply slot of a caller waiting for a service's instances
pub type InstancesReply = oneshot::Sender<Result<Vec<InstanceEntry>, CatalogError>>;

/// Health watch owned by a service. `id` tells deliveries of this watch
/// apart from those of a watch that was torn down earlier.
#[derive(Debug)]
pub struct WatchHandle {
    id: u64,
    cancel: CancellationToken,
}

impl WatchHandle {
    pub fn new(id: u64, cancel: CancellationToken) -> Self {
        Self { id, cancel }
    }

    pub fn id(&self) -> u64 {
        self.id
    }
}

/// One named service in the catalog.
#[derive(Debug)]
pub struct ServiceEntry {
    name: String,
    tags: BTreeSet<String>,
    /// `None` until the first health snapshot arrives
    instances: Option<Vec<InstanceEntry>>,
    watch: Option<WatchHandle>,
    waiters: Vec<InstancesReply>,
}

impl ServiceEntry {
    pub fn new(name: impl Into<String>, tags: Vec<String>) -> Self {
        Self {
            name: name.into(),
            tags: tags.into_iter().collect(),
            instances: None,
            watch: None,
            waiters: Vec::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn tags(&self) -> &BTreeSet<String> {
        &self.tags
    }

    pub fn has_tag(&self, tag: &str) -> bool {
        self.tags.contains(tag)
    }

    /// Fetched instances, `None` until the first health snapshot
    pub fn instances(&self) -> Option<&[InstanceEntry]> {
        self.instances.as_deref()
    }

    pub fn is_watching(&self) -> bool {
        self.watch.is_some()
    }

    pub fn watch_id(&self) -> Option<u64> {
        self.watch.as_ref().map(WatchHandle::id)
    }

    /// Replace the tag set if it differs. Tags compare as sets: order and
    /// duplicates are ignored.
    pub fn apply_catalog_data(&mut self, tags: Vec<String>) -> bool {
        let tags: BTreeSet<String> = tags.into_iter().collect();
        if tags == self.tags {
            return false;
        }

        tracing::info!("{}: tags changed from {:?} to {:?}", self.name, self.tags, tags);
        self.tags = tags;
        true
    }

    /// Reconcile the instances against a health snapshot by id.
    ///
    /// Returns true if an instance was added, removed or changed. The first
    /// snapshot only establishes the baseline and always returns false: it
    /// answers a caller that is already waiting for exactly this data.
    pub fn apply_health_data(&mut self, records: Vec<HealthRecord>) -> bool {
        let is_update = self.instances.is_some();

        // Last record wins for a duplicated id, first occurrence keeps its position
        let mut order = Vec::with_capacity(records.len());
        let mut incoming: HashMap<String, HealthRecord> = HashMap::with_capacity(records.len());
        for record in records {
            if !incoming.contains_key(&record.id) {
                order.push(record.id.clone());
            }
            incoming.insert(record.id.clone(), record);
        }

        let mut changed = false;
        let mut instances = self.instances.take().unwrap_or_default();

        instances.retain_mut(|instance| match incoming.remove(&instance.id) {
            Some(record) => {
                if instance.apply_health_record(record) {
                    changed = true;
                }
                true
            }
            None => {
                tracing::debug!("{}: instance removed: {}", self.name, instance.id);
                changed = true;
                false
            }
        });

        // Whatever is left in `incoming` is new
        for id in order {
            if let Some(record) = incoming.remove(&id) {
                tracing::debug!("{}: found new instance: {}", self.name, id);
                instances.push(InstanceEntry::from_record(record));
                changed = true;
            }
        }

        self.instances = Some(instances);
        is_update && changed
    }

    pub(crate) fn attach_watch(&mut self, handle: WatchHandle) {
        self.watch = Some(handle);
    }

    pub(crate) fn park(&mut self, reply: InstancesReply) {
        self.waiters.push(reply);
    }

    pub(crate) fn has_waiters(&self) -> bool {
        !self.waiters.is_empty()
    }

    /// Answer every parked caller with the current instances
    pub(crate) fn resolve_waiters(&mut self) {
        let instances = self.instances.clone().unwrap_or_default();
        for reply in self.waiters.drain(..) {
            let _ = reply.send(Ok(instances.clone()));
        }
    }

    /// Fail every parked caller
    pub(crate) fn fail_waiters(&mut self, error: impl Fn() -> CatalogError) {
        for reply in self.waiters.drain(..) {
            let _ = reply.send(Err(error()));
        }
    }

    /// Close the health watch if one is open. Safe to call repeatedly.
    /// Returns true if a watch was closed.
    pub fn teardown(&mut self) -> bool {
        let name = self.name.clone();
        self.fail_waiters(|| CatalogError::ServiceRemoved(name.clone()));

        match self.watch.take() {
            Some(watch) => {
                tracing::debug!("Stopping watch for service: {}", self.name);
                watch.cancel.cancel();
                true
            }
            None => false,
        }
    }
}
