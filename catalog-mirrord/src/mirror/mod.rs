//! Local mirror of the remote catalog.
//!
//! [`CatalogMirror`] is owned by a single task (see `catalog_manager`), so
//! reconciliation of one snapshot never interleaves with another.

pub mod hash;
pub mod instance;
pub mod service;

use std::sync::Arc;
use tokio::sync::mpsc;
use shared::types::{CatalogSnapshot, HealthRecord};
use crate::error::CatalogError;
use crate::scheduler::SchedulerHandle;
use crate::watch::{CatalogSource, WatchResult};

pub use instance::InstanceEntry;
pub use service::{InstancesReply, ServiceEntry, WatchHandle};

/// A health delivery routed back to the mirror from a service's watch
#[derive(Debug)]
pub struct HealthEvent {
    pub service: String,
    pub watch_id: u64,
    pub result: WatchResult<Vec<HealthRecord>>,
}

pub struct CatalogMirror {
    /// Discovery order
    services: Vec<ServiceEntry>,
    last_snapshot: Option<CatalogSnapshot>,
    source: Arc<dyn CatalogSource>,
    health_tx: mpsc::UnboundedSender<HealthEvent>,
    scheduler: SchedulerHandle,
    next_watch_id: u64,
}

impl CatalogMirror {
    /// Create an empty mirror. Health deliveries for watches it opens arrive
    /// on the returned receiver and must be fed back through
    /// [`CatalogMirror::apply_health_event`].
    pub fn new(
        source: Arc<dyn CatalogSource>,
        scheduler: SchedulerHandle,
    ) -> (Self, mpsc::UnboundedReceiver<HealthEvent>) {
        let (health_tx, health_rx) = mpsc::unbounded_channel();
        let mirror = Self {
            services: Vec::new(),
            last_snapshot: None,
            source,
            health_tx,
            scheduler,
            next_watch_id: 1,
        };
        (mirror, health_rx)
    }

    pub fn services(&self) -> &[ServiceEntry] {
        &self.services
    }

    /// Last catalog snapshot received, kept for diagnostics
    pub fn last_snapshot(&self) -> Option<&CatalogSnapshot> {
        self.last_snapshot.as_ref()
    }

    /// Reconcile the mirror against a catalog snapshot. Returns true if a
    /// service was added or removed or its tags changed.
    pub fn apply_catalog_snapshot(&mut self, snapshot: CatalogSnapshot) -> bool {
        let mut changed = false;
        let mut remaining = snapshot.clone();

        self.services.retain_mut(|service| match remaining.remove(service.name()) {
            Some(tags) => {
                if service.apply_catalog_data(tags) {
                    changed = true;
                }
                true
            }
            None => {
                // No longer registered, stop watching its health
                tracing::info!("Service removed: {}", service.name());
                service.teardown();
                changed = true;
                false
            }
        });

        // Whatever is left was not known before
        for (name, tags) in remaining {
            tracing::info!("Found new service: {}", name);
            self.services.push(ServiceEntry::new(name, tags));
            changed = true;
        }

        self.last_snapshot = Some(snapshot);
        changed
    }

    pub fn service_by_name(&self, name: &str) -> Option<&ServiceEntry> {
        self.services.iter().find(|s| s.name() == name)
    }

    pub fn services_by_tag(&self, tag: &str) -> Vec<&ServiceEntry> {
        self.services.iter().filter(|s| s.has_tag(tag)).collect()
    }

    /// Services carrying every tag in `tags`
    pub fn services_by_tags(&self, tags: &[String]) -> Vec<&ServiceEntry> {
        self.services
            .iter()
            .filter(|s| tags.iter().all(|tag| s.has_tag(tag)))
            .collect()
    }

    pub fn request_update(&self) {
        self.scheduler.request_update();
    }

    pub fn fingerprint(&self) -> String {
        hash::compute_fingerprint(&self.services)
    }

    /// Answer `reply` with the instances of `name`. Answers at once when they
    /// are known, otherwise parks the reply until the service's first health
    /// snapshot, opening the health watch if it is not open yet.
    pub fn request_instances(&mut self, name: &str, reply: InstancesReply) {
        let Some(service) = self.services.iter_mut().find(|s| s.name() == name) else {
            let _ = reply.send(Err(CatalogError::ServiceNotFound(name.to_string())));
            return;
        };

        if let Some(instances) = service.instances() {
            let _ = reply.send(Ok(instances.to_vec()));
            return;
        }

        service.park(reply);
        if service.is_watching() {
            return;
        }

        let watch_id = self.next_watch_id;
        self.next_watch_id += 1;

        tracing::debug!("Starting watch for service: {}", name);
        let mut sub = self.source.watch_health(name);
        service.attach_watch(WatchHandle::new(watch_id, sub.cancel_token()));

        let health_tx = self.health_tx.clone();
        let service_name = name.to_string();
        tokio::spawn(async move {
            while let Some(result) = sub.next().await {
                let event = HealthEvent {
                    service: service_name.clone(),
                    watch_id,
                    result,
                };
                if health_tx.send(event).is_err() {
                    break;
                }
            }
        });
    }

    /// Apply a delivery from a service's health watch
    pub fn apply_health_event(&mut self, event: HealthEvent) {
        let Some(service) = self.services.iter_mut().find(|s| s.name() == event.service) else {
            tracing::debug!("Ignoring health data for unknown service: {}", event.service);
            return;
        };
        if service.watch_id() != Some(event.watch_id) {
            tracing::debug!("Ignoring health data from a closed watch for service: {}", event.service);
            return;
        }

        match event.result {
            Ok(records) => {
                if service.apply_health_data(records) {
                    self.scheduler.request_update();
                }
                if service.has_waiters() {
                    service.resolve_waiters();
                }
            }
            Err(e) => {
                tracing::error!("Error while watching status for service {}: {}", event.service, e);
                // Only callers still waiting on the first snapshot see the error
                if service.instances().is_none() {
                    let name = event.service.clone();
                    service.fail_waiters(|| CatalogError::InitialFetch {
                        service: name.clone(),
                        source: e.clone(),
                    });
                }
            }
        }
    }

    /// Close every health watch
    pub fn teardown(&mut self) {
        for service in &mut self.services {
            service.teardown();
        }
    }
}
