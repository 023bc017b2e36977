use std::collections::BTreeSet;
use serde::Serialize;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use shared::types::CatalogSnapshot;
use crate::error::CatalogError;
use crate::mirror::{CatalogMirror, HealthEvent, InstanceEntry, InstancesReply, ServiceEntry};
use crate::watch::Subscription;

/// Commands sent to the catalog manager task
pub enum CatalogCommand {
    Services(oneshot::Sender<Vec<ServiceInfo>>),
    ServiceByName(String, oneshot::Sender<Option<ServiceInfo>>),
    ServicesByTag(String, oneshot::Sender<Vec<ServiceInfo>>),
    ServicesByTags(Vec<String>, oneshot::Sender<Vec<ServiceInfo>>),
    Instances(String, InstancesReply),
    Fingerprint(oneshot::Sender<String>),
}

/// Name and tags of a service at the time of the query
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ServiceInfo {
    pub name: String,
    pub tags: BTreeSet<String>,
}

impl From<&ServiceEntry> for ServiceInfo {
    fn from(entry: &ServiceEntry) -> Self {
        Self {
            name: entry.name().to_string(),
            tags: entry.tags().clone(),
        }
    }
}

/// Handle to query the catalog mirror. This is what update handlers receive.
#[derive(Debug, Clone)]
pub struct Catalog {
    tx: mpsc::Sender<CatalogCommand>,
}

/// A service returned from a [`Catalog`] query
#[derive(Debug, Clone)]
pub struct ServiceView {
    info: ServiceInfo,
    catalog: Catalog,
}

impl ServiceView {
    pub fn name(&self) -> &str {
        &self.info.name
    }

    pub fn tags(&self) -> &BTreeSet<String> {
        &self.info.tags
    }

    pub fn has_tag(&self, tag: &str) -> bool {
        self.info.tags.contains(tag)
    }

    pub fn info(&self) -> &ServiceInfo {
        &self.info
    }

    /// Healthy instances of this service. The first call for a service waits
    /// for its health watch to deliver; later calls answer at once.
    pub async fn instances(&self) -> Result<Vec<InstanceEntry>, CatalogError> {
        self.catalog.instances(&self.info.name).await
    }
}

/// Create a catalog handle and the command stream for [`run`]
pub fn channel() -> (Catalog, mpsc::Receiver<CatalogCommand>) {
    let (tx, rx) = mpsc::channel(256);
    (Catalog { tx }, rx)
}

impl Catalog {
    /// A handle whose manager is gone, every query fails with `Closed`
    #[cfg(test)]
    pub(crate) fn detached() -> Self {
        channel().0
    }

    async fn request<T>(
        &self,
        command: impl FnOnce(oneshot::Sender<T>) -> CatalogCommand,
    ) -> Result<T, CatalogError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(command(reply))
            .await
            .map_err(|_| CatalogError::Closed)?;
        rx.await.map_err(|_| CatalogError::Closed)
    }

    fn views(&self, infos: Vec<ServiceInfo>) -> Vec<ServiceView> {
        infos
            .into_iter()
            .map(|info| ServiceView {
                info,
                catalog: self.clone(),
            })
            .collect()
    }

    /// All services in discovery order
    pub async fn services(&self) -> Result<Vec<ServiceView>, CatalogError> {
        let infos = self.request(CatalogCommand::Services).await?;
        Ok(self.views(infos))
    }

    pub async fn service_by_name(&self, name: &str) -> Result<Option<ServiceView>, CatalogError> {
        let info = self
            .request(|reply| CatalogCommand::ServiceByName(name.to_string(), reply))
            .await?;
        Ok(info.map(|info| ServiceView {
            info,
            catalog: self.clone(),
        }))
    }

    pub async fn services_by_tag(&self, tag: &str) -> Result<Vec<ServiceView>, CatalogError> {
        let infos = self
            .request(|reply| CatalogCommand::ServicesByTag(tag.to_string(), reply))
            .await?;
        Ok(self.views(infos))
    }

    /// Services carrying every tag in `tags`
    pub async fn services_by_tags(&self, tags: &[String]) -> Result<Vec<ServiceView>, CatalogError> {
        let infos = self
            .request(|reply| CatalogCommand::ServicesByTags(tags.to_vec(), reply))
            .await?;
        Ok(self.views(infos))
    }

    /// Healthy instances of the named service
    pub async fn instances(&self, name: &str) -> Result<Vec<InstanceEntry>, CatalogError> {
        self.request(|reply| CatalogCommand::Instances(name.to_string(), reply))
            .await?
    }

    /// Digest of the mirrored state, see [`crate::mirror::hash`]
    pub async fn fingerprint(&self) -> Result<String, CatalogError> {
        self.request(CatalogCommand::Fingerprint).await
    }
}

fn handle_command(mirror: &mut CatalogMirror, command: CatalogCommand) {
    match command {
        CatalogCommand::Services(reply) => {
            let _ = reply.send(mirror.services().iter().map(ServiceInfo::from).collect());
        }
        CatalogCommand::ServiceByName(name, reply) => {
            let _ = reply.send(mirror.service_by_name(&name).map(ServiceInfo::from));
        }
        CatalogCommand::ServicesByTag(tag, reply) => {
            let services = mirror.services_by_tag(&tag);
            let _ = reply.send(services.into_iter().map(ServiceInfo::from).collect());
        }
        CatalogCommand::ServicesByTags(tags, reply) => {
            let services = mirror.services_by_tags(&tags);
            let _ = reply.send(services.into_iter().map(ServiceInfo::from).collect());
        }
        CatalogCommand::Instances(name, reply) => {
            mirror.request_instances(&name, reply);
        }
        CatalogCommand::Fingerprint(reply) => {
            let _ = reply.send(mirror.fingerprint());
        }
    }
}

/// Catalog manager event loop - owns the mirror and serializes catalog
/// deliveries, health deliveries and queries
pub async fn run(
    mut mirror: CatalogMirror,
    mut health_rx: mpsc::UnboundedReceiver<HealthEvent>,
    mut commands: mpsc::Receiver<CatalogCommand>,
    mut catalog_watch: Subscription<CatalogSnapshot>,
    cancel: CancellationToken,
) {
    let mut watching = true;

    loop {
        tokio::select! {
            Some(command) = commands.recv() => {
                handle_command(&mut mirror, command);
            }
            event = catalog_watch.next(), if watching => {
                match event {
                    Some(Ok(snapshot)) => {
                        if mirror.apply_catalog_snapshot(snapshot) {
                            mirror.request_update();
                        }
                    }
                    Some(Err(e)) => {
                        tracing::error!("Error while watching catalog service list: {}", e);
                    }
                    None => {
                        tracing::warn!("Catalog watch ended, mirror will no longer change");
                        watching = false;
                    }
                }
            }
            Some(event) = health_rx.recv() => {
                mirror.apply_health_event(event);
            }
            _ = cancel.cancelled() => {
                tracing::info!("Catalog manager shutting down");
                break;
            }
        }
    }

    mirror.teardown();
}
