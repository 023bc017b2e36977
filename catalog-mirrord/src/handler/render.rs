use std::collections::{BTreeMap, BTreeSet};
use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use anyhow::{Context, Result};
use async_trait::async_trait;
use futures::future::join_all;
use serde::Serialize;
use sha2::{Digest, Sha256};
use crate::catalog_manager::Catalog;
use crate::config::RenderFormat;
use crate::error::CatalogError;
use crate::mirror::InstanceEntry;
use super::UpdateHandler;

/// Writes the mirrored catalog to a file on every update cycle
pub struct RenderHandler {
    name: String,
    path: PathBuf,
    format: RenderFormat,
    tags: Vec<String>,
    /// Digest of the last content written
    last_digest: Mutex<Option<[u8; 32]>>,
}

#[derive(Serialize)]
struct RenderedService<'a> {
    name: &'a str,
    tags: &'a BTreeSet<String>,
    instances: Vec<RenderedInstance<'a>>,
}

#[derive(Serialize)]
struct RenderedInstance<'a> {
    id: &'a str,
    address: &'a str,
    port: u16,
    node: &'a str,
    tags: &'a [String],
    meta: &'a BTreeMap<String, String>,
}

impl<'a> From<&'a InstanceEntry> for RenderedInstance<'a> {
    fn from(instance: &'a InstanceEntry) -> Self {
        Self {
            id: &instance.id,
            address: &instance.address,
            port: instance.port,
            node: &instance.node,
            tags: &instance.tags,
            meta: &instance.meta,
        }
    }
}

impl RenderHandler {
    pub fn new(path: PathBuf, format: RenderFormat, tags: Vec<String>) -> Self {
        Self {
            name: format!("render:{}", path.display()),
            path,
            format,
            tags,
            last_digest: Mutex::new(None),
        }
    }

    async fn render(&self, catalog: &Catalog) -> Result<String> {
        let services = catalog.services_by_tags(&self.tags).await?;
        let results = join_all(services.iter().map(|service| service.instances())).await;

        let mut fetched = Vec::with_capacity(services.len());
        for (service, result) in services.iter().zip(results) {
            match result {
                Ok(instances) => fetched.push((service, instances)),
                // Left the catalog after it was listed; its removal reruns the cycle
                Err(CatalogError::ServiceRemoved(_) | CatalogError::ServiceNotFound(_)) => {
                    tracing::debug!("Service {} left the catalog while rendering, skipping", service.name());
                }
                Err(e) => return Err(e.into()),
            }
        }

        let rendered: Vec<RenderedService<'_>> = fetched
            .iter()
            .map(|(service, instances)| RenderedService {
                name: service.name(),
                tags: service.tags(),
                instances: instances.iter().map(RenderedInstance::from).collect(),
            })
            .collect();

        match self.format {
            RenderFormat::Json => {
                let mut json = serde_json::to_string_pretty(&rendered)?;
                json.push('\n');
                Ok(json)
            }
            RenderFormat::Text => Ok(render_text(&rendered)),
        }
    }

    fn last_digest(&self) -> std::sync::MutexGuard<'_, Option<[u8; 32]>> {
        self.last_digest.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// One line per service followed by one indented line per instance
fn render_text(services: &[RenderedService<'_>]) -> String {
    let mut out = String::new();
    for service in services {
        let tags: Vec<&str> = service.tags.iter().map(String::as_str).collect();
        let _ = writeln!(out, "{} [{}]", service.name, tags.join(","));
        for instance in &service.instances {
            let endpoint = if instance.address.contains(':') {
                format!("[{}]:{}", instance.address, instance.port)
            } else {
                format!("{}:{}", instance.address, instance.port)
            };
            let _ = writeln!(out, "  {} {} {}", instance.id, endpoint, instance.node);
        }
    }
    out
}

/// Replace `path` with `contents` through a temporary file in the same
/// directory, so readers never see a partial file
async fn write_atomic(path: &Path, contents: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent)
            .await
            .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
    }

    let mut tmp_name = path
        .file_name()
        .with_context(|| format!("Render path has no file name: {}", path.display()))?
        .to_os_string();
    tmp_name.push(".tmp");
    let tmp = path.with_file_name(tmp_name);

    tokio::fs::write(&tmp, contents)
        .await
        .with_context(|| format!("Failed to write: {}", tmp.display()))?;
    tokio::fs::rename(&tmp, path)
        .await
        .with_context(|| format!("Failed to move {} into place", tmp.display()))?;
    Ok(())
}

#[async_trait]
impl UpdateHandler for RenderHandler {
    fn name(&self) -> &str {
        &self.name
    }

    async fn handle(&self, catalog: &Catalog) -> Result<()> {
        let contents = self.render(catalog).await?;
        let digest: [u8; 32] = Sha256::digest(contents.as_bytes()).into();

        if *self.last_digest() == Some(digest) {
            tracing::debug!("Rendered catalog unchanged, skipping write to {}", self.path.display());
            return Ok(());
        }

        write_atomic(&self.path, contents.as_bytes()).await?;
        *self.last_digest() = Some(digest);
        tracing::info!("Wrote catalog to {}", self.path.display());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;
    use shared::types::{CatalogSnapshot, HealthRecord};
    use tokio_util::sync::CancellationToken;
    use crate::catalog_manager;
    use crate::mirror::CatalogMirror;
    use crate::scheduler;
    use crate::watch::manual::ManualSource;
    use crate::watch::CatalogSource;

    fn record(id: &str, service_address: &str, port: u16) -> HealthRecord {
        HealthRecord {
            id: id.to_string(),
            tags: Vec::new(),
            service_address: service_address.to_string(),
            node_address: "10.0.0.1".to_string(),
            node: "node-1".to_string(),
            port,
            meta: BTreeMap::new(),
        }
    }

    /// A running catalog manager fed by a manual source
    async fn catalog_with(services: &[(&str, &[&str])]) -> (Arc<ManualSource>, Catalog, CancellationToken) {
        let source = Arc::new(ManualSource::new());
        let (handle, _requests) = scheduler::channel();
        let (mirror, health_rx) = CatalogMirror::new(source.clone(), handle);
        let (catalog, commands) = catalog_manager::channel();
        let cancel = CancellationToken::new();
        tokio::spawn(catalog_manager::run(
            mirror,
            health_rx,
            commands,
            source.watch_catalog(),
            cancel.clone(),
        ));

        let snapshot: CatalogSnapshot = services
            .iter()
            .map(|(name, tags)| (name.to_string(), tags.iter().map(|t| t.to_string()).collect()))
            .collect();
        source.publish_catalog(Ok(snapshot)).await;
        for _ in 0..500 {
            if catalog.services().await.unwrap().len() == services.len() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        (source, catalog, cancel)
    }

    /// Answer the first health watch of `service` once it is opened
    fn serve_health(source: &Arc<ManualSource>, service: &'static str, records: Vec<HealthRecord>) {
        let source = source.clone();
        tokio::spawn(async move {
            while source.health_watches_opened(service) == 0 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
            source.publish_health(service, Ok(records)).await;
        });
    }

    #[tokio::test]
    async fn test_render_text_filtered_by_tags() {
        let (source, catalog, cancel) = catalog_with(&[("api", &["http", "public"]), ("db", &["tcp"])]).await;
        serve_health(&source, "api", vec![record("api-1", "", 80), record("api-2", "10.0.0.9", 8080)]);

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out/services.txt");
        let handler = RenderHandler::new(path.clone(), RenderFormat::Text, vec!["http".to_string()]);
        handler.handle(&catalog).await.unwrap();

        let contents = std::fs::read_to_string(&path).unwrap();
        assert_eq!(
            contents,
            "api [http,public]\n  api-1 10.0.0.1:80 node-1\n  api-2 10.0.0.9:8080 node-1\n"
        );
        assert!(!path.with_file_name("services.txt.tmp").exists(), "temp file is moved into place");
        cancel.cancel();
    }

    #[tokio::test]
    async fn test_render_json() {
        let (source, catalog, cancel) = catalog_with(&[("db", &["tcp"])]).await;
        serve_health(&source, "db", vec![record("db-1", "fd00::1", 5432)]);

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("services.json");
        let handler = RenderHandler::new(path.clone(), RenderFormat::Json, Vec::new());
        handler.handle(&catalog).await.unwrap();

        let value: serde_json::Value = serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(value[0]["name"], "db");
        assert_eq!(value[0]["tags"][0], "tcp");
        assert_eq!(value[0]["instances"][0]["address"], "fd00::1");
        assert_eq!(value[0]["instances"][0]["port"], 5432);
        cancel.cancel();
    }

    #[tokio::test]
    async fn test_unchanged_render_skips_write() {
        let (source, catalog, cancel) = catalog_with(&[("api", &[])]).await;
        serve_health(&source, "api", vec![record("api-1", "", 80)]);

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("services.txt");
        let handler = RenderHandler::new(path.clone(), RenderFormat::Text, Vec::new());
        handler.handle(&catalog).await.unwrap();

        // A second write would replace the edit
        std::fs::write(&path, "edited").unwrap();
        handler.handle(&catalog).await.unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "edited");
        cancel.cancel();
    }

    #[tokio::test]
    async fn test_service_removed_while_rendering_is_skipped() {
        let (source, catalog, cancel) = catalog_with(&[("api", &[]), ("db", &[])]).await;
        serve_health(&source, "db", vec![record("db-1", "", 5432)]);

        // Drop api from the catalog as soon as its instances are requested
        let churn = source.clone();
        tokio::spawn(async move {
            while churn.health_watches_opened("api") == 0 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
            let snapshot = CatalogSnapshot::from([("db".to_string(), Vec::new())]);
            churn.publish_catalog(Ok(snapshot)).await;
        });

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("services.txt");
        let handler = RenderHandler::new(path.clone(), RenderFormat::Text, Vec::new());
        handler.handle(&catalog).await.unwrap();

        assert_eq!(
            std::fs::read_to_string(&path).unwrap(),
            "db []\n  db-1 10.0.0.1:5432 node-1\n",
            "removed service is left out, the rest is written"
        );
        cancel.cancel();
    }

    #[tokio::test]
    async fn test_failed_instance_fetch_fails_handler() {
        let (source, catalog, cancel) = catalog_with(&[("api", &[])]).await;
        let failing = source.clone();
        tokio::spawn(async move {
            while failing.health_watches_opened("api") == 0 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
            failing
                .publish_health("api", Err(crate::watch::WatchError::Connection("refused".into())))
                .await;
        });

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("services.txt");
        let handler = RenderHandler::new(path.clone(), RenderFormat::Text, Vec::new());

        assert!(handler.handle(&catalog).await.is_err());
        assert!(!path.exists(), "nothing is written when rendering fails");
        cancel.cancel();
    }
}
