use std::collections::HashMap;
use std::sync::Mutex;
use shared::types::{CatalogSnapshot, HealthRecord};
use super::{subscription, CatalogSource, Publisher, Subscription, WatchResult};

/// A source driven by the embedding program instead of a remote catalog.
///
/// Every published item fans out to all live subscriptions for that watch.
/// Also records how many health watches were opened and cancelled per
/// service.
#[derive(Default)]
pub struct ManualSource {
    inner: Mutex<Inner>,
}

#[derive(Default)]
struct Inner {
    catalog: Vec<Publisher<CatalogSnapshot>>,
    health: HashMap<String, Vec<Publisher<Vec<HealthRecord>>>>,
    health_opened: HashMap<String, usize>,
}

impl ManualSource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Publish to every catalog subscription. Returns how many received it.
    pub async fn publish_catalog(&self, item: WatchResult<CatalogSnapshot>) -> usize {
        let publishers = {
            let mut inner = self.lock();
            inner.catalog.retain(|p| !p.is_cancelled());
            inner.catalog.clone()
        };
        broadcast(&publishers, item).await
    }

    /// Publish to every health subscription of `service`. Returns how many
    /// received it.
    pub async fn publish_health(&self, service: &str, item: WatchResult<Vec<HealthRecord>>) -> usize {
        let publishers = {
            let mut inner = self.lock();
            match inner.health.get_mut(service) {
                Some(list) => {
                    list.retain(|p| !p.is_cancelled());
                    list.clone()
                }
                None => Vec::new(),
            }
        };
        broadcast(&publishers, item).await
    }

    /// Number of health watches ever opened for `service`
    pub fn health_watches_opened(&self, service: &str) -> usize {
        self.lock().health_opened.get(service).copied().unwrap_or(0)
    }

    /// Number of health watches for `service` that have not been cancelled
    pub fn health_watches_active(&self, service: &str) -> usize {
        self.lock()
            .health
            .get(service)
            .map(|list| list.iter().filter(|p| !p.is_cancelled()).count())
            .unwrap_or(0)
    }

    /// Number of catalog watches that have not been cancelled
    pub fn catalog_watches_active(&self) -> usize {
        self.lock().catalog.iter().filter(|p| !p.is_cancelled()).count()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        // Inner holds no invariants a panicking holder could break
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

async fn broadcast<T: Clone>(publishers: &[Publisher<T>], item: WatchResult<T>) -> usize {
    let mut delivered = 0;
    for publisher in publishers {
        if publisher.send(item.clone()).await {
            delivered += 1;
        }
    }
    delivered
}

impl CatalogSource for ManualSource {
    fn watch_catalog(&self) -> Subscription<CatalogSnapshot> {
        let (publisher, sub) = subscription();
        self.lock().catalog.push(publisher);
        sub
    }

    fn watch_health(&self, service: &str) -> Subscription<Vec<HealthRecord>> {
        let (publisher, sub) = subscription();
        let mut inner = self.lock();
        inner.health.entry(service.to_string()).or_default().push(publisher);
        *inner.health_opened.entry(service.to_string()).or_default() += 1;
        sub
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_publish_reaches_subscribers() {
        let source = ManualSource::new();
        let mut first = source.watch_catalog();
        let mut second = source.watch_catalog();

        let snapshot = CatalogSnapshot::from([("api".to_string(), vec!["v1".to_string()])]);
        assert_eq!(source.publish_catalog(Ok(snapshot.clone())).await, 2);

        assert_eq!(first.next().await, Some(Ok(snapshot.clone())));
        assert_eq!(second.next().await, Some(Ok(snapshot)));
    }

    #[tokio::test]
    async fn test_health_watch_accounting() {
        let source = ManualSource::new();
        let sub = source.watch_health("api");
        let _other = source.watch_health("web");

        assert_eq!(source.health_watches_opened("api"), 1);
        assert_eq!(source.health_watches_active("api"), 1);

        sub.cancel();
        assert_eq!(source.health_watches_active("api"), 0);
        assert_eq!(source.health_watches_opened("api"), 1);
        assert_eq!(source.publish_health("api", Ok(Vec::new())).await, 0);
        assert_eq!(source.publish_health("web", Ok(Vec::new())).await, 1);
    }
}
