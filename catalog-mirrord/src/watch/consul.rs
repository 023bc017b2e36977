use std::time::Duration;
use anyhow::{Context, Result};
use reqwest::{Client, Url};
use serde::de::DeserializeOwned;
use shared::protocol::{
    CATALOG_SERVICES_PATH, HEADER_CONSUL_INDEX, HEADER_CONSUL_TOKEN, QUERY_DATACENTER,
    QUERY_INDEX, QUERY_PASSING, QUERY_WAIT,
};
use shared::types::{
    catalog_snapshot_from_consul, CatalogSnapshot, ConsulCatalogServices, ConsulHealthEntry,
    HealthRecord,
};
use crate::config::ConsulConfig;
use super::{subscription, CatalogSource, Publisher, Subscription, WatchError};

const MIN_BACKOFF: Duration = Duration::from_secs(1);
const MAX_BACKOFF: Duration = Duration::from_secs(60);

/// Slack on top of the blocking wait before a request is considered hung.
/// Consul adds up to wait/16 of jitter to every blocking query.
const REQUEST_SLACK: Duration = Duration::from_secs(5);

/// Catalog source backed by Consul blocking queries.
pub struct ConsulSource {
    client: Client,
    base: Url,
    token: Option<String>,
    datacenter: Option<String>,
    wait: Duration,
    passing_only: bool,
}

impl ConsulSource {
    pub fn new(config: &ConsulConfig) -> Result<Self> {
        let base = Url::parse(&config.address)
            .with_context(|| format!("Invalid Consul address: {}", config.address))?;
        let client = Client::builder()
            .build()
            .context("Failed to build HTTP client")?;

        Ok(Self {
            client,
            base,
            token: config.token.clone(),
            datacenter: config.datacenter.clone(),
            wait: config.wait(),
            passing_only: config.passing_only,
        })
    }

    fn query(&self, url: Url, extra: &[(&str, &str)]) -> BlockingQuery {
        let mut params: Vec<(String, String)> = extra
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        if let Some(dc) = &self.datacenter {
            params.push((QUERY_DATACENTER.to_string(), dc.clone()));
        }

        BlockingQuery {
            client: self.client.clone(),
            url,
            params,
            token: self.token.clone(),
            wait: self.wait,
        }
    }
}

impl CatalogSource for ConsulSource {
    fn watch_catalog(&self) -> Subscription<CatalogSnapshot> {
        let mut url = self.base.clone();
        url.set_path(CATALOG_SERVICES_PATH);

        let query = self.query(url, &[]);
        let (publisher, sub) = subscription();
        tokio::spawn(run_watch(
            "catalog services".to_string(),
            query,
            publisher,
            catalog_snapshot_from_consul as fn(ConsulCatalogServices) -> CatalogSnapshot,
        ));

        tracing::info!("Starting watch for catalog service list");
        sub
    }

    fn watch_health(&self, service: &str) -> Subscription<Vec<HealthRecord>> {
        let mut url = self.base.clone();
        if let Ok(mut segments) = url.path_segments_mut() {
            segments
                .clear()
                .extend(["v1", "health", "service", service]);
        }

        let extra: &[(&str, &str)] = if self.passing_only {
            &[(QUERY_PASSING, "true")]
        } else {
            &[]
        };
        let query = self.query(url, extra);
        let (publisher, sub) = subscription();
        tokio::spawn(run_watch(
            format!("health of {}", service),
            query,
            publisher,
            health_records_from_consul as fn(Vec<ConsulHealthEntry>) -> Vec<HealthRecord>,
        ));

        sub
    }
}

fn health_records_from_consul(entries: Vec<ConsulHealthEntry>) -> Vec<HealthRecord> {
    entries.into_iter().map(HealthRecord::from).collect()
}

struct BlockingQuery {
    client: Client,
    url: Url,
    params: Vec<(String, String)>,
    token: Option<String>,
    wait: Duration,
}

impl BlockingQuery {
    /// Issue one request. Blocks server side until `index` moves or the wait
    /// elapses. Returns the decoded body and the new index.
    async fn fetch<B: DeserializeOwned>(&self, index: u64) -> Result<(B, u64), WatchError> {
        let mut request = self
            .client
            .get(self.url.clone())
            .query(&self.params)
            .timeout(self.wait + self.wait / 16 + REQUEST_SLACK);

        if index > 0 {
            request = request.query(&[
                (QUERY_INDEX, index.to_string()),
                (QUERY_WAIT, format!("{}s", self.wait.as_secs())),
            ]);
        }
        if let Some(token) = &self.token {
            request = request.header(HEADER_CONSUL_TOKEN, token);
        }

        let response = request
            .send()
            .await
            .map_err(|e| WatchError::Connection(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(WatchError::Status {
                status: status.as_u16(),
                body,
            });
        }

        let new_index = response
            .headers()
            .get(HEADER_CONSUL_INDEX)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(0);

        let bytes = response
            .bytes()
            .await
            .map_err(|e| WatchError::Connection(e.to_string()))?;
        let body = serde_json::from_slice(&bytes).map_err(|e| WatchError::Decode(e.to_string()))?;

        Ok((body, new_index))
    }
}

/// Poll `query` until the subscriber goes away, delivering a change whenever
/// the index moves and an error for every failed request.
async fn run_watch<B, T>(name: String, query: BlockingQuery, publisher: Publisher<T>, convert: fn(B) -> T)
where
    B: DeserializeOwned + Send + 'static,
    T: Send + 'static,
{
    let mut index: Option<u64> = None;
    let mut backoff = MIN_BACKOFF;

    loop {
        let result = tokio::select! {
            _ = publisher.cancelled() => break,
            result = query.fetch::<B>(index.unwrap_or(0)) => result,
        };

        match result {
            Ok((body, new_index)) => {
                backoff = MIN_BACKOFF;
                let changed = index != Some(new_index);
                index = Some(new_index);

                if changed && !publisher.send(Ok(convert(body))).await {
                    break;
                }
                // Without an index the server cannot block, fall back to polling
                if new_index == 0 && !sleep_unless_cancelled(&publisher, MIN_BACKOFF).await {
                    break;
                }
            }
            Err(e) => {
                tracing::debug!("Watch for {} failed, retrying in {:?}: {}", name, backoff, e);
                if !publisher.send(Err(e)).await {
                    break;
                }
                if !sleep_unless_cancelled(&publisher, backoff).await {
                    break;
                }
                backoff = (backoff * 2).min(MAX_BACKOFF);
            }
        }
    }

    tracing::debug!("Stopped watch for {}", name);
}

/// Returns false if the watch was cancelled while sleeping
async fn sleep_unless_cancelled<T>(publisher: &Publisher<T>, duration: Duration) -> bool {
    tokio::select! {
        _ = publisher.cancelled() => false,
        _ = tokio::time::sleep(duration) => true,
    }
}
