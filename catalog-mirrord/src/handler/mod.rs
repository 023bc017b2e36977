//! Update handlers run by the scheduler once the catalog has settled.

pub mod command;
pub mod render;

use std::future::Future;
use std::sync::Arc;
use async_trait::async_trait;
use futures::future::join_all;
use tracing::Instrument;
use crate::catalog_manager::Catalog;
use crate::config::{Config, HandlerConfig};
use crate::error::CatalogError;

pub use command::CommandHandler;
pub use render::RenderHandler;

#[async_trait]
pub trait UpdateHandler: Send + Sync {
    /// Name used in logs and errors
    fn name(&self) -> &str;

    async fn handle(&self, catalog: &Catalog) -> anyhow::Result<()>;
}

/// Handler backed by a closure, see [`handler_fn`]
pub struct FnHandler<F> {
    name: String,
    f: F,
}

#[async_trait]
impl<F, Fut> UpdateHandler for FnHandler<F>
where
    F: Fn(Catalog) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    fn name(&self) -> &str {
        &self.name
    }

    async fn handle(&self, catalog: &Catalog) -> anyhow::Result<()> {
        (self.f)(catalog.clone()).await
    }
}

/// Wrap a closure as an update handler
pub fn handler_fn<F, Fut>(name: &str, f: F) -> Arc<dyn UpdateHandler>
where
    F: Fn(Catalog) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    Arc::new(FnHandler {
        name: name.to_string(),
        f,
    })
}

/// The handler pipeline: on-update handlers run concurrently, the
/// after-update handler runs once all of them succeeded.
#[derive(Default, Clone)]
pub struct Handlers {
    on_update: Vec<Arc<dyn UpdateHandler>>,
    after_update: Option<Arc<dyn UpdateHandler>>,
}

impl Handlers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an on-update handler. Handlers start in registration order.
    pub fn on_update(mut self, handler: Arc<dyn UpdateHandler>) -> Self {
        self.on_update.push(handler);
        self
    }

    /// Set the after-update handler, replacing any earlier one
    pub fn after_update(mut self, handler: Arc<dyn UpdateHandler>) -> Self {
        self.after_update = Some(handler);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.on_update.is_empty() && self.after_update.is_none()
    }

    /// Build the pipeline described by the configuration
    pub fn from_config(config: &Config) -> anyhow::Result<Self> {
        let mut handlers = Self::new();
        for handler in &config.on_update {
            handlers = handlers.on_update(build_handler(handler)?);
        }
        if let Some(handler) = &config.after_update {
            handlers = handlers.after_update(build_handler(handler)?);
        }
        Ok(handlers)
    }

    /// Run one update cycle.
    ///
    /// Every on-update handler runs to completion even if a sibling fails.
    /// The first failure in registration order is returned and the
    /// after-update handler is skipped.
    pub async fn run_cycle(&self, catalog: &Catalog) -> Result<(), CatalogError> {
        if let Ok(fingerprint) = catalog.fingerprint().await {
            tracing::info!("Running update handlers, catalog fingerprint {}", fingerprint);
        }

        let results = join_all(self.on_update.iter().map(|handler| {
            let span = tracing::info_span!("on_update", handler = handler.name());
            handler.handle(catalog).instrument(span)
        }))
        .await;

        let mut first_failure = None;
        for (handler, result) in self.on_update.iter().zip(results) {
            if let Err(e) = result {
                tracing::error!("Update handler {} failed: {:#}", handler.name(), e);
                if first_failure.is_none() {
                    first_failure = Some(CatalogError::Handler {
                        handler: handler.name().to_string(),
                        cause: e,
                    });
                }
            }
        }
        if let Some(e) = first_failure {
            return Err(e);
        }

        if let Some(handler) = &self.after_update {
            let span = tracing::info_span!("after_update", handler = handler.name());
            handler
                .handle(catalog)
                .instrument(span)
                .await
                .map_err(|cause| CatalogError::Handler {
                    handler: handler.name().to_string(),
                    cause,
                })?;
        }

        Ok(())
    }
}

fn build_handler(config: &HandlerConfig) -> anyhow::Result<Arc<dyn UpdateHandler>> {
    let handler: Arc<dyn UpdateHandler> = match config {
        HandlerConfig::Render { path, format, tags } => {
            Arc::new(RenderHandler::new(path.clone(), *format, tags.clone()))
        }
        HandlerConfig::Command { command } => Arc::new(CommandHandler::new(command.clone())?),
    };
    Ok(handler)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::time::Duration;

    fn recording(
        name: &'static str,
        log: &Arc<Mutex<Vec<String>>>,
        work: Duration,
        fail: bool,
    ) -> Arc<dyn UpdateHandler> {
        let log = log.clone();
        handler_fn(name, move |_catalog| {
            log.lock().unwrap().push(format!("start {}", name));
            let log = log.clone();
            async move {
                tokio::time::sleep(work).await;
                log.lock().unwrap().push(format!("end {}", name));
                if fail {
                    anyhow::bail!("{} broke", name);
                }
                Ok(())
            }
        })
    }

    #[tokio::test(start_paused = true)]
    async fn test_handlers_start_in_registration_order() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let handlers = Handlers::new()
            .on_update(recording("a", &log, Duration::from_millis(30), false))
            .on_update(recording("b", &log, Duration::from_millis(10), false))
            .after_update(recording("after", &log, Duration::ZERO, false));

        handlers.run_cycle(&Catalog::detached()).await.unwrap();

        let log = log.lock().unwrap().clone();
        assert_eq!(
            log,
            vec!["start a", "start b", "end b", "end a", "start after", "end after"],
            "handlers run concurrently and after-update waits for all"
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_failure_does_not_cancel_siblings() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let handlers = Handlers::new()
            .on_update(recording("fast-fail", &log, Duration::from_millis(10), true))
            .on_update(recording("slow", &log, Duration::from_millis(50), false))
            .after_update(recording("after", &log, Duration::ZERO, false));

        let err = handlers.run_cycle(&Catalog::detached()).await.unwrap_err();

        assert!(matches!(err, CatalogError::Handler { ref handler, .. } if handler == "fast-fail"));
        let log = log.lock().unwrap().clone();
        assert!(log.contains(&"end slow".to_string()), "sibling should run to completion");
        assert!(!log.contains(&"start after".to_string()), "after-update must be skipped");
    }

    #[tokio::test]
    async fn test_first_failure_in_registration_order_reported() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let handlers = Handlers::new()
            .on_update(recording("first", &log, Duration::from_millis(20), true))
            .on_update(recording("second", &log, Duration::ZERO, true));

        let err = handlers.run_cycle(&Catalog::detached()).await.unwrap_err();
        assert!(err.to_string().contains("first broke"), "got: {}", err);
    }

    #[tokio::test]
    async fn test_after_update_failure_reported() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let handlers = Handlers::new().after_update(recording("after", &log, Duration::ZERO, true));

        let err = handlers.run_cycle(&Catalog::detached()).await.unwrap_err();
        assert!(matches!(err, CatalogError::Handler { ref handler, .. } if handler == "after"));
    }

    #[test]
    fn test_from_config() {
        let config = Config::parse(
            r#"
            [[on_update]]
            type = "render"
            path = "/tmp/services.txt"

            [after_update]
            type = "command"
            command = ["true"]
            "#,
        )
        .unwrap();

        let handlers = Handlers::from_config(&config).unwrap();
        assert_eq!(handlers.on_update.len(), 1);
        assert_eq!(handlers.after_update.as_ref().map(|h| h.name().to_string()), Some("true".to_string()));
        assert!(Handlers::from_config(&Config::parse("").unwrap()).unwrap().is_empty());
    }
}
