//! Live local mirror of a remote service catalog.
//!
//! The mirror follows the catalog's service list, fetches a service's
//! healthy instances the first time they are asked for and keeps them
//! current afterwards. Changes are debounced into update cycles that run
//! the registered [`handler::UpdateHandler`]s.

pub mod catalog_manager;
pub mod config;
pub mod error;
pub mod handler;
pub mod mirror;
pub mod scheduler;
pub mod watch;

use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use crate::catalog_manager::Catalog;
use crate::handler::Handlers;
use crate::mirror::CatalogMirror;
use crate::scheduler::{SchedulerOptions, UpdateScheduler};
use crate::watch::CatalogSource;

/// A running mirror: the catalog manager and update scheduler tasks
pub struct Mirror {
    catalog: Catalog,
    manager: JoinHandle<()>,
    scheduler: JoinHandle<()>,
}

impl Mirror {
    /// Handle for querying the mirror
    pub fn catalog(&self) -> Catalog {
        self.catalog.clone()
    }

    /// Wait for both tasks to stop after `cancel` fired
    pub async fn join(self) {
        let (manager, scheduler) = tokio::join!(self.manager, self.scheduler);
        if let Err(e) = manager {
            tracing::error!("Catalog manager task failed: {}", e);
        }
        if let Err(e) = scheduler {
            tracing::error!("Update scheduler task failed: {}", e);
        }
    }
}

/// Start mirroring `source`, running `handlers` whenever the mirrored
/// catalog changes. Both tasks stop when `cancel` fires.
pub fn start(
    source: Arc<dyn CatalogSource>,
    handlers: Handlers,
    options: SchedulerOptions,
    cancel: CancellationToken,
) -> Mirror {
    let (scheduler_handle, requests) = scheduler::channel();
    let (catalog, commands) = catalog_manager::channel();

    let catalog_watch = source.watch_catalog();
    let (mirror, health_rx) = CatalogMirror::new(source, scheduler_handle);

    let manager = tokio::spawn(catalog_manager::run(
        mirror,
        health_rx,
        commands,
        catalog_watch,
        cancel.clone(),
    ));

    let scheduler = tokio::spawn(scheduler::run(
        UpdateScheduler::new(options),
        requests,
        Arc::new(handlers),
        catalog.clone(),
        cancel,
    ));

    Mirror {
        catalog,
        manager,
        scheduler,
    }
}
