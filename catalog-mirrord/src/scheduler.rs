//! Debounce and single-flight control of the handler pipeline.
//!
//! [`UpdateScheduler`] is the pure state machine. [`run`] drives it with the
//! debounce timer and the running cycle; [`SchedulerHandle`] is how the rest
//! of the daemon asks for an update.

use std::sync::Arc;
use std::time::Duration;
use futures::future::{BoxFuture, OptionFuture};
use tokio::sync::mpsc;
use tokio::time::{sleep_until, Instant};
use tokio_util::sync::CancellationToken;
use crate::catalog_manager::Catalog;
use crate::config::UpdateConfig;
use crate::error::CatalogError;
use crate::handler::Handlers;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerState {
    Idle,
    /// Waiting for a quiet period to end at `deadline`
    Debouncing { deadline: Instant },
    Running,
    /// Running, and another update was requested meanwhile
    RunningWithRerunPending,
}

#[derive(Debug, Clone, Copy)]
pub struct SchedulerOptions {
    /// Quiet period required before handlers run
    pub debounce: Duration,
    /// Keep a rerun requested during a failed cycle instead of dropping it
    pub retain_rerun_on_failure: bool,
}

impl Default for SchedulerOptions {
    fn default() -> Self {
        Self {
            debounce: Duration::from_millis(500),
            retain_rerun_on_failure: false,
        }
    }
}

impl From<&UpdateConfig> for SchedulerOptions {
    fn from(config: &UpdateConfig) -> Self {
        Self {
            debounce: config.debounce(),
            retain_rerun_on_failure: config.retain_rerun_on_failure,
        }
    }
}

#[derive(Debug)]
pub struct UpdateScheduler {
    state: SchedulerState,
    options: SchedulerOptions,
}

impl UpdateScheduler {
    pub fn new(options: SchedulerOptions) -> Self {
        Self {
            state: SchedulerState::Idle,
            options,
        }
    }

    pub fn state(&self) -> SchedulerState {
        self.state
    }

    /// Ask for a cycle. Restarts the quiet period when not running; marks a
    /// single rerun when a cycle is in progress.
    pub fn request_update(&mut self, now: Instant) {
        self.state = match self.state {
            SchedulerState::Running | SchedulerState::RunningWithRerunPending => {
                tracing::debug!("Update already running, will re-run after it is finished");
                SchedulerState::RunningWithRerunPending
            }
            SchedulerState::Idle | SchedulerState::Debouncing { .. } => SchedulerState::Debouncing {
                deadline: now + self.options.debounce,
            },
        };
    }

    /// When the debounce timer should fire, if armed
    pub fn deadline(&self) -> Option<Instant> {
        match self.state {
            SchedulerState::Debouncing { deadline } => Some(deadline),
            _ => None,
        }
    }

    /// Debounce timer expired. Returns true if a cycle should start now.
    pub fn fire(&mut self) -> bool {
        match self.state {
            SchedulerState::Debouncing { .. } => {
                self.state = SchedulerState::Running;
                true
            }
            _ => false,
        }
    }

    /// The running cycle finished
    pub fn complete(&mut self, succeeded: bool, now: Instant) {
        let rerun = match self.state {
            SchedulerState::Running => false,
            SchedulerState::RunningWithRerunPending => true,
            _ => return,
        };

        self.state = if rerun && (succeeded || self.options.retain_rerun_on_failure) {
            tracing::debug!("Update re-run requested");
            SchedulerState::Debouncing {
                deadline: now + self.options.debounce,
            }
        } else {
            if rerun {
                tracing::warn!("Dropping update requested during failed cycle");
            }
            SchedulerState::Idle
        };
    }
}

/// Handle for requesting updates. Never blocks.
#[derive(Debug, Clone)]
pub struct SchedulerHandle {
    tx: mpsc::UnboundedSender<()>,
}

impl SchedulerHandle {
    pub fn request_update(&self) {
        if self.tx.send(()).is_err() {
            tracing::debug!("Update scheduler stopped, ignoring update request");
        }
    }
}

/// Create a scheduler handle and the request stream for [`run`]
pub fn channel() -> (SchedulerHandle, mpsc::UnboundedReceiver<()>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (SchedulerHandle { tx }, rx)
}

/// Scheduler event loop - turns update requests into handler cycles
pub async fn run(
    mut scheduler: UpdateScheduler,
    mut requests: mpsc::UnboundedReceiver<()>,
    handlers: Arc<Handlers>,
    catalog: Catalog,
    cancel: CancellationToken,
) {
    let mut cycle: Option<BoxFuture<'static, Result<(), CatalogError>>> = None;
    let mut accepting = true;

    loop {
        let deadline = scheduler.deadline();

        tokio::select! {
            _ = cancel.cancelled() => {
                tracing::info!("Update scheduler shutting down");
                break;
            }
            request = requests.recv(), if accepting => {
                match request {
                    Some(()) => scheduler.request_update(Instant::now()),
                    None => accepting = false,
                }
            }
            _ = sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                if scheduler.fire() {
                    let handlers = handlers.clone();
                    let catalog = catalog.clone();
                    cycle = Some(Box::pin(async move { handlers.run_cycle(&catalog).await }));
                }
            }
            Some(result) = OptionFuture::from(cycle.as_mut()), if cycle.is_some() => {
                cycle = None;
                match &result {
                    Ok(()) => tracing::info!("Update completed"),
                    Err(e) => tracing::error!("Error while running update handlers: {}", e),
                }
                scheduler.complete(result.is_ok(), Instant::now());
            }
        }

        if !accepting && cycle.is_none() && scheduler.deadline().is_none() {
            tracing::debug!("No more update requests, scheduler exiting");
            break;
        }
    }
}
