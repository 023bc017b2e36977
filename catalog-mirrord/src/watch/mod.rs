//! Boundary with the remote catalog.
//!
//! A [`CatalogSource`] hands out [`Subscription`]s that yield a sequence of
//! change-or-error items. Cancelling or dropping a subscription stops the
//! producer behind it.

pub mod consul;
pub mod manual;

use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use shared::types::{CatalogSnapshot, HealthRecord};

/// Items buffered between a producer and its subscriber
const SUBSCRIPTION_BUFFER: usize = 16;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum WatchError {
    #[error("connection failed: {0}")]
    Connection(String),

    #[error("unexpected status {status}: {body}")]
    Status { status: u16, body: String },

    #[error("failed to decode response: {0}")]
    Decode(String),
}

pub type WatchResult<T> = Result<T, WatchError>;

/// Source of catalog and health snapshots.
pub trait CatalogSource: Send + Sync + 'static {
    /// Watch the list of registered services and their tags
    fn watch_catalog(&self) -> Subscription<CatalogSnapshot>;

    /// Watch the healthy instances of one service
    fn watch_health(&self, service: &str) -> Subscription<Vec<HealthRecord>>;
}

/// Consumer half of a watch.
pub struct Subscription<T> {
    rx: mpsc::Receiver<WatchResult<T>>,
    cancel: CancellationToken,
}

/// Producer half of a watch.
pub struct Publisher<T> {
    tx: mpsc::Sender<WatchResult<T>>,
    cancel: CancellationToken,
}

/// Create a connected publisher/subscription pair
pub fn subscription<T>() -> (Publisher<T>, Subscription<T>) {
    let (tx, rx) = mpsc::channel(SUBSCRIPTION_BUFFER);
    let cancel = CancellationToken::new();
    (
        Publisher { tx, cancel: cancel.clone() },
        Subscription { rx, cancel },
    )
}

impl<T> Subscription<T> {
    /// Next change or error. Returns `None` once the watch is cancelled or
    /// the producer has gone away.
    pub async fn next(&mut self) -> Option<WatchResult<T>> {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => None,
            item = self.rx.recv() => item,
        }
    }

    /// Token that ends this watch when cancelled
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }
}

impl<T> Drop for Subscription<T> {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

impl<T> Clone for Publisher<T> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
            cancel: self.cancel.clone(),
        }
    }
}

impl<T> Publisher<T> {
    /// Deliver an item. Returns false when the subscriber is gone or the
    /// watch was cancelled, in which case the producer should stop.
    pub async fn send(&self, item: WatchResult<T>) -> bool {
        if self.cancel.is_cancelled() {
            return false;
        }
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => false,
            sent = self.tx.send(item) => sent.is_ok(),
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled() || self.tx.is_closed()
    }

    /// Resolves when the subscriber cancels the watch
    pub async fn cancelled(&self) {
        self.cancel.cancelled().await
    }
}
