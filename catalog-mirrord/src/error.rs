use thiserror::Error;
use crate::watch::WatchError;

#[derive(Debug, Error)]
pub enum CatalogError {
    /// The health watch failed before delivering its first snapshot
    #[error("initial fetch of instances for service {service} failed: {source}")]
    InitialFetch {
        service: String,
        source: WatchError,
    },

    /// An update handler returned an error
    #[error("update handler {handler} failed: {cause:#}")]
    Handler {
        handler: String,
        cause: anyhow::Error,
    },

    #[error("service not found: {0}")]
    ServiceNotFound(String),

    /// The service left the catalog while instances were being fetched
    #[error("service removed from catalog: {0}")]
    ServiceRemoved(String),

    /// The catalog manager task is no longer running
    #[error("catalog manager is closed")]
    Closed,
}
