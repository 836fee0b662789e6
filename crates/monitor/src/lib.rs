pub mod aggregate;
pub mod cache;
pub mod cache_aside;
pub mod config;
pub mod delivery;
pub mod kubernetes;
pub mod metrics;
pub mod server;
pub mod service;
pub mod status;
pub mod store;
pub mod summary;
pub mod sync;

#[cfg(test)]
pub(crate) mod testutil;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Kubernetes error: {0}")]
    Kubernetes(String),
    #[error("Configuration error: {0}")]
    Config(String),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Database migration error: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
    #[error("SQLx error: {0}")]
    Sqlx(#[from] sqlx::Error),
    #[error("JSON error: {0}")]
    SerdeJson(#[from] serde_json::Error),
    #[error("YAML error: {0}")]
    SerdeYaml(#[from] serde_yaml::Error),
    #[error("Metrics error: {0}")]
    Metrics(#[from] prometheus::Error),
    #[error("Internal error: {0}")]
    Internal(String),
    #[error("Not found: {0}")]
    NotFound(String),
    #[error("Subscriber disconnected")]
    SubscriberGone,
}

impl From<kube::Error> for Error {
    fn from(e: kube::Error) -> Self {
        Error::Kubernetes(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
