use crate::domain::TenantId;

/// Core error type.
///
/// Adapter crates (SQLite, Redis, engine bridge) map their specific errors into this
/// type so session tasks can decide between "log and continue" and "terminate".
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("config error: {0}")]
    Config(String),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("store error: {0}")]
    Store(String),

    #[error("engine error: {0}")]
    Engine(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("session already running for tenant {tenant_id} (connected: {connected})")]
    AlreadyRunning { tenant_id: TenantId, connected: bool },

    #[error("invalid usage counter: {0}")]
    InvalidCounter(String),

    #[error("pairing failed: {0}")]
    Pairing(String),

    #[error("delivery failed: {0}")]
    Delivery(String),

    #[error("external error: {0}")]
    External(String),
}

pub type Result<T> = std::result::Result<T, Error>;
