//! Redis list publisher for the external Bull worker.

use async_trait::async_trait;
use hookgate_core::{
    config::Config,
    errors::Error,
    queue::{queue_record, QueuePublisher},
    Result,
};
use redis::{
    aio::MultiplexedConnection, ConnectionAddr, ConnectionInfo, IntoConnectionInfo,
    RedisConnectionInfo,
};
use tokio::sync::Mutex;
use tracing::{debug, warn};

const DEFAULT_PORT: u16 = 6379;

/// Pushes `{jsonData, token}` records onto the tail of a single list.
///
/// The multiplexed connection is opened lazily and reopened after an error.
pub struct RedisQueuePublisher {
    client: redis::Client,
    key: String,
    conn: Mutex<Option<MultiplexedConnection>>,
}

impl RedisQueuePublisher {
    pub fn new(uri: &str, password: Option<&str>, key: impl Into<String>) -> Result<Self> {
        let info = connection_info(uri, password)?;
        let client = redis::Client::open(info)
            .map_err(|e| Error::Config(format!("invalid redis settings: {e}")))?;
        Ok(Self {
            client,
            key: key.into(),
            conn: Mutex::new(None),
        })
    }

    /// `None` when `REDIS_URI` is not configured.
    pub fn from_config(cfg: &Config) -> Result<Option<Self>> {
        match cfg.redis_uri.as_deref() {
            Some(uri) => Ok(Some(Self::new(
                uri,
                cfg.redis_password.as_deref(),
                cfg.queue_key(),
            )?)),
            None => Ok(None),
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    async fn connection(&self) -> Result<MultiplexedConnection> {
        let mut slot = self.conn.lock().await;
        if let Some(conn) = slot.as_ref() {
            return Ok(conn.clone());
        }
        let conn = self
            .client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| Error::External(format!("redis connect failed: {e}")))?;
        *slot = Some(conn.clone());
        Ok(conn)
    }
}

#[async_trait]
impl QueuePublisher for RedisQueuePublisher {
    async fn publish(&self, token: &str, json_data: &str) -> Result<()> {
        let record = queue_record(token, json_data);
        let mut conn = self.connection().await?;
        let res = redis::cmd("RPUSH")
            .arg(&self.key)
            .arg(record)
            .query_async::<_, i64>(&mut conn)
            .await;
        match res {
            Ok(len) => {
                debug!(key = %self.key, len, "queued event");
                Ok(())
            }
            Err(e) => {
                warn!(key = %self.key, error = %e, "redis push failed; dropping connection");
                *self.conn.lock().await = None;
                Err(Error::External(format!("redis RPUSH failed: {e}")))
            }
        }
    }
}

/// Accepts either a `redis://` URL or a bare `host[:port]`.
fn connection_info(uri: &str, password: Option<&str>) -> Result<ConnectionInfo> {
    let uri = uri.trim();
    let mut info = if uri.starts_with("redis://") || uri.starts_with("rediss://") {
        uri.into_connection_info()
            .map_err(|e| Error::Config(format!("invalid REDIS_URI: {e}")))?
    } else {
        let (host, port) = match uri.rsplit_once(':') {
            Some((host, port)) => {
                let port = port
                    .parse::<u16>()
                    .map_err(|_| Error::Config(format!("invalid REDIS_URI port: {uri}")))?;
                (host.to_string(), port)
            }
            None => (uri.to_string(), DEFAULT_PORT),
        };
        if host.is_empty() {
            return Err(Error::Config("REDIS_URI host is empty".to_string()));
        }
        ConnectionInfo {
            addr: ConnectionAddr::Tcp(host, port),
            redis: RedisConnectionInfo::default(),
        }
    };
    if let Some(pass) = password.filter(|p| !p.is_empty()) {
        info.redis.password = Some(pass.to_string());
    }
    Ok(info)
}
