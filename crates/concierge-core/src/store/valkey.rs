//! Counter store on Valkey (or Redis): `SET NX EX` to create a window, a small
//! script to increment it only while it still exists.

use std::time::Duration;

use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use tokio::{sync::Mutex, time::timeout};

use super::{ttl_secs, CounterStore, CreateOutcome};
use crate::{Error, Result};

/// `INCRBY` would recreate an expired key without a TTL; only touch live keys.
const INCR_EXISTING: &str = r#"
if redis.call("EXISTS", KEYS[1]) == 1 then
  return redis.call("INCRBY", KEYS[1], ARGV[1])
end
return false
"#;

/// Counter store shared by every bot process using the same Valkey.
///
/// One multiplexed connection, opened lazily and dropped after any failure
/// so the next call reconnects. Replies are matched to requests by the
/// connection driver, so a caller abandoning a request mid-flight (deadline,
/// shutdown) leaves the connection usable for everyone else.
pub struct ValkeyCounterStore {
    client: redis::Client,
    url: String,
    io_timeout: Duration,
    connection: Mutex<Option<MultiplexedConnection>>,
}

impl ValkeyCounterStore {
    pub fn new(url: &str, io_timeout: Duration) -> Result<Self> {
        let client = redis::Client::open(url)
            .map_err(|e| Error::Config(format!("invalid valkey url {url:?}: {e}")))?;
        Ok(Self {
            client,
            url: url.to_string(),
            io_timeout,
            connection: Mutex::new(None),
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Drop the connection; a later call reconnects.
    pub async fn close(&self) {
        if self.connection.lock().await.take().is_some() {
            tracing::debug!(url = %self.url, "valkey counter store connection closed");
        }
    }

    async fn connection(&self) -> Result<MultiplexedConnection> {
        let mut slot = self.connection.lock().await;
        if let Some(conn) = slot.as_ref() {
            return Ok(conn.clone());
        }

        let conn = match timeout(self.io_timeout, self.client.get_multiplexed_async_connection())
            .await
        {
            Ok(Ok(conn)) => conn,
            Ok(Err(e)) => return Err(self.store_error("connect", e)),
            Err(_) => return Err(self.timeout_error("connect")),
        };
        tracing::debug!(url = %self.url, "valkey counter store connected");
        *slot = Some(conn.clone());
        Ok(conn)
    }

    async fn query<T>(&self, operation: &'static str, cmd: redis::Cmd) -> Result<T>
    where
        T: redis::FromRedisValue + Send,
    {
        let mut conn = self.connection().await?;
        let request = async {
            let reply: redis::RedisResult<T> = cmd.query_async(&mut conn).await;
            reply
        };
        let err = match timeout(self.io_timeout, request).await {
            Ok(Ok(value)) => return Ok(value),
            Ok(Err(e)) => self.store_error(operation, e),
            Err(_) => self.timeout_error(operation),
        };
        tracing::warn!(
            url = %self.url,
            operation,
            error = %err,
            "valkey command failed, reconnecting on next call"
        );
        *self.connection.lock().await = None;
        Err(err)
    }

    fn store_error(&self, operation: &str, e: redis::RedisError) -> Error {
        Error::Store(format!("valkey {} {operation}: {e}", self.url))
    }

    fn timeout_error(&self, operation: &str) -> Error {
        Error::Store(format!(
            "valkey {} {operation}: timed out after {:?}",
            self.url, self.io_timeout
        ))
    }
}

#[async_trait]
impl CounterStore for ValkeyCounterStore {
    async fn create_if_absent(
        &self,
        key: &str,
        value: u64,
        ttl: Duration,
    ) -> Result<CreateOutcome> {
        let mut cmd = redis::cmd("SET");
        cmd.arg(key).arg(value).arg("EX").arg(ttl_secs(ttl)).arg("NX");

        let reply: Option<String> = self.query("set_nx", cmd).await?;
        Ok(match reply {
            Some(_) => CreateOutcome::Created,
            None => CreateOutcome::AlreadyExists,
        })
    }

    async fn increment(&self, key: &str, delta: u64) -> Result<Option<u64>> {
        let mut cmd = redis::cmd("EVAL");
        cmd.arg(INCR_EXISTING).arg(1).arg(key).arg(delta);
        self.query("incr_existing", cmd).await
    }
}
