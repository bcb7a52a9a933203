use std::sync::RwLock;
use std::time::Duration;

use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use redis::streams::{StreamReadOptions, StreamReadReply};
use redis::AsyncCommands;
use tokio::time::timeout;
use tracing::debug;

use crate::{KvClient, KvError, StreamEntry};

const KV_OP_TIMEOUT_MS: u64 = 1000;

/// Redis-backed implementation of [`KvClient`]. The connection is created by
/// an explicit `connect` call and replaced wholesale on reconnection; the
/// lock is never held across I/O.
pub struct RedisKv {
    url: String,
    connection: RwLock<Option<MultiplexedConnection>>,
}

impl RedisKv {
    pub fn new(host: &str, port: u16, db_index: i64) -> Self {
        Self {
            url: format!("redis://{host}:{port}/{db_index}"),
            connection: RwLock::new(None),
        }
    }

    fn current(&self) -> Result<MultiplexedConnection, KvError> {
        self.connection
            .read()
            .expect("kv connection lock poisoned")
            .clone()
            .ok_or(KvError::NotConnected)
    }
}

#[async_trait]
impl KvClient for RedisKv {
    async fn connect(&self) -> Result<(), KvError> {
        let client = redis::Client::open(self.url.as_str())?;
        let connection = client.get_multiplexed_async_connection().await?;
        *self
            .connection
            .write()
            .expect("kv connection lock poisoned") = Some(connection);
        debug!(url = %self.url, "kv connection established");
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connection
            .read()
            .expect("kv connection lock poisoned")
            .is_some()
    }

    async fn set(&self, key: &str, value: &str, ttl_seconds: u64) -> Result<(), KvError> {
        let mut conn = self.current()?;
        if ttl_seconds == 0 {
            timeout(
                Duration::from_millis(KV_OP_TIMEOUT_MS),
                conn.set::<_, _, ()>(key, value),
            )
            .await??;
        } else {
            timeout(
                Duration::from_millis(KV_OP_TIMEOUT_MS),
                conn.set_ex::<_, _, ()>(key, value, ttl_seconds),
            )
            .await??;
        }
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>, KvError> {
        let mut conn = self.current()?;
        let value: Option<String> = timeout(
            Duration::from_millis(KV_OP_TIMEOUT_MS),
            conn.get(key),
        )
        .await??;
        Ok(value)
    }

    async fn xgroup_create(&self, stream: &str, group: &str) -> Result<(), KvError> {
        let mut conn = self.current()?;
        let result = redis::cmd("XGROUP")
            .arg("CREATE")
            .arg(stream)
            .arg(group)
            .arg("$")
            .arg("MKSTREAM")
            .query_async::<()>(&mut conn)
            .await;
        match result {
            Ok(()) => Ok(()),
            // The group already existing is fine for best-effort creation.
            Err(err) if err.code() == Some("BUSYGROUP") => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    async fn xreadgroup(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        block_ms: u64,
        count: usize,
    ) -> Result<Vec<StreamEntry>, KvError> {
        let mut conn = self.current()?;
        let options = StreamReadOptions::default()
            .group(group, consumer)
            .block(block_ms as usize)
            .count(count);
        let reply: StreamReadReply = conn
            .xread_options(&[stream], &[">"], &options)
            .await?;

        let mut entries = Vec::new();
        for key in reply.keys {
            for id in key.ids {
                let Some(raw) = id.map.get("body") else {
                    continue;
                };
                let body: String = redis::from_redis_value(raw)?;
                entries.push(StreamEntry { id: id.id, body });
            }
        }
        Ok(entries)
    }

    async fn xack(&self, stream: &str, group: &str, id: &str) -> Result<(), KvError> {
        let mut conn = self.current()?;
        let _acked: i64 = conn.xack(stream, group, &[id]).await?;
        Ok(())
    }
}
