use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use common_broker::{BrokerError, QueuePublisher};
use common_kv::{KvClient, KvError};
use common_worker_pool::{Job, JobPriority, PoolConfig, WorkerPool};
use thiserror::Error;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::Config;

const STOP_WAKE_SLICE: Duration = Duration::from_millis(100);

#[derive(Error, Debug)]
pub enum IngestError {
    #[error("invalid JSON: {0}")]
    InvalidJson(String),
    #[error("message is not a JSON object")]
    NotAnObject,
    #[error(transparent)]
    Kv(#[from] KvError),
    #[error(transparent)]
    Broker(#[from] BrokerError),
    #[error("{0}")]
    Pool(String),
}

/// Front-edge service: synchronous cache reads/writes plus a staged,
/// periodically flushed forward of database-operation jobs to the broker.
/// Cheap to clone; all clones share one runtime.
#[derive(Clone)]
pub struct CacheIngestService {
    inner: Arc<Inner>,
}

struct Inner {
    config: Arc<Config>,
    kv: Arc<dyn KvClient>,
    publisher: Arc<dyn QueuePublisher>,
    pending: Mutex<Vec<String>>,
    pool: tokio::sync::Mutex<Option<WorkerPool>>,
    stop: Mutex<CancellationToken>,
}

impl CacheIngestService {
    pub fn new(
        config: Arc<Config>,
        kv: Arc<dyn KvClient>,
        publisher: Arc<dyn QueuePublisher>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                kv,
                publisher,
                pending: Mutex::new(Vec::new()),
                pool: tokio::sync::Mutex::new(None),
                stop: Mutex::new(CancellationToken::new()),
            }),
        }
    }

    fn config(&self) -> &Config {
        &self.inner.config
    }

    /// Connect both clients (bounded retries), build the worker pool, and
    /// schedule the flush task. Any failure leaves the service stopped.
    pub async fn start(&self) -> Result<(), IngestError> {
        self.inner
            .pending
            .lock()
            .expect("pending lock poisoned")
            .clear();
        let token = CancellationToken::new();
        *self.inner.stop.lock().expect("stop token lock poisoned") = token.clone();

        self.kv_reconnect_loop().await?;
        self.broker_reconnect_loop().await?;

        let stream_mode = self.config().stream_mode_enabled();
        let mut pool = WorkerPool::new(PoolConfig {
            high_workers: self.config().high_priority_count,
            normal_workers: self.config().normal_priority_count,
            low_workers: self.config().low_priority_count,
            // The flush task occupies one LongTerm worker for the life of
            // the service; the stream consumer needs its own.
            long_term_workers: if stream_mode { 2 } else { 1 },
        });
        pool.start();

        let service = self.clone();
        let flush_token = token.clone();
        pool.push(Job::new(
            JobPriority::LongTerm,
            "publish_to_db_apply",
            move || async move {
                service.flush_loop(flush_token).await;
                Ok(())
            },
        ))
        .map_err(|err| IngestError::Pool(err.to_string()))?;

        if stream_mode {
            let service = self.clone();
            let stream_token = token.clone();
            pool.push(Job::new(
                JobPriority::LongTerm,
                "consume_cache_stream",
                move || async move {
                    service.stream_loop(stream_token).await;
                    Ok(())
                },
            ))
            .map_err(|err| IngestError::Pool(err.to_string()))?;
        }

        *self.inner.pool.lock().await = Some(pool);
        info!(
            interval_ms = self.config().publish_to_main_db_service_interval_ms,
            stream_mode, "cache-ingest started"
        );
        Ok(())
    }

    /// Block until stop is requested, then join the worker pool.
    pub async fn wait_stop(&self) {
        let token = self
            .inner
            .stop
            .lock()
            .expect("stop token lock poisoned")
            .clone();
        token.cancelled().await;
        self.shutdown_pool().await;
    }

    pub async fn stop(&self) {
        self.inner
            .stop
            .lock()
            .expect("stop token lock poisoned")
            .cancel();
        self.shutdown_pool().await;
        info!("cache-ingest stopped");
    }

    async fn shutdown_pool(&self) {
        if let Some(mut pool) = self.inner.pool.lock().await.take() {
            pool.stop().await;
        }
    }

    /// Synchronous cache write with reconnect-once-retry-once on transient
    /// failures. `ttl_seconds` of 0 means no expiry.
    pub async fn set_key_value(
        &self,
        key: &str,
        value: &str,
        ttl_seconds: u64,
    ) -> Result<(), IngestError> {
        self.ensure_kv_connection().await?;
        match self.inner.kv.set(key, value, ttl_seconds).await {
            Err(err) if err.is_transient() => {
                warn!("cache set failed, attempting reconnection: {err}");
                self.kv_reconnect_loop().await?;
                Ok(self.inner.kv.set(key, value, ttl_seconds).await?)
            }
            other => Ok(other?),
        }
    }

    pub async fn get_key_value(&self, key: &str) -> Result<Option<String>, IngestError> {
        self.ensure_kv_connection().await?;
        match self.inner.kv.get(key).await {
            Err(err) if err.is_transient() => {
                warn!("cache get failed, attempting reconnection: {err}");
                self.kv_reconnect_loop().await?;
                Ok(self.inner.kv.get(key).await?)
            }
            other => Ok(other?),
        }
    }

    /// Validate and stage one job message. Returns immediately; the flush
    /// task forwards it to the broker on the next cycle.
    pub fn enqueue_database_operation(&self, body: &str) -> Result<(), IngestError> {
        let value: serde_json::Value = serde_json::from_str(body)
            .map_err(|err| IngestError::InvalidJson(err.to_string()))?;
        if !value.is_object() {
            return Err(IngestError::NotAnObject);
        }
        self.inner
            .pending
            .lock()
            .expect("pending lock poisoned")
            .push(body.to_string());
        Ok(())
    }

    async fn ensure_kv_connection(&self) -> Result<(), KvError> {
        if self.inner.kv.is_connected() {
            return Ok(());
        }
        self.kv_reconnect_loop().await
    }

    async fn kv_reconnect_loop(&self) -> Result<(), KvError> {
        let max_retries = self.config().redis_reconnect_max_retries;
        let interval = Duration::from_millis(self.config().redis_reconnect_interval_ms);
        for retry in 0..max_retries {
            match self.inner.kv.connect().await {
                Ok(()) => {
                    if retry > 0 {
                        info!(retries = retry, "kv reconnected");
                    }
                    return Ok(());
                }
                Err(err) => {
                    warn!(
                        "kv connection failed (retry {}/{}): {err}",
                        retry + 1,
                        max_retries
                    );
                }
            }
            if retry + 1 < max_retries {
                tokio::time::sleep(interval).await;
            }
        }
        Err(KvError::Other(format!(
            "failed to connect after {max_retries} retries"
        )))
    }

    async fn broker_reconnect_loop(&self) -> Result<(), BrokerError> {
        let max_retries = self.config().rabbit_mq_reconnect_max_retries;
        let interval = Duration::from_millis(self.config().rabbit_mq_reconnect_interval_ms);
        for retry in 0..max_retries {
            match self.inner.publisher.connect().await {
                Ok(()) => {
                    if retry > 0 {
                        info!(retries = retry, "broker reconnected");
                    }
                    return Ok(());
                }
                Err(err) => {
                    warn!(
                        "broker connection failed (retry {}/{}): {err}",
                        retry + 1,
                        max_retries
                    );
                }
            }
            if retry + 1 < max_retries {
                tokio::time::sleep(interval).await;
            }
        }
        Err(BrokerError::Other(format!(
            "failed to connect after {max_retries} retries"
        )))
    }

    /// One publish attempt; on a transient failure, reconnect once and
    /// retry exactly once.
    async fn publish_message(&self, body: &str) -> Result<(), BrokerError> {
        let queue = &self.config().publish_queue_name;
        let content_type = &self.config().content_type;
        let ttl_ms = self.config().publish_ttl_ms();
        match self
            .inner
            .publisher
            .publish(queue, body.as_bytes(), content_type, ttl_ms)
            .await
        {
            Err(err) if err.is_transient() => {
                warn!("publish failed, attempting reconnection: {err}");
                self.broker_reconnect_loop().await?;
                self.inner
                    .publisher
                    .publish(queue, body.as_bytes(), content_type, ttl_ms)
                    .await
            }
            other => other,
        }
    }

    /// The single cooperative flush task: sleep to the deadline in short
    /// slices, drain the buffer, publish in order, repeat until stop.
    async fn flush_loop(self, token: CancellationToken) {
        loop {
            self.sleep_until_deadline(&token).await;
            if token.is_cancelled() {
                info!("flush task exiting");
                return;
            }
            self.flush_pending(&token).await;
        }
    }

    async fn sleep_until_deadline(&self, token: &CancellationToken) {
        let deadline = Instant::now()
            + Duration::from_millis(self.config().publish_to_main_db_service_interval_ms);
        while !token.is_cancelled() {
            let now = Instant::now();
            if now >= deadline {
                return;
            }
            let slice = STOP_WAKE_SLICE.min(deadline - now);
            tokio::select! {
                _ = token.cancelled() => return,
                _ = tokio::time::sleep(slice) => {}
            }
        }
    }

    /// Drain the pending buffer and publish the snapshot in insertion
    /// order. Failed messages go back to the live buffer's tail; a stop
    /// observed mid-cycle puts the unpublished remainder back too.
    async fn flush_pending(&self, token: &CancellationToken) {
        let mut snapshot: VecDeque<String> = {
            let mut pending = self.inner.pending.lock().expect("pending lock poisoned");
            std::mem::take(&mut *pending).into()
        };

        while let Some(message) = snapshot.pop_front() {
            if token.is_cancelled() {
                let mut pending = self.inner.pending.lock().expect("pending lock poisoned");
                pending.push(message);
                pending.extend(snapshot);
                return;
            }
            match self.publish_message(&message).await {
                Ok(()) => debug!(bytes = message.len(), "job message published"),
                Err(err) => {
                    error!("failed to publish message: {err}");
                    self.inner
                        .pending
                        .lock()
                        .expect("pending lock poisoned")
                        .push(message);
                }
            }
        }
    }

    /// Optional mode: feed a cache stream's consumer group into the same
    /// pending buffer as the direct API. Invalid entries are acked and
    /// dropped so they cannot wedge the group.
    async fn stream_loop(self, token: CancellationToken) {
        let stream = self.config().redis_stream_key.clone();
        let group = self.config().redis_group_name.clone();
        let consumer = self.config().redis_consumer_name.clone();

        if self.config().redis_auto_create_group {
            if let Err(err) = self.inner.kv.xgroup_create(&stream, &group).await {
                warn!("stream group create failed: {err}");
            }
        }

        loop {
            let read = tokio::select! {
                _ = token.cancelled() => {
                    info!("stream consumer exiting");
                    return;
                }
                read = self.inner.kv.xreadgroup(
                    &stream,
                    &group,
                    &consumer,
                    self.config().redis_block_ms,
                    self.config().redis_count,
                ) => read,
            };

            match read {
                Ok(entries) => {
                    for entry in entries {
                        match self.enqueue_database_operation(&entry.body) {
                            Ok(()) => {}
                            Err(err) => {
                                warn!(id = %entry.id, "dropping invalid stream entry: {err}")
                            }
                        }
                        if let Err(err) = self.inner.kv.xack(&stream, &group, &entry.id).await {
                            warn!(id = %entry.id, "failed to ack stream entry: {err}");
                        }
                    }
                }
                Err(err) if err.is_transient() => {
                    warn!("stream read failed, attempting reconnection: {err}");
                    if self.kv_reconnect_loop().await.is_err() {
                        error!("stream consumer giving up after reconnect failure");
                        return;
                    }
                }
                Err(err) => {
                    error!("stream read failed: {err}");
                    tokio::select! {
                        _ = token.cancelled() => return,
                        _ = tokio::time::sleep(Duration::from_millis(
                            self.config().redis_block_ms.max(100),
                        )) => {}
                    }
                }
            }
        }
    }

    #[cfg(test)]
    fn pending_snapshot(&self) -> Vec<String> {
        self.inner
            .pending
            .lock()
            .expect("pending lock poisoned")
            .clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common_broker::{MockPublisher, PublishedMessage};
    use common_kv::{MockKvCall, MockKvClient};
    use std::time::Duration;
    use tokio::time::timeout;

    fn test_config() -> Config {
        Config {
            publish_to_main_db_service_interval_ms: 20,
            redis_reconnect_interval_ms: 1,
            rabbit_mq_reconnect_interval_ms: 1,
            high_priority_count: 0,
            normal_priority_count: 0,
            low_priority_count: 0,
            ..Config::default()
        }
    }

    fn service_with(
        config: Config,
        kv: MockKvClient,
        publisher: MockPublisher,
    ) -> CacheIngestService {
        CacheIngestService::new(Arc::new(config), Arc::new(kv), Arc::new(publisher))
    }

    fn published_bodies(messages: &[PublishedMessage]) -> Vec<String> {
        messages.iter().map(|m| m.body.clone()).collect()
    }

    #[tokio::test]
    async fn enqueue_accepts_only_json_objects() {
        let service = service_with(test_config(), MockKvClient::new(), MockPublisher::new());

        service
            .enqueue_database_operation(r#"{"op":"insert","table":"t","values":{"id":1}}"#)
            .unwrap();
        assert_eq!(service.pending_snapshot().len(), 1);

        assert!(matches!(
            service.enqueue_database_operation("{broken"),
            Err(IngestError::InvalidJson(_))
        ));
        assert!(matches!(
            service.enqueue_database_operation("[1,2,3]"),
            Err(IngestError::NotAnObject)
        ));
        // Rejected bodies never reach the buffer.
        assert_eq!(service.pending_snapshot().len(), 1);
    }

    #[tokio::test]
    async fn flush_publishes_in_insertion_order_and_recovers_from_a_transient_error() {
        // First publish attempt fails like a dropped socket; the cycle must
        // reconnect once, retry that message, and still deliver all three
        // exactly once, in order.
        let publisher = MockPublisher::new()
            .script_publish(Some(BrokerError::Io("socket reset".to_string())));
        let service = service_with(test_config(), MockKvClient::new(), publisher.clone());

        for body in [r#"{"a":1}"#, r#"{"b":2}"#, r#"{"c":3}"#] {
            service.enqueue_database_operation(body).unwrap();
        }

        let token = CancellationToken::new();
        service.flush_pending(&token).await;

        assert_eq!(
            published_bodies(&publisher.published()),
            vec![r#"{"a":1}"#, r#"{"b":2}"#, r#"{"c":3}"#]
        );
        assert_eq!(publisher.publish_attempts(), 4);
        assert!(publisher.connect_calls() >= 1);
        assert!(service.pending_snapshot().is_empty());
    }

    #[tokio::test]
    async fn failed_messages_return_to_the_tail_for_the_next_cycle() {
        // Non-transient failure: no reconnect, the message is re-queued.
        let publisher = MockPublisher::new()
            .script_publish(Some(BrokerError::Protocol("unroutable".to_string())));
        let service = service_with(test_config(), MockKvClient::new(), publisher.clone());

        service.enqueue_database_operation(r#"{"a":1}"#).unwrap();
        service.enqueue_database_operation(r#"{"b":2}"#).unwrap();

        let token = CancellationToken::new();
        service.flush_pending(&token).await;

        assert_eq!(published_bodies(&publisher.published()), vec![r#"{"b":2}"#]);
        assert_eq!(service.pending_snapshot(), vec![r#"{"a":1}"#.to_string()]);
        // No reconnection for permanent errors.
        assert_eq!(publisher.connect_calls(), 0);
    }

    #[tokio::test]
    async fn stop_mid_cycle_keeps_the_unpublished_remainder() {
        let token = CancellationToken::new();
        let stop = token.clone();
        // Cancel while the second message is being published: messages one
        // and two go out, message three stays staged.
        let publisher = MockPublisher::new().on_publish(move |attempt| {
            if attempt == 1 {
                stop.cancel();
            }
        });
        let service = service_with(test_config(), MockKvClient::new(), publisher.clone());

        for body in [r#"{"a":1}"#, r#"{"b":2}"#, r#"{"c":3}"#] {
            service.enqueue_database_operation(body).unwrap();
        }

        service.flush_pending(&token).await;

        assert_eq!(
            published_bodies(&publisher.published()),
            vec![r#"{"a":1}"#, r#"{"b":2}"#]
        );
        assert_eq!(service.pending_snapshot(), vec![r#"{"c":3}"#.to_string()]);
    }

    #[tokio::test]
    async fn flush_loop_does_not_reschedule_after_stop() {
        let service = service_with(test_config(), MockKvClient::new(), MockPublisher::new());
        let token = CancellationToken::new();

        let handle = tokio::spawn(service.clone().flush_loop(token.clone()));
        token.cancel();
        timeout(Duration::from_secs(1), handle)
            .await
            .expect("flush loop must exit promptly on stop")
            .unwrap();
    }

    #[tokio::test]
    async fn set_and_get_retry_once_after_a_transient_failure() {
        let kv = MockKvClient::new()
            .with_set_failure(KvError::Io("connection reset".to_string()));
        let service = service_with(test_config(), kv.clone(), MockPublisher::new());

        service.set_key_value("greeting", "hello", 0).await.unwrap();
        assert_eq!(kv.stored("greeting").as_deref(), Some("hello"));

        // The failing set, a reconnect, then the successful retry.
        let calls = kv.calls();
        let sets = calls
            .iter()
            .filter(|call| matches!(call, MockKvCall::Set { .. }))
            .count();
        assert_eq!(sets, 2);
        assert!(calls.iter().any(|call| matches!(call, MockKvCall::Connect)));

        let value = service.get_key_value("greeting").await.unwrap();
        assert_eq!(value.as_deref(), Some("hello"));
        assert_eq!(service.get_key_value("missing").await.unwrap(), None);
    }

    #[tokio::test]
    async fn zero_ttl_is_stored_without_expiry() {
        let kv = MockKvClient::new();
        let service = service_with(test_config(), kv.clone(), MockPublisher::new());

        service.set_key_value("k", "v", 0).await.unwrap();
        assert!(kv.calls().iter().any(|call| matches!(
            call,
            MockKvCall::Set { ttl_seconds: 0, .. }
        )));
    }

    #[tokio::test]
    async fn zero_reconnect_retries_fails_without_retrying() {
        let mut config = test_config();
        config.redis_reconnect_max_retries = 0;
        let kv = MockKvClient::new();
        let service = service_with(config, kv.clone(), MockPublisher::new());

        let err = service.set_key_value("k", "v", 0).await.unwrap_err();
        assert!(matches!(err, IngestError::Kv(_)));
        assert!(kv.calls().is_empty());
    }

    #[tokio::test]
    async fn start_fails_when_the_broker_stays_unreachable() {
        let mut config = test_config();
        config.rabbit_mq_reconnect_max_retries = 2;
        let publisher = MockPublisher::new()
            .script_connect_failure(BrokerError::Io("refused".to_string()))
            .script_connect_failure(BrokerError::Io("refused".to_string()));
        let service = service_with(config, MockKvClient::new(), publisher.clone());

        let err = service.start().await.unwrap_err();
        assert!(matches!(err, IngestError::Broker(_)));
        assert_eq!(publisher.connect_calls(), 2);
    }

    #[tokio::test]
    async fn started_service_flushes_on_the_interval() {
        let publisher = MockPublisher::new();
        let service = service_with(test_config(), MockKvClient::new(), publisher.clone());

        service.start().await.unwrap();
        service.enqueue_database_operation(r#"{"x":1}"#).unwrap();
        service.enqueue_database_operation(r#"{"y":2}"#).unwrap();

        timeout(Duration::from_secs(2), async {
            while publisher.published().len() < 2 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("messages should be flushed within the interval");

        assert_eq!(
            published_bodies(&publisher.published()),
            vec![r#"{"x":1}"#, r#"{"y":2}"#]
        );
        let first = &publisher.published()[0];
        assert_eq!(first.queue, "db.write");
        assert_eq!(first.content_type, "application/json");
        assert_eq!(first.ttl_ms, None);

        service.stop().await;
        service.wait_stop().await;
    }

    #[tokio::test]
    async fn stream_mode_feeds_the_pending_buffer_and_acks() {
        let mut config = test_config();
        config.redis_stream_key = "cache:changes".to_string();
        config.redis_block_ms = 10;
        // Long flush interval so entries stay visible in the buffer.
        config.publish_to_main_db_service_interval_ms = 60_000;

        let kv = MockKvClient::new()
            .with_stream_entry("1-1", r#"{"op":"insert","table":"t","values":{"id":1}}"#)
            .with_stream_entry("1-2", "not json");
        let service = service_with(config, kv.clone(), MockPublisher::new());

        service.start().await.unwrap();

        timeout(Duration::from_secs(2), async {
            while kv.acked().len() < 2 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("stream entries should be consumed");

        // The valid entry is staged; the invalid one is acked and dropped.
        assert_eq!(
            service.pending_snapshot(),
            vec![r#"{"op":"insert","table":"t","values":{"id":1}}"#.to_string()]
        );
        assert_eq!(kv.acked(), vec!["1-1".to_string(), "1-2".to_string()]);

        service.stop().await;
    }
}
