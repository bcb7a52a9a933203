use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use crate::{KvClient, KvError, StreamEntry};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MockKvCall {
    Connect,
    Set { key: String, value: String, ttl_seconds: u64 },
    Get { key: String },
    XGroupCreate { stream: String, group: String },
    XReadGroup { stream: String, group: String, consumer: String },
    XAck { stream: String, group: String, id: String },
}

/// Scriptable in-memory stand-in for [`RedisKv`]. Failures are queued per
/// operation and consumed one call at a time, so tests can express "first
/// call fails, retry succeeds".
#[derive(Clone, Default)]
pub struct MockKvClient {
    store: Arc<Mutex<HashMap<String, String>>>,
    connected: Arc<AtomicBool>,
    connect_failures: Arc<Mutex<VecDeque<KvError>>>,
    set_failures: Arc<Mutex<VecDeque<KvError>>>,
    get_failures: Arc<Mutex<VecDeque<KvError>>>,
    stream_entries: Arc<Mutex<VecDeque<StreamEntry>>>,
    acked: Arc<Mutex<Vec<String>>>,
    calls: Arc<Mutex<Vec<MockKvCall>>>,
}

impl MockKvClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_connect_failure(self, err: KvError) -> Self {
        self.connect_failures.lock().unwrap().push_back(err);
        self
    }

    pub fn with_set_failure(self, err: KvError) -> Self {
        self.set_failures.lock().unwrap().push_back(err);
        self
    }

    pub fn with_get_failure(self, err: KvError) -> Self {
        self.get_failures.lock().unwrap().push_back(err);
        self
    }

    pub fn with_stream_entry(self, id: &str, body: &str) -> Self {
        self.stream_entries.lock().unwrap().push_back(StreamEntry {
            id: id.to_string(),
            body: body.to_string(),
        });
        self
    }

    pub fn calls(&self) -> Vec<MockKvCall> {
        self.calls.lock().unwrap().clone()
    }

    pub fn acked(&self) -> Vec<String> {
        self.acked.lock().unwrap().clone()
    }

    pub fn stored(&self, key: &str) -> Option<String> {
        self.store.lock().unwrap().get(key).cloned()
    }

    fn record(&self, call: MockKvCall) {
        self.calls.lock().unwrap().push(call);
    }

    fn next_failure(queue: &Mutex<VecDeque<KvError>>) -> Option<KvError> {
        queue.lock().unwrap().pop_front()
    }
}

#[async_trait]
impl KvClient for MockKvClient {
    async fn connect(&self) -> Result<(), KvError> {
        self.record(MockKvCall::Connect);
        if let Some(err) = Self::next_failure(&self.connect_failures) {
            return Err(err);
        }
        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn set(&self, key: &str, value: &str, ttl_seconds: u64) -> Result<(), KvError> {
        self.record(MockKvCall::Set {
            key: key.to_string(),
            value: value.to_string(),
            ttl_seconds,
        });
        if let Some(err) = Self::next_failure(&self.set_failures) {
            return Err(err);
        }
        self.store
            .lock()
            .unwrap()
            .insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>, KvError> {
        self.record(MockKvCall::Get {
            key: key.to_string(),
        });
        if let Some(err) = Self::next_failure(&self.get_failures) {
            return Err(err);
        }
        Ok(self.store.lock().unwrap().get(key).cloned())
    }

    async fn xgroup_create(&self, stream: &str, group: &str) -> Result<(), KvError> {
        self.record(MockKvCall::XGroupCreate {
            stream: stream.to_string(),
            group: group.to_string(),
        });
        Ok(())
    }

    async fn xreadgroup(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        block_ms: u64,
        count: usize,
    ) -> Result<Vec<StreamEntry>, KvError> {
        self.record(MockKvCall::XReadGroup {
            stream: stream.to_string(),
            group: group.to_string(),
            consumer: consumer.to_string(),
        });
        let drained: Vec<StreamEntry> = {
            let mut entries = self.stream_entries.lock().unwrap();
            let take = count.min(entries.len());
            entries.drain(..take).collect()
        };
        if drained.is_empty() {
            // Behave like a blocking read on an idle stream.
            tokio::time::sleep(std::time::Duration::from_millis(block_ms)).await;
        }
        Ok(drained)
    }

    async fn xack(&self, stream: &str, group: &str, id: &str) -> Result<(), KvError> {
        self.record(MockKvCall::XAck {
            stream: stream.to_string(),
            group: group.to_string(),
            id: id.to_string(),
        });
        self.acked.lock().unwrap().push(id.to_string());
        Ok(())
    }
}
