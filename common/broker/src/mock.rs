use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use crate::{BrokerError, QueuePublisher};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishedMessage {
    pub queue: String,
    pub body: String,
    pub content_type: String,
    pub ttl_ms: Option<u32>,
}

type PublishHook = Box<dyn Fn(usize) + Send + Sync>;

/// Scriptable in-memory stand-in for [`AmqpPublisher`]. Publish failures
/// are queued and consumed one call at a time; an optional hook observes
/// each publish attempt by index (used to inject stop signals mid-cycle).
#[derive(Clone, Default)]
pub struct MockPublisher {
    connected: Arc<AtomicBool>,
    connect_failures: Arc<Mutex<VecDeque<BrokerError>>>,
    publish_failures: Arc<Mutex<VecDeque<Option<BrokerError>>>>,
    published: Arc<Mutex<Vec<PublishedMessage>>>,
    attempts: Arc<AtomicUsize>,
    connect_calls: Arc<AtomicUsize>,
    on_publish: Arc<Mutex<Option<PublishHook>>>,
}

impl MockPublisher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue the outcome of the next publish call: `Some(err)` fails it,
    /// `None` lets it through. Later calls with an empty script succeed.
    pub fn script_publish(self, outcome: Option<BrokerError>) -> Self {
        self.publish_failures.lock().unwrap().push_back(outcome);
        self
    }

    pub fn script_connect_failure(self, err: BrokerError) -> Self {
        self.connect_failures.lock().unwrap().push_back(err);
        self
    }

    pub fn on_publish(self, hook: impl Fn(usize) + Send + Sync + 'static) -> Self {
        *self.on_publish.lock().unwrap() = Some(Box::new(hook));
        self
    }

    pub fn published(&self) -> Vec<PublishedMessage> {
        self.published.lock().unwrap().clone()
    }

    pub fn publish_attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    pub fn connect_calls(&self) -> usize {
        self.connect_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl QueuePublisher for MockPublisher {
    async fn connect(&self) -> Result<(), BrokerError> {
        self.connect_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(err) = self.connect_failures.lock().unwrap().pop_front() {
            return Err(err);
        }
        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn publish(
        &self,
        queue: &str,
        body: &[u8],
        content_type: &str,
        ttl_ms: Option<u32>,
    ) -> Result<(), BrokerError> {
        let attempt = self.attempts.fetch_add(1, Ordering::SeqCst);
        if let Some(hook) = self.on_publish.lock().unwrap().as_ref() {
            hook(attempt);
        }
        if let Some(Some(err)) = self.publish_failures.lock().unwrap().pop_front() {
            return Err(err);
        }
        self.published.lock().unwrap().push(PublishedMessage {
            queue: queue.to_string(),
            body: String::from_utf8_lossy(body).to_string(),
            content_type: content_type.to_string(),
            ttl_ms,
        });
        Ok(())
    }
}
