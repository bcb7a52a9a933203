use std::sync::Arc;

use common_broker::{AmqpConsumer, BrokerError, QueuePolicies};
use futures::StreamExt;
use lapin::message::Delivery;
use lapin::options::{BasicAckOptions, BasicRejectOptions};
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::error::ApplyError;
use crate::executor::DbJobExecutor;

const CONSUMER_TAG: &str = "db-apply";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceState {
    Idle,
    Starting,
    Consuming,
    Stopping,
}

/// Stop-aware broker consumer driving the executor. Delivery is
/// at-least-once: handler success acks, handler failure rejects, and the
/// requeue flag depends on the error kind and the configured policy.
pub struct DbApplyService {
    consumer: Arc<AmqpConsumer>,
    executor: Arc<DbJobExecutor>,
    queue: String,
    requeue_on_failure: bool,
    policies: QueuePolicies,
    state: watch::Sender<ServiceState>,
    stop: CancellationToken,
    consume_task: Mutex<Option<JoinHandle<()>>>,
}

impl DbApplyService {
    pub fn new(
        consumer: Arc<AmqpConsumer>,
        executor: Arc<DbJobExecutor>,
        queue: String,
        requeue_on_failure: bool,
        policies: QueuePolicies,
    ) -> Self {
        let (state, _) = watch::channel(ServiceState::Idle);
        Self {
            consumer,
            executor,
            queue,
            requeue_on_failure,
            policies,
            state,
            stop: CancellationToken::new(),
            consume_task: Mutex::new(None),
        }
    }

    /// Run the start sequence. Any failing step releases what was acquired
    /// and returns the service to Idle.
    pub async fn start(&self) -> Result<(), BrokerError> {
        self.state.send_replace(ServiceState::Starting);

        match self.start_steps().await {
            Ok(deliveries) => {
                let task = tokio::spawn(consume_loop(
                    deliveries,
                    self.executor.clone(),
                    self.requeue_on_failure,
                    self.stop.clone(),
                    self.consumer.clone(),
                    self.state.clone(),
                ));
                *self.consume_task.lock().await = Some(task);
                self.state.send_replace(ServiceState::Consuming);
                info!(queue = %self.queue, "db-apply consuming");
                Ok(())
            }
            Err(err) => {
                error!("start failed: {err}");
                if let Err(close_err) = self.consumer.close().await {
                    warn!("error releasing broker connection: {close_err}");
                }
                self.state.send_replace(ServiceState::Idle);
                Err(err)
            }
        }
    }

    async fn start_steps(&self) -> Result<lapin::Consumer, BrokerError> {
        self.consumer.connect().await?;
        self.consumer.set_queue_policies(self.policies.clone());
        self.consumer.declare_queue(&self.queue).await?;
        self.consumer.start_consuming(&self.queue, CONSUMER_TAG).await
    }

    /// Block until the service is back to Idle.
    pub async fn wait_stop(&self) {
        let mut receiver = self.state.subscribe();
        loop {
            if *receiver.borrow() == ServiceState::Idle {
                return;
            }
            if receiver.changed().await.is_err() {
                return;
            }
        }
    }

    /// Request stop and join the consume loop.
    pub async fn stop(&self) {
        self.stop.cancel();
        let task = self.consume_task.lock().await.take();
        if let Some(task) = task {
            if let Err(err) = task.await {
                error!("consume task join failed: {err}");
            }
        }
        self.state.send_replace(ServiceState::Idle);
    }
}

async fn consume_loop(
    mut deliveries: lapin::Consumer,
    executor: Arc<DbJobExecutor>,
    requeue_on_failure: bool,
    stop: CancellationToken,
    consumer: Arc<AmqpConsumer>,
    state: watch::Sender<ServiceState>,
) {
    loop {
        tokio::select! {
            _ = stop.cancelled() => {
                info!("stop requested, leaving consume loop");
                break;
            }
            next = deliveries.next() => match next {
                Some(Ok(delivery)) => {
                    process_delivery(&executor, requeue_on_failure, delivery).await;
                }
                Some(Err(err)) => {
                    error!("broker delivery failed: {err}");
                    break;
                }
                None => {
                    error!("delivery stream closed by broker");
                    break;
                }
            }
        }
    }

    state.send_replace(ServiceState::Stopping);
    if let Err(err) = consumer.close().await {
        warn!("error closing broker consumer: {err}");
    }
    state.send_replace(ServiceState::Idle);
}

async fn process_delivery(executor: &DbJobExecutor, requeue_on_failure: bool, delivery: Delivery) {
    let content_type = delivery
        .properties
        .content_type()
        .as_ref()
        .map(|ct| ct.as_str().to_string())
        .unwrap_or_default();

    match handle_body(executor, &delivery.data, &content_type).await {
        Ok(()) => {
            if let Err(err) = delivery.ack(BasicAckOptions::default()).await {
                error!("failed to ack delivery: {err}");
            }
        }
        Err(apply_err) => {
            let requeue = should_requeue(&apply_err, requeue_on_failure);
            error!(requeue, "failed to apply job message: {apply_err}");
            if let Err(err) = delivery.reject(BasicRejectOptions { requeue }).await {
                error!("failed to reject delivery: {err}");
            }
        }
    }
}

/// Content-type gate, then the executor. The prefix match tolerates
/// parameters (`application/json; charset=utf-8`) and is case-sensitive.
async fn handle_body(
    executor: &DbJobExecutor,
    data: &[u8],
    content_type: &str,
) -> Result<(), ApplyError> {
    if !content_type.starts_with("application/json") {
        return Err(ApplyError::UnsupportedContentType(content_type.to_string()));
    }
    let body =
        std::str::from_utf8(data).map_err(|err| ApplyError::MalformedJson(err.to_string()))?;
    executor.handle_message(body).await
}

/// Permanent message errors never requeue; database errors follow the
/// configured policy.
pub fn should_requeue(err: &ApplyError, requeue_on_failure: bool) -> bool {
    requeue_on_failure && err.requeue_eligible()
}
