use std::sync::Mutex;

use lapin::options::{
    BasicConsumeOptions, BasicQosOptions, QueueDeclareOptions,
};
use lapin::types::FieldTable;
use lapin::{Channel, Connection, ConnectionProperties, Consumer};
use tracing::info;

use crate::{BrokerConfig, BrokerError, QueuePolicies};

struct ConsumerState {
    connection: Connection,
    channel: Channel,
}

/// AMQP work-queue consumer. Lifecycle: `connect` with the configured
/// heartbeat, `set_queue_policies` before `declare_queue` (policies are
/// fixed at declaration), then `start_consuming` to obtain the delivery
/// stream. `close` unwinds channel and connection.
pub struct AmqpConsumer {
    config: BrokerConfig,
    policies: Mutex<QueuePolicies>,
    state: Mutex<Option<ConsumerState>>,
}

impl AmqpConsumer {
    pub fn new(config: BrokerConfig) -> Self {
        Self {
            config,
            policies: Mutex::new(QueuePolicies::default()),
            state: Mutex::new(None),
        }
    }

    pub fn set_queue_policies(&self, policies: QueuePolicies) {
        *self.policies.lock().expect("consumer policy lock poisoned") = policies;
    }

    pub async fn connect(&self) -> Result<(), BrokerError> {
        let properties = ConnectionProperties::default()
            .with_executor(tokio_executor_trait::Tokio::current())
            .with_reactor(tokio_reactor_trait::Tokio);
        let connection = Connection::connect(&self.config.amqp_uri(), properties).await?;
        let channel = connection.create_channel().await?;
        // One unacked delivery at a time: the executor is sequential and
        // rejected messages should requeue close to their original order.
        channel.basic_qos(1, BasicQosOptions::default()).await?;
        info!(
            host = %self.config.host,
            port = self.config.port,
            heartbeat = self.config.heartbeat_secs,
            channel_id = self.config.channel_id,
            "broker consumer connected"
        );
        *self.state.lock().expect("consumer state lock poisoned") = Some(ConsumerState {
            connection,
            channel,
        });
        Ok(())
    }

    pub fn is_connected(&self) -> bool {
        self.state
            .lock()
            .expect("consumer state lock poisoned")
            .as_ref()
            .map(|state| state.connection.status().connected())
            .unwrap_or(false)
    }

    fn current_channel(&self) -> Result<Channel, BrokerError> {
        self.state
            .lock()
            .expect("consumer state lock poisoned")
            .as_ref()
            .map(|state| state.channel.clone())
            .ok_or(BrokerError::NotConnected)
    }

    /// Declare the durable queue with the configured dead-letter/TTL
    /// arguments applied.
    pub async fn declare_queue(&self, queue: &str) -> Result<(), BrokerError> {
        let channel = self.current_channel()?;
        let arguments = self
            .policies
            .lock()
            .expect("consumer policy lock poisoned")
            .to_queue_arguments();
        channel
            .queue_declare(
                queue,
                QueueDeclareOptions {
                    durable: true,
                    ..QueueDeclareOptions::default()
                },
                arguments,
            )
            .await?;
        info!(queue, "queue declared");
        Ok(())
    }

    pub async fn start_consuming(
        &self,
        queue: &str,
        consumer_tag: &str,
    ) -> Result<Consumer, BrokerError> {
        let channel = self.current_channel()?;
        let consumer = channel
            .basic_consume(
                queue,
                consumer_tag,
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await?;
        info!(queue, consumer_tag, "consuming started");
        Ok(consumer)
    }

    /// Close channel and connection; safe to call when never connected.
    pub async fn close(&self) -> Result<(), BrokerError> {
        let state = self
            .state
            .lock()
            .expect("consumer state lock poisoned")
            .take();
        if let Some(state) = state {
            state.channel.close(200, "shutting down").await?;
            state.connection.close(200, "shutting down").await?;
            info!("broker consumer disconnected");
        }
        Ok(())
    }
}
