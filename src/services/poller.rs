//! Long-polling queue consumer for deployments without a managed event
//! source mapping (containers, local runs).
//!
//! Settlement follows the managed integration: a message is deleted after it
//! completes, forwarded to the dead-letter queue and deleted after a
//! permanent rejection, and left alone after a retryable failure so the
//! visibility timeout brings it back. A message still running when the
//! policy's function timeout expires is abandoned and left for redelivery,
//! as the managed runtime would do.

use crate::models::event::SqsMessage;
use crate::services::processor::{MessageOutcome, Processor};
use async_trait::async_trait;
use aws_config::SdkConfig;
use aws_sdk_sqs::{
    Client,
    error::DisplayErrorContext,
    types::{MessageAttributeValue, MessageSystemAttributeName},
};
use std::{future::Future, sync::Arc, time::Duration};
use thiserror::Error;
use tokio::{
    sync::Semaphore,
    task::{JoinError, JoinSet},
};
use tracing::{debug, error, info, warn};

const LONG_POLL_WAIT: Duration = Duration::from_secs(20);
const RECEIVE_BACKOFF: Duration = Duration::from_secs(5);
const FAILURE_REASON_ATTRIBUTE: &str = "failure_reason";

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("{operation} failed: {message}")]
    Sqs {
        operation: &'static str,
        message: String,
    },
    #[error("message `{0}` has no receipt handle")]
    NoReceipt(String),
}

#[async_trait]
pub trait MessageQueue: Send + Sync {
    async fn receive(
        &self,
        max_messages: u32,
        wait: Duration,
        visibility: Duration,
    ) -> Result<Vec<SqsMessage>, QueueError>;

    async fn delete(&self, message: &SqsMessage) -> Result<(), QueueError>;
}

/// Where permanently rejected messages go, in both the poller and the
/// `/events` batch handler.
#[async_trait]
pub trait DeadLetterQueue: Send + Sync {
    /// Forward a rejected message. Returns `false` when there is nowhere to
    /// forward it to.
    async fn dead_letter(&self, message: &SqsMessage, reason: &str) -> Result<bool, QueueError>;
}

pub struct SqsQueue {
    client: Client,
    queue_url: String,
}

impl SqsQueue {
    pub fn new(sdk_config: &SdkConfig, queue_url: String) -> Self {
        Self {
            client: Client::new(sdk_config),
            queue_url,
        }
    }
}

pub struct SqsDeadLetterQueue {
    client: Client,
    queue_url: String,
}

impl SqsDeadLetterQueue {
    pub fn new(sdk_config: &SdkConfig, queue_url: String) -> Self {
        Self {
            client: Client::new(sdk_config),
            queue_url,
        }
    }
}

fn sqs_error<E>(operation: &'static str, err: E) -> QueueError
where
    E: std::error::Error,
{
    QueueError::Sqs {
        operation,
        message: DisplayErrorContext(&err).to_string(),
    }
}

#[async_trait]
impl MessageQueue for SqsQueue {
    async fn receive(
        &self,
        max_messages: u32,
        wait: Duration,
        visibility: Duration,
    ) -> Result<Vec<SqsMessage>, QueueError> {
        let resp = self
            .client
            .receive_message()
            .queue_url(&self.queue_url)
            .max_number_of_messages(max_messages as i32)
            .wait_time_seconds(wait.as_secs() as i32)
            .visibility_timeout(visibility.as_secs() as i32)
            .message_system_attribute_names(MessageSystemAttributeName::ApproximateReceiveCount)
            .send()
            .await
            .map_err(|err| sqs_error("ReceiveMessage", err))?;

        let messages = resp
            .messages
            .unwrap_or_default()
            .into_iter()
            .filter_map(|msg| {
                let Some(body) = msg.body else {
                    warn!("Received SQS message with empty body. Skipping.");
                    return None;
                };
                Some(SqsMessage {
                    message_id: msg.message_id.unwrap_or_default(),
                    receipt_handle: msg.receipt_handle,
                    body,
                    attributes: msg
                        .attributes
                        .unwrap_or_default()
                        .into_iter()
                        .map(|(name, value)| (name.as_str().to_string(), value))
                        .collect(),
                    event_source_arn: None,
                })
            })
            .collect();
        Ok(messages)
    }

    async fn delete(&self, message: &SqsMessage) -> Result<(), QueueError> {
        let receipt = message
            .receipt_handle
            .as_deref()
            .ok_or_else(|| QueueError::NoReceipt(message.message_id.clone()))?;
        self.client
            .delete_message()
            .queue_url(&self.queue_url)
            .receipt_handle(receipt)
            .send()
            .await
            .map_err(|err| sqs_error("DeleteMessage", err))?;
        Ok(())
    }
}

#[async_trait]
impl DeadLetterQueue for SqsDeadLetterQueue {
    async fn dead_letter(&self, message: &SqsMessage, reason: &str) -> Result<bool, QueueError> {
        let reason = MessageAttributeValue::builder()
            .data_type("String")
            .string_value(reason)
            .build()
            .map_err(|err| sqs_error("SendMessage", err))?;

        self.client
            .send_message()
            .queue_url(&self.queue_url)
            .message_body(&message.body)
            .message_attributes(FAILURE_REASON_ATTRIBUTE, reason)
            .send()
            .await
            .map_err(|err| sqs_error("SendMessage", err))?;
        Ok(true)
    }
}

/// What happened to a message after processing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Settlement {
    Deleted,
    DeadLettered,
    /// Rejected with no dead-letter queue to forward to.
    Discarded,
    /// Left on the queue for redelivery.
    Retained,
}

pub struct Poller {
    queue: Arc<dyn MessageQueue>,
    processor: Arc<Processor>,
    permits: Arc<Semaphore>,
    wait_time: Duration,
}

impl Poller {
    pub fn new(queue: Arc<dyn MessageQueue>, processor: Arc<Processor>) -> Self {
        let permits = processor.config().policy.max_concurrency as usize;
        Self {
            queue,
            processor,
            permits: Arc::new(Semaphore::new(permits)),
            wait_time: LONG_POLL_WAIT,
        }
    }

    pub fn with_wait_time(mut self, wait_time: Duration) -> Self {
        self.wait_time = wait_time;
        self
    }

    fn batch_size(&self) -> usize {
        self.processor.config().policy.batch_size as usize
    }

    fn visibility_timeout(&self) -> Duration {
        self.processor.config().policy.visibility_timeout
    }

    /// Poll until `shutdown` resolves, then wait for in-flight messages.
    ///
    /// Only as many messages are received as there are free permits, so no
    /// message sits out its visibility window waiting for a worker.
    pub async fn run(&self, shutdown: impl Future<Output = ()>) {
        let mut tasks = JoinSet::new();
        tokio::pin!(shutdown);

        info!(
            max_concurrency = self.processor.config().policy.max_concurrency,
            "queue poller started"
        );

        loop {
            while let Some(result) = tasks.try_join_next() {
                log_join(result);
            }

            let capacity = self.permits.available_permits().min(self.batch_size());
            if capacity == 0 {
                tokio::select! {
                    _ = &mut shutdown => break,
                    Some(result) = tasks.join_next() => log_join(result),
                }
                continue;
            }

            let received = tokio::select! {
                _ = &mut shutdown => break,
                received = self.queue.receive(capacity as u32, self.wait_time, self.visibility_timeout()) => received,
            };

            match received {
                Ok(messages) if messages.is_empty() => debug!("No messages received from SQS queue."),
                Ok(messages) => self.dispatch(messages, &mut tasks).await,
                Err(err) => {
                    error!(error = %err, "failed to receive messages");
                    tokio::select! {
                        _ = &mut shutdown => break,
                        _ = tokio::time::sleep(RECEIVE_BACKOFF) => {}
                    }
                }
            }
        }

        info!(in_flight = tasks.len(), "shutting down, waiting for in-flight messages");
        while let Some(result) = tasks.join_next().await {
            log_join(result);
        }
        info!("queue poller stopped");
    }

    async fn dispatch(&self, messages: Vec<SqsMessage>, tasks: &mut JoinSet<Settlement>) {
        for message in messages {
            let Ok(permit) = self.permits.clone().acquire_owned().await else {
                return;
            };
            let queue = self.queue.clone();
            let processor = self.processor.clone();
            tasks.spawn(async move {
                let _permit = permit;
                settle(queue.as_ref(), &processor, message).await
            });
        }
    }

    /// Receive one batch and settle every message in it.
    pub async fn poll_once(&self) -> Result<Vec<Settlement>, QueueError> {
        let messages = self
            .queue
            .receive(self.batch_size() as u32, self.wait_time, self.visibility_timeout())
            .await?;
        Ok(self.process_batch(messages).await)
    }

    /// Settle `messages` with at most `max_concurrency` in flight.
    pub async fn process_batch(&self, messages: Vec<SqsMessage>) -> Vec<Settlement> {
        let mut tasks = JoinSet::new();
        self.dispatch(messages, &mut tasks).await;

        let mut settlements = Vec::with_capacity(tasks.len());
        while let Some(result) = tasks.join_next().await {
            match result {
                Ok(settlement) => settlements.push(settlement),
                Err(err) => error!(error = %err, "message task failed"),
            }
        }
        settlements
    }
}

fn log_join(result: Result<Settlement, JoinError>) {
    match result {
        Ok(settlement) => debug!(?settlement, "message settled"),
        Err(err) => error!(error = %err, "message task failed"),
    }
}

async fn settle(queue: &dyn MessageQueue, processor: &Processor, message: SqsMessage) -> Settlement {
    let function_timeout = processor.config().policy.function_timeout;
    let outcome = match tokio::time::timeout(function_timeout, processor.process_message(&message)).await {
        Ok(outcome) => outcome,
        Err(_) => {
            warn!(
                message_id = %message.message_id,
                timeout_secs = function_timeout.as_secs_f64(),
                "processing exceeded the function timeout, leaving message for redelivery"
            );
            return Settlement::Retained;
        }
    };

    let settlement = match outcome {
        MessageOutcome::Completed { .. } => Settlement::Deleted,
        MessageOutcome::Failed { .. } => return Settlement::Retained,
        MessageOutcome::Rejected { reason } => match processor.dead_letter(&message, &reason).await {
            Ok(true) => {
                info!(message_id = %message.message_id, %reason, "message moved to dead-letter queue");
                Settlement::DeadLettered
            }
            Ok(false) => {
                warn!(message_id = %message.message_id, %reason, "no dead-letter queue configured, dropping rejected message");
                Settlement::Discarded
            }
            Err(err) => {
                error!(message_id = %message.message_id, error = %err, "could not dead-letter message, leaving it on the queue");
                return Settlement::Retained;
            }
        },
    };

    if let Err(err) = queue.delete(&message).await {
        error!(message_id = %message.message_id, error = %err, "Failed to delete SQS message");
        return Settlement::Retained;
    }
    settlement
}
