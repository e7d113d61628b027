//! Event-driven cleansing: one S3 record in, one rewritten object out.
//!
//! `process_record` owns the fetch → detect → cleanse → verify → write cycle
//! for a single object. `process_message` runs every record of one queue
//! message and decides how the message should be settled; `handle_batch`
//! turns a whole queue batch into a partial-failure response, forwarding
//! rejected messages to the dead-letter queue on the way.

use crate::models::event::{BatchResponse, EventError, S3EventRecord, SqsEvent, SqsMessage};
use crate::models::object::{PROCESSOR_VERSION, VersionCheck, compare_versions};
use crate::services::cleanse::{self, CleanseError, DocumentKind};
use crate::services::delivery::DeliveryPolicy;
use crate::services::poller::{DeadLetterQueue, QueueError};
use crate::services::storage_service::{ObjectStore, PutObject, StoreError};
use bytes::Bytes;
use std::sync::Arc;
use thiserror::Error;
use tokio::task::JoinError;
use tracing::{Instrument, debug, error, info, info_span, warn};

#[derive(Debug, Clone, Default)]
pub struct ProcessorConfig {
    /// Key suffixes to process (case-insensitive). Empty means every key.
    pub suffixes: Vec<String>,
    pub policy: DeliveryPolicy,
}

impl ProcessorConfig {
    fn accepts(&self, key: &str) -> bool {
        if self.suffixes.is_empty() {
            return true;
        }
        let key = key.to_ascii_lowercase();
        self.suffixes
            .iter()
            .any(|suffix| key.ends_with(&suffix.to_ascii_lowercase()))
    }
}

/// How a failure should be treated by the queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// May succeed on redelivery.
    Transient,
    /// Will fail the same way every time.
    Permanent,
    /// Needs an operator (missing grant, missing bucket) before redelivery helps.
    Configuration,
}

#[derive(Debug, Error)]
pub enum ProcessError {
    #[error(transparent)]
    Event(#[from] EventError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Cleanse(#[from] CleanseError),
    #[error("cleansing task failed: {0}")]
    Task(#[from] JoinError),
}

impl ProcessError {
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::Event(_) => ErrorClass::Permanent,
            Self::Store(err) => match err {
                StoreError::PermissionDenied { .. } | StoreError::BucketNotFound(_) => {
                    ErrorClass::Configuration
                }
                err if err.is_transient() => ErrorClass::Transient,
                _ => ErrorClass::Permanent,
            },
            Self::Cleanse(err) if err.is_permanent() => ErrorClass::Permanent,
            Self::Cleanse(_) | Self::Task(_) => ErrorClass::Transient,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SkipReason {
    NotObjectCreated(String),
    Folder,
    SuffixFiltered,
    UnknownType,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordOutcome {
    Cleaned { kind: DocumentKind },
    AlreadyProcessed { version: String },
    Skipped(SkipReason),
}

/// How a queue message should be settled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageOutcome {
    /// Every record finished; delete the message.
    Completed { records: Vec<RecordOutcome> },
    /// A record failed permanently; retrying is pointless.
    Rejected { reason: String },
    /// A record failed in a way redelivery may fix; leave it to the queue.
    Failed { error: String, class: ErrorClass },
}

pub struct Processor {
    store: Arc<dyn ObjectStore>,
    config: ProcessorConfig,
    dead_letters: Option<Arc<dyn DeadLetterQueue>>,
}

impl Processor {
    pub fn new(store: Arc<dyn ObjectStore>, config: ProcessorConfig) -> Self {
        Self {
            store,
            config,
            dead_letters: None,
        }
    }

    pub fn with_dead_letter_queue(mut self, dead_letters: Arc<dyn DeadLetterQueue>) -> Self {
        self.dead_letters = Some(dead_letters);
        self
    }

    pub fn store(&self) -> &Arc<dyn ObjectStore> {
        &self.store
    }

    pub fn config(&self) -> &ProcessorConfig {
        &self.config
    }

    /// Cleanse the object named by one S3 event record and write it back.
    pub async fn process_record(
        &self,
        record: &S3EventRecord,
    ) -> Result<RecordOutcome, ProcessError> {
        if !record.is_object_created() {
            let event_name = record.event_name.clone().unwrap_or_default();
            debug!(%event_name, "ignoring non-create event");
            return Ok(RecordOutcome::Skipped(SkipReason::NotObjectCreated(event_name)));
        }

        let bucket = record.bucket_name();
        let key = record.object_key()?;
        if key.ends_with('/') {
            debug!(%key, "ignoring folder placeholder");
            return Ok(RecordOutcome::Skipped(SkipReason::Folder));
        }
        if !self.config.accepts(&key) {
            debug!(%key, "key does not match suffix filter");
            return Ok(RecordOutcome::Skipped(SkipReason::SuffixFiltered));
        }

        info!("Processing file {}/{}", bucket, key);

        let tags = self.store.get_tags(bucket, &key).await?;
        if let Some(existing) = tags.processor_version() {
            match compare_versions(existing, PROCESSOR_VERSION) {
                VersionCheck::Compatible => {
                    info!(
                        "{} has already been processed with compatible version {} (current: {}). Skipping.",
                        key, existing, PROCESSOR_VERSION
                    );
                    return Ok(RecordOutcome::AlreadyProcessed {
                        version: existing.to_string(),
                    });
                }
                VersionCheck::Incompatible => {
                    info!(
                        "{} was processed by version {} (current: {}). Reprocessing.",
                        key, existing, PROCESSOR_VERSION
                    );
                }
                VersionCheck::Unparseable => {
                    warn!(
                        "{} carries an unreadable processor version {:?}. Reprocessing.",
                        key, existing
                    );
                }
            }
        }

        let object = self.store.get_object(bucket, &key).await?;
        let Some(kind) = DocumentKind::detect(&object.body, &key) else {
            warn!(
                "Skipping unsupported file: {} {}",
                key,
                cleanse::leading_bytes(&object.body)
            );
            return Ok(RecordOutcome::Skipped(SkipReason::UnknownType));
        };

        let (tags, dropped_tags) = tags.with_processor_version();
        if !dropped_tags.is_empty() {
            warn!(
                ?dropped_tags,
                "{} already carries the maximum number of tags; dropping some to record the processor version",
                key
            );
        }

        let body = object.body.clone();
        let cleaned =
            tokio::task::spawn_blocking(move || cleanse::cleanse_verified(kind, &body)).await??;

        self.store
            .put_object(PutObject {
                bucket: bucket.to_string(),
                key: key.clone(),
                body: Bytes::from(cleaned),
                content_type: kind.stored_content_type().to_string(),
                tags,
            })
            .await?;

        info!("Successfully processed and rewrote {} {}/{}", kind, bucket, key);
        Ok(RecordOutcome::Cleaned { kind })
    }

    /// Forward a rejected message. `Ok(false)` means no dead-letter queue is
    /// configured.
    pub async fn dead_letter(&self, message: &SqsMessage, reason: &str) -> Result<bool, QueueError> {
        match &self.dead_letters {
            Some(queue) => queue.dead_letter(message, reason).await,
            None => Ok(false),
        }
    }

    /// Run every record of one queue message.
    ///
    /// Records after a permanent failure still run. A transient or
    /// configuration failure stops the message so it is redelivered whole.
    pub async fn process_message(&self, message: &SqsMessage) -> MessageOutcome {
        let span = info_span!(
            "message",
            message_id = %message.message_id,
            event_source_arn = message.event_source_arn.as_deref().unwrap_or("-"),
        );
        async {
            if let Some(count) = message.receive_count() {
                if self.config.policy.is_final_attempt(count) {
                    warn!(
                        receive_count = count,
                        max_receive_count = self.config.policy.max_receive_count,
                        "final delivery attempt; another failure sends this message to the dead-letter queue"
                    );
                }
            }

            let event = match message.s3_event() {
                Ok(event) => event,
                Err(err) => {
                    error!(error = %err, "discarding malformed message");
                    return MessageOutcome::Rejected {
                        reason: err.to_string(),
                    };
                }
            };

            if event.records.is_empty() {
                info!(
                    event = event.event.as_deref().unwrap_or("none"),
                    "message carries no records"
                );
                return MessageOutcome::Completed {
                    records: Vec::new(),
                };
            }

            let mut records = Vec::with_capacity(event.records.len());
            let mut rejection = None;
            for record in &event.records {
                match self.process_record(record).await {
                    Ok(outcome) => records.push(outcome),
                    Err(err) => match err.class() {
                        ErrorClass::Permanent => {
                            let object = record.object_path();
                            error!(%object, error = %err, "permanent failure, object left untouched");
                            rejection.get_or_insert_with(|| format!("{object}: {err}"));
                        }
                        ErrorClass::Transient => {
                            warn!(error = %err, "transient failure, message will be retried");
                            return MessageOutcome::Failed {
                                error: err.to_string(),
                                class: ErrorClass::Transient,
                            };
                        }
                        ErrorClass::Configuration => {
                            error!(
                                error = %err,
                                "operator action required; message kept for redrive"
                            );
                            return MessageOutcome::Failed {
                                error: err.to_string(),
                                class: ErrorClass::Configuration,
                            };
                        }
                    },
                }
            }

            match rejection {
                Some(reason) => MessageOutcome::Rejected { reason },
                None => MessageOutcome::Completed { records },
            }
        }
        .instrument(span)
        .await
    }

    /// Process a queue batch and report the messages that should be retried.
    ///
    /// Rejected messages are forwarded to the dead-letter queue and count as
    /// settled. If forwarding fails the message is reported instead, so the
    /// queue redelivers it and its redrive policy takes over.
    pub async fn handle_batch(&self, event: &SqsEvent) -> BatchResponse {
        let mut response = BatchResponse::default();
        for message in &event.records {
            match self.process_message(message).await {
                MessageOutcome::Completed { .. } => {}
                MessageOutcome::Failed { .. } => response.fail(&message.message_id),
                MessageOutcome::Rejected { reason } => match self.dead_letter(message, &reason).await {
                    Ok(true) => {
                        info!(message_id = %message.message_id, %reason, "message moved to dead-letter queue");
                    }
                    Ok(false) => {
                        error!(
                            message_id = %message.message_id,
                            %reason,
                            "no dead-letter queue configured, rejected message dropped"
                        );
                    }
                    Err(err) => {
                        error!(
                            message_id = %message.message_id,
                            error = %err,
                            "could not dead-letter message, reporting it for redelivery"
                        );
                        response.fail(&message.message_id);
                    }
                },
            }
        }

        info!(
            messages = event.records.len(),
            failed = response.batch_item_failures.len(),
            "batch handled"
        );
        response
    }
}
