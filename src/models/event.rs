//! Wire shapes for the delivery path: storage write → topic → queue → handler.
//!
//! A queue batch (`SqsEvent`) carries messages whose body is either an SNS
//! notification envelope wrapping an S3 event, or (with raw message delivery)
//! the S3 event itself. The handler answers with a `BatchResponse` naming the
//! messages that should be retried.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use thiserror::Error;

const RECEIVE_COUNT_ATTRIBUTE: &str = "ApproximateReceiveCount";

#[derive(Debug, Error)]
pub enum EventError {
    #[error("message body is not valid JSON: {0}")]
    MalformedBody(#[source] serde_json::Error),
    #[error("message does not contain an S3 event: {0}")]
    MalformedNotification(#[source] serde_json::Error),
    #[error("object key `{0}` is not valid URL-encoded UTF-8")]
    InvalidKey(String),
}

/// A batch of queue messages, as delivered to the handler.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct SqsEvent {
    #[serde(rename = "Records", default)]
    pub records: Vec<SqsMessage>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SqsMessage {
    pub message_id: String,
    #[serde(default)]
    pub receipt_handle: Option<String>,
    pub body: String,
    #[serde(default)]
    pub attributes: HashMap<String, String>,
    #[serde(rename = "eventSourceARN", default)]
    pub event_source_arn: Option<String>,
}

impl SqsMessage {
    /// How many times the queue has handed out this message, this delivery included.
    pub fn receive_count(&self) -> Option<u32> {
        self.attributes
            .get(RECEIVE_COUNT_ATTRIBUTE)
            .and_then(|count| count.parse().ok())
    }

    /// Unwrap the S3 event carried by this message.
    ///
    /// Accepts both an SNS notification envelope (whose `Message` field is the
    /// S3 event serialised as a string) and a bare S3 event.
    pub fn s3_event(&self) -> Result<S3Event, EventError> {
        let body: Value = serde_json::from_str(&self.body).map_err(EventError::MalformedBody)?;

        if let Some(Value::String(inner)) = body.get("Message") {
            return serde_json::from_str(inner).map_err(EventError::MalformedNotification);
        }

        serde_json::from_value(body).map_err(EventError::MalformedNotification)
    }
}

/// The notification payload S3 publishes on object writes.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct S3Event {
    #[serde(rename = "Records", default)]
    pub records: Vec<S3EventRecord>,

    /// Set to `s3:TestEvent` on the test notification S3 sends when notifications are configured.
    #[serde(rename = "Event", default, skip_serializing_if = "Option::is_none")]
    pub event: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct S3EventRecord {
    #[serde(default)]
    pub event_name: Option<String>,
    pub s3: S3Entity,
}

impl S3EventRecord {
    /// True for `ObjectCreated:*` events, and for records that carry no event name.
    pub fn is_object_created(&self) -> bool {
        self.event_name
            .as_deref()
            .is_none_or(|name| name.starts_with("ObjectCreated:"))
    }

    pub fn bucket_name(&self) -> &str {
        &self.s3.bucket.name
    }

    /// The object key with S3's form encoding undone (`+` is a space).
    pub fn object_key(&self) -> Result<String, EventError> {
        let raw = &self.s3.object.key;
        let spaced = raw.replace('+', " ");
        urlencoding::decode(&spaced)
            .map(|key| key.into_owned())
            .map_err(|_| EventError::InvalidKey(raw.clone()))
    }

    /// `bucket/key` for logs and failure reasons; falls back to the raw key
    /// when it cannot be decoded.
    pub fn object_path(&self) -> String {
        let key = self
            .object_key()
            .unwrap_or_else(|_| self.s3.object.key.clone());
        format!("{}/{}", self.bucket_name(), key)
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct S3Entity {
    pub bucket: S3Bucket,
    pub object: S3ObjectRef,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct S3Bucket {
    pub name: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct S3ObjectRef {
    pub key: String,
    #[serde(default)]
    pub size: Option<u64>,
}

/// Partial-batch failure report: only the listed messages are retried.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchResponse {
    pub batch_item_failures: Vec<BatchItemFailure>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchItemFailure {
    pub item_identifier: String,
}

impl BatchResponse {
    /// Record a failed message once, keeping first-seen order.
    pub fn fail(&mut self, message_id: &str) {
        if !self
            .batch_item_failures
            .iter()
            .any(|failure| failure.item_identifier == message_id)
        {
            self.batch_item_failures.push(BatchItemFailure {
                item_identifier: message_id.to_string(),
            });
        }
    }

    pub fn failed_ids(&self) -> Vec<&str> {
        self.batch_item_failures
            .iter()
            .map(|failure| failure.item_identifier.as_str())
            .collect()
    }
}
