//! Delivery and retry policy for the upload queue.
//!
//! The queue, its dead-letter queue and the event-source mapping are owned by
//! the managed service; this type only holds the numbers they are configured
//! with, checks that they are consistent, and renders them as the attribute
//! documents infrastructure tooling applies.

use serde::Serialize;
use serde_json::{Value, json};
use std::time::Duration;
use thiserror::Error;

const SQS_MAX_BATCH_SIZE: u32 = 10;
const MIN_MAXIMUM_CONCURRENCY: u32 = 2;
const MAX_MAXIMUM_CONCURRENCY: u32 = 1000;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PolicyError {
    #[error(
        "visibility timeout ({visibility}s) must be longer than the function timeout ({function}s)"
    )]
    VisibilityTooShort { visibility: u64, function: u64 },
    #[error("max receive count must be at least 1")]
    NoAttempts,
    #[error("max concurrency must be between 2 and 1000, got {0}")]
    Concurrency(u32),
    #[error("batch size must be between 1 and 10, got {0}")]
    BatchSize(u32),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeliveryPolicy {
    /// Deliveries before the queue moves a message to the dead-letter queue.
    pub max_receive_count: u32,
    #[serde(with = "secs")]
    pub function_timeout: Duration,
    #[serde(with = "secs")]
    pub visibility_timeout: Duration,
    /// Handler invocations allowed to run at once.
    pub max_concurrency: u32,
    pub batch_size: u32,
    /// Alarm when more than this many messages are waiting.
    pub backlog_alarm_threshold: u32,
    /// Alarm when the dead-letter queue holds more than this many messages.
    pub dead_letter_alarm_threshold: u32,
    #[serde(with = "secs")]
    pub message_retention: Duration,
}

mod secs {
    use serde::Serializer;
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_secs())
    }
}

impl Default for DeliveryPolicy {
    fn default() -> Self {
        Self {
            max_receive_count: 3,
            function_timeout: Duration::from_secs(300),
            visibility_timeout: Duration::from_secs(360),
            max_concurrency: 5,
            batch_size: 10,
            backlog_alarm_threshold: 10,
            dead_letter_alarm_threshold: 0,
            message_retention: Duration::from_secs(14 * 24 * 60 * 60),
        }
    }
}

impl DeliveryPolicy {
    /// Reject combinations the queue would accept but that break delivery.
    ///
    /// A visibility timeout no longer than the function timeout lets a second
    /// consumer pick up a message that is still being processed.
    pub fn validate(&self) -> Result<(), PolicyError> {
        if self.visibility_timeout <= self.function_timeout {
            return Err(PolicyError::VisibilityTooShort {
                visibility: self.visibility_timeout.as_secs(),
                function: self.function_timeout.as_secs(),
            });
        }
        if self.max_receive_count == 0 {
            return Err(PolicyError::NoAttempts);
        }
        if !(MIN_MAXIMUM_CONCURRENCY..=MAX_MAXIMUM_CONCURRENCY).contains(&self.max_concurrency) {
            return Err(PolicyError::Concurrency(self.max_concurrency));
        }
        if !(1..=SQS_MAX_BATCH_SIZE).contains(&self.batch_size) {
            return Err(PolicyError::BatchSize(self.batch_size));
        }
        Ok(())
    }

    /// True when this delivery is the last one before dead-lettering.
    pub fn is_final_attempt(&self, receive_count: u32) -> bool {
        receive_count >= self.max_receive_count
    }

    /// The queue's `RedrivePolicy` attribute.
    pub fn redrive_policy(&self, dead_letter_arn: &str) -> Value {
        json!({
            "deadLetterTargetArn": dead_letter_arn,
            "maxReceiveCount": self.max_receive_count,
        })
    }

    /// Queue attributes, event-source mapping and alarms as one document.
    ///
    /// SQS takes attribute values as strings, including the nested redrive JSON.
    pub fn render(&self, dead_letter_arn: &str) -> Value {
        json!({
            "queue": {
                "VisibilityTimeout": self.visibility_timeout.as_secs().to_string(),
                "RedrivePolicy": self.redrive_policy(dead_letter_arn).to_string(),
            },
            "deadLetterQueue": {
                "MessageRetentionPeriod": self.message_retention.as_secs().to_string(),
            },
            "eventSourceMapping": {
                "BatchSize": self.batch_size,
                "FunctionResponseTypes": ["ReportBatchItemFailures"],
                "ScalingConfig": { "MaximumConcurrency": self.max_concurrency },
            },
            "function": {
                "Timeout": self.function_timeout.as_secs(),
            },
            "alarms": [
                {
                    "AlarmName": "document-cleanser-queue-backlog",
                    "Namespace": "AWS/SQS",
                    "MetricName": "ApproximateNumberOfMessagesVisible",
                    "Statistic": "Maximum",
                    "ComparisonOperator": "GreaterThanThreshold",
                    "Threshold": self.backlog_alarm_threshold,
                    "Period": 300,
                    "EvaluationPeriods": 1,
                },
                {
                    "AlarmName": "document-cleanser-dead-letters",
                    "Namespace": "AWS/SQS",
                    "MetricName": "ApproximateNumberOfMessagesVisible",
                    "Statistic": "Maximum",
                    "ComparisonOperator": "GreaterThanThreshold",
                    "Threshold": self.dead_letter_alarm_threshold,
                    "Period": 300,
                    "EvaluationPeriods": 1,
                    "TreatMissingData": "notBreaching",
                },
            ],
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn defaults_are_valid() {
        let policy = DeliveryPolicy::default();
        assert_eq!(policy.max_receive_count, 3);
        assert_eq!(policy.max_concurrency, 5);
        assert_eq!(policy.validate(), Ok(()));
    }

    #[test]
    fn visibility_must_exceed_function_timeout() {
        let policy = DeliveryPolicy {
            visibility_timeout: Duration::from_secs(300),
            ..DeliveryPolicy::default()
        };
        assert_eq!(
            policy.validate(),
            Err(PolicyError::VisibilityTooShort {
                visibility: 300,
                function: 300
            })
        );
    }

    #[test]
    fn rejects_out_of_range_values() {
        let zero_attempts = DeliveryPolicy {
            max_receive_count: 0,
            ..DeliveryPolicy::default()
        };
        assert_eq!(zero_attempts.validate(), Err(PolicyError::NoAttempts));

        let one_worker = DeliveryPolicy {
            max_concurrency: 1,
            ..DeliveryPolicy::default()
        };
        assert_eq!(one_worker.validate(), Err(PolicyError::Concurrency(1)));

        let huge_batch = DeliveryPolicy {
            batch_size: 11,
            ..DeliveryPolicy::default()
        };
        assert_eq!(huge_batch.validate(), Err(PolicyError::BatchSize(11)));
    }

    #[test]
    fn final_attempt_tracks_receive_count() {
        let policy = DeliveryPolicy::default();
        assert!(!policy.is_final_attempt(1));
        assert!(!policy.is_final_attempt(2));
        assert!(policy.is_final_attempt(3));
    }

    #[test]
    fn renders_queue_and_mapping() {
        let doc = DeliveryPolicy::default().render("arn:aws:sqs:eu-west-2:123:dlq");
        assert_eq!(doc["queue"]["VisibilityTimeout"], "360");
        assert_eq!(doc["deadLetterQueue"]["MessageRetentionPeriod"], "1209600");
        assert_eq!(doc["eventSourceMapping"]["ScalingConfig"]["MaximumConcurrency"], 5);
        assert_eq!(
            doc["eventSourceMapping"]["FunctionResponseTypes"][0],
            "ReportBatchItemFailures"
        );

        let redrive: Value =
            serde_json::from_str(doc["queue"]["RedrivePolicy"].as_str().unwrap()).unwrap();
        assert_eq!(
            redrive,
            json!({ "deadLetterTargetArn": "arn:aws:sqs:eu-west-2:123:dlq", "maxReceiveCount": 3 })
        );
        assert_eq!(doc["alarms"][1]["Threshold"], 0);
    }
}
