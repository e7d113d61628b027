//! `ObjectStore` over Amazon S3 (or any S3-compatible endpoint).
//!
//! Writes go back to the same key with SSE-KMS when a key id is configured.
//! SDK failures are sorted into the store's error kinds so the processor can
//! tell a throttled request from a missing grant.

use crate::models::object::{ObjectTags, StoredObject};
use crate::services::storage_service::{
    ObjectStore, PutObject, ReadinessCheck, StoreError, StoreResult,
};
use async_trait::async_trait;
use aws_config::{BehaviorVersion, Region, SdkConfig};
use aws_sdk_s3::{
    Client,
    error::{DisplayErrorContext, ProvideErrorMetadata, SdkError},
    primitives::ByteStream,
    types::ServerSideEncryption,
};
use chrono::DateTime;
use tracing::debug;

/// Shared AWS configuration for the S3 and SQS clients.
///
/// `endpoint_url` points both clients at a local stand-in (LocalStack, MinIO).
pub async fn load_sdk_config(region: Option<&str>, endpoint_url: Option<&str>) -> SdkConfig {
    let mut loader = aws_config::defaults(BehaviorVersion::latest());
    if let Some(region) = region {
        loader = loader.region(Region::new(region.to_owned()));
    }
    if let Some(endpoint) = endpoint_url {
        loader = loader.endpoint_url(endpoint);
    }
    loader.load().await
}

#[derive(Clone)]
pub struct S3Store {
    client: Client,
    kms_key_id: Option<String>,
    bucket: Option<String>,
}

impl S3Store {
    /// `bucket` is only used by the readiness check; records name their own bucket.
    pub fn new(sdk_config: &SdkConfig, kms_key_id: Option<String>, bucket: Option<String>) -> Self {
        // Custom endpoints rarely resolve virtual-hosted bucket names.
        let path_style = sdk_config.endpoint_url().is_some();
        let config = aws_sdk_s3::config::Builder::from(sdk_config)
            .force_path_style(path_style)
            .build();
        Self {
            client: Client::from_conf(config),
            kms_key_id,
            bucket,
        }
    }
}

/// Sort an SDK failure into a store error.
fn classify<E, R>(operation: &'static str, bucket: &str, key: &str, err: SdkError<E, R>) -> StoreError
where
    E: ProvideErrorMetadata + std::error::Error + Send + Sync + 'static,
    R: std::fmt::Debug,
{
    let message = DisplayErrorContext(&err).to_string();
    match err.code() {
        Some("NoSuchKey" | "NotFound") => StoreError::NotFound {
            bucket: bucket.to_string(),
            key: key.to_string(),
        },
        Some("NoSuchBucket") => StoreError::BucketNotFound(bucket.to_string()),
        Some(
            "AccessDenied"
            | "AllAccessDisabled"
            | "InvalidAccessKeyId"
            | "SignatureDoesNotMatch"
            | "KMS.AccessDeniedException"
            | "KMS.DisabledException"
            | "KMS.NotFoundException",
        ) => StoreError::PermissionDenied { operation, message },
        Some(
            "InvalidTag"
            | "InvalidArgument"
            | "InvalidRequest"
            | "MalformedXML"
            | "EntityTooLarge"
            | "KeyTooLongError"
            | "MetadataTooLarge"
            | "InvalidObjectState",
        ) => StoreError::Rejected { operation, message },
        _ => StoreError::Unavailable { operation, message },
    }
}

#[async_trait]
impl ObjectStore for S3Store {
    async fn get_tags(&self, bucket: &str, key: &str) -> StoreResult<ObjectTags> {
        let output = self
            .client
            .get_object_tagging()
            .bucket(bucket)
            .key(key)
            .send()
            .await
            .map_err(|err| classify("GetObjectTagging", bucket, key, err))?;

        Ok(output
            .tag_set()
            .iter()
            .map(|tag| (tag.key().to_string(), tag.value().to_string()))
            .collect())
    }

    async fn get_object(&self, bucket: &str, key: &str) -> StoreResult<StoredObject> {
        let output = self
            .client
            .get_object()
            .bucket(bucket)
            .key(key)
            .send()
            .await
            .map_err(|err| classify("GetObject", bucket, key, err))?;

        let content_type = output.content_type().map(str::to_string);
        let etag = output.e_tag().map(str::to_string);
        let last_modified = output
            .last_modified()
            .and_then(|ts| DateTime::from_timestamp(ts.secs(), ts.subsec_nanos()));

        let body = output
            .body
            .collect()
            .await
            .map_err(|err| StoreError::Unavailable {
                operation: "GetObject",
                message: format!("reading body: {err}"),
            })?
            .into_bytes();

        Ok(StoredObject {
            bucket: bucket.to_string(),
            key: key.to_string(),
            body,
            content_type,
            etag,
            last_modified,
        })
    }

    async fn put_object(&self, object: PutObject) -> StoreResult<()> {
        let mut request = self
            .client
            .put_object()
            .bucket(&object.bucket)
            .key(&object.key)
            .content_type(&object.content_type)
            .tagging(object.tags.to_query_string())
            .body(ByteStream::from(object.body.clone()));

        if let Some(kms_key_id) = &self.kms_key_id {
            request = request
                .server_side_encryption(ServerSideEncryption::AwsKms)
                .ssekms_key_id(kms_key_id);
        }

        request
            .send()
            .await
            .map_err(|err| classify("PutObject", &object.bucket, &object.key, err))?;

        debug!(bucket = %object.bucket, key = %object.key, size = object.body.len(), "object written to s3");
        Ok(())
    }

    async fn ready(&self) -> Vec<ReadinessCheck> {
        let result = match &self.bucket {
            Some(bucket) => self
                .client
                .head_bucket()
                .bucket(bucket)
                .send()
                .await
                .map(|_| ())
                .map_err(|err| DisplayErrorContext(&err).to_string()),
            None => Ok(()),
        };
        vec![ReadinessCheck::from_result("s3", result)]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::processor::{ErrorClass, ProcessError};
    use aws_sdk_s3::{error::ErrorMetadata, operation::put_object::PutObjectError};

    fn service_error(code: &str) -> SdkError<PutObjectError, ()> {
        let meta = ErrorMetadata::builder()
            .code(code)
            .message("from the service")
            .build();
        SdkError::service_error(PutObjectError::generic(meta), ())
    }

    fn class_of(code: &str) -> ErrorClass {
        ProcessError::Store(classify("PutObject", "uploads", "a.docx", service_error(code))).class()
    }

    #[test]
    fn missing_objects_and_buckets() {
        assert!(matches!(
            classify("GetObject", "uploads", "a.docx", service_error("NoSuchKey")),
            StoreError::NotFound { bucket, key } if bucket == "uploads" && key == "a.docx"
        ));
        assert!(matches!(
            classify("GetObject", "uploads", "a.docx", service_error("NoSuchBucket")),
            StoreError::BucketNotFound(bucket) if bucket == "uploads"
        ));
        assert_eq!(class_of("NoSuchKey"), ErrorClass::Permanent);
        assert_eq!(class_of("NoSuchBucket"), ErrorClass::Configuration);
    }

    #[test]
    fn access_and_kms_failures_need_an_operator() {
        for code in ["AccessDenied", "KMS.DisabledException", "SignatureDoesNotMatch"] {
            let err = classify("PutObject", "uploads", "a.docx", service_error(code));
            assert!(matches!(err, StoreError::PermissionDenied { operation: "PutObject", .. }), "{code}");
            assert_eq!(class_of(code), ErrorClass::Configuration, "{code}");
        }
    }

    #[test]
    fn invalid_requests_are_not_retried() {
        for code in ["InvalidTag", "InvalidArgument", "EntityTooLarge", "MalformedXML"] {
            let err = classify("PutObject", "uploads", "a.docx", service_error(code));
            assert!(matches!(err, StoreError::Rejected { .. }), "{code}");
            assert_eq!(class_of(code), ErrorClass::Permanent, "{code}");
        }
    }

    #[test]
    fn throttling_and_unknown_codes_are_transient() {
        for code in ["SlowDown", "InternalError", "ServiceUnavailable", "SomethingNew"] {
            assert_eq!(class_of(code), ErrorClass::Transient, "{code}");
        }
    }
}
