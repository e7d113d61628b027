//! Shared fixtures for the integration tests: sample documents carrying
//! author metadata, a scratch local store, and stand-in stores and queues.

#![allow(dead_code)]

use async_trait::async_trait;
use bytes::Bytes;
use document_cleanser::{
    models::{
        event::SqsMessage,
        object::{ObjectTags, StoredObject},
    },
    services::{
        poller::{DeadLetterQueue, MessageQueue, QueueError},
        storage_service::{
            LocalStore, ObjectStore, PutObject, ReadinessCheck, StoreError, StoreResult,
        },
    },
};
use lopdf::{Document, Object, Stream, dictionary};
use serde_json::{Value, json};
use std::{
    collections::VecDeque,
    io::{Cursor, Write},
    sync::{
        Arc, Mutex,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};
use tempfile::TempDir;
use zip::{CompressionMethod, ZipWriter, write::SimpleFileOptions};

pub const BUCKET: &str = "uploads";
pub const AUTHOR: &[u8] = b"Alice Author";

pub fn contains(haystack: &[u8], needle: &[u8]) -> bool {
    haystack.windows(needle.len()).any(|w| w == needle)
}

// ---------------------------------------------------------------------------
// Documents
// ---------------------------------------------------------------------------

const CONTENT_TYPES: &str = r#"<?xml version="1.0" encoding="UTF-8" standalone="yes"?>
<Types xmlns="http://schemas.openxmlformats.org/package/2006/content-types"><Default Extension="xml" ContentType="application/xml"/><Default Extension="png" ContentType="image/png"/></Types>"#;

const DOCUMENT: &str = r#"<?xml version="1.0" encoding="UTF-8" standalone="yes"?>
<w:document xmlns:w="http://schemas.openxmlformats.org/wordprocessingml/2006/main"><w:body><w:p><w:r><w:t>Quarterly figures</w:t></w:r></w:p><w:p><w:ins w:id="1" w:author="Alice Author" w:date="2024-01-02T03:04:05Z"><w:r><w:t>Revenue is up.</w:t></w:r></w:ins></w:p></w:body></w:document>"#;

const COMMENTS: &str = r#"<?xml version="1.0" encoding="UTF-8" standalone="yes"?>
<w:comments xmlns:w="http://schemas.openxmlformats.org/wordprocessingml/2006/main"><w:comment w:id="0" w:author="Alice Author" w:initials="AA"><w:p><w:r><w:t>Check the totals</w:t></w:r></w:p></w:comment></w:comments>"#;

const PEOPLE: &str = r#"<?xml version="1.0" encoding="UTF-8" standalone="yes"?>
<w15:people xmlns:w15="http://schemas.microsoft.com/office/word/2012/wordml"><w15:person w15:author="Alice Author"><w15:presenceInfo w15:providerId="None" w15:userId="Alice Author"/></w15:person></w15:people>"#;

const CORE: &str = r#"<?xml version="1.0" encoding="UTF-8" standalone="yes"?>
<cp:coreProperties xmlns:cp="http://schemas.openxmlformats.org/package/2006/metadata/core-properties" xmlns:dc="http://purl.org/dc/elements/1.1/"><dc:title>Budget</dc:title><dc:creator>Alice Author</dc:creator><cp:lastModifiedBy>Alice Author</cp:lastModifiedBy></cp:coreProperties>"#;

const APP: &str = r#"<?xml version="1.0" encoding="UTF-8" standalone="yes"?>
<Properties xmlns="http://schemas.openxmlformats.org/officeDocument/2006/extended-properties"><Company>Alice Author Ltd</Company><Pages>1</Pages></Properties>"#;

pub const MEDIA_PART: &str = "word/media/image1.png";

/// A small word package with author metadata in every usual place and one
/// stored (uncompressed) binary part.
pub fn docx_with_metadata() -> Vec<u8> {
    let mut writer = ZipWriter::new(Cursor::new(Vec::new()));
    let deflated = SimpleFileOptions::default().compression_method(CompressionMethod::Deflated);
    let stored = SimpleFileOptions::default().compression_method(CompressionMethod::Stored);

    for (name, body) in [
        ("[Content_Types].xml", CONTENT_TYPES),
        ("word/document.xml", DOCUMENT),
        ("word/comments.xml", COMMENTS),
        ("word/people.xml", PEOPLE),
        ("docProps/core.xml", CORE),
        ("docProps/app.xml", APP),
    ] {
        writer.start_file(name, deflated).unwrap();
        writer.write_all(body.as_bytes()).unwrap();
    }

    writer.start_file(MEDIA_PART, stored).unwrap();
    writer.write_all(&plain_png()).unwrap();

    writer.finish().unwrap().into_inner()
}

pub fn pdf_with_metadata() -> Vec<u8> {
    let mut doc = Document::with_version("1.5");
    let pages_id = doc.new_object_id();
    let content_id = doc.add_object(Stream::new(
        dictionary! {},
        b"BT /F1 24 Tf 72 720 Td (Quarterly figures) Tj ET".to_vec(),
    ));
    let note_id = doc.add_object(dictionary! {
        "Type" => "Annot",
        "Subtype" => "Text",
        "Rect" => vec![10.into(), 10.into(), 20.into(), 20.into()],
        "T" => Object::string_literal("Alice Author"),
    });
    let page_id = doc.add_object(dictionary! {
        "Type" => "Page",
        "Parent" => pages_id,
        "Contents" => content_id,
        "Annots" => vec![note_id.into()],
    });
    doc.objects.insert(
        pages_id,
        Object::Dictionary(dictionary! {
            "Type" => "Pages",
            "Kids" => vec![page_id.into()],
            "Count" => 1,
            "MediaBox" => vec![0.into(), 0.into(), 595.into(), 842.into()],
        }),
    );
    let catalog_id = doc.add_object(dictionary! {
        "Type" => "Catalog",
        "Pages" => pages_id,
    });
    let info_id = doc.add_object(dictionary! {
        "Author" => Object::string_literal("Alice Author"),
        "Creator" => Object::string_literal("Alice Author"),
        "Title" => Object::string_literal("Budget"),
    });
    doc.trailer.set("Root", catalog_id);
    doc.trailer.set("Info", info_id);

    let mut out = Vec::new();
    doc.save_to(&mut out).unwrap();
    out
}

fn crc32(data: &[u8]) -> u32 {
    let mut crc = 0xFFFF_FFFFu32;
    for &byte in data {
        crc ^= u32::from(byte);
        for _ in 0..8 {
            let mask = (crc & 1).wrapping_neg();
            crc = (crc >> 1) ^ (0xEDB8_8320 & mask);
        }
    }
    !crc
}

fn png_chunk(kind: &[u8; 4], data: &[u8]) -> Vec<u8> {
    let mut out = (data.len() as u32).to_be_bytes().to_vec();
    out.extend_from_slice(kind);
    out.extend_from_slice(data);
    let mut crc_input = kind.to_vec();
    crc_input.extend_from_slice(data);
    out.extend_from_slice(&crc32(&crc_input).to_be_bytes());
    out
}

fn encode(format: image::ImageFormat, size: u32) -> Vec<u8> {
    let img = image::RgbImage::from_fn(size, size, |x, y| {
        image::Rgb([(x * 16) as u8, (y * 16) as u8, 128])
    });
    let mut encoded = Cursor::new(Vec::new());
    img.write_to(&mut encoded, format).unwrap();
    encoded.into_inner()
}

pub fn plain_png() -> Vec<u8> {
    encode(image::ImageFormat::Png, 8)
}

/// PNG with a `tEXt` author chunk right after IHDR.
pub fn png_with_metadata() -> Vec<u8> {
    let encoded = encode(image::ImageFormat::Png, 8);
    // Signature (8) + IHDR chunk (25).
    let (head, tail) = encoded.split_at(33);
    let mut out = head.to_vec();
    out.extend(png_chunk(b"tEXt", b"Author\0Alice Author"));
    out.extend_from_slice(tail);
    out
}

fn jpeg_segment(marker: u8, payload: &[u8]) -> Vec<u8> {
    let mut out = vec![0xFF, marker];
    out.extend_from_slice(&((payload.len() + 2) as u16).to_be_bytes());
    out.extend_from_slice(payload);
    out
}

/// JPEG with an EXIF segment and a comment right after SOI.
pub fn jpeg_with_metadata() -> Vec<u8> {
    let encoded = encode(image::ImageFormat::Jpeg, 16);
    let mut out = encoded[..2].to_vec();
    out.extend(jpeg_segment(0xE1, b"Exif\0\0MM\0*\0\0\0\x08\0\0Alice Author"));
    out.extend(jpeg_segment(0xFE, b"shot by Alice Author"));
    out.extend_from_slice(&encoded[2..]);
    out
}

// ---------------------------------------------------------------------------
// Stores
// ---------------------------------------------------------------------------

/// A migrated in-memory local store with [`BUCKET`] created.
pub async fn local_store() -> (TempDir, Arc<LocalStore>) {
    let dir = tempfile::tempdir().unwrap();
    let store = LocalStore::open_in_memory(dir.path().join("objects"))
        .await
        .unwrap();
    store.ensure_bucket(BUCKET).await.unwrap();
    (dir, Arc::new(store))
}

pub async fn seed(store: &LocalStore, key: &str, body: Vec<u8>, tags: &[(&str, &str)]) {
    store
        .put_object(PutObject {
            bucket: BUCKET.to_string(),
            key: key.to_string(),
            body: Bytes::from(body),
            content_type: "application/octet-stream".to_string(),
            tags: tags
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        })
        .await
        .unwrap();
}

#[derive(Debug, Clone, Copy)]
pub enum Failure {
    Throttled,
    AccessDenied,
}

/// Fails every call the same way.
pub struct FailingStore {
    pub failure: Failure,
}

impl FailingStore {
    fn error(&self, operation: &'static str) -> StoreError {
        match self.failure {
            Failure::Throttled => StoreError::Unavailable {
                operation,
                message: "SlowDown: please reduce your request rate".into(),
            },
            Failure::AccessDenied => StoreError::PermissionDenied {
                operation,
                message: "AccessDenied".into(),
            },
        }
    }
}

#[async_trait]
impl ObjectStore for FailingStore {
    async fn get_tags(&self, _bucket: &str, _key: &str) -> StoreResult<ObjectTags> {
        Err(self.error("GetObjectTagging"))
    }

    async fn get_object(&self, _bucket: &str, _key: &str) -> StoreResult<StoredObject> {
        Err(self.error("GetObject"))
    }

    async fn put_object(&self, _object: PutObject) -> StoreResult<()> {
        Err(self.error("PutObject"))
    }

    async fn ready(&self) -> Vec<ReadinessCheck> {
        vec![ReadinessCheck::from_result(
            "failing",
            Err("always fails".to_string()),
        )]
    }
}

/// Serves an unsupported payload for every key after a delay, recording how
/// many reads were in flight at once.
#[derive(Default)]
pub struct SlowStore {
    pub delay: Duration,
    in_flight: AtomicUsize,
    pub max_in_flight: AtomicUsize,
}

impl SlowStore {
    pub fn new(delay: Duration) -> Self {
        Self {
            delay,
            ..Self::default()
        }
    }
}

#[async_trait]
impl ObjectStore for SlowStore {
    async fn get_tags(&self, _bucket: &str, _key: &str) -> StoreResult<ObjectTags> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(self.delay).await;
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        Ok(ObjectTags::new())
    }

    async fn get_object(&self, bucket: &str, key: &str) -> StoreResult<StoredObject> {
        Ok(StoredObject {
            bucket: bucket.to_string(),
            key: key.to_string(),
            body: Bytes::from_static(b"plain text, not a document"),
            content_type: None,
            etag: None,
            last_modified: None,
        })
    }

    async fn put_object(&self, _object: PutObject) -> StoreResult<()> {
        Ok(())
    }

    async fn ready(&self) -> Vec<ReadinessCheck> {
        Vec::new()
    }
}

// ---------------------------------------------------------------------------
// Queue
// ---------------------------------------------------------------------------

/// In-memory queue recording how each message was settled.
#[derive(Default)]
pub struct FakeQueue {
    pub pending: Mutex<VecDeque<SqsMessage>>,
    pub deleted: Mutex<Vec<String>>,
    pub dead_lettered: Mutex<Vec<(String, String)>>,
    pub has_dead_letter_queue: bool,
    pub fail_deletes: bool,
    pub fail_dead_letters: bool,
}

impl FakeQueue {
    pub fn with_messages(messages: Vec<SqsMessage>) -> Self {
        Self {
            pending: Mutex::new(messages.into()),
            has_dead_letter_queue: true,
            ..Self::default()
        }
    }

    pub fn deleted(&self) -> Vec<String> {
        let mut ids = self.deleted.lock().unwrap().clone();
        ids.sort();
        ids
    }

    pub fn dead_lettered(&self) -> Vec<(String, String)> {
        self.dead_lettered.lock().unwrap().clone()
    }
}

#[async_trait]
impl MessageQueue for FakeQueue {
    async fn receive(
        &self,
        max_messages: u32,
        wait: Duration,
        _visibility: Duration,
    ) -> Result<Vec<SqsMessage>, QueueError> {
        let received: Vec<SqsMessage> = {
            let mut pending = self.pending.lock().unwrap();
            let take = (max_messages as usize).min(pending.len());
            pending.drain(..take).collect()
        };
        if received.is_empty() {
            // Long poll with nothing to hand out.
            tokio::time::sleep(wait).await;
        }
        Ok(received)
    }

    async fn delete(&self, message: &SqsMessage) -> Result<(), QueueError> {
        if self.fail_deletes {
            return Err(QueueError::Sqs {
                operation: "DeleteMessage",
                message: "ReceiptHandleIsInvalid".into(),
            });
        }
        self.deleted
            .lock()
            .unwrap()
            .push(message.message_id.clone());
        Ok(())
    }
}

#[async_trait]
impl DeadLetterQueue for FakeQueue {
    async fn dead_letter(&self, message: &SqsMessage, reason: &str) -> Result<bool, QueueError> {
        if !self.has_dead_letter_queue {
            return Ok(false);
        }
        if self.fail_dead_letters {
            return Err(QueueError::Sqs {
                operation: "SendMessage",
                message: "AWS.SimpleQueueService.NonExistentQueue".into(),
            });
        }
        self.dead_lettered
            .lock()
            .unwrap()
            .push((message.message_id.clone(), reason.to_string()));
        Ok(true)
    }
}

// ---------------------------------------------------------------------------
// Events
// ---------------------------------------------------------------------------

/// One S3 notification record, with the key exactly as S3 would encode it.
pub fn s3_record(bucket: &str, encoded_key: &str) -> Value {
    json!({
        "eventVersion": "2.1",
        "eventSource": "aws:s3",
        "eventName": "ObjectCreated:Put",
        "s3": {
            "bucket": { "name": bucket, "arn": format!("arn:aws:s3:::{bucket}") },
            "object": { "key": encoded_key, "size": 1024 }
        }
    })
}

pub fn message_with_body(id: &str, body: String) -> SqsMessage {
    SqsMessage {
        message_id: id.to_string(),
        receipt_handle: Some(format!("receipt-{id}")),
        body,
        attributes: [("ApproximateReceiveCount".to_string(), "1".to_string())].into(),
        event_source_arn: Some("arn:aws:sqs:eu-west-2:123456789012:uploads".to_string()),
    }
}

/// A message as delivered through an SNS subscription (envelope + string payload).
pub fn sns_message(id: &str, records: Vec<Value>) -> SqsMessage {
    let envelope = json!({
        "Type": "Notification",
        "MessageId": format!("sns-{id}"),
        "TopicArn": "arn:aws:sns:eu-west-2:123456789012:uploads",
        "Message": json!({ "Records": records }).to_string(),
    });
    message_with_body(id, envelope.to_string())
}

/// A message delivered with raw message delivery (the S3 event is the body).
pub fn raw_message(id: &str, records: Vec<Value>) -> SqsMessage {
    message_with_body(id, json!({ "Records": records }).to_string())
}
