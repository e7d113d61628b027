//! Core data models for the document cleanser.
//!
//! `event` holds the wire shapes delivered by the queue (SQS batch, SNS
//! envelope, S3 notification) and the partial-batch response. `object` and
//! `bucket` describe what the object store hands back and what the local
//! backend persists in SQLite.

pub mod bucket;
pub mod event;
pub mod object;
