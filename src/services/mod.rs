//! Business logic: document cleansing, the object store backends, queue
//! delivery policy and the record/batch processor that ties them together.

pub mod cleanse;
pub mod delivery;
pub mod poller;
pub mod processor;
pub mod s3_store;
pub mod storage_service;
