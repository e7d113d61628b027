//! HTTP handlers and the state they share.

use crate::services::processor::Processor;
use std::sync::Arc;

pub mod event_handlers;
pub mod health_handlers;

/// Shared across every request; cloning is cheap.
#[derive(Clone)]
pub struct AppState {
    pub processor: Arc<Processor>,
}

impl AppState {
    pub fn new(processor: Arc<Processor>) -> Self {
        Self { processor }
    }
}
