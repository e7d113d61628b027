//! Defines the HTTP surface of the cleanser.
//!
//! ## Structure
//! - `GET  /healthz`: liveness
//! - `GET  /readyz`: object store readiness
//! - `POST /events`: queue batch invoke, answers with `batchItemFailures`
//! - `POST /cleanse`: cleanse one inline (base64) document

use crate::handlers::{
    AppState,
    event_handlers::{cleanse_document, invoke_batch},
    health_handlers::{healthz, readyz},
};
use axum::{
    Router,
    extract::DefaultBodyLimit,
    routing::{get, post},
};

/// Inline documents arrive base64 encoded, a third larger than the file.
const MAX_BODY_BYTES: usize = 64 * 1024 * 1024;

/// Build the router. State (`AppState`) is attached by the caller.
pub fn routes() -> Router<AppState> {
    Router::new()
        // health endpoints (mounted at root)
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route("/events", post(invoke_batch))
        .route("/cleanse", post(cleanse_document))
        .layer(DefaultBodyLimit::max(MAX_BODY_BYTES))
}
