//! Health & readiness handlers.
//!
//! - GET /healthz  -> simple liveness ("ok")
//! - GET /readyz   -> readiness of the configured object store backend

use crate::handlers::AppState;
use crate::services::storage_service::ReadinessCheck;
use axum::{Json, extract::State, http::StatusCode, response::IntoResponse};
use serde::Serialize;
use std::collections::HashMap;

/// `GET /healthz`
///
/// Liveness check, never performs I/O.
pub async fn healthz() -> impl IntoResponse {
    (
        StatusCode::OK,
        Json(HealthResponse {
            status: "ok".into(),
        }),
    )
}

/// `GET /readyz`
///
/// Asks the object store to check its dependencies (SQLite and disk for the
/// local backend, the configured bucket for S3). HTTP 200 when all checks
/// pass, 503 when any fails.
pub async fn readyz(State(state): State<AppState>) -> impl IntoResponse {
    let checks = state.processor.store().ready().await;
    let overall_ok = checks.iter().all(|check| check.ok);

    let body = ReadyResponse {
        status: if overall_ok {
            "ok".into()
        } else {
            "error".into()
        },
        checks: checks
            .into_iter()
            .map(|check| (check.name, check))
            .collect(),
    };

    let status = if overall_ok {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(body))
}

#[derive(Serialize)]
struct HealthResponse {
    status: String,
}

#[derive(Serialize)]
struct ReadyResponse {
    status: String,
    checks: HashMap<&'static str, ReadinessCheck>,
}
