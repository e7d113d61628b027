//! Invocation endpoints.
//!
//! `POST /events` accepts the queue batch a managed event source would
//! deliver and answers with the partial-failure report. `POST /cleanse`
//! cleanses a single document passed inline, API-gateway proxy style.

use crate::{
    errors::AppError,
    handlers::AppState,
    models::event::{BatchResponse, SqsEvent},
    services::cleanse::{self, DocumentKind},
};
use axum::{Json, extract::State};
use base64::{Engine as _, engine::general_purpose};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use tracing::{info, warn};

const DEFAULT_FILENAME: &str = "document.docx";

/// `POST /events`
pub async fn invoke_batch(
    State(state): State<AppState>,
    Json(event): Json<SqsEvent>,
) -> Json<BatchResponse> {
    Json(state.processor.handle_batch(&event).await)
}

/// Direct-invoke request: a base64 document and its filename header.
#[derive(Debug, Deserialize)]
pub struct CleanseRequest {
    pub body: String,
    #[serde(default)]
    pub headers: HashMap<String, String>,
}

impl CleanseRequest {
    fn filename(&self) -> &str {
        self.headers
            .iter()
            .find(|(name, _)| name.eq_ignore_ascii_case("filename"))
            .map(|(_, value)| value.as_str())
            .unwrap_or(DEFAULT_FILENAME)
    }
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProxyResponse {
    pub status_code: u16,
    pub is_base64_encoded: bool,
    pub headers: BTreeMap<String, String>,
    pub body: String,
}

/// `POST /cleanse`
///
/// The type is detected from the content, with the filename only consulted
/// for damaged DOCX packages. Unsupported input is 400, corrupt input 422.
pub async fn cleanse_document(
    Json(request): Json<CleanseRequest>,
) -> Result<Json<ProxyResponse>, AppError> {
    let filename = request.filename().to_string();
    let document = general_purpose::STANDARD
        .decode(request.body.as_bytes())
        .map_err(|err| AppError::bad_request(format!("body is not valid base64: {err}")))?;

    let Some(kind) = DocumentKind::detect(&document, &filename) else {
        warn!("Unsupported file type: {}", filename);
        return Err(AppError::bad_request(
            "Unsupported file type. Only DOCX, PDF, PNG and JPEG are supported.",
        ));
    };

    let cleaned = tokio::task::spawn_blocking(move || cleanse::cleanse_verified(kind, &document))
        .await
        .map_err(|err| AppError::internal(format!("cleansing task failed: {err}")))??;

    info!("Successfully processed {}", filename);

    let disposition = format!(
        "attachment; filename=\"{}\"",
        filename.replace(['"', '\r', '\n'], "")
    );
    let headers = BTreeMap::from([
        ("Content-Type".to_string(), kind.mime_type().to_string()),
        ("Content-Disposition".to_string(), disposition),
    ]);

    Ok(Json(ProxyResponse {
        status_code: 200,
        is_base64_encoded: true,
        headers,
        body: general_purpose::STANDARD.encode(cleaned),
    }))
}
