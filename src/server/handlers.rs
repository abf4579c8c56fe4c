use axum::{extract::rejection::JsonRejection, extract::State, Json};
use serde::{Deserialize, Serialize};
use tracing::info;

use super::error::ApiError;
use crate::correlator::Recognition;
use crate::orchestrator::{RecognitionService, ServiceStatus};

#[derive(Debug, Deserialize)]
pub struct RecognizeRequest {
    #[serde(rename = "filePath")]
    pub file_path: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    #[serde(flatten)]
    pub service: ServiceStatus,
}

/// `POST /recognize`
pub async fn recognize(
    State(service): State<RecognitionService>,
    body: Result<Json<RecognizeRequest>, JsonRejection>,
) -> Result<Json<Recognition>, ApiError> {
    let Json(request) = body?;
    let file_path = request
        .file_path
        .filter(|path| !path.is_empty())
        .ok_or_else(ApiError::missing_payload)?;

    info!("Sending path to whisper service: {}", file_path);
    let recognition = service.recognize(file_path).await?;
    Ok(Json(recognition))
}

/// `GET /health`
pub async fn health(
    State(service): State<RecognitionService>,
) -> Result<Json<HealthResponse>, ApiError> {
    let service = service.status().await?;
    let status = if service.worker.worker.is_some() {
        "ok"
    } else {
        "degraded"
    };
    Ok(Json(HealthResponse { status, service }))
}
