use axum::extract::multipart::MultipartError;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use thiserror::Error;

use crate::backend::BackendError;

#[derive(Error, Debug)]
pub enum ServiceError {
    #[error("could not decode image: {0}")]
    Decode(String),

    #[error("model unavailable: {0}")]
    ModelUnavailable(String),

    #[error("Corrupted zip file: {0}")]
    CorruptArchive(String),

    #[error("Only .zip files are accepted")]
    InvalidArchive,

    #[error("No file uploaded in field '{0}'")]
    MissingUpload(&'static str),

    #[error("Invalid multipart upload: {0}")]
    Multipart(#[from] MultipartError),

    #[error("remote write failed: {0}")]
    RemoteWriteFailure(BackendError),

    #[error("remote read failed: {0}")]
    RemoteReadFailure(BackendError),

    #[error("No new training data found.")]
    NoTrainingData,

    #[error("No valid images found for retraining.")]
    NoValidImages,

    #[error("inference failed: {0}")]
    Inference(String),

    #[error("training failed: {0}")]
    Training(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Background task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

impl ServiceError {
    pub fn status(&self) -> StatusCode {
        match self {
            ServiceError::InvalidArchive
            | ServiceError::CorruptArchive(_)
            | ServiceError::MissingUpload(_)
            | ServiceError::NoValidImages => StatusCode::BAD_REQUEST,
            ServiceError::NoTrainingData => StatusCode::NOT_FOUND,
            ServiceError::Multipart(e) => e.status(),
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ServiceError {
    fn into_response(self) -> Response {
        let status = self.status();
        // "nothing to do" outcomes of retraining are reported as messages, not errors
        let body = match self {
            ServiceError::NoTrainingData | ServiceError::NoValidImages => {
                json!({ "message": self.to_string() })
            }
            _ => json!({ "error": self.to_string() }),
        };

        if status.is_server_error() {
            tracing::error!("request failed: {}", self);
        } else {
            tracing::debug!("request rejected ({}): {}", status, self);
        }

        (status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retrain_outcomes_map_to_client_statuses() {
        assert_eq!(ServiceError::NoTrainingData.status(), StatusCode::NOT_FOUND);
        assert_eq!(ServiceError::NoValidImages.status(), StatusCode::BAD_REQUEST);
        assert_eq!(
            ServiceError::CorruptArchive("bad header".into()).status(),
            StatusCode::BAD_REQUEST
        );
    }

    #[test]
    fn pipeline_failures_are_internal() {
        assert_eq!(
            ServiceError::Decode("truncated".into()).status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
        assert_eq!(
            ServiceError::RemoteWriteFailure(BackendError::Api {
                status: 503,
                message: "unavailable".into()
            })
            .status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }
}
