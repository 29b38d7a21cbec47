//! HTTP surface.
//!
//! Handlers parse the multipart body, hand the work to the pipeline modules and
//! map `ServiceError` into the JSON error bodies clients expect.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use axum::extract::{DefaultBodyLimit, Multipart, State};
use axum::middleware;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Serialize;
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tokio::sync::{broadcast, Mutex};
use tower_http::trace::TraceLayer;

use crate::backend::{ObjectStore, PredictionRecord, TableStore, PREDICTIONS_TABLE};
use crate::config::ServiceConfig;
use crate::error::ServiceError;
use crate::ingest::ingest_archive;
use crate::metrics::{track_request, MetricsAggregator};
use crate::model::{Classification, ImageClassifier};
use crate::preprocess::{preprocess, ImageSource};
use crate::retrain::{retrain, RetrainSettings};
use crate::utils::unique_upload_name;

/// Shared state for all handlers.
pub struct AppState {
    pub config: ServiceConfig,
    pub classifier: Arc<dyn ImageClassifier>,
    pub storage: Arc<dyn ObjectStore>,
    pub tables: Arc<dyn TableStore>,
    pub metrics: Arc<MetricsAggregator>,
    /// Held by ingestion and retraining; both touch `config.retrain_dir`.
    pub dataset_lock: Mutex<()>,
}

impl AppState {
    pub fn new(
        config: ServiceConfig,
        classifier: Arc<dyn ImageClassifier>,
        storage: Arc<dyn ObjectStore>,
        tables: Arc<dyn TableStore>,
    ) -> Self {
        Self {
            config,
            classifier,
            storage,
            tables,
            metrics: Arc::new(MetricsAggregator::new()),
            dataset_lock: Mutex::new(()),
        }
    }
}

pub fn build_router(state: Arc<AppState>) -> Router {
    let body_limit = state.config.body_limit_bytes();
    let metrics = state.metrics.clone();

    Router::new()
        .route("/testing_route", get(testing_route))
        .route("/predict/", post(predict_handler))
        .route("/upload-zip/", post(upload_zip_handler))
        .route("/retrain/", post(retrain_handler))
        .layer(DefaultBodyLimit::max(body_limit))
        .with_state(state)
        .layer(middleware::from_fn_with_state(metrics, track_request))
        .layer(TraceLayer::new_for_http())
}

/// Serves `state` on the configured address until `shutdown` fires.
pub async fn serve(
    state: Arc<AppState>,
    mut shutdown: broadcast::Receiver<()>,
) -> Result<(), std::io::Error> {
    let addr = state.config.bind_addr();
    let app = build_router(state);
    let listener = TcpListener::bind(&addr).await?;
    tracing::info!("Listening on http://{}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = shutdown.recv().await;
            tracing::info!("HTTP server shutting down...");
        })
        .await
}

// ============================================================================
// Responses
// ============================================================================

#[derive(Debug, Serialize)]
pub struct PredictResponse {
    #[serde(flatten)]
    pub classification: Classification,
    pub file_url: String,
}

#[derive(Debug, Serialize)]
pub struct LabelsResponse {
    pub message: String,
    pub labels: Vec<String>,
}

// ============================================================================
// Multipart
// ============================================================================

struct Upload {
    file_name: Option<String>,
    content_type: Option<String>,
    bytes: Vec<u8>,
}

/// Returns the first part named `field`; other parts are skipped.
async fn read_upload(
    multipart: &mut Multipart,
    field: &'static str,
) -> Result<Upload, ServiceError> {
    while let Some(part) = multipart.next_field().await? {
        if part.name() != Some(field) {
            continue;
        }
        let file_name = part.file_name().map(str::to_string);
        let content_type = part.content_type().map(str::to_string);
        let bytes = part.bytes().await?.to_vec();
        return Ok(Upload {
            file_name,
            content_type,
            bytes,
        });
    }
    Err(ServiceError::MissingUpload(field))
}

// ============================================================================
// Handlers
// ============================================================================

async fn testing_route() -> Json<Value> {
    Json(json!({ "message": "Testing and working" }))
}

async fn predict_handler(
    State(state): State<Arc<AppState>>,
    mut multipart: Multipart,
) -> Result<Json<PredictResponse>, ServiceError> {
    let upload = read_upload(&mut multipart, "file").await?;
    let name = unique_upload_name(upload.file_name.as_deref());
    let temp_path = state.config.upload_dir.join(&name);

    let result = predict(&state, &name, &temp_path, upload).await;

    if let Err(e) = tokio::fs::remove_file(&temp_path).await {
        if e.kind() != std::io::ErrorKind::NotFound {
            tracing::warn!("Could not remove {}: {}", temp_path.display(), e);
        }
    }
    result.map(Json)
}

/// Classifies the upload, stores it remotely and records the prediction.
async fn predict(
    state: &AppState,
    name: &str,
    temp_path: &Path,
    upload: Upload,
) -> Result<PredictResponse, ServiceError> {
    tokio::fs::create_dir_all(&state.config.upload_dir).await?;
    tokio::fs::write(temp_path, &upload.bytes).await?;

    let started = Instant::now();
    let classifier = state.classifier.clone();
    let path: PathBuf = temp_path.to_path_buf();
    let classification = tokio::task::spawn_blocking(move || {
        let image = preprocess(ImageSource::Path(&path))?;
        classifier.classify(&image)
    })
    .await??;
    let response_time = started.elapsed().as_millis() as u64;

    let object_path = format!("uploads/{}", name);
    let content_type = upload
        .content_type
        .as_deref()
        .unwrap_or("application/octet-stream");
    state
        .storage
        .upload(&object_path, upload.bytes, content_type)
        .await
        .map_err(ServiceError::RemoteWriteFailure)?;
    let file_url = state.storage.public_url(&object_path);

    let record = PredictionRecord {
        image_path: file_url.clone(),
        predicted_class: classification.label,
        confidence_score: classification.confidence,
        response_time,
    };
    state
        .tables
        .insert(PREDICTIONS_TABLE, serde_json::to_value(&record)?)
        .await
        .map_err(ServiceError::RemoteWriteFailure)?;

    tracing::info!(
        "Predicted {} ({:.3}) for {} in {}ms",
        classification.label,
        classification.confidence,
        name,
        response_time
    );

    Ok(PredictResponse {
        classification,
        file_url,
    })
}

async fn upload_zip_handler(
    State(state): State<Arc<AppState>>,
    mut multipart: Multipart,
) -> Result<Json<LabelsResponse>, ServiceError> {
    let upload = read_upload(&mut multipart, "zip_file").await?;
    let filename = upload.file_name.unwrap_or_default();

    let _guard = state.dataset_lock.lock().await;
    let outcome = ingest_archive(
        state.tables.as_ref(),
        &filename,
        upload.bytes,
        &state.config.retrain_dir,
    )
    .await?;

    Ok(Json(LabelsResponse {
        message: outcome.message(),
        labels: outcome.labels,
    }))
}

async fn retrain_handler(
    State(state): State<Arc<AppState>>,
) -> Result<Json<LabelsResponse>, ServiceError> {
    let settings = RetrainSettings::from_config(&state.config);

    let _guard = state.dataset_lock.lock().await;
    let outcome = retrain(state.tables.as_ref(), &settings).await?;

    tracing::info!("{}", outcome.message());
    Ok(Json(LabelsResponse {
        message: outcome.message(),
        labels: outcome.labels,
    }))
}
