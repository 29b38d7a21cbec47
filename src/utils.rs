use std::path::Path;

use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, AUTHORIZATION};
use uuid::Uuid;

use crate::error::ServiceError;

async fn download_file(url: &str, token: Option<&str>, path: &Path) -> Result<(), ServiceError> {
    tracing::info!("Downloading {} from {}", path.display(), url);

    let unavailable = |msg: String| ServiceError::ModelUnavailable(msg);

    let mut header_map = HeaderMap::new();
    if let Some(token) = token {
        let auth_value = HeaderValue::from_str(&format!("Bearer {}", token))
            .map_err(|_| unavailable("invalid model download token".into()))?;
        header_map.insert(AUTHORIZATION, auth_value);
    }
    header_map.insert(ACCEPT, HeaderValue::from_static("application/octet-stream"));

    let client = reqwest::Client::new();
    let response = client
        .get(url)
        .headers(header_map)
        .send()
        .await
        .map_err(|e| unavailable(format!("failed to download {}: {}", url, e)))?;

    if !response.status().is_success() {
        return Err(unavailable(format!(
            "failed to download {}: {}",
            url,
            response.status()
        )));
    }

    let bytes = response
        .bytes()
        .await
        .map_err(|e| unavailable(format!("failed to read {}: {}", url, e)))?;

    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent).await?;
    }
    tokio::fs::write(path, bytes).await?;
    Ok(())
}

/// Fetches the model artifact from `model_url` when it is not on disk yet.
pub async fn ensure_model_artifact(
    model_path: &Path,
    model_url: Option<&str>,
    token: Option<&str>,
) -> Result<(), ServiceError> {
    tracing::info!("Checking model...");
    if model_path.exists() {
        return Ok(());
    }
    match model_url {
        Some(url) => download_file(url, token, model_path).await,
        None => Err(ServiceError::ModelUnavailable(format!(
            "no model artifact at {} and no model_url configured",
            model_path.display()
        ))),
    }
}

/// `<uuid>_<name>`, keeping only the final path component of the client name.
pub fn unique_upload_name(original: Option<&str>) -> String {
    let name = original
        .and_then(|n| Path::new(n).file_name())
        .and_then(|n| n.to_str())
        .filter(|n| !n.is_empty())
        .unwrap_or("upload");
    format!("{}_{}", Uuid::new_v4(), name)
}
