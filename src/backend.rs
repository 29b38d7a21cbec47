//! Hosted backend access: object storage for uploads and REST tables for
//! predictions, metrics and training rows.
//!
//! Handlers only see the `ObjectStore` and `TableStore` traits. `SupabaseClient`
//! implements both against the storage and PostgREST HTTP APIs.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use reqwest::{Client, Response};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::labels::ShoeClass;

pub const PREDICTIONS_TABLE: &str = "Predict";
pub const METRICS_TABLE: &str = "System_Metrics";
pub const TRAINING_TABLE: &str = "Training_Data";

pub type RowId = i64;

#[derive(Error, Debug)]
pub enum BackendError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("API error ({status}): {message}")]
    Api { status: u16, message: String },

    #[error("Invalid response: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("Invalid header value: {0}")]
    Header(#[from] reqwest::header::InvalidHeaderValue),
}

// ============================================================================
// Records
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PredictionRecord {
    pub image_path: String,
    pub predicted_class: ShoeClass,
    pub confidence_score: f64,
    /// Milliseconds.
    pub response_time: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SystemMetricRecord {
    pub timestamp: DateTime<Utc>,
    pub request_count: u64,
    /// Seconds.
    pub avg_response_time: f64,
    pub model_uptime_status: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainingRow {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<RowId>,
    pub image_path: String,
    pub shoe_class: String,
    pub is_processed: bool,
    pub uploaded_at: DateTime<Utc>,
}

/// Equality filter on a single column.
#[derive(Debug, Clone, PartialEq)]
pub struct Filter {
    pub column: String,
    pub value: String,
}

impl Filter {
    pub fn eq(column: impl Into<String>, value: impl ToString) -> Self {
        Self {
            column: column.into(),
            value: value.to_string(),
        }
    }

    pub fn matches(&self, row: &Value) -> bool {
        match row.get(&self.column) {
            Some(Value::String(s)) => *s == self.value,
            Some(other) => other.to_string() == self.value,
            None => false,
        }
    }
}

// ============================================================================
// Traits
// ============================================================================

#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn upload(&self, path: &str, bytes: Vec<u8>, content_type: &str) -> Result<(), BackendError>;

    fn public_url(&self, path: &str) -> String;
}

#[async_trait]
pub trait TableStore: Send + Sync {
    /// Inserts one row, or many when `row` is a JSON array.
    async fn insert(&self, table: &str, row: Value) -> Result<(), BackendError>;

    async fn select(&self, table: &str, filter: &Filter) -> Result<Vec<Value>, BackendError>;

    /// Applies `fields` to every row whose id is in `ids`, as a single write.
    async fn update(&self, table: &str, ids: &[RowId], fields: Value) -> Result<(), BackendError>;
}

// ============================================================================
// Supabase REST client
// ============================================================================

#[derive(Debug, Clone)]
pub struct SupabaseConfig {
    pub url: String,
    pub key: String,
    pub bucket: String,
    pub timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct SupabaseClient {
    http: Client,
    base_url: String,
    bucket: String,
}

impl SupabaseClient {
    pub fn new(config: SupabaseConfig) -> Result<Self, BackendError> {
        let mut headers = HeaderMap::new();
        headers.insert("apikey", HeaderValue::from_str(&config.key)?);
        headers.insert(
            AUTHORIZATION,
            HeaderValue::from_str(&format!("Bearer {}", config.key))?,
        );

        let http = Client::builder()
            .default_headers(headers)
            .timeout(config.timeout)
            .build()?;

        Ok(Self {
            http,
            base_url: config.url.trim_end_matches('/').to_string(),
            bucket: config.bucket,
        })
    }

    fn object_url(&self, path: &str) -> String {
        format!("{}/storage/v1/object/{}/{}", self.base_url, self.bucket, path)
    }

    fn table_url(&self, table: &str) -> String {
        format!("{}/rest/v1/{}", self.base_url, table)
    }
}

async fn check(response: Response) -> Result<Response, BackendError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let message = response.text().await.unwrap_or_default();
    Err(BackendError::Api {
        status: status.as_u16(),
        message,
    })
}

#[async_trait]
impl ObjectStore for SupabaseClient {
    async fn upload(&self, path: &str, bytes: Vec<u8>, content_type: &str) -> Result<(), BackendError> {
        let response = self
            .http
            .post(self.object_url(path))
            .header(CONTENT_TYPE, content_type)
            .header("x-upsert", "false")
            .body(bytes)
            .send()
            .await?;
        check(response).await?;
        Ok(())
    }

    fn public_url(&self, path: &str) -> String {
        format!(
            "{}/storage/v1/object/public/{}/{}",
            self.base_url, self.bucket, path
        )
    }
}

#[async_trait]
impl TableStore for SupabaseClient {
    async fn insert(&self, table: &str, row: Value) -> Result<(), BackendError> {
        let response = self
            .http
            .post(self.table_url(table))
            .header("Prefer", "return=minimal")
            .json(&row)
            .send()
            .await?;
        check(response).await?;
        Ok(())
    }

    async fn select(&self, table: &str, filter: &Filter) -> Result<Vec<Value>, BackendError> {
        let condition = format!("eq.{}", filter.value);
        let response = self
            .http
            .get(self.table_url(table))
            .query(&[("select", "*"), (filter.column.as_str(), condition.as_str())])
            .send()
            .await?;
        let body = check(response).await?.text().await?;
        Ok(serde_json::from_str(&body)?)
    }

    async fn update(&self, table: &str, ids: &[RowId], fields: Value) -> Result<(), BackendError> {
        if ids.is_empty() {
            return Ok(());
        }
        let condition = format!(
            "in.({})",
            ids.iter().map(RowId::to_string).collect::<Vec<_>>().join(",")
        );
        let response = self
            .http
            .patch(self.table_url(table))
            .query(&[("id", condition.as_str())])
            .header("Prefer", "return=minimal")
            .json(&fields)
            .send()
            .await?;
        check(response).await?;
        Ok(())
    }
}
